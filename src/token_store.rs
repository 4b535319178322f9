use chrono::{DateTime, Duration, Utc};
use sqlx::MySqlPool;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use vercel_runtime::Error;

use crate::db::{
  fetch_search_connection_tokens, search_connection_exists, update_search_connection_tokens,
  upsert_search_connection,
};
use crate::providers::google::{refresh_tokens, GoogleOAuthClient, GoogleOAuthTokens};

// A token this close to expiry is refreshed up front so it cannot die mid-request.
pub const EXPIRY_SAFETY_BUFFER_MINUTES: i64 = 5;

#[derive(Debug)]
pub enum TokenStoreError {
  NotConnected,
  MissingRefreshToken,
  RefreshFailed(String),
  Db(sqlx::Error),
}

impl std::fmt::Display for TokenStoreError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      TokenStoreError::NotConnected => write!(f, "no Search Console connection for this user"),
      TokenStoreError::MissingRefreshToken => {
        write!(f, "first-time token grant did not include a refresh token")
      }
      TokenStoreError::RefreshFailed(msg) => write!(f, "token refresh failed: {msg}"),
      TokenStoreError::Db(err) => write!(f, "token store query failed: {err}"),
    }
  }
}

impl std::error::Error for TokenStoreError {}

impl From<sqlx::Error> for TokenStoreError {
  fn from(err: sqlx::Error) -> Self {
    TokenStoreError::Db(err)
  }
}

pub fn token_store_error_to_vercel_error(err: TokenStoreError) -> Error {
  Box::new(err) as Error
}

fn is_expired_with_buffer(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
  match expires_at {
    Some(expires_at) => now >= expires_at - Duration::minutes(EXPIRY_SAFETY_BUFFER_MINUTES),
    // No recorded expiry: refresh proves the credential instead of trusting it.
    None => true,
  }
}

static REFRESH_GUARDS: OnceLock<Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>> = OnceLock::new();

fn refresh_guard_for_user(user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
  let guards = REFRESH_GUARDS.get_or_init(|| Mutex::new(HashMap::new()));
  let mut map = guards.lock().expect("refresh guard map poisoned");
  map
    .entry(user_id.to_string())
    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
    .clone()
}

// Returns an access token good for at least the safety buffer. The refresh, when
// needed, is persisted before the token is handed out, and concurrent requests
// for the same user coalesce into a single refresh call.
pub async fn get_valid_access_token(
  pool: &MySqlPool,
  oauth_client: &GoogleOAuthClient,
  user_id: &str,
) -> Result<String, TokenStoreError> {
  let tokens = fetch_search_connection_tokens(pool, user_id)
    .await?
    .ok_or(TokenStoreError::NotConnected)?;

  if !is_expired_with_buffer(tokens.expires_at, Utc::now()) {
    return Ok(tokens.access_token);
  }

  let guard = refresh_guard_for_user(user_id);
  let _held = guard.lock().await;

  // Re-read under the guard: a racing request may have already refreshed.
  let tokens = fetch_search_connection_tokens(pool, user_id)
    .await?
    .ok_or(TokenStoreError::NotConnected)?;

  if !is_expired_with_buffer(tokens.expires_at, Utc::now()) {
    return Ok(tokens.access_token);
  }

  let refresh = tokens
    .refresh_token
    .as_deref()
    .map(str::trim)
    .filter(|v| !v.is_empty())
    .map(str::to_string)
    .ok_or_else(|| {
      TokenStoreError::RefreshFailed("no refresh token on record; reconnect required".to_string())
    })?;

  let refreshed = refresh_tokens(oauth_client, &refresh)
    .await
    .map_err(|e| TokenStoreError::RefreshFailed(e.to_string()))?;

  update_search_connection_tokens(pool, user_id, &refreshed).await?;

  Ok(refreshed.access_token)
}

// Upsert semantics: update-in-place for an existing connection; a first-time
// insert must carry a refresh token or the connection would be unrecoverable
// after the first expiry.
pub async fn store_tokens(
  pool: &MySqlPool,
  user_id: &str,
  tokens: &GoogleOAuthTokens,
) -> Result<(), TokenStoreError> {
  let exists = search_connection_exists(pool, user_id).await?;

  let has_refresh = tokens
    .refresh_token
    .as_deref()
    .map(str::trim)
    .is_some_and(|v| !v.is_empty());

  if !exists && !has_refresh {
    return Err(TokenStoreError::MissingRefreshToken);
  }

  upsert_search_connection(pool, user_id, tokens).await?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use chrono::TimeZone;

  #[test]
  fn token_four_minutes_from_expiry_is_treated_as_expired() {
    let now = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
    assert!(is_expired_with_buffer(Some(now + Duration::minutes(4)), now));
  }

  #[test]
  fn token_six_minutes_from_expiry_is_still_valid() {
    let now = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
    assert!(!is_expired_with_buffer(Some(now + Duration::minutes(6)), now));
  }

  #[test]
  fn exact_buffer_boundary_counts_as_expired() {
    let now = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
    assert!(is_expired_with_buffer(Some(now + Duration::minutes(5)), now));
  }

  #[test]
  fn missing_expiry_is_treated_as_expired() {
    let now = Utc.with_ymd_and_hms(2026, 3, 2, 12, 0, 0).unwrap();
    assert!(is_expired_with_buffer(None, now));
  }

  #[test]
  fn refresh_guards_coalesce_per_user() {
    let a1 = refresh_guard_for_user("user-a");
    let a2 = refresh_guard_for_user("user-a");
    let b = refresh_guard_for_user("user-b");

    assert!(Arc::ptr_eq(&a1, &a2));
    assert!(!Arc::ptr_eq(&a1, &b));
  }
}
