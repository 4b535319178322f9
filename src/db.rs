use chrono::{DateTime, Utc};
use sqlx::{mysql::MySqlPoolOptions, MySqlPool};
use tokio::sync::OnceCell;
use vercel_runtime::Error;

use crate::providers::google::GoogleOAuthTokens;

static POOL: OnceCell<MySqlPool> = OnceCell::const_new();

async fn ensure_schema(pool: &MySqlPool) -> Result<(), Error> {
  // Keep schema creation idempotent; avoids footguns in early MVP.
  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS search_connections (
        id BIGINT PRIMARY KEY AUTO_INCREMENT,
        user_id VARCHAR(128) NOT NULL,
        oauth_provider VARCHAR(32) NOT NULL,
        access_token TEXT NOT NULL,
        refresh_token TEXT NULL,
        token_type VARCHAR(32) NOT NULL,
        scope TEXT NULL,
        expires_at TIMESTAMP(3) NULL,
        created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
        updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
        UNIQUE KEY uq_search_connections_provider (user_id, oauth_provider),
        KEY idx_search_connections_updated (user_id, updated_at)
      );
    "#,
  )
  .execute(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  // One live entry per user; the row carries the TTL so a cached empty
  // generation is still a hit within the window.
  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS search_recommendation_sets (
        user_id VARCHAR(128) PRIMARY KEY,
        created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
        expires_at TIMESTAMP(3) NOT NULL
      );
    "#,
  )
  .execute(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS search_recommendations (
        id VARCHAR(64) PRIMARY KEY,
        user_id VARCHAR(128) NOT NULL,
        rec_type VARCHAR(16) NOT NULL,
        title VARCHAR(512) NOT NULL,
        target_keyword VARCHAR(255) NOT NULL,
        suggested_title VARCHAR(512) NULL,
        explanation TEXT NOT NULL,
        estimated_opportunity BIGINT NOT NULL DEFAULT 0,
        confidence VARCHAR(8) NOT NULL,
        priority VARCHAR(8) NOT NULL,
        related_queries_json TEXT NOT NULL,
        existing_post_id VARCHAR(64) NULL,
        created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
        expires_at TIMESTAMP(3) NOT NULL,
        KEY idx_search_recommendations_live (user_id, expires_at)
      );
    "#,
  )
  .execute(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  // Owned by the content CRUD app; created here too so a fresh environment
  // serves empty gap-detection reads instead of failing.
  sqlx::query(
    r#"
      CREATE TABLE IF NOT EXISTS blog_posts (
        id VARCHAR(64) PRIMARY KEY,
        user_id VARCHAR(128) NOT NULL,
        title VARCHAR(512) NOT NULL,
        slug VARCHAR(255) NOT NULL,
        created_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3),
        updated_at TIMESTAMP(3) NOT NULL DEFAULT CURRENT_TIMESTAMP(3) ON UPDATE CURRENT_TIMESTAMP(3),
        UNIQUE KEY uq_blog_posts_slug (user_id, slug)
      );
    "#,
  )
  .execute(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  Ok(())
}

pub async fn get_pool() -> Result<&'static MySqlPool, Error> {
  POOL
    .get_or_try_init(|| async {
      let url = std::env::var("TIDB_DATABASE_URL")
        .or_else(|_| std::env::var("DATABASE_URL"))
        .map_err(|_| -> Error {
          Box::new(std::io::Error::other(
            "Missing TIDB_DATABASE_URL (or DATABASE_URL)",
          ))
        })?;

      let pool = MySqlPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .map_err(|e| -> Error { Box::new(e) })?;

      ensure_schema(&pool).await?;
      Ok::<_, Error>(pool)
    })
    .await
}

#[derive(Debug, Clone)]
pub struct SearchConnectionTokens {
  pub access_token: String,
  pub refresh_token: Option<String>,
  pub expires_at: Option<DateTime<Utc>>,
}

pub async fn fetch_search_connection_tokens(
  pool: &MySqlPool,
  user_id: &str,
) -> Result<Option<SearchConnectionTokens>, sqlx::Error> {
  let row = sqlx::query_as::<_, (String, Option<String>, Option<DateTime<Utc>>)>(
    r#"
      SELECT access_token, refresh_token, expires_at
      FROM search_connections
      WHERE user_id = ? AND oauth_provider = 'google'
      LIMIT 1;
    "#,
  )
  .bind(user_id)
  .fetch_optional(pool)
  .await?;

  Ok(row.map(|(access_token, refresh_token, expires_at)| SearchConnectionTokens {
    access_token,
    refresh_token,
    expires_at,
  }))
}

pub async fn search_connection_exists(pool: &MySqlPool, user_id: &str) -> Result<bool, sqlx::Error> {
  let row = sqlx::query_as::<_, (i32,)>(
    r#"
      SELECT 1
      FROM search_connections
      WHERE user_id = ? AND oauth_provider = 'google'
      LIMIT 1;
    "#,
  )
  .bind(user_id)
  .fetch_optional(pool)
  .await?;

  Ok(row.is_some())
}

pub async fn upsert_search_connection(
  pool: &MySqlPool,
  user_id: &str,
  tokens: &GoogleOAuthTokens,
) -> Result<(), sqlx::Error> {
  let expires_at = tokens
    .expires_in_seconds
    .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64));

  sqlx::query(
    r#"
      INSERT INTO search_connections
        (user_id, oauth_provider, access_token, refresh_token, token_type, scope, expires_at)
      VALUES
        (?, 'google', ?, ?, ?, ?, ?)
      ON DUPLICATE KEY UPDATE
        access_token = VALUES(access_token),
        refresh_token = COALESCE(VALUES(refresh_token), refresh_token),
        token_type = VALUES(token_type),
        scope = VALUES(scope),
        expires_at = VALUES(expires_at),
        updated_at = CURRENT_TIMESTAMP(3);
    "#,
  )
  .bind(user_id)
  .bind(&tokens.access_token)
  .bind(tokens.refresh_token.as_deref())
  .bind(&tokens.token_type)
  .bind(tokens.scope.as_deref())
  .bind(expires_at)
  .execute(pool)
  .await?;

  Ok(())
}

pub async fn update_search_connection_tokens(
  pool: &MySqlPool,
  user_id: &str,
  tokens: &GoogleOAuthTokens,
) -> Result<(), sqlx::Error> {
  let expires_at = tokens
    .expires_in_seconds
    .map(|secs| Utc::now() + chrono::Duration::seconds(secs as i64));

  sqlx::query(
    r#"
      UPDATE search_connections
      SET access_token = ?,
          refresh_token = COALESCE(?, refresh_token),
          expires_at = ?,
          updated_at = CURRENT_TIMESTAMP(3)
      WHERE user_id = ?
        AND oauth_provider = 'google';
    "#,
  )
  .bind(&tokens.access_token)
  .bind(tokens.refresh_token.as_deref())
  .bind(expires_at)
  .bind(user_id)
  .execute(pool)
  .await?;

  Ok(())
}

pub async fn delete_search_connection(pool: &MySqlPool, user_id: &str) -> Result<(), sqlx::Error> {
  sqlx::query(
    r#"
      DELETE FROM search_connections
      WHERE user_id = ? AND oauth_provider = 'google';
    "#,
  )
  .bind(user_id)
  .execute(pool)
  .await?;

  Ok(())
}

#[derive(Debug, Clone)]
pub struct BlogPostRef {
  pub id: String,
  pub title: String,
  pub slug: String,
}

pub async fn fetch_blog_post_titles(pool: &MySqlPool, user_id: &str) -> Result<Vec<String>, Error> {
  let rows = sqlx::query_as::<_, (String,)>(
    r#"
      SELECT title
      FROM blog_posts
      WHERE user_id = ?
      ORDER BY updated_at DESC
      LIMIT 200;
    "#,
  )
  .bind(user_id)
  .fetch_all(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  Ok(rows.into_iter().map(|(title,)| title).collect())
}

pub async fn fetch_blog_posts(pool: &MySqlPool, user_id: &str) -> Result<Vec<BlogPostRef>, Error> {
  let rows = sqlx::query_as::<_, (String, String, String)>(
    r#"
      SELECT id, title, slug
      FROM blog_posts
      WHERE user_id = ?
      ORDER BY updated_at DESC
      LIMIT 500;
    "#,
  )
  .bind(user_id)
  .fetch_all(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  Ok(
    rows
      .into_iter()
      .map(|(id, title, slug)| BlogPostRef { id, title, slug })
      .collect(),
  )
}
