use http_body_util::BodyExt;
use hyper::StatusCode;
use serde::Deserialize;
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use warpweft_rust::db::get_pool;
use warpweft_rust::providers::google::{exchange_code_for_tokens, google_oauth_client_from_env};
use warpweft_rust::token_store::{store_tokens, token_store_error_to_vercel_error, TokenStoreError};

fn bearer_token(header_value: Option<&str>) -> Option<&str> {
  let value = header_value?;
  value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))
}

fn json_response(status: StatusCode, value: serde_json::Value) -> Result<Response<ResponseBody>, Error> {
  Ok(
    Response::builder()
      .status(status)
      .header("content-type", "application/json; charset=utf-8")
      .body(ResponseBody::from(value))?,
  )
}

fn has_database_url() -> bool {
  std::env::var("TIDB_DATABASE_URL")
    .or_else(|_| std::env::var("DATABASE_URL"))
    .map(|v| !v.is_empty())
    .unwrap_or(false)
}

#[derive(Deserialize)]
struct ExchangeRequest {
  user_id: String,
  code: String,
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  if req.method() != "POST" {
    return json_response(
      StatusCode::METHOD_NOT_ALLOWED,
      serde_json::json!({"ok": false, "error": "method_not_allowed"}),
    );
  }

  let expected = std::env::var("RUST_INTERNAL_TOKEN").unwrap_or_default();
  let provided = bearer_token(
    req
      .headers()
      .get("authorization")
      .and_then(|v| v.to_str().ok()),
  )
  .unwrap_or("");

  if expected.is_empty() || provided != expected {
    return json_response(
      StatusCode::UNAUTHORIZED,
      serde_json::json!({"ok": false, "error": "unauthorized"}),
    );
  }

  if !has_database_url() {
    return json_response(
      StatusCode::NOT_IMPLEMENTED,
      serde_json::json!({"ok": false, "error": "not_configured", "message": "Missing TIDB_DATABASE_URL (or DATABASE_URL)"}),
    );
  }

  let bytes = req.into_body().collect().await?.to_bytes();
  let parsed: ExchangeRequest = serde_json::from_slice(&bytes).map_err(|e| -> Error {
    Box::new(std::io::Error::other(format!("invalid json body: {e}")))
  })?;

  if parsed.user_id.is_empty() || parsed.code.is_empty() {
    return json_response(
      StatusCode::BAD_REQUEST,
      serde_json::json!({"ok": false, "error": "bad_request", "message": "user_id and code are required"}),
    );
  }

  let (client, _redirect) = google_oauth_client_from_env()?;
  let tokens = exchange_code_for_tokens(&client, &parsed.code).await?;

  let pool = get_pool().await?;
  match store_tokens(pool, &parsed.user_id, &tokens).await {
    Ok(()) => {}
    Err(TokenStoreError::MissingRefreshToken) => {
      // Google omits refresh_token when the consent screen was skipped; the
      // frontend restarts the flow with prompt=consent.
      return json_response(
        StatusCode::BAD_REQUEST,
        serde_json::json!({
          "ok": false,
          "error": "missing_refresh_token",
          "message": "Google did not return a refresh token; re-run the connect flow with consent",
        }),
      );
    }
    Err(err) => return Err(token_store_error_to_vercel_error(err)),
  }

  json_response(
    StatusCode::OK,
    serde_json::json!({"ok": true, "connected": true, "scope": tokens.scope}),
  )
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  run(service_fn(handler)).await
}
