use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use warpweft_rust::db::{fetch_search_connection_tokens, get_pool};

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

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
  let q = query?;
  for pair in q.split('&') {
    let mut it = pair.splitn(2, '=');
    let k = it.next().unwrap_or("");
    let v = it.next().unwrap_or("");
    if k == key {
      return Some(v.replace('+', " "));
    }
  }
  None
}

async fn handle_status(method: &Method, headers: &HeaderMap, uri: &hyper::Uri) -> Result<Response<ResponseBody>, Error> {
  if method != Method::GET {
    return json_response(
      StatusCode::METHOD_NOT_ALLOWED,
      serde_json::json!({"ok": false, "error": "method_not_allowed"}),
    );
  }

  let expected = std::env::var("RUST_INTERNAL_TOKEN").unwrap_or_default();
  let provided = bearer_token(headers.get("authorization").and_then(|v| v.to_str().ok())).unwrap_or("");

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

  let user_id = query_param(uri.query(), "user_id").unwrap_or_default();
  if user_id.is_empty() {
    return json_response(
      StatusCode::BAD_REQUEST,
      serde_json::json!({"ok": false, "error": "bad_request", "message": "user_id is required"}),
    );
  }

  let pool = get_pool().await?;
  let tokens = fetch_search_connection_tokens(pool, &user_id)
    .await
    .map_err(|e| -> Error { Box::new(e) })?;

  // Connected means "a credential is on file", not "the token is currently
  // fresh" - an expired access token refreshes on the next data request.
  let connected = tokens.is_some();
  let expires_at = tokens.and_then(|t| t.expires_at).map(|t| t.to_rfc3339());

  json_response(
    StatusCode::OK,
    serde_json::json!({"ok": true, "connected": connected, "expires_at": expires_at}),
  )
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let uri = req.uri().clone();
  let _bytes = req.into_body().collect().await?.to_bytes();
  handle_status(&method, &headers, &uri).await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  run(service_fn(handler)).await
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn returns_unauthorized_when_missing_internal_token() {
    std::env::set_var("RUST_INTERNAL_TOKEN", "secret");

    let headers = HeaderMap::new();
    let uri: hyper::Uri = "/api/oauth/google/status?user_id=u1".parse().unwrap();
    let response = handle_status(&Method::GET, &headers, &uri).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
  }

  #[tokio::test]
  async fn requires_user_id() {
    std::env::set_var("RUST_INTERNAL_TOKEN", "secret");
    std::env::set_var("DATABASE_URL", "mysql://localhost/warpweft");

    let mut headers = HeaderMap::new();
    headers.insert("authorization", "Bearer secret".parse().unwrap());

    let uri: hyper::Uri = "/api/oauth/google/status".parse().unwrap();
    let response = handle_status(&Method::GET, &headers, &uri).await.unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
  }
}
