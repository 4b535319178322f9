use chrono::{Duration, NaiveDate, Utc};
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use warpweft_rust::db::get_pool;
use warpweft_rust::opportunity_scorer::{score_opportunities, Opportunity, ScorerConfig};
use warpweft_rust::providers::google::google_oauth_client_from_env;
use warpweft_rust::providers::search_console::{query_search_analytics, SearchAnalyticsQuery};
use warpweft_rust::token_store::{get_valid_access_token, token_store_error_to_vercel_error, TokenStoreError};

const DEFAULT_WINDOW_DAYS: i64 = 28;

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

fn percent_decode(value: &str) -> String {
  let bytes = value.as_bytes();
  let mut out = Vec::with_capacity(bytes.len());
  let mut i = 0;
  while i < bytes.len() {
    if bytes[i] == b'%' && i + 2 < bytes.len() {
      let hex = &value[i + 1..i + 3];
      if let Ok(b) = u8::from_str_radix(hex, 16) {
        out.push(b);
        i += 3;
        continue;
      }
    }
    out.push(bytes[i]);
    i += 1;
  }
  String::from_utf8_lossy(&out).to_string()
}

fn parse_dt(input: &str) -> Option<NaiveDate> {
  NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d").ok()
}

// Default reporting window: the last 28 completed days, ending yesterday.
fn resolve_window(start: Option<NaiveDate>, end: Option<NaiveDate>) -> (NaiveDate, NaiveDate) {
  let end = end.unwrap_or_else(|| Utc::now().date_naive() - Duration::days(1));
  let start = start.unwrap_or(end - Duration::days(DEFAULT_WINDOW_DAYS - 1));
  (start, end)
}

fn opportunity_json(opp: &Opportunity) -> serde_json::Value {
  serde_json::json!({
    "query": opp.query,
    "category": opp.category.as_str(),
    "impressions": opp.impressions,
    "clicks": opp.clicks,
    "ctr": opp.ctr,
    "position": opp.position,
    "score": opp.score,
    "estimatedPotential": opp.estimated_potential,
  })
}

fn not_connected_response() -> Result<Response<ResponseBody>, Error> {
  json_response(
    StatusCode::CONFLICT,
    serde_json::json!({
      "ok": false,
      "error": "not_connected",
      "message": "Connect Google Search Console to load search data",
    }),
  )
}

async fn handle_opportunities(
  method: &Method,
  headers: &HeaderMap,
  uri: &hyper::Uri,
) -> Result<Response<ResponseBody>, Error> {
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
  let site_url = query_param(uri.query(), "site_url")
    .map(|v| percent_decode(&v))
    .unwrap_or_default();
  if user_id.is_empty() || site_url.is_empty() {
    return json_response(
      StatusCode::BAD_REQUEST,
      serde_json::json!({"ok": false, "error": "bad_request", "message": "user_id and site_url are required"}),
    );
  }

  let start_arg = query_param(uri.query(), "start_date").and_then(|v| parse_dt(&v));
  let end_arg = query_param(uri.query(), "end_date").and_then(|v| parse_dt(&v));
  let (start_date, end_date) = resolve_window(start_arg, end_arg);

  if start_date > end_date {
    return json_response(
      StatusCode::BAD_REQUEST,
      serde_json::json!({"ok": false, "error": "bad_request", "message": "start_date must be <= end_date"}),
    );
  }

  let pool = get_pool().await?;
  let (oauth_client, _redirect) = google_oauth_client_from_env()?;

  let access_token = match get_valid_access_token(pool, &oauth_client, &user_id).await {
    Ok(token) => token,
    Err(TokenStoreError::NotConnected) | Err(TokenStoreError::RefreshFailed(_)) => {
      return not_connected_response();
    }
    Err(err) => return Err(token_store_error_to_vercel_error(err)),
  };

  let query = SearchAnalyticsQuery::for_range(start_date, end_date);
  let rows = match query_search_analytics(&access_token, &site_url, &query).await {
    Ok(rows) => rows,
    Err(err) if err.is_not_connected() => return not_connected_response(),
    Err(err) => {
      return json_response(
        StatusCode::BAD_GATEWAY,
        serde_json::json!({"ok": false, "error": "provider_error", "message": err.to_string()}),
      );
    }
  };

  let cfg = ScorerConfig::from_env();
  let opportunities = score_opportunities(&rows, &cfg);
  let items: Vec<serde_json::Value> = opportunities.iter().map(opportunity_json).collect();

  json_response(
    StatusCode::OK,
    serde_json::json!({
      "ok": true,
      "startDate": start_date.to_string(),
      "endDate": end_date.to_string(),
      "count": items.len(),
      "opportunities": items,
    }),
  )
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let uri = req.uri().clone();
  let _bytes = req.into_body().collect().await?.to_bytes();
  handle_opportunities(&method, &headers, &uri).await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  run(service_fn(handler)).await
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn resolve_window_defaults_to_28_completed_days() {
    let start = NaiveDate::from_ymd_opt(2026, 2, 1).unwrap();
    let end = NaiveDate::from_ymd_opt(2026, 2, 28).unwrap();
    assert_eq!(resolve_window(Some(start), Some(end)), (start, end));

    let (d_start, d_end) = resolve_window(None, Some(end));
    assert_eq!((d_end - d_start).num_days() + 1, DEFAULT_WINDOW_DAYS);
    assert_eq!(d_end, end);
  }

  #[test]
  fn percent_decode_restores_site_urls() {
    assert_eq!(
      percent_decode("https%3A%2F%2Fwarpweft.example%2F"),
      "https://warpweft.example/"
    );
    assert_eq!(percent_decode("sc-domain%3Awarpweft.example"), "sc-domain:warpweft.example");
    assert_eq!(percent_decode("plain-text"), "plain-text");
  }

  #[tokio::test]
  async fn returns_unauthorized_when_missing_internal_token() {
    std::env::set_var("RUST_INTERNAL_TOKEN", "secret");

    let headers = HeaderMap::new();
    let uri: hyper::Uri = "/api/search/opportunities?user_id=u1&site_url=x".parse().unwrap();
    let response = handle_opportunities(&Method::GET, &headers, &uri).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
  }
}
