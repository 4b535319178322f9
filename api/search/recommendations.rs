use chrono::{Duration, NaiveDate, Utc};
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use warpweft_rust::db::{fetch_blog_post_titles, get_pool};
use warpweft_rust::opportunity_scorer::{score_opportunities, ScorerConfig};
use warpweft_rust::providers::gemini::GeminiConfig;
use warpweft_rust::providers::google::google_oauth_client_from_env;
use warpweft_rust::providers::search_console::{query_search_analytics, SearchAnalyticsQuery};
use warpweft_rust::recommendation_cache;
use warpweft_rust::recommendation_engine::{generate_recommendations, Recommendation};
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

fn parse_refresh_flag(value: Option<String>) -> bool {
  matches!(value.as_deref(), Some("true") | Some("1"))
}

fn recommendation_json(rec: &Recommendation) -> serde_json::Value {
  let mut obj = serde_json::Map::new();
  obj.insert("id".to_string(), serde_json::json!(rec.id));
  obj.insert("type".to_string(), serde_json::json!(rec.rec_type.as_str()));
  obj.insert("title".to_string(), serde_json::json!(rec.title));
  obj.insert("targetKeyword".to_string(), serde_json::json!(rec.target_keyword));
  if let Some(v) = rec.suggested_title.as_deref() {
    obj.insert("suggestedTitle".to_string(), serde_json::json!(v));
  }
  obj.insert("explanation".to_string(), serde_json::json!(rec.explanation));
  obj.insert(
    "estimatedOpportunity".to_string(),
    serde_json::json!(rec.estimated_opportunity),
  );
  obj.insert("confidence".to_string(), serde_json::json!(rec.confidence.as_str()));
  obj.insert("priority".to_string(), serde_json::json!(rec.priority.as_str()));
  obj.insert("relatedQueries".to_string(), serde_json::json!(rec.related_queries));
  if let Some(v) = rec.existing_post_id.as_deref() {
    obj.insert("existingPostId".to_string(), serde_json::json!(v));
  }
  serde_json::Value::Object(obj)
}

fn not_connected_response() -> Result<Response<ResponseBody>, Error> {
  json_response(
    StatusCode::CONFLICT,
    serde_json::json!({
      "ok": false,
      "error": "not_connected",
      "message": "Connect Google Search Console to generate recommendations",
    }),
  )
}

async fn handle_recommendations(
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

  let force_refresh = parse_refresh_flag(query_param(uri.query(), "refresh"));

  let pool = get_pool().await?;
  let now = Utc::now();

  // Force-refresh bypasses the cache read entirely.
  if !force_refresh {
    if let Some(cached) = recommendation_cache::get(pool, &user_id, now).await? {
      let items: Vec<serde_json::Value> = cached.iter().map(recommendation_json).collect();
      return json_response(
        StatusCode::OK,
        serde_json::json!({"ok": true, "cached": true, "recommendations": items}),
      );
    }
  }

  let (oauth_client, _redirect) = google_oauth_client_from_env()?;
  let access_token = match get_valid_access_token(pool, &oauth_client, &user_id).await {
    Ok(token) => token,
    Err(TokenStoreError::NotConnected) | Err(TokenStoreError::RefreshFailed(_)) => {
      return not_connected_response();
    }
    Err(err) => return Err(token_store_error_to_vercel_error(err)),
  };

  let end_date: NaiveDate = Utc::now().date_naive() - Duration::days(1);
  let start_date = end_date - Duration::days(DEFAULT_WINDOW_DAYS - 1);
  let query = SearchAnalyticsQuery::for_range(start_date, end_date);

  // The analytics rows are required; the gap-detection titles are not and
  // degrade to an empty list.
  let (rows_result, titles_result) = tokio::join!(
    query_search_analytics(&access_token, &site_url, &query),
    fetch_blog_post_titles(pool, &user_id),
  );

  let rows = match rows_result {
    Ok(rows) => rows,
    Err(err) if err.is_not_connected() => return not_connected_response(),
    Err(err) => {
      return json_response(
        StatusCode::BAD_GATEWAY,
        serde_json::json!({"ok": false, "error": "provider_error", "message": err.to_string()}),
      );
    }
  };

  let existing_titles = match titles_result {
    Ok(titles) => titles,
    Err(err) => {
      eprintln!("recommendations: blog title fetch failed user_id={} err={}", user_id, err);
      Vec::new()
    }
  };

  let cfg = ScorerConfig::from_env();
  let opportunities = score_opportunities(&rows, &cfg);

  let gemini = match GeminiConfig::from_env_optional()? {
    Some(cfg) => cfg,
    None => {
      // Unconfigured is not a generation failure: skip the cache write so the
      // feature comes alive as soon as the key is set.
      eprintln!("recommendations: GEMINI_API_KEY not configured; returning empty set uncached");
      return json_response(
        StatusCode::OK,
        serde_json::json!({"ok": true, "cached": false, "recommendations": []}),
      );
    }
  };

  let recommendations = generate_recommendations(&gemini, &opportunities, &existing_titles).await;

  // The write completes before the response: data the client just received is
  // also what the cache now holds. An empty set is cached too, so a flaky
  // generation cannot be re-triggered on every page load.
  recommendation_cache::put(pool, &user_id, &recommendations, now).await?;

  let items: Vec<serde_json::Value> = recommendations.iter().map(recommendation_json).collect();
  json_response(
    StatusCode::OK,
    serde_json::json!({"ok": true, "cached": false, "recommendations": items}),
  )
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let uri = req.uri().clone();
  let _bytes = req.into_body().collect().await?.to_bytes();
  handle_recommendations(&method, &headers, &uri).await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  run(service_fn(handler)).await
}

#[cfg(test)]
mod tests {
  use super::*;
  use warpweft_rust::recommendation_engine::parse_recommendations;

  #[test]
  fn refresh_flag_accepts_true_and_one() {
    assert!(parse_refresh_flag(Some("true".to_string())));
    assert!(parse_refresh_flag(Some("1".to_string())));
    assert!(!parse_refresh_flag(Some("false".to_string())));
    assert!(!parse_refresh_flag(Some("yes".to_string())));
    assert!(!parse_refresh_flag(None));
  }

  #[test]
  fn recommendation_json_omits_absent_optional_fields() {
    let recs = parse_recommendations(
      r#"[{"type":"new_post","title":"Weld on silk","targetKeyword":"weld dye silk"}]"#,
    );
    assert_eq!(recs.len(), 1);

    let json = recommendation_json(&recs[0]);
    assert_eq!(json.get("type").and_then(|v| v.as_str()), Some("new_post"));
    assert!(json.get("suggestedTitle").is_none());
    assert!(json.get("existingPostId").is_none());
    assert_eq!(json.get("relatedQueries").and_then(|v| v.as_array()).map(|a| a.len()), Some(0));
  }

  #[tokio::test]
  async fn returns_unauthorized_when_missing_internal_token() {
    std::env::set_var("RUST_INTERNAL_TOKEN", "secret");

    let headers = HeaderMap::new();
    let uri: hyper::Uri = "/api/search/recommendations?user_id=u1&site_url=x".parse().unwrap();
    let response = handle_recommendations(&Method::GET, &headers, &uri).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
  }
}
