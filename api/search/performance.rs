use chrono::{Duration, NaiveDate, Utc};
use http_body_util::BodyExt;
use hyper::{HeaderMap, Method, StatusCode};
use std::collections::HashMap;
use vercel_runtime::{run, service_fn, Error, Request, Response, ResponseBody};

use warpweft_rust::db::{fetch_blog_posts, get_pool, BlogPostRef};
use warpweft_rust::period_compare::{
  compare_periods, previous_period, slug_from_page_url, EntityMetrics, PeriodCompareConfig,
};
use warpweft_rust::providers::google::google_oauth_client_from_env;
use warpweft_rust::providers::search_console::{
  query_search_analytics, Dimension, SearchAnalyticsQuery, SearchAnalyticsRow,
};
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

fn resolve_window(start: Option<NaiveDate>, end: Option<NaiveDate>) -> (NaiveDate, NaiveDate) {
  let end = end.unwrap_or_else(|| Utc::now().date_naive() - Duration::days(1));
  let start = start.unwrap_or(end - Duration::days(DEFAULT_WINDOW_DAYS - 1));
  (start, end)
}

// Folds page-dimension rows into per-post metrics. Only pages whose slug maps
// to a known blog post count; product and landing pages stay out of the diff.
fn metrics_by_slug(
  rows: &[SearchAnalyticsRow],
  known_posts: &HashMap<String, BlogPostRef>,
) -> HashMap<String, EntityMetrics> {
  let mut out: HashMap<String, EntityMetrics> = HashMap::new();

  for row in rows {
    let page_url = match row.keys.first() {
      Some(url) => url,
      None => continue,
    };
    let slug = match slug_from_page_url(page_url) {
      Some(slug) => slug,
      None => continue,
    };
    if !known_posts.contains_key(&slug) {
      continue;
    }

    let entry = out.entry(slug).or_default();
    entry.clicks += row.clicks;
    entry.impressions += row.impressions;
  }

  out
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

async fn handle_performance(
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

  let previous = previous_period(start_date, end_date);

  let pool = get_pool().await?;
  let (oauth_client, _redirect) = google_oauth_client_from_env()?;

  let access_token = match get_valid_access_token(pool, &oauth_client, &user_id).await {
    Ok(token) => token,
    Err(TokenStoreError::NotConnected) | Err(TokenStoreError::RefreshFailed(_)) => {
      return not_connected_response();
    }
    Err(err) => return Err(token_store_error_to_vercel_error(err)),
  };

  let mut current_query = SearchAnalyticsQuery::for_range(start_date, end_date);
  current_query.dimensions = vec![Dimension::Page];
  let mut previous_query = SearchAnalyticsQuery::for_range(previous.start, previous.end);
  previous_query.dimensions = vec![Dimension::Page];

  // Both windows fetch concurrently. The current window is required; a failed
  // previous window degrades to "no comparison" instead of failing the page.
  let (current_result, previous_result) = tokio::join!(
    query_search_analytics(&access_token, &site_url, &current_query),
    query_search_analytics(&access_token, &site_url, &previous_query),
  );

  let current_rows = match current_result {
    Ok(rows) => rows,
    Err(err) if err.is_not_connected() => return not_connected_response(),
    Err(err) => {
      return json_response(
        StatusCode::BAD_GATEWAY,
        serde_json::json!({"ok": false, "error": "provider_error", "message": err.to_string()}),
      );
    }
  };

  let previous_rows = match previous_result {
    Ok(rows) => rows,
    Err(err) => {
      eprintln!(
        "performance: previous-period fetch failed user_id={} window={}..{} err={}",
        user_id, previous.start, previous.end, err
      );
      Vec::new()
    }
  };

  let posts = fetch_blog_posts(pool, &user_id).await?;
  let known_posts: HashMap<String, BlogPostRef> =
    posts.into_iter().map(|p| (p.slug.clone(), p)).collect();

  let current_metrics = metrics_by_slug(&current_rows, &known_posts);
  let previous_metrics = metrics_by_slug(&previous_rows, &known_posts);

  let comparisons = compare_periods(&current_metrics, &previous_metrics, &PeriodCompareConfig::default());

  let items: Vec<serde_json::Value> = comparisons
    .iter()
    .map(|c| {
      let post = known_posts.get(&c.entity_id);

      let mut obj = serde_json::Map::new();
      obj.insert("slug".to_string(), serde_json::json!(c.entity_id));
      if let Some(post) = post {
        obj.insert("postId".to_string(), serde_json::json!(post.id));
        obj.insert("title".to_string(), serde_json::json!(post.title));
      }
      obj.insert("clicks".to_string(), serde_json::json!(c.clicks));
      obj.insert("impressions".to_string(), serde_json::json!(c.impressions));
      if let Some(v) = c.previous_clicks {
        obj.insert("previousClicks".to_string(), serde_json::json!(v));
      }
      if let Some(v) = c.previous_impressions {
        obj.insert("previousImpressions".to_string(), serde_json::json!(v));
      }
      if let Some(v) = c.clicks_change {
        obj.insert("clicksChange".to_string(), serde_json::json!(v));
      }
      if let Some(v) = c.impressions_change {
        obj.insert("impressionsChange".to_string(), serde_json::json!(v));
      }
      obj.insert("needsAttention".to_string(), serde_json::json!(c.needs_attention));

      serde_json::Value::Object(obj)
    })
    .collect();

  json_response(
    StatusCode::OK,
    serde_json::json!({
      "ok": true,
      "startDate": start_date.to_string(),
      "endDate": end_date.to_string(),
      "previousStartDate": previous.start.to_string(),
      "previousEndDate": previous.end.to_string(),
      "posts": items,
    }),
  )
}

async fn handler(req: Request) -> Result<Response<ResponseBody>, Error> {
  let method = req.method().clone();
  let headers = req.headers().clone();
  let uri = req.uri().clone();
  let _bytes = req.into_body().collect().await?.to_bytes();
  handle_performance(&method, &headers, &uri).await
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  run(service_fn(handler)).await
}

#[cfg(test)]
mod tests {
  use super::*;

  fn post(id: &str, title: &str, slug: &str) -> BlogPostRef {
    BlogPostRef {
      id: id.to_string(),
      title: title.to_string(),
      slug: slug.to_string(),
    }
  }

  fn page_row(url: &str, clicks: i64, impressions: i64) -> SearchAnalyticsRow {
    SearchAnalyticsRow {
      keys: vec![url.to_string()],
      clicks,
      impressions,
      ctr: 0.0,
      position: 0.0,
    }
  }

  #[test]
  fn metrics_by_slug_keeps_known_posts_only() {
    let mut known = HashMap::new();
    known.insert(
      "indigo-dye-guide".to_string(),
      post("p1", "Indigo Dye Guide", "indigo-dye-guide"),
    );

    let rows = vec![
      page_row("https://warpweft.example/blogs/news/indigo-dye-guide", 12, 300),
      page_row("https://warpweft.example/products/sock-yarn-fog", 40, 900),
      page_row("https://warpweft.example/", 5, 100),
    ];

    let metrics = metrics_by_slug(&rows, &known);
    assert_eq!(metrics.len(), 1);
    assert_eq!(metrics["indigo-dye-guide"].clicks, 12);
    assert_eq!(metrics["indigo-dye-guide"].impressions, 300);
  }

  #[test]
  fn metrics_by_slug_sums_url_variants() {
    let mut known = HashMap::new();
    known.insert(
      "madder-basics".to_string(),
      post("p2", "Madder Basics", "madder-basics"),
    );

    let rows = vec![
      page_row("https://warpweft.example/blogs/news/madder-basics", 3, 50),
      page_row("https://warpweft.example/blogs/news/madder-basics?utm_source=pin", 2, 30),
    ];

    let metrics = metrics_by_slug(&rows, &known);
    assert_eq!(metrics["madder-basics"].clicks, 5);
    assert_eq!(metrics["madder-basics"].impressions, 80);
  }

  #[tokio::test]
  async fn returns_unauthorized_when_missing_internal_token() {
    std::env::set_var("RUST_INTERNAL_TOKEN", "secret");

    let headers = HeaderMap::new();
    let uri: hyper::Uri = "/api/search/performance?user_id=u1&site_url=x".parse().unwrap();
    let response = handle_performance(&Method::GET, &headers, &uri).await.unwrap();

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
  }
}
