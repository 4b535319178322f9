use bytes::Bytes;
use chrono::NaiveDate;
use http_body_util::{BodyExt, Full};
use hyper::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use hyper::{Method, Request, StatusCode};
use serde_json::Value;
use vercel_runtime::Error;

pub const SEARCH_CONSOLE_BASE_URL: &str = "https://www.googleapis.com/";

// Provider ceiling; requests above it are clamped, not rejected.
pub const MAX_ROW_LIMIT: u32 = 1000;

const REQUEST_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
  Query,
  Page,
  Country,
  Device,
  SearchAppearance,
}

impl Dimension {
  pub fn as_str(&self) -> &'static str {
    match self {
      Dimension::Query => "query",
      Dimension::Page => "page",
      Dimension::Country => "country",
      Dimension::Device => "device",
      Dimension::SearchAppearance => "searchAppearance",
    }
  }
}

#[derive(Debug, Clone)]
pub struct SearchAnalyticsQuery {
  pub start_date: NaiveDate,
  pub end_date: NaiveDate,
  pub dimensions: Vec<Dimension>,
  pub row_limit: u32,
  pub start_row: u32,
}

impl SearchAnalyticsQuery {
  pub fn for_range(start_date: NaiveDate, end_date: NaiveDate) -> Self {
    Self {
      start_date,
      end_date,
      dimensions: vec![Dimension::Query],
      row_limit: MAX_ROW_LIMIT,
      start_row: 0,
    }
  }
}

// Row keys are positional: keys[i] belongs to dimensions[i] of the request.
#[derive(Debug, Clone)]
pub struct SearchAnalyticsRow {
  pub keys: Vec<String>,
  pub clicks: i64,
  pub impressions: i64,
  pub ctr: f64,
  pub position: f64,
}

#[derive(Debug)]
pub struct SearchConsoleError {
  pub status: Option<u16>,
  pub message: String,
}

impl SearchConsoleError {
  // 401/403 mean the stored credential no longer grants access; callers render
  // the reconnect affordance instead of a generic provider failure.
  pub fn is_not_connected(&self) -> bool {
    matches!(self.status, Some(401) | Some(403))
  }
}

impl std::fmt::Display for SearchConsoleError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if let Some(status) = self.status {
      write!(f, "Search Console error (status {status}): {}", self.message)
    } else {
      write!(f, "Search Console error: {}", self.message)
    }
  }
}

impl std::error::Error for SearchConsoleError {}

pub fn search_console_error_to_vercel_error(err: SearchConsoleError) -> Error {
  Box::new(err) as Error
}

fn encode_site_url(site_url: &str) -> String {
  let mut out = String::with_capacity(site_url.len() * 3);
  for b in site_url.bytes() {
    match b {
      b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
        out.push(b as char);
      }
      _ => {
        out.push_str(&format!("%{:02X}", b));
      }
    }
  }
  out
}

fn build_query_url(base_url: &str, site_url: &str) -> String {
  let base = base_url.trim_end_matches('/');
  format!(
    "{base}/webmasters/v3/sites/{}/searchAnalytics/query",
    encode_site_url(site_url)
  )
}

fn build_request_json(query: &SearchAnalyticsQuery) -> Value {
  let dimensions: Vec<&str> = if query.dimensions.is_empty() {
    vec![Dimension::Query.as_str()]
  } else {
    query.dimensions.iter().map(|d| d.as_str()).collect()
  };

  serde_json::json!({
    "startDate": query.start_date.format("%Y-%m-%d").to_string(),
    "endDate": query.end_date.format("%Y-%m-%d").to_string(),
    "dimensions": dimensions,
    "rowLimit": query.row_limit.min(MAX_ROW_LIMIT),
    "startRow": query.start_row,
  })
}

fn parse_rows(json: &Value) -> Vec<SearchAnalyticsRow> {
  let rows = json
    .get("rows")
    .and_then(|v| v.as_array())
    .cloned()
    .unwrap_or_default();

  let mut out = Vec::with_capacity(rows.len());

  for row in rows {
    let keys: Vec<String> = row
      .get("keys")
      .and_then(|v| v.as_array())
      .map(|arr| {
        arr
          .iter()
          .filter_map(|v| v.as_str())
          .map(|s| s.to_string())
          .collect()
      })
      .unwrap_or_default();
    if keys.is_empty() {
      continue;
    }

    let clicks = row
      .get("clicks")
      .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|n| n as i64)))
      .unwrap_or(0);

    let impressions = row
      .get("impressions")
      .and_then(|v| v.as_i64().or_else(|| v.as_f64().map(|n| n as i64)))
      .unwrap_or(0);

    let ctr = row
      .get("ctr")
      .and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
      .unwrap_or(0.0);

    let position = row
      .get("position")
      .and_then(|v| v.as_f64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
      .unwrap_or(0.0);

    out.push(SearchAnalyticsRow {
      keys,
      clicks,
      impressions,
      ctr,
      position,
    });
  }

  out
}

pub async fn query_search_analytics_with_base_url(
  access_token: &str,
  base_url: &str,
  site_url: &str,
  query: &SearchAnalyticsQuery,
) -> Result<Vec<SearchAnalyticsRow>, SearchConsoleError> {
  let url = build_query_url(base_url, site_url);
  let payload = build_request_json(query);
  let body = serde_json::to_vec(&payload).map_err(|e| SearchConsoleError {
    status: None,
    message: e.to_string(),
  })?;

  let connector = hyper_rustls::HttpsConnectorBuilder::new()
    .with_native_roots()
    .map_err(|e| SearchConsoleError {
      status: None,
      message: e.to_string(),
    })?
    .https_or_http()
    .enable_http1()
    .build();

  let client = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new()).build(connector);

  let req = Request::builder()
    .method(Method::POST)
    .uri(&url)
    .header(AUTHORIZATION, format!("Bearer {}", access_token))
    .header(CONTENT_TYPE, "application/json")
    .header(ACCEPT, "application/json")
    .body(Full::new(Bytes::from(body)))
    .map_err(|e| SearchConsoleError {
      status: None,
      message: e.to_string(),
    })?;

  let resp = tokio::time::timeout(
    std::time::Duration::from_secs(REQUEST_TIMEOUT_SECS),
    client.request(req),
  )
  .await
  .map_err(|_| SearchConsoleError {
    status: None,
    message: format!("request timed out after {REQUEST_TIMEOUT_SECS}s (url: {url})"),
  })?
  .map_err(|e| SearchConsoleError {
    status: None,
    message: e.to_string(),
  })?;

  let status = resp.status();
  let body_bytes = resp
    .into_body()
    .collect()
    .await
    .map_err(|e| SearchConsoleError {
      status: Some(status.as_u16()),
      message: e.to_string(),
    })?
    .to_bytes();

  if status != StatusCode::OK {
    let msg = String::from_utf8_lossy(&body_bytes).to_string();
    return Err(SearchConsoleError {
      status: Some(status.as_u16()),
      message: format!("{msg} (url: {url})"),
    });
  }

  let json = serde_json::from_slice::<Value>(&body_bytes).map_err(|e| SearchConsoleError {
    status: Some(status.as_u16()),
    message: format!("invalid json response: {e}"),
  })?;

  Ok(parse_rows(&json))
}

pub async fn query_search_analytics(
  access_token: &str,
  site_url: &str,
  query: &SearchAnalyticsQuery,
) -> Result<Vec<SearchAnalyticsRow>, SearchConsoleError> {
  query_search_analytics_with_base_url(access_token, SEARCH_CONSOLE_BASE_URL, site_url, query).await
}

#[cfg(test)]
mod tests {
  use super::*;
  use hyper::body::Incoming;
  use hyper::server::conn::http1;
  use hyper::service::service_fn;
  use hyper::{Request, Response, StatusCode};
  use hyper_util::rt::TokioIo;
  use tokio::net::TcpListener;

  #[test]
  fn build_query_url_percent_encodes_the_site() {
    let url = build_query_url("https://www.googleapis.com/", "https://warpweft.example/");
    assert_eq!(
      url,
      "https://www.googleapis.com/webmasters/v3/sites/https%3A%2F%2Fwarpweft.example%2F/searchAnalytics/query"
    );

    let domain = build_query_url("https://www.googleapis.com", "sc-domain:warpweft.example");
    assert!(domain.contains("sc-domain%3Awarpweft.example"));
  }

  #[test]
  fn build_request_json_defaults_and_caps() {
    let start = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
    let end = NaiveDate::from_ymd_opt(2026, 1, 28).unwrap();

    let mut query = SearchAnalyticsQuery::for_range(start, end);
    query.dimensions = vec![];
    query.row_limit = 25_000;

    let json = build_request_json(&query);
    assert_eq!(json["startDate"], "2026-01-01");
    assert_eq!(json["endDate"], "2026-01-28");
    assert_eq!(json["dimensions"][0], "query");
    assert_eq!(json["rowLimit"], 1000);
    assert_eq!(json["startRow"], 0);
  }

  #[test]
  fn build_request_json_keeps_dimension_order() {
    let start = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
    let end = NaiveDate::from_ymd_opt(2026, 1, 7).unwrap();

    let mut query = SearchAnalyticsQuery::for_range(start, end);
    query.dimensions = vec![Dimension::Query, Dimension::Page];

    let json = build_request_json(&query);
    assert_eq!(json["dimensions"][0], "query");
    assert_eq!(json["dimensions"][1], "page");
  }

  #[test]
  fn parse_rows_extracts_metrics_and_keys() {
    let json: Value = serde_json::from_str(
      r#"
      {
        "rows": [
          {"keys":["how to dye wool"],"clicks":12,"impressions":340,"ctr":0.0353,"position":7.2},
          {"keys":["indigo yarn","https://warpweft.example/blogs/news/indigo"],"clicks":0,"impressions":55,"ctr":0.0,"position":18.4}
        ]
      }
    "#,
    )
    .unwrap();

    let rows = parse_rows(&json);
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].keys, vec!["how to dye wool".to_string()]);
    assert_eq!(rows[0].clicks, 12);
    assert_eq!(rows[0].impressions, 340);
    assert!((rows[0].ctr - 0.0353).abs() < 1e-9);
    assert!((rows[0].position - 7.2).abs() < 1e-9);
    assert_eq!(rows[1].keys.len(), 2);
  }

  #[test]
  fn parse_rows_skips_rows_without_keys() {
    let json: Value =
      serde_json::from_str(r#"{"rows":[{"clicks":5,"impressions":10,"ctr":0.5,"position":1.0}]}"#).unwrap();
    assert!(parse_rows(&json).is_empty());
  }

  #[test]
  fn parse_rows_handles_missing_rows_field() {
    let json: Value = serde_json::from_str(r#"{"responseAggregationType":"byProperty"}"#).unwrap();
    assert!(parse_rows(&json).is_empty());
  }

  #[test]
  fn not_connected_maps_auth_statuses_only() {
    let unauthorized = SearchConsoleError {
      status: Some(401),
      message: "invalid credentials".to_string(),
    };
    let forbidden = SearchConsoleError {
      status: Some(403),
      message: "user does not have access".to_string(),
    };
    let server = SearchConsoleError {
      status: Some(500),
      message: "backend error".to_string(),
    };

    assert!(unauthorized.is_not_connected());
    assert!(forbidden.is_not_connected());
    assert!(!server.is_not_connected());
  }

  async fn serve_query(listener: TcpListener, status: StatusCode, body: &'static str) {
    let (stream, _) = listener.accept().await.unwrap();
    let io = TokioIo::new(stream);
    http1::Builder::new()
      .serve_connection(
        io,
        service_fn(move |_req: Request<Incoming>| async move {
          Ok::<_, hyper::Error>(
            Response::builder()
              .status(status)
              .header("content-type", "application/json")
              .body(Full::new(Bytes::from(body)))
              .unwrap(),
          )
        }),
      )
      .await
      .ok();
  }

  #[tokio::test]
  async fn query_search_analytics_parses_provider_rows() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve_query(
      listener,
      StatusCode::OK,
      r#"{"rows":[{"keys":["sock yarn"],"clicks":10,"impressions":500,"ctr":0.02,"position":8.0}]}"#,
    ));

    let base_url = format!("http://{}/", addr);
    let start = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
    let end = NaiveDate::from_ymd_opt(2026, 1, 28).unwrap();
    let query = SearchAnalyticsQuery::for_range(start, end);

    let rows = query_search_analytics_with_base_url("token", &base_url, "sc-domain:warpweft.example", &query)
      .await
      .unwrap();

    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].keys, vec!["sock yarn".to_string()]);
    assert_eq!(rows[0].impressions, 500);
    server.await.unwrap();
  }

  #[tokio::test]
  async fn query_search_analytics_surfaces_auth_failure_as_not_connected() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn(serve_query(
      listener,
      StatusCode::UNAUTHORIZED,
      r#"{"error":{"code":401,"message":"Request had invalid authentication credentials."}}"#,
    ));

    let base_url = format!("http://{}/", addr);
    let start = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap();
    let end = NaiveDate::from_ymd_opt(2026, 1, 28).unwrap();
    let query = SearchAnalyticsQuery::for_range(start, end);

    let err = query_search_analytics_with_base_url("stale", &base_url, "sc-domain:warpweft.example", &query)
      .await
      .unwrap_err();

    assert_eq!(err.status, Some(401));
    assert!(err.is_not_connected());
    assert!(err.message.contains("invalid authentication"));
    server.await.unwrap();
  }
}
