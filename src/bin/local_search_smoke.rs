use chrono::{Duration, NaiveDate, Utc};
use vercel_runtime::Error;

use warpweft_rust::db::get_pool;
use warpweft_rust::opportunity_scorer::{score_opportunities, ScorerConfig};
use warpweft_rust::providers::google::google_oauth_client_from_env;
use warpweft_rust::providers::search_console::{
  query_search_analytics, search_console_error_to_vercel_error, SearchAnalyticsQuery,
};
use warpweft_rust::token_store::{get_valid_access_token, token_store_error_to_vercel_error, TokenStoreError};

fn validate_database_url() -> Result<(), Error> {
  let url = std::env::var("TIDB_DATABASE_URL")
    .or_else(|_| std::env::var("DATABASE_URL"))
    .unwrap_or_default();
  let trimmed = url.trim();
  if trimmed.is_empty() {
    return Err(Box::new(std::io::Error::other(
      "Missing TIDB_DATABASE_URL (or DATABASE_URL)",
    )) as Error);
  }
  if !trimmed.contains("://") {
    return Err(Box::new(std::io::Error::other(
      "Invalid TIDB_DATABASE_URL/DATABASE_URL (expected URL scheme like mysql://...)",
    )) as Error);
  }
  Ok(())
}

fn parse_flag_value(args: &[String], flag: &str) -> Option<String> {
  args
    .iter()
    .position(|a| a == flag)
    .and_then(|idx| args.get(idx + 1))
    .cloned()
}

fn parse_dt(input: &str) -> Option<NaiveDate> {
  NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d").ok()
}

#[tokio::main]
async fn main() -> Result<(), Error> {
  validate_database_url()?;
  let args: Vec<String> = std::env::args().collect();

  let user_id = parse_flag_value(&args, "--user-id")
    .or_else(|| parse_flag_value(&args, "--user"))
    .unwrap_or_default();
  if user_id.trim().is_empty() {
    eprintln!("Missing required --user-id");
    eprintln!("Example: cargo run --bin local_search_smoke -- --user-id user_123 --site-url sc-domain:warpweft.example --days 28");
    return Ok(());
  }

  let site_url = parse_flag_value(&args, "--site-url")
    .or_else(|| parse_flag_value(&args, "--site"))
    .unwrap_or_default();
  if site_url.trim().is_empty() {
    eprintln!("Missing required --site-url");
    return Ok(());
  }

  let days = parse_flag_value(&args, "--days")
    .and_then(|v| v.parse::<i64>().ok())
    .unwrap_or(28)
    .clamp(1, 365);
  let end_arg = parse_flag_value(&args, "--end-dt").and_then(|v| parse_dt(&v));

  let end_dt = end_arg.unwrap_or_else(|| Utc::now().date_naive() - Duration::days(1));
  let start_dt = end_dt - Duration::days(days - 1);

  let pool = get_pool().await?;
  let (oauth_client, _redirect) = google_oauth_client_from_env()?;

  let access_token = match get_valid_access_token(pool, &oauth_client, &user_id).await {
    Ok(token) => token,
    Err(TokenStoreError::NotConnected) => {
      eprintln!("No Search Console connection for this user. Run the OAuth connect flow first.");
      return Ok(());
    }
    Err(err) => return Err(token_store_error_to_vercel_error(err)),
  };

  let query = SearchAnalyticsQuery::for_range(start_dt, end_dt);
  let rows = query_search_analytics(&access_token, &site_url, &query)
    .await
    .map_err(search_console_error_to_vercel_error)?;

  let cfg = ScorerConfig::from_env();
  let opportunities = score_opportunities(&rows, &cfg);

  println!(
    "ok=true window={}..{} rows={} opportunities={}",
    start_dt,
    end_dt,
    rows.len(),
    opportunities.len()
  );

  for opp in opportunities.iter().take(10) {
    println!(
      "- {} [{}] impressions={} position={:.1} score={:.1} potential={}",
      opp.query,
      opp.category.as_str(),
      opp.impressions,
      opp.position,
      opp.score,
      opp.estimated_potential
    );
  }

  Ok(())
}
