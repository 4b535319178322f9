use chrono::{Duration, NaiveDate};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeriodWindow {
  pub start: NaiveDate,
  pub end: NaiveDate,
}

// Equal-length window immediately before [start, end], both endpoints inclusive.
pub fn previous_period(start: NaiveDate, end: NaiveDate) -> PeriodWindow {
  let len_days = (end - start).num_days() + 1;
  let previous_end = start - Duration::days(1);
  let previous_start = previous_end - Duration::days(len_days - 1);

  PeriodWindow {
    start: previous_start,
    end: previous_end,
  }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct EntityMetrics {
  pub clicks: i64,
  pub impressions: i64,
}

#[derive(Debug, Clone)]
pub struct PeriodCompareConfig {
  // Relative-decline guard: small absolute numbers are noise, not a trend.
  pub min_previous_clicks: i64,
  pub decline_ratio: f64,
}

impl Default for PeriodCompareConfig {
  fn default() -> Self {
    Self {
      min_previous_clicks: 10,
      decline_ratio: 0.2,
    }
  }
}

#[derive(Debug, Clone)]
pub struct EntityComparison {
  pub entity_id: String,
  pub clicks: i64,
  pub impressions: i64,
  pub previous_clicks: Option<i64>,
  pub previous_impressions: Option<i64>,
  pub clicks_change: Option<i64>,
  pub impressions_change: Option<i64>,
  pub needs_attention: bool,
}

fn needs_attention(clicks_change: i64, previous_clicks: i64, cfg: &PeriodCompareConfig) -> bool {
  clicks_change < 0
    && previous_clicks >= cfg.min_previous_clicks
    && (clicks_change.unsigned_abs() as f64) / (previous_clicks as f64) > cfg.decline_ratio
}

// Only entities present in the current map are enumerated. An entity with no
// previous-period match keeps its comparison fields absent; missing history is
// not the same as zero.
pub fn compare_periods(
  current: &HashMap<String, EntityMetrics>,
  previous: &HashMap<String, EntityMetrics>,
  cfg: &PeriodCompareConfig,
) -> Vec<EntityComparison> {
  let mut out: Vec<EntityComparison> = Vec::with_capacity(current.len());

  for (entity_id, metrics) in current.iter() {
    let prior = previous.get(entity_id);

    let clicks_change = prior.map(|p| metrics.clicks - p.clicks);
    let impressions_change = prior.map(|p| metrics.impressions - p.impressions);

    let attention = match (clicks_change, prior) {
      (Some(change), Some(p)) => needs_attention(change, p.clicks, cfg),
      _ => false,
    };

    out.push(EntityComparison {
      entity_id: entity_id.clone(),
      clicks: metrics.clicks,
      impressions: metrics.impressions,
      previous_clicks: prior.map(|p| p.clicks),
      previous_impressions: prior.map(|p| p.impressions),
      clicks_change,
      impressions_change,
      needs_attention: attention,
    });
  }

  out.sort_by(|a, b| {
    b.clicks
      .cmp(&a.clicks)
      .then_with(|| a.entity_id.cmp(&b.entity_id))
  });

  out
}

// Maps a page URL to the blog slug used as the stable entity id: the last
// non-empty path segment, query string and fragment stripped.
pub fn slug_from_page_url(url: &str) -> Option<String> {
  let without_fragment = url.split('#').next().unwrap_or("");
  let without_query = without_fragment.split('?').next().unwrap_or("");

  let path = match without_query.find("://") {
    Some(idx) => {
      let rest = &without_query[idx + 3..];
      match rest.find('/') {
        Some(slash) => &rest[slash..],
        None => "",
      }
    }
    None => without_query,
  };

  path
    .split('/')
    .rev()
    .map(str::trim)
    .find(|segment| !segment.is_empty())
    .map(|segment| segment.to_string())
}
