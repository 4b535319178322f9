use crate::providers::search_console::SearchAnalyticsRow;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpportunityCategory {
  HowTo,
  Color,
  Product,
  General,
}

impl OpportunityCategory {
  pub fn as_str(&self) -> &'static str {
    match self {
      OpportunityCategory::HowTo => "how-to",
      OpportunityCategory::Color => "color",
      OpportunityCategory::Product => "product",
      OpportunityCategory::General => "general",
    }
  }
}

#[derive(Debug, Clone)]
pub struct Opportunity {
  pub query: String,
  pub category: OpportunityCategory,
  pub impressions: i64,
  pub clicks: i64,
  pub ctr: f64,
  pub position: f64,
  pub score: f64,
  pub estimated_potential: i64,
}

#[derive(Debug, Clone)]
pub struct ScorerConfig {
  pub min_impressions: i64,
  pub max_ctr: f64,
  pub min_position: f64,
  // Assumed CTR at position #1. A conservative niche-content estimate, not a
  // fitted curve; kept configurable pending product-owner validation.
  pub top_ctr_estimate: f64,
  pub position_divisor: f64,
  pub max_results: usize,
}

impl Default for ScorerConfig {
  fn default() -> Self {
    Self {
      min_impressions: 10,
      max_ctr: 0.05,
      min_position: 5.0,
      top_ctr_estimate: 0.3,
      position_divisor: 10.0,
      max_results: 50,
    }
  }
}

impl ScorerConfig {
  // Allow tuning thresholds without code changes, same as model pricing overrides.
  pub fn from_env() -> Self {
    let mut cfg = Self::default();

    if let Ok(v) = std::env::var("SCORER_MIN_IMPRESSIONS") {
      if let Ok(v) = v.parse::<i64>() {
        cfg.min_impressions = v;
      }
    }
    if let Ok(v) = std::env::var("SCORER_MAX_CTR") {
      if let Ok(v) = v.parse::<f64>() {
        cfg.max_ctr = v;
      }
    }
    if let Ok(v) = std::env::var("SCORER_MIN_POSITION") {
      if let Ok(v) = v.parse::<f64>() {
        cfg.min_position = v;
      }
    }
    if let Ok(v) = std::env::var("SCORER_TOP_CTR_ESTIMATE") {
      if let Ok(v) = v.parse::<f64>() {
        cfg.top_ctr_estimate = v;
      }
    }
    if let Ok(v) = std::env::var("SCORER_POSITION_DIVISOR") {
      if let Ok(v) = v.parse::<f64>() {
        if v > 0.0 {
          cfg.position_divisor = v;
        }
      }
    }
    if let Ok(v) = std::env::var("SCORER_MAX_RESULTS") {
      if let Ok(v) = v.parse::<usize>() {
        cfg.max_results = v;
      }
    }

    cfg
  }
}

const HOW_TO_TERMS: &[&str] = &["how to", "guide", "tutorial", "instructions", "tips"];

const COLOR_TERMS: &[&str] = &[
  "indigo",
  "madder",
  "weld",
  "walnut",
  "blue",
  "red",
  "yellow",
  "brown",
  "green",
  "purple",
  "pink",
  "orange",
  "natural dye",
  "plant dye",
  "botanical dye",
];

const PRODUCT_TERMS: &[&str] = &[
  "yarn",
  "wool",
  "fiber",
  "fibre",
  "skein",
  "hand dyed",
  "hand-dyed",
  "merino",
  "sock yarn",
];

fn contains_any(haystack_lower: &str, needles: &[&str]) -> bool {
  needles.iter().any(|n| haystack_lower.contains(n))
}

// First match wins: instructional intent outranks the color vocabulary, which
// outranks product terms. "how to dye wool indigo" is a how-to, not a color query.
pub fn categorize(query: &str) -> OpportunityCategory {
  let q = query.to_lowercase();

  if q.starts_with("how to") || contains_any(&q, HOW_TO_TERMS) {
    return OpportunityCategory::HowTo;
  }
  if contains_any(&q, COLOR_TERMS) {
    return OpportunityCategory::Color;
  }
  if contains_any(&q, PRODUCT_TERMS) {
    return OpportunityCategory::Product;
  }
  OpportunityCategory::General
}

// Rewards high-visibility, low-click-through, poorly-ranked queries.
pub fn score_query(impressions: i64, ctr: f64, position: f64, cfg: &ScorerConfig) -> f64 {
  (impressions as f64) * (1.0 - ctr) * (position / cfg.position_divisor)
}

// Additional clicks if the query ranked #1. Near the top the same estimate
// applies; the clicks already captured shrink the upside. Negative results are
// not clamped here; callers that need positivity filter downstream.
pub fn estimated_potential(impressions: i64, clicks: i64, cfg: &ScorerConfig) -> i64 {
  ((impressions as f64) * cfg.top_ctr_estimate - (clicks as f64)).round() as i64
}

// Pure: same rows + same config always produce the same ranked list. Rows are
// expected with `query` as the first dimension key.
pub fn score_opportunities(rows: &[SearchAnalyticsRow], cfg: &ScorerConfig) -> Vec<Opportunity> {
  let mut out: Vec<Opportunity> = Vec::new();

  for row in rows {
    let query = match row.keys.first() {
      Some(q) if !q.trim().is_empty() => q.trim().to_string(),
      _ => continue,
    };

    if row.impressions < cfg.min_impressions {
      continue;
    }
    if row.ctr >= cfg.max_ctr {
      continue;
    }
    if row.position <= cfg.min_position {
      continue;
    }

    let potential = estimated_potential(row.impressions, row.clicks, cfg);
    if potential <= 0 {
      continue;
    }

    out.push(Opportunity {
      category: categorize(&query),
      query,
      impressions: row.impressions,
      clicks: row.clicks,
      ctr: row.ctr,
      position: row.position,
      score: score_query(row.impressions, row.ctr, row.position, cfg),
      estimated_potential: potential,
    });
  }

  out.sort_by(|a, b| {
    b.score
      .partial_cmp(&a.score)
      .unwrap_or(std::cmp::Ordering::Equal)
      .then_with(|| b.impressions.cmp(&a.impressions))
      .then_with(|| a.query.cmp(&b.query))
  });
  out.truncate(cfg.max_results);

  out
}

#[cfg(test)]
mod tests {
  use super::*;

  fn row(query: &str, impressions: i64, clicks: i64, ctr: f64, position: f64) -> SearchAnalyticsRow {
    SearchAnalyticsRow {
      keys: vec![query.to_string()],
      clicks,
      impressions,
      ctr,
      position,
    }
  }

  #[test]
  fn categorize_is_deterministic_and_how_to_precedes_color() {
    assert_eq!(categorize("how to dye wool indigo"), OpportunityCategory::HowTo);
    assert_eq!(categorize("how to dye wool indigo"), OpportunityCategory::HowTo);
  }

  #[test]
  fn categorize_color_precedes_product() {
    assert_eq!(categorize("indigo sock yarn"), OpportunityCategory::Color);
  }

  #[test]
  fn categorize_matches_case_insensitively() {
    assert_eq!(categorize("Merino Skein Care Tips"), OpportunityCategory::HowTo);
    assert_eq!(categorize("MADDER root dyeing"), OpportunityCategory::Color);
    assert_eq!(categorize("Hand-Dyed gradient set"), OpportunityCategory::Product);
  }

  #[test]
  fn categorize_falls_back_to_general() {
    assert_eq!(categorize("shipping times"), OpportunityCategory::General);
  }

  #[test]
  fn score_is_monotonic_in_impressions() {
    let cfg = ScorerConfig::default();
    let low = score_query(100, 0.02, 8.0, &cfg);
    let high = score_query(200, 0.02, 8.0, &cfg);
    assert!(high >= low);
  }

  #[test]
  fn worked_example_matches_expected_values() {
    let cfg = ScorerConfig::default();
    let rows = vec![row("hand dyed sock yarn", 500, 10, 0.02, 8.0)];

    let opportunities = score_opportunities(&rows, &cfg);
    assert_eq!(opportunities.len(), 1);

    let opp = &opportunities[0];
    assert_eq!(opp.category, OpportunityCategory::Product);
    assert!((opp.score - 392.0).abs() < 1e-9);
    assert_eq!(opp.estimated_potential, 140);
  }

  #[test]
  fn pipeline_filters_below_thresholds() {
    let cfg = ScorerConfig::default();
    let rows = vec![
      row("too few impressions", 9, 0, 0.0, 8.0),
      row("ctr already healthy", 100, 6, 0.06, 8.0),
      row("already ranking well", 100, 2, 0.02, 4.0),
      row("survives", 100, 2, 0.02, 8.0),
    ];

    let opportunities = score_opportunities(&rows, &cfg);
    assert_eq!(opportunities.len(), 1);
    assert_eq!(opportunities[0].query, "survives");
  }

  #[test]
  fn pipeline_drops_non_positive_potential() {
    let cfg = ScorerConfig::default();
    // 40 impressions * 0.3 = 12 expected clicks; 12 already captured.
    let rows = vec![row("fully captured query", 40, 12, 0.04, 9.0)];
    assert!(score_opportunities(&rows, &cfg).is_empty());
  }

  #[test]
  fn surfaced_opportunities_always_have_positive_potential() {
    let cfg = ScorerConfig::default();
    let mut rows = Vec::new();
    for i in 0..200 {
      rows.push(row(&format!("query {i}"), 10 + i, i / 4, 0.02, 6.0 + (i as f64) * 0.1));
    }

    for opp in score_opportunities(&rows, &cfg) {
      assert!(opp.estimated_potential > 0);
    }
  }

  #[test]
  fn ranking_is_score_descending_and_truncated() {
    let mut cfg = ScorerConfig::default();
    cfg.max_results = 2;

    let rows = vec![
      row("small", 50, 0, 0.0, 8.0),
      row("large", 500, 0, 0.0, 8.0),
      row("medium", 100, 0, 0.0, 8.0),
    ];

    let opportunities = score_opportunities(&rows, &cfg);
    assert_eq!(opportunities.len(), 2);
    assert_eq!(opportunities[0].query, "large");
    assert_eq!(opportunities[1].query, "medium");
  }

  #[test]
  fn equal_scores_break_ties_deterministically() {
    let cfg = ScorerConfig::default();
    let rows = vec![
      row("walnut shades", 100, 0, 0.0, 8.0),
      row("autumn palette", 100, 0, 0.0, 8.0),
    ];

    let opportunities = score_opportunities(&rows, &cfg);
    assert_eq!(opportunities.len(), 2);
    assert_eq!(opportunities[0].query, "autumn palette");
    assert_eq!(opportunities[1].query, "walnut shades");
  }

  #[test]
  fn rows_without_a_query_key_are_skipped() {
    let cfg = ScorerConfig::default();
    let rows = vec![SearchAnalyticsRow {
      keys: vec![],
      clicks: 0,
      impressions: 100,
      ctr: 0.0,
      position: 8.0,
    }];
    assert!(score_opportunities(&rows, &cfg).is_empty());
  }
}
