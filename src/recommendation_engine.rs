use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::opportunity_scorer::Opportunity;
use crate::providers::gemini::{generate_text, GeminiConfig};

// The prompt embeds at most this many opportunities; beyond that the model
// output degrades and the token spend does not.
pub const MAX_PROMPT_OPPORTUNITIES: usize = 30;

const GENERATION_TEMPERATURE: f64 = 0.4;
const GENERATION_MAX_OUTPUT_TOKENS: u32 = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendationType {
  NewPost,
  Optimize,
  QuickWin,
  LongTail,
}

impl RecommendationType {
  pub fn as_str(&self) -> &'static str {
    match self {
      RecommendationType::NewPost => "new_post",
      RecommendationType::Optimize => "optimize",
      RecommendationType::QuickWin => "quick_win",
      RecommendationType::LongTail => "long_tail",
    }
  }

  pub fn parse(value: &str) -> Option<Self> {
    match value.trim() {
      "new_post" => Some(RecommendationType::NewPost),
      "optimize" => Some(RecommendationType::Optimize),
      "quick_win" => Some(RecommendationType::QuickWin),
      "long_tail" => Some(RecommendationType::LongTail),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfidenceLevel {
  High,
  Medium,
  Low,
}

impl ConfidenceLevel {
  pub fn as_str(&self) -> &'static str {
    match self {
      ConfidenceLevel::High => "high",
      ConfidenceLevel::Medium => "medium",
      ConfidenceLevel::Low => "low",
    }
  }

  // Unknown values repair to medium rather than dropping the whole item.
  pub fn parse_or_medium(value: &str) -> Self {
    match value.trim() {
      "high" => ConfidenceLevel::High,
      "low" => ConfidenceLevel::Low,
      _ => ConfidenceLevel::Medium,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
  High,
  Medium,
  Low,
}

impl Priority {
  pub fn as_str(&self) -> &'static str {
    match self {
      Priority::High => "high",
      Priority::Medium => "medium",
      Priority::Low => "low",
    }
  }

  pub fn parse_or_medium(value: &str) -> Self {
    match value.trim() {
      "high" => Priority::High,
      "low" => Priority::Low,
      _ => Priority::Medium,
    }
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct Recommendation {
  pub id: String,
  pub rec_type: RecommendationType,
  pub title: String,
  pub target_keyword: String,
  pub suggested_title: Option<String>,
  pub explanation: String,
  pub estimated_opportunity: i64,
  pub confidence: ConfidenceLevel,
  pub priority: Priority,
  pub related_queries: Vec<String>,
  pub existing_post_id: Option<String>,
}

// Tolerant intake shape for whatever the model returns. Unknown fields are
// ignored; absent ones fall back to defaults and get validated below.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RecommendationDraft {
  #[serde(rename = "type", default)]
  rec_type: String,
  #[serde(default)]
  title: String,
  #[serde(default)]
  target_keyword: String,
  #[serde(default)]
  suggested_title: Option<String>,
  #[serde(default)]
  explanation: String,
  #[serde(default)]
  estimated_opportunity: f64,
  #[serde(default)]
  confidence: String,
  #[serde(default)]
  priority: String,
  #[serde(default)]
  related_queries: Vec<String>,
  #[serde(default)]
  existing_post_id: Option<String>,
}

fn format_ctr_pct(ctr: f64) -> String {
  format!("{:.1}%", ctr * 100.0)
}

pub fn build_recommendation_prompt(
  opportunities: &[Opportunity],
  existing_titles: &[String],
) -> (String, String) {
  let system = r#"You are an SEO content strategist for a small e-commerce shop selling hand-dyed yarn and natural-dye supplies.
You turn Search Console query data into concrete content recommendations.
Recommendation types:
- "new_post": no existing content covers the query; propose a new blog post.
- "optimize": an existing post should rank better; propose concrete improvements.
- "quick_win": the query already ranks on page one (position 5-10) with meaningful impressions; small changes unlock clicks.
- "long_tail": a specific low-competition query worth a focused section or post.
Priority follows estimated opportunity size; confidence follows how much data backs the call (high impressions = high confidence).
Return STRICT JSON only: a single JSON array, no markdown, no commentary."#;

  let mut user = String::new();
  user.push_str("Search opportunities (query | impressions | clicks | position | ctr | estimated additional clicks):\n");
  for opp in opportunities.iter().take(MAX_PROMPT_OPPORTUNITIES) {
    user.push_str(&format!(
      "- {} | {} | {} | {:.1} | {} | {} | category: {}\n",
      opp.query,
      opp.impressions,
      opp.clicks,
      opp.position,
      format_ctr_pct(opp.ctr),
      opp.estimated_potential,
      opp.category.as_str(),
    ));
  }

  user.push_str("\nExisting blog post titles (use these to detect content gaps; do not recommend new posts that duplicate them):\n");
  if existing_titles.is_empty() {
    user.push_str("- (none yet)\n");
  }
  for title in existing_titles.iter() {
    user.push_str(&format!("- {}\n", title));
  }

  user.push_str(
    r#"
Produce 5-10 recommendations as a JSON array of objects with these keys:
{"type":"new_post|optimize|quick_win|long_tail","title":"...","targetKeyword":"...","suggestedTitle":"...","explanation":"...","estimatedOpportunity":123,"confidence":"high|medium|low","priority":"high|medium|low","relatedQueries":["..."]}
"suggestedTitle" and "relatedQueries" are optional. Respond with the JSON array only."#,
  );

  (system.to_string(), user)
}

// Outermost bracket span. Tolerates leading/trailing prose and markdown fences
// around the array; nested arrays stay inside the span by construction.
pub fn extract_json_array(raw: &str) -> Option<&str> {
  let start = raw.find('[')?;
  let end = raw.rfind(']')?;
  if end < start {
    return None;
  }
  Some(&raw[start..=end])
}

fn draft_into_recommendation(draft: RecommendationDraft) -> Option<Recommendation> {
  let rec_type = RecommendationType::parse(&draft.rec_type)?;

  let title = draft.title.trim().to_string();
  let target_keyword = draft.target_keyword.trim().to_string();
  if title.is_empty() || target_keyword.is_empty() {
    return None;
  }

  let suggested_title = draft
    .suggested_title
    .as_deref()
    .map(str::trim)
    .filter(|v| !v.is_empty())
    .map(str::to_string);

  let existing_post_id = draft
    .existing_post_id
    .as_deref()
    .map(str::trim)
    .filter(|v| !v.is_empty())
    .map(str::to_string);

  let related_queries = draft
    .related_queries
    .into_iter()
    .map(|q| q.trim().to_string())
    .filter(|q| !q.is_empty())
    .collect();

  Some(Recommendation {
    id: Uuid::new_v4().to_string(),
    rec_type,
    title,
    target_keyword,
    suggested_title,
    explanation: draft.explanation.trim().to_string(),
    estimated_opportunity: draft.estimated_opportunity.round().max(0.0) as i64,
    confidence: ConfidenceLevel::parse_or_medium(&draft.confidence),
    priority: Priority::parse_or_medium(&draft.priority),
    related_queries,
    existing_post_id,
  })
}

pub fn parse_recommendations(raw: &str) -> Vec<Recommendation> {
  let span = match extract_json_array(raw) {
    Some(s) => s,
    None => return Vec::new(),
  };

  let items: Vec<serde_json::Value> = match serde_json::from_str(span) {
    Ok(v) => v,
    Err(_) => return Vec::new(),
  };

  // Per-item intake: one malformed element drops that element, not the batch.
  items
    .into_iter()
    .filter_map(|item| serde_json::from_value::<RecommendationDraft>(item).ok())
    .filter_map(draft_into_recommendation)
    .collect()
}

// Never surfaces an error: the feature is advisory, so provider failures and
// malformed output degrade to an empty list the caller may cache as-is.
pub async fn generate_recommendations(
  gemini: &GeminiConfig,
  opportunities: &[Opportunity],
  existing_titles: &[String],
) -> Vec<Recommendation> {
  let (system, user) = build_recommendation_prompt(opportunities, existing_titles);

  let (text, usage) = match generate_text(
    gemini,
    &system,
    &user,
    GENERATION_TEMPERATURE,
    GENERATION_MAX_OUTPUT_TOKENS,
  )
  .await
  {
    Ok(out) => out,
    Err(err) => {
      eprintln!("recommendation generation failed: {err}");
      return Vec::new();
    }
  };

  if let Some(usage) = usage {
    eprintln!(
      "recommendation generation usage: prompt_tokens={} completion_tokens={}",
      usage.prompt_tokens, usage.completion_tokens
    );
  }

  let recommendations = parse_recommendations(&text);
  if recommendations.is_empty() && !text.trim().is_empty() {
    eprintln!(
      "recommendation generation returned no parseable items (response length {})",
      text.len()
    );
  }

  recommendations
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::opportunity_scorer::{score_opportunities, ScorerConfig};
  use crate::providers::search_console::SearchAnalyticsRow;

  fn sample_opportunities(n: usize) -> Vec<Opportunity> {
    let rows: Vec<SearchAnalyticsRow> = (0..n)
      .map(|i| SearchAnalyticsRow {
        keys: vec![format!("hand dyed query {i}")],
        clicks: 2,
        impressions: 100 + i as i64,
        ctr: 0.02,
        position: 8.0,
      })
      .collect();
    let mut cfg = ScorerConfig::default();
    cfg.max_results = n.max(50);
    score_opportunities(&rows, &cfg)
  }

  #[test]
  fn extract_json_array_tolerates_fences_and_prose() {
    let raw = "Here you go:\n```json\n[{\"type\":\"new_post\"}]\n```\nHope this helps!";
    assert_eq!(extract_json_array(raw), Some("[{\"type\":\"new_post\"}]"));
  }

  #[test]
  fn extract_json_array_rejects_bracketless_text() {
    assert_eq!(extract_json_array("no structured data here"), None);
    assert_eq!(extract_json_array("] backwards ["), None);
  }

  #[test]
  fn parse_recommendations_maps_complete_items() {
    let raw = r#"[
      {
        "type": "optimize",
        "title": "Refresh the indigo vat guide",
        "targetKeyword": "indigo vat maintenance",
        "suggestedTitle": "Indigo Vat Maintenance: A Complete Guide",
        "explanation": "The post ranks on page two with strong impressions.",
        "estimatedOpportunity": 140,
        "confidence": "high",
        "priority": "high",
        "relatedQueries": ["indigo vat revival", "indigo vat ph"],
        "existingPostId": "post-42"
      }
    ]"#;

    let recs = parse_recommendations(raw);
    assert_eq!(recs.len(), 1);

    let rec = &recs[0];
    assert_eq!(rec.rec_type, RecommendationType::Optimize);
    assert_eq!(rec.title, "Refresh the indigo vat guide");
    assert_eq!(rec.target_keyword, "indigo vat maintenance");
    assert_eq!(
      rec.suggested_title.as_deref(),
      Some("Indigo Vat Maintenance: A Complete Guide")
    );
    assert_eq!(rec.estimated_opportunity, 140);
    assert_eq!(rec.confidence, ConfidenceLevel::High);
    assert_eq!(rec.priority, Priority::High);
    assert_eq!(rec.related_queries.len(), 2);
    assert_eq!(rec.existing_post_id.as_deref(), Some("post-42"));
    assert!(!rec.id.is_empty());
  }

  #[test]
  fn parse_recommendations_assigns_fresh_unique_ids() {
    let raw = r#"[
      {"type":"new_post","title":"A","targetKeyword":"a"},
      {"type":"new_post","title":"B","targetKeyword":"b"}
    ]"#;

    let recs = parse_recommendations(raw);
    assert_eq!(recs.len(), 2);
    assert_ne!(recs[0].id, recs[1].id);
  }

  #[test]
  fn parse_recommendations_drops_items_missing_required_fields() {
    let raw = r#"[
      {"type":"new_post","title":"","targetKeyword":"walnut dye"},
      {"type":"new_post","title":"Walnut dye basics","targetKeyword":""},
      {"type":"new_post","title":"Walnut dye basics","targetKeyword":"walnut dye"}
    ]"#;

    let recs = parse_recommendations(raw);
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].title, "Walnut dye basics");
  }

  #[test]
  fn parse_recommendations_drops_unknown_types_and_repairs_enums() {
    let raw = r#"[
      {"type":"delete_everything","title":"X","targetKeyword":"x"},
      {"type":"quick_win","title":"Y","targetKeyword":"y","confidence":"very high","priority":"urgent"}
    ]"#;

    let recs = parse_recommendations(raw);
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].rec_type, RecommendationType::QuickWin);
    assert_eq!(recs[0].confidence, ConfidenceLevel::Medium);
    assert_eq!(recs[0].priority, Priority::Medium);
  }

  #[test]
  fn parse_recommendations_returns_empty_on_malformed_payloads() {
    assert!(parse_recommendations("the model had an off day").is_empty());
    assert!(parse_recommendations("[{\"type\": unquoted}]").is_empty());
    assert!(parse_recommendations("{\"not\":\"an array\"}").is_empty());
  }

  #[test]
  fn optional_fields_default_to_absent_or_empty() {
    let raw = r#"[{"type":"long_tail","title":"Weld on silk","targetKeyword":"weld dye silk"}]"#;

    let recs = parse_recommendations(raw);
    assert_eq!(recs.len(), 1);
    assert_eq!(recs[0].suggested_title, None);
    assert_eq!(recs[0].existing_post_id, None);
    assert!(recs[0].related_queries.is_empty());
    assert_eq!(recs[0].estimated_opportunity, 0);
  }

  #[test]
  fn prompt_embeds_at_most_thirty_opportunities() {
    let opportunities = sample_opportunities(40);
    let (_, user) = build_recommendation_prompt(&opportunities, &[]);

    let embedded = user.matches("hand dyed query").count();
    assert_eq!(embedded, MAX_PROMPT_OPPORTUNITIES);
  }

  #[test]
  fn prompt_lists_existing_titles_for_gap_detection() {
    let opportunities = sample_opportunities(3);
    let titles = vec!["Indigo Vat Basics".to_string(), "Madder Root 101".to_string()];
    let (system, user) = build_recommendation_prompt(&opportunities, &titles);

    assert!(user.contains("Indigo Vat Basics"));
    assert!(user.contains("Madder Root 101"));
    assert!(system.contains("quick_win"));
  }
}
