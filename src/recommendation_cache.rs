use chrono::{DateTime, Duration, Utc};
use sqlx::MySqlPool;
use vercel_runtime::Error;

use crate::recommendation_engine::{ConfidenceLevel, Priority, Recommendation, RecommendationType};

pub const RECOMMENDATION_TTL_DAYS: i64 = 7;

pub fn expiry_for(created_at: DateTime<Utc>) -> DateTime<Utc> {
  created_at + Duration::days(RECOMMENDATION_TTL_DAYS)
}

pub fn entry_is_live(expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
  expires_at > now
}

// Live entries only. An expired entry is never surfaced; it lingers until the
// next put replaces it, which is fine because put always fully replaces a
// user's set. A live entry with zero items is a hit (cached empty generation),
// not a miss.
pub async fn get(
  pool: &MySqlPool,
  user_id: &str,
  now: DateTime<Utc>,
) -> Result<Option<Vec<Recommendation>>, Error> {
  let entry = sqlx::query_as::<_, (DateTime<Utc>,)>(
    r#"
      SELECT expires_at
      FROM search_recommendation_sets
      WHERE user_id = ? AND expires_at > ?
      LIMIT 1;
    "#,
  )
  .bind(user_id)
  .bind(now)
  .fetch_optional(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  if entry.is_none() {
    return Ok(None);
  }

  let rows = sqlx::query_as::<
    _,
    (
      String,
      String,
      String,
      String,
      Option<String>,
      String,
      i64,
      String,
      String,
      String,
      Option<String>,
    ),
  >(
    r#"
      SELECT id, rec_type, title, target_keyword, suggested_title, explanation,
             estimated_opportunity, confidence, priority, related_queries_json, existing_post_id
      FROM search_recommendations
      WHERE user_id = ? AND expires_at > ?
      ORDER BY created_at ASC, id ASC;
    "#,
  )
  .bind(user_id)
  .bind(now)
  .fetch_all(pool)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  let mut out = Vec::with_capacity(rows.len());
  for (
    id,
    rec_type,
    title,
    target_keyword,
    suggested_title,
    explanation,
    estimated_opportunity,
    confidence,
    priority,
    related_queries_json,
    existing_post_id,
  ) in rows
  {
    let rec_type = match RecommendationType::parse(&rec_type) {
      Some(t) => t,
      None => continue,
    };

    let related_queries =
      serde_json::from_str::<Vec<String>>(&related_queries_json).unwrap_or_default();

    out.push(Recommendation {
      id,
      rec_type,
      title,
      target_keyword,
      suggested_title,
      explanation,
      estimated_opportunity,
      confidence: ConfidenceLevel::parse_or_medium(&confidence),
      priority: Priority::parse_or_medium(&priority),
      related_queries,
      existing_post_id,
    });
  }

  Ok(Some(out))
}

// Full replace: delete-then-insert inside one transaction so a crash cannot
// leave the user with a half-written set. An empty set is a valid, cache-worthy
// outcome and still gets a fresh TTL.
pub async fn put(
  pool: &MySqlPool,
  user_id: &str,
  recommendations: &[Recommendation],
  now: DateTime<Utc>,
) -> Result<(), Error> {
  let expires_at = expiry_for(now);

  let mut tx = pool.begin().await.map_err(|e| -> Error { Box::new(e) })?;

  sqlx::query(
    r#"
      DELETE FROM search_recommendations
      WHERE user_id = ?;
    "#,
  )
  .bind(user_id)
  .execute(&mut *tx)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  sqlx::query(
    r#"
      INSERT INTO search_recommendation_sets (user_id, created_at, expires_at)
      VALUES (?, ?, ?)
      ON DUPLICATE KEY UPDATE
        created_at = VALUES(created_at),
        expires_at = VALUES(expires_at);
    "#,
  )
  .bind(user_id)
  .bind(now)
  .bind(expires_at)
  .execute(&mut *tx)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  for rec in recommendations {
    let related_queries_json =
      serde_json::to_string(&rec.related_queries).unwrap_or_else(|_| "[]".to_string());

    sqlx::query(
      r#"
        INSERT INTO search_recommendations
          (id, user_id, rec_type, title, target_keyword, suggested_title, explanation,
           estimated_opportunity, confidence, priority, related_queries_json, existing_post_id,
           created_at, expires_at)
        VALUES
          (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?);
      "#,
    )
    .bind(&rec.id)
    .bind(user_id)
    .bind(rec.rec_type.as_str())
    .bind(&rec.title)
    .bind(&rec.target_keyword)
    .bind(rec.suggested_title.as_deref())
    .bind(&rec.explanation)
    .bind(rec.estimated_opportunity)
    .bind(rec.confidence.as_str())
    .bind(rec.priority.as_str())
    .bind(related_queries_json)
    .bind(rec.existing_post_id.as_deref())
    .bind(now)
    .bind(expires_at)
    .execute(&mut *tx)
    .await
    .map_err(|e| -> Error { Box::new(e) })?;
  }

  tx.commit().await.map_err(|e| -> Error { Box::new(e) })?;

  Ok(())
}

pub async fn invalidate(pool: &MySqlPool, user_id: &str) -> Result<(), Error> {
  let mut tx = pool.begin().await.map_err(|e| -> Error { Box::new(e) })?;

  sqlx::query(
    r#"
      DELETE FROM search_recommendations
      WHERE user_id = ?;
    "#,
  )
  .bind(user_id)
  .execute(&mut *tx)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  sqlx::query(
    r#"
      DELETE FROM search_recommendation_sets
      WHERE user_id = ?;
    "#,
  )
  .bind(user_id)
  .execute(&mut *tx)
  .await
  .map_err(|e| -> Error { Box::new(e) })?;

  tx.commit().await.map_err(|e| -> Error { Box::new(e) })?;

  Ok(())
}
