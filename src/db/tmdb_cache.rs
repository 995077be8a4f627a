//! TMDB metadata cache
//!
//! Cache-then-network: the metadata client consults this table before
//! going upstream and upserts fetched payloads with a TTL. An entry is
//! valid while `now < expires_at`.

use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};

use super::DbPool;

pub struct TmdbCacheRepository {
    pool: DbPool,
}

impl TmdbCacheRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Fetch a cached payload if it has not expired.
    pub async fn get_valid(&self, tmdb_id: i64) -> Result<Option<serde_json::Value>> {
        let row: Option<(String,)> = sqlx::query_as(
            "SELECT payload FROM tmdb_cache WHERE tmdb_id = $1 AND expires_at > $2",
        )
        .bind(tmdb_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.and_then(|(payload,)| serde_json::from_str(&payload).ok()))
    }

    pub async fn upsert(
        &self,
        tmdb_id: i64,
        payload: &serde_json::Value,
        ttl_days: i64,
    ) -> Result<()> {
        let now = Utc::now();
        let expires_at = now + ChronoDuration::days(ttl_days);
        sqlx::query(
            r#"
            INSERT INTO tmdb_cache (tmdb_id, payload, cached_at, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT(tmdb_id) DO UPDATE SET
                payload = excluded.payload,
                cached_at = excluded.cached_at,
                expires_at = excluded.expires_at
            "#,
        )
        .bind(tmdb_id)
        .bind(serde_json::to_string(payload)?)
        .bind(now)
        .bind(expires_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM tmdb_cache WHERE expires_at <= $1")
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
