//! Tracker configuration store
//!
//! Each row holds a tracker's declarative schema blob plus the
//! runtime-mutable credentials and enabled flag. The schema itself is
//! parsed by `tracker::schema` when adapters are built.

use anyhow::Result;
use chrono::{DateTime, Utc};

use super::DbPool;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct TrackerRecord {
    pub slug: String,
    pub name: String,
    pub schema_yaml: String,
    pub api_key: Option<String>,
    pub passkey: Option<String>,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct TrackerRepository {
    pool: DbPool,
}

impl TrackerRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn upsert(
        &self,
        slug: &str,
        name: &str,
        schema_yaml: &str,
        api_key: Option<&str>,
        passkey: Option<&str>,
        enabled: bool,
    ) -> Result<()> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO trackers (slug, name, schema_yaml, api_key, passkey, enabled, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            ON CONFLICT(slug) DO UPDATE SET
                name = excluded.name,
                schema_yaml = excluded.schema_yaml,
                api_key = excluded.api_key,
                passkey = excluded.passkey,
                enabled = excluded.enabled,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(slug)
        .bind(name)
        .bind(schema_yaml)
        .bind(api_key)
        .bind(passkey)
        .bind(enabled)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, slug: &str) -> Result<Option<TrackerRecord>> {
        let record = sqlx::query_as::<_, TrackerRecord>("SELECT * FROM trackers WHERE slug = $1")
            .bind(slug)
            .fetch_optional(&self.pool)
            .await?;
        Ok(record)
    }

    pub async fn list_enabled(&self) -> Result<Vec<TrackerRecord>> {
        let records = sqlx::query_as::<_, TrackerRecord>(
            "SELECT * FROM trackers WHERE enabled = 1 ORDER BY slug",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    pub async fn set_enabled(&self, slug: &str, enabled: bool) -> Result<()> {
        sqlx::query("UPDATE trackers SET enabled = $2, updated_at = $3 WHERE slug = $1")
            .bind(slug)
            .bind(enabled)
            .bind(Utc::now())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn set_credentials(
        &self,
        slug: &str,
        api_key: Option<&str>,
        passkey: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE trackers SET api_key = $2, passkey = $3, updated_at = $4 WHERE slug = $1",
        )
        .bind(slug)
        .bind(api_key)
        .bind(passkey)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
