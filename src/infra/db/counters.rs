use std::time::Duration;

use async_trait::async_trait;
use sqlx::types::Json;

use crate::application::{
    rate_limit::RateLimitRecord,
    repos::{CounterStore, RepoError, Versioned},
};

use super::{PostgresRepositories, map_sqlx_error};

/// Shared counters for multi-process deployments. Versions are bumped on
/// every write and compared in the `WHERE` clause, so a lost race affects no
/// rows.
#[async_trait]
impl CounterStore for PostgresRepositories {
    async fn get(&self, key: &str) -> Result<Option<Versioned<RateLimitRecord>>, RepoError> {
        let row = sqlx::query_as::<_, (Json<RateLimitRecord>, i64)>(
            r#"
            SELECT record, version
            FROM render_rate_limits
            WHERE key = $1 AND expires_at > now()
            "#,
        )
        .bind(key)
        .fetch_optional(self.pool())
        .await
        .map_err(map_sqlx_error)?;

        Ok(row.map(|(Json(value), version)| Versioned { value, version }))
    }

    async fn compare_and_put(
        &self,
        key: &str,
        expected: Option<i64>,
        record: &RateLimitRecord,
        ttl: Duration,
    ) -> Result<bool, RepoError> {
        let ttl_secs = ttl.as_secs_f64();
        let result = match expected {
            None => {
                sqlx::query(
                    r#"
                    INSERT INTO render_rate_limits (key, record, version, expires_at)
                    VALUES ($1, $2, 1, now() + make_interval(secs => $3))
                    ON CONFLICT (key) DO UPDATE
                    SET record = EXCLUDED.record,
                        version = render_rate_limits.version + 1,
                        expires_at = EXCLUDED.expires_at
                    WHERE render_rate_limits.expires_at <= now()
                    "#,
                )
                .bind(key)
                .bind(Json(record))
                .bind(ttl_secs)
                .execute(self.pool())
                .await
            }
            Some(version) => {
                sqlx::query(
                    r#"
                    UPDATE render_rate_limits
                    SET record = $2,
                        version = version + 1,
                        expires_at = now() + make_interval(secs => $3)
                    WHERE key = $1 AND version = $4 AND expires_at > now()
                    "#,
                )
                .bind(key)
                .bind(Json(record))
                .bind(ttl_secs)
                .bind(version)
                .execute(self.pool())
                .await
            }
        }
        .map_err(map_sqlx_error)?;

        Ok(result.rows_affected() == 1)
    }
}
