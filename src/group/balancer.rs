//! Load-balancer backends for balanced ring groups.
//!
//! A backend is a shared counter store: the ring loop increments a
//! destination's counter while a call attempt is in flight and decrements
//! it when the attempt resolves.  Two reference implementations:
//!
//! - [`InMemoryBalancer`] for single-process deployments;
//! - [`PostgresBalancer`] for shared state across instances, with atomic
//!   upsert increments, floored decrements, and a configurable key
//!   prefix.

use crate::error::EslError;
use sqlx::PgPool;
use sqlx::Row;
use std::collections::HashMap;
use std::sync::Mutex;

/// A pluggable counter store used by balanced ring mode.
#[allow(async_fn_in_trait)]
pub trait LoadBalancerBackend: Send + Sync {
    /// Increment the in-flight count for a destination.
    async fn increment(&self, destination: &str) -> Result<(), EslError>;

    /// Decrement the count for a destination; never goes below zero, and
    /// the backend is free to drop keys that reach zero.
    async fn decrement(&self, destination: &str) -> Result<(), EslError>;

    /// Current count for a destination (0 when unknown).
    async fn get_count(&self, destination: &str) -> Result<u64, EslError>;

    /// The least-loaded destination, ties broken by list order; `None`
    /// for an empty list.
    async fn get_least_loaded(&self, destinations: &[String])
    -> Result<Option<String>, EslError>;
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// Counter store held in process memory.
#[derive(Debug, Default)]
pub struct InMemoryBalancer {
    counts: Mutex<HashMap<String, u64>>,
}

impl InMemoryBalancer {
    pub fn new() -> Self {
        InMemoryBalancer::default()
    }
}

impl LoadBalancerBackend for InMemoryBalancer {
    async fn increment(&self, destination: &str) -> Result<(), EslError> {
        let mut counts = self.counts.lock().unwrap();
        *counts.entry(destination.to_owned()).or_insert(0) += 1;
        Ok(())
    }

    async fn decrement(&self, destination: &str) -> Result<(), EslError> {
        let mut counts = self.counts.lock().unwrap();
        if let Some(count) = counts.get_mut(destination) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                counts.remove(destination);
            }
        }
        Ok(())
    }

    async fn get_count(&self, destination: &str) -> Result<u64, EslError> {
        Ok(self.counts.lock().unwrap().get(destination).copied().unwrap_or(0))
    }

    async fn get_least_loaded(
        &self,
        destinations: &[String],
    ) -> Result<Option<String>, EslError> {
        if destinations.is_empty() {
            return Ok(None);
        }
        let counts = self.counts.lock().unwrap();
        let min = destinations
            .iter()
            .map(|d| counts.get(d).copied().unwrap_or(0))
            .min()
            .unwrap_or(0);
        Ok(destinations
            .iter()
            .find(|d| counts.get(*d).copied().unwrap_or(0) == min)
            .cloned())
    }
}

// ---------------------------------------------------------------------------
// Postgres backend
// ---------------------------------------------------------------------------

/// Counter store on a shared Postgres pool.
///
/// Counters live in the `esl_ring_counters` table (created on demand by
/// [`PostgresBalancer::ensure_schema`]); the configurable key prefix
/// namespaces destinations so several ring groups can share one table.
pub struct PostgresBalancer {
    pool: PgPool,
    key_prefix: String,
}

impl PostgresBalancer {
    pub fn new(pool: PgPool, key_prefix: impl Into<String>) -> Self {
        PostgresBalancer {
            pool,
            key_prefix: key_prefix.into(),
        }
    }

    /// Create the counter table if it does not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), EslError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS esl_ring_counters (
                 key TEXT PRIMARY KEY,
                 count BIGINT NOT NULL DEFAULT 0
             )",
        )
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    fn key(&self, destination: &str) -> String {
        format!("{}{destination}", self.key_prefix)
    }
}

fn db_err(e: sqlx::Error) -> EslError {
    EslError::Balancer(e.to_string())
}

impl LoadBalancerBackend for PostgresBalancer {
    async fn increment(&self, destination: &str) -> Result<(), EslError> {
        sqlx::query(
            "INSERT INTO esl_ring_counters (key, count) VALUES ($1, 1)
             ON CONFLICT (key) DO UPDATE SET count = esl_ring_counters.count + 1",
        )
        .bind(self.key(destination))
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn decrement(&self, destination: &str) -> Result<(), EslError> {
        let key = self.key(destination);
        sqlx::query(
            "UPDATE esl_ring_counters SET count = GREATEST(count - 1, 0) WHERE key = $1",
        )
        .bind(&key)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        // Drop zeroed keys to keep the table bounded.
        sqlx::query("DELETE FROM esl_ring_counters WHERE key = $1 AND count <= 0")
            .bind(&key)
            .execute(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(())
    }

    async fn get_count(&self, destination: &str) -> Result<u64, EslError> {
        let row = sqlx::query("SELECT count FROM esl_ring_counters WHERE key = $1")
            .bind(self.key(destination))
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        Ok(row
            .map(|r| r.get::<i64, _>("count").max(0) as u64)
            .unwrap_or(0))
    }

    async fn get_least_loaded(
        &self,
        destinations: &[String],
    ) -> Result<Option<String>, EslError> {
        if destinations.is_empty() {
            return Ok(None);
        }
        let keys: Vec<String> = destinations.iter().map(|d| self.key(d)).collect();
        let rows = sqlx::query("SELECT key, count FROM esl_ring_counters WHERE key = ANY($1)")
            .bind(&keys)
            .fetch_all(&self.pool)
            .await
            .map_err(db_err)?;

        let mut stored: HashMap<String, u64> = HashMap::new();
        for row in rows {
            let key: String = row.get("key");
            let count: i64 = row.get("count");
            stored.insert(key, count.max(0) as u64);
        }

        let min = destinations
            .iter()
            .map(|d| stored.get(&self.key(d)).copied().unwrap_or(0))
            .min()
            .unwrap_or(0);
        Ok(destinations
            .iter()
            .find(|d| stored.get(&self.key(d)).copied().unwrap_or(0) == min)
            .cloned())
    }
}
