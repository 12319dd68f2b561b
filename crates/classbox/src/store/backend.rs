//! Storage backends for the shared state store.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::SqlitePool;
use std::time::Duration;

/// Current time in Unix milliseconds.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn expiry_ms(ttl: Option<Duration>) -> Option<i64> {
    ttl.map(|ttl| now_ms().saturating_add(i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX)))
}

/// A key/value backend reachable from every worker process.
///
/// Values are opaque JSON strings. Expired entries behave as absent.
#[async_trait]
pub trait StateBackend: Send + Sync {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>>;

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<()>;

    /// Write `value` only if the current value equals `expected`
    /// (`None` meaning absent or expired). Returns whether the write happened.
    async fn compare_and_set(
        &self,
        namespace: &str,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool>;

    /// Returns whether an entry was removed.
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

    /// Remove the entry only if its current value equals `expected`.
    async fn delete_if(&self, namespace: &str, key: &str, expected: &str) -> Result<bool>;

    async fn keys(&self, namespace: &str) -> Result<Vec<String>>;

    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64>;
}

/// Backend on the `shared_state` table of the shared SQLite database.
#[derive(Debug, Clone)]
pub struct SqliteStateBackend {
    pool: SqlitePool,
}

impl SqliteStateBackend {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateBackend for SqliteStateBackend {
    async fn get(&self, namespace: &str, key: &str) -> Result<Option<String>> {
        let row: Option<(String,)> = sqlx::query_as(
            r#"
            SELECT value FROM shared_state
            WHERE namespace = ? AND key = ?
              AND (expires_at_ms IS NULL OR expires_at_ms > ?)
            "#,
        )
        .bind(namespace)
        .bind(key)
        .bind(now_ms())
        .fetch_optional(&self.pool)
        .await
        .context("reading shared state")?;

        Ok(row.map(|(value,)| value))
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO shared_state (namespace, key, value, expires_at_ms, updated_at_ms)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(namespace, key) DO UPDATE SET
                value = excluded.value,
                expires_at_ms = excluded.expires_at_ms,
                updated_at_ms = excluded.updated_at_ms
            "#,
        )
        .bind(namespace)
        .bind(key)
        .bind(value)
        .bind(expiry_ms(ttl))
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .context("writing shared state")?;

        Ok(())
    }

    async fn compare_and_set(
        &self,
        namespace: &str,
        key: &str,
        expected: Option<&str>,
        value: &str,
        ttl: Option<Duration>,
    ) -> Result<bool> {
        let now = now_ms();
        let result = match expected {
            None => {
                // Insert, or take over a row that has already expired.
                sqlx::query(
                    r#"
                    INSERT INTO shared_state (namespace, key, value, expires_at_ms, updated_at_ms)
                    VALUES (?, ?, ?, ?, ?)
                    ON CONFLICT(namespace, key) DO UPDATE SET
                        value = excluded.value,
                        expires_at_ms = excluded.expires_at_ms,
                        updated_at_ms = excluded.updated_at_ms
                    WHERE shared_state.expires_at_ms IS NOT NULL
                      AND shared_state.expires_at_ms <= ?
                    "#,
                )
                .bind(namespace)
                .bind(key)
                .bind(value)
                .bind(expiry_ms(ttl))
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await
            }
            Some(expected) => {
                sqlx::query(
                    r#"
                    UPDATE shared_state
                    SET value = ?, expires_at_ms = ?, updated_at_ms = ?
                    WHERE namespace = ? AND key = ? AND value = ?
                      AND (expires_at_ms IS NULL OR expires_at_ms > ?)
                    "#,
                )
                .bind(value)
                .bind(expiry_ms(ttl))
                .bind(now)
                .bind(namespace)
                .bind(key)
                .bind(expected)
                .bind(now)
                .execute(&self.pool)
                .await
            }
        }
        .context("compare-and-set on shared state")?;

        Ok(result.rows_affected() == 1)
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM shared_state WHERE namespace = ? AND key = ?")
            .bind(namespace)
            .bind(key)
            .execute(&self.pool)
            .await
            .context("deleting shared state")?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_if(&self, namespace: &str, key: &str, expected: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            DELETE FROM shared_state
            WHERE namespace = ? AND key = ? AND value = ?
              AND (expires_at_ms IS NULL OR expires_at_ms > ?)
            "#,
        )
        .bind(namespace)
        .bind(key)
        .bind(expected)
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .context("conditionally deleting shared state")?;

        Ok(result.rows_affected() > 0)
    }

    async fn keys(&self, namespace: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT key FROM shared_state
            WHERE namespace = ?
              AND (expires_at_ms IS NULL OR expires_at_ms > ?)
            ORDER BY key
            "#,
        )
        .bind(namespace)
        .bind(now_ms())
        .fetch_all(&self.pool)
        .await
        .context("listing shared state keys")?;

        Ok(rows.into_iter().map(|(key,)| key).collect())
    }

    async fn purge_expired(&self) -> Result<u64> {
        let result = sqlx::query(
            "DELETE FROM shared_state WHERE expires_at_ms IS NOT NULL AND expires_at_ms <= ?",
        )
        .bind(now_ms())
        .execute(&self.pool)
        .await
        .context("purging expired shared state")?;

        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    async fn backend() -> SqliteStateBackend {
        let db = Database::in_memory().await.unwrap();
        SqliteStateBackend::new(db.pool().clone())
    }

    #[tokio::test]
    async fn test_set_get_overwrite() {
        let backend = backend().await;
        backend.set("ns", "k", "\"a\"", None).await.unwrap();
        backend.set("ns", "k", "\"b\"", None).await.unwrap();

        assert_eq!(
            backend.get("ns", "k").await.unwrap().as_deref(),
            Some("\"b\"")
        );
        assert_eq!(backend.get("other", "k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_entries_are_invisible() {
        let backend = backend().await;
        backend
            .set("ns", "gone", "1", Some(Duration::from_millis(1)))
            .await
            .unwrap();
        backend.set("ns", "kept", "2", None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(backend.get("ns", "gone").await.unwrap(), None);
        assert_eq!(backend.keys("ns").await.unwrap(), vec!["kept".to_string()]);
        assert_eq!(backend.purge_expired().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_compare_and_set_absent() {
        let backend = backend().await;
        assert!(
            backend
                .compare_and_set("ns", "k", None, "1", None)
                .await
                .unwrap()
        );
        // Present now, so a second "absent" swap loses.
        assert!(
            !backend
                .compare_and_set("ns", "k", None, "2", None)
                .await
                .unwrap()
        );
        assert_eq!(backend.get("ns", "k").await.unwrap().as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_compare_and_set_takes_over_expired_row() {
        let backend = backend().await;
        backend
            .set("ns", "k", "old", Some(Duration::from_millis(1)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(
            backend
                .compare_and_set("ns", "k", None, "new", None)
                .await
                .unwrap()
        );
        assert_eq!(
            backend.get("ns", "k").await.unwrap().as_deref(),
            Some("new")
        );
    }

    #[tokio::test]
    async fn test_compare_and_set_expected_value() {
        let backend = backend().await;
        backend.set("ns", "k", "v1", None).await.unwrap();

        assert!(
            !backend
                .compare_and_set("ns", "k", Some("stale"), "v2", None)
                .await
                .unwrap()
        );
        assert!(
            backend
                .compare_and_set("ns", "k", Some("v1"), "v2", None)
                .await
                .unwrap()
        );
        assert_eq!(backend.get("ns", "k").await.unwrap().as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_delete_reports_removal() {
        let backend = backend().await;
        backend.set("ns", "k", "1", None).await.unwrap();
        assert!(backend.delete("ns", "k").await.unwrap());
        assert!(!backend.delete("ns", "k").await.unwrap());
    }

    #[tokio::test]
    async fn test_delete_if_requires_matching_value() {
        let backend = backend().await;
        backend.set("ns", "k", "v2", None).await.unwrap();

        assert!(!backend.delete_if("ns", "k", "v1").await.unwrap());
        assert_eq!(backend.get("ns", "k").await.unwrap().as_deref(), Some("v2"));
        assert!(backend.delete_if("ns", "k", "v2").await.unwrap());
        assert_eq!(backend.get("ns", "k").await.unwrap(), None);
    }
}
