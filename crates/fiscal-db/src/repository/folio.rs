//! # Folio Sequencer
//!
//! Per-series invoice numbering. A folio is consumed the moment it is
//! handed out: a certification that later fails leaves a gap, never a
//! reuse.
//!
//! ## Increment
//! ```text
//! INSERT INTO folio_counters (series, value, …) VALUES (?, 1, …)
//! ON CONFLICT (series) DO UPDATE SET value = value + 1
//! RETURNING value
//! ```
//! One statement, so two callers can never read the same value.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};

/// Largest folio that still fits the six-digit format.
pub const MAX_FOLIO: i64 = 999_999;

/// Hands out zero-padded, strictly increasing folios per series.
#[derive(Debug, Clone)]
pub struct FolioSequencer {
    pool: SqlitePool,
}

impl FolioSequencer {
    pub fn new(pool: SqlitePool) -> Self {
        FolioSequencer { pool }
    }

    /// Reserves the next folio for `series`, e.g. `"000001"`.
    pub async fn next_folio(&self, series: &str) -> DbResult<String> {
        let value: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO folio_counters (series, value, updated_at)
            VALUES (?1, 1, ?2)
            ON CONFLICT (series) DO UPDATE
                SET value = folio_counters.value + 1,
                    updated_at = excluded.updated_at
            RETURNING value
            "#,
        )
        .bind(series)
        .bind(Utc::now())
        .fetch_one(&self.pool)
        .await?;

        if value > MAX_FOLIO {
            return Err(DbError::FolioExhausted {
                series: series.to_string(),
            });
        }

        let folio = format_folio(value);
        debug!(series = %series, folio = %folio, "Folio reserved");
        Ok(folio)
    }

    /// Last folio handed out for `series`, if any.
    pub async fn current(&self, series: &str) -> DbResult<Option<i64>> {
        let value = sqlx::query_scalar("SELECT value FROM folio_counters WHERE series = ?1")
            .bind(series)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }
}

#[inline]
pub fn format_folio(value: i64) -> String {
    format!("{:06}", value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    #[tokio::test]
    async fn test_sequential_folios() {
        let db = Database::in_memory().await.unwrap();
        let folios = db.folios();

        assert_eq!(folios.current("G").await.unwrap(), None);
        for expected in ["000001", "000002", "000003"] {
            assert_eq!(folios.next_folio("G").await.unwrap(), expected);
        }
        assert_eq!(folios.current("G").await.unwrap(), Some(3));
    }

    #[tokio::test]
    async fn test_series_are_independent() {
        let db = Database::in_memory().await.unwrap();
        let folios = db.folios();

        assert_eq!(folios.next_folio("G").await.unwrap(), "000001");
        assert_eq!(folios.next_folio("A").await.unwrap(), "000001");
        assert_eq!(folios.next_folio("G").await.unwrap(), "000002");
    }

    #[tokio::test]
    async fn test_concurrent_callers_get_distinct_folios() {
        let db = Database::in_memory().await.unwrap();

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let folios = db.folios();
                tokio::spawn(async move { folios.next_folio("G").await })
            })
            .collect();

        let mut got = Vec::new();
        for handle in handles {
            got.push(handle.await.unwrap().unwrap());
        }
        got.sort();
        assert_eq!(got, vec!["000001", "000002", "000003", "000004", "000005"]);
    }

    #[tokio::test]
    async fn test_exhausted_series() {
        let db = Database::in_memory().await.unwrap();
        sqlx::query("INSERT INTO folio_counters (series, value, updated_at) VALUES ('G', ?1, ?2)")
            .bind(MAX_FOLIO)
            .bind(Utc::now())
            .execute(db.pool())
            .await
            .unwrap();

        let err = db.folios().next_folio("G").await.unwrap_err();
        assert!(matches!(err, DbError::FolioExhausted { .. }));
    }

    #[test]
    fn test_format() {
        assert_eq!(format_folio(42), "000042");
        assert_eq!(format_folio(MAX_FOLIO), "999999");
    }
}
