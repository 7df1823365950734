//! # Claim Lease
//!
//! Owns a claimed sale set for the life of one consolidation attempt.
//!
//! ```text
//!   claim ──► Claimed ──begin_certification──► Certifying ──► settle()
//!                │                                  │
//!        release() / drop                  release()   mark_unconfirmed() / drop
//!                │                                  │             │
//!                ▼                                  ▼             ▼
//!              open                               open    invoiced_unconfirmed
//! ```
//!
//! Every exit path either hands the sales to a terminal record (`settle`)
//! or gives them back. If the owning future is dropped before that, the
//! lease spawns the cleanup on the current runtime: a claim that never
//! reached the authority is released, one that may have reached it is left
//! for reconciliation.

use fiscal_db::{Database, DbError, DbResult};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Sales are claimed; nothing has been sent.
    Claimed,
    /// The payload may have reached the authority.
    Certifying,
}

pub struct ClaimLease {
    db: Database,
    tag: String,
    sale_ids: Vec<String>,
    phase: Phase,
    armed: bool,
}

impl ClaimLease {
    pub fn new(db: Database, tag: impl Into<String>, sale_ids: Vec<String>) -> Self {
        ClaimLease {
            db,
            tag: tag.into(),
            sale_ids,
            phase: Phase::Claimed,
            armed: true,
        }
    }

    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// The journal entry is written and the sales are `certifying`.
    pub fn certifying(&mut self) {
        self.phase = Phase::Certifying;
    }

    /// Returns the sales to `open` and drops any journal entry.
    ///
    /// The lease stays armed until the release succeeds: if this future is
    /// dropped or the database fails, `Drop` retries in the background.
    pub async fn release(mut self) -> DbResult<u64> {
        let released = release_now(&self.db, &self.tag, &self.sale_ids).await?;
        self.armed = false;
        Ok(released)
    }

    /// Leaves the sales `invoiced_unconfirmed` with their journal entry.
    /// Armed until it succeeds, like [`Self::release`].
    pub async fn mark_unconfirmed(mut self) -> DbResult<u64> {
        let moved = self
            .db
            .sales()
            .mark_unconfirmed(&self.sale_ids, &self.tag)
            .await?;
        self.armed = false;
        Ok(moved)
    }

    /// The sales reached a terminal record; nothing left to undo.
    pub fn settle(mut self) {
        self.armed = false;
    }
}

impl Drop for ClaimLease {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let handle = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!(
                    consolidation_id = %self.tag,
                    sale_count = self.sale_ids.len(),
                    "Consolidation dropped outside a runtime; sales stay reserved"
                );
                return;
            }
        };

        let db = self.db.clone();
        let tag = std::mem::take(&mut self.tag);
        let sale_ids = std::mem::take(&mut self.sale_ids);
        let phase = self.phase;

        warn!(consolidation_id = %tag, ?phase, "Consolidation dropped mid-flight");

        handle.spawn(async move {
            let result = match phase {
                Phase::Claimed => release_now(&db, &tag, &sale_ids).await,
                Phase::Certifying => db.sales().mark_unconfirmed(&sale_ids, &tag).await,
            };
            match result {
                Ok(count) => info!(consolidation_id = %tag, ?phase, count, "Dropped claim cleaned up"),
                Err(e) => error!(consolidation_id = %tag, error = %e, "Dropped claim cleanup failed"),
            }
        });
    }
}

/// Abandons the journal entry if there is one, otherwise releases the
/// claim directly.
async fn release_now(db: &Database, tag: &str, sale_ids: &[String]) -> DbResult<u64> {
    match db.invoices().abandon_certification(tag).await {
        Ok(released) => Ok(released),
        Err(DbError::NotFound { .. }) => {
            let released = db.sales().release_sales(sale_ids, tag).await?;
            debug!(consolidation_id = %tag, released, "Claim released");
            Ok(released)
        }
        Err(e) => Err(e),
    }
}
