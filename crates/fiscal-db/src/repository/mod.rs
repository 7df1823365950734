//! # Repositories
//!
//! One repository per aggregate, each holding a clone of the pool.
//!
//! - [`sale`] - Sales ledger, atomic claim/release, billing state transitions
//! - [`folio`] - Per-series folio counters
//! - [`invoice`] - Certified invoices and the certification journal
//! - [`client`] - Registered invoice recipients

pub mod client;
pub mod folio;
pub mod invoice;
pub mod sale;

/// Generates a new record id.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
