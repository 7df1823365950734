//! # fiscal-billing: Certification & Consolidation
//!
//! Everything that talks to the certification authority, and the engine
//! that decides when it is safe to.
//!
//! ## Modules
//! - [`config`] - `BillingConfig`: defaults, TOML file, `FISCAL_*` overrides
//! - [`certification`] - `Certify` seam, sandbox and live HTTP client
//! - [`retry`] - bounded exponential backoff for `Network` failures
//! - [`lease`] - drop guard that never abandons a claim
//! - [`engine`] - `ConsolidationEngine`: global invoices, single-sale
//!   invoices, reconciliation
//! - [`error`] - `BillingError` taxonomy
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fiscal_billing::{BillingConfig, ConsolidationEngine};
//! use fiscal_db::{Database, DbConfig};
//!
//! let config = BillingConfig::load(None)?;
//! let db = Database::new(DbConfig::new(&config.database.path)).await?;
//! let engine = ConsolidationEngine::from_config(&config, db)?;
//!
//! let outcome = engine.generate_global_invoice(period, Utc::now()).await?;
//! println!("{}-{} {}", outcome.invoice.series, outcome.invoice.folio, outcome.invoice.cfdi_uuid);
//! ```

pub mod certification;
pub mod config;
pub mod engine;
pub mod error;
pub mod lease;
pub mod retry;

pub use certification::{CertificationClient, CertificationResult, Certify};
pub use config::{BearerToken, BillingConfig};
pub use engine::{
    ConsolidationEngine, GlobalInvoiceOutcome, ReconciliationOutcome, RecordedDocument,
};
pub use error::{BillingError, BillingResult};
pub use lease::ClaimLease;
pub use retry::RetryPolicy;
