//! # fiscal-db: Database Layer for the Fiscal Back Office
//!
//! SQLite storage for the invoicing pipeline, using sqlx for async access.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Invoicing Data Flow                                │
//! │                                                                         │
//! │  ConsolidationEngine (fiscal-billing)                                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     fiscal-db (THIS CRATE)                      │   │
//! │  │                                                                 │   │
//! │  │   ┌───────────────┐    ┌────────────────┐   ┌──────────────┐  │   │
//! │  │   │   Database    │    │  Repositories  │   │  Migrations  │  │   │
//! │  │   │   (pool.rs)   │    │                │   │  (embedded)  │  │   │
//! │  │   │               │    │ SaleRepository │   │              │  │   │
//! │  │   │ SqlitePool    │◄───│ FolioSequencer │   │ 001_initial_ │  │   │
//! │  │   │ Connection    │    │ InvoiceRepo    │   │  schema.sql  │  │   │
//! │  │   │ Management    │    │ ClientRepo     │   │              │  │   │
//! │  │   └───────────────┘    └────────────────┘   └──────────────┘  │   │
//! │  │                                                                 │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                     SQLite Database                             │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Atomicity Guarantees
//!
//! | Operation                    | Mechanism                                        |
//! |------------------------------|--------------------------------------------------|
//! | claim sales                  | one `UPDATE … WHERE billing_state = 'open' … RETURNING id` |
//! | next folio                   | one upsert `… DO UPDATE SET value = value + 1 RETURNING value` |
//! | record certified invoice     | insert + sale transition + journal delete in one transaction |
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fiscal_db::{Database, DbConfig};
//!
//! let db = Database::new(DbConfig::new("back-office.db")).await?;
//! let folio = db.folios().next_folio(InvoiceSeries::Global.tag()).await?;
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod migrations;
pub mod pool;
pub mod repository;

// =============================================================================
// Re-exports
// =============================================================================

pub use error::{DbError, DbResult};
pub use pool::{Database, DbConfig};

pub use repository::client::{Client, ClientRepository};
pub use repository::folio::FolioSequencer;
pub use repository::invoice::{
    CertificationKind, CertifiedDocument, InvoiceRepository, PendingCertification,
};
pub use repository::sale::{ClaimOutcome, InvoiceRef, SaleRepository};
