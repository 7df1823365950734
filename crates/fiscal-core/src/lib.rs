//! # fiscal-core: Pure Invoicing Logic
//!
//! Everything needed to turn a set of completed sales into a certifiable
//! invoice document, as pure functions with zero I/O dependencies.
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Fiscal Back Office Architecture                     │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                  back-office CLI / scheduler                    │   │
//! │  │     global ──► invoice ──► reconcile ──► list / status          │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │        fiscal-billing (ConsolidationEngine, PAC client)         │   │
//! │  └─────────────────────────────┬───────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │               ★ fiscal-core (THIS CRATE) ★                      │   │
//! │  │                                                                 │   │
//! │  │   ┌─────────┐  ┌──────────┐  ┌──────────┐  ┌──────────────┐    │   │
//! │  │   │  money  │  │   tax    │  │ composer │  │   payload    │    │   │
//! │  │   │  Money  │  │Decompose │  │ Invoice  │  │ CfdiPayload  │    │   │
//! │  │   │ TaxRate │  │Reconcile │  │ Composer │  │  Concepto    │    │   │
//! │  │   └─────────┘  └──────────┘  └──────────┘  └──────────────┘    │   │
//! │  │                                                                 │   │
//! │  │   NO I/O • NO DATABASE • NO NETWORK • PURE FUNCTIONS           │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                │                                        │
//! │  ┌─────────────────────────────▼───────────────────────────────────┐   │
//! │  │                    fiscal-db (Database Layer)                   │   │
//! │  │        sales ledger, claim guard, folio sequencer, invoices     │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`types`] - Domain types (Sale, Recipient, Issuer, Invoice, GlobalInvoice)
//! - [`money`] - Money and TaxRate with integer arithmetic
//! - [`tax`] - Tax-inclusive decomposition with cent reconciliation
//! - [`payload`] - The typed document sent for certification
//! - [`composer`] - Builds payloads from sales, recipient and issuer
//! - [`summary`] - Period totals per payment method
//! - [`validation`] - Fiscal field validation
//! - [`error`] - Domain error types
//!
//! ## Example Usage
//!
//! ```rust
//! use fiscal_core::money::{Money, TaxRate};
//! use fiscal_core::tax::decompose;
//!
//! // Sale totals already include tax
//! let total = Money::from_cents(11600); // 116.00
//! let parts = decompose(total, TaxRate::from_bps(1600)).unwrap();
//!
//! assert_eq!(parts.subtotal.cents(), 10000);
//! assert_eq!(parts.tax.cents(), 1600);
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod composer;
pub mod error;
pub mod money;
pub mod payload;
pub mod summary;
pub mod tax;
pub mod types;
pub mod validation;

// =============================================================================
// Re-exports for Convenience
// =============================================================================

pub use composer::{CompositionRequest, InvoiceComposer, LineMode};
pub use error::{CoreError, CoreResult, ValidationError};
pub use money::{Money, TaxRate};
pub use payload::CfdiPayload;
pub use summary::PeriodSummary;
pub use tax::TaxBreakdown;
pub use types::*;

// =============================================================================
// Crate-Level Constants
// =============================================================================

/// Statutory VAT rate used when no rate is configured (16%).
pub const DEFAULT_TAX_RATE_BPS: u32 = 1600;

/// Tax identifier of the general public recipient.
///
/// Global invoices are always addressed to this recipient.
pub const GENERAL_PUBLIC_RFC: &str = "XAXX010101000";

/// Legal name printed for the general public recipient.
pub const GENERAL_PUBLIC_NAME: &str = "PUBLICO EN GENERAL";

/// Fiscal regime code for recipients without tax obligations.
pub const GENERAL_PUBLIC_REGIME: &str = "616";

/// Invoice-use code for "no tax effects".
pub const GENERAL_PUBLIC_CFDI_USE: &str = "S01";

/// Prefix of certification ids produced in sandbox mode.
///
/// A record whose UUID starts with this was never sent to the authority.
pub const SANDBOX_UUID_PREFIX: &str = "SANDBOX-";

/// Maximum length of a line description accepted by the authority.
pub const MAX_DESCRIPTION_LEN: usize = 1000;
