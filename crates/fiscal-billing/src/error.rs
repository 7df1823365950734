//! # Billing Error Types
//!
//! ## Error Categories
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Billing Error Categories                           │
//! │                                                                         │
//! │  ┌─────────────────┐  ┌─────────────────┐  ┌─────────────────────────┐ │
//! │  │  Before claim   │  │  After claim,   │  │  After send             │ │
//! │  │                 │  │  before send    │  │                         │ │
//! │  │  Configuration  │  │  Validation     │  │  Network (retried)      │ │
//! │  │  NoPendingSales │  │  Database       │  │  Certification          │ │
//! │  │  SaleNotFound   │  │                 │  │  InvoicedUnconfirmed    │ │
//! │  │  SaleNotBillable│  │  → claim        │  │  PersistenceAfter-      │ │
//! │  │                 │  │    released     │  │    Certification        │ │
//! │  └─────────────────┘  └─────────────────┘  └─────────────────────────┘ │
//! │                                                                         │
//! │  Only Network is retried. InvoicedUnconfirmed is never retried: the    │
//! │  authority may already hold the document.                              │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use fiscal_core::{CoreError, ValidationError};
use fiscal_db::DbError;
use thiserror::Error;

/// Result type alias for billing operations.
pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// Missing or invalid issuer/endpoint configuration. Fatal at startup.
    #[error("Invalid billing configuration: {0}")]
    Configuration(String),

    // =========================================================================
    // Input Errors
    // =========================================================================
    /// The payload could not be composed from the given data.
    #[error("Invoice data rejected: {0}")]
    Validation(#[from] CoreError),

    /// Nothing eligible to invoice.
    #[error("No open sales to invoice in {period}")]
    NoPendingSales { period: String },

    /// The requested sales are owned by another consolidation run.
    #[error("Sales already claimed by another run: {}", sale_ids.join(", "))]
    ConcurrencyConflict { sale_ids: Vec<String> },

    #[error("Sale not found: {0}")]
    SaleNotFound(String),

    /// The sale is already invoiced or awaiting reconciliation.
    #[error("Sale {sale_id} is {state} and cannot be invoiced")]
    SaleNotBillable { sale_id: String, state: String },

    // =========================================================================
    // Certification Errors
    // =========================================================================
    /// Transport failure or 5xx. The request never took effect.
    #[error("Certification authority unreachable: {0}")]
    Network(String),

    /// The authority rejected the document on business rules.
    #[error("Certification rejected [{code}]: {message}")]
    Certification { code: String, message: String },

    /// The request was sent but no usable response came back. Internal to
    /// the client; the engine turns it into `InvoicedUnconfirmed`.
    #[error("Certification outcome unknown: {0}")]
    OutcomeUnknown(String),

    /// A certification may or may not have happened. The sales stay
    /// reserved until `reconcile` settles the question.
    #[error(
        "Certification of {series}-{folio} is unconfirmed ({detail}); \
         run reconcile for consolidation {consolidation_id}"
    )]
    InvoicedUnconfirmed {
        consolidation_id: String,
        series: String,
        folio: String,
        detail: String,
    },

    /// Certified, but the result could not be stored. The journal entry is
    /// kept so a reconciliation can store it later.
    #[error("Document {uuid} was certified but could not be recorded: {detail}")]
    PersistenceAfterCertification { uuid: String, detail: String },

    /// No journal entry with that consolidation id.
    #[error("No unconfirmed certification with id {0}")]
    ReconciliationNotFound(String),

    /// The journal entry belongs to a run still waiting on the authority.
    #[error("Consolidation {0} is still in flight; only unconfirmed certifications can be reconciled")]
    ReconciliationInFlight(String),

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

// =============================================================================
// Error Conversions
// =============================================================================

impl From<ValidationError> for BillingError {
    fn from(err: ValidationError) -> Self {
        BillingError::Validation(CoreError::Validation(err))
    }
}

impl From<serde_json::Error> for BillingError {
    fn from(err: serde_json::Error) -> Self {
        BillingError::Serialization(err.to_string())
    }
}

impl From<std::io::Error> for BillingError {
    fn from(err: std::io::Error) -> Self {
        BillingError::Configuration(err.to_string())
    }
}

impl From<toml::de::Error> for BillingError {
    fn from(err: toml::de::Error) -> Self {
        BillingError::Configuration(err.to_string())
    }
}

impl From<url::ParseError> for BillingError {
    fn from(err: url::ParseError) -> Self {
        BillingError::Configuration(format!("invalid certification URL: {}", err))
    }
}

// =============================================================================
// Error Categorization
// =============================================================================

impl BillingError {
    /// Whether another attempt with the same payload and folio is safe.
    pub fn is_retryable(&self) -> bool {
        matches!(self, BillingError::Network(_))
    }

    /// "Nothing to do" rather than a failure.
    pub fn is_empty_result(&self) -> bool {
        matches!(self, BillingError::NoPendingSales { .. })
    }

    /// Whether the outcome must be settled by a reconciliation.
    pub fn needs_reconciliation(&self) -> bool {
        matches!(
            self,
            BillingError::InvoicedUnconfirmed { .. }
                | BillingError::PersistenceAfterCertification { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_network_is_retryable() {
        assert!(BillingError::Network("connection refused".into()).is_retryable());

        assert!(!BillingError::Certification {
            code: "CFDI40145".into(),
            message: "RFC del receptor no válido".into(),
        }
        .is_retryable());
        assert!(!BillingError::OutcomeUnknown("read timeout".into()).is_retryable());
        assert!(!BillingError::Configuration("no issuer".into()).is_retryable());
    }

    #[test]
    fn test_categories() {
        let empty = BillingError::NoPendingSales {
            period: "2026-10-19".into(),
        };
        assert!(empty.is_empty_result());
        assert!(!empty.needs_reconciliation());

        let unconfirmed = BillingError::InvoicedUnconfirmed {
            consolidation_id: "c-1".into(),
            series: "G".into(),
            folio: "000007".into(),
            detail: "read timeout".into(),
        };
        assert!(unconfirmed.needs_reconciliation());
        assert!(unconfirmed.to_string().contains("G-000007"));
        assert!(unconfirmed.to_string().contains("c-1"));
    }

    #[test]
    fn test_conflict_lists_sales() {
        let err = BillingError::ConcurrencyConflict {
            sale_ids: vec!["S-1".into(), "S-2".into()],
        };
        assert_eq!(err.to_string(), "Sales already claimed by another run: S-1, S-2");
    }

    #[test]
    fn test_validation_conversion() {
        let err: BillingError = ValidationError::Required {
            field: "issuer.rfc".into(),
        }
        .into();
        assert!(matches!(err, BillingError::Validation(CoreError::Validation(_))));
    }
}
