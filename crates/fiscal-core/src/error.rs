//! # Error Types
//!
//! Domain-specific error types for fiscal-core.
//!
//! ## Error Hierarchy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Error Types                                     │
//! │                                                                         │
//! │  fiscal-core errors (this file)                                        │
//! │  ├── CoreError        - Composition and arithmetic failures            │
//! │  └── ValidationError  - Bad fiscal data (caught before any network)    │
//! │                                                                         │
//! │  fiscal-db errors (separate crate)                                     │
//! │  └── DbError          - Database operation failures                    │
//! │                                                                         │
//! │  fiscal-billing errors (separate crate)                                │
//! │  └── BillingError     - What the engine and CLI see                    │
//! │                                                                         │
//! │  Flow: ValidationError → CoreError → BillingError → CLI exit status    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use thiserror::Error;

// =============================================================================
// Core Error
// =============================================================================

/// Errors raised while decomposing totals or composing an invoice.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An invoice was requested for an empty set of sales.
    #[error("Cannot compose an invoice without sales")]
    NoSales,

    /// A monetary amount that must be non-negative was negative.
    #[error("{field} must not be negative (got {cents} cents)")]
    NegativeAmount { field: String, cents: i64 },

    /// Per-item lines requested but the items do not add up to the sale total.
    ///
    /// ## When This Occurs
    /// - A discount was applied at sale level, not per item
    /// - Items were edited after the sale total was frozen
    #[error("Items of sale {sale_id} add up to {items_cents} cents but the sale total is {total_cents}")]
    ItemsDoNotMatchTotal {
        sale_id: String,
        items_cents: i64,
        total_cents: i64,
    },

    /// Arithmetic left the representable range.
    #[error("Amount overflow while computing {context}")]
    Overflow { context: String },

    /// Validation error (wraps ValidationError).
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

// =============================================================================
// Validation Error
// =============================================================================

/// Fiscal data validation errors.
///
/// Raised by composition before anything leaves the process, so a bad RFC
/// or postal code never costs a certification attempt.
#[derive(Debug, Error)]
pub enum ValidationError {
    /// A required field is missing or empty.
    #[error("{field} is required")]
    Required { field: String },

    /// Field value is too long.
    #[error("{field} must be at most {max} characters")]
    TooLong { field: String, max: usize },

    /// Numeric value is out of range.
    #[error("{field} must be between {min} and {max}")]
    OutOfRange { field: String, min: i64, max: i64 },

    /// Value must be positive.
    #[error("{field} must be positive")]
    MustBePositive { field: String },

    /// Invalid format (e.g., malformed RFC, postal code, amount).
    #[error("{field} has invalid format: {reason}")]
    InvalidFormat { field: String, reason: String },

    /// Value is not in allowed set.
    #[error("{field} must be one of: {allowed:?}")]
    NotAllowed { field: String, allowed: Vec<String> },
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// Convenience type alias for Results with CoreError.
pub type CoreResult<T> = Result<T, CoreError>;

// =============================================================================
// Unit Tests
// =============================================================================
