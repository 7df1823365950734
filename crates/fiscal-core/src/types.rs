//! # Domain Types
//!
//! Core domain types for fiscal invoicing.
//!
//! ## Type Overview
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Domain Types                                    │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │      Sale       │   │     Invoice     │   │  GlobalInvoice  │       │
//! │  │  ─────────────  │──►│  ─────────────  │   │  ─────────────  │       │
//! │  │  total (incl.)  │   │  one sale       │   │  many sales     │       │
//! │  │  items          │   │  series "A"     │   │  series "G"     │       │
//! │  │  billing_state  │──────────────────────►│  period         │       │
//! │  └─────────────────┘   └─────────────────┘   └─────────────────┘       │
//! │                                                                         │
//! │  ┌─────────────────┐   ┌─────────────────┐   ┌─────────────────┐       │
//! │  │  BillingState   │   │   Recipient     │   │     Issuer      │       │
//! │  │  ─────────────  │   │  ─────────────  │   │  ─────────────  │       │
//! │  │  Open           │   │  GeneralPublic  │   │  rfc            │       │
//! │  │  Claimed        │   │  Registered     │   │  legal_name     │       │
//! │  │  Certifying     │   └─────────────────┘   │  fiscal_regime  │       │
//! │  │  Invoiced       │                         │  expedition_cp  │       │
//! │  │  InvoicedUnconf.│                         └─────────────────┘       │
//! │  └─────────────────┘                                                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! A sale is covered by at most one of {Invoice, GlobalInvoice}; the
//! `invoice_id` / `global_invoice_id` pair on [`Sale`] is never both set.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use ts_rs::TS;

use crate::error::ValidationError;
use crate::money::Money;

// =============================================================================
// Payment Method
// =============================================================================

/// How the customer paid for a sale.
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Physical cash payment.
    Cash,
    /// Bank transfer.
    Transfer,
    /// Card payment on external terminal.
    Card,
    /// Payment form not recorded.
    Unspecified,
}

impl PaymentMethod {
    /// Payment form code printed in `FormaPago`.
    pub const fn sat_code(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "01",
            PaymentMethod::Transfer => "03",
            PaymentMethod::Card => "04",
            PaymentMethod::Unspecified => "99",
        }
    }

    /// Payment form for a document covering several sales.
    ///
    /// The shared method's code when every sale was paid the same way,
    /// otherwise "to be defined" (`99`).
    pub fn common_code<'a, I>(methods: I) -> &'static str
    where
        I: IntoIterator<Item = &'a PaymentMethod>,
    {
        let mut methods = methods.into_iter();
        let Some(first) = methods.next() else {
            return PaymentMethod::Unspecified.sat_code();
        };
        if methods.all(|m| m == first) {
            first.sat_code()
        } else {
            PaymentMethod::Unspecified.sat_code()
        }
    }

    pub const fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Cash => "cash",
            PaymentMethod::Transfer => "transfer",
            PaymentMethod::Card => "card",
            PaymentMethod::Unspecified => "unspecified",
        }
    }
}

impl std::str::FromStr for PaymentMethod {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cash" => Ok(PaymentMethod::Cash),
            "transfer" => Ok(PaymentMethod::Transfer),
            "card" => Ok(PaymentMethod::Card),
            "unspecified" => Ok(PaymentMethod::Unspecified),
            _ => Err(ValidationError::NotAllowed {
                field: "payment_method".to_string(),
                allowed: ["cash", "transfer", "card", "unspecified"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            }),
        }
    }
}

// =============================================================================
// Billing State
// =============================================================================

/// Where a sale is in the invoicing pipeline.
///
/// ## State Machine
/// ```text
///            claim                begin certify           certified + recorded
///   Open ──────────► Claimed ─────────────────► Certifying ──────────────────► Invoiced
///    ▲                  │                          │    │
///    │     release      │                          │    │ response lost
///    └──────────────────┴──────────────────────────┘    ▼
///    ▲            (any failure before success)     InvoicedUnconfirmed
///    │                                                  │
///    └────────────── reconcile: not certified ──────────┤
///                                                       │ reconcile: certified
///                                                       └──────────────────► Invoiced
/// ```
#[cfg_attr(feature = "sqlx", derive(sqlx::Type))]
#[cfg_attr(feature = "sqlx", sqlx(rename_all = "snake_case"))]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
#[serde(rename_all = "snake_case")]
pub enum BillingState {
    /// Completed sale not yet covered by any invoice.
    Open,
    /// Reserved by exactly one consolidation attempt.
    Claimed,
    /// Payload sent (or about to be sent) for certification.
    Certifying,
    /// Covered by a certified Invoice or GlobalInvoice. Terminal.
    Invoiced,
    /// Certification outcome unknown; waits for reconciliation.
    InvoicedUnconfirmed,
}

impl BillingState {
    pub const ALL: [BillingState; 5] = [
        BillingState::Open,
        BillingState::Claimed,
        BillingState::Certifying,
        BillingState::Invoiced,
        BillingState::InvoicedUnconfirmed,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            BillingState::Open => "open",
            BillingState::Claimed => "claimed",
            BillingState::Certifying => "certifying",
            BillingState::Invoiced => "invoiced",
            BillingState::InvoicedUnconfirmed => "invoiced_unconfirmed",
        }
    }

    /// Whether the sale can still be picked up by a consolidation run.
    #[inline]
    pub const fn is_billable(&self) -> bool {
        matches!(self, BillingState::Open)
    }
}

impl Default for BillingState {
    fn default() -> Self {
        BillingState::Open
    }
}

impl fmt::Display for BillingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Invoice Series
// =============================================================================

/// Folio series. Each series has its own never-reused counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, TS)]
#[ts(export)]
pub enum InvoiceSeries {
    /// One invoice per sale, series "A".
    #[serde(rename = "A")]
    Individual,
    /// Period-wide invoice to the general public, series "G".
    #[serde(rename = "G")]
    Global,
}

impl InvoiceSeries {
    /// Series tag printed in `Serie` and used as the counter key.
    pub const fn tag(&self) -> &'static str {
        match self {
            InvoiceSeries::Individual => "A",
            InvoiceSeries::Global => "G",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "A" => Some(InvoiceSeries::Individual),
            "G" => Some(InvoiceSeries::Global),
            _ => None,
        }
    }
}

impl fmt::Display for InvoiceSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

// =============================================================================
// Sale
// =============================================================================

/// A completed sale as seen by the invoicing pipeline.
///
/// Created by the sales-entry side; only `billing_state`, `claim_tag` and the
/// invoice references change afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Sale {
    pub id: String,
    /// Registered client who bought, if any.
    pub client_id: Option<String>,
    #[ts(as = "String")]
    pub created_at: DateTime<Utc>,
    /// Tax-inclusive total in cents.
    pub total_cents: i64,
    pub payment_method: PaymentMethod,
    /// Ordered line items.
    pub items: Vec<LineItem>,
    pub billing_state: BillingState,
    /// Consolidation attempt currently owning the sale.
    pub claim_tag: Option<String>,
    pub invoice_id: Option<String>,
    pub global_invoice_id: Option<String>,
}

impl Sale {
    /// Returns the tax-inclusive total as Money.
    #[inline]
    pub fn total(&self) -> Money {
        Money::from_cents(self.total_cents)
    }

    /// Sum of line totals. Equals [`Sale::total`] unless a sale-level
    /// discount was applied.
    pub fn items_total(&self) -> Money {
        self.items.iter().map(LineItem::line_total).sum()
    }

    /// Short product summary such as `"2x Coca-Cola, 1x Pan dulce"`.
    pub fn product_summary(&self) -> String {
        self.items
            .iter()
            .map(|item| format!("{}x {}", item.quantity, item.description))
            .collect::<Vec<_>>()
            .join(", ")
    }
}

// =============================================================================
// Line Item
// =============================================================================

/// A line of a sale. Immutable once the sale exists.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct LineItem {
    pub product_id: String,
    pub description: String,
    /// Product/service classification key; the configured default applies
    /// when absent.
    pub product_key: Option<String>,
    pub quantity: i64,
    /// Tax-inclusive unit price in cents.
    pub unit_price_cents: i64,
    /// Tax-inclusive line total in cents.
    pub line_total_cents: i64,
}

impl LineItem {
    #[inline]
    pub fn unit_price(&self) -> Money {
        Money::from_cents(self.unit_price_cents)
    }

    #[inline]
    pub fn line_total(&self) -> Money {
        Money::from_cents(self.line_total_cents)
    }
}

// =============================================================================
// Issuer & Recipient
// =============================================================================

/// The merchant's fiscal identity. Loaded once from configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Issuer {
    pub rfc: String,
    pub legal_name: String,
    pub fiscal_regime: String,
    /// Postal code of the place of issue (`LugarExpedicion`).
    pub expedition_postal_code: String,
}

/// A registered client's fiscal profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct FiscalProfile {
    pub rfc: String,
    pub legal_name: String,
    pub fiscal_regime: String,
    pub postal_code: String,
    /// Invoice-use code (`UsoCFDI`), e.g. `G03`.
    pub cfdi_use: String,
}

/// Who an invoice is addressed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recipient {
    /// The fixed anonymous recipient used for global invoices.
    GeneralPublic,
    /// A specific registered client.
    Registered(FiscalProfile),
}

impl Recipient {
    #[inline]
    pub fn is_general_public(&self) -> bool {
        matches!(self, Recipient::GeneralPublic)
    }
}

// =============================================================================
// Billing Period
// =============================================================================

/// A half-open time range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Period {
    /// Creates a period, rejecting empty or inverted ranges.
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ValidationError> {
        if end <= start {
            return Err(ValidationError::InvalidFormat {
                field: "period".to_string(),
                reason: format!("end {} is not after start {}", end, start),
            });
        }
        Ok(Period { start, end })
    }

    /// Whether `at` falls inside the period.
    #[inline]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start <= at && at < self.end
    }

    /// `Periodicidad` code for the global information block.
    ///
    /// | Span       | Code | Meaning   |
    /// |------------|------|-----------|
    /// | ≤ 1 day    | 01   | daily     |
    /// | ≤ 7 days   | 02   | weekly    |
    /// | ≤ 16 days  | 03   | fortnight |
    /// | longer     | 04   | monthly   |
    pub fn periodicity_code(&self) -> &'static str {
        let span = self.end - self.start;
        if span <= chrono::Duration::days(1) {
            "01"
        } else if span <= chrono::Duration::days(7) {
            "02"
        } else if span <= chrono::Duration::days(16) {
            "03"
        } else {
            "04"
        }
    }

    /// Two-digit month of the period start (`Meses`).
    pub fn month_code(&self) -> String {
        format!("{:02}", self.start.month())
    }

    /// Year of the period start (`Año`).
    pub fn year(&self) -> i32 {
        self.start.year()
    }
}

// =============================================================================
// Invoice Records
// =============================================================================

/// A certified invoice covering exactly one sale.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct Invoice {
    pub id: String,
    pub sale_id: String,
    pub series: String,
    pub folio: String,
    pub cfdi_uuid: String,
    /// Raw certified document as returned by the authority.
    pub document: String,
    pub recipient_rfc: String,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    #[ts(as = "String")]
    pub issued_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub certified_at: DateTime<Utc>,
}

impl Invoice {
    #[inline]
    pub fn is_sandbox(&self) -> bool {
        self.cfdi_uuid.starts_with(crate::SANDBOX_UUID_PREFIX)
    }
}

/// A certified invoice covering a frozen set of sales over a period.
#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct GlobalInvoice {
    pub id: String,
    pub series: String,
    pub folio: String,
    #[ts(as = "String")]
    pub period_start: DateTime<Utc>,
    #[ts(as = "String")]
    pub period_end: DateTime<Utc>,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub cfdi_uuid: String,
    pub document: String,
    /// Exactly the sales this document covers.
    pub sale_ids: Vec<String>,
    #[ts(as = "String")]
    pub issued_at: DateTime<Utc>,
    #[ts(as = "String")]
    pub certified_at: DateTime<Utc>,
}

impl GlobalInvoice {
    #[inline]
    pub fn total(&self) -> Money {
        Money::from_cents(self.total_cents)
    }

    #[inline]
    pub fn tax(&self) -> Money {
        Money::from_cents(self.tax_cents)
    }

    #[inline]
    pub fn is_sandbox(&self) -> bool {
        self.cfdi_uuid.starts_with(crate::SANDBOX_UUID_PREFIX)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
