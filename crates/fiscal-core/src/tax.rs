//! # Tax Decomposition
//!
//! Splits tax-inclusive amounts into `(subtotal, tax)` and reconciles the
//! rounding of many lines against their aggregate.
//!
//! ## Rule
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │  subtotal = round_half_up(total / (1 + rate), 2)                        │
//! │  tax      = total - subtotal                                            │
//! │                                                                         │
//! │  In cents and basis points (no floats anywhere):                        │
//! │    subtotal = ⌊(2·total·10000 + (10000+bps)) / (2·(10000+bps))⌋         │
//! │                                                                         │
//! │  Lines of one document:                                                 │
//! │    each line decomposed on its own, then                                │
//! │    drift = aggregate.subtotal - Σ line.subtotal                         │
//! │    is pushed into the LAST line (spilling backwards if the last line   │
//! │    cannot absorb it), so Σ line.subtotal == aggregate.subtotal and     │
//! │    Σ line.tax == aggregate.tax exactly.                                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The same rule applies to individual and global invoices.

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::money::{Money, TaxRate, BPS_SCALE};

/// A tax-inclusive amount split into its base and its tax.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaxBreakdown {
    pub subtotal: Money,
    pub tax: Money,
}

impl TaxBreakdown {
    /// The tax-inclusive amount. Always `subtotal + tax`.
    #[inline]
    pub fn total(&self) -> Money {
        self.subtotal + self.tax
    }
}

/// Decomposes one tax-inclusive amount.
///
/// ## Example
/// ```rust
/// use fiscal_core::money::{Money, TaxRate};
/// use fiscal_core::tax::decompose;
///
/// let parts = decompose(Money::from_cents(45000), TaxRate::from_bps(1600)).unwrap();
/// assert_eq!(parts.subtotal.cents(), 38793);
/// assert_eq!(parts.tax.cents(), 6207);
/// ```
pub fn decompose(total: Money, rate: TaxRate) -> CoreResult<TaxBreakdown> {
    if total.is_negative() {
        return Err(CoreError::NegativeAmount {
            field: "total".to_string(),
            cents: total.cents(),
        });
    }

    let denominator = (BPS_SCALE + rate.bps() as i64) as i128;
    let numerator = total.cents() as i128 * BPS_SCALE as i128;
    let subtotal = (2 * numerator + denominator) / (2 * denominator);

    let subtotal = Money::from_cents(subtotal as i64);
    Ok(TaxBreakdown {
        subtotal,
        tax: total - subtotal,
    })
}

/// Decomposes every line of one document and reconciles them with the
/// decomposition of their sum.
///
/// Returns the per-line breakdowns (same order as `line_totals`) and the
/// aggregate breakdown. Each line keeps `subtotal + tax == line total`.
pub fn decompose_lines(
    line_totals: &[Money],
    rate: TaxRate,
) -> CoreResult<(Vec<TaxBreakdown>, TaxBreakdown)> {
    let mut aggregate_total = Money::zero();
    for line in line_totals {
        aggregate_total = aggregate_total
            .checked_add(*line)
            .ok_or_else(|| CoreError::Overflow {
                context: "document total".to_string(),
            })?;
    }
    let aggregate = decompose(aggregate_total, rate)?;

    let mut lines = line_totals
        .iter()
        .map(|total| decompose(*total, rate))
        .collect::<CoreResult<Vec<_>>>()?;

    let line_subtotals: Money = lines.iter().map(|l| l.subtotal).sum();
    let mut drift = aggregate.subtotal.cents() - line_subtotals.cents();

    // Last line first. A line's subtotal stays within [0, line total].
    for (line, total) in lines.iter_mut().zip(line_totals).rev() {
        if drift == 0 {
            break;
        }
        let current = line.subtotal.cents();
        let adjusted = (current + drift).clamp(0, total.cents());
        drift -= adjusted - current;
        line.subtotal = Money::from_cents(adjusted);
        line.tax = *total - line.subtotal;
    }

    debug_assert_eq!(drift, 0, "aggregate subtotal always fits inside the lines");
    Ok((lines, aggregate))
}

// =============================================================================
// Unit Tests
// =============================================================================
