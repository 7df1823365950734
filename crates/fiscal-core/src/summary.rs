//! # Period Summary
//!
//! Cash-cut style totals for a set of sales: how many, how much, and how
//! much per payment method.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use ts_rs::TS;

use crate::money::Money;
use crate::types::{PaymentMethod, Sale};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct MethodTotals {
    pub count: i64,
    pub total_cents: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct PeriodSummary {
    pub sale_count: i64,
    pub total_cents: i64,
    pub by_method: BTreeMap<PaymentMethod, MethodTotals>,
}

impl PeriodSummary {
    pub fn from_sales(sales: &[Sale]) -> Self {
        let mut summary = PeriodSummary::default();
        for sale in sales {
            summary.sale_count += 1;
            summary.total_cents += sale.total_cents;
            let entry = summary.by_method.entry(sale.payment_method).or_default();
            entry.count += 1;
            entry.total_cents += sale.total_cents;
        }
        summary
    }

    #[inline]
    pub fn total(&self) -> Money {
        Money::from_cents(self.total_cents)
    }

    /// Total collected with `method`, zero if it was not used.
    pub fn total_for(&self, method: PaymentMethod) -> Money {
        self.by_method
            .get(&method)
            .map(|t| Money::from_cents(t.total_cents))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BillingState;
    use chrono::Utc;

    fn sale(total_cents: i64, payment_method: PaymentMethod) -> Sale {
        Sale {
            id: uuid_like(total_cents),
            client_id: None,
            created_at: Utc::now(),
            total_cents,
            payment_method,
            items: vec![],
            billing_state: BillingState::Open,
            claim_tag: None,
            invoice_id: None,
            global_invoice_id: None,
        }
    }

    fn uuid_like(n: i64) -> String {
        format!("S-{}", n)
    }

    #[test]
    fn test_breakdown_per_method() {
        let sales = vec![
            sale(10000, PaymentMethod::Cash),
            sale(15000, PaymentMethod::Card),
            sale(20000, PaymentMethod::Cash),
        ];
        let summary = PeriodSummary::from_sales(&sales);

        assert_eq!(summary.sale_count, 3);
        assert_eq!(summary.total().cents(), 45000);
        assert_eq!(summary.total_for(PaymentMethod::Cash).cents(), 30000);
        assert_eq!(summary.total_for(PaymentMethod::Card).cents(), 15000);
        assert!(summary.total_for(PaymentMethod::Transfer).is_zero());
        assert_eq!(summary.by_method[&PaymentMethod::Cash].count, 2);
    }

    #[test]
    fn test_empty() {
        let summary = PeriodSummary::from_sales(&[]);
        assert_eq!(summary.sale_count, 0);
        assert!(summary.by_method.is_empty());
    }
}
