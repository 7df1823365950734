//! # Consolidation Engine
//!
//! Turns open sales into certified invoices, one attempt per call.
//!
//! ## Pipeline
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      One Consolidation Attempt                          │
//! │                                                                         │
//! │  find open ──► claim ──► validate ──► folio ──► compose ──► journal     │
//! │                  │                                              │       │
//! │                  │        any failure here: release claim       │       │
//! │                  ▼                                              ▼       │
//! │            (ClaimLease)                          certify (retry on      │
//! │                                                  Network only)          │
//! │                                                       │                 │
//! │           ┌───────────────────┬───────────────────────┼──────────┐      │
//! │           ▼                   ▼                       ▼          │      │
//! │       certified          rejected /            outcome unknown   │      │
//! │    record + settle    retries exhausted     invoiced_unconfirmed │      │
//! │    (one transaction)   abandon + release    (journal kept, run   │      │
//! │                                              reconcile later)    │      │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Concurrency
//! The claim is the only synchronization point. Two engines pointed at the
//! same database split the open sales between them; neither ever sees a sale
//! the other claimed. Retries resend the same payload under the same folio.

use chrono::{DateTime, Utc};
use fiscal_core::validation::{validate_issuer, validate_recipient};
use fiscal_core::{
    BillingState, CfdiPayload, CompositionRequest, GlobalInvoice, Invoice, InvoiceComposer,
    InvoiceSeries, Issuer, Period, PeriodSummary, Recipient, Sale,
};
use fiscal_db::repository::new_id;
use fiscal_db::{
    CertificationKind, CertifiedDocument, Database, DbError, PendingCertification,
};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::certification::{CertificationClient, Certify};
use crate::config::BillingConfig;
use crate::error::{BillingError, BillingResult};
use crate::lease::ClaimLease;
use crate::retry::RetryPolicy;

// =============================================================================
// Outcomes
// =============================================================================

/// A certified global invoice and what it covers.
#[derive(Debug, Clone)]
pub struct GlobalInvoiceOutcome {
    pub invoice: GlobalInvoice,
    /// Open at query time but taken by a concurrent run before our claim.
    pub skipped_sale_ids: Vec<String>,
    pub summary: PeriodSummary,
}

/// A document stored after certification.
#[derive(Debug, Clone)]
pub enum RecordedDocument {
    Invoice(Invoice),
    Global(GlobalInvoice),
}

impl RecordedDocument {
    pub fn uuid(&self) -> &str {
        match self {
            RecordedDocument::Invoice(invoice) => &invoice.cfdi_uuid,
            RecordedDocument::Global(invoice) => &invoice.cfdi_uuid,
        }
    }
}

/// How a reconciliation settled an unconfirmed certification.
#[derive(Debug, Clone)]
pub enum ReconciliationOutcome {
    /// The authority holds the document; it is now recorded.
    Confirmed(RecordedDocument),
    /// The authority never certified it; the sales are open again. The
    /// folio stays consumed.
    Released { released: u64 },
}

/// One document to compose from an already-claimed sale set.
struct Job<'a> {
    series: InvoiceSeries,
    sales: &'a [Sale],
    recipient: &'a Recipient,
    as_of: DateTime<Utc>,
    period: Option<Period>,
}

// =============================================================================
// Engine
// =============================================================================

#[derive(Clone)]
pub struct ConsolidationEngine {
    db: Database,
    certifier: Arc<dyn Certify>,
    composer: InvoiceComposer,
    issuer: Issuer,
    retry: RetryPolicy,
}

impl ConsolidationEngine {
    pub fn new(
        db: Database,
        certifier: Arc<dyn Certify>,
        composer: InvoiceComposer,
        issuer: Issuer,
    ) -> Self {
        ConsolidationEngine {
            db,
            certifier,
            composer,
            issuer,
            retry: RetryPolicy::default(),
        }
    }

    /// Builds an engine from validated configuration: live or sandbox
    /// client, composer tunables, issuer and retry policy.
    pub fn from_config(config: &BillingConfig, db: Database) -> BillingResult<Self> {
        config.validate()?;

        let certifier = CertificationClient::from_config(config)?;
        info!(sandbox = certifier.is_sandbox(), "Consolidation engine ready");

        Ok(ConsolidationEngine {
            db,
            certifier: Arc::new(certifier),
            composer: config.composer()?,
            issuer: config.issuer.to_issuer(),
            retry: RetryPolicy::from_settings(&config.pac),
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    // =========================================================================
    // Global Invoice
    // =========================================================================

    /// Certifies one global invoice covering every open sale in `period`.
    ///
    /// ## Errors
    /// - `NoPendingSales` when nothing is open, or everything was claimed by
    ///   a concurrent run. No folio is consumed.
    /// - `Validation`, `Certification`, `Network`: the claim is released.
    /// - `InvoicedUnconfirmed`: the sales wait for [`Self::reconcile`].
    pub async fn generate_global_invoice(
        &self,
        period: Period,
        as_of: DateTime<Utc>,
    ) -> BillingResult<GlobalInvoiceOutcome> {
        let sales_repo = self.db.sales();

        let candidates = sales_repo.find_open_sales(period.start, period.end).await?;
        if candidates.is_empty() {
            info!(period = %describe(&period), "No open sales to consolidate");
            return Err(no_pending(&period));
        }

        let consolidation_id = new_id();
        let ids: Vec<String> = candidates.iter().map(|s| s.id.clone()).collect();
        let claim = sales_repo.claim_sales(&ids, &consolidation_id).await?;
        if claim.is_empty() {
            info!(
                period = %describe(&period),
                candidates = ids.len(),
                "Every open sale was claimed by another run"
            );
            return Err(no_pending(&period));
        }

        let lease = ClaimLease::new(self.db.clone(), consolidation_id.clone(), claim.claimed.clone());
        if !claim.already_claimed.is_empty() {
            info!(
                consolidation_id = %consolidation_id,
                skipped = claim.already_claimed.len(),
                "Skipping sales claimed by another run"
            );
        }

        let owned: HashSet<&str> = claim.claimed.iter().map(String::as_str).collect();
        let sales: Vec<Sale> = candidates
            .into_iter()
            .filter(|sale| owned.contains(sale.id.as_str()))
            .collect();
        let summary = PeriodSummary::from_sales(&sales);

        info!(
            consolidation_id = %consolidation_id,
            period = %describe(&period),
            sale_count = sales.len(),
            total = %summary.total(),
            "Consolidating global invoice"
        );

        let job = Job {
            series: InvoiceSeries::Global,
            sales: &sales,
            recipient: &Recipient::GeneralPublic,
            as_of,
            period: Some(period),
        };

        match self.run(lease, job).await? {
            RecordedDocument::Global(invoice) => Ok(GlobalInvoiceOutcome {
                invoice,
                skipped_sale_ids: claim.already_claimed,
                summary,
            }),
            RecordedDocument::Invoice(invoice) => Err(unexpected_record(&invoice.id)),
        }
    }

    // =========================================================================
    // Individual Invoice
    // =========================================================================

    /// Certifies an invoice for a single open sale.
    pub async fn invoice_sale(
        &self,
        sale_id: &str,
        recipient: &Recipient,
        as_of: DateTime<Utc>,
    ) -> BillingResult<Invoice> {
        let sales_repo = self.db.sales();

        let sale = sales_repo
            .get_by_id(sale_id)
            .await?
            .ok_or_else(|| BillingError::SaleNotFound(sale_id.to_string()))?;

        if !sale.billing_state.is_billable() {
            return Err(BillingError::SaleNotBillable {
                sale_id: sale.id,
                state: sale.billing_state.to_string(),
            });
        }

        let consolidation_id = new_id();
        let claim = sales_repo
            .claim_sales(std::slice::from_ref(&sale.id), &consolidation_id)
            .await?;
        if claim.is_empty() {
            return Err(BillingError::ConcurrencyConflict {
                sale_ids: claim.already_claimed,
            });
        }

        let lease = ClaimLease::new(self.db.clone(), consolidation_id.clone(), claim.claimed);
        info!(consolidation_id = %consolidation_id, sale_id = %sale.id, "Invoicing sale");

        let job = Job {
            series: InvoiceSeries::Individual,
            sales: std::slice::from_ref(&sale),
            recipient,
            as_of,
            period: None,
        };

        match self.run(lease, job).await? {
            RecordedDocument::Invoice(invoice) => Ok(invoice),
            RecordedDocument::Global(invoice) => Err(unexpected_record(&invoice.id)),
        }
    }

    // =========================================================================
    // Reconciliation
    // =========================================================================

    /// Unconfirmed certifications, oldest first. Runs still waiting on the
    /// authority are not listed.
    pub async fn pending_reconciliations(&self) -> BillingResult<Vec<PendingCertification>> {
        Ok(self.db.invoices().list_unconfirmed().await?)
    }

    /// Asks the authority whether an unconfirmed certification happened and
    /// settles its sales accordingly. A failed lookup changes nothing.
    ///
    /// ## Errors
    /// - `ReconciliationNotFound`: no journal entry with that id.
    /// - `ReconciliationInFlight`: the run that wrote the entry has not
    ///   finished; its sales are left alone.
    pub async fn reconcile(&self, consolidation_id: &str) -> BillingResult<ReconciliationOutcome> {
        let invoices = self.db.invoices();
        let pending = invoices
            .get_pending(consolidation_id)
            .await?
            .ok_or_else(|| BillingError::ReconciliationNotFound(consolidation_id.to_string()))?;

        let held = self.db.sales().find_by_claim(consolidation_id).await?;
        let parked = held.len() == pending.sale_ids.len()
            && held
                .iter()
                .all(|sale| sale.billing_state == BillingState::InvoicedUnconfirmed);
        if !parked {
            debug!(
                consolidation_id = %consolidation_id,
                held = held.len(),
                covered = pending.sale_ids.len(),
                "Journal entry belongs to a run in flight"
            );
            return Err(BillingError::ReconciliationInFlight(consolidation_id.to_string()));
        }

        let issued_on = pending.issued_at.date_naive();
        let certifier = self.certifier.as_ref();
        let (series, folio) = (pending.series.as_str(), pending.folio.as_str());
        let found = self
            .retry
            .run("lookup", move |_| certifier.lookup(series, folio, issued_on))
            .await?;

        match found {
            Some(result) => {
                let mut certified = result.into_document();
                if certified.document.is_empty() {
                    certified.document = pending.payload.clone();
                }
                let recorded = self.record(&pending, &certified).await?;
                info!(
                    consolidation_id = %consolidation_id,
                    uuid = %certified.uuid,
                    "Reconciled: authority holds the document"
                );
                Ok(ReconciliationOutcome::Confirmed(recorded))
            }
            None => {
                let released = invoices.release_unconfirmed(consolidation_id).await?;
                warn!(
                    consolidation_id = %consolidation_id,
                    series = %pending.series,
                    folio = %pending.folio,
                    released,
                    "Reconciled: never certified, folio left unused"
                );
                Ok(ReconciliationOutcome::Released { released })
            }
        }
    }

    // =========================================================================
    // Pipeline
    // =========================================================================

    async fn run(&self, mut lease: ClaimLease, job: Job<'_>) -> BillingResult<RecordedDocument> {
        let (pending, payload) = match self.prepare(lease.tag(), &job).await {
            Ok(prepared) => prepared,
            Err(err) => {
                warn!(consolidation_id = %lease.tag(), error = %err, "Releasing claim before certification");
                release(lease).await;
                return Err(err);
            }
        };
        lease.certifying();

        let certifier = self.certifier.as_ref();
        let payload = &payload;
        let tag = pending.consolidation_id.as_str();
        let attempt_result = self
            .retry
            .run("certify", move |attempt| {
                debug!(consolidation_id = %tag, attempt, "Sending for certification");
                certifier.certify(payload)
            })
            .await;

        match attempt_result {
            Ok(result) => {
                let uuid = result.uuid.clone();
                match self.record(&pending, &result.into_document()).await {
                    Ok(recorded) => {
                        lease.settle();
                        Ok(recorded)
                    }
                    Err(err) => {
                        error!(
                            consolidation_id = %tag,
                            uuid = %uuid,
                            error = %err,
                            "Certified document could not be recorded"
                        );
                        if let Err(e) = lease.mark_unconfirmed().await {
                            error!(consolidation_id = %tag, error = %e, "Could not park sales for reconciliation");
                        }
                        Err(BillingError::PersistenceAfterCertification {
                            uuid,
                            detail: err.to_string(),
                        })
                    }
                }
            }
            Err(BillingError::OutcomeUnknown(detail)) => {
                warn!(
                    consolidation_id = %tag,
                    series = %pending.series,
                    folio = %pending.folio,
                    detail = %detail,
                    "Certification outcome unknown"
                );
                if let Err(e) = lease.mark_unconfirmed().await {
                    error!(consolidation_id = %tag, error = %e, "Could not park sales for reconciliation");
                }
                Err(BillingError::InvoicedUnconfirmed {
                    consolidation_id: pending.consolidation_id.clone(),
                    series: pending.series.clone(),
                    folio: pending.folio.clone(),
                    detail,
                })
            }
            Err(err) => {
                warn!(
                    consolidation_id = %tag,
                    folio = %pending.folio,
                    error = %err,
                    "Certification failed, releasing sales"
                );
                release(lease).await;
                Err(err)
            }
        }
    }

    /// Everything between the claim and the first send: validation, folio,
    /// composition and the journal entry. Fails before a folio is drawn when
    /// the parties are invalid.
    async fn prepare(
        &self,
        consolidation_id: &str,
        job: &Job<'_>,
    ) -> BillingResult<(PendingCertification, CfdiPayload)> {
        validate_issuer(&self.issuer)?;
        validate_recipient(job.recipient)?;

        let series = job.series.tag();
        let folio = self.db.folios().next_folio(series).await?;
        debug!(consolidation_id, series, folio = %folio, "Folio issued");

        let composed = self.composer.compose(&CompositionRequest {
            series: job.series,
            folio: &folio,
            sales: job.sales,
            recipient: job.recipient,
            issuer: &self.issuer,
            as_of: job.as_of,
            period: job.period,
        })?;

        let pending = PendingCertification {
            consolidation_id: consolidation_id.to_string(),
            kind: match job.series {
                InvoiceSeries::Global => CertificationKind::GlobalInvoice,
                InvoiceSeries::Individual => CertificationKind::Invoice,
            },
            series: series.to_string(),
            folio,
            payload: composed.payload.to_json()?,
            sale_ids: job.sales.iter().map(|s| s.id.clone()).collect(),
            recipient_rfc: composed.payload.receptor.rfc.clone(),
            subtotal_cents: composed.totals.subtotal.cents(),
            tax_cents: composed.totals.tax.cents(),
            total_cents: composed.totals.total().cents(),
            period_start: job.period.map(|p| p.start),
            period_end: job.period.map(|p| p.end),
            issued_at: job.as_of,
        };

        self.db.invoices().begin_certification(&pending).await?;
        Ok((pending, composed.payload))
    }

    async fn record(
        &self,
        pending: &PendingCertification,
        certified: &CertifiedDocument,
    ) -> BillingResult<RecordedDocument> {
        let invoices = self.db.invoices();
        let recorded = match pending.kind {
            CertificationKind::GlobalInvoice => {
                RecordedDocument::Global(invoices.record_global_invoice(pending, certified).await?)
            }
            CertificationKind::Invoice => {
                RecordedDocument::Invoice(invoices.record_invoice(pending, certified).await?)
            }
        };
        Ok(recorded)
    }
}

// =============================================================================
// Helpers
// =============================================================================

async fn release(lease: ClaimLease) {
    let tag = lease.tag().to_string();
    match lease.release().await {
        Ok(released) => debug!(consolidation_id = %tag, released, "Claim released"),
        Err(e) => error!(consolidation_id = %tag, error = %e, "Claim release failed"),
    }
}

fn describe(period: &Period) -> String {
    format!("[{}, {})", period.start.to_rfc3339(), period.end.to_rfc3339())
}

fn no_pending(period: &Period) -> BillingError {
    BillingError::NoPendingSales {
        period: describe(period),
    }
}

fn unexpected_record(id: &str) -> BillingError {
    BillingError::Database(DbError::Internal(format!(
        "record {} has the wrong document kind",
        id
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use fiscal_core::{FiscalProfile, PaymentMethod, TaxRate};

    fn issuer() -> Issuer {
        Issuer {
            rfc: "EKU9003173C9".into(),
            legal_name: "ESCUELA KEMPER URGATE".into(),
            fiscal_regime: "601".into(),
            expedition_postal_code: "42501".into(),
        }
    }

    async fn engine() -> ConsolidationEngine {
        let db = Database::in_memory().await.unwrap();
        ConsolidationEngine::new(
            db,
            Arc::new(CertificationClient::sandbox()),
            InvoiceComposer::new(TaxRate::from_bps(1600)),
            issuer(),
        )
        .with_retry(RetryPolicy::no_retry())
    }

    async fn add_sale(engine: &ConsolidationEngine, id: &str, minute: u32, cents: i64) {
        engine
            .database()
            .sales()
            .insert_sale(&Sale {
                id: id.into(),
                client_id: None,
                created_at: Utc.with_ymd_and_hms(2026, 10, 19, 10, minute, 0).unwrap(),
                total_cents: cents,
                payment_method: PaymentMethod::Cash,
                items: vec![],
                billing_state: BillingState::Open,
                claim_tag: None,
                invoice_id: None,
                global_invoice_id: None,
            })
            .await
            .unwrap();
    }

    fn day() -> Period {
        Period::new(
            Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2026, 10, 20, 0, 0, 0).unwrap(),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_sandbox_global_invoice() {
        let engine = engine().await;
        add_sale(&engine, "S-1", 0, 11600).await;
        add_sale(&engine, "S-2", 5, 5800).await;

        let outcome = engine
            .generate_global_invoice(day(), Utc::now())
            .await
            .unwrap();

        assert!(outcome.invoice.is_sandbox());
        assert_eq!(outcome.invoice.series, "G");
        assert_eq!(outcome.invoice.folio, "000001");
        assert_eq!(outcome.invoice.sale_ids, vec!["S-1", "S-2"]);
        assert_eq!(outcome.invoice.total_cents, 17400);
        assert_eq!(outcome.summary.sale_count, 2);
        assert!(outcome.skipped_sale_ids.is_empty());
        assert!(engine.pending_reconciliations().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_recipient_consumes_no_folio() {
        let engine = engine().await;
        add_sale(&engine, "S-1", 0, 11600).await;

        let recipient = Recipient::Registered(FiscalProfile {
            rfc: "not-an-rfc".into(),
            legal_name: "ACME".into(),
            fiscal_regime: "601".into(),
            postal_code: "06600".into(),
            cfdi_use: "G03".into(),
        });
        let err = engine
            .invoice_sale("S-1", &recipient, Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::Validation(_)));
        assert_eq!(engine.database().folios().current("A").await.unwrap(), None);
        let sale = engine.database().sales().get_by_id("S-1").await.unwrap().unwrap();
        assert_eq!(sale.billing_state, BillingState::Open);
        assert_eq!(sale.claim_tag, None);
    }

    #[tokio::test]
    async fn test_invoiced_sale_is_not_billable() {
        let engine = engine().await;
        add_sale(&engine, "S-1", 0, 11600).await;

        engine
            .invoice_sale("S-1", &Recipient::GeneralPublic, Utc::now())
            .await
            .unwrap();
        let err = engine
            .invoice_sale("S-1", &Recipient::GeneralPublic, Utc::now())
            .await
            .unwrap_err();

        assert!(matches!(err, BillingError::SaleNotBillable { ref state, .. } if state == "invoiced"));
    }

    #[tokio::test]
    async fn test_unknown_sale() {
        let engine = engine().await;
        let err = engine
            .invoice_sale("missing", &Recipient::GeneralPublic, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, BillingError::SaleNotFound(ref id) if id == "missing"));
    }

    #[tokio::test]
    async fn test_reconcile_unknown_id() {
        let engine = engine().await;
        let err = engine.reconcile("nope").await.unwrap_err();
        assert!(matches!(err, BillingError::ReconciliationNotFound(_)));
    }
}
