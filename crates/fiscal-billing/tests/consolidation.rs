//! End-to-end consolidation scenarios against an in-memory database and a
//! scripted certification authority.

use async_trait::async_trait;
use chrono::{NaiveDate, TimeZone, Utc};
use fiscal_billing::{
    BillingError, BillingResult, CertificationResult, Certify, ConsolidationEngine,
    ReconciliationOutcome, RecordedDocument, RetryPolicy,
};
use fiscal_core::{
    BillingState, CfdiPayload, InvoiceComposer, Issuer, PaymentMethod, Period, Recipient, Sale,
    TaxRate,
};
use fiscal_db::Database;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

// =============================================================================
// Scripted authority
// =============================================================================

#[derive(Debug, Clone, Copy)]
enum Step {
    Certify,
    Reject,
    Network,
    Unknown,
    Hang,
    /// Certifies once `open_gate` is called.
    Gated,
}

#[derive(Default)]
struct ScriptedCertifier {
    steps: Mutex<VecDeque<Step>>,
    lookup: Mutex<Option<CertificationResult>>,
    sent: Mutex<Vec<(String, String)>>,
    gate: Notify,
}

impl ScriptedCertifier {
    fn with_steps(steps: &[Step]) -> Arc<Self> {
        Arc::new(ScriptedCertifier {
            steps: Mutex::new(steps.iter().copied().collect()),
            ..Default::default()
        })
    }

    async fn will_find(&self, result: Option<CertificationResult>) {
        *self.lookup.lock().await = result;
    }

    async fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().await.clone()
    }

    fn open_gate(&self) {
        self.gate.notify_one();
    }
}

fn certified(payload: &CfdiPayload) -> CertificationResult {
    CertificationResult {
        uuid: uuid::Uuid::new_v4().to_string().to_uppercase(),
        document: format!("<cfdi:Comprobante Folio=\"{}\"/>", payload.folio),
        certified_at: Utc::now(),
    }
}

#[async_trait]
impl Certify for ScriptedCertifier {
    async fn certify(&self, payload: &CfdiPayload) -> BillingResult<CertificationResult> {
        self.sent
            .lock()
            .await
            .push((payload.serie.clone(), payload.folio.clone()));

        let step = self.steps.lock().await.pop_front().unwrap_or(Step::Certify);
        match step {
            Step::Certify => Ok(certified(payload)),
            Step::Reject => Err(BillingError::Certification {
                code: "CFDI40145".into(),
                message: "El campo Nombre del receptor no pertenece al RFC".into(),
            }),
            Step::Network => Err(BillingError::Network("connection reset by peer".into())),
            Step::Unknown => Err(BillingError::OutcomeUnknown("operation timed out".into())),
            Step::Hang => std::future::pending().await,
            Step::Gated => {
                self.gate.notified().await;
                Ok(certified(payload))
            }
        }
    }

    async fn lookup(
        &self,
        _series: &str,
        _folio: &str,
        _issued_on: NaiveDate,
    ) -> BillingResult<Option<CertificationResult>> {
        Ok(self.lookup.lock().await.clone())
    }
}

// =============================================================================
// Fixtures
// =============================================================================

fn issuer() -> Issuer {
    Issuer {
        rfc: "EKU9003173C9".into(),
        legal_name: "ESCUELA KEMPER URGATE".into(),
        fiscal_regime: "601".into(),
        expedition_postal_code: "42501".into(),
    }
}

fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
    }
}

async fn engine(certifier: Arc<ScriptedCertifier>) -> ConsolidationEngine {
    let db = Database::in_memory().await.unwrap();
    ConsolidationEngine::new(
        db,
        certifier,
        InvoiceComposer::new(TaxRate::from_bps(1600)),
        issuer(),
    )
    .with_retry(fast_retry())
}

async fn add_sale(engine: &ConsolidationEngine, id: &str, minute: u32, cents: i64, method: PaymentMethod) {
    engine
        .database()
        .sales()
        .insert_sale(&Sale {
            id: id.into(),
            client_id: None,
            created_at: Utc.with_ymd_and_hms(2026, 10, 19, 12, minute, 0).unwrap(),
            total_cents: cents,
            payment_method: method,
            items: vec![],
            billing_state: BillingState::Open,
            claim_tag: None,
            invoice_id: None,
            global_invoice_id: None,
        })
        .await
        .unwrap();
}

async fn three_sales(engine: &ConsolidationEngine) {
    add_sale(engine, "S-1", 0, 10000, PaymentMethod::Cash).await;
    add_sale(engine, "S-2", 10, 15000, PaymentMethod::Card).await;
    add_sale(engine, "S-3", 20, 20000, PaymentMethod::Cash).await;
}

fn day() -> Period {
    Period::new(
        Utc.with_ymd_and_hms(2026, 10, 19, 0, 0, 0).unwrap(),
        Utc.with_ymd_and_hms(2026, 10, 20, 0, 0, 0).unwrap(),
    )
    .unwrap()
}

fn as_of() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 10, 19, 23, 30, 0).unwrap()
}

async fn state(engine: &ConsolidationEngine, id: &str) -> BillingState {
    engine
        .database()
        .sales()
        .get_by_id(id)
        .await
        .unwrap()
        .unwrap()
        .billing_state
}

async fn states(engine: &ConsolidationEngine, ids: &[&str]) -> Vec<BillingState> {
    let mut out = Vec::new();
    for id in ids {
        out.push(state(engine, id).await);
    }
    out
}

// =============================================================================
// Global invoice
// =============================================================================

#[tokio::test]
async fn three_sales_consolidate_into_first_global_invoice() {
    let certifier = ScriptedCertifier::with_steps(&[]);
    let engine = engine(certifier.clone()).await;
    three_sales(&engine).await;

    let outcome = engine.generate_global_invoice(day(), as_of()).await.unwrap();
    let invoice = &outcome.invoice;

    assert_eq!(invoice.series, "G");
    assert_eq!(invoice.folio, "000001");
    assert_eq!(invoice.total_cents, 45000);
    assert_eq!(invoice.subtotal_cents, 38793);
    assert_eq!(invoice.tax_cents, 6207);
    assert_eq!(invoice.sale_ids, vec!["S-1", "S-2", "S-3"]);
    assert_eq!(invoice.period_start, day().start);
    assert!(!invoice.is_sandbox());

    assert_eq!(outcome.summary.sale_count, 3);
    assert_eq!(outcome.summary.total_for(PaymentMethod::Cash).cents(), 30000);
    assert_eq!(outcome.summary.total_for(PaymentMethod::Card).cents(), 15000);

    for sale_id in ["S-1", "S-2", "S-3"] {
        let sale = engine.database().sales().get_by_id(sale_id).await.unwrap().unwrap();
        assert_eq!(sale.billing_state, BillingState::Invoiced);
        assert_eq!(sale.global_invoice_id.as_deref(), Some(invoice.id.as_str()));
    }

    let stored = engine
        .database()
        .invoices()
        .get_global_invoice(&invoice.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.cfdi_uuid, invoice.cfdi_uuid);
    assert_eq!(certifier.sent().await, vec![("G".to_string(), "000001".to_string())]);
}

#[tokio::test]
async fn empty_period_consumes_no_folio() {
    let certifier = ScriptedCertifier::with_steps(&[]);
    let engine = engine(certifier.clone()).await;

    let err = engine.generate_global_invoice(day(), as_of()).await.unwrap_err();

    assert!(matches!(err, BillingError::NoPendingSales { .. }));
    assert!(err.is_empty_result());
    assert_eq!(engine.database().folios().current("G").await.unwrap(), None);
    assert!(engine
        .database()
        .invoices()
        .list_global_invoices(day().start, day().end)
        .await
        .unwrap()
        .is_empty());
    assert!(certifier.sent().await.is_empty());
}

#[tokio::test]
async fn sales_outside_period_are_left_open() {
    let certifier = ScriptedCertifier::with_steps(&[]);
    let engine = engine(certifier).await;
    three_sales(&engine).await;

    let next_day = Period::new(day().end, day().end + chrono::Duration::days(1)).unwrap();
    let err = engine.generate_global_invoice(next_day, as_of()).await.unwrap_err();

    assert!(err.is_empty_result());
    assert_eq!(states(&engine, &["S-1", "S-2", "S-3"]).await, vec![BillingState::Open; 3]);
}

#[tokio::test]
async fn rejection_releases_sales_and_burns_the_folio() {
    let certifier = ScriptedCertifier::with_steps(&[Step::Reject]);
    let engine = engine(certifier.clone()).await;
    three_sales(&engine).await;

    let err = engine.generate_global_invoice(day(), as_of()).await.unwrap_err();
    assert!(matches!(err, BillingError::Certification { ref code, .. } if code == "CFDI40145"));
    assert_eq!(states(&engine, &["S-1", "S-2", "S-3"]).await, vec![BillingState::Open; 3]);
    assert!(engine.pending_reconciliations().await.unwrap().is_empty());

    let outcome = engine.generate_global_invoice(day(), as_of()).await.unwrap();
    assert_eq!(outcome.invoice.folio, "000002");
    assert_eq!(outcome.invoice.sale_ids.len(), 3);
}

#[tokio::test]
async fn network_failures_retry_with_the_same_folio() {
    let certifier = ScriptedCertifier::with_steps(&[Step::Network, Step::Network]);
    let engine = engine(certifier.clone()).await;
    three_sales(&engine).await;

    let outcome = engine.generate_global_invoice(day(), as_of()).await.unwrap();

    assert_eq!(outcome.invoice.folio, "000001");
    let sent = certifier.sent().await;
    assert_eq!(sent.len(), 3);
    assert!(sent.iter().all(|(serie, folio)| serie == "G" && folio == "000001"));
    assert_eq!(engine.database().folios().current("G").await.unwrap(), Some(1));
}

#[tokio::test]
async fn exhausted_retries_release_sales() {
    let certifier =
        ScriptedCertifier::with_steps(&[Step::Network, Step::Network, Step::Network]);
    let engine = engine(certifier.clone()).await;
    three_sales(&engine).await;

    let err = engine.generate_global_invoice(day(), as_of()).await.unwrap_err();

    assert!(matches!(err, BillingError::Network(_)));
    assert_eq!(certifier.sent().await.len(), 3);
    assert_eq!(states(&engine, &["S-1", "S-2", "S-3"]).await, vec![BillingState::Open; 3]);
    assert!(engine.pending_reconciliations().await.unwrap().is_empty());
}

// =============================================================================
// Unknown outcome & reconciliation
// =============================================================================

async fn unconfirmed_run(certifier: &Arc<ScriptedCertifier>) -> (ConsolidationEngine, String) {
    let engine = engine(certifier.clone()).await;
    three_sales(&engine).await;

    let err = engine.generate_global_invoice(day(), as_of()).await.unwrap_err();
    let consolidation_id = match err {
        BillingError::InvoicedUnconfirmed {
            consolidation_id,
            ref series,
            ref folio,
            ..
        } => {
            assert_eq!(series, "G");
            assert_eq!(folio, "000001");
            consolidation_id
        }
        other => panic!("expected an unconfirmed certification, got {other}"),
    };
    (engine, consolidation_id)
}

#[tokio::test]
async fn unknown_outcome_is_never_retried() {
    let certifier = ScriptedCertifier::with_steps(&[Step::Unknown]);
    let (engine, consolidation_id) = unconfirmed_run(&certifier).await;

    assert_eq!(certifier.sent().await.len(), 1);
    assert_eq!(
        states(&engine, &["S-1", "S-2", "S-3"]).await,
        vec![BillingState::InvoicedUnconfirmed; 3]
    );

    let pending = engine.pending_reconciliations().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].consolidation_id, consolidation_id);
    assert_eq!(pending[0].total_cents, 45000);

    // the parked sales are not picked up by the next run
    let err = engine.generate_global_invoice(day(), as_of()).await.unwrap_err();
    assert!(err.is_empty_result());
}

#[tokio::test]
async fn reconcile_records_a_document_the_authority_holds() {
    let certifier = ScriptedCertifier::with_steps(&[Step::Unknown]);
    let (engine, consolidation_id) = unconfirmed_run(&certifier).await;

    certifier
        .will_find(Some(CertificationResult {
            uuid: "5FB2822E-396D-4725-8521-CDC4BDD20CCF".into(),
            document: String::new(),
            certified_at: Utc::now(),
        }))
        .await;

    let outcome = engine.reconcile(&consolidation_id).await.unwrap();
    let invoice = match outcome {
        ReconciliationOutcome::Confirmed(RecordedDocument::Global(invoice)) => invoice,
        other => panic!("expected a confirmed global invoice, got {other:?}"),
    };

    assert_eq!(invoice.cfdi_uuid, "5FB2822E-396D-4725-8521-CDC4BDD20CCF");
    assert_eq!(invoice.folio, "000001");
    assert!(invoice.document.contains("\"Folio\":\"000001\""));
    assert_eq!(states(&engine, &["S-1", "S-2", "S-3"]).await, vec![BillingState::Invoiced; 3]);
    assert!(engine.pending_reconciliations().await.unwrap().is_empty());

    let err = engine.reconcile(&consolidation_id).await.unwrap_err();
    assert!(matches!(err, BillingError::ReconciliationNotFound(_)));
}

#[tokio::test]
async fn reconcile_releases_what_was_never_certified() {
    let certifier = ScriptedCertifier::with_steps(&[Step::Unknown]);
    let (engine, consolidation_id) = unconfirmed_run(&certifier).await;

    let outcome = engine.reconcile(&consolidation_id).await.unwrap();
    assert!(matches!(outcome, ReconciliationOutcome::Released { released: 3 }));
    assert_eq!(states(&engine, &["S-1", "S-2", "S-3"]).await, vec![BillingState::Open; 3]);

    let outcome = engine.generate_global_invoice(day(), as_of()).await.unwrap();
    assert_eq!(outcome.invoice.folio, "000002");
}

#[tokio::test]
async fn cancelled_run_parks_sales_for_reconciliation() {
    let certifier = ScriptedCertifier::with_steps(&[Step::Hang]);
    let engine = engine(certifier.clone()).await;
    three_sales(&engine).await;

    let run = engine.generate_global_invoice(day(), as_of());
    assert!(tokio::time::timeout(Duration::from_millis(200), run).await.is_err());

    let mut parked = false;
    for _ in 0..100 {
        if states(&engine, &["S-1", "S-2", "S-3"]).await == vec![BillingState::InvoicedUnconfirmed; 3] {
            parked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(parked, "sales were not parked after cancellation");
    assert_eq!(engine.pending_reconciliations().await.unwrap().len(), 1);
}

async fn wait_until_sent(certifier: &ScriptedCertifier) {
    for _ in 0..100 {
        if !certifier.sent().await.is_empty() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("nothing was sent for certification");
}

#[tokio::test]
async fn reconcile_leaves_a_run_in_flight_alone() {
    let certifier = ScriptedCertifier::with_steps(&[Step::Gated]);
    let engine = engine(certifier.clone()).await;
    three_sales(&engine).await;

    let first = engine.clone();
    let run = tokio::spawn(async move { first.generate_global_invoice(day(), as_of()).await });
    wait_until_sent(&certifier).await;

    assert!(engine.pending_reconciliations().await.unwrap().is_empty());
    let journal = engine.database().invoices().list_pending().await.unwrap();
    assert_eq!(journal.len(), 1);

    let err = engine.reconcile(&journal[0].consolidation_id).await.unwrap_err();
    assert!(matches!(err, BillingError::ReconciliationInFlight(ref id) if *id == journal[0].consolidation_id));
    assert_eq!(
        states(&engine, &["S-1", "S-2", "S-3"]).await,
        vec![BillingState::Certifying; 3]
    );

    certifier.open_gate();
    let outcome = run.await.unwrap().unwrap();
    assert_eq!(outcome.invoice.folio, "000001");
    assert_eq!(states(&engine, &["S-1", "S-2", "S-3"]).await, vec![BillingState::Invoiced; 3]);

    // nothing left to bill a second time
    let err = engine.generate_global_invoice(day(), as_of()).await.unwrap_err();
    assert!(err.is_empty_result());
    let globals = engine
        .database()
        .invoices()
        .list_global_invoices(day().start, day().end)
        .await
        .unwrap();
    assert_eq!(globals.len(), 1);
}

#[tokio::test]
async fn certified_run_that_lost_a_sale_is_parked() {
    let certifier = ScriptedCertifier::with_steps(&[Step::Gated]);
    let engine = engine(certifier.clone()).await;
    three_sales(&engine).await;

    let first = engine.clone();
    let run = tokio::spawn(async move { first.generate_global_invoice(day(), as_of()).await });
    wait_until_sent(&certifier).await;

    let journal = engine.database().invoices().list_pending().await.unwrap();
    let tag = journal[0].consolidation_id.clone();
    engine
        .database()
        .sales()
        .release_sales(&["S-2".to_string()], &tag)
        .await
        .unwrap();

    certifier.open_gate();
    let err = run.await.unwrap().unwrap_err();
    assert!(matches!(err, BillingError::PersistenceAfterCertification { .. }));
    assert!(err.needs_reconciliation());

    assert_eq!(
        states(&engine, &["S-1", "S-2", "S-3"]).await,
        vec![
            BillingState::InvoicedUnconfirmed,
            BillingState::Open,
            BillingState::InvoicedUnconfirmed
        ]
    );
    assert!(engine
        .database()
        .invoices()
        .list_global_invoices(day().start, day().end)
        .await
        .unwrap()
        .is_empty());
    assert!(engine.database().invoices().get_pending(&tag).await.unwrap().is_some());
}

// =============================================================================
// Individual invoice
// =============================================================================

#[tokio::test]
async fn single_sale_of_116_splits_into_100_and_16() {
    let certifier = ScriptedCertifier::with_steps(&[]);
    let engine = engine(certifier.clone()).await;
    add_sale(&engine, "S-1", 0, 11600, PaymentMethod::Transfer).await;

    let invoice = engine
        .invoice_sale("S-1", &Recipient::GeneralPublic, as_of())
        .await
        .unwrap();

    assert_eq!(invoice.series, "A");
    assert_eq!(invoice.folio, "000001");
    assert_eq!(invoice.subtotal_cents, 10000);
    assert_eq!(invoice.tax_cents, 1600);
    assert_eq!(invoice.total_cents, 11600);
    assert_eq!(invoice.sale_id, "S-1");

    let sale = engine.database().sales().get_by_id("S-1").await.unwrap().unwrap();
    assert_eq!(sale.billing_state, BillingState::Invoiced);
    assert_eq!(sale.invoice_id.as_deref(), Some(invoice.id.as_str()));

    // individual and global series count independently
    assert_eq!(engine.database().folios().current("G").await.unwrap(), None);
}

#[tokio::test]
async fn claimed_sale_cannot_be_invoiced_twice() {
    let certifier = ScriptedCertifier::with_steps(&[Step::Hang]);
    let engine = engine(certifier.clone()).await;
    add_sale(&engine, "S-1", 0, 11600, PaymentMethod::Cash).await;

    let first = engine.clone();
    let hung = tokio::spawn(async move {
        first
            .invoice_sale("S-1", &Recipient::GeneralPublic, as_of())
            .await
    });

    for _ in 0..100 {
        if !certifier.sent().await.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let err = engine
        .invoice_sale("S-1", &Recipient::GeneralPublic, as_of())
        .await
        .unwrap_err();
    assert!(matches!(err, BillingError::SaleNotBillable { .. }));

    hung.abort();
}

// =============================================================================
// Concurrency
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_runs_never_share_a_sale() {
    let certifier = ScriptedCertifier::with_steps(&[]);
    let engine = engine(certifier).await;
    for i in 0..20u32 {
        add_sale(&engine, &format!("S-{:02}", i), i, 1000 + i as i64, PaymentMethod::Cash).await;
    }

    let runs: Vec<_> = (0..4)
        .map(|_| {
            let engine = engine.clone();
            tokio::spawn(async move { engine.generate_global_invoice(day(), as_of()).await })
        })
        .collect();

    let mut covered = HashSet::new();
    let mut folios = HashSet::new();
    let mut invoiced = 0;
    for run in runs {
        match run.await.unwrap() {
            Ok(outcome) => {
                assert!(folios.insert(outcome.invoice.folio.clone()));
                for sale_id in outcome.invoice.sale_ids {
                    assert!(covered.insert(sale_id), "sale billed twice");
                    invoiced += 1;
                }
            }
            Err(err) => assert!(err.is_empty_result(), "unexpected error: {err}"),
        }
    }

    assert_eq!(invoiced, 20);
    let counts = engine.database().sales().state_counts().await.unwrap();
    assert_eq!(counts[&BillingState::Invoiced], 20);
    assert_eq!(counts[&BillingState::Open], 0);
}
