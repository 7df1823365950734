//! # Invoice Repository
//!
//! Certified documents and the certification journal.
//!
//! ## Journal Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  begin_certification        pending row written, sales → certifying    │
//! │        │                    (one transaction, before anything is sent) │
//! │        ▼                                                                │
//! │  ── payload goes to the certification authority ──                      │
//! │        │                                                                │
//! │        ├─ certified ──► record_global_invoice / record_invoice          │
//! │        │                document stored, sales → invoiced,              │
//! │        │                pending row deleted (one transaction)           │
//! │        │                                                                │
//! │        ├─ rejected ───► abandon_certification                           │
//! │        │                pending row deleted, sales → open               │
//! │        │                                                                │
//! │        └─ unknown ────► row stays; sales → invoiced_unconfirmed         │
//! │                         until a reconciliation records the document     │
//! │                         or calls release_unconfirmed                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The consolidation id doubles as the claim tag on the covered sales.
//!
//! Recording is idempotent on the certification UUID: repeating it after a
//! crash finds the stored document and finishes the sale transitions.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::{debug, info};

use super::new_id;
use super::sale::{count_covered, transition, InvoiceRef};
use crate::error::{DbError, DbResult};
use fiscal_core::{BillingState, GlobalInvoice, Invoice};

const INVOICE_COLUMNS: &str = "id, sale_id, series, folio, cfdi_uuid, document, recipient_rfc, \
     subtotal_cents, tax_cents, total_cents, issued_at, certified_at";

const GLOBAL_COLUMNS: &str = "id, series, folio, period_start, period_end, subtotal_cents, \
     tax_cents, total_cents, cfdi_uuid, document, sale_ids, issued_at, certified_at";

const PENDING_COLUMNS: &str = "consolidation_id, kind, series, folio, payload, sale_ids, \
     recipient_rfc, subtotal_cents, tax_cents, total_cents, period_start, period_end, issued_at";

// =============================================================================
// Public Types
// =============================================================================

/// Which kind of document a journal entry will become.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum CertificationKind {
    Invoice,
    GlobalInvoice,
}

/// A document composed, numbered and about to be (or possibly already)
/// certified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCertification {
    pub consolidation_id: String,
    pub kind: CertificationKind,
    pub series: String,
    pub folio: String,
    /// Serialized payload exactly as sent.
    pub payload: String,
    pub sale_ids: Vec<String>,
    pub recipient_rfc: String,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub total_cents: i64,
    pub period_start: Option<DateTime<Utc>>,
    pub period_end: Option<DateTime<Utc>>,
    pub issued_at: DateTime<Utc>,
}

/// What the authority handed back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertifiedDocument {
    pub uuid: String,
    pub document: String,
    pub certified_at: DateTime<Utc>,
}

// =============================================================================
// Row Types
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct InvoiceRow {
    id: String,
    sale_id: String,
    series: String,
    folio: String,
    cfdi_uuid: String,
    document: String,
    recipient_rfc: String,
    subtotal_cents: i64,
    tax_cents: i64,
    total_cents: i64,
    issued_at: DateTime<Utc>,
    certified_at: DateTime<Utc>,
}

impl From<InvoiceRow> for Invoice {
    fn from(row: InvoiceRow) -> Self {
        Invoice {
            id: row.id,
            sale_id: row.sale_id,
            series: row.series,
            folio: row.folio,
            cfdi_uuid: row.cfdi_uuid,
            document: row.document,
            recipient_rfc: row.recipient_rfc,
            subtotal_cents: row.subtotal_cents,
            tax_cents: row.tax_cents,
            total_cents: row.total_cents,
            issued_at: row.issued_at,
            certified_at: row.certified_at,
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct GlobalInvoiceRow {
    id: String,
    series: String,
    folio: String,
    period_start: DateTime<Utc>,
    period_end: DateTime<Utc>,
    subtotal_cents: i64,
    tax_cents: i64,
    total_cents: i64,
    cfdi_uuid: String,
    document: String,
    sale_ids: String,
    issued_at: DateTime<Utc>,
    certified_at: DateTime<Utc>,
}

impl TryFrom<GlobalInvoiceRow> for GlobalInvoice {
    type Error = DbError;

    fn try_from(row: GlobalInvoiceRow) -> DbResult<Self> {
        Ok(GlobalInvoice {
            sale_ids: serde_json::from_str(&row.sale_ids)?,
            id: row.id,
            series: row.series,
            folio: row.folio,
            period_start: row.period_start,
            period_end: row.period_end,
            subtotal_cents: row.subtotal_cents,
            tax_cents: row.tax_cents,
            total_cents: row.total_cents,
            cfdi_uuid: row.cfdi_uuid,
            document: row.document,
            issued_at: row.issued_at,
            certified_at: row.certified_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct PendingRow {
    consolidation_id: String,
    kind: CertificationKind,
    series: String,
    folio: String,
    payload: String,
    sale_ids: String,
    recipient_rfc: String,
    subtotal_cents: i64,
    tax_cents: i64,
    total_cents: i64,
    period_start: Option<DateTime<Utc>>,
    period_end: Option<DateTime<Utc>>,
    issued_at: DateTime<Utc>,
}

impl TryFrom<PendingRow> for PendingCertification {
    type Error = DbError;

    fn try_from(row: PendingRow) -> DbResult<Self> {
        Ok(PendingCertification {
            sale_ids: serde_json::from_str(&row.sale_ids)?,
            consolidation_id: row.consolidation_id,
            kind: row.kind,
            series: row.series,
            folio: row.folio,
            payload: row.payload,
            recipient_rfc: row.recipient_rfc,
            subtotal_cents: row.subtotal_cents,
            tax_cents: row.tax_cents,
            total_cents: row.total_cents,
            period_start: row.period_start,
            period_end: row.period_end,
            issued_at: row.issued_at,
        })
    }
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for certified documents and the certification journal.
#[derive(Debug, Clone)]
pub struct InvoiceRepository {
    pool: SqlitePool,
}

impl InvoiceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        InvoiceRepository { pool }
    }

    // =========================================================================
    // Journal
    // =========================================================================

    /// Journals `pending` and moves its sales from `claimed` to
    /// `certifying`, atomically. Fails without side effects if any sale is
    /// no longer claimed by this consolidation.
    pub async fn begin_certification(&self, pending: &PendingCertification) -> DbResult<()> {
        let tag = &pending.consolidation_id;
        debug!(
            consolidation_id = %tag,
            series = %pending.series,
            folio = %pending.folio,
            "Journaling certification"
        );

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO pending_certifications (
                consolidation_id, kind, series, folio, payload, sale_ids,
                recipient_rfc, subtotal_cents, tax_cents, total_cents,
                period_start, period_end, issued_at, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            "#,
        )
        .bind(tag)
        .bind(pending.kind)
        .bind(&pending.series)
        .bind(&pending.folio)
        .bind(&pending.payload)
        .bind(serde_json::to_string(&pending.sale_ids)?)
        .bind(&pending.recipient_rfc)
        .bind(pending.subtotal_cents)
        .bind(pending.tax_cents)
        .bind(pending.total_cents)
        .bind(pending.period_start)
        .bind(pending.period_end)
        .bind(pending.issued_at)
        .bind(Utc::now())
        .execute(&mut *tx)
        .await?;

        let moved = transition(
            &mut tx,
            &pending.sale_ids,
            tag,
            &[BillingState::Claimed],
            BillingState::Certifying,
            None,
        )
        .await?;

        if moved != pending.sale_ids.len() as u64 {
            // dropping the transaction rolls the journal entry back
            return Err(DbError::InvalidState {
                entity: "Consolidation".to_string(),
                id: tag.clone(),
                state: format!("holding {} of {} sales", moved, pending.sale_ids.len()),
            });
        }

        tx.commit().await?;
        Ok(())
    }

    /// Journal entry for a consolidation, if it is still unresolved.
    pub async fn get_pending(&self, consolidation_id: &str) -> DbResult<Option<PendingCertification>> {
        let row: Option<PendingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM pending_certifications WHERE consolidation_id = ?1",
            PENDING_COLUMNS
        ))
        .bind(consolidation_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(PendingCertification::try_from).transpose()
    }

    /// Every unresolved journal entry, oldest first.
    pub async fn list_pending(&self) -> DbResult<Vec<PendingCertification>> {
        let rows: Vec<PendingRow> = sqlx::query_as(&format!(
            "SELECT {} FROM pending_certifications ORDER BY created_at, consolidation_id",
            PENDING_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PendingCertification::try_from).collect()
    }

    /// Journal entries whose run has finished without an answer: every
    /// covered sale is `invoiced_unconfirmed`. Entries of runs still in
    /// flight are left out. Oldest first.
    pub async fn list_unconfirmed(&self) -> DbResult<Vec<PendingCertification>> {
        let rows: Vec<PendingRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM pending_certifications p
            WHERE EXISTS (
                SELECT 1 FROM sales s
                WHERE s.claim_tag = p.consolidation_id
                  AND s.billing_state = 'invoiced_unconfirmed'
            )
            AND NOT EXISTS (
                SELECT 1 FROM sales s
                WHERE s.claim_tag = p.consolidation_id
                  AND s.billing_state <> 'invoiced_unconfirmed'
            )
            ORDER BY p.created_at, p.consolidation_id
            "#,
            PENDING_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(PendingCertification::try_from).collect()
    }

    /// Drops the journal entry of a run that gave up before an answer
    /// (rejection, exhausted retries, cancellation before sending) and
    /// returns its `claimed`/`certifying` sales to `open`. Only the owning
    /// run calls this. Returns how many sales were released.
    pub async fn abandon_certification(&self, consolidation_id: &str) -> DbResult<u64> {
        let pending = self
            .get_pending(consolidation_id)
            .await?
            .ok_or_else(|| DbError::not_found("Pending certification", consolidation_id))?;

        let mut tx = self.pool.begin().await?;
        delete_pending(&mut tx, consolidation_id).await?;
        let released = transition(
            &mut tx,
            &pending.sale_ids,
            consolidation_id,
            &[BillingState::Claimed, BillingState::Certifying],
            BillingState::Open,
            None,
        )
        .await?;
        tx.commit().await?;

        info!(consolidation_id = %consolidation_id, released, "Certification abandoned");
        Ok(released)
    }

    /// Settles an unconfirmed certification the authority never issued:
    /// drops the journal entry and reopens its sales. Fails without side
    /// effects unless every covered sale is `invoiced_unconfirmed`, so a run
    /// still waiting on the authority keeps its sales.
    pub async fn release_unconfirmed(&self, consolidation_id: &str) -> DbResult<u64> {
        let pending = self
            .get_pending(consolidation_id)
            .await?
            .ok_or_else(|| DbError::not_found("Pending certification", consolidation_id))?;

        let mut tx = self.pool.begin().await?;
        delete_pending(&mut tx, consolidation_id).await?;
        let released = transition(
            &mut tx,
            &pending.sale_ids,
            consolidation_id,
            &[BillingState::InvoicedUnconfirmed],
            BillingState::Open,
            None,
        )
        .await?;

        if released != pending.sale_ids.len() as u64 {
            return Err(DbError::InvalidState {
                entity: "Consolidation".to_string(),
                id: consolidation_id.to_string(),
                state: format!(
                    "awaiting an answer for {} of {} sales",
                    released,
                    pending.sale_ids.len()
                ),
            });
        }

        tx.commit().await?;

        info!(consolidation_id = %consolidation_id, released, "Unconfirmed certification released");
        Ok(released)
    }

    // =========================================================================
    // Recording
    // =========================================================================

    /// Stores a certified global invoice, marks its sales invoiced and
    /// clears the journal entry.
    pub async fn record_global_invoice(
        &self,
        pending: &PendingCertification,
        certified: &CertifiedDocument,
    ) -> DbResult<GlobalInvoice> {
        let (period_start, period_end) = match (pending.period_start, pending.period_end) {
            (Some(start), Some(end)) => (start, end),
            _ => {
                return Err(DbError::InvalidState {
                    entity: "Consolidation".to_string(),
                    id: pending.consolidation_id.clone(),
                    state: "missing its period".to_string(),
                })
            }
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO global_invoices (
                id, series, folio, period_start, period_end, subtotal_cents,
                tax_cents, total_cents, cfdi_uuid, document, sale_ids,
                issued_at, certified_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT (cfdi_uuid) DO NOTHING
            "#,
        )
        .bind(new_id())
        .bind(&pending.series)
        .bind(&pending.folio)
        .bind(period_start)
        .bind(period_end)
        .bind(pending.subtotal_cents)
        .bind(pending.tax_cents)
        .bind(pending.total_cents)
        .bind(&certified.uuid)
        .bind(&certified.document)
        .bind(serde_json::to_string(&pending.sale_ids)?)
        .bind(pending.issued_at)
        .bind(certified.certified_at)
        .execute(&mut *tx)
        .await?;

        let id: String = sqlx::query_scalar("SELECT id FROM global_invoices WHERE cfdi_uuid = ?1")
            .bind(&certified.uuid)
            .fetch_one(&mut *tx)
            .await?;

        settle_sales(&mut tx, pending, InvoiceRef::Global(id.clone())).await?;
        tx.commit().await?;

        info!(
            id = %id,
            uuid = %certified.uuid,
            series = %pending.series,
            folio = %pending.folio,
            "Global invoice recorded"
        );

        self.get_global_invoice(&id)
            .await?
            .ok_or_else(|| DbError::not_found("Global invoice", id))
    }

    /// Stores a certified single-sale invoice, marks the sale invoiced and
    /// clears the journal entry.
    pub async fn record_invoice(
        &self,
        pending: &PendingCertification,
        certified: &CertifiedDocument,
    ) -> DbResult<Invoice> {
        let sale_id = match pending.sale_ids.as_slice() {
            [only] => only.clone(),
            other => {
                return Err(DbError::InvalidState {
                    entity: "Consolidation".to_string(),
                    id: pending.consolidation_id.clone(),
                    state: format!("covering {} sales", other.len()),
                })
            }
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO invoices (
                id, sale_id, series, folio, cfdi_uuid, document, recipient_rfc,
                subtotal_cents, tax_cents, total_cents, issued_at, certified_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT (cfdi_uuid) DO NOTHING
            "#,
        )
        .bind(new_id())
        .bind(&sale_id)
        .bind(&pending.series)
        .bind(&pending.folio)
        .bind(&certified.uuid)
        .bind(&certified.document)
        .bind(&pending.recipient_rfc)
        .bind(pending.subtotal_cents)
        .bind(pending.tax_cents)
        .bind(pending.total_cents)
        .bind(pending.issued_at)
        .bind(certified.certified_at)
        .execute(&mut *tx)
        .await?;

        let id: String = sqlx::query_scalar("SELECT id FROM invoices WHERE cfdi_uuid = ?1")
            .bind(&certified.uuid)
            .fetch_one(&mut *tx)
            .await?;

        settle_sales(&mut tx, pending, InvoiceRef::Invoice(id.clone())).await?;
        tx.commit().await?;

        info!(id = %id, uuid = %certified.uuid, sale_id = %sale_id, "Invoice recorded");

        self.get_invoice(&id)
            .await?
            .ok_or_else(|| DbError::not_found("Invoice", id))
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn get_global_invoice(&self, id: &str) -> DbResult<Option<GlobalInvoice>> {
        let row: Option<GlobalInvoiceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM global_invoices WHERE id = ?1",
            GLOBAL_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(GlobalInvoice::try_from).transpose()
    }

    /// Global invoices issued inside `[start, end)`, in folio order.
    pub async fn list_global_invoices(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<Vec<GlobalInvoice>> {
        let rows: Vec<GlobalInvoiceRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM global_invoices
            WHERE julianday(issued_at) >= julianday(?1)
              AND julianday(issued_at) < julianday(?2)
            ORDER BY series, folio
            "#,
            GLOBAL_COLUMNS
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(GlobalInvoice::try_from).collect()
    }

    pub async fn get_invoice(&self, id: &str) -> DbResult<Option<Invoice>> {
        let row: Option<InvoiceRow> =
            sqlx::query_as(&format!("SELECT {} FROM invoices WHERE id = ?1", INVOICE_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(Invoice::from))
    }

    pub async fn get_invoice_for_sale(&self, sale_id: &str) -> DbResult<Option<Invoice>> {
        let row: Option<InvoiceRow> = sqlx::query_as(&format!(
            "SELECT {} FROM invoices WHERE sale_id = ?1",
            INVOICE_COLUMNS
        ))
        .bind(sale_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Invoice::from))
    }

    /// Individual invoices issued inside `[start, end)`, in folio order.
    pub async fn list_invoices(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<Vec<Invoice>> {
        let rows: Vec<InvoiceRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM invoices
            WHERE julianday(issued_at) >= julianday(?1)
              AND julianday(issued_at) < julianday(?2)
            ORDER BY series, folio
            "#,
            INVOICE_COLUMNS
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Invoice::from).collect())
    }
}

async fn settle_sales(
    conn: &mut SqliteConnection,
    pending: &PendingCertification,
    invoice: InvoiceRef,
) -> DbResult<()> {
    let settled = transition(
        conn,
        &pending.sale_ids,
        &pending.consolidation_id,
        &[BillingState::Certifying, BillingState::InvoicedUnconfirmed],
        BillingState::Invoiced,
        Some(&invoice),
    )
    .await?;

    // a repeated record finds them already invoiced by this same document
    let covered = count_covered(conn, &pending.sale_ids, &invoice).await?;
    if covered != pending.sale_ids.len() as u64 {
        return Err(DbError::InvalidState {
            entity: "Consolidation".to_string(),
            id: pending.consolidation_id.clone(),
            state: format!(
                "covering {} of {} sales ({} settled now)",
                covered,
                pending.sale_ids.len(),
                settled
            ),
        });
    }

    delete_pending(conn, &pending.consolidation_id).await
}

async fn delete_pending(conn: &mut SqliteConnection, consolidation_id: &str) -> DbResult<()> {
    sqlx::query("DELETE FROM pending_certifications WHERE consolidation_id = ?1")
        .bind(consolidation_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;
    use chrono::TimeZone;
    use fiscal_core::{LineItem, PaymentMethod, Sale};

    fn at(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, hour, 0, 0).unwrap()
    }

    fn sale(id: &str) -> Sale {
        Sale {
            id: id.to_string(),
            client_id: None,
            created_at: at(10),
            total_cents: 11600,
            payment_method: PaymentMethod::Card,
            items: vec![LineItem {
                product_id: "P-7".to_string(),
                description: "Pan dulce".to_string(),
                product_key: None,
                quantity: 1,
                unit_price_cents: 11600,
                line_total_cents: 11600,
            }],
            billing_state: BillingState::Open,
            claim_tag: None,
            invoice_id: None,
            global_invoice_id: None,
        }
    }

    fn pending(tag: &str, kind: CertificationKind, sale_ids: &[&str]) -> PendingCertification {
        let n = sale_ids.len() as i64;
        PendingCertification {
            consolidation_id: tag.to_string(),
            kind,
            series: "G".to_string(),
            folio: "000001".to_string(),
            payload: "{}".to_string(),
            sale_ids: sale_ids.iter().map(|s| s.to_string()).collect(),
            recipient_rfc: "XAXX010101000".to_string(),
            subtotal_cents: 10000 * n,
            tax_cents: 1600 * n,
            total_cents: 11600 * n,
            period_start: Some(at(0)),
            period_end: Some(at(23)),
            issued_at: at(23),
        }
    }

    fn certified(uuid: &str) -> CertifiedDocument {
        CertifiedDocument {
            uuid: uuid.to_string(),
            document: "<cfdi/>".to_string(),
            certified_at: at(23),
        }
    }

    async fn claimed(tag: &str, ids: &[&str]) -> Database {
        let db = Database::in_memory().await.unwrap();
        for id in ids {
            db.sales().insert_sale(&sale(id)).await.unwrap();
        }
        let ids: Vec<String> = ids.iter().map(|s| s.to_string()).collect();
        db.sales().claim_sales(&ids, tag).await.unwrap();
        db
    }

    #[tokio::test]
    async fn test_record_global_invoice() {
        let db = claimed("c-1", &["S-1", "S-2"]).await;
        let repo = db.invoices();
        let entry = pending("c-1", CertificationKind::GlobalInvoice, &["S-1", "S-2"]);

        repo.begin_certification(&entry).await.unwrap();
        assert_eq!(repo.list_pending().await.unwrap(), vec![entry.clone()]);
        let sale = db.sales().get_by_id("S-1").await.unwrap().unwrap();
        assert_eq!(sale.billing_state, BillingState::Certifying);

        let invoice = repo.record_global_invoice(&entry, &certified("UUID-1")).await.unwrap();
        assert_eq!(invoice.folio, "000001");
        assert_eq!(invoice.total_cents, 23200);
        assert_eq!(invoice.sale_ids, vec!["S-1", "S-2"]);
        assert!(repo.get_pending("c-1").await.unwrap().is_none());

        let sale = db.sales().get_by_id("S-2").await.unwrap().unwrap();
        assert_eq!(sale.billing_state, BillingState::Invoiced);
        assert_eq!(sale.global_invoice_id.as_deref(), Some(invoice.id.as_str()));

        let listed = repo
            .list_global_invoices(at(0), at(23) + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_record_is_idempotent() {
        let db = claimed("c-1", &["S-1"]).await;
        let repo = db.invoices();
        let entry = pending("c-1", CertificationKind::GlobalInvoice, &["S-1"]);

        repo.begin_certification(&entry).await.unwrap();
        let first = repo.record_global_invoice(&entry, &certified("UUID-1")).await.unwrap();
        let second = repo.record_global_invoice(&entry, &certified("UUID-1")).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn test_begin_requires_every_sale_claimed() {
        let db = claimed("c-1", &["S-1"]).await;
        db.sales().insert_sale(&sale("S-2")).await.unwrap();
        let repo = db.invoices();

        let entry = pending("c-1", CertificationKind::GlobalInvoice, &["S-1", "S-2"]);
        let err = repo.begin_certification(&entry).await.unwrap_err();
        assert!(matches!(err, DbError::InvalidState { .. }));

        // rolled back: no journal entry, S-1 still merely claimed
        assert!(repo.get_pending("c-1").await.unwrap().is_none());
        let s1 = db.sales().get_by_id("S-1").await.unwrap().unwrap();
        assert_eq!(s1.billing_state, BillingState::Claimed);
    }

    #[tokio::test]
    async fn test_abandon_releases_sales() {
        let db = claimed("c-1", &["S-1", "S-2"]).await;
        let repo = db.invoices();
        let entry = pending("c-1", CertificationKind::GlobalInvoice, &["S-1", "S-2"]);

        repo.begin_certification(&entry).await.unwrap();
        assert_eq!(repo.abandon_certification("c-1").await.unwrap(), 2);
        assert!(repo.list_pending().await.unwrap().is_empty());

        let open = db.sales().find_open_sales(at(0), at(23)).await.unwrap();
        assert_eq!(open.len(), 2);

        let err = repo.abandon_certification("c-1").await.unwrap_err();
        assert!(matches!(err, DbError::NotFound { .. }));
    }

    #[tokio::test]
    async fn test_release_unconfirmed() {
        let db = claimed("c-1", &["S-1", "S-2"]).await;
        let repo = db.invoices();
        let entry = pending("c-1", CertificationKind::GlobalInvoice, &["S-1", "S-2"]);

        repo.begin_certification(&entry).await.unwrap();
        db.sales()
            .mark_unconfirmed(&entry.sale_ids, "c-1")
            .await
            .unwrap();
        assert_eq!(repo.list_unconfirmed().await.unwrap(), vec![entry.clone()]);

        assert_eq!(repo.release_unconfirmed("c-1").await.unwrap(), 2);
        assert!(repo.list_pending().await.unwrap().is_empty());
        assert!(repo.list_unconfirmed().await.unwrap().is_empty());

        let open = db.sales().find_open_sales(at(0), at(23)).await.unwrap();
        assert_eq!(open.len(), 2);
    }

    #[tokio::test]
    async fn test_in_flight_run_is_not_unconfirmed() {
        let db = claimed("c-1", &["S-1"]).await;
        let repo = db.invoices();
        let entry = pending("c-1", CertificationKind::GlobalInvoice, &["S-1"]);

        repo.begin_certification(&entry).await.unwrap();
        assert_eq!(repo.list_pending().await.unwrap().len(), 1);
        assert!(repo.list_unconfirmed().await.unwrap().is_empty());

        let err = repo.release_unconfirmed("c-1").await.unwrap_err();
        assert!(matches!(err, DbError::InvalidState { .. }));

        // rolled back: the run still owns its sale and its journal entry
        assert!(repo.get_pending("c-1").await.unwrap().is_some());
        let sale = db.sales().get_by_id("S-1").await.unwrap().unwrap();
        assert_eq!(sale.billing_state, BillingState::Certifying);
        assert_eq!(sale.claim_tag.as_deref(), Some("c-1"));
    }

    #[tokio::test]
    async fn test_record_fails_when_a_sale_lost_its_claim() {
        let db = claimed("c-1", &["S-1", "S-2"]).await;
        let repo = db.invoices();
        let entry = pending("c-1", CertificationKind::GlobalInvoice, &["S-1", "S-2"]);

        repo.begin_certification(&entry).await.unwrap();
        db.sales()
            .release_sales(&["S-2".to_string()], "c-1")
            .await
            .unwrap();

        let err = repo
            .record_global_invoice(&entry, &certified("UUID-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidState { .. }));

        // nothing stored, nothing settled
        let listed = repo
            .list_global_invoices(at(0), at(23) + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(listed.is_empty());
        assert!(repo.get_pending("c-1").await.unwrap().is_some());
        let s1 = db.sales().get_by_id("S-1").await.unwrap().unwrap();
        assert_eq!(s1.billing_state, BillingState::Certifying);
        assert_eq!(s1.global_invoice_id, None);
    }

    #[tokio::test]
    async fn test_record_individual_invoice() {
        let db = claimed("c-9", &["S-1"]).await;
        let repo = db.invoices();
        let mut entry = pending("c-9", CertificationKind::Invoice, &["S-1"]);
        entry.series = "A".to_string();
        entry.recipient_rfc = "XEXX010101000".to_string();
        entry.period_start = None;
        entry.period_end = None;

        repo.begin_certification(&entry).await.unwrap();
        let invoice = repo.record_invoice(&entry, &certified("UUID-9")).await.unwrap();
        assert_eq!(invoice.sale_id, "S-1");
        assert_eq!(invoice.subtotal_cents, 10000);
        assert_eq!(invoice.tax_cents, 1600);

        let found = repo.get_invoice_for_sale("S-1").await.unwrap().unwrap();
        assert_eq!(found.id, invoice.id);
        let sale = db.sales().get_by_id("S-1").await.unwrap().unwrap();
        assert_eq!(sale.invoice_id.as_deref(), Some(invoice.id.as_str()));

        let listed = repo.list_invoices(at(0), at(23) + chrono::Duration::hours(1)).await.unwrap();
        assert_eq!(listed.len(), 1);
    }

    #[tokio::test]
    async fn test_individual_invoice_needs_one_sale() {
        let db = claimed("c-1", &["S-1", "S-2"]).await;
        let entry = pending("c-1", CertificationKind::Invoice, &["S-1", "S-2"]);
        let err = db
            .invoices()
            .record_invoice(&entry, &certified("UUID-1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::InvalidState { .. }));
    }
}
