//! # Sale Repository
//!
//! The sales ledger as seen by the invoicing pipeline, and the claim guard
//! that keeps two consolidation runs from billing the same sale.
//!
//! ## Billing Transitions
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  claim_sales        open ─────────────────────────► claimed            │
//! │  begin_certifying   claimed ──────────────────────► certifying         │
//! │  mark_invoiced      certifying | unconfirmed ─────► invoiced           │
//! │  mark_unconfirmed   certifying ───────────────────► invoiced_unconfirmed│
//! │  release_sales      claimed | certifying ─────────► open               │
//! │  release_unconfirmed (journal)  unconfirmed ──────► open               │
//! │                                                                         │
//! │  Every transition after the claim is keyed by (id, claim_tag): a run   │
//! │  can only move sales it claimed itself.                                │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Claim Atomicity
//! The claim is one conditional `UPDATE … WHERE billing_state = 'open' …
//! RETURNING id`. There is no separate select: whatever the statement
//! returns is owned by the caller, whatever it does not return belongs to
//! somebody else.

use chrono::{DateTime, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

use crate::error::DbResult;
use fiscal_core::{BillingState, LineItem, PaymentMethod, Sale};

/// SQLite bind-parameter budget per statement, with headroom for the
/// non-list parameters.
const MAX_IDS_PER_STATEMENT: usize = 500;

const SALE_COLUMNS: &str = "id, client_id, created_at, total_cents, payment_method, \
     billing_state, claim_tag, invoice_id, global_invoice_id";

// =============================================================================
// Row Types
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct SaleRow {
    id: String,
    client_id: Option<String>,
    created_at: DateTime<Utc>,
    total_cents: i64,
    payment_method: PaymentMethod,
    billing_state: BillingState,
    claim_tag: Option<String>,
    invoice_id: Option<String>,
    global_invoice_id: Option<String>,
}

#[derive(Debug, sqlx::FromRow)]
struct ItemRow {
    sale_id: String,
    product_id: String,
    description: String,
    product_key: Option<String>,
    quantity: i64,
    unit_price_cents: i64,
    line_total_cents: i64,
}

impl SaleRow {
    fn into_sale(self, items: Vec<LineItem>) -> Sale {
        Sale {
            id: self.id,
            client_id: self.client_id,
            created_at: self.created_at,
            total_cents: self.total_cents,
            payment_method: self.payment_method,
            items,
            billing_state: self.billing_state,
            claim_tag: self.claim_tag,
            invoice_id: self.invoice_id,
            global_invoice_id: self.global_invoice_id,
        }
    }
}

impl From<ItemRow> for LineItem {
    fn from(row: ItemRow) -> Self {
        LineItem {
            product_id: row.product_id,
            description: row.description,
            product_key: row.product_key,
            quantity: row.quantity,
            unit_price_cents: row.unit_price_cents,
            line_total_cents: row.line_total_cents,
        }
    }
}

// =============================================================================
// Public Types
// =============================================================================

/// Result of a claim attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimOutcome {
    /// Sales now owned by the caller, in request order.
    pub claimed: Vec<String>,
    /// Sales that were not `open` (another run owns them, or they are
    /// already invoiced), in request order.
    pub already_claimed: Vec<String>,
}

impl ClaimOutcome {
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.claimed.is_empty()
    }
}

/// The document a sale ends up covered by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvoiceRef {
    Invoice(String),
    Global(String),
}

// =============================================================================
// Repository
// =============================================================================

/// Repository for sale database operations.
#[derive(Debug, Clone)]
pub struct SaleRepository {
    pool: SqlitePool,
}

impl SaleRepository {
    /// Creates a new SaleRepository.
    pub fn new(pool: SqlitePool) -> Self {
        SaleRepository { pool }
    }

    /// Inserts a completed sale and its items.
    pub async fn insert_sale(&self, sale: &Sale) -> DbResult<()> {
        debug!(id = %sale.id, total_cents = sale.total_cents, "Inserting sale");

        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO sales (
                id, client_id, created_at, total_cents, payment_method,
                billing_state, claim_tag, invoice_id, global_invoice_id, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
        )
        .bind(&sale.id)
        .bind(&sale.client_id)
        .bind(sale.created_at)
        .bind(sale.total_cents)
        .bind(sale.payment_method)
        .bind(sale.billing_state)
        .bind(&sale.claim_tag)
        .bind(&sale.invoice_id)
        .bind(&sale.global_invoice_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        for (position, item) in sale.items.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO sale_items (
                    sale_id, position, product_id, description, product_key,
                    quantity, unit_price_cents, line_total_cents
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                "#,
            )
            .bind(&sale.id)
            .bind(position as i64)
            .bind(&item.product_id)
            .bind(&item.description)
            .bind(&item.product_key)
            .bind(item.quantity)
            .bind(item.unit_price_cents)
            .bind(item.line_total_cents)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Gets a sale (with items) by ID.
    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Sale>> {
        let row: Option<SaleRow> =
            sqlx::query_as(&format!("SELECT {} FROM sales WHERE id = ?1", SALE_COLUMNS))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some(row) => Ok(self.attach_items(vec![row]).await?.pop()),
            None => Ok(None),
        }
    }

    /// Open sales created inside `[start, end)`, oldest first.
    pub async fn find_open_sales(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> DbResult<Vec<Sale>> {
        let rows: Vec<SaleRow> = sqlx::query_as(&format!(
            r#"
            SELECT {} FROM sales
            WHERE billing_state = 'open'
              AND julianday(created_at) >= julianday(?1)
              AND julianday(created_at) < julianday(?2)
            ORDER BY julianday(created_at), id
            "#,
            SALE_COLUMNS
        ))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        debug!(count = rows.len(), %start, %end, "Found open sales");
        self.attach_items(rows).await
    }

    /// Sales currently owned by a consolidation attempt.
    pub async fn find_by_claim(&self, tag: &str) -> DbResult<Vec<Sale>> {
        let rows: Vec<SaleRow> = sqlx::query_as(&format!(
            "SELECT {} FROM sales WHERE claim_tag = ?1 ORDER BY julianday(created_at), id",
            SALE_COLUMNS
        ))
        .bind(tag)
        .fetch_all(&self.pool)
        .await?;

        self.attach_items(rows).await
    }

    /// Atomically moves every `open` sale among `ids` to `claimed` under
    /// `tag`. Sales in any other state are reported back, not errored.
    pub async fn claim_sales(&self, ids: &[String], tag: &str) -> DbResult<ClaimOutcome> {
        if ids.is_empty() {
            return Ok(ClaimOutcome::default());
        }

        let now = Utc::now();
        let mut claimed = HashSet::with_capacity(ids.len());
        let mut tx = self.pool.begin().await?;

        for chunk in ids.chunks(MAX_IDS_PER_STATEMENT) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "UPDATE sales SET billing_state = 'claimed', claim_tag = ",
            );
            qb.push_bind(tag.to_string());
            qb.push(", updated_at = ");
            qb.push_bind(now);
            qb.push(" WHERE billing_state = 'open' AND id IN (");
            push_id_list(&mut qb, chunk);
            qb.push(") RETURNING id");

            let returned: Vec<String> = qb.build_query_scalar().fetch_all(&mut *tx).await?;
            claimed.extend(returned);
        }

        tx.commit().await?;

        let (claimed, already_claimed): (Vec<String>, Vec<String>) =
            ids.iter().cloned().partition(|id| claimed.contains(id));

        info!(
            claim_tag = %tag,
            claimed = claimed.len(),
            skipped = already_claimed.len(),
            "Claimed sales"
        );

        Ok(ClaimOutcome {
            claimed,
            already_claimed,
        })
    }

    /// Returns claimed or certifying sales owned by `tag` to `open`.
    pub async fn release_sales(&self, ids: &[String], tag: &str) -> DbResult<u64> {
        let mut conn = self.pool.acquire().await?;
        let released = transition(
            &mut conn,
            ids,
            tag,
            &[BillingState::Claimed, BillingState::Certifying],
            BillingState::Open,
            None,
        )
        .await?;

        info!(claim_tag = %tag, released, "Released sales");
        Ok(released)
    }

    /// `claimed → certifying` for sales owned by `tag`.
    pub async fn begin_certifying(&self, ids: &[String], tag: &str) -> DbResult<u64> {
        let mut conn = self.pool.acquire().await?;
        transition(
            &mut conn,
            ids,
            tag,
            &[BillingState::Claimed],
            BillingState::Certifying,
            None,
        )
        .await
    }

    /// `certifying → invoiced_unconfirmed` for sales owned by `tag`.
    pub async fn mark_unconfirmed(&self, ids: &[String], tag: &str) -> DbResult<u64> {
        let mut conn = self.pool.acquire().await?;
        let moved = transition(
            &mut conn,
            ids,
            tag,
            &[BillingState::Certifying],
            BillingState::InvoicedUnconfirmed,
            None,
        )
        .await?;

        warn!(claim_tag = %tag, moved, "Sales await reconciliation");
        Ok(moved)
    }

    /// Marks sales owned by `tag` as covered by `invoice`. Idempotent:
    /// sales already invoiced are left alone.
    pub async fn mark_invoiced(
        &self,
        ids: &[String],
        tag: &str,
        invoice: &InvoiceRef,
    ) -> DbResult<u64> {
        let mut conn = self.pool.acquire().await?;
        transition(
            &mut conn,
            ids,
            tag,
            &[BillingState::Certifying, BillingState::InvoicedUnconfirmed],
            BillingState::Invoiced,
            Some(invoice),
        )
        .await
    }

    /// Number of sales in each billing state (zero-filled).
    pub async fn state_counts(&self) -> DbResult<BTreeMap<BillingState, i64>> {
        let rows: Vec<(BillingState, i64)> =
            sqlx::query_as("SELECT billing_state, COUNT(*) FROM sales GROUP BY billing_state")
                .fetch_all(&self.pool)
                .await?;

        let mut counts: BTreeMap<BillingState, i64> =
            BillingState::ALL.iter().map(|s| (*s, 0)).collect();
        counts.extend(rows);
        Ok(counts)
    }

    /// Total number of sales.
    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sales")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn attach_items(&self, rows: Vec<SaleRow>) -> DbResult<Vec<Sale>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let mut items: HashMap<String, Vec<LineItem>> = HashMap::new();

        for chunk in ids.chunks(MAX_IDS_PER_STATEMENT) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "SELECT sale_id, product_id, description, product_key, quantity, \
                 unit_price_cents, line_total_cents FROM sale_items WHERE sale_id IN (",
            );
            push_id_list(&mut qb, chunk);
            qb.push(") ORDER BY sale_id, position");

            let chunk_rows: Vec<ItemRow> = qb.build_query_as().fetch_all(&self.pool).await?;
            for row in chunk_rows {
                items.entry(row.sale_id.clone()).or_default().push(row.into());
            }
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                let sale_items = items.remove(&row.id).unwrap_or_default();
                row.into_sale(sale_items)
            })
            .collect())
    }
}

// =============================================================================
// Shared Transition Helper
// =============================================================================

/// Moves sales owned by `tag` from any of `from` to `to`, returning how
/// many rows changed. Runs on the given connection so callers can compose
/// it into a larger transaction.
///
/// Moving to `open` clears the claim tag; moving to `invoiced` records the
/// covering document.
pub(crate) async fn transition(
    conn: &mut SqliteConnection,
    ids: &[String],
    tag: &str,
    from: &[BillingState],
    to: BillingState,
    invoice: Option<&InvoiceRef>,
) -> DbResult<u64> {
    if ids.is_empty() {
        return Ok(0);
    }

    let now = Utc::now();
    let mut changed = 0;

    for chunk in ids.chunks(MAX_IDS_PER_STATEMENT) {
        let mut qb = QueryBuilder::<Sqlite>::new("UPDATE sales SET billing_state = ");
        qb.push_bind(to);
        qb.push(", updated_at = ");
        qb.push_bind(now);

        if to == BillingState::Open {
            qb.push(", claim_tag = NULL");
        }
        match invoice {
            Some(InvoiceRef::Invoice(id)) => {
                qb.push(", invoice_id = ");
                qb.push_bind(id.clone());
            }
            Some(InvoiceRef::Global(id)) => {
                qb.push(", global_invoice_id = ");
                qb.push_bind(id.clone());
            }
            None => {}
        }

        qb.push(" WHERE claim_tag = ");
        qb.push_bind(tag.to_string());
        qb.push(" AND billing_state IN (");
        let mut states = qb.separated(", ");
        for state in from {
            states.push_bind(*state);
        }
        states.push_unseparated(") AND id IN (");
        push_id_list(&mut qb, chunk);
        qb.push(")");

        changed += qb.build().execute(&mut *conn).await?.rows_affected();
    }

    debug!(claim_tag = %tag, to = %to, changed, "Sale transition");
    Ok(changed)
}

/// How many of `ids` are `invoiced` and covered by `invoice`.
pub(crate) async fn count_covered(
    conn: &mut SqliteConnection,
    ids: &[String],
    invoice: &InvoiceRef,
) -> DbResult<u64> {
    let (column, invoice_id) = match invoice {
        InvoiceRef::Invoice(id) => ("invoice_id", id),
        InvoiceRef::Global(id) => ("global_invoice_id", id),
    };

    let mut covered = 0;
    for chunk in ids.chunks(MAX_IDS_PER_STATEMENT) {
        let mut qb = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM sales WHERE billing_state = ");
        qb.push_bind(BillingState::Invoiced);
        qb.push(format!(" AND {} = ", column));
        qb.push_bind(invoice_id.clone());
        qb.push(" AND id IN (");
        push_id_list(&mut qb, chunk);
        qb.push(")");

        let count: i64 = qb.build_query_scalar().fetch_one(&mut *conn).await?;
        covered += count as u64;
    }

    Ok(covered)
}

fn push_id_list(qb: &mut QueryBuilder<'_, Sqlite>, ids: &[String]) {
    let mut list = qb.separated(", ");
    for id in ids {
        list.push_bind(id.clone());
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
