//! # Fiscal Back Office CLI
//!
//! Closes the day into a global invoice, invoices single sales for
//! registered clients, and settles certifications whose outcome was lost.
//!
//! ## Usage
//! ```bash
//! # Global invoice for today's open sales (UTC)
//! back-office global
//!
//! # Global invoice for an explicit half-open range
//! back-office global --start 2026-10-01 --end 2026-10-08
//!
//! # Single-sale invoice, to a registered client or the general public
//! back-office invoice --sale 7f0c... --client AES010101AB1
//!
//! # Settle unconfirmed certifications (all, or one)
//! back-office reconcile [--id <consolidation id>]
//!
//! back-office list --start 2026-10-01 --end 2026-11-01
//! back-office status
//! ```
//!
//! Global options: `--config <PATH>` (default: platform config dir
//! `billing.toml`), `--db <PATH>` (overrides `[database] path`).

use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use fiscal_billing::{BillingConfig, ConsolidationEngine, ReconciliationOutcome, RecordedDocument};
use fiscal_core::{BillingState, Money, Period, PeriodSummary, Recipient};
use fiscal_db::{Database, DbConfig};
use std::env;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

// =============================================================================
// Arguments
// =============================================================================

#[derive(Debug, PartialEq)]
enum Command {
    Global { period: Period },
    Invoice { sale_id: String, client_rfc: Option<String> },
    Reconcile { consolidation_id: Option<String> },
    List { period: Period },
    Status,
    Help,
}

#[derive(Debug, PartialEq)]
struct Cli {
    config: Option<PathBuf>,
    db: Option<PathBuf>,
    command: Command,
}

fn parse_args(args: &[String], today: NaiveDate) -> Result<Cli> {
    let mut config = None;
    let mut db = None;
    let mut command_name = None;
    let mut start = None;
    let mut end = None;
    let mut sale_id = None;
    let mut client_rfc = None;
    let mut consolidation_id = None;

    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        let mut value = || -> Result<String> {
            i += 1;
            args.get(i)
                .cloned()
                .ok_or_else(|| anyhow!("{} needs a value", flag))
        };

        match flag {
            "--config" => config = Some(PathBuf::from(value()?)),
            "--db" | "-d" => db = Some(PathBuf::from(value()?)),
            "--start" => start = Some(parse_instant(&value()?)?),
            "--end" => end = Some(parse_instant(&value()?)?),
            "--sale" => sale_id = Some(value()?),
            "--client" => client_rfc = Some(value()?),
            "--id" => consolidation_id = Some(value()?),
            "--help" | "-h" => command_name = Some("help".to_string()),
            other if other.starts_with('-') => bail!("unknown option {}", other),
            other => {
                if command_name.is_some() {
                    bail!("unexpected argument {}", other);
                }
                command_name = Some(other.to_string());
            }
        }
        i += 1;
    }

    let period = || -> Result<Period> {
        let start = start.unwrap_or_else(|| midnight(today));
        let end = end.unwrap_or_else(|| start + chrono::Duration::days(1));
        Ok(Period::new(start, end)?)
    };

    let command = match command_name.as_deref() {
        Some("global") => Command::Global { period: period()? },
        Some("invoice") => Command::Invoice {
            sale_id: sale_id.ok_or_else(|| anyhow!("invoice needs --sale <ID>"))?,
            client_rfc,
        },
        Some("reconcile") => Command::Reconcile { consolidation_id },
        Some("list") => Command::List { period: period()? },
        Some("status") => Command::Status,
        Some("help") | None => Command::Help,
        Some(other) => bail!("unknown command {}", other),
    };

    Ok(Cli { config, db, command })
}

/// Accepts `YYYY-MM-DD` (midnight UTC) or an RFC 3339 timestamp.
fn parse_instant(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(at) = DateTime::parse_from_rfc3339(raw) {
        return Ok(at.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("invalid date {:?}, expected YYYY-MM-DD", raw))?;
    Ok(midnight(date))
}

fn midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(chrono::NaiveTime::MIN).and_utc()
}

const USAGE: &str = "\
Fiscal Back Office

Usage: back-office [--config PATH] [--db PATH] <COMMAND>

Commands:
  global     [--start DATE] [--end DATE]   Certify one global invoice (default: today)
  invoice    --sale ID [--client RFC]      Certify an invoice for one sale
  reconcile  [--id ID]                     Settle unconfirmed certifications
  list       [--start DATE] [--end DATE]   List invoices issued in the range
  status                                   Sale counts per billing state

Environment: FISCAL_PAC_URL, FISCAL_PAC_TOKEN, FISCAL_ISSUER_RFC, FISCAL_ISSUER_NAME,
             FISCAL_ISSUER_REGIME, FISCAL_EXPEDITION_CP, FISCAL_SANDBOX, FISCAL_TAX_RATE,
             FISCAL_DB_PATH, RUST_LOG";

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let args: Vec<String> = env::args().skip(1).collect();
    let cli = parse_args(&args, Utc::now().date_naive())?;

    if cli.command == Command::Help {
        println!("{}", USAGE);
        return Ok(());
    }

    let mut config = BillingConfig::load(cli.config).context("loading billing configuration")?;
    if let Some(path) = cli.db {
        config.database.path = path;
    }

    let db = Database::new(
        DbConfig::new(&config.database.path).max_connections(config.database.max_connections),
    )
    .await
    .context("opening database")?;

    let engine = ConsolidationEngine::from_config(&config, db)?;
    info!(sandbox = config.pac.sandbox, "Back office ready");

    match cli.command {
        Command::Global { period } => run_global(&engine, period).await,
        Command::Invoice { sale_id, client_rfc } => {
            run_invoice(&engine, &sale_id, client_rfc.as_deref()).await
        }
        Command::Reconcile { consolidation_id } => {
            run_reconcile(&engine, consolidation_id.as_deref()).await
        }
        Command::List { period } => run_list(&engine, period).await,
        Command::Status => run_status(&engine).await,
        Command::Help => Ok(()),
    }
}

/// Initializes the tracing subscriber.
///
/// Default filter `info,fiscal=debug,sqlx=warn`; `RUST_LOG` overrides it.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,fiscal=debug,sqlx=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

// =============================================================================
// Commands
// =============================================================================

async fn run_global(engine: &ConsolidationEngine, period: Period) -> Result<()> {
    let outcome = match engine.generate_global_invoice(period, Utc::now()).await {
        Ok(outcome) => outcome,
        Err(err) if err.is_empty_result() => {
            println!("{}", err);
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    let invoice = &outcome.invoice;
    println!(
        "Global invoice {}-{} certified: {}",
        invoice.series, invoice.folio, invoice.cfdi_uuid
    );
    println!(
        "  subtotal {}  tax {}  total {}",
        Money::from_cents(invoice.subtotal_cents),
        invoice.tax(),
        invoice.total()
    );
    print_summary(&outcome.summary);
    if !outcome.skipped_sale_ids.is_empty() {
        println!(
            "  {} sale(s) skipped, claimed by another run",
            outcome.skipped_sale_ids.len()
        );
    }
    if invoice.is_sandbox() {
        println!("  (sandbox: nothing was sent to the authority)");
    }
    Ok(())
}

async fn run_invoice(
    engine: &ConsolidationEngine,
    sale_id: &str,
    client_rfc: Option<&str>,
) -> Result<()> {
    let recipient = match client_rfc {
        Some(rfc) => engine
            .database()
            .clients()
            .get_by_rfc(rfc)
            .await?
            .map(|client| client.to_recipient())
            .ok_or_else(|| anyhow!("no registered client with RFC {}", rfc))?,
        None => Recipient::GeneralPublic,
    };

    let invoice = engine.invoice_sale(sale_id, &recipient, Utc::now()).await?;
    println!(
        "Invoice {}-{} certified for sale {}: {}",
        invoice.series, invoice.folio, invoice.sale_id, invoice.cfdi_uuid
    );
    println!(
        "  recipient {}  subtotal {}  tax {}  total {}",
        invoice.recipient_rfc,
        Money::from_cents(invoice.subtotal_cents),
        Money::from_cents(invoice.tax_cents),
        Money::from_cents(invoice.total_cents)
    );
    Ok(())
}

async fn run_reconcile(engine: &ConsolidationEngine, consolidation_id: Option<&str>) -> Result<()> {
    let ids: Vec<String> = match consolidation_id {
        Some(id) => vec![id.to_string()],
        None => engine
            .pending_reconciliations()
            .await?
            .into_iter()
            .map(|pending| pending.consolidation_id)
            .collect(),
    };

    if ids.is_empty() {
        println!("Nothing to reconcile");
        return Ok(());
    }

    let mut failures = 0;
    for id in &ids {
        match engine.reconcile(id).await {
            Ok(ReconciliationOutcome::Confirmed(recorded)) => {
                let (kind, series, folio) = match &recorded {
                    RecordedDocument::Invoice(i) => ("invoice", &i.series, &i.folio),
                    RecordedDocument::Global(g) => ("global invoice", &g.series, &g.folio),
                };
                println!("{}: {} {}-{} confirmed ({})", id, kind, series, folio, recorded.uuid());
            }
            Ok(ReconciliationOutcome::Released { released }) => {
                println!("{}: never certified, {} sale(s) open again", id, released);
            }
            Err(err) => {
                failures += 1;
                eprintln!("{}: {}", id, err);
            }
        }
    }

    if failures > 0 {
        bail!("{} of {} reconciliation(s) failed", failures, ids.len());
    }
    Ok(())
}

async fn run_list(engine: &ConsolidationEngine, period: Period) -> Result<()> {
    let invoices = engine.database().invoices();

    let globals = invoices.list_global_invoices(period.start, period.end).await?;
    let singles = invoices.list_invoices(period.start, period.end).await?;

    println!("Global invoices ({}):", globals.len());
    for g in &globals {
        println!(
            "  {}-{}  {}  {:>12}  {:>4} sales  {}",
            g.series,
            g.folio,
            g.issued_at.format("%Y-%m-%d %H:%M"),
            g.total().to_string(),
            g.sale_ids.len(),
            g.cfdi_uuid
        );
    }

    println!("Invoices ({}):", singles.len());
    for i in &singles {
        println!(
            "  {}-{}  {}  {:>12}  {}  {}",
            i.series,
            i.folio,
            i.issued_at.format("%Y-%m-%d %H:%M"),
            Money::from_cents(i.total_cents).to_string(),
            i.recipient_rfc,
            i.cfdi_uuid
        );
    }
    Ok(())
}

async fn run_status(engine: &ConsolidationEngine) -> Result<()> {
    let counts = engine.database().sales().state_counts().await?;
    println!("Sales by billing state:");
    for state in BillingState::ALL {
        println!("  {:<22} {}", state.as_str(), counts.get(&state).copied().unwrap_or(0));
    }

    let pending = engine.pending_reconciliations().await?;
    if !pending.is_empty() {
        println!("Awaiting reconciliation:");
        for p in &pending {
            println!(
                "  {}  {}-{}  {} sale(s)  issued {}",
                p.consolidation_id,
                p.series,
                p.folio,
                p.sale_ids.len(),
                p.issued_at.format("%Y-%m-%d %H:%M")
            );
        }
    }

    let journal = engine.database().invoices().list_pending().await?;
    let in_flight = journal.len().saturating_sub(pending.len());
    if in_flight > 0 {
        println!("Certifications in flight: {}", in_flight);
    }
    Ok(())
}

fn print_summary(summary: &PeriodSummary) {
    println!("  {} sale(s), {} collected", summary.sale_count, summary.total());
    for (method, totals) in &summary.by_method {
        println!(
            "    {:<12} {:>4}  {}",
            method.as_str(),
            totals.count,
            Money::from_cents(totals.total_cents)
        );
    }
}

// =============================================================================
// Tests
// =============================================================================
