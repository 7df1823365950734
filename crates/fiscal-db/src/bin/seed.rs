//! # Seed Data Generator
//!
//! Populates a database with sample sales for trying out the invoicing
//! pipeline in sandbox mode.
//!
//! ## Usage
//! ```bash
//! # 50 sales spread over today (default)
//! cargo run -p fiscal-db --bin seed
//!
//! # Custom amount and database
//! cargo run -p fiscal-db --bin seed -- --count 500 --db ./data/back-office.db
//! ```
//!
//! ## Generated Data
//! - One registered client (`AES010101AB1`), attached to every tenth sale
//! - Sales between 08:00 and 20:00 UTC today, 1-3 items each
//! - Payment methods rotate through cash, card, transfer and unspecified

use chrono::{Duration, Utc};
use fiscal_core::{BillingState, FiscalProfile, LineItem, PaymentMethod, Sale};
use fiscal_db::repository::new_id;
use fiscal_db::{Client, Database, DbConfig};
use std::env;

/// (product id, description, unit price in cents)
const PRODUCTS: &[(&str, &str, i64)] = &[
    ("BEV-001", "Coca-Cola 600ml", 1800),
    ("BEV-002", "Agua natural 1L", 1250),
    ("BAK-001", "Pan dulce", 950),
    ("DRY-001", "Leche entera 1L", 2890),
    ("GRO-001", "Arroz 1kg", 3450),
    ("GRO-002", "Frijol negro 1kg", 4200),
    ("SNK-001", "Papas fritas 45g", 1700),
];

const METHODS: &[PaymentMethod] = &[
    PaymentMethod::Cash,
    PaymentMethod::Card,
    PaymentMethod::Cash,
    PaymentMethod::Transfer,
    PaymentMethod::Unspecified,
];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = env::args().collect();

    let mut count: usize = 50;
    let mut db_path = String::from("./back_office_dev.db");

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--count" | "-c" => {
                if i + 1 < args.len() {
                    count = args[i + 1].parse().unwrap_or(50);
                    i += 1;
                }
            }
            "--db" | "-d" => {
                if i + 1 < args.len() {
                    db_path = args[i + 1].clone();
                    i += 1;
                }
            }
            "--help" | "-h" => {
                println!("Fiscal Back Office Seed Data Generator");
                println!();
                println!("Usage: seed [OPTIONS]");
                println!();
                println!("Options:");
                println!("  -c, --count <N>    Number of sales to generate (default: 50)");
                println!("  -d, --db <PATH>    Database file path (default: ./back_office_dev.db)");
                println!("  -h, --help         Show this help message");
                return Ok(());
            }
            _ => {}
        }
        i += 1;
    }

    println!("Fiscal Back Office Seed Data Generator");
    println!("======================================");
    println!("Database: {}", db_path);
    println!("Sales:    {}", count);
    println!();

    let db = Database::new(DbConfig::new(&db_path)).await?;
    println!("✓ Connected to database");
    println!("✓ Migrations applied");

    let existing = db.sales().count().await?;
    if existing > 0 {
        println!("⚠ Database already has {} sales", existing);
        println!("  Skipping seed to avoid duplicates.");
        println!("  Delete the database file to regenerate.");
        return Ok(());
    }

    let client = match db.clients().get_by_rfc("AES010101AB1").await? {
        Some(client) => client,
        None => {
            let client = Client::new(FiscalProfile {
                rfc: "AES010101AB1".to_string(),
                legal_name: "ABARROTES LA ESPERANZA".to_string(),
                fiscal_regime: "601".to_string(),
                postal_code: "06000".to_string(),
                cfdi_use: "G03".to_string(),
            });
            db.clients().insert(&client).await?;
            client
        }
    };
    println!("✓ Client {} ({})", client.legal_name, client.rfc);

    let day_start = Utc::now()
        .date_naive()
        .and_hms_opt(8, 0, 0)
        .ok_or("invalid opening time")?
        .and_utc();
    let spacing = Duration::seconds(12 * 3600 / count.max(1) as i64);

    let mut generated = 0;
    let mut total_cents = 0;
    for n in 0..count {
        let sale = generate_sale(n, day_start + spacing * n as i32, &client.id);
        total_cents += sale.total_cents;

        if let Err(e) = db.sales().insert_sale(&sale).await {
            eprintln!("Failed to insert {}: {}", sale.id, e);
            continue;
        }
        generated += 1;
    }

    println!();
    println!(
        "✓ Generated {} sales totalling {}",
        generated,
        fiscal_core::Money::from_cents(total_cents)
    );
    println!();
    println!("✓ Seed complete!");

    Ok(())
}

/// Builds one sale with 1-3 items, deterministic per index.
fn generate_sale(n: usize, created_at: chrono::DateTime<Utc>, client_id: &str) -> Sale {
    let item_count = 1 + n % 3;
    let items: Vec<LineItem> = (0..item_count)
        .map(|k| {
            let (product_id, description, unit_price_cents) = PRODUCTS[(n * 3 + k) % PRODUCTS.len()];
            let quantity = 1 + ((n + k) % 4) as i64;
            LineItem {
                product_id: product_id.to_string(),
                description: description.to_string(),
                product_key: None,
                quantity,
                unit_price_cents,
                line_total_cents: unit_price_cents * quantity,
            }
        })
        .collect();

    Sale {
        id: new_id(),
        client_id: (n % 10 == 9).then(|| client_id.to_string()),
        created_at,
        total_cents: items.iter().map(|i| i.line_total_cents).sum(),
        payment_method: METHODS[n % METHODS.len()],
        items,
        billing_state: BillingState::Open,
        claim_tag: None,
        invoice_id: None,
        global_invoice_id: None,
    }
}
