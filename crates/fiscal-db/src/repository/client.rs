//! # Client Repository
//!
//! Registered clients: the recipients of individual invoices.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tracing::debug;

use super::new_id;
use crate::error::{DbError, DbResult};
use fiscal_core::{FiscalProfile, Recipient};

const CLIENT_COLUMNS: &str =
    "id, rfc, legal_name, fiscal_regime, postal_code, cfdi_use, created_at";

/// A registered client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct Client {
    pub id: String,
    pub rfc: String,
    pub legal_name: String,
    pub fiscal_regime: String,
    pub postal_code: String,
    pub cfdi_use: String,
    pub created_at: DateTime<Utc>,
}

impl Client {
    pub fn new(profile: FiscalProfile) -> Self {
        Client {
            id: new_id(),
            rfc: profile.rfc,
            legal_name: profile.legal_name,
            fiscal_regime: profile.fiscal_regime,
            postal_code: profile.postal_code,
            cfdi_use: profile.cfdi_use,
            created_at: Utc::now(),
        }
    }

    pub fn profile(&self) -> FiscalProfile {
        FiscalProfile {
            rfc: self.rfc.clone(),
            legal_name: self.legal_name.clone(),
            fiscal_regime: self.fiscal_regime.clone(),
            postal_code: self.postal_code.clone(),
            cfdi_use: self.cfdi_use.clone(),
        }
    }

    /// This client as an invoice recipient.
    pub fn to_recipient(&self) -> Recipient {
        Recipient::Registered(self.profile())
    }
}

/// Repository for client database operations.
#[derive(Debug, Clone)]
pub struct ClientRepository {
    pool: SqlitePool,
}

impl ClientRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ClientRepository { pool }
    }

    /// Inserts a client. A second client with the same RFC is rejected.
    pub async fn insert(&self, client: &Client) -> DbResult<()> {
        debug!(id = %client.id, rfc = %client.rfc, "Inserting client");

        sqlx::query(
            r#"
            INSERT INTO clients (
                id, rfc, legal_name, fiscal_regime, postal_code, cfdi_use, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&client.id)
        .bind(&client.rfc)
        .bind(&client.legal_name)
        .bind(&client.fiscal_regime)
        .bind(&client.postal_code)
        .bind(&client.cfdi_use)
        .bind(client.created_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match DbError::from(e) {
            DbError::UniqueViolation { field, .. } => DbError::UniqueViolation {
                field,
                value: client.rfc.clone(),
            },
            other => other,
        })?;

        Ok(())
    }

    pub async fn get_by_id(&self, id: &str) -> DbResult<Option<Client>> {
        let client = sqlx::query_as(&format!("SELECT {} FROM clients WHERE id = ?1", CLIENT_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(client)
    }

    pub async fn get_by_rfc(&self, rfc: &str) -> DbResult<Option<Client>> {
        let client = sqlx::query_as(&format!("SELECT {} FROM clients WHERE rfc = ?1", CLIENT_COLUMNS))
            .bind(rfc)
            .fetch_optional(&self.pool)
            .await?;
        Ok(client)
    }

    pub async fn list(&self) -> DbResult<Vec<Client>> {
        let clients =
            sqlx::query_as(&format!("SELECT {} FROM clients ORDER BY legal_name", CLIENT_COLUMNS))
                .fetch_all(&self.pool)
                .await?;
        Ok(clients)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Database;

    fn profile(rfc: &str) -> FiscalProfile {
        FiscalProfile {
            rfc: rfc.to_string(),
            legal_name: "ABARROTES LA ESPERANZA".to_string(),
            fiscal_regime: "601".to_string(),
            postal_code: "06000".to_string(),
            cfdi_use: "G03".to_string(),
        }
    }

    #[tokio::test]
    async fn test_insert_and_lookup() {
        let db = Database::in_memory().await.unwrap();
        let client = Client::new(profile("AES010101AB1"));
        db.clients().insert(&client).await.unwrap();

        let by_id = db.clients().get_by_id(&client.id).await.unwrap().unwrap();
        assert_eq!(by_id.rfc, "AES010101AB1");

        let by_rfc = db.clients().get_by_rfc("AES010101AB1").await.unwrap().unwrap();
        assert_eq!(by_rfc.id, client.id);
        assert_eq!(by_rfc.to_recipient(), Recipient::Registered(profile("AES010101AB1")));

        assert_eq!(db.clients().list().await.unwrap().len(), 1);
        assert!(db.clients().get_by_rfc("NOPE").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_rfc() {
        let db = Database::in_memory().await.unwrap();
        db.clients()
            .insert(&Client::new(profile("AES010101AB1")))
            .await
            .unwrap();

        let err = db
            .clients()
            .insert(&Client::new(profile("AES010101AB1")))
            .await
            .unwrap_err();
        match err {
            DbError::UniqueViolation { value, .. } => assert_eq!(value, "AES010101AB1"),
            other => panic!("unexpected error: {other}"),
        }
    }
}
