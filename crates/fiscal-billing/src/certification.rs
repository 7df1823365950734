//! # Certification Client
//!
//! Submits composed payloads to the certification authority (PAC).
//!
//! ## Response Classification
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  could not connect / connect timeout ──────────► Network   (retried)   │
//! │  HTTP 5xx ─────────────────────────────────────► Network   (retried)   │
//! │  HTTP 200, status = "success" ─────────────────► CertificationResult   │
//! │  HTTP 200, status = "error" ───────────────────► Certification         │
//! │  any other status ─────────────────────────────► Certification         │
//! │  sent, then timeout / broken or unreadable body ► OutcomeUnknown       │
//! │                                                                         │
//! │  OutcomeUnknown is never retried: the authority may have stamped the   │
//! │  document and a second send would certify it twice.                   │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Sandbox Mode
//! No request leaves the process. The UUID is built from the current time
//! and the series/folio under the `SANDBOX-` prefix, and the "document" is
//! the payload JSON itself.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use fiscal_core::{CfdiPayload, SANDBOX_UUID_PREFIX};
use fiscal_db::CertifiedDocument;
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::{BearerToken, BillingConfig, PacSettings};
use crate::error::{BillingError, BillingResult};

/// Content type the authority expects for JSON payloads it converts to XML.
pub const JSON_TO_XML: &str = "application/jsontoxml";

const STATUS_SUCCESS: &str = "success";

// =============================================================================
// Result & Trait
// =============================================================================

/// A certified document as returned by the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificationResult {
    pub uuid: String,
    /// Certified document body. May be empty when recovered through a
    /// lookup that does not return bodies.
    pub document: String,
    pub certified_at: DateTime<Utc>,
}

impl CertificationResult {
    #[inline]
    pub fn is_sandbox(&self) -> bool {
        self.uuid.starts_with(SANDBOX_UUID_PREFIX)
    }

    pub fn into_document(self) -> CertifiedDocument {
        CertifiedDocument {
            uuid: self.uuid,
            document: self.document,
            certified_at: self.certified_at,
        }
    }
}

/// Anything that can certify a payload.
#[async_trait]
pub trait Certify: Send + Sync {
    /// Sends `payload` once. Retrying is the caller's business.
    async fn certify(&self, payload: &CfdiPayload) -> BillingResult<CertificationResult>;

    /// Asks whether `series`-`folio`, issued on `issued_on`, was certified.
    async fn lookup(
        &self,
        series: &str,
        folio: &str,
        issued_on: NaiveDate,
    ) -> BillingResult<Option<CertificationResult>>;
}

// =============================================================================
// Wire Types
// =============================================================================

#[derive(Debug, Deserialize)]
struct IssueResponse {
    status: String,
    #[serde(default)]
    data: Option<IssueData>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "messageDetail")]
    message_detail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IssueData {
    uuid: String,
    cfdi: String,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    status: String,
    #[serde(default)]
    data: Option<ListData>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ListData {
    #[serde(default)]
    cfdi: Vec<ListedCfdi>,
}

#[derive(Debug, Deserialize)]
struct ListedCfdi {
    uuid: String,
    #[serde(default)]
    serie: Option<String>,
    #[serde(default)]
    folio: Option<String>,
    #[serde(default)]
    cfdi: Option<String>,
}

// =============================================================================
// Client
// =============================================================================

#[derive(Debug, Clone)]
enum Mode {
    Sandbox,
    Live {
        http: Client,
        base_url: Url,
        token: BearerToken,
        issue_path: String,
        list_path: String,
    },
}

/// Certification client, sandbox or live.
#[derive(Debug, Clone)]
pub struct CertificationClient {
    mode: Mode,
}

impl CertificationClient {
    /// A client that never touches the network.
    pub fn sandbox() -> Self {
        CertificationClient { mode: Mode::Sandbox }
    }

    /// A client talking to the authority at `base_url`.
    pub fn live(base_url: Url, token: BearerToken, settings: &PacSettings) -> BillingResult<Self> {
        let http = Client::builder()
            .timeout(settings.request_timeout())
            .connect_timeout(settings.connect_timeout())
            .build()
            .map_err(|e| BillingError::Configuration(format!("HTTP client: {}", e)))?;

        Ok(CertificationClient {
            mode: Mode::Live {
                http,
                base_url,
                token,
                issue_path: settings.issue_path.clone(),
                list_path: settings.list_path.clone(),
            },
        })
    }

    /// Builds the client the configuration asks for.
    pub fn from_config(config: &BillingConfig) -> BillingResult<Self> {
        if config.pac.sandbox {
            info!("Certification in sandbox mode, no requests will be sent");
            return Ok(Self::sandbox());
        }

        let raw_url = config
            .pac
            .url
            .as_deref()
            .ok_or_else(|| BillingError::Configuration("live mode requires pac.url".into()))?;
        let token = config
            .pac
            .token
            .as_ref()
            .ok_or_else(|| BillingError::Configuration("live mode requires pac.token".into()))?;

        let base_url = config.pac_base_url(raw_url)?;
        info!(url = %base_url, "Certification in live mode");
        Self::live(base_url, token.clone(), &config.pac)
    }

    pub fn is_sandbox(&self) -> bool {
        matches!(self.mode, Mode::Sandbox)
    }

    fn sandbox_result(payload: &CfdiPayload) -> BillingResult<CertificationResult> {
        let now = Utc::now();
        let uuid = format!(
            "{}{}-{}{}",
            SANDBOX_UUID_PREFIX,
            now.format("%Y%m%d-%H%M%S-%6f"),
            payload.serie,
            payload.folio
        );
        debug!(uuid = %uuid, "Sandbox certification");

        Ok(CertificationResult {
            uuid,
            document: payload.to_json()?,
            certified_at: now,
        })
    }
}

#[async_trait]
impl Certify for CertificationClient {
    async fn certify(&self, payload: &CfdiPayload) -> BillingResult<CertificationResult> {
        let (http, base_url, token, issue_path) = match &self.mode {
            Mode::Sandbox => return Self::sandbox_result(payload),
            Mode::Live {
                http,
                base_url,
                token,
                issue_path,
                ..
            } => (http, base_url, token, issue_path),
        };

        let endpoint = base_url.join(issue_path)?;
        let body = payload.to_json()?;

        debug!(
            serie = %payload.serie,
            folio = %payload.folio,
            bytes = body.len(),
            "Sending payload for certification"
        );

        let response = http
            .post(endpoint)
            .bearer_auth(token.expose())
            .header(CONTENT_TYPE, JSON_TO_XML)
            .body(body)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if status.is_server_error() {
            return Err(BillingError::Network(format!(
                "authority answered {}",
                status
            )));
        }

        let text = match response.text().await {
            Ok(text) => text,
            Err(e) if status == StatusCode::OK => {
                return Err(BillingError::OutcomeUnknown(format!(
                    "response body lost: {}",
                    e
                )))
            }
            Err(_) => String::new(),
        };

        if status != StatusCode::OK {
            let parsed: Option<IssueResponse> = serde_json::from_str(&text).ok();
            let message = parsed
                .and_then(|r| r.message_detail.or(r.message))
                .unwrap_or(text);
            warn!(status = %status, "Certification request refused");
            return Err(BillingError::Certification {
                code: status.as_u16().to_string(),
                message,
            });
        }

        let parsed: IssueResponse = serde_json::from_str(&text).map_err(|e| {
            BillingError::OutcomeUnknown(format!("unreadable certification response: {}", e))
        })?;

        if parsed.status != STATUS_SUCCESS {
            let code = parsed.message.unwrap_or_else(|| parsed.status.clone());
            let message = parsed.message_detail.unwrap_or_default();
            warn!(code = %code, "Certification rejected");
            return Err(BillingError::Certification { code, message });
        }

        let data = parsed.data.ok_or_else(|| {
            BillingError::OutcomeUnknown("success response without certification data".into())
        })?;

        info!(uuid = %data.uuid, serie = %payload.serie, folio = %payload.folio, "Certified");
        Ok(CertificationResult {
            uuid: data.uuid,
            document: data.cfdi,
            certified_at: Utc::now(),
        })
    }

    async fn lookup(
        &self,
        series: &str,
        folio: &str,
        issued_on: NaiveDate,
    ) -> BillingResult<Option<CertificationResult>> {
        let (http, base_url, token, list_path) = match &self.mode {
            // nothing simulated survives the process
            Mode::Sandbox => return Ok(None),
            Mode::Live {
                http,
                base_url,
                token,
                list_path,
                ..
            } => (http, base_url, token, list_path),
        };

        let mut endpoint = base_url.join(list_path)?;
        let day = issued_on.format("%Y-%m-%d").to_string();
        endpoint
            .query_pairs_mut()
            .append_pair("fechaInicial", &day)
            .append_pair("fechaFinal", &day);

        debug!(series = %series, folio = %folio, day = %day, "Looking up certification");

        // read-only, so every failure is safe to retry
        let response = http
            .get(endpoint)
            .bearer_auth(token.expose())
            .send()
            .await
            .map_err(|e| BillingError::Network(e.to_string()))?;

        let status = response.status();
        if status.is_server_error() {
            return Err(BillingError::Network(format!("authority answered {}", status)));
        }
        if status != StatusCode::OK {
            return Err(BillingError::Certification {
                code: status.as_u16().to_string(),
                message: "lookup refused".into(),
            });
        }

        let parsed: ListResponse = response
            .json()
            .await
            .map_err(|e| BillingError::Network(format!("unreadable lookup response: {}", e)))?;

        if parsed.status != STATUS_SUCCESS {
            return Err(BillingError::Certification {
                code: parsed.status,
                message: parsed.message.unwrap_or_default(),
            });
        }

        let found = parsed
            .data
            .unwrap_or_default()
            .cfdi
            .into_iter()
            .find(|c| c.serie.as_deref() == Some(series) && c.folio.as_deref() == Some(folio))
            .map(|c| CertificationResult {
                uuid: c.uuid,
                document: c.cfdi.unwrap_or_default(),
                certified_at: Utc::now(),
            });

        Ok(found)
    }
}

/// Splits transport failures into "never arrived" and "may have arrived".
fn classify_send_error(err: reqwest::Error) -> BillingError {
    if err.is_connect() {
        BillingError::Network(err.to_string())
    } else if err.is_builder() {
        BillingError::Configuration(err.to_string())
    } else {
        BillingError::OutcomeUnknown(err.to_string())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
