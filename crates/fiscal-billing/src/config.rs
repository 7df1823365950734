//! # Billing Configuration
//!
//! ## Configuration Sources
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Configuration Priority                               │
//! │                                                                         │
//! │  1. Environment Variables (highest priority)                           │
//! │     FISCAL_PAC_URL, FISCAL_PAC_TOKEN, FISCAL_SANDBOX                   │
//! │     FISCAL_ISSUER_RFC, FISCAL_ISSUER_NAME, FISCAL_ISSUER_REGIME        │
//! │     FISCAL_EXPEDITION_CP, FISCAL_TAX_RATE, FISCAL_DB_PATH              │
//! │                                                                         │
//! │  2. TOML Config File                                                   │
//! │     --config <path>, or                                                │
//! │     ~/.config/fiscal-back-office/billing.toml (Linux)                  │
//! │                                                                         │
//! │  3. Default Values (lowest priority)                                   │
//! │     sandbox on, 16% VAT, one line per sale                             │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Configuration File Format
//! ```toml
//! [issuer]
//! rfc = "EKU9003173C9"
//! legal_name = "ESCUELA KEMPER URGATE"
//! fiscal_regime = "601"
//! expedition_postal_code = "42501"
//!
//! [pac]
//! sandbox = false
//! url = "https://services.test.sw.com.mx"
//! token = "…"
//! request_timeout_secs = 30
//! max_attempts = 3
//!
//! [tax]
//! rate = 0.16
//!
//! [invoice]
//! line_mode = "per_sale"
//! summarize_products = true
//!
//! [database]
//! path = "back_office.db"
//! ```

use fiscal_core::validation::{
    validate_currency, validate_issuer, validate_product_key, validate_unit_key,
};
use fiscal_core::{InvoiceComposer, Issuer, LineMode, TaxRate};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{BillingError, BillingResult};

// =============================================================================
// Issuer
// =============================================================================

/// The merchant's fiscal identity.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssuerSettings {
    #[serde(default)]
    pub rfc: String,
    #[serde(default)]
    pub legal_name: String,
    #[serde(default)]
    pub fiscal_regime: String,
    #[serde(default)]
    pub expedition_postal_code: String,
}

impl IssuerSettings {
    pub fn to_issuer(&self) -> Issuer {
        Issuer {
            rfc: self.rfc.clone(),
            legal_name: self.legal_name.clone(),
            fiscal_regime: self.fiscal_regime.clone(),
            expedition_postal_code: self.expedition_postal_code.clone(),
        }
    }
}

// =============================================================================
// Certification Authority
// =============================================================================

/// Bearer credential for the certification authority. Never printed.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BearerToken(String);

impl BearerToken {
    pub fn new(token: impl Into<String>) -> Self {
        BearerToken(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("BearerToken(***)")
    }
}

/// Certification authority (PAC) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PacSettings {
    /// Simulate certification locally. No request ever leaves the process.
    /// Default: true
    #[serde(default = "default_true")]
    pub sandbox: bool,

    /// Base URL, e.g. `https://services.test.sw.com.mx`.
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub token: Option<BearerToken>,

    #[serde(default = "default_issue_path")]
    pub issue_path: String,

    #[serde(default = "default_list_path")]
    pub list_path: String,

    /// Whole-request timeout (seconds).
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Attempts per certification, the first one included.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
}

fn default_true() -> bool {
    true
}
fn default_issue_path() -> String {
    "/v3/cfdi33/issue/json/v4".to_string()
}
fn default_list_path() -> String {
    "/v4/cfdi33/list".to_string()
}
fn default_request_timeout() -> u64 {
    30
}
fn default_connect_timeout() -> u64 {
    10
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_backoff() -> u64 {
    500
}
fn default_max_backoff() -> u64 {
    10
}

impl Default for PacSettings {
    fn default() -> Self {
        PacSettings {
            sandbox: true,
            url: None,
            token: None,
            issue_path: default_issue_path(),
            list_path: default_list_path(),
            request_timeout_secs: default_request_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
        }
    }
}

impl PacSettings {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_secs(self.max_backoff_secs)
    }
}

// =============================================================================
// Tax, Invoice and Database Settings
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxSettings {
    /// VAT as a fraction, e.g. `0.16`.
    #[serde(default = "default_tax_rate")]
    pub rate: f64,
}

fn default_tax_rate() -> f64 {
    0.16
}

impl Default for TaxSettings {
    fn default() -> Self {
        TaxSettings {
            rate: default_tax_rate(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvoiceSettings {
    /// Line layout for single-sale invoices.
    #[serde(default)]
    pub line_mode: LineMode,

    #[serde(default = "default_currency")]
    pub currency: String,

    /// Product/service catalog key for per-sale lines.
    #[serde(default = "default_product_key")]
    pub product_key: String,

    #[serde(default = "default_unit_key")]
    pub unit_key: String,

    /// Describe per-sale lines with the products sold.
    #[serde(default = "default_true")]
    pub summarize_products: bool,
}

fn default_currency() -> String {
    "MXN".to_string()
}
fn default_product_key() -> String {
    "01010101".to_string()
}
fn default_unit_key() -> String {
    "ACT".to_string()
}

impl Default for InvoiceSettings {
    fn default() -> Self {
        InvoiceSettings {
            line_mode: LineMode::default(),
            currency: default_currency(),
            product_key: default_product_key(),
            unit_key: default_unit_key(),
            summarize_products: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseSettings {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("back_office.db")
}
fn default_max_connections() -> u32 {
    5
}

impl Default for DatabaseSettings {
    fn default() -> Self {
        DatabaseSettings {
            path: default_db_path(),
            max_connections: default_max_connections(),
        }
    }
}

// =============================================================================
// Main Billing Configuration
// =============================================================================

/// Complete billing configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BillingConfig {
    #[serde(default)]
    pub issuer: IssuerSettings,

    #[serde(default)]
    pub pac: PacSettings,

    #[serde(default)]
    pub tax: TaxSettings,

    #[serde(default)]
    pub invoice: InvoiceSettings,

    #[serde(default)]
    pub database: DatabaseSettings,
}

impl BillingConfig {
    /// Loads configuration from file, environment, and defaults, then
    /// validates it.
    ///
    /// ## Load Order (later overrides earlier)
    /// 1. Default values
    /// 2. Config file (billing.toml)
    /// 3. Environment variables
    pub fn load(config_path: Option<PathBuf>) -> BillingResult<Self> {
        let explicit = config_path.is_some();
        let mut config = Self::default();

        if let Some(path) = config_path.or_else(Self::default_config_path) {
            if path.exists() {
                info!(?path, "Loading billing config from file");
                let contents = std::fs::read_to_string(&path)?;
                config = Self::from_toml(&contents)?;
            } else if explicit {
                return Err(BillingError::Configuration(format!(
                    "config file {} does not exist",
                    path.display()
                )));
            } else {
                debug!(?path, "Config file not found, using defaults");
            }
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    pub fn from_toml(contents: &str) -> BillingResult<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Validates the configuration. Any failure is fatal at startup.
    pub fn validate(&self) -> BillingResult<()> {
        validate_issuer(&self.issuer.to_issuer())
            .map_err(|e| BillingError::Configuration(e.to_string()))?;

        if !self.pac.sandbox {
            if self.pac.url.as_deref().map_or(true, |u| u.trim().is_empty()) {
                return Err(BillingError::Configuration(
                    "live mode requires pac.url".into(),
                ));
            }
            if self.pac.token.as_ref().map_or(true, BearerToken::is_empty) {
                return Err(BillingError::Configuration(
                    "live mode requires pac.token".into(),
                ));
            }
        }

        if let Some(url) = &self.pac.url {
            self.pac_base_url(url)?;
        }

        self.tax_rate()?;

        if self.pac.max_attempts == 0 {
            return Err(BillingError::Configuration(
                "pac.max_attempts must be at least 1".into(),
            ));
        }
        if self.pac.request_timeout_secs == 0 {
            return Err(BillingError::Configuration(
                "pac.request_timeout_secs must be greater than 0".into(),
            ));
        }

        validate_currency("invoice.currency", &self.invoice.currency)
            .and_then(|_| validate_product_key("invoice.product_key", &self.invoice.product_key))
            .and_then(|_| validate_unit_key("invoice.unit_key", &self.invoice.unit_key))
            .map_err(|e| BillingError::Configuration(e.to_string()))?;

        Ok(())
    }

    /// The configured VAT rate.
    pub fn tax_rate(&self) -> BillingResult<TaxRate> {
        TaxRate::from_fraction(self.tax.rate)
            .map_err(|e| BillingError::Configuration(format!("tax.rate: {}", e)))
    }

    /// A composer set up from the `[tax]` and `[invoice]` sections.
    pub fn composer(&self) -> BillingResult<InvoiceComposer> {
        Ok(InvoiceComposer::new(self.tax_rate()?)
            .with_line_mode(self.invoice.line_mode)
            .with_currency(self.invoice.currency.clone())
            .with_catalog_keys(
                self.invoice.product_key.clone(),
                self.invoice.unit_key.clone(),
            )
            .with_product_summary(self.invoice.summarize_products))
    }

    /// Parses and checks the endpoint base URL.
    pub fn pac_base_url(&self, raw: &str) -> BillingResult<Url> {
        let url = Url::parse(raw)?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(BillingError::Configuration(format!(
                "pac.url must be http(s), got {}://",
                other
            ))),
        }
    }

    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies `FISCAL_*` overrides from `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("FISCAL_PAC_URL") {
            debug!(url = %url, "Overriding certification URL from environment");
            self.pac.url = Some(url);
        }
        if let Some(token) = lookup("FISCAL_PAC_TOKEN") {
            self.pac.token = Some(BearerToken::new(token));
        }
        if let Some(sandbox) = lookup("FISCAL_SANDBOX") {
            match sandbox.to_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => self.pac.sandbox = true,
                "0" | "false" | "no" | "off" => self.pac.sandbox = false,
                _ => warn!(value = %sandbox, "Unrecognized FISCAL_SANDBOX value"),
            }
        }
        if let Some(rfc) = lookup("FISCAL_ISSUER_RFC") {
            self.issuer.rfc = rfc;
        }
        if let Some(name) = lookup("FISCAL_ISSUER_NAME") {
            self.issuer.legal_name = name;
        }
        if let Some(regime) = lookup("FISCAL_ISSUER_REGIME") {
            self.issuer.fiscal_regime = regime;
        }
        if let Some(cp) = lookup("FISCAL_EXPEDITION_CP") {
            self.issuer.expedition_postal_code = cp;
        }
        if let Some(rate) = lookup("FISCAL_TAX_RATE") {
            match rate.parse::<f64>() {
                Ok(r) => self.tax.rate = r,
                Err(_) => warn!(value = %rate, "Unparseable FISCAL_TAX_RATE"),
            }
        }
        if let Some(path) = lookup("FISCAL_DB_PATH") {
            self.database.path = PathBuf::from(path);
        }
    }

    /// Returns the default config file path.
    fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "titan", "fiscal-back-office")
            .map(|dirs| dirs.config_dir().join("billing.toml"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn valid() -> BillingConfig {
        BillingConfig::from_toml(
            r#"
            [issuer]
            rfc = "EKU9003173C9"
            legal_name = "ESCUELA KEMPER URGATE"
            fiscal_regime = "601"
            expedition_postal_code = "42501"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = valid();
        assert!(config.pac.sandbox);
        assert_eq!(config.pac.max_attempts, 3);
        assert_eq!(config.pac.request_timeout(), Duration::from_secs(30));
        assert_eq!(config.tax_rate().unwrap().bps(), 1600);
        assert_eq!(config.invoice.line_mode, LineMode::PerSale);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_issuer_is_fatal() {
        let err = BillingConfig::default().validate().unwrap_err();
        assert!(matches!(err, BillingError::Configuration(_)));
    }

    #[test]
    fn test_live_mode_requires_endpoint_and_token() {
        let mut config = valid();
        config.pac.sandbox = false;
        assert!(config.validate().is_err());

        config.pac.url = Some("https://services.test.sw.com.mx".into());
        assert!(config.validate().is_err());

        config.pac.token = Some(BearerToken::new("T0K3N"));
        assert!(config.validate().is_ok());

        config.pac.url = Some("ftp://services.test.sw.com.mx".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_tunables() {
        let mut config = valid();
        config.tax.rate = 1.5;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.pac.max_attempts = 0;
        assert!(config.validate().is_err());

        let mut config = valid();
        config.invoice.product_key = "0101".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_overrides() {
        let env: HashMap<&str, &str> = [
            ("FISCAL_PAC_URL", "https://pac.example.mx"),
            ("FISCAL_PAC_TOKEN", "secret-token"),
            ("FISCAL_SANDBOX", "false"),
            ("FISCAL_TAX_RATE", "0.08"),
            ("FISCAL_DB_PATH", "/var/lib/fiscal/bo.db"),
            ("FISCAL_EXPEDITION_CP", "64000"),
        ]
        .into_iter()
        .collect();

        let mut config = valid();
        config.apply_overrides(|key| env.get(key).map(|v| v.to_string()));

        assert!(!config.pac.sandbox);
        assert_eq!(config.pac.url.as_deref(), Some("https://pac.example.mx"));
        assert_eq!(config.tax_rate().unwrap().bps(), 800);
        assert_eq!(config.database.path, PathBuf::from("/var/lib/fiscal/bo.db"));
        assert_eq!(config.issuer.expedition_postal_code, "64000");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_token_is_never_printed() {
        let mut config = valid();
        config.pac.token = Some(BearerToken::new("secret-token"));
        let debug = format!("{:?}", config);
        assert!(!debug.contains("secret-token"));
        assert!(debug.contains("***"));
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = BillingConfig::load(Some(PathBuf::from("/nonexistent/billing.toml"))).unwrap_err();
        assert!(matches!(err, BillingError::Configuration(_)));
    }
}
