//! # Validation Module
//!
//! Fiscal field validation for issuers, recipients and catalog keys.
//!
//! ## Validation Strategy
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Validation Layers                                  │
//! │                                                                         │
//! │  Layer 1: Configuration load (fiscal-billing)                          │
//! │  └── Issuer identity checked once at startup                           │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 2: Composition (THIS MODULE, via InvoiceComposer)               │
//! │  ├── Issuer + recipient fields                                         │
//! │  └── Catalog keys (product, unit, currency)                            │
//! │           │                                                             │
//! │           ▼                                                             │
//! │  Layer 3: Certification authority                                      │
//! │  └── Business rules we cannot check locally                            │
//! │                                                                         │
//! │  Anything Layer 2 can reject never costs a certification attempt       │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use crate::error::ValidationError;
use crate::types::{Issuer, Recipient};
use crate::MAX_DESCRIPTION_LEN;

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

// =============================================================================
// Field Validators
// =============================================================================

/// Rejects empty or whitespace-only values.
pub fn validate_required(field: &str, value: &str) -> ValidationResult<()> {
    if value.trim().is_empty() {
        return Err(ValidationError::Required {
            field: field.to_string(),
        });
    }
    Ok(())
}

/// Validates a tax identifier (RFC).
///
/// ## Rules
/// - 12 characters (companies) or 13 (individuals)
/// - 3 or 4 leading letters (`&` and `Ñ` allowed)
/// - 6 digits (date of registration)
/// - 3 alphanumeric check characters
///
/// ## Example
/// ```rust
/// use fiscal_core::validation::validate_rfc;
///
/// assert!(validate_rfc("issuer.rfc", "EKU9003173C9").is_ok());
/// assert!(validate_rfc("recipient.rfc", "XAXX010101000").is_ok());
/// assert!(validate_rfc("recipient.rfc", "NOT-AN-RFC").is_err());
/// ```
pub fn validate_rfc(field: &str, rfc: &str) -> ValidationResult<()> {
    validate_required(field, rfc)?;

    let chars: Vec<char> = rfc.chars().collect();
    let invalid = |reason: &str| ValidationError::InvalidFormat {
        field: field.to_string(),
        reason: reason.to_string(),
    };

    let letters = match chars.len() {
        12 => 3,
        13 => 4,
        _ => return Err(invalid("must be 12 or 13 characters")),
    };

    let (prefix, rest) = chars.split_at(letters);
    let (date, check) = rest.split_at(6);

    if !prefix
        .iter()
        .all(|c| c.is_ascii_uppercase() || *c == '&' || *c == 'Ñ')
    {
        return Err(invalid("must start with uppercase letters"));
    }
    if !date.iter().all(|c| c.is_ascii_digit()) {
        return Err(invalid("must contain a 6-digit date"));
    }
    if !check
        .iter()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
    {
        return Err(invalid("must end with 3 alphanumeric characters"));
    }
    Ok(())
}

/// Validates a 5-digit postal code.
pub fn validate_postal_code(field: &str, code: &str) -> ValidationResult<()> {
    validate_digits(field, code, 5)
}

/// Validates a 3-digit fiscal regime code (e.g. `601`, `616`).
pub fn validate_fiscal_regime(field: &str, code: &str) -> ValidationResult<()> {
    validate_digits(field, code, 3)
}

/// Validates an invoice-use code (`G03`, `S01`, `CP01`).
pub fn validate_cfdi_use(field: &str, code: &str) -> ValidationResult<()> {
    validate_required(field, code)?;
    let ok = (3..=4).contains(&code.len())
        && code
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
    if !ok {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must be 3-4 uppercase alphanumeric characters".to_string(),
        });
    }
    Ok(())
}

/// Validates an 8-digit product/service classification key.
pub fn validate_product_key(field: &str, key: &str) -> ValidationResult<()> {
    validate_digits(field, key, 8)
}

/// Validates a unit key (`ACT`, `H87`, `E48`).
pub fn validate_unit_key(field: &str, key: &str) -> ValidationResult<()> {
    validate_required(field, key)?;
    let ok = (2..=3).contains(&key.len())
        && key
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit());
    if !ok {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must be 2-3 uppercase alphanumeric characters".to_string(),
        });
    }
    Ok(())
}

/// Validates a 3-letter ISO 4217 currency code.
pub fn validate_currency(field: &str, code: &str) -> ValidationResult<()> {
    validate_required(field, code)?;
    if code.len() != 3 || !code.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: "must be a 3-letter currency code".to_string(),
        });
    }
    Ok(())
}

/// Validates a line description.
pub fn validate_description(field: &str, text: &str) -> ValidationResult<()> {
    validate_required(field, text)?;
    if text.chars().count() > MAX_DESCRIPTION_LEN {
        return Err(ValidationError::TooLong {
            field: field.to_string(),
            max: MAX_DESCRIPTION_LEN,
        });
    }
    Ok(())
}

fn validate_digits(field: &str, value: &str, len: usize) -> ValidationResult<()> {
    validate_required(field, value)?;
    if value.len() != len || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ValidationError::InvalidFormat {
            field: field.to_string(),
            reason: format!("must be exactly {} digits", len),
        });
    }
    Ok(())
}

// =============================================================================
// Party Validators
// =============================================================================

/// Validates the merchant's fiscal identity.
pub fn validate_issuer(issuer: &Issuer) -> ValidationResult<()> {
    validate_rfc("issuer.rfc", &issuer.rfc)?;
    validate_required("issuer.legal_name", &issuer.legal_name)?;
    validate_fiscal_regime("issuer.fiscal_regime", &issuer.fiscal_regime)?;
    validate_postal_code("issuer.expedition_postal_code", &issuer.expedition_postal_code)?;
    Ok(())
}

/// Validates a recipient. The general public recipient is fixed and always
/// valid; a registered client must carry a complete fiscal profile.
pub fn validate_recipient(recipient: &Recipient) -> ValidationResult<()> {
    let profile = match recipient {
        Recipient::GeneralPublic => return Ok(()),
        Recipient::Registered(profile) => profile,
    };

    validate_rfc("recipient.rfc", &profile.rfc)?;
    validate_required("recipient.legal_name", &profile.legal_name)?;
    validate_fiscal_regime("recipient.fiscal_regime", &profile.fiscal_regime)?;
    validate_postal_code("recipient.postal_code", &profile.postal_code)?;
    validate_cfdi_use("recipient.cfdi_use", &profile.cfdi_use)?;
    Ok(())
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::FiscalProfile;

    fn issuer() -> Issuer {
        Issuer {
            rfc: "EKU9003173C9".to_string(),
            legal_name: "ESCUELA KEMPER URGATE".to_string(),
            fiscal_regime: "601".to_string(),
            expedition_postal_code: "42501".to_string(),
        }
    }

    fn profile() -> FiscalProfile {
        FiscalProfile {
            rfc: "CACX7605101P8".to_string(),
            legal_name: "XOCHILT CASAS CHAVEZ".to_string(),
            fiscal_regime: "612".to_string(),
            postal_code: "10740".to_string(),
            cfdi_use: "G03".to_string(),
        }
    }

    #[test]
    fn test_valid_rfcs() {
        assert!(validate_rfc("rfc", "EKU9003173C9").is_ok());
        assert!(validate_rfc("rfc", "CACX7605101P8").is_ok());
        assert!(validate_rfc("rfc", "Ñ&A010101AB1").is_ok());
    }

    #[test]
    fn test_invalid_rfcs() {
        assert!(matches!(
            validate_rfc("rfc", ""),
            Err(ValidationError::Required { .. })
        ));
        assert!(validate_rfc("rfc", "EKU900317").is_err());
        assert!(validate_rfc("rfc", "eku9003173c9").is_err());
        assert!(validate_rfc("rfc", "EKU90A3173C9").is_err());
        assert!(validate_rfc("rfc", "EKU9003173-9").is_err());
    }

    #[test]
    fn test_postal_and_regime() {
        assert!(validate_postal_code("cp", "42501").is_ok());
        assert!(validate_postal_code("cp", "4250").is_err());
        assert!(validate_postal_code("cp", "4250A").is_err());
        assert!(validate_fiscal_regime("regime", "601").is_ok());
        assert!(validate_fiscal_regime("regime", "60").is_err());
    }

    #[test]
    fn test_catalog_keys() {
        assert!(validate_product_key("key", "01010101").is_ok());
        assert!(validate_product_key("key", "0101010").is_err());
        assert!(validate_unit_key("unit", "ACT").is_ok());
        assert!(validate_unit_key("unit", "H87").is_ok());
        assert!(validate_unit_key("unit", "pieza").is_err());
        assert!(validate_currency("currency", "MXN").is_ok());
        assert!(validate_currency("currency", "mxn").is_err());
        assert!(validate_cfdi_use("use", "CP01").is_ok());
        assert!(validate_cfdi_use("use", "g03").is_err());
    }

    #[test]
    fn test_description_length() {
        assert!(validate_description("desc", "Venta").is_ok());
        assert!(validate_description("desc", "  ").is_err());
        let long = "x".repeat(MAX_DESCRIPTION_LEN + 1);
        assert!(matches!(
            validate_description("desc", &long),
            Err(ValidationError::TooLong { .. })
        ));
    }

    #[test]
    fn test_issuer_validation() {
        assert!(validate_issuer(&issuer()).is_ok());

        let mut missing_name = issuer();
        missing_name.legal_name = String::new();
        let err = validate_issuer(&missing_name).unwrap_err();
        assert_eq!(err.to_string(), "issuer.legal_name is required");
    }

    #[test]
    fn test_recipient_validation() {
        assert!(validate_recipient(&Recipient::GeneralPublic).is_ok());
        assert!(validate_recipient(&Recipient::Registered(profile())).is_ok());

        let mut no_rfc = profile();
        no_rfc.rfc = String::new();
        let err = validate_recipient(&Recipient::Registered(no_rfc)).unwrap_err();
        assert_eq!(err.to_string(), "recipient.rfc is required");
    }
}
