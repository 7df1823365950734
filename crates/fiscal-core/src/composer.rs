//! # Invoice Composer
//!
//! Pure transform from sales + recipient + issuer into a [`CfdiPayload`].
//!
//! ## Composition Flow
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                                                                         │
//! │  CompositionRequest                                                     │
//! │  (series, folio, sales, recipient, issuer, as_of, period)               │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  validate issuer / recipient / catalog keys ──► ValidationError         │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  one line per sale (global, or per_sale mode)                           │
//! │  one line per item (single sale, per_item mode)                         │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  tax::decompose_lines  (drift into the last line)                       │
//! │        │                                                                │
//! │        ▼                                                                │
//! │  ComposedInvoice { payload, totals }                                    │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The composer never reads the clock and never mutates its inputs: the
//! same request always yields the same payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult, ValidationError};
use crate::money::{Money, TaxRate};
use crate::payload::{
    CfdiPayload, Concepto, ConceptoImpuestos, Emisor, Impuestos, InformacionGlobal, Receptor,
    Traslado, CFDI_VERSION, EXPORT_NONE, FACTOR_RATE, PAYMENT_METHOD_SINGLE, TAX_OBJECT_TAXABLE,
    TAX_VAT, VOUCHER_TYPE_INCOME,
};
use crate::tax::{decompose_lines, TaxBreakdown};
use crate::types::{InvoiceSeries, Issuer, PaymentMethod, Period, Recipient, Sale};
use crate::validation::{
    validate_currency, validate_description, validate_issuer, validate_product_key,
    validate_recipient, validate_required, validate_unit_key,
};
use crate::{
    GENERAL_PUBLIC_CFDI_USE, GENERAL_PUBLIC_NAME, GENERAL_PUBLIC_REGIME, GENERAL_PUBLIC_RFC,
    MAX_DESCRIPTION_LEN,
};

/// Line description used when products are not summarized.
pub const SALE_DESCRIPTION: &str = "Venta";

/// How a single-sale invoice is broken into lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LineMode {
    /// One opaque line for the whole sale.
    #[default]
    PerSale,
    /// One line per sold item.
    PerItem,
}

/// Everything one invoice is composed from.
#[derive(Debug, Clone, Copy)]
pub struct CompositionRequest<'a> {
    pub series: InvoiceSeries,
    pub folio: &'a str,
    pub sales: &'a [Sale],
    pub recipient: &'a Recipient,
    pub issuer: &'a Issuer,
    pub as_of: DateTime<Utc>,
    /// Required for global invoices.
    pub period: Option<Period>,
}

/// A composed payload together with its aggregate decomposition.
#[derive(Debug, Clone)]
pub struct ComposedInvoice {
    pub payload: CfdiPayload,
    pub totals: TaxBreakdown,
}

/// Builds certification payloads.
///
/// ## Example
/// ```rust
/// use chrono::Utc;
/// use fiscal_core::composer::{CompositionRequest, InvoiceComposer};
/// use fiscal_core::money::TaxRate;
/// use fiscal_core::types::*;
///
/// let issuer = Issuer {
///     rfc: "EKU9003173C9".into(),
///     legal_name: "ESCUELA KEMPER URGATE".into(),
///     fiscal_regime: "601".into(),
///     expedition_postal_code: "42501".into(),
/// };
/// let sale = Sale {
///     id: "S-1".into(),
///     client_id: None,
///     created_at: Utc::now(),
///     total_cents: 11600,
///     payment_method: PaymentMethod::Cash,
///     items: vec![],
///     billing_state: BillingState::Claimed,
///     claim_tag: None,
///     invoice_id: None,
///     global_invoice_id: None,
/// };
///
/// let composer = InvoiceComposer::new(TaxRate::from_bps(1600));
/// let composed = composer
///     .compose(&CompositionRequest {
///         series: InvoiceSeries::Individual,
///         folio: "000001",
///         sales: std::slice::from_ref(&sale),
///         recipient: &Recipient::GeneralPublic,
///         issuer: &issuer,
///         as_of: Utc::now(),
///         period: None,
///     })
///     .unwrap();
///
/// assert_eq!(composed.payload.sub_total.cents(), 10000);
/// assert_eq!(composed.payload.impuestos.total_impuestos_trasladados.cents(), 1600);
/// ```
#[derive(Debug, Clone)]
pub struct InvoiceComposer {
    tax_rate: TaxRate,
    line_mode: LineMode,
    currency: String,
    product_key: String,
    unit_key: String,
    summarize_products: bool,
}

/// A line before tax decomposition.
struct LineDraft {
    identification: String,
    quantity: i64,
    product_key: String,
    description: String,
    total: Money,
}

impl InvoiceComposer {
    /// Creates a composer with the default catalog keys (`01010101`, `ACT`),
    /// currency `MXN` and one line per sale.
    pub fn new(tax_rate: TaxRate) -> Self {
        Self {
            tax_rate,
            line_mode: LineMode::default(),
            currency: "MXN".to_string(),
            product_key: "01010101".to_string(),
            unit_key: "ACT".to_string(),
            summarize_products: false,
        }
    }

    pub fn with_line_mode(mut self, mode: LineMode) -> Self {
        self.line_mode = mode;
        self
    }

    pub fn with_currency(mut self, currency: impl Into<String>) -> Self {
        self.currency = currency.into();
        self
    }

    pub fn with_catalog_keys(
        mut self,
        product_key: impl Into<String>,
        unit_key: impl Into<String>,
    ) -> Self {
        self.product_key = product_key.into();
        self.unit_key = unit_key.into();
        self
    }

    /// Describe per-sale lines with the products sold instead of "Venta".
    pub fn with_product_summary(mut self, enabled: bool) -> Self {
        self.summarize_products = enabled;
        self
    }

    #[inline]
    pub fn tax_rate(&self) -> TaxRate {
        self.tax_rate
    }

    /// Decomposes the aggregate of `sales` without composing a payload.
    pub fn totals(&self, sales: &[Sale]) -> CoreResult<TaxBreakdown> {
        let lines: Vec<Money> = sales.iter().map(Sale::total).collect();
        let (_, aggregate) = decompose_lines(&lines, self.tax_rate)?;
        Ok(aggregate)
    }

    /// Composes the payload for `request`.
    ///
    /// Fails with [`CoreError::Validation`] on bad issuer, recipient or
    /// catalog data, before anything is sent anywhere.
    pub fn compose(&self, request: &CompositionRequest<'_>) -> CoreResult<ComposedInvoice> {
        if request.sales.is_empty() {
            return Err(CoreError::NoSales);
        }

        validate_required("folio", request.folio)?;
        validate_issuer(request.issuer)?;
        validate_recipient(request.recipient)?;
        validate_currency("invoice.currency", &self.currency)?;
        validate_product_key("invoice.product_key", &self.product_key)?;
        validate_unit_key("invoice.unit_key", &self.unit_key)?;

        let informacion_global = match request.series {
            InvoiceSeries::Global => {
                if !request.recipient.is_general_public() {
                    return Err(ValidationError::NotAllowed {
                        field: "recipient".to_string(),
                        allowed: vec![GENERAL_PUBLIC_RFC.to_string()],
                    }
                    .into());
                }
                let period = request.period.ok_or_else(|| ValidationError::Required {
                    field: "period".to_string(),
                })?;
                Some(InformacionGlobal {
                    periodicidad: period.periodicity_code().to_string(),
                    meses: period.month_code(),
                    anio: period.year().to_string(),
                })
            }
            InvoiceSeries::Individual => None,
        };

        let drafts = self.line_drafts(request)?;
        let line_totals: Vec<Money> = drafts.iter().map(|d| d.total).collect();
        let (breakdowns, totals) = decompose_lines(&line_totals, self.tax_rate)?;

        let rate = self.tax_rate.to_fraction_string();
        let conceptos = drafts
            .into_iter()
            .zip(&breakdowns)
            .map(|(draft, parts)| Concepto {
                clave_prod_serv: draft.product_key,
                no_identificacion: draft.identification,
                cantidad: draft.quantity,
                clave_unidad: self.unit_key.clone(),
                descripcion: draft.description,
                valor_unitario: parts.subtotal.unit_value_string(draft.quantity),
                importe: parts.subtotal,
                objeto_imp: TAX_OBJECT_TAXABLE.to_string(),
                impuestos: ConceptoImpuestos {
                    traslados: vec![self.traslado(parts, &rate)],
                },
            })
            .collect();

        let payload = CfdiPayload {
            version: CFDI_VERSION.to_string(),
            serie: request.series.tag().to_string(),
            folio: request.folio.to_string(),
            fecha: request.as_of.format("%Y-%m-%dT%H:%M:%S").to_string(),
            forma_pago: PaymentMethod::common_code(
                request.sales.iter().map(|s| &s.payment_method),
            )
            .to_string(),
            sub_total: totals.subtotal,
            moneda: self.currency.clone(),
            total: totals.total(),
            tipo_de_comprobante: VOUCHER_TYPE_INCOME.to_string(),
            exportacion: EXPORT_NONE.to_string(),
            metodo_pago: PAYMENT_METHOD_SINGLE.to_string(),
            lugar_expedicion: request.issuer.expedition_postal_code.clone(),
            informacion_global,
            emisor: Emisor {
                rfc: request.issuer.rfc.clone(),
                nombre: request.issuer.legal_name.clone(),
                regimen_fiscal: request.issuer.fiscal_regime.clone(),
            },
            receptor: receptor(request.recipient, request.issuer),
            conceptos,
            impuestos: Impuestos {
                total_impuestos_trasladados: totals.tax,
                traslados: vec![self.traslado(&totals, &rate)],
            },
        };

        Ok(ComposedInvoice { payload, totals })
    }

    fn line_drafts(&self, request: &CompositionRequest<'_>) -> CoreResult<Vec<LineDraft>> {
        let explode = self.line_mode == LineMode::PerItem
            && request.series == InvoiceSeries::Individual
            && request.sales.len() == 1
            && !request.sales[0].items.is_empty();

        if explode {
            let sale = &request.sales[0];
            if sale.items_total() != sale.total() {
                return Err(CoreError::ItemsDoNotMatchTotal {
                    sale_id: sale.id.clone(),
                    items_cents: sale.items_total().cents(),
                    total_cents: sale.total_cents,
                });
            }
            return sale
                .items
                .iter()
                .enumerate()
                .map(|(idx, item)| -> CoreResult<LineDraft> {
                    if item.quantity <= 0 {
                        return Err(ValidationError::MustBePositive {
                            field: format!("items[{}].quantity", idx),
                        }
                        .into());
                    }
                    let product_key = item
                        .product_key
                        .clone()
                        .unwrap_or_else(|| self.product_key.clone());
                    validate_product_key(&format!("items[{}].product_key", idx), &product_key)?;
                    validate_description(&format!("items[{}].description", idx), &item.description)?;
                    Ok(LineDraft {
                        identification: item.product_id.clone(),
                        quantity: item.quantity,
                        product_key,
                        description: item.description.clone(),
                        total: item.line_total(),
                    })
                })
                .collect();
        }

        Ok(request
            .sales
            .iter()
            .map(|sale| LineDraft {
                identification: sale.id.clone(),
                quantity: 1,
                product_key: self.product_key.clone(),
                description: self.sale_description(sale),
                total: sale.total(),
            })
            .collect())
    }

    fn sale_description(&self, sale: &Sale) -> String {
        if !self.summarize_products || sale.items.is_empty() {
            return SALE_DESCRIPTION.to_string();
        }
        let text = format!("{} - {}", SALE_DESCRIPTION, sale.product_summary());
        text.chars().take(MAX_DESCRIPTION_LEN).collect()
    }

    fn traslado(&self, parts: &TaxBreakdown, rate: &str) -> Traslado {
        Traslado {
            base: parts.subtotal,
            impuesto: TAX_VAT.to_string(),
            tipo_factor: FACTOR_RATE.to_string(),
            tasa_o_cuota: rate.to_string(),
            importe: parts.tax,
        }
    }
}

fn receptor(recipient: &Recipient, issuer: &Issuer) -> Receptor {
    match recipient {
        Recipient::GeneralPublic => Receptor {
            rfc: GENERAL_PUBLIC_RFC.to_string(),
            nombre: GENERAL_PUBLIC_NAME.to_string(),
            domicilio_fiscal_receptor: issuer.expedition_postal_code.clone(),
            regimen_fiscal_receptor: GENERAL_PUBLIC_REGIME.to_string(),
            uso_cfdi: GENERAL_PUBLIC_CFDI_USE.to_string(),
        },
        Recipient::Registered(profile) => Receptor {
            rfc: profile.rfc.clone(),
            nombre: profile.legal_name.clone(),
            domicilio_fiscal_receptor: profile.postal_code.clone(),
            regimen_fiscal_receptor: profile.fiscal_regime.clone(),
            uso_cfdi: profile.cfdi_use.clone(),
        },
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
