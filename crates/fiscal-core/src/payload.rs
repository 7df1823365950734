//! # Certification Payload
//!
//! The typed JSON document sent to the certification authority (CFDI 4.0
//! in its JSON form). Field names follow the authority's schema exactly,
//! amounts are two-decimal strings.
//!
//! ```text
//! CfdiPayload
//! ├── Version, Serie, Folio, Fecha, FormaPago, SubTotal, Moneda, Total,
//! │   TipoDeComprobante, Exportacion, MetodoPago, LugarExpedicion
//! ├── InformacionGlobal?  { Periodicidad, Meses, Año }     (global only)
//! ├── Emisor              { Rfc, Nombre, RegimenFiscal }
//! ├── Receptor            { Rfc, Nombre, DomicilioFiscalReceptor,
//! │                         RegimenFiscalReceptor, UsoCFDI }
//! ├── Conceptos[]         { ClaveProdServ, NoIdentificacion, Cantidad,
//! │                         ClaveUnidad, Descripcion, ValorUnitario,
//! │                         Importe, ObjetoImp, Impuestos.Traslados[] }
//! └── Impuestos           { TotalImpuestosTrasladados, Traslados[] }
//! ```

use serde::{Deserialize, Serialize};

use crate::money::{decimal, Money};

pub const CFDI_VERSION: &str = "4.0";
/// `TipoDeComprobante` for income documents.
pub const VOUCHER_TYPE_INCOME: &str = "I";
/// `Exportacion`: not an export.
pub const EXPORT_NONE: &str = "01";
/// `MetodoPago`: paid in a single installment.
pub const PAYMENT_METHOD_SINGLE: &str = "PUE";
/// `ObjetoImp`: subject to tax.
pub const TAX_OBJECT_TAXABLE: &str = "02";
/// `Impuesto` code for VAT.
pub const TAX_VAT: &str = "002";
/// `TipoFactor` for percentage rates.
pub const FACTOR_RATE: &str = "Tasa";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CfdiPayload {
    pub version: String,
    pub serie: String,
    pub folio: String,
    /// Issue timestamp, `YYYY-MM-DDTHH:MM:SS`.
    pub fecha: String,
    pub forma_pago: String,
    #[serde(with = "decimal")]
    pub sub_total: Money,
    pub moneda: String,
    #[serde(with = "decimal")]
    pub total: Money,
    pub tipo_de_comprobante: String,
    pub exportacion: String,
    pub metodo_pago: String,
    pub lugar_expedicion: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub informacion_global: Option<InformacionGlobal>,
    pub emisor: Emisor,
    pub receptor: Receptor,
    pub conceptos: Vec<Concepto>,
    pub impuestos: Impuestos,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InformacionGlobal {
    #[serde(rename = "Periodicidad")]
    pub periodicidad: String,
    #[serde(rename = "Meses")]
    pub meses: String,
    #[serde(rename = "Año")]
    pub anio: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Emisor {
    pub rfc: String,
    pub nombre: String,
    pub regimen_fiscal: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Receptor {
    pub rfc: String,
    pub nombre: String,
    pub domicilio_fiscal_receptor: String,
    pub regimen_fiscal_receptor: String,
    #[serde(rename = "UsoCFDI")]
    pub uso_cfdi: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Concepto {
    pub clave_prod_serv: String,
    pub no_identificacion: String,
    pub cantidad: i64,
    pub clave_unidad: String,
    pub descripcion: String,
    /// Six-decimal string; unit values need not be whole cents.
    pub valor_unitario: String,
    #[serde(with = "decimal")]
    pub importe: Money,
    pub objeto_imp: String,
    pub impuestos: ConceptoImpuestos,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ConceptoImpuestos {
    pub traslados: Vec<Traslado>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Traslado {
    #[serde(with = "decimal")]
    pub base: Money,
    pub impuesto: String,
    pub tipo_factor: String,
    pub tasa_o_cuota: String,
    #[serde(with = "decimal")]
    pub importe: Money,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Impuestos {
    #[serde(with = "decimal")]
    pub total_impuestos_trasladados: Money,
    pub traslados: Vec<Traslado>,
}

impl CfdiPayload {
    /// Serializes the payload the way it is sent and stored.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }

    /// Sum of line amounts (`Importe`), i.e. the document subtotal.
    pub fn concept_total(&self) -> Money {
        self.conceptos.iter().map(|c| c.importe).sum()
    }
}
