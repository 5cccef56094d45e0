//! Record Normalizer
//!
//! Maps one raw API record onto the typed draft shape. Every rule here is a
//! pure function of the input record: same input, same draft (or same
//! rejection reason).

pub mod borough;

pub use borough::{Borough, BOROUGH_TABLE};

use crate::ingestion::connector::RawRecord;
use chrono::{Datelike, NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Decimal places kept for `price_per_sqft`.
pub const PRICE_PER_SQFT_DECIMALS: i32 = 2;

/// Namespace for natural keys derived from address + date + price.
const SALE_KEY_NAMESPACE: Uuid = Uuid::from_u128(0x5f0c_92d1_7b3e_4a8c_9e21_46d0_b7a3_c815);

/// Accepted field names, in priority order. Source schemas drift between
/// exports, so each canonical field has a few spellings.
const SALE_ID_FIELDS: &[&str] = &["sale_id"];
const BOROUGH_FIELDS: &[&str] = &["borough", "borough_code", "boro"];
const NEIGHBORHOOD_FIELDS: &[&str] = &["neighborhood"];
const BUILDING_CLASS_FIELDS: &[&str] = &["building_class_category", "building_class"];
const ADDRESS_FIELDS: &[&str] = &["address"];
const APARTMENT_FIELDS: &[&str] = &["apartment_number", "apartment"];
const PRICE_FIELDS: &[&str] = &["sale_price", "price"];
const DATE_FIELDS: &[&str] = &["sale_date", "date"];
const SQFT_FIELDS: &[&str] = &["gross_square_feet", "gross_sqft", "sqft"];

/// Placeholder when the source omits the building class category.
pub const UNKNOWN_BUILDING_CLASS: &str = "UNKNOWN";

/// Why a raw record could not be normalized.
#[derive(Error, Debug, Clone, PartialEq, Eq, Hash)]
pub enum MalformedRecord {
    #[error("unmapped borough value {0:?}")]
    UnknownBorough(String),

    #[error("missing required field {0}")]
    MissingField(&'static str),

    #[error("field {field} is not a number: {value:?}")]
    InvalidNumber { field: &'static str, value: String },

    #[error("unparsable sale date {0:?}")]
    InvalidDate(String),
}

impl MalformedRecord {
    /// Stable short label used when counting rejections.
    pub fn reason_code(&self) -> String {
        match self {
            MalformedRecord::UnknownBorough(_) => "unknown borough".to_string(),
            MalformedRecord::MissingField(field) => format!("missing {}", field),
            MalformedRecord::InvalidNumber { field, .. } => format!("invalid {}", field),
            MalformedRecord::InvalidDate(_) => "invalid sale_date".to_string(),
        }
    }
}

/// A structurally valid record that has not been validated yet.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DraftRecord {
    pub sale_id: String,
    /// `None` when the source left the borough empty
    pub borough: Option<Borough>,
    pub neighborhood: Option<String>,
    pub building_class_category: String,
    pub address: Option<String>,
    pub sale_price: f64,
    pub sale_date: NaiveDate,
    pub gross_sqft: Option<f64>,
    pub price_per_sqft: Option<f64>,
    pub sale_year: i32,
    pub sale_month: u32,
}

pub type NormalizationResult = Result<DraftRecord, MalformedRecord>;

/// Case- and spacing-insensitive view over a raw record's fields.
struct Fields<'a> {
    by_key: HashMap<String, &'a Value>,
}

impl<'a> Fields<'a> {
    fn new(record: &'a RawRecord) -> Self {
        let by_key = record
            .iter()
            .map(|(k, v)| (field_key(k), v))
            .collect();
        Self { by_key }
    }

    fn value(&self, aliases: &[&str]) -> Option<&'a Value> {
        aliases
            .iter()
            .filter_map(|alias| self.by_key.get(*alias).copied())
            .find(|v| !is_blank(v))
    }

    fn text(&self, aliases: &[&str]) -> Option<String> {
        self.value(aliases).and_then(value_text)
    }
}

/// Snake-cased field name: `"SALE PRICE"` and `"sale-price"` both map to `sale_price`.
pub(crate) fn field_key(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn value_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => {
            let collapsed = s.split_whitespace().collect::<Vec<_>>().join(" ");
            if collapsed.is_empty() {
                None
            } else {
                Some(collapsed)
            }
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        other => Some(other.to_string()),
    }
}

/// Parse a numeric field. Accepts JSON numbers and strings such as
/// `"$1,250,000"`; a lone dash (the source's "no amount") reads as zero.
fn parse_number(field: &'static str, value: &Value) -> Result<f64, MalformedRecord> {
    let invalid = || MalformedRecord::InvalidNumber {
        field,
        value: value.to_string(),
    };
    let parsed = match value {
        Value::Number(n) => n.as_f64().ok_or_else(invalid)?,
        Value::String(s) => {
            let cleaned: String = s
                .chars()
                .filter(|c| !c.is_whitespace() && *c != ',' && *c != '$')
                .collect();
            if cleaned == "-" {
                0.0
            } else {
                cleaned.parse::<f64>().map_err(|_| invalid())?
            }
        }
        _ => return Err(invalid()),
    };
    if parsed.is_finite() {
        Ok(parsed)
    } else {
        Err(invalid())
    }
}

/// Parse the source's date representations: ISO dates, Socrata floating
/// timestamps (`2024-01-15T00:00:00.000`) and US `MM/DD/YYYY`.
pub fn parse_sale_date(raw: &str) -> Option<NaiveDate> {
    let raw = raw.trim();
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date);
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(ts) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(ts.date());
        }
    }
    NaiveDate::parse_from_str(raw, "%m/%d/%Y").ok()
}

pub fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// `sale_price / gross_sqft`, rounded; `None` without a usable area.
pub fn price_per_sqft(sale_price: f64, gross_sqft: Option<f64>) -> Option<f64> {
    match gross_sqft {
        Some(sqft) if sqft > 0.0 => Some(round_to(sale_price / sqft, PRICE_PER_SQFT_DECIMALS)),
        _ => None,
    }
}

/// Natural key from borough code + address + sale date + sale price.
/// A record without a borough uses code 0.
pub fn natural_key(
    borough: Option<Borough>,
    address: Option<&str>,
    sale_date: NaiveDate,
    sale_price: f64,
) -> String {
    let address = address.map(|a| a.to_uppercase()).unwrap_or_default();
    let material = format!(
        "{}|{}|{}|{:.2}",
        borough.map(|b| b.code()).unwrap_or(0),
        address,
        sale_date.format("%Y-%m-%d"),
        sale_price
    );
    Uuid::new_v5(&SALE_KEY_NAMESPACE, material.as_bytes()).to_string()
}

/// Normalize one raw record.
pub fn normalize(raw: &RawRecord) -> NormalizationResult {
    let fields = Fields::new(raw);

    let borough = match fields.value(BOROUGH_FIELDS) {
        None => None,
        Some(value) => Some(Borough::from_value(value).ok_or_else(|| {
            MalformedRecord::UnknownBorough(value_text(value).unwrap_or_default())
        })?),
    };

    let date_text = fields
        .text(DATE_FIELDS)
        .ok_or(MalformedRecord::MissingField("sale_date"))?;
    let sale_date =
        parse_sale_date(&date_text).ok_or_else(|| MalformedRecord::InvalidDate(date_text.clone()))?;

    let sale_price = match fields.value(PRICE_FIELDS) {
        Some(value) => parse_number("sale_price", value)?,
        None => return Err(MalformedRecord::MissingField("sale_price")),
    };

    let gross_sqft = match fields.value(SQFT_FIELDS) {
        // Area is optional; an unreadable value counts as unknown.
        Some(value) => parse_number("gross_sqft", value).ok().filter(|sqft| *sqft > 0.0),
        None => None,
    };

    let address = match (fields.text(ADDRESS_FIELDS), fields.text(APARTMENT_FIELDS)) {
        (Some(street), Some(apt)) => Some(format!("{}, {}", street, apt)),
        (street, _) => street,
    };

    let sale_id = fields
        .text(SALE_ID_FIELDS)
        .unwrap_or_else(|| natural_key(borough, address.as_deref(), sale_date, sale_price));

    Ok(DraftRecord {
        sale_id,
        borough,
        neighborhood: fields.text(NEIGHBORHOOD_FIELDS),
        building_class_category: fields
            .text(BUILDING_CLASS_FIELDS)
            .unwrap_or_else(|| UNKNOWN_BUILDING_CLASS.to_string()),
        address,
        sale_price,
        sale_date,
        gross_sqft,
        price_per_sqft: price_per_sqft(sale_price, gross_sqft),
        sale_year: sale_date.year(),
        sale_month: sale_date.month(),
    })
}
