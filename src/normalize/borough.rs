//! Borough lookup table
//!
//! The source mixes numeric codes, abbreviations, full names and county
//! names. Every accepted spelling is listed here; anything else is unmapped.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Borough {
    Manhattan,
    Bronx,
    Brooklyn,
    Queens,
    #[serde(rename = "Staten Island")]
    StatenIsland,
}

impl Borough {
    pub const ALL: [Borough; 5] = [
        Borough::Manhattan,
        Borough::Bronx,
        Borough::Brooklyn,
        Borough::Queens,
        Borough::StatenIsland,
    ];

    /// Canonical name stored in the analytical table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Borough::Manhattan => "Manhattan",
            Borough::Bronx => "Bronx",
            Borough::Brooklyn => "Brooklyn",
            Borough::Queens => "Queens",
            Borough::StatenIsland => "Staten Island",
        }
    }

    /// Department of Finance borough code.
    pub fn code(&self) -> u8 {
        match self {
            Borough::Manhattan => 1,
            Borough::Bronx => 2,
            Borough::Brooklyn => 3,
            Borough::Queens => 4,
            Borough::StatenIsland => 5,
        }
    }

    pub fn from_canonical(name: &str) -> Option<Borough> {
        Borough::ALL.into_iter().find(|b| b.as_str() == name)
    }

    /// Map a raw spelling (already trimmed) through [`BOROUGH_TABLE`].
    pub fn lookup(raw: &str) -> Option<Borough> {
        let key = canonical_key(raw);
        BOROUGH_TABLE
            .iter()
            .find(|(spelling, _)| *spelling == key)
            .map(|(_, borough)| *borough)
    }

    /// Map a raw JSON value; numbers are treated as borough codes.
    pub fn from_value(value: &Value) -> Option<Borough> {
        match value {
            Value::Number(n) => {
                let code = n.as_f64()?;
                if code.fract() != 0.0 {
                    return None;
                }
                Borough::lookup(&format!("{}", code as i64))
            }
            Value::String(s) => Borough::lookup(s),
            _ => None,
        }
    }
}

impl fmt::Display for Borough {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Upper-case, collapse runs of whitespace, drop trailing ".0" on codes.
fn canonical_key(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ").to_uppercase();
    match collapsed.strip_suffix(".0") {
        Some(code) if code.chars().all(|c| c.is_ascii_digit()) => code.to_string(),
        _ => collapsed,
    }
}

/// Every accepted raw spelling, keyed by its canonical (upper-case) form.
pub const BOROUGH_TABLE: &[(&str, Borough)] = &[
    ("1", Borough::Manhattan),
    ("MN", Borough::Manhattan),
    ("MH", Borough::Manhattan),
    ("MAN", Borough::Manhattan),
    ("MANHATTAN", Borough::Manhattan),
    ("NEW YORK", Borough::Manhattan),
    ("NEW YORK COUNTY", Borough::Manhattan),
    ("2", Borough::Bronx),
    ("BX", Borough::Bronx),
    ("BRX", Borough::Bronx),
    ("BRONX", Borough::Bronx),
    ("THE BRONX", Borough::Bronx),
    ("BRONX COUNTY", Borough::Bronx),
    ("3", Borough::Brooklyn),
    ("BK", Borough::Brooklyn),
    ("BKN", Borough::Brooklyn),
    ("BRK", Borough::Brooklyn),
    ("BROOKLYN", Borough::Brooklyn),
    ("KINGS", Borough::Brooklyn),
    ("KINGS COUNTY", Borough::Brooklyn),
    ("4", Borough::Queens),
    ("QN", Borough::Queens),
    ("QNS", Borough::Queens),
    ("QU", Borough::Queens),
    ("QUEENS", Borough::Queens),
    ("QUEENS COUNTY", Borough::Queens),
    ("5", Borough::StatenIsland),
    ("SI", Borough::StatenIsland),
    ("STI", Borough::StatenIsland),
    ("STATEN ISLAND", Borough::StatenIsland),
    ("STATEN IS", Borough::StatenIsland),
    ("RICHMOND", Borough::StatenIsland),
    ("RICHMOND COUNTY", Borough::StatenIsland),
];
