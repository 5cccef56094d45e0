//! Validator / Filter
//!
//! Turns drafts into canonical records, rejecting the ones that break the
//! table's invariants and tagging natural-key repeats. Outlier flagging
//! needs the whole generation, so only the fence arithmetic lives here; the
//! loader applies it per borough before the swap.

use crate::normalize::{Borough, DraftRecord};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// Cleaned, typed transaction ready for loading.
///
/// Invariants: `sale_price > 0`; `price_per_sqft` is derived from
/// `sale_price / gross_sqft` and is `None` whenever `gross_sqft` is.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CanonicalRecord {
    pub sale_id: String,
    pub borough: Borough,
    pub neighborhood: Option<String>,
    pub building_class_category: String,
    pub address: Option<String>,
    pub sale_price: f64,
    pub sale_date: NaiveDate,
    pub gross_sqft: Option<f64>,
    pub price_per_sqft: Option<f64>,
    pub sale_year: i32,
    pub sale_month: u32,
    pub is_outlier: bool,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RejectReason {
    #[error("non-positive price")]
    NonPositivePrice,

    #[error("missing borough")]
    MissingBorough,
}

#[derive(Clone, Debug, PartialEq)]
pub enum ValidationOutcome {
    Accepted(CanonicalRecord),
    Rejected(RejectReason),
    Deduplicated,
}

/// Validate one draft against the keys accepted so far in this run.
///
/// Only accepted records claim their key, so a rejected record never
/// shadows a later valid one.
pub fn validate(draft: DraftRecord, seen_keys: &mut HashSet<String>) -> ValidationOutcome {
    if !(draft.sale_price > 0.0) {
        return ValidationOutcome::Rejected(RejectReason::NonPositivePrice);
    }
    let borough = match draft.borough {
        Some(borough) => borough,
        None => return ValidationOutcome::Rejected(RejectReason::MissingBorough),
    };
    if seen_keys.contains(&draft.sale_id) {
        return ValidationOutcome::Deduplicated;
    }
    seen_keys.insert(draft.sale_id.clone());

    ValidationOutcome::Accepted(CanonicalRecord {
        sale_id: draft.sale_id,
        borough,
        neighborhood: draft.neighborhood,
        building_class_category: draft.building_class_category,
        address: draft.address,
        sale_price: draft.sale_price,
        sale_date: draft.sale_date,
        gross_sqft: draft.gross_sqft,
        price_per_sqft: draft.price_per_sqft,
        sale_year: draft.sale_year,
        sale_month: draft.sale_month,
        is_outlier: false,
    })
}

/// Run-scoped validator that owns the seen-key set.
#[derive(Debug, Default)]
pub struct Validator {
    seen_keys: HashSet<String>,
}

impl Validator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn validate(&mut self, draft: DraftRecord) -> ValidationOutcome {
        validate(draft, &mut self.seen_keys)
    }

    pub fn accepted_keys(&self) -> usize {
        self.seen_keys.len()
    }
}

/// Inclusive bounds outside of which a value is an outlier.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Fences {
    pub q1: f64,
    pub q3: f64,
    pub lower: f64,
    pub upper: f64,
}

impl Fences {
    pub fn is_outlier(&self, value: f64) -> bool {
        value < self.lower || value > self.upper
    }
}

/// Flags `price_per_sqft` values beyond `iqr_multiple` IQRs from the
/// per-borough quartiles. Flagged records are kept, never dropped.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct OutlierPolicy {
    pub iqr_multiple: f64,
    /// Boroughs with fewer values than this are never flagged
    pub min_sample: usize,
}

impl Default for OutlierPolicy {
    fn default() -> Self {
        Self {
            iqr_multiple: 3.0,
            min_sample: 4,
        }
    }
}

impl OutlierPolicy {
    pub fn new(iqr_multiple: f64) -> Self {
        Self {
            iqr_multiple,
            ..Self::default()
        }
    }

    /// Fences for one borough's `price_per_sqft` values (any order).
    pub fn fences(&self, values: &[f64]) -> Option<Fences> {
        if values.len() < self.min_sample.max(1) {
            return None;
        }
        let mut sorted: Vec<f64> = values.iter().copied().filter(|v| v.is_finite()).collect();
        if sorted.len() < self.min_sample.max(1) {
            return None;
        }
        sorted.sort_by(|a, b| a.total_cmp(b));

        let q1 = quantile(&sorted, 0.25);
        let q3 = quantile(&sorted, 0.75);
        let spread = (q3 - q1) * self.iqr_multiple;
        Some(Fences {
            q1,
            q3,
            lower: q1 - spread,
            upper: q3 + spread,
        })
    }
}

/// Linear-interpolated quantile of an ascending, non-empty slice.
fn quantile(sorted: &[f64], p: f64) -> f64 {
    let pos = p * (sorted.len() - 1) as f64;
    let lo = pos.floor() as usize;
    let hi = pos.ceil() as usize;
    sorted[lo] + (sorted[hi] - sorted[lo]) * (pos - lo as f64)
}
