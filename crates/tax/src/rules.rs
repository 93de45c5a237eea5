//! Effective-dated tax rate tables.
//!
//! Rates are configuration, not code: a [`JurisdictionRules`] value is built
//! at startup (or loaded from wherever a deployment keeps it) and handed to
//! the aggregate. The aggregate never hardcodes a rate.

use core::str::FromStr;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use fakturo_core::{DomainError, ValueObject};

/// Tax category of a line item (rate tier selector).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaxCategory {
    Standard,
    Reduced,
    Minimal,
    Exempt,
}

impl TaxCategory {
    pub const ALL: [TaxCategory; 4] = [
        TaxCategory::Standard,
        TaxCategory::Reduced,
        TaxCategory::Minimal,
        TaxCategory::Exempt,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TaxCategory::Standard => "standard",
            TaxCategory::Reduced => "reduced",
            TaxCategory::Minimal => "minimal",
            TaxCategory::Exempt => "exempt",
        }
    }
}

impl core::fmt::Display for TaxCategory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaxCategory {
    type Err = TaxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "standard" => Ok(TaxCategory::Standard),
            "reduced" => Ok(TaxCategory::Reduced),
            "minimal" => Ok(TaxCategory::Minimal),
            "exempt" => Ok(TaxCategory::Exempt),
            other => Err(TaxError::UnknownCategory(other.to_string())),
        }
    }
}

/// Rate table construction / lookup errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaxError {
    #[error("unknown tax category: {0}")]
    UnknownCategory(String),

    #[error("rate {0} is outside [0, 1]")]
    RateOutOfRange(Decimal),

    #[error("rate label must not be empty")]
    EmptyLabel,

    #[error("band ends on {effective_to} before it starts on {effective_from}")]
    InvertedPeriod {
        effective_from: NaiveDate,
        effective_to: NaiveDate,
    },

    #[error("overlapping {category} bands around {at}")]
    OverlappingBands { category: TaxCategory, at: NaiveDate },

    #[error("no {category} rate in effect on {as_of}")]
    NoRateInEffect {
        category: TaxCategory,
        as_of: NaiveDate,
    },

    #[error("overlapping withholding rules around {at}")]
    OverlappingWithholding { at: NaiveDate },
}

impl From<TaxError> for DomainError {
    fn from(err: TaxError) -> Self {
        match err {
            // Lookup misses are business rejections: the document references
            // a rate the jurisdiction does not define for that date.
            TaxError::NoRateInEffect { .. } => DomainError::invariant(err.to_string()),
            _ => DomainError::validation(err.to_string()),
        }
    }
}

/// One effective-dated rate band.
///
/// `effective_from` is inclusive, `effective_to` exclusive; an open end means
/// the band applies indefinitely.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateBand {
    category: TaxCategory,
    /// Fraction of the net amount, e.g. 0.21 for 21%.
    rate: Decimal,
    /// Additional levy fraction charged on the same net amount.
    levy_rate: Decimal,
    /// Human-readable label recorded on the line (e.g. "standard 21%").
    label: String,
    effective_from: NaiveDate,
    effective_to: Option<NaiveDate>,
}

impl RateBand {
    pub fn new(
        category: TaxCategory,
        rate: Decimal,
        levy_rate: Decimal,
        label: impl Into<String>,
        effective_from: NaiveDate,
        effective_to: Option<NaiveDate>,
    ) -> Result<Self, TaxError> {
        let label = label.into();
        check_fraction(rate)?;
        check_fraction(levy_rate)?;
        if label.trim().is_empty() {
            return Err(TaxError::EmptyLabel);
        }
        if let Some(to) = effective_to
            && to <= effective_from
        {
            return Err(TaxError::InvertedPeriod {
                effective_from,
                effective_to: to,
            });
        }
        Ok(Self {
            category,
            rate,
            levy_rate,
            label,
            effective_from,
            effective_to,
        })
    }

    pub fn category(&self) -> TaxCategory {
        self.category
    }

    pub fn rate(&self) -> Decimal {
        self.rate
    }

    pub fn levy_rate(&self) -> Decimal {
        self.levy_rate
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn effective_from(&self) -> NaiveDate {
        self.effective_from
    }

    pub fn effective_to(&self) -> Option<NaiveDate> {
        self.effective_to
    }

    fn in_effect_on(&self, as_of: NaiveDate) -> bool {
        self.effective_from <= as_of && self.effective_to.is_none_or(|to| as_of < to)
    }
}

impl ValueObject for RateBand {}

/// Invoice-level withholding deduction, effective-dated like a band.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithholdingRule {
    /// Fraction of the invoice subtotal withheld.
    rate: Decimal,
    label: String,
    effective_from: NaiveDate,
    effective_to: Option<NaiveDate>,
}

impl WithholdingRule {
    pub fn new(
        rate: Decimal,
        label: impl Into<String>,
        effective_from: NaiveDate,
        effective_to: Option<NaiveDate>,
    ) -> Result<Self, TaxError> {
        let label = label.into();
        check_fraction(rate)?;
        if label.trim().is_empty() {
            return Err(TaxError::EmptyLabel);
        }
        if let Some(to) = effective_to
            && to <= effective_from
        {
            return Err(TaxError::InvertedPeriod {
                effective_from,
                effective_to: to,
            });
        }
        Ok(Self {
            rate,
            label,
            effective_from,
            effective_to,
        })
    }

    pub fn rate(&self) -> Decimal {
        self.rate
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    fn in_effect_on(&self, as_of: NaiveDate) -> bool {
        self.effective_from <= as_of && self.effective_to.is_none_or(|to| as_of < to)
    }
}

impl ValueObject for WithholdingRule {}

/// Versioned rate tables for one jurisdiction.
///
/// Construction validates the whole table (fractions in range, no
/// overlapping bands per category, no overlapping withholding rules), so a
/// held value always yields at most one band per `(category, date)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JurisdictionRules {
    jurisdiction: String,
    version: u32,
    bands: Vec<RateBand>,
    withholding: Vec<WithholdingRule>,
}

impl JurisdictionRules {
    pub fn new(
        jurisdiction: impl Into<String>,
        version: u32,
        bands: Vec<RateBand>,
        withholding: Vec<WithholdingRule>,
    ) -> Result<Self, TaxError> {
        for category in TaxCategory::ALL {
            let mut in_category: Vec<&RateBand> =
                bands.iter().filter(|b| b.category == category).collect();
            in_category.sort_by_key(|b| b.effective_from);
            for pair in in_category.windows(2) {
                if pair[0].effective_to.is_none_or(|to| to > pair[1].effective_from) {
                    return Err(TaxError::OverlappingBands {
                        category,
                        at: pair[1].effective_from,
                    });
                }
            }
        }

        let mut rules: Vec<&WithholdingRule> = withholding.iter().collect();
        rules.sort_by_key(|r| r.effective_from);
        for pair in rules.windows(2) {
            if pair[0].effective_to.is_none_or(|to| to > pair[1].effective_from) {
                return Err(TaxError::OverlappingWithholding {
                    at: pair[1].effective_from,
                });
            }
        }

        Ok(Self {
            jurisdiction: jurisdiction.into(),
            version,
            bands,
            withholding,
        })
    }

    pub fn jurisdiction(&self) -> &str {
        &self.jurisdiction
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// The band in effect for `(category, as_of)`, or a typed lookup miss.
    pub fn band_for(
        &self,
        category: TaxCategory,
        as_of: NaiveDate,
    ) -> Result<&RateBand, TaxError> {
        self.bands
            .iter()
            .find(|b| b.category == category && b.in_effect_on(as_of))
            .ok_or(TaxError::NoRateInEffect { category, as_of })
    }

    /// The withholding rule in effect on `as_of`, if the jurisdiction has one.
    pub fn withholding_for(&self, as_of: NaiveDate) -> Option<&WithholdingRule> {
        self.withholding.iter().find(|r| r.in_effect_on(as_of))
    }
}

fn check_fraction(rate: Decimal) -> Result<(), TaxError> {
    if rate < Decimal::ZERO || rate > Decimal::ONE {
        return Err(TaxError::RateOutOfRange(rate));
    }
    Ok(())
}
