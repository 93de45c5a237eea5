//! `fakturo-tax` — pure tax rule engine.
//!
//! Computes per-line tax and levies plus invoice-level withholding from
//! versioned, effective-dated jurisdiction rate tables. No IO, no clock, no
//! state: everything an amount depends on arrives as an argument, which is
//! what makes event replay safe.

pub mod engine;
pub mod rules;

pub use engine::{LineInput, LineTaxes, compute_line, compute_withholding};
pub use rules::{JurisdictionRules, RateBand, TaxCategory, TaxError, WithholdingRule};
