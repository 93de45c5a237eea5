//! Pure tax computation.
//!
//! Deterministic by construction: the only inputs are the line, the rate
//! table, and the as-of date, so replaying history recomputes byte-identical
//! amounts. Rounding happens exactly once per computed amount, half-up via
//! [`Money::rounded`].

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use fakturo_core::{Money, ValueObject};

use crate::rules::{JurisdictionRules, TaxCategory, TaxError};

/// Inputs for one line's computation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineInput {
    pub quantity: Decimal,
    pub unit_price: Money,
    pub category: TaxCategory,
}

/// Computed amounts for one line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineTaxes {
    /// quantity * unit price, rounded to the money scale.
    pub net: Money,
    pub tax: Money,
    pub levies: Money,
    /// Label of the band that produced `tax`/`levies`.
    pub rate_label: String,
}

impl ValueObject for LineTaxes {}

/// Compute tax and levies for a single line.
///
/// Tax and levies are charged on the rounded net amount, so the three
/// outputs always agree with each other regardless of the raw precision of
/// `quantity * unit_price`.
pub fn compute_line(
    input: &LineInput,
    rules: &JurisdictionRules,
    as_of: NaiveDate,
) -> Result<LineTaxes, TaxError> {
    let band = rules.band_for(input.category, as_of)?;
    let currency = input.unit_price.currency();

    let net = Money::rounded(input.unit_price.amount() * input.quantity, currency);
    let tax = Money::rounded(net.amount() * band.rate(), currency);
    let levies = Money::rounded(net.amount() * band.levy_rate(), currency);

    Ok(LineTaxes {
        net,
        tax,
        levies,
        rate_label: band.label().to_string(),
    })
}

/// Compute the invoice-level withholding deduction on a subtotal.
///
/// A jurisdiction without a withholding rule in effect withholds nothing;
/// that is not an error.
pub fn compute_withholding(
    subtotal: Money,
    rules: &JurisdictionRules,
    as_of: NaiveDate,
) -> Money {
    match rules.withholding_for(as_of) {
        Some(rule) => Money::rounded(subtotal.amount() * rule.rate(), subtotal.currency()),
        None => Money::zero(subtotal.currency()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::{RateBand, WithholdingRule};
    use fakturo_core::Currency;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn rules() -> JurisdictionRules {
        let from = date(2025, 1, 1);
        JurisdictionRules::new(
            "NL",
            1,
            vec![
                RateBand::new(TaxCategory::Standard, dec!(0.21), dec!(0.005), "standard 21%", from, None)
                    .unwrap(),
                RateBand::new(TaxCategory::Reduced, dec!(0.09), dec!(0.005), "reduced 9%", from, None)
                    .unwrap(),
                RateBand::new(TaxCategory::Minimal, dec!(0.04), dec!(0), "minimal 4%", from, None)
                    .unwrap(),
                RateBand::new(TaxCategory::Exempt, dec!(0), dec!(0), "exempt", from, None).unwrap(),
            ],
            vec![WithholdingRule::new(dec!(0.02), "wht 2%", from, None).unwrap()],
        )
        .unwrap()
    }

    fn line(quantity: Decimal, unit_price: Decimal, category: TaxCategory) -> LineInput {
        LineInput {
            quantity,
            unit_price: Money::new(unit_price, Currency::EUR).unwrap(),
            category,
        }
    }

    #[test]
    fn standard_line_matches_hand_computation() {
        let taxes = compute_line(
            &line(dec!(2), dec!(500.00), TaxCategory::Standard),
            &rules(),
            date(2025, 1, 10),
        )
        .unwrap();

        assert_eq!(taxes.net.amount(), dec!(1000.00));
        assert_eq!(taxes.tax.amount(), dec!(210.00));
        assert_eq!(taxes.levies.amount(), dec!(5.00));
        assert_eq!(taxes.rate_label, "standard 21%");
    }

    #[test]
    fn exempt_lines_carry_zero_tax() {
        let taxes = compute_line(
            &line(dec!(3), dec!(19.99), TaxCategory::Exempt),
            &rules(),
            date(2025, 2, 1),
        )
        .unwrap();

        assert_eq!(taxes.net.amount(), dec!(59.97));
        assert!(taxes.tax.is_zero());
        assert!(taxes.levies.is_zero());
        assert_eq!(taxes.rate_label, "exempt");
    }

    #[test]
    fn fractional_quantities_round_once() {
        // 1.5 * 33.33 = 49.995 -> 50.00 net; tax on the rounded net
        let taxes = compute_line(
            &line(dec!(1.5), dec!(33.33), TaxCategory::Standard),
            &rules(),
            date(2025, 3, 1),
        )
        .unwrap();

        assert_eq!(taxes.net.amount(), dec!(50.00));
        assert_eq!(taxes.tax.amount(), dec!(10.50));
    }

    #[test]
    fn missing_band_surfaces_lookup_error() {
        let err = compute_line(
            &line(dec!(1), dec!(10.00), TaxCategory::Standard),
            &rules(),
            date(2024, 12, 31),
        )
        .unwrap_err();
        assert!(matches!(err, TaxError::NoRateInEffect { .. }));
    }

    #[test]
    fn withholding_applies_when_a_rule_is_in_effect() {
        let subtotal = Money::new(dec!(1000.00), Currency::EUR).unwrap();
        let withheld = compute_withholding(subtotal, &rules(), date(2025, 1, 10));
        assert_eq!(withheld.amount(), dec!(20.00));
    }

    #[test]
    fn withholding_is_zero_without_a_rule() {
        let bare = JurisdictionRules::new(
            "NL",
            1,
            vec![RateBand::new(
                TaxCategory::Standard,
                dec!(0.21),
                dec!(0),
                "standard 21%",
                date(2025, 1, 1),
                None,
            )
            .unwrap()],
            vec![],
        )
        .unwrap();

        let subtotal = Money::new(dec!(1000.00), Currency::EUR).unwrap();
        assert!(compute_withholding(subtotal, &bare, date(2025, 1, 10)).is_zero());
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 256, ..Default::default() })]

        /// Identical inputs always produce identical outputs.
        #[test]
        fn computation_is_deterministic(
            qty_cents in 1i64..10_000i64,
            price_cents in 0i64..1_000_000i64,
            category_idx in 0usize..4,
        ) {
            let input = line(
                Decimal::new(qty_cents, 2),
                Decimal::new(price_cents, 2),
                TaxCategory::ALL[category_idx],
            );
            let as_of = date(2025, 6, 15);

            let first = compute_line(&input, &rules(), as_of).unwrap();
            let second = compute_line(&input, &rules(), as_of).unwrap();
            prop_assert_eq!(first, second);
        }

        /// Outputs are non-negative, money-scaled, and bounded by the rate.
        #[test]
        fn outputs_are_well_formed(
            qty_cents in 1i64..10_000i64,
            price_cents in 0i64..1_000_000i64,
            category_idx in 0usize..4,
        ) {
            let input = line(
                Decimal::new(qty_cents, 2),
                Decimal::new(price_cents, 2),
                TaxCategory::ALL[category_idx],
            );
            let taxes = compute_line(&input, &rules(), date(2025, 6, 15)).unwrap();

            prop_assert!(!taxes.net.is_negative());
            prop_assert!(!taxes.tax.is_negative());
            prop_assert!(!taxes.levies.is_negative());
            prop_assert!(taxes.tax.amount().scale() <= 2);
            prop_assert!(taxes.levies.amount().scale() <= 2);
            // rate <= 1, so tax can exceed net only by the rounding half-cent
            prop_assert!(taxes.tax.amount() <= taxes.net.amount() + dec!(0.005));
        }
    }
}
