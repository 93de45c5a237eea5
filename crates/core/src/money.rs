//! Monetary amounts as fixed-point decimals.
//!
//! `Money` pairs a `rust_decimal` amount with an ISO-4217 currency code.
//! Amounts carry at most two decimal places; anything computed (tax, levies)
//! goes through [`Money::rounded`], the single rounding point, which rounds
//! half-up (midpoint away from zero).

use core::fmt;
use core::ops::{Add, Sub};
use core::str::FromStr;

use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// Number of decimal places carried by monetary amounts.
pub const MONEY_SCALE: u32 = 2;

/// ISO-4217 alpha-3 currency code.
///
/// Construction is the only validation point: three ASCII uppercase letters.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Currency([u8; 3]);

impl Currency {
    pub const EUR: Currency = Currency(*b"EUR");
    pub const USD: Currency = Currency(*b"USD");

    pub fn new(code: &str) -> DomainResult<Self> {
        let bytes = code.as_bytes();
        if bytes.len() != 3 || !bytes.iter().all(|b| b.is_ascii_uppercase()) {
            return Err(DomainError::validation(format!(
                "currency code must be three uppercase letters, got {code:?}"
            )));
        }
        Ok(Self([bytes[0], bytes[1], bytes[2]]))
    }
}

impl ValueObject for Currency {}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            write!(f, "{}", b as char)?;
        }
        Ok(())
    }
}

impl FromStr for Currency {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Currency {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Currency> for String {
    fn from(value: Currency) -> Self {
        value.to_string()
    }
}

/// A fixed-point monetary amount in a single currency.
///
/// Arithmetic between two `Money` values requires matching currencies;
/// mixing currencies is a programming error and panics. Recoverable checks
/// (negative totals, missing rates) live in the domain layer, not here.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Money {
    amount: Decimal,
    currency: Currency,
}

impl Money {
    /// Create a monetary amount, rejecting more than two decimal places.
    pub fn new(amount: Decimal, currency: Currency) -> DomainResult<Self> {
        if amount.scale() > MONEY_SCALE {
            return Err(DomainError::validation(format!(
                "monetary amounts carry at most {MONEY_SCALE} decimal places, got {amount}"
            )));
        }
        Ok(Self { amount, currency })
    }

    /// Round an arbitrary-precision amount half-up to the money scale.
    ///
    /// This is the one place computed amounts get rounded; callers must not
    /// round again.
    pub fn rounded(amount: Decimal, currency: Currency) -> Self {
        Self {
            amount: amount
                .round_dp_with_strategy(MONEY_SCALE, RoundingStrategy::MidpointAwayFromZero),
            currency,
        }
    }

    pub fn zero(currency: Currency) -> Self {
        Self {
            amount: Decimal::ZERO,
            currency,
        }
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn is_negative(&self) -> bool {
        self.amount.is_sign_negative() && !self.amount.is_zero()
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }
}

impl ValueObject for Money {}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

impl Add for Money {
    type Output = Money;

    /// Panics if the currencies differ.
    fn add(self, rhs: Money) -> Money {
        assert_eq!(
            self.currency, rhs.currency,
            "currency mismatch in Money addition"
        );
        Money {
            amount: self.amount + rhs.amount,
            currency: self.currency,
        }
    }
}

impl Sub for Money {
    type Output = Money;

    /// Panics if the currencies differ.
    fn sub(self, rhs: Money) -> Money {
        assert_eq!(
            self.currency, rhs.currency,
            "currency mismatch in Money subtraction"
        );
        Money {
            amount: self.amount - rhs.amount,
            currency: self.currency,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn rejects_invalid_currency_codes() {
        assert!(Currency::new("eur").is_err());
        assert!(Currency::new("EURO").is_err());
        assert!(Currency::new("E1").is_err());
        assert_eq!(Currency::new("EUR").unwrap(), Currency::EUR);
    }

    #[test]
    fn rejects_sub_cent_amounts() {
        let err = Money::new(dec!(1.005), Currency::EUR).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        assert!(Money::new(dec!(1.00), Currency::EUR).is_ok());
    }

    #[test]
    fn rounds_half_up_away_from_zero() {
        assert_eq!(
            Money::rounded(dec!(2.345), Currency::EUR).amount(),
            dec!(2.35)
        );
        assert_eq!(
            Money::rounded(dec!(2.344), Currency::EUR).amount(),
            dec!(2.34)
        );
        assert_eq!(
            Money::rounded(dec!(-2.345), Currency::EUR).amount(),
            dec!(-2.35)
        );
    }

    #[test]
    fn adds_and_subtracts_matching_currency() {
        let a = Money::new(dec!(10.50), Currency::EUR).unwrap();
        let b = Money::new(dec!(0.25), Currency::EUR).unwrap();
        assert_eq!((a + b).amount(), dec!(10.75));
        assert_eq!((a - b).amount(), dec!(10.25));
    }

    #[test]
    #[should_panic(expected = "currency mismatch")]
    fn mixing_currencies_panics() {
        let eur = Money::zero(Currency::EUR);
        let usd = Money::zero(Currency::USD);
        let _ = eur + usd;
    }

    #[test]
    fn serde_round_trip() {
        let money = Money::new(dec!(199.99), Currency::USD).unwrap();
        let json = serde_json::to_string(&money).unwrap();
        let back: Money = serde_json::from_str(&json).unwrap();
        assert_eq!(money, back);
    }

    #[test]
    fn negative_and_zero_flags() {
        assert!(Money::rounded(dec!(-0.01), Currency::EUR).is_negative());
        assert!(!Money::zero(Currency::EUR).is_negative());
        assert!(Money::zero(Currency::EUR).is_zero());
    }
}
