//! Value objects owned by the invoicing domain.
//!
//! All of them validate at construction and are immutable afterwards, so the
//! aggregate never re-checks a held value.

use chrono::{Datelike, NaiveDate};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use fakturo_core::{Currency, DomainError, DomainResult, Money, ValueObject};
use fakturo_tax::{LineTaxes, TaxCategory};

/// Monthly fiscal period key, rendered as `YYYY-MM`.
///
/// Derived from the issue date; scopes document numbering.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct FiscalPeriod {
    year: i32,
    month: u32,
}

impl FiscalPeriod {
    pub fn from_date(date: NaiveDate) -> Self {
        Self {
            year: date.year(),
            month: date.month(),
        }
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        let (year, month) = s
            .split_once('-')
            .ok_or_else(|| DomainError::validation(format!("fiscal period must be YYYY-MM, got {s:?}")))?;
        let year: i32 = year
            .parse()
            .map_err(|_| DomainError::validation(format!("fiscal period year invalid in {s:?}")))?;
        let month: u32 = month
            .parse()
            .map_err(|_| DomainError::validation(format!("fiscal period month invalid in {s:?}")))?;
        if year < 1 || year > 9999 || !(1..=12).contains(&month) {
            return Err(DomainError::validation(format!(
                "fiscal period out of range: {s:?}"
            )));
        }
        Ok(Self { year, month })
    }

    pub fn year(&self) -> i32 {
        self.year
    }

    pub fn month(&self) -> u32 {
        self.month
    }
}

impl ValueObject for FiscalPeriod {}

impl core::fmt::Display for FiscalPeriod {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

impl core::str::FromStr for FiscalPeriod {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for FiscalPeriod {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FiscalPeriod> for String {
    fn from(value: FiscalPeriod) -> Self {
        value.to_string()
    }
}

/// Sequences per fiscal period are six digits wide; one period never issues more.
const DOCUMENT_SEQUENCE_MAX: u64 = 999_999;

/// Approved-invoice document number: `INV-YYYY-MM-NNNNNN`.
///
/// Unique within `(tenant, fiscal period)`; the sequence part comes from the
/// repository's atomic counter.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentNumber {
    period: FiscalPeriod,
    sequence: u64,
}

impl DocumentNumber {
    pub fn from_sequence(period: FiscalPeriod, sequence: u64) -> DomainResult<Self> {
        if sequence == 0 || sequence > DOCUMENT_SEQUENCE_MAX {
            return Err(DomainError::validation(format!(
                "document sequence must be within 1..={DOCUMENT_SEQUENCE_MAX}, got {sequence}"
            )));
        }
        Ok(Self { period, sequence })
    }

    pub fn parse(s: &str) -> DomainResult<Self> {
        let rest = s
            .strip_prefix("INV-")
            .ok_or_else(|| DomainError::validation(format!("document number must start with INV-, got {s:?}")))?;
        let (period, sequence) = rest
            .rsplit_once('-')
            .ok_or_else(|| DomainError::validation(format!("malformed document number: {s:?}")))?;
        if sequence.len() != 6 || !sequence.bytes().all(|b| b.is_ascii_digit()) {
            return Err(DomainError::validation(format!(
                "document sequence must be six digits, got {s:?}"
            )));
        }
        let period = FiscalPeriod::parse(period)?;
        let sequence: u64 = sequence
            .parse()
            .map_err(|_| DomainError::validation(format!("malformed document number: {s:?}")))?;
        Self::from_sequence(period, sequence)
    }

    pub fn period(&self) -> FiscalPeriod {
        self.period
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

impl ValueObject for DocumentNumber {}

impl core::fmt::Display for DocumentNumber {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "INV-{}-{:06}", self.period, self.sequence)
    }
}

impl core::str::FromStr for DocumentNumber {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for DocumentNumber {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<DocumentNumber> for String {
    fn from(value: DocumentNumber) -> Self {
        value.to_string()
    }
}

/// Counterparty tax registration: two country letters + 8..=12 alphanumerics.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TaxIdentifier(String);

impl TaxIdentifier {
    pub fn new(value: impl Into<String>) -> DomainResult<Self> {
        let value = value.into();
        let bytes = value.as_bytes();
        let country_ok = bytes.len() >= 2 && bytes[..2].iter().all(|b| b.is_ascii_uppercase());
        let body = &bytes[bytes.len().min(2)..];
        let body_ok =
            (8..=12).contains(&body.len()) && body.iter().all(|b| b.is_ascii_alphanumeric());
        if !country_ok || !body_ok {
            return Err(DomainError::validation(format!(
                "tax identifier must be CC + 8..=12 alphanumerics, got {value:?}"
            )));
        }
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ValueObject for TaxIdentifier {}

impl core::fmt::Display for TaxIdentifier {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl core::str::FromStr for TaxIdentifier {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for TaxIdentifier {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<TaxIdentifier> for String {
    fn from(value: TaxIdentifier) -> Self {
        value.0
    }
}

/// One invoice line with its computed amounts.
///
/// The only constructor takes the [`LineTaxes`] computed for exactly these
/// inputs and cross-checks them, so tax/levies can never drift from
/// quantity/price/category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    line_no: u32,
    description: String,
    quantity: Decimal,
    unit_price: Money,
    tax_category: TaxCategory,
    net: Money,
    tax: Money,
    levies: Money,
    rate_label: String,
}

impl LineItem {
    pub fn priced(
        line_no: u32,
        description: impl Into<String>,
        quantity: Decimal,
        unit_price: Money,
        tax_category: TaxCategory,
        taxes: LineTaxes,
    ) -> DomainResult<Self> {
        let description = description.into();
        if description.trim().is_empty() {
            return Err(DomainError::validation("line description must not be empty"));
        }
        if quantity <= Decimal::ZERO {
            return Err(DomainError::validation(format!(
                "line quantity must be positive, got {quantity}"
            )));
        }
        if unit_price.is_negative() {
            return Err(DomainError::validation(format!(
                "line unit price must not be negative, got {unit_price}"
            )));
        }
        let expected_net = Money::rounded(unit_price.amount() * quantity, unit_price.currency());
        if taxes.net != expected_net {
            return Err(DomainError::invariant(format!(
                "computed net {} does not match quantity * unit price {}",
                taxes.net, expected_net
            )));
        }
        Ok(Self {
            line_no,
            description,
            quantity,
            unit_price,
            tax_category,
            net: taxes.net,
            tax: taxes.tax,
            levies: taxes.levies,
            rate_label: taxes.rate_label,
        })
    }

    pub fn line_no(&self) -> u32 {
        self.line_no
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn quantity(&self) -> Decimal {
        self.quantity
    }

    pub fn unit_price(&self) -> Money {
        self.unit_price
    }

    pub fn tax_category(&self) -> TaxCategory {
        self.tax_category
    }

    pub fn net(&self) -> Money {
        self.net
    }

    pub fn tax(&self) -> Money {
        self.tax
    }

    pub fn levies(&self) -> Money {
        self.levies
    }

    pub fn rate_label(&self) -> &str {
        &self.rate_label
    }
}

impl ValueObject for LineItem {}

/// Flattened invoice totals.
///
/// Always derived from the current line items via [`Totals::from_lines`];
/// `grand_total = subtotal + tax + levies` holds by construction, and
/// withholding is reported separately: `amount_due = grand_total - withholding`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    subtotal: Money,
    tax: Money,
    levies: Money,
    grand_total: Money,
    withholding: Money,
    amount_due: Money,
}

impl Totals {
    pub fn zero(currency: Currency) -> Self {
        Self::from_lines(currency, &[], Money::zero(currency))
    }

    pub fn from_lines(currency: Currency, lines: &[LineItem], withholding: Money) -> Self {
        let zero = Money::zero(currency);
        let subtotal = lines.iter().fold(zero, |acc, l| acc + l.net());
        let tax = lines.iter().fold(zero, |acc, l| acc + l.tax());
        let levies = lines.iter().fold(zero, |acc, l| acc + l.levies());
        let grand_total = subtotal + tax + levies;
        Self {
            subtotal,
            tax,
            levies,
            grand_total,
            withholding,
            amount_due: grand_total - withholding,
        }
    }

    pub fn subtotal(&self) -> Money {
        self.subtotal
    }

    pub fn tax(&self) -> Money {
        self.tax
    }

    pub fn levies(&self) -> Money {
        self.levies
    }

    pub fn grand_total(&self) -> Money {
        self.grand_total
    }

    pub fn withholding(&self) -> Money {
        self.withholding
    }

    pub fn amount_due(&self) -> Money {
        self.amount_due
    }

    pub fn any_negative(&self) -> bool {
        self.subtotal.is_negative()
            || self.tax.is_negative()
            || self.levies.is_negative()
            || self.grand_total.is_negative()
    }
}

impl ValueObject for Totals {}
