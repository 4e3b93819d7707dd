//! Monetary amounts.
//!
//! Every stored or compared amount passes through [`normalize`]: two decimal
//! places, round half to even. [`Money`] is the normalized form and cannot be
//! built any other way.

use crate::error::LedgerError;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Number of fractional digits kept for every amount.
pub const SCALE: u32 = 2;

/// Round to [`SCALE`] digits, half to even, and pad to exactly that scale.
///
/// # Examples
///
/// ```
/// use rust_decimal::Decimal;
/// use tally_core::money::normalize;
///
/// assert_eq!(normalize(Decimal::new(10_005, 3)).to_string(), "10.00");
/// assert_eq!(normalize(Decimal::new(10_015, 3)).to_string(), "10.02");
/// assert_eq!(normalize(Decimal::from(7)).to_string(), "7.00");
/// ```
#[must_use]
pub fn normalize(amount: Decimal) -> Decimal {
    let mut rounded = amount.round_dp_with_strategy(SCALE, RoundingStrategy::MidpointNearestEven);
    rounded.rescale(SCALE);
    rounded
}

/// Validate that an optional raw amount is present and strictly positive
/// once normalized.
///
/// # Errors
///
/// Returns [`LedgerError::InvalidAmount`] when the amount is absent, zero,
/// negative, or rounds to zero.
pub fn validate_positive(amount: Option<Decimal>) -> Result<Money, LedgerError> {
    let raw = amount.ok_or_else(|| LedgerError::InvalidAmount("amount is required".into()))?;
    Money::positive(raw)
}

/// A normalized monetary amount.
///
/// Balances use `Money` too, so the type itself allows zero; operations that
/// require a positive amount go through [`Money::positive`].
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(from = "Decimal", into = "Decimal")]
pub struct Money(Decimal);

impl Money {
    /// Zero, at scale 2.
    #[must_use]
    pub fn zero() -> Self {
        Self::new(Decimal::ZERO)
    }

    /// Normalize an arbitrary decimal.
    #[must_use]
    pub fn new(amount: Decimal) -> Self {
        Self(normalize(amount))
    }

    /// Normalize and require a strictly positive result.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidAmount`] for zero or negative amounts.
    pub fn positive(amount: Decimal) -> Result<Self, LedgerError> {
        let money = Self::new(amount);
        if money.0 <= Decimal::ZERO {
            return Err(LedgerError::InvalidAmount(format!(
                "amount must be positive, got {amount}"
            )));
        }
        Ok(money)
    }

    /// The underlying decimal.
    #[must_use]
    pub const fn amount(self) -> Decimal {
        self.0
    }

    /// `true` when strictly greater than zero.
    #[must_use]
    pub fn is_positive(self) -> bool {
        self.0 > Decimal::ZERO
    }

    /// Add two amounts.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidAmount`] on decimal overflow.
    pub fn checked_add(self, other: Self) -> Result<Self, LedgerError> {
        self.0
            .checked_add(other.0)
            .map(Self::new)
            .ok_or_else(|| LedgerError::InvalidAmount("amount overflow".into()))
    }

    /// Subtract `other` from `self`.
    ///
    /// # Errors
    ///
    /// Returns [`LedgerError::InvalidAmount`] on decimal overflow.
    pub fn checked_sub(self, other: Self) -> Result<Self, LedgerError> {
        self.0
            .checked_sub(other.0)
            .map(Self::new)
            .ok_or_else(|| LedgerError::InvalidAmount("amount overflow".into()))
    }
}

impl From<Decimal> for Money {
    fn from(amount: Decimal) -> Self {
        Self::new(amount)
    }
}

impl From<Money> for Decimal {
    fn from(money: Money) -> Self {
        money.0
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Supported account and card currencies.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    /// US dollar, the default for provisioned accounts and cards.
    #[default]
    Usd,
    /// Euro.
    Eur,
}

impl Currency {
    /// ISO 4217 code.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Usd => "USD",
            Self::Eur => "EUR",
        }
    }
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Currency {
    type Err = LedgerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "USD" => Ok(Self::Usd),
            "EUR" => Ok(Self::Eur),
            other => Err(LedgerError::Validation(format!("unsupported currency '{other}'"))),
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use proptest::prelude::*;

    fn dec(s: &str) -> Decimal {
        s.parse().unwrap()
    }

    #[test]
    fn normalize_rounds_half_to_even() {
        assert_eq!(normalize(dec("1.005")), dec("1.00"));
        assert_eq!(normalize(dec("1.015")), dec("1.02"));
        assert_eq!(normalize(dec("1.025")), dec("1.02"));
        assert_eq!(normalize(dec("-1.005")), dec("-1.00"));
        assert_eq!(normalize(dec("100")).to_string(), "100.00");
    }

    #[test]
    fn validate_positive_rejects_missing_zero_and_negative() {
        assert!(matches!(validate_positive(None), Err(LedgerError::InvalidAmount(_))));
        assert!(matches!(
            validate_positive(Some(Decimal::ZERO)),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            validate_positive(Some(dec("-5"))),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            validate_positive(Some(dec("0.004"))),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert!(matches!(
            validate_positive(Some(dec("0.005"))),
            Err(LedgerError::InvalidAmount(_))
        ));
        assert_eq!(validate_positive(Some(dec("0.015"))).unwrap(), Money::new(dec("0.02")));
    }

    #[test]
    fn money_serializes_as_normalized_string() {
        let money = Money::new(dec("12.5"));
        assert_eq!(serde_json::to_string(&money).unwrap(), "\"12.50\"");
        let parsed: Money = serde_json::from_str("\"12.505\"").unwrap();
        assert_eq!(parsed, Money::new(dec("12.50")));
    }

    #[test]
    fn currency_codes() {
        assert_eq!(Currency::Usd.to_string(), "USD");
        assert_eq!("EUR".parse::<Currency>().unwrap(), Currency::Eur);
        assert!("GBP".parse::<Currency>().is_err());
        assert_eq!(serde_json::to_string(&Currency::Usd).unwrap(), "\"USD\"");
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(units in -1_000_000_000i64..1_000_000_000, scale in 0u32..6) {
            let value = Decimal::new(units, scale);
            let once = normalize(value);
            prop_assert_eq!(normalize(once), once);
            prop_assert_eq!(once.scale(), SCALE);
        }
    }
}
