//! Monetary amounts

use crate::error::{DomainError, DomainResult};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Decimal amount in a single currency.
///
/// Arithmetic between two amounts is only defined for the same currency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    amount: Decimal,
    currency: String,
}

impl Money {
    /// Create an amount, normalising the currency code to upper case.
    pub fn new(amount: Decimal, currency: &str) -> DomainResult<Self> {
        let currency = currency.trim().to_ascii_uppercase();
        if currency.len() != 3 || !currency.chars().all(|c| c.is_ascii_uppercase()) {
            return Err(DomainError::InvalidCurrency(currency));
        }
        Ok(Self { amount, currency })
    }

    /// Zero in the given currency.
    pub fn zero(currency: &str) -> DomainResult<Self> {
        Self::new(Decimal::ZERO, currency)
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn currency(&self) -> &str {
        &self.currency
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    pub fn is_negative(&self) -> bool {
        self.amount.is_sign_negative() && !self.amount.is_zero()
    }

    fn ensure_same_currency(&self, other: &Money) -> DomainResult<()> {
        if self.currency != other.currency {
            return Err(DomainError::CurrencyMismatch {
                left: self.currency.clone(),
                right: other.currency.clone(),
            });
        }
        Ok(())
    }

    /// Add two amounts of the same currency.
    pub fn checked_add(&self, other: &Money) -> DomainResult<Money> {
        self.ensure_same_currency(other)?;
        let amount = self
            .amount
            .checked_add(other.amount)
            .ok_or_else(|| DomainError::InvalidValue("amount overflow".to_string()))?;
        Ok(Self {
            amount,
            currency: self.currency.clone(),
        })
    }

    /// Subtract an amount of the same currency.
    pub fn checked_sub(&self, other: &Money) -> DomainResult<Money> {
        self.ensure_same_currency(other)?;
        let amount = self
            .amount
            .checked_sub(other.amount)
            .ok_or_else(|| DomainError::InvalidValue("amount overflow".to_string()))?;
        Ok(Self {
            amount,
            currency: self.currency.clone(),
        })
    }

    /// Multiply by a scalar factor (quantity, rate, ...).
    pub fn multiply(&self, factor: Decimal) -> DomainResult<Money> {
        let amount = self
            .amount
            .checked_mul(factor)
            .ok_or_else(|| DomainError::InvalidValue("amount overflow".to_string()))?;
        Ok(Self {
            amount,
            currency: self.currency.clone(),
        })
    }

    /// Round half away from zero to `decimals` places.
    #[must_use]
    pub fn round(&self, decimals: u32) -> Money {
        Self {
            amount: self
                .amount
                .round_dp_with_strategy(decimals, RoundingStrategy::MidpointAwayFromZero),
            currency: self.currency.clone(),
        }
    }

    #[must_use]
    pub fn negate(&self) -> Money {
        Self {
            amount: -self.amount,
            currency: self.currency.clone(),
        }
    }

    /// Sum a sequence of amounts; all must share `currency`.
    pub fn sum<'a, I>(currency: &str, items: I) -> DomainResult<Money>
    where
        I: IntoIterator<Item = &'a Money>,
    {
        items
            .into_iter()
            .try_fold(Money::zero(currency)?, |acc, m| acc.checked_add(m))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usd(cents: i64) -> Money {
        Money::new(Decimal::new(cents, 2), "USD").unwrap()
    }

    #[test]
    fn test_currency_is_normalised() {
        let m = Money::new(Decimal::ONE, " eur ").unwrap();
        assert_eq!(m.currency(), "EUR");
    }

    #[test]
    fn test_invalid_currency_rejected() {
        assert!(matches!(
            Money::new(Decimal::ONE, "EURO"),
            Err(DomainError::InvalidCurrency(_))
        ));
        assert!(Money::new(Decimal::ONE, "U1D").is_err());
    }

    #[test]
    fn test_add_same_currency() {
        let total = usd(1050).checked_add(&usd(250)).unwrap();
        assert_eq!(total.amount(), Decimal::new(1300, 2));
    }

    #[test]
    fn test_mixed_currency_rejected() {
        let eur = Money::new(Decimal::ONE, "EUR").unwrap();
        let err = usd(100).checked_add(&eur).unwrap_err();
        assert_eq!(
            err,
            DomainError::CurrencyMismatch {
                left: "USD".to_string(),
                right: "EUR".to_string()
            }
        );
    }

    #[test]
    fn test_round_half_away_from_zero() {
        let m = Money::new(Decimal::new(12345, 3), "USD").unwrap();
        assert_eq!(m.round(2).amount(), Decimal::new(1235, 2));
        assert_eq!(m.negate().round(2).amount(), Decimal::new(-1235, 2));
    }

    #[test]
    fn test_sum() {
        let items = [usd(100), usd(200), usd(300)];
        let total = Money::sum("USD", items.iter()).unwrap();
        assert_eq!(total.amount(), Decimal::new(600, 2));
    }

    #[test]
    fn test_negative() {
        assert!(usd(100).checked_sub(&usd(250)).unwrap().is_negative());
        assert!(!Money::zero("USD").unwrap().is_negative());
    }
}
