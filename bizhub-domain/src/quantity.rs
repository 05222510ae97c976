//! Quantities with a unit of measure

use crate::error::{DomainError, DomainResult};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Non-negative decimal quantity in a unit of measure (`PCS`, `KG`, ...).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Quantity {
    value: Decimal,
    unit: String,
}

impl Quantity {
    pub fn new(value: Decimal, unit: &str) -> DomainResult<Self> {
        let unit = unit.trim().to_ascii_uppercase();
        if unit.is_empty() || unit.len() > 10 || !unit.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(DomainError::InvalidUnit(unit));
        }
        if value.is_sign_negative() && !value.is_zero() {
            return Err(DomainError::InvalidValue(format!(
                "quantity cannot be negative: {value}"
            )));
        }
        Ok(Self { value, unit })
    }

    pub fn zero(unit: &str) -> DomainResult<Self> {
        Self::new(Decimal::ZERO, unit)
    }

    pub fn value(&self) -> Decimal {
        self.value
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn is_zero(&self) -> bool {
        self.value.is_zero()
    }

    fn ensure_same_unit(&self, other: &Quantity) -> DomainResult<()> {
        if self.unit != other.unit {
            return Err(DomainError::UnitMismatch {
                left: self.unit.clone(),
                right: other.unit.clone(),
            });
        }
        Ok(())
    }

    pub fn checked_add(&self, other: &Quantity) -> DomainResult<Quantity> {
        self.ensure_same_unit(other)?;
        let value = self.value.checked_add(other.value).ok_or_else(overflow)?;
        Self::new(value, &self.unit)
    }

    /// Subtract; fails if the result would be negative (e.g. over-issuing stock).
    pub fn checked_sub(&self, other: &Quantity) -> DomainResult<Quantity> {
        self.ensure_same_unit(other)?;
        let value = self.value.checked_sub(other.value).ok_or_else(overflow)?;
        Self::new(value, &self.unit)
    }

    pub fn scale(&self, factor: Decimal) -> DomainResult<Quantity> {
        let value = self.value.checked_mul(factor).ok_or_else(overflow)?;
        Self::new(value, &self.unit)
    }
}

fn overflow() -> DomainError {
    DomainError::InvalidValue("quantity overflow".to_string())
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.value, self.unit)
    }
}
