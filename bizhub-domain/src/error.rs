//! Error types for value objects

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    #[error("Currency mismatch: {left} vs {right}")]
    CurrencyMismatch { left: String, right: String },

    #[error("Unit mismatch: {left} vs {right}")]
    UnitMismatch { left: String, right: String },

    #[error("Invalid currency code: {0}")]
    InvalidCurrency(String),

    #[error("Invalid unit of measure: {0}")]
    InvalidUnit(String),

    #[error("Invalid date range: {start} is after {end}")]
    InvalidRange { start: String, end: String },

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

pub type DomainResult<T> = std::result::Result<T, DomainError>;
