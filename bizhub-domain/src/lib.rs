//! Shared value objects for bizhub
//!
//! Immutable, self-validating primitives used across the business modules
//! (CRM, inventory, accounting, HR).
//!
//! - [`Money`] - decimal amount tagged with an ISO-4217 currency code
//! - [`Quantity`] - decimal amount tagged with a unit of measure
//! - [`DateRange`] - inclusive calendar range with `start <= end`
//!
//! ```
//! use bizhub_domain::Money;
//! use rust_decimal::Decimal;
//!
//! let net = Money::new(Decimal::new(10_000, 2), "usd").unwrap();
//! let tax = Money::new(Decimal::new(1_800, 2), "USD").unwrap();
//! let gross = net.checked_add(&tax).unwrap();
//! assert_eq!(gross.to_string(), "118.00 USD");
//! ```

pub mod date_range;
pub mod error;
pub mod money;
pub mod quantity;

pub use date_range::DateRange;
pub use error::{DomainError, DomainResult};
pub use money::Money;
pub use quantity::Quantity;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::date_range::DateRange;
    pub use crate::error::{DomainError, DomainResult};
    pub use crate::money::Money;
    pub use crate::quantity::Quantity;
}
