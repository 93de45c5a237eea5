//! `fakturo-core` — domain foundation building blocks.
//!
//! Pure domain primitives shared by every crate in the workspace: aggregate
//! traits, strongly-typed identifiers, monetary values, and the domain error
//! model. No infrastructure concerns.

pub mod aggregate;
pub mod error;
pub mod id;
pub mod money;
pub mod value_object;

pub use aggregate::{Aggregate, AggregateRoot, ExpectedVersion};
pub use error::{DomainError, DomainResult};
pub use id::{AggregateId, TenantId, UserId};
pub use money::{Currency, Money, MONEY_SCALE};
pub use value_object::ValueObject;
