//! Plans, entitlement records and the quota/feature policy.
//!
//! Everything in here is synchronous and free of I/O. Persistence lives in
//! [`crate::ledger`], enforcement in [`crate::gate`].

mod error;
pub mod plans;
pub mod policy;
mod record;

pub use error::EntitlementError;
pub use plans::{features, PlanCatalog, PlanCatalogBuilder, PlanDefinition, Quota, FREE, PREMIUM, THERAPY};
pub use policy::{Action, Decision, DenyReason, PolicyEngine};
pub use record::{month_start, EntitlementRecord, SubscriptionStatus};
