//! Authentication, subscription tiers and usage telemetry
//!
//! Both the sign-in service and the billing service are external HTTP collaborators.
//! They sit behind [`AuthGateway`] and [`UsageReporter`] so the control plane can be
//! exercised without them.

pub mod gateway;
pub mod tier;
pub mod usage;

pub use gateway::{AuthError, AuthGateway, Credentials, HttpAuthGateway, SignIn};
pub use tier::{SubscriptionTier, TierLimits, TierTable, UnknownTier};
pub use usage::{HttpUsageReporter, NoopUsageReporter, UsageError, UsageReporter};
