//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `SubscriptionService`: Drives subscribe/unsubscribe round trips

mod subscription_service;

pub use subscription_service::{SubscribeOutcome, SubscriptionError, SubscriptionService};
