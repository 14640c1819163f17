//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the application services and port interfaces
//! that define how the domain interacts with venues and consumers.

/// Port interfaces for the connection, venue codecs, consumers and telemetry.
pub mod ports;

/// Application services for subscription management.
pub mod services;
