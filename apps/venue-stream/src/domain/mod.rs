//! Domain Layer - Core stream types and business rules.
//!
//! Frames, parsed market data envelopes and the subscription state machine.
//! Nothing here performs I/O.

/// Inbound/outbound frame types.
pub mod frame;

/// Parsed market data envelopes (funding, klines, position updates).
pub mod envelope;

/// Subscription tracking and lifecycle state.
pub mod subscription;
