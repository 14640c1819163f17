//! Infrastructure Layer - Adapters and external integrations.
//!
//! This layer contains the concrete implementations of the port interfaces
//! defined in the application layer.

/// Payload encoders (JSON, `MessagePack`).
pub mod codec;

/// Configuration and environment loading.
pub mod config;

/// Request/response correlation table.
pub mod correlation;

/// Inbound frame routing.
pub mod dispatch;

/// Prometheus metrics instrumentation.
pub mod metrics;

/// Logging and OpenTelemetry tracing integration.
pub mod telemetry;

/// WebSocket transport, keep-alive pings, rate limiting and proxying.
pub mod websocket;
