//! Application Ports (Driver and Driven)
//!
//! Ports define interfaces for interacting with external systems.
//! - **Driver Ports** (Primary/Inbound): consumer handlers fed by the dispatcher
//! - **Driven Ports** (Secondary/Outbound): the venue connection, venue
//!   decoders/encoders, the event channel and the latency reporter

mod connection_port;
mod consumer_port;
mod event_port;
mod reporter_port;
mod venue_port;

pub use connection_port::{
    Connection, ConnectionExt, CorrelationId, DEFAULT_HANDSHAKE_TIMEOUT, DialerConfig, HeaderMap,
    PingHandler, StreamError,
};
pub use consumer_port::{ConsumerHandler, ConsumerRegistry, Envelope, PayloadKind};
pub use event_port::{EventSink, StreamEvent};
pub use reporter_port::{NoopReporter, Reporter, report_latency};
pub use venue_port::{CodecError, Decoded, FrameClassifier, PayloadEncoder, SubscriptionCodec};

#[cfg(test)]
pub use connection_port::MockConnection;
