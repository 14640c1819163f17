//! WebSocket Transport
//!
//! The [`WebSocketConnection`] adapter and the pieces of its send path:
//! rate limiting, keep-alive pings and HTTP CONNECT proxying.

mod connection;
pub mod ping;
pub mod proxy;
pub mod rate_limit;

pub use connection::{SendPath, WebSocketConnection};
pub use ping::{FrameSink, PingScheduler, PingTracker};
pub use proxy::ProxyEndpoint;
pub use rate_limit::RateLimiter;
