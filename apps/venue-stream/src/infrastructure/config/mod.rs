//! Configuration Module
//!
//! Per-connection setup and the environment-variable loader.

mod settings;

pub use settings::{
    ConfigError, ConnectionSetup, DEFAULT_PING_INTERVAL, DEFAULT_RESPONSE_CHECK_TIMEOUT,
    DEFAULT_RESPONSE_MAX_LIMIT, StreamSettings,
};
