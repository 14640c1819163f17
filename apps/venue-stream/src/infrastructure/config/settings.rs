//! Connection Settings
//!
//! `ConnectionSetup` is the per-connection configuration a host builds in
//! code. `StreamSettings` is the optional environment-variable surface for
//! hosts that prefer to configure a venue link through `{PREFIX}_*` keys.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::application::ports::{DialerConfig, NoopReporter, PingHandler, Reporter};

/// Default wait for a subscription acknowledgment.
pub const DEFAULT_RESPONSE_CHECK_TIMEOUT: Duration = Duration::from_secs(5);

/// Default wait for a correlated reply.
pub const DEFAULT_RESPONSE_MAX_LIMIT: Duration = Duration::from_secs(7);

/// Default ping interval (0 = disabled).
pub const DEFAULT_PING_INTERVAL: Duration = Duration::ZERO;

// =============================================================================
// ConnectionSetup
// =============================================================================

/// Immutable per-connection configuration.
#[derive(Clone)]
pub struct ConnectionSetup {
    /// Venue endpoint (`ws://` or `wss://`).
    pub url: String,
    /// How long a subscribe/unsubscribe waits for the venue's ack.
    pub response_check_timeout: Duration,
    /// How long a correlated request waits for its reply.
    pub response_max_limit: Duration,
    /// Outbound messages per second (0 = unlimited).
    pub rate_limit: u32,
    /// Whether this link carries authenticated (private) traffic.
    pub authenticated: bool,
    /// Latency telemetry sink.
    pub reporter: Arc<dyn Reporter>,
}

impl fmt::Debug for ConnectionSetup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSetup")
            .field("url", &self.url)
            .field("response_check_timeout", &self.response_check_timeout)
            .field("response_max_limit", &self.response_max_limit)
            .field("rate_limit", &self.rate_limit)
            .field("authenticated", &self.authenticated)
            .finish_non_exhaustive()
    }
}

impl ConnectionSetup {
    /// Create a setup for `url` with default timeouts and no rate limit.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            response_check_timeout: DEFAULT_RESPONSE_CHECK_TIMEOUT,
            response_max_limit: DEFAULT_RESPONSE_MAX_LIMIT,
            rate_limit: 0,
            authenticated: false,
            reporter: Arc::new(NoopReporter),
        }
    }

    /// Set the subscription ack timeout.
    #[must_use]
    pub const fn with_response_check_timeout(mut self, timeout: Duration) -> Self {
        self.response_check_timeout = timeout;
        self
    }

    /// Set the correlated reply timeout.
    #[must_use]
    pub const fn with_response_max_limit(mut self, timeout: Duration) -> Self {
        self.response_max_limit = timeout;
        self
    }

    /// Set the outbound rate limit in messages per second.
    #[must_use]
    pub const fn with_rate_limit(mut self, per_second: u32) -> Self {
        self.rate_limit = per_second;
        self
    }

    /// Mark the link as authenticated.
    #[must_use]
    pub const fn with_authenticated(mut self, authenticated: bool) -> Self {
        self.authenticated = authenticated;
        self
    }

    /// Set the latency reporter.
    #[must_use]
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }
}

// =============================================================================
// StreamSettings
// =============================================================================

/// Connection knobs loaded from the environment.
///
/// | Key | Meaning | Default |
/// |---|---|---|
/// | `{PREFIX}_URL` | endpoint | required |
/// | `{PREFIX}_RESPONSE_CHECK_TIMEOUT_MS` | ack timeout | 5000 |
/// | `{PREFIX}_RESPONSE_MAX_LIMIT_MS` | reply timeout | 7000 |
/// | `{PREFIX}_RATE_LIMIT` | messages/second, 0 = unlimited | 0 |
/// | `{PREFIX}_AUTHENTICATED` | `true`/`1` marks a private link | false |
/// | `{PREFIX}_PING_INTERVAL_SECS` | native ping interval, 0 = off | 0 |
/// | `{PREFIX}_HANDSHAKE_TIMEOUT_SECS` | dial timeout | 10 |
/// | `{PREFIX}_PROXY` | HTTP CONNECT proxy | none |
///
/// Unparseable numeric values fall back to their defaults.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    /// Venue endpoint.
    pub url: String,
    /// Subscription ack timeout.
    pub response_check_timeout: Duration,
    /// Correlated reply timeout.
    pub response_max_limit: Duration,
    /// Outbound messages per second.
    pub rate_limit: u32,
    /// Private link flag.
    pub authenticated: bool,
    /// Native ping interval.
    pub ping_interval: Duration,
    /// Dial timeout.
    pub handshake_timeout: Duration,
    /// HTTP CONNECT proxy.
    pub proxy: Option<String>,
}

impl StreamSettings {
    /// Load settings from `{prefix}_*` environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `{prefix}_URL` is missing or empty.
    pub fn from_env(prefix: &str) -> Result<Self, ConfigError> {
        Self::from_lookup(prefix, |key| std::env::var(key).ok())
    }

    /// Load settings through an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if `{prefix}_URL` is missing or empty.
    pub fn from_lookup<F>(prefix: &str, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let key = |name: &str| format!("{prefix}_{name}");

        let url_key = key("URL");
        let url = lookup(&url_key).ok_or_else(|| ConfigError::MissingEnvVar(url_key.clone()))?;
        if url.trim().is_empty() {
            return Err(ConfigError::EmptyValue(url_key));
        }

        let proxy = lookup(&key("PROXY")).filter(|p| !p.trim().is_empty());

        Ok(Self {
            url,
            response_check_timeout: parse_duration_millis(
                lookup(&key("RESPONSE_CHECK_TIMEOUT_MS")),
                DEFAULT_RESPONSE_CHECK_TIMEOUT,
            ),
            response_max_limit: parse_duration_millis(
                lookup(&key("RESPONSE_MAX_LIMIT_MS")),
                DEFAULT_RESPONSE_MAX_LIMIT,
            ),
            rate_limit: parse_u32(lookup(&key("RATE_LIMIT")), 0),
            authenticated: parse_bool(lookup(&key("AUTHENTICATED")), false),
            ping_interval: parse_duration_secs(
                lookup(&key("PING_INTERVAL_SECS")),
                DEFAULT_PING_INTERVAL,
            ),
            handshake_timeout: parse_duration_secs(
                lookup(&key("HANDSHAKE_TIMEOUT_SECS")),
                DialerConfig::default().handshake_timeout,
            ),
            proxy,
        })
    }

    /// Build the connection setup with the given reporter.
    #[must_use]
    pub fn connection_setup(&self, reporter: Arc<dyn Reporter>) -> ConnectionSetup {
        ConnectionSetup::new(self.url.clone())
            .with_response_check_timeout(self.response_check_timeout)
            .with_response_max_limit(self.response_max_limit)
            .with_rate_limit(self.rate_limit)
            .with_authenticated(self.authenticated)
            .with_reporter(reporter)
    }

    /// Build the dialer configuration.
    #[must_use]
    pub fn dialer(&self) -> DialerConfig {
        DialerConfig::default().with_handshake_timeout(self.handshake_timeout)
    }

    /// Build the native ping handler (disabled when the interval is 0).
    #[must_use]
    pub const fn ping_handler(&self) -> PingHandler {
        PingHandler::native(self.ping_interval)
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
}

fn parse_u32(value: Option<String>, default: u32) -> u32 {
    value.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn parse_bool(value: Option<String>, default: bool) -> bool {
    value.map_or(default, |v| {
        matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes")
    })
}

fn parse_duration_secs(value: Option<String>, default: Duration) -> Duration {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_duration_millis(value: Option<String>, default: Duration) -> Duration {
    value
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use test_case::test_case;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn setup_defaults() {
        let setup = ConnectionSetup::new("wss://venue.test/ws");
        assert_eq!(setup.response_check_timeout, Duration::from_secs(5));
        assert_eq!(setup.response_max_limit, Duration::from_secs(7));
        assert_eq!(setup.rate_limit, 0);
        assert!(!setup.authenticated);
    }

    #[test]
    fn setup_debug_omits_reporter() {
        let debug = format!("{:?}", ConnectionSetup::new("wss://venue.test/ws"));
        assert!(debug.contains("venue.test"));
        assert!(!debug.contains("reporter"));
    }

    #[test]
    fn settings_from_lookup() {
        let settings = StreamSettings::from_lookup(
            "VENUE",
            lookup(&[
                ("VENUE_URL", "wss://venue.test/ws"),
                ("VENUE_RESPONSE_CHECK_TIMEOUT_MS", "250"),
                ("VENUE_RESPONSE_MAX_LIMIT_MS", "2000"),
                ("VENUE_RATE_LIMIT", "20"),
                ("VENUE_AUTHENTICATED", "true"),
                ("VENUE_PING_INTERVAL_SECS", "15"),
                ("VENUE_HANDSHAKE_TIMEOUT_SECS", "3"),
                ("VENUE_PROXY", "http://proxy.local:3128"),
            ]),
        )
        .unwrap();

        assert_eq!(settings.response_check_timeout, Duration::from_millis(250));
        assert_eq!(settings.response_max_limit, Duration::from_secs(2));
        assert_eq!(settings.rate_limit, 20);
        assert!(settings.authenticated);
        assert_eq!(settings.ping_handler(), PingHandler::native(Duration::from_secs(15)));
        assert_eq!(settings.dialer().handshake_timeout, Duration::from_secs(3));
        assert_eq!(settings.proxy.as_deref(), Some("http://proxy.local:3128"));

        let setup = settings.connection_setup(Arc::new(NoopReporter));
        assert_eq!(setup.rate_limit, 20);
        assert!(setup.authenticated);
    }

    #[test]
    fn settings_fall_back_to_defaults() {
        let settings = StreamSettings::from_lookup(
            "VENUE",
            lookup(&[
                ("VENUE_URL", "wss://venue.test/ws"),
                ("VENUE_RATE_LIMIT", "lots"),
                ("VENUE_PROXY", "  "),
            ]),
        )
        .unwrap();

        assert_eq!(settings.response_check_timeout, DEFAULT_RESPONSE_CHECK_TIMEOUT);
        assert_eq!(settings.rate_limit, 0);
        assert!(!settings.ping_handler().is_enabled());
        assert_eq!(settings.proxy, None);
    }

    #[test]
    fn missing_url() {
        let err = StreamSettings::from_lookup("VENUE", lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "VENUE_URL"));
    }

    #[test]
    fn empty_url() {
        let err = StreamSettings::from_lookup("VENUE", lookup(&[("VENUE_URL", "")])).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(_)));
    }

    #[test_case(Some("1"), true ; "one")]
    #[test_case(Some("TRUE"), true ; "upper true")]
    #[test_case(Some("no"), false ; "no")]
    #[test_case(None, false ; "unset")]
    fn bool_parsing(value: Option<&str>, expected: bool) {
        assert_eq!(parse_bool(value.map(str::to_string), false), expected);
    }
}
