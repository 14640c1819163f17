//! Consumer Port (Driver Port)
//!
//! Downstream business logic registers one handler per payload kind. The
//! dispatcher hands each decoded envelope to at most one handler.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::domain::envelope::{FundingData, KlineData, PositionUpdated};

/// Kind of decoded payload, used to route envelopes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// Funding rate/offer updates.
    Funding,
    /// Candlestick updates.
    Kline,
    /// Order/contract change notifications.
    PositionUpdated,
    /// Venue-specific payload, named by the decoder.
    Custom(String),
}

impl PayloadKind {
    /// Get the kind name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::Funding => "funding",
            Self::Kline => "kline",
            Self::PositionUpdated => "position_updated",
            Self::Custom(name) => name,
        }
    }
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded payload ready for a consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    /// Funding update.
    Funding(FundingData),
    /// Kline update.
    Kline(KlineData),
    /// Position change notification.
    PositionUpdated(PositionUpdated),
    /// Venue-specific payload passed through untyped.
    Custom {
        /// Kind name.
        kind: String,
        /// Decoded payload.
        payload: serde_json::Value,
    },
}

impl Envelope {
    /// Routing kind of this envelope.
    #[must_use]
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Funding(_) => PayloadKind::Funding,
            Self::Kline(_) => PayloadKind::Kline,
            Self::PositionUpdated(_) => PayloadKind::PositionUpdated,
            Self::Custom { kind, .. } => PayloadKind::Custom(kind.clone()),
        }
    }
}

/// Envelope handler. Runs inline on the read loop, so it must not block.
pub type ConsumerHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Registry of consumer handlers keyed by payload kind.
#[derive(Default)]
pub struct ConsumerRegistry {
    handlers: RwLock<HashMap<PayloadKind, ConsumerHandler>>,
}

impl fmt::Debug for ConsumerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kinds: Vec<PayloadKind> = self.handlers.read().keys().cloned().collect();
        f.debug_struct("ConsumerRegistry")
            .field("kinds", &kinds)
            .finish()
    }
}

impl ConsumerRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for a kind, replacing any previous one.
    pub fn on<F>(&self, kind: PayloadKind, handler: F)
    where
        F: Fn(Envelope) + Send + Sync + 'static,
    {
        self.handlers.write().insert(kind, Arc::new(handler));
    }

    /// Remove the handler for a kind.
    pub fn remove(&self, kind: &PayloadKind) -> bool {
        self.handlers.write().remove(kind).is_some()
    }

    /// Check if a kind has a handler.
    #[must_use]
    pub fn contains(&self, kind: &PayloadKind) -> bool {
        self.handlers.read().contains_key(kind)
    }

    /// Hand an envelope to its handler.
    ///
    /// # Errors
    ///
    /// Returns the envelope back if no handler is registered for its kind.
    pub fn dispatch(&self, envelope: Envelope) -> Result<(), Envelope> {
        // Clone the handler out so it runs without the lock held.
        let handler = self.handlers.read().get(&envelope.kind()).cloned();
        match handler {
            Some(handler) => {
                handler(envelope);
                Ok(())
            }
            None => Err(envelope),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn custom(kind: &str) -> Envelope {
        Envelope::Custom {
            kind: kind.to_string(),
            payload: serde_json::json!({ "v": 1 }),
        }
    }

    #[test]
    fn dispatch_to_registered_handler() {
        let registry = ConsumerRegistry::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        registry.on(PayloadKind::Custom("ticker".into()), move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });

        assert!(registry.dispatch(custom("ticker")).is_ok());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn dispatch_without_handler_returns_envelope() {
        let registry = ConsumerRegistry::new();
        let err = registry.dispatch(custom("ticker")).unwrap_err();
        assert_eq!(err.kind(), PayloadKind::Custom("ticker".into()));
    }

    #[test]
    fn on_replaces_previous_handler() {
        use crate::domain::envelope::{AssetType, CurrencyPair};

        let registry = ConsumerRegistry::new();
        let first = Arc::new(AtomicUsize::new(0));
        let second = Arc::new(AtomicUsize::new(0));

        let f = Arc::clone(&first);
        registry.on(PayloadKind::PositionUpdated, move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        });
        let s = Arc::clone(&second);
        registry.on(PayloadKind::PositionUpdated, move |_| {
            s.fetch_add(1, Ordering::SeqCst);
        });

        let update = Envelope::PositionUpdated(PositionUpdated {
            timestamp: chrono::Utc::now(),
            pair: CurrencyPair::new("BTC", "USD"),
            asset: AssetType::Futures,
            exchange: "testvenue".into(),
        });
        assert!(registry.dispatch(update).is_ok());
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);

        assert!(registry.remove(&PayloadKind::PositionUpdated));
        assert!(!registry.contains(&PayloadKind::PositionUpdated));
    }

    #[test]
    fn custom_kind_does_not_match_builtin() {
        let registry = ConsumerRegistry::new();
        registry.on(PayloadKind::Kline, |_| {});
        assert!(registry.dispatch(custom("kline")).is_err());
    }
}
