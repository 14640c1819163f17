//! Market Data Envelopes
//!
//! Parsed payload types produced by venue decoders from raw frames and
//! consumed by downstream business logic. The core never mutates them.
//!
//! Numeric fields use `Decimal` for financial precision.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Instrument Identity
// =============================================================================

/// A trading instrument pair such as `BTC-USD`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CurrencyPair {
    /// Base currency code.
    pub base: String,
    /// Quote currency code.
    pub quote: String,
}

impl CurrencyPair {
    /// Create a pair, upper-casing both legs.
    #[must_use]
    pub fn new(base: impl AsRef<str>, quote: impl AsRef<str>) -> Self {
        Self {
            base: base.as_ref().to_uppercase(),
            quote: quote.as_ref().to_uppercase(),
        }
    }
}

impl fmt::Display for CurrencyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.base, self.quote)
    }
}

/// Error parsing a currency pair.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid currency pair: {0}")]
pub struct PairParseError(pub String);

impl FromStr for CurrencyPair {
    type Err = PairParseError;

    /// Parse `BTC-USD`, `BTC/USD` or `BTC_USD`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split(['-', '/', '_']);
        match (parts.next(), parts.next(), parts.next()) {
            (Some(base), Some(quote), None) if !base.is_empty() && !quote.is_empty() => {
                Ok(Self::new(base, quote))
            }
            _ => Err(PairParseError(s.to_string())),
        }
    }
}

/// Asset/category tag for an instrument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetType {
    /// Spot market.
    Spot,
    /// Margin market.
    Margin,
    /// Margin funding (lending) market.
    MarginFunding,
    /// Dated futures.
    Futures,
    /// Perpetual swaps.
    PerpetualSwap,
    /// Options.
    Options,
    /// Any other venue-specific category.
    Other,
}

impl AssetType {
    /// Get the asset tag name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Spot => "spot",
            Self::Margin => "margin",
            Self::MarginFunding => "margin_funding",
            Self::Futures => "futures",
            Self::PerpetualSwap => "perpetual_swap",
            Self::Options => "options",
            Self::Other => "other",
        }
    }
}

impl fmt::Display for AssetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Side of a funding offer or order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    /// Buy side.
    Buy,
    /// Sell side.
    Sell,
    /// Funding offered (lend).
    Lend,
    /// Funding taken (borrow).
    Borrow,
    /// Side not reported.
    #[default]
    Unknown,
}

// =============================================================================
// Envelopes
// =============================================================================

/// Funding rate/offer update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FundingData {
    /// Event timestamp.
    pub timestamp: DateTime<Utc>,
    /// Instrument pair.
    pub pair: CurrencyPair,
    /// Asset category.
    pub asset: AssetType,
    /// Venue name.
    pub exchange: String,
    /// Funding amount.
    pub amount: Decimal,
    /// Funding rate.
    pub rate: Decimal,
    /// Funding period (venue units, usually days).
    pub period: i64,
    /// Lend/borrow side.
    pub side: Side,
}

/// Candlestick (kline) update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KlineData {
    /// Event timestamp.
    pub timestamp: DateTime<Utc>,
    /// Instrument pair.
    pub pair: CurrencyPair,
    /// Asset category.
    pub asset: AssetType,
    /// Venue name.
    pub exchange: String,
    /// Candle open time.
    pub start_time: DateTime<Utc>,
    /// Candle close time.
    pub close_time: DateTime<Utc>,
    /// Candle interval as reported by the venue (e.g. `1m`).
    pub interval: String,
    /// Open price.
    pub open_price: Decimal,
    /// Close price.
    pub close_price: Decimal,
    /// High price.
    pub high_price: Decimal,
    /// Low price.
    pub low_price: Decimal,
    /// Traded volume.
    pub volume: Decimal,
    /// Whether the candle is final.
    pub closed: bool,
}

impl KlineData {
    /// Get the candle range (high minus low).
    #[must_use]
    pub fn range(&self) -> Decimal {
        self.high_price - self.low_price
    }
}

/// Notification that orders or contracts changed on a venue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionUpdated {
    /// Event timestamp.
    pub timestamp: DateTime<Utc>,
    /// Instrument pair.
    pub pair: CurrencyPair,
    /// Asset category.
    pub asset: AssetType,
    /// Venue name.
    pub exchange: String,
}

/// Diagnostic emitted when a frame matches no known route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnhandledMessageWarning {
    /// Raw message text.
    pub message: String,
}

impl fmt::Display for UnhandledMessageWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unhandled message: {}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("BTC-USD" ; "dash")]
    #[test_case("btc/usd" ; "slash lowercase")]
    #[test_case("BTC_USD" ; "underscore")]
    fn pair_parses(input: &str) {
        let pair: CurrencyPair = input.parse().unwrap();
        assert_eq!(pair, CurrencyPair::new("BTC", "USD"));
        assert_eq!(pair.to_string(), "BTC-USD");
    }

    #[test_case("" ; "empty")]
    #[test_case("BTC" ; "single leg")]
    #[test_case("BTC-" ; "missing quote")]
    #[test_case("A-B-C" ; "three legs")]
    fn pair_rejects(input: &str) {
        assert!(input.parse::<CurrencyPair>().is_err());
    }

    #[test]
    fn asset_type_names() {
        assert_eq!(AssetType::Spot.as_str(), "spot");
        assert_eq!(AssetType::PerpetualSwap.to_string(), "perpetual_swap");
    }

    #[test]
    fn kline_range() {
        let now = Utc::now();
        let kline = KlineData {
            timestamp: now,
            pair: CurrencyPair::new("ETH", "USDT"),
            asset: AssetType::Spot,
            exchange: "testvenue".to_string(),
            start_time: now,
            close_time: now,
            interval: "1m".to_string(),
            open_price: Decimal::new(3000, 0),
            close_price: Decimal::new(3010, 0),
            high_price: Decimal::new(30255, 1),
            low_price: Decimal::new(2990, 0),
            volume: Decimal::ONE,
            closed: false,
        };
        assert_eq!(kline.range(), Decimal::new(355, 1));
    }

    #[test]
    fn side_defaults_to_unknown() {
        assert_eq!(Side::default(), Side::Unknown);
    }
}
