use serde::{Deserialize, Deserializer, Serialize};

/// An asset the UI wants mirrored, plus the routing metadata the server may need
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssetSubscription {
    pub asset_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub slug: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub question: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    #[serde(rename = "gameStartTime", skip_serializing_if = "Option::is_none")]
    pub game_start_time: Option<String>,
}

impl AssetSubscription {
    pub fn new(asset_id: impl Into<String>) -> Self {
        Self {
            asset_id: asset_id.into(),
            slug: None,
            question: None,
            outcome: None,
            game_start_time: None,
        }
    }

    pub fn with_market(mut self, slug: impl Into<String>, question: impl Into<String>) -> Self {
        self.slug = Some(slug.into());
        self.question = Some(question.into());
        self
    }

    pub fn with_outcome(mut self, outcome: impl Into<String>) -> Self {
        self.outcome = Some(outcome.into());
        self
    }
}

impl From<&str> for AssetSubscription {
    fn from(asset_id: &str) -> Self {
        Self::new(asset_id)
    }
}

// The books stream accepts either a bare asset id or the full object.
#[derive(Deserialize)]
#[serde(untagged)]
enum AssetSubscriptionRepr {
    Id(String),
    Full {
        asset_id: String,
        #[serde(default)]
        slug: Option<String>,
        #[serde(default)]
        question: Option<String>,
        #[serde(default)]
        outcome: Option<String>,
        #[serde(default, rename = "gameStartTime")]
        game_start_time: Option<String>,
    },
}

impl<'de> Deserialize<'de> for AssetSubscription {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match AssetSubscriptionRepr::deserialize(deserializer)? {
            AssetSubscriptionRepr::Id(asset_id) => Self::new(asset_id),
            AssetSubscriptionRepr::Full {
                asset_id,
                slug,
                question,
                outcome,
                game_start_time,
            } => Self {
                asset_id,
                slug,
                question,
                outcome,
                game_start_time,
            },
        })
    }
}

/// One aggregated price level
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct OrderLevel {
    pub price: f64,
    pub size: f64,
    pub cumulative: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TradeSide {
    Buy,
    Sell,
}

impl TradeSide {
    pub fn parse(raw: &str) -> Option<Self> {
        if raw.eq_ignore_ascii_case("BUY") {
            Some(Self::Buy)
        } else if raw.eq_ignore_ascii_case("SELL") {
            Some(Self::Sell)
        } else {
            None
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TradeSide::Buy => "BUY",
            TradeSide::Sell => "SELL",
        }
    }
}

/// Most recent public trade; only used to detect new trade events
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LastTrade {
    pub price: f64,
    pub size: f64,
    pub side: TradeSide,
    pub timestamp: i64,
}

/// Book snapshot for one asset as delivered by the server
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BookState {
    pub ready: bool,
    pub msg_count: u64,
    /// Bids sorted by price descending (best bid first)
    pub bids: Vec<OrderLevel>,
    /// Asks sorted by price ascending (best ask first)
    pub asks: Vec<OrderLevel>,
    pub tick_size: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_trade: Option<LastTrade>,
}

impl BookState {
    /// A book that is not ready must not be rendered
    #[inline]
    pub fn is_displayable(&self) -> bool {
        self.ready
    }

    #[inline]
    pub fn best_bid(&self) -> Option<f64> {
        self.bids.first().map(|l| l.price)
    }

    #[inline]
    pub fn best_ask(&self) -> Option<f64> {
        self.asks.first().map(|l| l.price)
    }

    #[inline]
    pub fn mid_price(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => Some((bid + ask) / 2.0),
            _ => None,
        }
    }

    /// Get spread in bps
    #[inline]
    pub fn spread_bps(&self) -> Option<f64> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) if bid > 0.0 => {
                let mid = (bid + ask) / 2.0;
                Some(((ask - bid) / mid) * 10_000.0)
            }
            _ => None,
        }
    }

    #[inline]
    pub fn is_crossed(&self) -> bool {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid >= ask,
            _ => false,
        }
    }

    pub fn last_trade_ts(&self) -> Option<i64> {
        self.last_trade.map(|t| t.timestamp)
    }
}

/// Per-asset freshness, tracked independently of the shared transport
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Connecting,
    Live,
    Error,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Live => "live",
            ConnectionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outbound intent frame on the multiplexed connection
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Intent {
    Subscribe { assets: Vec<AssetSubscription> },
    Unsubscribe { assets: Vec<String> },
}

impl Intent {
    pub fn len(&self) -> usize {
        match self {
            Intent::Subscribe { assets } => assets.len(),
            Intent::Unsubscribe { assets } => assets.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn to_json(&self) -> String {
        // Serialising plain strings/options cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}
