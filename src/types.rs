use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Order side using Backpack's wire vocabulary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Bid,
    Ask,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Bid => Side::Ask,
            Side::Ask => Side::Bid,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Bid => "Bid",
            Side::Ask => "Ask",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value {
            "Bid" => Some(Side::Bid),
            "Ask" => Some(Side::Ask),
            _ => None,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exchange-reported order status.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    #[default]
    New,
    Filled,
    Cancelled,
    Unknown,
}

impl OrderStatus {
    pub fn from_wire(value: &str) -> Self {
        match value {
            "New" => OrderStatus::New,
            "Filled" => OrderStatus::Filled,
            "Cancelled" => OrderStatus::Cancelled,
            _ => OrderStatus::Unknown,
        }
    }
}

/// Caller-assigned order identifier, used to correlate local state with
/// exchange acknowledgements before the exchange id is known.
#[repr(transparent)]
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct ClientOrderId(pub u64);

impl ClientOrderId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn into_inner(self) -> u64 {
        self.0
    }
}

impl From<u64> for ClientOrderId {
    fn from(value: u64) -> Self {
        Self::new(value)
    }
}

impl fmt::Display for ClientOrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Generator for [`ClientOrderId`]s: a fixed per-instance prefix followed by
/// a 6-digit random suffix. The prefix keeps concurrently-run instances on
/// one account from colliding; the suffix only needs to be unlikely to
/// repeat within a session, so the thread RNG is enough.
#[derive(Clone, Debug)]
pub struct ClientIdGen {
    prefix: String,
}

impl ClientIdGen {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    pub fn next_id(&self) -> ClientOrderId {
        let suffix: u32 = rand::thread_rng().gen_range(0..1_000_000);
        let combined = format!("{}{:06}", self.prefix, suffix);
        // The prefix is validated as digits at config load, so parsing can
        // only fail on an id wider than u64; fall back to the bare suffix.
        ClientOrderId::new(combined.parse().unwrap_or(suffix as u64))
    }
}

/// A single order as tracked by the strategy.
#[derive(Clone, Debug, PartialEq)]
pub struct Order {
    pub client_id: ClientOrderId,
    pub exchange_id: Option<String>,
    pub side: Side,
    pub price: f64,
    pub quantity: f64,
    pub status: OrderStatus,
}

/// One aggregated price level on the book. A size of zero on the wire means
/// "remove this level" and is never stored.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

impl PriceLevel {
    pub const fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }
}
