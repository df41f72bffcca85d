//! Order book snapshot model, provider message decoding and level diffing.

use crate::{error::DataError, source::DataSource};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::{
    collections::{BTreeMap, BTreeSet},
    str::FromStr,
};

/// Single channel ingestion loop publishing [`BookView`](feed::BookView)s.
pub mod feed;

/// Stateful snapshot manager and [`diff`](manager::diff).
pub mod manager;

pub use feed::{BookEvent, BookFeed, BookView};
pub use manager::{BookUpdate, OrderBookManager, diff};

/// Side of the order book.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BookSide {
    Bids,
    Asks,
}

/// Raw `[price, amount]` level as delivered by a provider.
///
/// #### Raw Payload Examples
/// ```json
/// ["67230.50", "0.125"]
/// [67230.5, 0.125]
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RawLevel {
    pub price: Decimal,
    pub amount: Decimal,
}

impl RawLevel {
    pub fn new(price: Decimal, amount: Decimal) -> Self {
        Self { price, amount }
    }
}

impl<'de> Deserialize<'de> for RawLevel {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let arr: Vec<Value> = Deserialize::deserialize(deserializer)?;
        if arr.len() < 2 {
            return Err(serde::de::Error::custom("expected [price, amount] level array"));
        }

        Ok(RawLevel {
            price: de_decimal(&arr[0]).map_err(serde::de::Error::custom)?,
            amount: de_decimal(&arr[1]).map_err(serde::de::Error::custom)?,
        })
    }
}

fn de_decimal(value: &Value) -> Result<Decimal, String> {
    let text = match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        other => return Err(format!("expected numeric level value, found {other}")),
    };
    Decimal::from_str(&text)
        .or_else(|_| Decimal::from_scientific(&text))
        .map_err(|error| format!("invalid level value {text}: {error}"))
}

/// Raw asks and bids of a full snapshot or an incremental update.
#[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize, Serialize)]
pub struct RawBook {
    #[serde(alias = "a", default)]
    pub asks: Vec<RawLevel>,
    #[serde(alias = "b", default)]
    pub bids: Vec<RawLevel>,
}

/// Order book message received from a provider.
///
/// A full snapshot carries `asks`/`bids`. An incremental `depthUpdate` carries `a`/`b`, keyed by
/// price, where a zero amount removes the level.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BookMessage {
    /// Non-book message (subscription response, heartbeat, etc.)
    Ignore,
    Snapshot(RawBook),
    Update(RawBook),
}

impl<'de> Deserialize<'de> for BookMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let value = Value::deserialize(deserializer)?;

        if value.get("e").and_then(Value::as_str) == Some("depthUpdate") {
            return serde_json::from_value(value)
                .map(BookMessage::Update)
                .map_err(serde::de::Error::custom);
        }

        if value.get("asks").is_some() && value.get("bids").is_some() {
            return serde_json::from_value(value)
                .map(BookMessage::Snapshot)
                .map_err(serde::de::Error::custom);
        }

        Ok(BookMessage::Ignore)
    }
}

/// One price level of a derived snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct OrderBookLevel {
    pub price: Decimal,
    pub amount: Decimal,
    /// `price * amount`
    pub notional: Decimal,
    /// Running sum of `amount` from the best price outward
    pub cumulative: Decimal,
}

/// Complete view of the order book at one instant.
///
/// Asks are sorted ascending, bids descending, and `cumulative` is re-derived from scratch for
/// every snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct OrderBookSnapshot {
    pub asks: Vec<OrderBookLevel>,
    pub bids: Vec<OrderBookLevel>,
    pub spread: Decimal,
    pub source: DataSource,
    pub observed_at: DateTime<Utc>,
}

impl OrderBookSnapshot {
    /// Derive a snapshot from price -> amount maps. Non-positive prices and amounts are dropped.
    pub fn from_maps(
        asks: &BTreeMap<Decimal, Decimal>,
        bids: &BTreeMap<Decimal, Decimal>,
        source: DataSource,
        observed_at: DateTime<Utc>,
    ) -> Self {
        let asks = accumulate(asks.iter());
        let bids = accumulate(bids.iter().rev());
        let spread = match (asks.first(), bids.first()) {
            (Some(ask), Some(bid)) => (ask.price - bid.price).max(Decimal::ZERO),
            _ => Decimal::ZERO,
        };

        Self {
            asks,
            bids,
            spread,
            source,
            observed_at,
        }
    }

    pub fn side(&self, side: BookSide) -> &[OrderBookLevel] {
        match side {
            BookSide::Bids => &self.bids,
            BookSide::Asks => &self.asks,
        }
    }

    pub fn best_bid(&self) -> Option<&OrderBookLevel> {
        self.bids.first()
    }

    pub fn best_ask(&self) -> Option<&OrderBookLevel> {
        self.asks.first()
    }

    /// Calculate the mid price
    pub fn mid_price(&self) -> Option<Decimal> {
        match (self.best_bid(), self.best_ask()) {
            (Some(bid), Some(ask)) => bid
                .price
                .checked_add(ask.price)
                .map(|sum| sum / Decimal::TWO),
            _ => None,
        }
    }

    /// Calculate spread as a percentage of mid price
    pub fn spread_percentage(&self) -> Option<Decimal> {
        let mid = self.mid_price()?;
        if mid > Decimal::ZERO {
            self.spread
                .checked_div(mid)
                .and_then(|ratio| ratio.checked_mul(Decimal::ONE_HUNDRED))
        } else {
            None
        }
    }
}

// A side is cut at the first level whose notional or running total would overflow.
fn accumulate<'a>(levels: impl Iterator<Item = (&'a Decimal, &'a Decimal)>) -> Vec<OrderBookLevel> {
    levels
        .filter(|(price, amount)| **price > Decimal::ZERO && **amount > Decimal::ZERO)
        .scan(Decimal::ZERO, |cumulative, (price, amount)| {
            *cumulative = cumulative.checked_add(*amount)?;
            Some(OrderBookLevel {
                price: *price,
                amount: *amount,
                notional: price.checked_mul(*amount)?,
                cumulative: *cumulative,
            })
        })
        .collect()
}

/// Reject a book message carrying a level whose notional cannot be represented.
pub fn validate_levels(book: &RawBook) -> Result<(), DataError> {
    book.asks
        .iter()
        .chain(&book.bids)
        .filter(|level| level.amount > Decimal::ZERO)
        .find(|level| level.price.checked_mul(level.amount).is_none())
        .map_or(Ok(()), |level| {
            Err(DataError::InvalidBook(format!(
                "level notional overflows: price {} amount {}",
                level.price, level.amount
            )))
        })
}

/// Price levels that changed between two consecutive snapshots, per side.
///
/// Used purely as a transient highlight signal; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct ChangedLevels {
    pub asks: BTreeSet<Decimal>,
    pub bids: BTreeSet<Decimal>,
}

impl ChangedLevels {
    pub fn is_empty(&self) -> bool {
        self.asks.is_empty() && self.bids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.asks.len() + self.bids.len()
    }

    pub fn contains(&self, side: BookSide, price: &Decimal) -> bool {
        match side {
            BookSide::Bids => self.bids.contains(price),
            BookSide::Asks => self.asks.contains(price),
        }
    }
}
