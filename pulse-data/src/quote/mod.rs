//! Canonical price quote model.
//!
//! Provider payloads are reduced to a [`PriceQuote`] by the [`normalize`] step, which relies on
//! [`reconcile`] to derive whichever of the dollar or percent change the provider did not supply.

use derive_more::Display;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Timeframe field selection and [`PriceQuote`] construction.
pub mod normalize;

/// Raw provider payload and its field naming scheme.
pub mod payload;

/// Dollar/percent change derivation and minimum visible change policy.
pub mod reconcile;

pub use normalize::{ALL_TIME_REFERENCE_PRICE, normalize};
pub use payload::RawPricePayload;
pub use reconcile::{Reconciled, reconcile};

/// Fixed window over which price change is reported.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Deserialize, Serialize)]
pub enum Timeframe {
    #[serde(rename = "1H")]
    #[display("1H")]
    OneHour,
    #[default]
    #[serde(rename = "1D")]
    #[display("1D")]
    OneDay,
    #[serde(rename = "1W")]
    #[display("1W")]
    OneWeek,
    #[serde(rename = "1M")]
    #[display("1M")]
    OneMonth,
    #[serde(rename = "1Y")]
    #[display("1Y")]
    OneYear,
    #[serde(rename = "ALL")]
    #[display("ALL")]
    All,
}

impl Timeframe {
    pub const ALL: [Timeframe; 6] = [
        Timeframe::OneHour,
        Timeframe::OneDay,
        Timeframe::OneWeek,
        Timeframe::OneMonth,
        Timeframe::OneYear,
        Timeframe::All,
    ];

    /// Provider field suffix carrying change data for this timeframe.
    ///
    /// `None` for [`Timeframe::All`], which no provider supplies.
    pub fn field_suffix(&self) -> Option<&'static str> {
        match self {
            Timeframe::OneHour => Some("1h"),
            Timeframe::OneDay => Some("24h"),
            Timeframe::OneWeek => Some("7d"),
            Timeframe::OneMonth => Some("30d"),
            Timeframe::OneYear => Some("1y"),
            Timeframe::All => None,
        }
    }
}

impl FromStr for Timeframe {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .into_iter()
            .find(|timeframe| timeframe.to_string().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| format!("unknown timeframe: {s}"))
    }
}

/// Sign of a price change. Ties resolve to [`Direction::Up`].
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Direction {
    #[default]
    #[display("UP")]
    Up,
    #[display("DOWN")]
    Down,
}

impl Direction {
    /// [`Direction::Down`] only when the signed change is strictly negative.
    pub fn from_signed(change: Decimal) -> Self {
        if change.is_sign_negative() && !change.is_zero() {
            Direction::Down
        } else {
            Direction::Up
        }
    }
}

/// Canonical, immutable price quote for one timeframe.
///
/// Change magnitudes are never negative; the sign lives in `direction`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct PriceQuote {
    pub price: Decimal,
    pub absolute_change: Decimal,
    pub percent_change: Decimal,
    pub direction: Direction,
    pub timeframe: Timeframe,
}

impl PriceQuote {
    /// Signed percent change over the quote timeframe.
    pub fn signed_percent(&self) -> Decimal {
        match self.direction {
            Direction::Up => self.percent_change,
            Direction::Down => -self.percent_change,
        }
    }
}

/// Round a USD amount to cents.
pub(crate) fn round_cents(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}
