//! Last-resort synthetic data.
//!
//! Only used when every real tier failed and nothing is cached. Values are anchored on the last
//! known price so the UI keeps a plausible shape instead of rendering a gap. Every value
//! produced here is tagged [`DataSource::Synthetic`](crate::source::DataSource::Synthetic).

use crate::{
    books::{RawBook, RawLevel},
    error::DataError,
    quote::{PriceQuote, RawPricePayload, Timeframe, normalize, round_cents},
};
use rand::Rng;
use rust_decimal::Decimal;

/// Maximum synthetic drift applied to the anchor price, in basis points.
const MAX_PRICE_DRIFT_BPS: i64 = 50;

/// Largest synthetic percent change magnitude per timeframe, in basis points.
fn max_change_bps(timeframe: Timeframe) -> i64 {
    match timeframe {
        Timeframe::OneHour => 100,
        Timeframe::OneDay => 300,
        Timeframe::OneWeek => 800,
        Timeframe::OneMonth => 1_500,
        Timeframe::OneYear => 6_000,
        Timeframe::All => 0,
    }
}

/// Generate a synthetic quote drifting around `anchor`.
pub fn synthetic_quote<R>(
    anchor: Decimal,
    timeframe: Timeframe,
    rng: &mut R,
) -> Result<PriceQuote, DataError>
where
    R: Rng + ?Sized,
{
    let drift = Decimal::new(rng.random_range(-MAX_PRICE_DRIFT_BPS..=MAX_PRICE_DRIFT_BPS), 4);
    let price = round_cents(anchor * (Decimal::ONE + drift));

    let mut payload = RawPricePayload::new().with(RawPricePayload::CURRENT_PRICE, price);
    if let Some(suffix) = timeframe.field_suffix() {
        let bound = max_change_bps(timeframe);
        let percent = Decimal::new(rng.random_range(-bound..=bound), 2);
        payload.insert(RawPricePayload::percent_key(suffix), percent);
    }

    normalize(&payload, timeframe)
}

/// Generate a synthetic ladder of `levels` asks and bids around `mid`.
pub fn synthetic_book<R>(mid: Decimal, levels: usize, rng: &mut R) -> RawBook
where
    R: Rng + ?Sized,
{
    // One basis point of mid per level, never below one cent
    let step = round_cents(mid / Decimal::from(10_000)).max(Decimal::new(1, 2));
    let mut level = |index: usize, sign: Decimal| {
        let offset = step * Decimal::from(index as u64 + 1);
        RawLevel::new(
            round_cents(mid + sign * offset),
            Decimal::new(rng.random_range(1..=2_000), 3),
        )
    };

    let asks = (0..levels).map(|index| level(index, Decimal::ONE)).collect::<Vec<_>>();
    let bids = (0..levels)
        .map(|index| level(index, Decimal::NEGATIVE_ONE))
        .filter(|raw| raw.price > Decimal::ZERO)
        .collect();

    RawBook { asks, bids }
}
