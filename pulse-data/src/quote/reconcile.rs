use super::{Direction, round_cents};
use rust_decimal::{Decimal, RoundingStrategy};

/// Percent magnitude below which a change is considered "no meaningful change" (0.01%).
pub const MIN_VISIBLE_PERCENT: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

/// Smallest absolute change ever displayed: one cent.
pub const MIN_VISIBLE_DOLLAR: Decimal = Decimal::from_parts(1, 0, 0, false, 2);

const HUNDRED: Decimal = Decimal::ONE_HUNDRED;

/// Fraction of price used as the floored absolute change (0.01% of price).
const FLOOR_FRACTION: Decimal = Decimal::from_parts(1, 0, 0, false, 4);

/// Reconciled change magnitudes for one quote.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reconciled {
    pub absolute_change: Decimal,
    pub percent_change: Decimal,
    pub direction: Direction,
    /// The minimum visible change policy substituted both magnitudes.
    pub floored: bool,
}

/// Derive the missing half of a (percent, dollar) change pair.
///
/// - both present: trusted independently, direction follows the percent sign.
/// - percent only: `previous = price / (1 + percent / 100)`, `absolute = |price - previous|`.
/// - dollar only: `previous = price - dollar`, `percent = dollar / previous * 100`; a
///   non-positive previous price counts as missing.
///
/// Product policy, not a mathematical necessity: when nothing usable is supplied or the
/// change is below [`MIN_VISIBLE_PERCENT`], both magnitudes are replaced by the minimum visible
/// change (0.01% of price, at least one cent) so a quote never renders as "no change" while its
/// source is merely ambiguous. Magnitudes are non-negative and rounded to two decimal places.
pub fn reconcile(price: Decimal, percent: Option<Decimal>, dollar: Option<Decimal>) -> Reconciled {
    let signed = match (percent, dollar) {
        (Some(percent), Some(dollar)) => Some((dollar.abs(), percent)),
        (Some(percent), None) => {
            previous_price(price, percent).map(|previous| ((price - previous).abs(), percent))
        }
        (None, Some(dollar)) => percent_from_dollar(price, dollar).map(|percent| (dollar.abs(), percent)),
        (None, None) => None,
    };

    match signed {
        Some((absolute, percent)) if percent.abs() >= MIN_VISIBLE_PERCENT => Reconciled {
            absolute_change: round_cents(absolute).max(MIN_VISIBLE_DOLLAR),
            percent_change: percent
                .abs()
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero),
            direction: Direction::from_signed(percent),
            floored: false,
        },
        Some((_, percent)) => floor(price, Direction::from_signed(percent)),
        // Uninvertible or missing: the supplied sign still decides the direction
        None => floor(
            price,
            percent
                .or(dollar)
                .map_or(Direction::Up, Direction::from_signed),
        ),
    }
}

/// Price at the start of the timeframe implied by a signed percent change.
///
/// `None` when `1 + percent / 100` is not positive.
pub fn previous_price(price: Decimal, percent: Decimal) -> Option<Decimal> {
    let factor = Decimal::ONE.checked_add(percent.checked_div(HUNDRED)?)?;
    if factor <= Decimal::ZERO {
        return None;
    }
    price.checked_div(factor)
}

fn percent_from_dollar(price: Decimal, dollar: Decimal) -> Option<Decimal> {
    let previous = price.checked_sub(dollar)?;
    if previous <= Decimal::ZERO {
        return None;
    }
    dollar.checked_div(previous)?.checked_mul(HUNDRED)
}

fn floor(price: Decimal, direction: Direction) -> Reconciled {
    let absolute = price
        .checked_mul(FLOOR_FRACTION)
        .map(round_cents)
        .unwrap_or(MIN_VISIBLE_DOLLAR)
        .max(MIN_VISIBLE_DOLLAR);

    Reconciled {
        absolute_change: absolute,
        percent_change: MIN_VISIBLE_PERCENT,
        direction,
        floored: true,
    }
}
