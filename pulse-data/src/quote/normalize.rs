use super::{PriceQuote, RawPricePayload, Timeframe, reconcile, round_cents};
use crate::error::DataError;
use rust_decimal::Decimal;
use tracing::debug;

/// Reference price for [`Timeframe::All`]: the first recorded exchange trade of BTC in
/// July 2010 at $0.0008. No provider supplies "since inception" change data.
pub const ALL_TIME_REFERENCE_PRICE: Decimal = Decimal::from_parts(8, 0, 0, false, 4);

/// Normalise a raw provider payload into a [`PriceQuote`] for the requested timeframe.
///
/// Only a missing (or non-positive) `current_price` fails, with [`DataError::MalformedPayload`].
/// Missing change fields fall through to the reconciler's minimum visible change policy.
pub fn normalize(payload: &RawPricePayload, timeframe: Timeframe) -> Result<PriceQuote, DataError> {
    let price = payload.current_price().ok_or_else(|| {
        DataError::MalformedPayload(format!("missing {}", RawPricePayload::CURRENT_PRICE))
    })?;

    if price <= Decimal::ZERO {
        return Err(DataError::MalformedPayload(format!(
            "non-positive {}: {price}",
            RawPricePayload::CURRENT_PRICE
        )));
    }

    let (percent, dollar) = match timeframe.field_suffix() {
        Some(suffix) => (
            payload
                .decimal(&RawPricePayload::percent_in_currency_key(suffix))
                .or_else(|| payload.decimal(&RawPricePayload::percent_key(suffix))),
            payload.decimal(&RawPricePayload::dollar_key(suffix)),
        ),
        None => (None, price.checked_sub(ALL_TIME_REFERENCE_PRICE)),
    };

    let reconciled = reconcile(price, percent, dollar);
    if reconciled.floored {
        debug!(%timeframe, %price, "no usable change data, minimum visible change applied");
    }

    Ok(PriceQuote {
        price: round_cents(price),
        absolute_change: reconciled.absolute_change,
        percent_change: reconciled.percent_change,
        direction: reconciled.direction,
        timeframe,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quote::Direction;
    use rust_decimal_macros::dec;
    use serde_json::json;

    fn payload(value: serde_json::Value) -> RawPricePayload {
        RawPricePayload::try_from(value).unwrap()
    }

    #[test]
    fn test_normalize() {
        struct TestCase {
            input: RawPricePayload,
            timeframe: Timeframe,
            expected: PriceQuote,
        }

        let tests = vec![
            TestCase {
                // TC0: in-currency percent field wins over the plain percent field
                input: payload(json!({
                    "current_price": 10100,
                    "price_change_percentage_1h_in_currency": 1,
                    "price_change_percentage_1h": 5,
                })),
                timeframe: Timeframe::OneHour,
                expected: PriceQuote {
                    price: dec!(10100),
                    absolute_change: dec!(100),
                    percent_change: dec!(1),
                    direction: Direction::Up,
                    timeframe: Timeframe::OneHour,
                },
            },
            TestCase {
                // TC1: plain percent field used when in-currency is absent
                input: payload(json!({
                    "current_price": "9000.004",
                    "price_change_percentage_7d": "-10",
                })),
                timeframe: Timeframe::OneWeek,
                expected: PriceQuote {
                    price: dec!(9000.00),
                    absolute_change: dec!(1000),
                    percent_change: dec!(10),
                    direction: Direction::Down,
                    timeframe: Timeframe::OneWeek,
                },
            },
            TestCase {
                // TC2: absolute dollar field alone
                input: payload(json!({
                    "current_price": 950,
                    "price_change_30d": -50,
                })),
                timeframe: Timeframe::OneMonth,
                expected: PriceQuote {
                    price: dec!(950),
                    absolute_change: dec!(50),
                    percent_change: dec!(5),
                    direction: Direction::Down,
                    timeframe: Timeframe::OneMonth,
                },
            },
            TestCase {
                // TC3: fields for another timeframe are ignored, floor applies
                input: payload(json!({
                    "current_price": 50000,
                    "price_change_percentage_24h": 3,
                })),
                timeframe: Timeframe::OneYear,
                expected: PriceQuote {
                    price: dec!(50000),
                    absolute_change: dec!(5),
                    percent_change: dec!(0.01),
                    direction: Direction::Up,
                    timeframe: Timeframe::OneYear,
                },
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = normalize(&test.input, test.timeframe).unwrap();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_normalize_all_uses_reference_price() {
        let actual = normalize(&payload(json!({ "current_price": 80.0008 })), Timeframe::All).unwrap();

        assert_eq!(actual.price, dec!(80.00));
        assert_eq!(actual.absolute_change, dec!(80.00));
        assert_eq!(actual.percent_change, dec!(10000000));
        assert_eq!(actual.direction, Direction::Up);
        assert_eq!(actual.timeframe, Timeframe::All);
    }

    #[test]
    fn test_normalize_malformed() {
        struct TestCase {
            input: RawPricePayload,
        }

        let tests = vec![
            TestCase {
                // TC0: missing current price
                input: payload(json!({ "price_change_percentage_24h": 1.2 })),
            },
            TestCase {
                // TC1: non-numeric current price
                input: payload(json!({ "current_price": "soon" })),
            },
            TestCase {
                // TC2: zero current price
                input: payload(json!({ "current_price": 0 })),
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = normalize(&test.input, Timeframe::OneDay);
            assert!(
                matches!(actual, Err(DataError::MalformedPayload(_))),
                "TC{} failed",
                index
            );
        }
    }

    #[test]
    fn test_normalize_documented_example() {
        let actual = normalize(
            &payload(json!({
                "current_price": 67230.50,
                "price_change_percentage_24h": 1.89,
            })),
            Timeframe::OneDay,
        )
        .unwrap();

        assert_eq!(actual.price, dec!(67230.50));
        assert_eq!(actual.direction, Direction::Up);
        assert_eq!(actual.percent_change, dec!(1.89));
        assert!((actual.absolute_change - dec!(1247.09)).abs() <= dec!(0.01));
    }
}
