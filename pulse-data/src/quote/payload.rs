use super::Timeframe;
use crate::error::DataError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

/// Raw price provider payload.
///
/// The only contract with providers is a JSON object exposing a USD `current_price`. Change
/// data is optional and keyed per timeframe suffix `s` (`1h`, `24h`, `7d`, `30d`, `1y`):
///
/// | priority | field                                  | meaning                  |
/// |----------|----------------------------------------|--------------------------|
/// | 1        | `price_change_percentage_{s}_in_currency` | percent change (USD)  |
/// | 2        | `price_change_percentage_{s}`          | percent change           |
/// | 3        | `price_change_{s}`                     | absolute USD change      |
///
/// Numeric values may be JSON numbers or numeric strings.
///
/// ```json
/// {
///   "current_price": 67230.5,
///   "price_change_24h": 1247.09,
///   "price_change_percentage_24h": 1.89,
///   "price_change_percentage_1h_in_currency": "-0.12"
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Default, Deserialize, Serialize)]
#[serde(transparent)]
pub struct RawPricePayload(Map<String, Value>);

impl RawPricePayload {
    pub const CURRENT_PRICE: &'static str = "current_price";

    pub fn new() -> Self {
        Self::default()
    }

    /// Key of the in-currency percent change field for a timeframe suffix.
    pub fn percent_in_currency_key(suffix: &str) -> String {
        format!("price_change_percentage_{suffix}_in_currency")
    }

    /// Key of the plain percent change field for a timeframe suffix.
    pub fn percent_key(suffix: &str) -> String {
        format!("price_change_percentage_{suffix}")
    }

    /// Key of the absolute USD change field for a timeframe suffix.
    pub fn dollar_key(suffix: &str) -> String {
        format!("price_change_{suffix}")
    }

    /// Current USD price, if present and numeric.
    pub fn current_price(&self) -> Option<Decimal> {
        self.decimal(Self::CURRENT_PRICE)
    }

    /// Numeric field value, accepting JSON numbers and numeric strings.
    pub fn decimal(&self, key: &str) -> Option<Decimal> {
        match self.0.get(key)? {
            Value::Number(number) => parse_decimal(&number.to_string()),
            Value::String(text) => parse_decimal(text),
            _ => None,
        }
    }

    /// Builder style field insertion.
    pub fn with(mut self, key: impl Into<String>, value: Decimal) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Decimal) {
        self.0.insert(key.into(), Value::String(value.to_string()));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Determine if the payload carries change data for `timeframe`.
    ///
    /// Always true for [`Timeframe::All`], which is computed from the price alone.
    pub fn covers(&self, timeframe: Timeframe) -> bool {
        let Some(suffix) = timeframe.field_suffix() else {
            return true;
        };
        [
            Self::percent_in_currency_key(suffix),
            Self::percent_key(suffix),
            Self::dollar_key(suffix),
        ]
        .iter()
        .any(|key| self.decimal(key).is_some())
    }
}

impl TryFrom<Value> for RawPricePayload {
    type Error = DataError;

    /// Accepts an object, or a list endpoint response whose first element is an object.
    fn try_from(value: Value) -> Result<Self, Self::Error> {
        match value {
            Value::Object(map) => Ok(Self(map)),
            Value::Array(items) => match items.into_iter().next() {
                Some(Value::Object(map)) => Ok(Self(map)),
                Some(_) => Err(DataError::MalformedPayload(
                    "first list element is not an object".to_string(),
                )),
                None => Err(DataError::MalformedPayload("empty list payload".to_string())),
            },
            other => Err(DataError::MalformedPayload(format!(
                "expected object payload, found {other}"
            ))),
        }
    }
}

fn parse_decimal(text: &str) -> Option<Decimal> {
    let text = text.trim();
    Decimal::from_str(text)
        .or_else(|_| Decimal::from_scientific(text))
        .ok()
}
