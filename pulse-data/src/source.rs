use derive_more::Display;
use serde::{Deserialize, Serialize};

/// One source in the fallback chain.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Tier {
    #[display("LIVE")]
    Live,
    #[display("REST")]
    Rest,
    #[display("CACHE")]
    Cache,
    #[display("SYNTHETIC")]
    Synthetic,
}

/// Provenance tag attached to every value handed to consumers.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DataSource {
    #[display("LIVE")]
    Live,
    #[display("REST_FALLBACK")]
    RestFallback,
    #[display("CACHE_FALLBACK")]
    CacheFallback,
    #[display("SYNTHETIC")]
    Synthetic,
}

impl From<Tier> for DataSource {
    fn from(tier: Tier) -> Self {
        match tier {
            Tier::Live => DataSource::Live,
            Tier::Rest => DataSource::RestFallback,
            Tier::Cache => DataSource::CacheFallback,
            Tier::Synthetic => DataSource::Synthetic,
        }
    }
}

impl DataSource {
    /// Determine if the value came from a degraded (non-live) source.
    pub fn is_fallback(&self) -> bool {
        !matches!(self, DataSource::Live)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_serde_names() {
        assert_eq!(
            serde_json::to_string(&DataSource::CacheFallback).unwrap(),
            r#""CACHE_FALLBACK""#
        );
        assert_eq!(
            serde_json::from_str::<DataSource>(r#""REST_FALLBACK""#).unwrap(),
            DataSource::RestFallback
        );
        assert_eq!(serde_json::to_string(&Tier::Synthetic).unwrap(), r#""SYNTHETIC""#);
    }

    #[test]
    fn test_tier_to_source() {
        assert_eq!(DataSource::from(Tier::Live), DataSource::Live);
        assert_eq!(DataSource::from(Tier::Rest), DataSource::RestFallback);
        assert_eq!(DataSource::from(Tier::Cache), DataSource::CacheFallback);
        assert!(DataSource::from(Tier::Synthetic).is_fallback());
        assert!(!DataSource::Live.is_fallback());
    }
}
