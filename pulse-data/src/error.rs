use crate::Tier;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// All errors generated in `pulse-data`.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Deserialize, Serialize, Error)]
pub enum DataError {
    #[error("malformed price payload: {0}")]
    MalformedPayload(String),

    #[error("{tier} tier timed out after {timeout_ms}ms")]
    TierTimeout { tier: Tier, timeout_ms: u64 },

    #[error("{tier} tier unavailable: {reason}")]
    TierUnavailable { tier: Tier, reason: String },

    #[error("all market data sources exhausted")]
    AllSourcesExhausted,

    #[error("SocketError: {0}")]
    Socket(String),

    #[error("HttpError: {0}")]
    Http(String),

    #[error("invalid order book: {0}")]
    InvalidBook(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl DataError {
    /// Determine if an error is a tier-level failure that the
    /// [`FallbackChain`](crate::chain::FallbackChain) recovers from by moving to the next tier.
    #[allow(clippy::match_like_matches_macro)]
    pub fn advances_chain(&self) -> bool {
        match self {
            DataError::MalformedPayload(_)
            | DataError::TierTimeout { .. }
            | DataError::TierUnavailable { .. }
            | DataError::Socket(_)
            | DataError::Http(_) => true,
            _ => false,
        }
    }

    /// Determine if an error must be rendered explicitly by the UI as "data unavailable".
    pub fn is_user_visible(&self) -> bool {
        matches!(self, DataError::AllSourcesExhausted)
    }
}

impl From<reqwest::Error> for DataError {
    fn from(value: reqwest::Error) -> Self {
        Self::Http(value.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for DataError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::Socket(value.to_string())
    }
}
