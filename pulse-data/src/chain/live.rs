//! Read side of the live push tier.
//!
//! The socket feed owns a [`LiveHandle`] and publishes connection status and the latest payload
//! into a `watch` channel; the [`FallbackChain`](super::FallbackChain) reads it through a
//! [`LiveTier`] and never blocks on the socket.

use crate::{
    error::DataError,
    quote::{PriceQuote, RawPricePayload, Timeframe, normalize},
    source::Tier,
};
use serde::{Deserialize, Serialize};
use std::{sync::Arc, time::Duration};
use tokio::{sync::watch, time::Instant};

/// Connection status updates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum ConnectionStatus {
    Connected,
    Disconnected,
    Reconnecting,
}

/// Latest state published by the live socket feed.
#[derive(Debug, Clone)]
pub struct LiveState {
    pub status: ConnectionStatus,
    pub payload: Option<RawPricePayload>,
    pub received_at: Option<Instant>,
    /// Incremented on every transition into [`ConnectionStatus::Connected`]
    pub epoch: u64,
}

impl Default for LiveState {
    fn default() -> Self {
        Self {
            status: ConnectionStatus::Disconnected,
            payload: None,
            received_at: None,
            epoch: 0,
        }
    }
}

/// Write half of the live tier, owned by the socket feed.
#[derive(Debug, Clone)]
pub struct LiveHandle {
    tx: Arc<watch::Sender<LiveState>>,
}

impl LiveHandle {
    pub fn set_status(&self, status: ConnectionStatus) {
        self.tx.send_if_modified(|state| {
            if state.status == status {
                return false;
            }
            if status == ConnectionStatus::Connected {
                state.epoch += 1;
            }
            state.status = status;
            true
        });
    }

    pub fn push(&self, payload: RawPricePayload) {
        self.tx.send_modify(|state| {
            state.payload = Some(payload);
            state.received_at = Some(Instant::now());
        });
    }

    /// Determine if every [`LiveTier`] reader has been dropped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Read half of the live tier.
#[derive(Debug, Clone)]
pub struct LiveTier {
    rx: watch::Receiver<LiveState>,
    max_age: Duration,
}

impl LiveTier {
    /// Create a connected ([`LiveHandle`], [`LiveTier`]) pair.
    pub fn channel(max_age: Duration) -> (LiveHandle, LiveTier) {
        let (tx, rx) = watch::channel(LiveState::default());
        (LiveHandle { tx: Arc::new(tx) }, LiveTier { rx, max_age })
    }

    pub fn status(&self) -> ConnectionStatus {
        self.rx.borrow().status
    }

    pub fn epoch(&self) -> u64 {
        self.rx.borrow().epoch
    }

    /// Quote from the latest live payload, if the socket is connected and the payload is fresh.
    pub fn current(&self, timeframe: Timeframe) -> Result<PriceQuote, DataError> {
        evaluate(&self.rx.borrow(), timeframe, self.max_age)
    }

    /// Wait until the live tier can serve a quote for `timeframe`.
    ///
    /// Returns `None` if the socket feed has gone away.
    pub async fn next_quote(&self, timeframe: Timeframe) -> Option<PriceQuote> {
        let mut rx = self.rx.clone();
        loop {
            rx.changed().await.ok()?;
            if let Ok(quote) = evaluate(&rx.borrow_and_update(), timeframe, self.max_age) {
                return Some(quote);
            }
        }
    }
}

fn evaluate(
    state: &LiveState,
    timeframe: Timeframe,
    max_age: Duration,
) -> Result<PriceQuote, DataError> {
    let unavailable = |reason: &str| DataError::TierUnavailable {
        tier: Tier::Live,
        reason: reason.to_string(),
    };

    if state.status != ConnectionStatus::Connected {
        return Err(unavailable("socket not connected"));
    }

    let (Some(payload), Some(received_at)) = (&state.payload, state.received_at) else {
        return Err(unavailable("no payload received yet"));
    };

    if received_at.elapsed() > max_age {
        return Err(unavailable("latest payload too old"));
    }

    let quote = normalize(payload, timeframe)?;
    if !payload.covers(timeframe) {
        return Err(unavailable("latest payload carries no change data for timeframe"));
    }

    Ok(quote)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn payload(price: rust_decimal::Decimal) -> RawPricePayload {
        RawPricePayload::new()
            .with(RawPricePayload::CURRENT_PRICE, price)
            .with(RawPricePayload::percent_key("24h"), dec!(1))
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_tier_current() {
        let (handle, tier) = LiveTier::channel(Duration::from_secs(10));

        // TC0: disconnected
        assert!(matches!(
            tier.current(Timeframe::OneDay),
            Err(DataError::TierUnavailable { tier: Tier::Live, .. })
        ));

        // TC1: connected without payload
        handle.set_status(ConnectionStatus::Connected);
        assert!(tier.current(Timeframe::OneDay).is_err());

        // TC2: connected with fresh payload
        handle.push(payload(dec!(10100)));
        assert_eq!(tier.current(Timeframe::OneDay).unwrap().price, dec!(10100));

        // TC3: payload older than max age
        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(tier.current(Timeframe::OneDay).is_err());

        // TC4: malformed payload surfaces as MalformedPayload
        handle.push(RawPricePayload::new());
        assert!(matches!(
            tier.current(Timeframe::OneDay),
            Err(DataError::MalformedPayload(_))
        ));

        // TC5: payload without change data for the requested timeframe
        handle.push(payload(dec!(10200)));
        assert!(tier.current(Timeframe::OneDay).is_ok());
        assert!(tier.current(Timeframe::All).is_ok());
        assert!(matches!(
            tier.current(Timeframe::OneWeek),
            Err(DataError::TierUnavailable { tier: Tier::Live, .. })
        ));
    }

    #[test]
    fn test_epoch_increments_on_reconnect() {
        let (handle, tier) = LiveTier::channel(Duration::from_secs(10));
        assert_eq!(tier.epoch(), 0);

        handle.set_status(ConnectionStatus::Connected);
        handle.set_status(ConnectionStatus::Connected);
        assert_eq!(tier.epoch(), 1);

        handle.set_status(ConnectionStatus::Disconnected);
        handle.set_status(ConnectionStatus::Reconnecting);
        handle.set_status(ConnectionStatus::Connected);
        assert_eq!(tier.epoch(), 2);
        assert_eq!(tier.status(), ConnectionStatus::Connected);
    }

    #[tokio::test]
    async fn test_next_quote_waits_for_reconnect() {
        let (handle, tier) = LiveTier::channel(Duration::from_secs(10));

        let waiter = tokio::spawn({
            let tier = tier.clone();
            async move { tier.next_quote(Timeframe::OneDay).await }
        });

        handle.push(payload(dec!(20200)));
        handle.set_status(ConnectionStatus::Connected);

        let quote = waiter.await.unwrap().unwrap();
        assert_eq!(quote.price, dec!(20200));
    }

    #[tokio::test]
    async fn test_next_quote_ends_when_feed_dropped() {
        let (handle, tier) = LiveTier::channel(Duration::from_secs(10));
        drop(handle);
        assert!(tier.next_quote(Timeframe::OneDay).await.is_none());
    }
}
