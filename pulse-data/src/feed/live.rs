//! Live WebSocket feeds with fixed backoff reconnection.
//!
//! One generic connection loop drives both the price and the order book sockets. Inbound text
//! frames are handed to a [`SocketHandler`], which turns them into canonical messages pushed
//! into the engine's channels.

use crate::{
    books::{BookEvent, BookMessage},
    chain::{ConnectionStatus, LiveHandle},
    config::EngineConfig,
    error::DataError,
    quote::RawPricePayload,
    source::DataSource,
    streams::TimeoutStream,
};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::Value;
use std::{ops::ControlFlow, time::Duration};
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{Instant, interval_at},
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

/// Live socket configuration
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// WebSocket URL
    pub url: String,
    /// Ping interval to keep the connection alive
    pub ping_interval: Duration,
    /// Fixed delay before every reconnection attempt
    pub reconnect_delay: Duration,
    /// Idle period after which the connection is considered dead
    pub read_timeout: Duration,
}

impl SocketConfig {
    pub fn new(url: impl Into<String>, engine: &EngineConfig) -> Self {
        Self {
            url: url.into(),
            ping_interval: Duration::from_secs(30),
            reconnect_delay: engine.live_reconnect_delay,
            read_timeout: engine.live_read_timeout,
        }
    }

    /// Set ping interval
    pub fn with_ping_interval(mut self, interval: Duration) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set reconnect delay
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }
}

/// Receives connection lifecycle changes and inbound text frames of a live socket.
#[async_trait]
pub trait SocketHandler: Send {
    async fn on_status(&mut self, status: ConnectionStatus);

    /// Handle one text frame. [`ControlFlow::Break`] stops the socket loop for good.
    async fn on_text(&mut self, text: &str) -> ControlFlow<()>;

    /// Determine if the consumer has gone away and reconnecting is pointless.
    fn is_closed(&self) -> bool {
        false
    }
}

/// Connection loop with fixed backoff auto-reconnect.
///
/// Reconnection is attempted after every disconnect regardless of what the fallback tiers are
/// currently serving.
pub async fn run_socket_loop<H>(config: SocketConfig, mut handler: H)
where
    H: SocketHandler,
{
    info!(url = %config.url, "starting live socket feed");

    loop {
        handler.on_status(ConnectionStatus::Reconnecting).await;

        match connect_async(config.url.as_str()).await {
            Ok((ws_stream, _)) => {
                info!(url = %config.url, "live socket connected");
                handler.on_status(ConnectionStatus::Connected).await;

                let (mut write, read) = ws_stream.split();
                let mut read = Box::pin(TimeoutStream::new(read, config.read_timeout));
                let mut ping = interval_at(
                    Instant::now() + config.ping_interval,
                    config.ping_interval,
                );

                let flow = loop {
                    tokio::select! {
                        _ = ping.tick() => {
                            if write.send(Message::Ping(vec![].into())).await.is_err() {
                                debug!("failed to send ping, connection likely dead");
                                break ControlFlow::Continue(());
                            }
                        }
                        message = read.next() => match message {
                            Some(Ok(Message::Text(text))) => {
                                if handler.on_text(&text).await.is_break() {
                                    break ControlFlow::Break(());
                                }
                            }
                            Some(Ok(Message::Ping(payload))) => {
                                let _ = write.send(Message::Pong(payload)).await;
                            }
                            Some(Ok(Message::Close(frame))) => {
                                info!(?frame, "live socket closed by server");
                                break ControlFlow::Continue(());
                            }
                            Some(Ok(_)) => {}
                            Some(Err(error)) => {
                                warn!(%error, "live socket error");
                                break ControlFlow::Continue(());
                            }
                            None => {
                                warn!("live socket stream ended");
                                break ControlFlow::Continue(());
                            }
                        }
                    }
                };

                handler.on_status(ConnectionStatus::Disconnected).await;
                if flow.is_break() {
                    info!(url = %config.url, "live feed consumer dropped, stopping socket loop");
                    return;
                }
            }
            Err(error) => {
                warn!(
                    url = %config.url,
                    error = %DataError::from(error),
                    "live socket connection failed"
                );
                handler.on_status(ConnectionStatus::Disconnected).await;
            }
        }

        if handler.is_closed() {
            info!(url = %config.url, "live feed consumer dropped, stopping socket loop");
            return;
        }

        info!(
            delay_ms = config.reconnect_delay.as_millis() as u64,
            "reconnecting live socket"
        );
        tokio::time::sleep(config.reconnect_delay).await;
    }
}

/// 24 hour rolling ticker event.
///
/// ```json
/// {"e":"24hrTicker","s":"BTCUSDT","c":"67230.50","P":"1.89","p":"1247.09"}
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct Ticker24h {
    #[serde(rename = "c")]
    pub last_price: Decimal,
    #[serde(rename = "P")]
    pub price_change_percent: Decimal,
    #[serde(rename = "p")]
    pub price_change: Decimal,
}

impl From<Ticker24h> for RawPricePayload {
    fn from(ticker: Ticker24h) -> Self {
        RawPricePayload::new()
            .with(RawPricePayload::CURRENT_PRICE, ticker.last_price)
            .with(RawPricePayload::percent_key("24h"), ticker.price_change_percent)
            .with(RawPricePayload::dollar_key("24h"), ticker.price_change)
    }
}

/// Map a live price frame onto the canonical payload scheme.
///
/// Accepts canonical payloads and 24 hour ticker events. Returns `Ok(None)` for frames that carry
/// no price (subscription responses, heartbeats).
pub fn parse_live_price_message(text: &str) -> Result<Option<RawPricePayload>, DataError> {
    let value = serde_json::from_str::<Value>(text)
        .map_err(|error| DataError::MalformedPayload(error.to_string()))?;

    if value.get("e").and_then(Value::as_str) == Some("24hrTicker") {
        return serde_json::from_value::<Ticker24h>(value)
            .map(|ticker| Some(RawPricePayload::from(ticker)))
            .map_err(|error| DataError::MalformedPayload(error.to_string()));
    }

    let carries_price = match &value {
        Value::Object(map) => map.contains_key(RawPricePayload::CURRENT_PRICE),
        Value::Array(items) => items
            .first()
            .is_some_and(|item| item.get(RawPricePayload::CURRENT_PRICE).is_some()),
        _ => false,
    };

    if carries_price {
        RawPricePayload::try_from(value).map(Some)
    } else {
        Ok(None)
    }
}

/// Publishes live price frames into the live tier.
#[derive(Debug)]
pub struct LivePriceHandler {
    handle: LiveHandle,
}

impl LivePriceHandler {
    pub fn new(handle: LiveHandle) -> Self {
        Self { handle }
    }
}

#[async_trait]
impl SocketHandler for LivePriceHandler {
    async fn on_status(&mut self, status: ConnectionStatus) {
        self.handle.set_status(status);
    }

    async fn on_text(&mut self, text: &str) -> ControlFlow<()> {
        match parse_live_price_message(text) {
            Ok(Some(payload)) => self.handle.push(payload),
            Ok(None) => debug!(payload = text, "ignoring non-price live frame"),
            Err(error) => warn!(%error, "failed to parse live price frame"),
        }

        if self.handle.is_closed() {
            ControlFlow::Break(())
        } else {
            ControlFlow::Continue(())
        }
    }

    fn is_closed(&self) -> bool {
        self.handle.is_closed()
    }
}

/// Forwards live order book frames to the [`BookFeed`](crate::books::BookFeed) channel.
#[derive(Debug)]
pub struct LiveBookHandler {
    events: mpsc::Sender<BookEvent>,
    status: watch::Sender<ConnectionStatus>,
}

impl LiveBookHandler {
    pub fn new(events: mpsc::Sender<BookEvent>) -> (Self, watch::Receiver<ConnectionStatus>) {
        let (status, status_rx) = watch::channel(ConnectionStatus::Disconnected);
        (Self { events, status }, status_rx)
    }
}

#[async_trait]
impl SocketHandler for LiveBookHandler {
    async fn on_status(&mut self, status: ConnectionStatus) {
        self.status.send_replace(status);
    }

    async fn on_text(&mut self, text: &str) -> ControlFlow<()> {
        let message = match serde_json::from_str::<BookMessage>(text) {
            Ok(BookMessage::Ignore) => return ControlFlow::Continue(()),
            Ok(message) => message,
            Err(error) => {
                warn!(%error, "failed to parse live order book frame");
                return ControlFlow::Continue(());
            }
        };

        match self.events.send(BookEvent::new(message, DataSource::Live)).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(_) => ControlFlow::Break(()),
        }
    }

    fn is_closed(&self) -> bool {
        self.events.is_closed()
    }
}

/// Spawn the live price socket, publishing into `handle`.
pub fn spawn_live_price_feed(config: SocketConfig, handle: LiveHandle) -> JoinHandle<()> {
    tokio::spawn(run_socket_loop(config, LivePriceHandler::new(handle)))
}

/// Spawn the live order book socket, forwarding into `events`.
///
/// Returns the socket's connection status, used to activate the REST book poller while the
/// socket is down.
pub fn spawn_live_book_feed(
    config: SocketConfig,
    events: mpsc::Sender<BookEvent>,
) -> (watch::Receiver<ConnectionStatus>, JoinHandle<()>) {
    let (handler, status) = LiveBookHandler::new(events);
    (status, tokio::spawn(run_socket_loop(config, handler)))
}
