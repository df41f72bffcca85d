use chrono::Utc;
use futures::{SinkExt, StreamExt};
use pulse_data::{
    Acquired, BookFeed, BookView, DataError, EngineConfig, FallbackChain, LiveTier,
    OrderBookSnapshot, PriceView, SchedulerHandle, Timeframe, UpdateScheduler, ViewState,
    books::ChangedLevels,
    feed::{RestBookPoller, RestPriceSource, SocketConfig, spawn_live_book_feed, spawn_live_price_feed},
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::{broadcast, mpsc, watch},
};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use url::Url;

const DEFAULT_WS_ADDR: &str = "0.0.0.0:9001";
const DEFAULT_LIVE_PRICE_URL: &str = "wss://stream.binance.com:9443/ws/btcusdt@ticker";
const DEFAULT_LIVE_BOOK_URL: &str = "wss://stream.binance.com:9443/ws/btcusdt@depth20@100ms";
const DEFAULT_REST_PRICE_URL: &str = "https://api.coingecko.com/api/v3/coins/markets?vs_currency=usd&ids=bitcoin&price_change_percentage=1h,24h,7d,30d,1y";
const DEFAULT_REST_BOOK_URL: &str = "https://api.binance.com/api/v3/depth?symbol=BTCUSDT&limit=100";

/// Outbound message to UI clients
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ServerMessage {
    Quote {
        sequence: u64,
        timeframe: Timeframe,
        #[serde(flatten)]
        acquired: Acquired,
    },
    Book {
        sequence: u64,
        #[serde(flatten)]
        snapshot: OrderBookSnapshot,
        best_bid: Option<Decimal>,
        best_ask: Option<Decimal>,
        mid_price: Option<Decimal>,
        spread_percentage: Option<Decimal>,
        changed: ChangedLevels,
    },
    Unavailable {
        sequence: u64,
        timeframe: Timeframe,
        error: DataError,
        message: String,
    },
}

impl ServerMessage {
    fn from_price_view(view: &PriceView) -> Option<Self> {
        match &view.state {
            ViewState::Pending => None,
            ViewState::Ready(acquired) => Some(Self::Quote {
                sequence: view.sequence,
                timeframe: view.timeframe,
                acquired: *acquired,
            }),
            ViewState::Unavailable(error) if !error.is_user_visible() => None,
            ViewState::Unavailable(error) => Some(Self::Unavailable {
                sequence: view.sequence,
                timeframe: view.timeframe,
                error: error.clone(),
                message: error.to_string(),
            }),
        }
    }

    fn from_book_view(view: &BookView) -> Option<Self> {
        let snapshot = view.snapshot.as_ref()?;
        Some(Self::Book {
            sequence: view.sequence,
            best_bid: snapshot.best_bid().map(|level| level.price),
            best_ask: snapshot.best_ask().map(|level| level.price),
            mid_price: snapshot.mid_price(),
            spread_percentage: snapshot.spread_percentage(),
            snapshot: OrderBookSnapshot::clone(snapshot),
            changed: view.changed.clone(),
        })
    }
}

/// Inbound command from UI clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientCommand {
    Refresh,
    Timeframe { timeframe: Timeframe },
    Visibility { visible: bool },
}

/// Server wiring configuration, read from `PULSE_*` environment variables
#[derive(Debug, Clone)]
struct ServerConfig {
    addr: SocketAddr,
    buffer_size: usize,
    live_price_url: String,
    live_book_url: String,
    rest_price_url: Url,
    rest_book_url: Url,
    book_poll_interval: Duration,
}

impl ServerConfig {
    fn from_env() -> Result<Self, DataError> {
        let var = |key: &str, default: &str| std::env::var(key).unwrap_or_else(|_| default.to_string());
        let url = |key: &str, default: &str| {
            let raw = var(key, default);
            Url::parse(&raw)
                .map_err(|error| DataError::InvalidConfig(format!("{key}={raw}: {error}")))
        };

        let addr_raw = var("PULSE_WS_ADDR", DEFAULT_WS_ADDR);
        let addr = addr_raw
            .parse::<SocketAddr>()
            .map_err(|error| DataError::InvalidConfig(format!("PULSE_WS_ADDR={addr_raw}: {error}")))?;

        Ok(Self {
            addr,
            buffer_size: std::env::var("PULSE_WS_BUFFER_SIZE")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(1_000),
            live_price_url: url("PULSE_LIVE_PRICE_URL", DEFAULT_LIVE_PRICE_URL)?.to_string(),
            live_book_url: url("PULSE_LIVE_BOOK_URL", DEFAULT_LIVE_BOOK_URL)?.to_string(),
            rest_price_url: url("PULSE_REST_PRICE_URL", DEFAULT_REST_PRICE_URL)?,
            rest_book_url: url("PULSE_REST_BOOK_URL", DEFAULT_REST_BOOK_URL)?,
            book_poll_interval: std::env::var("PULSE_BOOK_POLL_INTERVAL_MS")
                .ok()
                .and_then(|value| value.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(Duration::from_secs(5)),
        })
    }
}

/// Latest published state, sent to every client on connect
#[derive(Debug, Clone)]
struct Latest {
    price: watch::Receiver<PriceView>,
    book: watch::Receiver<BookView>,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    init_logging();

    info!("Starting pulse-data WebSocket server");

    let engine = EngineConfig::from_env();
    if let Err(error) = engine.validate() {
        error!(%error, "Invalid engine configuration");
        return;
    }

    let server = match ServerConfig::from_env() {
        Ok(server) => server,
        Err(error) => {
            error!(%error, "Invalid server configuration");
            return;
        }
    };
    info!(?engine, ?server, "Configuration loaded");

    // Price: live socket tier -> fallback chain -> scheduler
    let (live_handle, live_tier) = LiveTier::channel(engine.live_max_age);
    spawn_live_price_feed(
        SocketConfig::new(&server.live_price_url, &engine),
        live_handle,
    );

    let rest = match RestPriceSource::new(server.rest_price_url.clone(), engine.tier_timeout) {
        Ok(rest) => rest,
        Err(error) => {
            error!(%error, "Failed to build REST price client");
            return;
        }
    };
    let chain = Arc::new(FallbackChain::new(engine.clone(), live_tier, rest));
    let (scheduler, price_view, _) = UpdateScheduler::new(chain, engine.refresh_interval).start();

    // Order book: live socket + REST poller -> single ordered channel -> book feed
    let (book_tx, book_rx) = mpsc::channel(server.buffer_size);
    let (live_book_status, _) = spawn_live_book_feed(
        SocketConfig::new(&server.live_book_url, &engine),
        book_tx.clone(),
    );

    match RestBookPoller::new(
        server.rest_book_url.clone(),
        server.book_poll_interval,
        engine.tier_timeout,
    ) {
        Ok(poller) => {
            tokio::spawn(poller.run(book_tx, live_book_status));
        }
        Err(error) => warn!(%error, "REST order book poller disabled"),
    }

    let (book_feed, book_view) = BookFeed::new(engine.clone());
    tokio::spawn(book_feed.with_price_reference(price_view.clone()).run(book_rx));

    // Create broadcast channel for outbound messages
    let (tx, _rx) = broadcast::channel::<ServerMessage>(server.buffer_size);
    let tx = Arc::new(tx);

    tokio::spawn(forward_price_views(price_view.clone(), tx.clone()));
    tokio::spawn(forward_book_views(book_view.clone(), tx.clone()));

    let latest = Latest {
        price: price_view,
        book: book_view,
    };
    tokio::spawn(start_websocket_server(
        server.addr,
        tx,
        scheduler.clone(),
        latest,
    ));

    info!("WebSocket server listening on ws://{}", server.addr);

    if let Err(error) = tokio::signal::ctrl_c().await {
        error!(%error, "Failed to listen for shutdown signal");
    }

    info!("Shutting down");
    scheduler.stop();
}

/// Broadcast every applied price view
async fn forward_price_views(
    mut views: watch::Receiver<PriceView>,
    tx: Arc<broadcast::Sender<ServerMessage>>,
) {
    while views.changed().await.is_ok() {
        let message = ServerMessage::from_price_view(&views.borrow_and_update());
        if let Some(message) = message {
            // No receivers is fine
            let _ = tx.send(message);
        }
    }
    info!("Price view channel closed");
}

/// Broadcast every published book view
async fn forward_book_views(
    mut views: watch::Receiver<BookView>,
    tx: Arc<broadcast::Sender<ServerMessage>>,
) {
    while views.changed().await.is_ok() {
        let message = ServerMessage::from_book_view(&views.borrow_and_update());
        if let Some(message) = message {
            let _ = tx.send(message);
        }
    }
    info!("Book view channel closed");
}

/// Start WebSocket server that broadcasts quotes and books to connected clients
async fn start_websocket_server(
    addr: SocketAddr,
    tx: Arc<broadcast::Sender<ServerMessage>>,
    scheduler: SchedulerHandle,
    latest: Latest,
) {
    let listener = TcpListener::bind(&addr)
        .await
        .expect("Failed to bind WebSocket server");

    info!("WebSocket server bound to {}", addr);

    while let Ok((stream, peer_addr)) = listener.accept().await {
        info!("New WebSocket connection from {}", peer_addr);
        tokio::spawn(handle_client(
            stream,
            peer_addr,
            tx.clone(),
            scheduler.clone(),
            latest.clone(),
        ));
    }
}

/// Handle individual WebSocket client connection
async fn handle_client(
    stream: TcpStream,
    peer_addr: SocketAddr,
    tx: Arc<broadcast::Sender<ServerMessage>>,
    scheduler: SchedulerHandle,
    latest: Latest,
) {
    let ws_stream = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            error!("WebSocket handshake failed for {}: {}", peer_addr, e);
            return;
        }
    };

    info!("WebSocket handshake completed for {}", peer_addr);

    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
    let mut rx = tx.subscribe();

    // Send welcome message, then the latest state so the client never starts empty
    let welcome = serde_json::json!({
        "type": "welcome",
        "message": "Connected to pulse-data market feed",
        "timestamp": Utc::now()
    });
    let initial = [
        ServerMessage::from_price_view(&latest.price.borrow()),
        ServerMessage::from_book_view(&latest.book.borrow()),
    ];
    let initial = std::iter::once(serde_json::to_string(&welcome))
        .chain(initial.into_iter().flatten().map(|message| serde_json::to_string(&message)))
        .filter_map(Result::ok)
        .collect::<Vec<_>>();

    for text in initial {
        if ws_sender.send(Message::Text(text.into())).await.is_err() {
            return;
        }
    }

    // Spawn task to send broadcast messages to this client
    let mut send_task = tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(message) => {
                    if let Ok(json) = serde_json::to_string(&message) {
                        if ws_sender.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // Views are replaced whole, the next one supersedes anything skipped
                    warn!("Client {} lagged, skipped {} messages", peer_addr, skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Broadcast channel closed for {}", peer_addr);
                    break;
                }
            }
        }
    });

    // Handle incoming commands from client
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = ws_receiver.next().await {
            match msg {
                Ok(Message::Close(_)) => break,
                Ok(Message::Ping(_)) => {
                    debug!("Received ping from {}", peer_addr);
                }
                Ok(Message::Text(text)) => match serde_json::from_str::<ClientCommand>(&text) {
                    Ok(command) => {
                        debug!("Received {:?} from {}", command, peer_addr);
                        let delivered = match command {
                            ClientCommand::Refresh => scheduler.refresh_now(),
                            ClientCommand::Timeframe { timeframe } => {
                                scheduler.set_timeframe(timeframe)
                            }
                            ClientCommand::Visibility { visible } => scheduler.set_visible(visible),
                        };
                        if !delivered {
                            warn!("Scheduler stopped, dropping command from {}", peer_addr);
                        }
                    }
                    Err(e) => {
                        debug!("Ignoring unrecognised message from {}: {}", peer_addr, e);
                    }
                },
                Err(e) => {
                    error!("WebSocket error for {}: {}", peer_addr, e);
                    break;
                }
                _ => {}
            }
        }
    });

    // Wait for either task to complete
    tokio::select! {
        _ = &mut send_task => {
            info!("Send task completed for {}", peer_addr);
            recv_task.abort();
        }
        _ = &mut recv_task => {
            info!("Receive task completed for {}", peer_addr);
            send_task.abort();
        }
    }

    info!("WebSocket connection closed for {}", peer_addr);
}

/// Initialize logging
fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_data::{DataSource, Direction, PriceQuote};
    use rust_decimal_macros::dec;

    #[test]
    fn test_client_command_de() {
        struct TestCase {
            input: &'static str,
            expected: Option<ClientCommand>,
        }

        let tests = vec![
            TestCase {
                // TC0: manual refresh
                input: r#"{"type":"refresh"}"#,
                expected: Some(ClientCommand::Refresh),
            },
            TestCase {
                // TC1: timeframe switch
                input: r#"{"type":"timeframe","timeframe":"1W"}"#,
                expected: Some(ClientCommand::Timeframe {
                    timeframe: Timeframe::OneWeek,
                }),
            },
            TestCase {
                // TC2: visibility change
                input: r#"{"type":"visibility","visible":false}"#,
                expected: Some(ClientCommand::Visibility { visible: false }),
            },
            TestCase {
                // TC3: unknown timeframe
                input: r#"{"type":"timeframe","timeframe":"5Y"}"#,
                expected: None,
            },
            TestCase {
                // TC4: unknown command
                input: r#"{"type":"subscribe"}"#,
                expected: None,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            let actual = serde_json::from_str::<ClientCommand>(test.input).ok();
            assert_eq!(actual, test.expected, "TC{} failed", index);
        }
    }

    #[test]
    fn test_server_message_from_price_view() {
        // TC0: pending views are not broadcast
        let pending = PriceView {
            sequence: 0,
            timeframe: Timeframe::OneDay,
            state: ViewState::Pending,
        };
        assert!(ServerMessage::from_price_view(&pending).is_none());

        // TC1: quote
        let ready = PriceView {
            sequence: 3,
            timeframe: Timeframe::OneDay,
            state: ViewState::Ready(Acquired {
                quote: PriceQuote {
                    price: dec!(67230.50),
                    absolute_change: dec!(1247.09),
                    percent_change: dec!(1.89),
                    direction: Direction::Up,
                    timeframe: Timeframe::OneDay,
                },
                source: DataSource::CacheFallback,
                stale: true,
                acquired_at: Utc::now(),
            }),
        };
        let json = serde_json::to_value(ServerMessage::from_price_view(&ready).unwrap()).unwrap();
        assert_eq!(json["type"], "quote");
        assert_eq!(json["sequence"], 3);
        assert_eq!(json["timeframe"], "1D");
        assert_eq!(json["source"], "CACHE_FALLBACK");
        assert_eq!(json["stale"], true);
        assert_eq!(json["quote"]["price"], "67230.50");

        // TC2: exhaustion
        let unavailable = PriceView {
            sequence: 4,
            timeframe: Timeframe::OneDay,
            state: ViewState::Unavailable(DataError::AllSourcesExhausted),
        };
        let json =
            serde_json::to_value(ServerMessage::from_price_view(&unavailable).unwrap()).unwrap();
        assert_eq!(json["type"], "unavailable");
        assert_eq!(json["message"], "all market data sources exhausted");

        // TC3: tier-level failures never reach clients
        let tier_failure = PriceView {
            sequence: 5,
            timeframe: Timeframe::OneDay,
            state: ViewState::Unavailable(DataError::Http("502 Bad Gateway".to_string())),
        };
        assert!(ServerMessage::from_price_view(&tier_failure).is_none());
    }
}
