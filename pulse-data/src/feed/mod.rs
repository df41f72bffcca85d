/// Live WebSocket price and order book feeds.
pub mod live;

/// REST price source and order book poller.
pub mod rest;

pub use live::{
    LiveBookHandler, LivePriceHandler, SocketConfig, SocketHandler, parse_live_price_message,
    run_socket_loop, spawn_live_book_feed, spawn_live_price_feed,
};
pub use rest::{RestBookPoller, RestPriceSource};
