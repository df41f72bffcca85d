use super::{BookMessage, ChangedLevels, OrderBookManager, OrderBookSnapshot};
use crate::{
    config::EngineConfig,
    scheduler::{PriceView, ViewState},
    source::DataSource,
    synthetic::synthetic_book,
};
use chrono::Utc;
use rust_decimal::Decimal;
use std::sync::Arc;
use tokio::{
    sync::{mpsc, watch},
    time::{Instant, interval_at},
};
use tracing::{debug, info, warn};

/// Order book message tagged with the tier that delivered it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookEvent {
    pub message: BookMessage,
    pub source: DataSource,
}

impl BookEvent {
    pub fn new(message: BookMessage, source: DataSource) -> Self {
        Self { message, source }
    }
}

/// Whole order book state published to readers. Replaced, never patched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct BookView {
    /// Incremented on every publication
    pub sequence: u64,
    pub snapshot: Option<Arc<OrderBookSnapshot>>,
    /// Levels to highlight, relative to the previously published snapshot
    pub changed: ChangedLevels,
}

/// Consumes every order book source through a single ordered channel and publishes
/// [`BookView`]s.
///
/// A staleness check runs every tier timeout: a snapshot with no fresh data for longer than the
/// cache TTL is re-published tagged [`DataSource::CacheFallback`], and if nothing was ever
/// received a synthetic book is published instead (when enabled).
#[derive(Debug)]
pub struct BookFeed {
    config: EngineConfig,
    manager: OrderBookManager,
    view_tx: watch::Sender<BookView>,
    price_reference: Option<watch::Receiver<PriceView>>,
    last_received: Option<Instant>,
    sequence: u64,
}

impl BookFeed {
    pub fn new(config: EngineConfig) -> (Self, watch::Receiver<BookView>) {
        let (view_tx, view_rx) = watch::channel(BookView::default());
        let feed = Self {
            manager: OrderBookManager::new(config.display_depth),
            config,
            view_tx,
            price_reference: None,
            last_received: None,
            sequence: 0,
        };
        (feed, view_rx)
    }

    /// Anchor synthetic books on the latest price published by an
    /// [`UpdateScheduler`](crate::scheduler::UpdateScheduler).
    pub fn with_price_reference(mut self, price_view: watch::Receiver<PriceView>) -> Self {
        self.price_reference = Some(price_view);
        self
    }

    /// Run until every [`BookEvent`] sender has been dropped.
    pub async fn run(mut self, mut events: mpsc::Receiver<BookEvent>) {
        let period = self.config.tier_timeout;
        let mut staleness = interval_at(Instant::now() + period, period);

        info!(display_depth = self.manager.display_depth(), "book feed started");

        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => self.apply(event),
                    None => break,
                },
                _ = staleness.tick() => self.check_staleness(),
            }
        }

        info!("book feed stopped, event channel closed");
    }

    /// Apply one book message and publish the result.
    pub fn apply(&mut self, event: BookEvent) {
        let observed_at = Utc::now();
        let update = match event.message {
            BookMessage::Ignore => return,
            BookMessage::Snapshot(book) => self
                .manager
                .apply_snapshot(book, event.source, observed_at)
                .map(Some),
            BookMessage::Update(book) => {
                if self.last_received.is_none() {
                    debug!("order book update received before a real snapshot, ignoring");
                    return;
                }
                self.manager.apply_update(book, event.source, observed_at)
            }
        };

        let update = match update {
            Ok(update) => update,
            Err(error) => {
                warn!(source = %event.source, %error, "rejecting order book message");
                return;
            }
        };

        if let Some(update) = update {
            self.last_received = Some(Instant::now());
            self.publish(Some(update.snapshot), update.changed);
        }
    }

    /// Degrade the published snapshot if the real sources went quiet.
    pub fn check_staleness(&mut self) {
        match self.last_received {
            Some(received) => {
                let age = received.elapsed();
                let already_degraded = self
                    .manager
                    .current()
                    .is_some_and(|current| current.source == DataSource::CacheFallback);

                if age < self.config.cache_ttl || already_degraded {
                    return;
                }

                warn!(
                    age_ms = age.as_millis() as u64,
                    "no fresh order book data, serving cached snapshot"
                );
                if let Some(snapshot) = self.manager.retag(DataSource::CacheFallback) {
                    self.publish(Some(snapshot), ChangedLevels::default());
                }
            }
            None if self.config.synthetic_enabled => {
                let mid = self.reference_price();
                debug!(%mid, "no order book data received yet, publishing synthetic book");
                let book = synthetic_book(mid, self.manager.display_depth(), &mut rand::rng());
                match self
                    .manager
                    .apply_snapshot(book, DataSource::Synthetic, Utc::now())
                {
                    Ok(update) => self.publish(Some(update.snapshot), update.changed),
                    Err(error) => warn!(%error, "synthetic order book rejected"),
                }
            }
            None => {}
        }
    }

    fn reference_price(&self) -> Decimal {
        let quoted = self
            .price_reference
            .as_ref()
            .and_then(|price_view| match &price_view.borrow().state {
                ViewState::Ready(acquired) => Some(acquired.quote.price),
                _ => None,
            });

        quoted
            .or_else(|| self.manager.current().and_then(|current| current.mid_price()))
            .unwrap_or(self.config.synthetic_base_price)
    }

    fn publish(&mut self, snapshot: Option<Arc<OrderBookSnapshot>>, changed: ChangedLevels) {
        self.sequence += 1;
        self.view_tx.send_replace(BookView {
            sequence: self.sequence,
            snapshot,
            changed,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        books::{RawBook, RawLevel},
        chain::Acquired,
        quote::{Direction, PriceQuote, Timeframe},
    };
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn config() -> EngineConfig {
        EngineConfig::default()
            .with_tier_timeout(Duration::from_secs(1))
            .with_cache_ttl(Duration::from_secs(5))
    }

    fn snapshot(asks: &[(Decimal, Decimal)], bids: &[(Decimal, Decimal)]) -> BookMessage {
        let levels = |levels: &[(Decimal, Decimal)]| {
            levels
                .iter()
                .map(|(price, amount)| RawLevel::new(*price, *amount))
                .collect()
        };
        BookMessage::Snapshot(RawBook {
            asks: levels(asks),
            bids: levels(bids),
        })
    }

    fn update(asks: &[(Decimal, Decimal)]) -> BookMessage {
        BookMessage::Update(RawBook {
            asks: asks
                .iter()
                .map(|(price, amount)| RawLevel::new(*price, *amount))
                .collect(),
            bids: vec![],
        })
    }

    #[tokio::test]
    async fn test_apply_publishes_snapshots_and_diffs() {
        let (mut feed, view) = BookFeed::new(config());
        let asks = [(dec!(101), dec!(1)), (dec!(102), dec!(2))];
        let bids = [(dec!(100), dec!(1))];

        // TC0: update before any snapshot is ignored
        feed.apply(BookEvent::new(update(&asks), DataSource::Live));
        assert_eq!(view.borrow().sequence, 0);

        // TC1: first snapshot
        feed.apply(BookEvent::new(snapshot(&asks, &bids), DataSource::Live));
        assert_eq!(view.borrow().sequence, 1);
        assert_eq!(view.borrow().changed.len(), 3);

        // TC2: identical snapshot yields an empty diff
        feed.apply(BookEvent::new(snapshot(&asks, &bids), DataSource::RestFallback));
        let current = view.borrow().clone();
        assert_eq!(current.sequence, 2);
        assert!(current.changed.is_empty());
        assert_eq!(
            current.snapshot.as_ref().map(|snapshot| snapshot.source),
            Some(DataSource::RestFallback)
        );

        // TC3: incremental update flags only the touched level
        feed.apply(BookEvent::new(update(&[(dec!(102), dec!(0))]), DataSource::Live));
        let current = view.borrow().clone();
        assert_eq!(current.sequence, 3);
        assert_eq!(current.changed.asks.iter().copied().collect::<Vec<_>>(), vec![dec!(102)]);
        assert_eq!(current.snapshot.map(|snapshot| snapshot.asks.len()), Some(1));

        // TC4: non-book messages are ignored
        feed.apply(BookEvent::new(BookMessage::Ignore, DataSource::Live));
        assert_eq!(view.borrow().sequence, 3);
    }

    #[tokio::test]
    async fn test_oversized_levels_rejected_and_feed_survives() {
        let (feed, mut view) = BookFeed::new(config().with_synthetic(false));
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(feed.run(rx));

        let oversized = serde_json::from_str::<BookMessage>(
            r#"{"bids":[["100","1"]],"asks":[["79228162514264337593543950335","2"]]}"#,
        )
        .unwrap();
        tx.send(BookEvent::new(oversized, DataSource::Live))
            .await
            .unwrap();
        tx.send(BookEvent::new(
            snapshot(&[(dec!(101), dec!(1))], &[(dec!(100), dec!(1))]),
            DataSource::Live,
        ))
        .await
        .unwrap();

        view.changed().await.unwrap();
        let current = view.borrow_and_update().clone();
        assert_eq!(current.sequence, 1);
        let published = current.snapshot.unwrap();
        assert_eq!(published.best_ask().unwrap().price, dec!(101));
        assert_eq!(published.spread, dec!(1));

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_quiet_sources_degrade_to_cache_fallback() {
        let (feed, mut view) = BookFeed::new(config());
        let (tx, rx) = mpsc::channel(8);
        let task = tokio::spawn(feed.run(rx));

        tx.send(BookEvent::new(
            snapshot(&[(dec!(101), dec!(1))], &[(dec!(100), dec!(1))]),
            DataSource::Live,
        ))
        .await
        .unwrap();
        view.changed().await.unwrap();
        assert_eq!(view.borrow_and_update().sequence, 1);

        tokio::time::sleep(Duration::from_millis(4_500)).await;
        assert_eq!(view.borrow().sequence, 1);

        view.changed().await.unwrap();
        let current = view.borrow_and_update().clone();
        assert_eq!(current.sequence, 2);
        assert!(current.changed.is_empty());
        let degraded = current.snapshot.unwrap();
        assert_eq!(degraded.source, DataSource::CacheFallback);
        assert_eq!(degraded.spread, dec!(1));

        // Re-published once only
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(view.borrow().sequence, 2);

        drop(tx);
        task.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthetic_book_when_nothing_received() {
        let (price_tx, price_rx) = watch::channel(PriceView {
            sequence: 1,
            timeframe: Timeframe::OneDay,
            state: ViewState::Ready(Acquired {
                quote: PriceQuote {
                    price: dec!(50000),
                    absolute_change: dec!(100),
                    percent_change: dec!(0.2),
                    direction: Direction::Up,
                    timeframe: Timeframe::OneDay,
                },
                source: DataSource::RestFallback,
                stale: false,
                acquired_at: Utc::now(),
            }),
        });

        let (feed, mut view) = BookFeed::new(config());
        let (tx, rx) = mpsc::channel(8);
        tokio::spawn(feed.with_price_reference(price_rx).run(rx));

        view.changed().await.unwrap();
        let synthetic = view.borrow_and_update().snapshot.clone().unwrap();
        assert_eq!(synthetic.source, DataSource::Synthetic);
        assert_eq!(synthetic.asks.len(), config().display_depth);
        assert_eq!(synthetic.best_ask().unwrap().price, dec!(50005));
        assert_eq!(synthetic.best_bid().unwrap().price, dec!(49995));

        // Real data replaces the synthetic book; updates are never patched onto it
        tx.send(BookEvent::new(
            snapshot(&[(dec!(50001), dec!(1))], &[(dec!(50000), dec!(1))]),
            DataSource::Live,
        ))
        .await
        .unwrap();
        view.changed().await.unwrap();
        let live = view.borrow_and_update().snapshot.clone().unwrap();
        assert_eq!(live.source, DataSource::Live);
        assert_eq!(live.asks.len(), 1);
        drop(price_tx);
    }

    #[tokio::test(start_paused = true)]
    async fn test_synthetic_disabled_publishes_nothing() {
        let (feed, view) = BookFeed::new(config().with_synthetic(false));
        let (_tx, rx) = mpsc::channel(8);
        tokio::spawn(feed.run(rx));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(view.borrow().sequence, 0);
        assert!(view.borrow().snapshot.is_none());
    }
}
