use crate::{
    config::EngineConfig,
    error::DataError,
    quote::{PriceQuote, Timeframe, normalize},
    scheduler::Acquire,
    source::{DataSource, Tier},
    synthetic::synthetic_quote,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use derive_more::Display;
use futures::{
    FutureExt,
    future::{BoxFuture, Shared},
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// In-memory [`PriceQuote`] cache tier.
pub mod cache;

/// Push-based live tier fed by the socket feed.
pub mod live;

/// Pull-based tier abstraction.
pub mod source;

pub use cache::{CachedQuote, QuoteCache};
pub use live::{ConnectionStatus, LiveHandle, LiveState, LiveTier};
pub use source::PriceSource;

/// First delay between background REST retries while a stale cache entry is served. Doubles
/// after every failed attempt.
const RETRY_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Position of the [`FallbackChain`] state machine.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChainState {
    #[display("ACQUIRING_LIVE")]
    AcquiringLive,
    #[display("LIVE")]
    Live,
    #[display("DEGRADED")]
    Degraded,
    #[display("ACQUIRING_REST")]
    AcquiringRest,
    #[display("REST_OK")]
    RestOk,
    #[display("REST_FAILED")]
    RestFailed,
    #[display("CACHE_FALLBACK")]
    CacheFallback,
    #[display("SYNTHETIC")]
    Synthetic,
}

/// Per-feed acquisition bookkeeping, reset whenever the live socket completes a full reconnect.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct FetchState {
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub current_tier: Tier,
    pub consecutive_failures: u32,
}

impl Default for FetchState {
    fn default() -> Self {
        Self {
            last_success_at: None,
            last_error_at: None,
            current_tier: Tier::Live,
            consecutive_failures: 0,
        }
    }
}

impl FetchState {
    fn record_served(&mut self, tier: Tier) {
        self.current_tier = tier;
        if matches!(tier, Tier::Live | Tier::Rest) {
            self.last_success_at = Some(Utc::now());
            self.consecutive_failures = 0;
        }
    }

    fn record_failure(&mut self) {
        self.last_error_at = Some(Utc::now());
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }
}

/// Quote yielded by [`FallbackChain::acquire`], tagged with the tier that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Acquired {
    pub quote: PriceQuote,
    pub source: DataSource,
    /// Served from a cache entry older than the cache TTL
    pub stale: bool,
    pub acquired_at: DateTime<Utc>,
}

type SharedAcquisition = Shared<BoxFuture<'static, Result<Acquired, DataError>>>;

struct InFlight {
    id: u64,
    started: Instant,
    acquisition: SharedAcquisition,
}

/// Removes an in-flight entry when its acquisition task ends, unless a newer one replaced it.
struct Registration {
    inner: Arc<ChainInner>,
    timeframe: Timeframe,
    id: u64,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let mut in_flight = self.inner.in_flight.lock();
        if in_flight
            .get(&self.timeframe)
            .is_some_and(|entry| entry.id == self.id)
        {
            in_flight.remove(&self.timeframe);
        }
    }
}

#[derive(Debug)]
struct Tracked {
    epoch: u64,
    fetch: FetchState,
    state: ChainState,
}

struct ChainInner {
    config: EngineConfig,
    live: LiveTier,
    rest: Box<dyn PriceSource>,
    cache: QuoteCache,
    tracked: Mutex<Tracked>,
    in_flight: Mutex<HashMap<Timeframe, InFlight>>,
    retrying: Mutex<HashSet<Timeframe>>,
    next_id: AtomicU64,
}

/// Acquires quotes across the ordered tiers live -> REST -> cache -> stale cache -> synthetic.
///
/// Cheap to clone; every clone drives the same state machine, cache and in-flight table.
#[derive(Clone)]
pub struct FallbackChain {
    inner: Arc<ChainInner>,
}

impl std::fmt::Debug for FallbackChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FallbackChain")
            .field("state", &self.state())
            .field("fetch", &self.fetch_state())
            .finish()
    }
}

impl FallbackChain {
    pub fn new<Rest>(config: EngineConfig, live: LiveTier, rest: Rest) -> Self
    where
        Rest: PriceSource + 'static,
    {
        let epoch = live.epoch();
        Self {
            inner: Arc::new(ChainInner {
                config,
                live,
                rest: Box::new(rest),
                cache: QuoteCache::new(),
                tracked: Mutex::new(Tracked {
                    epoch,
                    fetch: FetchState::default(),
                    state: ChainState::AcquiringLive,
                }),
                in_flight: Mutex::new(HashMap::new()),
                retrying: Mutex::new(HashSet::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &QuoteCache {
        &self.inner.cache
    }

    pub fn live(&self) -> &LiveTier {
        &self.inner.live
    }

    pub fn state(&self) -> ChainState {
        self.inner.tracked.lock().state
    }

    pub fn fetch_state(&self) -> FetchState {
        self.inner.tracked.lock().fetch.clone()
    }

    /// Acquire a quote for `timeframe`.
    ///
    /// Unless `force_fresh` is set, a request made within the coalescing window of an in-flight
    /// acquisition for the same timeframe attaches to it instead of issuing another one.
    ///
    /// Fails with [`DataError::AllSourcesExhausted`] only when the live and REST tiers failed, no
    /// cache entry of any age exists and synthetic generation is disabled.
    pub async fn acquire(
        &self,
        timeframe: Timeframe,
        force_fresh: bool,
    ) -> Result<Acquired, DataError> {
        let acquisition = {
            let mut in_flight = self.inner.in_flight.lock();

            let coalesced = in_flight
                .get(&timeframe)
                .filter(|existing| {
                    !force_fresh && existing.started.elapsed() < self.inner.config.coalesce_window
                })
                .map(|existing| {
                    debug!(%timeframe, id = existing.id, "coalescing onto in-flight acquisition");
                    existing.acquisition.clone()
                });

            match coalesced {
                Some(acquisition) => acquisition,
                None => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let acquisition = self.spawn_acquisition(timeframe, id);
                    in_flight.insert(
                        timeframe,
                        InFlight {
                            id,
                            started: Instant::now(),
                            acquisition: acquisition.clone(),
                        },
                    );
                    acquisition
                }
            }
        };

        acquisition.await
    }

    /// Run the chain on its own task so the acquisition completes even if every caller goes away.
    ///
    /// The task deregisters in-flight entry `id` when it ends, whether or not anyone awaits it.
    fn spawn_acquisition(&self, timeframe: Timeframe, id: u64) -> SharedAcquisition {
        let chain = self.clone();
        let handle = tokio::spawn(async move {
            let _registration = Registration {
                inner: Arc::clone(&chain.inner),
                timeframe,
                id,
            };
            chain.run_chain(timeframe).await
        });

        async move {
            handle.await.unwrap_or_else(|join_error| {
                error!(%timeframe, %join_error, "acquisition task failed");
                Err(DataError::AllSourcesExhausted)
            })
        }
        .boxed()
        .shared()
    }

    async fn run_chain(&self, timeframe: Timeframe) -> Result<Acquired, DataError> {
        self.sync_epoch();

        // Live
        self.transition(ChainState::AcquiringLive);
        match self.inner.live.current(timeframe) {
            Ok(quote) => {
                self.transition(ChainState::Live);
                return Ok(self.serve(quote, Tier::Live, false));
            }
            Err(error) => {
                self.tier_failed(Tier::Live, &error);
                self.transition(ChainState::Degraded);
            }
        }

        // REST, raced against the live socket reconnecting
        self.transition(ChainState::AcquiringRest);
        let live_recovery = self.inner.live.next_quote(timeframe);
        tokio::select! {
            result = self.rest_quote(timeframe) => match result {
                Ok(quote) => {
                    self.transition(ChainState::RestOk);
                    return Ok(self.serve(quote, Tier::Rest, false));
                }
                Err(error) => {
                    self.tier_failed(Tier::Rest, &error);
                    self.transition(ChainState::RestFailed);
                }
            },
            Some(quote) = live_recovery => {
                info!(%timeframe, "live tier recovered during REST acquisition");
                self.transition(ChainState::Live);
                return Ok(self.serve(quote, Tier::Live, false));
            }
        }

        // Cache
        self.transition(ChainState::CacheFallback);
        if let Some(cached) = self.inner.cache.get(timeframe) {
            if cached.is_fresh(self.inner.config.cache_ttl) {
                return Ok(self.serve(cached.quote, Tier::Cache, false));
            }

            warn!(
                %timeframe,
                age_ms = cached.age().as_millis() as u64,
                "serving stale cached quote"
            );
            self.spawn_background_retry(timeframe);
            return Ok(self.serve(cached.quote, Tier::Cache, true));
        }

        // Synthetic
        if self.inner.config.synthetic_enabled {
            self.transition(ChainState::Synthetic);
            let anchor = self
                .inner
                .cache
                .latest()
                .map(|cached| cached.quote.price)
                .unwrap_or(self.inner.config.synthetic_base_price);

            warn!(%timeframe, %anchor, "no cached quote, serving synthetic data");
            let quote = synthetic_quote(anchor, timeframe, &mut rand::rng())?;
            return Ok(self.serve(quote, Tier::Synthetic, false));
        }

        error!(%timeframe, "all market data sources exhausted");
        Err(DataError::AllSourcesExhausted)
    }

    /// Fetch and normalize from the REST tier under the tier timeout.
    async fn rest_quote(&self, timeframe: Timeframe) -> Result<PriceQuote, DataError> {
        let timeout = self.inner.config.tier_timeout;
        match tokio::time::timeout(timeout, self.inner.rest.fetch(timeframe)).await {
            Ok(Ok(payload)) => normalize(&payload, timeframe),
            Ok(Err(error)) => Err(error),
            Err(_elapsed) => Err(DataError::TierTimeout {
                tier: Tier::Rest,
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }

    /// Keep retrying REST in the background while a stale entry is served, refreshing the cache
    /// on success. At most one retry loop runs per timeframe.
    fn spawn_background_retry(&self, timeframe: Timeframe) {
        if self.inner.config.retry_attempts == 0 || !self.inner.retrying.lock().insert(timeframe) {
            return;
        }

        let chain = self.clone();
        tokio::spawn(async move {
            chain.background_retry(timeframe).await;
            chain.inner.retrying.lock().remove(&timeframe);
        });
    }

    async fn background_retry(&self, timeframe: Timeframe) {
        let mut backoff = RETRY_INITIAL_BACKOFF;

        for attempt in 1..=self.inner.config.retry_attempts {
            tokio::time::sleep(backoff).await;

            if let Ok(quote) = self.inner.live.current(timeframe) {
                debug!(%timeframe, attempt, "live tier recovered, stopping background retry");
                self.inner.cache.store(quote);
                return;
            }

            match self.rest_quote(timeframe).await {
                Ok(quote) => {
                    info!(%timeframe, attempt, "background REST retry refreshed cache");
                    self.inner.cache.store(quote);
                    self.inner.tracked.lock().fetch.record_served(Tier::Rest);
                    return;
                }
                Err(error) => {
                    warn!(%timeframe, attempt, %error, "background REST retry failed");
                    self.inner.tracked.lock().fetch.record_failure();
                    backoff = backoff.saturating_mul(2);
                }
            }
        }
    }

    fn serve(&self, quote: PriceQuote, tier: Tier, stale: bool) -> Acquired {
        if matches!(tier, Tier::Live | Tier::Rest) {
            self.inner.cache.store(quote);
        }
        self.inner.tracked.lock().fetch.record_served(tier);

        Acquired {
            quote,
            source: DataSource::from(tier),
            stale,
            acquired_at: Utc::now(),
        }
    }

    fn tier_failed(&self, tier: Tier, error: &DataError) {
        if error.advances_chain() {
            warn!(%tier, %error, "tier failed, advancing fallback chain");
        } else {
            error!(%tier, %error, "unexpected tier error, advancing fallback chain");
        }
        self.inner.tracked.lock().fetch.record_failure();
    }

    fn transition(&self, next: ChainState) {
        let mut tracked = self.inner.tracked.lock();
        if tracked.state != next {
            debug!(from = %tracked.state, to = %next, "fallback chain transition");
            tracked.state = next;
        }
    }

    /// Reset [`FetchState`] if the live socket completed a full reconnect since the last
    /// acquisition.
    fn sync_epoch(&self) {
        let epoch = self.inner.live.epoch();
        let mut tracked = self.inner.tracked.lock();
        if tracked.epoch != epoch {
            info!(epoch, "live socket reconnected, resetting fetch state");
            tracked.epoch = epoch;
            tracked.fetch = FetchState::default();
        }
    }
}

#[async_trait]
impl Acquire for FallbackChain {
    async fn acquire(
        &self,
        timeframe: Timeframe,
        force_fresh: bool,
    ) -> Result<Acquired, DataError> {
        FallbackChain::acquire(self, timeframe, force_fresh).await
    }
}
