//! Engine configuration surface.
//!
//! Every interval consumed by the engine lives here with a documented default. Values can be
//! overridden from `PULSE_*` environment variables via [`EngineConfig::from_env`].

use crate::error::DataError;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::{str::FromStr, time::Duration};

/// Default fixed refresh cadence of the [`UpdateScheduler`](crate::scheduler::UpdateScheduler).
pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_millis(30_000);

/// Default per-tier network timeout. Must stay shorter than the refresh interval.
pub const DEFAULT_TIER_TIMEOUT: Duration = Duration::from_millis(8_000);

/// Default freshness TTL of cached quotes.
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_millis(60_000);

/// Default window within which a non-forced request attaches to an in-flight acquisition.
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_millis(2_000);

/// Default fixed backoff between live socket reconnection attempts.
pub const DEFAULT_LIVE_RECONNECT_DELAY: Duration = Duration::from_millis(5_000);

/// Default maximum age of the latest live payload before the live tier is considered silent.
pub const DEFAULT_LIVE_MAX_AGE: Duration = Duration::from_millis(60_000);

/// Default idle read timeout of live sockets (2 minutes).
pub const DEFAULT_LIVE_READ_TIMEOUT: Duration = Duration::from_secs(120);

/// Viewport class of the consuming view, which decides how many book levels are displayed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewportClass {
    Compact,
    #[default]
    Regular,
    Wide,
}

impl ViewportClass {
    /// Number of order book levels displayed (and diffed) per side.
    pub fn display_depth(&self) -> usize {
        match self {
            ViewportClass::Compact => 6,
            ViewportClass::Regular => 12,
            ViewportClass::Wide => 20,
        }
    }
}

/// Reconciliation engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Fixed cadence of scheduled refreshes
    pub refresh_interval: Duration,
    /// Timeout applied to each network tier of the fallback chain
    pub tier_timeout: Duration,
    /// Age below which a cached quote is served as fresh
    pub cache_ttl: Duration,
    /// Window within which duplicate non-forced requests coalesce
    pub coalesce_window: Duration,
    /// Order book levels per side that are diffed for highlighting
    pub display_depth: usize,
    /// Fixed backoff between live socket reconnects
    pub live_reconnect_delay: Duration,
    /// Maximum age of a live payload that may still be served as live
    pub live_max_age: Duration,
    /// Idle period after which a silent live socket is torn down
    pub live_read_timeout: Duration,
    /// Background REST retries attempted while a stale cache entry is being served
    pub retry_attempts: u32,
    /// Whether the synthetic last-resort tier may be used
    pub synthetic_enabled: bool,
    /// Price synthetic data is generated around when nothing was ever observed
    pub synthetic_base_price: Decimal,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            tier_timeout: DEFAULT_TIER_TIMEOUT,
            cache_ttl: DEFAULT_CACHE_TTL,
            coalesce_window: DEFAULT_COALESCE_WINDOW,
            display_depth: ViewportClass::default().display_depth(),
            live_reconnect_delay: DEFAULT_LIVE_RECONNECT_DELAY,
            live_max_age: DEFAULT_LIVE_MAX_AGE,
            live_read_timeout: DEFAULT_LIVE_READ_TIMEOUT,
            retry_attempts: 3,
            synthetic_enabled: true,
            synthetic_base_price: Decimal::from(65_000),
        }
    }
}

impl EngineConfig {
    /// Construct an [`EngineConfig`] from `PULSE_*` environment variables, falling back to
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Construct an [`EngineConfig`] using the provided variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |key: &str, default: Duration| {
            lookup(key)
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_millis)
                .unwrap_or(default)
        };
        let parsed = |key: &str| lookup(key).and_then(|value| value.trim().parse::<u64>().ok());

        let display_depth = lookup("PULSE_VIEWPORT")
            .and_then(|value| match value.trim().to_ascii_lowercase().as_str() {
                "compact" => Some(ViewportClass::Compact),
                "regular" => Some(ViewportClass::Regular),
                "wide" => Some(ViewportClass::Wide),
                _ => None,
            })
            .map(|viewport| viewport.display_depth())
            .or_else(|| parsed("PULSE_DISPLAY_DEPTH").map(|depth| depth as usize))
            .unwrap_or(defaults.display_depth);

        Self {
            refresh_interval: millis("PULSE_REFRESH_INTERVAL_MS", defaults.refresh_interval),
            tier_timeout: millis("PULSE_TIER_TIMEOUT_MS", defaults.tier_timeout),
            cache_ttl: millis("PULSE_CACHE_TTL_MS", defaults.cache_ttl),
            coalesce_window: millis("PULSE_COALESCE_WINDOW_MS", defaults.coalesce_window),
            display_depth,
            live_reconnect_delay: millis(
                "PULSE_LIVE_RECONNECT_DELAY_MS",
                defaults.live_reconnect_delay,
            ),
            live_max_age: millis("PULSE_LIVE_MAX_AGE_MS", defaults.live_max_age),
            live_read_timeout: millis("PULSE_LIVE_READ_TIMEOUT_MS", defaults.live_read_timeout),
            retry_attempts: parsed("PULSE_RETRY_ATTEMPTS")
                .map(|attempts| attempts as u32)
                .unwrap_or(defaults.retry_attempts),
            synthetic_enabled: lookup("PULSE_SYNTHETIC_ENABLED")
                .and_then(|value| value.trim().parse::<bool>().ok())
                .unwrap_or(defaults.synthetic_enabled),
            synthetic_base_price: lookup("PULSE_SYNTHETIC_BASE_PRICE")
                .and_then(|value| Decimal::from_str(value.trim()).ok())
                .filter(|price| price.is_sign_positive() && !price.is_zero())
                .unwrap_or(defaults.synthetic_base_price),
        }
    }

    /// Check the configuration upholds the engine timing rules.
    pub fn validate(&self) -> Result<(), DataError> {
        let durations = [
            ("refresh_interval", self.refresh_interval),
            ("tier_timeout", self.tier_timeout),
            ("cache_ttl", self.cache_ttl),
            ("live_reconnect_delay", self.live_reconnect_delay),
            ("live_read_timeout", self.live_read_timeout),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, duration)| duration.is_zero()) {
            return Err(DataError::InvalidConfig(format!("{name} must be non-zero")));
        }

        // A tier decision has to be reached before the next scheduled tick fires
        if self.tier_timeout >= self.refresh_interval {
            return Err(DataError::InvalidConfig(format!(
                "tier_timeout {:?} must be shorter than refresh_interval {:?}",
                self.tier_timeout, self.refresh_interval
            )));
        }

        if self.display_depth == 0 {
            return Err(DataError::InvalidConfig(
                "display_depth must be at least one level".to_string(),
            ));
        }

        Ok(())
    }

    /// Set refresh interval
    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    /// Set per-tier timeout
    pub fn with_tier_timeout(mut self, timeout: Duration) -> Self {
        self.tier_timeout = timeout;
        self
    }

    /// Set cache TTL
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }

    /// Set coalescing window
    pub fn with_coalesce_window(mut self, window: Duration) -> Self {
        self.coalesce_window = window;
        self
    }

    /// Set display depth from a viewport class
    pub fn with_viewport(mut self, viewport: ViewportClass) -> Self {
        self.display_depth = viewport.display_depth();
        self
    }

    /// Set live reconnect delay
    pub fn with_live_reconnect_delay(mut self, delay: Duration) -> Self {
        self.live_reconnect_delay = delay;
        self
    }

    /// Set maximum live payload age
    pub fn with_live_max_age(mut self, max_age: Duration) -> Self {
        self.live_max_age = max_age;
        self
    }

    /// Set background retry attempts
    pub fn with_retry_attempts(mut self, attempts: u32) -> Self {
        self.retry_attempts = attempts;
        self
    }

    /// Enable or disable the synthetic tier
    pub fn with_synthetic(mut self, enabled: bool) -> Self {
        self.synthetic_enabled = enabled;
        self
    }
}
