#![forbid(unsafe_code)]
#![warn(
    unused,
    clippy::cast_lossless,
    clippy::cast_possible_wrap,
    rust_2018_idioms,
    missing_debug_implementations
)]
#![allow(clippy::type_complexity)]

//! # Pulse-Data
//! Market-data reconciliation engine for a BTC price dashboard.
//!
//! * **Normalised**: heterogeneous provider payloads become one canonical [`PriceQuote`] per
//!   [`Timeframe`], with consistent dollar and percent change semantics.
//! * **Gapless**: a [`FallbackChain`] walks live socket -> REST -> cache -> stale cache ->
//!   synthetic, so consumers always get *something*, tagged with its [`DataSource`].
//! * **Diffed**: the [`OrderBookManager`] re-derives every snapshot from scratch and reports only
//!   the price levels that changed.
//!
//! ## Overview
//! The [`UpdateScheduler`] drives the [`FallbackChain`] at a fixed cadence and publishes whole
//! [`PriceView`]s through a `tokio::sync::watch` channel. Order book messages from every tier
//! flow through a single channel into the [`BookFeed`], which publishes whole [`BookView`]s.
//!
//! Readers never observe partially updated state: every published value is replaced whole.

/// Engine configuration with documented defaults and `PULSE_*` environment overrides.
pub mod config;

/// All errors generated in `pulse-data`.
pub mod error;

/// Canonical [`PriceQuote`] model, normalisation and dollar/percent reconciliation.
pub mod quote;

/// Order book snapshots, diffing and the ordered [`BookFeed`].
pub mod books;

/// [`FallbackChain`] acquisition state machine and its tiers.
pub mod chain;

/// Fixed-cadence [`UpdateScheduler`] with request sequencing.
pub mod scheduler;

/// Last-resort synthetic quotes and books.
pub mod synthetic;

/// Provenance tags shared by quotes and books.
pub mod source;

/// Live socket and REST adapters for real providers.
pub mod feed;

/// Stream utilities.
pub mod streams;

pub use books::{BookEvent, BookFeed, BookView, OrderBookLevel, OrderBookManager, OrderBookSnapshot};
pub use chain::{Acquired, ChainState, FallbackChain, FetchState, LiveTier, PriceSource};
pub use config::{EngineConfig, ViewportClass};
pub use error::DataError;
pub use quote::{Direction, PriceQuote, RawPricePayload, Timeframe};
pub use scheduler::{Acquire, PriceView, SchedulerHandle, UpdateScheduler, ViewState};
pub use source::{DataSource, Tier};
