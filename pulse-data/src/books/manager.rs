use super::{
    BookSide, ChangedLevels, OrderBookLevel, OrderBookSnapshot, RawBook, RawLevel, validate_levels,
};
use crate::{error::DataError, source::DataSource};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use rust_decimal::Decimal;
use std::{collections::BTreeMap, sync::Arc};
use tracing::debug;

/// Result of applying a book message: the new snapshot and the levels to highlight.
#[derive(Debug, Clone, PartialEq)]
pub struct BookUpdate {
    pub snapshot: Arc<OrderBookSnapshot>,
    pub changed: ChangedLevels,
}

/// Maintains the working price -> amount maps and the latest derived [`OrderBookSnapshot`].
///
/// Every application re-derives ordering, cumulative sums and spread from the working maps, so a
/// missed intermediate update can never leave drifting cumulative values behind.
#[derive(Debug, Clone)]
pub struct OrderBookManager {
    asks: BTreeMap<Decimal, Decimal>,
    bids: BTreeMap<Decimal, Decimal>,
    current: Option<Arc<OrderBookSnapshot>>,
    display_depth: usize,
}

impl OrderBookManager {
    pub fn new(display_depth: usize) -> Self {
        Self {
            asks: BTreeMap::new(),
            bids: BTreeMap::new(),
            current: None,
            display_depth,
        }
    }

    pub fn current(&self) -> Option<&Arc<OrderBookSnapshot>> {
        self.current.as_ref()
    }

    pub fn display_depth(&self) -> usize {
        self.display_depth
    }

    /// Change the display depth (e.g. when the viewport class changes).
    pub fn set_display_depth(&mut self, display_depth: usize) {
        self.display_depth = display_depth;
    }

    /// Replace the book wholesale with a full snapshot.
    ///
    /// A snapshot carrying an unrepresentable level is rejected with [`DataError::InvalidBook`]
    /// and the current book is kept.
    pub fn apply_snapshot(
        &mut self,
        book: RawBook,
        source: DataSource,
        observed_at: DateTime<Utc>,
    ) -> Result<BookUpdate, DataError> {
        validate_levels(&book)?;
        self.asks = collect_side(book.asks);
        self.bids = collect_side(book.bids);
        Ok(self.publish(source, observed_at))
    }

    /// Patch the working maps with an incremental update keyed by price (zero amount removes the
    /// level) and re-derive the snapshot.
    ///
    /// Returns `Ok(None)` if no full snapshot has been applied yet. Invalid updates are rejected
    /// before touching the working maps.
    pub fn apply_update(
        &mut self,
        update: RawBook,
        source: DataSource,
        observed_at: DateTime<Utc>,
    ) -> Result<Option<BookUpdate>, DataError> {
        if self.current.is_none() {
            debug!("order book update received before snapshot, ignoring");
            return Ok(None);
        }

        validate_levels(&update)?;
        patch_side(&mut self.asks, update.asks);
        patch_side(&mut self.bids, update.bids);
        Ok(Some(self.publish(source, observed_at)))
    }

    /// Re-publish the current snapshot under a different source tag, without changing levels.
    pub fn retag(&mut self, source: DataSource) -> Option<Arc<OrderBookSnapshot>> {
        let current = self.current.as_ref()?;
        let snapshot = Arc::new(OrderBookSnapshot {
            source,
            ..(**current).clone()
        });
        self.current = Some(Arc::clone(&snapshot));
        Some(snapshot)
    }

    fn publish(&mut self, source: DataSource, observed_at: DateTime<Utc>) -> BookUpdate {
        let next = Arc::new(OrderBookSnapshot::from_maps(
            &self.asks,
            &self.bids,
            source,
            observed_at,
        ));

        let changed = match &self.current {
            Some(previous) => diff(previous, &next, self.display_depth),
            None => diff(&empty_like(&next), &next, self.display_depth),
        };

        self.current = Some(Arc::clone(&next));
        BookUpdate {
            snapshot: next,
            changed,
        }
    }
}

/// Compare two snapshots by price key within the top `display_depth` levels of either snapshot.
///
/// A level is changed if it is new, removed, or its `amount` differs. Levels beyond the display
/// depth of both snapshots are not diffed.
pub fn diff(
    previous: &OrderBookSnapshot,
    next: &OrderBookSnapshot,
    display_depth: usize,
) -> ChangedLevels {
    ChangedLevels {
        asks: diff_side(
            previous.side(BookSide::Asks),
            next.side(BookSide::Asks),
            display_depth,
        ),
        bids: diff_side(
            previous.side(BookSide::Bids),
            next.side(BookSide::Bids),
            display_depth,
        ),
    }
}

fn diff_side(
    previous: &[OrderBookLevel],
    next: &[OrderBookLevel],
    display_depth: usize,
) -> std::collections::BTreeSet<Decimal> {
    let previous_amounts = amounts(previous);
    let next_amounts = amounts(next);

    previous
        .iter()
        .take(display_depth)
        .chain(next.iter().take(display_depth))
        .map(|level| level.price)
        .unique()
        .filter(|price| previous_amounts.get(price) != next_amounts.get(price))
        .collect()
}

fn amounts(levels: &[OrderBookLevel]) -> BTreeMap<Decimal, Decimal> {
    levels
        .iter()
        .map(|level| (level.price, level.amount))
        .collect()
}

fn empty_like(snapshot: &OrderBookSnapshot) -> OrderBookSnapshot {
    OrderBookSnapshot {
        asks: Vec::new(),
        bids: Vec::new(),
        spread: Decimal::ZERO,
        source: snapshot.source,
        observed_at: snapshot.observed_at,
    }
}

fn collect_side(levels: Vec<RawLevel>) -> BTreeMap<Decimal, Decimal> {
    let mut side = BTreeMap::new();
    patch_side(&mut side, levels);
    side
}

fn patch_side(side: &mut BTreeMap<Decimal, Decimal>, levels: Vec<RawLevel>) {
    for level in levels {
        if level.amount <= Decimal::ZERO {
            side.remove(&level.price);
        } else {
            side.insert(level.price, level.amount);
        }
    }
}
