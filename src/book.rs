//! Incremental order book rebuilt from a snapshot plus sequenced diffs.
//!
//! The book keeps both sides price-sorted (bids descending, asks
//! ascending) with unique prices, and gates every diff on a strictly
//! increasing sequence id so duplicated or re-ordered messages cannot
//! corrupt the view. It performs no I/O and never blocks.

use std::cmp::Ordering;

use crate::errors::EmptyBookError;
use crate::types::{PriceLevel, Side};

/// Whether a diff changed the book or was dropped as stale.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiffOutcome {
    Applied,
    /// Sequence id not strictly greater than the stored one. Not an
    /// error; the message is simply discarded.
    Stale,
}

#[derive(Clone, Debug, Default)]
pub struct OrderBook {
    bids: Vec<PriceLevel>,
    asks: Vec<PriceLevel>,
    last_update_id: u64,
}

impl OrderBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the whole book with a snapshot.
    pub fn apply_snapshot(&mut self, bids: Vec<PriceLevel>, asks: Vec<PriceLevel>, seq: u64) {
        self.bids = bids;
        self.asks = asks;
        self.bids.retain(|level| level.size != 0.0);
        self.asks.retain(|level| level.size != 0.0);
        sort_side(&mut self.bids, Side::Bid);
        sort_side(&mut self.asks, Side::Ask);
        self.last_update_id = seq;
    }

    /// Merges an incremental update. Diffs whose sequence id is not
    /// strictly greater than the current one are dropped.
    pub fn apply_diff(
        &mut self,
        seq: u64,
        bid_updates: &[PriceLevel],
        ask_updates: &[PriceLevel],
    ) -> DiffOutcome {
        if seq <= self.last_update_id {
            return DiffOutcome::Stale;
        }
        self.last_update_id = seq;
        update_side(&mut self.bids, bid_updates, Side::Bid);
        update_side(&mut self.asks, ask_updates, Side::Ask);
        DiffOutcome::Applied
    }

    pub fn best_bid(&self) -> Result<PriceLevel, EmptyBookError> {
        self.bids
            .first()
            .copied()
            .ok_or(EmptyBookError { side: Side::Bid })
    }

    pub fn best_ask(&self) -> Result<PriceLevel, EmptyBookError> {
        self.asks
            .first()
            .copied()
            .ok_or(EmptyBookError { side: Side::Ask })
    }

    pub fn mid_price(&self) -> Result<f64, EmptyBookError> {
        let bid = self.best_bid()?;
        let ask = self.best_ask()?;
        Ok((bid.price + ask.price) / 2.0)
    }

    pub fn last_update_id(&self) -> u64 {
        self.last_update_id
    }

    pub fn bids(&self) -> &[PriceLevel] {
        &self.bids
    }

    pub fn asks(&self) -> &[PriceLevel] {
        &self.asks
    }
}

/// Remove-then-insert per updated price, then re-sort. A zero size removes
/// the level without replacement.
fn update_side(levels: &mut Vec<PriceLevel>, updates: &[PriceLevel], side: Side) {
    for update in updates {
        if let Some(pos) = levels.iter().position(|level| level.price == update.price) {
            levels.remove(pos);
        }
        if update.size != 0.0 {
            levels.push(*update);
        }
    }
    sort_side(levels, side);
}

fn sort_side(levels: &mut [PriceLevel], side: Side) {
    levels.sort_by(|a, b| {
        let ordering = a.price.partial_cmp(&b.price).unwrap_or(Ordering::Equal);
        match side {
            Side::Bid => ordering.reverse(),
            Side::Ask => ordering,
        }
    });
}
