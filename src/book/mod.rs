// Order book reconstruction: snapshot + gap-free diffs -> full book
pub mod feed;   // venue-specific snapshot/diff classifiers
pub mod merger; // per-instrument reconstruction state

pub use feed::{BinanceDepthFeed, BookFeed, LevelsFeed};
pub use merger::{BookMergers, ChainRule, MergeOutcome, MergerConfig, OrderBookMerger};

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceLevel {
    pub price: f64,
    pub size: f64,
}

impl PriceLevel {
    pub fn new(price: f64, size: f64) -> Self {
        Self { price, size }
    }
}

/// Full state of one instrument at `sequence`.
#[derive(Debug, Clone, PartialEq)]
pub struct BookSnapshot {
    pub instrument: String,
    pub sequence: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

/// Incremental update covering markers `first_seq..=seq`.
///
/// `prev_seq` is the marker the diff claims to follow. Feeds that only carry
/// a range (`U`/`u`) set `prev_seq = first_seq - 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct BookDiff {
    pub instrument: String,
    pub prev_seq: u64,
    pub first_seq: u64,
    pub seq: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl BookDiff {
    /// Ends past the marker it follows and covers a non-empty range.
    pub fn is_forward(&self) -> bool {
        self.seq > self.prev_seq && self.seq >= self.first_seq
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum BookMessage {
    Snapshot(BookSnapshot),
    Diff(BookDiff),
}

impl BookMessage {
    pub fn instrument(&self) -> &str {
        match self {
            BookMessage::Snapshot(s) => &s.instrument,
            BookMessage::Diff(d) => &d.instrument,
        }
    }
}

/// Read-only copy of a synced book. Bids descending, asks ascending.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FullBook {
    pub instrument: String,
    pub sequence: u64,
    pub bids: Vec<PriceLevel>,
    pub asks: Vec<PriceLevel>,
}

impl FullBook {
    pub fn best_bid(&self) -> Option<PriceLevel> {
        self.bids.first().copied()
    }

    pub fn best_ask(&self) -> Option<PriceLevel> {
        self.asks.first().copied()
    }

    pub fn spread(&self) -> Option<f64> {
        Some(self.best_ask()?.price - self.best_bid()?.price)
    }
}
