use std::collections::{BTreeMap, VecDeque};

use ahash::AHashMap;
use ordered_float::OrderedFloat;
use tracing::{debug, trace, warn};

use super::{BookDiff, BookMessage, BookSnapshot, FullBook, PriceLevel};

/// How a diff must relate to the current sequence marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainRule {
    /// `prev_seq` must equal the current marker, always.
    Strict,
    /// The first diff after a snapshot only has to cover `sequence + 1`
    /// (`first_seq <= sequence + 1 <= seq`); diffs ending at or before the
    /// snapshot are stale and dropped. Strict afterwards.
    Bridged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MergerConfig {
    pub chain: ChainRule,
    /// Diffs kept while unsynced and replayed after the next snapshot.
    /// 0 discards them.
    pub backlog: usize,
}

impl Default for MergerConfig {
    fn default() -> Self {
        Self { chain: ChainRule::Strict, backlog: 0 }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    Ready(FullBook),
    NotReady,
}

enum Step {
    Applied,
    Stale,
    Gap,
}

/// Reconstructs one instrument's book from ordered snapshot/diff messages.
///
/// A full book is only produced right after a snapshot or after a diff that
/// chains onto the current marker without a gap. Published books are strictly
/// increasing in sequence: a book at or below the last published marker stays
/// `NotReady`, even across resyncs.
#[derive(Debug)]
pub struct OrderBookMerger {
    instrument: String,
    config: MergerConfig,
    bids: BTreeMap<OrderedFloat<f64>, f64>,
    asks: BTreeMap<OrderedFloat<f64>, f64>,
    sequence: u64,
    published: Option<u64>,
    synced: bool,
    bridging: bool,
    backlog: VecDeque<BookDiff>,
    resyncs: u64,
}

impl OrderBookMerger {
    pub fn new(instrument: &str, config: MergerConfig) -> Self {
        Self {
            instrument: instrument.to_string(),
            config,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            sequence: 0,
            published: None,
            synced: false,
            bridging: false,
            backlog: VecDeque::new(),
            resyncs: 0,
        }
    }

    pub fn instrument(&self) -> &str {
        &self.instrument
    }

    pub fn is_synced(&self) -> bool {
        self.synced
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Highest sequence handed out as a full book.
    pub fn published(&self) -> Option<u64> {
        self.published
    }

    /// Number of times a gap forced this book back to unsynced.
    pub fn resyncs(&self) -> u64 {
        self.resyncs
    }

    pub fn needs_snapshot(&self) -> bool {
        !self.synced
    }

    pub fn apply(&mut self, msg: BookMessage) -> MergeOutcome {
        match msg {
            BookMessage::Snapshot(snapshot) => self.apply_snapshot(snapshot),
            BookMessage::Diff(diff) => self.apply_diff(diff),
        }
    }

    /// Drop all state and wait for a fresh snapshot. The published marker
    /// survives.
    pub fn resync(&mut self) {
        self.bids.clear();
        self.asks.clear();
        self.backlog.clear();
        self.synced = false;
        self.bridging = false;
    }

    fn apply_snapshot(&mut self, snapshot: BookSnapshot) -> MergeOutcome {
        self.bids.clear();
        self.asks.clear();
        for level in snapshot.bids.iter().filter(|l| l.size != 0.0) {
            self.bids.insert(OrderedFloat(level.price), level.size);
        }
        for level in snapshot.asks.iter().filter(|l| l.size != 0.0) {
            self.asks.insert(OrderedFloat(level.price), level.size);
        }
        self.sequence = snapshot.sequence;
        self.synced = true;
        self.bridging = self.config.chain == ChainRule::Bridged;
        debug!(
            instrument = %self.instrument,
            sequence = self.sequence,
            bids = self.bids.len(),
            asks = self.asks.len(),
            "installed book snapshot"
        );

        let backlog = std::mem::take(&mut self.backlog);
        let replayed = backlog.len();
        for diff in backlog {
            if let Step::Gap = self.step(&diff) {
                self.desync(&diff);
                return MergeOutcome::NotReady;
            }
        }
        if replayed > 0 {
            debug!(instrument = %self.instrument, replayed, sequence = self.sequence, "replayed buffered diffs");
        }
        self.publish()
    }

    fn apply_diff(&mut self, diff: BookDiff) -> MergeOutcome {
        if !self.synced {
            if self.config.backlog > 0 {
                self.backlog.push_back(diff);
                if self.backlog.len() > self.config.backlog {
                    self.backlog.pop_front();
                }
            }
            trace!(instrument = %self.instrument, "diff before snapshot, not ready");
            return MergeOutcome::NotReady;
        }

        match self.step(&diff) {
            Step::Applied => self.publish(),
            Step::Stale => {
                trace!(instrument = %self.instrument, seq = diff.seq, "stale diff dropped");
                MergeOutcome::NotReady
            }
            Step::Gap => {
                self.desync(&diff);
                MergeOutcome::NotReady
            }
        }
    }

    fn step(&mut self, diff: &BookDiff) -> Step {
        // a diff must move the marker forward
        if !diff.is_forward() {
            return Step::Gap;
        }
        if self.bridging {
            if diff.seq <= self.sequence {
                return Step::Stale;
            }
            match self.sequence.checked_add(1) {
                Some(next) if diff.first_seq <= next => {}
                _ => return Step::Gap,
            }
            self.bridging = false;
        } else if diff.prev_seq != self.sequence {
            return Step::Gap;
        }

        fold(&mut self.bids, &diff.bids);
        fold(&mut self.asks, &diff.asks);
        self.sequence = diff.seq;
        Step::Applied
    }

    fn desync(&mut self, diff: &BookDiff) {
        warn!(
            instrument = %self.instrument,
            expected = self.sequence,
            prev_seq = diff.prev_seq,
            first_seq = diff.first_seq,
            seq = diff.seq,
            "sequence gap, resyncing book"
        );
        self.resync();
        self.resyncs += 1;
        metrics::counter!("uxws_book_resyncs_total").increment(1);
    }

    fn publish(&mut self) -> MergeOutcome {
        if let Some(last) = self.published.filter(|last| self.sequence <= *last) {
            debug!(
                instrument = %self.instrument,
                sequence = self.sequence,
                published = last,
                "book not newer than last published, holding"
            );
            return MergeOutcome::NotReady;
        }
        self.published = Some(self.sequence);
        MergeOutcome::Ready(self.view())
    }

    fn view(&self) -> FullBook {
        FullBook {
            instrument: self.instrument.clone(),
            sequence: self.sequence,
            bids: self
                .bids
                .iter()
                .rev()
                .map(|(p, s)| PriceLevel::new(p.0, *s))
                .collect(),
            asks: self
                .asks
                .iter()
                .map(|(p, s)| PriceLevel::new(p.0, *s))
                .collect(),
        }
    }
}

// size 0 removes the level, anything else inserts or overwrites
fn fold(side: &mut BTreeMap<OrderedFloat<f64>, f64>, levels: &[PriceLevel]) {
    for level in levels {
        if level.size == 0.0 {
            side.remove(&OrderedFloat(level.price));
        } else {
            side.insert(OrderedFloat(level.price), level.size);
        }
    }
}

/// Per-instrument mergers owned by one session.
#[derive(Debug)]
pub struct BookMergers {
    config: MergerConfig,
    books: AHashMap<String, OrderBookMerger>,
}

impl BookMergers {
    pub fn new(config: MergerConfig) -> Self {
        Self { config, books: AHashMap::new() }
    }

    pub fn apply(&mut self, msg: BookMessage) -> MergeOutcome {
        let config = self.config;
        self.books
            .entry(msg.instrument().to_string())
            .or_insert_with_key(|instrument| OrderBookMerger::new(instrument, config))
            .apply(msg)
    }

    pub fn get(&self, instrument: &str) -> Option<&OrderBookMerger> {
        self.books.get(instrument)
    }

    pub fn needs_snapshot(&self, instrument: &str) -> bool {
        self.books.get(instrument).map_or(true, |b| b.needs_snapshot())
    }

    /// Drops every book, e.g. after the transport was replaced.
    pub fn clear(&mut self) {
        self.books.clear();
    }

    /// Forgets book contents but keeps each instrument's published marker,
    /// so a new connection never publishes an older book.
    pub fn resync_all(&mut self) {
        for book in self.books.values_mut() {
            book.resync();
        }
    }

    pub fn len(&self) -> usize {
        self.books.len()
    }

    pub fn is_empty(&self) -> bool {
        self.books.is_empty()
    }
}


#[cfg(test)]
mod prop_tests {
    use super::*;
    use proptest::prelude::*;

    // sizes include 0 so diffs exercise level removal
    fn arb_levels(lo: u32, hi: u32) -> impl Strategy<Value = Vec<(u32, u32)>> {
        proptest::collection::vec((lo..hi, 0u32..5), 0..8)
    }

    fn levels(raw: &[(u32, u32)]) -> Vec<PriceLevel> {
        raw.iter().map(|&(p, s)| PriceLevel::new(p as f64, s as f64)).collect()
    }

    // snapshots skip zero sizes rather than removing
    fn model_install(side: &mut BTreeMap<u32, u32>, raw: &[(u32, u32)]) {
        for &(p, s) in raw.iter().filter(|(_, s)| *s != 0) {
            side.insert(p, s);
        }
    }

    fn model_fold(side: &mut BTreeMap<u32, u32>, raw: &[(u32, u32)]) {
        for &(p, s) in raw {
            if s == 0 {
                side.remove(&p);
            } else {
                side.insert(p, s);
            }
        }
    }

    proptest! {
        #[test]
        fn contiguous_diffs_match_a_plain_fold(
            snap_bids in arb_levels(1, 100),
            snap_asks in arb_levels(101, 200),
            diffs in proptest::collection::vec((arb_levels(1, 100), arb_levels(101, 200)), 1..20),
            start in 1u64..1_000_000,
        ) {
            let mut merger = OrderBookMerger::new("X", MergerConfig::default());
            let mut bids = BTreeMap::new();
            let mut asks = BTreeMap::new();
            model_install(&mut bids, &snap_bids);
            model_install(&mut asks, &snap_asks);

            let outcome = merger.apply(BookMessage::Snapshot(BookSnapshot {
                instrument: "X".into(),
                sequence: start,
                bids: levels(&snap_bids),
                asks: levels(&snap_asks),
            }));
            prop_assert!(matches!(outcome, MergeOutcome::Ready(_)));

            let mut last = None;
            for (i, (b, a)) in diffs.iter().enumerate() {
                let prev = start + i as u64;
                model_fold(&mut bids, b);
                model_fold(&mut asks, a);
                let outcome = merger.apply(BookMessage::Diff(BookDiff {
                    instrument: "X".into(),
                    prev_seq: prev,
                    first_seq: prev + 1,
                    seq: prev + 1,
                    bids: levels(b),
                    asks: levels(a),
                }));
                match outcome {
                    MergeOutcome::Ready(book) => last = Some(book),
                    MergeOutcome::NotReady => prop_assert!(false, "contiguous diff rejected"),
                }
            }

            let book = last.unwrap();
            prop_assert_eq!(book.sequence, start + diffs.len() as u64);
            let expect_bids: Vec<PriceLevel> = bids
                .iter()
                .rev()
                .map(|(&p, &s)| PriceLevel::new(p as f64, s as f64))
                .collect();
            let expect_asks: Vec<PriceLevel> = asks
                .iter()
                .map(|(&p, &s)| PriceLevel::new(p as f64, s as f64))
                .collect();
            prop_assert_eq!(book.bids, expect_bids);
            prop_assert_eq!(book.asks, expect_asks);
        }
    }

    proptest! {
        #[test]
        fn any_gap_is_never_ready(start in 1u64..1000, skip in 1u64..50) {
            let mut merger = OrderBookMerger::new("X", MergerConfig::default());
            merger.apply(BookMessage::Snapshot(BookSnapshot {
                instrument: "X".into(),
                sequence: start,
                bids: vec![PriceLevel::new(1.0, 1.0)],
                asks: vec![],
            }));
            let prev = start + skip;
            let outcome = merger.apply(BookMessage::Diff(BookDiff {
                instrument: "X".into(),
                prev_seq: prev,
                first_seq: prev + 1,
                seq: prev + 1,
                bids: vec![],
                asks: vec![],
            }));
            prop_assert_eq!(outcome, MergeOutcome::NotReady);
            prop_assert!(merger.needs_snapshot());
            prop_assert_eq!(merger.resyncs(), 1);
        }
    }

    proptest! {
        #[test]
        fn published_sequences_strictly_increase(
            msgs in proptest::collection::vec((any::<bool>(), 0u64..40, 0u64..40), 1..60),
            bridged in any::<bool>(),
        ) {
            let chain = if bridged { ChainRule::Bridged } else { ChainRule::Strict };
            let mut merger = OrderBookMerger::new("X", MergerConfig { chain, backlog: 4 });
            let mut last: Option<u64> = None;
            for (is_snapshot, a, b) in msgs {
                let msg = if is_snapshot {
                    BookMessage::Snapshot(BookSnapshot {
                        instrument: "X".into(),
                        sequence: a,
                        bids: vec![],
                        asks: vec![],
                    })
                } else {
                    BookMessage::Diff(BookDiff {
                        instrument: "X".into(),
                        prev_seq: a,
                        first_seq: a + 1,
                        seq: b,
                        bids: vec![],
                        asks: vec![],
                    })
                };
                if let MergeOutcome::Ready(book) = merger.apply(msg) {
                    prop_assert!(last.map_or(true, |l| book.sequence > l));
                    last = Some(book.sequence);
                }
            }
            prop_assert_eq!(merger.published(), last);
        }
    }
}
