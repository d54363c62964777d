//! Order book merger and feed parsing benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use uxws_rs::book::{
    BinanceDepthFeed, BookDiff, BookFeed, BookMessage, BookSnapshot, MergerConfig,
    OrderBookMerger, PriceLevel,
};

/// Merger synced on a snapshot with `n` levels per side.
fn populated(n: usize) -> OrderBookMerger {
    let bids = (0..n).map(|i| PriceLevel::new(50_000.0 - i as f64, 1.0 + i as f64)).collect();
    let asks = (0..n).map(|i| PriceLevel::new(50_001.0 + i as f64, 1.0 + i as f64)).collect();
    let mut merger = OrderBookMerger::new("BTCUSDT", MergerConfig::default());
    merger.apply(BookMessage::Snapshot(BookSnapshot {
        instrument: "BTCUSDT".into(),
        sequence: 0,
        bids,
        asks,
    }));
    merger
}

fn bench_apply_diff(c: &mut Criterion) {
    let mut merger = populated(1000);
    let mut seq = 0u64;
    let bids: Vec<PriceLevel> = (0..5).map(|i| PriceLevel::new(49_995.0 + i as f64, 2.0)).collect();
    let asks: Vec<PriceLevel> = (0..5).map(|i| PriceLevel::new(50_002.0 + i as f64, 2.0)).collect();

    c.bench_function("apply_diff_5x5", |b| {
        b.iter(|| {
            let diff = BookDiff {
                instrument: "BTCUSDT".into(),
                prev_seq: seq,
                first_seq: seq + 1,
                seq: seq + 1,
                bids: bids.clone(),
                asks: asks.clone(),
            };
            seq += 1;
            black_box(merger.apply(BookMessage::Diff(diff)));
        })
    });
}

fn bench_snapshot(c: &mut Criterion) {
    c.bench_function("install_snapshot_1000", |b| {
        b.iter(|| black_box(populated(1000)))
    });
}

fn bench_parse_depth_update(c: &mut Criterion) {
    let feed = BinanceDepthFeed::default();
    let msg = json!({
        "stream": "btcusdt@depth@100ms",
        "data": {
            "e": "depthUpdate", "E": 1, "s": "BTCUSDT", "U": 157, "u": 160,
            "b": [["50000.10", "1.5"], ["49999.90", "0"], ["49999.80", "2.25"]],
            "a": [["50000.20", "0.75"], ["50000.30", "3"]]
        }
    });

    c.bench_function("parse_binance_depth_update", |b| {
        b.iter(|| black_box(feed.parse(black_box(&msg)).unwrap()))
    });
}

criterion_group!(benches, bench_apply_diff, bench_snapshot, bench_parse_depth_update);
criterion_main!(benches);
