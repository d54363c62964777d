// Classify raw feed messages as snapshot / diff for the merger.
use serde_json::Value;

use super::merger::{ChainRule, MergerConfig};
use super::{BookDiff, BookMessage, BookSnapshot, PriceLevel};
use crate::error::BookError;

/// Feed-specific recognizer for `orderbook.full` traffic.
///
/// `Ok(None)` means the message is not book data and is delivered as-is.
pub trait BookFeed: Send + Sync {
    fn parse(&self, msg: &Value) -> Result<Option<BookMessage>, BookError>;

    fn merger_config(&self) -> MergerConfig {
        MergerConfig::default()
    }
}

/// Generic levels feed:
/// `{"type":"snapshot","seq":1,"bids":[[p,s]],"asks":[[p,s]]}` and
/// `{"type":"diff","prevSeq":1,"seq":2,"bids":[..],"asks":[..]}`.
/// The instrument comes from `symbol` (or `market`), empty if absent.
#[derive(Debug, Default, Clone)]
pub struct LevelsFeed;

impl BookFeed for LevelsFeed {
    fn parse(&self, msg: &Value) -> Result<Option<BookMessage>, BookError> {
        let kind = match msg.get("type").and_then(Value::as_str) {
            Some(kind @ ("snapshot" | "diff")) => kind,
            _ => return Ok(None),
        };
        let instrument = msg
            .get("symbol")
            .or_else(|| msg.get("market"))
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let seq = field_u64(msg, "seq")?;
        let bids = parse_levels(msg.get("bids"))?;
        let asks = parse_levels(msg.get("asks"))?;

        let parsed = if kind == "snapshot" {
            BookMessage::Snapshot(BookSnapshot { instrument, sequence: seq, bids, asks })
        } else {
            let prev_seq = field_u64(msg, "prevSeq")?;
            let first_seq = prev_seq
                .checked_add(1)
                .ok_or_else(|| BookError::Malformed(format!("prevSeq {prev_seq} out of range")))?;
            let diff = BookDiff { instrument, prev_seq, first_seq, seq, bids, asks };
            BookMessage::Diff(forward(diff)?)
        };
        Ok(Some(parsed))
    }
}

/// Binance `depthUpdate` events, raw or wrapped in a combined-stream
/// envelope. The feed never carries snapshots; they come from REST.
#[derive(Debug, Clone)]
pub struct BinanceDepthFeed {
    pub backlog: usize,
}

impl Default for BinanceDepthFeed {
    fn default() -> Self {
        Self { backlog: 1000 }
    }
}

impl BookFeed for BinanceDepthFeed {
    fn parse(&self, msg: &Value) -> Result<Option<BookMessage>, BookError> {
        let data = msg.get("data").unwrap_or(msg);
        if data.get("e").and_then(Value::as_str) != Some("depthUpdate") {
            return Ok(None);
        }
        let instrument = data
            .get("s")
            .and_then(Value::as_str)
            .ok_or_else(|| BookError::Malformed("depthUpdate without symbol".into()))?
            .to_string();
        let first_seq = field_u64(data, "U")?;
        let seq = field_u64(data, "u")?;
        // futures chain on `pu`, spot on U == last + 1
        let prev_seq = match data.get("pu") {
            Some(pu) => as_u64(pu).ok_or_else(|| BookError::Malformed("bad pu".into()))?,
            None => first_seq.saturating_sub(1),
        };
        let diff = BookDiff {
            instrument,
            prev_seq,
            first_seq,
            seq,
            bids: parse_levels(data.get("b"))?,
            asks: parse_levels(data.get("a"))?,
        };
        Ok(Some(BookMessage::Diff(forward(diff)?)))
    }

    fn merger_config(&self) -> MergerConfig {
        MergerConfig { chain: ChainRule::Bridged, backlog: self.backlog }
    }
}

fn forward(diff: BookDiff) -> Result<BookDiff, BookError> {
    if diff.is_forward() {
        Ok(diff)
    } else {
        Err(BookError::Malformed(format!(
            "diff does not advance: prev {} first {} last {}",
            diff.prev_seq, diff.first_seq, diff.seq
        )))
    }
}

/// `[[price, size], ...]` with numbers or numeric strings. Missing = empty.
/// Non-finite or negative values are malformed.
pub fn parse_levels(levels: Option<&Value>) -> Result<Vec<PriceLevel>, BookError> {
    let Some(levels) = levels else {
        return Ok(Vec::new());
    };
    let arr = levels
        .as_array()
        .ok_or_else(|| BookError::Malformed(format!("levels not an array: {levels}")))?;
    arr.iter()
        .map(|level| {
            let price = level.get(0).and_then(as_f64);
            let size = level.get(1).and_then(as_f64);
            match (price, size) {
                (Some(price), Some(size)) => Ok(PriceLevel::new(price, size)),
                _ => Err(BookError::Malformed(format!("bad level: {level}"))),
            }
        })
        .collect()
}

fn as_f64(v: &Value) -> Option<f64> {
    let x: f64 = match v {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.parse().ok()?,
        _ => return None,
    };
    (x.is_finite() && x >= 0.0).then_some(x)
}

fn as_u64(v: &Value) -> Option<u64> {
    match v {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

fn field_u64(msg: &Value, key: &str) -> Result<u64, BookError> {
    msg.get(key)
        .and_then(as_u64)
        .ok_or_else(|| BookError::Malformed(format!("missing or invalid `{key}`")))
}
