use std::fmt;

use serde::{Deserialize, Serialize};

use super::UXSymbol;

/// A market-data or private channel, normalized across venues.
///
/// `datatype` is dotted (`orderbook.full`, `ohlcv.1m`); its first segment is
/// the maintype adapters dispatch on, the rest are subtypes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UXTopic {
    pub exchange_id: String,
    pub market_type: String,
    pub datatype: String,
    pub extrainfo: String,
}

impl UXTopic {
    pub fn new(exchange_id: &str, market_type: &str, datatype: &str, extrainfo: &str) -> Self {
        Self {
            exchange_id: exchange_id.to_string(),
            market_type: market_type.to_string(),
            datatype: datatype.to_string(),
            extrainfo: extrainfo.to_string(),
        }
    }

    pub fn maintype(&self) -> &str {
        self.datatype.split('.').next().unwrap_or_default()
    }

    pub fn subtypes(&self) -> Vec<&str> {
        self.datatype.split('.').skip(1).collect()
    }

    /// The instrument this topic refers to, if any.
    pub fn symbol(&self) -> Option<UXSymbol> {
        if self.extrainfo.is_empty() {
            return None;
        }
        Some(UXSymbol::new(&self.exchange_id, &self.market_type, &self.extrainfo))
    }

    pub fn is_full_orderbook(&self) -> bool {
        self.datatype == "orderbook.full"
    }
}

impl fmt::Display for UXTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}",
            self.exchange_id, self.market_type, self.datatype, self.extrainfo
        )
    }
}
