use std::fmt;

use serde::{Deserialize, Serialize};

/// A tradable instrument, independent of any venue's naming.
///
/// `extrainfo` is usually `BASE/QUOTE`, optionally followed by a contract
/// expiration code (`BTC/USD.CQ`). Index symbols such as `.BXBT` are kept
/// verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UXSymbol {
    pub exchange_id: String,
    pub market_type: String,
    pub extrainfo: String,
}

impl UXSymbol {
    pub fn new(exchange_id: &str, market_type: &str, extrainfo: &str) -> Self {
        Self {
            exchange_id: exchange_id.to_string(),
            market_type: market_type.to_string(),
            extrainfo: extrainfo.to_string(),
        }
    }

    // "BTC/USD.CQ" -> ("BTC/USD", Some("CQ")); a leading dot is part of the name
    fn split_expiration(&self) -> (&str, Option<&str>) {
        let s = self.extrainfo.as_str();
        match s.rfind('.') {
            Some(i) if i > 0 => (&s[..i], Some(&s[i + 1..])),
            _ => (s, None),
        }
    }

    pub fn name(&self) -> &str {
        self.split_expiration().0
    }

    pub fn base(&self) -> Option<&str> {
        let name = self.name();
        name.split_once('/').map(|(base, _)| base)
    }

    pub fn quote(&self) -> Option<&str> {
        let name = self.name();
        name.split_once('/').map(|(_, quote)| quote)
    }

    pub fn contract_expiration(&self) -> Option<&str> {
        self.split_expiration().1
    }
}

impl fmt::Display for UXSymbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.exchange_id, self.market_type, self.extrainfo)
    }
}
