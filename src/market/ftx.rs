// FTX market list over REST
use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::info;

use super::MarketCatalog;
use crate::error::CatalogError;
use crate::model::{contract_delivery_time, UXSymbol};

const FTX_API: &str = "https://ftx.com/api";
const DELIVERY_HOUR_UTC: u32 = 3;

#[derive(Debug, Deserialize)]
struct MarketsResponse {
    success: bool,
    result: Vec<MarketInfo>,
}

#[derive(Debug, Deserialize)]
struct MarketInfo {
    name: String,
}

pub struct FtxRest {
    client: reqwest::Client,
    base_url: String,
    markets: RwLock<Option<HashSet<String>>>,
}

impl Default for FtxRest {
    fn default() -> Self {
        Self::with_base_url(FTX_API)
    }
}

impl FtxRest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            markets: RwLock::new(None),
        }
    }

    /// `BTC/USD` spot, `BTC-PERP` perpetual swap, `BTC-0326` dated futures.
    pub fn native_name(symbol: &UXSymbol) -> Result<String, CatalogError> {
        Self::native_name_at(symbol, Utc::now())
    }

    pub fn native_name_at(symbol: &UXSymbol, now: DateTime<Utc>) -> Result<String, CatalogError> {
        let unsupported = || CatalogError::UnsupportedSymbol(symbol.to_string());
        let base = symbol.base().ok_or_else(unsupported)?;
        let quote = symbol.quote().ok_or_else(unsupported)?;
        match symbol.market_type.as_str() {
            "spot" => Ok(format!("{base}/{quote}")),
            "swap" => Ok(format!("{base}-PERP")),
            "futures" => {
                let expiration = symbol.contract_expiration().ok_or_else(unsupported)?;
                let delivery = contract_delivery_time(expiration, DELIVERY_HOUR_UTC, now)
                    .ok_or_else(unsupported)?;
                Ok(format!("{base}-{}", delivery.format("%m%d")))
            }
            _ => Err(unsupported()),
        }
    }
}

#[async_trait]
impl MarketCatalog for FtxRest {
    async fn load_markets(&self) -> Result<usize, CatalogError> {
        let url = format!("{}/markets", self.base_url);
        let resp: MarketsResponse = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        if !resp.success {
            return Err(CatalogError::Decode("markets request not successful".into()));
        }
        let names: HashSet<String> = resp.result.into_iter().map(|m| m.name).collect();
        let count = names.len();
        *self.markets.write() = Some(names);
        info!(count, "ftx markets loaded");
        Ok(count)
    }

    fn market_id(&self, symbol: &UXSymbol) -> Result<String, CatalogError> {
        let id = Self::native_name(symbol)?;
        match self.markets.read().as_ref() {
            None => Err(CatalogError::MarketsNotLoaded),
            Some(names) if names.contains(&id) => Ok(id),
            Some(_) => Err(CatalogError::UnknownMarket(id)),
        }
    }
}
