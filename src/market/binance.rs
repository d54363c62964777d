// Binance exchangeInfo + depth snapshots over REST
use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Deserialize;
use tracing::{debug, info};

use super::MarketCatalog;
use crate::book::feed::parse_levels;
use crate::book::BookSnapshot;
use crate::error::CatalogError;
use crate::model::{contract_delivery_time, UXSymbol};

const SPOT_API: &str = "https://api.binance.com/api/v3";
const COIN_M_API: &str = "https://dapi.binance.com/dapi/v1";
const USDS_M_API: &str = "https://fapi.binance.com/fapi/v1";
const DEPTH_LIMIT: u32 = 1000;
const DELIVERY_HOUR_UTC: u32 = 8;
const API_KEY_HEADER: &str = "X-MBX-APIKEY";

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenKey {
    listen_key: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DepthSnapshot {
    last_update_id: u64,
    bids: serde_json::Value,
    asks: serde_json::Value,
}

pub struct BinanceRest {
    client: reqwest::Client,
    market_type: String,
    base_url: String,
    markets: RwLock<Option<HashSet<String>>>,
}

impl BinanceRest {
    pub fn new(market_type: &str) -> Self {
        let base_url = match market_type {
            "swap" | "futures" => COIN_M_API,
            "swap.usdt" => USDS_M_API,
            _ => SPOT_API,
        };
        Self::with_base_url(market_type, base_url)
    }

    pub fn with_base_url(market_type: &str, base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            market_type: market_type.to_string(),
            base_url: base_url.trim_end_matches('/').to_string(),
            markets: RwLock::new(None),
        }
    }

    // spot streams live under `userDataStream`, derivatives under `listenKey`
    fn listen_key_url(&self) -> String {
        if self.is_derivative() {
            format!("{}/listenKey", self.base_url)
        } else {
            format!("{}/userDataStream", self.base_url)
        }
    }

    fn is_derivative(&self) -> bool {
        matches!(self.market_type.as_str(), "swap" | "futures" | "swap.usdt")
    }

    /// Binance naming: `BTCUSDT` spot, `BTCUSD_PERP` coin-margined swap,
    /// `BTCUSD_210326` delivery futures, and `swap.usdt` symbols written
    /// quote-first (`USDT/BTC` -> `BTCUSDT`).
    pub fn native_name(symbol: &UXSymbol) -> Result<String, CatalogError> {
        Self::native_name_at(symbol, Utc::now())
    }

    /// `native_name` with the clock that resolves futures expiration codes.
    pub fn native_name_at(symbol: &UXSymbol, now: DateTime<Utc>) -> Result<String, CatalogError> {
        let unsupported = || CatalogError::UnsupportedSymbol(symbol.to_string());
        let base = symbol.base().ok_or_else(unsupported)?;
        let quote = symbol.quote().ok_or_else(unsupported)?;
        match symbol.market_type.as_str() {
            "spot" | "margin" => Ok(format!("{base}{quote}")),
            "swap" => Ok(format!("{base}{quote}_PERP")),
            "swap.usdt" => Ok(format!("{quote}{base}")),
            "futures" => {
                let expiration = symbol.contract_expiration().ok_or_else(unsupported)?;
                let delivery = contract_delivery_time(expiration, DELIVERY_HOUR_UTC, now)
                    .ok_or_else(unsupported)?;
                Ok(format!("{base}{quote}_{}", delivery.format("%y%m%d")))
            }
            _ => Err(unsupported()),
        }
    }
}

#[async_trait]
impl MarketCatalog for BinanceRest {
    async fn load_markets(&self) -> Result<usize, CatalogError> {
        let url = format!("{}/exchangeInfo", self.base_url);
        debug!(%url, "loading binance markets");
        let info: ExchangeInfo = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let ids: HashSet<String> = info.symbols.into_iter().map(|s| s.symbol).collect();
        let count = ids.len();
        *self.markets.write() = Some(ids);
        info!(market_type = %self.market_type, count, "binance markets loaded");
        Ok(count)
    }

    fn market_id(&self, symbol: &UXSymbol) -> Result<String, CatalogError> {
        let id = Self::native_name(symbol)?;
        match self.markets.read().as_ref() {
            None => Err(CatalogError::MarketsNotLoaded),
            Some(ids) if ids.contains(&id) => Ok(id),
            Some(_) => Err(CatalogError::UnknownMarket(id)),
        }
    }

    async fn fetch_order_book(&self, market_id: &str) -> Result<BookSnapshot, CatalogError> {
        let url = format!("{}/depth", self.base_url);
        let depth: DepthSnapshot = self
            .client
            .get(&url)
            .query(&[("symbol", market_id.to_string()), ("limit", DEPTH_LIMIT.to_string())])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        let decode = |e: crate::error::BookError| CatalogError::Decode(e.to_string());
        Ok(BookSnapshot {
            instrument: market_id.to_string(),
            sequence: depth.last_update_id,
            bids: parse_levels(Some(&depth.bids)).map_err(decode)?,
            asks: parse_levels(Some(&depth.asks)).map_err(decode)?,
        })
    }

    async fn create_listen_key(&self, api_key: &str) -> Result<String, CatalogError> {
        let url = self.listen_key_url();
        debug!(%url, "creating listen key");
        let key: ListenKey = self
            .client
            .post(&url)
            .header(API_KEY_HEADER, api_key)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(key.listen_key)
    }

    async fn renew_listen_key(&self, api_key: &str, listen_key: &str) -> Result<(), CatalogError> {
        let mut request = self.client.put(self.listen_key_url()).header(API_KEY_HEADER, api_key);
        if !self.is_derivative() {
            request = request.query(&[("listenKey", listen_key)]);
        }
        request.send().await?.error_for_status()?;
        debug!(market_type = %self.market_type, "listen key renewed");
        Ok(())
    }
}
