// REST-side market metadata consumed by adapters
pub mod binance;
pub mod ftx;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;

use crate::book::BookSnapshot;
use crate::error::CatalogError;
use crate::model::UXSymbol;

pub use binance::BinanceRest;
pub use ftx::FtxRest;

/// Venue metadata: which markets exist and what they are called natively.
#[async_trait]
pub trait MarketCatalog: Send + Sync {
    /// Fetch the market list; returns how many markets are known.
    async fn load_markets(&self) -> Result<usize, CatalogError>;

    /// Exchange-native identifier for `symbol`.
    fn market_id(&self, symbol: &UXSymbol) -> Result<String, CatalogError>;

    async fn fetch_order_book(&self, _market_id: &str) -> Result<BookSnapshot, CatalogError> {
        Err(CatalogError::Unsupported("fetch_order_book"))
    }

    /// Opens a user-data stream; returns the key that names it.
    async fn create_listen_key(&self, _api_key: &str) -> Result<String, CatalogError> {
        Err(CatalogError::Unsupported("create_listen_key"))
    }

    /// Keeps a user-data stream alive.
    async fn renew_listen_key(&self, _api_key: &str, _listen_key: &str) -> Result<(), CatalogError> {
        Err(CatalogError::Unsupported("renew_listen_key"))
    }
}

/// Fixed symbol table, for tests and offline use.
#[derive(Debug, Default, Clone)]
pub struct StaticCatalog {
    markets: HashMap<UXSymbol, String>,
    books: HashMap<String, BookSnapshot>,
    listen_key: Option<String>,
    renewals: Arc<AtomicUsize>,
}

impl StaticCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_market(mut self, symbol: UXSymbol, market_id: &str) -> Self {
        self.markets.insert(symbol, market_id.to_string());
        self
    }

    pub fn with_order_book(mut self, snapshot: BookSnapshot) -> Self {
        self.books.insert(snapshot.instrument.clone(), snapshot);
        self
    }

    pub fn with_listen_key(mut self, listen_key: &str) -> Self {
        self.listen_key = Some(listen_key.to_string());
        self
    }

    /// Successful `renew_listen_key` calls, shared between clones.
    pub fn listen_key_renewals(&self) -> usize {
        self.renewals.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MarketCatalog for StaticCatalog {
    async fn load_markets(&self) -> Result<usize, CatalogError> {
        Ok(self.markets.len())
    }

    fn market_id(&self, symbol: &UXSymbol) -> Result<String, CatalogError> {
        self.markets
            .get(symbol)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownMarket(symbol.to_string()))
    }

    async fn fetch_order_book(&self, market_id: &str) -> Result<BookSnapshot, CatalogError> {
        self.books
            .get(market_id)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownMarket(market_id.to_string()))
    }

    async fn create_listen_key(&self, _api_key: &str) -> Result<String, CatalogError> {
        self.listen_key.clone().ok_or(CatalogError::Unsupported("create_listen_key"))
    }

    async fn renew_listen_key(&self, _api_key: &str, listen_key: &str) -> Result<(), CatalogError> {
        if self.listen_key.as_deref() != Some(listen_key) {
            return Err(CatalogError::Decode(format!("unknown listen key {listen_key}")));
        }
        self.renewals.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
