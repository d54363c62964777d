// Plugin contract every exchange implements, plus the registry
pub mod binance;
pub mod ftx;
pub mod signing;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture};
use serde_json::Value;

use crate::book::{BookFeed, BookSnapshot};
use crate::config::Credentials;
use crate::error::{AdapterError, CatalogError, SessionError};
use crate::market::MarketCatalog;
use crate::model::UXTopic;

pub use binance::BinanceAdapter;
pub use ftx::FtxAdapter;

/// Result of offering a message to one pipeline stage.
#[derive(Debug, Clone, PartialEq)]
pub enum Interception {
    /// Hand the (possibly rewritten) message to the next stage.
    Forward(Value),
    /// Consumed; nothing further sees it.
    Absorbed,
}

/// Wire-level name of one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WireDescriptor {
    pub channel: String,
    pub market: Option<String>,
}

impl WireDescriptor {
    pub fn new(channel: &str, market: Option<&str>) -> Self {
        Self {
            channel: channel.to_string(),
            market: market.map(str::to_string),
        }
    }
}

impl fmt::Display for WireDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.market {
            Some(market) => write!(f, "{}?{}", self.channel, market),
            None => f.write_str(&self.channel),
        }
    }
}

/// Topic -> wire descriptor map for one connection, plus the topics still
/// waiting for an acknowledgement. Confirmed topics never become pending
/// again on the same connection.
#[derive(Debug, Default, Clone)]
pub struct SubscriptionSet {
    entries: BTreeMap<UXTopic, WireDescriptor>,
    pending: BTreeSet<UXTopic>,
}

impl SubscriptionSet {
    pub fn new(entries: impl IntoIterator<Item = (UXTopic, WireDescriptor)>) -> Self {
        let entries: BTreeMap<_, _> = entries.into_iter().collect();
        let pending = entries.keys().cloned().collect();
        Self { entries, pending }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UXTopic, &WireDescriptor)> {
        self.entries.iter()
    }

    pub fn topics(&self) -> Vec<UXTopic> {
        self.entries.keys().cloned().collect()
    }

    pub fn descriptor(&self, topic: &UXTopic) -> Option<&WireDescriptor> {
        self.entries.get(topic)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn pending(&self) -> Vec<UXTopic> {
        self.pending.iter().cloned().collect()
    }

    pub fn is_pending(&self, topic: &UXTopic) -> bool {
        self.pending.contains(topic)
    }

    pub fn is_settled(&self) -> bool {
        self.pending.is_empty()
    }

    /// Marks every pending topic subscribed on `channel` (and `market`, when
    /// the ack names one) as confirmed. Returns the topics confirmed now.
    pub fn confirm(&mut self, channel: &str, market: Option<&str>) -> Vec<UXTopic> {
        let matched: Vec<UXTopic> = self
            .pending
            .iter()
            .filter(|topic| {
                self.entries.get(*topic).is_some_and(|d| {
                    d.channel == channel && market.map_or(true, |m| d.market.as_deref() == Some(m))
                })
            })
            .cloned()
            .collect();
        for topic in &matched {
            self.pending.remove(topic);
        }
        matched
    }

    pub fn confirm_all(&mut self) {
        self.pending.clear();
    }
}

/// Ping cadence and payload.
#[derive(Debug, Clone, PartialEq)]
pub struct KeepalivePolicy {
    pub interval: Duration,
    pub ping: Value,
}

pub type SnapshotFuture = BoxFuture<'static, Result<BookSnapshot, CatalogError>>;

pub type UpkeepJob = Box<dyn FnMut() -> BoxFuture<'static, Result<(), AdapterError>> + Send>;

/// Periodic side call that keeps a connection's endpoint valid, such as
/// renewing a listen key.
pub struct Upkeep {
    pub interval: Duration,
    pub job: UpkeepJob,
}

impl fmt::Debug for Upkeep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Upkeep").field("interval", &self.interval).finish_non_exhaustive()
    }
}

/// Where one connection attempt goes.
#[derive(Debug)]
pub struct Endpoint {
    pub url: String,
    pub upkeep: Option<Upkeep>,
}

impl Endpoint {
    pub fn new(url: String) -> Self {
        Self { url, upkeep: None }
    }
}

/// Everything the session engine needs to know about one venue.
///
/// The engine never branches on exchange identity; every protocol decision
/// goes through these hooks.
pub trait ExchangeAdapter: Send + Sync {
    fn exchange_id(&self) -> &str;

    /// Websocket URL for this subscription set.
    fn endpoint(&self, subscriptions: &SubscriptionSet) -> Result<String, AdapterError>;

    /// Endpoint for one connection attempt. Venues whose URL comes from a
    /// REST round trip override this; the default wraps `endpoint`.
    fn resolve_endpoint(
        &self,
        subscriptions: &SubscriptionSet,
        _credentials: &Credentials,
    ) -> BoxFuture<'static, Result<Endpoint, AdapterError>> {
        Box::pin(future::ready(self.endpoint(subscriptions).map(Endpoint::new)))
    }

    /// Venues that encode the subscription in the URL send no subscribe
    /// commands and no acknowledgements.
    fn subscribes_via_endpoint(&self) -> bool {
        false
    }

    fn convert_topic(&self, topic: &UXTopic) -> Result<WireDescriptor, AdapterError>;

    fn login_required(&self, topics: &[UXTopic]) -> bool;

    /// Frames sent, in order, to authenticate. None at all means the
    /// endpoint itself carries the authentication.
    fn login_command(&self, credentials: &Credentials) -> Result<Vec<Value>, AdapterError>;

    /// `Absorbed` once the login is confirmed; errors on explicit rejection.
    fn on_login_message(&self, msg: Value) -> Result<Interception, AdapterError>;

    fn subscribe_commands(&self, subscriptions: &SubscriptionSet) -> Vec<Value>;

    /// Recognizes acks, confirming their topics in `subscriptions`.
    fn on_subscribe_message(
        &self,
        msg: Value,
        subscriptions: &mut SubscriptionSet,
    ) -> Result<Interception, AdapterError>;

    fn keepalive_policy(&self) -> Option<KeepalivePolicy>;

    fn on_keepalive_message(&self, msg: Value) -> Interception {
        Interception::Forward(msg)
    }

    fn on_error_message(&self, msg: Value) -> Result<Interception, AdapterError> {
        Ok(Interception::Forward(msg))
    }

    /// Text frame -> JSON. Non-JSON text (a bare `pong`) becomes a string.
    fn decode(&self, text: &str) -> Value {
        serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
    }

    /// Snapshot/diff classifier for `orderbook.full` topics.
    fn book_feed(&self) -> Option<Arc<dyn BookFeed>> {
        None
    }

    /// REST snapshot fetch for feeds that never send one on the socket.
    fn snapshot_request(&self, _instrument: &str) -> Option<SnapshotFuture> {
        None
    }
}

type AdapterFactory =
    Box<dyn Fn(&str, Arc<dyn MarketCatalog>) -> Arc<dyn ExchangeAdapter> + Send + Sync>;

/// Exchange id -> adapter constructor.
#[derive(Default)]
pub struct AdapterRegistry {
    factories: HashMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every adapter shipped in this crate.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register("ftx", |_market_type, catalog| Arc::new(FtxAdapter::new(catalog)));
        registry.register("binance", |market_type, catalog| {
            Arc::new(BinanceAdapter::new(market_type, catalog))
        });
        registry
    }

    pub fn register<F>(&mut self, exchange_id: &str, factory: F)
    where
        F: Fn(&str, Arc<dyn MarketCatalog>) -> Arc<dyn ExchangeAdapter> + Send + Sync + 'static,
    {
        self.factories.insert(exchange_id.to_string(), Box::new(factory));
    }

    pub fn create(
        &self,
        exchange_id: &str,
        market_type: &str,
        catalog: Arc<dyn MarketCatalog>,
    ) -> Result<Arc<dyn ExchangeAdapter>, SessionError> {
        let factory = self
            .factories
            .get(exchange_id)
            .ok_or_else(|| SessionError::UnknownExchange(exchange_id.to_string()))?;
        Ok(factory(market_type, catalog))
    }

    pub fn exchanges(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market::StaticCatalog;

    fn topic(datatype: &str, extrainfo: &str) -> UXTopic {
        UXTopic::new("ftx", "spot", datatype, extrainfo)
    }

    #[test]
    fn confirm_removes_matching_topics_only() {
        let book = topic("orderbook", "BTC/USD");
        let trades = topic("trades", "BTC/USD");
        let eth = topic("orderbook", "ETH/USD");
        let mut subs = SubscriptionSet::new([
            (book.clone(), WireDescriptor::new("orderbook", Some("BTC/USD"))),
            (trades.clone(), WireDescriptor::new("trades", Some("BTC/USD"))),
            (eth.clone(), WireDescriptor::new("orderbook", Some("ETH/USD"))),
        ]);
        assert_eq!(subs.pending().len(), 3);

        assert_eq!(subs.confirm("orderbook", Some("BTC/USD")), vec![book.clone()]);
        assert!(!subs.is_pending(&book));
        assert!(subs.is_pending(&eth));

        // a repeated ack does not resurrect anything
        assert!(subs.confirm("orderbook", Some("BTC/USD")).is_empty());
        assert_eq!(subs.pending(), vec![eth.clone(), trades.clone()]);

        assert_eq!(subs.confirm("trades", None), vec![trades]);
        subs.confirm_all();
        assert!(subs.is_settled());
        assert_eq!(subs.len(), 3);
    }

    #[test]
    fn clone_keeps_its_own_pending_set() {
        let book = topic("orderbook", "BTC/USD");
        let template =
            SubscriptionSet::new([(book.clone(), WireDescriptor::new("orderbook", Some("BTC/USD")))]);
        let mut live = template.clone();
        live.confirm_all();
        assert!(live.is_settled());
        assert!(template.is_pending(&book));
    }

    #[test]
    fn registry_creates_known_exchanges() {
        let registry = AdapterRegistry::with_defaults();
        assert_eq!(registry.exchanges(), vec!["binance", "ftx"]);
        let catalog: Arc<dyn MarketCatalog> = Arc::new(StaticCatalog::new());
        let adapter = registry.create("ftx", "spot", catalog.clone()).unwrap();
        assert_eq!(adapter.exchange_id(), "ftx");
        assert!(matches!(
            registry.create("kraken", "spot", catalog),
            Err(SessionError::UnknownExchange(id)) if id == "kraken"
        ));
    }

    #[test]
    fn wire_descriptor_display() {
        assert_eq!(WireDescriptor::new("orderbook", Some("BTC-PERP")).to_string(), "orderbook?BTC-PERP");
        assert_eq!(WireDescriptor::new("fills", None).to_string(), "fills");
    }
}
