// Binance combined market streams and listen-key user-data streams:
// the subscription lives in the URL
use std::sync::Arc;
use std::time::Duration;

use futures::future::{self, BoxFuture};
use itertools::Itertools;
use serde_json::Value;
use tracing::info;

use super::{
    Endpoint, ExchangeAdapter, Interception, KeepalivePolicy, SnapshotFuture, SubscriptionSet,
    Upkeep, UpkeepJob, WireDescriptor,
};
use crate::book::{BinanceDepthFeed, BookFeed};
use crate::config::Credentials;
use crate::error::AdapterError;
use crate::market::MarketCatalog;
use crate::model::UXTopic;

const SPOT_STREAM: &str = "wss://stream.binance.com:9443/stream";
const COIN_M_STREAM: &str = "wss://dstream.binance.com/stream";
const USDS_M_STREAM: &str = "wss://fstream.binance.com/stream";
const LISTEN_KEY_RENEWAL: Duration = Duration::from_secs(20 * 60);
const PRIVATE: &str = "private";

pub struct BinanceAdapter {
    market_type: String,
    catalog: Arc<dyn MarketCatalog>,
    stream_url: String,
    user_stream_url: String,
    feed: Arc<BinanceDepthFeed>,
}

impl BinanceAdapter {
    pub fn new(market_type: &str, catalog: Arc<dyn MarketCatalog>) -> Self {
        let stream_url = match market_type {
            "swap" | "futures" => COIN_M_STREAM,
            "swap.usdt" => USDS_M_STREAM,
            _ => SPOT_STREAM,
        };
        Self::with_url(market_type, catalog, stream_url)
    }

    /// `stream_url` is the combined-stream URL (`.../stream`); user-data
    /// streams connect to the sibling `.../ws/{listenKey}`.
    pub fn with_url(market_type: &str, catalog: Arc<dyn MarketCatalog>, stream_url: &str) -> Self {
        let stream_url = stream_url.trim_end_matches('/');
        let root = stream_url.strip_suffix("/stream").unwrap_or(stream_url);
        Self {
            market_type: market_type.to_string(),
            catalog,
            stream_url: stream_url.to_string(),
            user_stream_url: format!("{root}/ws"),
            feed: Arc::new(BinanceDepthFeed::default()),
        }
    }

    fn private_count(subscriptions: &SubscriptionSet) -> usize {
        subscriptions.iter().filter(|(topic, _)| topic.maintype() == PRIVATE).count()
    }

    fn user_stream(
        &self,
        credentials: &Credentials,
    ) -> BoxFuture<'static, Result<Endpoint, AdapterError>> {
        let Some(api_key) = credentials.api_key.clone() else {
            return Box::pin(future::ready(Err(AdapterError::MissingCredential("apiKey"))));
        };
        let catalog = self.catalog.clone();
        let base = self.user_stream_url.clone();
        Box::pin(async move {
            let listen_key = catalog.create_listen_key(&api_key).await?;
            info!("listen key created");
            let url = format!("{base}/{listen_key}");
            let job: UpkeepJob = Box::new(move || -> BoxFuture<'static, Result<(), AdapterError>> {
                let catalog = catalog.clone();
                let api_key = api_key.clone();
                let listen_key = listen_key.clone();
                Box::pin(async move {
                    catalog
                        .renew_listen_key(&api_key, &listen_key)
                        .await
                        .map_err(AdapterError::from)
                })
            });
            Ok::<_, AdapterError>(Endpoint {
                url,
                upkeep: Some(Upkeep { interval: LISTEN_KEY_RENEWAL, job }),
            })
        })
    }

    fn is_derivative(&self) -> bool {
        matches!(self.market_type.as_str(), "swap" | "futures" | "swap.usdt")
    }

    fn depth_suffix(&self, subtypes: &[&str]) -> String {
        match subtypes.first() {
            None => "20@100ms".to_string(),
            Some(&"full") if self.market_type == "swap" => "@0ms".to_string(),
            Some(&"full") => "@100ms".to_string(),
            Some(level_speed) => level_speed.to_string(),
        }
    }

    fn stream_name(&self, topic: &UXTopic, symbol: &str) -> Option<String> {
        let subtypes = topic.subtypes();
        let stream = match topic.maintype() {
            "orderbook" => format!("{symbol}@depth{}", self.depth_suffix(&subtypes)),
            "ohlcv" => format!("{symbol}@kline_{}", subtypes.first().unwrap_or(&"1m")),
            "trade" if !self.is_derivative() => format!("{symbol}@trade"),
            "aggTrade" => format!("{symbol}@aggTrade"),
            "ticker" => format!("{symbol}@ticker"),
            "miniTicker" => format!("{symbol}@miniTicker"),
            "quote" => format!("{symbol}@bookTicker"),
            "markPrice" if self.is_derivative() => {
                let speed = if subtypes.first() == Some(&"1s") { "@1s" } else { "" };
                format!("{symbol}@markPrice{speed}")
            }
            _ => return None,
        };
        Some(stream)
    }
}

impl ExchangeAdapter for BinanceAdapter {
    fn exchange_id(&self) -> &str {
        "binance"
    }

    fn endpoint(&self, subscriptions: &SubscriptionSet) -> Result<String, AdapterError> {
        if subscriptions.is_empty() {
            return Err(AdapterError::Protocol("combined stream needs at least one topic".into()));
        }
        if Self::private_count(subscriptions) > 0 {
            return Err(AdapterError::Protocol("user-data streams need a listen key".into()));
        }
        let streams = subscriptions.iter().map(|(_, desc)| &desc.channel).join("/");
        Ok(format!("{}?streams={}", self.stream_url, streams))
    }

    fn resolve_endpoint(
        &self,
        subscriptions: &SubscriptionSet,
        credentials: &Credentials,
    ) -> BoxFuture<'static, Result<Endpoint, AdapterError>> {
        match Self::private_count(subscriptions) {
            0 => Box::pin(future::ready(self.endpoint(subscriptions).map(Endpoint::new))),
            n if n == subscriptions.len() => self.user_stream(credentials),
            _ => Box::pin(future::ready(Err(AdapterError::Protocol(
                "user-data and market streams cannot share a connection".into(),
            )))),
        }
    }

    fn subscribes_via_endpoint(&self) -> bool {
        true
    }

    fn convert_topic(&self, topic: &UXTopic) -> Result<WireDescriptor, AdapterError> {
        let unsupported = || AdapterError::UnsupportedTopic { topic: topic.clone() };
        if topic.maintype() == PRIVATE {
            return if topic.subtypes().is_empty() && topic.extrainfo.is_empty() {
                Ok(WireDescriptor::new(PRIVATE, None))
            } else {
                Err(unsupported())
            };
        }
        let symbol = topic.symbol().ok_or_else(unsupported)?;
        let market = self.catalog.market_id(&symbol)?;
        let stream = self
            .stream_name(topic, &market.to_lowercase())
            .ok_or_else(unsupported)?;
        Ok(WireDescriptor::new(&stream, Some(&market)))
    }

    fn login_required(&self, topics: &[UXTopic]) -> bool {
        topics.iter().any(|t| t.maintype() == PRIVATE)
    }

    // the listen key in the URL is the login
    fn login_command(&self, _credentials: &Credentials) -> Result<Vec<Value>, AdapterError> {
        Ok(Vec::new())
    }

    fn on_login_message(&self, msg: Value) -> Result<Interception, AdapterError> {
        Ok(Interception::Forward(msg))
    }

    fn subscribe_commands(&self, _subscriptions: &SubscriptionSet) -> Vec<Value> {
        Vec::new()
    }

    fn on_subscribe_message(
        &self,
        msg: Value,
        _subscriptions: &mut SubscriptionSet,
    ) -> Result<Interception, AdapterError> {
        Ok(Interception::Forward(msg))
    }

    // server pings are protocol frames, answered by the transport
    fn keepalive_policy(&self) -> Option<KeepalivePolicy> {
        None
    }

    fn on_error_message(&self, msg: Value) -> Result<Interception, AdapterError> {
        match (msg.get("code"), msg.get("msg")) {
            (Some(code), Some(text)) => Err(AdapterError::Protocol(format!("{code}: {text}"))),
            _ => Ok(Interception::Forward(msg)),
        }
    }

    fn book_feed(&self) -> Option<Arc<dyn BookFeed>> {
        let feed: Arc<dyn BookFeed> = self.feed.clone();
        Some(feed)
    }

    fn snapshot_request(&self, instrument: &str) -> Option<SnapshotFuture> {
        let catalog = self.catalog.clone();
        let instrument = instrument.to_string();
        let fetch: SnapshotFuture =
            Box::pin(async move { catalog.fetch_order_book(&instrument).await });
        Some(fetch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::book::{BookSnapshot, PriceLevel};
    use crate::market::StaticCatalog;
    use crate::model::UXSymbol;
    use serde_json::json;

    fn catalog() -> Arc<dyn MarketCatalog> {
        Arc::new(
            StaticCatalog::new()
                .with_market(UXSymbol::new("binance", "spot", "BTC/USDT"), "BTCUSDT")
                .with_market(UXSymbol::new("binance", "swap", "BTC/USD"), "BTCUSD_PERP")
                .with_order_book(BookSnapshot {
                    instrument: "BTCUSDT".into(),
                    sequence: 42,
                    bids: vec![PriceLevel::new(100.0, 1.0)],
                    asks: vec![],
                })
                .with_listen_key("pqia91ma19a5s61cv6a81va65sdf19v8a65a1a5s61cv6a81va65sdf19v8a65a1"),
        )
    }

    fn creds(api_key: Option<&str>) -> Credentials {
        Credentials { api_key: api_key.map(str::to_string), ..Credentials::default() }
    }

    fn private_set(a: &BinanceAdapter, market_type: &str) -> SubscriptionSet {
        let topic = UXTopic::new("binance", market_type, "private", "");
        SubscriptionSet::new([(topic.clone(), a.convert_topic(&topic).unwrap())])
    }

    fn stream(adapter: &BinanceAdapter, market_type: &str, datatype: &str, extra: &str) -> String {
        let topic = UXTopic::new("binance", market_type, datatype, extra);
        adapter.convert_topic(&topic).unwrap().channel
    }

    #[test]
    fn spot_stream_names() {
        let a = BinanceAdapter::new("spot", catalog());
        assert_eq!(stream(&a, "spot", "orderbook", "BTC/USDT"), "btcusdt@depth20@100ms");
        assert_eq!(stream(&a, "spot", "orderbook.full", "BTC/USDT"), "btcusdt@depth@100ms");
        assert_eq!(stream(&a, "spot", "orderbook.5@1000ms", "BTC/USDT"), "btcusdt@depth5@1000ms");
        assert_eq!(stream(&a, "spot", "ohlcv", "BTC/USDT"), "btcusdt@kline_1m");
        assert_eq!(stream(&a, "spot", "ohlcv.1h", "BTC/USDT"), "btcusdt@kline_1h");
        assert_eq!(stream(&a, "spot", "trade", "BTC/USDT"), "btcusdt@trade");
        assert_eq!(stream(&a, "spot", "quote", "BTC/USDT"), "btcusdt@bookTicker");
    }

    #[test]
    fn swap_stream_names() {
        let a = BinanceAdapter::new("swap", catalog());
        assert_eq!(stream(&a, "swap", "orderbook.full", "BTC/USD"), "btcusd_perp@depth@0ms");
        assert_eq!(stream(&a, "swap", "markPrice", "BTC/USD"), "btcusd_perp@markPrice");
        assert_eq!(stream(&a, "swap", "markPrice.1s", "BTC/USD"), "btcusd_perp@markPrice@1s");
    }

    #[test]
    fn unsupported_topics_are_reported() {
        let a = BinanceAdapter::new("spot", catalog());
        for datatype in ["markPrice", "myorder", "fills"] {
            let t = UXTopic::new("binance", "spot", datatype, "BTC/USDT");
            assert!(
                matches!(a.convert_topic(&t), Err(AdapterError::UnsupportedTopic { .. })),
                "{datatype} should be unsupported"
            );
        }
        let t = UXTopic::new("binance", "spot", "trade", "");
        assert!(matches!(a.convert_topic(&t), Err(AdapterError::UnsupportedTopic { .. })));
    }

    #[test]
    fn endpoint_joins_streams() {
        let a = BinanceAdapter::new("spot", catalog());
        let book = UXTopic::new("binance", "spot", "orderbook.full", "BTC/USDT");
        let trade = UXTopic::new("binance", "spot", "trade", "BTC/USDT");
        let subs = SubscriptionSet::new([
            (book.clone(), a.convert_topic(&book).unwrap()),
            (trade.clone(), a.convert_topic(&trade).unwrap()),
        ]);
        assert_eq!(
            a.endpoint(&subs).unwrap(),
            "wss://stream.binance.com:9443/stream?streams=btcusdt@depth@100ms/btcusdt@trade"
        );
        assert!(a.subscribe_commands(&subs).is_empty());
        assert!(a.subscribes_via_endpoint());
        assert!(!a.login_required(&[book]));
        assert!(a.keepalive_policy().is_none());
        assert!(a.endpoint(&SubscriptionSet::default()).is_err());
    }

    #[tokio::test]
    async fn private_topics_connect_through_a_listen_key() {
        let a = BinanceAdapter::new("spot", catalog());
        let private = UXTopic::new("binance", "spot", "private", "");
        assert_eq!(a.convert_topic(&private).unwrap(), WireDescriptor::new("private", None));
        assert!(a.login_required(&[private.clone()]));
        assert!(a.login_command(&Credentials::default()).unwrap().is_empty());

        let subs = private_set(&a, "spot");
        assert!(a.endpoint(&subs).is_err());
        let mut endpoint = a.resolve_endpoint(&subs, &creds(Some("key"))).await.unwrap();
        assert_eq!(
            endpoint.url,
            "wss://stream.binance.com:9443/ws/pqia91ma19a5s61cv6a81va65sdf19v8a65a1a5s61cv6a81va65sdf19v8a65a1"
        );
        let upkeep = endpoint.upkeep.as_mut().unwrap();
        assert_eq!(upkeep.interval, Duration::from_secs(1200));
        (upkeep.job)().await.unwrap();
    }

    #[tokio::test]
    async fn user_stream_urls_follow_market_type() {
        let swap = BinanceAdapter::new("swap", catalog());
        let endpoint = swap
            .resolve_endpoint(&private_set(&swap, "swap"), &creds(Some("k")))
            .await
            .unwrap();
        assert!(endpoint.url.starts_with("wss://dstream.binance.com/ws/"));

        let linear = BinanceAdapter::new("swap.usdt", catalog());
        let endpoint = linear
            .resolve_endpoint(&private_set(&linear, "swap.usdt"), &creds(Some("k")))
            .await
            .unwrap();
        assert!(endpoint.url.starts_with("wss://fstream.binance.com/ws/"));
    }

    #[tokio::test]
    async fn user_stream_needs_an_api_key_and_its_own_connection() {
        let a = BinanceAdapter::new("spot", catalog());
        let subs = private_set(&a, "spot");
        assert!(matches!(
            a.resolve_endpoint(&subs, &creds(None)).await,
            Err(AdapterError::MissingCredential("apiKey"))
        ));

        let private = UXTopic::new("binance", "spot", "private", "");
        let trade = UXTopic::new("binance", "spot", "trade", "BTC/USDT");
        let mixed = SubscriptionSet::new([
            (private.clone(), a.convert_topic(&private).unwrap()),
            (trade.clone(), a.convert_topic(&trade).unwrap()),
        ]);
        assert!(matches!(
            a.resolve_endpoint(&mixed, &creds(Some("k"))).await,
            Err(AdapterError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn market_streams_resolve_without_upkeep() {
        let a = BinanceAdapter::new("spot", catalog());
        let trade = UXTopic::new("binance", "spot", "trade", "BTC/USDT");
        let subs = SubscriptionSet::new([(trade.clone(), a.convert_topic(&trade).unwrap())]);
        let endpoint = a.resolve_endpoint(&subs, &Credentials::default()).await.unwrap();
        assert_eq!(endpoint.url, "wss://stream.binance.com:9443/stream?streams=btcusdt@trade");
        assert!(endpoint.upkeep.is_none());
    }

    #[test]
    fn error_frames_are_fatal() {
        let a = BinanceAdapter::new("spot", catalog());
        assert!(a.on_error_message(json!({"code": 2, "msg": "Invalid request"})).is_err());
        let data = json!({"stream": "btcusdt@trade", "data": {"e": "trade"}});
        assert_eq!(a.on_error_message(data.clone()).unwrap(), Interception::Forward(data));
    }

    #[tokio::test]
    async fn snapshot_request_uses_catalog() {
        let a = BinanceAdapter::new("spot", catalog());
        let snapshot = a.snapshot_request("BTCUSDT").unwrap().await.unwrap();
        assert_eq!(snapshot.sequence, 42);
        assert!(a.book_feed().unwrap().merger_config().backlog > 0);
        assert!(a.snapshot_request("ETHUSDT").unwrap().await.is_err());
    }
}
