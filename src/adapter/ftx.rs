// FTX websocket protocol: op/channel commands, typed acks, json ping/pong
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tracing::{debug, info};

use super::signing::hmac_sha256_hex;
use super::{
    ExchangeAdapter, Interception, KeepalivePolicy, SubscriptionSet, WireDescriptor,
};
use crate::config::Credentials;
use crate::error::AdapterError;
use crate::market::MarketCatalog;
use crate::model::UXTopic;

const FTX_WS_URL: &str = "wss://ftx.com/ws";
const PING_INTERVAL: Duration = Duration::from_secs(15);

const PUBLIC_TYPES: [&str; 3] = ["orderbook", "ticker", "trades"];
const PRIVATE_TYPES: [&str; 2] = ["fills", "myorder"];

pub struct FtxAdapter {
    catalog: Arc<dyn MarketCatalog>,
    ws_url: String,
}

impl FtxAdapter {
    pub fn new(catalog: Arc<dyn MarketCatalog>) -> Self {
        Self { catalog, ws_url: FTX_WS_URL.to_string() }
    }

    pub fn with_url(catalog: Arc<dyn MarketCatalog>, ws_url: &str) -> Self {
        Self { catalog, ws_url: ws_url.to_string() }
    }

    fn is_type(msg: &Value, kind: &str) -> bool {
        msg.get("type").and_then(Value::as_str) == Some(kind)
    }

    fn is_pong(msg: &Value) -> bool {
        Self::is_type(msg, "pong") || msg.as_str() == Some("pong")
    }

    // login signature is over `{time}websocket_login`
    fn login_frame(credentials: &Credentials, time: i64) -> Result<Value, AdapterError> {
        let key = credentials
            .api_key
            .as_deref()
            .ok_or(AdapterError::MissingCredential("apiKey"))?;
        let secret = credentials
            .secret
            .as_deref()
            .ok_or(AdapterError::MissingCredential("secret"))?;
        let sign = hmac_sha256_hex(secret, &format!("{time}websocket_login"))?;
        Ok(json!({
            "args": {"key": key, "sign": sign, "time": time},
            "op": "login",
        }))
    }
}

impl ExchangeAdapter for FtxAdapter {
    fn exchange_id(&self) -> &str {
        "ftx"
    }

    fn endpoint(&self, _subscriptions: &SubscriptionSet) -> Result<String, AdapterError> {
        Ok(self.ws_url.clone())
    }

    fn convert_topic(&self, topic: &UXTopic) -> Result<WireDescriptor, AdapterError> {
        let maintype = topic.maintype();
        if PUBLIC_TYPES.contains(&maintype) {
            // partial/update book frames carry no sequence: no `orderbook.full`
            if !topic.subtypes().is_empty() {
                return Err(AdapterError::UnsupportedTopic { topic: topic.clone() });
            }
            let symbol = topic
                .symbol()
                .ok_or_else(|| AdapterError::UnsupportedTopic { topic: topic.clone() })?;
            let market = self.catalog.market_id(&symbol)?;
            return Ok(WireDescriptor::new(maintype, Some(&market)));
        }
        match maintype {
            "fills" => Ok(WireDescriptor::new("fills", None)),
            "myorder" => Ok(WireDescriptor::new("orders", None)),
            _ => Err(AdapterError::UnsupportedTopic { topic: topic.clone() }),
        }
    }

    fn login_required(&self, topics: &[UXTopic]) -> bool {
        topics.iter().any(|t| PRIVATE_TYPES.contains(&t.maintype()))
    }

    /// Login followed by a ping: FTX has no login ack, the pong confirms it.
    fn login_command(&self, credentials: &Credentials) -> Result<Vec<Value>, AdapterError> {
        let time = chrono::Utc::now().timestamp_millis();
        Ok(vec![Self::login_frame(credentials, time)?, json!({"op": "ping"})])
    }

    fn on_login_message(&self, msg: Value) -> Result<Interception, AdapterError> {
        if Self::is_pong(&msg) {
            return Ok(Interception::Absorbed);
        }
        if Self::is_type(&msg, "error") {
            return Err(AdapterError::Protocol(format!("login rejected: {msg}")));
        }
        Ok(Interception::Forward(msg))
    }

    fn subscribe_commands(&self, subscriptions: &SubscriptionSet) -> Vec<Value> {
        subscriptions
            .iter()
            .map(|(_, desc)| {
                let mut command = json!({"op": "subscribe", "channel": desc.channel});
                if let Some(market) = &desc.market {
                    command["market"] = json!(market);
                }
                command
            })
            .collect()
    }

    fn on_subscribe_message(
        &self,
        msg: Value,
        subscriptions: &mut SubscriptionSet,
    ) -> Result<Interception, AdapterError> {
        if Self::is_type(&msg, "error") && !subscriptions.is_settled() {
            return Err(AdapterError::Protocol(format!("subscribe rejected: {msg}")));
        }
        if !Self::is_type(&msg, "subscribed") {
            return Ok(Interception::Forward(msg));
        }
        let channel = msg.get("channel").and_then(Value::as_str).unwrap_or_default();
        let market = msg.get("market").and_then(Value::as_str);
        let confirmed = subscriptions.confirm(channel, market);
        if confirmed.is_empty() {
            debug!(%msg, "ack for a topic that is not pending");
        }
        for topic in confirmed {
            info!(%topic, channel, "subscribed");
        }
        Ok(Interception::Absorbed)
    }

    fn keepalive_policy(&self) -> Option<KeepalivePolicy> {
        Some(KeepalivePolicy { interval: PING_INTERVAL, ping: json!({"op": "ping"}) })
    }

    fn on_keepalive_message(&self, msg: Value) -> Interception {
        if Self::is_pong(&msg) {
            Interception::Absorbed
        } else {
            Interception::Forward(msg)
        }
    }

    fn on_error_message(&self, msg: Value) -> Result<Interception, AdapterError> {
        if Self::is_type(&msg, "error") || msg.get("error").is_some() {
            return Err(AdapterError::Protocol(msg.to_string()));
        }
        Ok(Interception::Forward(msg))
    }
}
