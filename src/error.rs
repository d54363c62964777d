// Error taxonomy, one enum per layer.
use std::time::Duration;

use thiserror::Error;

use crate::model::UXTopic;

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("markets not loaded, call load_markets first")]
    MarketsNotLoaded,

    #[error("unknown market: {0}")]
    UnknownMarket(String),

    #[error("unsupported symbol: {0}")]
    UnsupportedSymbol(String),

    #[error("operation not supported by this catalog: {0}")]
    Unsupported(&'static str),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("decode error: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("unsupported topic: {topic}")]
    UnsupportedTopic { topic: UXTopic },

    #[error("missing credential: {0}")]
    MissingCredential(&'static str),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("signing failed: {0}")]
    Signing(String),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum BookError {
    #[error("malformed book message: {0}")]
    Malformed(String),
}

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error(transparent)]
    Load(#[from] config::ConfigError),

    #[error("topic `{0}` defined more than once")]
    DuplicateTopic(String),

    #[error("unknown topic `{0}`")]
    UnknownTopic(String),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connect failed: {0}")]
    Connect(String),

    #[error("send failed: {0}")]
    Send(String),

    #[error("receive failed: {0}")]
    Receive(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),
}

/// Faults that terminate a session. Desync never shows up here.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("connection to {url} failed after {attempts} attempt(s): {reason}")]
    Connection {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("login not confirmed within {timeout:?}; unconfirmed topics: {}", fmt_topics(.pending))]
    AuthenticationTimeout {
        timeout: Duration,
        pending: Vec<UXTopic>,
    },

    #[error("subscriptions not confirmed within {timeout:?}: {}", fmt_topics(.pending))]
    SubscriptionTimeout {
        timeout: Duration,
        pending: Vec<UXTopic>,
    },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("topic set spans more than one exchange/market type")]
    MixedTopicSet,

    #[error("topic set is empty")]
    EmptyTopicSet,

    #[error("no adapter registered for exchange `{0}`")]
    UnknownExchange(String),
}

fn fmt_topics(topics: &[UXTopic]) -> String {
    topics
        .iter()
        .map(|t| t.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
