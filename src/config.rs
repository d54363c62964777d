//! Layered settings, the topic catalog and per-exchange credentials.
//!
//! Settings load in increasing priority:
//! 1. Compiled-in defaults
//! 2. TOML file (if provided)
//! 3. Environment overrides, prefix `UXWS_`, nested with `__`
//!    (e.g. `UXWS_SESSION__LOGIN_TIMEOUT_MS=3000`)
//!
//! Secrets never come from files: `Credentials::from_env` reads them from the
//! process environment (populated from `.env` by the binary).

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

use crate::error::SettingsError;
use crate::model::UXTopic;

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_login_timeout_ms() -> u64 {
    10_000
}

fn default_subscribe_timeout_ms() -> u64 {
    10_000
}

fn default_snapshot_retries() -> u32 {
    3
}

fn default_book_backlog() -> usize {
    1_000
}

fn default_initial_backoff_ms() -> u64 {
    1_000
}

fn default_max_backoff_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    5
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub session: SessionSettings,
    #[serde(default)]
    pub reconnect: ReconnectSettings,
}

/// Per-phase deadlines and order book knobs.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionSettings {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_login_timeout_ms")]
    pub login_timeout_ms: u64,
    #[serde(default = "default_subscribe_timeout_ms")]
    pub subscribe_timeout_ms: u64,
    /// REST snapshot attempts per resync before giving up until the next diff.
    #[serde(default = "default_snapshot_retries")]
    pub snapshot_retries: u32,
    /// Diffs buffered per instrument while a REST snapshot is in flight.
    #[serde(default = "default_book_backlog")]
    pub book_backlog: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            login_timeout_ms: default_login_timeout_ms(),
            subscribe_timeout_ms: default_subscribe_timeout_ms(),
            snapshot_retries: default_snapshot_retries(),
            book_backlog: default_book_backlog(),
        }
    }
}

impl SessionSettings {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn login_timeout(&self) -> Duration {
        Duration::from_millis(self.login_timeout_ms)
    }

    pub fn subscribe_timeout(&self) -> Duration {
        Duration::from_millis(self.subscribe_timeout_ms)
    }
}

/// Exponential backoff for transport recovery. `max_retries = 0` disables it.
#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectSettings {
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            max_retries: default_max_retries(),
        }
    }
}

impl Settings {
    pub fn load(path: Option<&Path>) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(File::from(path).required(true));
        }
        builder = builder.add_source(
            Environment::with_prefix("UXWS")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );
        Ok(builder.build()?.try_deserialize()?)
    }

    pub fn from_toml(text: &str) -> Result<Self, SettingsError> {
        let cfg = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?;
        Ok(cfg.try_deserialize()?)
    }
}

/// API credentials for one exchange. Any field may be absent for
/// public-only sessions.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub api_key: Option<String>,
    pub secret: Option<String>,
    pub password: Option<String>,
}

impl Credentials {
    /// Reads `{exchange}_apiKey`, `{exchange}_secret`, `{exchange}_password`.
    pub fn from_env(exchange_id: &str) -> Self {
        let var = |field: &str| {
            std::env::var(format!("{exchange_id}_{field}"))
                .ok()
                .filter(|v| !v.is_empty())
        };
        Self {
            api_key: var("apiKey"),
            secret: var("secret"),
            password: var("password"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.api_key.is_none() && self.secret.is_none() && self.password.is_none()
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let redact = |v: &Option<String>| v.as_ref().map(|_| "***");
        f.debug_struct("Credentials")
            .field("api_key", &redact(&self.api_key))
            .field("secret", &redact(&self.secret))
            .field("password", &redact(&self.password))
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct TopicEntry {
    name: String,
    exchange_id: String,
    market_type: String,
    datatype: String,
    #[serde(default)]
    extrainfo: String,
}

#[derive(Debug, Deserialize)]
struct TopicFile {
    #[serde(default)]
    topic: Vec<TopicEntry>,
}

/// Human-readable topic names -> topics. Loaded once, then read-only;
/// share it as `Arc<TopicCatalog>`.
#[derive(Debug, Default)]
pub struct TopicCatalog {
    topics: BTreeMap<String, UXTopic>,
}

impl TopicCatalog {
    pub fn load(path: &Path) -> Result<Self, SettingsError> {
        let cfg = Config::builder()
            .add_source(File::from(path).format(FileFormat::Toml))
            .build()?;
        Self::from_entries(cfg.try_deserialize::<TopicFile>()?)
    }

    pub fn from_toml(text: &str) -> Result<Self, SettingsError> {
        let cfg = Config::builder()
            .add_source(File::from_str(text, FileFormat::Toml))
            .build()?;
        Self::from_entries(cfg.try_deserialize::<TopicFile>()?)
    }

    fn from_entries(file: TopicFile) -> Result<Self, SettingsError> {
        let mut topics = BTreeMap::new();
        for entry in file.topic {
            let topic = UXTopic::new(
                &entry.exchange_id,
                &entry.market_type,
                &entry.datatype,
                &entry.extrainfo,
            );
            if topics.insert(entry.name.clone(), topic).is_some() {
                return Err(SettingsError::DuplicateTopic(entry.name));
            }
        }
        Ok(Self { topics })
    }

    pub fn get(&self, name: &str) -> Result<&UXTopic, SettingsError> {
        self.topics
            .get(name)
            .ok_or_else(|| SettingsError::UnknownTopic(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.topics.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const CATALOG: &str = r#"
[[topic]]
name = "binance.spot.orderbook.full"
exchange_id = "binance"
market_type = "spot"
datatype = "orderbook.full"
extrainfo = "BTC/USDT"

[[topic]]
name = "ftx.spot.myorder"
exchange_id = "ftx"
market_type = "spot"
datatype = "myorder"
"#;

    #[test]
    fn catalog_resolves_names() {
        let catalog = TopicCatalog::from_toml(CATALOG).unwrap();
        assert_eq!(catalog.len(), 2);
        assert_eq!(
            catalog.get("binance.spot.orderbook.full").unwrap(),
            &UXTopic::new("binance", "spot", "orderbook.full", "BTC/USDT")
        );
        // missing extrainfo defaults to empty
        assert_eq!(catalog.get("ftx.spot.myorder").unwrap().extrainfo, "");
        assert!(matches!(catalog.get("nope"), Err(SettingsError::UnknownTopic(_))));
        assert_eq!(
            catalog.names().collect::<Vec<_>>(),
            vec!["binance.spot.orderbook.full", "ftx.spot.myorder"]
        );
    }

    #[test]
    fn duplicate_topic_names_are_rejected() {
        let text = format!("{CATALOG}\n{}", &CATALOG[CATALOG.find("[[topic]]").unwrap()..]);
        assert!(matches!(
            TopicCatalog::from_toml(&text),
            Err(SettingsError::DuplicateTopic(_))
        ));
    }

    #[test]
    fn settings_defaults_and_overrides() {
        let defaults = Settings::from_toml("").unwrap();
        assert_eq!(defaults.session.login_timeout(), Duration::from_secs(10));
        assert_eq!(defaults.reconnect.max_retries, 5);

        let s = Settings::from_toml("[session]\nsubscribe_timeout_ms = 250\n[reconnect]\nmax_retries = 0\n")
            .unwrap();
        assert_eq!(s.session.subscribe_timeout(), Duration::from_millis(250));
        assert_eq!(s.session.book_backlog, 1_000);
        assert_eq!(s.reconnect.max_retries, 0);
    }

    #[test]
    fn credentials_debug_is_redacted() {
        let creds = Credentials {
            api_key: Some("my-key".into()),
            secret: Some("my-secret".into()),
            password: None,
        };
        let shown = format!("{creds:?}");
        assert!(!shown.contains("my-key"));
        assert!(!shown.contains("my-secret"));
        assert!(shown.contains("***"));
        assert!(Credentials::default().is_empty());
    }

    #[test]
    fn credentials_from_env() {
        std::env::set_var("uxwstestex_apiKey", "k");
        std::env::set_var("uxwstestex_secret", "s");
        let creds = Credentials::from_env("uxwstestex");
        assert_eq!(creds.api_key.as_deref(), Some("k"));
        assert_eq!(creds.secret.as_deref(), Some("s"));
        assert_eq!(creds.password, None);
    }
}
