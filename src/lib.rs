pub mod adapter;   // exchange plugin contract + FTX / Binance
pub mod book;      // order book reconstruction
pub mod config;    // settings, topic catalog, credentials
pub mod error;
pub mod market;    // REST market metadata
pub mod model;     // UXTopic / UXSymbol
pub mod session;   // connection lifecycle engine
pub mod telemetry;

pub use adapter::{AdapterRegistry, ExchangeAdapter, Interception};
pub use model::{UXSymbol, UXTopic};
pub use session::{open_session, Payload, Session, SessionReport, SessionState};
