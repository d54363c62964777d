use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn};

use uxws_rs::config::{Credentials, Settings, TopicCatalog};
use uxws_rs::market::{BinanceRest, FtxRest, MarketCatalog};
use uxws_rs::{open_session, telemetry, AdapterRegistry, Payload};

/// Websocket API runner: streams one catalog topic as JSON lines.
#[derive(Debug, Parser)]
#[command(name = "uxws", version, after_help = "Example: uxws binance.spot.orderbook.full")]
struct Cli {
    /// Topic name from the catalog
    topic: Option<String>,

    /// Topic catalog file
    #[arg(long, default_value = "topics.toml")]
    catalog: PathBuf,

    /// Settings file (TOML); UXWS_* environment variables override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log as JSON lines on stderr
    #[arg(long)]
    json_logs: bool,

    /// Print the catalog's topic names and exit
    #[arg(long)]
    list: bool,

    /// Prometheus port (with the `metrics-exporter` feature)
    #[arg(long, default_value_t = 9000)]
    metrics_port: u16,
}

fn rest_catalog(exchange_id: &str, market_type: &str) -> anyhow::Result<Arc<dyn MarketCatalog>> {
    Ok(match exchange_id {
        "binance" => Arc::new(BinanceRest::new(market_type)),
        "ftx" => Arc::new(FtxRest::new()),
        other => bail!("no market catalog for exchange `{other}`"),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok(); // load .env
    let cli = Cli::parse();
    telemetry::init_tracing("info", cli.json_logs);
    telemetry::init_metrics(cli.metrics_port)?;

    let catalog = TopicCatalog::load(&cli.catalog)
        .with_context(|| format!("loading topic catalog {}", cli.catalog.display()))?;
    if cli.list {
        for name in catalog.names() {
            println!("{name}");
        }
        return Ok(());
    }
    let name = cli.topic.context("missing topic name (try --list)")?;
    let topic = catalog.get(&name)?.clone();
    let settings = Settings::load(cli.config.as_deref()).context("loading settings")?;

    let markets = rest_catalog(&topic.exchange_id, &topic.market_type)?;
    let count = markets.load_markets().await.context("loading markets")?;
    info!(exchange = %topic.exchange_id, count, "markets loaded");

    let registry = AdapterRegistry::with_defaults();
    let adapter = registry.create(&topic.exchange_id, &topic.market_type, markets)?;
    let credentials = Credentials::from_env(&topic.exchange_id);
    let session = open_session(adapter, [topic], credentials)?.with_settings(settings);

    let cancel = session.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("ctrl-c received, closing session");
            cancel.cancel();
        }
    });

    let report = session
        .run(|payload: Payload| match serde_json::to_string(&payload) {
            Ok(line) => println!("{line}"),
            Err(e) => warn!(error = %e, "unprintable payload"),
        })
        .await?;
    info!(
        received = report.received,
        delivered = report.delivered,
        reconnects = report.reconnects,
        "done"
    );
    Ok(())
}
