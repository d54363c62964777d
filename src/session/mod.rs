// Session engine: drives one connection for one topic set through the
// adapter hooks (connect -> login -> subscribe -> stream -> keepalive -> recover)
pub mod activities; // background tasks owned by a session
pub mod pipeline;   // interceptor chain
pub mod transport;  // websocket seam + backoff

pub use activities::Activities;
pub use pipeline::{FnInterceptor, Interceptor, Pipeline};
pub use transport::{Connector, Transport, WsConnector};

use std::collections::HashSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::AbortHandle;
use tokio::time::{sleep, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::adapter::{
    Endpoint, ExchangeAdapter, Interception, KeepalivePolicy, SnapshotFuture, SubscriptionSet,
    Upkeep,
};
use crate::book::{
    BookFeed, BookMergers, BookMessage, BookSnapshot, FullBook, MergeOutcome, MergerConfig,
};
use crate::config::{Credentials, Settings};
use crate::error::{AdapterError, CatalogError, SessionError, TransportError};
use crate::model::UXTopic;
use transport::calculate_backoff;

const CLOSE_GRACE: Duration = Duration::from_secs(1);
const SNAPSHOT_BACKOFF: Duration = Duration::from_millis(250);
const SNAPSHOT_BACKOFF_MAX: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Authenticating,
    Subscribing,
    Streaming,
    Recovering,
    Closing,
    Terminated,
}

/// What the caller's handler receives.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Payload {
    Raw(Value),
    Book(FullBook),
}

/// Counters for one `run`, returned on clean shutdown.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionReport {
    pub received: u64,
    pub delivered: u64,
    pub absorbed: u64,
    pub pings_sent: u64,
    pub reconnects: u32,
    pub outstanding_activities: usize,
}

/// Validates the topic set and converts every topic to its wire form.
///
/// All topics must belong to the adapter's exchange and share one market
/// type; a topic the adapter cannot express fails the whole call.
pub fn open_session(
    adapter: Arc<dyn ExchangeAdapter>,
    topics: impl IntoIterator<Item = UXTopic>,
    credentials: Credentials,
) -> Result<Session, SessionError> {
    let topics: Vec<UXTopic> = topics.into_iter().collect();
    let first = topics.first().ok_or(SessionError::EmptyTopicSet)?;
    if topics
        .iter()
        .any(|t| t.exchange_id != adapter.exchange_id() || t.market_type != first.market_type)
    {
        return Err(SessionError::MixedTopicSet);
    }

    let entries = topics
        .iter()
        .map(|t| adapter.convert_topic(t).map(|desc| (t.clone(), desc)))
        .collect::<Result<Vec<_>, _>>()?;
    let subscriptions = SubscriptionSet::new(entries);

    let login_required = adapter.login_required(&topics);
    let book_feed = match topics.iter().find(|t| t.is_full_orderbook()) {
        Some(topic) => Some(
            adapter
                .book_feed()
                .ok_or_else(|| AdapterError::UnsupportedTopic { topic: topic.clone() })?,
        ),
        None => None,
    };

    let (snapshot_tx, snapshot_rx) = mpsc::channel(16);
    let (state, _) = watch::channel(SessionState::Idle);
    Ok(Session {
        adapter,
        connector: Arc::new(WsConnector),
        credentials,
        settings: Settings::default(),
        subscriptions,
        login_required,
        book_feed,
        mergers: None,
        cancel: CancellationToken::new(),
        state,
        snapshot_tx,
        snapshot_rx,
        generation: 0,
    })
}

/// One websocket session. Owns its subscriptions, pipeline and books; only
/// the adapter and credentials come from outside, read-only.
pub struct Session {
    adapter: Arc<dyn ExchangeAdapter>,
    connector: Arc<dyn Connector>,
    credentials: Credentials,
    settings: Settings,
    subscriptions: SubscriptionSet,
    login_required: bool,
    book_feed: Option<Arc<dyn BookFeed>>,
    /// Kept across connections so published sequences never go backwards.
    mergers: Option<BookMergers>,
    cancel: CancellationToken,
    state: watch::Sender<SessionState>,
    snapshot_tx: mpsc::Sender<Fetched>,
    snapshot_rx: mpsc::Receiver<Fetched>,
    generation: u64,
}

/// REST snapshot result, tagged with the connection that asked for it.
struct Fetched {
    generation: u64,
    instrument: String,
    result: Result<BookSnapshot, CatalogError>,
}

/// State a pipeline stage may touch.
struct LinkContext {
    subscriptions: SubscriptionSet,
    logged_in: bool,
}

struct Keepalive {
    interval: Duration,
    ping: Value,
    ticks: mpsc::Receiver<()>,
    task: AbortHandle,
}

impl Keepalive {
    fn start(policy: KeepalivePolicy, activities: &mut Activities) -> Self {
        let (tx, ticks) = mpsc::channel(1);
        let interval = policy.interval;
        let task = activities.spawn("keepalive", async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if tx.send(()).await.is_err() {
                    break;
                }
            }
        });
        Self { interval, ping: policy.ping, ticks, task }
    }
}

fn start_upkeep(mut upkeep: Upkeep, activities: &mut Activities) -> AbortHandle {
    let interval = upkeep.interval;
    activities.spawn("upkeep", async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match (upkeep.job)().await {
                Ok(()) => debug!("endpoint upkeep done"),
                Err(e) => warn!(error = %e, "endpoint upkeep failed"),
            }
        }
    })
}

/// Per-connection state, rebuilt on every (re)connect.
struct Link {
    transport: Box<dyn Transport>,
    ctx: LinkContext,
    pipeline: Pipeline<LinkContext>,
    mergers: BookMergers,
    inflight: HashSet<String>,
    keepalive: Option<Keepalive>,
    upkeep: Option<AbortHandle>,
    last_rx: Instant,
    phase: SessionState,
    deadline: Option<Instant>,
    generation: u64,
}

impl Link {
    async fn send(&mut self, frame: &Value) -> Result<(), TransportError> {
        // frames may carry signatures; log the shape only
        debug!(op = ?frame.get("op").or_else(|| frame.get("method")), "send");
        self.transport.send(frame.to_string()).await
    }

    async fn shutdown(&mut self) {
        if let Some(keepalive) = self.keepalive.take() {
            keepalive.task.abort();
        }
        if let Some(upkeep) = self.upkeep.take() {
            upkeep.abort();
        }
        match tokio::time::timeout(CLOSE_GRACE, self.transport.close()).await {
            Ok(Err(e)) => debug!(error = %e, "close failed"),
            Err(_) => debug!("close timed out"),
            Ok(Ok(())) => {}
        }
    }
}

/// Why a connection's receive loop ended.
enum Stop {
    Cancelled,
    Lost(String),
    Failed(SessionError),
}

impl From<TransportError> for Stop {
    fn from(e: TransportError) -> Self {
        Stop::Lost(e.to_string())
    }
}

impl From<AdapterError> for Stop {
    fn from(e: AdapterError) -> Self {
        Stop::Failed(fault(e))
    }
}

enum Exit {
    Cancelled,
    Lost { reason: String, streamed: bool },
}

fn fault(e: AdapterError) -> SessionError {
    match e {
        AdapterError::Protocol(msg) => SessionError::Protocol(msg),
        other => SessionError::Adapter(other),
    }
}

impl Session {
    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    /// Cancelling stops the session at its next suspension point.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn topics(&self) -> Vec<UXTopic> {
        self.subscriptions.topics()
    }

    pub fn login_required(&self) -> bool {
        self.login_required
    }

    /// Runs until cancelled (`Ok`) or a fatal fault (`Err`). Either way the
    /// session ends `Terminated` with every background task joined.
    #[instrument(name = "session", skip_all, fields(exchange = %self.adapter.exchange_id()))]
    pub async fn run<H>(mut self, mut handler: H) -> Result<SessionReport, SessionError>
    where
        H: FnMut(Payload) + Send,
    {
        let mut activities = Activities::new();
        let mut report = SessionReport::default();
        let result = self.drive(&mut handler, &mut activities, &mut report).await;

        self.set_state(SessionState::Closing);
        report.outstanding_activities = activities.shutdown().await;
        self.set_state(SessionState::Terminated);

        match &result {
            Ok(()) => info!(?report, "session closed"),
            Err(e) => warn!(error = %e, "session failed"),
        }
        result.map(|()| report)
    }

    fn set_state(&self, state: SessionState) {
        debug!(?state, "session state");
        self.state.send_replace(state);
    }

    fn merger_config(&self) -> MergerConfig {
        let mut config = self
            .book_feed
            .as_ref()
            .map(|feed| feed.merger_config())
            .unwrap_or_default();
        // feeds opt in to buffering; the size is a deployment setting
        if config.backlog > 0 {
            config.backlog = self.settings.session.book_backlog;
        }
        config
    }

    /// Connect / recover loop.
    async fn drive<H>(
        &mut self,
        handler: &mut H,
        activities: &mut Activities,
        report: &mut SessionReport,
    ) -> Result<(), SessionError>
    where
        H: FnMut(Payload) + Send,
    {
        let mut url = format!("{} endpoint", self.adapter.exchange_id());
        let reconnect = self.settings.reconnect.clone();
        let connect_timeout = self.settings.session.connect_timeout();
        let mut failures: u32 = 0;
        let mut last_reason = String::new();

        loop {
            if failures > 0 {
                if failures > reconnect.max_retries {
                    return Err(SessionError::Connection {
                        url,
                        attempts: failures,
                        reason: last_reason,
                    });
                }
                self.set_state(SessionState::Recovering);
                report.reconnects += 1;
                metrics::counter!("uxws_reconnects_total").increment(1);
                let backoff = calculate_backoff(
                    Duration::from_millis(reconnect.initial_backoff_ms),
                    Duration::from_millis(reconnect.max_backoff_ms),
                    failures - 1,
                );
                warn!(
                    attempt = failures,
                    backoff_ms = backoff.as_millis() as u64,
                    reason = %last_reason,
                    "reconnecting"
                );
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Ok(()),
                    _ = sleep(backoff) => {}
                }
            }

            self.set_state(SessionState::Connecting);
            let resolve = self.adapter.resolve_endpoint(&self.subscriptions, &self.credentials);
            let resolved = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                res = resolve => res,
            };
            let endpoint = match resolved {
                Ok(endpoint) => endpoint,
                // REST hiccups are retried like connect failures
                Err(AdapterError::Catalog(CatalogError::Http(e))) => {
                    warn!(error = %e, "endpoint resolution failed");
                    last_reason = e.to_string();
                    failures += 1;
                    continue;
                }
                Err(e) => return Err(fault(e)),
            };
            url.clone_from(&endpoint.url);
            debug!(attempt = failures + 1, "connecting");
            let connect = tokio::time::timeout(connect_timeout, self.connector.connect(&url));
            let attempt = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Ok(()),
                res = connect => res,
            };
            let transport = match attempt {
                Ok(Ok(transport)) => transport,
                Ok(Err(e)) => {
                    warn!(%url, error = %e, "connect failed");
                    last_reason = e.to_string();
                    failures += 1;
                    continue;
                }
                Err(_) => {
                    last_reason = TransportError::Timeout(connect_timeout).to_string();
                    warn!(%url, reason = %last_reason, "connect failed");
                    failures += 1;
                    continue;
                }
            };

            match self.run_connection(transport, endpoint, handler, activities, report).await? {
                Exit::Cancelled => return Ok(()),
                Exit::Lost { reason, streamed } => {
                    warn!(%reason, "transport lost");
                    // a connection that made it to streaming resets the budget
                    failures = if streamed { 1 } else { failures + 1 };
                    last_reason = reason;
                }
            }
        }
    }

    async fn run_connection<H>(
        &mut self,
        transport: Box<dyn Transport>,
        endpoint: Endpoint,
        handler: &mut H,
        activities: &mut Activities,
        report: &mut SessionReport,
    ) -> Result<Exit, SessionError>
    where
        H: FnMut(Payload) + Send,
    {
        self.generation += 1;
        let mut mergers = match self.mergers.take() {
            Some(mergers) => mergers,
            None => BookMergers::new(self.merger_config()),
        };
        mergers.resync_all();
        let mut link = Link {
            transport,
            ctx: LinkContext { subscriptions: self.subscriptions.clone(), logged_in: false },
            pipeline: Pipeline::new(),
            mergers,
            inflight: HashSet::new(),
            keepalive: None,
            upkeep: endpoint.upkeep.map(|upkeep| start_upkeep(upkeep, activities)),
            last_rx: Instant::now(),
            phase: SessionState::Connecting,
            deadline: None,
            generation: self.generation,
        };

        let stop = match self.converse(&mut link, handler, activities, report).await {
            Ok(never) => match never {},
            Err(stop) => stop,
        };
        let streamed = link.phase == SessionState::Streaming;
        link.shutdown().await;
        self.mergers = Some(link.mergers);

        match stop {
            Stop::Cancelled => Ok(Exit::Cancelled),
            Stop::Lost(reason) => Ok(Exit::Lost { reason, streamed }),
            Stop::Failed(e) => Err(e),
        }
    }

    /// Receive loop for one connection. Only ever returns through `Err`.
    async fn converse<H>(
        &mut self,
        link: &mut Link,
        handler: &mut H,
        activities: &mut Activities,
        report: &mut SessionReport,
    ) -> Result<Infallible, Stop>
    where
        H: FnMut(Payload) + Send,
    {
        if self.login_required {
            self.begin_login(link).await?;
        } else {
            self.begin_subscribing(link).await?;
        }

        loop {
            if link.phase == SessionState::Authenticating && link.ctx.logged_in {
                info!("logged in");
                self.begin_subscribing(link).await?;
            }
            if link.phase == SessionState::Subscribing && link.ctx.subscriptions.is_settled() {
                self.begin_streaming(link, activities);
            }

            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Stop::Cancelled),
                _ = wait_until(link.deadline) => return Err(Stop::Failed(self.phase_timeout(link))),
                Some(()) = next_tick(&mut link.keepalive) => on_tick(link, report).await?,
                Some(fetched) = self.snapshot_rx.recv() => {
                    self.on_snapshot(link, fetched, handler, report);
                }
                _ = activities.reap(), if !activities.is_empty() => {}
                frame = link.transport.recv() => match frame? {
                    Some(text) => self.on_frame(link, &text, handler, activities, report)?,
                    None => return Err(Stop::Lost("connection closed by peer".into())),
                },
            }
        }
    }

    async fn begin_login(&self, link: &mut Link) -> Result<(), Stop> {
        link.phase = SessionState::Authenticating;
        self.set_state(link.phase);
        link.pipeline.install(login_stage(self.adapter.clone()));
        let frames = self.adapter.login_command(&self.credentials)?;
        if frames.is_empty() {
            debug!("authenticated by endpoint");
            link.ctx.logged_in = true;
            return Ok(());
        }
        for frame in frames {
            link.send(&frame).await?;
        }
        link.deadline = Some(Instant::now() + self.settings.session.login_timeout());
        Ok(())
    }

    async fn begin_subscribing(&self, link: &mut Link) -> Result<(), Stop> {
        link.phase = SessionState::Subscribing;
        self.set_state(link.phase);
        if self.adapter.subscribes_via_endpoint() {
            link.ctx.subscriptions.confirm_all();
            link.deadline = None;
            return Ok(());
        }
        link.pipeline.install(subscribe_stage(self.adapter.clone()));
        for command in self.adapter.subscribe_commands(&link.ctx.subscriptions) {
            link.send(&command).await?;
        }
        link.deadline = Some(Instant::now() + self.settings.session.subscribe_timeout());
        Ok(())
    }

    fn begin_streaming(&self, link: &mut Link, activities: &mut Activities) {
        link.phase = SessionState::Streaming;
        link.deadline = None;
        self.set_state(link.phase);
        link.pipeline.install(error_stage(self.adapter.clone()));
        link.pipeline.install(keepalive_stage(self.adapter.clone()));
        if let Some(policy) = self.adapter.keepalive_policy() {
            link.keepalive = Some(Keepalive::start(policy, activities));
        }
        info!(
            topics = link.ctx.subscriptions.len(),
            stages = ?link.pipeline.stage_names(),
            "streaming"
        );
    }

    fn phase_timeout(&self, link: &Link) -> SessionError {
        let pending = link.ctx.subscriptions.pending();
        match link.phase {
            SessionState::Authenticating => SessionError::AuthenticationTimeout {
                timeout: self.settings.session.login_timeout(),
                pending,
            },
            _ => SessionError::SubscriptionTimeout {
                timeout: self.settings.session.subscribe_timeout(),
                pending,
            },
        }
    }

    fn on_frame<H>(
        &self,
        link: &mut Link,
        text: &str,
        handler: &mut H,
        activities: &mut Activities,
        report: &mut SessionReport,
    ) -> Result<(), Stop>
    where
        H: FnMut(Payload) + Send,
    {
        link.last_rx = Instant::now();
        report.received += 1;
        metrics::counter!("uxws_messages_received_total").increment(1);

        let msg = self.adapter.decode(text);
        match link.pipeline.process(msg, &mut link.ctx)? {
            Interception::Absorbed => report.absorbed += 1,
            Interception::Forward(msg) => self.deliver(link, msg, handler, activities, report),
        }
        Ok(())
    }

    fn deliver<H>(
        &self,
        link: &mut Link,
        msg: Value,
        handler: &mut H,
        activities: &mut Activities,
        report: &mut SessionReport,
    ) where
        H: FnMut(Payload) + Send,
    {
        let Some(feed) = &self.book_feed else {
            return emit(handler, report, Payload::Raw(msg));
        };
        let book_msg = match feed.parse(&msg) {
            Ok(Some(book_msg)) => book_msg,
            Ok(None) => return emit(handler, report, Payload::Raw(msg)),
            Err(e) => {
                // the next diff will not chain and forces a resync
                warn!(error = %e, "dropping malformed book message");
                return;
            }
        };

        let instrument = book_msg.instrument().to_string();
        if let MergeOutcome::Ready(book) = link.mergers.apply(book_msg) {
            emit(handler, report, Payload::Book(book));
        }
        if link.mergers.needs_snapshot(&instrument) {
            self.request_snapshot(link, &instrument, activities);
        }
    }

    fn request_snapshot(&self, link: &mut Link, instrument: &str, activities: &mut Activities) {
        if link.inflight.contains(instrument) {
            return;
        }
        let Some(first) = self.adapter.snapshot_request(instrument) else {
            return;
        };
        link.inflight.insert(instrument.to_string());
        debug!(instrument, "requesting snapshot");

        let adapter = self.adapter.clone();
        let tx = self.snapshot_tx.clone();
        let retries = self.settings.session.snapshot_retries;
        let generation = link.generation;
        let instrument = instrument.to_string();
        activities.spawn("snapshot", async move {
            let result = fetch_snapshot(first, adapter.as_ref(), &instrument, retries).await;
            let _ = tx.send(Fetched { generation, instrument, result }).await;
        });
    }

    fn on_snapshot<H>(
        &self,
        link: &mut Link,
        fetched: Fetched,
        handler: &mut H,
        report: &mut SessionReport,
    ) where
        H: FnMut(Payload) + Send,
    {
        if fetched.generation != link.generation {
            debug!(instrument = %fetched.instrument, "snapshot for a previous connection");
            return;
        }
        link.inflight.remove(&fetched.instrument);
        match fetched.result {
            Ok(snapshot) => {
                info!(instrument = %snapshot.instrument, sequence = snapshot.sequence, "snapshot loaded");
                if let MergeOutcome::Ready(book) = link.mergers.apply(BookMessage::Snapshot(snapshot)) {
                    emit(handler, report, Payload::Book(book));
                }
            }
            Err(e) => warn!(
                instrument = %fetched.instrument,
                error = %e,
                "snapshot fetch failed, retrying on next diff"
            ),
        }
    }
}

fn emit<H: FnMut(Payload)>(handler: &mut H, report: &mut SessionReport, payload: Payload) {
    report.delivered += 1;
    metrics::counter!("uxws_messages_delivered_total").increment(1);
    handler(payload);
}

async fn on_tick(link: &mut Link, report: &mut SessionReport) -> Result<(), Stop> {
    let Some(keepalive) = &link.keepalive else {
        return Ok(());
    };
    if link.last_rx.elapsed() < keepalive.interval {
        return Ok(());
    }
    let ping = keepalive.ping.clone();
    link.send(&ping).await?;
    report.pings_sent += 1;
    metrics::counter!("uxws_pings_sent_total").increment(1);
    Ok(())
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}

async fn next_tick(keepalive: &mut Option<Keepalive>) -> Option<()> {
    match keepalive {
        Some(k) => k.ticks.recv().await,
        None => std::future::pending().await,
    }
}

async fn fetch_snapshot(
    first: SnapshotFuture,
    adapter: &dyn ExchangeAdapter,
    instrument: &str,
    retries: u32,
) -> Result<BookSnapshot, CatalogError> {
    let mut request = first;
    let mut attempt = 0;
    loop {
        match request.await {
            Ok(snapshot) => return Ok(snapshot),
            Err(e) if attempt < retries => {
                warn!(instrument, attempt, error = %e, "snapshot fetch failed");
                sleep(calculate_backoff(SNAPSHOT_BACKOFF, SNAPSHOT_BACKOFF_MAX, attempt)).await;
                attempt += 1;
                request = match adapter.snapshot_request(instrument) {
                    Some(next) => next,
                    None => return Err(e),
                };
            }
            Err(e) => return Err(e),
        }
    }
}

fn login_stage(adapter: Arc<dyn ExchangeAdapter>) -> impl Interceptor<LinkContext> {
    FnInterceptor::new(
        "login",
        move |msg: Value, ctx: &mut LinkContext| -> Result<Interception, AdapterError> {
            if ctx.logged_in {
                return Ok(Interception::Forward(msg));
            }
            let out = adapter.on_login_message(msg)?;
            if out == Interception::Absorbed {
                ctx.logged_in = true;
            }
            Ok(out)
        },
    )
}

fn subscribe_stage(adapter: Arc<dyn ExchangeAdapter>) -> impl Interceptor<LinkContext> {
    FnInterceptor::new(
        "subscribe",
        move |msg: Value, ctx: &mut LinkContext| -> Result<Interception, AdapterError> {
            adapter.on_subscribe_message(msg, &mut ctx.subscriptions)
        },
    )
}

fn error_stage(adapter: Arc<dyn ExchangeAdapter>) -> impl Interceptor<LinkContext> {
    FnInterceptor::new(
        "error",
        move |msg: Value, _: &mut LinkContext| -> Result<Interception, AdapterError> {
            adapter.on_error_message(msg)
        },
    )
}

fn keepalive_stage(adapter: Arc<dyn ExchangeAdapter>) -> impl Interceptor<LinkContext> {
    FnInterceptor::new(
        "keepalive",
        move |msg: Value, _: &mut LinkContext| -> Result<Interception, AdapterError> {
            Ok(adapter.on_keepalive_message(msg))
        },
    )
}
