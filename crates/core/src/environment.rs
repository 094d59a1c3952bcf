//! Environment capabilities consumed by the tracker.
//!
//! Every capability is optional. A browser-like host injects a page context,
//! beacon sender, per-tab storage, resource-timing feed and visibility signal;
//! a server host usually provides only an HTTP sender and the system clock.
//! Components check for `None` and degrade instead of failing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use crate::error::PulseResult;

/// Read access to the current page, when running inside one.
pub trait PageContext: Send + Sync {
    fn url(&self) -> Option<String>;
    fn referrer(&self) -> Option<String>;
    fn user_agent(&self) -> Option<String>;
}

/// Non-blocking send primitive that survives page teardown.
pub trait BeaconSender: Send + Sync {
    /// `Ok(false)` means the mechanism refused the payload (too large, blocked).
    fn send_beacon(&self, url: &str, body: &str) -> anyhow::Result<bool>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialsMode {
    Omit,
    SameOrigin,
    Include,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpRequest {
    pub url: String,
    pub body: String,
    pub headers: Vec<(String, String)>,
    /// Ask the host to keep the request alive past page teardown.
    pub keepalive: bool,
    pub credentials: CredentialsMode,
}

impl HttpRequest {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
}

impl HttpResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Asynchronous network request primitive.
#[async_trait]
pub trait HttpSender: Send + Sync {
    async fn post(&self, request: HttpRequest) -> anyhow::Result<HttpResponse>;
}

/// Per-tab persistent key/value storage.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>>;
    fn set(&self, key: &str, value: &str) -> anyhow::Result<()>;
}

/// One raw resource-timing observation as reported by the host.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceTiming {
    pub name: String,
    pub initiator_type: Option<String>,
    pub transfer_size: Option<u64>,
    pub encoded_body_size: Option<u64>,
    pub decoded_body_size: Option<u64>,
    pub duration: Option<f64>,
    pub start_time: Option<f64>,
}

/// Passive resource-timing observation. A subscription receives entries that
/// were buffered before it started, then live entries. Closing the receiver
/// unsubscribes.
pub trait ResourceTimingSource: Send + Sync {
    fn subscribe(&self) -> anyhow::Result<mpsc::UnboundedReceiver<ResourceTiming>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visibility {
    Visible,
    Hidden,
}

pub trait VisibilitySource: Send + Sync {
    fn watch(&self) -> watch::Receiver<Visibility>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Injected capability set. Absence of a capability is `None`.
#[derive(Clone)]
pub struct Capabilities {
    pub page: Option<Arc<dyn PageContext>>,
    pub beacon: Option<Arc<dyn BeaconSender>>,
    pub http: Option<Arc<dyn HttpSender>>,
    pub session_storage: Option<Arc<dyn KeyValueStore>>,
    pub resource_timing: Option<Arc<dyn ResourceTimingSource>>,
    pub visibility: Option<Arc<dyn VisibilitySource>>,
    pub clock: Arc<dyn Clock>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self::none()
    }
}

impl Capabilities {
    /// No capabilities at all; only the system clock.
    pub fn none() -> Self {
        Self {
            page: None,
            beacon: None,
            http: None,
            session_storage: None,
            resource_timing: None,
            visibility: None,
            clock: Arc::new(SystemClock),
        }
    }

    /// Server execution context: HTTP delivery through `reqwest`.
    pub fn server() -> PulseResult<Self> {
        Ok(Self::none().with_http(Arc::new(ReqwestSender::new()?)))
    }

    pub fn with_page(mut self, page: Arc<dyn PageContext>) -> Self {
        self.page = Some(page);
        self
    }

    pub fn with_beacon(mut self, beacon: Arc<dyn BeaconSender>) -> Self {
        self.beacon = Some(beacon);
        self
    }

    pub fn with_http(mut self, http: Arc<dyn HttpSender>) -> Self {
        self.http = Some(http);
        self
    }

    pub fn with_session_storage(mut self, store: Arc<dyn KeyValueStore>) -> Self {
        self.session_storage = Some(store);
        self
    }

    pub fn with_resource_timing(mut self, source: Arc<dyn ResourceTimingSource>) -> Self {
        self.resource_timing = Some(source);
        self
    }

    pub fn with_visibility(mut self, source: Arc<dyn VisibilitySource>) -> Self {
        self.visibility = Some(source);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn has_page(&self) -> bool {
        self.page.is_some()
    }
}

// ─── In-process implementations ─────────────────────────────────────────────

/// Fixed page snapshot, for embedding hosts and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticPage {
    pub url: Option<String>,
    pub referrer: Option<String>,
    pub user_agent: Option<String>,
}

impl StaticPage {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: Some(url.into()),
            ..Default::default()
        }
    }

    pub fn with_referrer(mut self, referrer: impl Into<String>) -> Self {
        self.referrer = Some(referrer.into());
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }
}

impl PageContext for StaticPage {
    fn url(&self) -> Option<String> {
        self.url.clone()
    }

    fn referrer(&self) -> Option<String> {
        self.referrer.clone()
    }

    fn user_agent(&self) -> Option<String> {
        self.user_agent.clone()
    }
}

/// Process-local key/value store.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: DashMap<String, String>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remove(&self, key: &str) {
        self.entries.remove(key);
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> anyhow::Result<Option<String>> {
        Ok(self.entries.get(key).map(|v| v.value().clone()))
    }

    fn set(&self, key: &str, value: &str) -> anyhow::Result<()> {
        self.entries.insert(key.to_string(), value.to_string());
        Ok(())
    }
}

const DEFAULT_TIMING_BUFFER: usize = 250;

/// Resource-timing hub. Hosts push observations with [`ResourceTimingFeed::record`];
/// entries recorded before anyone subscribes are replayed to new subscribers.
pub struct ResourceTimingFeed {
    inner: Mutex<FeedInner>,
    buffer_limit: usize,
}

struct FeedInner {
    buffered: Vec<ResourceTiming>,
    subscribers: Vec<mpsc::UnboundedSender<ResourceTiming>>,
}

impl Default for ResourceTimingFeed {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceTimingFeed {
    pub fn new() -> Self {
        Self::with_buffer_limit(DEFAULT_TIMING_BUFFER)
    }

    pub fn with_buffer_limit(buffer_limit: usize) -> Self {
        Self {
            inner: Mutex::new(FeedInner {
                buffered: Vec::new(),
                subscribers: Vec::new(),
            }),
            buffer_limit,
        }
    }

    pub fn record(&self, entry: ResourceTiming) {
        let mut inner = self.inner.lock();
        if inner.buffered.len() < self.buffer_limit {
            inner.buffered.push(entry.clone());
        }
        inner
            .subscribers
            .retain(|tx| tx.send(entry.clone()).is_ok());
    }

    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }
}

impl ResourceTimingSource for ResourceTimingFeed {
    fn subscribe(&self) -> anyhow::Result<mpsc::UnboundedReceiver<ResourceTiming>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        for entry in &inner.buffered {
            tx.send(entry.clone())?;
        }
        inner.subscribers.push(tx);
        Ok(rx)
    }
}

/// Page visibility signal backed by a `watch` channel.
pub struct VisibilitySignal {
    tx: watch::Sender<Visibility>,
}

impl Default for VisibilitySignal {
    fn default() -> Self {
        Self::new()
    }
}

impl VisibilitySignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(Visibility::Visible);
        Self { tx }
    }

    pub fn set(&self, visibility: Visibility) {
        self.tx.send_replace(visibility);
    }

    pub fn current(&self) -> Visibility {
        *self.tx.borrow()
    }
}

impl VisibilitySource for VisibilitySignal {
    fn watch(&self) -> watch::Receiver<Visibility> {
        self.tx.subscribe()
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Settable clock for simulating inactivity.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: chrono::Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, at: DateTime<Utc>) {
        *self.now.lock() = at;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock()
    }
}

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// Server-side HTTP delivery.
pub struct ReqwestSender {
    client: reqwest::Client,
}

impl ReqwestSender {
    pub fn new() -> PulseResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(HTTP_TIMEOUT)
            .user_agent(concat!("pulse/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpSender for ReqwestSender {
    async fn post(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        // keepalive and credential mode are browser fetch hints; a server
        // client never attaches ambient cookies.
        let mut builder = self.client.post(&request.url).body(request.body);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        let response = builder.send().await?;
        Ok(HttpResponse {
            status: response.status().as_u16(),
        })
    }
}
