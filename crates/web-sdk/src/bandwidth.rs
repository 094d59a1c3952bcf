//! Bandwidth batcher: passively observes resource-timing entries, buffers
//! them and flushes batches on a timer, when the buffer fills up, and when the
//! page becomes hidden.
//!
//! A background task owns the buffer. It runs a `select!` loop over the
//! timing feed, the flush interval, the visibility signal and a command
//! channel. `stop` closes the feed, drains entries already delivered, and
//! performs one final flush.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use pulse_core::config::{BandwidthConfig, MAX_FLUSH_INTERVAL_MS};
use pulse_core::environment::{
    Capabilities, ResourceTiming, ResourceTimingSource, Visibility, VisibilitySource,
};
use pulse_core::types::{BandwidthBatchPayload, BandwidthEntry};
use tokio::runtime::Handle;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::pipeline::Pipeline;
use crate::sanitize::sanitize_resource_url;
use crate::user_agent::classify;

const DEFAULT_RESOURCE_TYPE: &str = "other";
const INITIAL_BUFFER_CAPACITY: usize = 64;

/// FIFO buffer of observed entries, drained at most `max_batch_size` at a time.
#[derive(Debug)]
pub struct BandwidthBuffer {
    entries: VecDeque<BandwidthEntry>,
    max_batch_size: usize,
}

impl BandwidthBuffer {
    pub fn new(max_batch_size: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_batch_size.min(INITIAL_BUFFER_CAPACITY)),
            max_batch_size: max_batch_size.max(1),
        }
    }

    /// Append an entry; returns `true` once the buffer holds a full batch.
    pub fn push(&mut self, entry: BandwidthEntry) -> bool {
        self.entries.push_back(entry);
        self.entries.len() >= self.max_batch_size
    }

    /// Remove and return up to `max_batch_size` entries from the front.
    pub fn take_batch(&mut self) -> Vec<BandwidthEntry> {
        let n = self.entries.len().min(self.max_batch_size);
        self.entries.drain(..n).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Normalize one raw observation. Returns `None` when the allow-list rejects it.
pub fn normalize_entry(config: &BandwidthConfig, timing: ResourceTiming) -> Option<BandwidthEntry> {
    let resource_type = timing
        .initiator_type
        .filter(|t| !t.is_empty())
        .unwrap_or_else(|| DEFAULT_RESOURCE_TYPE.to_string());

    if !config.allows(&resource_type) {
        return None;
    }

    let url = if config.sanitize_urls {
        sanitize_resource_url(&timing.name).unwrap_or_default()
    } else {
        timing.name
    };

    Some(BandwidthEntry {
        url,
        resource_type,
        transfer_size: timing.transfer_size.unwrap_or(0),
        encoded_body_size: timing.encoded_body_size.unwrap_or(0),
        decoded_body_size: timing.decoded_body_size.unwrap_or(0),
        duration: timing.duration.unwrap_or(0.0),
        start_time: timing.start_time.unwrap_or(0.0),
    })
}

enum Command {
    Flush,
    Stop,
}

struct ActiveHandle {
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

pub struct BandwidthBatcher {
    config: BandwidthConfig,
    pipeline: Arc<Pipeline>,
    source: Option<Arc<dyn ResourceTimingSource>>,
    visibility: Option<Arc<dyn VisibilitySource>>,
    active: Mutex<Option<ActiveHandle>>,
    stopped: AtomicBool,
}

impl BandwidthBatcher {
    pub fn new(config: BandwidthConfig, pipeline: Arc<Pipeline>, capabilities: &Capabilities) -> Self {
        Self {
            config,
            pipeline,
            source: capabilities.resource_timing.clone(),
            visibility: capabilities.visibility.clone(),
            active: Mutex::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &BandwidthConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.active.lock().is_some()
    }

    /// Begin observing. Stays idle when the environment cannot observe
    /// resource timing or no async runtime is running.
    pub fn start(&self) -> bool {
        let mut active = self.active.lock();
        if active.is_some() {
            return true;
        }
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }

        let debug_mode = self.pipeline.reporter().debug();
        let Some(source) = &self.source else {
            if debug_mode {
                debug!("resource timing not supported; bandwidth tracking disabled");
            }
            return false;
        };
        let Ok(runtime) = Handle::try_current() else {
            if debug_mode {
                debug!("no async runtime; bandwidth tracking disabled");
            }
            return false;
        };
        let feed = match source.subscribe() {
            Ok(feed) => feed,
            Err(e) => {
                if debug_mode {
                    debug!(error = %e, "resource timing subscription failed");
                }
                return false;
            }
        };

        let (commands, command_rx) = mpsc::unbounded_channel();
        let worker = BatchWorker {
            config: self.config.clone(),
            pipeline: Arc::clone(&self.pipeline),
            buffer: BandwidthBuffer::new(self.config.max_batch_size),
        };
        let visibility = self.visibility.as_ref().map(|v| v.watch());
        let task = runtime.spawn(worker.run(feed, command_rx, visibility));

        info!(
            flush_interval_ms = self.config.flush_interval_ms,
            max_batch_size = self.config.max_batch_size,
            resource_types = ?self.config.resource_types,
            "bandwidth tracking started"
        );

        *active = Some(ActiveHandle { commands, task });
        true
    }

    /// Ask the background task to flush now. No-op while idle.
    pub fn flush_now(&self) {
        if let Some(active) = self.active.lock().as_ref() {
            let _ = active.commands.send(Command::Flush);
        }
    }

    /// Stop observing and flush what is left. Terminal and idempotent.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        let Some(active) = self.active.lock().take() else {
            return;
        };

        let _ = active.commands.send(Command::Stop);
        if let Err(e) = active.task.await {
            warn!(error = %e, "bandwidth task ended abnormally");
        }
        info!("bandwidth tracking stopped");
    }
}

struct BatchWorker {
    config: BandwidthConfig,
    pipeline: Arc<Pipeline>,
    buffer: BandwidthBuffer,
}

impl BatchWorker {
    async fn run(
        mut self,
        mut feed: mpsc::UnboundedReceiver<ResourceTiming>,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut visibility: Option<watch::Receiver<Visibility>>,
    ) {
        let period_ms = self.config.flush_interval_ms.clamp(1, MAX_FLUSH_INTERVAL_MS);
        let period = Duration::from_millis(period_ms);
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut feed_open = true;

        loop {
            tokio::select! {
                timing = feed.recv(), if feed_open => match timing {
                    Some(timing) => self.observe(timing),
                    None => feed_open = false,
                },
                _ = interval.tick() => self.flush(),
                state = next_visibility(&mut visibility) => {
                    if state == Visibility::Hidden {
                        debug!("page hidden, flushing bandwidth buffer");
                        self.absorb_pending(&mut feed);
                        self.flush();
                    }
                }
                command = commands.recv() => match command {
                    Some(Command::Flush) => {
                        self.absorb_pending(&mut feed);
                        self.flush();
                    }
                    Some(Command::Stop) | None => break,
                },
            }
        }

        feed.close();
        self.absorb_pending(&mut feed);
        self.flush();
    }

    /// Observe everything already delivered to the feed without waiting.
    fn absorb_pending(&mut self, feed: &mut mpsc::UnboundedReceiver<ResourceTiming>) {
        while let Ok(timing) = feed.try_recv() {
            self.observe(timing);
        }
    }

    fn observe(&mut self, timing: ResourceTiming) {
        let Some(entry) = normalize_entry(&self.config, timing) else {
            return;
        };
        metrics::counter!("pulse.bandwidth.entries").increment(1);
        if self.buffer.push(entry) {
            self.flush();
        }
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            return;
        }

        let entries = self.buffer.take_batch();
        let total_transfer_size = entries.iter().map(|e| e.transfer_size).sum();
        let user_agent = self.pipeline.user_agent().map(|ua| classify(&ua));
        let timestamp = self.pipeline.timestamp();

        let payload = BandwidthBatchPayload {
            entry_count: entries.len(),
            entries,
            total_transfer_size,
            user_agent,
            context: self.pipeline.context(),
            session_id: self.pipeline.session_id(),
            timestamp_iso: timestamp.iso_string(),
            timestamp_ms: timestamp.millis(),
            project_id: self.pipeline.project_id().to_string(),
            credentials: self.pipeline.credentials(),
        };

        debug!(
            count = payload.entry_count,
            total_transfer_size = payload.total_transfer_size,
            remaining = self.buffer.len(),
            "flushing bandwidth batch"
        );

        if self.pipeline.transport().send_bandwidth(&payload) {
            metrics::counter!("pulse.bandwidth.flushed").increment(payload.entry_count as u64);
        }
    }
}

async fn next_visibility(rx: &mut Option<watch::Receiver<Visibility>>) -> Visibility {
    loop {
        let Some(receiver) = rx.as_mut() else {
            return std::future::pending().await;
        };
        if receiver.changed().await.is_err() {
            *rx = None;
            continue;
        }
        return *receiver.borrow_and_update();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pulse_core::capture::CaptureBeacon;
    use pulse_core::config::TrackerConfig;
    use pulse_core::environment::{ResourceTimingFeed, StaticPage, VisibilitySignal};
    use pulse_core::ErrorReporter;

    fn entry(i: usize) -> BandwidthEntry {
        BandwidthEntry {
            url: format!("https://cdn.example.com/{i}.js"),
            resource_type: "script".into(),
            transfer_size: 100,
            encoded_body_size: 90,
            decoded_body_size: 300,
            duration: 12.5,
            start_time: i as f64,
        }
    }

    fn timing(i: usize, initiator: Option<&str>) -> ResourceTiming {
        ResourceTiming {
            name: format!("https://cdn.example.com/{i}.js?v={i}&sig=abc#x"),
            initiator_type: initiator.map(String::from),
            transfer_size: Some(1000 + i as u64),
            encoded_body_size: Some(900),
            decoded_body_size: None,
            duration: Some(20.0),
            start_time: Some(i as f64),
        }
    }

    fn config(max_batch_size: usize, resource_types: &[&str]) -> BandwidthConfig {
        BandwidthConfig {
            max_batch_size,
            flush_interval_ms: 60_000,
            resource_types: resource_types.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        }
    }

    fn batcher(cfg: BandwidthConfig, caps: &Capabilities) -> BandwidthBatcher {
        let pipeline = Arc::new(Pipeline::new(
            &TrackerConfig::new("p1"),
            caps,
            ErrorReporter::default(),
        ));
        BandwidthBatcher::new(cfg, pipeline, caps)
    }

    fn batch_urls(beacon: &CaptureBeacon) -> Vec<Vec<String>> {
        beacon
            .bodies()
            .iter()
            .map(|b| {
                b["entries"]
                    .as_array()
                    .unwrap()
                    .iter()
                    .map(|e| e["url"].as_str().unwrap().to_string())
                    .collect()
            })
            .collect()
    }

    async fn wait_for_batches(beacon: &CaptureBeacon, n: usize) {
        for _ in 0..200 {
            if beacon.count() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[test]
    fn test_buffer_drains_up_to_cap_in_order() {
        let mut buffer = BandwidthBuffer::new(3);
        for i in 0..5 {
            buffer.push(entry(i));
        }
        let first = buffer.take_batch();
        assert_eq!(first.len(), 3);
        assert_eq!(
            first.iter().map(|e| e.start_time as usize).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(buffer.len(), 2);
        let second = buffer.take_batch();
        assert_eq!(
            second.iter().map(|e| e.start_time as usize).collect::<Vec<_>>(),
            vec![3, 4]
        );
        assert!(buffer.is_empty());
        assert!(buffer.take_batch().is_empty());
    }

    #[test]
    fn test_huge_batch_size_does_not_preallocate() {
        let mut buffer = BandwidthBuffer::new(usize::MAX);
        assert!(!buffer.push(entry(0)));
        assert_eq!(buffer.take_batch().len(), 1);
    }

    #[test]
    fn test_push_signals_full_batch() {
        let mut buffer = BandwidthBuffer::new(2);
        assert!(!buffer.push(entry(0)));
        assert!(buffer.push(entry(1)));
    }

    #[test]
    fn test_normalize_defaults_and_sanitizes() {
        let normalized = normalize_entry(&config(10, &[]), timing(7, None)).unwrap();
        assert_eq!(normalized.resource_type, "other");
        assert_eq!(normalized.url, "https://cdn.example.com/7.js");
        assert_eq!(normalized.decoded_body_size, 0);
        assert_eq!(normalized.transfer_size, 1007);

        let raw = BandwidthConfig {
            sanitize_urls: false,
            ..config(10, &[])
        };
        let kept = normalize_entry(&raw, timing(7, Some("script"))).unwrap();
        assert!(kept.url.contains("sig=abc"));
    }

    #[test]
    fn test_normalize_applies_allow_list() {
        let cfg = config(10, &["img"]);
        assert!(normalize_entry(&cfg, timing(1, Some("script"))).is_none());
        assert!(normalize_entry(&cfg, timing(1, Some("img"))).is_some());
        assert!(normalize_entry(&cfg, timing(1, None)).is_none());
    }

    #[test]
    fn test_stays_idle_without_resource_timing() {
        let caps = Capabilities::none().with_beacon(CaptureBeacon::accepting());
        let b = batcher(config(5, &[]), &caps);
        assert!(!b.start());
        assert!(!b.is_active());
    }

    #[tokio::test]
    async fn test_auto_flush_and_final_flush_preserve_order() {
        let feed = Arc::new(ResourceTimingFeed::new());
        let beacon = CaptureBeacon::accepting();
        let caps = Capabilities::none()
            .with_beacon(beacon.clone())
            .with_resource_timing(feed.clone());

        // Recorded before start: replayed to the subscription.
        for i in 0..7 {
            feed.record(timing(i, Some("script")));
        }

        let b = batcher(config(3, &[]), &caps);
        assert!(b.start());
        assert!(b.is_active());
        wait_for_batches(&beacon, 2).await;
        assert_eq!(beacon.count(), 2);

        b.stop().await;
        assert!(!b.is_active());

        let batches = batch_urls(&beacon);
        assert_eq!(batches.iter().map(Vec::len).collect::<Vec<_>>(), vec![3, 3, 1]);
        let flat: Vec<String> = batches.into_iter().flatten().collect();
        let expected: Vec<String> = (0..7)
            .map(|i| format!("https://cdn.example.com/{i}.js"))
            .collect();
        assert_eq!(flat, expected);

        let first = &beacon.bodies()[0];
        assert_eq!(first["entryCount"], 3);
        assert_eq!(first["totalTransferSize"], 1000 + 1001 + 1002);
        assert_eq!(first["projectId"], "p1");
        assert_eq!(beacon.sent()[0].0, "https://collect.pulse-analytics.io/api/v1/events/bandwidth");
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_terminal() {
        let feed = Arc::new(ResourceTimingFeed::new());
        let beacon = CaptureBeacon::accepting();
        let caps = Capabilities::none()
            .with_beacon(beacon.clone())
            .with_resource_timing(feed.clone());

        let b = batcher(config(10, &[]), &caps);
        assert!(b.start());
        feed.record(timing(1, Some("img")));
        b.stop().await;
        b.stop().await;
        assert_eq!(beacon.count(), 1);
        assert_eq!(feed.subscriber_count(), 0);
        assert!(!b.start());
    }

    #[tokio::test]
    async fn test_filtered_entries_are_never_sent() {
        let feed = Arc::new(ResourceTimingFeed::new());
        let beacon = CaptureBeacon::accepting();
        let caps = Capabilities::none()
            .with_beacon(beacon.clone())
            .with_resource_timing(feed.clone());

        let b = batcher(config(10, &["img"]), &caps);
        assert!(b.start());
        feed.record(timing(1, Some("script")));
        feed.record(timing(2, Some("img")));
        feed.record(timing(3, Some("css")));
        b.stop().await;

        let batches = batch_urls(&beacon);
        assert_eq!(batches, vec![vec!["https://cdn.example.com/2.js".to_string()]]);
    }

    #[tokio::test]
    async fn test_hidden_page_triggers_flush() {
        let feed = Arc::new(ResourceTimingFeed::new());
        let visibility = Arc::new(VisibilitySignal::new());
        let beacon = CaptureBeacon::accepting();
        let caps = Capabilities::none()
            .with_beacon(beacon.clone())
            .with_resource_timing(feed.clone())
            .with_visibility(visibility.clone());

        let b = batcher(config(10, &[]), &caps);
        assert!(b.start());
        feed.record(timing(1, Some("img")));
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(beacon.count(), 0);

        visibility.set(Visibility::Hidden);
        wait_for_batches(&beacon, 1).await;
        assert_eq!(beacon.count(), 1);
        b.stop().await;
        assert_eq!(beacon.count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_periodic_flush() {
        let feed = Arc::new(ResourceTimingFeed::new());
        let beacon = CaptureBeacon::accepting();
        let caps = Capabilities::none()
            .with_beacon(beacon.clone())
            .with_resource_timing(feed.clone());

        let cfg = BandwidthConfig {
            flush_interval_ms: 1_000,
            ..config(10, &[])
        };
        let b = batcher(cfg, &caps);
        assert!(b.start());
        feed.record(timing(1, Some("img")));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert_eq!(beacon.count(), 0);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(beacon.count(), 1);

        // Empty buffer: the next tick sends nothing.
        tokio::time::sleep(Duration::from_millis(1_000)).await;
        assert_eq!(beacon.count(), 1);
        b.stop().await;
    }

    #[tokio::test]
    async fn test_parsed_user_agent_attached() {
        let feed = Arc::new(ResourceTimingFeed::new());
        let beacon = CaptureBeacon::accepting();
        let page = StaticPage::new("https://shop.example.com/")
            .with_user_agent("Mozilla/5.0 (iPhone; CPU iPhone OS 17_2 like Mac OS X) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.2 Mobile/15E148 Safari/604.1");
        let caps = Capabilities::none()
            .with_page(Arc::new(page))
            .with_beacon(beacon.clone())
            .with_resource_timing(feed.clone());

        let b = batcher(config(10, &[]), &caps);
        assert!(b.start());
        feed.record(timing(1, Some("img")));
        b.flush_now();
        wait_for_batches(&beacon, 1).await;

        let body = &beacon.bodies()[0];
        assert_eq!(body["userAgent"]["browser"], "Safari");
        assert_eq!(body["userAgent"]["os"], "iOS");
        assert_eq!(body["userAgent"]["deviceType"], "mobile");
        assert_eq!(body["context"]["url"], "https://shop.example.com/");
        b.stop().await;
    }
}
