//! Tracker: the public entry point. Formats events, enriches them with
//! context and session, and hands them to the transport. Owns the optional
//! bandwidth batcher.

use std::sync::Arc;

use pulse_core::config::{BandwidthSetting, TrackerConfig};
use pulse_core::environment::Capabilities;
use pulse_core::reporter::ErrorCallback;
use pulse_core::types::{EventLevel, EventPayload, Metadata};
use pulse_core::{ErrorReporter, PulseResult, TrackerError};
use tracing::{debug, info, warn};

use crate::bandwidth::BandwidthBatcher;
use crate::pipeline::Pipeline;

pub const PAGE_VIEW_EVENT: &str = "page_view";

pub struct TrackerBuilder {
    config: TrackerConfig,
    capabilities: Option<Capabilities>,
    on_error: Option<ErrorCallback>,
}

impl TrackerBuilder {
    /// Environment the tracker runs in. Defaults to [`Capabilities::none`].
    pub fn capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = Some(capabilities);
        self
    }

    pub fn on_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&TrackerError) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(callback));
        self
    }

    /// Validate the configuration and construct the tracker. Bandwidth
    /// sampling starts immediately when enabled and observable.
    pub fn build(self) -> PulseResult<Tracker> {
        self.config.validate()?;

        let capabilities = self.capabilities.unwrap_or_else(Capabilities::none);
        let reporter = ErrorReporter::new(self.config.debug, self.on_error);
        let pipeline = Arc::new(Pipeline::new(&self.config, &capabilities, reporter));

        let bandwidth = match self.config.bandwidth.resolve() {
            BandwidthSetting::Disabled => None,
            BandwidthSetting::Enabled(config) => {
                let batcher = BandwidthBatcher::new(config, Arc::clone(&pipeline), &capabilities);
                batcher.start();
                Some(batcher)
            }
        };

        info!(
            project_id = %self.config.project_id,
            endpoint = %self.config.endpoint,
            page = capabilities.has_page(),
            bandwidth = bandwidth.as_ref().is_some_and(|b| b.is_active()),
            "tracker initialized"
        );

        Ok(Tracker {
            pipeline,
            bandwidth,
        })
    }
}

pub struct Tracker {
    pipeline: Arc<Pipeline>,
    bandwidth: Option<BandwidthBatcher>,
}

impl Tracker {
    pub fn builder(config: TrackerConfig) -> TrackerBuilder {
        TrackerBuilder {
            config,
            capabilities: None,
            on_error: None,
        }
    }

    pub fn project_id(&self) -> &str {
        self.pipeline.project_id()
    }

    /// Record one event. Returns whether a send was dispatched, never whether
    /// it was delivered.
    pub fn track(&self, event: &str, metadata: Option<Metadata>, level: EventLevel) -> bool {
        if event.is_empty() {
            warn!("event name is required; dropping event");
            metrics::counter!("pulse.events.rejected").increment(1);
            return false;
        }

        let timestamp = self.pipeline.timestamp();
        let payload = EventPayload {
            event: event.to_string(),
            level,
            metadata,
            session_id: self.pipeline.session_id(),
            context: self.pipeline.context(),
            timestamp_iso: timestamp.iso_string(),
            timestamp_ms: timestamp.millis(),
            project_id: self.pipeline.project_id().to_string(),
            credentials: self.pipeline.credentials(),
            anonymize_ip: self.pipeline.anonymize_ip(),
        };

        if self.pipeline.reporter().debug() {
            debug!(event, level = level.as_str(), session_id = ?payload.session_id, "tracking event");
        }

        let queued = self.pipeline.transport().send(&payload);
        if queued {
            metrics::counter!("pulse.events.queued", "level" => level.as_str()).increment(1);
        }
        queued
    }

    pub fn info(&self, event: &str, metadata: Option<Metadata>) -> bool {
        self.track(event, metadata, EventLevel::Info)
    }

    pub fn warn(&self, event: &str, metadata: Option<Metadata>) -> bool {
        self.track(event, metadata, EventLevel::Warn)
    }

    pub fn error(&self, event: &str, metadata: Option<Metadata>) -> bool {
        self.track(event, metadata, EventLevel::Error)
    }

    /// `page_view` at info level, carrying the sanitized page URL if collected.
    pub fn track_page_view(&self) -> bool {
        let metadata = self.pipeline.context().url.map(|url| {
            let mut metadata = Metadata::new();
            metadata.insert("url".into(), url.into());
            metadata
        });
        self.track(PAGE_VIEW_EVENT, metadata, EventLevel::Info)
    }

    pub fn bandwidth_active(&self) -> bool {
        self.bandwidth.as_ref().is_some_and(|b| b.is_active())
    }

    pub fn flush_bandwidth(&self) {
        if let Some(batcher) = &self.bandwidth {
            batcher.flush_now();
        }
    }

    /// Stop bandwidth sampling with a final flush. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        if let Some(batcher) = &self.bandwidth {
            batcher.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use pulse_core::capture::{CaptureBeacon, CaptureHttp};
    use pulse_core::config::{BandwidthOption, BandwidthOptions};
    use pulse_core::environment::{
        ManualClock, MemoryStore, ResourceTimingFeed, ResourceTiming, StaticPage,
    };
    use pulse_core::PulseError;
    use serde_json::json;

    fn browser(beacon: Arc<CaptureBeacon>) -> Capabilities {
        Capabilities::none()
            .with_page(Arc::new(
                StaticPage::new("https://shop.example.com/checkout?session_id=s3cr3t&step=2")
                    .with_user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64) Chrome/120.0.0.0"),
            ))
            .with_beacon(beacon)
            .with_session_storage(Arc::new(MemoryStore::new()))
            .with_clock(Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            )))
    }

    #[test]
    fn test_empty_project_id_is_fatal() {
        let err = Tracker::builder(TrackerConfig::new("")).build().err().unwrap();
        assert!(matches!(err, PulseError::Config(_)));
    }

    #[test]
    fn test_oversized_bandwidth_config_is_rejected() {
        let mut config = TrackerConfig::new("p1");
        config.bandwidth = BandwidthOption::Detailed(BandwidthOptions {
            enabled: true,
            flush_interval_ms: 10_000,
            resource_types: Vec::new(),
            max_batch_size: usize::MAX,
            sanitize_urls: true,
        });
        let caps = Capabilities::none().with_resource_timing(Arc::new(ResourceTimingFeed::new()));
        let err = Tracker::builder(config).capabilities(caps).build().err().unwrap();
        assert!(matches!(err, PulseError::Config(_)));
    }

    #[test]
    fn test_empty_event_is_rejected_without_send() {
        let beacon = CaptureBeacon::accepting();
        let tracker = Tracker::builder(TrackerConfig::new("p1"))
            .capabilities(browser(beacon.clone()))
            .build()
            .unwrap();
        assert!(!tracker.track("", None, EventLevel::Info));
        assert_eq!(beacon.count(), 0);
    }

    #[test]
    fn test_payload_shape() {
        let beacon = CaptureBeacon::accepting();
        let mut config = TrackerConfig::new("p1");
        config.public_key = Some("pk_live".into());
        config.privacy.anonymize_ip = true;
        let tracker = Tracker::builder(config)
            .capabilities(browser(beacon.clone()))
            .build()
            .unwrap();

        let mut meta = Metadata::new();
        meta.insert("plan".into(), json!("pro"));
        assert!(tracker.error("payment_failed", Some(meta)));

        let body = &beacon.bodies()[0];
        assert_eq!(body["event"], "payment_failed");
        assert_eq!(body["level"], "error");
        assert_eq!(body["metadata"]["plan"], "pro");
        assert_eq!(body["projectId"], "p1");
        assert_eq!(body["publicKey"], "pk_live");
        assert_eq!(body["anonymizeIp"], true);
        assert_eq!(body["timestampIso"], "2024-03-01T12:00:00.000Z");
        assert_eq!(body["timestampMs"], 1_709_294_400_000_i64);
        assert_eq!(body["context"]["projectId"], "p1");
        assert!(!body["context"]["url"].as_str().unwrap().contains("s3cr3t"));
        assert!(body["sessionId"].is_string());
        assert!(body.get("secretKey").is_none());
    }

    #[test]
    fn test_optional_fields_are_omitted() {
        let beacon = CaptureBeacon::accepting();
        let caps = Capabilities::none().with_beacon(beacon.clone());
        let tracker = Tracker::builder(TrackerConfig::new("p1"))
            .capabilities(caps)
            .build()
            .unwrap();

        assert!(tracker.info("boot", None));
        let body = &beacon.bodies()[0];
        assert_eq!(body["level"], "info");
        assert!(body.get("metadata").is_none());
        assert!(body.get("sessionId").is_none());
        assert!(body.get("anonymizeIp").is_none());
        assert_eq!(body["context"], json!({ "projectId": "p1" }));
    }

    #[test]
    fn test_session_id_stable_across_events() {
        let beacon = CaptureBeacon::accepting();
        let tracker = Tracker::builder(TrackerConfig::new("p1"))
            .capabilities(browser(beacon.clone()))
            .build()
            .unwrap();
        tracker.info("a", None);
        tracker.warn("b", None);
        let bodies = beacon.bodies();
        assert_eq!(bodies[0]["sessionId"], bodies[1]["sessionId"]);
        assert_eq!(bodies[1]["level"], "warn");
    }

    #[test]
    fn test_page_view_carries_sanitized_url() {
        let beacon = CaptureBeacon::accepting();
        let tracker = Tracker::builder(TrackerConfig::new("p1"))
            .capabilities(browser(beacon.clone()))
            .build()
            .unwrap();
        assert!(tracker.track_page_view());

        let body = &beacon.bodies()[0];
        assert_eq!(body["event"], PAGE_VIEW_EVENT);
        let url = body["metadata"]["url"].as_str().unwrap();
        assert!(url.starts_with("https://shop.example.com/checkout"));
        assert!(!url.contains("s3cr3t"));
    }

    #[test]
    fn test_missing_transport_surfaces_unknown_error() {
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let tracker = Tracker::builder(TrackerConfig::new("p1"))
            .on_error(move |e| sink.lock().push(e.kind))
            .build()
            .unwrap();
        assert!(!tracker.info("orphan", None));
        assert_eq!(*seen.lock(), vec![pulse_core::ErrorKind::Unknown]);
    }

    #[tokio::test]
    async fn test_bandwidth_lifecycle() {
        let feed = Arc::new(ResourceTimingFeed::new());
        let beacon = CaptureBeacon::accepting();
        let caps = browser(beacon.clone())
            .with_http(CaptureHttp::ok())
            .with_resource_timing(feed.clone());

        let mut config = TrackerConfig::new("p1");
        config.bandwidth = BandwidthOption::Detailed(BandwidthOptions {
            enabled: true,
            flush_interval_ms: 60_000,
            resource_types: vec!["img".into()],
            max_batch_size: 10,
            sanitize_urls: true,
        });
        let tracker = Tracker::builder(config).capabilities(caps).build().unwrap();
        assert!(tracker.bandwidth_active());

        feed.record(ResourceTiming {
            name: "https://img.example.com/hero.png?w=800".into(),
            initiator_type: Some("img".into()),
            transfer_size: Some(4096),
            ..Default::default()
        });
        tracker.shutdown().await;
        tracker.shutdown().await;
        assert!(!tracker.bandwidth_active());

        let sent = beacon.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].0.ends_with("/bandwidth"));
        let body = &beacon.bodies()[0];
        assert_eq!(body["entries"][0]["url"], "https://img.example.com/hero.png");
        assert_eq!(body["totalTransferSize"], 4096);
        assert_eq!(body["userAgent"]["browser"], "Chrome");
    }

    #[test]
    fn test_bandwidth_disabled_by_default() {
        let tracker = Tracker::builder(TrackerConfig::new("p1"))
            .capabilities(Capabilities::none().with_resource_timing(Arc::new(
                ResourceTimingFeed::new(),
            )))
            .build()
            .unwrap();
        assert!(!tracker.bandwidth_active());
    }
}
