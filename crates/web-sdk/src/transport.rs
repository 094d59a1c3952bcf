//! Transport: fire-and-forget delivery with a beacon primary path and an
//! asynchronous HTTP fallback.
//!
//! The boolean returned by `send` only says a send attempt was dispatched.
//! Outcomes of the HTTP path arrive later through the [`ErrorReporter`].

use std::sync::Arc;

use pulse_core::environment::{
    BeaconSender, Capabilities, CredentialsMode, HttpRequest, HttpSender,
};
use pulse_core::types::{BandwidthBatchPayload, EventPayload};
use pulse_core::{ErrorKind, ErrorReporter};
use serde::Serialize;
use tokio::runtime::Handle;
use tracing::debug;

pub const SECRET_HEADER: &str = "X-Secret-Key";
pub const CONTENT_TYPE: &str = "application/json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Event,
    Bandwidth,
}

impl Delivery {
    fn as_str(&self) -> &'static str {
        match self {
            Delivery::Event => "event",
            Delivery::Bandwidth => "bandwidth",
        }
    }
}

pub struct Transport {
    endpoint: String,
    bandwidth_endpoint: String,
    secret_key: Option<String>,
    beacon: Option<Arc<dyn BeaconSender>>,
    http: Option<Arc<dyn HttpSender>>,
    reporter: ErrorReporter,
}

impl Transport {
    pub fn new(
        endpoint: impl Into<String>,
        bandwidth_endpoint: impl Into<String>,
        secret_key: Option<String>,
        capabilities: &Capabilities,
        reporter: ErrorReporter,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            bandwidth_endpoint: bandwidth_endpoint.into(),
            secret_key,
            beacon: capabilities.beacon.clone(),
            http: capabilities.http.clone(),
            reporter,
        }
    }

    pub fn reporter(&self) -> &ErrorReporter {
        &self.reporter
    }

    /// Queue one event for delivery.
    pub fn send(&self, payload: &EventPayload) -> bool {
        self.serialize_and_dispatch(payload, Delivery::Event)
    }

    /// Queue one bandwidth batch. Delivery failures are reported as `network`.
    pub fn send_bandwidth(&self, payload: &BandwidthBatchPayload) -> bool {
        self.serialize_and_dispatch(payload, Delivery::Bandwidth)
    }

    fn serialize_and_dispatch<T: Serialize>(&self, payload: &T, delivery: Delivery) -> bool {
        match serde_json::to_string(payload) {
            Ok(body) => self.dispatch(body, delivery),
            Err(e) => {
                self.reporter.report(
                    ErrorKind::Validation,
                    format!("Failed to serialize {} payload", delivery.as_str()),
                    None,
                    Some(e.to_string()),
                );
                false
            }
        }
    }

    fn dispatch(&self, body: String, delivery: Delivery) -> bool {
        let url = match delivery {
            Delivery::Event => self.endpoint.as_str(),
            Delivery::Bandwidth => self.bandwidth_endpoint.as_str(),
        };

        if let Some(beacon) = &self.beacon {
            match beacon.send_beacon(url, &body) {
                Ok(true) => {
                    metrics::counter!("pulse.transport.beacon", "delivery" => delivery.as_str())
                        .increment(1);
                    debug!(delivery = delivery.as_str(), bytes = body.len(), "beacon queued");
                    return true;
                }
                Ok(false) => {
                    debug!(delivery = delivery.as_str(), "beacon rejected payload, falling back to http");
                }
                Err(e) => {
                    debug!(delivery = delivery.as_str(), error = %e, "beacon failed, falling back to http");
                }
            }
        }

        let Some(http) = &self.http else {
            self.reporter.report(
                ErrorKind::Unknown,
                "No transport available: neither beacon nor http is supported",
                None,
                None,
            );
            return false;
        };

        let Ok(runtime) = Handle::try_current() else {
            self.reporter.report(
                ErrorKind::Unknown,
                "No transport available: http requires a running async runtime",
                None,
                None,
            );
            return false;
        };

        let mut headers = vec![("Content-Type".to_string(), CONTENT_TYPE.to_string())];
        if let Some(secret) = &self.secret_key {
            headers.push((SECRET_HEADER.to_string(), secret.clone()));
        }
        let request = HttpRequest {
            url: url.to_string(),
            body,
            headers,
            keepalive: true,
            credentials: CredentialsMode::Omit,
        };

        let http = Arc::clone(http);
        let reporter = self.reporter.clone();
        runtime.spawn(async move {
            deliver(http, request, delivery, reporter).await;
        });

        metrics::counter!("pulse.transport.http", "delivery" => delivery.as_str()).increment(1);
        true
    }
}

async fn deliver(
    http: Arc<dyn HttpSender>,
    request: HttpRequest,
    delivery: Delivery,
    reporter: ErrorReporter,
) {
    match http.post(request).await {
        Ok(response) if response.is_success() => {
            debug!(delivery = delivery.as_str(), status = response.status, "delivered");
        }
        Ok(response) => match delivery {
            Delivery::Event => reporter.report(
                ErrorKind::from_status(response.status),
                ErrorKind::describe_status(response.status),
                Some(response.status),
                None,
            ),
            Delivery::Bandwidth => reporter.report(
                ErrorKind::Network,
                format!("Failed to send bandwidth batch: HTTP {}", response.status),
                Some(response.status),
                None,
            ),
        },
        Err(e) => reporter.report(
            ErrorKind::Network,
            format!("Failed to send {}", delivery.as_str()),
            None,
            Some(e.to_string()),
        ),
    }
}
