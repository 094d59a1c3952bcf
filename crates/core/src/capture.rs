//! In-memory transport doubles that capture what would have been sent.
//!
//! Used by tests and by hosts that want to inspect traffic locally.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::environment::{BeaconSender, HttpRequest, HttpResponse, HttpSender};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconBehavior {
    Accept,
    Reject,
    Fail,
}

/// Beacon sender that records `(url, body)` pairs.
pub struct CaptureBeacon {
    sent: Mutex<Vec<(String, String)>>,
    behavior: BeaconBehavior,
}

impl CaptureBeacon {
    pub fn new(behavior: BeaconBehavior) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            behavior,
        }
    }

    pub fn accepting() -> Arc<Self> {
        Arc::new(Self::new(BeaconBehavior::Accept))
    }

    pub fn rejecting() -> Arc<Self> {
        Arc::new(Self::new(BeaconBehavior::Reject))
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self::new(BeaconBehavior::Fail))
    }

    pub fn count(&self) -> usize {
        self.sent.lock().len()
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    /// Sent bodies parsed as JSON.
    pub fn bodies(&self) -> Vec<serde_json::Value> {
        self.sent
            .lock()
            .iter()
            .filter_map(|(_, body)| serde_json::from_str(body).ok())
            .collect()
    }
}

impl BeaconSender for CaptureBeacon {
    fn send_beacon(&self, url: &str, body: &str) -> anyhow::Result<bool> {
        match self.behavior {
            BeaconBehavior::Accept => {
                self.sent.lock().push((url.to_string(), body.to_string()));
                Ok(true)
            }
            BeaconBehavior::Reject => Ok(false),
            BeaconBehavior::Fail => anyhow::bail!("beacon unavailable"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HttpBehavior {
    Respond(u16),
    Fail(String),
}

/// HTTP sender that records every request and answers with a fixed outcome.
pub struct CaptureHttp {
    requests: Mutex<Vec<HttpRequest>>,
    behavior: HttpBehavior,
}

impl CaptureHttp {
    pub fn new(behavior: HttpBehavior) -> Self {
        Self {
            requests: Mutex::new(Vec::new()),
            behavior,
        }
    }

    pub fn ok() -> Arc<Self> {
        Arc::new(Self::new(HttpBehavior::Respond(200)))
    }

    pub fn status(status: u16) -> Arc<Self> {
        Arc::new(Self::new(HttpBehavior::Respond(status)))
    }

    pub fn failing(message: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(HttpBehavior::Fail(message.into())))
    }

    pub fn count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// Wait until at least `n` requests were observed or `timeout` elapses.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if self.count() >= n {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.count() >= n
    }
}

#[async_trait]
impl HttpSender for CaptureHttp {
    async fn post(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        self.requests.lock().push(request);
        match &self.behavior {
            HttpBehavior::Respond(status) => Ok(HttpResponse { status: *status }),
            HttpBehavior::Fail(message) => Err(anyhow::anyhow!("{message}")),
        }
    }
}
