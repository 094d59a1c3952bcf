//! Shared enrichment and delivery state used by both the event tracker and
//! the bandwidth batcher.

use std::sync::Arc;

use pulse_core::config::{PrivacyConfig, TrackerConfig};
use pulse_core::environment::{Capabilities, Clock};
use pulse_core::types::{Context, Credentials, Timestamp};
use pulse_core::ErrorReporter;
use tracing::warn;

use crate::context::ContextBuilder;
use crate::session::SessionTracker;
use crate::transport::Transport;

pub struct Pipeline {
    project_id: String,
    credentials: Credentials,
    privacy: PrivacyConfig,
    context: ContextBuilder,
    sessions: SessionTracker,
    transport: Transport,
    clock: Arc<dyn Clock>,
}

impl Pipeline {
    pub fn new(config: &TrackerConfig, capabilities: &Capabilities, reporter: ErrorReporter) -> Self {
        let mut secret_key = config.resolved_secret().map(String::from);
        if secret_key.is_some() && capabilities.has_page() {
            warn!("secret key is never sent from a browser context; ignoring it");
            secret_key = None;
        }

        let transport = Transport::new(
            config.endpoint.clone(),
            config.bandwidth_endpoint(),
            secret_key.clone(),
            capabilities,
            reporter,
        );

        Self {
            project_id: config.project_id.clone(),
            credentials: Credentials {
                public_key: config.public_key.clone().filter(|k| !k.is_empty()),
                secret_key,
            },
            privacy: config.privacy.clone(),
            context: ContextBuilder::new(
                config.project_id.clone(),
                config.privacy.clone(),
                capabilities.page.clone(),
            ),
            sessions: SessionTracker::new(
                capabilities.session_storage.clone(),
                Arc::clone(&capabilities.clock),
            ),
            transport,
            clock: Arc::clone(&capabilities.clock),
        }
    }

    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    pub fn credentials(&self) -> Credentials {
        self.credentials.clone()
    }

    pub fn privacy(&self) -> &PrivacyConfig {
        &self.privacy
    }

    pub fn context(&self) -> Context {
        self.context.build()
    }

    pub fn user_agent(&self) -> Option<String> {
        self.context.user_agent()
    }

    /// Session id, when session collection is enabled and storage exists.
    pub fn session_id(&self) -> Option<String> {
        if !self.privacy.collect_session_id {
            return None;
        }
        self.sessions.session_id()
    }

    pub fn timestamp(&self) -> Timestamp {
        Timestamp::from_datetime(self.clock.now())
    }

    /// `Some(true)` only when requested; the field is omitted otherwise.
    pub fn anonymize_ip(&self) -> Option<bool> {
        self.privacy.anonymize_ip.then_some(true)
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn reporter(&self) -> &ErrorReporter {
        self.transport.reporter()
    }
}
