//! Context builder: environment metadata subject to privacy flags.

use std::sync::Arc;

use pulse_core::config::PrivacyConfig;
use pulse_core::environment::PageContext;
use pulse_core::types::Context;

use crate::sanitize::sanitize_url;

pub struct ContextBuilder {
    project_id: String,
    privacy: PrivacyConfig,
    page: Option<Arc<dyn PageContext>>,
}

impl ContextBuilder {
    pub fn new(
        project_id: impl Into<String>,
        privacy: PrivacyConfig,
        page: Option<Arc<dyn PageContext>>,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            privacy,
            page,
        }
    }

    /// Snapshot the current environment. Side-effect free.
    pub fn build(&self) -> Context {
        let mut context = Context {
            project_id: self.project_id.clone(),
            ..Default::default()
        };

        let Some(page) = &self.page else {
            return context;
        };

        if self.privacy.collect_url {
            context.url = sanitize_url(page.url().as_deref());
        }
        if self.privacy.collect_referrer {
            context.referrer = sanitize_url(page.referrer().as_deref()).filter(|r| !r.is_empty());
        }
        if self.privacy.collect_user_agent {
            context.user_agent = page.user_agent().filter(|ua| !ua.is_empty());
        }

        context
    }

    /// Raw user agent, honoring the user-agent privacy flag.
    pub fn user_agent(&self) -> Option<String> {
        if !self.privacy.collect_user_agent {
            return None;
        }
        self.page
            .as_ref()
            .and_then(|p| p.user_agent())
            .filter(|ua| !ua.is_empty())
    }
}
