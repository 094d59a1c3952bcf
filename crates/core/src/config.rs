use serde::Deserialize;

use crate::error::{PulseError, PulseResult};

pub const DEFAULT_ENDPOINT: &str = "https://collect.pulse-analytics.io/api/v1/events";
pub const BANDWIDTH_PATH_SUFFIX: &str = "/bandwidth";
/// Upper bound for `bandwidth.max_batch_size`.
pub const MAX_BATCH_SIZE: usize = 10_000;
/// Upper bound for `bandwidth.flush_interval_ms` (24 hours).
pub const MAX_FLUSH_INTERVAL_MS: u64 = 86_400_000;

/// Root tracker configuration. Loaded from environment variables with the
/// prefix `PULSE__`, or built in code by the embedding application.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    #[serde(default)]
    pub project_id: String,
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    /// Legacy single credential. Only used as the secret when `secret_key` is unset.
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_endpoint")]
    pub endpoint: String,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub privacy: PrivacyConfig,
    #[serde(default)]
    pub bandwidth: BandwidthOption,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PrivacyConfig {
    #[serde(default = "default_true")]
    pub collect_url: bool,
    #[serde(default = "default_true")]
    pub collect_referrer: bool,
    #[serde(default = "default_true")]
    pub collect_user_agent: bool,
    #[serde(default = "default_true")]
    pub collect_session_id: bool,
    #[serde(default)]
    pub anonymize_ip: bool,
}

/// Raw bandwidth tracking input: either a plain toggle or a detailed block.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum BandwidthOption {
    Toggle(bool),
    Detailed(BandwidthOptions),
}

#[derive(Debug, Clone, Deserialize)]
pub struct BandwidthOptions {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default)]
    pub resource_types: Vec<String>,
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    #[serde(default = "default_true")]
    pub sanitize_urls: bool,
}

/// Fully resolved, immutable bandwidth sampling configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BandwidthConfig {
    pub enabled: bool,
    pub flush_interval_ms: u64,
    pub resource_types: Vec<String>,
    pub max_batch_size: usize,
    pub sanitize_urls: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BandwidthSetting {
    Disabled,
    Enabled(BandwidthConfig),
}

impl BandwidthConfig {
    pub fn allows(&self, resource_type: &str) -> bool {
        self.resource_types.is_empty() || self.resource_types.iter().any(|t| t == resource_type)
    }
}

impl Default for BandwidthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            flush_interval_ms: default_flush_interval_ms(),
            resource_types: Vec::new(),
            max_batch_size: default_max_batch_size(),
            sanitize_urls: true,
        }
    }
}

impl BandwidthOption {
    /// Resolve the raw option once into a fully populated setting.
    pub fn resolve(&self) -> BandwidthSetting {
        match self {
            BandwidthOption::Toggle(false) => BandwidthSetting::Disabled,
            BandwidthOption::Toggle(true) => BandwidthSetting::Enabled(BandwidthConfig::default()),
            BandwidthOption::Detailed(opts) if !opts.enabled => BandwidthSetting::Disabled,
            BandwidthOption::Detailed(opts) => BandwidthSetting::Enabled(BandwidthConfig {
                enabled: true,
                flush_interval_ms: opts.flush_interval_ms,
                resource_types: opts.resource_types.clone(),
                max_batch_size: opts.max_batch_size,
                sanitize_urls: opts.sanitize_urls,
            }),
        }
    }
}

// Default functions
fn default_true() -> bool {
    true
}
fn default_endpoint() -> String {
    DEFAULT_ENDPOINT.to_string()
}
fn default_flush_interval_ms() -> u64 {
    10_000
}
fn default_max_batch_size() -> usize {
    50
}

impl Default for PrivacyConfig {
    fn default() -> Self {
        Self {
            collect_url: true,
            collect_referrer: true,
            collect_user_agent: true,
            collect_session_id: true,
            anonymize_ip: false,
        }
    }
}

impl Default for BandwidthOption {
    fn default() -> Self {
        BandwidthOption::Toggle(false)
    }
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            project_id: String::new(),
            public_key: None,
            secret_key: None,
            api_key: None,
            endpoint: default_endpoint(),
            debug: false,
            privacy: PrivacyConfig::default(),
            bandwidth: BandwidthOption::default(),
        }
    }
}

impl TrackerConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            ..Default::default()
        }
    }

    /// Load configuration from `PULSE__*` environment variables.
    pub fn load() -> Result<Self, config::ConfigError> {
        Self::from_env_source(None)
    }

    /// Same as [`TrackerConfig::load`], reading variables from `vars` instead
    /// of the process environment when given.
    pub fn from_env_source(
        vars: Option<config::Map<String, String>>,
    ) -> Result<Self, config::ConfigError> {
        let builder = config::Config::builder().add_source(
            config::Environment::with_prefix("PULSE")
                .separator("__")
                .try_parsing(true)
                .list_separator(",")
                .with_list_parse_key("bandwidth.resource_types")
                .source(vars),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Reject configurations the tracker cannot be built from.
    pub fn validate(&self) -> PulseResult<()> {
        if self.project_id.trim().is_empty() {
            return Err(PulseError::Config("project_id is required".into()));
        }
        if self.endpoint.trim().is_empty() {
            return Err(PulseError::Config("endpoint must not be empty".into()));
        }
        if let BandwidthSetting::Enabled(bw) = self.bandwidth.resolve() {
            if bw.max_batch_size == 0 || bw.max_batch_size > MAX_BATCH_SIZE {
                return Err(PulseError::Config(format!(
                    "bandwidth.max_batch_size must be between 1 and {MAX_BATCH_SIZE}"
                )));
            }
            if bw.flush_interval_ms == 0 || bw.flush_interval_ms > MAX_FLUSH_INTERVAL_MS {
                return Err(PulseError::Config(format!(
                    "bandwidth.flush_interval_ms must be between 1 and {MAX_FLUSH_INTERVAL_MS}"
                )));
            }
        }
        Ok(())
    }

    /// Secret credential after precedence: `secret_key` first, then legacy `api_key`.
    pub fn resolved_secret(&self) -> Option<&str> {
        fn present(key: &Option<String>) -> Option<&str> {
            key.as_deref().filter(|s| !s.is_empty())
        }
        present(&self.secret_key).or_else(|| present(&self.api_key))
    }

    pub fn bandwidth_endpoint(&self) -> String {
        format!(
            "{}{}",
            self.endpoint.trim_end_matches('/'),
            BANDWIDTH_PATH_SUFFIX
        )
    }
}
