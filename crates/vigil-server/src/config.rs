use std::net::IpAddr;
use std::num::{NonZeroU32, NonZeroU64};

use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default = "ServerConfig::default_max_upload_bytes")]
    pub max_upload_bytes: usize,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub cors: CorsConfig,
}

impl ServerConfig {
    fn default_max_upload_bytes() -> usize {
        // Uploaded videos are streamed to scratch storage, so the ceiling only
        // bounds transport abuse, not memory.
        256 * 1024 * 1024
    }
}

/// Per-client admission control for the analyze entry point.
#[derive(Debug, Deserialize, Clone)]
pub struct AdmissionConfig {
    #[serde(default = "AdmissionConfig::default_enabled")]
    pub enabled: bool,
    #[serde(default = "AdmissionConfig::default_max_requests")]
    pub max_requests: NonZeroU32,
    #[serde(default = "AdmissionConfig::default_window_secs")]
    pub window_secs: NonZeroU64,
    #[serde(default)]
    pub proxy_mode: ProxyMode,
    #[serde(default)]
    pub trusted_proxies: Vec<IpAddr>,
}

impl AdmissionConfig {
    fn default_enabled() -> bool {
        true
    }

    fn default_max_requests() -> NonZeroU32 {
        NonZeroU32::new(5).expect("default admission quota must be non-zero")
    }

    fn default_window_secs() -> NonZeroU64 {
        NonZeroU64::new(60).expect("default admission window must be non-zero")
    }
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            enabled: Self::default_enabled(),
            max_requests: Self::default_max_requests(),
            window_secs: Self::default_window_secs(),
            proxy_mode: ProxyMode::Off,
            trusted_proxies: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub allow_origins: Vec<String>,
    #[serde(default = "CorsConfig::default_allow_methods")]
    pub allow_methods: Vec<String>,
    #[serde(default = "CorsConfig::default_allow_headers")]
    pub allow_headers: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
    #[serde(default = "CorsConfig::default_max_age_secs")]
    pub max_age_secs: u64,
}

impl CorsConfig {
    fn default_allow_methods() -> Vec<String> {
        vec!["GET".to_string(), "POST".to_string(), "OPTIONS".to_string()]
    }

    fn default_allow_headers() -> Vec<String> {
        vec!["content-type".to_string()]
    }

    fn default_max_age_secs() -> u64 {
        600
    }
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            allow_origins: Vec::new(),
            allow_methods: Self::default_allow_methods(),
            allow_headers: Self::default_allow_headers(),
            allow_credentials: false,
            max_age_secs: Self::default_max_age_secs(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ProxyMode {
    #[default]
    Off,
    XForwardedFor,
    Forwarded,
}
