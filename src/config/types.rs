use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level gateway configuration.
///
/// Values come from an optional TOML/JSON config file with environment
/// variables layered on top (env always wins). Business state — tenant
/// registrations — lives in the registry, never here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// TCP port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Admin bearer key. `None` means the admin surface is fail-closed:
    /// `/register`, `/sites*` and `/metrics` answer 503 until a key is set.
    #[serde(default)]
    pub admin_api_key: Option<String>,

    /// Public base URL used when building registration-response links.
    /// `None` derives `http://127.0.0.1:<port>` from the listen address.
    #[serde(default)]
    pub base_url: Option<String>,

    /// CORS origin allowlist. Empty means `*`.
    #[serde(default)]
    pub cors_origins: Vec<String>,

    /// Honor `X-Forwarded-For` / `X-Forwarded-Proto` / `X-Forwarded-Host`.
    /// Only enable behind a proxy that overwrites these headers.
    #[serde(default)]
    pub trusted_proxy: bool,

    /// Maximum number of registered tenants.
    #[serde(default = "default_max_registrations")]
    pub max_registrations: usize,

    /// Hard deadline for fetching a tenant's OpenAPI descriptor.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,

    /// Directory holding the durable registry file.
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Session token time-to-live.
    #[serde(default = "default_session_ttl_secs")]
    pub session_ttl_secs: u64,

    /// Cap on `POST /register` request bodies.
    #[serde(default = "default_register_body_limit")]
    pub register_body_limit_bytes: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            admin_api_key: None,
            base_url: None,
            cors_origins: Vec::new(),
            trusted_proxy: false,
            max_registrations: default_max_registrations(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            data_dir: default_data_dir(),
            session_ttl_secs: default_session_ttl_secs(),
            register_body_limit_bytes: default_register_body_limit(),
        }
    }
}

fn default_port() -> u16 {
    3000
}

fn default_max_registrations() -> usize {
    500
}

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_session_ttl_secs() -> u64 {
    3600
}

fn default_register_body_limit() -> usize {
    100 * 1024
}

impl GatewayConfig {
    /// Socket address string for the listener.
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.port)
    }

    /// Base URL for links in registration responses. A configured
    /// `BASE_URL` wins; otherwise the listen address is used — request
    /// `Host` headers are deliberately not consulted here (see
    /// `trusted_proxy`).
    pub fn public_base_url(&self) -> String {
        match self.base_url {
            Some(ref u) => u.trim_end_matches('/').to_string(),
            None => format!("http://127.0.0.1:{}", self.port),
        }
    }

    /// Whether `origin` is allowed by the CORS policy. An empty allowlist
    /// means every origin (`*`).
    pub fn cors_allows(&self, origin: &str) -> bool {
        self.cors_origins.is_empty() || self.cors_origins.iter().any(|o| o == origin)
    }
}
