pub mod types;

#[cfg(test)]
mod tests;

pub use types::*;

use anyhow::Result;
use std::path::Path;

impl GatewayConfig {
    /// Load configuration from a file (if it exists) and apply environment
    /// variable overrides. When the file does not exist, built-in defaults
    /// are used — the gateway starts with zero configuration for local
    /// development.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: GatewayConfig = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            match path.extension().and_then(|e| e.to_str()) {
                Some("toml") => toml::from_str(&content)?,
                Some("json") => serde_json::from_str(&content)?,
                Some(ext) => anyhow::bail!("unsupported config format: .{ext}, use .toml or .json"),
                None => anyhow::bail!("config file has no extension, use .toml or .json"),
            }
        } else {
            GatewayConfig::default()
        };

        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides. A present-but-malformed value
    /// is a startup error (exit code 1), never silently ignored.
    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("PORT") {
            self.port = v
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a port number, got {:?}", v))?;
        }
        if let Ok(v) = std::env::var("ADMIN_API_KEY") {
            if !v.is_empty() {
                self.admin_api_key = Some(v);
            }
        }
        if let Ok(v) = std::env::var("BASE_URL") {
            self.base_url = Some(v);
        }
        if let Ok(v) = std::env::var("CORS_ORIGINS") {
            self.cors_origins = v
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty() && s != "*")
                .collect();
        }
        if let Ok(v) = std::env::var("TRUSTED_PROXY") {
            self.trusted_proxy = v == "true" || v == "1";
        }
        if let Ok(v) = std::env::var("MAX_REGISTRATIONS") {
            self.max_registrations = v.parse().map_err(|_| {
                anyhow::anyhow!("MAX_REGISTRATIONS must be an integer, got {:?}", v)
            })?;
        }
        if let Ok(v) = std::env::var("FETCH_TIMEOUT_MS") {
            self.fetch_timeout_ms = v.parse().map_err(|_| {
                anyhow::anyhow!("FETCH_TIMEOUT_MS must be an integer, got {:?}", v)
            })?;
        }
        if let Ok(v) = std::env::var("DATA_DIR") {
            self.data_dir = v.into();
        }
        if let Ok(v) = std::env::var("SESSION_TTL_SECS") {
            self.session_ttl_secs = v.parse().map_err(|_| {
                anyhow::anyhow!("SESSION_TTL_SECS must be an integer, got {:?}", v)
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_registrations == 0 {
            anyhow::bail!("MAX_REGISTRATIONS must be at least 1");
        }
        if self.fetch_timeout_ms == 0 {
            anyhow::bail!("FETCH_TIMEOUT_MS must be at least 1");
        }
        if self.session_ttl_secs == 0 {
            anyhow::bail!("SESSION_TTL_SECS must be at least 1");
        }
        if let Some(ref base) = self.base_url {
            url::Url::parse(base)
                .map_err(|e| anyhow::anyhow!("BASE_URL is not a valid URL: {}", e))?;
        }
        Ok(())
    }
}
