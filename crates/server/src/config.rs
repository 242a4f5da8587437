use anomaly::EnsembleConfig;
use embedding::ExtractorConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Server configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server bind address
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Server port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Maximum request body size in MB
    #[serde(default = "default_max_body_size_mb")]
    pub max_body_size_mb: usize,

    /// Enable CORS
    #[serde(default = "default_true")]
    pub enable_cors: bool,

    /// Log level
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory holding the fitted model blobs and the optional
    /// fine-tuned embedding head
    #[serde(default = "default_model_dir")]
    pub model_dir: PathBuf,

    /// Must match the extractor the models were fitted against
    #[serde(default)]
    pub extractor: ExtractorConfig,

    #[serde(default)]
    pub ensemble: EnsembleConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_bind_addr(),
            port: default_port(),
            timeout_secs: default_timeout_secs(),
            max_body_size_mb: default_max_body_size_mb(),
            enable_cors: default_true(),
            log_level: default_log_level(),
            model_dir: default_model_dir(),
            extractor: ExtractorConfig::default(),
            ensemble: EnsembleConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from `.env`, `server.toml` and `MEDGUARD_SERVER__*`
    /// environment variables, later sources winning.
    pub fn load() -> anyhow::Result<Self> {
        if let Ok(path) = dotenvy::dotenv() {
            tracing::debug!(path = %path.display(), "loaded .env");
        }

        let builder = config::Config::builder()
            // Load from file if exists
            .add_source(config::File::with_name("server").required(false))
            // Override with environment variables
            .add_source(config::Environment::with_prefix("MEDGUARD_SERVER").separator("__"));

        let config: ServerConfig = builder.build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_body_size_mb == 0 {
            anyhow::bail!("max_body_size_mb must be positive");
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("timeout_secs must be positive");
        }
        self.extractor.validate()?;
        self.ensemble.validate()?;
        Ok(())
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> anyhow::Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.bind_addr, self.port);
        Ok(addr_str.parse()?)
    }

    /// Get request timeout as Duration
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Get max body size in bytes
    pub fn max_body_size(&self) -> usize {
        self.max_body_size_mb * 1024 * 1024
    }
}

fn default_bind_addr() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_max_body_size_mb() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_model_dir() -> PathBuf {
    PathBuf::from("models")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.port, 8000);
        assert_eq!(cfg.timeout_secs, 30);
        assert_eq!(cfg.max_body_size(), 10 * 1024 * 1024);
        assert_eq!(cfg.model_dir, PathBuf::from("models"));
        assert!(cfg.enable_cors);
        assert_eq!(cfg.ensemble.high_confidence_threshold, 0.7);
    }

    #[test]
    fn test_socket_addr() {
        let cfg = ServerConfig::default();
        let addr = cfg.socket_addr().unwrap();
        assert_eq!(addr.port(), 8000);
    }

    #[test]
    fn test_validation() {
        let mut cfg = ServerConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.ensemble.high_confidence_threshold = 0.4;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg: ServerConfig =
            serde_json::from_str(r#"{"port": 9000, "extractor": {"image_size": 64}}"#).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.extractor.image_size, 64);
        assert_eq!(cfg.extractor.batch_size, 32);
        assert_eq!(cfg.log_level, "info");
    }
}
