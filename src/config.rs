//! Server configuration.
//!
//! Loaded from a YAML file (`bastion.yaml`, overridable via the
//! `BASTION_CONFIG` environment variable); every field has a default so a
//! missing file still yields a runnable server.

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Plain-HTTP listen address.
    pub listen_addr: String,
    /// Optional TLS listen address; requires `tls` to be set.
    pub tls_listen_addr: Option<String>,
    /// Certificate material for the default virtual host.
    pub tls: Option<TlsConfig>,
    /// Worker threads executing handlers.
    pub workers: usize,
    /// Bounded dispatch queue depth; excess requests are shed with 503.
    pub queue_depth: usize,
    /// Ring-buffer capacity per streamed response, in bytes.
    pub stream_buffer: usize,
    /// Default request-body ceiling, in bytes.
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert: String,
    pub key: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            tls_listen_addr: None,
            tls: None,
            workers: 8,
            queue_depth: 64,
            stream_buffer: 16 * 1024,
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let path =
            std::env::var("BASTION_CONFIG").unwrap_or_else(|_| "bastion.yaml".to_string());
        match std::fs::read_to_string(&path) {
            Ok(text) => {
                serde_yaml::from_str(&text).with_context(|| format!("parse config {path}"))
            }
            Err(_) => {
                let mut config = Config::default();
                if let Ok(addr) = std::env::var("LISTEN") {
                    config.listen_addr = addr;
                }
                Ok(config)
            }
        }
    }
}
