// src/config.rs

use serde::Deserialize;

use crate::protocol::ProtocolVariant;

/// Top-level feed configuration loaded from `config/sources.toml`.
#[derive(Debug, Deserialize, Clone)]
pub struct FeedConfig {
    #[serde(default = "default_retention_secs")]
    pub retention_secs: f64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: f64,
    #[serde(rename = "source", default = "default_sources")]
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SourceConfig {
    pub id: u8,
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub variant: Variant,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Variant {
    V09,
    V20,
}

impl From<Variant> for ProtocolVariant {
    fn from(v: Variant) -> Self {
        match v {
            Variant::V09 => ProtocolVariant::V09,
            Variant::V20 => ProtocolVariant::V20,
        }
    }
}

fn default_retention_secs() -> f64 {
    60.0
}

fn default_sweep_interval_secs() -> f64 {
    5.0
}

fn default_port() -> u16 {
    443
}

/// The four mirrors this feed knows about out of the box: `ws`/`ws1` speak
/// the older V09 handshake, `ws2`/`ws3` speak V20.
fn default_sources() -> Vec<SourceConfig> {
    vec![
        SourceConfig { id: 1, host: "ws.bitcoin.de".to_string(), port: 443, variant: Variant::V09 },
        SourceConfig { id: 2, host: "ws1.bitcoin.de".to_string(), port: 443, variant: Variant::V09 },
        SourceConfig { id: 3, host: "ws2.bitcoin.de".to_string(), port: 443, variant: Variant::V20 },
        SourceConfig { id: 4, host: "ws3.bitcoin.de".to_string(), port: 443, variant: Variant::V20 },
    ]
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
            sources: default_sources(),
        }
    }
}

impl FeedConfig {
    pub fn load(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }
}
