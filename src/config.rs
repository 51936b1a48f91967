// src/config.rs
use serde::Deserialize;
use std::{fs, path::Path};

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub capture: CaptureCfg,
    #[serde(default)]
    pub engine: EngineCfg,
    #[serde(default)]
    pub api: ApiCfg,
    #[serde(default)]
    pub fetch: Option<FetchCfg>,
    #[serde(default)]
    pub fightlog: FightLogCfg,
    #[serde(default)]
    pub metrics: Option<MetricsCfg>,
    #[serde(default)]
    pub general: General,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct General {
    #[serde(default)]
    pub json_logs: bool, // structured JSON logs to stdout
}

#[derive(Debug, Clone, Deserialize)]
pub struct CaptureCfg {
    /// Interface name (e.g. "eth0"); empty selects the default device.
    #[serde(default)]
    pub iface: String,
    /// Game server TCP port the BPF filter selects.
    #[serde(default = "default_capture_port")]
    pub port: u16,
    /// Hex string of the handshake marker opening each flow. Overridable
    /// because the marker differs between game builds.
    #[serde(default = "default_signature")]
    pub signature: String,
    #[serde(default = "default_frame_queue")]
    pub frame_queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineCfg {
    /// Wipe combat data when no event arrives for idle_clear_ms.
    #[serde(default = "default_true")]
    pub auto_clear_on_timeout: bool,
    #[serde(default = "default_idle_clear_ms")]
    pub idle_clear_ms: u64,
    /// Wipe combat data when the scene changes.
    #[serde(default)]
    pub clear_on_scene_change: bool,
    /// Evict flows with no traffic for this long.
    #[serde(default = "default_flow_idle_ms")]
    pub flow_idle_ms: u64,
    /// Per-flow reorder buffer cap in bytes; overflow forces a resync.
    #[serde(default = "default_reorder_cap")]
    pub reorder_cap_bytes: usize,
}

impl Default for EngineCfg {
    fn default() -> Self {
        Self {
            auto_clear_on_timeout: true,
            idle_clear_ms: default_idle_clear_ms(),
            clear_on_scene_change: false,
            flow_idle_ms: default_flow_idle_ms(),
            reorder_cap_bytes: default_reorder_cap(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiCfg {
    /// Local HTTP port the UI reads snapshots from.
    #[serde(default = "default_local_port")]
    pub local_port: u16,
    /// Websocket push feed port; defaults to local_port + 1.
    #[serde(default)]
    pub ws_port: Option<u16>,
    /// Push-feed snapshot cadence.
    #[serde(default = "default_push_ms")]
    pub push_interval_ms: u64,
}

impl ApiCfg {
    pub fn ws_port(&self) -> u16 {
        self.ws_port.unwrap_or_else(|| self.local_port.saturating_add(1))
    }
}

impl Default for ApiCfg {
    fn default() -> Self {
        Self {
            local_port: default_local_port(),
            ws_port: None,
            push_interval_ms: default_push_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchCfg {
    /// Player-metadata endpoint; queried per unknown uid.
    pub url: String,
    #[serde(default = "default_fetch_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_fetch_queue")]
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FightLogCfg {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_log_dir")]
    pub dir: String,
}

impl Default for FightLogCfg {
    fn default() -> Self {
        Self { enable: false, dir: default_log_dir() }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MetricsCfg {
    /// Bind address for the Prometheus exporter (e.g. "127.0.0.1:9100").
    pub bind: String,
}

fn default_capture_port() -> u16 { 9002 }
fn default_local_port() -> u16 { 8989 }
fn default_true() -> bool { true }
fn default_idle_clear_ms() -> u64 { 20_000 }
fn default_flow_idle_ms() -> u64 { 120_000 }
fn default_reorder_cap() -> usize { 1 << 20 }
fn default_frame_queue() -> usize { 65_536 }
fn default_push_ms() -> u64 { 200 }
fn default_fetch_timeout_ms() -> u64 { 10_000 }
fn default_fetch_queue() -> usize { 256 }
fn default_log_dir() -> String { "logs".to_string() }
fn default_signature() -> String { "00 63 33 53 42 00".to_string() }

impl AppConfig {
    pub fn from_file(p: &Path) -> anyhow::Result<Self> {
        let s = fs::read_to_string(p)?;
        let cfg: AppConfig = toml::from_str(&s)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.capture.port == 0 {
            anyhow::bail!("capture.port must be non-zero");
        }
        let sig = crate::util::parse_hex(&self.capture.signature)
            .ok_or_else(|| anyhow::anyhow!("capture.signature must be a hex string"))?;
        if sig.is_empty() || sig.len() > 64 {
            anyhow::bail!("capture.signature must decode to 1..=64 bytes");
        }
        if self.capture.frame_queue_capacity == 0 {
            anyhow::bail!("capture.frame_queue_capacity must be > 0");
        }
        if self.engine.idle_clear_ms == 0 {
            anyhow::bail!("engine.idle_clear_ms must be > 0");
        }
        if self.engine.flow_idle_ms == 0 {
            anyhow::bail!("engine.flow_idle_ms must be > 0");
        }
        if self.engine.reorder_cap_bytes < 4096 {
            anyhow::bail!("engine.reorder_cap_bytes must be >= 4096");
        }
        if self.api.local_port == 0 {
            anyhow::bail!("api.local_port must be non-zero");
        }
        if self.api.push_interval_ms == 0 {
            anyhow::bail!("api.push_interval_ms must be > 0");
        }
        if let Some(ref f) = self.fetch {
            if f.url.trim().is_empty() {
                anyhow::bail!("fetch.url must be non-empty when fetch is configured");
            }
            if f.timeout_ms == 0 {
                anyhow::bail!("fetch.timeout_ms must be > 0");
            }
            if f.queue_capacity == 0 {
                anyhow::bail!("fetch.queue_capacity must be > 0");
            }
        }
        if self.fightlog.enable && self.fightlog.dir.trim().is_empty() {
            anyhow::bail!("fightlog.dir must be non-empty when fightlog.enable = true");
        }
        if let Some(ref m) = self.metrics {
            if !m.bind.contains(':') {
                anyhow::bail!("metrics.bind must be host:port");
            }
        }
        Ok(())
    }

    /// Decoded handshake marker bytes. Valid after `validate()`.
    pub fn signature_bytes(&self) -> Vec<u8> {
        crate::util::parse_hex(&self.capture.signature).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_sections() {
        let cfg: AppConfig = toml::from_str("[capture]\niface = \"eth0\"\n").unwrap();
        cfg.validate().unwrap();
        assert_eq!(cfg.capture.port, 9002);
        assert_eq!(cfg.api.local_port, 8989);
        assert!(cfg.engine.auto_clear_on_timeout);
        assert_eq!(cfg.engine.idle_clear_ms, 20_000);
        assert_eq!(cfg.engine.flow_idle_ms, 120_000);
        assert!(!cfg.fightlog.enable);
    }

    #[test]
    fn unknown_keys_are_ignored() {
        let cfg: AppConfig =
            toml::from_str("[capture]\niface = \"eth0\"\nshinyNewOption = 3\n").unwrap();
        cfg.validate().unwrap();
    }

    #[test]
    fn bad_signature_rejected() {
        let cfg: AppConfig =
            toml::from_str("[capture]\niface = \"e\"\nsignature = \"zz\"\n").unwrap();
        assert!(cfg.validate().is_err());
    }
}
