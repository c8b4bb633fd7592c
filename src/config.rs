use crate::capture::{CaptureOptions, Recording};
use crate::models::record::Tags;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,

    #[serde(default)]
    pub buffer: BufferConfig,

    #[serde(default)]
    pub flush: FlushConfig,

    #[serde(default)]
    pub capture: CaptureConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Host metric sampling period in milliseconds
    pub metrics_interval_ms: u64,
    /// Window between the two /proc/stat reads of one CPU sample
    pub cpu_sample_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum records held in memory; oldest are evicted beyond this.
    /// Signed so that a bad value is reported instead of failing to parse.
    pub capacity: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FlushConfig {
    /// Flush period in milliseconds
    pub interval_ms: u64,
    /// Max records per flush. 0 = everything buffered.
    pub max_batch: usize,
    /// Spool file override. Unset = <data dir>/traceway/spool.jsonl
    #[serde(skip_serializing_if = "Option::is_none")]
    pub spool_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Re-raise handler panics after recording them.
    pub repanic: bool,
    /// Record requests that matched no route.
    pub record_unmatched: bool,
    /// Request parts copied into tags: any of "url", "query", "body", "header".
    pub recording: Vec<String>,
    /// Added as the `server_name` tag on every record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
    /// Added as the `version` tag on every record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

// ── Defaults ─────────────────────────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self { metrics_interval_ms: 10_000, cpu_sample_ms: 1_000 }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self { capacity: 1_000 }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self { interval_ms: 5_000, max_batch: 0, spool_path: None }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            repanic:          true,
            record_unmatched: false,
            recording:        Vec::new(),
            server_name:      None,
            version:          None,
        }
    }
}

impl CaptureConfig {
    pub fn options(&self) -> CaptureOptions {
        let mut tags = Tags::new();
        if let Some(name) = &self.server_name {
            tags.insert("server_name".into(), name.clone());
        }
        if let Some(v) = &self.version {
            tags.insert("version".into(), v.clone());
        }
        CaptureOptions {
            repanic:          self.repanic,
            record_unmatched: self.record_unmatched,
            recording:        Recording::from_names(&self.recording),
            default_tags:     tags,
        }
    }
}

// ── Load / Save ───────────────────────────────────────────────────────

impl Config {
    pub fn load() -> Self {
        match try_load() {
            Ok(c)  => c,
            Err(e) => {
                tracing::debug!("using default config: {:#}", e);
                // Write defaults on first run (best-effort)
                if let Err(e) = try_write_defaults() {
                    tracing::debug!("could not write default config: {:#}", e);
                }
                Config::default()
            }
        }
    }

    pub fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("traceway").join("traceway.toml"))
    }

    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("invalid traceway config")
    }

    /// Configured spool path, falling back to the per-user data dir.
    pub fn spool_path(&self) -> Option<PathBuf> {
        self.flush.spool_path.clone().or_else(crate::flusher::SpoolSink::default_path)
    }
}

fn try_load() -> Result<Config> {
    let path = Config::config_path().ok_or_else(|| anyhow::anyhow!("no config dir"))?;
    let text = fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    Config::from_toml_str(&text)
}

fn try_write_defaults() -> Result<()> {
    let path = Config::config_path().ok_or_else(|| anyhow::anyhow!("no config dir"))?;
    if path.exists() {
        return Ok(());
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let text = toml::to_string_pretty(&Config::default())?;
    fs::write(path, format!("# traceway-agent configuration\n# Generated on first run, edit freely\n\n{}", text))?;
    Ok(())
}
