use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize)]
pub struct Config {
    pub version: u32,
    pub database: Database,
    pub files: FilesConfig,
    #[serde(default)]
    pub waveform: WaveformConfig,
    pub http: HttpConfig,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Config> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&contents).with_context(|| "Failed to parse config TOML")
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct HttpConfig {
    pub bind_addr: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Database {
    pub in_memory: bool,
    pub path: Option<PathBuf>,
}

/// Local object store holding uploaded audio.
#[derive(Debug, Deserialize, Clone)]
pub struct FilesConfig {
    pub root: PathBuf,
    /// Prefix of every issued `fileUrl`.
    #[serde(default = "default_files_base_url")]
    pub base_url: String,
}

fn default_files_base_url() -> String {
    "/files".to_string()
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WaveformConfig {
    pub peaks_per_second: u32,
    pub simplified_points: usize,
    pub extraction_timeout_secs: u64,
}

impl Default for WaveformConfig {
    fn default() -> Self {
        Self {
            peaks_per_second: 50,
            simplified_points: 200,
            extraction_timeout_secs: 120,
        }
    }
}
