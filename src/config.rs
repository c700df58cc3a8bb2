//! Service configuration persisted as TOML

use crate::eviction::{RetentionPolicy, TemplatePolicy};
use crate::protocol::DEFAULT_MAX_FILE_SIZE;
use crate::writer::{HeadOfLine, WriterConfig};
use anyhow::{Context, Result};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/usr/local/etc/ftserver.toml";

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub ntp: NtpSection,
    pub database: DatabaseSection,
    pub storage: StorageSection,
    pub template: TemplateSection,
    pub writer: WriterSection,
    pub log: LogSection,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSection {
    pub port: u16,
    /// Listener for the downstream consumer; absent disables it
    pub downstream_port: Option<u16>,
    pub max_file_size: u64,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            port: 4020,
            downstream_port: Some(4021),
            max_file_size: DEFAULT_MAX_FILE_SIZE,
        }
    }
}

/// Clock discipline is left to the host; kept so existing files load.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NtpSection {
    pub enabled: bool,
    pub host: String,
    pub max_difference_ms: u64,
}

impl Default for NtpSection {
    fn default() -> Self {
        Self {
            enabled: false,
            host: "172.28.1.3".to_string(),
            max_difference_ms: 5,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DatabaseSection {
    pub enabled: bool,
    pub url: String,
    /// Zone of `tmobs`; the host's zone when absent
    pub utc_offset_hours: Option<i32>,
}

impl Default for DatabaseSection {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "http://172.28.8.8:8080/gwebend/".to_string(),
            utc_offset_hours: None,
        }
    }
}

impl DatabaseSection {
    pub fn utc_offset(&self) -> Option<FixedOffset> {
        self.utc_offset_hours
            .and_then(|h| FixedOffset::east_opt(h.saturating_mul(3600)))
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct StorageSection {
    pub auto_free: bool,
    pub min_free_gb: u64,
    /// Volume currently written; saved back on shutdown
    pub index: usize,
    pub volumes: Vec<PathBuf>,
    pub notify_enabled: bool,
    pub notify_path: PathBuf,
    pub prefix: String,
    pub retention_days: i64,
}

impl Default for StorageSection {
    fn default() -> Self {
        Self {
            auto_free: true,
            min_free_gb: 100,
            index: 0,
            volumes: vec!["/data1".into(), "/data2".into(), "/data3".into()],
            notify_enabled: true,
            notify_path: "/data/GWAC/xMatch_Dir/LocalStorage.txt".into(),
            prefix: "G".to_string(),
            retention_days: 3,
        }
    }
}

impl StorageSection {
    pub fn retention(&self) -> Option<RetentionPolicy> {
        self.auto_free.then(|| RetentionPolicy {
            prefix: self.prefix.clone(),
            delete_after_days: self.retention_days,
        })
    }

    pub fn notify(&self) -> Option<PathBuf> {
        self.notify_enabled.then(|| self.notify_path.clone())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TemplateSection {
    pub auto_free: bool,
    pub min_free_gb: u64,
    pub paths: Vec<PathBuf>,
    pub strip_after_days: i64,
    pub delete_after_days: i64,
    pub strip_min_kb: u64,
}

impl Default for TemplateSection {
    fn default() -> Self {
        Self {
            auto_free: true,
            min_free_gb: 1000,
            paths: vec!["/data/GWAC/output".into(), "/data/GWAC/gwacsub".into()],
            strip_after_days: 3,
            delete_after_days: 10,
            strip_min_kb: 100,
        }
    }
}

impl TemplateSection {
    pub fn policy(&self, prefix: &str) -> Option<(Vec<PathBuf>, TemplatePolicy)> {
        if !self.auto_free || self.paths.is_empty() {
            return None;
        }
        Some((
            self.paths.clone(),
            TemplatePolicy {
                prefix: prefix.to_string(),
                strip_after_days: self.strip_after_days,
                delete_after_days: self.delete_after_days,
                strip_min_bytes: self.strip_min_kb.saturating_mul(1024),
                min_free_gb: self.min_free_gb,
            },
        ))
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum HeadOfLineMode {
    Retry,
    Skip,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WriterSection {
    pub max_failures: u32,
    pub backoff_secs: u64,
    pub head_of_line: HeadOfLineMode,
    pub skip_after_attempts: u32,
}

impl Default for WriterSection {
    fn default() -> Self {
        Self {
            max_failures: 5,
            backoff_secs: 60,
            head_of_line: HeadOfLineMode::Retry,
            skip_after_attempts: 3,
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LogSection {
    /// Daily log files go here; console when absent
    pub dir: Option<PathBuf>,
}

impl Config {
    pub fn writer_config(&self) -> WriterConfig {
        let w = &self.writer;
        WriterConfig {
            max_failures: w.max_failures.max(1),
            backoff: Duration::from_secs(w.backoff_secs),
            head_of_line: match w.head_of_line {
                HeadOfLineMode::Retry => HeadOfLine::Retry,
                HeadOfLineMode::Skip => HeadOfLine::Skip {
                    after_attempts: w.skip_after_attempts.max(1),
                },
            },
            utc_offset: self.database.utc_offset(),
        }
    }

    pub fn validate(&mut self) -> Result<()> {
        if self.storage.volumes.is_empty() {
            anyhow::bail!("[storage] volumes must name at least one directory");
        }
        if self.storage.index >= self.storage.volumes.len() {
            self.storage.index = 0;
        }
        Ok(())
    }
}

pub fn load(path: &Path) -> Result<Config> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("read {}", path.display()))?;
    let cfg: Config = toml::from_str(&data)
        .with_context(|| format!("parse {}", path.display()))?;
    Ok(cfg)
}

/// Load `path`; when it is missing or malformed, write defaults there and use
/// them. The second value carries the reason defaults were used.
pub fn load_or_init(path: &Path) -> Result<(Config, Option<String>)> {
    let (mut cfg, fallback) = match load(path) {
        Ok(cfg) => (cfg, None),
        Err(e) => {
            let cfg = Config::default();
            save(&cfg, path)?;
            (cfg, Some(format!("{e:#}; wrote defaults to {}", path.display())))
        }
    };
    cfg.validate()?;
    Ok((cfg, fallback))
}

pub fn write_default(path: &Path) -> Result<Config> {
    let cfg = Config::default();
    save(&cfg, path)?;
    Ok(cfg)
}

pub fn save(cfg: &Config, path: &Path) -> Result<()> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    let data = toml::to_string_pretty(cfg)?;
    // atomic write
    let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
    use std::io::Write as _;
    tmp.write_all(data.as_bytes())?;
    tmp.flush()?;
    tmp.persist(path)
        .with_context(|| format!("write {}", path.display()))?;
    Ok(())
}

/// Rewrite only the storage index of the file at `path`. An unreadable file
/// is left alone.
pub fn persist_index(path: &Path, index: usize) -> Result<()> {
    let mut cfg = load(path).context("storage index not saved")?;
    if cfg.storage.index == index {
        return Ok(());
    }
    cfg.storage.index = index;
    save(&cfg, path)
}
