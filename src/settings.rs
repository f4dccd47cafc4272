use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use config::{Config, ConfigError, Environment, Map, Source, Value};

use crate::compliance::dot1x;
use crate::extract::DEFAULT_MAX_DEPTH;
use crate::index::elastic::Credentials;
use crate::index::RetryPolicy;

pub const ENV_PREFIX: &str = "NETAUDIT";
pub const DEFAULT_SECRETS: &str = "secrets.env";
pub const DEFAULT_INDEX: &str = "dot1x-compliance";

const DEFAULT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_BACKOFF_MS: u64 = 2000;

#[derive(Debug, Clone)]
pub struct Settings {
    pub es_host: Option<String>,
    pub es_user: Option<String>,
    pub es_pass: Option<String>,
    pub index: String,
    pub config_dir: PathBuf,
    pub output_dir: PathBuf,
    pub db_path: PathBuf,
    pub workers: usize,
    pub timeout: Duration,
    pub max_retries: u32,
    pub backoff: Duration,
    pub max_depth: usize,
    pub exemption_phrases: Vec<String>,
}

impl Settings {
    pub fn load(secrets: &Path) -> Result<Self> {
        Self::from_sources(secrets, Environment::with_prefix(ENV_PREFIX))
    }

    fn from_sources(secrets: &Path, env: Environment) -> Result<Self> {
        let cfg = Config::builder()
            .add_source(SecretsFile::new(secrets))
            .add_source(env)
            .build()
            .with_context(|| format!("Failed to load settings from {:?}", secrets))?;
        Self::from_config(&cfg)
    }

    fn from_config(cfg: &Config) -> Result<Self> {
        let workers = match lookup(cfg, "workers") {
            Some(_) => parsed(cfg, "workers", 1usize)?,
            None => std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
        };
        let exemption_phrases = match lookup(cfg, "exemption_phrases") {
            Some(list) => list
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect(),
            None => dot1x::default_phrases(),
        };

        Ok(Settings {
            es_host: lookup(cfg, "es_host"),
            es_user: lookup(cfg, "es_user"),
            es_pass: lookup(cfg, "es_pass"),
            index: lookup(cfg, "index").unwrap_or_else(|| DEFAULT_INDEX.to_string()),
            config_dir: path(cfg, "config_dir", "configs"),
            output_dir: path(cfg, "output_dir", "ndjson"),
            db_path: path(cfg, "db_path", "data/netaudit.sqlite"),
            workers,
            timeout: Duration::from_secs(parsed(cfg, "timeout_secs", DEFAULT_TIMEOUT_SECS)?),
            max_retries: parsed(cfg, "max_retries", DEFAULT_MAX_RETRIES)?,
            backoff: Duration::from_millis(parsed(cfg, "backoff_ms", DEFAULT_BACKOFF_MS)?),
            max_depth: parsed(cfg, "max_depth", DEFAULT_MAX_DEPTH)?,
            exemption_phrases,
        })
    }

    pub fn es_host(&self) -> Result<&str> {
        self.es_host
            .as_deref()
            .ok_or_else(|| anyhow!("ES_HOST is not set (secrets file or {}_ES_HOST)", ENV_PREFIX))
    }

    pub fn credentials(&self) -> Option<Credentials> {
        match (&self.es_user, &self.es_pass) {
            (Some(user), Some(password)) => Some(Credentials {
                user: user.clone(),
                password: password.clone(),
            }),
            _ => None,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_backoff: self.backoff,
        }
    }
}

/// `KEY=VALUE` lines split on the first `=`. Values are kept as written: no
/// quoting, escapes or inline comments, so passwords survive untouched.
/// A missing file contributes nothing.
#[derive(Debug, Clone)]
struct SecretsFile {
    path: PathBuf,
}

impl SecretsFile {
    fn new(path: &Path) -> Self {
        SecretsFile {
            path: path.to_path_buf(),
        }
    }
}

impl Source for SecretsFile {
    fn clone_into_box(&self) -> Box<dyn Source + Send + Sync> {
        Box::new(self.clone())
    }

    fn collect(&self) -> Result<Map<String, Value>, ConfigError> {
        let text = match std::fs::read_to_string(&self.path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Map::new()),
            Err(e) => return Err(ConfigError::Foreign(Box::new(e))),
        };

        let origin = self.path.display().to_string();
        let mut map = Map::new();
        for line in text.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once('=') {
                let key = key.trim().to_lowercase();
                if !key.is_empty() {
                    map.insert(key, Value::new(Some(&origin), value.trim().to_string()));
                }
            }
        }
        Ok(map)
    }
}

fn lookup(cfg: &Config, key: &str) -> Option<String> {
    cfg.get_string(key)
        .or_else(|_| cfg.get_string(&key.to_uppercase()))
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn path(cfg: &Config, key: &str, default: &str) -> PathBuf {
    PathBuf::from(lookup(cfg, key).unwrap_or_else(|| default.to_string()))
}

fn parsed<T: FromStr>(cfg: &Config, key: &str, default: T) -> Result<T> {
    match lookup(cfg, key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|_| anyhow!("Invalid value for {}: {:?}", key, raw)),
    }
}

// ── Tests ──
