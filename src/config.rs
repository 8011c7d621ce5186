use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

pub const DEFAULT_ADDR: &str = ":2537";
pub const DEFAULT_URL_ALPHABET: &str =
    "VPQRXAZabBCDNkYcWMIist5EFLvlmnGHu34wxyz0hSTJKOdefgU6j12opqr978-_";

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Bootstrap {
    #[serde(default)]
    pub strict: bool,
    #[serde(default)]
    pub pidfile: Option<String>,
    #[serde(default)]
    pub logger: Logger,
    #[serde(default)]
    pub server: Server,
    #[serde(default)]
    pub upstream: Upstream,
    #[serde(default)]
    pub storage: Storage,
    #[serde(default)]
    pub coordinator: Coordinator,
    #[serde(default)]
    pub tally: Tally,
}

impl Bootstrap {
    pub fn validate(&self) -> Result<()> {
        if self.server.addr.trim().is_empty() {
            return Err(anyhow!("server.addr is required"));
        }
        if self.upstream.max_attempts == 0 {
            return Err(anyhow!("upstream.max_attempts must be at least 1"));
        }
        if self.storage.path.as_os_str().is_empty() {
            return Err(anyhow!("storage.path must not be empty"));
        }
        if let Some(alphabet) = self.server.url_alphabet.as_deref() {
            if !alphabet.is_empty() && alphabet.len() != 64 {
                return Err(anyhow!("server.url_alphabet must have 64 characters"));
            }
        }
        Ok(())
    }

    /// Fills in the cache directory next to the executable when none is configured.
    pub fn resolve_storage_path(&mut self) -> Result<()> {
        if !self.storage.path.as_os_str().is_empty() {
            return Ok(());
        }
        let exe = std::env::current_exe().context("locate executable")?;
        let dir = exe.parent().unwrap_or_else(|| Path::new("."));
        self.storage.path = dir.join("cache");
        Ok(())
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Logger {
    #[serde(default)]
    pub level: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub caller: bool,
    #[serde(default)]
    pub traceid: bool,
    #[serde(default)]
    pub max_size: u64,
    #[serde(default)]
    pub max_backups: u64,
    #[serde(default)]
    pub nopid: bool,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Server {
    #[serde(default = "default_addr")]
    pub addr: String,
    /// Base64 alphabet used by `/pic?url=`. `None` selects the built-in
    /// alphabet, an empty string accepts plain URLs.
    #[serde(default)]
    pub url_alphabet: Option<String>,
}

impl Default for Server {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            url_alphabet: None,
        }
    }
}

impl Server {
    pub fn alphabet(&self) -> Option<&str> {
        match self.url_alphabet.as_deref() {
            None => Some(DEFAULT_URL_ALPHABET),
            Some("") => None,
            Some(alphabet) => Some(alphabet),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Upstream {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_backoff_unit", with = "humantime_serde")]
    pub backoff_unit: Duration,
    #[serde(default = "default_attempt_timeout", with = "humantime_serde")]
    pub attempt_timeout: Duration,
    #[serde(default = "default_terminal_status")]
    pub terminal_status: Vec<u16>,
    #[serde(default)]
    pub max_idle_conns_per_host: usize,
    #[serde(default)]
    pub max_connections_per_server: usize,
    #[serde(default)]
    pub user_agent: Option<String>,
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_unit: default_backoff_unit(),
            attempt_timeout: default_attempt_timeout(),
            terminal_status: default_terminal_status(),
            max_idle_conns_per_host: 0,
            max_connections_per_server: 0,
            user_agent: None,
        }
    }
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Storage {
    #[serde(default)]
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Default, Clone)]
pub struct Coordinator {
    /// How long a failed identifier keeps answering with its last error.
    #[serde(default, with = "humantime_serde")]
    pub failure_cooldown: Duration,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Tally {
    #[serde(default = "default_tally_threshold")]
    pub threshold: u64,
    #[serde(default = "default_poll_timeout", with = "humantime_serde")]
    pub poll_timeout: Duration,
}

impl Default for Tally {
    fn default() -> Self {
        Self {
            threshold: default_tally_threshold(),
            poll_timeout: default_poll_timeout(),
        }
    }
}

fn default_addr() -> String {
    DEFAULT_ADDR.to_string()
}

fn default_max_attempts() -> u32 {
    2
}

fn default_backoff_unit() -> Duration {
    Duration::from_millis(500)
}

fn default_attempt_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_terminal_status() -> Vec<u16> {
    vec![404]
}

fn default_tally_threshold() -> u64 {
    5
}

fn default_poll_timeout() -> Duration {
    Duration::from_secs(30)
}

pub fn load(path: &Path) -> Result<(Bootstrap, Vec<String>)> {
    let raw = fs::read_to_string(path).with_context(|| format!("read config {}", path.display()))?;
    parse(&raw).with_context(|| format!("parse config {}", path.display()))
}

pub fn parse(raw: &str) -> Result<(Bootstrap, Vec<String>)> {
    let mut ignored = Vec::new();
    let de = serde_yaml::Deserializer::from_str(raw);
    let cfg: Bootstrap = serde_ignored::deserialize(de, |path| {
        ignored.push(path.to_string());
    })?;
    Ok((cfg, ignored))
}
