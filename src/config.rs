//! Engine configuration: CLI flags (`--name value`) and Redis-style
//! `name value` config files, both funnelled through [`EngineConfig::apply`].

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::keyspace::{EvictionPolicy, DEFAULT_DATABASES};

const DEFAULT_BACKLOG_SIZE: usize = 1024 * 1024;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid command line flag: {0}")]
    InvalidCommandLineFlag(String),
    #[error("Missing value for '{0}'")]
    MissingValue(String),
    #[error("Unknown configuration directive '{0}'")]
    UnknownDirective(String),
    #[error("Invalid value '{value}' for '{name}'")]
    InvalidValue { name: String, value: String },
    #[error("Failed to read config file {path}: {reason}")]
    ConfigFile { path: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub databases: usize,
    /// Memory ceiling in bytes; 0 disables eviction.
    pub max_memory: usize,
    pub eviction_policy: EvictionPolicy,
    pub dir: PathBuf,
    pub append_only: bool,
    pub append_filename: String,
    pub db_filename: String,
    pub backlog_size: usize,
    pub flush_interval: Duration,
    pub active_expire_interval: Duration,
    pub rdb_compression: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            databases: DEFAULT_DATABASES,
            max_memory: 0,
            eviction_policy: EvictionPolicy::NoEviction,
            dir: PathBuf::from("."),
            append_only: false,
            append_filename: "appendonly.aof".to_string(),
            db_filename: "dump.rdb".to_string(),
            backlog_size: DEFAULT_BACKLOG_SIZE,
            flush_interval: Duration::from_secs(1),
            active_expire_interval: Duration::from_millis(100),
            rdb_compression: true,
        }
    }
}

impl EngineConfig {
    /// Builds a config from process arguments (the first one is skipped).
    ///
    /// An optional leading argument that is not a flag names a config file,
    /// which is applied before the flags that follow it.
    ///
    /// # Examples
    ///
    /// ```ignore
    /// let config = EngineConfig::from_args(std::env::args())?;
    /// // redis-engine engine.conf --maxmemory 100mb --appendonly yes
    /// ```
    pub fn from_args<I: IntoIterator<Item = String>>(command_line_args: I) -> Result<Self, ConfigError> {
        let mut iter = command_line_args.into_iter().skip(1).peekable();
        let mut config = EngineConfig::default();

        if let Some(path) = iter.next_if(|arg| !arg.starts_with("--")) {
            let contents = std::fs::read_to_string(&path).map_err(|e| ConfigError::ConfigFile {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            config.apply_conf_str(&contents)?;
        }

        while let Some(arg) = iter.next() {
            if !arg.starts_with("--") {
                return Err(ConfigError::InvalidCommandLineFlag(arg));
            }
            let name = &arg[2..];

            let Some(value) = iter.next() else {
                return Err(ConfigError::MissingValue(name.to_string()));
            };

            config.apply(name, &value)?;
        }

        Ok(config)
    }

    /// Parses a config file body: one `name value` directive per line,
    /// blank lines and `#` comments ignored.
    pub fn from_conf_str(contents: &str) -> Result<Self, ConfigError> {
        let mut config = EngineConfig::default();
        config.apply_conf_str(contents)?;
        Ok(config)
    }

    fn apply_conf_str(&mut self, contents: &str) -> Result<(), ConfigError> {
        for line in contents.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let (name, value) = match line.split_once(char::is_whitespace) {
                Some((name, value)) => (name, value.trim().trim_matches('"')),
                None => return Err(ConfigError::MissingValue(line.to_string())),
            };

            self.apply(name, value)?;
        }

        Ok(())
    }

    /// Applies one directive. Names are case-insensitive.
    pub fn apply(&mut self, name: &str, value: &str) -> Result<(), ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            name: name.to_string(),
            value: value.to_string(),
        };

        match name.to_ascii_lowercase().as_str() {
            "databases" => {
                let databases = value.parse::<usize>().map_err(|_| invalid())?;
                if databases == 0 {
                    return Err(invalid());
                }
                self.databases = databases;
            }
            "maxmemory" => self.max_memory = parse_memory(value).ok_or_else(invalid)?,
            "maxmemory-policy" => self.eviction_policy = value.parse().map_err(|_| invalid())?,
            "dir" => self.dir = PathBuf::from(value),
            "appendonly" => self.append_only = parse_bool(value).ok_or_else(invalid)?,
            "appendfilename" => self.append_filename = value.to_string(),
            "dbfilename" => self.db_filename = value.to_string(),
            "repl-backlog-size" => {
                let size = parse_memory(value).ok_or_else(invalid)?;
                if size == 0 {
                    return Err(invalid());
                }
                self.backlog_size = size;
            }
            "appendfsync-interval-ms" => {
                self.flush_interval = parse_interval(value).ok_or_else(invalid)?
            }
            "active-expire-interval-ms" => {
                self.active_expire_interval = parse_interval(value).ok_or_else(invalid)?
            }
            "rdbcompression" => self.rdb_compression = parse_bool(value).ok_or_else(invalid)?,
            _ => return Err(ConfigError::UnknownDirective(name.to_string())),
        }

        Ok(())
    }

    pub fn append_path(&self) -> PathBuf {
        self.dir.join(&self.append_filename)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.dir.join(&self.db_filename)
    }
}

/// Byte counts with an optional `b`, `k`/`kb`, `m`/`mb` or `g`/`gb`
/// suffix. `k` is 1000 and `kb` is 1024, as in redis.conf.
fn parse_memory(value: &str) -> Option<usize> {
    let lower = value.trim().to_ascii_lowercase();
    let split = lower
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(lower.len());
    let (digits, unit) = lower.split_at(split);

    let multiplier: usize = match unit {
        "" | "b" => 1,
        "k" => 1_000,
        "kb" => 1_024,
        "m" => 1_000_000,
        "mb" => 1_024 * 1_024,
        "g" => 1_000_000_000,
        "gb" => 1_024 * 1_024 * 1_024,
        _ => return None,
    };

    digits.parse::<usize>().ok()?.checked_mul(multiplier)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "yes" | "true" | "1" => Some(true),
        "no" | "false" | "0" => Some(false),
        _ => None,
    }
}

fn parse_interval(value: &str) -> Option<Duration> {
    match value.parse::<u64>() {
        Ok(0) | Err(_) => None,
        Ok(millis) => Some(Duration::from_millis(millis)),
    }
}
