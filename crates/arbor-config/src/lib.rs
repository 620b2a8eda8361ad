use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

// ─────────────────────────────────────────────────────────────────────────────
// Error
// ─────────────────────────────────────────────────────────────────────────────

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// Timers driving trace completeness.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssemblyConfig {
    /// Inactivity after the last admitted span before a connected trace is complete.
    pub quiescence_ms: u64,
    /// Time from a trace's first span after which missing parents are given up on.
    pub assembly_timeout_ms: u64,
    /// Delay before retrying a failed commit.
    pub commit_retry_ms: u64,
}

impl Default for AssemblyConfig {
    fn default() -> Self {
        Self {
            quiescence_ms: 3_000,
            assembly_timeout_ms: 30_000,
            commit_retry_ms: 500,
        }
    }
}

impl AssemblyConfig {
    pub fn quiescence(&self) -> Duration {
        Duration::from_millis(self.quiescence_ms)
    }

    pub fn assembly_timeout(&self) -> Duration {
        Duration::from_millis(self.assembly_timeout_ms)
    }

    pub fn commit_retry(&self) -> Duration {
        Duration::from_millis(self.commit_retry_ms)
    }

    pub fn with_quiescence_ms(mut self, ms: u64) -> Self {
        self.quiescence_ms = ms;
        self
    }

    pub fn with_assembly_timeout_ms(mut self, ms: u64) -> Self {
        self.assembly_timeout_ms = ms;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    pub default_page_size: u32,
    pub max_page_size: u32,
    /// Execution budget per query.
    pub timeout_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_page_size: 20,
            max_page_size: 200,
            timeout_ms: 5_000,
        }
    }
}

impl QueryConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    /// Upper bound on serialized inputs + outputs per span.
    pub max_payload_bytes: usize,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            max_payload_bytes: 1024 * 1024,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Root Config
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ArborConfig {
    /// SQLite database path.
    pub database_path: String,
    /// HTTP listen address.
    pub bind_addr: String,
    pub assembly: AssemblyConfig,
    pub query: QueryConfig,
    pub validation: ValidationConfig,
}

impl Default for ArborConfig {
    fn default() -> Self {
        Self {
            database_path: "data/arbor.db".to_string(),
            bind_addr: "0.0.0.0:8000".to_string(),
            assembly: AssemblyConfig::default(),
            query: QueryConfig::default(),
            validation: ValidationConfig::default(),
        }
    }
}

impl ArborConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Builds the config from `ARBOR_CONFIG` (if set) plus environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("ARBOR_CONFIG") {
            Ok(path) => Self::load(Path::new(&path))?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Applies `ARBOR_*` overrides from the given lookup.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(path) = lookup("ARBOR_DB_PATH") {
            self.database_path = path;
        }
        if let Some(addr) = lookup("ARBOR_BIND_ADDR") {
            self.bind_addr = addr;
        }
        if let Some(ms) = parse_ms(&lookup, "ARBOR_QUIESCENCE_MS")? {
            self.assembly.quiescence_ms = ms;
        }
        if let Some(ms) = parse_ms(&lookup, "ARBOR_ASSEMBLY_TIMEOUT_MS")? {
            self.assembly.assembly_timeout_ms = ms;
        }
        if let Some(ms) = parse_ms(&lookup, "ARBOR_QUERY_TIMEOUT_MS")? {
            self.query.timeout_ms = ms;
        }
        Ok(())
    }

    pub fn with_database_path(mut self, path: impl Into<String>) -> Self {
        self.database_path = path.into();
        self
    }

    pub fn with_assembly(mut self, assembly: AssemblyConfig) -> Self {
        self.assembly = assembly;
        self
    }

    pub fn with_query(mut self, query: QueryConfig) -> Self {
        self.query = query;
        self
    }
}

fn parse_ms(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<u64>, ConfigError> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    raw.trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::InvalidValue {
            key: key.to_string(),
            value: raw,
        })
}
