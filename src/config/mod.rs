//! Pipeline configuration (varship.toml)
//!
//! One TOML file declares the matrix, the toolchain command, directories,
//! scheduling bounds, and the optional signing section. The passphrase is
//! never stored in the file; only the name of the environment variable
//! that carries it.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::matrix::MatrixConfig;
use crate::signer::SigningCredential;

/// Default config filename
pub const DEFAULT_CONFIG_FILE: &str = "varship.toml";

/// Errors from configuration loading and validation
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("config parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("job_timeout_seconds must be in (0, 86400], got {value}")]
    TimeoutOutOfBounds { value: u64 },

    #[error("max_concurrency must be at most 256, got {value}")]
    ConcurrencyOutOfBounds { value: usize },

    #[error("toolchain command is empty")]
    EmptyToolchainCommand,

    #[error("toolchain {field} is empty")]
    EmptyToolchainField { field: &'static str },

    #[error("signing passphrase env var '{0}' is not set")]
    MissingPassphrase(String),
}

/// Toolchain section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolchainConfig {
    /// Toolchain name (cache key input)
    pub tool: String,
    /// Exact toolchain version (cache key input)
    pub version: String,
    /// Command line invoked per variant
    pub command: Vec<String>,
    /// Dependency lockfile whose content feeds the cache key
    #[serde(default)]
    pub lockfile: Option<String>,
    /// Source tree hashed into the cache key
    #[serde(default = "default_source_dir")]
    pub source_dir: String,
}

fn default_source_dir() -> String {
    "src".to_string()
}

/// Signing section; absent means unsigned artifacts
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Keystore TOML path
    pub keystore: PathBuf,
    /// Key alias
    pub alias: String,
    /// Environment variable holding the passphrase
    pub passphrase_env: String,
}

/// Complete pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Per-run working directory (job dirs, state records)
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Content-addressed cache root
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Publication sink root
    #[serde(default = "default_release_dir")]
    pub release_dir: PathBuf,

    /// Maximum concurrent jobs; 0 means available parallelism
    #[serde(default)]
    pub max_concurrency: usize,

    /// Per-job deadline in seconds
    #[serde(default = "default_job_timeout")]
    pub job_timeout_seconds: u64,

    /// Variant matrix
    pub matrix: MatrixConfig,

    /// Toolchain invocation
    pub toolchain: ToolchainConfig,

    /// Optional signing
    #[serde(default)]
    pub signing: Option<SigningConfig>,
}

fn default_work_dir() -> PathBuf {
    PathBuf::from("build/varship")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("build/varship-cache")
}

fn default_release_dir() -> PathBuf {
    PathBuf::from("releases")
}

fn default_job_timeout() -> u64 {
    1800
}

impl PipelineConfig {
    /// Load and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate bounds and required fields.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.job_timeout_seconds == 0 || self.job_timeout_seconds > 86400 {
            return Err(ConfigError::TimeoutOutOfBounds {
                value: self.job_timeout_seconds,
            });
        }
        if self.max_concurrency > 256 {
            return Err(ConfigError::ConcurrencyOutOfBounds {
                value: self.max_concurrency,
            });
        }
        if self.toolchain.command.is_empty() {
            return Err(ConfigError::EmptyToolchainCommand);
        }
        if self.toolchain.tool.is_empty() {
            return Err(ConfigError::EmptyToolchainField { field: "tool" });
        }
        if self.toolchain.version.is_empty() {
            return Err(ConfigError::EmptyToolchainField { field: "version" });
        }
        Ok(())
    }

    /// Per-job deadline as a Duration.
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_seconds)
    }

    /// Resolve the signing credential, reading the passphrase from the
    /// configured environment variable. `None` when signing is not
    /// configured.
    pub fn signing_credential(&self) -> Result<Option<SigningCredential>, ConfigError> {
        let Some(signing) = &self.signing else {
            return Ok(None);
        };

        let passphrase = std::env::var(&signing.passphrase_env)
            .map_err(|_| ConfigError::MissingPassphrase(signing.passphrase_env.clone()))?;

        Ok(Some(SigningCredential {
            keystore_path: signing.keystore.clone(),
            alias: signing.alias.clone(),
            passphrase,
        }))
    }
}
