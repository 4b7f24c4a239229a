//! Build job identity and cache key computation
//!
//! A `JobSpec` (`job.json`) is the deterministic description of one
//! variant build. Its cache key is the SHA-256 hex digest of the RFC 8785
//! JSON Canonicalization Scheme (JCS) serialization of `CacheKeyInputs`,
//! so two jobs with identical inputs always share a key and a changed
//! input always changes the key. No time-derived value participates.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

use crate::matrix::VariantSpec;

pub mod state;

pub use state::{BuildState, JobStateData, JobStateError};

/// Schema version for job.json
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier for job.json
pub const SCHEMA_ID: &str = "varship/job@1";

/// Errors for job spec operations
#[derive(Debug, Error)]
pub enum JobError {
    #[error("JCS canonicalization error: {0}")]
    JcsError(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Generate a new job_id using ULID
pub fn generate_job_id() -> String {
    ulid::Ulid::new().to_string().to_lowercase()
}

/// Toolchain identity participating in cache keys.
///
/// Captures the exact build environment so that a toolchain upgrade can
/// never reuse outputs produced by a different toolchain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolchainIdentity {
    /// Toolchain name (e.g., "gradle", "ndk-build")
    pub tool: String,
    /// Exact version string
    pub version: String,
}

/// Canonical key-object hashed to produce the cache key.
///
/// Every field is derived from build inputs only: toolchain identity,
/// the exact command line invoked, dependency lock content, variant
/// flags, declared outputs, and source tree content. Editing the build
/// recipe therefore changes the key even when the toolchain version
/// string does not.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheKeyInputs {
    /// Build environment identity
    pub toolchain: ToolchainIdentity,
    /// Command line invoked per variant
    pub command: Vec<String>,
    /// SHA-256 hex digest of the dependency lockfile content
    pub lockfile_sha256: String,
    /// SHA-256 hex digest of the source tree content
    pub source_tree_sha256: String,
    /// Distribution channel flag
    pub channel: String,
    /// Crypto mode flag
    pub crypto_mode: String,
    /// Declared output filenames
    pub outputs: Vec<String>,
}

impl CacheKeyInputs {
    /// Build key inputs for one variant.
    pub fn for_variant(
        variant: &VariantSpec,
        toolchain: ToolchainIdentity,
        command: Vec<String>,
        lockfile_sha256: String,
        source_tree_sha256: String,
    ) -> Self {
        Self {
            toolchain,
            command,
            lockfile_sha256,
            source_tree_sha256,
            channel: variant.channel.clone(),
            crypto_mode: variant.crypto_mode.clone(),
            outputs: variant.outputs.clone(),
        }
    }

    /// Compute the cache key using RFC 8785 JCS.
    ///
    /// cache_key = SHA-256 hex digest of JCS(cache_key_inputs)
    pub fn compute_cache_key(&self) -> Result<String, JobError> {
        let jcs_bytes = serde_json_canonicalizer::to_vec(self)
            .map_err(|e| JobError::JcsError(e.to_string()))?;

        let mut hasher = Sha256::new();
        hasher.update(&jcs_bytes);
        Ok(hex::encode(hasher.finalize()))
    }
}

/// JobSpec - deterministic, fully-resolved variant build description
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// Unique job identifier
    pub job_id: String,

    /// The variant this job builds
    pub variant: VariantSpec,

    /// Canonical key-object hashed to produce cache_key
    pub cache_key_inputs: CacheKeyInputs,

    /// SHA-256 hex digest of JCS(cache_key_inputs)
    pub cache_key: String,

    /// When this job was created
    pub created_at: DateTime<Utc>,
}

impl JobSpec {
    /// Create a new JobSpec from a resolved variant and its key inputs.
    pub fn new(variant: VariantSpec, cache_key_inputs: CacheKeyInputs) -> Result<Self, JobError> {
        let cache_key = cache_key_inputs.compute_cache_key()?;

        Ok(Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            job_id: generate_job_id(),
            variant,
            cache_key_inputs,
            cache_key,
            created_at: Utc::now(),
        })
    }

    /// Serialize to JSON (pretty printed)
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Write to file as job.json in the job work dir
    pub fn write_to_job_dir(&self, job_dir: &Path) -> Result<(), JobError> {
        let json = self.to_json()?;
        fs::write(job_dir.join("job.json"), json)?;
        Ok(())
    }
}
