//! Build output artifacts
//!
//! An `Artifact` is one file produced by a successful build job,
//! immutable once produced. Signing status is a tagged enum so an
//! inconsistent state (signed with no signature material) cannot be
//! represented.

use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Signing status of an artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum SignatureStatus {
    /// No signing credential was configured
    Unsigned,
    /// Signed; carries the SHA-256 fingerprint of the signing public key
    Signed {
        /// Hex SHA-256 of the Ed25519 public key used
        key_fingerprint: String,
    },
}

impl SignatureStatus {
    /// Check whether the artifact carries a signature
    pub fn is_signed(&self) -> bool {
        matches!(self, SignatureStatus::Signed { .. })
    }
}

/// One build output file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Variant that produced this artifact
    pub variant: String,
    /// Path to the payload on disk
    pub path: PathBuf,
    /// Payload size in bytes
    pub size: u64,
    /// Signing status
    pub signature: SignatureStatus,
}

impl Artifact {
    /// Describe an unsigned build output already on disk.
    pub fn from_file(variant: &str, path: &Path) -> io::Result<Self> {
        let size = fs::metadata(path)?.len();
        Ok(Self {
            variant: variant.to_string(),
            path: path.to_path_buf(),
            size,
            signature: SignatureStatus::Unsigned,
        })
    }

    /// The artifact's filename.
    pub fn filename(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}
