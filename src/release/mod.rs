//! Release manifest and checksum generation
//!
//! A `ManifestEntry` is created once per final artifact, with its digest
//! computed over the exact bytes that will be published, always after
//! signing and never before. The `ReleaseManifest` binds the entry set with
//! `content_sha256`, the SHA-256 of the JCS serialization of (version,
//! entries, omitted). Timestamps are excluded from that digest so an
//! idempotent re-publish compares equal.

pub mod publish;

pub use publish::{FsSink, Published, PublishError, PublicationSink};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::artifact::{Artifact, SignatureStatus};

/// Schema version for manifest.json
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "varship/release_manifest@1";

/// Checksum computation failure. Always fatal for the affected job.
#[derive(Debug, Error)]
#[error("digest I/O failure reading {path}: {source}")]
pub struct DigestError {
    /// Payload that could not be read
    pub path: PathBuf,
    #[source]
    source: io::Error,
}

/// Errors for manifest construction and persistence
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("JCS canonicalization error: {0}")]
    Jcs(String),
}

/// Metadata describing one released artifact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    /// Published filename
    pub filename: String,
    /// Hex SHA-256 digest of the exact published bytes
    pub sha256: String,
    /// Payload size in bytes
    pub size: u64,
    /// Signing status
    pub signature: SignatureStatus,
}

impl ManifestEntry {
    /// Build an entry for a final (post-signing) artifact.
    ///
    /// Streams the payload through SHA-256 so the digest is over the
    /// bytes as they exist now, signed or not.
    pub fn from_artifact(artifact: &Artifact) -> Result<Self, DigestError> {
        let digest = digest_file(&artifact.path)?;
        Ok(Self {
            filename: artifact.filename(),
            sha256: digest,
            size: artifact.size,
            signature: artifact.signature.clone(),
        })
    }
}

/// Compute the hex SHA-256 digest of a file's contents.
pub fn digest_file(path: &Path) -> Result<String, DigestError> {
    let map_err = |source: io::Error| DigestError {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(map_err)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(map_err)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Overall release status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseStatus {
    /// Every resolved variant is present
    Complete,
    /// One or more optional variants were omitted
    Partial,
}

/// Content hashed for idempotency comparison. Excludes timestamps by
/// construction.
#[derive(Serialize)]
struct ManifestContent<'a> {
    version: &'a str,
    entries: &'a [ManifestEntry],
    omitted: &'a [String],
}

/// The complete, ordered, immutable record of one release
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseManifest {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// Version tag; unique and append-only
    pub version: String,

    /// When the manifest was created
    pub created_at: DateTime<Utc>,

    /// Overall status
    pub status: ReleaseStatus,

    /// Entries in resolver order
    pub entries: Vec<ManifestEntry>,

    /// Optional variants absent from this release
    pub omitted: Vec<String>,

    /// SHA-256 of JCS(version, entries, omitted)
    pub content_sha256: String,
}

impl ReleaseManifest {
    /// Assemble a manifest from per-artifact entries in resolver order.
    pub fn new(
        version: &str,
        entries: Vec<ManifestEntry>,
        omitted: Vec<String>,
    ) -> Result<Self, ManifestError> {
        let content_sha256 = Self::compute_content_sha256(version, &entries, &omitted)?;
        let status = if omitted.is_empty() {
            ReleaseStatus::Complete
        } else {
            ReleaseStatus::Partial
        };

        Ok(Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            version: version.to_string(),
            created_at: Utc::now(),
            status,
            entries,
            omitted,
            content_sha256,
        })
    }

    /// Compute the idempotency digest for a manifest's content.
    pub fn compute_content_sha256(
        version: &str,
        entries: &[ManifestEntry],
        omitted: &[String],
    ) -> Result<String, ManifestError> {
        let content = ManifestContent {
            version,
            entries,
            omitted,
        };
        let jcs_bytes = serde_json_canonicalizer::to_vec(&content)
            .map_err(|e| ManifestError::Jcs(e.to_string()))?;
        Ok(hex::encode(Sha256::digest(&jcs_bytes)))
    }

    /// Whether another manifest has identical published content.
    pub fn content_matches(&self, other: &ReleaseManifest) -> bool {
        self.content_sha256 == other.content_sha256
    }

    /// Serialize to JSON (pretty printed)
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parse from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Write atomically to file (write-then-rename)
    pub fn write_to_file(&self, path: &Path) -> Result<(), ManifestError> {
        let json = self.to_json()?;
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &json)?;
        fs::rename(&temp_path, path)?;
        Ok(())
    }

    /// Load from file
    pub fn from_file(path: &Path) -> Result<Self, ManifestError> {
        let json = fs::read_to_string(path)?;
        Ok(Self::from_json(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn entry(filename: &str, digest_byte: &str) -> ManifestEntry {
        ManifestEntry {
            filename: filename.to_string(),
            sha256: digest_byte.repeat(32),
            size: 100,
            signature: SignatureStatus::Unsigned,
        }
    }

    #[test]
    fn test_digest_matches_known_value() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("app.apk");
        fs::write(&path, b"hello").unwrap();

        // sha256("hello")
        assert_eq!(
            digest_file(&path).unwrap(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_digest_missing_file_is_error() {
        let temp = TempDir::new().unwrap();
        let err = digest_file(&temp.path().join("absent.apk")).unwrap_err();
        assert!(err.to_string().contains("absent.apk"));
    }

    #[test]
    fn test_entry_from_artifact_reflects_current_bytes() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("app.apk");
        fs::write(&path, b"original").unwrap();
        let artifact = Artifact::from_file("play-standard", &path).unwrap();

        let before = ManifestEntry::from_artifact(&artifact).unwrap();

        // Rewrite the payload (as signing does) and re-digest
        fs::write(&path, b"signed-bytes").unwrap();
        let artifact = Artifact::from_file("play-standard", &path).unwrap();
        let after = ManifestEntry::from_artifact(&artifact).unwrap();

        assert_ne!(before.sha256, after.sha256);
    }

    #[test]
    fn test_content_sha256_ignores_created_at() {
        let entries = vec![entry("a.apk", "a"), entry("b.apk", "b")];
        let m1 = ReleaseManifest::new("1.2.0", entries.clone(), vec![]).unwrap();
        std::thread::sleep(std::time::Duration::from_millis(5));
        let m2 = ReleaseManifest::new("1.2.0", entries, vec![]).unwrap();

        assert_ne!(m1.created_at, m2.created_at);
        assert!(m1.content_matches(&m2));
    }

    #[test]
    fn test_content_sha256_changes_with_entries() {
        let m1 = ReleaseManifest::new("1.2.0", vec![entry("a.apk", "a")], vec![]).unwrap();
        let m2 = ReleaseManifest::new("1.2.0", vec![entry("a.apk", "c")], vec![]).unwrap();
        assert!(!m1.content_matches(&m2));

        let m3 = ReleaseManifest::new("1.3.0", vec![entry("a.apk", "a")], vec![]).unwrap();
        assert!(!m1.content_matches(&m3));
    }

    #[test]
    fn test_omitted_optional_marks_partial() {
        let m = ReleaseManifest::new(
            "1.2.0",
            vec![entry("a.apk", "a")],
            vec!["foss-strong".to_string()],
        )
        .unwrap();
        assert_eq!(m.status, ReleaseStatus::Partial);

        let complete = ReleaseManifest::new("1.2.0", vec![entry("a.apk", "a")], vec![]).unwrap();
        assert_eq!(complete.status, ReleaseStatus::Complete);
    }

    #[test]
    fn test_manifest_file_round_trip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("manifest.json");
        let manifest =
            ReleaseManifest::new("1.2.0", vec![entry("a.apk", "a")], vec![]).unwrap();

        manifest.write_to_file(&path).unwrap();
        let loaded = ReleaseManifest::from_file(&path).unwrap();

        assert_eq!(loaded.version, "1.2.0");
        assert_eq!(loaded.content_sha256, manifest.content_sha256);
        assert_eq!(loaded.entries, manifest.entries);
    }
}
