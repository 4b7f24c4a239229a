//! Idempotent release publication
//!
//! The publisher runs strictly after the scheduler's join barrier: every
//! dispatched job has reached a terminal state before publication is
//! evaluated. Policy:
//!
//! - All required variants must have succeeded; optional variants may be
//!   absent and are recorded as omitted.
//! - A version tag is append-only: re-publishing identical content is a
//!   no-op success, differing content is a `VersionConflict`.
//! - Exactly one publish attempt mutates sink state per version tag.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::artifact::Artifact;
use crate::cache::{CacheLock, LockError, DEFAULT_LOCK_TIMEOUT};
use crate::job::BuildState;
use crate::release::{ManifestEntry, ManifestError, ReleaseManifest};
use crate::summary::VariantReport;

/// Lock file guarding one version dir against concurrent publishers
const PUBLISH_LOCK: &str = ".varship_publish.lock";

/// Errors from a publish attempt
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    #[error("publish lock error: {0}")]
    Lock(#[from] LockError),

    #[error("version '{version}' already published with different content")]
    VersionConflict { version: String },

    #[error("required variant(s) failed: {}", variants.join(", "))]
    RequiredVariantsFailed { variants: Vec<String> },

    #[error("job for variant '{variant}' is not terminal; publication barrier violated")]
    NonTerminalJob { variant: String },
}

/// One artifact ready for publication, with its manifest entry.
#[derive(Debug, Clone)]
pub struct ReleaseItem {
    /// Final (post-signing) artifact
    pub artifact: Artifact,
    /// Entry computed over the artifact's final bytes
    pub entry: ManifestEntry,
}

/// Result of a successful publish attempt
#[derive(Debug, Clone)]
pub enum Published {
    /// First publication of this version
    Created(ReleaseManifest),
    /// Version already published with identical content; nothing mutated
    Unchanged(ReleaseManifest),
}

impl Published {
    /// The manifest for this version, however it got there.
    pub fn manifest(&self) -> &ReleaseManifest {
        match self {
            Published::Created(m) | Published::Unchanged(m) => m,
        }
    }
}

/// External publication sink (long-term hosting collaborator).
pub trait PublicationSink {
    /// Load a previously published manifest for `version`, if any.
    fn load_manifest(&self, version: &str) -> Result<Option<ReleaseManifest>, PublishError>;

    /// Persist the manifest and its artifact payloads. Called at most
    /// once per version tag.
    fn store(&self, manifest: &ReleaseManifest, items: &[ReleaseItem]) -> Result<(), PublishError>;

    /// Serialize publish attempts for one version across processes.
    /// Held from the existence check through `store`. Sinks with no
    /// cross-process concurrency can use the no-op default.
    fn lock_version(&self, _version: &str) -> Result<Option<CacheLock>, PublishError> {
        Ok(None)
    }
}

/// Publish a release, or report why it cannot be published.
///
/// `reports` must hold a terminal state for every dispatched variant;
/// `items` holds the successful variants' artifacts in resolver order.
pub fn publish_release<S: PublicationSink>(
    sink: &S,
    version: &str,
    reports: &[VariantReport],
    items: &[ReleaseItem],
) -> Result<Published, PublishError> {
    // Barrier check: the scheduler joins all workers before we run, so a
    // non-terminal report here is a programming error worth rejecting.
    if let Some(report) = reports.iter().find(|r| !r.state.is_terminal()) {
        return Err(PublishError::NonTerminalJob {
            variant: report.variant.clone(),
        });
    }

    let failed_required: Vec<String> = reports
        .iter()
        .filter(|r| r.required && r.state != BuildState::Succeeded)
        .map(|r| r.variant.clone())
        .collect();
    if !failed_required.is_empty() {
        return Err(PublishError::RequiredVariantsFailed {
            variants: failed_required,
        });
    }

    let omitted: Vec<String> = reports
        .iter()
        .filter(|r| !r.required && r.state != BuildState::Succeeded)
        .map(|r| r.variant.clone())
        .collect();

    let entries: Vec<ManifestEntry> = items.iter().map(|item| item.entry.clone()).collect();
    let manifest = ReleaseManifest::new(version, entries, omitted)?;

    // Held until the manifest lands so two processes racing on the
    // same version tag cannot both pass the existence check.
    let _guard = sink.lock_version(version)?;

    // Pre-publication existence check: a version tag is immutable
    if let Some(existing) = sink.load_manifest(version)? {
        if existing.content_matches(&manifest) {
            eprintln!("[publish] version '{version}' already published, identical content");
            return Ok(Published::Unchanged(existing));
        }
        return Err(PublishError::VersionConflict {
            version: version.to_string(),
        });
    }

    sink.store(&manifest, items)?;
    eprintln!(
        "[publish] version '{version}' published: {} artifact(s), {} omitted",
        manifest.entries.len(),
        manifest.omitted.len()
    );

    Ok(Published::Created(manifest))
}

/// Filesystem publication sink: `<root>/<version>/manifest.json` plus
/// payload copies, append-only per version.
pub struct FsSink {
    root: PathBuf,
    lock_timeout: Duration,
}

impl FsSink {
    /// Open a sink rooted at `root`, creating it if needed.
    pub fn open(root: &Path) -> Result<Self, PublishError> {
        fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        })
    }

    /// Directory for one version tag.
    pub fn version_dir(&self, version: &str) -> PathBuf {
        self.root.join(version)
    }

    fn manifest_path(&self, version: &str) -> PathBuf {
        self.version_dir(version).join("manifest.json")
    }
}

impl PublicationSink for FsSink {
    fn lock_version(&self, version: &str) -> Result<Option<CacheLock>, PublishError> {
        let lock = CacheLock::acquire_named(&self.version_dir(version), PUBLISH_LOCK, self.lock_timeout)?;
        Ok(Some(lock))
    }

    fn load_manifest(&self, version: &str) -> Result<Option<ReleaseManifest>, PublishError> {
        let path = self.manifest_path(version);
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(ReleaseManifest::from_file(&path)?))
    }

    fn store(&self, manifest: &ReleaseManifest, items: &[ReleaseItem]) -> Result<(), PublishError> {
        let dir = self.version_dir(&manifest.version);
        fs::create_dir_all(&dir)?;

        for item in items {
            fs::copy(&item.artifact.path, dir.join(&item.entry.filename))?;
        }

        // Manifest written last: its presence marks the version published
        manifest.write_to_file(&self.manifest_path(&manifest.version))?;
        Ok(())
    }
}
