//! Pipeline orchestration
//!
//! Wires the full flow: resolve the matrix, derive cache keys from build
//! inputs, run the scheduler over the shared cache, sign and checksum
//! per job, then evaluate publication behind the scheduler's barrier.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::cache::{CacheError, CacheStore};
use crate::config::{ConfigError, PipelineConfig};
use crate::job::{CacheKeyInputs, JobError, JobSpec};
use crate::matrix::{self, MatrixError, VariantSpec};
use crate::release::publish::{publish_release, FsSink, Published, PublishError, ReleaseItem};
use crate::release::digest_file;
use crate::scheduler::{JobOutcome, Scheduler, SchedulerConfig};
use crate::signer::{ArtifactSigner, SigningCredential, SigningError};
use crate::summary::PipelineSummary;
use crate::toolchain::{ProcessToolchain, Toolchain};

/// Pipeline errors (everything that escalates past a single job)
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid matrix: {0}")]
    Matrix(#[from] MatrixError),

    #[error("job setup error: {0}")]
    Job(#[from] JobError),

    #[error("cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("signing credential error: {0}")]
    Signing(#[from] SigningError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("no variant matches selector '{0}'")]
    NoMatchingVariant(String),
}

/// Result of a build run: every variant's terminal state plus artifacts.
pub struct BuildRun {
    /// Outcomes in resolver order
    pub outcomes: Vec<JobOutcome>,
    /// Exhaustive per-variant summary
    pub summary: PipelineSummary,
}

impl BuildRun {
    /// Release items from succeeded jobs, resolver order.
    pub fn release_items(&self) -> Vec<ReleaseItem> {
        self.outcomes
            .iter()
            .flat_map(|outcome| outcome.items.iter().cloned())
            .collect()
    }
}

/// Result of a release run: the build plus the publication decision.
pub struct ReleaseRun {
    /// The underlying build
    pub build: BuildRun,
    /// Publication decision; errors here do not discard the build
    pub publication: Result<Published, PublishError>,
}

/// Environment check findings for `varship verify`.
#[derive(Debug)]
pub struct VerifyReport {
    /// Variants the matrix resolves to
    pub variant_count: usize,
    /// Required variants among them
    pub required_count: usize,
    /// Whether a signing credential is configured and loadable
    pub signing_configured: bool,
    /// Toolchain command that will be invoked
    pub toolchain_command: Vec<String>,
}

/// The build/release pipeline over one project root.
pub struct Pipeline {
    config: PipelineConfig,
    root: PathBuf,
}

impl Pipeline {
    /// Create a pipeline; relative config paths resolve against `root`.
    pub fn new(config: PipelineConfig, root: &Path) -> Self {
        Self {
            config,
            root: root.to_path_buf(),
        }
    }

    /// Run builds with the configured external toolchain.
    pub fn run_build(&self, selector: Option<&str>) -> Result<BuildRun, PipelineError> {
        let toolchain = self.process_toolchain();
        let signer = self.build_signer()?;
        self.run_build_with(&toolchain, &signer, selector)
    }

    /// Run builds with an explicit toolchain and signer (test seam).
    pub fn run_build_with(
        &self,
        toolchain: &dyn Toolchain,
        signer: &ArtifactSigner,
        selector: Option<&str>,
    ) -> Result<BuildRun, PipelineError> {
        let started = Instant::now();
        let variants = self.select_variants(selector)?;

        let (lockfile_sha256, source_tree_sha256) = self.input_digests()?;
        let identity = toolchain.identity();

        let mut jobs = Vec::with_capacity(variants.len());
        for variant in variants {
            let inputs = CacheKeyInputs::for_variant(
                &variant,
                identity.clone(),
                self.config.toolchain.command.clone(),
                lockfile_sha256.clone(),
                source_tree_sha256.clone(),
            );
            jobs.push(JobSpec::new(variant, inputs)?);
        }

        let cache = CacheStore::open(&self.root.join(&self.config.cache_dir))?;
        let scheduler = Scheduler::new(
            SchedulerConfig {
                max_concurrency: self.config.max_concurrency,
                job_timeout: self.config.job_timeout(),
            },
            toolchain,
            &cache,
            signer,
            &self.root.join(&self.config.work_dir),
        );

        let outcomes = scheduler.run(jobs);
        let reports = outcomes.iter().map(JobOutcome::report).collect();
        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        Ok(BuildRun {
            outcomes,
            summary: PipelineSummary::new(reports, duration_ms),
        })
    }

    /// Build everything, then evaluate publication under `version`.
    pub fn run_release(&self, version: &str) -> Result<ReleaseRun, PipelineError> {
        let toolchain = self.process_toolchain();
        let signer = self.build_signer()?;
        self.run_release_with(&toolchain, &signer, version)
    }

    /// Release with an explicit toolchain and signer (test seam).
    pub fn run_release_with(
        &self,
        toolchain: &dyn Toolchain,
        signer: &ArtifactSigner,
        version: &str,
    ) -> Result<ReleaseRun, PipelineError> {
        let build = self.run_build_with(toolchain, signer, None)?;

        let sink = match FsSink::open(&self.root.join(&self.config.release_dir)) {
            Ok(sink) => sink,
            Err(e) => {
                return Ok(ReleaseRun {
                    build,
                    publication: Err(e),
                })
            }
        };
        let items = build.release_items();
        let publication = publish_release(&sink, version, &build.summary.reports, &items);

        Ok(ReleaseRun { build, publication })
    }

    /// Check the environment without building anything.
    pub fn verify(&self) -> Result<VerifyReport, PipelineError> {
        let variants = matrix::resolve(&self.config.matrix)?;
        let required_count = variants.iter().filter(|v| v.required).count();

        // Loading the credential eagerly validates keystore, alias, and
        // passphrase; verify is the place where that is pipeline-fatal
        let signer = match self.resolved_credential()? {
            Some(credential) => ArtifactSigner::with_credential(&credential)?,
            None => ArtifactSigner::unsigned(),
        };

        fs::create_dir_all(self.root.join(&self.config.work_dir))?;
        CacheStore::open(&self.root.join(&self.config.cache_dir))?;

        Ok(VerifyReport {
            variant_count: variants.len(),
            required_count,
            signing_configured: signer.is_configured(),
            toolchain_command: self.config.toolchain.command.clone(),
        })
    }

    /// Age-based cache retention sweep.
    pub fn cache_gc(&self, max_age: std::time::Duration) -> Result<crate::cache::SweepStats, PipelineError> {
        let cache = CacheStore::open(&self.root.join(&self.config.cache_dir))?;
        Ok(cache.sweep(max_age)?)
    }

    fn process_toolchain(&self) -> ProcessToolchain {
        ProcessToolchain::new(
            crate::job::ToolchainIdentity {
                tool: self.config.toolchain.tool.clone(),
                version: self.config.toolchain.version.clone(),
            },
            self.config.toolchain.command.clone(),
        )
    }

    /// Signer for build runs. Credential validation is deferred to the
    /// signing step so a rejected credential fails each job with a
    /// terminal Signing report instead of aborting before dispatch.
    fn build_signer(&self) -> Result<ArtifactSigner, PipelineError> {
        match self.resolved_credential()? {
            Some(credential) => Ok(ArtifactSigner::deferred(credential)),
            None => Ok(ArtifactSigner::unsigned()),
        }
    }

    fn resolved_credential(&self) -> Result<Option<SigningCredential>, PipelineError> {
        match self.config.signing_credential()? {
            Some(mut credential) => {
                if credential.keystore_path.is_relative() {
                    credential.keystore_path = self.root.join(&credential.keystore_path);
                }
                Ok(Some(credential))
            }
            None => Ok(None),
        }
    }

    fn select_variants(&self, selector: Option<&str>) -> Result<Vec<VariantSpec>, PipelineError> {
        let mut variants = matrix::resolve(&self.config.matrix)?;
        if let Some(sel) = selector {
            variants.retain(|v| v.name == sel || v.channel == sel);
            if variants.is_empty() {
                return Err(PipelineError::NoMatchingVariant(sel.to_string()));
            }
        }
        Ok(variants)
    }

    /// Digest the dependency lockfile and source tree for cache keying.
    fn input_digests(&self) -> Result<(String, String), PipelineError> {
        let lockfile_sha256 = match &self.config.toolchain.lockfile {
            Some(lockfile) => {
                let path = self.root.join(lockfile);
                digest_file(&path).map_err(|e| {
                    PipelineError::Io(io::Error::new(io::ErrorKind::NotFound, e.to_string()))
                })?
            }
            None => hex::encode(Sha256::digest(b"")),
        };

        let source_tree_sha256 = digest_tree(&self.root.join(&self.config.toolchain.source_dir))?;
        Ok((lockfile_sha256, source_tree_sha256))
    }
}

/// Hex SHA-256 over a directory tree: relative paths and file contents
/// in sorted order. A missing directory digests as empty.
///
/// Each component is length-prefixed so the path/content boundary is
/// unambiguous; "ab" containing "cd" and "abc" containing "d" never
/// hash to the same digest.
pub fn digest_tree(root: &Path) -> io::Result<String> {
    let mut hasher = Sha256::new();
    if root.is_dir() {
        digest_tree_into(&mut hasher, root, root)?;
    }
    Ok(hex::encode(hasher.finalize()))
}

fn digest_tree_into(hasher: &mut Sha256, root: &Path, dir: &Path) -> io::Result<()> {
    let mut children: Vec<PathBuf> = fs::read_dir(dir)?
        .collect::<io::Result<Vec<_>>>()?
        .into_iter()
        .map(|entry| entry.path())
        .collect();
    children.sort();

    for child in children {
        let rel = child.strip_prefix(root).unwrap_or(&child);
        let rel = rel.to_string_lossy();
        hasher.update((rel.len() as u64).to_le_bytes());
        hasher.update(rel.as_bytes());
        if child.is_dir() {
            digest_tree_into(hasher, root, &child)?;
        } else {
            let content = fs::read(&child)?;
            hasher.update((content.len() as u64).to_le_bytes());
            hasher.update(&content);
        }
    }
    Ok(())
}
