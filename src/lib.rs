//! varship - variant build orchestrator and release pipeline
//!
//! Expands a declarative variant matrix (distribution channel × crypto
//! mode) into isolated parallel build jobs, reuses outputs through a
//! content-addressed cache, optionally signs artifacts, and publishes
//! an idempotent, checksummed release manifest.

pub mod artifact;
pub mod cache;
pub mod config;
pub mod job;
pub mod matrix;
pub mod mock;
pub mod pipeline;
pub mod release;
pub mod scheduler;
pub mod signer;
pub mod summary;
pub mod toolchain;

pub use artifact::{Artifact, SignatureStatus};
pub use cache::{CacheEntry, CacheStore};
pub use config::PipelineConfig;
pub use job::{BuildState, CacheKeyInputs, JobSpec};
pub use matrix::{MatrixConfig, VariantSpec};
pub use pipeline::{BuildRun, Pipeline, PipelineError, ReleaseRun};
pub use release::{ManifestEntry, ReleaseManifest};
pub use scheduler::{JobOutcome, Scheduler, SchedulerConfig};
pub use signer::{ArtifactSigner, SigningCredential};
pub use summary::{AggregateResult, ExitCode, PipelineSummary, VariantReport};
