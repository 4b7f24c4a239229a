//! Bounded-parallelism build scheduler
//!
//! Executes each resolved variant as an isolated job on a worker pool.
//! fail-fast is deliberately false: a failing job never cancels
//! siblings, so a single broken variant cannot waste the work of
//! unrelated variants. Jobs are dispatched in resolver order, complete
//! in any order, and the collected outcomes are re-sorted to dispatch
//! order so everything downstream is deterministic.
//!
//! The scheduler returns only after every worker has joined; that join
//! is the publication barrier.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::artifact::Artifact;
use crate::cache::{CacheError, CacheStore};
use crate::job::{BuildState, JobSpec, JobStateData};
use crate::release::publish::ReleaseItem;
use crate::release::{DigestError, ManifestEntry};
use crate::signer::{ArtifactSigner, SigningError};
use crate::summary::{AggregateResult, FailureDetail, FailureKind, VariantReport};
use crate::toolchain::{BuildRequest, Toolchain, ToolchainError};

/// Scheduler tuning
#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    /// Maximum concurrent jobs; 0 means available parallelism
    pub max_concurrency: usize,
    /// Per-job deadline
    pub job_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 0,
            job_timeout: Duration::from_secs(1800),
        }
    }
}

impl SchedulerConfig {
    fn effective_concurrency(&self, job_count: usize) -> usize {
        let auto = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        let bound = if self.max_concurrency == 0 {
            auto
        } else {
            self.max_concurrency
        };
        bound.min(job_count).max(1)
    }
}

/// Terminal result of one job.
#[derive(Debug)]
pub struct JobOutcome {
    /// The dispatched job
    pub spec: JobSpec,
    /// Terminal state
    pub state: BuildState,
    /// Failure detail when the state is a failure
    pub failure: Option<FailureDetail>,
    /// Final artifacts with manifest entries; empty unless Succeeded
    pub items: Vec<ReleaseItem>,
    /// Whether outputs were served from the cache
    pub cache_hit: bool,
    /// Wall-clock duration in milliseconds
    pub duration_ms: u64,
}

impl JobOutcome {
    /// The variant report for this outcome.
    pub fn report(&self) -> VariantReport {
        VariantReport {
            variant: self.spec.variant.name.clone(),
            required: self.spec.variant.required,
            state: self.state,
            failure: self.failure.clone(),
            cache_hit: self.cache_hit,
            duration_ms: self.duration_ms,
        }
    }
}

/// Internal per-step error, mapped to a failure detail and terminal state.
enum StepError {
    Toolchain(ToolchainError),
    Cache(CacheError),
    Signing(SigningError),
    Digest(DigestError),
    Io(io::Error),
    MissingOutput(String),
}

impl From<CacheError> for StepError {
    fn from(e: CacheError) -> Self {
        StepError::Cache(e)
    }
}

impl From<ToolchainError> for StepError {
    fn from(e: ToolchainError) -> Self {
        StepError::Toolchain(e)
    }
}

impl From<SigningError> for StepError {
    fn from(e: SigningError) -> Self {
        StepError::Signing(e)
    }
}

impl From<DigestError> for StepError {
    fn from(e: DigestError) -> Self {
        StepError::Digest(e)
    }
}

impl From<io::Error> for StepError {
    fn from(e: io::Error) -> Self {
        StepError::Io(e)
    }
}

impl StepError {
    /// Terminal state and failure detail for this error.
    fn into_failure(self) -> (BuildState, FailureDetail) {
        match self {
            StepError::Toolchain(ToolchainError::Timeout { after }) => (
                BuildState::TimedOut,
                FailureDetail {
                    kind: FailureKind::Timeout,
                    message: format!("deadline of {after:?} exceeded"),
                },
            ),
            StepError::Toolchain(e) => (
                BuildState::Failed,
                FailureDetail {
                    kind: FailureKind::Build,
                    message: e.to_string(),
                },
            ),
            StepError::Cache(e) => (
                BuildState::Failed,
                FailureDetail {
                    kind: FailureKind::Cache,
                    message: e.to_string(),
                },
            ),
            StepError::Signing(e) => (
                BuildState::Failed,
                FailureDetail {
                    kind: FailureKind::Signing,
                    message: e.to_string(),
                },
            ),
            StepError::Digest(e) => (
                BuildState::Failed,
                FailureDetail {
                    kind: FailureKind::Digest,
                    message: e.to_string(),
                },
            ),
            StepError::Io(e) => (
                BuildState::Failed,
                FailureDetail {
                    kind: FailureKind::Build,
                    message: e.to_string(),
                },
            ),
            StepError::MissingOutput(name) => (
                BuildState::Failed,
                FailureDetail {
                    kind: FailureKind::Build,
                    message: format!("declared output '{name}' was not produced"),
                },
            ),
        }
    }
}

/// The build scheduler.
pub struct Scheduler<'a> {
    config: SchedulerConfig,
    toolchain: &'a dyn Toolchain,
    cache: &'a CacheStore,
    signer: &'a ArtifactSigner,
    work_dir: PathBuf,
}

impl<'a> Scheduler<'a> {
    /// Create a scheduler over shared pipeline collaborators.
    pub fn new(
        config: SchedulerConfig,
        toolchain: &'a dyn Toolchain,
        cache: &'a CacheStore,
        signer: &'a ArtifactSigner,
        work_dir: &Path,
    ) -> Self {
        Self {
            config,
            toolchain,
            cache,
            signer,
            work_dir: work_dir.to_path_buf(),
        }
    }

    /// Run all jobs to a terminal state and return outcomes in dispatch
    /// order. Never aborts early; returns only after every worker joins.
    pub fn run(&self, jobs: Vec<JobSpec>) -> Vec<JobOutcome> {
        if jobs.is_empty() {
            return Vec::new();
        }

        let concurrency = self.config.effective_concurrency(jobs.len());
        let queue: Mutex<VecDeque<(usize, JobSpec)>> =
            Mutex::new(jobs.into_iter().enumerate().collect());
        let (tx, rx) = mpsc::channel::<(usize, JobOutcome)>();

        std::thread::scope(|scope| {
            for _ in 0..concurrency {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || loop {
                    let next = match queue.lock() {
                        Ok(mut q) => q.pop_front(),
                        Err(_) => None,
                    };
                    let Some((index, spec)) = next else {
                        break;
                    };
                    let outcome = self.execute(spec);
                    if tx.send((index, outcome)).is_err() {
                        break;
                    }
                });
            }
            drop(tx);
        });
        // All workers joined here: the publication barrier

        let mut indexed: Vec<(usize, JobOutcome)> = rx.try_iter().collect();
        indexed.sort_by_key(|(index, _)| *index);
        indexed.into_iter().map(|(_, outcome)| outcome).collect()
    }

    /// Aggregate result over a finished run.
    pub fn aggregate(outcomes: &[JobOutcome]) -> AggregateResult {
        let reports: Vec<VariantReport> = outcomes.iter().map(JobOutcome::report).collect();
        AggregateResult::from_reports(&reports)
    }

    /// Run one job to a terminal state.
    fn execute(&self, spec: JobSpec) -> JobOutcome {
        let started = Instant::now();
        let mut state = JobStateData::new(spec.job_id.clone(), spec.variant.name.clone());
        let job_dir = self.work_dir.join("jobs").join(&spec.job_id);

        let result = self.prepare(&spec, &job_dir, &mut state).and_then(|()| {
            self.build_and_finalize(&spec, &job_dir)
        });

        let (terminal, failure, items, cache_hit) = match result {
            Ok((items, cache_hit)) => (BuildState::Succeeded, None, items, cache_hit),
            Err(step) => {
                let (terminal, detail) = step.into_failure();
                (terminal, Some(detail), Vec::new(), false)
            }
        };

        if let Err(e) = state.transition(terminal) {
            eprintln!("[scheduler] state transition error for {}: {e}", spec.variant.name);
        }
        if let Err(e) = state.write_to_job_dir(&job_dir) {
            eprintln!("[scheduler] failed to persist job state for {}: {e}", spec.variant.name);
        }

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let cached = if cache_hit { " (cached)" } else { "" };
        eprintln!(
            "[scheduler] {} {:?} in {}ms{}",
            spec.variant.name, terminal, duration_ms, cached
        );

        JobOutcome {
            spec,
            state: terminal,
            failure,
            items,
            cache_hit,
            duration_ms,
        }
    }

    /// Set up the job directory and move the job to RUNNING.
    fn prepare(
        &self,
        spec: &JobSpec,
        job_dir: &Path,
        state: &mut JobStateData,
    ) -> Result<(), StepError> {
        fs::create_dir_all(job_dir)?;
        spec.write_to_job_dir(job_dir).map_err(|e| match e {
            crate::job::JobError::Io(io) => StepError::Io(io),
            other => StepError::Io(io::Error::new(io::ErrorKind::InvalidData, other.to_string())),
        })?;

        if state.start().is_ok() {
            if let Err(e) = state.write_to_job_dir(job_dir) {
                eprintln!(
                    "[scheduler] failed to persist job state for {}: {e}",
                    spec.variant.name
                );
            }
        }
        Ok(())
    }

    /// Build (through the cache), then sign and checksum each output.
    fn build_and_finalize(
        &self,
        spec: &JobSpec,
        job_dir: &Path,
    ) -> Result<(Vec<ReleaseItem>, bool), StepError> {
        let build_dir = job_dir.join("build");
        fs::create_dir_all(&build_dir)?;

        let (entry, cache_hit) = self.cache.get_or_compute::<StepError, _>(&spec.cache_key, || {
            self.toolchain.build(&BuildRequest {
                variant: &spec.variant,
                build_dir: &build_dir,
                deadline: self.config.job_timeout,
            })?;

            for output in &spec.variant.outputs {
                if !build_dir.join(output).is_file() {
                    return Err(StepError::MissingOutput(output.clone()));
                }
            }
            Ok(build_dir.clone())
        })?;

        // Copy out of the cache before signing: signing rewrites the
        // payload in place and must never touch the cached unsigned copy
        let out_dir = job_dir.join("out");
        fs::create_dir_all(&out_dir)?;

        let mut items = Vec::with_capacity(spec.variant.outputs.len());
        for output in &spec.variant.outputs {
            let cached = entry.path.join(output);
            if !cached.is_file() {
                return Err(StepError::MissingOutput(output.clone()));
            }
            let out_path = out_dir.join(output);
            fs::copy(&cached, &out_path)?;

            let artifact = Artifact::from_file(&spec.variant.name, &out_path)?;
            let artifact = self.signer.sign(artifact)?;
            let manifest_entry = ManifestEntry::from_artifact(&artifact)?;
            items.push(ReleaseItem {
                artifact,
                entry: manifest_entry,
            });
        }

        Ok((items, cache_hit))
    }
}
