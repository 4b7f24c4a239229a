//! Per-variant reports, aggregate results, and stable exit codes
//!
//! The final report always enumerates every variant's terminal state;
//! silent partial success is never acceptable. Exit codes are stable so
//! scripts can distinguish partial failure from total failure from a
//! version conflict.

use serde::{Deserialize, Serialize};

use crate::job::BuildState;

/// Failure kind - categorizes the cause of a per-job failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureKind {
    /// Toolchain build failed (non-zero exit, missing declared output)
    Build,
    /// Per-job deadline exceeded
    Timeout,
    /// Signing was requested and failed
    Signing,
    /// Checksum computation failed reading the payload
    Digest,
    /// Cache layer failure
    Cache,
}

impl FailureKind {
    /// Human-readable description
    pub fn description(&self) -> &'static str {
        match self {
            FailureKind::Build => "Toolchain build failed",
            FailureKind::Timeout => "Job deadline exceeded",
            FailureKind::Signing => "Artifact signing failed",
            FailureKind::Digest => "Checksum computation failed",
            FailureKind::Cache => "Cache operation failed",
        }
    }
}

/// Failure detail attached to a failed variant report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    /// What failed
    pub kind: FailureKind,
    /// Specific message
    pub message: String,
}

/// Terminal report for one variant's build job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VariantReport {
    /// Variant name
    pub variant: String,
    /// Whether this variant gates publication
    pub required: bool,
    /// Terminal job state
    pub state: BuildState,
    /// Failure detail when state is FAILED or TIMED_OUT
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
    /// Whether outputs came from the cache
    pub cache_hit: bool,
    /// Wall-clock job duration in milliseconds
    pub duration_ms: u64,
}

/// Aggregate result across all dispatched jobs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", tag = "result", content = "failed")]
pub enum AggregateResult {
    /// Every job succeeded
    AllSucceeded,
    /// Some jobs failed; carries the failed variant names
    PartialFailure(Vec<String>),
    /// Every job failed
    TotalFailure,
}

impl AggregateResult {
    /// Aggregate terminal variant reports.
    pub fn from_reports(reports: &[VariantReport]) -> Self {
        let failed: Vec<String> = reports
            .iter()
            .filter(|r| r.state.is_failure())
            .map(|r| r.variant.clone())
            .collect();

        if failed.is_empty() {
            AggregateResult::AllSucceeded
        } else if failed.len() == reports.len() {
            AggregateResult::TotalFailure
        } else {
            AggregateResult::PartialFailure(failed)
        }
    }

    /// Exit code for a build-only run (no publication decision)
    pub fn exit_code(&self) -> ExitCode {
        match self {
            AggregateResult::AllSucceeded => ExitCode::Success,
            AggregateResult::PartialFailure(_) => ExitCode::PartialFailure,
            AggregateResult::TotalFailure => ExitCode::TotalFailure,
        }
    }
}

/// Stable exit codes for the CLI surface
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(i32)]
pub enum ExitCode {
    /// Full success
    Success = 0,
    /// Some variants failed
    PartialFailure = 10,
    /// Every variant failed
    TotalFailure = 20,
    /// Required variant failed; publication blocked
    RequiredBlocked = 25,
    /// Version tag already published with different content
    VersionConflict = 30,
    /// Malformed matrix configuration
    InvalidMatrix = 40,
    /// Configuration error
    Config = 50,
    /// Internal pipeline error
    Pipeline = 70,
}

impl ExitCode {
    /// Get the integer value of the exit code
    pub fn as_i32(&self) -> i32 {
        *self as i32
    }

    /// Check if this exit code indicates success
    pub fn is_success(&self) -> bool {
        matches!(self, ExitCode::Success)
    }
}

/// Human-readable, exhaustive run report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    /// Terminal state for every dispatched variant, resolver order
    pub reports: Vec<VariantReport>,
    /// Aggregate result
    pub aggregate: AggregateResult,
    /// Required variants that blocked publication, if any
    pub blocking_variants: Vec<String>,
    /// Wall-clock duration of the whole run in milliseconds
    pub duration_ms: u64,
}

impl PipelineSummary {
    /// Build a summary from terminal reports.
    pub fn new(reports: Vec<VariantReport>, duration_ms: u64) -> Self {
        let aggregate = AggregateResult::from_reports(&reports);
        let blocking_variants = reports
            .iter()
            .filter(|r| r.required && r.state.is_failure())
            .map(|r| r.variant.clone())
            .collect();

        Self {
            reports,
            aggregate,
            blocking_variants,
            duration_ms,
        }
    }

    /// Render the per-variant table plus the aggregate line.
    pub fn render_human(&self) -> String {
        let mut out = String::new();
        for report in &self.reports {
            let marker = match report.state {
                BuildState::Succeeded => "ok  ",
                BuildState::Failed => "FAIL",
                BuildState::TimedOut => "TIME",
                BuildState::Pending | BuildState::Running => "??? ",
            };
            let cached = if report.cache_hit { " (cached)" } else { "" };
            out.push_str(&format!(
                "{marker} {}{} [{}ms]",
                report.variant, cached, report.duration_ms
            ));
            if let Some(failure) = &report.failure {
                out.push_str(&format!(" - {}: {}", failure.kind.description(), failure.message));
            }
            out.push('\n');
        }

        match &self.aggregate {
            AggregateResult::AllSucceeded => out.push_str("all variants succeeded\n"),
            AggregateResult::PartialFailure(failed) => {
                out.push_str(&format!("partial failure: {}\n", failed.join(", ")));
            }
            AggregateResult::TotalFailure => out.push_str("total failure\n"),
        }

        if !self.blocking_variants.is_empty() {
            out.push_str(&format!(
                "publication blocked by required variant(s): {}\n",
                self.blocking_variants.join(", ")
            ));
        }

        out
    }
}
