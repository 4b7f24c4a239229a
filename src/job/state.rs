//! Build job state machine
//!
//! Job states: PENDING → RUNNING → {SUCCEEDED | FAILED | TIMED_OUT}
//!
//! TimedOut is a terminal failure: the toolchain process is asked to
//! terminate best-effort, but the job is marked TIMED_OUT regardless of
//! whether termination succeeds within the grace period.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::Path;

/// Schema version for job_state.json
pub const SCHEMA_VERSION: u32 = 1;

/// Schema identifier
pub const SCHEMA_ID: &str = "varship/job_state@1";

/// Job state enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildState {
    /// Job is dispatched, waiting for a worker slot
    Pending,
    /// Job is actively executing
    Running,
    /// Job completed successfully
    Succeeded,
    /// Job failed
    Failed,
    /// Job exceeded its deadline
    TimedOut,
}

impl BuildState {
    /// Check if transition from this state to target is valid
    pub fn can_transition_to(&self, target: BuildState) -> bool {
        match (self, target) {
            // From PENDING
            (BuildState::Pending, BuildState::Running) => true,
            (BuildState::Pending, BuildState::Failed) => true, // Can fail before starting

            // From RUNNING
            (BuildState::Running, BuildState::Succeeded) => true,
            (BuildState::Running, BuildState::Failed) => true,
            (BuildState::Running, BuildState::TimedOut) => true,

            // Terminal states cannot transition
            _ => false,
        }
    }

    /// Check if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BuildState::Succeeded | BuildState::Failed | BuildState::TimedOut
        )
    }

    /// Check if this is a terminal failure state
    pub fn is_failure(&self) -> bool {
        matches!(self, BuildState::Failed | BuildState::TimedOut)
    }
}

/// Errors for job state operations
#[derive(Debug, thiserror::Error)]
pub enum JobStateError {
    #[error("invalid state transition from {from:?} to {to:?}")]
    InvalidTransition { from: BuildState, to: BuildState },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Job state record (job_state.json)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobStateData {
    /// Schema version
    pub schema_version: u32,

    /// Schema identifier
    pub schema_id: String,

    /// Job identifier
    pub job_id: String,

    /// Variant this job builds
    pub variant: String,

    /// Current state
    pub state: BuildState,

    /// When the job was created
    pub created_at: DateTime<Utc>,

    /// When the state was last updated
    pub updated_at: DateTime<Utc>,
}

impl JobStateData {
    /// Create a new job in PENDING state
    pub fn new(job_id: String, variant: String) -> Self {
        let now = Utc::now();
        Self {
            schema_version: SCHEMA_VERSION,
            schema_id: SCHEMA_ID.to_string(),
            job_id,
            variant,
            state: BuildState::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Transition to a new state
    pub fn transition(&mut self, new_state: BuildState) -> Result<(), JobStateError> {
        if !self.state.can_transition_to(new_state) {
            return Err(JobStateError::InvalidTransition {
                from: self.state,
                to: new_state,
            });
        }

        self.state = new_state;
        self.updated_at = Utc::now();

        Ok(())
    }

    /// Start the job (PENDING → RUNNING)
    pub fn start(&mut self) -> Result<(), JobStateError> {
        self.transition(BuildState::Running)
    }

    /// Mark job as succeeded
    pub fn succeed(&mut self) -> Result<(), JobStateError> {
        self.transition(BuildState::Succeeded)
    }

    /// Mark job as failed
    pub fn fail(&mut self) -> Result<(), JobStateError> {
        self.transition(BuildState::Failed)
    }

    /// Mark job as timed out
    pub fn time_out(&mut self) -> Result<(), JobStateError> {
        self.transition(BuildState::TimedOut)
    }

    /// Check if job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Serialize to JSON
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Load from JSON
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Write atomically to file (write-then-rename)
    pub fn write_to_file(&self, path: &Path) -> Result<(), JobStateError> {
        let json = self.to_json()?;

        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, &json)?;
        fs::rename(&temp_path, path)?;

        Ok(())
    }

    /// Load from file
    pub fn from_file(path: &Path) -> Result<Self, JobStateError> {
        let json = fs::read_to_string(path)?;
        Ok(Self::from_json(&json)?)
    }

    /// Write to job directory as job_state.json
    pub fn write_to_job_dir(&self, job_dir: &Path) -> Result<(), JobStateError> {
        self.write_to_file(&job_dir.join("job_state.json"))
    }
}
