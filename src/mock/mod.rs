//! Scripted toolchain for tests
//!
//! Stands in for the external compiler with per-variant scripted
//! outcomes, and records every invocation so tests can assert the
//! single-flight and isolation properties.

use std::collections::HashMap;
use std::fs;
use std::sync::Mutex;
use std::time::Duration;

use crate::job::ToolchainIdentity;
use crate::toolchain::{BuildRequest, Toolchain, ToolchainError};

/// Scripted result for one variant
#[derive(Debug, Clone)]
pub enum ScriptedOutcome {
    /// Write every declared output containing `content`
    Succeed { content: String },
    /// Exit non-zero
    Fail { code: i32 },
    /// Run past the job deadline
    Hang,
}

/// Configurable fake toolchain.
///
/// Variants without a script succeed with a default payload.
pub struct ScriptedToolchain {
    identity: ToolchainIdentity,
    outcomes: HashMap<String, ScriptedOutcome>,
    invocations: Mutex<Vec<String>>,
}

impl ScriptedToolchain {
    /// New toolchain where every variant succeeds.
    pub fn new() -> Self {
        Self {
            identity: ToolchainIdentity {
                tool: "scripted".to_string(),
                version: "1.0".to_string(),
            },
            outcomes: HashMap::new(),
            invocations: Mutex::new(Vec::new()),
        }
    }

    /// Script the outcome for one variant.
    pub fn script(mut self, variant: &str, outcome: ScriptedOutcome) -> Self {
        self.outcomes.insert(variant.to_string(), outcome);
        self
    }

    /// How many times `variant` was actually built.
    pub fn invocation_count(&self, variant: &str) -> usize {
        self.invocations
            .lock()
            .map(|log| log.iter().filter(|v| v.as_str() == variant).count())
            .unwrap_or(0)
    }

    /// Total builds across all variants.
    pub fn total_invocations(&self) -> usize {
        self.invocations.lock().map(|log| log.len()).unwrap_or(0)
    }
}

impl Default for ScriptedToolchain {
    fn default() -> Self {
        Self::new()
    }
}

impl Toolchain for ScriptedToolchain {
    fn identity(&self) -> ToolchainIdentity {
        self.identity.clone()
    }

    fn build(&self, req: &BuildRequest<'_>) -> Result<(), ToolchainError> {
        if let Ok(mut log) = self.invocations.lock() {
            log.push(req.variant.name.clone());
        }

        let outcome = self
            .outcomes
            .get(&req.variant.name)
            .cloned()
            .unwrap_or(ScriptedOutcome::Succeed {
                content: format!("payload-{}", req.variant.name),
            });

        match outcome {
            ScriptedOutcome::Succeed { content } => {
                for output in &req.variant.outputs {
                    fs::write(req.build_dir.join(output), &content)?;
                }
                Ok(())
            }
            ScriptedOutcome::Fail { code } => Err(ToolchainError::NonZeroExit { code: Some(code) }),
            ScriptedOutcome::Hang => {
                // Simulate a stuck build: the deadline elapses, then the
                // host-side kill takes effect
                std::thread::sleep(req.deadline + Duration::from_millis(10));
                Err(ToolchainError::Timeout {
                    after: req.deadline,
                })
            }
        }
    }
}
