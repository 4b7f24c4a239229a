//! External toolchain invocation
//!
//! The application compiler is an external collaborator: the pipeline
//! hands it a variant and a working directory and gets back an exit
//! status plus declared output files. Process isolation is the
//! configured command's concern (it may itself be a container runtime
//! invocation); the pipeline only starts, stops, and timeouts it.

use std::io;
use std::path::Path;
use std::process::Command;
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::job::ToolchainIdentity;
use crate::matrix::VariantSpec;

/// Default grace period between kill and giving up on a timed-out child
pub const KILL_GRACE: Duration = Duration::from_secs(5);

/// Errors from a toolchain invocation
#[derive(Debug, Error)]
pub enum ToolchainError {
    #[error("toolchain command is empty")]
    EmptyCommand,

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("toolchain exited with {}", code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    NonZeroExit { code: Option<i32> },

    #[error("toolchain exceeded deadline of {after:?}")]
    Timeout { after: Duration },
}

/// One build request handed to the toolchain.
pub struct BuildRequest<'a> {
    /// The variant to build
    pub variant: &'a VariantSpec,
    /// Directory the toolchain must write its declared outputs into
    pub build_dir: &'a Path,
    /// Per-job deadline
    pub deadline: Duration,
}

/// The toolchain seam. Implementations must be shareable across worker
/// threads.
pub trait Toolchain: Send + Sync {
    /// Identity participating in cache keys.
    fn identity(&self) -> ToolchainIdentity;

    /// Build one variant, writing declared outputs into
    /// `req.build_dir`. Must respect `req.deadline`, returning
    /// `ToolchainError::Timeout` after best-effort termination.
    fn build(&self, req: &BuildRequest<'_>) -> Result<(), ToolchainError>;
}

/// Toolchain that runs a configured external command per variant.
///
/// The variant is passed through environment variables
/// (`VARSHIP_VARIANT`, `VARSHIP_CHANNEL`, `VARSHIP_CRYPTO_MODE`,
/// `VARSHIP_OUTPUT_DIR`); the command runs with the build directory as
/// its working directory.
pub struct ProcessToolchain {
    identity: ToolchainIdentity,
    command: Vec<String>,
    kill_grace: Duration,
}

impl ProcessToolchain {
    /// Create a toolchain for the given command line.
    pub fn new(identity: ToolchainIdentity, command: Vec<String>) -> Self {
        Self {
            identity,
            command,
            kill_grace: KILL_GRACE,
        }
    }
}

impl Toolchain for ProcessToolchain {
    fn identity(&self) -> ToolchainIdentity {
        self.identity.clone()
    }

    fn build(&self, req: &BuildRequest<'_>) -> Result<(), ToolchainError> {
        let Some((program, args)) = self.command.split_first() else {
            return Err(ToolchainError::EmptyCommand);
        };

        let mut child = Command::new(program)
            .args(args)
            .current_dir(req.build_dir)
            .env("VARSHIP_VARIANT", &req.variant.name)
            .env("VARSHIP_CHANNEL", &req.variant.channel)
            .env("VARSHIP_CRYPTO_MODE", &req.variant.crypto_mode)
            .env("VARSHIP_OUTPUT_DIR", req.build_dir)
            .spawn()?;

        let started = Instant::now();
        let poll_interval = Duration::from_millis(100);

        loop {
            if let Some(status) = child.try_wait()? {
                return if status.success() {
                    Ok(())
                } else {
                    Err(ToolchainError::NonZeroExit {
                        code: status.code(),
                    })
                };
            }

            if started.elapsed() >= req.deadline {
                // Best-effort termination; the job is TimedOut either way
                let _ = child.kill();
                let grace_start = Instant::now();
                while grace_start.elapsed() < self.kill_grace {
                    if child.try_wait()?.is_some() {
                        break;
                    }
                    std::thread::sleep(poll_interval);
                }
                return Err(ToolchainError::Timeout {
                    after: req.deadline,
                });
            }

            std::thread::sleep(poll_interval);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn variant() -> VariantSpec {
        VariantSpec {
            name: "play-standard".to_string(),
            channel: "play".to_string(),
            crypto_mode: "standard".to_string(),
            required: true,
            outputs: vec!["play-standard.apk".to_string()],
        }
    }

    fn identity() -> ToolchainIdentity {
        ToolchainIdentity {
            tool: "sh".to_string(),
            version: "1".to_string(),
        }
    }

    #[test]
    #[cfg(unix)]
    fn test_process_writes_output() {
        let temp = TempDir::new().unwrap();
        let toolchain = ProcessToolchain::new(
            identity(),
            vec![
                "sh".to_string(),
                "-c".to_string(),
                "printf payload > \"$VARSHIP_OUTPUT_DIR/$VARSHIP_VARIANT.apk\"".to_string(),
            ],
        );

        let v = variant();
        toolchain
            .build(&BuildRequest {
                variant: &v,
                build_dir: temp.path(),
                deadline: Duration::from_secs(10),
            })
            .unwrap();

        assert!(temp.path().join("play-standard.apk").is_file());
    }

    #[test]
    #[cfg(unix)]
    fn test_nonzero_exit_reported() {
        let temp = TempDir::new().unwrap();
        let toolchain = ProcessToolchain::new(
            identity(),
            vec!["sh".to_string(), "-c".to_string(), "exit 3".to_string()],
        );

        let v = variant();
        let err = toolchain
            .build(&BuildRequest {
                variant: &v,
                build_dir: temp.path(),
                deadline: Duration::from_secs(10),
            })
            .unwrap_err();
        assert!(matches!(err, ToolchainError::NonZeroExit { code: Some(3) }));
    }

    #[test]
    #[cfg(unix)]
    fn test_deadline_kills_process() {
        let temp = TempDir::new().unwrap();
        let toolchain = ProcessToolchain::new(
            identity(),
            vec!["sleep".to_string(), "30".to_string()],
        );

        let v = variant();
        let started = Instant::now();
        let err = toolchain
            .build(&BuildRequest {
                variant: &v,
                build_dir: temp.path(),
                deadline: Duration::from_millis(300),
            })
            .unwrap_err();

        assert!(matches!(err, ToolchainError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_empty_command_rejected() {
        let temp = TempDir::new().unwrap();
        let toolchain = ProcessToolchain::new(identity(), Vec::new());

        let v = variant();
        let err = toolchain
            .build(&BuildRequest {
                variant: &v,
                build_dir: temp.path(),
                deadline: Duration::from_secs(1),
            })
            .unwrap_err();
        assert!(matches!(err, ToolchainError::EmptyCommand));
    }
}
