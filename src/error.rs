//! Error types for cohort coordination.
//!
//! Two tiers, kept in separate enums so their propagation policies cannot be
//! confused:
//!
//! - [`ConfigError`] is fatal to the run. Every variant here would otherwise
//!   manifest as a permanent hang (a barrier waiting for parties that do not
//!   exist, a worker started before it holds a segment handle), so it is
//!   reported immediately and aborts all workers.
//! - [`TaskError`] is local to one task. It is captured in that task's
//!   outcome and never aborts siblings or the scheduler. No retries exist at
//!   this layer.
//!
//! Enums are `#[non_exhaustive]`; consumers should keep a fallback arm.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Fatal pre-run / protocol-ordering errors.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum ConfigError {
    /// A run needs at least one worker.
    NoWorkers,
    /// Barrier party count does not match the live cohort size. Left
    /// unchecked this hangs every `wait()` forever.
    PartyCountMismatch { parties: u32, workers: u32 },
    /// Work-stealing needs exactly one initial partition per worker.
    PartitionCountMismatch { partitions: usize, workers: usize },
    /// Mutex mode with zero operations.
    ZeroOperations,
    /// Barrier mode with zero rounds.
    ZeroRounds,
    /// Worker received `Configure` before `Init`.
    ConfigureBeforeInit { worker_id: usize },
    /// Worker received `Start` before `Init`.
    StartBeforeInit { worker_id: usize },
    /// Worker received `Start` before `Configure`.
    StartBeforeConfigure { worker_id: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoWorkers => write!(f, "run requires at least one worker"),
            Self::PartyCountMismatch { parties, workers } => write!(
                f,
                "barrier party count {parties} does not match worker count {workers}"
            ),
            Self::PartitionCountMismatch {
                partitions,
                workers,
            } => write!(
                f,
                "got {partitions} initial partitions for {workers} workers"
            ),
            Self::ZeroOperations => write!(f, "mutex mode requires operations > 0"),
            Self::ZeroRounds => write!(f, "barrier mode requires rounds > 0"),
            Self::ConfigureBeforeInit { worker_id } => {
                write!(f, "worker {worker_id} received configure before init")
            }
            Self::StartBeforeInit { worker_id } => {
                write!(f, "worker {worker_id} received start before init")
            }
            Self::StartBeforeConfigure { worker_id } => {
                write!(f, "worker {worker_id} received start before configure")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Top-level failure of a whole run.
#[derive(Debug)]
#[non_exhaustive]
pub enum RunError {
    /// The spec was invalid, or a worker reported a protocol violation.
    Config(ConfigError),
    /// A worker thread failed to spawn.
    Spawn(std::io::Error),
}

impl From<ConfigError> for RunError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl fmt::Display for RunError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "invalid run configuration: {e}"),
            Self::Spawn(e) => write!(f, "failed to spawn worker thread: {e}"),
        }
    }
}

impl std::error::Error for RunError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Spawn(e) => Some(e),
        }
    }
}

/// Per-task execution failure, surfaced in the task's outcome.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[non_exhaustive]
pub enum TaskError {
    /// The task body reported failure. `detail` is human-readable context,
    /// not stable for machine parsing.
    Execution { detail: String },
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Execution { detail } => write!(f, "task execution failed: {detail}"),
        }
    }
}

impl std::error::Error for TaskError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names_the_mismatch() {
        let e = ConfigError::PartyCountMismatch {
            parties: 5,
            workers: 3,
        };
        let s = e.to_string();
        assert!(s.contains('5') && s.contains('3'));
    }

    #[test]
    fn config_error_roundtrips_through_serde() {
        let e = ConfigError::StartBeforeInit { worker_id: 2 };
        let json = serde_json::to_string(&e).unwrap();
        let back: ConfigError = serde_json::from_str(&json).unwrap();
        assert_eq!(back, e);
    }
}
