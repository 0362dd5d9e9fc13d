//! Error taxonomy shared by the engine modules.
//!
//! `CoordinatorError` is what a collaborator reports; `ExecError` is the typed
//! outcome callers branch on (contention is a value, not a panic path).

use std::time::Duration;

/// Raw failure reported by the coordinator collaborator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinatorError {
    /// The coordinator answered but refused the request.
    #[error("coordinator rejected request: {0}")]
    Rejected(String),
    #[error("coordinator call timed out after {0:?}")]
    TimedOut(Duration),
    /// The coordinator could not be reached at all.
    #[error("coordinator unreachable: {0}")]
    Transport(String),
}

/// Outcome of an execution attempt on a target.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecError {
    #[error("target '{target}' is acquired by '{owner}'")]
    Contended { target: String, owner: String },
    #[error("command timed out after {0:?}")]
    TimedOut(Duration),
    #[error("coordinator unreachable: {0}")]
    Transport(String),
    #[error("{0}")]
    Fatal(String),
}

impl ExecError {
    pub fn is_contended(&self) -> bool {
        matches!(self, ExecError::Contended { .. })
    }

    /// Exit code reported to clients when a run produced no real exit status.
    pub fn exit_code(&self) -> i32 {
        match self {
            ExecError::TimedOut(_) => 124,
            _ => 1,
        }
    }
}

impl From<CoordinatorError> for ExecError {
    fn from(err: CoordinatorError) -> Self {
        match err {
            CoordinatorError::Rejected(msg) => ExecError::Fatal(msg),
            CoordinatorError::TimedOut(d) => ExecError::TimedOut(d),
            CoordinatorError::Transport(msg) => ExecError::Transport(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinator_errors_map_to_exec_errors() {
        assert_eq!(
            ExecError::from(CoordinatorError::Rejected("boom".into())),
            ExecError::Fatal("boom".into())
        );
        assert_eq!(
            ExecError::from(CoordinatorError::Transport("down".into())),
            ExecError::Transport("down".into())
        );
    }

    #[test]
    fn test_timeout_exit_code_is_non_zero() {
        assert_eq!(ExecError::TimedOut(Duration::from_secs(3)).exit_code(), 124);
        assert_eq!(ExecError::Fatal("x".into()).exit_code(), 1);
    }
}
