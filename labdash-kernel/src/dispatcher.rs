//! Command dispatch over the coordinator's execution primitive.

use crate::coordinator::Coordinator;
use crate::error::ExecError;
use crate::models::CommandResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait Dispatcher: Send + Sync + 'static {
    async fn execute(
        &self,
        target: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError>;
}

/// Runs commands through the coordinator and enforces the timeout itself:
/// on expiry the in-flight call is dropped, which terminates it.
pub struct CoordinatorDispatcher {
    coordinator: Arc<dyn Coordinator>,
}

impl CoordinatorDispatcher {
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self { coordinator }
    }
}

#[async_trait]
impl Dispatcher for CoordinatorDispatcher {
    async fn execute(
        &self,
        target: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        debug!("dispatching '{command}' on {target} (timeout {timeout:?})");
        match tokio::time::timeout(timeout, self.coordinator.run(target, command, timeout)).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(e)) => {
                warn!("'{command}' on {target} failed: {e}");
                Err(e.into())
            }
            Err(_) => {
                warn!("'{command}' on {target} timed out after {timeout:?}");
                Err(ExecError::TimedOut(timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MockCoordinator;

    #[tokio::test]
    async fn test_execute_returns_output_and_exit_code() {
        let mock = Arc::new(MockCoordinator::demo_fleet());
        mock.set_output("uname -a", CommandResult::new("Linux dut-1", 0));
        let dispatcher = CoordinatorDispatcher::new(mock.clone());

        let result = dispatcher
            .execute("dut-1", "uname -a", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result, CommandResult::new("Linux dut-1", 0));
        assert_eq!(mock.calls().runs, vec![("dut-1".to_string(), "uname -a".to_string())]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_times_out() {
        let mock = Arc::new(MockCoordinator::demo_fleet());
        mock.set_run_delay(Duration::from_secs(60));
        let dispatcher = CoordinatorDispatcher::new(mock);

        let err = dispatcher
            .execute("dut-1", "sleep 60", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err, ExecError::TimedOut(Duration::from_secs(2)));
    }

    #[tokio::test]
    async fn test_transport_failure_is_typed() {
        let mock = Arc::new(MockCoordinator::demo_fleet());
        mock.set_unreachable(true);
        let dispatcher = CoordinatorDispatcher::new(mock);

        let err = dispatcher
            .execute("dut-1", "true", Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Transport(_)));
    }
}
