/**
 * ACQUISITION - Exclusive ownership lease around every command
 *
 * ROLE :
 * acquire -> dispatch -> release, with release always attempted once the
 * place was acquired, retried with exponential backoff (1s, 2s, 4s, ...).
 *
 * OWNERSHIP AT CALL TIME :
 * - Unowned          : ask the coordinator for ownership
 * - OwnedBySelf      : no-op
 * - OwnedByOther(id) : `ExecError::Contended`, never retried
 */

use crate::dispatcher::Dispatcher;
use crate::error::{CoordinatorError, ExecError};
use crate::locks::TargetLocks;
use crate::models::CommandResult;
use crate::registry::TargetRegistry;
use async_trait::async_trait;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_RELEASE_RETRIES: u32 = 3;
const FIRST_RELEASE_BACKOFF: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Ownership {
    Unowned,
    OwnedBySelf,
    OwnedByOther(String),
}

pub struct AcquisitionCoordinator {
    registry: Arc<TargetRegistry>,
    dispatcher: Arc<dyn Dispatcher>,
    locks: TargetLocks,
    owner: String,
    release_retries: u32,
}

impl AcquisitionCoordinator {
    pub fn new(
        registry: Arc<TargetRegistry>,
        dispatcher: Arc<dyn Dispatcher>,
        locks: TargetLocks,
        owner: &str,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            locks,
            owner: owner.to_string(),
            release_retries: DEFAULT_RELEASE_RETRIES,
        }
    }

    pub fn with_release_retries(mut self, retries: u32) -> Self {
        self.release_retries = retries;
        self
    }

    /// Current owner as seen by the coordinator, falling back to the last
    /// known view when the coordinator cannot be reached.
    pub async fn ownership(&self, target: &str) -> Ownership {
        if let Err(e) = self.registry.refresh().await {
            debug!("ownership check for {target} uses cached view: {e}");
        }
        match self.registry.owner_of(target) {
            None => Ownership::Unowned,
            Some(owner) if owner == self.owner => Ownership::OwnedBySelf,
            Some(owner) => Ownership::OwnedByOther(owner),
        }
    }

    pub async fn acquire(&self, target: &str) -> Result<(), ExecError> {
        match self.ownership(target).await {
            Ownership::OwnedByOther(owner) => Err(ExecError::Contended {
                target: target.to_string(),
                owner,
            }),
            Ownership::OwnedBySelf => {
                debug!("{target} already acquired by us");
                Ok(())
            }
            Ownership::Unowned => {
                match self
                    .registry
                    .coordinator()
                    .request_ownership(target, &self.owner)
                    .await
                {
                    Ok(()) => {
                        debug!("acquired {target}");
                        Ok(())
                    }
                    Err(CoordinatorError::Rejected(msg)) => Err(classify_rejection(target, &msg)),
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    /// Single release attempt; ordinary failures are reported as `false`.
    pub async fn release(&self, target: &str) -> bool {
        match self.registry.coordinator().release_ownership(target).await {
            Ok(()) => {
                debug!("released {target}");
                true
            }
            Err(e) => {
                warn!("release of {target} failed: {e}");
                false
            }
        }
    }

    /// Up to `max_retries` extra attempts after the first, sleeping 1s, 2s, 4s, ...
    pub async fn release_with_retry(&self, target: &str, max_retries: u32) -> bool {
        let mut delay = FIRST_RELEASE_BACKOFF;
        for attempt in 0..=max_retries {
            if self.release(target).await {
                if attempt > 0 {
                    info!("released {target} after {} attempts", attempt + 1);
                }
                return true;
            }
            if attempt < max_retries {
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
        error!(
            "ALARM: could not release {target} after {} attempts, the place may remain locked",
            max_retries + 1
        );
        false
    }

    /// acquire -> dispatch -> release. The command result is returned as is,
    /// whatever the release outcome. Contention short-circuits before dispatch.
    pub async fn execute(
        &self,
        target: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        self.acquire(target).await?;

        let outcome = AssertUnwindSafe(self.dispatcher.execute(target, command, timeout))
            .catch_unwind()
            .await;
        self.release_with_retry(target, self.release_retries).await;

        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    /// Ad-hoc path: waits for the target lock, then runs `execute` on its own
    /// task so a dropped caller cannot skip the release.
    pub async fn execute_exclusive(
        self: &Arc<Self>,
        target: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        let this = Arc::clone(self);
        let target = target.to_string();
        let command = command.to_string();
        let handle = tokio::spawn(async move {
            let _guard = this.locks.acquire(&target).await;
            this.execute(&target, &command, timeout).await
        });
        match handle.await {
            Ok(result) => result,
            Err(e) => Err(ExecError::Fatal(format!("execution task failed: {e}"))),
        }
    }
}

#[async_trait]
impl Dispatcher for AcquisitionCoordinator {
    async fn execute(
        &self,
        target: &str,
        command: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError> {
        AcquisitionCoordinator::execute(self, target, command, timeout).await
    }
}

/// Maps a coordinator refusal to `Contended` ("already acquired by X") or `Fatal`.
pub fn classify_rejection(target: &str, message: &str) -> ExecError {
    let lower = message.to_lowercase();
    if lower.contains("already acquired") || lower.contains("already held") {
        ExecError::Contended {
            target: target.to_string(),
            owner: parse_holder(message).unwrap_or_else(|| "unknown".to_string()),
        }
    } else {
        ExecError::Fatal(message.to_string())
    }
}

fn parse_holder(message: &str) -> Option<String> {
    let lower = message.to_lowercase();
    let idx = lower.rfind(" by ")?;
    let holder = message[idx + 4..]
        .split_whitespace()
        .next()?
        .trim_matches(|c: char| c == '\'' || c == '"' || c == '.' || c == ',');
    (!holder.is_empty()).then(|| holder.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::MockCoordinator;
    use crate::dispatcher::CoordinatorDispatcher;

    const ME: &str = "labdash/dashboard";

    fn setup() -> (Arc<MockCoordinator>, Arc<AcquisitionCoordinator>) {
        let mock = Arc::new(MockCoordinator::demo_fleet());
        let registry = Arc::new(TargetRegistry::new(mock.clone()));
        let dispatcher = Arc::new(CoordinatorDispatcher::new(mock.clone()));
        let acq = AcquisitionCoordinator::new(registry, dispatcher, TargetLocks::new(), ME);
        (mock, Arc::new(acq))
    }

    #[tokio::test]
    async fn test_acquire_twice_requests_ownership_once() {
        let (mock, acq) = setup();
        acq.acquire("dut-1").await.unwrap();
        acq.acquire("dut-1").await.unwrap();
        assert_eq!(mock.calls().request_ownership, 1);
        assert_eq!(acq.ownership("dut-1").await, Ownership::OwnedBySelf);
    }

    #[tokio::test]
    async fn test_acquire_owned_by_other_is_contended() {
        let (mock, acq) = setup();
        let err = acq.acquire("dut-2").await.unwrap_err();
        assert_eq!(
            err,
            ExecError::Contended {
                target: "dut-2".into(),
                owner: "developer@host".into()
            }
        );
        assert_eq!(mock.calls().request_ownership, 0);
    }

    #[tokio::test]
    async fn test_acquire_classifies_rejections() {
        let (mock, acq) = setup();
        mock.reject_acquire("place dut-1 is already acquired by other-user");
        assert_eq!(
            acq.acquire("dut-1").await.unwrap_err(),
            ExecError::Contended {
                target: "dut-1".into(),
                owner: "other-user".into()
            }
        );

        mock.reject_acquire("connection refused");
        assert_eq!(
            acq.acquire("dut-1").await.unwrap_err(),
            ExecError::Fatal("connection refused".into())
        );
    }

    #[test]
    fn test_parse_holder() {
        assert_eq!(
            parse_holder("place x is already acquired by other-user").as_deref(),
            Some("other-user")
        );
        assert_eq!(parse_holder("already held"), None);
        assert!(matches!(
            classify_rejection("x", "already held"),
            ExecError::Contended { ref owner, .. } if owner == "unknown"
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_with_retry_backs_off_until_success() {
        let (mock, acq) = setup();
        mock.fail_releases(2);
        let start = tokio::time::Instant::now();

        assert!(acq.release_with_retry("dut-1", 3).await);
        assert_eq!(mock.calls().release, 3);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(3));
        assert!(waited < Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_release_with_retry_gives_up() {
        let (mock, acq) = setup();
        mock.always_fail_release();
        assert!(!acq.release_with_retry("dut-1", 2).await);
        assert_eq!(mock.calls().release, 3);
    }

    #[tokio::test]
    async fn test_execute_always_releases() {
        let (mock, acq) = setup();
        mock.set_output("false", CommandResult::new("", 1));
        let result = acq.execute("dut-1", "false", Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.exit_code, 1);
        assert_eq!(mock.calls().release, 1);

        mock.set_run_delay(Duration::from_millis(50));
        let err = acq
            .execute("dut-1", "sleep", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::TimedOut(_)));
        assert_eq!(mock.calls().release, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_returns_result_when_release_exhausted() {
        let (mock, acq) = setup();
        mock.always_fail_release();
        let result = acq.execute("dut-1", "uptime", Duration::from_secs(5)).await.unwrap();
        assert_eq!(result.exit_code, 0);
        assert_eq!(mock.calls().release, DEFAULT_RELEASE_RETRIES + 1);
    }

    #[tokio::test]
    async fn test_contended_execute_skips_dispatch_and_release() {
        let (mock, acq) = setup();
        let err = acq.execute("dut-2", "uptime", Duration::from_secs(5)).await.unwrap_err();
        assert!(err.is_contended());
        let calls = mock.calls();
        assert!(calls.runs.is_empty());
        assert_eq!(calls.release, 0);
    }

    #[tokio::test]
    async fn test_execute_exclusive_runs_under_target_lock() {
        let (mock, acq) = setup();
        let result = acq
            .execute_exclusive("dut-1", "hostname", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.output, "hostname @ dut-1\n");
        assert_eq!(mock.calls().release, 1);
        assert!(!acq.locks.is_busy("dut-1"));
    }
}
