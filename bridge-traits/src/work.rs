//! Background Work Dispatch
//!
//! Contract for the persistent work engine that runs course sync jobs.
//!
//! ## Overview
//!
//! The engine hands the dispatcher a [`WorkUnit`] together with
//! [`WorkConstraints`] and receives an opaque [`JobHandle`]. The dispatcher
//! owns everything about *running* the unit: waiting for the network and
//! battery constraints, bounding concurrency, retrying failed attempts and
//! keeping work alive across restarts where the platform allows it.
//!
//! While a unit runs it publishes progress payloads through its
//! [`ProgressReporter`]. The dispatcher retains the latest payload per handle
//! so that an observer attaching late (for example after the UI process was
//! restarted) immediately sees the current state.
//!
//! ## State Machine
//!
//! ```text
//! Enqueued ──> Running ──> Succeeded
//!    │            │ └────> Failed
//!    │            └──────> Enqueued (retry)
//!    └──────────> Cancelled <── Running
//! ```
//!
//! ## Platform Support
//!
//! - **Android**: WorkManager `OneTimeWorkRequest`
//! - **iOS**: `BGProcessingTask`
//! - **Desktop**: in-process Tokio dispatcher

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{BridgeError, Result};
use crate::network::NetworkRequirement;

// ============================================================================
// Handles and States
// ============================================================================

/// Opaque reference to a dispatched unit of work.
///
/// Persisted as its string form, so it must round-trip through
/// [`JobHandle::from_string`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobHandle(String);

impl JobHandle {
    /// Issue a fresh, random handle.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Rebuild a handle from its persisted form.
    pub fn from_string(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(BridgeError::UnknownHandle(s.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a dispatched unit of work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkState {
    /// Waiting for a slot or for its constraints.
    Enqueued,
    Running,
    Succeeded,
    /// Every attempt failed.
    Failed,
    Cancelled,
}

impl WorkState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            WorkState::Succeeded | WorkState::Failed | WorkState::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkState::Enqueued => "enqueued",
            WorkState::Running => "running",
            WorkState::Succeeded => "succeeded",
            WorkState::Failed => "failed",
            WorkState::Cancelled => "cancelled",
        }
    }
}

impl FromStr for WorkState {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "enqueued" => Ok(WorkState::Enqueued),
            "running" => Ok(WorkState::Running),
            "succeeded" => Ok(WorkState::Succeeded),
            "failed" => Ok(WorkState::Failed),
            "cancelled" => Ok(WorkState::Cancelled),
            other => Err(BridgeError::OperationFailed(format!(
                "Unknown work state: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for WorkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Constraints
// ============================================================================

/// Retry policy for failed work attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub use_exponential_backoff: bool,
}

impl RetryPolicy {
    /// Run exactly once.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before attempt number `attempt` (1-based; the first retry is 2).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let retries = attempt - 1;
        let delay = if self.use_exponential_backoff {
            let factor = 2u32.saturating_pow(retries.saturating_sub(1));
            self.base_delay.saturating_mul(factor)
        } else {
            self.base_delay.saturating_mul(retries)
        };
        delay.min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(600),
            use_exponential_backoff: true,
        }
    }
}

/// Conditions that must hold before (and while) a unit runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkConstraints {
    pub network: NetworkRequirement,
    pub requires_battery_not_low: bool,
    pub retry: RetryPolicy,
}

impl WorkConstraints {
    pub fn with_network(mut self, network: NetworkRequirement) -> Self {
        self.network = network;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for WorkConstraints {
    fn default() -> Self {
        Self {
            network: NetworkRequirement::Connected,
            requires_battery_not_low: true,
            retry: RetryPolicy::default(),
        }
    }
}

// ============================================================================
// Progress Reporting
// ============================================================================

/// Point-in-time view of a dispatched unit, as seen by observers.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkUpdate {
    pub handle: JobHandle,
    pub state: WorkState,
    /// Latest payload the unit published, if any.
    pub payload: Option<serde_json::Value>,
    /// Error message of the last failed attempt.
    pub failure: Option<String>,
}

impl WorkUpdate {
    pub fn enqueued(handle: JobHandle) -> Self {
        Self {
            handle,
            state: WorkState::Enqueued,
            payload: None,
            failure: None,
        }
    }
}

/// Sink a running unit publishes its progress payloads into.
///
/// Every call replaces the previously retained payload for the handle.
pub trait ProgressReporter: Send + Sync {
    fn publish(&self, payload: serde_json::Value) -> Result<()>;
}

/// Everything a unit receives for one attempt.
#[derive(Clone)]
pub struct WorkContext {
    pub handle: JobHandle,
    pub reporter: Arc<dyn ProgressReporter>,
    /// Tripped when the work is cancelled. Units check it cooperatively.
    pub cancellation: CancellationToken,
    /// 1-based attempt number.
    pub attempt: u32,
}

impl fmt::Debug for WorkContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkContext")
            .field("handle", &self.handle)
            .field("cancelled", &self.cancellation.is_cancelled())
            .field("attempt", &self.attempt)
            .finish()
    }
}

/// A unit of background work.
///
/// `run` may be invoked more than once when the retry policy allows it. An
/// `Err` marks the attempt failed; returning `Ok` after observing
/// cancellation is fine, the dispatcher records `Cancelled` either way.
#[async_trait]
pub trait WorkUnit: Send + Sync {
    /// Short human-readable label used in logs.
    fn describe(&self) -> String;

    async fn run(&self, ctx: WorkContext) -> Result<()>;
}

/// Stream of updates for one handle.
///
/// The first item is the current state (with the latest retained payload);
/// the stream ends after yielding a terminal state.
#[async_trait]
pub trait WorkUpdateStream: Send {
    async fn next(&mut self) -> Option<WorkUpdate>;
}

// ============================================================================
// Dispatcher
// ============================================================================

/// Work dispatcher trait
///
/// # Example
///
/// ```ignore
/// use bridge_traits::work::{WorkDispatcher, WorkConstraints};
///
/// async fn run(dispatcher: &dyn WorkDispatcher, unit: Arc<dyn WorkUnit>) -> Result<()> {
///     let handle = dispatcher.enqueue(unit, WorkConstraints::default()).await?;
///     let mut updates = dispatcher.observe(&handle).await?;
///     while let Some(update) = updates.next().await {
///         println!("{} -> {}", update.handle, update.state);
///     }
///     Ok(())
/// }
/// ```
#[async_trait]
pub trait WorkDispatcher: Send + Sync {
    /// Accept a unit for asynchronous execution.
    async fn enqueue(
        &self,
        unit: Arc<dyn WorkUnit>,
        constraints: WorkConstraints,
    ) -> Result<JobHandle>;

    /// Observe a handle's progress.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::UnknownHandle`] if the dispatcher has no record
    /// of the handle.
    async fn observe(&self, handle: &JobHandle) -> Result<Box<dyn WorkUpdateStream>>;

    /// Request cancellation. Cancelling finished work is a no-op.
    async fn cancel(&self, handle: &JobHandle) -> Result<()>;

    /// Current state, or `None` for handles the dispatcher does not know.
    async fn state(&self, handle: &JobHandle) -> Result<Option<WorkState>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_handle_round_trip() {
        let handle = JobHandle::new();
        let restored = JobHandle::from_string(handle.as_str()).unwrap();
        assert_eq!(handle, restored);
    }

    #[test]
    fn test_empty_handle_rejected() {
        assert!(matches!(
            JobHandle::from_string("  "),
            Err(BridgeError::UnknownHandle(_))
        ));
    }

    #[test]
    fn test_work_state_terminal() {
        assert!(!WorkState::Enqueued.is_terminal());
        assert!(!WorkState::Running.is_terminal());
        assert!(WorkState::Succeeded.is_terminal());
        assert!(WorkState::Failed.is_terminal());
        assert!(WorkState::Cancelled.is_terminal());
    }

    #[test]
    fn test_work_state_parse() {
        for state in [
            WorkState::Enqueued,
            WorkState::Running,
            WorkState::Succeeded,
            WorkState::Failed,
            WorkState::Cancelled,
        ] {
            assert_eq!(state.as_str().parse::<WorkState>().unwrap(), state);
        }
        assert!("paused".parse::<WorkState>().is_err());
    }

    #[test]
    fn test_exponential_backoff_is_capped() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            use_exponential_backoff: true,
        };

        assert_eq!(policy.delay_for(1), Duration::ZERO);
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
        assert_eq!(policy.delay_for(3), Duration::from_secs(2));
        assert_eq!(policy.delay_for(4), Duration::from_secs(4));
        assert_eq!(policy.delay_for(5), Duration::from_secs(5));
    }

    #[test]
    fn test_linear_backoff() {
        let policy = RetryPolicy {
            max_attempts: 4,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            use_exponential_backoff: false,
        };

        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
    }

    #[test]
    fn test_default_constraints_require_battery() {
        let constraints = WorkConstraints::default();
        assert!(constraints.requires_battery_not_low);
        assert_eq!(constraints.network, NetworkRequirement::Connected);
    }
}
