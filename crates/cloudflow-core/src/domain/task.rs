use crate::Params;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Value object: action instance ID, caller-assigned, unique within its flow
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActionId(pub String);

impl std::fmt::Display for ActionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ActionId {
    fn from(value: &str) -> Self {
        ActionId(value.to_string())
    }
}

/// Task status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting on unsatisfied dependencies
    Pending,

    /// All dependencies Success; eligible for claiming
    Ready,

    /// Claimed by exactly one worker
    Running,

    /// Handler returned successfully
    Success,

    /// Attempts exhausted, or swept because a predecessor failed
    Failed,
}

impl TaskStatus {
    /// Terminal task statuses
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed)
    }
}

/// Delay curve between retry attempts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum Backoff {
    /// Constant delay between attempts
    Fixed {
        /// Delay in milliseconds
        interval_ms: u64,
    },

    /// Delay doubles with each failed attempt, bounded by a cap
    Exponential {
        /// Delay before the first retry, in milliseconds
        base_ms: u64,
        /// Upper bound on the delay, in milliseconds
        cap_ms: u64,
    },
}

impl Backoff {
    /// Delay before re-enqueueing after the given failed attempt (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            Backoff::Fixed { interval_ms } => Duration::from_millis(*interval_ms),
            Backoff::Exponential { base_ms, cap_ms } => {
                let exp = attempt.saturating_sub(1).min(32);
                let delay = base_ms.saturating_mul(1u64 << exp);
                Duration::from_millis(delay.min(*cap_ms))
            }
        }
    }
}

/// Retry policy for a task; a task without one gets a single attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,

    /// Delay curve between attempts
    #[serde(flatten)]
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Fixed-interval retries
    pub fn fixed(max_attempts: u32, interval: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Fixed {
                interval_ms: interval.as_millis() as u64,
            },
        }
    }

    /// Exponential retries
    pub fn exponential(max_attempts: u32, base: Duration, cap: Duration) -> Self {
        Self {
            max_attempts,
            backoff: Backoff::Exponential {
                base_ms: base.as_millis() as u64,
                cap_ms: cap.as_millis() as u64,
            },
        }
    }
}

/// One unit of work within a flow
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Caller-assigned identifier, unique within the flow
    pub action_id: ActionId,

    /// Registry key selecting the handler
    pub action_name: String,

    /// Predecessors that must reach Success first
    pub depend_on: Vec<ActionId>,

    /// Opaque payload passed to the handler
    pub params: Params,

    /// Retry policy; `None` means a single attempt
    pub retry: Option<RetryPolicy>,

    /// Current status
    pub status: TaskStatus,

    /// Attempts started so far (incremented at claim time)
    pub attempt: u32,

    /// Token of the scheduler instance that claimed the running attempt
    pub worker: Option<String>,

    /// Backoff gate: the task may not be claimed before this instant
    pub not_before: Option<DateTime<Utc>>,

    /// Handler result recorded on Success
    pub result: Option<Params>,

    /// Last handler error
    pub error: Option<String>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Create a new pending task
    pub fn new(
        action_id: impl Into<ActionId>,
        action_name: impl Into<String>,
        depend_on: Vec<ActionId>,
        params: Params,
        retry: Option<RetryPolicy>,
    ) -> Self {
        Self {
            action_id: action_id.into(),
            action_name: action_name.into(),
            depend_on,
            params,
            retry,
            status: TaskStatus::Pending,
            attempt: 0,
            worker: None,
            not_before: None,
            result: None,
            error: None,
            updated_at: Utc::now(),
        }
    }

    /// Attempts the task is allowed in total
    pub fn max_attempts(&self) -> u32 {
        self.retry.as_ref().map_or(1, |r| r.max_attempts.max(1))
    }

    /// Whether another attempt may follow a failure of the current one
    pub fn retry_eligible(&self) -> bool {
        self.attempt < self.max_attempts()
    }

    /// Delay to apply before the next attempt
    pub fn retry_delay(&self) -> Duration {
        self.retry
            .as_ref()
            .map_or(Duration::ZERO, |r| r.backoff.delay(self.attempt))
    }
}

impl From<String> for ActionId {
    fn from(value: String) -> Self {
        ActionId(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_task_without_retry_gets_single_attempt() {
        let task = Task::new("a1", "create_eip", vec![], Params::null(), None);
        assert_eq!(task.max_attempts(), 1);
        assert_eq!(task.retry_delay(), Duration::ZERO);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.attempt, 0);
    }

    #[test]
    fn test_fixed_backoff_is_constant() {
        let backoff = Backoff::Fixed { interval_ms: 250 };
        assert_eq!(backoff.delay(1), Duration::from_millis(250));
        assert_eq!(backoff.delay(7), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_backoff_grows_and_caps() {
        let backoff = Backoff::Exponential {
            base_ms: 100,
            cap_ms: 1500,
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(400));
        assert_eq!(backoff.delay(5), Duration::from_millis(1500));
        // Large attempt counts must not overflow
        assert_eq!(backoff.delay(200), Duration::from_millis(1500));
    }

    #[test]
    fn test_retry_eligibility_tracks_attempts() {
        let mut task = Task::new(
            "a1",
            "attach_disk",
            vec![],
            Params::null(),
            Some(RetryPolicy::fixed(2, Duration::from_millis(10))),
        );
        assert_eq!(task.max_attempts(), 2);

        task.attempt = 1;
        assert!(task.retry_eligible());
        task.attempt = 2;
        assert!(!task.retry_eligible());
    }

    #[test]
    fn test_retry_policy_serde_shape() {
        let policy = RetryPolicy::exponential(
            3,
            Duration::from_millis(100),
            Duration::from_secs(5),
        );
        let value = serde_json::to_value(&policy).unwrap();
        assert_eq!(
            value,
            json!({
                "max_attempts": 3,
                "policy": "exponential",
                "base_ms": 100,
                "cap_ms": 5000,
            })
        );

        let back: RetryPolicy = serde_json::from_value(value).unwrap();
        assert_eq!(back, policy);
    }

    #[test]
    fn test_task_serialization() {
        let task = Task::new(
            "a2",
            "bind_eip",
            vec!["a1".into()],
            Params::new(json!({"cvm_id": "cvm-7"})),
            Some(RetryPolicy::fixed(3, Duration::from_secs(1))),
        );

        let serialized = serde_json::to_string(&task).unwrap();
        let back: Task = serde_json::from_str(&serialized).unwrap();
        assert_eq!(back.action_id, task.action_id);
        assert_eq!(back.depend_on, vec![ActionId("a1".to_string())]);
        assert_eq!(back.retry, task.retry);
    }
}
