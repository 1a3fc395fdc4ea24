use crate::EngineError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Value object: Flow ID
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowId(pub String);

impl std::fmt::Display for FlowId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How the flow's task set was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowKind {
    /// Task set expanded from a registered template
    Template,

    /// Ad hoc task set supplied at creation time
    Custom,
}

/// Flow status
///
/// Statuses are monotonic along Pending -> Scheduled -> Running ->
/// {Success | Failed | Cancelled}; `Cancelling` is the cancel intent
/// between Running and Cancelled while in-flight attempts drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowStatus {
    /// Accepted and persisted, not yet picked up by a scheduler
    Pending,

    /// Picked up by a scheduler; ready tasks identified
    Scheduled,

    /// At least one task has been claimed
    Running,

    /// Cancel requested; no further tasks are claimed
    Cancelling,

    /// All tasks finished with Success
    Success,

    /// A task exhausted its attempts, or its dependents can never run
    Failed,

    /// Cancelled and no task remains running
    Cancelled,
}

impl FlowStatus {
    /// Terminal statuses admit no further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            FlowStatus::Success | FlowStatus::Failed | FlowStatus::Cancelled
        )
    }

    /// Whether the state machine admits `self -> next`.
    pub fn can_transition_to(&self, next: FlowStatus) -> bool {
        use FlowStatus::*;
        matches!(
            (*self, next),
            (Pending, Scheduled)
                | (Pending, Cancelled)
                | (Scheduled, Running)
                | (Scheduled, Success)
                | (Scheduled, Failed)
                | (Scheduled, Cancelling)
                | (Scheduled, Cancelled)
                | (Running, Success)
                | (Running, Failed)
                | (Running, Cancelling)
                | (Running, Cancelled)
                | (Cancelling, Cancelled)
        )
    }
}

/// Flow-scoped key/value bag passed between dependent tasks.
///
/// Patch merge is last-write-wins at key granularity; the store applies
/// each patch inside a single transaction, so two independent tasks
/// touching the same key serialize there.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ShareData(HashMap<String, serde_json::Value>);

impl ShareData {
    /// Create an empty bag
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a key
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    /// Write a key
    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.0.insert(key.into(), value);
    }

    /// Apply a patch, overwriting existing keys
    pub fn merge(&mut self, patch: ShareData) {
        for (key, value) in patch.0 {
            self.0.insert(key, value);
        }
    }

    /// Whether the bag holds no keys
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate over entries
    pub fn iter(&self) -> impl Iterator<Item = (&String, &serde_json::Value)> {
        self.0.iter()
    }
}

impl FromIterator<(String, serde_json::Value)> for ShareData {
    fn from_iter<I: IntoIterator<Item = (String, serde_json::Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Aggregate: one orchestration instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    /// Unique identifier
    pub id: FlowId,

    /// Template name or custom label
    pub name: String,

    /// Template or custom
    pub kind: FlowKind,

    /// Current status
    pub status: FlowStatus,

    /// Created gated; not eligible for scheduling until released
    /// through the producer's flow-state update
    pub init_state: bool,

    /// Shared data, mutable by any of the flow's tasks
    pub share_data: ShareData,

    /// Optional free-form note
    pub memo: Option<String>,

    /// Failure reason once the flow is Failed
    pub error: Option<String>,

    /// Creation timestamp
    pub created_at: DateTime<Utc>,

    /// Last updated timestamp
    pub updated_at: DateTime<Utc>,
}

impl Flow {
    /// Create a new flow in Pending
    pub fn new(name: impl Into<String>, kind: FlowKind, share_data: ShareData) -> Self {
        let now = Utc::now();
        Self {
            id: FlowId(Uuid::new_v4().to_string()),
            name: name.into(),
            kind,
            status: FlowStatus::Pending,
            init_state: false,
            share_data,
            memo: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attach a memo
    pub fn with_memo(mut self, memo: Option<String>) -> Self {
        self.memo = memo;
        self
    }

    /// Keep the flow gated until explicitly released
    pub fn with_init_state(mut self, init_state: bool) -> Self {
        self.init_state = init_state;
        self
    }

    /// Advance the status, enforcing the state machine.
    pub fn transition(&mut self, next: FlowStatus) -> Result<(), EngineError> {
        if !self.status.can_transition_to(next) {
            return Err(EngineError::InvalidTransition(format!(
                "flow {}: {:?} -> {:?}",
                self.id, self.status, next
            )));
        }

        self.status = next;
        // Leaving Pending releases the init gate
        if next != FlowStatus::Pending {
            self.init_state = false;
        }
        self.touch();
        Ok(())
    }

    /// Record the failure reason and move to Failed.
    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), EngineError> {
        self.transition(FlowStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    /// Update the timestamp
    #[inline]
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
