//! Single-writer state tracking for an epic run.
//!
//! `StateTracker` owns every mutable piece of run state: sprint statuses,
//! contract lock state and the durable transition log. All other components
//! read snapshots through its accessors and never mutate sprints directly.
//! Every transition is appended to the store, never overwritten, so the full
//! history stays reconstructable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::contracts::ContractLockManager;
use crate::core::errors::{EpicError, Result};
use crate::model::{Contract, EpicPlan, EpicStatus, Sprint, SprintStatus};
use crate::state::store::{RunEvent, TransitionEvent, TransitionStore};

/// Detail attached to a sprint transition.
#[derive(Debug, Clone, Default)]
pub struct TransitionDetail {
    pub reason: Option<String>,
    pub actual_hours: Option<f64>,
    pub payload: Option<Value>,
}

impl TransitionDetail {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn completed(actual_hours: Option<f64>, payload: Option<Value>) -> Self {
        Self {
            reason: None,
            actual_hours,
            payload,
        }
    }

    pub fn reason<S: Into<String>>(reason: S) -> Self {
        Self {
            reason: Some(reason.into()),
            actual_hours: None,
            payload: None,
        }
    }
}

pub struct StateTracker {
    epic_id: String,
    epic_name: String,
    sprints: DashMap<String, Sprint>,
    /// Sprint ids in plan declaration order, for stable reporting.
    order: Vec<String>,
    /// Opaque result payloads of completed sprints.
    payloads: DashMap<String, Value>,
    locks: ContractLockManager,
    store: Arc<TransitionStore>,
    epic_status: RwLock<EpicStatus>,
    started_at: RwLock<Option<DateTime<Utc>>>,
    completed_at: RwLock<Option<DateTime<Utc>>>,
    resumed: AtomicBool,
    /// In-memory mirror of appended events, for report assembly.
    history: Mutex<Vec<TransitionEvent>>,
    /// Serializes all writes; sprints complete near-simultaneously and the
    /// log sequence must not interleave.
    write_lock: Mutex<()>,
}

impl StateTracker {
    /// Fresh tracker for a new run: every sprint starts `pending`, every
    /// contract unlocked.
    pub fn new(
        epic_id: String,
        plan: &EpicPlan,
        contracts: &[Contract],
        store: Arc<TransitionStore>,
    ) -> Self {
        let sprints = DashMap::new();
        let mut order = Vec::with_capacity(plan.sprints.len());
        for spec in &plan.sprints {
            sprints.insert(spec.id.clone(), Sprint::from_spec(spec));
            order.push(spec.id.clone());
        }
        Self {
            epic_id,
            epic_name: plan.name.clone(),
            sprints,
            order,
            payloads: DashMap::new(),
            locks: ContractLockManager::new(contracts),
            store,
            epic_status: RwLock::new(EpicStatus::InProgress),
            started_at: RwLock::new(None),
            completed_at: RwLock::new(None),
            resumed: AtomicBool::new(false),
            history: Mutex::new(Vec::new()),
            write_lock: Mutex::new(()),
        }
    }

    /// Rebuilds tracker state from the durable log. Completed sprints keep
    /// their results and are never re-dispatched; sprints interrupted in
    /// `ready`/`running` are re-armed as `pending` for re-dispatch. An event
    /// referencing a sprint absent from the current plan is a structural
    /// error, never guessed around.
    pub fn resume(
        epic_id: String,
        plan: &EpicPlan,
        contracts: &[Contract],
        store: Arc<TransitionStore>,
    ) -> Result<Self> {
        let tracker = Self::new(epic_id.clone(), plan, contracts, store.clone());
        let events = store.load(&epic_id)?;
        if events.is_empty() {
            return Ok(tracker);
        }
        tracker.resumed.store(true, Ordering::SeqCst);

        for event in &events {
            match &event.event {
                RunEvent::EpicStarted { .. } => {
                    *tracker.started_at.write().expect("started_at lock") = Some(event.timestamp);
                }
                RunEvent::SprintTransition {
                    status,
                    reason,
                    actual_hours,
                } => {
                    let sprint_id = event.sprint_id.as_deref().ok_or_else(|| {
                        EpicError::resume_inconsistency(
                            &epic_id,
                            "sprint transition event without a sprint id",
                        )
                    })?;
                    if !plan.contains_sprint(sprint_id) {
                        return Err(EpicError::resume_inconsistency(
                            &epic_id,
                            format!(
                                "transition log references sprint '{}' which is not in the current plan",
                                sprint_id
                            ),
                        ));
                    }
                    tracker.apply_replayed(
                        sprint_id,
                        *status,
                        event.timestamp,
                        reason.clone(),
                        *actual_hours,
                        event.payload.clone(),
                    );
                }
                RunEvent::EpicFinished { status } => {
                    *tracker.epic_status.write().expect("epic_status lock") = *status;
                    *tracker.completed_at.write().expect("completed_at lock") =
                        Some(event.timestamp);
                }
                RunEvent::EpicResumed | RunEvent::LayerStarted { .. } | RunEvent::LayerFinished { .. } => {}
            }
        }
        *tracker.history.lock().expect("history lock") = events;

        // Re-arm interrupted sprints; their prior dispatch never resolved.
        for id in &tracker.order {
            let mut sprint = tracker.sprints.get_mut(id).expect("sprint exists");
            if matches!(sprint.status, SprintStatus::Ready | SprintStatus::Running) {
                debug!(sprint_id = %id, from = %sprint.status, "re-arming interrupted sprint");
                sprint.status = SprintStatus::Pending;
                sprint.started_at = None;
            }
        }

        // Re-derive contract lock state from producer outcomes; `lock` is
        // idempotent so replay is safe.
        for name in tracker.locks.contract_names() {
            let producer = tracker
                .locks
                .producer_of(&name)
                .map(|p| p.to_string())
                .ok_or_else(|| EpicError::internal("contract without producer after validation"))?;
            let status = tracker
                .sprints
                .get(&producer)
                .map(|s| s.status)
                .ok_or_else(|| {
                    EpicError::resume_inconsistency(
                        &epic_id,
                        format!("contract '{}' produced by unknown sprint '{}'", name, producer),
                    )
                })?;
            match status {
                SprintStatus::Completed => tracker.locks.lock(&name)?,
                SprintStatus::Failed | SprintStatus::Blocked | SprintStatus::Skipped => {
                    tracker.locks.mark_unlockable(&name)?
                }
                _ => {}
            }
        }

        info!(epic_id = %tracker.epic_id, events = tracker.history.lock().expect("history lock").len(),
              "resumed tracker from transition log");
        Ok(tracker)
    }

    fn apply_replayed(
        &self,
        sprint_id: &str,
        status: SprintStatus,
        timestamp: DateTime<Utc>,
        reason: Option<String>,
        actual_hours: Option<f64>,
        payload: Value,
    ) {
        if let Some(mut sprint) = self.sprints.get_mut(sprint_id) {
            sprint.status = status;
            sprint.status_reason = reason;
            match status {
                SprintStatus::Running => sprint.started_at = Some(timestamp),
                s if s.is_terminal() => {
                    sprint.completed_at = Some(timestamp);
                    sprint.actual_hours = actual_hours;
                }
                _ => {}
            }
        }
        if status == SprintStatus::Completed && !payload.is_null() {
            self.payloads.insert(sprint_id.to_string(), payload);
        }
    }

    /// The single write path for sprint status. Serializes concurrent
    /// completions, appends to the durable log, and applies contract lock
    /// side effects.
    pub fn record_transition(
        &self,
        sprint_id: &str,
        new_status: SprintStatus,
        timestamp: DateTime<Utc>,
        detail: TransitionDetail,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().expect("tracker write lock");

        let produces = {
            let mut sprint = self.sprints.get_mut(sprint_id).ok_or_else(|| {
                EpicError::structure_sprint(
                    format!("unknown sprint '{}'", sprint_id),
                    sprint_id,
                )
            })?;
            if sprint.status.is_terminal() {
                return Err(EpicError::internal(format!(
                    "sprint '{}' is already terminal ({}), cannot transition to {}",
                    sprint_id, sprint.status, new_status
                )));
            }
            sprint.status = new_status;
            match new_status {
                SprintStatus::Running => sprint.started_at = Some(timestamp),
                s if s.is_terminal() => {
                    sprint.completed_at = Some(timestamp);
                    sprint.actual_hours = detail.actual_hours;
                }
                _ => {}
            }
            if new_status != SprintStatus::Completed {
                sprint.status_reason = detail.reason.clone();
            }
            sprint.produces_contracts.clone()
        };

        if new_status == SprintStatus::Completed {
            if let Some(payload) = &detail.payload {
                self.payloads.insert(sprint_id.to_string(), payload.clone());
            }
        }

        let event = TransitionEvent::new(
            &self.epic_id,
            Some(sprint_id.to_string()),
            timestamp,
            RunEvent::SprintTransition {
                status: new_status,
                reason: detail.reason.clone(),
                actual_hours: detail.actual_hours,
            },
            detail.payload.clone().unwrap_or(Value::Null),
        );
        self.append(event)?;

        // Lock side effects happen immediately after the producing sprint's
        // terminal transition, inside the same write guard.
        match new_status {
            SprintStatus::Completed => {
                for contract in &produces {
                    self.locks.lock(contract)?;
                }
            }
            SprintStatus::Failed | SprintStatus::Blocked | SprintStatus::Skipped => {
                for contract in &produces {
                    self.locks.mark_unlockable(contract)?;
                    warn!(sprint_id, contract = %contract, "contract unlockable after upstream failure");
                }
            }
            _ => {}
        }

        debug!(sprint_id, status = %new_status, "recorded sprint transition");
        Ok(())
    }

    pub fn record_epic_started(&self, timestamp: DateTime<Utc>) -> Result<()> {
        let _guard = self.write_lock.lock().expect("tracker write lock");
        *self.started_at.write().expect("started_at lock") = Some(timestamp);
        let name = self.epic_name.clone();
        self.append(TransitionEvent::new(
            &self.epic_id,
            None,
            timestamp,
            RunEvent::EpicStarted { name },
            Value::Null,
        ))
    }

    pub fn record_epic_resumed(&self, timestamp: DateTime<Utc>) -> Result<()> {
        let _guard = self.write_lock.lock().expect("tracker write lock");
        self.append(TransitionEvent::new(
            &self.epic_id,
            None,
            timestamp,
            RunEvent::EpicResumed,
            Value::Null,
        ))
    }

    pub fn record_layer_started(&self, layer: usize, timestamp: DateTime<Utc>) -> Result<()> {
        let _guard = self.write_lock.lock().expect("tracker write lock");
        self.append(TransitionEvent::new(
            &self.epic_id,
            None,
            timestamp,
            RunEvent::LayerStarted { layer },
            Value::Null,
        ))
    }

    pub fn record_layer_finished(&self, layer: usize, timestamp: DateTime<Utc>) -> Result<()> {
        let _guard = self.write_lock.lock().expect("tracker write lock");
        self.append(TransitionEvent::new(
            &self.epic_id,
            None,
            timestamp,
            RunEvent::LayerFinished { layer },
            Value::Null,
        ))
    }

    pub fn record_epic_finished(
        &self,
        status: EpicStatus,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().expect("tracker write lock");
        *self.epic_status.write().expect("epic_status lock") = status;
        *self.completed_at.write().expect("completed_at lock") = Some(timestamp);
        self.append(TransitionEvent::new(
            &self.epic_id,
            None,
            timestamp,
            RunEvent::EpicFinished { status },
            Value::Null,
        ))
    }

    fn append(&self, event: TransitionEvent) -> Result<()> {
        let sequence = self.store.append(&event)?;
        let mut stamped = event;
        stamped.sequence = sequence;
        self.history.lock().expect("history lock").push(stamped);
        Ok(())
    }

    // ---- read-only snapshot accessors ----

    pub fn epic_id(&self) -> &str {
        &self.epic_id
    }

    pub fn epic_name(&self) -> &str {
        &self.epic_name
    }

    pub fn was_resumed(&self) -> bool {
        self.resumed.load(Ordering::SeqCst)
    }

    pub fn sprint(&self, sprint_id: &str) -> Option<Sprint> {
        self.sprints.get(sprint_id).map(|s| s.clone())
    }

    pub fn status_of(&self, sprint_id: &str) -> Option<SprintStatus> {
        self.sprints.get(sprint_id).map(|s| s.status)
    }

    pub fn payload_of(&self, sprint_id: &str) -> Option<Value> {
        self.payloads.get(sprint_id).map(|p| p.clone())
    }

    /// Sprints in plan declaration order.
    pub fn sprints_snapshot(&self) -> Vec<Sprint> {
        self.order
            .iter()
            .filter_map(|id| self.sprints.get(id).map(|s| s.clone()))
            .collect()
    }

    pub fn all_terminal(&self) -> bool {
        self.order
            .iter()
            .all(|id| self.sprints.get(id).map(|s| s.status.is_terminal()).unwrap_or(false))
    }

    pub fn locks(&self) -> &ContractLockManager {
        &self.locks
    }

    pub fn epic_status(&self) -> EpicStatus {
        *self.epic_status.read().expect("epic_status lock")
    }

    pub fn started_at(&self) -> Option<DateTime<Utc>> {
        *self.started_at.read().expect("started_at lock")
    }

    pub fn completed_at(&self) -> Option<DateTime<Utc>> {
        *self.completed_at.read().expect("completed_at lock")
    }

    pub fn history(&self) -> Vec<TransitionEvent> {
        self.history.lock().expect("history lock").clone()
    }

    pub fn store(&self) -> &Arc<TransitionStore> {
        &self.store
    }
}
