//! Lifecycle engine
//!
//! Owns record status. Three things change it:
//!
//! - operator transitions ([`LifecycleEngine::transition`])
//! - the end of a transition plan (`on_success` / `on_failure`)
//! - the risk gate ([`LifecycleEngine::evaluate_risk`])
//!
//! A plan remembers the `status_version` it started against. At every step
//! boundary (and while waiting out a step delay) it re-reads the record; if
//! the version moved, someone else changed the status and the plan aborts
//! instead of overwriting it. Explicit cancellation is observed at the same
//! boundaries; an action that has started always runs to completion.
//!
//! When checkpointing is enabled, the next step index and its due time are
//! persisted before each step, and [`LifecycleEngine::resume_pending`] picks
//! plans back up after a restart.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use poolkeeper_kernel::clock::Clock;
use poolkeeper_kernel::error::{PoolError, PoolResult};
use poolkeeper_kernel::lifecycle::{
    AbortReason, ActionContext, ActionError, ActionKind, PlanKind, PlanOutcome, TransitionPlan,
};
use poolkeeper_kernel::resource::{Lease, ResourceId, ResourceRecord, ResourceStatus};
use poolkeeper_kernel::risk::ActionEvent;
use poolkeeper_kernel::store::{PlanCheckpoint, ResourceStore};

use super::interrupt::PlanInterrupt;
use super::registry::ActionRegistry;
use crate::allocator::{PoolAllocator, duration_ms, reconcile_in};
use crate::background::BackgroundTask;
use crate::risk::{GateDecision, RiskGate, RiskSignal, is_gated};

/// Cap for step delays too large to add to an `Instant`.
const FAR_FUTURE: Duration = Duration::from_secs(60 * 60 * 24 * 365);

/// Handle to the periodic risk evaluation sweep.
pub type RiskMonitorHandle = BackgroundTask;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Persist plan progress so plans survive a restart
    pub checkpoint_plans: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            checkpoint_plans: true,
        }
    }
}

struct EngineInner {
    store: Arc<dyn ResourceStore>,
    allocator: PoolAllocator,
    registry: ActionRegistry,
    gate: Arc<RiskGate>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    running: DashMap<ResourceId, PlanInterrupt>,
}

/// Lifecycle state machine and plan executor.
///
/// Cheap to clone; clones share running plans and collaborators.
#[derive(Clone)]
pub struct LifecycleEngine {
    inner: Arc<EngineInner>,
}

/// Builder for [`LifecycleEngine`]
pub struct LifecycleEngineBuilder {
    allocator: PoolAllocator,
    gate: Arc<RiskGate>,
    registry: ActionRegistry,
    clock: Option<Arc<dyn Clock>>,
    config: EngineConfig,
}

impl LifecycleEngineBuilder {
    pub fn registry(mut self, registry: ActionRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Defaults to the allocator's clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> LifecycleEngine {
        let clock = self
            .clock
            .unwrap_or_else(|| self.allocator.clock().clone());

        LifecycleEngine {
            inner: Arc::new(EngineInner {
                store: self.allocator.store().clone(),
                allocator: self.allocator,
                registry: self.registry,
                gate: self.gate,
                clock,
                config: self.config,
                running: DashMap::new(),
            }),
        }
    }
}

/// Removes a plan from the running table when it ends, however it ends.
struct RunningGuard<'a> {
    running: &'a DashMap<ResourceId, PlanInterrupt>,
    id: ResourceId,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        self.running.remove(&self.id);
    }
}

enum Boundary {
    Proceed(ResourceRecord),
    Abort(AbortReason),
}

struct PlanStart {
    first_step: usize,
    /// Overrides the first step's delay (remaining wait on resume)
    first_delay: Option<Duration>,
    status_version: u64,
}

impl LifecycleEngine {
    /// Start building an engine. The engine shares the allocator's store.
    pub fn builder(allocator: PoolAllocator, gate: Arc<RiskGate>) -> LifecycleEngineBuilder {
        LifecycleEngineBuilder {
            allocator,
            gate,
            registry: ActionRegistry::new(),
            clock: None,
            config: EngineConfig::default(),
        }
    }

    pub fn allocator(&self) -> &PoolAllocator {
        &self.inner.allocator
    }

    pub fn gate(&self) -> &Arc<RiskGate> {
        &self.inner.gate
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.inner.registry
    }

    fn now(&self) -> u64 {
        self.inner.clock.now_millis()
    }

    // ------------------------------------------------------------------
    // Status transitions
    // ------------------------------------------------------------------

    /// Operator-driven status change, validated against the lifecycle graph.
    ///
    /// A plan running on the record is preempted at its next boundary.
    pub async fn transition(
        &self,
        id: &ResourceId,
        to: ResourceStatus,
    ) -> PoolResult<ResourceRecord> {
        let now = self.now();
        let mut rejected = None;
        let mut applied = None;

        self.inner
            .store
            .transact(&mut |txn| {
                let mut record = txn.get(id)?;
                if let Err(err) = check_transition(&record, to) {
                    rejected = Some(err);
                    return Ok(());
                }
                let from = record.status;
                record.set_status(to, now);
                let revoked = reconcile_in(txn, &mut record)?;
                txn.put(record.clone())?;
                applied = Some((record, from, revoked));
                Ok(())
            })
            .await?;

        if let Some(err) = rejected {
            warn!(resource_id = %id, to = %to, error = %err, "transition rejected");
            return Err(err);
        }

        let (record, from, revoked) = applied.ok_or_else(|| PoolError::NotFound(id.clone()))?;
        self.after_status_change(&record, from, revoked.as_ref(), "operator");
        Ok(record)
    }

    fn after_status_change(
        &self,
        record: &ResourceRecord,
        from: ResourceStatus,
        revoked: Option<&Lease>,
        cause: &'static str,
    ) {
        if let Some(lease) = revoked {
            self.inner.allocator.note_revoked(&record.id, lease);
        }
        if record.status.is_terminal() {
            self.inner.gate.clear_window(&record.id);
        }
        if let Some(interrupt) = self.inner.running.get(&record.id) {
            interrupt.wake();
        }
        info!(
            resource_id = %record.id,
            from = %from,
            to = %record.status,
            cause,
            "status changed"
        );
    }

    // ------------------------------------------------------------------
    // Transition plans
    // ------------------------------------------------------------------

    /// Execute `plan` against a record.
    ///
    /// Rejected up front when the record is terminal, when a target status
    /// of the plan is unreachable from the current one, when an action has
    /// no handler, or when another plan is running on the record.
    pub async fn run_transition_plan(
        &self,
        id: &ResourceId,
        plan: TransitionPlan,
    ) -> PoolResult<PlanOutcome> {
        if let Some(missing) = self.inner.registry.first_missing(&plan) {
            return Err(PoolError::UnknownAction(missing));
        }

        let (interrupt, _guard) = self.register_plan(id)?;
        let record = self.inner.store.get(id).await?;
        preflight(&record, &plan)?;

        info!(
            resource_id = %id,
            plan = %plan.name,
            steps = plan.len(),
            status = %record.status,
            "plan started"
        );

        let start = PlanStart {
            first_step: 0,
            first_delay: None,
            status_version: record.status_version,
        };
        self.execute(id, &plan, start, &interrupt).await
    }

    /// Request cancellation of the plan running on `id`. Returns `false`
    /// when no plan is running.
    pub fn cancel_plan(&self, id: &ResourceId) -> bool {
        match self.inner.running.get(id) {
            Some(interrupt) => {
                interrupt.cancel();
                info!(resource_id = %id, "plan cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn is_plan_running(&self, id: &ResourceId) -> bool {
        self.inner.running.contains_key(id)
    }

    /// Re-run every checkpointed plan from its next step. Plans whose record
    /// changed status since the checkpoint are aborted as preempted.
    pub async fn resume_pending(&self) -> PoolResult<Vec<(ResourceId, PoolResult<PlanOutcome>)>> {
        let checkpoints = self.inner.store.list_checkpoints().await?;
        if checkpoints.is_empty() {
            return Ok(Vec::new());
        }

        info!(count = checkpoints.len(), "resuming checkpointed plans");
        let runs = checkpoints.into_iter().map(|checkpoint| async move {
            let id = checkpoint.resource_id.clone();
            let outcome = self.resume_one(checkpoint).await;
            (id, outcome)
        });

        Ok(join_all(runs).await)
    }

    async fn resume_one(&self, checkpoint: PlanCheckpoint) -> PoolResult<PlanOutcome> {
        let PlanCheckpoint {
            resource_id: id,
            plan,
            next_step,
            due_at_ms,
            status_version,
        } = checkpoint;

        // Unrunnable here or after any later restart: drop it.
        if let Some(missing) = self.inner.registry.first_missing(&plan) {
            self.inner.store.clear_checkpoint(&id).await?;
            warn!(
                resource_id = %id,
                plan = %plan.name,
                action = %missing,
                "dropping checkpoint with an unregistered action"
            );
            return Err(PoolError::UnknownAction(missing));
        }

        let (interrupt, _guard) = self.register_plan(&id)?;
        let record = self.inner.store.get(&id).await?;
        if record.status_version != status_version {
            let reason = AbortReason::Preempted {
                observed: record.status,
            };
            return self.finish_aborted(&id, &plan, next_step, reason).await;
        }

        let remaining = Duration::from_millis(due_at_ms.saturating_sub(self.now()));
        info!(
            resource_id = %id,
            plan = %plan.name,
            next_step,
            remaining_ms = duration_ms(remaining),
            "plan resumed"
        );

        let start = PlanStart {
            first_step: next_step,
            first_delay: Some(remaining),
            status_version,
        };
        self.execute(&id, &plan, start, &interrupt).await
    }

    fn register_plan(&self, id: &ResourceId) -> PoolResult<(PlanInterrupt, RunningGuard<'_>)> {
        let interrupt = PlanInterrupt::new();
        match self.inner.running.entry(id.clone()) {
            Entry::Occupied(_) => return Err(PoolError::PlanInProgress(id.clone())),
            Entry::Vacant(slot) => {
                slot.insert(interrupt.clone());
            }
        }

        let guard = RunningGuard {
            running: &self.inner.running,
            id: id.clone(),
        };
        Ok((interrupt, guard))
    }

    async fn execute(
        &self,
        id: &ResourceId,
        plan: &TransitionPlan,
        start: PlanStart,
        interrupt: &PlanInterrupt,
    ) -> PoolResult<PlanOutcome> {
        let version = start.status_version;

        for (index, step) in plan.steps.iter().enumerate().skip(start.first_step) {
            let delay = match start.first_delay {
                Some(remaining) if index == start.first_step => remaining,
                _ => step.delay(),
            };

            self.checkpoint(id, plan, index, delay, version).await?;

            let record = match self.await_boundary(id, version, interrupt, delay).await? {
                Boundary::Proceed(record) => record,
                Boundary::Abort(reason) => {
                    return self.finish_aborted(id, plan, index, reason).await;
                }
            };

            let action = self
                .inner
                .registry
                .get(&step.action)
                .ok_or_else(|| PoolError::UnknownAction(step.action.clone()))?;

            debug!(
                resource_id = %id,
                plan = %plan.name,
                step = index,
                action = %step.action,
                "running plan step"
            );

            let ctx = ActionContext {
                record,
                plan_name: plan.name.clone(),
                step_index: index,
            };
            let result = action.execute(&ctx).await;
            self.append_action(id, step.action.clone()).await?;

            if let Err(err) = result {
                return self
                    .finish_failed(id, plan, index, &step.action, err, version)
                    .await;
            }
        }

        match self
            .await_boundary(id, version, interrupt, Duration::ZERO)
            .await?
        {
            Boundary::Proceed(_) => self.finish_completed(id, plan, version).await,
            Boundary::Abort(reason) => self.finish_aborted(id, plan, plan.len(), reason).await,
        }
    }

    async fn checkpoint(
        &self,
        id: &ResourceId,
        plan: &TransitionPlan,
        next_step: usize,
        delay: Duration,
        status_version: u64,
    ) -> PoolResult<()> {
        if !self.inner.config.checkpoint_plans {
            return Ok(());
        }

        let checkpoint = PlanCheckpoint {
            resource_id: id.clone(),
            plan: plan.clone(),
            next_step,
            due_at_ms: self.now().saturating_add(duration_ms(delay)),
            status_version,
        };
        self.inner.store.save_checkpoint(checkpoint).await?;
        Ok(())
    }

    /// Wait out `delay`, re-checking cancellation and the status version
    /// before, whenever woken, and after.
    async fn await_boundary(
        &self,
        id: &ResourceId,
        version: u64,
        interrupt: &PlanInterrupt,
        delay: Duration,
    ) -> PoolResult<Boundary> {
        let now = tokio::time::Instant::now();
        let deadline = now.checked_add(delay).unwrap_or(now + FAR_FUTURE);

        loop {
            if interrupt.is_cancelled() {
                return Ok(Boundary::Abort(AbortReason::Cancelled));
            }

            let record = self.inner.store.get(id).await?;
            if record.status_version != version {
                return Ok(Boundary::Abort(AbortReason::Preempted {
                    observed: record.status,
                }));
            }

            if tokio::time::Instant::now() >= deadline {
                return Ok(Boundary::Proceed(record));
            }

            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = interrupt.notified() => {}
            }
        }
    }

    async fn finish_completed(
        &self,
        id: &ResourceId,
        plan: &TransitionPlan,
        version: u64,
    ) -> PoolResult<PlanOutcome> {
        let now = self.now();
        let mut preempted = None;
        let mut rejected = None;
        let mut final_status = None;
        let mut changed = None;

        self.inner
            .store
            .transact(&mut |txn| {
                let mut record = txn.get(id)?;
                if record.status_version != version {
                    preempted = Some(record.status);
                    return Ok(());
                }

                if let Some(target) = plan.on_success.filter(|target| *target != record.status) {
                    if let Err(err) = check_transition(&record, target) {
                        rejected = Some(err);
                        return Ok(());
                    }
                    let from = record.status;
                    record.set_status(target, now);
                    let revoked = reconcile_in(txn, &mut record)?;
                    txn.put(record.clone())?;
                    final_status = Some(record.status);
                    changed = Some((record, from, revoked));
                } else {
                    final_status = Some(record.status);
                }
                Ok(())
            })
            .await?;

        if let Some(observed) = preempted {
            return self
                .finish_aborted(id, plan, plan.len(), AbortReason::Preempted { observed })
                .await;
        }

        self.inner.store.clear_checkpoint(id).await?;

        if let Some(err) = rejected {
            return Err(err);
        }
        if let Some((record, from, revoked)) = &changed {
            self.after_status_change(record, *from, revoked.as_ref(), "plan");
        }

        let final_status = final_status.ok_or_else(|| PoolError::NotFound(id.clone()))?;
        info!(resource_id = %id, plan = %plan.name, final_status = %final_status, "plan completed");

        Ok(PlanOutcome::Completed {
            final_status,
            steps_run: plan.len(),
        })
    }

    async fn finish_failed(
        &self,
        id: &ResourceId,
        plan: &TransitionPlan,
        step: usize,
        action: &ActionKind,
        err: ActionError,
        version: u64,
    ) -> PoolResult<PlanOutcome> {
        let now = self.now();
        let reason = err.to_string();
        let mut changed = None;

        self.inner
            .store
            .transact(&mut |txn| {
                let mut record = txn.get(id)?;
                if record.status.is_terminal() {
                    return Ok(());
                }

                record.counters.last_failure_reason = Some(reason.clone());
                if plan.kind == PlanKind::Warmup {
                    record.counters.warmup_failed = true;
                }

                let target = plan
                    .on_failure
                    .filter(|target| record.status_version == version && *target != record.status)
                    .filter(|target| record.status.can_transition_to(*target));

                changed = None;
                if let Some(target) = target {
                    let from = record.status;
                    record.set_status(target, now);
                    let revoked = reconcile_in(txn, &mut record)?;
                    changed = Some((record.clone(), from, revoked));
                }
                txn.put(record)
            })
            .await?;

        self.inner.store.clear_checkpoint(id).await?;

        warn!(
            resource_id = %id,
            plan = %plan.name,
            step,
            action = %action,
            reason = %reason,
            "plan step failed"
        );
        if let Some((record, from, revoked)) = &changed {
            self.after_status_change(record, *from, revoked.as_ref(), "plan_failure");
        }

        Ok(PlanOutcome::Failed {
            step,
            action: action.clone(),
            reason,
        })
    }

    async fn finish_aborted(
        &self,
        id: &ResourceId,
        plan: &TransitionPlan,
        step: usize,
        reason: AbortReason,
    ) -> PoolResult<PlanOutcome> {
        self.inner.store.clear_checkpoint(id).await?;
        warn!(resource_id = %id, plan = %plan.name, step, reason = ?reason, "plan aborted");
        Ok(PlanOutcome::Aborted { step, reason })
    }

    // ------------------------------------------------------------------
    // Risk gating
    // ------------------------------------------------------------------

    /// Record an action the caller performed on a leased record, so the risk
    /// gate sees it.
    pub async fn record_action(
        &self,
        id: &ResourceId,
        action: impl Into<ActionKind>,
    ) -> PoolResult<()> {
        let record = self.inner.store.get(id).await?;
        if record.status.is_terminal() {
            return Err(PoolError::invalid_state(id, record.status, "record action"));
        }
        self.append_action(id, action.into()).await
    }

    /// Append to the record's risk window. A record that went terminal
    /// concurrently has its window dropped again, so terminal records never
    /// keep one.
    async fn append_action(&self, id: &ResourceId, action: ActionKind) -> PoolResult<()> {
        self.inner
            .gate
            .record_action(ActionEvent::new(id.clone(), action, self.now()));

        let record = self.inner.store.get(id).await?;
        if record.status.is_terminal() {
            self.inner.gate.clear_window(id);
        }
        Ok(())
    }

    /// Score a record and apply the gate's decision.
    ///
    /// The classifier runs with no lock held. The decision is then taken
    /// against the record's status as it is at apply time, inside one
    /// transaction. Without a usable score nothing changes.
    pub async fn evaluate_risk(&self, id: &ResourceId) -> PoolResult<GateDecision> {
        let record = self.inner.store.get(id).await?;
        if !is_gated(record.status) {
            debug!(resource_id = %id, status = %record.status, "status not subject to risk gating");
            return Ok(GateDecision::NotApplicable);
        }

        let score = match self.inner.gate.score(id).await {
            RiskSignal::Score(score) => score,
            RiskSignal::NoSignal => return Ok(GateDecision::NotApplicable),
        };

        let now = self.now();
        let gate = &self.inner.gate;
        let mut decision = GateDecision::NotApplicable;
        let mut changed = None;

        self.inner
            .store
            .transact(&mut |txn| {
                let mut record = txn.get(id)?;
                changed = None;
                if record.status.is_terminal() {
                    decision = GateDecision::NotApplicable;
                    return Ok(());
                }

                decision = gate.decide(record.status, score);
                record.last_scored_at_ms = Some(now);

                if let Some(target) = decision.target() {
                    let from = record.status;
                    record.set_status(target, now);
                    if decision == GateDecision::Flag {
                        record.counters.flag_count += 1;
                    }
                    let revoked = reconcile_in(txn, &mut record)?;
                    changed = Some((record.clone(), from, revoked));
                }
                txn.put(record)
            })
            .await?;

        if let Some((record, from, revoked)) = &changed {
            gate.note_applied(decision);
            info!(resource_id = %id, score, decision = %decision, "risk gate forced transition");
            self.after_status_change(record, *from, revoked.as_ref(), "risk_gate");
        } else {
            debug!(resource_id = %id, score, decision = %decision, "risk evaluated");
        }

        Ok(decision)
    }

    /// Evaluate every gated record once. Per-record failures are logged and
    /// skipped.
    pub async fn evaluate_all(&self) -> PoolResult<Vec<(ResourceId, GateDecision)>> {
        let mut candidates = Vec::new();
        for id in self.inner.store.list_ids().await? {
            let record = self.inner.store.get(&id).await?;
            if is_gated(record.status) {
                candidates.push(id);
            }
        }

        let results = join_all(candidates.iter().map(|id| self.evaluate_risk(id))).await;

        let mut decisions = Vec::with_capacity(candidates.len());
        for (id, result) in candidates.into_iter().zip(results) {
            match result {
                Ok(decision) => decisions.push((id, decision)),
                Err(err) => warn!(resource_id = %id, error = %err, "risk evaluation failed"),
            }
        }
        Ok(decisions)
    }

    /// Spawn periodic evaluation of ACTIVE and FLAGGED records at the gate's
    /// `evaluation_interval_ms`.
    pub fn spawn_risk_monitor(&self) -> RiskMonitorHandle {
        let engine = self.clone();
        let period = self.inner.gate.config().evaluation_interval();

        BackgroundTask::spawn("risk-monitor", period, move || {
            let engine = engine.clone();
            async move {
                match engine.evaluate_all().await {
                    Ok(decisions) => {
                        let forced = decisions
                            .iter()
                            .filter(|(_, decision)| decision.target().is_some())
                            .count();
                        debug!(evaluated = decisions.len(), forced, "risk sweep finished");
                    }
                    Err(err) => warn!(error = %err, "risk sweep failed"),
                }
            }
        })
    }
}

/// Terminal records and edges outside the lifecycle graph are both
/// `InvalidState`.
fn check_transition(record: &ResourceRecord, to: ResourceStatus) -> PoolResult<()> {
    if record.status.is_terminal() || !record.status.can_transition_to(to) {
        return Err(PoolError::invalid_state(
            &record.id,
            record.status,
            format!("transition to {to}"),
        ));
    }
    Ok(())
}

fn preflight(record: &ResourceRecord, plan: &TransitionPlan) -> PoolResult<()> {
    if record.status.is_terminal() {
        return Err(PoolError::invalid_state(
            &record.id,
            record.status,
            format!("run plan '{}'", plan.name),
        ));
    }

    for target in [plan.on_success, plan.on_failure].into_iter().flatten() {
        if target != record.status && !record.status.can_transition_to(target) {
            return Err(PoolError::invalid_state(
                &record.id,
                record.status,
                format!("run plan '{}' ending in {target}", plan.name),
            ));
        }
    }
    Ok(())
}
