use anyhow::Context;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use poolkeeper_foundation::{
    ActionRegistry, AllocatorConfig, GateDecision, InMemoryResourceStore, PoolKeeper,
    PoolKeeperConfig,
};
use poolkeeper_kernel::clock::ManualClock;
use poolkeeper_kernel::error::PoolError;
use poolkeeper_kernel::lifecycle::{AbortReason, PlanKind, PlanOutcome, PlanStep, TransitionPlan};
use poolkeeper_kernel::predicate::MatchPredicate;
use poolkeeper_kernel::resource::{HolderToken, ResourceAttributes, ResourceId, ResourceStatus};
use poolkeeper_kernel::store::{IndexSet, ResourceStore};
use poolkeeper_testing::{
    ActionLog, FailingAction, GatedAction, RecordingAction, ScriptedClassifier, init_tracing,
};

use ResourceStatus::*;

struct Harness {
    keeper: PoolKeeper,
    store: Arc<InMemoryResourceStore>,
    clock: Arc<ManualClock>,
    classifier: ScriptedClassifier,
    log: ActionLog,
    hold: GatedAction,
}

fn harness_with(config: PoolKeeperConfig) -> Harness {
    init_tracing();

    let store = InMemoryResourceStore::shared();
    let clock = Arc::new(ManualClock::new(1_700_000_000_000));
    let classifier = ScriptedClassifier::new(0.0);
    let log = ActionLog::new();
    let hold = GatedAction::new("hold", log.clone());

    let registry = ActionRegistry::new()
        .with("a", Arc::new(RecordingAction::new("a", log.clone())))
        .with("b", Arc::new(RecordingAction::new("b", log.clone())))
        .with("after", Arc::new(RecordingAction::new("after", log.clone())))
        .with(
            "captcha",
            Arc::new(FailingAction::new("captcha", "challenge rejected", log.clone())),
        )
        .with("hold", Arc::new(hold.clone()));

    let keeper = PoolKeeper::with_clock(
        config,
        store.clone(),
        Arc::new(classifier.clone()),
        registry,
        clock.clone(),
    )
    .unwrap();

    Harness {
        keeper,
        store,
        clock,
        classifier,
        log,
        hold,
    }
}

fn harness() -> Harness {
    harness_with(PoolKeeperConfig::default())
}

fn holder(name: &str) -> HolderToken {
    HolderToken::new(name)
}

async fn provision(h: &Harness, attributes: ResourceAttributes) -> ResourceId {
    h.keeper
        .provisioner()
        .create_resource(attributes)
        .await
        .unwrap()
}

async fn activate(h: &Harness, id: &ResourceId) {
    h.keeper.engine().transition(id, Verified).await.unwrap();
    h.keeper.engine().transition(id, Active).await.unwrap();
}

#[tokio::test]
async fn end_to_end_lease_warmup_suspend_release() -> anyhow::Result<()> {
    let h = harness();
    let id = provision(
        &h,
        ResourceAttributes::new()
            .with_country("US")
            .with_age_days(45)
            .with_reputation(0.9),
    )
    .await;

    let predicate = MatchPredicate::any().country("US").age_days(30, 90);
    let leased = h
        .keeper
        .allocator()
        .acquire(&predicate, holder("h1"), Some(Duration::from_secs(60)))
        .await?
        .context("the only record matches")?;
    assert_eq!(leased.id, id);
    assert_eq!(leased.status, New);

    h.keeper.engine().transition(&id, Verified).await?;

    let warmup = TransitionPlan::warmup(vec![PlanStep::immediate("a"), PlanStep::immediate("b")]);
    let outcome = h
        .keeper
        .engine()
        .run_transition_plan(&id, warmup)
        .await?;
    assert_eq!(
        outcome,
        PlanOutcome::Completed {
            final_status: Active,
            steps_run: 2
        }
    );
    assert_eq!(h.log.labels(), vec!["a", "b"]);

    h.classifier.set_score(0.95);
    let decision = h.keeper.engine().evaluate_risk(&id).await?;
    assert_eq!(decision, GateDecision::Suspend);
    assert_eq!(h.keeper.allocator().record(&id).await?.status, Suspended);

    h.keeper.allocator().release(&id, &holder("h1")).await?;

    let record = h.keeper.allocator().record(&id).await?;
    assert!(record.is_free());
    assert!(!h.store.scan(IndexSet::Available).await?.contains(&id));
    assert!(!h.store.scan(IndexSet::InUse).await?.contains(&id));
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 8)]
async fn concurrent_acquires_never_share_a_record() {
    let h = harness();

    let mut matching = HashSet::new();
    for _ in 0..5 {
        matching.insert(provision(&h, ResourceAttributes::new().with_country("DE")).await);
    }
    for _ in 0..3 {
        provision(&h, ResourceAttributes::new().with_country("FR")).await;
    }

    let tasks: Vec<_> = (0..32)
        .map(|i| {
            let allocator = h.keeper.allocator().clone();
            tokio::spawn(async move {
                allocator
                    .acquire(
                        &MatchPredicate::any().country("DE"),
                        HolderToken::new(format!("worker-{i}")),
                        None,
                    )
                    .await
            })
        })
        .collect();

    let mut won = Vec::new();
    for result in futures::future::join_all(tasks).await {
        if let Some(record) = result.unwrap().unwrap() {
            won.push(record.id);
        }
    }

    assert_eq!(won.len(), matching.len());
    let distinct: HashSet<_> = won.iter().cloned().collect();
    assert_eq!(distinct, matching);

    let stats = h.keeper.allocator().pool_stats().await.unwrap();
    assert_eq!(stats.in_use, 5);
    assert_eq!(stats.available, 3);
}

#[tokio::test]
async fn release_by_a_stranger_changes_nothing() {
    let h = harness();
    let id = provision(&h, ResourceAttributes::new()).await;

    let err = h
        .keeper
        .allocator()
        .release(&id, &holder("never-held"))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::NotLeased { .. }));

    h.keeper
        .allocator()
        .acquire(&MatchPredicate::any(), holder("owner"), None)
        .await
        .unwrap()
        .unwrap();
    let before = h.keeper.allocator().record(&id).await.unwrap();

    let err = h
        .keeper
        .allocator()
        .release(&id, &holder("intruder"))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        PoolError::NotLeased {
            id: id.clone(),
            holder: holder("intruder")
        }
    );
    assert_eq!(h.keeper.allocator().record(&id).await.unwrap(), before);
    assert!(h.store.scan(IndexSet::InUse).await.unwrap().contains(&id));
}

#[tokio::test]
async fn expired_lease_is_reclaimed_exactly_once() {
    let h = harness_with(PoolKeeperConfig {
        allocator: AllocatorConfig::new().with_reclaim_on_acquire(false),
        ..Default::default()
    });
    let id = provision(&h, ResourceAttributes::new()).await;

    h.keeper
        .allocator()
        .acquire(&MatchPredicate::any(), holder("h1"), Some(Duration::from_secs(60)))
        .await
        .unwrap()
        .unwrap();

    h.clock.advance(59_999);
    assert_eq!(h.keeper.allocator().reclaim_expired().await.unwrap(), 0);

    h.clock.advance(1);
    assert_eq!(h.keeper.allocator().reclaim_expired().await.unwrap(), 1);
    assert_eq!(h.keeper.allocator().reclaim_expired().await.unwrap(), 0);

    let record = h.keeper.allocator().record(&id).await.unwrap();
    assert!(record.is_free());
    assert_eq!(record.counters.reclaimed_count, 1);
    assert!(h.store.scan(IndexSet::Available).await.unwrap().contains(&id));

    let err = h
        .keeper
        .allocator()
        .release(&id, &holder("h1"))
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::NotLeased { .. }));
}

#[tokio::test]
async fn retired_record_is_closed_to_every_operation() {
    let h = harness();
    let id = provision(&h, ResourceAttributes::new()).await;
    activate(&h, &id).await;

    h.keeper
        .allocator()
        .acquire(&MatchPredicate::any(), holder("h1"), None)
        .await
        .unwrap()
        .unwrap();
    h.keeper.engine().transition(&id, Retired).await.unwrap();

    let record = h.keeper.allocator().record(&id).await.unwrap();
    assert!(record.is_free());
    assert!(!h.store.scan(IndexSet::Available).await.unwrap().contains(&id));
    assert!(!h.store.scan(IndexSet::InUse).await.unwrap().contains(&id));

    for target in [New, Verified, Active, Flagged, Suspended, Retired, Banned] {
        let err = h.keeper.engine().transition(&id, target).await.unwrap_err();
        assert!(
            matches!(err, PoolError::InvalidState { status: Retired, .. }),
            "transition to {target} gave {err:?}"
        );
    }

    let plan = TransitionPlan::new("usage", PlanKind::Usage, vec![PlanStep::immediate("a")]);
    let err = h
        .keeper
        .engine()
        .run_transition_plan(&id, plan)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::InvalidState { .. }));

    h.classifier.set_score(1.0);
    assert_eq!(
        h.keeper.engine().evaluate_risk(&id).await.unwrap(),
        GateDecision::NotApplicable
    );
    assert_eq!(h.classifier.call_count(), 0);

    assert!(matches!(
        h.keeper.allocator().release(&id, &holder("h1")).await,
        Err(PoolError::NotLeased { .. })
    ));
    assert!(
        h.keeper
            .allocator()
            .acquire(&MatchPredicate::any(), holder("h2"), None)
            .await
            .unwrap()
            .is_none()
    );
    assert!(h.log.is_empty());
}

#[tokio::test]
async fn gate_preempts_a_plan_mid_action() {
    let h = harness();
    let id = provision(&h, ResourceAttributes::new()).await;
    activate(&h, &id).await;

    let plan = TransitionPlan::new(
        "usage",
        PlanKind::Usage,
        vec![PlanStep::immediate("hold"), PlanStep::immediate("after")],
    );
    let engine = h.keeper.engine().clone();
    let plan_id = id.clone();
    let run = tokio::spawn(async move { engine.run_transition_plan(&plan_id, plan).await });

    h.hold.entered().await;
    h.classifier.set_score(0.97);
    assert_eq!(
        h.keeper.engine().evaluate_risk(&id).await.unwrap(),
        GateDecision::Suspend
    );
    h.hold.open();

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        PlanOutcome::Aborted {
            step: 1,
            reason: AbortReason::Preempted {
                observed: Suspended
            }
        }
    );
    poolkeeper_testing::assert_action_ran!(h.log, "hold", 1);
    poolkeeper_testing::assert_action_ran!(h.log, "after", 0);
    assert_eq!(h.keeper.allocator().record(&id).await.unwrap().status, Suspended);
    assert!(!h.keeper.engine().is_plan_running(&id));
}

#[tokio::test(start_paused = true)]
async fn gate_preempts_a_plan_waiting_out_a_delay() {
    let h = harness();
    let id = provision(&h, ResourceAttributes::new()).await;
    activate(&h, &id).await;

    let plan = TransitionPlan::new(
        "usage",
        PlanKind::Usage,
        vec![
            PlanStep::immediate("a"),
            PlanStep::new(Duration::from_secs(3600), "b"),
        ],
    );
    let engine = h.keeper.engine().clone();
    let plan_id = id.clone();
    let run = tokio::spawn(async move { engine.run_transition_plan(&plan_id, plan).await });

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(h.log.labels(), vec!["a"]);

    h.classifier.set_score(0.99);
    h.keeper.engine().evaluate_risk(&id).await.unwrap();

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        PlanOutcome::Aborted {
            step: 1,
            reason: AbortReason::Preempted {
                observed: Suspended
            }
        }
    );
    assert_eq!(h.log.labels(), vec!["a"]);
}

#[tokio::test]
async fn retiring_mid_action_leaves_no_risk_window() {
    let h = harness();
    let id = provision(&h, ResourceAttributes::new()).await;
    activate(&h, &id).await;

    let plan = TransitionPlan::new(
        "usage",
        PlanKind::Usage,
        vec![PlanStep::immediate("hold"), PlanStep::immediate("after")],
    );
    let engine = h.keeper.engine().clone();
    let plan_id = id.clone();
    let run = tokio::spawn(async move { engine.run_transition_plan(&plan_id, plan).await });

    h.hold.entered().await;
    h.keeper.engine().transition(&id, Retired).await.unwrap();
    h.hold.open();

    let outcome = run.await.unwrap().unwrap();
    assert_eq!(
        outcome,
        PlanOutcome::Aborted {
            step: 1,
            reason: AbortReason::Preempted { observed: Retired }
        }
    );
    poolkeeper_testing::assert_action_ran!(h.log, "after", 0);
    assert!(h.keeper.gate().window(&id).is_empty());
}

#[tokio::test]
async fn suspended_record_is_readmitted_on_reactivation() {
    let h = harness();
    let id = provision(&h, ResourceAttributes::new()).await;
    activate(&h, &id).await;

    h.classifier.set_score(0.95);
    assert_eq!(
        h.keeper.engine().evaluate_risk(&id).await.unwrap(),
        GateDecision::Suspend
    );
    assert!(!h.store.scan(IndexSet::Available).await.unwrap().contains(&id));
    assert!(
        h.keeper
            .allocator()
            .acquire(&MatchPredicate::any(), holder("h1"), None)
            .await
            .unwrap()
            .is_none()
    );

    h.keeper.engine().transition(&id, Active).await.unwrap();
    assert!(h.store.scan(IndexSet::Available).await.unwrap().contains(&id));

    let record = h
        .keeper
        .allocator()
        .acquire(&MatchPredicate::any(), holder("h2"), None)
        .await
        .unwrap()
        .expect("reactivated record is leasable");
    assert_eq!(record.id, id);
    assert_eq!(record.status, Active);
}

#[tokio::test]
async fn classifier_outage_keeps_the_last_known_state() {
    let h = harness();
    let id = provision(&h, ResourceAttributes::new()).await;
    activate(&h, &id).await;

    h.classifier.set_unavailable();
    let decision = h.keeper.engine().evaluate_risk(&id).await.unwrap();
    assert_eq!(decision, GateDecision::NotApplicable);

    let record = h.keeper.allocator().record(&id).await.unwrap();
    assert_eq!(record.status, Active);
    assert_eq!(record.last_scored_at_ms, None);
    assert_eq!(h.keeper.gate().metrics().no_signal, 1);

    h.classifier.push_score(0.7);
    assert_eq!(
        h.keeper.engine().evaluate_risk(&id).await.unwrap(),
        GateDecision::Flag
    );
    let record = h.keeper.allocator().record(&id).await.unwrap();
    assert_eq!(record.status, Flagged);
    assert_eq!(record.counters.flag_count, 1);
}

#[tokio::test]
async fn failed_warmup_is_recorded_not_retried() {
    let h = harness();
    let id = provision(&h, ResourceAttributes::new()).await;
    h.keeper.engine().transition(&id, Verified).await.unwrap();

    let warmup = TransitionPlan::warmup(vec![
        PlanStep::immediate("a"),
        PlanStep::immediate("captcha"),
        PlanStep::immediate("b"),
    ]);
    let outcome = h
        .keeper
        .engine()
        .run_transition_plan(&id, warmup)
        .await
        .unwrap();
    assert!(matches!(outcome, PlanOutcome::Failed { step: 1, .. }));
    assert_eq!(h.log.labels(), vec!["a", "captcha"]);

    let record = h.keeper.allocator().record(&id).await.unwrap();
    assert_eq!(record.status, Verified);
    assert!(record.counters.warmup_failed);
    assert_eq!(
        record.counters.last_failure_reason.as_deref(),
        Some("challenge rejected")
    );
}

#[tokio::test]
async fn scored_window_holds_executed_actions_in_order() {
    let h = harness();
    let id = provision(&h, ResourceAttributes::new()).await;
    activate(&h, &id).await;

    let plan = TransitionPlan::new(
        "usage",
        PlanKind::Usage,
        vec![PlanStep::immediate("a"), PlanStep::immediate("b")],
    );
    h.keeper
        .engine()
        .run_transition_plan(&id, plan)
        .await
        .unwrap();
    h.keeper.engine().record_action(&id, "manual").await.unwrap();

    h.keeper.engine().evaluate_risk(&id).await.unwrap();
    let window = h.classifier.last_window().unwrap();
    let actions: Vec<_> = window.iter().map(|e| e.action.to_string()).collect();
    assert_eq!(actions, vec!["a", "b", "manual"]);
}

#[tokio::test]
async fn store_outage_is_surfaced_not_retried() {
    let h = harness();
    let id = provision(&h, ResourceAttributes::new()).await;

    h.store.set_available(false);
    let err = h
        .keeper
        .allocator()
        .acquire(&MatchPredicate::any(), holder("h1"), None)
        .await
        .unwrap_err();
    assert!(matches!(err, PoolError::StoreUnavailable(_)));
    assert!(matches!(
        h.keeper.engine().transition(&id, Verified).await,
        Err(PoolError::StoreUnavailable(_))
    ));

    h.store.set_available(true);
    let record = h
        .keeper
        .allocator()
        .acquire(&MatchPredicate::any(), holder("h1"), None)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.id, id);
    assert_eq!(record.status, New);
}
