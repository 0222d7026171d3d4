use chrono::Duration;
use pretty_assertions::assert_eq;
use sanction_core::{
    application::approval_engine::EngineDependencies, ApprovalEngine, EngineConfig, EngineError,
    ExpiryOutcome, InstanceStatus, StageStatus, SubjectRef, TerminationReason, Verdict,
};
use sanction_state_inmemory::InMemoryStateStoreProvider;
use sanction_test_utils::{
    assertions::{assert_instance_status, assert_stage_status},
    builders::two_stage_purchase_order,
    ManualClock, RecordingEventHandler, StageBuilder, StaticRoleDirectory, TemplateBuilder,
    TestEngine,
};
use std::sync::Arc;

fn purchase_roles() -> StaticRoleDirectory {
    StaticRoleDirectory::new()
        .with_role("managers", &["u1", "u2"])
        .with_role("directors", &["u3", "u4", "u5"])
}

#[tokio::test]
async fn test_stage_times_out_once_under_repeated_fires() {
    let t = TestEngine::new(purchase_roles());
    let id = t.start(&two_stage_purchase_order(false), "PO-1").await.unwrap();
    let manager = t.stage_id(&id, "manager").await;

    t.clock.advance(Duration::hours(24));
    let due = t.timers.take_due();
    assert_eq!(due.len(), 1);

    let first = t.engine.handle_sla_expiry(&due[0]).await.unwrap();
    let second = t.engine.handle_sla_expiry(&due[0]).await.unwrap();
    assert_eq!(first, ExpiryOutcome::TimedOut);
    assert_eq!(second, ExpiryOutcome::AlreadyResolved);

    let report = t.status(&id).await;
    assert_instance_status(&report, InstanceStatus::Rejected);
    assert_stage_status(&report, "manager", StageStatus::TimedOut);
    assert_eq!(
        report.termination_reason,
        Some(TerminationReason::StageTimedOut {
            stage_instance_id: manager,
            stage_name: "manager".to_string(),
        })
    );

    assert_eq!(t.events.count(&id, "stage.timed_out"), 1);
    assert_eq!(t.events.count(&id, "instance.terminated"), 1);
}

#[tokio::test]
async fn test_timeout_is_distinguishable_in_history() {
    let t = TestEngine::new(purchase_roles());
    let id = t.start(&two_stage_purchase_order(false), "PO-2").await.unwrap();

    assert_eq!(t.advance_hours(24).await, vec![ExpiryOutcome::TimedOut]);

    let history = t.engine.decision_history(&id).await.unwrap();
    assert_eq!(history.status, InstanceStatus::Rejected);
    assert_eq!(history.stages[0].status, StageStatus::TimedOut);
    assert!(history.stages[0].decisions.is_empty());
    assert!(matches!(
        history.termination_reason,
        Some(TerminationReason::StageTimedOut { .. })
    ));
}

#[tokio::test]
async fn test_decision_after_timeout_is_refused() {
    let t = TestEngine::new(purchase_roles());
    let id = t.start(&two_stage_purchase_order(false), "PO-3").await.unwrap();
    let manager = t.stage_id(&id, "manager").await;

    t.advance_hours(25).await;

    let err = t
        .engine
        .submit_decision(&id, &manager, "u1".into(), Verdict::Approve, None)
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::StageClosed(_)));
}

#[tokio::test]
async fn test_nothing_expires_before_the_deadline() {
    let t = TestEngine::new(purchase_roles());
    let id = t.start(&two_stage_purchase_order(false), "PO-4").await.unwrap();

    assert!(t.advance_hours(23).await.is_empty());
    assert_instance_status(&t.status(&id).await, InstanceStatus::InProgress);
}

#[tokio::test]
async fn test_resolved_stage_cancels_its_timer() {
    let t = TestEngine::new(purchase_roles());
    let id = t.start(&two_stage_purchase_order(false), "PO-5").await.unwrap();
    let manager = t.stage_id(&id, "manager").await;
    let manager_timer = t.timers.timer_for_stage(&manager).unwrap().id;

    t.engine
        .submit_decision(&id, &manager, "u1".into(), Verdict::Approve, None)
        .await
        .unwrap();
    assert!(t.timers.cancelled().contains(&manager_timer));

    // only the directors timer remains
    assert_eq!(t.advance_hours(24).await, vec![ExpiryOutcome::TimedOut]);
    let report = t.status(&id).await;
    assert_stage_status(&report, "manager", StageStatus::ResolvedApproved);
    assert_stage_status(&report, "directors", StageStatus::TimedOut);
}

#[tokio::test]
async fn test_early_fire_is_rescheduled_for_the_remaining_time() {
    let t = TestEngine::new(purchase_roles());
    let id = t.start(&two_stage_purchase_order(false), "PO-6").await.unwrap();
    let manager = t.stage_id(&id, "manager").await;
    let original = t.timers.timer_for_stage(&manager).unwrap();

    t.clock.advance(Duration::hours(10));
    let early = t.timers.fire(&original.id).unwrap();
    assert_eq!(
        t.engine.handle_sla_expiry(&early).await.unwrap(),
        ExpiryOutcome::Rescheduled
    );

    let replacement = t.timers.timer_for_stage(&manager).unwrap();
    assert_ne!(replacement.id, original.id);
    assert_eq!(replacement.due_at, original.due_at);
    assert_stage_status(&t.status(&id).await, "manager", StageStatus::Pending);

    // the replaced timer no longer tracks the stage
    assert_eq!(
        t.engine.handle_sla_expiry(&early).await.unwrap(),
        ExpiryOutcome::Superseded
    );

    assert_eq!(t.advance_hours(14).await, vec![ExpiryOutcome::TimedOut]);
    assert_instance_status(&t.status(&id).await, InstanceStatus::Rejected);
}

#[tokio::test]
async fn test_early_fire_is_dropped_when_rescheduling_is_disabled() {
    let config = EngineConfig {
        reschedule_early_timers: false,
        ..EngineConfig::default()
    };
    let t = TestEngine::with_config(purchase_roles(), config);
    let id = t.start(&two_stage_purchase_order(false), "PO-7").await.unwrap();
    let manager = t.stage_id(&id, "manager").await;
    let timer = t.timers.timer_for_stage(&manager).unwrap();

    let early = t.timers.fire(&timer.id).unwrap();
    assert_eq!(
        t.engine.handle_sla_expiry(&early).await.unwrap(),
        ExpiryOutcome::Early
    );

    assert_stage_status(&t.status(&id).await, "manager", StageStatus::Pending);
    assert!(t.timers.timer_for_stage(&manager).is_none());
}

#[tokio::test]
async fn test_timeout_in_parallel_group_cancels_siblings() {
    let roles = StaticRoleDirectory::new()
        .with_role("legal", &["l1"])
        .with_role("finance", &["f1"]);
    let t = TestEngine::new(roles);
    let template = TemplateBuilder::new("CAPEX", "capital_request")
        .stage(StageBuilder::any(1, "legal", "legal").sla_hours(12).parallel_group(1))
        .stage(StageBuilder::any(1, "finance", "finance").sla_hours(48).parallel_group(1))
        .build();
    let id = t.start(&template, "CR-1").await.unwrap();
    let finance = t.stage_id(&id, "finance").await;
    let finance_timer = t.timers.timer_for_stage(&finance).unwrap().id;

    assert_eq!(t.advance_hours(12).await, vec![ExpiryOutcome::TimedOut]);

    let report = t.status(&id).await;
    assert_instance_status(&report, InstanceStatus::Rejected);
    assert_stage_status(&report, "legal", StageStatus::TimedOut);
    assert_stage_status(&report, "finance", StageStatus::Cancelled);
    assert!(t.timers.cancelled().contains(&finance_timer));
    assert!(t.advance_hours(48).await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_tokio_timers_drive_timeouts_through_listener() {
    let mut provider = InMemoryStateStoreProvider::new();
    let (templates, instances, stage_instances, timers) = provider.create_repositories();
    let rx = provider.take_timer_receiver().unwrap();

    let clock = Arc::new(ManualClock::default());
    let engine = ApprovalEngine::new(
        EngineDependencies {
            templates: templates.clone(),
            instances,
            stage_instances,
            roles: Arc::new(purchase_roles()),
            timers,
            clock: clock.clone(),
            event_handler: Arc::new(RecordingEventHandler::new()),
        },
        EngineConfig::default(),
    );
    let listener = engine.spawn_expiry_listener(rx);

    let template = two_stage_purchase_order(false);
    templates.save(&template).await.unwrap();
    let id = engine
        .start_instance(
            &template.version_ref(),
            SubjectRef::new("purchase_order", "PO-8"),
        )
        .await
        .unwrap();

    clock.advance(Duration::hours(24));
    tokio::time::sleep(std::time::Duration::from_secs(24 * 3600 + 1)).await;

    let mut report = engine.get_instance_status(&id).await.unwrap();
    for _ in 0..100 {
        if report.status != InstanceStatus::InProgress {
            break;
        }
        tokio::task::yield_now().await;
        report = engine.get_instance_status(&id).await.unwrap();
    }

    assert_instance_status(&report, InstanceStatus::Rejected);
    assert_stage_status(&report, "manager", StageStatus::TimedOut);

    listener.abort();
}
