//! Unit tests for the recovery engine

#[cfg(test)]
mod tests {
    use crate::actions::ActionRegistry;
    use crate::monitoring::MonitoringService;
    use crate::recovery::{RecoveryEngine, RecoveryEvent, RecoveryOutcome, RecoveryResult};
    use crate::shutdown::ShutdownSignal;
    use crate::tests::test_utils::{
        failure_event, fast_policy, registry_with_action, registry_with_flag_probe, test_cluster,
        test_node, ScriptedAction,
    };
    use crate::utils::config::RetryPolicy;
    use crate::utils::error::SentinelError;
    use assert_matches::assert_matches;
    use std::sync::atomic::Ordering;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn engine_with(actions: ActionRegistry, max_attempts: u32) -> RecoveryEngine {
        RecoveryEngine::new(actions, fast_policy(max_attempts), ShutdownSignal::new())
    }

    async fn record_callbacks(
        engine: &RecoveryEngine,
    ) -> (
        Arc<Mutex<Vec<RecoveryEvent>>>,
        Arc<Mutex<Vec<(String, Vec<RecoveryResult>)>>>,
    ) {
        let successes: Arc<Mutex<Vec<RecoveryEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&successes);
        engine
            .register_recovery_callback(Arc::new(move |event| {
                let sink = Arc::clone(&sink);
                Box::pin(async move {
                    sink.lock().unwrap().push(event);
                })
            }))
            .await;

        let escalations: Arc<Mutex<Vec<(String, Vec<RecoveryResult>)>>> =
            Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&escalations);
        engine
            .register_escalation_callback(Arc::new(move |node_id, history| {
                let sink = Arc::clone(&sink);
                Box::pin(async move {
                    sink.lock().unwrap().push((node_id, history));
                })
            }))
            .await;

        (successes, escalations)
    }

    #[tokio::test]
    async fn first_successful_attempt_short_circuits() {
        let actions = registry_with_action(ScriptedAction::new("scripted")).await;
        let engine = engine_with(actions, 3);
        let (successes, escalations) = record_callbacks(&engine).await;

        let node = test_node("kafka-1");
        let outcome = engine
            .execute_recovery(&node, &failure_event("kafka-1"))
            .await
            .unwrap();

        assert_matches!(outcome, RecoveryOutcome::Succeeded(result) if result.success);
        let history = engine.get_recovery_history("kafka-1");
        assert_eq!(history.len(), 1);
        assert!(history[0].success);
        assert_eq!(successes.lock().unwrap().len(), 1);
        assert!(escalations.lock().unwrap().is_empty());
        assert!(engine.get_active_recoveries().is_empty());
    }

    #[tokio::test]
    async fn exhaustion_walks_every_action_and_attempt() {
        let actions = ActionRegistry::new();
        actions
            .register(Arc::new(ScriptedAction::new("restart").with_default_exit(1)))
            .await;
        actions
            .register(Arc::new(ScriptedAction::new("reinstall").with_default_exit(1)))
            .await;
        let engine = engine_with(actions, 2);
        let (successes, escalations) = record_callbacks(&engine).await;

        let mut node = test_node("kafka-1");
        node.recovery_actions = vec!["restart".to_string(), "reinstall".to_string()];

        let outcome = engine
            .execute_recovery(&node, &failure_event("kafka-1"))
            .await
            .unwrap();

        let results = assert_matches!(outcome, RecoveryOutcome::Exhausted(results) => results);
        assert_eq!(results.len(), 4);
        assert!(results.iter().all(|r| !r.success));
        // Two attempts per action, in configuration order.
        let names: Vec<&str> = results.iter().map(|r| r.action_name.as_str()).collect();
        assert_eq!(names, ["restart", "restart", "reinstall", "reinstall"]);

        assert!(successes.lock().unwrap().is_empty());
        let escalations = escalations.lock().unwrap();
        assert_eq!(escalations.len(), 1);
        assert_eq!(escalations[0].1.len(), 4);
    }

    #[tokio::test]
    async fn concurrent_run_returns_already_in_progress() {
        let actions = registry_with_action(
            ScriptedAction::new("scripted").with_delay(Duration::from_millis(200)),
        )
        .await;
        let engine = engine_with(actions, 1);
        let node = test_node("kafka-1");

        let first = {
            let engine = engine.clone();
            let node = node.clone();
            tokio::spawn(async move {
                engine
                    .execute_recovery(&node, &failure_event("kafka-1"))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let second = engine
            .execute_recovery(&node, &failure_event("kafka-1"))
            .await
            .unwrap();
        assert_matches!(second, RecoveryOutcome::AlreadyInProgress);

        let first = first.await.unwrap().unwrap();
        assert_matches!(first, RecoveryOutcome::Succeeded(_));
    }

    #[tokio::test]
    async fn unknown_actions_are_skipped() {
        let actions = registry_with_action(ScriptedAction::new("scripted")).await;
        let engine = engine_with(actions, 2);

        let mut node = test_node("kafka-1");
        node.recovery_actions = vec!["ghost".to_string(), "scripted".to_string()];

        let outcome = engine
            .execute_recovery(&node, &failure_event("kafka-1"))
            .await
            .unwrap();
        assert_matches!(
            outcome,
            RecoveryOutcome::Succeeded(result) if result.action_name == "scripted"
        );
    }

    #[tokio::test]
    async fn all_unknown_actions_exhaust_with_empty_history() {
        let actions = ActionRegistry::new();
        let engine = engine_with(actions, 2);
        let (_successes, escalations) = record_callbacks(&engine).await;

        let mut node = test_node("kafka-1");
        node.recovery_actions = vec!["ghost".to_string()];

        let outcome = engine
            .execute_recovery(&node, &failure_event("kafka-1"))
            .await
            .unwrap();
        let results = assert_matches!(outcome, RecoveryOutcome::Exhausted(results) => results);
        assert!(results.is_empty());
        assert_eq!(escalations.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn exit_zero_without_healthy_probe_is_a_failed_attempt() {
        let (probes, flag) = registry_with_flag_probe(false).await;
        let cluster = Arc::new(test_cluster(vec![test_node("kafka-1")], 1));
        let monitoring = MonitoringService::new(cluster, probes);

        let actions = registry_with_action(ScriptedAction::new("scripted")).await;
        let engine = engine_with(actions, 1);
        engine.set_health_verifier(monitoring).await;

        let node = test_node("kafka-1");
        let outcome = engine
            .execute_recovery(&node, &failure_event("kafka-1"))
            .await
            .unwrap();
        let results = assert_matches!(outcome, RecoveryOutcome::Exhausted(results) => results);
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].exit_code, 0);
        assert!(!results[0].success);

        // Once the node actually probes healthy, the same action succeeds.
        flag.store(true, Ordering::SeqCst);
        let outcome = engine
            .execute_recovery(&node, &failure_event("kafka-1"))
            .await
            .unwrap();
        assert_matches!(outcome, RecoveryOutcome::Succeeded(_));
    }

    #[tokio::test]
    async fn shutdown_interrupts_backoff_without_callbacks() {
        let actions =
            registry_with_action(ScriptedAction::new("scripted").with_default_exit(1)).await;
        let shutdown = ShutdownSignal::new();
        let policy = RetryPolicy {
            max_attempts: 2,
            initial_delay_seconds: 30,
            backoff_multiplier: 1.0,
            max_delay_seconds: 30,
        };
        let engine = RecoveryEngine::new(actions, policy, shutdown.clone());
        let (successes, escalations) = record_callbacks(&engine).await;

        shutdown.trigger();
        let node = test_node("kafka-1");
        let err = engine
            .execute_recovery(&node, &failure_event("kafka-1"))
            .await
            .unwrap_err();

        assert_matches!(err, SentinelError::OperationCancelled { .. });
        // The first attempt ran (no delay before attempt 1), nothing more.
        assert_eq!(engine.get_recovery_history("kafka-1").len(), 1);
        assert!(successes.lock().unwrap().is_empty());
        assert!(escalations.lock().unwrap().is_empty());
        assert!(engine.get_active_recoveries().is_empty());
    }

    #[tokio::test]
    async fn histories_are_bounded_and_trimmable() {
        let actions =
            registry_with_action(ScriptedAction::new("scripted").with_default_exit(1)).await;
        let engine = engine_with(actions, 2);
        let node = test_node("kafka-1");

        for _ in 0..30 {
            let _ = engine
                .execute_recovery(&node, &failure_event("kafka-1"))
                .await
                .unwrap();
        }
        // 60 attempts recorded, bounded to the history limit.
        assert_eq!(
            engine.get_recovery_history("kafka-1").len(),
            crate::recovery::RECOVERY_HISTORY_LIMIT
        );

        engine.trim_histories(10);
        assert_eq!(engine.get_recovery_history("kafka-1").len(), 10);
    }
}
