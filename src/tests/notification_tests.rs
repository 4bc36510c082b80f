//! Unit tests for the notification dispatcher

#[cfg(test)]
mod tests {
    use crate::notification::{AlertPriority, DeliveryStatus, NotificationService};
    use crate::recovery::RecoveryResult;
    use crate::shutdown::ShutdownSignal;
    use crate::tests::test_utils::{test_node, wait_until, RecordingNotifier};
    use crate::utils::config::{NotificationConfig, RetryPolicy};
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn notification_config() -> NotificationConfig {
        NotificationConfig {
            smtp_host: "localhost".to_string(),
            smtp_port: 587,
            smtp_username: "sentinel".to_string(),
            smtp_password: "secret".to_string(),
            sender_email: "sentinel@example.com".to_string(),
            recipients: vec!["ops@example.com".to_string()],
            subject_prefix: "[sentinel]".to_string(),
            webhook_url: None,
        }
    }

    fn immediate_retries(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            initial_delay_seconds: 0,
            backoff_multiplier: 1.0,
            max_delay_seconds: 0,
        }
    }

    fn sample_result(node_id: &str, action: &str, success: bool) -> RecoveryResult {
        RecoveryResult {
            node_id: node_id.to_string(),
            action_name: action.to_string(),
            command_executed: format!("systemctl restart {action}"),
            exit_code: i32::from(!success),
            stdout: String::new(),
            stderr: if success {
                String::new()
            } else {
                "unit failed to start".to_string()
            },
            started_at: Utc::now(),
            duration: Duration::from_millis(120),
            success,
        }
    }

    #[tokio::test]
    async fn failure_alerts_outrank_confirmations() {
        let service = NotificationService::new(&notification_config(), ShutdownSignal::new());
        let notifier = RecordingNotifier::new("recorder");
        let delivered = notifier.delivered_handle();
        service.register_notifier(Arc::new(notifier)).await;

        // Backlog built up before the worker starts.
        let node_a = test_node("node-a");
        let node_b = test_node("node-b");
        let ok = sample_result("node-a", "restart", true);
        service
            .send_recovery_confirmation(&node_a, &ok, Duration::from_secs(5), &[])
            .await;
        service
            .send_recovery_confirmation(&node_b, &ok, Duration::from_secs(5), &[])
            .await;
        let failed = sample_result("node-c", "restart", false);
        service
            .send_failure_alert(&test_node("node-c"), &[failed], "unit failed to start")
            .await;

        assert_eq!(service.queue_sizes().await.delivery_queue, 3);
        service.start().await;

        assert!(
            wait_until(Duration::from_secs(3), || {
                delivered.lock().unwrap().len() == 3
            })
            .await
        );
        let messages = delivered.lock().unwrap().clone();
        // The failure alert jumps the backlog; confirmations keep their
        // enqueue order.
        assert_eq!(messages[0].priority, AlertPriority::FailureAlert);
        assert!(messages[1].subject.contains("node-a"));
        assert!(messages[2].subject.contains("node-b"));

        service.stop().await;
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let service = NotificationService::new(&notification_config(), ShutdownSignal::new())
            .with_retry_policy(immediate_retries(3));
        let notifier = RecordingNotifier::new("recorder").with_script(vec![
            DeliveryStatus::TransientFailure("connection reset".to_string()),
        ]);
        let delivered = notifier.delivered_handle();
        service.register_notifier(Arc::new(notifier)).await;
        service.start().await;

        let failed = sample_result("node-a", "restart", false);
        service
            .send_failure_alert(&test_node("node-a"), &[failed], "unit failed to start")
            .await;

        assert!(
            wait_until(Duration::from_secs(5), || {
                delivered.lock().unwrap().len() == 1
            })
            .await,
            "message should be delivered on retry"
        );
        assert_eq!(service.dropped_total(), 0);

        service.stop().await;
    }

    #[tokio::test]
    async fn permanent_failures_are_dropped_without_retry() {
        let service = NotificationService::new(&notification_config(), ShutdownSignal::new());
        let notifier = RecordingNotifier::new("recorder").with_script(vec![
            DeliveryStatus::PermanentFailure("mailbox does not exist".to_string()),
        ]);
        let delivered = notifier.delivered_handle();
        service.register_notifier(Arc::new(notifier)).await;
        service.start().await;

        let failed = sample_result("node-a", "restart", false);
        service
            .send_failure_alert(&test_node("node-a"), &[failed], "unit failed to start")
            .await;

        assert!(
            wait_until(Duration::from_secs(3), || service.dropped_total() == 1).await
        );
        assert!(delivered.lock().unwrap().is_empty());
        assert_eq!(service.queue_sizes().await.retry_queue, 0);

        service.stop().await;
    }

    #[tokio::test]
    async fn exhausted_retries_are_dropped() {
        let service = NotificationService::new(&notification_config(), ShutdownSignal::new())
            .with_retry_policy(immediate_retries(2));
        let notifier = RecordingNotifier::new("recorder").with_script(vec![
            DeliveryStatus::TransientFailure("timeout".to_string()),
            DeliveryStatus::TransientFailure("timeout".to_string()),
        ]);
        let delivered = notifier.delivered_handle();
        service.register_notifier(Arc::new(notifier)).await;
        service.start().await;

        let failed = sample_result("node-a", "restart", false);
        service
            .send_failure_alert(&test_node("node-a"), &[failed], "unit failed to start")
            .await;

        assert!(
            wait_until(Duration::from_secs(5), || service.dropped_total() == 1).await
        );
        assert!(delivered.lock().unwrap().is_empty());

        service.stop().await;
    }

    #[tokio::test]
    async fn alert_bodies_carry_the_attempt_history() {
        let service = NotificationService::new(&notification_config(), ShutdownSignal::new());
        let notifier = RecordingNotifier::new("recorder");
        let delivered = notifier.delivered_handle();
        service.register_notifier(Arc::new(notifier)).await;

        let history = vec![
            sample_result("kafka-1", "restart", false),
            sample_result("kafka-1", "reinstall", false),
        ];
        service
            .send_failure_alert(&test_node("kafka-1"), &history, "unit failed to start")
            .await;
        service.start().await;

        assert!(
            wait_until(Duration::from_secs(3), || {
                delivered.lock().unwrap().len() == 1
            })
            .await
        );
        let messages = delivered.lock().unwrap().clone();
        assert!(messages[0].subject.starts_with("[sentinel]"));
        assert!(messages[0].subject.contains("kafka-1"));
        assert!(messages[0].body.contains("restart"));
        assert!(messages[0].body.contains("reinstall"));
        assert!(messages[0].body.contains("2 attempts"));

        service.stop().await;
    }

    #[tokio::test]
    async fn queue_depths_are_observable() {
        let service = NotificationService::new(&notification_config(), ShutdownSignal::new());
        let ok = sample_result("node-a", "restart", true);
        service
            .send_recovery_confirmation(&test_node("node-a"), &ok, Duration::from_secs(1), &[])
            .await;
        service
            .send_recovery_confirmation(&test_node("node-b"), &ok, Duration::from_secs(1), &[])
            .await;

        let sizes = service.queue_sizes().await;
        assert_eq!(sizes.delivery_queue, 2);
        assert_eq!(sizes.retry_queue, 0);
        assert!(!service.is_running());
    }
}
