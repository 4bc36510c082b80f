//! Notification dispatch
//!
//! Structured operator alerts flow through a priority queue (failure
//! alerts outrank recovery confirmations) drained by a background
//! worker. Each message is handed to every registered notifier;
//! transient failures are retried with exponential backoff, permanent
//! failures and exhausted retries are dropped with a log line.

use crate::recovery::RecoveryResult;
use crate::shutdown::ShutdownSignal;
use crate::utils::config::{NodeConfig, NotificationConfig, RetryPolicy};
use crate::utils::error::{SentinelError, SentinelResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use std::collections::{BinaryHeap, HashMap};
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, RwLock};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// How long `stop()` waits for the delivery worker to finish.
pub const DEFAULT_DISPATCH_DRAIN_DEADLINE: Duration = Duration::from_secs(5);

/// Priority class of an alert; failure alerts outrank confirmations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertPriority {
    RecoveryConfirmation,
    FailureAlert,
}

/// A structured operator alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertMessage {
    pub id: Uuid,
    pub priority: AlertPriority,
    pub node_id: String,
    pub subject: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

/// Result of one notifier delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    Delivered,
    TransientFailure(String),
    PermanentFailure(String),
}

/// A delivery transport capability
#[async_trait]
pub trait Notifier: Send + Sync {
    fn name(&self) -> &str;
    async fn deliver(&self, message: &AlertMessage) -> DeliveryStatus;
}

/// Heap entry; ordered by priority, then enqueue order within a class.
struct QueuedMessage {
    message: AlertMessage,
    seq: u64,
}

impl PartialEq for QueuedMessage {
    fn eq(&self, other: &Self) -> bool {
        self.message.priority == other.message.priority && self.seq == other.seq
    }
}
impl Eq for QueuedMessage {}
impl PartialOrd for QueuedMessage {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedMessage {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then lower sequence number.
        self.message
            .priority
            .cmp(&other.message.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct RetryEntry {
    message: AlertMessage,
    notifier_name: String,
    attempts: u32,
    due_at: Instant,
}

/// Observable queue depths, consumed by the supervisor's self-health check
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QueueSizes {
    pub delivery_queue: usize,
    pub retry_queue: usize,
}

/// The notification dispatcher
#[derive(Clone)]
pub struct NotificationService {
    subject_prefix: String,
    notifiers: Arc<RwLock<HashMap<String, Arc<dyn Notifier>>>>,
    queue: Arc<Mutex<BinaryHeap<QueuedMessage>>>,
    retry_queue: Arc<Mutex<Vec<RetryEntry>>>,
    wakeup: Arc<Notify>,
    seq: Arc<AtomicU64>,
    retry_policy: RetryPolicy,
    shutdown: ShutdownSignal,
    running: Arc<AtomicBool>,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
    drain_deadline: Duration,
    delivered_total: Arc<AtomicU64>,
    dropped_total: Arc<AtomicU64>,
}

impl NotificationService {
    #[must_use]
    pub fn new(config: &NotificationConfig, shutdown: ShutdownSignal) -> Self {
        Self {
            subject_prefix: config.subject_prefix.clone(),
            notifiers: Arc::new(RwLock::new(HashMap::new())),
            queue: Arc::new(Mutex::new(BinaryHeap::new())),
            retry_queue: Arc::new(Mutex::new(Vec::new())),
            wakeup: Arc::new(Notify::new()),
            seq: Arc::new(AtomicU64::new(0)),
            retry_policy: RetryPolicy {
                max_attempts: 3,
                initial_delay_seconds: 2,
                backoff_multiplier: 2.0,
                max_delay_seconds: 30,
            },
            shutdown,
            running: Arc::new(AtomicBool::new(false)),
            worker: Arc::new(Mutex::new(None)),
            drain_deadline: DEFAULT_DISPATCH_DRAIN_DEADLINE,
            delivered_total: Arc::new(AtomicU64::new(0)),
            dropped_total: Arc::new(AtomicU64::new(0)),
        }
    }

    #[must_use]
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }

    /// Register a delivery transport. Replaces any notifier with the
    /// same name.
    pub async fn register_notifier(&self, notifier: Arc<dyn Notifier>) {
        let name = notifier.name().to_string();
        self.notifiers.write().await.insert(name.clone(), notifier);
        tracing::debug!("Registered notifier '{name}'");
    }

    pub async fn notifier_count(&self) -> usize {
        self.notifiers.read().await.len()
    }

    /// Start the background delivery worker. Idempotent.
    pub async fn start(&self) {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return;
        }
        self.running.store(true, Ordering::SeqCst);
        let service = self.clone();
        *worker = Some(tokio::spawn(async move {
            service.delivery_loop().await;
        }));
        tracing::info!("Notification dispatcher started");
    }

    /// Stop the worker, waiting up to the drain deadline. Pending
    /// messages are discarded.
    pub async fn stop(&self) {
        let handle = self.worker.lock().await.take();
        let Some(handle) = handle else {
            return;
        };
        self.running.store(false, Ordering::SeqCst);
        self.wakeup.notify_waiters();
        if tokio::time::timeout(self.drain_deadline, handle).await.is_err() {
            tracing::warn!(
                "Notification worker did not drain within {:?}",
                self.drain_deadline
            );
        }
        tracing::info!("Notification dispatcher stopped");
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Enqueue a failure alert for an exhausted recovery.
    pub async fn send_failure_alert(
        &self,
        node: &NodeConfig,
        history: &[RecoveryResult],
        last_error: &str,
    ) {
        let subject = format!(
            "{} Recovery FAILED for {} node {}",
            self.subject_prefix, node.node_type, node.node_id
        );

        let mut body = format!(
            "Automatic recovery of node {} ({}) has been exhausted.\n\
             Last error: {last_error}\n\n\
             Attempt history ({} attempts):\n",
            node.node_id,
            node.address(),
            history.len()
        );
        for (i, attempt) in history.iter().enumerate() {
            let _ = writeln!(
                body,
                "  {}. [{}] action={} exit={} cmd={}",
                i + 1,
                attempt.started_at.format("%Y-%m-%d %H:%M:%S"),
                attempt.action_name,
                attempt.exit_code,
                attempt.command_executed
            );
        }
        body.push_str("\nOperator intervention is required.\n");

        self.enqueue(AlertPriority::FailureAlert, &node.node_id, subject, body)
            .await;
    }

    /// Enqueue a recovery confirmation.
    pub async fn send_recovery_confirmation(
        &self,
        node: &NodeConfig,
        successful_action: &RecoveryResult,
        downtime: Duration,
        prior_failed_attempts: &[RecoveryResult],
    ) {
        let subject = format!(
            "{} Node {} recovered",
            self.subject_prefix, node.node_id
        );
        let body = format!(
            "Node {} ({}) is healthy again.\n\
             Successful action: {} ({})\n\
             Downtime: {} seconds\n\
             Failed attempts before success: {}\n",
            node.node_id,
            node.address(),
            successful_action.action_name,
            successful_action.command_executed,
            downtime.as_secs(),
            prior_failed_attempts.len()
        );

        self.enqueue(
            AlertPriority::RecoveryConfirmation,
            &node.node_id,
            subject,
            body,
        )
        .await;
    }

    async fn enqueue(&self, priority: AlertPriority, node_id: &str, subject: String, body: String) {
        let message = AlertMessage {
            id: Uuid::new_v4(),
            priority,
            node_id: node_id.to_string(),
            subject,
            body,
            created_at: Utc::now(),
        };
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        self.queue.lock().await.push(QueuedMessage { message, seq });
        self.wakeup.notify_one();
    }

    pub async fn queue_sizes(&self) -> QueueSizes {
        QueueSizes {
            delivery_queue: self.queue.lock().await.len(),
            retry_queue: self.retry_queue.lock().await.len(),
        }
    }

    #[must_use]
    pub fn delivered_total(&self) -> u64 {
        self.delivered_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn dropped_total(&self) -> u64 {
        self.dropped_total.load(Ordering::Relaxed)
    }

    async fn delivery_loop(&self) {
        loop {
            if !self.running.load(Ordering::SeqCst) || self.shutdown.is_triggered() {
                break;
            }

            self.process_due_retries().await;

            let next = self.queue.lock().await.pop();
            match next {
                Some(queued) => self.deliver_to_all(queued.message).await,
                None => {
                    // Wake on new work, shutdown, or the retry tick.
                    tokio::select! {
                        () = self.wakeup.notified() => {}
                        () = self.shutdown.wait() => break,
                        () = tokio::time::sleep(Duration::from_secs(1)) => {}
                    }
                }
            }
        }
        tracing::debug!("Notification delivery loop exited");
    }

    async fn deliver_to_all(&self, message: AlertMessage) {
        let notifiers: Vec<Arc<dyn Notifier>> =
            self.notifiers.read().await.values().cloned().collect();
        if notifiers.is_empty() {
            tracing::warn!(
                "No notifiers registered, dropping alert '{}'",
                message.subject
            );
            self.dropped_total.fetch_add(1, Ordering::Relaxed);
            return;
        }

        for notifier in notifiers {
            self.attempt_delivery(&message, &notifier, 1).await;
        }
    }

    async fn attempt_delivery(
        &self,
        message: &AlertMessage,
        notifier: &Arc<dyn Notifier>,
        attempt: u32,
    ) {
        match notifier.deliver(message).await {
            DeliveryStatus::Delivered => {
                self.delivered_total.fetch_add(1, Ordering::Relaxed);
                tracing::info!(
                    "Alert '{}' delivered via {} (attempt {attempt})",
                    message.subject,
                    notifier.name()
                );
            }
            DeliveryStatus::TransientFailure(reason) => {
                if attempt >= self.retry_policy.max_attempts {
                    self.dropped_total.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        "Alert '{}' dropped after {attempt} attempts via {}: {reason}",
                        message.subject,
                        notifier.name()
                    );
                } else {
                    let delay = self.retry_policy.delay_for_attempt(attempt + 1);
                    tracing::warn!(
                        "Transient failure delivering '{}' via {} (attempt {attempt}), \
                         retrying in {delay:?}: {reason}",
                        message.subject,
                        notifier.name()
                    );
                    self.retry_queue.lock().await.push(RetryEntry {
                        message: message.clone(),
                        notifier_name: notifier.name().to_string(),
                        attempts: attempt,
                        due_at: Instant::now() + delay,
                    });
                }
            }
            DeliveryStatus::PermanentFailure(reason) => {
                self.dropped_total.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    "Permanent failure delivering '{}' via {}: {reason}",
                    message.subject,
                    notifier.name()
                );
            }
        }
    }

    async fn process_due_retries(&self) {
        let due: Vec<RetryEntry> = {
            let mut retries = self.retry_queue.lock().await;
            let now = Instant::now();
            let mut due = Vec::new();
            let mut remaining = Vec::new();
            for entry in retries.drain(..) {
                if entry.due_at <= now {
                    due.push(entry);
                } else {
                    remaining.push(entry);
                }
            }
            *retries = remaining;
            due
        };

        for entry in due {
            let notifier = self.notifiers.read().await.get(&entry.notifier_name).cloned();
            match notifier {
                Some(notifier) => {
                    self.attempt_delivery(&entry.message, &notifier, entry.attempts + 1)
                        .await;
                }
                None => {
                    self.dropped_total.fetch_add(1, Ordering::Relaxed);
                    tracing::error!(
                        "Notifier '{}' no longer registered, dropping retry",
                        entry.notifier_name
                    );
                }
            }
        }
    }
}

/// SMTP notifier backed by lettre
pub struct EmailNotifier {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    sender: lettre::message::Mailbox,
    recipients: Vec<lettre::message::Mailbox>,
}

impl EmailNotifier {
    pub fn from_config(config: &NotificationConfig) -> SentinelResult<Self> {
        let credentials = Credentials::new(
            config.smtp_username.clone(),
            config.smtp_password.clone(),
        );
        let transport = AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&config.smtp_host)
            .map_err(|e| SentinelError::Configuration {
                reason: format!("invalid SMTP relay {}: {e}", config.smtp_host),
            })?
            .port(config.smtp_port)
            .credentials(credentials)
            .build();

        let sender = config
            .sender_email
            .parse()
            .map_err(|e| SentinelError::Validation {
                field: "notification.sender_email".to_string(),
                reason: format!("{e}"),
            })?;
        let recipients = config
            .recipients
            .iter()
            .map(|r| {
                r.parse().map_err(|e| SentinelError::Validation {
                    field: "notification.recipients".to_string(),
                    reason: format!("{r}: {e}"),
                })
            })
            .collect::<SentinelResult<Vec<_>>>()?;

        Ok(Self {
            transport,
            sender,
            recipients,
        })
    }
}

#[async_trait]
impl Notifier for EmailNotifier {
    fn name(&self) -> &str {
        "email"
    }

    async fn deliver(&self, message: &AlertMessage) -> DeliveryStatus {
        let mut builder = Message::builder()
            .from(self.sender.clone())
            .subject(&message.subject);
        for recipient in &self.recipients {
            builder = builder.to(recipient.clone());
        }
        let email = match builder.body(message.body.clone()) {
            Ok(email) => email,
            Err(e) => return DeliveryStatus::PermanentFailure(format!("message build: {e}")),
        };

        match self.transport.send(email).await {
            Ok(_) => DeliveryStatus::Delivered,
            Err(e) if e.is_permanent() => DeliveryStatus::PermanentFailure(e.to_string()),
            Err(e) => DeliveryStatus::TransientFailure(e.to_string()),
        }
    }
}

/// Webhook notifier: POSTs the alert as JSON
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: String,
}

impl WebhookNotifier {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            url: url.into(),
        }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn deliver(&self, message: &AlertMessage) -> DeliveryStatus {
        let payload = serde_json::json!({
            "id": message.id,
            "priority": message.priority,
            "node_id": message.node_id,
            "subject": message.subject,
            "body": message.body,
            "created_at": message.created_at,
        });

        match self.client.post(&self.url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => DeliveryStatus::Delivered,
            Ok(resp) if resp.status().is_server_error() || resp.status().as_u16() == 429 => {
                DeliveryStatus::TransientFailure(format!("HTTP {}", resp.status()))
            }
            Ok(resp) => DeliveryStatus::PermanentFailure(format!("HTTP {}", resp.status())),
            Err(e) if e.is_timeout() || e.is_connect() => {
                DeliveryStatus::TransientFailure(e.to_string())
            }
            Err(e) => DeliveryStatus::PermanentFailure(e.to_string()),
        }
    }
}

/// Fallback notifier that writes alerts to the log
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn name(&self) -> &str {
        "log"
    }

    async fn deliver(&self, message: &AlertMessage) -> DeliveryStatus {
        match message.priority {
            AlertPriority::FailureAlert => {
                tracing::error!("ALERT: {}\n{}", message.subject, message.body);
            }
            AlertPriority::RecoveryConfirmation => {
                tracing::info!("ALERT: {}\n{}", message.subject, message.body);
            }
        }
        DeliveryStatus::Delivered
    }
}
