use crate::domain::{retry_with_backoff, BridgeMetrics, RetryPolicy};
use backoff::backoff::Backoff;
use chrono::Utc;
use common::domain::{
    DomainError, DomainResult, ResolvedTelemetry, TelemetryPublisher, TelemetryTransaction,
    TelemetryTransactionRepository, TransactionStatus,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct TransactionCoordinatorConfig {
    /// Time a group may stay pending before it expires (default: 5 minutes)
    pub group_timeout: Duration,
    pub max_pending_groups: usize,
    pub sweep_interval: Duration,
    /// How long terminal correlation ids are remembered
    pub retention_grace: Duration,
    pub publish_retry: RetryPolicy,
}

impl Default for TransactionCoordinatorConfig {
    fn default() -> Self {
        Self {
            group_timeout: Duration::from_secs(300),
            max_pending_groups: 10_000,
            sweep_interval: Duration::from_secs(5),
            retention_grace: Duration::from_secs(600),
            publish_retry: RetryPolicy::default(),
        }
    }
}

/// What happened to a submitted message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// Uncorrelated message published on its own
    Published,
    /// Buffered until the rest of its group arrives
    Buffered { processed: u32, total: u32 },
    /// This message completed its group and every member was published
    Completed { published: usize },
    /// Sequence already seen for this group
    Duplicate,
    /// The group already reached a terminal state
    Ignored(TransactionStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExpiryCause {
    Timeout,
    Evicted,
    Shutdown,
}

impl ExpiryCause {
    fn describe(&self) -> &'static str {
        match self {
            ExpiryCause::Timeout => "timed out",
            ExpiryCause::Evicted => "evicted at capacity",
            ExpiryCause::Shutdown => "expired on shutdown",
        }
    }
}

struct PendingGroup {
    transaction: TelemetryTransaction,
    members: BTreeMap<u32, ResolvedTelemetry>,
    opened_at: Instant,
    deadline: Instant,
}

struct RetiredGroup {
    status: TransactionStatus,
    retain_until: Instant,
}

#[derive(Default)]
struct CoordinatorState {
    pending: HashMap<String, PendingGroup>,
    retired: HashMap<String, RetiredGroup>,
}

impl CoordinatorState {
    fn retire(&mut self, correlation_id: &str, status: TransactionStatus, retain_until: Instant) {
        self.retired.insert(
            correlation_id.to_string(),
            RetiredGroup {
                status,
                retain_until,
            },
        );
    }

    fn oldest_pending(&self) -> Option<String> {
        self.pending
            .iter()
            .min_by_key(|(_, group)| group.opened_at)
            .map(|(id, _)| id.clone())
    }
}

enum Admission {
    Buffered { processed: u32, total: u32 },
    Duplicate,
    Ignored(TransactionStatus),
    Release(PendingGroup),
    Failed {
        transaction: TelemetryTransaction,
        reason: String,
    },
}

/// Groups correlated sub-messages and releases each group only once it is
/// complete.
///
/// Bookkeeping happens under a single mutex; publishing and auditing always
/// happen after the lock is released.
pub struct TransactionCoordinator {
    publisher: Arc<dyn TelemetryPublisher>,
    audit: Option<Arc<dyn TelemetryTransactionRepository>>,
    metrics: Arc<BridgeMetrics>,
    state: Mutex<CoordinatorState>,
    config: TransactionCoordinatorConfig,
}

impl TransactionCoordinator {
    pub fn new(
        publisher: Arc<dyn TelemetryPublisher>,
        audit: Option<Arc<dyn TelemetryTransactionRepository>>,
        metrics: Arc<BridgeMetrics>,
        config: TransactionCoordinatorConfig,
    ) -> Self {
        Self {
            publisher,
            audit,
            metrics,
            state: Mutex::new(CoordinatorState::default()),
            config,
        }
    }

    pub fn config(&self) -> &TransactionCoordinatorConfig {
        &self.config
    }

    pub async fn pending_count(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    /// Terminal status of a recently finished group, if still retained
    pub async fn terminal_status(&self, correlation_id: &str) -> Option<TransactionStatus> {
        self.state
            .lock()
            .await
            .retired
            .get(correlation_id)
            .map(|retired| retired.status)
    }

    #[instrument(
        skip_all,
        fields(
            tenant_id = %message.tenant_id,
            device_id = %message.device_id,
            correlation_id = message.correlation_id.as_deref().unwrap_or(""),
        )
    )]
    pub async fn submit(&self, message: ResolvedTelemetry) -> DomainResult<SubmitOutcome> {
        let Some(correlation_id) = message.correlation_id.clone() else {
            return self.publish_singleton(message).await;
        };
        if message.sequence.is_none() {
            return Err(DomainError::CoordinationError(
                correlation_id,
                "member without a sequence number".to_string(),
            ));
        }

        let (admission, evicted) = {
            let mut state = self.state.lock().await;
            self.admit(&mut state, message, &correlation_id, Instant::now())
        };

        if let Some(evicted) = evicted {
            self.expire(evicted, ExpiryCause::Evicted).await;
        }

        match admission {
            Admission::Buffered { processed, total } => {
                debug!(processed, total, "sub-message buffered");
                Ok(SubmitOutcome::Buffered { processed, total })
            }
            Admission::Duplicate => {
                self.metrics.record_duplicate();
                debug!("duplicate sub-message ignored");
                Ok(SubmitOutcome::Duplicate)
            }
            Admission::Ignored(status) => {
                debug!(status = %status, "sub-message for finished transaction ignored");
                Ok(SubmitOutcome::Ignored(status))
            }
            Admission::Failed {
                transaction,
                reason,
            } => {
                self.metrics.record_transaction_failed();
                warn!(reason = %reason, "transaction failed during assembly");
                self.record_audit(&transaction).await;
                Err(DomainError::CoordinationError(correlation_id, reason))
            }
            Admission::Release(group) => self.release(group).await,
        }
    }

    fn admit(
        &self,
        state: &mut CoordinatorState,
        message: ResolvedTelemetry,
        correlation_id: &str,
        now: Instant,
    ) -> (Admission, Option<TelemetryTransaction>) {
        let retain_until = now + self.config.retention_grace;

        if let Some(retired) = state.retired.get(correlation_id) {
            return (Admission::Ignored(retired.status), None);
        }

        let sequence = message.sequence.unwrap_or(1);

        if let Some(mut group) = state.pending.remove(correlation_id) {
            let expected_total = group.transaction.total_logical_devices;

            let conflict = if message.tenant_id != group.transaction.tenant_id {
                Some(format!(
                    "member from tenant {} joined a group of tenant {}",
                    message.tenant_id, group.transaction.tenant_id
                ))
            } else if message.total != Some(expected_total) {
                Some(format!(
                    "declared total changed from {} to {}",
                    expected_total,
                    message
                        .total
                        .map_or_else(|| "none".to_string(), |t| t.to_string())
                ))
            } else {
                None
            };

            if let Some(reason) = conflict {
                let mut transaction = group.transaction;
                transaction.finish(TransactionStatus::Failed, Some(reason.clone()));
                state.retire(correlation_id, TransactionStatus::Failed, retain_until);
                return (
                    Admission::Failed {
                        transaction,
                        reason,
                    },
                    None,
                );
            }

            if group.members.contains_key(&sequence) {
                state.pending.insert(correlation_id.to_string(), group);
                return (Admission::Duplicate, None);
            }

            group.members.insert(sequence, message);
            group.transaction.processed_devices = group.members.len() as u32;

            if group.transaction.processed_devices >= expected_total {
                state.retire(correlation_id, TransactionStatus::Completed, retain_until);
                return (Admission::Release(group), None);
            }

            let processed = group.transaction.processed_devices;
            state.pending.insert(correlation_id.to_string(), group);
            return (
                Admission::Buffered {
                    processed,
                    total: expected_total,
                },
                None,
            );
        }

        let mut transaction = TelemetryTransaction {
            id: xid::new().to_string(),
            tenant_id: message.tenant_id.clone(),
            correlation_id: correlation_id.to_string(),
            gateway_device_id: message
                .gateway_id
                .clone()
                .unwrap_or_else(|| message.device_id.clone()),
            total_logical_devices: message.total.unwrap_or(0),
            processed_devices: 0,
            status: TransactionStatus::Pending,
            started_at: Utc::now(),
            completed_at: None,
            error_message: None,
        };

        let Some(total) = message.total else {
            let reason = "correlated message without a declared total".to_string();
            transaction.processed_devices = 1;
            transaction.finish(TransactionStatus::Failed, Some(reason.clone()));
            state.retire(correlation_id, TransactionStatus::Failed, retain_until);
            return (
                Admission::Failed {
                    transaction,
                    reason,
                },
                None,
            );
        };

        let mut members = BTreeMap::new();
        members.insert(sequence, message);
        transaction.processed_devices = 1;

        let group = PendingGroup {
            transaction,
            members,
            opened_at: now,
            deadline: now + self.config.group_timeout,
        };

        // Complete on arrival, never occupies a pending slot
        if total == 1 {
            state.retire(correlation_id, TransactionStatus::Completed, retain_until);
            return (Admission::Release(group), None);
        }

        let evicted = if state.pending.len() >= self.config.max_pending_groups {
            state.oldest_pending().and_then(|oldest| {
                let group = state.pending.remove(&oldest)?;
                state.retire(&oldest, TransactionStatus::Expired, retain_until);
                Some(group.transaction)
            })
        } else {
            None
        };

        state.pending.insert(correlation_id.to_string(), group);
        (Admission::Buffered { processed: 1, total }, evicted)
    }

    async fn publish_singleton(&self, message: ResolvedTelemetry) -> DomainResult<SubmitOutcome> {
        let result = retry_with_backoff(&self.config.publish_retry, "publish", || {
            self.publisher.publish(&message)
        })
        .await;

        match result {
            Ok(()) => {
                self.metrics.record_published();
                Ok(SubmitOutcome::Published)
            }
            Err(e) => {
                self.metrics.record_publish_failure();
                error!(
                    message_id = %message.message_id(),
                    error = %e,
                    "publish failed after retries, message dropped"
                );
                Err(DomainError::PublishFailed(message.message_id(), e.to_string()))
            }
        }
    }

    async fn release(&self, group: PendingGroup) -> DomainResult<SubmitOutcome> {
        let PendingGroup {
            mut transaction,
            members,
            ..
        } = group;
        let messages: Vec<ResolvedTelemetry> = members.into_values().collect();
        let total = messages.len();

        let failed = self.publish_group(messages).await;

        if failed == 0 {
            transaction.finish(TransactionStatus::Completed, None);
            self.metrics.record_transaction_completed();
            info!(
                correlation_id = %transaction.correlation_id,
                published = total,
                "transaction completed"
            );
            self.record_audit(&transaction).await;
            return Ok(SubmitOutcome::Completed { published: total });
        }

        let reason = format!("{} of {} sub-messages failed to publish", failed, total);
        transaction.finish(TransactionStatus::Failed, Some(reason.clone()));
        {
            let mut state = self.state.lock().await;
            state.retire(
                &transaction.correlation_id,
                TransactionStatus::Failed,
                Instant::now() + self.config.retention_grace,
            );
        }
        self.metrics.record_transaction_failed();
        error!(
            correlation_id = %transaction.correlation_id,
            failed,
            total,
            "transaction publish failed"
        );
        self.record_audit(&transaction).await;
        Err(DomainError::PublishFailed(transaction.correlation_id, reason))
    }

    /// Publish every member, retrying only the members that failed.
    /// Returns how many members could not be published.
    async fn publish_group(&self, mut remaining: Vec<ResolvedTelemetry>) -> usize {
        let policy = &self.config.publish_retry;
        let mut backoff = policy.backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            let report = self.publisher.publish_batch(&remaining).await;
            if report.is_complete_success() && report.outcomes.len() == remaining.len() {
                for _ in &remaining {
                    self.metrics.record_published();
                }
                return 0;
            }

            let mut still_failing = Vec::new();
            for (index, message) in remaining.into_iter().enumerate() {
                let failed = report
                    .outcomes
                    .get(index)
                    .map_or(true, |outcome| outcome.error.is_some());
                if failed {
                    still_failing.push(message);
                } else {
                    self.metrics.record_published();
                }
            }
            remaining = still_failing;
            if remaining.is_empty() {
                return 0;
            }

            let delay = if attempt < policy.max_attempts {
                backoff.next_backoff()
            } else {
                None
            };
            let Some(delay) = delay else {
                for message in &remaining {
                    self.metrics.record_publish_failure();
                    error!(
                        message_id = %message.message_id(),
                        attempts = attempt,
                        "publish failed after retries, message dropped"
                    );
                }
                return remaining.len();
            };

            warn!(
                failed = report.failed(),
                succeeded = report.succeeded(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                "batch publish partially failed, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    /// Expire groups past their deadline and forget retired ids past the
    /// retention grace. Returns the number of expired groups.
    pub async fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let expired = {
            let mut state = self.state.lock().await;
            state.retired.retain(|_, retired| retired.retain_until > now);

            let overdue: Vec<String> = state
                .pending
                .iter()
                .filter(|(_, group)| group.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();

            let mut expired = Vec::with_capacity(overdue.len());
            for correlation_id in overdue {
                if let Some(group) = state.pending.remove(&correlation_id) {
                    state.retire(
                        &correlation_id,
                        TransactionStatus::Expired,
                        now + self.config.retention_grace,
                    );
                    expired.push(group.transaction);
                }
            }
            expired
        };

        let count = expired.len();
        for transaction in expired {
            self.expire(transaction, ExpiryCause::Timeout).await;
        }
        count
    }

    pub async fn run_sweep_loop(&self, token: CancellationToken) {
        let mut interval = tokio::time::interval(self.config.sweep_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    debug!("transaction sweep loop stopped");
                    return;
                }
                _ = interval.tick() => {
                    let expired = self.sweep_expired().await;
                    if expired > 0 {
                        debug!(expired, "transaction sweep finished");
                    }
                }
            }
        }
    }

    /// Give pending groups up to `grace` to complete, then expire the rest.
    /// Returns the number of groups expired.
    #[instrument(skip(self))]
    pub async fn drain(&self, grace: Duration) -> usize {
        let deadline = Instant::now() + grace;

        loop {
            let pending = self.pending_count().await;
            let now = Instant::now();
            if pending == 0 || now >= deadline {
                break;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL.min(deadline - now)).await;
        }

        let remaining = {
            let mut state = self.state.lock().await;
            let retain_until = Instant::now() + self.config.retention_grace;
            let groups: Vec<(String, PendingGroup)> = state.pending.drain().collect();
            for (correlation_id, _) in &groups {
                state.retire(correlation_id, TransactionStatus::Expired, retain_until);
            }
            groups
        };

        let count = remaining.len();
        for (_, group) in remaining {
            self.expire(group.transaction, ExpiryCause::Shutdown).await;
        }
        if count > 0 {
            warn!(expired = count, "pending transactions expired on shutdown");
        }
        count
    }

    async fn expire(&self, mut transaction: TelemetryTransaction, cause: ExpiryCause) {
        let error = DomainError::TransactionExpired(
            transaction.correlation_id.clone(),
            transaction.processed_devices,
            transaction.total_logical_devices,
        );
        warn!(
            correlation_id = %transaction.correlation_id,
            tenant_id = %transaction.tenant_id,
            received = transaction.processed_devices,
            missing = transaction.missing_devices(),
            cause = cause.describe(),
            "{}",
            error
        );

        transaction.finish(
            TransactionStatus::Expired,
            Some(format!("{}: {}", cause.describe(), error)),
        );
        match cause {
            ExpiryCause::Evicted => self.metrics.record_transaction_evicted(),
            ExpiryCause::Timeout | ExpiryCause::Shutdown => {
                self.metrics.record_transaction_expired()
            }
        }
        self.record_audit(&transaction).await;
    }

    async fn record_audit(&self, transaction: &TelemetryTransaction) {
        let Some(audit) = &self.audit else {
            return;
        };
        if let Err(e) = audit.record_transaction(transaction).await {
            warn!(
                correlation_id = %transaction.correlation_id,
                status = %transaction.status,
                error = %e,
                "failed to record transaction audit"
            );
        }
    }
}
