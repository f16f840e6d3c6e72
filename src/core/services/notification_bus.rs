use crate::config::Config;
use crate::core::domain::connection::{Connection, ConnectionFilter, ConnectionId};
use crate::core::domain::delivery::{
    DeliveryOutcome, DeliveryReceipt, EmitOptions, EventAcknowledgment, QueueKey, QueuedEvent,
};
use crate::core::domain::notification::{NotificationPayload, Priority, PushFrame};
use crate::core::ports::sink::{PushSink, SinkError};
use crate::core::services::ack_tracker::{AckOutcome, AckTracker, Redelivery};
use crate::core::services::delivery_queue::DeliveryQueue;
use crate::core::services::rate_limiter::RateLimiter;
use crate::core::services::registry::{ConnectionRegistry, Target};
use crate::messaging::{BusEvent, Publisher};
use crate::metrics::delivery_metrics::{DeliveryMetrics, MetricsSnapshot};
use crate::utils::error::{BusError, BusResult};
use crate::utils::log_ring::{LogEntry, LogLevel, LogRing};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const QUEUE_EXPIRED_REASON: &str = "queued event expired";
const QUEUE_EVICTED_REASON: &str = "evicted from a full delivery queue";

/// Tunables of the router that are not owned by one of its components.
#[derive(Debug, Clone)]
pub struct BusSettings {
    /// Connections without a heartbeat for this long are unregistered.
    pub liveness_timeout: Duration,
    /// How long a departed user stays eligible for offline queueing.
    pub departed_retention: Duration,
    /// Rate limiter buckets untouched for this long are dropped.
    pub bucket_idle: Duration,
    /// Log lines included in diagnostics.
    pub recent_log_lines: usize,
}

impl Default for BusSettings {
    fn default() -> Self {
        Self {
            liveness_timeout: Duration::from_secs(30),
            departed_retention: Duration::from_secs(300),
            bucket_idle: Duration::from_secs(600),
            recent_log_lines: 50,
        }
    }
}

/// Operator view of the bus, served by `GET /diagnostics`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiagnosticsReport {
    pub generated_at: DateTime<Utc>,
    pub active_connections: usize,
    pub per_role: BTreeMap<String, usize>,
    pub error_rate: f64,
    pub average_latency_ms: Option<f64>,
    pub queue_backlog: usize,
    pub pending_acks: usize,
    pub totals: MetricsSnapshot,
    pub recent_errors: Vec<LogEntry>,
    pub history: Vec<MetricsSnapshot>,
}

/// Per-user bookkeeping for one fan-out.
#[derive(Default)]
struct OwnerOutcome {
    delivered: bool,
    blocked: bool,
}

/// The notification bus: emitter, router and delivery bookkeeping.
///
/// The bus is constructed once per process with its components injected, and is
/// shared behind an `Arc` by the HTTP surface and the maintenance jobs.
/// Collaborators only ever call [`emit`](Self::emit) or
/// [`emit_and_wait`](Self::emit_and_wait); they never touch the registry.
///
/// Writes never block: each connection writer buffers frames, and a full or
/// closed writer affects that connection only.
pub struct NotificationBus {
    registry: Arc<ConnectionRegistry>,
    queue: Arc<DeliveryQueue>,
    limiter: Arc<RateLimiter>,
    acks: Arc<AckTracker>,
    metrics: Arc<DeliveryMetrics>,
    publisher: Arc<Publisher>,
    log_ring: Arc<LogRing>,
    settings: BusSettings,
}

impl NotificationBus {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        queue: Arc<DeliveryQueue>,
        limiter: Arc<RateLimiter>,
        acks: Arc<AckTracker>,
        metrics: Arc<DeliveryMetrics>,
        publisher: Arc<Publisher>,
        log_ring: Arc<LogRing>,
        settings: BusSettings,
    ) -> Self {
        Self {
            registry,
            queue,
            limiter,
            acks,
            metrics,
            publisher,
            log_ring,
            settings,
        }
    }

    /// Builds the bus and all of its components from configuration.
    pub fn from_config(config: &Config, publisher: Arc<Publisher>, log_ring: Arc<LogRing>) -> Self {
        Self::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(DeliveryQueue::new(config.queue.ttl, config.queue.max_per_user)),
            Arc::new(RateLimiter::new(
                config.rate_limit.capacity,
                config.rate_limit.refill_per_second,
            )),
            Arc::new(AckTracker::new(config.ack.timeout, config.ack.max_retries)),
            Arc::new(DeliveryMetrics::new(config.metrics.history_depth)),
            publisher,
            log_ring,
            BusSettings {
                liveness_timeout: config.bus.liveness_timeout,
                departed_retention: config.queue.ttl,
                bucket_idle: config.rate_limit.idle_after,
                ..BusSettings::default()
            },
        )
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn queue(&self) -> &Arc<DeliveryQueue> {
        &self.queue
    }

    pub fn metrics(&self) -> &Arc<DeliveryMetrics> {
        &self.metrics
    }

    pub fn acks(&self) -> &Arc<AckTracker> {
        &self.acks
    }

    /// Emits a domain event.
    ///
    /// Absent targets, closed writers and rate limiting are reported in the
    /// receipt; they never turn into an error.
    ///
    /// # Arguments
    ///
    /// * `event_type` - The `type` discriminator clients subscribe to.
    /// * `data` - Free-form event body.
    /// * `options` - Targeting and shaping, see [`EmitOptions`].
    ///
    /// # Returns
    ///
    /// A `BusResult<DeliveryReceipt>` describing what the router did.
    pub fn emit(&self, event_type: &str, data: Value, options: &EmitOptions) -> BusResult<DeliveryReceipt> {
        let payload = options.build_payload(event_type, data);
        Ok(self.dispatch(payload, options))
    }

    /// Emits an event that requires acknowledgment and waits for its outcome.
    ///
    /// # Returns
    ///
    /// * `Ok(DeliveryOutcome::Delivered)` once one target processed the event.
    /// * `Err(BusError::DeliveryFailed)` if there was no target to deliver to, or
    ///   every delivery exhausted its retries or expired in a queue.
    pub async fn emit_and_wait(
        &self,
        event_type: &str,
        data: Value,
        options: &EmitOptions,
    ) -> BusResult<DeliveryOutcome> {
        let mut options = options.clone();
        options.acknowledgment_required = true;
        let payload = options.build_payload(event_type, data);
        let event_id = payload.id.clone();

        let outcome = self.acks.watch(&event_id);
        let receipt = self.dispatch(payload, &options);
        if receipt.delivered + receipt.queued == 0 {
            self.acks.forget(&event_id);
            return Err(BusError::DeliveryFailed {
                event_id,
                attempts: 0,
            });
        }

        match outcome.await {
            Ok(delivered @ DeliveryOutcome::Delivered { .. }) => Ok(delivered),
            Ok(DeliveryOutcome::Failed { attempts, .. }) => {
                Err(BusError::DeliveryFailed { event_id, attempts })
            }
            Err(_) => Err(BusError::DeliveryFailed {
                event_id,
                attempts: 0,
            }),
        }
    }

    fn dispatch(&self, payload: NotificationPayload, options: &EmitOptions) -> DeliveryReceipt {
        let mut receipt = DeliveryReceipt::new(&payload);

        let bypass = options.skip_rate_limit
            || payload.acknowledgment_required
            || payload.priority == Priority::Urgent;
        if !bypass && !self.limiter.allow(&payload.event_type, options.tenant_id.as_deref()) {
            debug!(
                event_type = payload.event_type.as_str(),
                event_id = payload.id.as_str(),
                "emission rate limited"
            );
            self.metrics.record_rate_limited();
            receipt.rate_limited = true;
            return receipt;
        }

        let Some(frame) = self.serialize(&payload) else {
            return receipt;
        };

        let targets = self.resolve(options);
        receipt.matched = targets.len();

        let mut owners: HashMap<QueueKey, OwnerOutcome> = HashMap::new();
        for target in targets {
            let connection_id = target.connection.connection_id;
            let owner = QueueKey::from(&target.connection);
            let outcome = owners.entry(owner.clone()).or_default();
            match target.sink.push(frame.clone()) {
                Ok(()) => {
                    receipt.delivered += 1;
                    outcome.delivered = true;
                    self.metrics.record_sent(connection_id);
                    if payload.acknowledgment_required {
                        self.acks.track(&payload, connection_id, owner);
                    }
                }
                Err(SinkError::Full) => {
                    outcome.blocked = true;
                    self.metrics.record_error(Some(connection_id));
                    warn!(%connection_id, event_id = payload.id.as_str(), "connection writer is backpressured");
                }
                Err(SinkError::Closed) => {
                    outcome.blocked = true;
                    receipt.failed_writes += 1;
                    self.metrics.record_error(Some(connection_id));
                    self.close(connection_id, "writer closed");
                }
            }
        }

        let keep_blocked = options.queue_if_offline || payload.acknowledgment_required;
        let mut queued_for: HashSet<QueueKey> = HashSet::new();
        for (owner, outcome) in owners {
            if keep_blocked && outcome.blocked && !outcome.delivered {
                self.enqueue(&owner, payload.clone(), true);
                queued_for.insert(owner);
            }
        }

        if options.queue_if_offline {
            for owner in self.offline_owners(options) {
                if queued_for.insert(owner.clone()) {
                    self.enqueue(&owner, payload.clone(), true);
                }
            }
        }
        receipt.queued = queued_for.len();

        debug!(
            event_type = payload.event_type.as_str(),
            event_id = payload.id.as_str(),
            matched = receipt.matched,
            delivered = receipt.delivered,
            queued = receipt.queued,
            "event emitted"
        );
        receipt
    }

    /// Selects live targets: explicit connection, then user, then broadcast,
    /// then stations. A tenant in the options always restricts the result.
    fn resolve(&self, options: &EmitOptions) -> Vec<Target> {
        let tenant_filter = || ConnectionFilter {
            tenant_id: options.tenant_id.clone(),
            ..ConnectionFilter::default()
        };

        if let Some(connection_id) = options.target_connection_id {
            return self.registry.targets(&tenant_filter().connection(connection_id));
        }
        if let Some(user_id) = &options.target_user_id {
            return self.registry.targets(&tenant_filter().user(user_id.clone()));
        }
        if options.broadcast {
            return self.registry.targets(&tenant_filter());
        }
        if options.target_stations.is_empty() {
            return Vec::new();
        }
        self.registry
            .targets_for_stations(options.tenant_id.as_deref(), &options.target_stations)
    }

    /// Users the emission would reach if they were online, that currently are not.
    fn offline_owners(&self, options: &EmitOptions) -> Vec<QueueKey> {
        if options.target_connection_id.is_some() {
            return Vec::new();
        }
        if let Some(user_id) = &options.target_user_id {
            let Some(tenant_id) = &options.tenant_id else {
                return Vec::new();
            };
            let key = QueueKey::new(tenant_id.clone(), user_id.clone());
            return if self.registry.connections_for_user(&key).is_empty() {
                vec![key]
            } else {
                Vec::new()
            };
        }
        if options.broadcast {
            return self
                .registry
                .departed_users(options.tenant_id.as_deref(), &[]);
        }
        if options.target_stations.is_empty() {
            return Vec::new();
        }
        self.registry
            .departed_users(options.tenant_id.as_deref(), &options.target_stations)
    }

    fn serialize(&self, payload: &NotificationPayload) -> Option<Arc<str>> {
        match PushFrame::new(payload.clone()).to_line() {
            Ok(line) => Some(Arc::from(line)),
            Err(e) => {
                error!(event_id = payload.id.as_str(), "failed to encode push frame: {e}");
                self.metrics.record_error(None);
                None
            }
        }
    }

    /// Queues `payload` for `owner`. With `hold`, an acknowledgment-required
    /// event stays outstanding in the tracker while it waits.
    fn enqueue(&self, owner: &QueueKey, payload: NotificationPayload, hold: bool) {
        if hold && payload.acknowledgment_required {
            self.acks.hold(&payload.id);
        }
        let enqueued = self.queue.enqueue(owner, payload);
        self.metrics.record_queued(1);
        if let Some(evicted) = enqueued.evicted {
            self.lose(owner, evicted, QUEUE_EVICTED_REASON);
        }
    }

    fn lose(&self, owner: &QueueKey, event: QueuedEvent, reason: &str) {
        info!(
            event_id = event.notification.id.as_str(),
            tenant_id = owner.tenant_id.as_str(),
            user_id = owner.user_id.as_str(),
            "{reason}"
        );
        self.metrics.record_expired(1);
        if event.notification.acknowledgment_required {
            self.acks.release_hold(&event.notification.id, Some(reason));
        }
        self.announce(BusEvent::QueueExpired {
            event_id: event.notification.id,
            tenant_id: owner.tenant_id.clone(),
            user_id: owner.user_id.clone(),
        });
    }

    fn announce(&self, event: BusEvent) {
        // Nobody listening is fine.
        let _ = self.publisher.publish(event);
    }

    /// Writes every queued event of `owner` to `sink`, oldest first.
    ///
    /// Stops at the first refused write and puts the remainder back at the head
    /// of the queue.
    fn deliver_backlog(
        &self,
        owner: &QueueKey,
        connection_id: ConnectionId,
        sink: &Arc<dyn PushSink>,
    ) -> (usize, Option<SinkError>) {
        let drained = self.queue.drain(owner);
        for expired in drained.expired {
            self.lose(owner, expired, QUEUE_EXPIRED_REASON);
        }

        let mut delivered = 0;
        let mut entries = drained.ready.into_iter();
        while let Some(entry) = entries.next() {
            let notification = &entry.event.notification;
            let Some(frame) = self.serialize(notification) else {
                continue;
            };
            match sink.push(frame) {
                Ok(()) => {
                    delivered += 1;
                    self.metrics.record_sent(connection_id);
                    if notification.acknowledgment_required {
                        self.acks
                            .track_held(notification, connection_id, owner.clone());
                    }
                }
                Err(e) => {
                    let mut rest = vec![entry];
                    rest.extend(entries);
                    for dropped in self.queue.requeue_front(owner, rest) {
                        self.lose(owner, dropped, QUEUE_EVICTED_REASON);
                    }
                    return (delivered, Some(e));
                }
            }
        }
        (delivered, None)
    }

    /// Registers an opened push stream.
    ///
    /// Events queued for the (tenant, user) are written to the sink before the
    /// connection becomes visible to live emissions, preserving their order.
    pub fn connect(&self, connection: Connection, sink: Arc<dyn PushSink>) -> ConnectionId {
        let connection_id = connection.connection_id;
        let owner = QueueKey::from(&connection);
        let opened = BusEvent::ConnectionOpened {
            connection_id,
            tenant_id: connection.tenant_id.clone(),
            user_id: connection.user_id.clone(),
            station: connection.station.clone(),
        };

        self.metrics.track_connection(connection_id);
        let (mut replayed, _) = self.deliver_backlog(&owner, connection_id, &sink);
        self.registry.register(connection, sink.clone());
        // Anything queued while the first drain ran.
        replayed += self.deliver_backlog(&owner, connection_id, &sink).0;

        info!(
            %connection_id,
            tenant_id = owner.tenant_id.as_str(),
            user_id = owner.user_id.as_str(),
            replayed,
            "connection registered"
        );
        self.announce(opened);
        connection_id
    }

    /// Unregisters a connection closed by the client.
    pub fn disconnect(&self, connection_id: ConnectionId) -> Option<Connection> {
        self.close(connection_id, "client closed")
    }

    fn close(&self, connection_id: ConnectionId, reason: &str) -> Option<Connection> {
        let connection = self.registry.unregister(connection_id)?;
        self.forget(&connection, reason);
        Some(connection)
    }

    fn forget(&self, connection: &Connection, reason: &str) {
        let connection_id = connection.connection_id;
        self.metrics.forget_connection(connection_id);
        let released = self.acks.release_connection(connection_id);
        info!(%connection_id, reason, released, "connection unregistered");
        self.announce(BusEvent::ConnectionClosed {
            connection_id,
            tenant_id: connection.tenant_id.clone(),
            reason: reason.to_string(),
        });
    }

    /// Records a liveness signal from the connection.
    pub fn heartbeat(&self, connection_id: ConnectionId) -> BusResult<()> {
        if self.registry.touch(connection_id) {
            Ok(())
        } else {
            Err(BusError::RegistryMiss(connection_id.to_string()))
        }
    }

    /// Records a transport-level round trip measured by the connection writer.
    pub fn record_round_trip(&self, connection_id: ConnectionId, latency: Duration) {
        let latency_ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.metrics.record_latency(connection_id, latency_ms);
    }

    /// Applies an acknowledgment sent by a station.
    pub fn acknowledge(&self, ack: &EventAcknowledgment) -> BusResult<AckOutcome> {
        let outcome = self.acks.acknowledge(ack);
        match &outcome {
            AckOutcome::Retired { latency_ms } => {
                self.metrics.record_ack(ack.connection_id, Some(*latency_ms));
            }
            AckOutcome::Retry => {
                self.metrics.record_error(Some(ack.connection_id));
                warn!(
                    event_id = ack.event_id.as_str(),
                    connection_id = %ack.connection_id,
                    "client failed to process event: {}",
                    ack.error.as_deref().unwrap_or("unknown error")
                );
            }
            AckOutcome::Noted => {}
            AckOutcome::Unknown => {
                debug!(event_id = ack.event_id.as_str(), "acknowledgment for unknown delivery");
            }
        }
        Ok(outcome)
    }

    /// Redelivers overdue acknowledgment-required events and reports the ones
    /// that ran out of retries. Returns how many deliveries were handled.
    pub fn run_ack_timeouts(&self) -> usize {
        let due = self.acks.take_due();
        let handled = due.redeliver.len() + due.failed.len();

        for redelivery in due.redeliver {
            self.metrics.record_redelivered();
            self.redeliver(redelivery);
        }
        for failed in due.failed {
            self.metrics.record_failed();
            error!(
                event_id = failed.event_id.as_str(),
                connection_id = %failed.connection_id,
                attempts = failed.attempts,
                "delivery failed: {}",
                failed.reason
            );
            self.announce(BusEvent::DeliveryFailed {
                event_id: failed.event_id,
                connection_id: Some(failed.connection_id),
                attempts: failed.attempts,
                reason: failed.reason,
            });
        }
        handled
    }

    /// Sends a redelivery to its original connection, else to another live
    /// connection of the same user, else parks it in the user's queue.
    fn redeliver(&self, redelivery: Redelivery) {
        let Redelivery {
            notification,
            connection_id,
            owner,
            ..
        } = redelivery;
        let Some(frame) = self.serialize(&notification) else {
            return;
        };

        if let Some(sink) = self.registry.sink(connection_id) {
            match sink.push(frame.clone()) {
                Ok(()) => {
                    self.metrics.record_sent(connection_id);
                    return;
                }
                Err(SinkError::Closed) => {
                    self.close(connection_id, "writer closed");
                }
                Err(SinkError::Full) => {}
            }
        }

        for other in self.registry.connections_for_user(&owner) {
            if other == connection_id {
                continue;
            }
            let Some(sink) = self.registry.sink(other) else {
                continue;
            };
            if sink.push(frame.clone()).is_ok() {
                self.metrics.record_sent(other);
                self.acks.retarget(&notification.id, connection_id, other);
                return;
            }
        }

        if self.acks.park(&notification.id, connection_id) {
            debug!(event_id = notification.id.as_str(), "redelivery parked in queue");
            self.enqueue(&owner, notification, false);
        }
    }

    /// Drops expired queue entries, forgets long-departed users and idle
    /// rate-limit buckets. Returns the number of expired entries.
    pub fn sweep_queue(&self) -> usize {
        let expired = self.queue.sweep_expired();
        let count = expired.len();
        for (owner, event) in expired {
            self.lose(&owner, event, QUEUE_EXPIRED_REASON);
        }
        self.registry
            .prune_departed(self.settings.departed_retention);
        self.limiter.sweep_idle(self.settings.bucket_idle);
        count
    }

    /// Unregisters connections whose heartbeat is overdue.
    pub fn sweep_stale_connections(&self) -> usize {
        let stale = self.registry.sweep_stale(self.settings.liveness_timeout);
        for connection in &stale {
            self.forget(connection, "liveness timeout");
        }
        stale.len()
    }

    /// Retries queued events for users that are online again, typically after
    /// their writer was backpressured. Returns how many frames were written.
    pub fn flush_backpressured(&self) -> usize {
        let mut written = 0;
        for owner in self.queue.keys() {
            for connection_id in self.registry.connections_for_user(&owner) {
                let Some(sink) = self.registry.sink(connection_id) else {
                    continue;
                };
                let (delivered, refused) = self.deliver_backlog(&owner, connection_id, &sink);
                written += delivered;
                match refused {
                    None => break,
                    Some(SinkError::Closed) => {
                        self.close(connection_id, "writer closed");
                    }
                    Some(SinkError::Full) => {}
                }
            }
        }
        written
    }

    /// Appends a metrics snapshot to the history ring.
    pub fn snapshot_metrics(&self) -> MetricsSnapshot {
        self.metrics.record_snapshot()
    }

    pub fn diagnostics(&self) -> DiagnosticsReport {
        DiagnosticsReport {
            generated_at: Utc::now(),
            active_connections: self.registry.len(),
            per_role: self.registry.role_breakdown(),
            error_rate: self.metrics.error_rate(),
            average_latency_ms: self.metrics.average_latency_ms(),
            queue_backlog: self.queue.backlog(),
            pending_acks: self.acks.pending_count(),
            totals: self.metrics.snapshot(),
            recent_errors: self
                .log_ring
                .recent(LogLevel::Error, self.settings.recent_log_lines),
            history: self.metrics.history(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::transport::channel_sink::{channel, ChannelSink};
    use crate::core::domain::delivery::AckStatus;
    use crate::core::domain::notification::event_types;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn bus_with(queue_ttl: Duration, capacity: u32, ack_timeout: Duration, retries: u32) -> NotificationBus {
        NotificationBus::new(
            Arc::new(ConnectionRegistry::new()),
            Arc::new(DeliveryQueue::new(queue_ttl, 100)),
            Arc::new(RateLimiter::new(capacity, 1.0)),
            Arc::new(AckTracker::new(ack_timeout, retries)),
            Arc::new(DeliveryMetrics::new(10)),
            Arc::new(Publisher::new(16)),
            Arc::new(LogRing::new(16)),
            BusSettings {
                departed_retention: queue_ttl,
                ..BusSettings::default()
            },
        )
    }

    fn bus() -> NotificationBus {
        bus_with(Duration::from_secs(60), 100, Duration::from_secs(5), 3)
    }

    fn open(bus: &NotificationBus, user: &str, tenant: &str, station: &str) -> (ConnectionId, mpsc::Receiver<Arc<str>>) {
        let (sink, receiver) = channel(16);
        let id = bus.connect(Connection::new(user, tenant, station), Arc::new(sink));
        (id, receiver)
    }

    fn frames(receiver: &mut mpsc::Receiver<Arc<str>>) -> Vec<PushFrame> {
        let mut out = Vec::new();
        while let Ok(line) = receiver.try_recv() {
            out.push(PushFrame::parse(&line).unwrap());
        }
        out
    }

    #[test]
    fn test_station_targeting() {
        let bus = bus();
        let (_, mut waiter) = open(&bus, "u1", "t1", "CAMERIERE");
        let (_, mut kitchen) = open(&bus, "u2", "t1", "PREPARA");

        let receipt = bus
            .emit(
                event_types::ORDER_READY,
                json!({"orderId": "7"}),
                &EmitOptions::to_stations("t1", ["CAMERIERE"]),
            )
            .unwrap();

        assert_eq!(receipt.delivered, 1);
        let received = frames(&mut waiter);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].event_type, event_types::ORDER_READY);
        assert!(frames(&mut kitchen).is_empty());
    }

    #[test]
    fn test_tenant_isolation_even_for_explicit_connection() {
        let bus = bus();
        let (other_tenant, mut receiver) = open(&bus, "u1", "t2", "CASSA");

        let receipt = bus
            .emit(
                event_types::PAYMENT_REQUESTED,
                json!({}),
                &EmitOptions::to_connection(other_tenant).tenant("t1"),
            )
            .unwrap();
        assert_eq!(receipt.matched, 0);
        assert!(frames(&mut receiver).is_empty());

        let receipt = bus
            .emit(event_types::ORDER_NEW, json!({}), &EmitOptions::broadcast().tenant("t1"))
            .unwrap();
        assert_eq!(receipt.matched, 0);
    }

    #[test]
    fn test_absent_target_is_not_an_error() {
        let bus = bus();
        let receipt = bus
            .emit(
                event_types::ORDER_NEW,
                json!({}),
                &EmitOptions::to_connection(ConnectionId::new()),
            )
            .unwrap();
        assert_eq!(receipt.matched, 0);
        assert_eq!(receipt.queued, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reconnect_replays_queue_in_order() {
        let bus = bus();
        let (id, _receiver) = open(&bus, "u1", "t1", "CAMERIERE");
        bus.disconnect(id);

        let options = EmitOptions::to_stations("t1", ["CAMERIERE"]).queue_if_offline();
        bus.emit(event_types::ORDER_NEW, json!({"n": 1}), &options).unwrap();
        bus.emit(event_types::ORDER_READY, json!({"n": 2}), &options).unwrap();
        assert_eq!(bus.queue().backlog(), 2);

        tokio::time::advance(Duration::from_secs(5)).await;
        let (_, mut receiver) = open(&bus, "u1", "t1", "CAMERIERE");
        let replayed = frames(&mut receiver);
        let types: Vec<&str> = replayed.iter().map(|f| f.event_type.as_str()).collect();
        assert_eq!(types, vec![event_types::ORDER_NEW, event_types::ORDER_READY]);
        assert_eq!(bus.queue().backlog(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_past_ttl_is_dropped() {
        let bus = bus();
        let (id, _receiver) = open(&bus, "u1", "t1", "PREPARA");
        bus.disconnect(id);

        let options = EmitOptions::to_user("t1", "u1").queue_if_offline();
        bus.emit(event_types::ORDER_NEW, json!({}), &options).unwrap();
        bus.emit(event_types::ORDER_NEW, json!({}), &options).unwrap();

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(bus.sweep_queue(), 2);
        assert_eq!(bus.queue().backlog(), 0);

        let (_, mut receiver) = open(&bus, "u1", "t1", "PREPARA");
        assert!(frames(&mut receiver).is_empty());
        assert_eq!(bus.metrics().snapshot().expired, 2);
    }

    #[test]
    fn test_rate_limit_drops_only_excess_of_one_type() {
        let bus = bus_with(Duration::from_secs(60), 2, Duration::from_secs(5), 3);
        let (_, mut receiver) = open(&bus, "u1", "t1", "CASSA");
        let options = EmitOptions::broadcast().tenant("t1");

        let limited: Vec<bool> = (0..4)
            .map(|_| {
                bus.emit(event_types::PRODUCT_OUT_OF_STOCK, json!({}), &options)
                    .unwrap()
                    .rate_limited
            })
            .collect();
        assert_eq!(limited, vec![false, false, true, true]);

        assert!(!bus.emit(event_types::ORDER_NEW, json!({}), &options).unwrap().rate_limited);
        let urgent = options.clone().priority(Priority::Urgent);
        assert!(!bus
            .emit(event_types::PRODUCT_OUT_OF_STOCK, json!({}), &urgent)
            .unwrap()
            .rate_limited);
        assert_eq!(frames(&mut receiver).len(), 4);
        assert_eq!(bus.metrics().snapshot().rate_limited, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_event_is_retried_then_failed() {
        let bus = bus_with(Duration::from_secs(60), 100, Duration::from_secs(5), 3);
        let (_, mut receiver) = open(&bus, "u1", "t1", "PREPARA");
        let mut events = bus.publisher.subscribe();

        bus.emit(
            event_types::ORDER_NEW,
            json!({}),
            &EmitOptions::to_stations("t1", ["PREPARA"]).require_ack(),
        )
        .unwrap();

        for _ in 0..6 {
            tokio::time::advance(Duration::from_secs(6)).await;
            bus.run_ack_timeouts();
        }

        let received = frames(&mut receiver);
        assert_eq!(received.len(), 4);
        assert!(received.iter().all(|f| f.payload.id == received[0].payload.id));
        assert_eq!(bus.metrics().snapshot().failed, 1);
        assert!(matches!(
            events.try_recv().unwrap(),
            BusEvent::DeliveryFailed { attempts: 4, .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_emit_and_wait_resolves_on_processed_ack() {
        let bus = Arc::new(bus());
        let (connection_id, mut receiver) = open(&bus, "u1", "t1", "CASSA");

        let waiting = {
            let bus = bus.clone();
            tokio::spawn(async move {
                bus.emit_and_wait(
                    event_types::PAYMENT_REQUESTED,
                    json!({"table": 4}),
                    &EmitOptions::to_stations("t1", ["CASSA"]),
                )
                .await
            })
        };

        let line = receiver.recv().await.unwrap();
        let frame = PushFrame::parse(&line).unwrap();
        assert!(frame.payload.acknowledgment_required);
        bus.acknowledge(&EventAcknowledgment::new(
            frame.payload.id.clone(),
            connection_id,
            AckStatus::Processed,
        ))
        .unwrap();

        let outcome = waiting.await.unwrap().unwrap();
        assert!(matches!(outcome, DeliveryOutcome::Delivered { acknowledged_by: 1, .. }));
        assert_eq!(bus.metrics().connection(connection_id).unwrap().messages_acknowledged, 1);
    }

    #[tokio::test]
    async fn test_emit_and_wait_without_target_fails() {
        let bus = bus();
        let result = bus
            .emit_and_wait(
                event_types::ORDER_READY,
                json!({}),
                &EmitOptions::to_stations("t1", ["CAMERIERE"]),
            )
            .await;
        assert!(matches!(result, Err(BusError::DeliveryFailed { attempts: 0, .. })));
    }

    #[test]
    fn test_closed_writer_unregisters_only_that_connection() {
        let bus = bus();
        let (sink, receiver) = channel(4);
        let closed = bus.connect(Connection::new("u1", "t1", "CAMERIERE"), Arc::new(sink));
        drop(receiver);
        let (_, mut healthy) = open(&bus, "u2", "t1", "CAMERIERE");

        let receipt = bus
            .emit(event_types::ORDER_READY, json!({}), &EmitOptions::to_stations("t1", ["CAMERIERE"]))
            .unwrap();
        assert_eq!(receipt.failed_writes, 1);
        assert_eq!(receipt.delivered, 1);
        assert!(bus.registry().get(closed).is_none());
        assert_eq!(frames(&mut healthy).len(), 1);
    }

    #[test]
    fn test_backpressured_writer_is_flushed_later() {
        let bus = bus();
        let (sink, mut receiver): (ChannelSink, _) = channel(1);
        bus.connect(Connection::new("u1", "t1", "PREPARA"), Arc::new(sink));
        let options = EmitOptions::to_stations("t1", ["PREPARA"]).queue_if_offline();

        bus.emit(event_types::ORDER_NEW, json!({"n": 1}), &options).unwrap();
        let receipt = bus.emit(event_types::ORDER_NEW, json!({"n": 2}), &options).unwrap();
        assert_eq!(receipt.queued, 1);

        assert_eq!(frames(&mut receiver).len(), 1);
        assert_eq!(bus.flush_backpressured(), 1);
        let flushed = frames(&mut receiver);
        assert_eq!(flushed[0].payload.data, json!({"n": 2}));
        assert_eq!(bus.queue().backlog(), 0);
    }

    #[test]
    fn test_oversized_ttl_still_queues() {
        let bus = bus();
        let (id, _receiver) = open(&bus, "u1", "t1", "PREPARA");
        bus.disconnect(id);

        let options = EmitOptions::to_user("t1", "u1")
            .queue_if_offline()
            .ttl_seconds(u64::MAX);
        let receipt = bus.emit(event_types::ORDER_NEW, json!({}), &options).unwrap();
        assert_eq!(receipt.queued, 1);
        assert_eq!(bus.queue().backlog(), 1);
    }

    /// Refuses every write, enqueueing one more event on the first attempt as a
    /// concurrent emitter would between the drain and the requeue.
    struct InterruptedSink {
        queue: Arc<DeliveryQueue>,
        owner: QueueKey,
        late: std::sync::Mutex<Option<NotificationPayload>>,
    }

    impl PushSink for InterruptedSink {
        fn push(&self, _line: Arc<str>) -> Result<(), SinkError> {
            if let Some(late) = self.late.lock().unwrap().take() {
                self.queue.enqueue(&self.owner, late);
            }
            Err(SinkError::Full)
        }
    }

    #[tokio::test]
    async fn test_requeue_overflow_fails_held_event() {
        let queue = Arc::new(DeliveryQueue::new(Duration::from_secs(60), 2));
        let bus = NotificationBus::new(
            Arc::new(ConnectionRegistry::new()),
            queue.clone(),
            Arc::new(RateLimiter::new(100, 1.0)),
            Arc::new(AckTracker::new(Duration::from_secs(5), 3)),
            Arc::new(DeliveryMetrics::new(10)),
            Arc::new(Publisher::new(16)),
            Arc::new(LogRing::new(16)),
            BusSettings::default(),
        );
        let owner = QueueKey::new("t1", "u1");
        queue.enqueue(&owner, NotificationPayload::new(event_types::ORDER_NEW, json!({"n": 1})));
        queue.enqueue(&owner, NotificationPayload::new(event_types::ORDER_NEW, json!({"n": 2})));

        let mut late = NotificationPayload::new(event_types::PAYMENT_REQUESTED, json!({}));
        late.acknowledgment_required = true;
        let outcome = bus.acks().watch(&late.id);
        bus.acks().hold(&late.id);

        let sink = InterruptedSink {
            queue: queue.clone(),
            owner: owner.clone(),
            late: std::sync::Mutex::new(Some(late)),
        };
        bus.connect(Connection::new("u1", "t1", "CASSA"), Arc::new(sink));

        assert!(matches!(
            outcome.await.unwrap(),
            DeliveryOutcome::Failed { attempts: 1, .. }
        ));
        assert_eq!(queue.backlog_for(&owner), 2);
        assert_eq!(bus.metrics().snapshot().expired, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_connections_are_swept() {
        let bus = bus();
        let (quiet, _a) = open(&bus, "u1", "t1", "CASSA");
        let (chatty, _b) = open(&bus, "u2", "t1", "CASSA");

        tokio::time::advance(Duration::from_secs(20)).await;
        bus.heartbeat(chatty).unwrap();
        tokio::time::advance(Duration::from_secs(15)).await;

        assert_eq!(bus.sweep_stale_connections(), 1);
        assert!(matches!(bus.heartbeat(quiet), Err(BusError::RegistryMiss(_))));
        assert_eq!(bus.diagnostics().active_connections, 1);
    }

    #[test]
    fn test_diagnostics_breakdown() {
        let bus = bus();
        open(&bus, "u1", "t1", "CAMERIERE");
        open(&bus, "u2", "t1", "CAMERIERE");
        open(&bus, "u3", "t1", "SUPERVISORE");
        bus.snapshot_metrics();

        let report = bus.diagnostics();
        assert_eq!(report.active_connections, 3);
        assert_eq!(report.per_role.get("CAMERIERE"), Some(&2));
        assert_eq!(report.history.len(), 1);
        assert_eq!(report.error_rate, 0.0);
    }
}
