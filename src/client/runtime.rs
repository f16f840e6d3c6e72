use crate::adapters::transport::ws_connector::{StreamIdentity, WsConnector};
use crate::client::backoff::ReconnectPolicy;
use crate::client::dedup::DedupFilter;
use crate::client::optimistic::OptimisticTracker;
use crate::client::subscriptions::{handler, Subscription, SubscriptionRegistry};
use crate::client::OPTIMISTIC_ROLLBACK;
use crate::config::ClientConfig;
use crate::core::domain::connection::Station;
use crate::core::domain::delivery::{AckStatus, ClientAck, ClientMessage};
use crate::core::domain::health::{ConnectionHealth, ConnectionState, ConnectionStatus};
use crate::core::domain::notification::{NotificationPayload, PushFrame};
use crate::core::domain::optimistic::OptimisticUpdate;
use crate::core::ports::connector::{ClientChannel, StreamConnector};
use crate::metrics::connection_health_tracker::ConnectionHealthTracker;
use crate::utils::error::BusResult;
use chrono::Utc;
use futures::StreamExt;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Why a stream stopped being pumped.
enum StreamEnd {
    Cancelled,
    Lost,
}

struct Shared {
    config: ClientConfig,
    connector: Arc<dyn StreamConnector>,
    policy: ReconnectPolicy,
    subscriptions: SubscriptionRegistry,
    dedup: Mutex<DedupFilter>,
    optimistic: Mutex<OptimisticTracker>,
    health: ConnectionHealthTracker,
    state: watch::Sender<ConnectionState>,
    /// Set while a connect attempt is running.
    attempt_in_flight: AtomicBool,
    cancel: CancellationToken,
}

/// Client side of the push stream.
///
/// The runtime keeps one stream open, reconnecting with backoff, filters
/// repeated deliveries, hands payloads to subscribers in arrival order and
/// acknowledges the events that ask for it. Three background activities run
/// while it is started: the connection loop, the health tick and the dedup
/// sweep. All of them stop on [`ClientRuntime::shutdown`].
pub struct ClientRuntime {
    shared: Arc<Shared>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl ClientRuntime {
    /// Creates a stopped runtime.
    ///
    /// # Arguments
    ///
    /// * `config` - Reconnect, dedup, heartbeat and health settings.
    /// * `connector` - The transport used for every connection attempt.
    pub fn new(config: ClientConfig, connector: Arc<dyn StreamConnector>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                policy: ReconnectPolicy::from_config(&config),
                dedup: Mutex::new(DedupFilter::new(config.dedup_window, config.dedup_enabled)),
                optimistic: Mutex::new(OptimisticTracker::new()),
                health: ConnectionHealthTracker::new(
                    config.health_gain,
                    config.health_penalty,
                    config.max_missed_pings,
                ),
                subscriptions: SubscriptionRegistry::new(),
                state,
                attempt_in_flight: AtomicBool::new(false),
                cancel: CancellationToken::new(),
                connector,
                config,
            }),
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    /// Creates a runtime that connects over WebSocket to `config.url`.
    pub fn over_websocket(config: ClientConfig) -> BusResult<Self> {
        let identity = StreamIdentity {
            user_id: config.user_id.clone(),
            tenant_id: config.tenant_id.clone(),
            station: Station::new(&config.station),
            api_key: config.api_key.clone(),
        };
        let connector = WsConnector::new(&config.url, identity)?;
        Ok(Self::new(config, Arc::new(connector)))
    }

    /// Starts the background activities. Calling it twice, or after
    /// shutdown, does nothing.
    pub fn start(&self) {
        if self.shared.cancel.is_cancelled() || self.started.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut tasks = locked(&self.tasks);
        tasks.push(tokio::spawn(connection_loop(self.shared.clone())));
        tasks.push(tokio::spawn(health_loop(self.shared.clone())));
        tasks.push(tokio::spawn(dedup_sweep_loop(self.shared.clone())));
    }

    /// Tears the runtime down.
    ///
    /// Subscribers are dropped before the background tasks are joined, so no
    /// handler runs once this returns. Pending reconnect timers die with their task.
    pub async fn shutdown(&self) {
        self.shared.cancel.cancel();
        self.shared.subscriptions.close();
        locked(&self.shared.dedup).clear();

        let tasks = std::mem::take(&mut *locked(&self.tasks));
        for task in tasks {
            if let Err(e) = task.await {
                warn!("client task ended abnormally: {}", e);
            }
        }
        self.shared.set_state(ConnectionState::Disconnected);
        self.shared.health.note_disconnected();
        info!("client runtime shut down");
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    /// Coarse status for the UI. A pending reconnect is reported as `Error`.
    pub fn status(&self) -> ConnectionStatus {
        self.state().into()
    }

    /// Receiver notified on every state transition.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    pub fn health(&self) -> ConnectionHealth {
        self.shared.health.snapshot()
    }

    /// Runs `f` for each admitted event of `event_type` (or `"*"`) until the
    /// returned [`Subscription`] is dropped.
    pub fn subscribe<F>(&self, event_type: impl Into<String>, f: F) -> Subscription
    where
        F: Fn(&NotificationPayload) -> Result<(), String> + Send + Sync + 'static,
    {
        self.shared.subscriptions.subscribe(event_type, handler(f))
    }

    /// Records a change the UI applied ahead of server confirmation.
    ///
    /// Unconfirmed updates are rolled back after `optimistic_timeout` by
    /// dispatching a `client:optimistic_rollback` event carrying the update.
    pub fn apply_optimistic(
        &self,
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        changes: Value,
        rollback_data: Option<Value>,
    ) -> OptimisticUpdate {
        locked(&self.shared.optimistic).apply(entity_type, entity_id, changes, rollback_data)
    }

    pub fn pending_optimistic(&self) -> usize {
        locked(&self.shared.optimistic).len()
    }
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    /// One connect attempt; `None` when another attempt is already running
    /// or the runtime was cancelled meanwhile.
    async fn attempt(&self) -> Option<BusResult<ClientChannel>> {
        if self.attempt_in_flight.swap(true, Ordering::SeqCst) {
            return None;
        }
        let result = tokio::select! {
            _ = self.cancel.cancelled() => None,
            result = self.connector.connect() => Some(result),
        };
        self.attempt_in_flight.store(false, Ordering::SeqCst);
        result
    }

    /// Sleeps for `delay` unless cancelled first.
    async fn wait(&self, delay: std::time::Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = sleep(delay) => true,
        }
    }

    async fn pump(&self, channel: ClientChannel) -> StreamEnd {
        let ClientChannel {
            mut frames,
            replies,
        } = channel;
        let period = self.config.heartbeat_interval;
        let mut heartbeat = interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => return StreamEnd::Cancelled,
                _ = heartbeat.tick() => {
                    let sent_at = Utc::now().timestamp_millis();
                    let missed = self.health.note_ping_sent(sent_at);
                    if self.health.link_dead() {
                        warn!(missed, "push stream stopped answering heartbeats");
                        return StreamEnd::Lost;
                    }
                    if replies.send(ClientMessage::Heartbeat { sent_at }).await.is_err() {
                        return StreamEnd::Lost;
                    }
                }
                frame = frames.next() => match frame {
                    Some(Ok(line)) => self.on_frame(&line, &replies).await,
                    Some(Err(e)) => {
                        warn!("push stream failed: {}", e);
                        return StreamEnd::Lost;
                    }
                    None => {
                        info!("push stream closed by server");
                        return StreamEnd::Lost;
                    }
                },
            }
        }
    }

    async fn on_frame(&self, line: &str, replies: &mpsc::Sender<ClientMessage>) {
        let frame = match PushFrame::parse(line) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("unreadable frame: {}", e);
                return;
            }
        };
        if frame.is_pong() {
            if let Some(sent_at) = frame.payload.data.get("sentAt").and_then(Value::as_i64) {
                self.health.note_pong(sent_at, Utc::now().timestamp_millis());
            }
            return;
        }

        let payload = frame.payload;
        let admitted = locked(&self.dedup).admit(&payload);
        let result = if admitted && !self.cancel.is_cancelled() {
            locked(&self.optimistic).confirm_from(&payload);
            self.subscriptions.dispatch(&payload).map(|_| ())
        } else {
            debug!(event_id = payload.id.as_str(), "duplicate delivery dropped");
            Ok(())
        };

        // Duplicates are acknowledged again: the first ack may have been lost.
        if payload.acknowledgment_required {
            let ack = match result {
                Ok(()) => ClientAck {
                    event_id: payload.id.clone(),
                    status: AckStatus::Processed,
                    error: None,
                },
                Err(error) => ClientAck {
                    event_id: payload.id.clone(),
                    status: AckStatus::Failed,
                    error: Some(error),
                },
            };
            if replies.send(ClientMessage::Ack(ack)).await.is_err() {
                debug!(event_id = payload.id.as_str(), "stream closed before ack was sent");
            }
        }
    }

    fn roll_back_expired(&self) {
        let expired = locked(&self.optimistic).expire(self.config.optimistic_timeout);
        for update in expired {
            warn!(
                entity_type = update.entity_type.as_str(),
                entity_id = update.entity_id.as_str(),
                "optimistic update not confirmed in time, rolling back"
            );
            let data = serde_json::to_value(&update).unwrap_or(Value::Null);
            let payload = NotificationPayload::new(OPTIMISTIC_ROLLBACK, data);
            if let Err(e) = self.subscriptions.dispatch(&payload) {
                warn!("rollback handler failed: {}", e);
            }
        }
    }
}

async fn connection_loop(shared: Arc<Shared>) {
    let mut failures: u32 = 0;
    loop {
        shared.set_state(if failures == 0 {
            ConnectionState::Connecting
        } else {
            ConnectionState::Reconnecting
        });
        shared.health.note_connecting();

        let Some(result) = shared.attempt().await else {
            break;
        };
        match result {
            Ok(channel) => {
                let connected_at = Instant::now();
                shared.set_state(ConnectionState::Connected);
                shared.health.note_connected();
                info!("push stream connected");

                match shared.pump(channel).await {
                    StreamEnd::Cancelled => break,
                    StreamEnd::Lost => {
                        shared.health.note_connection_lost();
                        // A link lost before its first health tick counts as a failed attempt.
                        if connected_at.elapsed() >= shared.config.health_tick {
                            failures = 0;
                        } else {
                            failures += 1;
                            if !shared.policy.should_retry(failures) {
                                warn!(failures, "push stream keeps dropping right after connecting, giving up");
                                shared.set_state(ConnectionState::Disconnected);
                                shared.health.note_disconnected();
                                break;
                            }
                        }
                        shared.set_state(ConnectionState::Reconnecting);
                        if !shared.wait(shared.policy.delay_for(failures.max(1))).await {
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                failures += 1;
                shared.health.note_attempt_failed();
                if !shared.policy.should_retry(failures) {
                    warn!(failures, "giving up on the push stream: {}", e);
                    shared.set_state(ConnectionState::Disconnected);
                    shared.health.note_disconnected();
                    break;
                }
                let delay = shared.policy.delay_for(failures);
                warn!(
                    failures,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "connect attempt failed: {}",
                    e
                );
                shared.set_state(ConnectionState::Reconnecting);
                if !shared.wait(delay).await {
                    break;
                }
            }
        }
    }
}

async fn health_loop(shared: Arc<Shared>) {
    let period = shared.config.health_tick;
    let mut tick = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tick.tick() => {
                shared.health.note_healthy_tick();
                shared.roll_back_expired();
            }
        }
    }
}

async fn dedup_sweep_loop(shared: Arc<Shared>) {
    let period = shared.config.dedup_window;
    let mut tick = interval_at(Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tick.tick() => {
                let purged = locked(&shared.dedup).sweep();
                if purged > 0 {
                    debug!(purged, "dedup entries purged");
                }
            }
        }
    }
}
