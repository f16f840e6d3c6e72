use crate::adapters::api::models::identity::StationIdentity;
use crate::adapters::api::server::{ApiState, StreamSettings};
use crate::adapters::transport::channel_sink::channel;
use crate::core::domain::connection::{Connection, ConnectionId};
use crate::core::domain::delivery::ClientMessage;
use crate::core::domain::notification::PushFrame;
use crate::core::services::notification_bus::NotificationBus;
use crate::utils::error::BusError;
use actix::prelude::*;
use actix_web::{get, web, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use web::Data;

/// A line of the push stream ready to be written to the socket.
#[derive(Message)]
#[rtype(result = "()")]
pub struct PushLine(Arc<str>);

/// A WebSocket actor serving one station's push stream.
///
/// The actor owns the receiving half of the connection's writer channel. The bus
/// only ever sees the sending half, so a slow socket shows up as backpressure
/// instead of blocking emitters.
pub struct WsPushSession {
    bus: Arc<NotificationBus>,
    settings: StreamSettings,
    /// Taken when the actor starts and registers with the bus.
    connection: Option<Connection>,
    connection_id: ConnectionId,
    last_seen: Instant,
    ping_sent: Option<Instant>,
}

impl WsPushSession {
    /// Creates a new `WsPushSession` actor.
    ///
    /// # Arguments
    ///
    /// * `bus` - The notification bus the connection registers with.
    /// * `connection` - The connection record built from the caller's identity.
    /// * `settings` - Heartbeat, liveness and writer buffer settings.
    ///
    /// # Returns
    ///
    /// A new instance of `WsPushSession`.
    pub fn new(bus: Arc<NotificationBus>, connection: Connection, settings: StreamSettings) -> Self {
        Self {
            bus,
            settings,
            connection_id: connection.connection_id,
            connection: Some(connection),
            last_seen: Instant::now(),
            ping_sent: None,
        }
    }

    fn alive(&mut self) {
        self.last_seen = Instant::now();
        // The sweep may already have dropped us; the socket closes on the next tick.
        if let Err(e) = self.bus.heartbeat(self.connection_id) {
            debug!(connection_id = %self.connection_id, "heartbeat ignored: {}", e);
        }
    }

    fn on_client_message(&mut self, text: &str, ctx: &mut ws::WebsocketContext<Self>) {
        match serde_json::from_str::<ClientMessage>(text) {
            Ok(ClientMessage::Ack(ack)) => {
                let ack = ack.into_acknowledgment(self.connection_id);
                if let Err(e) = self.bus.acknowledge(&ack) {
                    warn!(connection_id = %self.connection_id, "acknowledgment rejected: {}", e);
                }
            }
            Ok(ClientMessage::Heartbeat { sent_at }) => match PushFrame::pong(sent_at).to_line() {
                Ok(line) => ctx.text(line),
                Err(e) => warn!("failed to encode pong: {}", e),
            },
            Err(e) => {
                debug!(connection_id = %self.connection_id, "unreadable client message: {}", e);
            }
        }
    }
}

/// Moves frames from a connection's writer channel to the socket actor.
///
/// Each line is awaited until the actor has handled it, so a socket that stops
/// draining leaves the channel full and the bus sees backpressure. Returns once
/// the channel closes or the actor stops.
pub async fn forward_lines(mut lines: mpsc::Receiver<Arc<str>>, writer: Recipient<PushLine>) {
    while let Some(line) = lines.recv().await {
        if writer.send(PushLine(line)).await.is_err() {
            break;
        }
    }
}

impl Actor for WsPushSession {
    type Context = ws::WebsocketContext<Self>;

    /// Registers the connection and starts the writer forwarder and the ping loop.
    fn started(&mut self, ctx: &mut Self::Context) {
        let Some(connection) = self.connection.take() else {
            ctx.stop();
            return;
        };
        let (sink, mut lines) = channel(self.settings.writer_buffer);
        self.bus.connect(connection, Arc::new(sink));
        info!(connection_id = %self.connection_id, "push stream started");

        actix_web::rt::spawn(forward_lines(lines, ctx.address().recipient()));

        ctx.run_interval(self.settings.heartbeat_interval, |session, ctx| {
            if session.last_seen.elapsed() > session.settings.liveness_timeout {
                warn!(connection_id = %session.connection_id, "push stream missed its heartbeats");
                ctx.stop();
                return;
            }
            session.ping_sent = Some(Instant::now());
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        self.bus.disconnect(self.connection_id);
        info!(connection_id = %self.connection_id, "push stream stopped");
    }
}

impl Handler<PushLine> for WsPushSession {
    type Result = ();

    fn handle(&mut self, msg: PushLine, ctx: &mut Self::Context) {
        ctx.text(msg.0.as_ref());
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for WsPushSession {
    /// Processes frames sent by the station.
    ///
    /// Pings are answered and pongs complete a round trip measurement. Text
    /// frames carry acknowledgments and application heartbeats. Every frame
    /// counts as a liveness signal.
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => {
                warn!(connection_id = %self.connection_id, "protocol error: {}", e);
                ctx.stop();
                return;
            }
        };
        self.alive();
        match msg {
            ws::Message::Ping(bytes) => ctx.pong(&bytes),
            ws::Message::Pong(_) => {
                if let Some(sent) = self.ping_sent.take() {
                    self.bus.record_round_trip(self.connection_id, sent.elapsed());
                }
            }
            ws::Message::Text(text) => self.on_client_message(&text, ctx),
            ws::Message::Close(reason) => {
                ctx.close(reason);
                ctx.stop();
            }
            _ => (),
        }
    }
}

/// Upgrades the request to the station's push stream.
///
/// # Arguments
///
/// * `req` - The incoming HTTP request.
/// * `stream` - The payload stream of the HTTP request.
/// * `identity` - The station identity taken from the forwarded headers.
/// * `state` - Shared API state containing the notification bus.
///
/// # Returns
///
/// A `Result<HttpResponse, BusError>` where `Ok` indicates a successful upgrade to WebSocket.
#[get("/events/stream")]
pub async fn push_stream(
    req: HttpRequest,
    stream: web::Payload,
    identity: StationIdentity,
    state: Data<Arc<ApiState>>,
) -> Result<HttpResponse, BusError> {
    let session = WsPushSession::new(
        state.bus.clone(),
        identity.into_connection(),
        state.stream.clone(),
    );
    ws::start(session, &req, stream).map_err(|e| BusError::ApiError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ports::sink::{PushSink, SinkError};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Stands in for a socket that only writes when the gate lets it.
    struct GatedWriter {
        gate: Arc<Semaphore>,
        written: Arc<AtomicUsize>,
    }

    impl Actor for GatedWriter {
        type Context = Context<Self>;
    }

    impl Handler<PushLine> for GatedWriter {
        type Result = ResponseFuture<()>;

        fn handle(&mut self, _msg: PushLine, _ctx: &mut Self::Context) -> Self::Result {
            let gate = self.gate.clone();
            let written = self.written.clone();
            Box::pin(async move {
                if let Ok(permit) = gate.acquire().await {
                    permit.forget();
                }
                written.fetch_add(1, Ordering::SeqCst);
            })
        }
    }

    #[actix_web::test]
    async fn test_stalled_socket_backs_up_the_writer_channel() {
        let (sink, lines) = channel(2);
        let gate = Arc::new(Semaphore::new(0));
        let written = Arc::new(AtomicUsize::new(0));
        let writer = GatedWriter {
            gate: gate.clone(),
            written: written.clone(),
        }
        .start();
        actix_web::rt::spawn(forward_lines(lines, writer.clone().recipient()));

        let mut accepted = 0;
        let mut refused = None;
        for _ in 0..10 {
            match sink.push(Arc::from("{}\n")) {
                Ok(()) => accepted += 1,
                Err(e) => {
                    refused = Some(e);
                    break;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(refused, Some(SinkError::Full));
        assert!(accepted <= 3);

        gate.add_permits(accepted);
        for _ in 0..100 {
            if written.load(Ordering::SeqCst) == accepted {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(written.load(Ordering::SeqCst), accepted);
        assert_eq!(sink.push(Arc::from("{}\n")), Ok(()));
    }
}
