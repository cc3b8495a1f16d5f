use crate::config::ClientConfig;
use crate::engine::ReconcileEngine;
use crate::error::EngineError;
use crate::gateway::RequestGateway;
use crate::protocol::{decode_inbound, CommandKind, OutboundCommand};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async_with_config, MaybeTlsStream, WebSocketStream};
use futures_util::{SinkExt, StreamExt};
use tokio_util::sync::CancellationToken;

const RECONNECT_BASE_DELAY_MS: u64 = 200;
const RECONNECT_MAX_DELAY_MS: u64 = 5_000;
const RESYNC_MIN_SPACING_MS: u64 = 1_000;
const STATUS_ERROR_THROTTLE_MS: u64 = 500;
const POLL_UPGRADE_EVERY: u32 = 10;

pub type RoundWsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    Realtime,
    Polling,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    DegradedPolling,
    Stopped,
}

/// Read view of transport health. Mutated only by the connection task;
/// everyone else observes it through a `watch` channel. Connection errors
/// are reported here, never thrown.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionStatus {
    pub phase: ConnectionPhase,
    pub transport: TransportMode,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

impl ConnectionStatus {
    pub fn idle() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            transport: TransportMode::Realtime,
            consecutive_failures: 0,
            last_error: None,
        }
    }

    /// Commands can be emitted in both the realtime and the degraded
    /// polling mode; only the phases in between count as offline.
    pub fn is_connected(&self) -> bool {
        matches!(
            self.phase,
            ConnectionPhase::Connected | ConnectionPhase::DegradedPolling
        )
    }
}

enum StreamDirective {
    Continue,
    RequestResync,
    Reconnect(String),
    ServerClosed(String),
    Cancelled,
}

enum PollExit {
    Cancelled,
    RetrySocket,
}

enum StreamPump {
    Cancelled,
    Heartbeat,
    Command(Option<OutboundCommand>),
    Frame(Option<Result<Message, tokio_tungstenite::tungstenite::Error>>),
}

enum PollPump {
    Cancelled,
    Command(Option<OutboundCommand>),
    Tick,
}

/// Owns the transport lifecycle: connect, dispatch, classify failures,
/// reconnect with capped backoff, downgrade to HTTP polling after repeated
/// failures, heartbeat resyncs while connected.
pub struct ConnectionManager {
    config: ClientConfig,
    engine: Arc<ReconcileEngine>,
    gateway: Arc<RequestGateway>,
    http_client: reqwest::Client,
    status_tx: watch::Sender<ConnectionStatus>,
    command_rx: mpsc::UnboundedReceiver<OutboundCommand>,
    cancel: CancellationToken,
    status_throttle: StatusPublishThrottle,
    resync_throttle: ResyncThrottle,
}

impl ConnectionManager {
    pub fn new(
        config: ClientConfig,
        engine: Arc<ReconcileEngine>,
        gateway: Arc<RequestGateway>,
        status_tx: watch::Sender<ConnectionStatus>,
        command_rx: mpsc::UnboundedReceiver<OutboundCommand>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            engine,
            gateway,
            http_client: reqwest::Client::new(),
            status_tx,
            command_rx,
            cancel,
            status_throttle: StatusPublishThrottle::default(),
            resync_throttle: ResyncThrottle::default(),
        }
    }

    pub async fn run(mut self) {
        let mut consecutive_failures = 0_u32;
        let mut reconnect_attempt = 0_u32;

        while !self.cancel.is_cancelled() {
            let phase = if reconnect_attempt == 0 {
                ConnectionPhase::Connecting
            } else {
                ConnectionPhase::Reconnecting
            };
            self.publish(phase, TransportMode::Realtime, consecutive_failures, None);

            let connect_result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = connect_round_stream(&self.config.ws_url) => result,
            };
            match connect_result {
                Ok(stream) => {
                    consecutive_failures = 0;
                    reconnect_attempt = 0;
                    self.publish(ConnectionPhase::Connected, TransportMode::Realtime, 0, None);

                    match self.drive_stream(stream).await {
                        StreamDirective::Cancelled => break,
                        StreamDirective::ServerClosed(reason) => {
                            // Server asked us to go away; retrying is not
                            // assumed safe, the caller decides what next.
                            tracing::warn!(reason = %reason, "server closed the connection");
                            self.publish(
                                ConnectionPhase::Stopped,
                                TransportMode::Realtime,
                                consecutive_failures,
                                Some(EngineError::ServerClosed(reason).to_string()),
                            );
                            return;
                        }
                        StreamDirective::Reconnect(reason) => {
                            self.publish_throttled(
                                ConnectionPhase::Reconnecting,
                                TransportMode::Realtime,
                                consecutive_failures,
                                Some(reason),
                            );
                        }
                        StreamDirective::Continue | StreamDirective::RequestResync => {}
                    }
                }
                Err(error) => {
                    consecutive_failures = consecutive_failures.saturating_add(1);
                    self.publish_throttled(
                        ConnectionPhase::Reconnecting,
                        TransportMode::Realtime,
                        consecutive_failures,
                        Some(format!("websocket connect error: {error}")),
                    );

                    if consecutive_failures >= self.config.max_consecutive_failures {
                        tracing::warn!(
                            consecutive_failures,
                            "downgrading transport to polling fallback"
                        );
                        match self.run_polling().await {
                            PollExit::Cancelled => break,
                            PollExit::RetrySocket => {
                                consecutive_failures = 0;
                                reconnect_attempt = 0;
                                continue;
                            }
                        }
                    }
                }
            }

            if self.cancel.is_cancelled() {
                break;
            }

            reconnect_attempt = reconnect_attempt.saturating_add(1);
            let delay = reconnect_delay(reconnect_attempt);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.publish(
            ConnectionPhase::Stopped,
            TransportMode::Realtime,
            0,
            None,
        );
    }

    /// Pumps one live socket until it fails, the server closes it, or the
    /// client shuts down.
    async fn drive_stream(&mut self, mut stream: RoundWsStream) -> StreamDirective {
        // A fresh connection is never trusted to be caught up via replay.
        if let Some(directive) = self.send_command(&mut stream, resync_command()).await {
            return directive;
        }

        let heartbeat_period = Duration::from_millis(self.config.heartbeat_interval_ms);
        let mut heartbeat =
            tokio::time::interval_at(tokio::time::Instant::now() + heartbeat_period, heartbeat_period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            // The select only picks the ready input; every borrow it holds
            // is released before the handling below runs.
            let pumped = tokio::select! {
                _ = self.cancel.cancelled() => StreamPump::Cancelled,
                _ = heartbeat.tick() => StreamPump::Heartbeat,
                command = self.command_rx.recv() => StreamPump::Command(command),
                frame = stream.next() => StreamPump::Frame(frame),
            };

            match pumped {
                StreamPump::Cancelled => return StreamDirective::Cancelled,
                StreamPump::Heartbeat => {
                    // Self-healing against silently missed messages; the
                    // resync response is idempotent to apply.
                    if let Some(directive) = self.send_command(&mut stream, resync_command()).await
                    {
                        return directive;
                    }
                }
                StreamPump::Command(command) => {
                    let Some(command) = command else {
                        return StreamDirective::Cancelled;
                    };
                    if let Some(directive) = self.send_command(&mut stream, command).await {
                        return directive;
                    }
                }
                StreamPump::Frame(frame) => {
                    let Some(frame) = frame else {
                        return StreamDirective::Reconnect("websocket stream ended".to_string());
                    };
                    match frame {
                        Ok(message) => match self.handle_message(message) {
                            StreamDirective::Continue => {}
                            StreamDirective::RequestResync => {
                                if self.resync_throttle.allow(Instant::now()) {
                                    if let Some(directive) =
                                        self.send_command(&mut stream, resync_command()).await
                                    {
                                        return directive;
                                    }
                                }
                            }
                            directive => return directive,
                        },
                        Err(error) => {
                            return StreamDirective::Reconnect(format!(
                                "websocket frame error: {error}"
                            ));
                        }
                    }
                }
            }
        }
    }

    fn handle_message(&self, message: Message) -> StreamDirective {
        match message {
            Message::Text(text_payload) => self.handle_payload(text_payload.into_bytes()),
            Message::Binary(binary_payload) => self.handle_payload(binary_payload),
            Message::Close(frame) => match classify_close(frame) {
                CloseKind::ServerInitiated(reason) => StreamDirective::ServerClosed(reason),
                CloseKind::Transient(reason) => StreamDirective::Reconnect(reason),
            },
            _ => StreamDirective::Continue,
        }
    }

    /// Decode, settle any pending correlation, reconcile. Malformed
    /// payloads are dropped with a warning; they never corrupt the
    /// snapshot or tear down the connection.
    fn handle_payload(&self, mut payload: Vec<u8>) -> StreamDirective {
        let event = match decode_inbound(payload.as_mut_slice()) {
            Ok(event) => event,
            Err(error) => {
                tracing::warn!(%error, "dropping undecodable payload");
                return StreamDirective::Continue;
            }
        };

        self.gateway.resolve(&event);
        if self.engine.apply(&event).needs_resync() {
            StreamDirective::RequestResync
        } else {
            StreamDirective::Continue
        }
    }

    async fn send_command(
        &self,
        stream: &mut RoundWsStream,
        command: OutboundCommand,
    ) -> Option<StreamDirective> {
        let text = match command.encode() {
            Ok(text) => text,
            Err(error) => {
                tracing::warn!(%error, "failed to encode outbound command");
                return None;
            }
        };
        match stream.send(Message::Text(text)).await {
            Ok(()) => None,
            Err(error) => Some(StreamDirective::Reconnect(format!(
                "websocket send error: {error}"
            ))),
        }
    }

    /// Degraded mode: poll the full round state over HTTP and POST
    /// outbound commands, feeding both through the same dispatch path as
    /// the socket. Periodically hands control back to retry the socket.
    async fn run_polling(&mut self) -> PollExit {
        self.publish(
            ConnectionPhase::DegradedPolling,
            TransportMode::Polling,
            self.config.max_consecutive_failures,
            Some("transport downgraded to polling".to_string()),
        );

        let mut ticker =
            tokio::time::interval(Duration::from_millis(self.config.poll_interval_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut polls = 0_u32;

        loop {
            let pumped = tokio::select! {
                _ = self.cancel.cancelled() => PollPump::Cancelled,
                command = self.command_rx.recv() => PollPump::Command(command),
                _ = ticker.tick() => PollPump::Tick,
            };

            match pumped {
                PollPump::Cancelled => return PollExit::Cancelled,
                PollPump::Command(command) => {
                    let Some(command) = command else {
                        return PollExit::Cancelled;
                    };
                    if let Err(error) = self.post_command(command).await {
                        self.publish_throttled(
                            ConnectionPhase::DegradedPolling,
                            TransportMode::Polling,
                            self.config.max_consecutive_failures,
                            Some(format!("command post failed: {error}")),
                        );
                    }
                }
                PollPump::Tick => {
                    match self.fetch_round_state().await {
                        Ok(payload) => {
                            let _ = self.handle_payload(payload);
                        }
                        Err(error) => {
                            self.publish_throttled(
                                ConnectionPhase::DegradedPolling,
                                TransportMode::Polling,
                                self.config.max_consecutive_failures,
                                Some(format!("poll failed: {error}")),
                            );
                        }
                    }
                    polls = polls.saturating_add(1);
                    if polls % POLL_UPGRADE_EVERY == 0 {
                        return PollExit::RetrySocket;
                    }
                }
            }
        }
    }

    async fn fetch_round_state(&self) -> Result<Vec<u8>, EngineError> {
        let endpoint = round_state_endpoint(&self.config.rest_url);
        let response = self
            .http_client
            .get(endpoint)
            .send()
            .await?
            .error_for_status()?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn post_command(&self, command: OutboundCommand) -> Result<(), EngineError> {
        let endpoint = command_endpoint(&self.config.rest_url);
        let body = command.encode()?;
        let response = self
            .http_client
            .post(endpoint)
            .header("content-type", "application/json")
            .body(body)
            .send()
            .await?
            .error_for_status()?;
        // The HTTP reply body is the response event; route it through the
        // same dispatch path so pending correlations settle identically.
        let payload = response.bytes().await?.to_vec();
        if !payload.is_empty() {
            let _ = self.handle_payload(payload);
        }
        Ok(())
    }

    fn publish(
        &self,
        phase: ConnectionPhase,
        transport: TransportMode,
        consecutive_failures: u32,
        last_error: Option<String>,
    ) {
        self.status_tx.send_replace(ConnectionStatus {
            phase,
            transport,
            consecutive_failures,
            last_error,
        });
    }

    fn publish_throttled(
        &mut self,
        phase: ConnectionPhase,
        transport: TransportMode,
        consecutive_failures: u32,
        last_error: Option<String>,
    ) {
        if !self
            .status_throttle
            .allow(Instant::now(), phase, &last_error)
        {
            return;
        }
        self.publish(phase, transport, consecutive_failures, last_error);
    }
}

fn resync_command() -> OutboundCommand {
    // id 0 is reserved for fire-and-forget resyncs that bypass the gateway
    OutboundCommand {
        command_id: 0,
        kind: CommandKind::RequestResync,
    }
}

enum CloseKind {
    ServerInitiated(String),
    Transient(String),
}

/// Normal and policy close codes mean the server wants us gone; anything
/// else (restart, abnormal, protocol trouble) is worth retrying.
fn classify_close(frame: Option<CloseFrame<'_>>) -> CloseKind {
    match frame {
        Some(frame) => {
            let reason = if frame.reason.is_empty() {
                format!("close code {}", u16::from(frame.code))
            } else {
                frame.reason.to_string()
            };
            match frame.code {
                CloseCode::Normal | CloseCode::Policy => CloseKind::ServerInitiated(reason),
                _ => CloseKind::Transient(reason),
            }
        }
        None => CloseKind::Transient("connection closed without a close frame".to_string()),
    }
}

async fn connect_round_stream(ws_url: &str) -> Result<RoundWsStream, EngineError> {
    let ws_config = WebSocketConfig {
        max_message_size: Some(16 << 20),
        max_frame_size: Some(4 << 20),
        ..Default::default()
    };
    let (stream, _) = connect_async_with_config(ws_url, Some(ws_config), true).await?;
    Ok(stream)
}

fn round_state_endpoint(rest_url: &str) -> String {
    format!("{}/v1/rounds/current", rest_url.trim_end_matches('/'))
}

fn command_endpoint(rest_url: &str) -> String {
    format!("{}/v1/commands", rest_url.trim_end_matches('/'))
}

fn reconnect_delay(attempt: u32) -> Duration {
    let exponent = attempt.min(6);
    let base_ms = RECONNECT_BASE_DELAY_MS.saturating_mul(1_u64 << exponent);
    let jitter_ms = crate::clock::local_unix_ms().unsigned_abs() % 250;
    Duration::from_millis((base_ms + jitter_ms).min(RECONNECT_MAX_DELAY_MS))
}

/// Collapses repeated identical error publishes so a tight reconnect loop
/// does not flood observers.
#[derive(Debug, Default)]
struct StatusPublishThrottle {
    last_phase: Option<ConnectionPhase>,
    last_error: Option<String>,
    last_emit: Option<Instant>,
}

impl StatusPublishThrottle {
    fn allow(&mut self, now: Instant, phase: ConnectionPhase, error: &Option<String>) -> bool {
        let should_throttle = matches!(
            phase,
            ConnectionPhase::Reconnecting | ConnectionPhase::DegradedPolling
        );

        if should_throttle
            && self.last_phase == Some(phase)
            && self.last_error == *error
            && self
                .last_emit
                .map(|at| now.duration_since(at) < Duration::from_millis(STATUS_ERROR_THROTTLE_MS))
                .unwrap_or(false)
        {
            return false;
        }

        self.last_phase = Some(phase);
        self.last_error = error.clone();
        self.last_emit = Some(now);
        true
    }
}

/// A burst of stale events must not turn into a burst of resync commands.
#[derive(Debug, Default)]
struct ResyncThrottle {
    last_request: Option<Instant>,
}

impl ResyncThrottle {
    fn allow(&mut self, now: Instant) -> bool {
        if let Some(last) = self.last_request {
            if now.duration_since(last) < Duration::from_millis(RESYNC_MIN_SPACING_MS) {
                return false;
            }
        }
        self.last_request = Some(now);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockSync;
    use crate::config::ClientArgs;
    use crate::round::RoundStatus;

    fn manager() -> (ConnectionManager, watch::Receiver<ConnectionStatus>) {
        let config = ClientArgs {
            ws_url: Some("wss://game.example.com/ws".to_string()),
            rest_url: Some("https://game.example.com".to_string()),
            player_address: Some("0xabc".to_string()),
            ..ClientArgs::default()
        }
        .normalize()
        .expect("test config should be valid");

        let clock = Arc::new(ClockSync::new());
        let engine = Arc::new(ReconcileEngine::new(clock));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let gateway = Arc::new(RequestGateway::new(command_tx));
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::idle());
        let manager = ConnectionManager::new(
            config,
            engine,
            gateway,
            status_tx,
            command_rx,
            CancellationToken::new(),
        );
        (manager, status_rx)
    }

    #[test]
    fn well_formed_payload_reaches_the_engine() {
        let (manager, _status_rx) = manager();
        let payload = br#"{"event":"full_round_state","data":{"roundId":"r-42","roundNumber":42,"multiplier":1.2,"status":"active","serverTimestamp":1700000000000}}"#.to_vec();

        assert!(matches!(
            manager.handle_payload(payload),
            StreamDirective::Continue
        ));
        let snapshot = manager.engine.snapshot().expect("engine adopted the round");
        assert_eq!(snapshot.round_number, 42);
        assert_eq!(snapshot.status, RoundStatus::Active);
    }

    #[test]
    fn stale_round_payload_asks_for_resync() {
        let (manager, _status_rx) = manager();
        let seed = br#"{"event":"full_round_state","data":{"roundId":"r-42","roundNumber":42,"status":"active"}}"#.to_vec();
        let _ = manager.handle_payload(seed);

        let stale = br#"{"event":"multiplier_tick","data":{"roundNumber":41,"multiplier":2.0}}"#
            .to_vec();
        assert!(matches!(
            manager.handle_payload(stale),
            StreamDirective::RequestResync
        ));
    }

    #[test]
    fn malformed_payload_is_dropped_quietly() {
        let (manager, _status_rx) = manager();
        let garbage = b"not json at all".to_vec();
        assert!(matches!(
            manager.handle_payload(garbage),
            StreamDirective::Continue
        ));
        assert!(manager.engine.snapshot().is_none());
    }

    #[test]
    fn classifies_server_initiated_closes() {
        let normal = classify_close(Some(CloseFrame {
            code: CloseCode::Normal,
            reason: "maintenance".into(),
        }));
        assert!(matches!(normal, CloseKind::ServerInitiated(reason) if reason == "maintenance"));

        let policy = classify_close(Some(CloseFrame {
            code: CloseCode::Policy,
            reason: "".into(),
        }));
        assert!(matches!(policy, CloseKind::ServerInitiated(_)));
    }

    #[test]
    fn classifies_transient_closes() {
        let abnormal = classify_close(Some(CloseFrame {
            code: CloseCode::Restart,
            reason: "rolling deploy".into(),
        }));
        assert!(matches!(abnormal, CloseKind::Transient(_)));
        assert!(matches!(classify_close(None), CloseKind::Transient(_)));
    }

    #[test]
    fn reconnect_delay_is_capped() {
        for attempt in 1..32 {
            assert!(reconnect_delay(attempt) <= Duration::from_millis(RECONNECT_MAX_DELAY_MS));
        }
        assert!(reconnect_delay(1) >= Duration::from_millis(RECONNECT_BASE_DELAY_MS));
    }

    #[test]
    fn status_throttle_collapses_identical_errors() {
        let mut throttle = StatusPublishThrottle::default();
        let now = Instant::now();
        let error = Some("websocket connect error: refused".to_string());

        assert!(throttle.allow(now, ConnectionPhase::Reconnecting, &error));
        assert!(!throttle.allow(
            now + Duration::from_millis(100),
            ConnectionPhase::Reconnecting,
            &error
        ));
        assert!(throttle.allow(
            now + Duration::from_millis(600),
            ConnectionPhase::Reconnecting,
            &error
        ));
        // connected-state publishes are never throttled
        assert!(throttle.allow(
            now + Duration::from_millis(601),
            ConnectionPhase::Connected,
            &None
        ));
    }

    #[test]
    fn resync_throttle_spaces_requests() {
        let mut throttle = ResyncThrottle::default();
        let now = Instant::now();
        assert!(throttle.allow(now));
        assert!(!throttle.allow(now + Duration::from_millis(500)));
        assert!(throttle.allow(now + Duration::from_millis(1_100)));
    }

    #[test]
    fn endpoints_are_rooted_at_the_rest_url() {
        assert_eq!(
            round_state_endpoint("https://game.example.com/"),
            "https://game.example.com/v1/rounds/current"
        );
        assert_eq!(
            command_endpoint("https://game.example.com"),
            "https://game.example.com/v1/commands"
        );
    }

    #[test]
    fn idle_status_is_not_connected() {
        assert!(!ConnectionStatus::idle().is_connected());
        let degraded = ConnectionStatus {
            phase: ConnectionPhase::DegradedPolling,
            transport: TransportMode::Polling,
            consecutive_failures: 5,
            last_error: None,
        };
        assert!(degraded.is_connected());
    }
}
