use crate::clock::ClockSync;
use crate::config::{ClientArgs, ClientConfig};
use crate::connection::{ConnectionManager, ConnectionStatus};
use crate::engine::ReconcileEngine;
use crate::error::EngineError;
use crate::gateway::RequestGateway;
use crate::protocol::{CommandKind, InboundEvent};
use crate::round::RoundSnapshot;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Settled wager response, echoed by the server after acceptance.
#[derive(Debug, Clone, PartialEq)]
pub struct WagerReceipt {
    pub round_number: u64,
    pub amount: Option<f64>,
    pub total_wagered: Option<f64>,
    pub total_players: Option<u32>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CashOutReceipt {
    pub round_number: u64,
    pub multiplier: Option<f64>,
    pub payout: Option<f64>,
}

/// Top-level handle over the whole client: owns the background connection
/// task and exposes read views plus the correlated game commands. All
/// game-rule preconditions are checked here, synchronously, before a
/// command ever reaches the wire.
pub struct CrashClient {
    config: ClientConfig,
    clock: Arc<ClockSync>,
    engine: Arc<ReconcileEngine>,
    gateway: Arc<RequestGateway>,
    status_rx: watch::Receiver<ConnectionStatus>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl CrashClient {
    /// Validates the arguments and spawns the connection task. Returns
    /// immediately; connectivity progress is observable through
    /// [`subscribe_connection`](Self::subscribe_connection).
    pub fn connect(args: ClientArgs) -> Result<Self, EngineError> {
        let config = args.normalize()?;

        let clock = Arc::new(ClockSync::new());
        let engine = Arc::new(ReconcileEngine::new(Arc::clone(&clock)));
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let gateway = Arc::new(RequestGateway::new(command_tx));
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::idle());
        let cancel = CancellationToken::new();

        let manager = ConnectionManager::new(
            config.clone(),
            Arc::clone(&engine),
            Arc::clone(&gateway),
            status_tx,
            command_rx,
            cancel.clone(),
        );
        let task = tokio::spawn(manager.run());

        Ok(Self {
            config,
            clock,
            engine,
            gateway,
            status_rx,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    /// Cancels the connection task and waits for it to exit. Safe to call
    /// more than once.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(error) = task.await {
                tracing::warn!(%error, "connection task did not shut down cleanly");
            }
        }
    }

    pub fn snapshot(&self) -> Option<Arc<RoundSnapshot>> {
        self.engine.snapshot()
    }

    pub fn subscribe_rounds(&self) -> watch::Receiver<Option<Arc<RoundSnapshot>>> {
        self.engine.subscribe()
    }

    pub fn history(&self) -> Vec<Arc<RoundSnapshot>> {
        self.engine.history()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.status_rx.borrow().clone()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Server-corrected wall clock, suitable for rendering countdowns
    /// against server deadlines.
    pub fn server_now_ms(&self) -> i64 {
        self.clock.now_ms()
    }

    pub fn clock_offset_ms(&self) -> i64 {
        self.clock.offset_ms()
    }

    /// Whether a wager placed right now would pass the client-side gate.
    pub fn can_bet(&self) -> bool {
        self.status_rx.borrow().is_connected()
            && self.snapshot().map(|snapshot| snapshot.can_bet).unwrap_or(false)
    }

    /// Places a wager on the current round. Rejects synchronously, before
    /// emitting anything, when the amount is not a positive finite number,
    /// the client is offline, or the betting window is closed.
    pub async fn place_wager(&self, amount: f64) -> Result<WagerReceipt, EngineError> {
        check_wager_preconditions(
            amount,
            self.status_rx.borrow().is_connected(),
            self.snapshot().as_deref(),
        )?;

        let kind = CommandKind::PlaceWager {
            player_address: self.config.player_address.clone(),
            amount,
        };
        let response = self
            .gateway
            .request(
                kind,
                Duration::from_millis(self.config.wager_timeout_ms),
                Some(&self.cancel),
            )
            .await?;

        match response {
            InboundEvent::WagerAccepted(wire) => Ok(WagerReceipt {
                round_number: wire.round_number,
                amount: wire.amount,
                total_wagered: wire.total_wagered,
                total_players: wire.total_players,
            }),
            other => Err(unexpected_response(&other)),
        }
    }

    /// Cashes out of the current round. The server is the authority on
    /// whether the cash-out lands before the crash; the client only
    /// requires an open connection.
    pub async fn cash_out(&self) -> Result<CashOutReceipt, EngineError> {
        if !self.status_rx.borrow().is_connected() {
            return Err(EngineError::NotConnected);
        }

        let kind = CommandKind::CashOut {
            player_address: self.config.player_address.clone(),
        };
        let response = self
            .gateway
            .request(
                kind,
                Duration::from_millis(self.config.wager_timeout_ms),
                Some(&self.cancel),
            )
            .await?;

        match response {
            InboundEvent::PlayerCashedOut(wire) => Ok(CashOutReceipt {
                round_number: wire.round_number,
                multiplier: wire.multiplier,
                payout: wire.payout,
            }),
            other => Err(unexpected_response(&other)),
        }
    }

    pub async fn query_balance(&self) -> Result<f64, EngineError> {
        if !self.status_rx.borrow().is_connected() {
            return Err(EngineError::NotConnected);
        }

        let kind = CommandKind::QueryBalance {
            player_address: self.config.player_address.clone(),
        };
        let response = self
            .gateway
            .request(
                kind,
                Duration::from_millis(self.config.balance_timeout_ms),
                Some(&self.cancel),
            )
            .await?;

        match response {
            InboundEvent::BalanceUpdate(wire) => Ok(wire.balance),
            other => Err(unexpected_response(&other)),
        }
    }

    /// Explicitly asks the server for a fresh canonical snapshot. The
    /// connection task already does this on connect, on heartbeat, and on
    /// round mismatch; this is for callers who want it on demand.
    pub async fn request_resync(&self) -> Result<(), EngineError> {
        let response = self
            .gateway
            .request(
                CommandKind::RequestResync,
                Duration::from_millis(self.config.balance_timeout_ms),
                Some(&self.cancel),
            )
            .await?;
        match response {
            InboundEvent::RoundResync(_) => Ok(()),
            other => Err(unexpected_response(&other)),
        }
    }
}

fn unexpected_response(event: &InboundEvent) -> EngineError {
    EngineError::InvalidArgument(format!(
        "unexpected {} response for correlated command",
        event.name()
    ))
}

/// The wager gate, kept free of the async plumbing so it can be tested
/// exhaustively.
fn check_wager_preconditions(
    amount: f64,
    connected: bool,
    snapshot: Option<&RoundSnapshot>,
) -> Result<(), EngineError> {
    if !amount.is_finite() || amount <= 0.0 {
        return Err(EngineError::InvalidArgument(
            "wager amount must be a positive finite number".to_string(),
        ));
    }
    if !connected {
        return Err(EngineError::NotConnected);
    }
    match snapshot {
        Some(snapshot) if snapshot.can_bet => Ok(()),
        _ => Err(EngineError::BetsLocked),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::round::{LiquiditySnapshot, RoundStatus};

    fn bettable_round() -> RoundSnapshot {
        RoundSnapshot {
            round_id: "r-42".to_string(),
            round_number: 42,
            multiplier: 1.0,
            status: RoundStatus::Waiting,
            total_wagered: 0.0,
            total_players: 0,
            liquidity: LiquiditySnapshot::default(),
            countdown_ms: 8_000,
            can_bet: true,
            server_timestamp: 1_700_000_000_000,
            started_at: None,
        }
    }

    #[test]
    fn accepts_valid_wager_inputs() {
        let round = bettable_round();
        assert!(check_wager_preconditions(10.0, true, Some(&round)).is_ok());
    }

    #[test]
    fn rejects_bad_amounts_before_anything_else() {
        let round = bettable_round();
        for amount in [0.0, -5.0, f64::NAN, f64::INFINITY] {
            let result = check_wager_preconditions(amount, true, Some(&round));
            assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
        }
        // amount is checked even while offline
        assert!(matches!(
            check_wager_preconditions(-1.0, false, None),
            Err(EngineError::InvalidArgument(_))
        ));
    }

    #[test]
    fn rejects_wager_while_offline() {
        let round = bettable_round();
        assert!(matches!(
            check_wager_preconditions(10.0, false, Some(&round)),
            Err(EngineError::NotConnected)
        ));
    }

    #[test]
    fn rejects_wager_when_window_closed() {
        let mut locked = bettable_round();
        locked.countdown_ms = 1_000;
        locked.can_bet = false;
        assert!(matches!(
            check_wager_preconditions(10.0, true, Some(&locked)),
            Err(EngineError::BetsLocked)
        ));
        assert!(matches!(
            check_wager_preconditions(10.0, true, None),
            Err(EngineError::BetsLocked)
        ));
    }

    #[tokio::test]
    async fn connect_rejects_invalid_arguments_synchronously() {
        let result = CrashClient::connect(ClientArgs::default());
        assert!(matches!(result, Err(EngineError::InvalidArgument(_))));
    }

    #[tokio::test]
    async fn shutdown_is_idempotent() {
        let client = CrashClient::connect(ClientArgs {
            ws_url: Some("wss://game.example.com/ws".to_string()),
            rest_url: Some("https://game.example.com".to_string()),
            player_address: Some("0xabc".to_string()),
            ..ClientArgs::default()
        })
        .expect("valid arguments");

        client.shutdown().await;
        client.shutdown().await;
        assert!(!client.can_bet());
    }
}
