use crate::error::EngineError;
use crate::protocol::{CommandKind, InboundEvent, OutboundCommand};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// One in-flight correlated command. Created when the command is emitted,
/// destroyed by exactly one of {matching response, timeout, abort}; never
/// leaves the gateway.
struct PendingCorrelation {
    response_event: &'static str,
    created_at: Instant,
    resolve_tx: oneshot::Sender<InboundEvent>,
}

/// Turns fire-and-forget transport commands into awaitable exactly-once
/// operations. A pending entry is removed from the table under the lock by
/// whichever settlement path wins, so the losing path finds nothing and
/// becomes a no-op — a late response can never settle a request twice or
/// leak a listener.
pub struct RequestGateway {
    next_command_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingCorrelation>>,
    command_tx: mpsc::UnboundedSender<OutboundCommand>,
}

impl RequestGateway {
    pub fn new(command_tx: mpsc::UnboundedSender<OutboundCommand>) -> Self {
        Self {
            next_command_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            command_tx,
        }
    }

    /// Emits `kind` and awaits its response, racing the correlation against
    /// `timeout` and the optional caller abort. Game-rule preconditions are
    /// the caller's job; this layer only correlates and times.
    pub async fn request(
        &self,
        kind: CommandKind,
        timeout: Duration,
        abort: Option<&CancellationToken>,
    ) -> Result<InboundEvent, EngineError> {
        let command_id = self.next_command_id.fetch_add(1, Ordering::Relaxed);
        let (resolve_tx, resolve_rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock();
            pending.insert(
                command_id,
                PendingCorrelation {
                    response_event: kind.response_event(),
                    created_at: Instant::now(),
                    resolve_tx,
                },
            );
        }

        let command = OutboundCommand { command_id, kind };
        if self.command_tx.send(command).is_err() {
            self.pending.lock().remove(&command_id);
            return Err(EngineError::NotConnected);
        }

        let aborted = async {
            match abort {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            response = resolve_rx => match response {
                Ok(event) => Ok(event),
                // The gateway was dropped mid-flight (client shutdown).
                Err(_) => Err(EngineError::Cancelled),
            },
            _ = tokio::time::sleep(timeout) => {
                if let Some(entry) = self.pending.lock().remove(&command_id) {
                    tracing::debug!(
                        command_id,
                        response_event = entry.response_event,
                        waited_ms = entry.created_at.elapsed().as_millis() as u64,
                        "correlated request timed out"
                    );
                }
                Err(EngineError::Timeout { after_ms: timeout.as_millis() as u64 })
            }
            _ = aborted => {
                self.pending.lock().remove(&command_id);
                Err(EngineError::Cancelled)
            }
        }
    }

    /// Routes an inbound event to its pending request, if any. Matches by
    /// the echoed command id when the server supplies one, otherwise by the
    /// oldest pending entry expecting that response event. Returns `false`
    /// when nothing was waiting — late and unsolicited responses are
    /// no-ops by design.
    pub fn resolve(&self, event: &InboundEvent) -> bool {
        let Some((response_event, echoed_id)) = event.response_key() else {
            return false;
        };

        let mut pending = self.pending.lock();
        let command_id = match echoed_id {
            Some(id) => {
                if pending
                    .get(&id)
                    .map_or(false, |entry| entry.response_event == response_event)
                {
                    Some(id)
                } else {
                    None
                }
            }
            // Oldest first: command ids are allocated monotonically.
            None => pending
                .iter()
                .filter(|(_, entry)| entry.response_event == response_event)
                .map(|(id, _)| *id)
                .min(),
        };

        let Some(command_id) = command_id else {
            return false;
        };
        let Some(entry) = pending.remove(&command_id) else {
            return false;
        };
        drop(pending);

        entry.resolve_tx.send(event.clone()).is_ok()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{BalanceUpdateWire, WagerAcceptedWire};
    use std::sync::Arc;

    fn gateway() -> (
        Arc<RequestGateway>,
        mpsc::UnboundedReceiver<OutboundCommand>,
    ) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        (Arc::new(RequestGateway::new(command_tx)), command_rx)
    }

    fn wager_kind() -> CommandKind {
        CommandKind::PlaceWager {
            player_address: "0xabc".to_string(),
            amount: 10.0,
        }
    }

    fn wager_response(command_id: Option<u64>, round_number: u64) -> InboundEvent {
        InboundEvent::WagerAccepted(WagerAcceptedWire {
            round_number,
            command_id,
            player_address: Some("0xabc".to_string()),
            amount: Some(10.0),
            total_wagered: Some(130.5),
            total_players: Some(10),
            server_timestamp: None,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn response_settles_request_before_timeout() {
        let (gateway, mut command_rx) = gateway();
        let worker = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                gateway
                    .request(wager_kind(), Duration::from_millis(30_000), None)
                    .await
            })
        };
        tokio::task::yield_now().await;

        let emitted = command_rx.recv().await.expect("command should be emitted");
        assert!(gateway.resolve(&wager_response(Some(emitted.command_id), 42)));

        let result = worker.await.expect("worker should not panic");
        match result {
            Ok(InboundEvent::WagerAccepted(wire)) => {
                assert_eq!(wire.command_id, Some(emitted.command_id));
            }
            other => panic!("unexpected settlement {other:?}"),
        }
        assert_eq!(gateway.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn late_response_after_timeout_is_a_noop() {
        let (gateway, mut command_rx) = gateway();
        let worker = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                gateway
                    .request(wager_kind(), Duration::from_millis(30_000), None)
                    .await
            })
        };
        tokio::task::yield_now().await;
        let emitted = command_rx.recv().await.expect("command should be emitted");

        tokio::time::advance(Duration::from_millis(30_001)).await;
        let result = worker.await.expect("worker should not panic");
        assert!(matches!(
            result,
            Err(EngineError::Timeout { after_ms: 30_000 })
        ));

        // the response arrives 1ms after the timeout already fired
        tokio::time::advance(Duration::from_millis(1)).await;
        assert!(!gateway.resolve(&wager_response(Some(emitted.command_id), 42)));
        assert_eq!(gateway.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn abort_token_settles_as_cancelled() {
        let (gateway, _command_rx) = gateway();
        let token = CancellationToken::new();
        let worker = {
            let gateway = Arc::clone(&gateway);
            let token = token.clone();
            tokio::spawn(async move {
                gateway
                    .request(wager_kind(), Duration::from_millis(30_000), Some(&token))
                    .await
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(gateway.pending_len(), 1);

        token.cancel();
        let result = worker.await.expect("worker should not panic");
        assert!(matches!(result, Err(EngineError::Cancelled)));
        assert_eq!(gateway.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn echoed_command_id_picks_the_right_request() {
        let (gateway, mut command_rx) = gateway();
        let first = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                gateway
                    .request(wager_kind(), Duration::from_millis(30_000), None)
                    .await
            })
        };
        tokio::task::yield_now().await;
        let second = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                gateway
                    .request(wager_kind(), Duration::from_millis(30_000), None)
                    .await
            })
        };
        tokio::task::yield_now().await;

        let first_id = command_rx.recv().await.expect("first command").command_id;
        let second_id = command_rx.recv().await.expect("second command").command_id;
        assert!(gateway.resolve(&wager_response(Some(second_id), 42)));

        let settled = second.await.expect("second worker");
        assert!(settled.is_ok());
        assert_eq!(gateway.pending_len(), 1);

        assert!(gateway.resolve(&wager_response(Some(first_id), 42)));
        assert!(first.await.expect("first worker").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn response_without_echo_settles_oldest_pending() {
        let (gateway, mut command_rx) = gateway();
        let first = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                gateway
                    .request(wager_kind(), Duration::from_millis(30_000), None)
                    .await
            })
        };
        tokio::task::yield_now().await;
        let _second = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                gateway
                    .request(wager_kind(), Duration::from_millis(30_000), None)
                    .await
            })
        };
        tokio::task::yield_now().await;
        let _first_id = command_rx.recv().await.expect("first command").command_id;

        assert!(gateway.resolve(&wager_response(None, 42)));
        let settled = first.await.expect("first worker").expect("settled ok");
        match settled {
            InboundEvent::WagerAccepted(_) => {}
            other => panic!("unexpected settlement {other:?}"),
        }
        assert_eq!(gateway.pending_len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn mismatched_response_event_does_not_settle() {
        let (gateway, _command_rx) = gateway();
        let worker = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                gateway
                    .request(wager_kind(), Duration::from_millis(30_000), None)
                    .await
            })
        };
        tokio::task::yield_now().await;

        let balance = InboundEvent::BalanceUpdate(BalanceUpdateWire {
            command_id: None,
            balance: 99.0,
            server_timestamp: None,
        });
        assert!(!gateway.resolve(&balance));
        assert_eq!(gateway.pending_len(), 1);

        tokio::time::advance(Duration::from_millis(30_001)).await;
        assert!(matches!(
            worker.await.expect("worker"),
            Err(EngineError::Timeout { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn resolves_even_when_round_moved_on() {
        // Judgment call recorded in DESIGN.md: the caller still learns the
        // server's verdict even if the round crashed mid-flight; dropping
        // the state side effect is the engine's job, not the gateway's.
        let (gateway, mut command_rx) = gateway();
        let worker = {
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                gateway
                    .request(wager_kind(), Duration::from_millis(30_000), None)
                    .await
            })
        };
        tokio::task::yield_now().await;
        let emitted = command_rx.recv().await.expect("command");

        assert!(gateway.resolve(&wager_response(Some(emitted.command_id), 41)));
        assert!(worker.await.expect("worker").is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_command_channel_reports_not_connected() {
        let (gateway, command_rx) = gateway();
        drop(command_rx);

        let result = gateway
            .request(wager_kind(), Duration::from_millis(30_000), None)
            .await;
        assert!(matches!(result, Err(EngineError::NotConnected)));
        assert_eq!(gateway.pending_len(), 0);
    }
}
