use crate::clock::ClockSync;
use crate::protocol::{InboundEvent, LiquidityWire, RoundStateWire};
use crate::round::{derive_can_bet, HistoryBuffer, LiquiditySnapshot, RoundSnapshot, RoundStatus};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;

/// What one `apply` call did to the canonical state. `RoundMismatch` is the
/// only outcome the caller must act on: drop happened silently, a resync
/// should be requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// A full-state event replaced the canonical snapshot wholesale.
    Replaced,
    /// A partial update merged into a rebuilt snapshot.
    Applied,
    /// The canonical round crashed: frozen into history, current cleared.
    RoundClosed,
    /// Partial update for a round that is not the canonical one (or there
    /// is no canonical round). Dropped; caller should request a resync.
    RoundMismatch {
        canonical: Option<u64>,
        received: u64,
    },
    /// Event carries no round state (e.g. a balance reply).
    Ignored,
    /// A history batch replaced the completed-rounds buffer.
    HistoryRehydrated,
}

impl ApplyOutcome {
    pub fn needs_resync(&self) -> bool {
        matches!(self, Self::RoundMismatch { .. })
    }
}

/// Owns the single canonical [`RoundSnapshot`] and the completed-round
/// history. Every inbound event goes through [`apply`](Self::apply); all
/// other components receive read-only views.
pub struct ReconcileEngine {
    clock: Arc<ClockSync>,
    current: Mutex<Option<Arc<RoundSnapshot>>>,
    history: Mutex<HistoryBuffer>,
    snapshot_tx: watch::Sender<Option<Arc<RoundSnapshot>>>,
}

impl ReconcileEngine {
    pub fn new(clock: Arc<ClockSync>) -> Self {
        let (snapshot_tx, _) = watch::channel(None);
        Self {
            clock,
            current: Mutex::new(None),
            history: Mutex::new(HistoryBuffer::new()),
            snapshot_tx,
        }
    }

    /// The current canonical snapshot, `None` between a crash and the next
    /// round start. Callers hold a frozen copy; later applies never mutate
    /// it in place.
    pub fn snapshot(&self) -> Option<Arc<RoundSnapshot>> {
        self.current.lock().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<RoundSnapshot>>> {
        self.snapshot_tx.subscribe()
    }

    pub fn history(&self) -> Vec<Arc<RoundSnapshot>> {
        self.history.lock().all()
    }

    /// Applies one decoded inbound event under the acceptance rule:
    /// full-state events replace unconditionally, partial updates must
    /// match the canonical round number or be dropped.
    pub fn apply(&self, event: &InboundEvent) -> ApplyOutcome {
        // Every server-stamped message refines the clock offset, not just
        // dedicated sync traffic.
        if let Some(server_timestamp) = event.server_timestamp() {
            self.clock.sync(server_timestamp);
        }

        match event {
            InboundEvent::FullRoundState(wire) | InboundEvent::RoundResync(wire) => {
                self.adopt(self.snapshot_from_wire(wire, false));
                ApplyOutcome::Replaced
            }
            InboundEvent::RoundStarted(wire) => {
                self.adopt(self.snapshot_from_wire(wire, true));
                ApplyOutcome::Replaced
            }
            InboundEvent::RoundHistory(wire) => {
                let batch: Vec<Arc<RoundSnapshot>> = wire
                    .rounds
                    .iter()
                    .map(|round| Arc::new(self.snapshot_from_wire(round, false)))
                    .collect();
                self.history.lock().rehydrate(batch);
                ApplyOutcome::HistoryRehydrated
            }
            InboundEvent::CountdownTick(wire) => {
                self.merge_current(wire.round_number, |next| {
                    next.countdown_ms = wire.countdown_ms;
                    if let Some(status) = wire.status {
                        next.status = status;
                    }
                })
            }
            InboundEvent::MultiplierTick(wire) => {
                self.merge_current(wire.round_number, |next| {
                    next.multiplier = wire.multiplier;
                })
            }
            InboundEvent::WagerAccepted(wire) => {
                self.merge_current(wire.round_number, |next| {
                    if let Some(total_wagered) = wire.total_wagered {
                        next.total_wagered = total_wagered;
                    }
                    if let Some(total_players) = wire.total_players {
                        next.total_players = total_players;
                    }
                })
            }
            InboundEvent::LiquidityUpdate(wire) => {
                self.merge_current(wire.round_number, |next| {
                    if let Some(real) = wire.real {
                        next.liquidity.real = real;
                    }
                    if let Some(synthetic) = wire.synthetic {
                        next.liquidity.synthetic = synthetic;
                    }
                })
            }
            InboundEvent::PlayerCashedOut(wire) => {
                self.merge_current(wire.round_number, |next| {
                    if let Some(total_wagered) = wire.total_wagered {
                        next.total_wagered = total_wagered;
                    }
                })
            }
            InboundEvent::RoundCrashed(wire) => self.close_round(wire.round_number, wire.multiplier),
            InboundEvent::BalanceUpdate(_) => ApplyOutcome::Ignored,
        }
    }

    fn adopt(&self, next: RoundSnapshot) {
        let next = Arc::new(next);
        {
            let mut current = self.current.lock();
            *current = Some(Arc::clone(&next));
        }
        self.snapshot_tx.send_replace(Some(next));
    }

    /// Copy-then-overwrite merge: clone the whole snapshot, let the caller
    /// overwrite the supplied fields, recompute `can_bet`, then publish the
    /// new `Arc` in a single store so no reader sees a torn update.
    fn merge_current<F>(&self, received: u64, overwrite: F) -> ApplyOutcome
    where
        F: FnOnce(&mut RoundSnapshot),
    {
        let mut current = self.current.lock();
        let canonical = match current.as_ref() {
            Some(snapshot) if snapshot.round_number == received => snapshot,
            other => {
                let canonical = other.map(|snapshot| snapshot.round_number);
                tracing::debug!(
                    received,
                    ?canonical,
                    "dropping partial update for non-canonical round"
                );
                return ApplyOutcome::RoundMismatch {
                    canonical,
                    received,
                };
            }
        };

        let mut next = RoundSnapshot::clone(canonical);
        overwrite(&mut next);
        next.can_bet = derive_can_bet(Some(next.status), next.countdown_ms);
        let next = Arc::new(next);
        *current = Some(Arc::clone(&next));
        drop(current);
        self.snapshot_tx.send_replace(Some(next));
        ApplyOutcome::Applied
    }

    fn close_round(&self, received: u64, crash_multiplier: Option<f64>) -> ApplyOutcome {
        let mut current = self.current.lock();
        let canonical = match current.as_ref() {
            Some(snapshot) if snapshot.round_number == received => snapshot,
            other => {
                let canonical = other.map(|snapshot| snapshot.round_number);
                tracing::debug!(received, ?canonical, "dropping crash for non-canonical round");
                return ApplyOutcome::RoundMismatch {
                    canonical,
                    received,
                };
            }
        };

        let mut finished = RoundSnapshot::clone(canonical);
        finished.status = RoundStatus::Crashed;
        if let Some(multiplier) = crash_multiplier {
            finished.multiplier = multiplier;
        }
        finished.countdown_ms = 0;
        finished.can_bet = false;

        let finished = Arc::new(finished);
        self.history.lock().push(Arc::clone(&finished));
        *current = None;
        drop(current);
        // "No current round" is a valid published state, not an error.
        self.snapshot_tx.send_replace(None);
        ApplyOutcome::RoundClosed
    }

    fn snapshot_from_wire(&self, wire: &RoundStateWire, fresh_round: bool) -> RoundSnapshot {
        let status = if fresh_round {
            // A round-start always begins live; crashed payload noise is
            // never adopted as the opening status.
            match wire.status {
                Some(RoundStatus::Waiting) => RoundStatus::Waiting,
                _ => RoundStatus::Active,
            }
        } else {
            wire.status.unwrap_or(RoundStatus::Waiting)
        };

        let multiplier = if fresh_round {
            1.0
        } else {
            wire.multiplier.unwrap_or(1.0)
        };

        let liquidity = if fresh_round {
            LiquiditySnapshot::default()
        } else {
            let LiquidityWire { real, synthetic } = wire.liquidity.unwrap_or_default();
            LiquiditySnapshot {
                real: real.unwrap_or(0.0),
                synthetic: synthetic.unwrap_or(0.0),
            }
        };

        let countdown_ms = wire.countdown_ms.unwrap_or(0);
        RoundSnapshot {
            round_id: wire.round_id.clone(),
            round_number: wire.round_number,
            multiplier,
            status,
            total_wagered: if fresh_round {
                0.0
            } else {
                wire.total_wagered.unwrap_or(0.0)
            },
            total_players: if fresh_round {
                0
            } else {
                wire.total_players.unwrap_or(0)
            },
            liquidity,
            countdown_ms,
            can_bet: derive_can_bet(Some(status), countdown_ms),
            server_timestamp: wire.server_timestamp.unwrap_or_else(|| self.clock.now_ms()),
            started_at: wire.started_at,
        }
    }
}
