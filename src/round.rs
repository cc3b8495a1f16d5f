use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// Bets are locked out once the pre-round countdown drops to this value,
/// so a wager can never race the round start. Boundary is exclusive.
pub const BET_LOCKOUT_MS: i64 = 2_000;
pub const HISTORY_CAPACITY: usize = 50;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoundStatus {
    Waiting,
    Active,
    Crashed,
}

/// Real player wagers and the house-injected display boost, tracked as
/// separate fields so the true wagered amount is always recoverable. Only
/// the derived display sum combines them.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct LiquiditySnapshot {
    pub real: f64,
    pub synthetic: f64,
}

impl LiquiditySnapshot {
    pub fn combined(&self) -> f64 {
        self.real + self.synthetic
    }
}

/// The canonical view of the current round. Replaced wholesale on round
/// transitions, rebuilt field-merged on in-round updates; consumers only
/// ever hold frozen `Arc` copies.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoundSnapshot {
    pub round_id: String,
    pub round_number: u64,
    pub multiplier: f64,
    pub status: RoundStatus,
    pub total_wagered: f64,
    pub total_players: u32,
    pub liquidity: LiquiditySnapshot,
    pub countdown_ms: i64,
    pub can_bet: bool,
    pub server_timestamp: i64,
    pub started_at: Option<i64>,
}

impl RoundSnapshot {
    /// Display total; always derived, never stored, so the parts and the
    /// sum cannot drift apart.
    pub fn combined_liquidity(&self) -> f64 {
        self.liquidity.combined()
    }
}

/// Pure betting-window derivation. `None` status means "no current round"
/// which can never accept a wager. Re-evaluated on every snapshot rebuild;
/// the countdown changes every tick so caching would go stale immediately.
pub fn derive_can_bet(status: Option<RoundStatus>, countdown_ms: i64) -> bool {
    match status {
        Some(RoundStatus::Active) => true,
        Some(RoundStatus::Waiting) => countdown_ms > BET_LOCKOUT_MS,
        Some(RoundStatus::Crashed) | None => false,
    }
}

/// Bounded FIFO of completed rounds, most recent last. Entries are frozen
/// copies taken at crash time; nothing mutates them afterwards.
#[derive(Debug, Default)]
pub struct HistoryBuffer {
    entries: VecDeque<Arc<RoundSnapshot>>,
}

impl HistoryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, entry: Arc<RoundSnapshot>) {
        if self.entries.len() == HISTORY_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    /// Replaces the contents from a server history batch, keeping at most
    /// the newest `HISTORY_CAPACITY` entries.
    pub fn rehydrate(&mut self, batch: Vec<Arc<RoundSnapshot>>) {
        self.entries.clear();
        for entry in batch {
            self.push(entry);
        }
    }

    pub fn all(&self) -> Vec<Arc<RoundSnapshot>> {
        self.entries.iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn crashed_round(round_number: u64) -> Arc<RoundSnapshot> {
        Arc::new(RoundSnapshot {
            round_id: format!("r-{round_number}"),
            round_number,
            multiplier: 2.5,
            status: RoundStatus::Crashed,
            total_wagered: 100.0,
            total_players: 4,
            liquidity: LiquiditySnapshot {
                real: 100.0,
                synthetic: 40.0,
            },
            countdown_ms: 0,
            can_bet: false,
            server_timestamp: 1_700_000_000_000 + round_number as i64,
            started_at: None,
        })
    }

    #[test]
    fn active_round_always_accepts_bets() {
        assert!(derive_can_bet(Some(RoundStatus::Active), 0));
        assert!(derive_can_bet(Some(RoundStatus::Active), -1));
    }

    #[test]
    fn waiting_round_locks_out_final_window() {
        assert!(derive_can_bet(Some(RoundStatus::Waiting), 10_000));
        assert!(!derive_can_bet(Some(RoundStatus::Waiting), 1_500));
        // boundary is exclusive
        assert!(!derive_can_bet(Some(RoundStatus::Waiting), BET_LOCKOUT_MS));
        assert!(derive_can_bet(Some(RoundStatus::Waiting), BET_LOCKOUT_MS + 1));
    }

    #[test]
    fn crashed_or_missing_round_never_accepts_bets() {
        assert!(!derive_can_bet(Some(RoundStatus::Crashed), 10_000));
        assert!(!derive_can_bet(None, 10_000));
    }

    #[test]
    fn combined_liquidity_is_derived_from_parts() {
        let liquidity = LiquiditySnapshot {
            real: 120.5,
            synthetic: 300.0,
        };
        assert_eq!(liquidity.combined(), 420.5);
    }

    #[test]
    fn history_evicts_oldest_beyond_capacity() {
        let mut buffer = HistoryBuffer::new();
        for round_number in 1..=55 {
            buffer.push(crashed_round(round_number));
        }

        assert_eq!(buffer.len(), HISTORY_CAPACITY);
        let entries = buffer.all();
        assert_eq!(entries.first().map(|e| e.round_number), Some(6));
        assert_eq!(entries.last().map(|e| e.round_number), Some(55));
        for (index, entry) in entries.iter().enumerate() {
            assert_eq!(entry.round_number, 6 + index as u64);
        }
    }

    #[test]
    fn rehydrate_replaces_contents() {
        let mut buffer = HistoryBuffer::new();
        buffer.push(crashed_round(1));
        buffer.rehydrate(vec![crashed_round(10), crashed_round(11)]);

        let entries = buffer.all();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].round_number, 10);
        assert_eq!(entries[1].round_number, 11);
    }
}
