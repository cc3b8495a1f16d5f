use crate::error::EngineError;
use crate::round::RoundStatus;
use serde::{Deserialize, Serialize};

pub const FULL_ROUND_STATE_EVENT: &str = "full_round_state";
pub const ROUND_RESYNC_EVENT: &str = "round_resync";
pub const ROUND_STARTED_EVENT: &str = "round_started";
pub const ROUND_HISTORY_EVENT: &str = "round_history";
pub const COUNTDOWN_TICK_EVENT: &str = "countdown_tick";
pub const MULTIPLIER_TICK_EVENT: &str = "multiplier_tick";
pub const ROUND_CRASHED_EVENT: &str = "round_crashed";
pub const WAGER_ACCEPTED_EVENT: &str = "wager_accepted";
pub const LIQUIDITY_UPDATE_EVENT: &str = "liquidity_update";
pub const PLAYER_CASHED_OUT_EVENT: &str = "player_cashed_out";
pub const BALANCE_UPDATE_EVENT: &str = "balance_update";

/// Inbound message taxonomy, decoded once at the transport boundary so the
/// reconciliation engine pattern-matches an exhaustive sum type instead of
/// sniffing fields per event name.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum InboundEvent {
    FullRoundState(RoundStateWire),
    RoundResync(RoundStateWire),
    RoundStarted(RoundStateWire),
    RoundHistory(RoundHistoryWire),
    CountdownTick(CountdownTickWire),
    MultiplierTick(MultiplierTickWire),
    RoundCrashed(RoundCrashedWire),
    WagerAccepted(WagerAcceptedWire),
    LiquidityUpdate(LiquidityUpdateWire),
    PlayerCashedOut(PlayerCashedOutWire),
    BalanceUpdate(BalanceUpdateWire),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundStateWire {
    pub round_id: String,
    pub round_number: u64,
    pub multiplier: Option<f64>,
    pub status: Option<RoundStatus>,
    pub total_wagered: Option<f64>,
    pub total_players: Option<u32>,
    pub liquidity: Option<LiquidityWire>,
    pub countdown_ms: Option<i64>,
    pub server_timestamp: Option<i64>,
    pub started_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct LiquidityWire {
    pub real: Option<f64>,
    pub synthetic: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundHistoryWire {
    pub rounds: Vec<RoundStateWire>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CountdownTickWire {
    pub round_number: u64,
    pub countdown_ms: i64,
    pub status: Option<RoundStatus>,
    pub server_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiplierTickWire {
    pub round_number: u64,
    pub multiplier: f64,
    pub server_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundCrashedWire {
    pub round_number: u64,
    pub multiplier: Option<f64>,
    pub server_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WagerAcceptedWire {
    pub round_number: u64,
    pub command_id: Option<u64>,
    pub player_address: Option<String>,
    pub amount: Option<f64>,
    pub total_wagered: Option<f64>,
    pub total_players: Option<u32>,
    pub server_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiquidityUpdateWire {
    pub round_number: u64,
    pub real: Option<f64>,
    pub synthetic: Option<f64>,
    pub server_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerCashedOutWire {
    pub round_number: u64,
    pub command_id: Option<u64>,
    pub player_address: Option<String>,
    pub multiplier: Option<f64>,
    pub payout: Option<f64>,
    pub total_wagered: Option<f64>,
    pub server_timestamp: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceUpdateWire {
    pub command_id: Option<u64>,
    pub balance: f64,
    pub server_timestamp: Option<i64>,
}

impl InboundEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FullRoundState(_) => FULL_ROUND_STATE_EVENT,
            Self::RoundResync(_) => ROUND_RESYNC_EVENT,
            Self::RoundStarted(_) => ROUND_STARTED_EVENT,
            Self::RoundHistory(_) => ROUND_HISTORY_EVENT,
            Self::CountdownTick(_) => COUNTDOWN_TICK_EVENT,
            Self::MultiplierTick(_) => MULTIPLIER_TICK_EVENT,
            Self::RoundCrashed(_) => ROUND_CRASHED_EVENT,
            Self::WagerAccepted(_) => WAGER_ACCEPTED_EVENT,
            Self::LiquidityUpdate(_) => LIQUIDITY_UPDATE_EVENT,
            Self::PlayerCashedOut(_) => PLAYER_CASHED_OUT_EVENT,
            Self::BalanceUpdate(_) => BALANCE_UPDATE_EVENT,
        }
    }

    /// Full-state events replace the canonical snapshot unconditionally;
    /// everything else is a partial update gated on the round identifier.
    pub fn is_full_state(&self) -> bool {
        matches!(
            self,
            Self::FullRoundState(_)
                | Self::RoundResync(_)
                | Self::RoundStarted(_)
                | Self::RoundHistory(_)
        )
    }

    pub fn server_timestamp(&self) -> Option<i64> {
        match self {
            Self::FullRoundState(wire) | Self::RoundResync(wire) | Self::RoundStarted(wire) => {
                wire.server_timestamp
            }
            Self::RoundHistory(_) => None,
            Self::CountdownTick(wire) => wire.server_timestamp,
            Self::MultiplierTick(wire) => wire.server_timestamp,
            Self::RoundCrashed(wire) => wire.server_timestamp,
            Self::WagerAccepted(wire) => wire.server_timestamp,
            Self::LiquidityUpdate(wire) => wire.server_timestamp,
            Self::PlayerCashedOut(wire) => wire.server_timestamp,
            Self::BalanceUpdate(wire) => wire.server_timestamp,
        }
    }

    /// Correlation key for events that double as command responses: the
    /// response event name plus the echoed command id when the server
    /// provides one.
    pub fn response_key(&self) -> Option<(&'static str, Option<u64>)> {
        match self {
            Self::WagerAccepted(wire) => Some((WAGER_ACCEPTED_EVENT, wire.command_id)),
            Self::PlayerCashedOut(wire) => Some((PLAYER_CASHED_OUT_EVENT, wire.command_id)),
            Self::BalanceUpdate(wire) => Some((BALANCE_UPDATE_EVENT, wire.command_id)),
            Self::RoundResync(_) => Some((ROUND_RESYNC_EVENT, None)),
            _ => None,
        }
    }
}

/// Decodes and sanity-checks one raw transport payload. The slice is
/// mutated in place by simd-json.
pub fn decode_inbound(payload: &mut [u8]) -> Result<InboundEvent, EngineError> {
    let event: InboundEvent = simd_json::serde::from_slice(payload)?;
    validate_inbound(&event)?;
    Ok(event)
}

fn validate_inbound(event: &InboundEvent) -> Result<(), EngineError> {
    let ok = match event {
        InboundEvent::FullRoundState(wire)
        | InboundEvent::RoundResync(wire)
        | InboundEvent::RoundStarted(wire) => round_state_is_sane(wire),
        InboundEvent::RoundHistory(wire) => wire.rounds.iter().all(round_state_is_sane),
        InboundEvent::MultiplierTick(wire) => non_negative(wire.multiplier),
        InboundEvent::RoundCrashed(wire) => wire.multiplier.map_or(true, non_negative),
        InboundEvent::WagerAccepted(wire) => {
            wire.amount.map_or(true, non_negative)
                && wire.total_wagered.map_or(true, non_negative)
        }
        InboundEvent::LiquidityUpdate(wire) => {
            wire.real.map_or(true, non_negative) && wire.synthetic.map_or(true, non_negative)
        }
        InboundEvent::PlayerCashedOut(wire) => {
            wire.multiplier.map_or(true, non_negative) && wire.payout.map_or(true, non_negative)
        }
        InboundEvent::BalanceUpdate(wire) => wire.balance.is_finite(),
        InboundEvent::CountdownTick(_) => true,
    };

    if ok {
        Ok(())
    } else {
        Err(EngineError::InvalidArgument(format!(
            "{} payload carries non-finite or negative figures",
            event.name()
        )))
    }
}

fn round_state_is_sane(wire: &RoundStateWire) -> bool {
    !wire.round_id.is_empty()
        && wire.multiplier.map_or(true, non_negative)
        && wire.total_wagered.map_or(true, non_negative)
        && wire
            .liquidity
            .map_or(true, |liquidity| {
                liquidity.real.map_or(true, non_negative)
                    && liquidity.synthetic.map_or(true, non_negative)
            })
}

fn non_negative(value: f64) -> bool {
    value.is_finite() && value >= 0.0
}

/// Outbound command taxonomy. Every request/response-shaped operation goes
/// through the same correlated-command envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "command", content = "data", rename_all = "snake_case")]
pub enum CommandKind {
    RequestResync,
    #[serde(rename_all = "camelCase")]
    PlaceWager { player_address: String, amount: f64 },
    #[serde(rename_all = "camelCase")]
    CashOut { player_address: String },
    #[serde(rename_all = "camelCase")]
    QueryBalance { player_address: String },
}

impl CommandKind {
    pub fn response_event(&self) -> &'static str {
        match self {
            Self::RequestResync => ROUND_RESYNC_EVENT,
            Self::PlaceWager { .. } => WAGER_ACCEPTED_EVENT,
            Self::CashOut { .. } => PLAYER_CASHED_OUT_EVENT,
            Self::QueryBalance { .. } => BALANCE_UPDATE_EVENT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundCommand {
    pub command_id: u64,
    #[serde(flatten)]
    pub kind: CommandKind,
}

impl OutboundCommand {
    pub fn encode(&self) -> Result<String, EngineError> {
        Ok(serde_json::to_string(self)?)
    }
}
