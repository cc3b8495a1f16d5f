//! Client-side synchronization engine for a server-authoritative crash
//! wagering game: keeps one canonical round snapshot reconciled against
//! the event stream, corrects for clock skew, correlates commands with
//! their responses, and survives reconnects by resyncing instead of
//! trusting replay.

pub mod client;
pub mod clock;
pub mod config;
pub mod connection;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod protocol;
pub mod round;

pub use client::{CashOutReceipt, CrashClient, WagerReceipt};
pub use config::{ClientArgs, ClientConfig};
pub use connection::{ConnectionPhase, ConnectionStatus, TransportMode};
pub use engine::{ApplyOutcome, ReconcileEngine};
pub use error::EngineError;
pub use gateway::RequestGateway;
pub use round::{HistoryBuffer, LiquiditySnapshot, RoundSnapshot, RoundStatus};
