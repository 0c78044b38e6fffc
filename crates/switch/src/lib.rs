//! # Input switching engine
//!
//! A realtime relay core that reads fixed-size TS packets from one of
//! several inputs at a time and forwards them to a single output, with
//! on-demand switching, watchdog-driven failover, primary-input
//! pre-emption and three switching strategies.
//!
//! ## Architecture
//!
//! Each input runs in its own task (the input executor) and owns a
//! bounded circular packet buffer ([`PacketRing`]). The output task pulls
//! from whichever input the [`Core`] designates. Executors report session
//! events (`started`, `received`, `stopped`) over a channel consumed by
//! the core, which drives the global switching state machine.

pub mod core;
pub mod error;
mod events;
mod input;
pub mod options;
mod output;
pub mod plugin;
pub mod ring;
mod watchdog;

pub use self::core::{Core, OutputBatch};
pub use error::SwitchError;
pub use options::{Strategy, SwitchOptions};
pub use plugin::{InputPlugin, OutputPlugin};
pub use ring::PacketRing;

/// Result type for switch engine operations
pub type Result<T> = std::result::Result<T, SwitchError>;
