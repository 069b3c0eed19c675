//! Instrument implementations
//!
//! - **Scpi**: real instruments over any [`Transport`](crate::Transport)
//! - **Sim**: in-memory lab for CI and demos without hardware

pub mod scpi;
pub mod sim;

pub use scpi::ScpiInstrument;
pub use sim::{SimBus, SimConfig, SimInstrument};
