//! Device model for the QuTech Central Controller (CC) DIO interface.
//!
//! This crate has **no dependencies** and **no hardware access**. It is a
//! pure model of the instruments: CCIO register indices, DIO bus layouts,
//! clock and latency constants, the SCPI command surface, and the structured
//! sequencer program format with its text renderers.
//!
//! Values come from the lab's CC demo scripts and register dumps taken on a
//! CC with a UHFQA on slot 2 and an HDAWG on slot 3.
//!
//! # Crate organisation
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`timing`] | CC / UHFQA clock periods, readout and shared-memory latencies |
//! | [`regs`] | CCIO debug register map and condition bits |
//! | [`dio`] | DIO bus layouts: where codeword and data-valid bits live |
//! | [`scpi`] | SCPI command strings and IEEE 488.2 block headers |
//! | [`program`] | Structured sequencer programs, CC assembly and seqC renderers |

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod dio;
pub mod program;
pub mod regs;
pub mod scpi;
pub mod timing;
