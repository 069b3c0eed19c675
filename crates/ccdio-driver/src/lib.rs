//! DIO calibration and feedback-loop control for the QuTech Central
//! Controller (CC) and its readout instruments.
//!
//! The CC samples each CCIO slot's 32-bit DIO input once per cycle. Which of
//! the 32 sampling offsets lands inside the sender's stable window depends on
//! cables and firmware, so it has to be measured per link. This crate drives
//! that measurement and the multi-slot feedback program that depends on it.
//!
//! # Instrument hierarchy
//!
//! ```text
//! Hardware:
//!   ScpiInstrument<IpTransport>: SCPI over TCP (CC on 5025, UHFQA bridge)
//!
//! Development:
//!   SimInstrument: cycle model of a wired lab on a shared SimBus
//! ```
//!
//! # Quick start
//!
//! ```no_run
//! use ccdio_driver::{CalibrationConfig, CalibrationPlan, Session, SessionConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut session = Session::open(&SessionConfig::from_env()?)?;
//! let mut link = session.upstream_link()?;
//! let plan = CalibrationPlan::upstream()?;
//! let result = session.calibrate(&mut link, &plan, &CalibrationConfig::default())?;
//! println!("{result}");
//! # Ok(())
//! # }
//! ```
//!
//! # Feedback timing (CC 50 MHz, UHFQA on slot 2)
//!
//! | Phase | Cycles |
//! |-------|--------|
//! | Trigger to result on DIO (`uhfLatency`) | 11 |
//! | Shared-memory write to distribution | 1 + propagation |
//! | Idle wait per iteration | 100 |
//! | Default iteration | 116 / 2320 ns |

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::doc_markdown)]

pub mod backends;
pub mod calibration;
pub mod config;
mod device;
pub mod diagnostics;
mod error;
pub mod feedback;
mod instrument;
pub mod link;
pub mod sequence;
mod session;
pub mod transport;

pub use backends::{ScpiInstrument, SimBus, SimConfig, SimInstrument};
pub use calibration::{
    select_read_index, CalibrationConfig, CalibrationPlan, CalibrationResult, CalibrationState,
    Calibrator, OffsetChoice,
};
pub use config::{DeviceConfig, Endpoint, SessionConfig};
pub use device::Device;
pub use diagnostics::{Diagnostics, StatusRegister};
pub use error::{DioError, ErrorKind, Result};
pub use feedback::{
    run_feedback, FeedbackBuilder, FeedbackProgram, FeedbackReport, FeedbackTiming, LatencyMargin,
};
pub use instrument::{
    select_instrument, terminated_instructions, wait_complete, DeviceRole, DioCapture, Identity,
    Instrument,
};
pub use link::{DioLink, DioPort, ExpectedSequence, LinkId, LinkRegistry};
pub use session::Session;
pub use transport::{IpTransport, Transport};

/// Commonly used types.
pub mod prelude {
    pub use crate::{
        CalibrationConfig, CalibrationPlan, CalibrationResult, Calibrator, Device, DeviceRole,
        DioError, DioLink, ExpectedSequence, FeedbackBuilder, FeedbackProgram, FeedbackTiming,
        Instrument, Result, Session, SessionConfig, SimConfig,
    };
}
