//! Instrument abstraction
//!
//! One capability trait for everything the calibration engine, feedback
//! runner and diagnostics need from a device. Real instruments speak SCPI
//! through a [`Transport`](crate::Transport); the simulated lab answers in
//! memory. Callers receive a boxed trait object and never know which.

use std::fmt::{self, Debug};
use std::time::Duration;

use ccdio_chip::program::Program;
use ccdio_chip::regs::TraceSource;
use ccdio_chip::scpi;

use crate::backends::scpi::ScpiInstrument;
use crate::backends::sim::SimInstrument;
use crate::config::{DeviceConfig, Endpoint};
use crate::error::{DioError, Result};
use crate::transport::IpTransport;

/// What a device does in the setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceRole {
    /// Central Controller: issues triggers, owns CCIO slots
    Sequencer,
    /// Readout instrument (UHFQA): returns classified results
    Readout,
    /// Waveform generator (HDAWG): plays codewords
    WaveformGenerator,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sequencer => write!(f, "Sequencer"),
            Self::Readout => write!(f, "Readout"),
            Self::WaveformGenerator => write!(f, "WaveformGenerator"),
        }
    }
}

/// Parsed `*IDN?` response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    /// Manufacturer
    pub vendor: String,
    /// Model
    pub model: String,
    /// Serial number
    pub serial: String,
    /// Firmware revision
    pub firmware: String,
}

impl Identity {
    /// Parse the four comma-separated `*IDN?` fields
    ///
    /// # Errors
    ///
    /// Returns [`DioError::ProtocolViolation`] if the response does not have
    /// exactly four fields.
    pub fn parse(response: &str) -> Result<Self> {
        let fields: Vec<&str> = response.trim().split(',').map(str::trim).collect();
        match fields.as_slice() {
            [vendor, model, serial, firmware] => Ok(Self {
                vendor: (*vendor).to_string(),
                model: (*model).to_string(),
                serial: (*serial).to_string(),
                firmware: (*firmware).to_string(),
            }),
            _ => Err(DioError::protocol("*IDN? needs 4 fields", response)),
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} (serial {}, firmware {})",
            self.vendor, self.model, self.serial, self.firmware
        )
    }
}

/// Receiver-side DIO capture request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DioCapture {
    /// Receiving CCIO slot
    pub slot: u8,
    /// Bits compared against the expected sequence
    pub mask: u32,
    /// `(pattern, hold)` pairs; empty checks data-valid assertion only
    pub expected: Vec<(u32, u32)>,
    /// Pattern repetitions observed per offset
    pub repetitions: u32,
}

/// Capabilities shared by the CC and its instruments
///
/// All calls block until the device answered or the configured timeout
/// expired.
pub trait Instrument: Debug + Send {
    /// Device name
    fn name(&self) -> &str;

    /// Role in the setup
    fn role(&self) -> DeviceRole;

    /// `*RST`
    ///
    /// # Errors
    ///
    /// Returns error on transport failure.
    fn reset(&mut self) -> Result<()>;

    /// `*CLS`
    ///
    /// # Errors
    ///
    /// Returns error on transport failure.
    fn clear_status(&mut self) -> Result<()>;

    /// `*IDN?`
    ///
    /// # Errors
    ///
    /// Returns error on transport failure or a malformed response.
    fn identity(&mut self) -> Result<Identity>;

    /// Number of entries in the error queue
    ///
    /// # Errors
    ///
    /// Returns error on transport failure or a malformed response.
    fn error_count(&mut self) -> Result<u32>;

    /// Pop one entry from the error queue
    ///
    /// # Errors
    ///
    /// Returns error on transport failure.
    fn next_error(&mut self) -> Result<String>;

    /// Start the sequencer
    ///
    /// # Errors
    ///
    /// Returns error on transport failure.
    fn start(&mut self) -> Result<()>;

    /// Request a sequencer stop; completion is observed with
    /// [`operation_complete`](Self::operation_complete)
    ///
    /// # Errors
    ///
    /// Returns error on transport failure.
    fn stop(&mut self) -> Result<()>;

    /// `*OPC?`: true once pending operations (stop, program end) finished
    ///
    /// # Errors
    ///
    /// Returns error on transport failure or a malformed response.
    fn operation_complete(&mut self) -> Result<bool>;

    /// Render and upload a structured program
    ///
    /// # Errors
    ///
    /// Returns error if the program cannot be rendered for this device or the
    /// upload fails.
    fn upload(&mut self, program: &Program) -> Result<()>;

    /// Upload program source text verbatim
    ///
    /// # Errors
    ///
    /// Returns error on transport failure.
    fn upload_source(&mut self, source: &str) -> Result<()>;

    /// Upload pre-assembled instruction words; the stop word is appended
    ///
    /// # Errors
    ///
    /// Returns [`DioError::Configuration`] if the stream does not fit the
    /// sequencer memory, or error on transport failure.
    fn upload_instructions(&mut self, words: &[u32]) -> Result<()>;

    /// Read one CCIO debug register
    ///
    /// # Errors
    ///
    /// Returns error on transport failure or a malformed response.
    fn read_register(&mut self, slot: u8, index: u16) -> Result<i32>;

    /// Arm DIO capture on a receiving slot
    ///
    /// # Errors
    ///
    /// Returns error on transport failure.
    fn arm_dio_capture(&mut self, capture: &DioCapture) -> Result<()>;

    /// Latch a slot's DIO input at `index`
    ///
    /// # Errors
    ///
    /// Returns error on transport failure.
    fn set_dio_read_index(&mut self, slot: u8, index: u32) -> Result<()>;

    /// Questionable status condition word
    ///
    /// # Errors
    ///
    /// Returns error on transport failure or a malformed response.
    fn questionable_condition(&mut self) -> Result<u32>;

    /// Select which questionable bits are reported
    ///
    /// # Errors
    ///
    /// Returns error on transport failure.
    fn enable_questionable(&mut self, mask: u32) -> Result<()>;

    /// Enable a trace unit with `depth` entries
    ///
    /// # Errors
    ///
    /// Returns error on transport failure.
    fn trace_on(&mut self, slot: u8, source: TraceSource, depth: u32) -> Result<()>;

    /// Disable a trace unit
    ///
    /// # Errors
    ///
    /// Returns error on transport failure.
    fn trace_off(&mut self, slot: u8, source: TraceSource) -> Result<()>;

    /// Route an input bit to the slot's scope marker
    ///
    /// # Errors
    ///
    /// Returns error on transport failure.
    fn marker_in(&mut self, slot: u8, bit: u8) -> Result<()>;

    /// Route an output bit to the slot's scope marker
    ///
    /// # Errors
    ///
    /// Returns error on transport failure.
    fn marker_out(&mut self, slot: u8, bit: u8) -> Result<()>;
}

/// Check an instruction stream against the sequencer memory and append the
/// stop word.
///
/// # Errors
///
/// Returns [`DioError::Configuration`] if the stream plus stop word exceeds
/// [`scpi::MAX_INSTRUCTIONS`].
pub fn terminated_instructions(words: &[u32]) -> Result<Vec<u32>> {
    if words.len() + 1 > scpi::MAX_INSTRUCTIONS {
        return Err(DioError::configuration(format!(
            "{} instructions exceed sequencer memory of {}",
            words.len(),
            scpi::MAX_INSTRUCTIONS - 1
        )));
    }
    let mut out = Vec::with_capacity(words.len() + 1);
    out.extend_from_slice(words);
    out.push(scpi::STOP_INSTRUCTION);
    Ok(out)
}

/// Open the instrument a device configuration describes
///
/// Real endpoints connect over TCP; simulated endpoints attach to the shared
/// bus given in the configuration.
///
/// # Errors
///
/// Returns error if a real instrument cannot be reached.
pub fn select_instrument(config: &DeviceConfig) -> Result<Box<dyn Instrument>> {
    match &config.endpoint {
        Endpoint::Ip { host, port } => {
            let transport = IpTransport::connect(host, *port, config.timeout)?;
            tracing::info!("Using SCPI instrument for {} at {host}:{port}", config.name);
            Ok(Box::new(ScpiInstrument::new(
                &config.name,
                config.role,
                transport,
                config.timeout,
            )))
        }
        Endpoint::Simulated(bus) => {
            tracing::info!("Using simulated instrument for {}", config.name);
            Ok(Box::new(SimInstrument::new(&config.name, config.role, bus.clone())))
        }
    }
}

/// Poll `*OPC?` until it reports completion or `deadline` passes
///
/// # Errors
///
/// Returns [`DioError::Timeout`] if the instrument never completes.
pub fn wait_complete(
    instrument: &mut dyn Instrument,
    deadline: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let start = std::time::Instant::now();
    loop {
        if instrument.operation_complete()? {
            return Ok(());
        }
        if start.elapsed() >= deadline {
            return Err(DioError::timeout(
                format!("*OPC? on {}", instrument.name()),
                deadline,
            ));
        }
        std::thread::sleep(poll_interval);
    }
}
