//! DIO calibration engine
//!
//! Finds the sample offset at which a receiving CCIO slot must latch a DIO
//! bus driven by an independently clocked sender. The receiver sweeps all
//! offsets while the sender repeats a known pattern; the engine picks the
//! centre of the widest contiguous run of offsets that passed in every
//! repetition.
//!
//! ```text
//! Idle ─▶ Arming ─▶ Running ─▶ Evaluating ─┬─▶ Done
//!           │          │           │       └─▶ Failed
//!           └──────────┴───────────┴─ transport error ─▶ Failed
//! ```
//!
//! A failed evaluation is a *result*, not an error: `read_index = -1`,
//! `margin = 0` and a non-zero condition. Consumers that need a working link
//! call [`CalibrationResult::into_valid`].

use std::fmt;
use std::thread;
use std::time::Duration;

use ccdio_chip::program::{Op, Program};
use ccdio_chip::regs::{self, diocal_cond};
use ccdio_chip::dio::DioLayout;
use ccdio_chip::timing::{
    DEFAULT_SETTLE_REPETITIONS, DIO_SAMPLE_OFFSETS, MIN_SETTLE_REPETITIONS, UPSTREAM_PATTERN_HIGH,
    UPSTREAM_PATTERN_PERIOD,
};
use tracing::{debug, error, info, warn};

use crate::error::{DioError, Result};
use crate::instrument::{wait_complete, DioCapture, Instrument};
use crate::link::{DioLink, ExpectedSequence};
use crate::sequence;

/// Engine state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CalibrationState {
    /// Nothing started
    Idle,
    /// Programs uploaded, capture being armed
    Arming,
    /// Sender and receiver running, receiver sweeping offsets
    Running,
    /// Stopped, reading and judging the sweep
    Evaluating,
    /// Valid read index found
    Done,
    /// No usable offset, or the attempt aborted
    Failed,
}

impl fmt::Display for CalibrationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Calibration parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationConfig {
    /// Time the sender runs before the sweep is stopped
    pub settle: Duration,
    /// Pattern repetitions each offset must pass
    pub repetitions: u32,
    /// Offsets swept
    pub offsets: usize,
    /// Smallest acceptable margin, at least 1
    pub min_margin: u32,
    /// Delay between `*OPC?` polls and before a condition re-read
    pub poll_interval: Duration,
    /// Deadline for both sequencers to report stopped
    pub stop_timeout: Duration,
    /// Write the chosen index back to the receiver
    pub apply_read_index: bool,
    /// Re-read a non-zero condition once before giving up
    pub recheck_condition: bool,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(200),
            repetitions: DEFAULT_SETTLE_REPETITIONS,
            offsets: DIO_SAMPLE_OFFSETS,
            min_margin: 1,
            poll_interval: Duration::from_millis(10),
            stop_timeout: Duration::from_secs(2),
            apply_read_index: true,
            recheck_condition: true,
        }
    }
}

impl CalibrationConfig {
    /// Set the settle time
    #[must_use]
    pub const fn with_settle(mut self, settle: Duration) -> Self {
        self.settle = settle;
        self
    }

    /// Set the repetitions per offset
    #[must_use]
    pub const fn with_repetitions(mut self, repetitions: u32) -> Self {
        self.repetitions = repetitions;
        self
    }

    /// Set the minimum margin
    #[must_use]
    pub const fn with_min_margin(mut self, margin: u32) -> Self {
        self.min_margin = margin;
        self
    }

    /// Set the poll interval
    #[must_use]
    pub const fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Leave the receiver's read index untouched
    #[must_use]
    pub const fn without_apply(mut self) -> Self {
        self.apply_read_index = false;
        self
    }
}

/// What to run during one calibration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationPlan {
    /// Receiver expectation; empty checks data-valid only
    pub expected: ExpectedSequence,
    /// Program for the sender
    pub sender_program: Program,
    /// Trigger program for the receiver, when the receiver triggers the sender
    pub trigger_program: Option<Program>,
}

impl CalibrationPlan {
    /// Lab plan for the UHFQA result bus: every result bit pulsed high on
    /// each trigger, the CC triggering over its downstream bus
    ///
    /// # Errors
    ///
    /// Returns [`DioError::Configuration`] if the timing constants are
    /// inconsistent.
    pub fn upstream() -> Result<Self> {
        Self::triggered_pulse(
            DioLayout::DV_LSB.mask(),
            UPSTREAM_PATTERN_HIGH,
            DioLayout::CC_TO_UHFQA.mask(),
            UPSTREAM_PATTERN_PERIOD,
        )
    }

    /// Content check of the UHFQA result bus: codewords `0..steps` with
    /// data-valid, then idle, each held for the upstream pulse width
    ///
    /// # Errors
    ///
    /// Returns [`DioError::Configuration`] if the staircase does not fit the
    /// result layout or the trigger period.
    pub fn upstream_staircase(steps: u32) -> Result<Self> {
        let expected = ExpectedSequence::staircase(DioLayout::DV_LSB, steps, UPSTREAM_PATTERN_HIGH)?;
        Self::triggered_content(expected, DioLayout::CC_TO_UHFQA.mask(), UPSTREAM_PATTERN_PERIOD)
    }

    /// Sender pulses `pattern` for `high` cycles on each trigger; the
    /// receiver triggers every `period` cycles with `trigger_pattern`
    ///
    /// # Errors
    ///
    /// Returns [`DioError::Configuration`] if the timing is impossible.
    pub fn triggered_pulse(pattern: u32, high: u32, trigger_pattern: u32, period: u32) -> Result<Self> {
        Ok(Self {
            expected: ExpectedSequence::empty(),
            sender_program: sequence::build_triggered_pattern(pattern, high)?,
            trigger_program: Some(sequence::build_free_running_pattern(trigger_pattern, 1, period, false)?),
        })
    }

    /// Sender replays `expected` on each trigger; the receiver checks content
    ///
    /// # Errors
    ///
    /// Returns [`DioError::Configuration`] if the sequence is empty or longer
    /// than `period`.
    pub fn triggered_content(expected: ExpectedSequence, trigger_pattern: u32, period: u32) -> Result<Self> {
        if expected.total_cycles() >= u64::from(period) {
            return Err(DioError::configuration(format!(
                "sequence of {} cycles does not fit trigger period {period}",
                expected.total_cycles()
            )));
        }
        Ok(Self {
            sender_program: sequence::build_triggered_sequence(&expected)?,
            trigger_program: Some(sequence::build_free_running_pattern(trigger_pattern, 1, period, false)?),
            expected,
        })
    }

    /// Self-timed sender, no trigger needed
    ///
    /// # Errors
    ///
    /// Returns [`DioError::Configuration`] if the timing is impossible.
    pub fn free_running(pattern: u32, high: u32, period: u32) -> Result<Self> {
        Ok(Self {
            expected: ExpectedSequence::empty(),
            sender_program: sequence::build_free_running_pattern(pattern, high, period, false)?,
            trigger_program: None,
        })
    }
}

/// Outcome of one calibration attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalibrationResult {
    /// Receiving CCIO slot
    pub slot: u8,
    /// Chosen sample offset, `-1` if none
    pub read_index: i32,
    /// Offsets of headroom on the narrower side of the run
    pub margin: u32,
    /// Condition bits, `0` on success
    pub condition: u32,
    /// Per-offset pass flags of the sweep
    pub pass: Vec<bool>,
    /// Longest passing run as `(first offset, length)`
    pub run: Option<(usize, usize)>,
}

impl CalibrationResult {
    /// Result of an attempt that found no usable offset
    pub fn failed(slot: u8, condition: u32, pass: Vec<bool>) -> Self {
        Self {
            slot,
            read_index: -1,
            margin: 0,
            condition,
            pass,
            run: None,
        }
    }

    /// Usable for latching data
    pub const fn is_valid(&self) -> bool {
        self.condition == 0 && self.margin >= 1 && self.read_index >= 0
    }

    /// Convert an invalid result into an error
    ///
    /// # Errors
    ///
    /// Returns [`DioError::CalibrationFailure`] if the result is not valid.
    pub fn into_valid(self) -> Result<Self> {
        if self.is_valid() {
            Ok(self)
        } else {
            Err(DioError::CalibrationFailure {
                slot: self.slot,
                condition: self.condition,
                margin: self.margin,
            })
        }
    }

    /// Pass flags as an offset map, `#` for pass and `.` for fail
    pub fn pass_map(&self) -> String {
        self.pass.iter().map(|&p| if p { '#' } else { '.' }).collect()
    }
}

impl fmt::Display for CalibrationResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "slot {}: read index {}, margin {}, condition {:#x} [{}]",
            self.slot,
            self.read_index,
            self.margin,
            self.condition,
            self.pass_map()
        )
    }
}

/// Read index chosen from a pass vector
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OffsetChoice {
    /// Chosen offset
    pub index: usize,
    /// `run_len / 2`
    pub margin: u32,
    /// First offset of the run
    pub run_start: usize,
    /// Length of the run
    pub run_len: usize,
}

/// Centre of the longest passing run
///
/// Ties go to the lower-indexed run; even-length runs use the lower centre.
/// Returns `None` if nothing passed.
pub fn select_read_index(pass: &[bool]) -> Option<OffsetChoice> {
    let mut best: Option<(usize, usize)> = None;
    let mut start = None;

    for (i, &ok) in pass.iter().chain(std::iter::once(&false)).enumerate() {
        match (ok, start) {
            (true, None) => start = Some(i),
            (false, Some(s)) => {
                let len = i - s;
                if best.map_or(true, |(_, l)| len > l) {
                    best = Some((s, len));
                }
                start = None;
            }
            _ => {}
        }
    }

    best.map(|(run_start, run_len)| OffsetChoice {
        index: run_start + (run_len - 1) / 2,
        margin: u32::try_from(run_len / 2).unwrap_or(u32::MAX),
        run_start,
        run_len,
    })
}

/// Calibration state machine
#[derive(Debug)]
pub struct Calibrator {
    config: CalibrationConfig,
    state: CalibrationState,
}

impl Calibrator {
    /// Idle engine
    pub const fn new(config: CalibrationConfig) -> Self {
        Self {
            config,
            state: CalibrationState::Idle,
        }
    }

    /// Current state
    pub const fn state(&self) -> CalibrationState {
        self.state
    }

    /// Parameters
    pub const fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    fn transition(&mut self, to: CalibrationState) {
        info!("calibration {} → {to}", self.state);
        self.state = to;
    }

    fn validate(&self, link: &DioLink, plan: &CalibrationPlan, sender: &dyn Instrument, receiver: &dyn Instrument) -> Result<()> {
        if link.calibrated().is_some() {
            return Err(DioError::configuration(format!(
                "link {} → {} already calibrated",
                link.sender(),
                link.receiver()
            )));
        }
        if sender.name() != link.sender().device || receiver.name() != link.receiver().device {
            return Err(DioError::configuration(format!(
                "instruments {}/{} do not match link {} → {}",
                sender.name(),
                receiver.name(),
                link.sender(),
                link.receiver()
            )));
        }
        let waits = plan
            .sender_program
            .instructions
            .iter()
            .any(|i| i.op == Op::WaitTrigger);
        if plan.expected.is_empty() && waits && plan.trigger_program.is_none() {
            return Err(DioError::configuration(
                "data-valid mode with a triggered sender needs a trigger program",
            ));
        }
        if self.config.repetitions < MIN_SETTLE_REPETITIONS {
            return Err(DioError::configuration(format!(
                "{} repetitions cannot separate signal from noise (need {MIN_SETTLE_REPETITIONS})",
                self.config.repetitions
            )));
        }
        if self.config.min_margin == 0 {
            return Err(DioError::configuration(
                "minimum margin 0 would accept an offset on a window edge",
            ));
        }
        if self.config.offsets == 0 || self.config.offsets > DIO_SAMPLE_OFFSETS {
            return Err(DioError::configuration(format!(
                "{} offsets outside 1..={DIO_SAMPLE_OFFSETS}",
                self.config.offsets
            )));
        }
        plan.sender_program.validate()?;
        if let Some(trigger) = &plan.trigger_program {
            trigger.validate()?;
        }
        Ok(())
    }

    /// Run one calibration attempt
    ///
    /// On success the accepted result is also stored in the link.
    ///
    /// # Errors
    ///
    /// Returns [`DioError::Configuration`] for an invalid plan (before any
    /// I/O) and communication errors if an instrument stops answering. A
    /// sweep without usable offsets is returned as an invalid result.
    pub fn calibrate(
        &mut self,
        link: &mut DioLink,
        plan: &CalibrationPlan,
        sender: &mut dyn Instrument,
        receiver: &mut dyn Instrument,
    ) -> Result<CalibrationResult> {
        let span = tracing::info_span!("calibrate", sender = %link.sender(), receiver = %link.receiver());
        let _enter = span.enter();

        self.state = CalibrationState::Idle;
        self.validate(link, plan, sender, receiver)?;

        match self.run(link, plan, sender, receiver) {
            Ok(result) => {
                if result.is_valid() {
                    link.mark_calibrated(result.clone())?;
                    self.transition(CalibrationState::Done);
                    info!("{result}");
                } else {
                    self.transition(CalibrationState::Failed);
                    warn!("{result}");
                }
                Ok(result)
            }
            Err(e) => {
                if matches!(self.state, CalibrationState::Running | CalibrationState::Evaluating) {
                    stop_quietly(receiver);
                    stop_quietly(sender);
                }
                self.transition(CalibrationState::Failed);
                error!("calibration aborted: {e}");
                Err(e)
            }
        }
    }

    fn run(
        &mut self,
        link: &DioLink,
        plan: &CalibrationPlan,
        sender: &mut dyn Instrument,
        receiver: &mut dyn Instrument,
    ) -> Result<CalibrationResult> {
        let slot = link.receiver().slot;
        let cfg = self.config.clone();

        self.transition(CalibrationState::Arming);
        sender.stop()?;
        receiver.stop()?;
        wait_complete(sender, cfg.stop_timeout, cfg.poll_interval)?;
        wait_complete(receiver, cfg.stop_timeout, cfg.poll_interval)?;
        sender.upload(&plan.sender_program)?;
        if let Some(trigger) = &plan.trigger_program {
            receiver.upload(trigger)?;
        }
        receiver.arm_dio_capture(&DioCapture {
            slot,
            mask: link.active_mask(),
            expected: plan.expected.pairs().to_vec(),
            repetitions: cfg.repetitions,
        })?;

        self.transition(CalibrationState::Running);
        sender.start()?;
        receiver.start()?;
        thread::sleep(cfg.settle);

        self.transition(CalibrationState::Evaluating);
        receiver.stop()?;
        sender.stop()?;
        wait_complete(receiver, cfg.stop_timeout, cfg.poll_interval)?;
        wait_complete(sender, cfg.stop_timeout, cfg.poll_interval)?;

        let mut condition = read_u32(receiver, slot, regs::SYS_ST_QUES_DIOCAL_COND)?;
        if condition != 0 && cfg.recheck_condition {
            debug!("condition {condition:#x}, re-reading");
            thread::sleep(cfg.poll_interval);
            condition = read_u32(receiver, slot, regs::SYS_ST_QUES_DIOCAL_COND)?;
        }
        let bitmap = read_u32(receiver, slot, regs::SYS_ST_OPER_DIO_PASS)?;
        let pass: Vec<bool> = (0..cfg.offsets).map(|o| bitmap & (1 << o) != 0).collect();

        if condition != 0 {
            return Ok(CalibrationResult::failed(slot, condition, pass));
        }
        let Some(choice) = select_read_index(&pass) else {
            return Ok(CalibrationResult::failed(slot, diocal_cond::NO_PASS, pass));
        };
        if choice.margin < cfg.min_margin {
            let mut result = CalibrationResult::failed(slot, diocal_cond::MARGIN_LOW, pass);
            result.run = Some((choice.run_start, choice.run_len));
            return Ok(result);
        }

        let index = u32::try_from(choice.index).unwrap_or(u32::MAX);
        if cfg.apply_read_index {
            receiver.set_dio_read_index(slot, index)?;
        }
        Ok(CalibrationResult {
            slot,
            read_index: i32::try_from(index).unwrap_or(-1),
            margin: choice.margin,
            condition: 0,
            pass,
            run: Some((choice.run_start, choice.run_len)),
        })
    }
}

/// Best-effort stop after an aborted run; the original error wins.
fn stop_quietly(instrument: &mut dyn Instrument) {
    if let Err(e) = instrument.stop() {
        warn!("{}: stop after aborted calibration failed: {e}", instrument.name());
    }
}

fn read_u32(instrument: &mut dyn Instrument, slot: u8, index: u16) -> Result<u32> {
    let raw = instrument.read_register(slot, index)?;
    Ok(u32::from_ne_bytes(raw.to_ne_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const F: bool = false;
    const T: bool = true;

    #[test]
    fn picks_centre_of_longest_run() {
        let choice = select_read_index(&[F, F, T, T, T, T, F, T, T, F]).unwrap();
        assert_eq!(choice.index, 3);
        assert_eq!(choice.margin, 2);
        assert_eq!((choice.run_start, choice.run_len), (2, 4));
    }

    #[test]
    fn ties_go_to_lower_run() {
        let choice = select_read_index(&[T, T, T, F, F, T, T, T]).unwrap();
        assert_eq!(choice.index, 1);
        assert_eq!(choice.run_start, 0);
    }

    #[test]
    fn run_reaching_the_end_counts() {
        let choice = select_read_index(&[F, F, T, T, T]).unwrap();
        assert_eq!(choice.index, 3);
        assert_eq!(choice.margin, 1);
    }

    #[test]
    fn all_fail_selects_nothing() {
        assert_eq!(select_read_index(&[F; 32]), None);
        assert_eq!(select_read_index(&[]), None);

        let result = CalibrationResult::failed(2, diocal_cond::NO_PASS, vec![F; 32]);
        assert_eq!(result.read_index, -1);
        assert_eq!(result.margin, 0);
        assert_ne!(result.condition, 0);
        assert!(matches!(
            result.into_valid(),
            Err(DioError::CalibrationFailure { slot: 2, margin: 0, .. })
        ));
    }

    #[test]
    fn margin_grows_with_the_run() {
        let run = |lo: usize, hi: usize| -> Vec<bool> { (0..32).map(|i| i >= lo && i <= hi).collect() };
        let mut prev = select_read_index(&run(10, 12)).unwrap().margin;
        for widen in 1..8 {
            let both = select_read_index(&run(10 - widen, 12 + widen)).unwrap().margin;
            assert!(both > prev, "widening both sides by {widen}");
            prev = both;
        }
        for widen in 1..8 {
            let base = select_read_index(&run(10, 12 + widen - 1)).unwrap().margin;
            let one = select_read_index(&run(10, 12 + widen)).unwrap().margin;
            assert!(one >= base);
        }
    }

    #[test]
    fn single_offset_run_has_zero_margin() {
        let choice = select_read_index(&[F, T, F]).unwrap();
        assert_eq!(choice.index, 1);
        assert_eq!(choice.margin, 0);
    }

    #[test]
    fn upstream_plan_pulses_result_bus() {
        let plan = CalibrationPlan::upstream().unwrap();
        assert_eq!(plan, CalibrationPlan::triggered_pulse(0x3FF, 3, 0x03FF_0000, 18).unwrap());
        assert!(plan.expected.is_empty());
    }

    #[test]
    fn staircase_plan_fits_period() {
        let plan = CalibrationPlan::upstream_staircase(2).unwrap();
        assert_eq!(plan.expected.pairs(), &[(1, 3), (3, 3), (0, 3)]);
        assert!(plan.trigger_program.is_some());
        // 6 steps and idle: 21 cycles, longer than the 18-cycle period
        assert!(CalibrationPlan::upstream_staircase(6).is_err());
    }

    #[test]
    fn content_plan_must_fit_period() {
        let seq = ExpectedSequence::new(vec![(0x3FF, 3), (0, 15)]).unwrap();
        assert!(CalibrationPlan::triggered_content(seq.clone(), 0x0001_0000, 18).is_err());
        assert!(CalibrationPlan::triggered_content(seq, 0x0001_0000, 20).is_ok());
    }
}
