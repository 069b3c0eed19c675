//! Feedback-loop program builder
//!
//! One iteration of the loop, on the CC:
//!
//! ```text
//!            trigger        capture     distribute   react    idle
//! readout  seq_out trig,L | in_sm sw_sm | wait smWait | pad 1  | wait idle
//! actor    pad L          | pad 2       | wait smWait | out_sm | wait idle
//!          ^ seq_bar      ^             ^             ^        ^
//! ```
//!
//! Every phase boundary is a synchronization point: each slot pads with
//! `seq_wait` to the longest slot of the phase, so all slots cross every
//! boundary on the same cycle. All durations are unsigned and padding is
//! computed by subtraction from the phase maximum, so no wait can be
//! negative.
//!
//! The distributed shared-memory write is complete
//! `L + SM_WRITE_CYCLES + SM_PROPAGATION_CYCLES` cycles into the iteration;
//! actors read it at `L + SM_WRITE_CYCLES + smWait`, with
//! `smWait = SM_PROPAGATION_CYCLES + 1 + extra`, which is always at least one
//! cycle later.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use ccdio_chip::program::{Arg, Instruction, Op, Program};
use ccdio_chip::regs::{self, questionable, TraceSource};
use ccdio_chip::timing::feedback::{
    DEFAULT_IDLE_WAIT, READOUT_LATENCY_MIN, READOUT_LATENCY_STABLE, SM_OUTPUT_CYCLES,
    SM_PROPAGATION_CYCLES, SM_WRITE_CYCLES,
};
use ccdio_chip::timing::cc_cycles_to_ns;
use tracing::{info, warn};

use crate::diagnostics::Diagnostics;
use crate::error::{DioError, Result};
use crate::instrument::{wait_complete, Instrument};

/// Readout latency against the readout instrument's measured limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LatencyMargin {
    /// Result never queued in time
    Short,
    /// Occasional `SEQ_IN_EMPTY` or `STV`
    Marginal,
    /// Production setting
    Stable,
}

/// Timing parameters of the loop, in CC cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackTiming {
    /// Trigger → result available in the input queue
    pub receiver_latency: u32,
    /// Extra cycles added to the shared-memory wait
    pub distribution_extra: u32,
    /// Idle cycles at the end of every iteration
    pub idle_wait: u32,
    /// Bus word that triggers the readout instrument
    pub trigger_pattern: u32,
}

impl Default for FeedbackTiming {
    fn default() -> Self {
        Self {
            receiver_latency: READOUT_LATENCY_STABLE,
            distribution_extra: 0,
            idle_wait: DEFAULT_IDLE_WAIT,
            trigger_pattern: 0x0001_0000,
        }
    }
}

impl FeedbackTiming {
    /// Set the readout latency
    #[must_use]
    pub const fn with_receiver_latency(mut self, cycles: u32) -> Self {
        self.receiver_latency = cycles;
        self
    }

    /// Set the extra distribution wait
    #[must_use]
    pub const fn with_distribution_extra(mut self, cycles: u32) -> Self {
        self.distribution_extra = cycles;
        self
    }

    /// Set the idle wait
    #[must_use]
    pub const fn with_idle_wait(mut self, cycles: u32) -> Self {
        self.idle_wait = cycles;
        self
    }

    /// Set the trigger word
    #[must_use]
    pub const fn with_trigger_pattern(mut self, pattern: u32) -> Self {
        self.trigger_pattern = pattern;
        self
    }

    /// Wait between `seq_sw_sm` and the first safe `seq_out_sm`
    pub const fn sm_wait(&self) -> u32 {
        SM_PROPAGATION_CYCLES + 1 + self.distribution_extra
    }

    /// Cycle at which the distributed write is visible everywhere
    pub const fn writer_complete(&self) -> u32 {
        self.receiver_latency + SM_WRITE_CYCLES + SM_PROPAGATION_CYCLES
    }

    /// Cycle at which actors read shared memory
    pub const fn consumer_read(&self) -> u32 {
        self.receiver_latency + SM_WRITE_CYCLES + self.sm_wait()
    }

    /// Cycles per iteration
    pub const fn iteration_cycles(&self) -> u32 {
        self.receiver_latency + SM_WRITE_CYCLES + self.sm_wait() + SM_OUTPUT_CYCLES + self.idle_wait
    }

    /// Where `receiver_latency` falls
    pub const fn latency_margin(&self) -> LatencyMargin {
        if self.receiver_latency < READOUT_LATENCY_MIN {
            LatencyMargin::Short
        } else if self.receiver_latency < READOUT_LATENCY_STABLE {
            LatencyMargin::Marginal
        } else {
            LatencyMargin::Stable
        }
    }

    fn validate(&self) -> Result<()> {
        if self.receiver_latency == 0 {
            return Err(DioError::configuration("receiver latency must be at least one cycle"));
        }
        match self.latency_margin() {
            LatencyMargin::Short => warn!(
                "receiver latency {} below {READOUT_LATENCY_MIN}: every read hits SEQ_IN_EMPTY",
                self.receiver_latency
            ),
            LatencyMargin::Marginal => warn!(
                "receiver latency {} below {READOUT_LATENCY_STABLE}: expect occasional SEQ_IN_EMPTY",
                self.receiver_latency
            ),
            LatencyMargin::Stable => {}
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Readout {
    slot: u8,
    sm_addr: u16,
    mux: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Actor {
    slot: u8,
    sm_addr: u16,
    lut: u32,
}

/// Builder of the multi-slot feedback program
#[derive(Debug, Clone)]
pub struct FeedbackBuilder {
    timing: FeedbackTiming,
    readouts: Vec<Readout>,
    actors: Vec<Actor>,
    iterations: u32,
}

/// A built feedback loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackProgram {
    /// Slot-prefixed CC program
    pub program: Program,
    /// Slots taking part
    pub slots: BTreeSet<u8>,
    /// What each slot executes
    pub per_slot: BTreeMap<u8, Program>,
    /// Timing used
    pub timing: FeedbackTiming,
    /// Loop count
    pub iterations: u32,
    /// Cycles per iteration
    pub cycles_per_iteration: u32,
    /// Nanoseconds per iteration
    pub ns_per_iteration: u64,
    /// Nanoseconds for all iterations
    pub total_ns: u64,
}

impl FeedbackProgram {
    /// Completion deadline: twice the run time plus half a second
    pub fn suggested_timeout(&self) -> Duration {
        Duration::from_nanos(self.total_ns.saturating_mul(2)) + Duration::from_millis(500)
    }

    /// Timeline cycles one slot spends in the loop body
    ///
    /// # Errors
    ///
    /// Returns an error if the slot's program references an undefined constant.
    pub fn slot_iteration_cycles(&self, slot: u8) -> Result<u32> {
        let view = self.program.slot_view(slot);
        let start = view.find_label(LOOP).unwrap_or(0);
        let mut total = 0;
        for instr in &view.instructions[start..] {
            if matches!(instr.op, Op::Loop { .. }) {
                break;
            }
            total += view.cycles(&instr.op)?;
        }
        Ok(total)
    }
}

const LOOP: &str = "loop";
const DEF_ITER: &str = "numIter";
const DEF_LATENCY: &str = "uhfLatency";
const DEF_SM_WAIT: &str = "smWait";
const DEF_IDLE: &str = "wait";

fn wait(duration: impl Into<Arg>) -> Op {
    Op::SeqWait {
        duration: duration.into(),
    }
}

impl FeedbackBuilder {
    /// Empty loop with the given timing, one iteration
    pub const fn new(timing: FeedbackTiming) -> Self {
        Self {
            timing,
            readouts: Vec::new(),
            actors: Vec::new(),
            iterations: 1,
        }
    }

    /// Slot that triggers the readout instrument and stores its result at
    /// `sm_addr`, selecting input `mux`
    #[must_use]
    pub fn readout(mut self, slot: u8, sm_addr: u16, mux: u32) -> Self {
        self.readouts.push(Readout { slot, sm_addr, mux });
        self
    }

    /// Slot that outputs through lookup table `lut` indexed by `sm_addr`
    #[must_use]
    pub fn actor(mut self, slot: u8, sm_addr: u16, lut: u32) -> Self {
        self.actors.push(Actor { slot, sm_addr, lut });
        self
    }

    /// Loop count
    #[must_use]
    pub const fn iterations(mut self, n: u32) -> Self {
        self.iterations = n;
        self
    }

    fn validate(&self) -> Result<()> {
        self.timing.validate()?;
        if self.readouts.is_empty() || self.actors.is_empty() {
            return Err(DioError::configuration("feedback needs a readout slot and an actor slot"));
        }
        if self.iterations == 0 {
            return Err(DioError::configuration("feedback needs at least one iteration"));
        }
        let mut seen = BTreeSet::new();
        for slot in self
            .readouts
            .iter()
            .map(|r| r.slot)
            .chain(self.actors.iter().map(|a| a.slot))
        {
            if slot > regs::MAX_SLOT {
                return Err(DioError::configuration(format!("slot {slot} out of range")));
            }
            if !seen.insert(slot) {
                return Err(DioError::configuration(format!("slot {slot} used twice")));
            }
        }
        for actor in &self.actors {
            if !self.readouts.iter().any(|r| r.sm_addr == actor.sm_addr) {
                return Err(DioError::configuration(format!(
                    "slot {} reads S{} which no readout writes",
                    actor.slot, actor.sm_addr
                )));
            }
        }
        Ok(())
    }

    /// Emit the program
    ///
    /// # Errors
    ///
    /// Returns [`DioError::Configuration`] for missing or duplicate slots, an
    /// actor reading an unwritten address, zero iterations or zero latency.
    pub fn build(self) -> Result<FeedbackProgram> {
        self.validate()?;
        let t = self.timing;

        let mut p = Program::new("feedback loop");
        p.def(DEF_ITER, self.iterations)
            .def(DEF_LATENCY, t.receiver_latency)
            .def(DEF_SM_WAIT, t.sm_wait())
            .def(DEF_IDLE, t.idle_wait);

        p.push(Instruction::new(Op::Move { value: DEF_ITER.into(), reg: 0 }));
        p.push(Instruction::new(Op::SeqBar).labelled(LOOP).commented("iteration start"));

        // trigger
        for r in &self.readouts {
            p.push(
                Instruction::new(Op::SeqOut {
                    pattern: t.trigger_pattern.into(),
                    duration: DEF_LATENCY.into(),
                })
                .on_slot(r.slot)
                .commented("trigger readout"),
            );
        }
        for a in &self.actors {
            p.push(Instruction::new(wait(DEF_LATENCY)).on_slot(a.slot));
        }

        // capture
        for r in &self.readouts {
            p.push(
                Instruction::new(Op::SeqInSm { addr: r.sm_addr, mux: r.mux.into(), size: 0 })
                    .on_slot(r.slot)
                    .commented("latch result"),
            );
            p.push(Instruction::new(Op::SeqSwSm { addr: r.sm_addr }).on_slot(r.slot));
        }
        for a in &self.actors {
            p.push(Instruction::new(wait(SM_WRITE_CYCLES)).on_slot(a.slot));
        }

        // distribute
        p.push(Instruction::new(wait(DEF_SM_WAIT)).commented("shared memory settles"));

        // react
        for a in &self.actors {
            p.push(
                Instruction::new(Op::SeqOutSm {
                    addr: a.sm_addr,
                    lut: a.lut.into(),
                    duration: SM_OUTPUT_CYCLES.into(),
                })
                .on_slot(a.slot)
                .commented("conditional output"),
            );
        }
        for r in &self.readouts {
            p.push(Instruction::new(wait(SM_OUTPUT_CYCLES)).on_slot(r.slot));
        }

        // idle
        p.push(Instruction::new(wait(DEF_IDLE)));
        p.push(Instruction::new(Op::Loop { reg: 0, target: LOOP.into() }));
        p.push(Instruction::new(Op::Stop));
        p.validate()?;

        let slots = p.slots();
        let per_slot = slots.iter().map(|&s| (s, p.slot_view(s))).collect();
        let cycles = t.iteration_cycles();
        let ns = cc_cycles_to_ns(u64::from(cycles));
        info!(
            "feedback: {} slots, {cycles} cycles ({ns} ns) per iteration, {} iterations",
            slots.len(),
            self.iterations
        );

        Ok(FeedbackProgram {
            program: p,
            slots,
            per_slot,
            timing: t,
            iterations: self.iterations,
            cycles_per_iteration: cycles,
            ns_per_iteration: ns,
            total_ns: ns * u64::from(self.iterations),
        })
    }
}

/// What a feedback run left behind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedbackReport {
    /// Questionable status word after completion
    pub status: u32,
    /// Drained error queue
    pub errors: Vec<String>,
}

/// Upload, trace, run to completion and check for device faults
///
/// `readout_program` is run on the readout instrument for the duration of
/// the loop. With `trace_depth > 0`, every trace source is enabled on every
/// participating slot.
///
/// # Errors
///
/// Returns [`DioError::ProtocolViolation`] carrying the raw status word if
/// the CC flags `SEQ_IN_EMPTY` or `STV`, [`DioError::Timeout`] if the loop
/// does not complete in time, and communication errors.
pub fn run_feedback(
    cc: &mut dyn Instrument,
    readout: &mut dyn Instrument,
    feedback: &FeedbackProgram,
    readout_program: &Program,
    trace_depth: u32,
) -> Result<FeedbackReport> {
    let span = tracing::info_span!("feedback", iterations = feedback.iterations);
    let _enter = span.enter();
    let poll = Duration::from_millis(10);

    cc.stop()?;
    readout.stop()?;
    cc.clear_status()?;
    readout.upload(readout_program)?;
    cc.upload(&feedback.program)?;

    if trace_depth > 0 {
        let mut diag = Diagnostics::new(cc);
        for &slot in &feedback.slots {
            for source in TraceSource::ALL {
                diag.trace_on(slot, source, trace_depth)?;
            }
        }
    }

    readout.start()?;
    cc.start()?;
    let done = wait_complete(cc, feedback.suggested_timeout(), poll);
    readout.stop()?;
    done?;

    let status = cc.questionable_condition()?;
    let errors = Diagnostics::new(cc).drain_errors()?;
    let faults = status & (questionable::SEQ_IN_EMPTY | questionable::STV);
    if faults != 0 {
        return Err(DioError::protocol(
            "feedback loop reported sequencer faults",
            format!("{status:#x} {}", errors.join("; ")),
        ));
    }
    info!("feedback complete, status {status:#x}");
    Ok(FeedbackReport { status, errors })
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccdio_chip::program::Syntax;

    fn demo(timing: FeedbackTiming) -> FeedbackProgram {
        FeedbackBuilder::new(timing)
            .readout(2, 16, 0)
            .actor(3, 16, 0)
            .iterations(4)
            .build()
            .unwrap()
    }

    #[test]
    fn consumer_never_before_writer() {
        for latency in 1..=32 {
            for extra in 0..=8 {
                let t = FeedbackTiming::default()
                    .with_receiver_latency(latency)
                    .with_distribution_extra(extra);
                assert!(t.consumer_read() >= t.writer_complete() + 1);
                let fb = demo(t);
                for &slot in &fb.slots {
                    assert_eq!(fb.slot_iteration_cycles(slot).unwrap(), fb.cycles_per_iteration);
                }
            }
        }
    }

    #[test]
    fn default_iteration_timing() {
        let fb = demo(FeedbackTiming::default());
        // 11 + 2 + 2 + 1 + 100
        assert_eq!(fb.cycles_per_iteration, 116);
        assert_eq!(fb.ns_per_iteration, 2320);
        assert_eq!(fb.total_ns, 4 * 2320);
        assert!(fb.suggested_timeout() > Duration::from_nanos(fb.total_ns));
    }

    #[test]
    fn renders_slot_prefixed_assembly() {
        let fb = demo(FeedbackTiming::default());
        let text = fb.program.render(Syntax::Cc).unwrap();
        assert!(text.contains(".DEF    uhfLatency  11"));
        assert!(text.contains("[2] seq_out     0x00010000,$uhfLatency"));
        assert!(text.contains("[2] seq_in_sm   S16,0,0"));
        assert!(text.contains("[3] seq_out_sm  S16,0,1"));
        assert!(text.contains("loop        R0,@loop"));
        assert_eq!(fb.per_slot.len(), 2);
    }

    #[test]
    fn latency_margin_bands() {
        let margin = |cycles| FeedbackTiming::default().with_receiver_latency(cycles).latency_margin();
        assert_eq!(margin(1), LatencyMargin::Short);
        assert_eq!(margin(READOUT_LATENCY_MIN - 1), LatencyMargin::Short);
        assert_eq!(margin(READOUT_LATENCY_MIN), LatencyMargin::Marginal);
        assert_eq!(margin(READOUT_LATENCY_STABLE), LatencyMargin::Stable);
        assert_eq!(FeedbackTiming::default().latency_margin(), LatencyMargin::Stable);
    }

    #[test]
    fn zero_latency_rejected() {
        let err = FeedbackBuilder::new(FeedbackTiming::default().with_receiver_latency(0))
            .readout(2, 16, 0)
            .actor(3, 16, 0)
            .build()
            .unwrap_err();
        assert!(matches!(err, DioError::Configuration { .. }));
    }

    #[test]
    fn actor_must_read_written_address() {
        let err = FeedbackBuilder::new(FeedbackTiming::default())
            .readout(2, 16, 0)
            .actor(3, 17, 0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("S17"));
    }

    #[test]
    fn duplicate_slot_rejected() {
        assert!(FeedbackBuilder::new(FeedbackTiming::default())
            .readout(2, 16, 0)
            .actor(2, 16, 0)
            .build()
            .is_err());
    }
}
