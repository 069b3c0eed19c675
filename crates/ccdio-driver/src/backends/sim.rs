//! Simulated lab
//!
//! Every [`SimInstrument`] attached to the same [`SimBus`] shares one
//! in-memory lab: uploaded programs, run state, CCIO registers and the DIO
//! wiring between devices. No hardware, no sockets; CI runs calibration and
//! feedback end to end against it.
//!
//! ## Timing model
//!
//! Time is counted in sequencer cycles. A sender's program is reduced to a
//! *frame*: the `seq_out`/`seq_wait` segments of its loop body. Triggered
//! frames restart on every trigger edge, with the trigger period taken from
//! the receiver's own running program; free-running frames repeat with their
//! own length.
//!
//! A receiving CCIO slot sweeps [`DIO_SAMPLE_OFFSETS`] offsets, one cycle
//! apart, across one frame. The wire delays the sender by
//! [`SimConfig::link_delay`] cycles; odd repetitions see an extra
//! [`SimConfig::edge_jitter`]. Offsets past the end of the frame are not
//! sampled.
//!
//! ```text
//! sender   ▁▁▁███▁▁▁▁▁▁▁▁▁▁▁▁▁▁▁▁▁▁▁███▁▁▁▁▁    frame = trigger period
//! offset   0    5  8                  17     delay 5 → offsets 5..=7 pass
//! ```
//!
//! Feedback programs are checked when the CC starts them: a `seq_in_sm`
//! issued fewer than [`SimConfig::min_readout_latency`] cycles after the
//! trigger raises `SEQ_IN_EMPTY`; a `seq_out_sm` issued before the
//! distributed write is visible raises `STV`.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use ccdio_chip::program::{Op, Program, Syntax};
use ccdio_chip::regs::{self, diocal_cond, questionable, TraceSource};
use ccdio_chip::timing::feedback::{READOUT_LATENCY_STABLE, SM_PROPAGATION_CYCLES};
use ccdio_chip::timing::DIO_SAMPLE_OFFSETS;
use tracing::{debug, info, warn};

use crate::error::{DioError, Result};
use crate::instrument::{terminated_instructions, DeviceRole, DioCapture, Identity, Instrument};

/// Simulated lab behaviour and fault injection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimConfig {
    /// Wire delay sender → receiver, in cycles
    pub link_delay: u32,
    /// Extra delay on odd repetitions, in cycles
    pub edge_jitter: u32,
    /// Trigger → `seq_in_sm` cycles needed before a result is queued
    pub min_readout_latency: u32,
    /// Condition bits reported on every read (persistent fault)
    pub stuck_condition: Option<u32>,
    /// Condition bits reported on the first read only (transient glitch)
    pub transient_condition: Option<u32>,
    /// Fail every instrument call after this many calls (link loss)
    pub fail_after_calls: Option<usize>,
    /// Device whose sequencer refuses to start
    pub refused_start: Option<String>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            link_delay: 5,
            edge_jitter: 0,
            min_readout_latency: READOUT_LATENCY_STABLE,
            stuck_condition: None,
            transient_condition: None,
            fail_after_calls: None,
            refused_start: None,
        }
    }
}

impl SimConfig {
    /// Set the wire delay
    #[must_use]
    pub const fn with_link_delay(mut self, cycles: u32) -> Self {
        self.link_delay = cycles;
        self
    }

    /// Set the odd-repetition jitter
    #[must_use]
    pub const fn with_edge_jitter(mut self, cycles: u32) -> Self {
        self.edge_jitter = cycles;
        self
    }

    /// Set the readout latency threshold
    #[must_use]
    pub const fn with_min_readout_latency(mut self, cycles: u32) -> Self {
        self.min_readout_latency = cycles;
        self
    }

    /// Report `bits` on every condition read
    #[must_use]
    pub const fn with_stuck_condition(mut self, bits: u32) -> Self {
        self.stuck_condition = Some(bits);
        self
    }

    /// Report `bits` on the first condition read after a sweep
    #[must_use]
    pub const fn with_transient_condition(mut self, bits: u32) -> Self {
        self.transient_condition = Some(bits);
        self
    }

    /// Lose the link after `calls` instrument calls
    #[must_use]
    pub const fn with_fail_after_calls(mut self, calls: usize) -> Self {
        self.fail_after_calls = Some(calls);
        self
    }

    /// Make `device` fail every `start`
    #[must_use]
    pub fn with_refused_start(mut self, device: &str) -> Self {
        self.refused_start = Some(device.to_string());
        self
    }
}

/// One DIO cable: sender port drives receiver port
#[derive(Debug, Clone, PartialEq, Eq)]
struct Wire {
    sender: String,
    sender_slot: u8,
    receiver: String,
    receiver_slot: u8,
}

#[derive(Debug, Default)]
struct SlotState {
    capture: Option<DioCapture>,
    condition: u32,
    condition_reads: u32,
    pass: u32,
    read_index: i32,
    traces: BTreeMap<u8, u32>,
    marker_in: Option<u8>,
    marker_out: Option<u8>,
}

#[derive(Debug)]
struct SimDevice {
    role: DeviceRole,
    program: Option<Program>,
    source: Option<String>,
    instructions: Vec<u32>,
    running: bool,
    finished: bool,
    questionable: u32,
    questionable_enable: u32,
    errors: VecDeque<String>,
    slots: BTreeMap<u8, SlotState>,
}

impl SimDevice {
    fn new(role: DeviceRole) -> Self {
        Self {
            role,
            program: None,
            source: None,
            instructions: Vec::new(),
            running: false,
            finished: false,
            questionable: 0,
            questionable_enable: 0,
            errors: VecDeque::new(),
            slots: BTreeMap::new(),
        }
    }

    fn slot(&mut self, slot: u8) -> &mut SlotState {
        self.slots.entry(slot).or_insert_with(|| SlotState {
            read_index: -1,
            ..SlotState::default()
        })
    }

    /// Program as one slot executes it.
    fn view(&self, slot: u8) -> Option<Program> {
        let program = self.program.as_ref()?;
        Some(match self.role {
            DeviceRole::Sequencer => program.slot_view(slot),
            DeviceRole::Readout | DeviceRole::WaveformGenerator => program.clone(),
        })
    }
}

#[derive(Debug)]
struct SimLab {
    config: SimConfig,
    devices: BTreeMap<String, SimDevice>,
    wires: Vec<Wire>,
    calls: usize,
}

/// Shared state of one simulated lab
#[derive(Debug, Clone)]
pub struct SimBus {
    inner: Arc<Mutex<SimLab>>,
}

impl PartialEq for SimBus {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for SimBus {}

impl Default for SimBus {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl SimBus {
    /// Empty lab with no wiring
    pub fn new(config: SimConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimLab {
                config,
                devices: BTreeMap::new(),
                wires: Vec::new(),
                calls: 0,
            })),
        }
    }

    /// Connect `sender`/`sender_slot` to `receiver`/`receiver_slot`
    #[must_use]
    pub fn wire(self, sender: &str, sender_slot: u8, receiver: &str, receiver_slot: u8) -> Self {
        if let Ok(mut lab) = self.inner.lock() {
            lab.wires.push(Wire {
                sender: sender.to_string(),
                sender_slot,
                receiver: receiver.to_string(),
                receiver_slot,
            });
        }
        self
    }

    /// Program currently uploaded to `device`
    pub fn program(&self, device: &str) -> Option<Program> {
        let lab = self.inner.lock().ok()?;
        lab.devices.get(device)?.program.clone()
    }

    /// Source text last uploaded to `device`
    pub fn source(&self, device: &str) -> Option<String> {
        let lab = self.inner.lock().ok()?;
        lab.devices.get(device)?.source.clone()
    }

    /// Instruction words last uploaded to `device`, stop word included
    pub fn instructions(&self, device: &str) -> Vec<u32> {
        self.inner
            .lock()
            .ok()
            .and_then(|lab| lab.devices.get(device).map(|d| d.instructions.clone()))
            .unwrap_or_default()
    }

    /// True while `device`'s sequencer runs
    pub fn is_running(&self, device: &str) -> bool {
        self.inner
            .lock()
            .ok()
            .and_then(|lab| lab.devices.get(device).map(|d| d.running))
            .unwrap_or(false)
    }

    /// Questionable enable mask of `device`
    pub fn questionable_enable(&self, device: &str) -> u32 {
        self.inner
            .lock()
            .ok()
            .and_then(|lab| lab.devices.get(device).map(|d| d.questionable_enable))
            .unwrap_or(0)
    }

    /// Trace depth enabled on a slot and source, if any
    pub fn trace_depth(&self, device: &str, slot: u8, source: TraceSource) -> Option<u32> {
        let lab = self.inner.lock().ok()?;
        lab.devices
            .get(device)?
            .slots
            .get(&slot)?
            .traces
            .get(&source.index())
            .copied()
    }

    /// Marker bits routed on a slot: `(in, out)`
    pub fn markers(&self, device: &str, slot: u8) -> (Option<u8>, Option<u8>) {
        self.inner
            .lock()
            .ok()
            .and_then(|lab| {
                let s = lab.devices.get(device)?.slots.get(&slot)?;
                Some((s.marker_in, s.marker_out))
            })
            .unwrap_or((None, None))
    }
}

/// Output segments of a program's steady-state loop.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Frame {
    needs_trigger: bool,
    triggered: bool,
    repeats: bool,
    segments: Vec<(u32, u32)>,
}

impl Frame {
    fn of(program: &Program) -> Result<Self> {
        let instrs = &program.instructions;
        let needs_trigger = instrs.iter().any(|i| i.op == Op::WaitTrigger);
        let (start, end, repeats) =
            match instrs.iter().rposition(|i| matches!(i.op, Op::Jmp { .. })) {
                Some(j) => {
                    let target = instrs[j].op.target().unwrap_or_default();
                    let start = program.find_label(target).ok_or_else(|| {
                        DioError::configuration(format!("undefined label @{target}"))
                    })?;
                    (start.min(j), j, true)
                }
                None => (0, instrs.len(), false),
            };

        let mut frame = Self {
            needs_trigger,
            repeats,
            ..Self::default()
        };
        let mut level = 0;
        for instr in &instrs[start..end] {
            match &instr.op {
                Op::WaitTrigger => frame.triggered = true,
                Op::SeqOut { pattern, duration } => {
                    level = program.resolve(pattern)?;
                    frame.segments.push((level, program.resolve(duration)?));
                }
                Op::SeqWait { duration } => frame.segments.push((level, program.resolve(duration)?)),
                Op::Stop => break,
                _ => {}
            }
        }
        Ok(frame)
    }

    fn length(&self) -> u32 {
        self.segments.iter().map(|&(_, d)| d).sum()
    }

    fn level_at(&self, t: u32) -> u32 {
        let mut acc = 0;
        for &(pattern, duration) in &self.segments {
            acc += duration;
            if t < acc {
                return pattern;
            }
        }
        self.segments.last().map_or(0, |&(p, _)| p)
    }
}

/// Sender activity seen on a wire.
#[derive(Debug)]
struct Drive {
    frame: Frame,
    period: u32,
    available: u32,
}

impl SimLab {
    fn device(&mut self, name: &str, role: DeviceRole) -> &mut SimDevice {
        self.devices
            .entry(name.to_string())
            .or_insert_with(|| SimDevice::new(role))
    }

    fn tick(&mut self, name: &str) -> Result<()> {
        self.calls += 1;
        match self.config.fail_after_calls {
            Some(limit) if self.calls > limit => {
                Err(DioError::communication(name, "simulated link loss"))
            }
            _ => Ok(()),
        }
    }

    /// Free-running output period of a running device slot, used as trigger.
    fn trigger_period(&self, device: &str, slot: u8) -> Result<Option<u32>> {
        let Some(dev) = self.devices.get(device).filter(|d| d.running) else {
            return Ok(None);
        };
        let Some(program) = dev.view(slot) else {
            return Ok(None);
        };
        let frame = Frame::of(&program)?;
        let fires = frame.segments.iter().any(|&(p, _)| p != 0);
        Ok((frame.repeats && !frame.triggered && fires && frame.length() > 0).then(|| frame.length()))
    }

    fn drive(&self, receiver: &str, receiver_slot: u8) -> Result<Option<Drive>> {
        let Some(wire) = self
            .wires
            .iter()
            .find(|w| w.receiver == receiver && w.receiver_slot == receiver_slot)
        else {
            return Ok(None);
        };
        let Some(sender) = self.devices.get(&wire.sender).filter(|d| d.running) else {
            return Ok(None);
        };
        let Some(program) = sender.view(wire.sender_slot) else {
            return Ok(None);
        };
        let frame = Frame::of(&program)?;

        let trigger = if frame.needs_trigger {
            match self.trigger_period(receiver, receiver_slot)? {
                Some(period) => Some(period),
                None => return Ok(None),
            }
        } else {
            None
        };
        let period = match (frame.triggered, trigger) {
            (true, Some(period)) => period,
            _ => frame.length(),
        };
        if period == 0 {
            return Ok(None);
        }
        let available = if frame.repeats { u32::MAX } else { 1 };
        Ok(Some(Drive {
            frame,
            period,
            available,
        }))
    }

    /// Sweep all offsets; returns `(condition, pass bitmap)`.
    fn sweep(&self, capture: &DioCapture, drive: Option<&Drive>) -> (u32, u32) {
        let Some(drive) = drive else {
            return (diocal_cond::NO_SIGNAL, 0);
        };
        if drive.available < capture.repetitions {
            return (diocal_cond::INCOMPLETE, 0);
        }

        let mut condition = 0;
        if drive.frame.segments.iter().any(|&(p, _)| p & !capture.mask != 0) {
            condition |= diocal_cond::STRAY_BITS;
        }

        let period = drive.period;
        let offsets = u32::try_from(DIO_SAMPLE_OFFSETS).unwrap_or(u32::MAX).min(period);
        let mut pass = 0u32;
        let mut seen = false;
        let mut partial = false;

        for offset in 0..offsets {
            let mut hits = 0;
            for rep in 0..capture.repetitions {
                let jitter = if rep % 2 == 1 { self.config.edge_jitter } else { 0 };
                let delay = (self.config.link_delay + jitter) % period;
                let sample = |t: u32| drive.frame.level_at((t + period - delay) % period) & capture.mask;

                let ok = if capture.expected.is_empty() {
                    let v = sample(offset);
                    seen |= v != 0;
                    v != 0
                } else {
                    let mut at = offset;
                    let mut all = true;
                    for &(pattern, hold) in &capture.expected {
                        let v = sample(at);
                        seen |= v != 0;
                        all &= v == pattern & capture.mask;
                        at += hold;
                    }
                    all
                };
                if ok {
                    hits += 1;
                }
            }
            if hits == capture.repetitions {
                pass |= 1 << offset;
            } else if hits > 0 {
                partial = true;
            }
        }

        if !seen {
            condition |= diocal_cond::NO_SIGNAL;
        } else if pass == 0 && partial {
            condition |= diocal_cond::UNSTABLE;
        }
        (condition, pass)
    }

    /// Feedback timing faults of a CC program: `(questionable bit, message)`.
    fn feedback_faults(&self, program: &Program) -> Result<Vec<(u32, String)>> {
        let readout_running = self
            .devices
            .values()
            .any(|d| d.role == DeviceRole::Readout && d.running);
        let mut faults = Vec::new();
        let mut writer_done: Option<u32> = None;
        let mut readers = Vec::new();

        for slot in program.slots() {
            let view = program.slot_view(slot);
            let mut t: u32 = 0;
            let mut last_out: u32 = 0;
            for instr in &view.instructions {
                match &instr.op {
                    Op::Loop { .. } | Op::Jmp { .. } | Op::Stop => break,
                    Op::SeqOut { .. } => last_out = t,
                    Op::SeqInSm { .. } => {
                        let latency = t.saturating_sub(last_out);
                        if !readout_running || latency < self.config.min_readout_latency {
                            faults.push((
                                questionable::SEQ_IN_EMPTY,
                                format!("SEQ_IN_EMPTY on slot {slot}: no result {latency} cycles after trigger"),
                            ));
                        }
                    }
                    Op::SeqSwSm { .. } => {
                        let done = t + 1 + SM_PROPAGATION_CYCLES;
                        writer_done = Some(writer_done.map_or(done, |w| w.max(done)));
                    }
                    Op::SeqOutSm { .. } => readers.push((slot, t)),
                    _ => {}
                }
                t += view.cycles(&instr.op)?;
            }
        }

        if let Some(done) = writer_done {
            for (slot, t) in readers {
                if t < done {
                    faults.push((
                        questionable::STV,
                        format!("STV on slot {slot}: seq_out_sm at cycle {t}, data visible at {done}"),
                    ));
                }
            }
        }
        Ok(faults)
    }
}

/// Pass-run length containing `index`, halved.
fn margin_around(pass: u32, index: i32) -> u32 {
    let Ok(index) = u32::try_from(index) else {
        return 0;
    };
    if index >= 32 || pass & (1 << index) == 0 {
        return 0;
    }
    let mut lo = index;
    while lo > 0 && pass & (1 << (lo - 1)) != 0 {
        lo -= 1;
    }
    let mut hi = index;
    while hi < 31 && pass & (1 << (hi + 1)) != 0 {
        hi += 1;
    }
    (hi - lo + 1) / 2
}

/// Instrument living in a [`SimBus`]
#[derive(Debug)]
pub struct SimInstrument {
    name: String,
    role: DeviceRole,
    bus: SimBus,
}

impl SimInstrument {
    /// Attach a device to the lab
    pub fn new(name: &str, role: DeviceRole, bus: SimBus) -> Self {
        if let Ok(mut lab) = bus.inner.lock() {
            lab.device(name, role);
        }
        Self {
            name: name.to_string(),
            role,
            bus,
        }
    }

    fn lab(&self) -> Result<MutexGuard<'_, SimLab>> {
        let mut lab = self
            .bus
            .inner
            .lock()
            .map_err(|_| DioError::communication(&self.name, "simulated bus poisoned"))?;
        lab.tick(&self.name)?;
        Ok(lab)
    }

    fn with_device<R>(&self, f: impl FnOnce(&mut SimDevice) -> R) -> Result<R> {
        let mut lab = self.lab()?;
        Ok(f(lab.device(&self.name, self.role)))
    }

    fn check_slot(&self, slot: u8) -> Result<()> {
        if slot > regs::MAX_SLOT {
            return Err(DioError::configuration(format!(
                "{}: slot {slot} out of range 0..={}",
                self.name,
                regs::MAX_SLOT
            )));
        }
        Ok(())
    }

    const fn syntax(&self) -> Syntax {
        match self.role {
            DeviceRole::Sequencer => Syntax::Cc,
            DeviceRole::Readout | DeviceRole::WaveformGenerator => Syntax::SeqC,
        }
    }
}

impl Instrument for SimInstrument {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> DeviceRole {
        self.role
    }

    fn reset(&mut self) -> Result<()> {
        let role = self.role;
        self.with_device(|dev| *dev = SimDevice::new(role))
    }

    fn clear_status(&mut self) -> Result<()> {
        self.with_device(|dev| {
            dev.errors.clear();
            dev.questionable = 0;
        })
    }

    fn identity(&mut self) -> Result<Identity> {
        drop(self.lab()?);
        let (vendor, model) = match self.role {
            DeviceRole::Sequencer => ("QuTech", "CC-SIM"),
            DeviceRole::Readout => ("Zurich Instruments", "UHFQA-SIM"),
            DeviceRole::WaveformGenerator => ("Zurich Instruments", "HDAWG-SIM"),
        };
        Ok(Identity {
            vendor: vendor.to_string(),
            model: model.to_string(),
            serial: format!("SIM-{}", self.name),
            firmware: env!("CARGO_PKG_VERSION").to_string(),
        })
    }

    fn error_count(&mut self) -> Result<u32> {
        self.with_device(|dev| u32::try_from(dev.errors.len()).unwrap_or(u32::MAX))
    }

    fn next_error(&mut self) -> Result<String> {
        self.with_device(|dev| {
            dev.errors
                .pop_front()
                .unwrap_or_else(|| "0,\"No error\"".to_string())
        })
    }

    fn start(&mut self) -> Result<()> {
        let mut lab = self.lab()?;
        if lab.config.refused_start.as_deref() == Some(self.name.as_str()) {
            return Err(DioError::communication(&self.name, "simulated start refused"));
        }
        let program = lab.device(&self.name, self.role).program.clone();
        let faults = match (&program, self.role) {
            (Some(p), DeviceRole::Sequencer) => lab.feedback_faults(p)?,
            _ => Vec::new(),
        };
        let terminates = program
            .as_ref()
            .is_some_and(|p| !p.instructions.iter().any(|i| matches!(i.op, Op::Jmp { .. })));

        let dev = lab.device(&self.name, self.role);
        for (bit, message) in faults {
            warn!("{}: {message}", self.name);
            dev.questionable |= bit;
            dev.errors.push_back(format!("-300,\"{message}\""));
        }
        dev.running = true;
        dev.finished = terminates;
        info!("{}: sim start", self.name);
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        let mut lab = self.lab()?;
        let was_running = lab.device(&self.name, self.role).running;
        let armed: Vec<(u8, DioCapture)> = lab
            .device(&self.name, self.role)
            .slots
            .iter()
            .filter_map(|(&slot, s)| s.capture.clone().map(|c| (slot, c)))
            .collect();

        let mut results = Vec::new();
        for (slot, capture) in armed {
            let outcome = if was_running {
                let drive = lab.drive(&self.name, slot)?;
                lab.sweep(&capture, drive.as_ref())
            } else {
                (diocal_cond::INCOMPLETE, 0)
            };
            debug!(
                "{}: slot {slot} sweep condition {:#x} pass {:#010x}",
                self.name, outcome.0, outcome.1
            );
            results.push((slot, outcome));
        }

        let dev = lab.device(&self.name, self.role);
        for (slot, (condition, pass)) in results {
            let s = dev.slot(slot);
            s.capture = None;
            s.condition = condition;
            s.condition_reads = 0;
            s.pass = pass;
        }
        dev.running = false;
        info!("{}: sim stop", self.name);
        Ok(())
    }

    fn operation_complete(&mut self) -> Result<bool> {
        self.with_device(|dev| !dev.running || dev.finished)
    }

    fn upload(&mut self, program: &Program) -> Result<()> {
        let text = program.render(self.syntax())?;
        debug!("{}: sim program '{}'\n{text}", self.name, program.title);
        self.with_device(|dev| {
            dev.program = Some(program.clone());
            dev.source = Some(text);
        })
    }

    fn upload_source(&mut self, source: &str) -> Result<()> {
        self.with_device(|dev| {
            dev.program = None;
            dev.source = Some(source.to_string());
        })
    }

    fn upload_instructions(&mut self, words: &[u32]) -> Result<()> {
        let words = terminated_instructions(words)?;
        self.with_device(|dev| {
            dev.program = None;
            dev.instructions = words;
        })
    }

    fn read_register(&mut self, slot: u8, index: u16) -> Result<i32> {
        self.check_slot(slot)?;
        if index >= regs::CCIO_REG_COUNT {
            return Err(DioError::protocol(
                format!("register {index} out of range"),
                "-222,\"Data out of range\"",
            ));
        }
        let mut lab = self.lab()?;
        let stuck = lab.config.stuck_condition.unwrap_or(0);
        let transient = lab.config.transient_condition.unwrap_or(0);
        let s = lab.device(&self.name, self.role).slot(slot);
        let value = match index {
            regs::SYS_ST_QUES_DIOCAL_COND => {
                let glitch = if s.condition_reads == 0 { transient } else { 0 };
                s.condition_reads += 1;
                s.condition | stuck | glitch
            }
            regs::SYS_ST_OPER_DIO_RD_INDEX => return Ok(s.read_index),
            regs::SYS_ST_OPER_DIO_MARGIN => margin_around(s.pass, s.read_index),
            regs::SYS_ST_OPER_DIO_PASS => s.pass,
            _ => 0,
        };
        Ok(i32::from_ne_bytes(value.to_ne_bytes()))
    }

    fn arm_dio_capture(&mut self, capture: &DioCapture) -> Result<()> {
        self.check_slot(capture.slot)?;
        self.with_device(|dev| {
            let s = dev.slot(capture.slot);
            s.capture = Some(capture.clone());
            s.condition = 0;
            s.pass = 0;
        })
    }

    fn set_dio_read_index(&mut self, slot: u8, index: u32) -> Result<()> {
        self.check_slot(slot)?;
        let index = i32::try_from(index)
            .map_err(|_| DioError::configuration(format!("read index {index} out of range")))?;
        self.with_device(|dev| dev.slot(slot).read_index = index)
    }

    fn questionable_condition(&mut self) -> Result<u32> {
        self.with_device(|dev| {
            let diocal = dev.slots.values().any(|s| s.condition != 0);
            dev.questionable | if diocal { questionable::DIOCAL } else { 0 }
        })
    }

    fn enable_questionable(&mut self, mask: u32) -> Result<()> {
        self.with_device(|dev| dev.questionable_enable = mask)
    }

    fn trace_on(&mut self, slot: u8, source: TraceSource, depth: u32) -> Result<()> {
        self.check_slot(slot)?;
        self.with_device(|dev| {
            dev.slot(slot).traces.insert(source.index(), depth);
        })
    }

    fn trace_off(&mut self, slot: u8, source: TraceSource) -> Result<()> {
        self.check_slot(slot)?;
        self.with_device(|dev| {
            dev.slot(slot).traces.remove(&source.index());
        })
    }

    fn marker_in(&mut self, slot: u8, bit: u8) -> Result<()> {
        self.check_slot(slot)?;
        self.with_device(|dev| dev.slot(slot).marker_in = Some(bit))
    }

    fn marker_out(&mut self, slot: u8, bit: u8) -> Result<()> {
        self.check_slot(slot)?;
        self.with_device(|dev| dev.slot(slot).marker_out = Some(bit))
    }
}
