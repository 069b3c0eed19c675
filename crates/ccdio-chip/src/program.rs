//! Structured sequencer programs.
//!
//! Programs are built as values: an ordered list of instructions, each with
//! an optional label, an optional slot target and an opcode. They are rendered to
//! device text as a separate, pure step. Timing and slot targeting can then be
//! checked on the structure without parsing text.
//!
//! Two dialects are rendered:
//!
//! | Syntax | Device | Shape |
//! |--------|--------|-------|
//! | [`Syntax::Cc`] | Central Controller | `label: [slot] seq_out 0x…,$dur  # comment` |
//! | [`Syntax::SeqC`] | UHFQA / HDAWG | `while (1) { waitDIOTrigger(); setDIO(…); wait(…); }` |
//!
//! ## Cycle accounting
//!
//! Only `seq_*` instructions occupy the output timeline. Control flow
//! (`move`, `loop`, `jmp`, `stop`, `seq_bar`) costs no timeline cycles on the
//! CC. In seqC, `setDIO` costs one cycle and a `while` iteration one more, so
//! the seqC renderer subtracts those from the following `wait`.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Write as _};

/// Cycles a seqC `setDIO()` takes.
pub const SEQC_SET_DIO_CYCLES: u32 = 1;

/// Cycles a seqC `while (1)` back-edge takes.
pub const SEQC_LOOP_CYCLES: u32 = 1;

/// Output dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Syntax {
    /// CC assembly.
    Cc,
    /// Zurich Instruments sequencer C.
    SeqC,
}

/// An operand: a literal or a reference to a `.DEF` constant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Arg {
    /// Literal value.
    Lit(u32),
    /// Named constant, rendered as `$name`.
    Const(String),
}

impl From<u32> for Arg {
    fn from(v: u32) -> Self {
        Self::Lit(v)
    }
}

impl From<&str> for Arg {
    fn from(name: &str) -> Self {
        Self::Const(name.to_string())
    }
}

/// Sequencer operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    /// Drive `pattern` on the DIO outputs for `duration` cycles.
    SeqOut {
        /// Bus word.
        pattern: Arg,
        /// Cycles.
        duration: Arg,
    },
    /// Hold the current outputs for `duration` cycles.
    SeqWait {
        /// Cycles.
        duration: Arg,
    },
    /// Barrier: all slot processors continue together.
    SeqBar,
    /// Block until the next DIO trigger edge.
    WaitTrigger,
    /// Latch the slot's DIO input into shared memory, mux-selected.
    SeqInSm {
        /// Shared memory address (`S<addr>`).
        addr: u16,
        /// Input mux selection.
        mux: Arg,
        /// Transfer size (0 = byte).
        size: u8,
    },
    /// Broadcast shared memory at `addr` to all slots.
    SeqSwSm {
        /// Shared memory address.
        addr: u16,
    },
    /// Output through a lookup table indexed by shared memory.
    SeqOutSm {
        /// Shared memory address.
        addr: u16,
        /// Lookup table.
        lut: Arg,
        /// Cycles.
        duration: Arg,
    },
    /// `R<reg> := value`.
    Move {
        /// Value.
        value: Arg,
        /// Register number.
        reg: u8,
    },
    /// Decrement `R<reg>`, jump to `target` while non-zero.
    Loop {
        /// Register number.
        reg: u8,
        /// Label.
        target: String,
    },
    /// Unconditional jump.
    Jmp {
        /// Label.
        target: String,
    },
    /// End of program.
    Stop,
}

impl Op {
    /// Jump target, if this op branches.
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        match self {
            Self::Loop { target, .. } | Self::Jmp { target } => Some(target),
            _ => None,
        }
    }

    fn mnemonic(&self) -> &'static str {
        match self {
            Self::SeqOut { .. } => "seq_out",
            Self::SeqWait { .. } => "seq_wait",
            Self::SeqBar => "seq_bar",
            Self::WaitTrigger => "seq_wait_trig",
            Self::SeqInSm { .. } => "seq_in_sm",
            Self::SeqSwSm { .. } => "seq_sw_sm",
            Self::SeqOutSm { .. } => "seq_out_sm",
            Self::Move { .. } => "move",
            Self::Loop { .. } => "loop",
            Self::Jmp { .. } => "jmp",
            Self::Stop => "stop",
        }
    }
}

/// One program line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    /// Label defined on this line.
    pub label: Option<String>,
    /// CCIO slot the line is restricted to; `None` runs on every slot.
    pub slot: Option<u8>,
    /// Operation.
    pub op: Op,
    /// Trailing comment.
    pub comment: Option<String>,
}

impl Instruction {
    /// Unlabelled, untargeted instruction.
    #[must_use]
    pub const fn new(op: Op) -> Self {
        Self {
            label: None,
            slot: None,
            op,
            comment: None,
        }
    }

    /// Attach a label.
    #[must_use]
    pub fn labelled(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    /// Restrict to one slot.
    #[must_use]
    pub const fn on_slot(mut self, slot: u8) -> Self {
        self.slot = Some(slot);
        self
    }

    /// Attach a comment.
    #[must_use]
    pub fn commented(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_string());
        self
    }

    /// True if the instruction executes on `slot`.
    #[must_use]
    pub fn runs_on(&self, slot: u8) -> bool {
        self.slot.map_or(true, |s| s == slot)
    }
}

/// Structural problems found while resolving or rendering a program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProgramError {
    /// `$name` used without a `.DEF`.
    UndefinedConstant(String),
    /// Jump to a label that does not exist.
    UndefinedLabel(String),
    /// Label defined twice.
    DuplicateLabel(String),
    /// Operation has no form in the requested dialect.
    Unsupported {
        /// Mnemonic.
        op: &'static str,
        /// Dialect.
        syntax: Syntax,
    },
    /// Control flow the seqC renderer cannot express as nested blocks.
    Unstructured(String),
    /// A duration too short to absorb the dialect's instruction overhead.
    TooShort {
        /// Instruction index.
        index: usize,
        /// Cycles requested.
        cycles: u32,
    },
}

impl fmt::Display for ProgramError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UndefinedConstant(name) => write!(f, "undefined constant ${name}"),
            Self::UndefinedLabel(name) => write!(f, "undefined label @{name}"),
            Self::DuplicateLabel(name) => write!(f, "duplicate label {name}"),
            Self::Unsupported { op, syntax } => write!(f, "{op} has no {syntax:?} form"),
            Self::Unstructured(why) => write!(f, "unstructured control flow: {why}"),
            Self::TooShort { index, cycles } => {
                write!(f, "instruction {index}: {cycles} cycles cannot absorb instruction overhead")
            }
        }
    }
}

impl std::error::Error for ProgramError {}

/// A sequencer program.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Program {
    /// Title, rendered as the first comment line.
    pub title: String,
    /// `.DEF` constants, in definition order.
    pub defs: Vec<(String, u32)>,
    /// Instructions.
    pub instructions: Vec<Instruction>,
}

impl Program {
    /// Empty program.
    #[must_use]
    pub fn new(title: &str) -> Self {
        Self {
            title: title.to_string(),
            ..Self::default()
        }
    }

    /// Define (or redefine) a constant.
    pub fn def(&mut self, name: &str, value: u32) -> &mut Self {
        if let Some(entry) = self.defs.iter_mut().find(|(n, _)| n == name) {
            entry.1 = value;
        } else {
            self.defs.push((name.to_string(), value));
        }
        self
    }

    /// Append an instruction.
    pub fn push(&mut self, instruction: Instruction) -> &mut Self {
        self.instructions.push(instruction);
        self
    }

    /// Number of instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    /// True if the program has no instructions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }

    /// Resolve an operand against the program's constants.
    ///
    /// # Errors
    ///
    /// Returns [`ProgramError::UndefinedConstant`] for an unknown name.
    pub fn resolve(&self, arg: &Arg) -> Result<u32, ProgramError> {
        match arg {
            Arg::Lit(v) => Ok(*v),
            Arg::Const(name) => self
                .defs
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| *v)
                .ok_or_else(|| ProgramError::UndefinedConstant(name.clone())),
        }
    }

    /// Timeline cycles occupied by an operation.
    ///
    /// # Errors
    ///
    /// Returns an error if a duration operand is undefined.
    pub fn cycles(&self, op: &Op) -> Result<u32, ProgramError> {
        match op {
            Op::SeqOut { duration, .. }
            | Op::SeqWait { duration }
            | Op::SeqOutSm { duration, .. } => self.resolve(duration),
            Op::SeqInSm { .. } | Op::SeqSwSm { .. } => Ok(1),
            _ => Ok(0),
        }
    }

    /// Index of the instruction carrying `label`.
    #[must_use]
    pub fn find_label(&self, label: &str) -> Option<usize> {
        self.instructions
            .iter()
            .position(|i| i.label.as_deref() == Some(label))
    }

    /// Slots named by any instruction.
    #[must_use]
    pub fn slots(&self) -> BTreeSet<u8> {
        self.instructions.iter().filter_map(|i| i.slot).collect()
    }

    /// The program as seen by one slot: shared lines plus that slot's lines.
    #[must_use]
    pub fn slot_view(&self, slot: u8) -> Self {
        Self {
            title: format!("{} [slot {slot}]", self.title),
            defs: self.defs.clone(),
            instructions: self
                .instructions
                .iter()
                .filter(|i| i.runs_on(slot))
                .cloned()
                .collect(),
        }
    }

    /// Check labels, jump targets and constants.
    ///
    /// # Errors
    ///
    /// Returns the first structural problem found.
    pub fn validate(&self) -> Result<(), ProgramError> {
        let mut labels = BTreeMap::new();
        for (idx, instr) in self.instructions.iter().enumerate() {
            if let Some(label) = &instr.label {
                if labels.insert(label.as_str(), idx).is_some() {
                    return Err(ProgramError::DuplicateLabel(label.clone()));
                }
            }
        }
        for instr in &self.instructions {
            if let Some(target) = instr.op.target() {
                if !labels.contains_key(target) {
                    return Err(ProgramError::UndefinedLabel(target.to_string()));
                }
            }
            for arg in op_args(&instr.op) {
                self.resolve(arg)?;
            }
        }
        Ok(())
    }

    /// Render to device text.
    ///
    /// # Errors
    ///
    /// Returns an error if the program is structurally invalid or uses an
    /// operation the dialect cannot express.
    pub fn render(&self, syntax: Syntax) -> Result<String, ProgramError> {
        self.validate()?;
        match syntax {
            Syntax::Cc => Ok(self.render_cc()),
            Syntax::SeqC => self.render_seqc(),
        }
    }

    fn render_cc(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "# program: {}", self.title);
        for (name, value) in &self.defs {
            let _ = writeln!(out, ".DEF    {name:<12}{value}");
        }
        if !self.defs.is_empty() {
            out.push('\n');
        }
        for instr in &self.instructions {
            let label = instr.label.as_ref().map_or(String::new(), |l| format!("{l}:"));
            let slot = instr.slot.map_or(String::new(), |s| format!("[{s}] "));
            let mut line = format!("{label:<8}{slot}{:<12}{}", instr.op.mnemonic(), cc_operands(&instr.op));
            if let Some(comment) = &instr.comment {
                let _ = write!(line, "  # {comment}");
            }
            out.push_str(line.trim_end());
            out.push('\n');
        }
        out
    }

    fn render_seqc(&self) -> Result<String, ProgramError> {
        let mut out = String::new();
        let _ = writeln!(out, "// program: {}", self.title);
        for (name, value) in &self.defs {
            let _ = writeln!(out, "const {name} = {value};");
        }

        // Blocks opened at a label and closed by the branch back to it.
        let mut closers: BTreeMap<usize, usize> = BTreeMap::new();
        for (idx, instr) in self.instructions.iter().enumerate() {
            if let Some(target) = instr.op.target() {
                let start = self
                    .find_label(target)
                    .ok_or_else(|| ProgramError::UndefinedLabel(target.to_string()))?;
                if start > idx {
                    return Err(ProgramError::Unstructured(format!("forward jump to {target}")));
                }
                closers.insert(start, idx);
            }
        }

        let mut depth = 0usize;
        let mut open: Vec<usize> = Vec::new();
        for (idx, instr) in self.instructions.iter().enumerate() {
            if instr.slot.is_some() {
                return Err(ProgramError::Unstructured("slot prefix in seqC".into()));
            }
            if let Some(&end) = closers.get(&idx) {
                let head = match &self.instructions[end].op {
                    Op::Jmp { .. } => "while (1) {".to_string(),
                    Op::Loop { reg, .. } => {
                        let count = self.loop_count(*reg, idx)?;
                        format!("repeat ({count}) {{")
                    }
                    _ => return Err(ProgramError::Unstructured("block without branch".into())),
                };
                let _ = writeln!(out, "{}{head}", indent(depth));
                open.push(end);
                depth += 1;
            }

            let overhead = if open.last().is_some_and(|&end| end == idx + 1) && !self.block_waits(idx) {
                SEQC_LOOP_CYCLES
            } else {
                0
            };

            match &instr.op {
                Op::SeqOut { pattern, duration } => {
                    let pattern = self.resolve(pattern)?;
                    let cycles = self.resolve(duration)?;
                    let rest = cycles
                        .checked_sub(SEQC_SET_DIO_CYCLES + overhead)
                        .ok_or(ProgramError::TooShort { index: idx, cycles })?;
                    let _ = writeln!(out, "{}setDIO({pattern:#x});", indent(depth));
                    if rest > 0 {
                        let _ = writeln!(out, "{}wait({rest});", indent(depth));
                    }
                }
                Op::SeqWait { duration } => {
                    let cycles = self.resolve(duration)?;
                    let rest = cycles
                        .checked_sub(overhead)
                        .ok_or(ProgramError::TooShort { index: idx, cycles })?;
                    if rest > 0 {
                        let _ = writeln!(out, "{}wait({rest});", indent(depth));
                    }
                }
                Op::WaitTrigger => {
                    let _ = writeln!(out, "{}waitDIOTrigger();", indent(depth));
                }
                Op::Jmp { .. } | Op::Loop { .. } => {
                    if open.last() == Some(&idx) {
                        open.pop();
                        depth -= 1;
                        let _ = writeln!(out, "{}}}", indent(depth));
                    } else {
                        return Err(ProgramError::Unstructured("overlapping loops".into()));
                    }
                }
                Op::Move { .. } | Op::SeqBar => {}
                Op::Stop => break,
                other => {
                    return Err(ProgramError::Unsupported {
                        op: other.mnemonic(),
                        syntax: Syntax::SeqC,
                    })
                }
            }
        }
        Ok(out)
    }

    /// True if the innermost block ending after `idx` waits for a trigger.
    fn block_waits(&self, idx: usize) -> bool {
        let end = idx + 1;
        let Some(target) = self.instructions.get(end).and_then(|i| i.op.target()) else {
            return false;
        };
        let Some(start) = self.find_label(target) else {
            return false;
        };
        self.instructions[start..end]
            .iter()
            .any(|i| i.op == Op::WaitTrigger)
    }

    fn loop_count(&self, reg: u8, before: usize) -> Result<u32, ProgramError> {
        self.instructions[..before]
            .iter()
            .rev()
            .find_map(|i| match &i.op {
                Op::Move { value, reg: r } if *r == reg => Some(self.resolve(value)),
                _ => None,
            })
            .unwrap_or_else(|| Err(ProgramError::Unstructured(format!("R{reg} never initialised"))))
    }
}

fn indent(depth: usize) -> String {
    "    ".repeat(depth)
}

fn op_args(op: &Op) -> Vec<&Arg> {
    match op {
        Op::SeqOut { pattern, duration } => vec![pattern, duration],
        Op::SeqWait { duration } => vec![duration],
        Op::SeqInSm { mux, .. } => vec![mux],
        Op::SeqOutSm { lut, duration, .. } => vec![lut, duration],
        Op::Move { value, .. } => vec![value],
        _ => Vec::new(),
    }
}

fn fmt_arg(arg: &Arg, hex: bool) -> String {
    match arg {
        Arg::Lit(v) if hex => format!("{v:#010x}"),
        Arg::Lit(v) => v.to_string(),
        Arg::Const(name) => format!("${name}"),
    }
}

fn cc_operands(op: &Op) -> String {
    match op {
        Op::SeqOut { pattern, duration } => {
            format!("{},{}", fmt_arg(pattern, true), fmt_arg(duration, false))
        }
        Op::SeqWait { duration } => fmt_arg(duration, false),
        Op::SeqInSm { addr, mux, size } => format!("S{addr},{},{size}", fmt_arg(mux, false)),
        Op::SeqSwSm { addr } => format!("S{addr}"),
        Op::SeqOutSm { addr, lut, duration } => {
            format!("S{addr},{},{}", fmt_arg(lut, false), fmt_arg(duration, false))
        }
        Op::Move { value, reg } => format!("{},R{reg}", fmt_arg(value, false)),
        Op::Loop { reg, target } => format!("R{reg},@{target}"),
        Op::Jmp { target } => format!("@{target}"),
        Op::SeqBar | Op::WaitTrigger | Op::Stop => String::new(),
    }
}
