//! CCIO debug register map.
//!
//! Registers are addressed per CCIO slot by a small numeric index and read
//! through `QUTech:DEBug:CCIO<slot>:REG<index>?`. The firmware reports them
//! as signed 32-bit integers (the read index uses `-1` for "no safe offset").
//!
//! Indices 18–20 are used by the lab's DIO calibration scripts; they are
//! firmware-version dependent and marked as such there.
//!
//! ```text
//! idx  name                       meaning
//! ───  ─────────────────────────  ──────────────────────────────────────────
//!  18  SYS_ST_QUES_DIOCAL_COND    calibration condition bits (0 = OK)
//!  19  SYS_ST_OPER_DIO_RD_INDEX   sample offset currently latched (-1 = none)
//!  20  SYS_ST_OPER_DIO_MARGIN     offsets of headroom around the read index
//!  21  SYS_ST_OPER_DIO_PASS       per-offset pass bitmap of the last sweep
//! ```

/// Number of registers exposed per CCIO slot.
pub const CCIO_REG_COUNT: u16 = 23;

/// Highest CCIO slot number in a CC crate.
pub const MAX_SLOT: u8 = 11;

/// DIO calibration condition register.
pub const SYS_ST_QUES_DIOCAL_COND: u16 = 18;

/// DIO read index register.
pub const SYS_ST_OPER_DIO_RD_INDEX: u16 = 19;

/// DIO margin register.
pub const SYS_ST_OPER_DIO_MARGIN: u16 = 20;

/// Per-offset pass bitmap of the last DIO sweep (bit *n* = offset *n* passed).
pub const SYS_ST_OPER_DIO_PASS: u16 = 21;

/// Human-readable name of a register index, if known.
#[must_use]
pub const fn name(index: u16) -> Option<&'static str> {
    match index {
        SYS_ST_QUES_DIOCAL_COND => Some("SYS_ST_QUES_DIOCAL_COND"),
        SYS_ST_OPER_DIO_RD_INDEX => Some("SYS_ST_OPER_DIO_RD_INDEX"),
        SYS_ST_OPER_DIO_MARGIN => Some("SYS_ST_OPER_DIO_MARGIN"),
        SYS_ST_OPER_DIO_PASS => Some("SYS_ST_OPER_DIO_PASS"),
        _ => None,
    }
}

/// Bits of [`SYS_ST_QUES_DIOCAL_COND`].
///
/// Bits 0–3 are raised by the CCIO; bits 8–9 are raised by the host-side
/// evaluation when the sweep itself looked fine but no usable offset exists.
pub mod diocal_cond {
    /// Data-valid never seen during the sweep.
    pub const NO_SIGNAL: u32 = 1 << 0;
    /// Offsets passed in some repetitions but none in all of them.
    pub const UNSTABLE: u32 = 1 << 1;
    /// Sweep did not complete (sender stopped or trigger missing).
    pub const INCOMPLETE: u32 = 1 << 2;
    /// Sampled bits outside the active mask toggled.
    pub const STRAY_BITS: u32 = 1 << 3;

    /// No offset passed.
    pub const NO_PASS: u32 = 1 << 8;
    /// Longest passing run is narrower than the required margin.
    pub const MARGIN_LOW: u32 = 1 << 9;

    /// All bits the CCIO itself can raise.
    pub const DEVICE_MASK: u32 = NO_SIGNAL | UNSTABLE | INCOMPLETE | STRAY_BITS;
}

/// Bits of the SCPI questionable status condition (`STATus:QUEStionable:CONDition?`).
pub mod questionable {
    /// A `seq_in_sm` found no result in the input queue.
    pub const SEQ_IN_EMPTY: u32 = 1 << 0;
    /// Sequencer timing violation (instruction issued after its timestamp).
    pub const STV: u32 = 1 << 1;
    /// DIO calibration condition is non-zero on some slot.
    pub const DIOCAL: u32 = 1 << 2;
    /// Enable mask used by the demos: all 15 defined bits.
    pub const ENABLE_ALL: u32 = 0x7FFF;
}

/// CCIO trace unit sources (one bounded ring buffer per slot and source).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TraceSource {
    /// Device-side DIO inputs.
    DevIn = 0,
    /// Device-side DIO outputs.
    DevOut = 1,
    /// Backplane inputs.
    BpIn = 2,
    /// Backplane outputs.
    BpOut = 3,
}

impl TraceSource {
    /// All trace sources, in index order.
    pub const ALL: [Self; 4] = [Self::DevIn, Self::DevOut, Self::BpIn, Self::BpOut];

    /// Trace unit index used in SCPI commands.
    #[must_use]
    pub const fn index(self) -> u8 {
        self as u8
    }
}

/// Deepest trace buffer a CCIO trace unit holds.
pub const MAX_TRACE_DEPTH: u32 = 4096;

/// Debug marker bits used by the demos.
pub mod marker {
    /// UHFQA trigger bit on a CC→UHFQA interface.
    pub const UHFQA_TRIG: u8 = 16;
    /// UHFQA data-valid bit on a UHFQA→CC interface.
    pub const UHFQA_DV: u8 = 0;
    /// HDAWG trigger bit (toggle) on a CC→HDAWG interface.
    pub const HDAWG_TRIG: u8 = 31;
}
