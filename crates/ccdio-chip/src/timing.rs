//! Clock periods and latency constants.
//!
//! Source: CC feedback demo (`uhfLatency`, `smWait`) and UHFQA upstream
//! calibration program comments, measured on a scope against the CC markers.

/// CC sequencer cycle (50 MHz).
pub const CC_CYCLE_NS: u64 = 20;

/// UHFQA sequencer cycle, in picoseconds (225 MHz, ~4.44 ns).
pub const UHFQA_CYCLE_PS: u64 = 4_444;

/// Sample offsets a CCIO DIO input can latch at.
///
/// The CCIO oversamples the incoming bus; the calibrated read index selects
/// one of these sub-cycle positions.
pub const DIO_SAMPLE_OFFSETS: usize = 32;

/// Default number of pattern repetitions observed before evaluating.
///
/// A single edge cannot separate a clean signal from noise.
pub const DEFAULT_SETTLE_REPETITIONS: u32 = 10;

/// Minimum repetitions the calibration accepts.
pub const MIN_SETTLE_REPETITIONS: u32 = 2;

/// Trigger period of the upstream calibration pattern, in UHFQA cycles.
///
/// `18 × 4.44 ns = 80 ns`; 40 ns is not attainable by the UHFQA sequencer.
pub const UPSTREAM_PATTERN_PERIOD: u32 = 18;

/// High time of the upstream calibration pattern, in UHFQA cycles (~20 ns).
pub const UPSTREAM_PATTERN_HIGH: u32 = 3;

/// Feedback latency constants, in CC cycles.
pub mod feedback {
    /// UHFQA trigger → result latency below which `SEQ_IN_EMPTY` shows up.
    pub const READOUT_LATENCY_MIN: u32 = 10;

    /// Latency used in production: one cycle above the minimum.
    ///
    /// 10 gives the best latency but occasionally `SEQ_IN_EMPTY` and `STV`.
    pub const READOUT_LATENCY_STABLE: u32 = 11;

    /// Cycles spent by `seq_in_sm` + `seq_sw_sm` on the writing slot.
    pub const SM_WRITE_CYCLES: u32 = 2;

    /// Cycles after `seq_sw_sm` before a distributed shared-memory write is
    /// visible on every other slot.
    pub const SM_PROPAGATION_CYCLES: u32 = 1;

    /// Cycles taken by `seq_out_sm` on the reacting slot.
    pub const SM_OUTPUT_CYCLES: u32 = 1;

    /// Idle cycles between feedback iterations (2 µs).
    pub const DEFAULT_IDLE_WAIT: u32 = 100;
}

/// Convert CC cycles to nanoseconds.
#[must_use]
pub const fn cc_cycles_to_ns(cycles: u64) -> u64 {
    cycles * CC_CYCLE_NS
}

/// Convert UHFQA cycles to nanoseconds (rounded down).
#[must_use]
pub const fn uhfqa_cycles_to_ns(cycles: u64) -> u64 {
    cycles * UHFQA_CYCLE_PS / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_period_is_80ns() {
        assert_eq!(uhfqa_cycles_to_ns(u64::from(UPSTREAM_PATTERN_PERIOD)), 79);
        assert!(UPSTREAM_PATTERN_HIGH < UPSTREAM_PATTERN_PERIOD);
    }

    #[test]
    fn distribution_totals_80ns() {
        // 2 write cycles + 2 distribution cycles = 80 ns on the CC
        let cycles = feedback::SM_WRITE_CYCLES + feedback::SM_PROPAGATION_CYCLES + 1;
        assert_eq!(cc_cycles_to_ns(u64::from(cycles)), 80);
    }
}
