//! Sequence emitter
//!
//! Pure builders for the small programs the calibration and demos need. They
//! return structured [`Program`] values; rendering to CC assembly or seqC is
//! done by the instrument that receives them.

use ccdio_chip::dio::DioLayout;
use ccdio_chip::program::{Instruction, Op, Program};

use crate::error::{DioError, Result};
use crate::link::ExpectedSequence;

const LOOP: &str = "loop";

fn out(pattern: u32, duration: u32) -> Instruction {
    Instruction::new(Op::SeqOut {
        pattern: pattern.into(),
        duration: duration.into(),
    })
}

fn jmp_loop() -> Instruction {
    Instruction::new(Op::Jmp {
        target: LOOP.to_string(),
    })
}

/// On every trigger edge drive `pattern` for `high` cycles, then zero
///
/// # Errors
///
/// Returns [`DioError::Configuration`] if `high` is zero.
pub fn build_triggered_pattern(pattern: u32, high: u32) -> Result<Program> {
    if high == 0 {
        return Err(DioError::configuration("pattern high time must be at least one cycle"));
    }
    let mut p = Program::new(&format!("triggered pattern {pattern:#x} x{high}"));
    p.push(Instruction::new(Op::WaitTrigger).labelled(LOOP).commented("next trigger edge"));
    p.push(out(pattern, high));
    p.push(out(0, 1));
    p.push(jmp_loop());
    Ok(p)
}

/// Emit each pair once, return to zero, stop
///
/// # Errors
///
/// Returns [`DioError::Configuration`] if the sequence is empty.
pub fn build_static_loop(sequence: &ExpectedSequence) -> Result<Program> {
    if sequence.is_empty() {
        return Err(DioError::configuration("static loop needs at least one pattern"));
    }
    let mut p = Program::new(&format!("static sequence of {}", sequence.pairs().len()));
    for &(pattern, hold) in sequence.pairs() {
        p.push(out(pattern, hold));
    }
    p.push(out(0, 1));
    p.push(Instruction::new(Op::Stop));
    Ok(p)
}

/// Replay the whole sequence on every trigger edge
///
/// # Errors
///
/// Returns [`DioError::Configuration`] if the sequence is empty.
pub fn build_triggered_sequence(sequence: &ExpectedSequence) -> Result<Program> {
    if sequence.is_empty() {
        return Err(DioError::configuration("triggered sequence needs at least one pattern"));
    }
    let mut p = Program::new(&format!("triggered sequence of {}", sequence.pairs().len()));
    p.push(Instruction::new(Op::WaitTrigger).labelled(LOOP));
    for &(pattern, hold) in sequence.pairs() {
        p.push(out(pattern, hold));
    }
    p.push(out(0, 1));
    p.push(jmp_loop());
    Ok(p)
}

/// Self-timed pulse train: `pattern` for `high` cycles every `period`
///
/// With `wait_first_trigger` the train starts on the first trigger edge and
/// free-runs afterwards. Used for the CC's trigger output and for the
/// readout instrument's upstream calibration pattern.
///
/// # Errors
///
/// Returns [`DioError::Configuration`] if `high` is zero or leaves no low
/// time in `period`.
pub fn build_free_running_pattern(
    pattern: u32,
    high: u32,
    period: u32,
    wait_first_trigger: bool,
) -> Result<Program> {
    if high == 0 || period <= high {
        return Err(DioError::configuration(format!(
            "pulse of {high} cycles does not fit period {period}"
        )));
    }
    let mut p = Program::new(&format!("pulse train {pattern:#x} {high}/{period}"));
    if wait_first_trigger {
        p.push(Instruction::new(Op::WaitTrigger).commented("align to first trigger"));
    }
    p.push(out(pattern, high).labelled(LOOP));
    p.push(out(0, period - high));
    p.push(jmp_loop());
    Ok(p)
}

/// Cycle through `codewords` forever, each with data-valid for `hold`
/// cycles followed by `gap` idle cycles
///
/// # Errors
///
/// Returns [`DioError::Configuration`] if the list is empty, a duration is
/// zero or a codeword does not fit the layout.
pub fn build_codeword_loop(layout: DioLayout, codewords: &[u32], hold: u32, gap: u32) -> Result<Program> {
    if codewords.is_empty() || hold == 0 || gap == 0 {
        return Err(DioError::configuration("codeword loop needs codewords and non-zero timing"));
    }
    let mut p = Program::new(&format!("codewords {codewords:?} on {}", layout.name));
    for (i, &cw) in codewords.iter().enumerate() {
        let word = layout.encode(cw, true).ok_or_else(|| {
            DioError::configuration(format!("codeword {cw} exceeds {}", layout.name))
        })?;
        let mut instr = out(word, hold).commented(&format!("cw {cw}"));
        if i == 0 {
            instr = instr.labelled(LOOP);
        }
        p.push(instr);
        p.push(out(0, gap));
    }
    p.push(jmp_loop());
    Ok(p)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ccdio_chip::program::Syntax;

    #[test]
    fn triggered_pattern_renders_as_seqc_loop() {
        let text = build_triggered_pattern(0x3FF, 3).unwrap().render(Syntax::SeqC).unwrap();
        assert!(text.contains("while (1) {\n    waitDIOTrigger();\n    setDIO(0x3ff);\n    wait(2);\n    setDIO(0x0);\n}"), "{text}");
    }

    #[test]
    fn zero_high_time_rejected() {
        assert!(matches!(build_triggered_pattern(0x3FF, 0), Err(DioError::Configuration { .. })));
        assert!(build_free_running_pattern(1, 0, 18, false).is_err());
        assert!(build_free_running_pattern(1, 18, 18, false).is_err());
    }

    #[test]
    fn static_loop_ends_with_stop() {
        let seq = ExpectedSequence::new(vec![(0x3, 2), (0x1, 4)]).unwrap();
        let p = build_static_loop(&seq).unwrap();
        assert_eq!(p.instructions.last().map(|i| &i.op), Some(&Op::Stop));
        let total: u32 = p
            .instructions
            .iter()
            .map(|i| p.cycles(&i.op).unwrap())
            .sum();
        assert_eq!(total, 7);
        assert!(build_static_loop(&ExpectedSequence::empty()).is_err());
    }

    #[test]
    fn cc_trigger_train_matches_demo() {
        let p = build_free_running_pattern(0x03FF_0000, 1, 18, false).unwrap();
        let text = p.render(Syntax::Cc).unwrap();
        assert!(text.contains("loop:   seq_out     0x03ff0000,1"), "{text}");
        assert!(text.contains("seq_out     0x00000000,17"), "{text}");
    }

    #[test]
    fn codeword_loop_encodes_dv() {
        let p = build_codeword_loop(DioLayout::DV_LSB, &[7, 6, 5, 4], 1, 2).unwrap();
        let words: Vec<u32> = p
            .instructions
            .iter()
            .filter_map(|i| match &i.op {
                Op::SeqOut { pattern, .. } => p.resolve(pattern).ok(),
                _ => None,
            })
            .filter(|&w| w != 0)
            .collect();
        assert_eq!(words, vec![15, 13, 11, 9]);
        assert!(build_codeword_loop(DioLayout::DV_LSB, &[512], 1, 1).is_err());
    }
}
