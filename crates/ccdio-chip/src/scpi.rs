//! SCPI command surface of the CC.
//!
//! Commands are newline-terminated ASCII. Queries end in `?` and return one
//! line. Large payloads (assembly source, instruction words) travel as an
//! IEEE 488.2 definite-length block: `#<n><len><bytes>`, where `<n>` is the
//! number of digits in `<len>`.
//!
//! ```text
//! *RST / *CLS / *IDN? / *OPC?                       IEEE 488.2 common commands
//! SYSTem:ERRor:COUNt? / SYSTem:ERRor:NEXT?          error queue
//! STATus:QUEStionable:CONDition? / :ENABle <mask>   questionable status
//! awgcontrol:run:immediate / awgcontrol:stop:immediate
//! QUTech:SEQuence:PROGram:ASSEMble #<block>         assemble + load source
//! QUTech:UploadInstructions #<block>                pre-assembled words
//! QUTech:DEBug:CCIO<s>:REG<r>?                      CCIO register read
//! QUTech:CCIO<s>:DIOIN:CAL <mask>,<reps>,<expected> arm DIO calibration
//! QUTech:CCIO<s>:DIOIN:RDINdex <n>                  latch offset
//! QUTech:DEBug:CCIO<s>:TRACE<t>:ON <depth> / :OFF   trace unit
//! QUTech:DEBug:CCIO<s>:MARKer:IN|OUT <bit>          scope markers
//! ```

/// Line terminator for commands and responses.
pub const TERMINATOR: char = '\n';

/// Default SCPI port of the CC.
pub const DEFAULT_PORT: u16 = 5025;

/// Reset.
pub const RESET: &str = "*RST";
/// Clear status and error queue.
pub const CLEAR_STATUS: &str = "*CLS";
/// Identification query.
pub const IDENTITY: &str = "*IDN?";
/// Operation-complete query.
pub const OPERATION_COMPLETE: &str = "*OPC?";
/// Error queue length.
pub const ERROR_COUNT: &str = "SYSTem:ERRor:COUNt?";
/// Pop one error from the queue.
pub const ERROR_NEXT: &str = "SYSTem:ERRor:NEXT?";
/// Questionable status condition.
pub const QUESTIONABLE_CONDITION: &str = "STATus:QUEStionable:CONDition?";
/// Start the sequencer.
pub const RUN: &str = "awgcontrol:run:immediate";
/// Stop the sequencer.
pub const STOP: &str = "awgcontrol:stop:immediate";
/// Header for assembly source upload (followed by a block).
pub const PROGRAM_ASSEMBLE: &str = "QUTech:SEQuence:PROGram:ASSEMble ";
/// Header for pre-assembled instruction upload (followed by a block).
pub const UPLOAD_INSTRUCTIONS: &str = "QUTech:UploadInstructions ";

/// Instruction word appended after every uploaded instruction stream.
pub const STOP_INSTRUCTION: u32 = 0x1000_0000;

/// Largest instruction stream the sequencer memory holds, stop word included.
pub const MAX_INSTRUCTIONS: usize = 1 << 15;

/// Questionable enable mask command.
#[must_use]
pub fn questionable_enable(mask: u32) -> String {
    format!("STATus:QUEStionable:ENABle {mask}")
}

/// CCIO register read query.
#[must_use]
pub fn ccio_register(slot: u8, index: u16) -> String {
    format!("QUTech:DEBug:CCIO{slot}:REG{index}?")
}

/// Arm DIO calibration on a CCIO input.
///
/// `expected` is a list of `(pattern, hold)` pairs; an empty list selects
/// data-valid-edge mode.
#[must_use]
pub fn dio_calibrate(slot: u8, mask: u32, repetitions: u32, expected: &[(u32, u32)]) -> String {
    let seq: Vec<String> = expected
        .iter()
        .map(|(pattern, hold)| format!("{pattern:#x}:{hold}"))
        .collect();
    format!(
        "QUTech:CCIO{slot}:DIOIN:CAL {mask:#x},{repetitions},'{}'",
        seq.join(",")
    )
}

/// Set the DIO read index of a CCIO input.
#[must_use]
pub fn dio_read_index(slot: u8, index: u32) -> String {
    format!("QUTech:CCIO{slot}:DIOIN:RDINdex {index}")
}

/// Enable a trace unit.
#[must_use]
pub fn trace_on(slot: u8, source: u8, depth: u32) -> String {
    format!("QUTech:DEBug:CCIO{slot}:TRACE{source}:ON {depth}")
}

/// Disable a trace unit.
#[must_use]
pub fn trace_off(slot: u8, source: u8) -> String {
    format!("QUTech:DEBug:CCIO{slot}:TRACE{source}:OFF")
}

/// Route an input bit to the slot's scope marker.
#[must_use]
pub fn marker_in(slot: u8, bit: u8) -> String {
    format!("QUTech:DEBug:CCIO{slot}:MARKer:IN {bit}")
}

/// Route an output bit to the slot's scope marker.
#[must_use]
pub fn marker_out(slot: u8, bit: u8) -> String {
    format!("QUTech:DEBug:CCIO{slot}:MARKer:OUT {bit}")
}

/// IEEE 488.2 definite-length block header for `len` payload bytes.
#[must_use]
pub fn block_header(len: usize) -> String {
    let digits = len.to_string();
    format!("#{}{}", digits.len(), digits)
}

/// Parse an integer response (`"42"`, `"-1"`, `"+0"`).
#[must_use]
pub fn parse_int(response: &str) -> Option<i64> {
    let s = response.trim();
    let s = s.strip_prefix('+').unwrap_or(s);
    s.parse().ok()
}

/// Parse an `*OPC?` / boolean response.
#[must_use]
pub fn parse_bool(response: &str) -> Option<bool> {
    match parse_int(response)? {
        0 => Some(false),
        1 => Some(true),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_header_counts_digits() {
        assert_eq!(block_header(0), "#10");
        assert_eq!(block_header(7), "#17");
        assert_eq!(block_header(1234), "#41234");
    }

    #[test]
    fn register_query_format() {
        assert_eq!(ccio_register(2, 19), "QUTech:DEBug:CCIO2:REG19?");
    }

    #[test]
    fn calibrate_command_lists_expected_sequence() {
        assert_eq!(
            dio_calibrate(2, 0x3FF, 10, &[]),
            "QUTech:CCIO2:DIOIN:CAL 0x3ff,10,''"
        );
        assert_eq!(
            dio_calibrate(3, 0xFF, 4, &[(0x3, 2), (0x0, 1)]),
            "QUTech:CCIO3:DIOIN:CAL 0xff,4,'0x3:2,0x0:1'"
        );
    }

    #[test]
    fn integer_responses() {
        assert_eq!(parse_int(" -1\n"), Some(-1));
        assert_eq!(parse_int("+0"), Some(0));
        assert_eq!(parse_int("abc"), None);
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("2"), None);
    }
}
