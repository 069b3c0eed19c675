//! SCPI instrument
//!
//! Drives a real instrument through any [`Transport`]. Programs are rendered
//! in the dialect of the device role (CC assembly for the sequencer, seqC for
//! the readout and waveform instruments) and shipped as definite-length
//! blocks.

use std::time::Duration;

use bytes::Bytes;
use ccdio_chip::program::{Program, Syntax};
use ccdio_chip::regs::TraceSource;
use ccdio_chip::scpi;
use tracing::{debug, info};

use crate::error::{DioError, Result};
use crate::instrument::{terminated_instructions, DeviceRole, DioCapture, Identity, Instrument};
use crate::transport::Transport;

/// Instrument reached over SCPI
#[derive(Debug)]
pub struct ScpiInstrument<T: Transport> {
    name: String,
    role: DeviceRole,
    transport: T,
    timeout: Duration,
}

impl<T: Transport> ScpiInstrument<T> {
    /// Wrap a connected transport
    pub fn new(name: &str, role: DeviceRole, transport: T, timeout: Duration) -> Self {
        Self {
            name: name.to_string(),
            role,
            transport,
            timeout,
        }
    }

    /// Underlying transport
    pub fn transport(&self) -> &T {
        &self.transport
    }

    fn send(&mut self, command: &str) -> Result<()> {
        self.transport.send(command, self.timeout)
    }

    fn query(&mut self, command: &str) -> Result<String> {
        self.transport.query(command, self.timeout)
    }

    fn query_int(&mut self, command: &str) -> Result<i64> {
        let response = self.query(command)?;
        scpi::parse_int(&response)
            .ok_or_else(|| DioError::protocol(format!("{command} expects an integer"), response))
    }

    const fn syntax(&self) -> Syntax {
        match self.role {
            DeviceRole::Sequencer => Syntax::Cc,
            DeviceRole::Readout | DeviceRole::WaveformGenerator => Syntax::SeqC,
        }
    }
}

impl<T: Transport> Instrument for ScpiInstrument<T> {
    fn name(&self) -> &str {
        &self.name
    }

    fn role(&self) -> DeviceRole {
        self.role
    }

    fn reset(&mut self) -> Result<()> {
        self.send(scpi::RESET)
    }

    fn clear_status(&mut self) -> Result<()> {
        self.send(scpi::CLEAR_STATUS)
    }

    fn identity(&mut self) -> Result<Identity> {
        let response = self.query(scpi::IDENTITY)?;
        Identity::parse(&response)
    }

    fn error_count(&mut self) -> Result<u32> {
        let n = self.query_int(scpi::ERROR_COUNT)?;
        u32::try_from(n).map_err(|_| DioError::protocol("negative error count", n.to_string()))
    }

    fn next_error(&mut self) -> Result<String> {
        self.query(scpi::ERROR_NEXT)
    }

    fn start(&mut self) -> Result<()> {
        info!("{}: start", self.name);
        self.send(scpi::RUN)
    }

    fn stop(&mut self) -> Result<()> {
        info!("{}: stop", self.name);
        self.send(scpi::STOP)
    }

    fn operation_complete(&mut self) -> Result<bool> {
        let response = self.query(scpi::OPERATION_COMPLETE)?;
        scpi::parse_bool(&response).ok_or_else(|| DioError::protocol("*OPC? expects 0 or 1", response))
    }

    fn upload(&mut self, program: &Program) -> Result<()> {
        let text = program.render(self.syntax())?;
        debug!("{}: program '{}'\n{text}", self.name, program.title);
        self.upload_source(&text)
    }

    fn upload_source(&mut self, source: &str) -> Result<()> {
        let body = Bytes::copy_from_slice(source.as_bytes());
        info!("{}: uploading {} bytes of source", self.name, body.len());
        self.transport
            .send_block(scpi::PROGRAM_ASSEMBLE, &body, self.timeout)
    }

    fn upload_instructions(&mut self, words: &[u32]) -> Result<()> {
        let words: Vec<u32> = terminated_instructions(words)?
            .into_iter()
            .map(u32::to_le)
            .collect();
        let payload: &[u8] = bytemuck::cast_slice(&words);
        info!("{}: uploading {} instruction words", self.name, words.len());
        self.transport
            .send_block(scpi::UPLOAD_INSTRUCTIONS, payload, self.timeout)
    }

    fn read_register(&mut self, slot: u8, index: u16) -> Result<i32> {
        let command = scpi::ccio_register(slot, index);
        let value = self.query_int(&command)?;
        i32::try_from(value).map_err(|_| DioError::protocol("register out of i32 range", value.to_string()))
    }

    fn arm_dio_capture(&mut self, capture: &DioCapture) -> Result<()> {
        let command = scpi::dio_calibrate(
            capture.slot,
            capture.mask,
            capture.repetitions,
            &capture.expected,
        );
        self.send(&command)
    }

    fn set_dio_read_index(&mut self, slot: u8, index: u32) -> Result<()> {
        self.send(&scpi::dio_read_index(slot, index))
    }

    fn questionable_condition(&mut self) -> Result<u32> {
        let value = self.query_int(scpi::QUESTIONABLE_CONDITION)?;
        u32::try_from(value).map_err(|_| DioError::protocol("negative status word", value.to_string()))
    }

    fn enable_questionable(&mut self, mask: u32) -> Result<()> {
        self.send(&scpi::questionable_enable(mask))
    }

    fn trace_on(&mut self, slot: u8, source: TraceSource, depth: u32) -> Result<()> {
        self.send(&scpi::trace_on(slot, source.index(), depth))
    }

    fn trace_off(&mut self, slot: u8, source: TraceSource) -> Result<()> {
        self.send(&scpi::trace_off(slot, source.index()))
    }

    fn marker_in(&mut self, slot: u8, bit: u8) -> Result<()> {
        self.send(&scpi::marker_in(slot, bit))
    }

    fn marker_out(&mut self, slot: u8, bit: u8) -> Result<()> {
        self.send(&scpi::marker_out(slot, bit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Records everything sent and answers queries from a script.
    #[derive(Debug, Default)]
    struct Scripted {
        sent: Vec<String>,
        blocks: Vec<(String, Vec<u8>)>,
        replies: VecDeque<String>,
    }

    impl Scripted {
        fn replying(replies: &[&str]) -> Self {
            Self {
                replies: replies.iter().map(|r| (*r).to_string()).collect(),
                ..Self::default()
            }
        }
    }

    impl Transport for Scripted {
        fn endpoint(&self) -> &str {
            "scripted"
        }

        fn send(&mut self, command: &str, _timeout: Duration) -> Result<()> {
            self.sent.push(command.to_string());
            Ok(())
        }

        fn query(&mut self, command: &str, _timeout: Duration) -> Result<String> {
            self.sent.push(command.to_string());
            self.replies
                .pop_front()
                .ok_or_else(|| DioError::timeout(command, Duration::from_millis(10)))
        }

        fn send_block(&mut self, header: &str, payload: &[u8], _timeout: Duration) -> Result<()> {
            self.blocks.push((header.to_string(), payload.to_vec()));
            Ok(())
        }
    }

    fn cc(replies: &[&str]) -> ScpiInstrument<Scripted> {
        ScpiInstrument::new("cc", DeviceRole::Sequencer, Scripted::replying(replies), Duration::from_secs(1))
    }

    #[test]
    fn register_read_uses_debug_query() {
        let mut dev = cc(&["-1"]);
        assert_eq!(dev.read_register(2, 19).unwrap(), -1);
        assert_eq!(dev.transport().sent, vec!["QUTech:DEBug:CCIO2:REG19?"]);
    }

    #[test]
    fn questionable_enable_sends_mask() {
        let mut dev = cc(&[]);
        dev.enable_questionable(ccdio_chip::regs::questionable::ENABLE_ALL).unwrap();
        assert_eq!(dev.transport().sent, vec!["STATus:QUEStionable:ENABle 32767"]);
    }

    #[test]
    fn garbage_register_is_protocol_violation() {
        let mut dev = cc(&["bogus"]);
        let err = dev.read_register(2, 18).unwrap_err();
        assert!(matches!(err, DioError::ProtocolViolation { ref raw, .. } if raw == "bogus"));
    }

    #[test]
    fn instruction_upload_appends_stop_word() {
        let mut dev = cc(&[]);
        dev.upload_instructions(&[0xDEAD_BEEF]).unwrap();
        let (header, payload) = &dev.transport().blocks[0];
        assert_eq!(header, scpi::UPLOAD_INSTRUCTIONS);
        assert_eq!(payload.len(), 8);
        assert_eq!(&payload[..4], &0xDEAD_BEEFu32.to_le_bytes());
        assert_eq!(&payload[4..], &scpi::STOP_INSTRUCTION.to_le_bytes());
    }

    #[test]
    fn program_upload_renders_cc_assembly() {
        use ccdio_chip::program::{Instruction, Op};
        let mut program = Program::new("stop");
        program.push(Instruction::new(Op::Stop));
        let mut dev = cc(&[]);
        dev.upload(&program).unwrap();
        let (header, payload) = &dev.transport().blocks[0];
        assert_eq!(header, scpi::PROGRAM_ASSEMBLE);
        let text = std::str::from_utf8(payload).unwrap();
        assert!(text.contains("stop"));
    }

    #[test]
    fn operation_complete_parses_bool() {
        let mut dev = cc(&["0", "1", "maybe"]);
        assert!(!dev.operation_complete().unwrap());
        assert!(dev.operation_complete().unwrap());
        assert!(dev.operation_complete().is_err());
    }

    #[test]
    fn missing_reply_surfaces_timeout() {
        let mut dev = cc(&[]);
        assert!(matches!(dev.identity(), Err(DioError::Timeout { .. })));
    }
}
