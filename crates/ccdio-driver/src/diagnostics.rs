//! Diagnostics: register reads, trace units, scope markers, error queue

use std::fmt;
use std::ops::Range;

use ccdio_chip::regs::{self, TraceSource, MAX_TRACE_DEPTH};
use tracing::{debug, warn};

use crate::error::{DioError, Result};
use crate::instrument::Instrument;

/// Longest error queue drained before giving up
const MAX_DRAIN: u32 = 256;

/// One CCIO register value
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusRegister {
    /// Slot
    pub slot: u8,
    /// Register index
    pub index: u16,
    /// Value as reported
    pub value: i32,
}

impl StatusRegister {
    /// Known register name
    pub const fn name(&self) -> Option<&'static str> {
        regs::name(self.index)
    }
}

impl fmt::Display for StatusRegister {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bits = u32::from_ne_bytes(self.value.to_ne_bytes());
        match self.name() {
            Some(name) => write!(
                f,
                "CCIO{} REG{:<2} {name:<26} = {} ({bits:#010x})",
                self.slot, self.index, self.value
            ),
            None => write!(f, "CCIO{} REG{:<2} = {} ({bits:#010x})", self.slot, self.index, self.value),
        }
    }
}

/// Diagnostic access to one instrument
#[derive(Debug)]
pub struct Diagnostics<'a> {
    instrument: &'a mut dyn Instrument,
}

impl<'a> Diagnostics<'a> {
    /// Borrow an instrument
    pub fn new(instrument: &'a mut dyn Instrument) -> Self {
        Self { instrument }
    }

    fn check_slot(slot: u8) -> Result<()> {
        if slot > regs::MAX_SLOT {
            return Err(DioError::configuration(format!("slot {slot} out of range")));
        }
        Ok(())
    }

    /// Read one register
    ///
    /// # Errors
    ///
    /// Returns error for an out-of-range slot or register, or on transport
    /// failure.
    pub fn read_status(&mut self, slot: u8, index: u16) -> Result<StatusRegister> {
        Self::check_slot(slot)?;
        if index >= regs::CCIO_REG_COUNT {
            return Err(DioError::configuration(format!(
                "register {index} outside 0..{}",
                regs::CCIO_REG_COUNT
            )));
        }
        let value = self.instrument.read_register(slot, index)?;
        let reg = StatusRegister { slot, index, value };
        debug!("{reg}");
        Ok(reg)
    }

    /// Read a range of registers
    ///
    /// # Errors
    ///
    /// Returns error on the first failing read.
    pub fn dump_registers(&mut self, slot: u8, range: Range<u16>) -> Result<Vec<StatusRegister>> {
        range.map(|index| self.read_status(slot, index)).collect()
    }

    /// Enable a trace unit
    ///
    /// # Errors
    ///
    /// Returns [`DioError::Configuration`] for a zero or oversized depth, or
    /// error on transport failure.
    pub fn trace_on(&mut self, slot: u8, source: TraceSource, depth: u32) -> Result<()> {
        Self::check_slot(slot)?;
        if depth == 0 || depth > MAX_TRACE_DEPTH {
            return Err(DioError::configuration(format!(
                "trace depth {depth} outside 1..={MAX_TRACE_DEPTH}"
            )));
        }
        self.instrument.trace_on(slot, source, depth)
    }

    /// Disable a trace unit
    ///
    /// # Errors
    ///
    /// Returns error on transport failure.
    pub fn trace_off(&mut self, slot: u8, source: TraceSource) -> Result<()> {
        Self::check_slot(slot)?;
        self.instrument.trace_off(slot, source)
    }

    /// Route an input bit to the scope marker
    ///
    /// # Errors
    ///
    /// Returns error for a bit outside the bus, or on transport failure.
    pub fn marker_in(&mut self, slot: u8, bit: u8) -> Result<()> {
        Self::check_slot(slot)?;
        check_bit(bit)?;
        self.instrument.marker_in(slot, bit)
    }

    /// Route an output bit to the scope marker
    ///
    /// # Errors
    ///
    /// Returns error for a bit outside the bus, or on transport failure.
    pub fn marker_out(&mut self, slot: u8, bit: u8) -> Result<()> {
        Self::check_slot(slot)?;
        check_bit(bit)?;
        self.instrument.marker_out(slot, bit)
    }

    /// Put a feedback loop on the scope
    ///
    /// The readout slot shows the result's data-valid bit coming in and its
    /// trigger going out; each actor slot shows its HDAWG trigger.
    ///
    /// # Errors
    ///
    /// Returns error for a slot out of range, or on transport failure.
    pub fn scope_feedback(&mut self, readout_slot: u8, actor_slots: &[u8]) -> Result<()> {
        self.marker_in(readout_slot, regs::marker::UHFQA_DV)?;
        self.marker_out(readout_slot, regs::marker::UHFQA_TRIG)?;
        for &slot in actor_slots {
            self.marker_out(slot, regs::marker::HDAWG_TRIG)?;
        }
        debug!("scope markers on slots {readout_slot} and {actor_slots:?}");
        Ok(())
    }

    /// Pop every entry of the error queue
    ///
    /// # Errors
    ///
    /// Returns error on transport failure.
    pub fn drain_errors(&mut self) -> Result<Vec<String>> {
        let count = self.instrument.error_count()?;
        if count > MAX_DRAIN {
            warn!("{}: {count} queued errors, reading {MAX_DRAIN}", self.instrument.name());
        }
        let mut errors = Vec::new();
        for _ in 0..count.min(MAX_DRAIN) {
            let e = self.instrument.next_error()?;
            warn!("{}: {e}", self.instrument.name());
            errors.push(e);
        }
        Ok(errors)
    }
}

fn check_bit(bit: u8) -> Result<()> {
    if bit >= ccdio_chip::dio::BUS_WIDTH {
        return Err(DioError::configuration(format!("marker bit {bit} outside the bus")));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::sim::{SimBus, SimInstrument};
    use crate::instrument::DeviceRole;

    fn cc(bus: &SimBus) -> SimInstrument {
        SimInstrument::new("cc", DeviceRole::Sequencer, bus.clone())
    }

    #[test]
    fn register_display_names_known_indices() {
        let reg = StatusRegister { slot: 2, index: regs::SYS_ST_OPER_DIO_RD_INDEX, value: -1 };
        let text = reg.to_string();
        assert!(text.contains("SYS_ST_OPER_DIO_RD_INDEX"));
        assert!(text.contains("0xffffffff"));
    }

    #[test]
    fn dump_covers_all_registers() {
        let bus = SimBus::default();
        let mut dev = cc(&bus);
        let dump = Diagnostics::new(&mut dev).dump_registers(2, 0..regs::CCIO_REG_COUNT).unwrap();
        assert_eq!(dump.len(), usize::from(regs::CCIO_REG_COUNT));
        assert_eq!(dump[usize::from(regs::SYS_ST_OPER_DIO_RD_INDEX)].value, -1);
    }

    #[test]
    fn trace_depth_bounded() {
        let bus = SimBus::default();
        let mut dev = cc(&bus);
        let mut diag = Diagnostics::new(&mut dev);
        assert!(diag.trace_on(2, TraceSource::DevIn, MAX_TRACE_DEPTH + 1).is_err());
        assert!(diag.trace_on(2, TraceSource::DevIn, 0).is_err());
        diag.trace_on(2, TraceSource::BpOut, 128).unwrap();
        assert_eq!(bus.trace_depth("cc", 2, TraceSource::BpOut), Some(128));
        diag.trace_off(2, TraceSource::BpOut).unwrap();
        assert_eq!(bus.trace_depth("cc", 2, TraceSource::BpOut), None);
    }

    #[test]
    fn markers_routed() {
        let bus = SimBus::default();
        let mut dev = cc(&bus);
        let mut diag = Diagnostics::new(&mut dev);
        diag.marker_in(2, regs::marker::UHFQA_DV).unwrap();
        diag.marker_out(2, regs::marker::UHFQA_TRIG).unwrap();
        assert!(diag.marker_out(2, 32).is_err());
        assert_eq!(bus.markers("cc", 2), (Some(0), Some(16)));
    }

    #[test]
    fn feedback_markers_cover_readout_and_actors() {
        let bus = SimBus::default();
        let mut dev = cc(&bus);
        Diagnostics::new(&mut dev).scope_feedback(2, &[3, 4]).unwrap();
        assert_eq!(bus.markers("cc", 2), (Some(regs::marker::UHFQA_DV), Some(regs::marker::UHFQA_TRIG)));
        assert_eq!(bus.markers("cc", 3), (None, Some(regs::marker::HDAWG_TRIG)));
        assert_eq!(bus.markers("cc", 4), (None, Some(regs::marker::HDAWG_TRIG)));
    }

    #[test]
    fn drain_empty_queue() {
        let bus = SimBus::default();
        let mut dev = cc(&bus);
        assert!(Diagnostics::new(&mut dev).drain_errors().unwrap().is_empty());
    }
}
