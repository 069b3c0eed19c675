//! Lab session
//!
//! Owns the open devices and the link registry. Orchestration that spans
//! several devices (calibration, the feedback run, retries) goes through
//! here so that every instrument has exactly one owner.

use ccdio_chip::dio::DioLayout;
use ccdio_chip::program::Program;

use crate::calibration::{CalibrationConfig, CalibrationPlan, CalibrationResult, Calibrator};
use crate::config::{SessionConfig, CC_NAME, UHFQA_NAME};
use crate::device::Device;
use crate::diagnostics::Diagnostics;
use crate::error::{DioError, ErrorKind, Result};
use crate::feedback::{run_feedback, FeedbackProgram, FeedbackReport};
use crate::instrument::Identity;
use crate::link::{DioLink, DioPort, LinkRegistry};

/// Open devices plus link bookkeeping
#[derive(Debug)]
pub struct Session {
    devices: Vec<Device>,
    links: LinkRegistry,
    uhfqa_slot: u8,
}

impl Session {
    /// Open the CC and the readout instrument
    ///
    /// # Errors
    ///
    /// Returns error if either device cannot be opened.
    pub fn open(config: &SessionConfig) -> Result<Self> {
        tracing::info!("Opening session...");
        let cc = Device::open(&config.cc)?;
        let uhfqa = Device::open(&config.uhfqa)?;
        Ok(Self::from_devices(vec![cc, uhfqa], config.uhfqa_slot))
    }

    /// Session over already opened devices
    pub fn from_devices(devices: Vec<Device>, uhfqa_slot: u8) -> Self {
        tracing::info!("Session with {} device(s)", devices.len());
        Self {
            devices,
            links: LinkRegistry::new(),
            uhfqa_slot,
        }
    }

    /// All devices
    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// CCIO slot of the readout instrument
    pub const fn uhfqa_slot(&self) -> u8 {
        self.uhfqa_slot
    }

    fn index(&self, name: &str) -> Result<usize> {
        self.devices
            .iter()
            .position(|d| d.name() == name)
            .ok_or_else(|| DioError::configuration(format!("no device named {name}")))
    }

    /// Device by name
    ///
    /// # Errors
    ///
    /// Returns [`DioError::Configuration`] if no such device is open.
    pub fn device_mut(&mut self, name: &str) -> Result<&mut Device> {
        let i = self.index(name)?;
        Ok(&mut self.devices[i])
    }

    /// Two distinct devices at once
    ///
    /// # Errors
    ///
    /// Returns [`DioError::Configuration`] if a name is unknown or both
    /// names are the same.
    pub fn pair_mut(&mut self, a: &str, b: &str) -> Result<(&mut Device, &mut Device)> {
        let ia = self.index(a)?;
        let ib = self.index(b)?;
        if ia == ib {
            return Err(DioError::configuration(format!("{a} paired with itself")));
        }
        if ia < ib {
            let (lo, hi) = self.devices.split_at_mut(ib);
            Ok((&mut lo[ia], &mut hi[0]))
        } else {
            let (lo, hi) = self.devices.split_at_mut(ia);
            Ok((&mut hi[0], &mut lo[ib]))
        }
    }

    /// Link registry
    pub fn links_mut(&mut self) -> &mut LinkRegistry {
        &mut self.links
    }

    /// UHFQA result bus into the CC: DV on bit 0, codeword above it
    ///
    /// # Errors
    ///
    /// Returns [`DioError::Configuration`] if either port is already linked.
    pub fn upstream_link(&mut self) -> Result<DioLink> {
        let layout = DioLayout::DV_LSB;
        self.links.create_link(
            DioPort::new(UHFQA_NAME, 0),
            DioPort::new(CC_NAME, self.uhfqa_slot),
            ccdio_chip::dio::BUS_WIDTH,
            layout.mask(),
            layout,
        )
    }

    /// Identify every device
    ///
    /// # Errors
    ///
    /// Returns error on the first device that does not answer.
    pub fn identify_all(&mut self) -> Result<Vec<(String, Identity)>> {
        self.devices
            .iter_mut()
            .map(|d| Ok((d.name().to_string(), d.identity()?)))
            .collect()
    }

    /// Diagnostics on one device
    ///
    /// # Errors
    ///
    /// Returns [`DioError::Configuration`] if no such device is open.
    pub fn diagnostics(&mut self, name: &str) -> Result<Diagnostics<'_>> {
        let device = self.device_mut(name)?;
        Ok(Diagnostics::new(device.instrument_mut()))
    }

    /// One calibration attempt on `link`
    ///
    /// # Errors
    ///
    /// See [`Calibrator::calibrate`].
    pub fn calibrate(
        &mut self,
        link: &mut DioLink,
        plan: &CalibrationPlan,
        config: &CalibrationConfig,
    ) -> Result<CalibrationResult> {
        let sender = link.sender().device.clone();
        let receiver = link.receiver().device.clone();
        let (tx, rx) = self.pair_mut(&sender, &receiver)?;
        Calibrator::new(config.clone()).calibrate(link, plan, tx.instrument_mut(), rx.instrument_mut())
    }

    /// Calibrate, repeating up to `attempts` times on an invalid result or a
    /// communication fault
    ///
    /// # Errors
    ///
    /// Returns configuration errors at once, and the last communication
    /// error if every attempt failed on one.
    pub fn calibrate_with_retries(
        &mut self,
        link: &mut DioLink,
        plan: &CalibrationPlan,
        config: &CalibrationConfig,
        attempts: u32,
    ) -> Result<CalibrationResult> {
        let mut last: Option<Result<CalibrationResult>> = None;
        for attempt in 1..=attempts.max(1) {
            match self.calibrate(link, plan, config) {
                Ok(result) if result.is_valid() => return Ok(result),
                Ok(result) => {
                    tracing::warn!("attempt {attempt}/{attempts}: {result}");
                    last = Some(Ok(result));
                }
                Err(e) if e.kind() == ErrorKind::Communication => {
                    tracing::warn!("attempt {attempt}/{attempts}: {e}");
                    last = Some(Err(e));
                }
                Err(e) => return Err(e),
            }
        }
        last.unwrap_or_else(|| Err(DioError::configuration("no calibration attempt made")))
    }

    /// Run a feedback loop with the readout instrument serving results
    ///
    /// # Errors
    ///
    /// See [`run_feedback`].
    pub fn run_feedback(
        &mut self,
        feedback: &FeedbackProgram,
        readout_program: &Program,
        trace_depth: u32,
    ) -> Result<FeedbackReport> {
        let (cc, uhfqa) = self.pair_mut(CC_NAME, UHFQA_NAME)?;
        run_feedback(
            cc.instrument_mut(),
            uhfqa.instrument_mut(),
            feedback,
            readout_program,
            trace_depth,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::sim::SimConfig;

    #[test]
    fn pair_is_disjoint_in_either_order() {
        let mut s = Session::open(&SessionConfig::simulated(SimConfig::default())).unwrap();
        let (a, b) = s.pair_mut(UHFQA_NAME, CC_NAME).unwrap();
        assert_eq!((a.name(), b.name()), (UHFQA_NAME, CC_NAME));
        let (a, b) = s.pair_mut(CC_NAME, UHFQA_NAME).unwrap();
        assert_eq!((a.name(), b.name()), (CC_NAME, UHFQA_NAME));
        assert!(s.pair_mut(CC_NAME, CC_NAME).is_err());
        assert!(s.device_mut("hdawg").is_err());
    }

    #[test]
    fn upstream_link_claims_ports() {
        let mut s = Session::open(&SessionConfig::simulated(SimConfig::default())).unwrap();
        let up = s.upstream_link().unwrap();
        assert_eq!(up.active_mask(), 0x3FF);
        assert!(s.upstream_link().is_err());
        s.links_mut().release(up).unwrap();
        assert!(s.upstream_link().is_ok());
    }

    #[test]
    fn dropped_upstream_link_can_be_claimed_again() {
        let mut s = Session::open(&SessionConfig::simulated(SimConfig::default())).unwrap();
        {
            let _link = s.upstream_link().unwrap();
        }
        assert!(s.upstream_link().is_ok());
    }

    #[test]
    fn identify_sim_devices() {
        let mut s = Session::open(&SessionConfig::simulated(SimConfig::default())).unwrap();
        let ids = s.identify_all().unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(ids[0].1.vendor, "QuTech");
    }
}
