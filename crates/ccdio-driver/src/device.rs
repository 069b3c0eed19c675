//! Device handle
//!
//! A [`Device`] owns one instrument connection for the lifetime of a
//! session. Opening resets the instrument and clears its status, and a
//! sequencer also gets every questionable bit enabled. Dropping stops the
//! sequencer.

use ccdio_chip::regs::questionable;

use crate::config::{DeviceConfig, Endpoint};
use crate::error::Result;
use crate::instrument::{select_instrument, DeviceRole, Identity, Instrument};

/// Open instrument owned by a session
#[derive(Debug)]
pub struct Device {
    name: String,
    role: DeviceRole,
    endpoint: String,
    instrument: Box<dyn Instrument>,
}

impl Device {
    /// Connect, reset and clear status
    ///
    /// # Errors
    ///
    /// Returns error if the instrument cannot be reached or refuses the reset.
    pub fn open(config: &DeviceConfig) -> Result<Self> {
        let endpoint = match &config.endpoint {
            Endpoint::Ip { host, port } => format!("{host}:{port}"),
            Endpoint::Simulated(_) => "sim".to_string(),
        };
        tracing::debug!("Opening {} ({}) at {endpoint}", config.name, config.role);

        let instrument = select_instrument(config)?;
        Self::with_instrument(instrument, &endpoint)
    }

    /// Take ownership of an already constructed instrument
    ///
    /// # Errors
    ///
    /// Returns error if the reset fails.
    pub fn with_instrument(mut instrument: Box<dyn Instrument>, endpoint: &str) -> Result<Self> {
        instrument.reset()?;
        instrument.clear_status()?;
        if instrument.role() == DeviceRole::Sequencer {
            instrument.enable_questionable(questionable::ENABLE_ALL)?;
        }
        let device = Self {
            name: instrument.name().to_string(),
            role: instrument.role(),
            endpoint: endpoint.to_string(),
            instrument,
        };
        tracing::info!("Opened {} ({}) at {}", device.name, device.role, device.endpoint);
        Ok(device)
    }

    /// Device name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Role in the setup
    #[must_use]
    pub const fn role(&self) -> DeviceRole {
        self.role
    }

    /// Endpoint description
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Query `*IDN?`
    ///
    /// # Errors
    ///
    /// Returns error on transport failure or a malformed response.
    pub fn identity(&mut self) -> Result<Identity> {
        self.instrument.identity()
    }

    /// Shared access to the instrument
    pub fn instrument(&self) -> &dyn Instrument {
        self.instrument.as_ref()
    }

    /// Exclusive access to the instrument
    pub fn instrument_mut(&mut self) -> &mut dyn Instrument {
        self.instrument.as_mut()
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        if let Err(e) = self.instrument.stop() {
            tracing::warn!("Failed to stop {} on close: {e}", self.name);
        }
        tracing::debug!("Closed {}", self.name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::sim::{SimBus, SimConfig};

    #[test]
    fn open_resets_and_drop_stops() {
        let bus = SimBus::new(SimConfig::default());
        let config = DeviceConfig::simulated("cc", DeviceRole::Sequencer, bus.clone());
        let mut device = Device::open(&config).unwrap();
        assert_eq!(device.name(), "cc");
        assert_eq!(device.endpoint(), "sim");
        device.instrument_mut().start().unwrap();
        assert!(bus.is_running("cc"));
        drop(device);
        assert!(!bus.is_running("cc"));
    }

    #[test]
    fn sequencer_opens_with_questionable_enabled() {
        let bus = SimBus::new(SimConfig::default());
        let _cc = Device::open(&DeviceConfig::simulated("cc", DeviceRole::Sequencer, bus.clone())).unwrap();
        let _uhfqa = Device::open(&DeviceConfig::simulated("uhfqa", DeviceRole::Readout, bus.clone())).unwrap();
        assert_eq!(bus.questionable_enable("cc"), questionable::ENABLE_ALL);
        assert_eq!(bus.questionable_enable("uhfqa"), 0);
    }

    #[test]
    fn identity_comes_from_instrument() {
        let bus = SimBus::default();
        let config = DeviceConfig::simulated("uhfqa", DeviceRole::Readout, bus);
        let mut device = Device::open(&config).unwrap();
        assert_eq!(device.identity().unwrap().model, "UHFQA-SIM");
    }
}
