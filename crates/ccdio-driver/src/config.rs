//! Session and device configuration
//!
//! Plain typed structs with defaults and `with_*` builders. Environment
//! overrides are applied only by [`SessionConfig::from_env`], in one place:
//!
//! | Variable | Effect |
//! |----------|--------|
//! | `CCDIO_CC_HOST` | CC host name or address |
//! | `CCDIO_UHFQA_HOST` | readout instrument host |
//! | `CCDIO_TIMEOUT_MS` | per-call timeout for both devices |

use std::time::Duration;

use ccdio_chip::scpi;

use crate::backends::sim::{SimBus, SimConfig};
use crate::error::{DioError, Result};
use crate::instrument::DeviceRole;

/// CC host variable
pub const ENV_CC_HOST: &str = "CCDIO_CC_HOST";
/// Readout instrument host variable
pub const ENV_UHFQA_HOST: &str = "CCDIO_UHFQA_HOST";
/// Timeout override variable, milliseconds
pub const ENV_TIMEOUT_MS: &str = "CCDIO_TIMEOUT_MS";

/// Per-call timeout unless overridden
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// CCIO slot the UHFQA is cabled to in the lab setup
pub const DEFAULT_UHFQA_SLOT: u8 = 2;

/// CCIO slot the HDAWG is cabled to in the lab setup
pub const DEFAULT_HDAWG_SLOT: u8 = 3;

/// Name of the CC in a session
pub const CC_NAME: &str = "cc";

/// Name of the readout instrument in a session
pub const UHFQA_NAME: &str = "uhfqa";

/// Where a device is reached
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    /// SCPI over TCP
    Ip {
        /// Host name or address
        host: String,
        /// TCP port
        port: u16,
    },
    /// Attached to a simulated lab
    Simulated(SimBus),
}

/// One device of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Device name, unique within a session
    pub name: String,
    /// Role in the setup
    pub role: DeviceRole,
    /// How to reach it
    pub endpoint: Endpoint,
    /// Per-call timeout
    pub timeout: Duration,
}

impl DeviceConfig {
    /// Device on the default SCPI port
    pub fn ip(name: &str, role: DeviceRole, host: &str) -> Self {
        Self {
            name: name.to_string(),
            role,
            endpoint: Endpoint::Ip {
                host: host.to_string(),
                port: scpi::DEFAULT_PORT,
            },
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Device in a simulated lab
    pub fn simulated(name: &str, role: DeviceRole, bus: SimBus) -> Self {
        Self {
            name: name.to_string(),
            role,
            endpoint: Endpoint::Simulated(bus),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// Override the per-call timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override the TCP port (no effect on simulated devices)
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        if let Endpoint::Ip { port: p, .. } = &mut self.endpoint {
            *p = port;
        }
        self
    }
}

/// The CC plus its readout instrument
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Central Controller
    pub cc: DeviceConfig,
    /// Readout instrument
    pub uhfqa: DeviceConfig,
    /// CCIO slot the readout instrument is cabled to
    pub uhfqa_slot: u8,
}

impl SessionConfig {
    /// Real instruments at the given hosts
    pub fn hardware(cc_host: &str, uhfqa_host: &str) -> Self {
        Self {
            cc: DeviceConfig::ip(CC_NAME, DeviceRole::Sequencer, cc_host),
            uhfqa: DeviceConfig::ip(UHFQA_NAME, DeviceRole::Readout, uhfqa_host),
            uhfqa_slot: DEFAULT_UHFQA_SLOT,
        }
    }

    /// Simulated lab, cabled both ways between the CC slot and the UHFQA
    pub fn simulated(sim: SimConfig) -> Self {
        let bus = SimBus::new(sim)
            .wire(UHFQA_NAME, 0, CC_NAME, DEFAULT_UHFQA_SLOT)
            .wire(CC_NAME, DEFAULT_UHFQA_SLOT, UHFQA_NAME, 0);
        Self {
            cc: DeviceConfig::simulated(CC_NAME, DeviceRole::Sequencer, bus.clone()),
            uhfqa: DeviceConfig::simulated(UHFQA_NAME, DeviceRole::Readout, bus),
            uhfqa_slot: DEFAULT_UHFQA_SLOT,
        }
    }

    /// Hosts and timeout from the environment
    ///
    /// # Errors
    ///
    /// Returns [`DioError::Configuration`] if a host variable is unset or the
    /// timeout does not parse.
    pub fn from_env() -> Result<Self> {
        let cc = std::env::var(ENV_CC_HOST)
            .map_err(|_| DioError::configuration(format!("{ENV_CC_HOST} not set")))?;
        let uhfqa = std::env::var(ENV_UHFQA_HOST)
            .map_err(|_| DioError::configuration(format!("{ENV_UHFQA_HOST} not set")))?;
        Self::hardware(&cc, &uhfqa).with_env_timeout()
    }

    /// Apply `CCDIO_TIMEOUT_MS` if set
    ///
    /// # Errors
    ///
    /// Returns [`DioError::Configuration`] if the value is not an integer.
    pub fn with_env_timeout(self) -> Result<Self> {
        match std::env::var(ENV_TIMEOUT_MS) {
            Ok(raw) => {
                let ms: u64 = raw.trim().parse().map_err(|_| {
                    DioError::configuration(format!("{ENV_TIMEOUT_MS}={raw} is not a number"))
                })?;
                Ok(self.with_timeout(Duration::from_millis(ms)))
            }
            Err(_) => Ok(self),
        }
    }

    /// Same timeout for both devices
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.cc.timeout = timeout;
        self.uhfqa.timeout = timeout;
        self
    }

    /// CCIO slot of the readout instrument
    #[must_use]
    pub const fn with_uhfqa_slot(mut self, slot: u8) -> Self {
        self.uhfqa_slot = slot;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hardware_uses_scpi_port() {
        let cfg = SessionConfig::hardware("cc.lab", "uhfqa.lab");
        assert_eq!(
            cfg.cc.endpoint,
            Endpoint::Ip { host: "cc.lab".into(), port: scpi::DEFAULT_PORT }
        );
        assert_eq!(cfg.uhfqa.role, DeviceRole::Readout);
        assert_eq!(cfg.uhfqa_slot, DEFAULT_UHFQA_SLOT);
    }

    #[test]
    fn simulated_devices_share_one_bus() {
        let cfg = SessionConfig::simulated(SimConfig::default());
        match (&cfg.cc.endpoint, &cfg.uhfqa.endpoint) {
            (Endpoint::Simulated(a), Endpoint::Simulated(b)) => assert_eq!(a, b),
            other => panic!("expected simulated endpoints, got {other:?}"),
        }
    }

    #[test]
    fn builders_override_defaults() {
        let cfg = SessionConfig::hardware("a", "b")
            .with_timeout(Duration::from_millis(250))
            .with_uhfqa_slot(4);
        assert_eq!(cfg.cc.timeout, Duration::from_millis(250));
        assert_eq!(cfg.uhfqa.timeout, Duration::from_millis(250));
        assert_eq!(cfg.uhfqa_slot, 4);

        let dev = DeviceConfig::ip("x", DeviceRole::Sequencer, "h").with_port(6000);
        assert_eq!(dev.endpoint, Endpoint::Ip { host: "h".into(), port: 6000 });
    }
}
