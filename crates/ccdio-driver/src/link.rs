//! DIO links between CCIO slots and instruments
//!
//! A link binds one sender port to one receiver port with a fixed bit width,
//! active mask and [`DioLayout`]. Ports are exclusive: a port belongs to at
//! most one live link. The registry hands out links; a link gives its ports
//! back when it is dropped or released.
//!
//! ```text
//! DioPort(uhfqa, 0) ──DIO──▶ DioPort(cc, 2)    mask 0x3FF, layout dv-lsb
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use ccdio_chip::dio::{DecodedWord, DioLayout, BUS_WIDTH};

use crate::calibration::CalibrationResult;
use crate::error::{DioError, Result};

/// A device's DIO connector: `(device, slot)`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DioPort {
    /// Device name
    pub device: String,
    /// CCIO slot (0 for single-port instruments)
    pub slot: u8,
}

impl DioPort {
    /// Create a port
    pub fn new(device: &str, slot: u8) -> Self {
        Self {
            device: device.to_string(),
            slot,
        }
    }
}

impl fmt::Display for DioPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.device, self.slot)
    }
}

/// Registry handle of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LinkId(u32);

type Reservations = BTreeMap<LinkId, (DioPort, DioPort)>;

/// Port claim of one link, returned to the registry on drop
#[derive(Debug)]
struct Reservation {
    id: LinkId,
    registry: Weak<Mutex<Reservations>>,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let Some(registry) = self.registry.upgrade() else {
            return;
        };
        match registry.lock() {
            Ok(mut active) => {
                if let Some((s, r)) = active.remove(&self.id) {
                    tracing::debug!("Link {:?} released: {s} → {r}", self.id);
                }
            }
            Err(_) => tracing::error!("link registry poisoned, {:?} not released", self.id),
        };
    }
}

/// Directed DIO connection, sender → receiver
///
/// Holds its ports until dropped.
#[derive(Debug)]
pub struct DioLink {
    id: LinkId,
    reservation: Reservation,
    sender: DioPort,
    receiver: DioPort,
    bit_width: u8,
    active_mask: u32,
    layout: DioLayout,
    calibrated: Option<CalibrationResult>,
}

impl DioLink {
    /// Registry handle
    pub const fn id(&self) -> LinkId {
        self.id
    }

    /// Driving port
    pub const fn sender(&self) -> &DioPort {
        &self.sender
    }

    /// Sampling port
    pub const fn receiver(&self) -> &DioPort {
        &self.receiver
    }

    /// Number of physical lines
    pub const fn bit_width(&self) -> u8 {
        self.bit_width
    }

    /// Bits that carry information
    pub const fn active_mask(&self) -> u32 {
        self.active_mask
    }

    /// Codeword / data-valid placement
    pub const fn layout(&self) -> DioLayout {
        self.layout
    }

    /// Accepted calibration, once calibrated
    pub const fn calibrated(&self) -> Option<&CalibrationResult> {
        self.calibrated.as_ref()
    }

    /// Store the accepted result; a link is calibrated once
    pub(crate) fn mark_calibrated(&mut self, result: CalibrationResult) -> Result<()> {
        if self.calibrated.is_some() {
            return Err(DioError::configuration(format!(
                "link {} → {} already calibrated",
                self.sender, self.receiver
            )));
        }
        self.calibrated = Some(result);
        Ok(())
    }

    /// Pack a codeword for this link
    ///
    /// # Errors
    ///
    /// Returns [`DioError::Configuration`] if the codeword does not fit the
    /// layout.
    pub fn encode(&self, codeword: u32, data_valid: bool) -> Result<u32> {
        self.layout.encode(codeword, data_valid).ok_or_else(|| {
            DioError::configuration(format!(
                "codeword {codeword} exceeds {} (max {})",
                self.layout.name,
                self.layout.max_codeword()
            ))
        })
    }

    /// Split a sampled bus word; inactive bits are dropped first
    pub const fn decode(&self, word: u32) -> DecodedWord {
        self.layout.decode(word & self.active_mask)
    }
}

/// Owner of port exclusivity
#[derive(Debug, Default)]
pub struct LinkRegistry {
    active: Arc<Mutex<Reservations>>,
    next: u32,
}

impl LinkRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    fn active(&self) -> Result<MutexGuard<'_, Reservations>> {
        self.active
            .lock()
            .map_err(|_| DioError::configuration("link registry poisoned"))
    }

    /// Number of live links
    pub fn len(&self) -> usize {
        self.active().map_or(0, |a| a.len())
    }

    /// True if no link is live
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Create a link
    ///
    /// # Errors
    ///
    /// Returns [`DioError::Configuration`] if the ports coincide or are
    /// already linked, the mask is empty or wider than the bus, or the layout
    /// places bits outside the mask.
    pub fn create_link(
        &mut self,
        sender: DioPort,
        receiver: DioPort,
        bit_width: u8,
        active_mask: u32,
        layout: DioLayout,
    ) -> Result<DioLink> {
        if sender == receiver {
            return Err(DioError::configuration(format!(
                "link from {sender} to itself"
            )));
        }
        {
            let active = self.active()?;
            for port in [&sender, &receiver] {
                if active.values().any(|(s, r)| s == port || r == port) {
                    return Err(DioError::configuration(format!("port {port} already linked")));
                }
            }
        }
        if active_mask == 0 {
            return Err(DioError::configuration("active mask is empty"));
        }
        if bit_width == 0 || bit_width > BUS_WIDTH {
            return Err(DioError::configuration(format!(
                "bit width {bit_width} outside 1..={BUS_WIDTH}"
            )));
        }
        if bit_width < BUS_WIDTH && active_mask >> bit_width != 0 {
            return Err(DioError::configuration(format!(
                "mask {active_mask:#x} exceeds {bit_width} bits"
            )));
        }
        if !layout.is_consistent() {
            return Err(DioError::configuration(format!(
                "layout {} does not fit the bus",
                layout.name
            )));
        }
        if layout.mask() & !active_mask != 0 {
            return Err(DioError::configuration(format!(
                "layout {layout} not inside mask {active_mask:#x}"
            )));
        }

        let id = LinkId(self.next);
        self.next += 1;
        self.active()?.insert(id, (sender.clone(), receiver.clone()));
        tracing::debug!("Link {id:?}: {sender} → {receiver}, mask {active_mask:#x}, {layout}");

        Ok(DioLink {
            id,
            reservation: Reservation {
                id,
                registry: Arc::downgrade(&self.active),
            },
            sender,
            receiver,
            bit_width,
            active_mask,
            layout,
            calibrated: None,
        })
    }

    /// Release a link and free its ports
    ///
    /// Dropping the link has the same effect; this form checks ownership.
    ///
    /// # Errors
    ///
    /// Returns [`DioError::Configuration`] if the link came from another
    /// registry.
    pub fn release(&mut self, link: DioLink) -> Result<()> {
        if !Weak::ptr_eq(&link.reservation.registry, &Arc::downgrade(&self.active)) {
            return Err(DioError::configuration(format!(
                "link {:?} not registered here",
                link.id
            )));
        }
        drop(link);
        Ok(())
    }
}

/// Receiver-side expectation: `(pattern, hold)` pairs
///
/// Empty means external-trigger mode, where only data-valid is checked.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpectedSequence {
    pairs: Vec<(u32, u32)>,
}

impl ExpectedSequence {
    /// Data-valid-only expectation
    pub fn empty() -> Self {
        Self::default()
    }

    /// Build from pairs
    ///
    /// # Errors
    ///
    /// Returns [`DioError::Configuration`] if any hold is zero.
    pub fn new(pairs: Vec<(u32, u32)>) -> Result<Self> {
        if let Some(i) = pairs.iter().position(|&(_, hold)| hold == 0) {
            return Err(DioError::configuration(format!("expected[{i}] has zero hold")));
        }
        Ok(Self { pairs })
    }

    /// Codewords `0..steps` in order, each with data-valid, held `hold`
    /// cycles, followed by an idle word
    ///
    /// # Errors
    ///
    /// Returns [`DioError::Configuration`] if `hold` is zero or a codeword
    /// does not fit the layout.
    pub fn staircase(layout: DioLayout, steps: u32, hold: u32) -> Result<Self> {
        let mut pairs = Vec::new();
        for cw in 0..steps {
            let word = layout.encode(cw, true).ok_or_else(|| {
                DioError::configuration(format!("staircase step {cw} exceeds {}", layout.name))
            })?;
            pairs.push((word, hold));
        }
        pairs.push((0, hold));
        Self::new(pairs)
    }

    /// The pairs
    pub fn pairs(&self) -> &[(u32, u32)] {
        &self.pairs
    }

    /// True in external-trigger mode
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Sum of holds
    pub fn total_cycles(&self) -> u64 {
        self.pairs.iter().map(|&(_, h)| u64::from(h)).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upstream(reg: &mut LinkRegistry) -> Result<DioLink> {
        reg.create_link(
            DioPort::new("uhfqa", 0),
            DioPort::new("cc", 2),
            32,
            0x3FF,
            DioLayout::DV_LSB,
        )
    }

    #[test]
    fn empty_mask_rejected() {
        let mut reg = LinkRegistry::new();
        let err = reg
            .create_link(DioPort::new("uhfqa", 0), DioPort::new("cc", 2), 32, 0, DioLayout::DV_LSB)
            .unwrap_err();
        assert!(matches!(err, DioError::Configuration { .. }));
        assert!(reg.is_empty());
    }

    #[test]
    fn reused_port_rejected_until_released() {
        let mut reg = LinkRegistry::new();
        let link = upstream(&mut reg).unwrap();
        let err = reg
            .create_link(DioPort::new("hdawg", 0), DioPort::new("cc", 2), 32, 0x3FF, DioLayout::DV_LSB)
            .unwrap_err();
        assert!(matches!(err, DioError::Configuration { .. }));

        reg.release(link).unwrap();
        assert!(upstream(&mut reg).is_ok());
    }

    #[test]
    fn dropped_link_frees_its_ports() {
        let mut reg = LinkRegistry::new();
        {
            let _link = upstream(&mut reg).unwrap();
            assert_eq!(reg.len(), 1);
        }
        assert!(reg.is_empty());
        let again = upstream(&mut reg).unwrap();
        drop(again);
        assert!(reg.is_empty());
    }

    #[test]
    fn release_checks_the_owning_registry() {
        let mut mine = LinkRegistry::new();
        let mut other = LinkRegistry::new();
        let link = upstream(&mut mine).unwrap();
        assert!(other.release(link).is_err());
        // the rejected link was dropped, so its ports are back
        assert!(mine.is_empty());
    }

    #[test]
    fn off_bus_layout_rejected_without_panic() {
        let mut reg = LinkRegistry::new();
        let err = reg
            .create_link(
                DioPort::new("uhfqa", 0),
                DioPort::new("cc", 2),
                32,
                0x3FF,
                DioLayout::new("bad", 40, 1, 9),
            )
            .unwrap_err();
        assert!(matches!(err, DioError::Configuration { .. }));
        assert!(err.to_string().contains("bad"));
        assert!(reg.is_empty());
    }

    #[test]
    fn same_port_rejected() {
        let mut reg = LinkRegistry::new();
        let port = DioPort::new("cc", 2);
        assert!(reg
            .create_link(port.clone(), port, 32, 0x3FF, DioLayout::DV_LSB)
            .is_err());
    }

    #[test]
    fn mask_must_fit_width_and_cover_layout() {
        let mut reg = LinkRegistry::new();
        let a = DioPort::new("uhfqa", 0);
        let b = DioPort::new("cc", 2);
        assert!(reg.create_link(a.clone(), b.clone(), 8, 0x3FF, DioLayout::DV_LSB).is_err());
        assert!(reg.create_link(a.clone(), b.clone(), 32, 0xFF, DioLayout::DV_LSB).is_err());
        assert!(reg.create_link(a, b, 32, 0x03FF_0000, DioLayout::CC_TO_UHFQA).is_ok());
    }

    #[test]
    fn calibrated_once() {
        let mut reg = LinkRegistry::new();
        let mut link = upstream(&mut reg).unwrap();
        let result = CalibrationResult::failed(2, ccdio_chip::regs::diocal_cond::NO_PASS, vec![]);
        link.mark_calibrated(result.clone()).unwrap();
        assert!(link.mark_calibrated(result).is_err());
    }

    #[test]
    fn link_codec_checks_range() {
        let mut reg = LinkRegistry::new();
        let link = upstream(&mut reg).unwrap();
        assert_eq!(link.encode(7, true).unwrap(), 15);
        assert!(link.encode(512, true).is_err());
        assert_eq!(link.decode(0xFFFF_F00F).codeword, 0b111);
    }

    #[test]
    fn staircase_is_cw_times_two_plus_one() {
        let seq = ExpectedSequence::staircase(DioLayout::DV_LSB, 4, 2).unwrap();
        assert_eq!(seq.pairs(), &[(1, 2), (3, 2), (5, 2), (7, 2), (0, 2)]);
        assert_eq!(seq.total_cycles(), 10);
        assert!(ExpectedSequence::new(vec![(1, 0)]).is_err());
    }
}
