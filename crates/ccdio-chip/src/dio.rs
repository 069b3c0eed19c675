//! DIO bus layouts.
//!
//! Both ends of a DIO link must agree out of band on where the codeword and
//! the data-valid strobe sit on the 32-bit bus. A layout is therefore a named,
//! fixed policy, never inferred from traffic.
//!
//! ```text
//! layout        DV bit   codeword bits   active mask   seen in
//! ────────────  ──────   ─────────────   ───────────   ─────────────────────────
//! DV_LSB          0        1..=9         0x0000_03FF   UHFQA result upstream (cw*2+1)
//! CC_TO_UHFQA    16       17..=25        0x03FF_0000   CC trigger/codeword downstream
//! ```

/// Width of the physical DIO bus.
pub const BUS_WIDTH: u8 = 32;

/// Placement of codeword and data-valid bits on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DioLayout {
    /// Short name used in logs.
    pub name: &'static str,
    /// Bit carrying data-valid (or trigger, downstream).
    pub data_valid_bit: u8,
    /// Position of codeword bit 0.
    pub codeword_shift: u8,
    /// Number of codeword bits.
    pub codeword_bits: u8,
}

/// A bus word split back into its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DecodedWord {
    /// Codeword bits, shifted down to bit 0.
    pub codeword: u32,
    /// Data-valid strobe.
    pub data_valid: bool,
}

const fn ones(bits: u8) -> u32 {
    if bits >= 32 {
        u32::MAX
    } else {
        (1u32 << bits) - 1
    }
}

/// Shift that yields 0 for positions off the bus.
const fn shl(value: u32, by: u8) -> u32 {
    if by >= BUS_WIDTH {
        0
    } else {
        value << by
    }
}

const fn shr(value: u32, by: u8) -> u32 {
    if by >= BUS_WIDTH {
        0
    } else {
        value >> by
    }
}

impl DioLayout {
    /// UHFQA → CC result layout: DV on bit 0, codeword shifted up by one.
    pub const DV_LSB: Self = Self::new("dv-lsb", 0, 1, 9);

    /// CC → UHFQA layout: trigger/DV on bit 16, codeword from bit 17.
    pub const CC_TO_UHFQA: Self = Self::new("cc-to-uhfqa", 16, 17, 9);

    /// Define a layout.
    #[must_use]
    pub const fn new(name: &'static str, data_valid_bit: u8, codeword_shift: u8, codeword_bits: u8) -> Self {
        Self {
            name,
            data_valid_bit,
            codeword_shift,
            codeword_bits,
        }
    }

    /// True if all fields fit on the bus and the DV bit lies outside the codeword.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        let cw_end = self.codeword_shift as u32 + self.codeword_bits as u32;
        let dv = self.data_valid_bit as u32;
        self.codeword_bits > 0
            && cw_end <= BUS_WIDTH as u32
            && dv < BUS_WIDTH as u32
            && (dv < self.codeword_shift as u32 || dv >= cw_end)
    }

    /// Mask of the data-valid bit; 0 if the bit is off the bus.
    #[must_use]
    pub const fn data_valid_mask(&self) -> u32 {
        shl(1, self.data_valid_bit)
    }

    /// Mask of the codeword bits.
    #[must_use]
    pub const fn codeword_mask(&self) -> u32 {
        shl(ones(self.codeword_bits), self.codeword_shift)
    }

    /// All bits the layout drives.
    #[must_use]
    pub const fn mask(&self) -> u32 {
        self.data_valid_mask() | self.codeword_mask()
    }

    /// Largest codeword the layout can carry.
    #[must_use]
    pub const fn max_codeword(&self) -> u32 {
        ones(self.codeword_bits)
    }

    /// Pack a codeword and data-valid flag into a bus word.
    ///
    /// Returns `None` if the codeword does not fit or the layout is
    /// inconsistent.
    #[must_use]
    pub const fn encode(&self, codeword: u32, data_valid: bool) -> Option<u32> {
        if !self.is_consistent() || codeword > self.max_codeword() {
            return None;
        }
        let dv = if data_valid { self.data_valid_mask() } else { 0 };
        Some(shl(codeword, self.codeword_shift) | dv)
    }

    /// Split a bus word. Bits outside the layout are ignored.
    #[must_use]
    pub const fn decode(&self, word: u32) -> DecodedWord {
        DecodedWord {
            codeword: shr(word & self.codeword_mask(), self.codeword_shift),
            data_valid: word & self.data_valid_mask() != 0,
        }
    }
}

impl std::fmt::Display for DioLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} (mask {:#010x})", self.name, self.mask())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn named_layouts_match_observed_masks() {
        assert_eq!(DioLayout::DV_LSB.mask(), 0x0000_03FF);
        assert_eq!(DioLayout::CC_TO_UHFQA.mask(), 0x03FF_0000);
        assert_eq!(DioLayout::CC_TO_UHFQA.data_valid_mask(), 0x0001_0000);
        assert!(DioLayout::DV_LSB.is_consistent());
        assert!(DioLayout::CC_TO_UHFQA.is_consistent());
    }

    #[test]
    fn uhfqa_codeword_convention() {
        // cw * 2 + 1, as the UHFQA codeword generator emits it
        for cw in [7u32, 6, 5, 4] {
            assert_eq!(DioLayout::DV_LSB.encode(cw, true), Some(cw * 2 + 1));
        }
    }

    #[test]
    fn round_trip_all_codewords() {
        for layout in [DioLayout::DV_LSB, DioLayout::CC_TO_UHFQA] {
            for cw in 0..=layout.max_codeword() {
                for dv in [false, true] {
                    let word = layout.encode(cw, dv).unwrap();
                    assert_eq!(layout.decode(word), DecodedWord { codeword: cw, data_valid: dv });
                }
            }
        }
    }

    #[test]
    fn oversized_codeword_rejected() {
        assert_eq!(DioLayout::DV_LSB.encode(0x200, true), None);
    }

    #[test]
    fn decode_ignores_stray_bits() {
        let d = DioLayout::DV_LSB.decode(0xFFFF_FC00 | 0b101);
        assert_eq!(d, DecodedWord { codeword: 0b10, data_valid: true });
    }

    #[test]
    fn overlapping_layout_is_inconsistent() {
        assert!(!DioLayout::new("bad", 3, 1, 9).is_consistent());
        assert!(!DioLayout::new("wide", 0, 1, 32).is_consistent());
    }

    #[test]
    fn off_bus_layout_does_not_panic() {
        let layout = DioLayout::new("off-bus", 40, 33, 9);
        assert!(!layout.is_consistent());
        assert_eq!(layout.mask(), 0);
        assert_eq!(layout.encode(1, true), None);
        assert_eq!(layout.decode(u32::MAX), DecodedWord { codeword: 0, data_valid: false });
        assert!(layout.to_string().starts_with("off-bus"));
    }
}
