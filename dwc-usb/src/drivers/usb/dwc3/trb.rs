//! Transfer Request Blocks
//!
//! A TRB is the 16-byte descriptor the DWC3 DMA engine walks. Software fills
//! it and hands it over by setting `HWO`; the core clears `HWO` and writes
//! the remaining byte count back into `size` when it is done with it.

use bitflags::bitflags;

bitflags! {
    /// TRB control word flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TrbCtrl: u32 {
        /// Hardware owns the TRB
        const HWO = 1 << 0;
        /// Last TRB of the transfer
        const LST = 1 << 1;
        /// Chained to the next TRB
        const CHN = 1 << 2;
        /// Continue on short packet
        const CSP = 1 << 3;
        /// Interrupt on short packet (OUT) / missed ISOC (IN)
        const ISP_IMI = 1 << 10;
        /// Interrupt on completion
        const IOC = 1 << 11;
    }
}

const TRBCTL_POS: u32 = 4;
const TRBCTL_MASK: u32 = 0x3f << TRBCTL_POS;

/// Remaining buffer size in the `size` word
pub const TRB_BUFSIZ_MASK: u32 = 0x00ff_ffff;
const TRB_TRBSTS_POS: u32 = 28;

/// TRB types (TRBCTL field)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrbType {
    Normal = 1,
    ControlSetup = 2,
    ControlStatus2 = 3,
    ControlStatus3 = 4,
    ControlData = 5,
    IsochronousFirst = 6,
    Isochronous = 7,
    Link = 8,
    NormalZlp = 9,
}

impl TrbType {
    fn from_bits(bits: u32) -> Option<Self> {
        Some(match bits {
            1 => Self::Normal,
            2 => Self::ControlSetup,
            3 => Self::ControlStatus2,
            4 => Self::ControlStatus3,
            5 => Self::ControlData,
            6 => Self::IsochronousFirst,
            7 => Self::Isochronous,
            8 => Self::Link,
            9 => Self::NormalZlp,
            _ => return None,
        })
    }

    const fn ctrl_bits(self) -> u32 {
        (self as u32) << TRBCTL_POS
    }
}

/// Transfer Request Block
#[repr(C, align(16))]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trb {
    pub bpl: u32,
    pub bph: u32,
    pub size: u32,
    pub ctrl: u32,
}

impl Trb {
    pub const fn new(addr: u64, size: u32, ty: TrbType, flags: TrbCtrl) -> Self {
        Self {
            bpl: addr as u32,
            bph: (addr >> 32) as u32,
            size: size & TRB_BUFSIZ_MASK,
            ctrl: ty.ctrl_bits() | flags.bits(),
        }
    }

    /// Link TRB pointing back at `ring_addr`
    pub const fn link(ring_addr: u64) -> Self {
        Self::new(ring_addr, 0, TrbType::Link, TrbCtrl::HWO)
    }

    pub fn addr(&self) -> u64 {
        ((self.bph as u64) << 32) | self.bpl as u64
    }

    pub fn flags(&self) -> TrbCtrl {
        TrbCtrl::from_bits_truncate(self.ctrl)
    }

    pub fn trb_type(&self) -> Option<TrbType> {
        TrbType::from_bits((self.ctrl & TRBCTL_MASK) >> TRBCTL_POS)
    }

    pub fn is_hw_owned(&self) -> bool {
        self.ctrl & TrbCtrl::HWO.bits() != 0
    }

    /// Bytes the core did not transfer
    pub fn remaining(&self) -> u32 {
        self.size & TRB_BUFSIZ_MASK
    }

    /// Completion status written back by the core
    pub fn trb_status(&self) -> u32 {
        self.size >> TRB_TRBSTS_POS
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trb_is_16_bytes() {
        assert_eq!(core::mem::size_of::<Trb>(), 16);
        assert_eq!(core::mem::align_of::<Trb>(), 16);
    }

    #[test]
    fn test_encoding() {
        let trb = Trb::new(
            0x1_2345_6780,
            512,
            TrbType::Normal,
            TrbCtrl::HWO | TrbCtrl::CHN | TrbCtrl::IOC,
        );
        assert_eq!(trb.bpl, 0x2345_6780);
        assert_eq!(trb.bph, 0x1);
        assert_eq!(trb.ctrl, 0x1 | 0x4 | (1 << 4) | (1 << 11));
        assert_eq!(trb.trb_type(), Some(TrbType::Normal));
        assert!(trb.is_hw_owned());
        assert_eq!(trb.addr(), 0x1_2345_6780);
    }

    #[test]
    fn test_link_and_status() {
        let link = Trb::link(0x8000);
        assert_eq!(link.trb_type(), Some(TrbType::Link));
        assert!(link.flags().contains(TrbCtrl::HWO));

        let mut done = Trb::new(0, 64, TrbType::NormalZlp, TrbCtrl::empty());
        done.size = (0x2 << 28) | 10;
        assert_eq!(done.remaining(), 10);
        assert_eq!(done.trb_status(), 2);
        assert_eq!(done.trb_type(), Some(TrbType::NormalZlp));
    }
}
