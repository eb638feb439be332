//! Per-endpoint state

use alloc::{collections::VecDeque, vec::Vec};

use super::{
    regs::phys_ep,
    ring::TrbRing,
    trb::{TrbCtrl, TrbType},
};
use crate::{
    drivers::usb::{buf::UsbBuf, ch9::EndpointType},
    error::{UsbError, UsbResult},
};

/// Software state of one physical endpoint
pub struct EpData {
    /// USB endpoint address
    pub addr: u8,
    /// Physical endpoint number, `(index << 1) | direction`
    pub phys: u8,
    pub ep_type: EndpointType,
    pub mps: u16,
    pub interval: u8,
    pub ring: TrbRing,
    /// Buffers accepted from the stack but not yet on the ring
    pub pending: VecDeque<UsbBuf>,
    /// Resource index of the running transfer
    pub xferrscidx: u8,
    /// A transfer is running, so new TRBs need UpdateTransfer
    pub started: bool,
    pub enabled: bool,
    pub halted: bool,
    /// Bytes queued since the last terminating TRB
    pub total: usize,
}

impl EpData {
    pub fn new(addr: u8, trb_num: usize) -> Self {
        Self {
            addr,
            phys: phys_ep(addr),
            ep_type: EndpointType::Control,
            mps: 0,
            interval: 0,
            ring: TrbRing::new(trb_num),
            pending: VecDeque::new(),
            xferrscidx: 0,
            started: false,
            enabled: false,
            halted: false,
            total: 0,
        }
    }

    pub fn is_in(&self) -> bool {
        self.phys & 1 != 0
    }

    /// TRB type and flags for the next bulk, interrupt or isochronous
    /// buffer, updating the running total.
    ///
    /// An explicit ZLP request terminates the transfer. Otherwise a TRB that
    /// leaves the running total on a max-packet boundary is chained, since
    /// only a short packet ends a transfer on the bus.
    pub fn bulk_trb(&mut self, buf: &UsbBuf) -> (TrbType, TrbCtrl) {
        let mut flags = TrbCtrl::IOC;
        if !self.is_in() {
            flags |= TrbCtrl::ISP_IMI;
        }

        if buf.has_zlp() {
            self.total = 0;
            return (TrbType::NormalZlp, flags);
        }

        let len = if self.is_in() {
            buf.len()
        } else {
            buf.tailroom()
        };
        self.total += len;

        let mps = self.mps.max(1) as usize;
        if self.total % mps == 0 && len != 0 {
            flags |= TrbCtrl::CHN;
        } else {
            self.total = 0;
        }
        (TrbType::Normal, flags)
    }

    /// Push a bulk buffer onto the ring. The buffer is handed back when the
    /// ring is full.
    pub fn push_bulk(&mut self, buf: UsbBuf) -> Result<usize, UsbBuf> {
        if self.ring.is_full() {
            return Err(buf);
        }
        let (ty, flags) = self.bulk_trb(&buf);
        self.ring.try_push(buf, ty, flags)
    }

    /// Take every buffer the endpoint owns, ring first, then pending.
    /// The transfer must already be ended.
    pub fn reclaim_all(&mut self) -> Vec<UsbBuf> {
        let mut bufs = self.ring.drain();
        bufs.extend(self.pending.drain(..));
        self.total = 0;
        self.started = false;
        bufs
    }

    pub fn reset(&mut self) {
        self.enabled = false;
        self.halted = false;
        self.started = false;
        self.xferrscidx = 0;
        self.total = 0;
    }

    /// Check that the endpoint can take buffers.
    pub fn ensure_enabled(&self) -> UsbResult<()> {
        if self.enabled {
            Ok(())
        } else {
            Err(UsbError::InvalidState {
                expected: "endpoint enabled",
                actual: "endpoint disabled",
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::usb::buf::BufFlags;

    fn bulk_in(mps: u16) -> EpData {
        let mut ep = EpData::new(0x81, 8);
        ep.ep_type = EndpointType::Bulk;
        ep.mps = mps;
        ep.enabled = true;
        ep
    }

    #[test]
    fn test_chaining_on_mps_boundary() {
        let mut ep = bulk_in(64);
        let mut flags = alloc::vec::Vec::new();
        for len in [64usize, 64, 10] {
            let (ty, f) = ep.bulk_trb(&UsbBuf::from_slice(0x81, &alloc::vec![0; len]));
            assert_eq!(ty, TrbType::Normal);
            flags.push(f.contains(TrbCtrl::CHN));
        }
        assert_eq!(flags, [true, true, false]);
        assert_eq!(ep.total, 0);
    }

    #[test]
    fn test_zlp_terminates_and_resets_total() {
        let mut ep = bulk_in(64);
        ep.bulk_trb(&UsbBuf::from_slice(0x81, &[0; 128]));
        assert_eq!(ep.total, 128);

        let zlp = UsbBuf::with_capacity(0x81, 0).with_flags(BufFlags::ZLP);
        let (ty, flags) = ep.bulk_trb(&zlp);
        assert_eq!(ty, TrbType::NormalZlp);
        assert!(!flags.contains(TrbCtrl::CHN));
        assert_eq!(ep.total, 0);
    }

    #[test]
    fn test_out_counts_capacity() {
        let mut ep = EpData::new(0x02, 8);
        ep.mps = 64;
        let (_, flags) = ep.bulk_trb(&UsbBuf::with_capacity(0x02, 128));
        assert!(flags.contains(TrbCtrl::CHN | TrbCtrl::ISP_IMI));
        let (_, flags) = ep.bulk_trb(&UsbBuf::with_capacity(0x02, 32));
        assert!(!flags.contains(TrbCtrl::CHN));
    }

    #[test]
    fn test_push_bulk_returns_buffer_when_full() {
        let mut ep = EpData::new(0x81, 2);
        ep.mps = 64;
        assert!(ep.push_bulk(UsbBuf::from_slice(0x81, &[1; 10])).is_ok());
        let back = ep.push_bulk(UsbBuf::from_slice(0x81, &[2; 10])).unwrap_err();
        assert_eq!(back.data(), &[2; 10]);
        assert_eq!(ep.reclaim_all().len(), 1);
        assert!(ep.ring.is_empty());
    }
}
