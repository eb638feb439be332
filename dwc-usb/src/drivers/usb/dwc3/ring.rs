//! Per-endpoint TRB ring
//!
//! `trb_num` TRBs in one DMA-visible block. The last TRB is a Link TRB
//! pointing back at the first one, so `trb_num - 1` slots carry data. Every
//! data slot has a matching buffer slot; a buffer is owned by the ring from
//! [`TrbRing::push`] until [`TrbRing::pop`] hands it back.
//!
//! ```text
//!  tail              head
//!   v                 v
//! [ T0 ][ T1 ][ T2 ][    ][    ][    ][    ][LINK]
//!   HWO   HWO   HWO
//! ```
//!
//! `full` disambiguates `head == tail`: it is set by the push that makes
//! them meet and cleared by any pop.

use alloc::{boxed::Box, vec, vec::Vec};
use core::{
    ptr,
    sync::atomic::{fence, Ordering},
};

use super::trb::{Trb, TrbCtrl, TrbType};
use crate::{
    drivers::usb::buf::UsbBuf,
    error::{UsbError, UsbResult},
};

pub struct TrbRing {
    trbs: Box<[Trb]>,
    bufs: Vec<Option<UsbBuf>>,
    head: usize,
    tail: usize,
    full: bool,
}

impl TrbRing {
    /// Ring of `trb_num` TRBs, the last of them the Link TRB.
    pub fn new(trb_num: usize) -> Self {
        debug_assert!(trb_num >= 2);
        let slots = trb_num.saturating_sub(1).max(1);
        let mut ring = Self {
            trbs: vec![Trb::default(); slots + 1].into_boxed_slice(),
            bufs: (0..slots).map(|_| None).collect(),
            head: 0,
            tail: 0,
            full: false,
        };
        let link = Trb::link(ring.dma_addr());
        ring.write_trb(slots, link);
        ring
    }

    /// Usable slots, the Link TRB excluded
    pub fn capacity(&self) -> usize {
        self.bufs.len()
    }

    pub fn is_full(&self) -> bool {
        self.full
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail && !self.full
    }

    /// Buffers currently owned by the ring
    pub fn len(&self) -> usize {
        if self.full {
            self.capacity()
        } else {
            (self.head + self.capacity() - self.tail) % self.capacity()
        }
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn tail(&self) -> usize {
        self.tail
    }

    /// Bus address of the first TRB
    pub fn dma_addr(&self) -> u64 {
        self.trbs.as_ptr() as u64
    }

    /// Bus address of the TRB in `slot`
    pub fn trb_dma_addr(&self, slot: usize) -> u64 {
        self.dma_addr() + (slot * core::mem::size_of::<Trb>()) as u64
    }

    /// Snapshot of the TRB in `slot`, as last written by either side.
    pub fn trb(&self, slot: usize) -> Trb {
        // SAFETY: slot indexes the boxed TRB block owned by self. The core
        // may write the TRB concurrently, so the read must not be cached.
        unsafe { ptr::read_volatile(&self.trbs[slot]) }
    }

    fn write_trb(&mut self, slot: usize, trb: Trb) {
        // SAFETY: slot indexes the boxed TRB block owned by self. Software
        // only writes TRBs it owns (HWO clear), so the core is not reading.
        unsafe { ptr::write_volatile(&mut self.trbs[slot], trb) }
    }

    /// Queue `buf` at the head and give its TRB to the hardware.
    ///
    /// IN buffers describe their used bytes, OUT buffers their free tail.
    /// Returns the slot the TRB landed in.
    pub fn push(&mut self, buf: UsbBuf, ty: TrbType, flags: TrbCtrl) -> UsbResult<usize> {
        self.try_push(buf, ty, flags)
            .map_err(|buf| UsbError::RingFull { endpoint: buf.ep() })
    }

    /// Like [`TrbRing::push`], but a full ring hands the buffer back.
    pub fn try_push(&mut self, buf: UsbBuf, ty: TrbType, flags: TrbCtrl) -> Result<usize, UsbBuf> {
        if self.full {
            return Err(buf);
        }

        let (addr, size) = if buf.is_in() {
            (buf.dma_addr(), buf.len())
        } else {
            (buf.tail_dma_addr(), buf.tailroom())
        };

        let slot = self.head;
        let flags = flags - TrbCtrl::HWO;
        self.write_trb(slot, Trb::new(addr, size as u32, ty, flags));
        // Descriptor contents must be visible before ownership moves
        fence(Ordering::Release);
        self.write_trb(slot, Trb::new(addr, size as u32, ty, flags | TrbCtrl::HWO));

        self.bufs[slot] = Some(buf);
        self.head = (self.head + 1) % self.capacity();
        self.full = self.head == self.tail;
        Ok(slot)
    }

    /// TRB at the tail if the hardware has handed it back
    pub fn completed_tail(&self) -> Option<Trb> {
        if self.is_empty() {
            return None;
        }
        let trb = self.trb(self.tail);
        (!trb.is_hw_owned()).then_some(trb)
    }

    /// Take the buffer at the tail together with its final TRB contents.
    pub fn pop(&mut self) -> Option<(UsbBuf, Trb)> {
        let slot = self.tail;
        let Some(buf) = self.bufs[slot].take() else {
            log::error!("[DWC3] No buffer in ring slot {}", slot);
            return None;
        };
        fence(Ordering::Acquire);
        let trb = self.trb(slot);
        self.write_trb(slot, Trb::default());
        self.tail = (self.tail + 1) % self.capacity();
        self.full = false;
        Some((buf, trb))
    }

    /// Reclaim every buffer, oldest first. The transfer must be ended.
    pub fn drain(&mut self) -> Vec<UsbBuf> {
        let mut out = Vec::with_capacity(self.len());
        while !self.is_empty() {
            match self.pop() {
                Some((buf, _)) => out.push(buf),
                None => break,
            }
        }
        self.head = 0;
        self.tail = 0;
        self.full = false;
        out
    }

    /// Complete the oldest hardware-owned TRB the way the core does.
    #[cfg(test)]
    pub fn hw_complete(&mut self, remaining: u32) -> bool {
        for i in 0..self.len() {
            let slot = (self.tail + i) % self.capacity();
            let mut trb = self.trb(slot);
            if trb.is_hw_owned() {
                trb.ctrl &= !TrbCtrl::HWO.bits();
                trb.size = remaining;
                self.write_trb(slot, trb);
                return true;
            }
        }
        false
    }

    /// Complete the oldest hardware-owned OUT TRB after "receiving" `data`
    /// into its buffer.
    #[cfg(test)]
    pub fn hw_receive(&mut self, data: &[u8]) -> bool {
        for i in 0..self.len() {
            let slot = (self.tail + i) % self.capacity();
            let trb = self.trb(slot);
            if trb.is_hw_owned() {
                let n = match self.bufs[slot].as_mut() {
                    Some(buf) => buf.dma_fill(data),
                    None => return false,
                };
                return self.hw_complete(trb.remaining() - n as u32);
            }
        }
        false
    }
}
