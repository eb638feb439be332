//! Transfer buffers
//!
//! A [`UsbBuf`] is the unit of work exchanged between the USB stack and a
//! controller driver. Ownership moves into the driver on enqueue, to the
//! hardware while a descriptor points at it, and back to the stack through
//! the completion callback.

use alloc::{vec, vec::Vec};

use bitflags::bitflags;

use super::ch9::ep_addr;

bitflags! {
    /// Per-buffer transfer markers set by the stack
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BufFlags: u8 {
        /// Terminate the transfer with an explicit zero-length packet
        const ZLP = 1 << 0;
        /// Control SETUP stage buffer
        const SETUP = 1 << 1;
        /// Control DATA stage buffer
        const DATA = 1 << 2;
        /// Control STATUS stage buffer
        const STATUS = 1 << 3;
    }
}

/// A DMA-capable transfer buffer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbBuf {
    /// Endpoint address the buffer is queued on
    ep: u8,
    /// Backing storage, its length is the buffer capacity
    data: Vec<u8>,
    /// Bytes used
    len: usize,
    flags: BufFlags,
}

impl UsbBuf {
    /// Empty buffer able to receive `size` bytes
    pub fn with_capacity(ep: u8, size: usize) -> Self {
        Self {
            ep,
            data: vec![0; size],
            len: 0,
            flags: BufFlags::empty(),
        }
    }

    /// Buffer holding a copy of `bytes`, ready to be sent
    pub fn from_slice(ep: u8, bytes: &[u8]) -> Self {
        Self {
            ep,
            data: bytes.to_vec(),
            len: bytes.len(),
            flags: BufFlags::empty(),
        }
    }

    pub fn with_flags(mut self, flags: BufFlags) -> Self {
        self.flags |= flags;
        self
    }

    pub fn ep(&self) -> u8 {
        self.ep
    }

    pub fn is_in(&self) -> bool {
        ep_addr::is_in(self.ep)
    }

    /// Bytes used
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Capacity
    pub fn size(&self) -> usize {
        self.data.len()
    }

    /// Unused capacity after `len`
    pub fn tailroom(&self) -> usize {
        self.size() - self.len
    }

    pub fn data(&self) -> &[u8] {
        &self.data[..self.len]
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[..self.len]
    }

    /// Claim `n` more bytes at the tail, as after a DMA write into it.
    pub fn add(&mut self, n: usize) {
        self.len = (self.len + n).min(self.size());
    }

    /// Give back `n` bytes at the tail.
    pub fn remove(&mut self, n: usize) {
        self.len = self.len.saturating_sub(n);
    }

    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(self.size());
    }

    pub fn flags(&self) -> BufFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: BufFlags) {
        self.flags = flags;
    }

    pub fn has_zlp(&self) -> bool {
        self.flags.contains(BufFlags::ZLP)
    }

    pub fn is_setup(&self) -> bool {
        self.flags.contains(BufFlags::SETUP)
    }

    pub fn is_data(&self) -> bool {
        self.flags.contains(BufFlags::DATA)
    }

    pub fn is_status(&self) -> bool {
        self.flags.contains(BufFlags::STATUS)
    }

    /// Bus address of the first byte
    pub fn dma_addr(&self) -> u64 {
        self.data.as_ptr() as u64
    }

    /// Bus address of the first unused byte
    pub fn tail_dma_addr(&self) -> u64 {
        self.dma_addr() + self.len as u64
    }

    /// Write `bytes` into the unused tail, as the DMA engine would.
    pub fn write_tail(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.tailroom());
        let start = self.len;
        self.data[start..start + n].copy_from_slice(&bytes[..n]);
        self.len += n;
        n
    }

    /// Store `bytes` after the used part without claiming them, the way a
    /// DMA engine fills a receive buffer.
    #[cfg(test)]
    pub fn dma_fill(&mut self, bytes: &[u8]) -> usize {
        let n = bytes.len().min(self.tailroom());
        let start = self.len;
        self.data[start..start + n].copy_from_slice(&bytes[..n]);
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_and_len() {
        let mut buf = UsbBuf::with_capacity(0x01, 64);
        assert_eq!(buf.size(), 64);
        assert!(buf.is_empty());
        buf.add(10);
        assert_eq!(buf.len(), 10);
        assert_eq!(buf.tailroom(), 54);
        buf.add(100);
        assert_eq!(buf.len(), 64);
        buf.remove(4);
        assert_eq!(buf.len(), 60);
    }

    #[test]
    fn test_from_slice_is_full() {
        let buf = UsbBuf::from_slice(0x81, &[1, 2, 3]).with_flags(BufFlags::ZLP);
        assert!(buf.is_in());
        assert_eq!(buf.data(), &[1, 2, 3]);
        assert!(buf.has_zlp());
        assert!(!buf.is_status());
    }

    #[test]
    fn test_write_tail_respects_capacity() {
        let mut buf = UsbBuf::with_capacity(0x02, 4);
        assert_eq!(buf.write_tail(&[9, 8, 7, 6, 5]), 4);
        assert_eq!(buf.data(), &[9, 8, 7, 6]);
        assert_eq!(buf.tail_dma_addr(), buf.dma_addr() + 4);
    }
}
