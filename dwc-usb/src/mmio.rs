//! Register access
//!
//! Both drivers talk to their core through [`RegisterBlock`], a 32-bit
//! offset-addressed register window. [`Mmio`] is the memory-mapped
//! implementation used on real silicon.

use alloc::sync::Arc;

/// A window of 32-bit controller registers addressed by byte offset.
pub trait RegisterBlock: Send + Sync {
    /// Read the register at `offset`
    fn read32(&self, offset: usize) -> u32;

    /// Write `value` to the register at `offset`
    fn write32(&self, offset: usize, value: u32);

    /// Read-modify-write setting `bits`
    fn set_bits(&self, offset: usize, bits: u32) {
        let value = self.read32(offset);
        self.write32(offset, value | bits);
    }

    /// Read-modify-write clearing `bits`
    fn clear_bits(&self, offset: usize, bits: u32) {
        let value = self.read32(offset);
        self.write32(offset, value & !bits);
    }

    /// Read-modify-write replacing the bits selected by `mask`
    fn modify(&self, offset: usize, mask: u32, value: u32) {
        let old = self.read32(offset);
        self.write32(offset, (old & !mask) | (value & mask));
    }
}

/// A shared register window, e.g. one mapping handed to several drivers
impl<T: RegisterBlock + ?Sized> RegisterBlock for Arc<T> {
    fn read32(&self, offset: usize) -> u32 {
        (**self).read32(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        (**self).write32(offset, value)
    }
}

/// Memory-mapped register window
#[derive(Debug)]
pub struct Mmio {
    base: usize,
}

impl Mmio {
    /// Create a register window at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be the virtual address of the controller's register block,
    /// mapped uncached for the lifetime of the returned value, and no other
    /// code may treat that range as ordinary memory.
    pub const unsafe fn new(base: usize) -> Self {
        Self { base }
    }

    pub fn base(&self) -> usize {
        self.base
    }
}

impl RegisterBlock for Mmio {
    fn read32(&self, offset: usize) -> u32 {
        let addr = self.base + offset;
        // SAFETY: Mmio::new requires base to map the controller's register
        // block. read_volatile keeps the compiler from eliding or merging the
        // access.
        unsafe { core::ptr::read_volatile(addr as *const u32) }
    }

    fn write32(&self, offset: usize, value: u32) {
        let addr = self.base + offset;
        // SAFETY: Same invariants as read32; write_volatile orders the store
        // with respect to other register accesses.
        unsafe { core::ptr::write_volatile(addr as *mut u32, value) }
    }
}

/// Extract a register field.
#[inline]
pub const fn field_get(value: u32, mask: u32, pos: u32) -> u32 {
    (value & mask) >> pos
}

/// Place `value` into a register field.
#[inline]
pub const fn field_prep(value: u32, mask: u32, pos: u32) -> u32 {
    (value << pos) & mask
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_helpers() {
        assert_eq!(field_get(0x0000_3c00, 0x0000_3c00, 10), 0xf);
        assert_eq!(field_prep(5, 0x3f8, 3), 5 << 3);
        assert_eq!(field_prep(0xff, 0x3f8, 3), 0x3f8);
    }

    #[test]
    fn test_mmio_roundtrip_on_ram() {
        let mut backing = [0u32; 4];
        // SAFETY: backing outlives mmio and is only accessed through it below.
        let mmio = unsafe { Mmio::new(backing.as_mut_ptr() as usize) };
        mmio.write32(4, 0x1234);
        mmio.set_bits(4, 0x1_0000);
        mmio.clear_bits(4, 0x0004);
        assert_eq!(mmio.read32(4), 0x1_1230);
        mmio.modify(8, 0xff00, 0xabcd);
        assert_eq!(mmio.read32(8), 0xab00);
    }
}
