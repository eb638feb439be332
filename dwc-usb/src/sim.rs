//! Simulated hardware for unit tests
//!
//! [`SimRegs`] is a sparse register file. Writes are stored and then offered
//! to the installed hooks, which model the side effects a real core applies
//! (self-clearing command bits, write-1-to-clear status, reset completion).
//! [`SimClock`] is a monotonic clock that only advances when the driver
//! delays or sleeps, so timeouts are deterministic.

use alloc::{boxed::Box, collections::BTreeMap, vec::Vec};
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::{mmio::RegisterBlock, timer::Clock};

/// Register contents keyed by byte offset
pub type RegMap = BTreeMap<usize, u32>;

/// Side effect applied after a register write: `(regs, offset, written, previous)`
pub type WriteHook = Box<dyn Fn(&mut RegMap, usize, u32, u32) + Send + Sync>;

#[derive(Default)]
pub struct SimRegs {
    regs: Mutex<RegMap>,
    hooks: Mutex<Vec<WriteHook>>,
    log: Mutex<Vec<(usize, u32)>>,
}

impl SimRegs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a write side effect.
    pub fn on_write<F>(&self, hook: F)
    where
        F: Fn(&mut RegMap, usize, u32, u32) + Send + Sync + 'static,
    {
        self.hooks.lock().push(Box::new(hook));
    }

    /// Set a register as the hardware would, bypassing hooks and the log.
    pub fn poke(&self, offset: usize, value: u32) {
        self.regs.lock().insert(offset, value);
    }

    /// OR bits into a register as the hardware would.
    pub fn poke_bits(&self, offset: usize, bits: u32) {
        let mut regs = self.regs.lock();
        let value = regs.get(&offset).copied().unwrap_or(0);
        regs.insert(offset, value | bits);
    }

    pub fn peek(&self, offset: usize) -> u32 {
        self.regs.lock().get(&offset).copied().unwrap_or(0)
    }

    /// Every value the driver wrote to `offset`, oldest first
    pub fn writes_to(&self, offset: usize) -> Vec<u32> {
        self.log
            .lock()
            .iter()
            .filter(|(off, _)| *off == offset)
            .map(|(_, v)| *v)
            .collect()
    }

    pub fn clear_log(&self) {
        self.log.lock().clear();
    }
}

impl RegisterBlock for SimRegs {
    fn read32(&self, offset: usize) -> u32 {
        self.peek(offset)
    }

    fn write32(&self, offset: usize, value: u32) {
        self.log.lock().push((offset, value));
        let mut regs = self.regs.lock();
        let previous = regs.insert(offset, value).unwrap_or(0);
        for hook in self.hooks.lock().iter() {
            hook(&mut regs, offset, value, previous);
        }
    }
}

/// Deterministic monotonic clock
#[derive(Debug, Default)]
pub struct SimClock {
    now: AtomicU64,
}

impl SimClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_us(&self, us: u64) {
        self.now.fetch_add(us, Ordering::SeqCst);
    }
}

impl Clock for SimClock {
    fn now_us(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn delay_us(&self, us: u32) {
        self.advance_us(us as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hook_sees_write_and_previous() {
        let regs = SimRegs::new();
        regs.poke(0x10, 0xf0);
        regs.on_write(|map, off, value, previous| {
            if off == 0x10 {
                // Self-clearing bit 0, sticky upper nibble
                map.insert(off, (value & !1) | (previous & 0xf0));
            }
        });
        regs.write32(0x10, 0x01);
        assert_eq!(regs.read32(0x10), 0xf0);
        assert_eq!(regs.writes_to(0x10), [0x01]);
    }

    #[test]
    fn test_clock_advances_on_delay() {
        let clock = SimClock::new();
        clock.delay_us(5);
        clock.sleep_ms(2);
        assert_eq!(clock.now_us(), 2005);
    }
}
