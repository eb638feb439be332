//! Event buffer and event decoding
//!
//! The core writes 32-bit events into a circular buffer in system memory and
//! counts the pending bytes in GEVNTCOUNT. Bit 0 tells device events from
//! endpoint events.

use alloc::{vec, vec::Vec};
use core::ptr;

/// Endpoint event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpEventKind {
    XferComplete,
    XferInProgress,
    XferNotReady,
    RxTxFifo,
    Stream,
    EpCmdComplete,
    Other(u8),
}

impl EpEventKind {
    fn from_bits(bits: u8) -> Self {
        match bits {
            1 => Self::XferComplete,
            2 => Self::XferInProgress,
            3 => Self::XferNotReady,
            4 => Self::RxTxFifo,
            6 => Self::Stream,
            7 => Self::EpCmdComplete,
            other => Self::Other(other),
        }
    }
}

/// Device event types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DevEventKind {
    Disconnect,
    Reset,
    ConnectDone,
    LinkStatusChange,
    Wakeup,
    HibernationRequest,
    Suspend,
    Sof,
    ErraticError,
    CmdComplete,
    Overflow,
    Other(u8),
}

impl DevEventKind {
    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => Self::Disconnect,
            1 => Self::Reset,
            2 => Self::ConnectDone,
            3 => Self::LinkStatusChange,
            4 => Self::Wakeup,
            5 => Self::HibernationRequest,
            6 => Self::Suspend,
            7 => Self::Sof,
            9 => Self::ErraticError,
            10 => Self::CmdComplete,
            11 => Self::Overflow,
            other => Self::Other(other),
        }
    }
}

// Endpoint event status bits for transfer events
pub const DEPEVT_STATUS_BUSERR: u8 = 1 << 0;
pub const DEPEVT_STATUS_SHORT: u8 = 1 << 1;
pub const DEPEVT_STATUS_IOC: u8 = 1 << 2;
pub const DEPEVT_STATUS_LST: u8 = 1 << 3;

/// USB link states reported in the link status change event
pub mod link_state {
    pub const U0: u8 = 0x0;
    pub const U1: u8 = 0x1;
    pub const U2: u8 = 0x2;
    pub const U3: u8 = 0x3;
    pub const SS_DIS: u8 = 0x4;
    pub const RX_DET: u8 = 0x5;
    pub const RESUME: u8 = 0xf;
}

/// A decoded event buffer entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dwc3Event {
    Endpoint {
        /// Physical endpoint number
        phys: u8,
        kind: EpEventKind,
        status: u8,
        param: u16,
    },
    Device {
        kind: DevEventKind,
        info: u16,
    },
}

/// Decode one raw event word.
pub fn decode_event(raw: u32) -> Dwc3Event {
    if raw & 1 == 0 {
        Dwc3Event::Endpoint {
            phys: ((raw >> 1) & 0x1f) as u8,
            kind: EpEventKind::from_bits(((raw >> 6) & 0xf) as u8),
            status: ((raw >> 12) & 0xf) as u8,
            param: (raw >> 16) as u16,
        }
    } else {
        Dwc3Event::Device {
            kind: DevEventKind::from_bits(((raw >> 8) & 0x1f) as u8),
            info: ((raw >> 16) & 0x1ff) as u16,
        }
    }
}

/// DMA-visible circular event buffer
pub struct EventBuffer {
    mem: Vec<u32>,
}

impl EventBuffer {
    pub fn new(entries: usize) -> Self {
        Self {
            mem: vec![0; entries.max(1)],
        }
    }

    pub fn entries(&self) -> usize {
        self.mem.len()
    }

    /// Size in bytes, as programmed into GEVNTSIZ
    pub fn size_bytes(&self) -> usize {
        self.mem.len() * 4
    }

    pub fn dma_addr(&self) -> u64 {
        self.mem.as_ptr() as u64
    }

    /// Event word at `index`
    pub fn read(&self, index: usize) -> u32 {
        let index = index % self.mem.len();
        // SAFETY: index is reduced into bounds. The core writes the buffer
        // by DMA, so the word is read volatile.
        unsafe { ptr::read_volatile(&self.mem[index]) }
    }

    /// Store an event as the core's DMA engine would.
    #[cfg(test)]
    pub fn hw_write(&mut self, index: usize, raw: u32) {
        let len = self.mem.len();
        self.mem[index % len] = raw;
    }
}
