//! Host FIFO RAM allocation
//!
//! The shared FIFO RAM (`GHWCFG3.DFIFODEPTH` words) is split, from the
//! bottom up, into the RX FIFO, the non-periodic TX FIFO and the periodic TX
//! FIFO. The top `numchannels` words hold the per-channel DMA state.
//!
//! - RX: two largest packets plus two status words each, and one word per
//!   channel for NAK/NYET handling
//! - non-periodic TX: two largest bulk/control packets
//! - periodic TX: whatever remains

use super::regs::*;
use crate::{
    drivers::usb::ch9::UsbSpeed,
    error::{UsbError, UsbResult},
    mmio::RegisterBlock,
    timer::{poll_until, Clock},
};

/// Largest bulk/control packet, in bytes
pub fn largest_async_packet(speed: UsbSpeed) -> u32 {
    match speed {
        UsbSpeed::Low => 8,
        UsbSpeed::Full => 64,
        UsbSpeed::High | UsbSpeed::Super => 512,
    }
}

/// Largest interrupt/isochronous packet, in bytes
pub fn largest_periodic_packet(speed: UsbSpeed) -> u32 {
    match speed {
        UsbSpeed::Low => 8,
        UsbSpeed::Full => 1023,
        UsbSpeed::High | UsbSpeed::Super => 1024,
    }
}

/// Periodic packet size the RX FIFO is provisioned for. Full-speed
/// isochronous packets beyond this are not supported.
const RX_PERIODIC_PACKET: u32 = 256;

/// FIFO sizes in 32-bit words
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FifoConfig {
    /// First word of the channel DMA state area
    pub top: u32,
    pub rxfsiz: u32,
    pub nptxfsiz: u32,
    pub ptxfsiz: u32,
}

impl FifoConfig {
    /// Sizing for buffer DMA with full-speed packet sizes.
    pub fn compute(fifodepth: u32, numchannels: u32) -> UsbResult<Self> {
        Self::compute_with(
            fifodepth,
            numchannels,
            largest_async_packet(UsbSpeed::Full),
            RX_PERIODIC_PACKET,
        )
    }

    /// Sizing for the given largest non-periodic and periodic packets.
    pub fn compute_with(
        fifodepth: u32,
        numchannels: u32,
        nptx_largest_bytes: u32,
        rx_largest_bytes: u32,
    ) -> UsbResult<Self> {
        let top = fifodepth.checked_sub(numchannels).ok_or(UsbError::ResourceExhausted {
            resource: "FIFO RAM",
        })?;
        let nptxfsiz = 2 * (nptx_largest_bytes / 4);
        let rxfsiz = 2 * (rx_largest_bytes / 4 + 2) + numchannels;
        let ptxfsiz = top
            .checked_sub(nptxfsiz + rxfsiz)
            .filter(|&p| p > 0)
            .ok_or(UsbError::ResourceExhausted {
                resource: "FIFO RAM",
            })?;

        log::debug!(
            "[DWC2] FIFO top={} nptx={} rx={} ptx={} (bytes)",
            top * 4,
            nptxfsiz * 4,
            rxfsiz * 4,
            ptxfsiz * 4
        );
        Ok(Self {
            top,
            rxfsiz,
            nptxfsiz,
            ptxfsiz,
        })
    }

    /// Program the FIFO layout and flush every FIFO.
    pub fn apply<R, C>(&self, regs: &R, clock: &C, timeout_us: u64) -> UsbResult<()>
    where
        R: RegisterBlock + ?Sized,
        C: Clock + ?Sized,
    {
        let mut avail = self.top;
        regs.write32(GDFIFOCFG, (avail << GDFIFOCFG_EPINFOBASEADDR_POS) | avail);

        avail -= self.rxfsiz;
        regs.write32(GRXFSIZ, self.rxfsiz);

        avail -= self.nptxfsiz;
        regs.write32(GNPTXFSIZ, (self.nptxfsiz << FIFOSIZ_DEPTH_POS) | avail);

        avail -= self.ptxfsiz;
        regs.write32(HPTXFSIZ, (self.ptxfsiz << FIFOSIZ_DEPTH_POS) | avail);

        flush_tx_fifo(regs, clock, GRSTCTL_TXFNUM_ALL, timeout_us)?;
        flush_rx_fifo(regs, clock, timeout_us)
    }
}

pub fn flush_tx_fifo<R, C>(regs: &R, clock: &C, fnum: u32, timeout_us: u64) -> UsbResult<()>
where
    R: RegisterBlock + ?Sized,
    C: Clock + ?Sized,
{
    let grstctl = (fnum << GRSTCTL_TXFNUM_POS) & GRSTCTL_TXFNUM_MASK;
    regs.write32(GRSTCTL, grstctl | GRSTCTL_TXFFLSH);
    poll_until(clock, timeout_us, "TX FIFO flush", || {
        regs.read32(GRSTCTL) & GRSTCTL_TXFFLSH == 0
    })
}

pub fn flush_rx_fifo<R, C>(regs: &R, clock: &C, timeout_us: u64) -> UsbResult<()>
where
    R: RegisterBlock + ?Sized,
    C: Clock + ?Sized,
{
    regs.write32(GRSTCTL, GRSTCTL_RXFFLSH);
    poll_until(clock, timeout_us, "RX FIFO flush", || {
        regs.read32(GRSTCTL) & GRSTCTL_RXFFLSH == 0
    })
}
