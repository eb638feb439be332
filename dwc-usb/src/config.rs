//! Build-time style configuration for both controllers
//!
//! The values mirror the Kconfig knobs a firmware image would normally fix at
//! build time. They are plain data handed to the controller constructors, so
//! one image can drive several controller instances with different sizing.

use crate::{
    drivers::usb::ch9::UsbSpeed,
    error::{UsbError, UsbResult},
};

/// Configuration of one DWC3 device controller instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dwc3Config {
    /// TRBs per endpoint ring, including the trailing Link TRB
    pub trb_num: usize,
    /// Entries (32-bit words) in the event buffer
    pub events_num: usize,
    /// Delay before the event worker polls an empty event buffer again
    pub event_poll_delay_ms: u32,
    /// Unmask the event-buffer interrupt instead of polling
    pub use_irq: bool,
    /// Highest speed the device advertises
    pub max_speed: UsbSpeed,
    /// Number of IN endpoints, EP0 included
    pub num_in_eps: u8,
    /// Number of OUT endpoints, EP0 included
    pub num_out_eps: u8,
    /// Bound on DEPCMD/DGCMD completion polling
    pub cmd_timeout_us: u64,
    /// Bound on soft reset and run/stop polling
    pub reset_timeout_us: u64,
    /// Depth of each TX FIFO in 8-byte words
    pub tx_fifo_words: u16,
    /// Depth of the RX FIFO in 8-byte words
    pub rx_fifo_words: u16,
}

impl Default for Dwc3Config {
    fn default() -> Self {
        Self {
            trb_num: 8,
            events_num: 64,
            event_poll_delay_ms: 1,
            use_irq: false,
            max_speed: UsbSpeed::High,
            num_in_eps: 4,
            num_out_eps: 4,
            cmd_timeout_us: 10_000,
            reset_timeout_us: 10_000,
            tx_fifo_words: 256,
            rx_fifo_words: 512,
        }
    }
}

impl Dwc3Config {
    pub fn validate(&self) -> UsbResult<()> {
        if self.trb_num < 2 {
            return Err(UsbError::InvalidArgument {
                name: "trb_num",
                value: "ring needs at least one TRB besides the Link TRB",
            });
        }
        if self.events_num == 0 {
            return Err(UsbError::InvalidArgument {
                name: "events_num",
                value: "event buffer cannot be empty",
            });
        }
        let valid_eps = 1..=16;
        if !valid_eps.contains(&self.num_in_eps) || !valid_eps.contains(&self.num_out_eps) {
            return Err(UsbError::InvalidArgument {
                name: "num_eps",
                value: "must be within 1..=16 per direction",
            });
        }
        Ok(())
    }

    /// Usable TRB slots per ring, the last one is the Link TRB.
    pub fn usable_trbs(&self) -> usize {
        self.trb_num - 1
    }
}

/// Configuration of one DWC2 host controller instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dwc2Config {
    /// Upper bound on host channels used, further limited by GHWCFG2
    pub max_channels: usize,
    /// Connection debounce time
    pub debounce_delay_ms: u32,
    /// Time the bus is held in reset
    pub reset_hold_ms: u32,
    /// Recovery time after the reset is released
    pub reset_recovery_ms: u32,
    /// Time the device gets to apply a new address
    pub set_addr_delay_ms: u32,
    /// Bound on AHB idle and core soft reset polling
    pub core_reset_timeout_us: u64,
    /// Use buffer DMA when the core supports it
    pub dma: bool,
}

impl Default for Dwc2Config {
    fn default() -> Self {
        Self {
            max_channels: 16,
            debounce_delay_ms: 250,
            reset_hold_ms: 30,
            reset_recovery_ms: 30,
            set_addr_delay_ms: 10,
            core_reset_timeout_us: 10_000,
            dma: true,
        }
    }
}

impl Dwc2Config {
    pub fn validate(&self) -> UsbResult<()> {
        if self.max_channels == 0 || self.max_channels > 16 {
            return Err(UsbError::InvalidArgument {
                name: "max_channels",
                value: "must be within 1..=16",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        assert!(Dwc3Config::default().validate().is_ok());
        assert!(Dwc2Config::default().validate().is_ok());
        assert_eq!(Dwc3Config::default().usable_trbs(), 7);
    }

    #[test]
    fn test_rejects_degenerate_ring() {
        let cfg = Dwc3Config {
            trb_num: 1,
            ..Dwc3Config::default()
        };
        assert!(cfg.validate().is_err());

        let cfg = Dwc2Config {
            max_channels: 0,
            ..Dwc2Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
