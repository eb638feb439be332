//! DesignWare USB Controller Drivers
//!
//! This library provides the transfer-ring, command and interrupt-decode
//! logic for two Synopsys DesignWare USB cores:
//!
//! - [`drivers::usb::dwc3`]: the DWC3 USB3 *device* controller (TRB rings,
//!   `DEPCMD`/`DGCMD` command protocol, event buffer decode, control-transfer
//!   staging).
//! - [`drivers::usb::dwc2`]: the DWC2 USB2 *host* controller (per-channel
//!   programming, the split/non-split channel interrupt decision table, port
//!   power/reset state machine, FIFO sizing).
//!
//! Hardware access goes through [`mmio::RegisterBlock`], time through
//! [`timer::Clock`], and deferred work through [`sync::WorkScheduler`], so
//! the drivers can be hosted by any kernel that provides those primitives.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod drivers;
pub mod error;
pub mod mmio;
pub mod sync;
pub mod timer;

#[cfg(test)]
mod sim;

pub use config::{Dwc2Config, Dwc3Config};
pub use error::{UsbError, UsbResult};
