//! DWC3 USB3 Device Controller
//!
//! This module is organized into submodules:
//! - [`regs`]: register offsets and bit fields
//! - [`trb`]: the Transfer Request Block layout
//! - [`ring`]: per-endpoint TRB rings with Link TRB wrap
//! - [`cmd`]: the DEPCMD/DGCMD act-and-poll command channel
//! - [`event`]: event buffer and event decoding
//! - [`endpoint`]: per-endpoint software state and TRB chaining
//! - [`device`]: the controller itself and the stack-facing API

pub mod cmd;
pub mod device;
pub mod endpoint;
pub mod event;
pub mod regs;
pub mod ring;
pub mod trb;

#[cfg(test)]
mod tests;

pub use cmd::{CommandChannel, DepCmd, DepCmdParams};
pub use device::{Dwc3Device, SystemExitLatency, UdcEvent, UdcStack};
pub use event::{decode_event, Dwc3Event};
pub use trb::{Trb, TrbCtrl, TrbType};
