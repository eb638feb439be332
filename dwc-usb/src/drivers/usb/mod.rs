//! USB Controller Drivers
//!
//! This module is organized into submodules:
//! - [`ch9`]: USB chapter 9 vocabulary shared by both controllers
//! - [`buf`]: the transfer buffer handed between the stack and a driver
//! - [`control`]: the control-transfer stage machine
//! - [`dwc3`]: DWC3 device controller (TRB rings, DEPCMD, event buffer)
//! - [`dwc2`]: DWC2 host controller (channels, split decode, root port)

pub mod buf;
pub mod ch9;
pub mod control;
pub mod dwc2;
pub mod dwc3;

pub use buf::{BufFlags, UsbBuf};
pub use ch9::{EndpointType, SetupPacket, UsbDirection, UsbSpeed};
pub use control::ControlStage;
