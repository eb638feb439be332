//! DWC2 USB2 Host Controller
//!
//! This module is organized into submodules:
//! - [`regs`]: register offsets and bit fields
//! - [`channel`]: host channel types, PID and packet math, register encoding
//! - [`decode`]: the channel interrupt decode table
//! - [`fifo`]: FIFO RAM sizing and flushes
//! - [`port`]: the root port state machine and port interrupt decoding
//! - [`host`]: the controller itself and the stack-facing API

pub mod channel;
pub mod decode;
pub mod fifo;
pub mod host;
pub mod port;
pub mod regs;


pub use channel::{calc_packet_count, next_pid, ChanEvents, ChannelKind, ControlState, HcInt, Pid};
pub use decode::{decode, DecodeCtx};
pub use fifo::FifoConfig;
pub use host::{Dwc2Host, HwConfig, UhcEvent, UhcStack, UhcTransfer};
pub use port::{PortEvent, PortState};
