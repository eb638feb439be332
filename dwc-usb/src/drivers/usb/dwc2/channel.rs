//! Host channel vocabulary
//!
//! The raw `HCINT` bits, the event set the decode table turns them into,
//! PID and packet-count arithmetic, and the three-stage control transfer
//! counter a channel walks through.

use bitflags::bitflags;

use super::regs::*;
use crate::drivers::usb::{
    ch9::{EndpointType, SetupPacket, UsbDirection},
    control::ControlStage,
};

bitflags! {
    /// HCINT / HCINTMSK
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct HcInt: u32 {
        const XFERCOMPL = 1 << 0;
        const CHHLTD = 1 << 1;
        const AHBERR = 1 << 2;
        const STALL = 1 << 3;
        const NAK = 1 << 4;
        const ACK = 1 << 5;
        const NYET = 1 << 6;
        const XACTERR = 1 << 7;
        const BBLERR = 1 << 8;
        const FRMOVRUN = 1 << 9;
        const DTGERR = 1 << 10;
    }
}

bitflags! {
    /// What the worker has to do with a channel after an interrupt
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ChanEvents: u32 {
        /// Stage or transfer completed
        const CPLT = 1 << 0;
        /// Transfer failed
        const ERROR = 1 << 1;
        /// Endpoint answered STALL
        const STALL = 1 << 2;
        /// Give the transfer back and free the channel
        const DO_RELEASE = 1 << 3;
        /// Re-arm the current stage
        const DO_REINIT = 1 << 4;
        /// Undo the hardware's progress through the buffer before re-arming
        const DO_REWIND_BUFFER = 1 << 5;
        const DO_RETRY_SSPLIT = 1 << 6;
        const DO_RETRY_CSPLIT = 1 << 7;
        const DO_NEXT_SSPLIT = 1 << 8;
        const DO_NEXT_CSPLIT = 1 << 9;
        /// Start the complete-split after an acknowledged start-split
        const DO_REENABLE_CHANNEL = 1 << 10;
    }
}

/// Packet IDs as encoded in HCTSIZ.PID
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pid {
    Data0 = 0,
    Data2 = 1,
    Data1 = 2,
    /// MDATA for OUT, SETUP for control
    Setup = 3,
}

impl Pid {
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0x3 {
            0 => Self::Data0,
            1 => Self::Data2,
            2 => Self::Data1,
            _ => Self::Setup,
        }
    }

    /// PID a control stage starts with
    pub fn for_stage(stage: ControlStage) -> Self {
        match stage {
            ControlStage::Setup => Self::Setup,
            ControlStage::Data(_) | ControlStage::Status(_) => Self::Data1,
        }
    }
}

/// Bus transactions needed for `size` bytes. A zero-length packet still
/// takes one.
pub fn calc_packet_count(size: u32, mps: u16) -> u32 {
    let mps = mps.max(1) as u32;
    if size == 0 {
        1
    } else {
        size.div_ceil(mps)
    }
}

/// Data toggle after `packets` packets sent starting with `pid`.
pub fn next_pid(pid: Pid, packets: u32) -> Pid {
    if packets % 2 == 0 {
        return pid;
    }
    match pid {
        Pid::Data0 => Pid::Data1,
        Pid::Data1 => Pid::Data0,
        other => other,
    }
}

/// Error counter and split phase carried between interrupts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RetryState {
    pub error_count: u8,
    /// The next split transaction is a complete-split
    pub do_csplit: bool,
}

impl RetryState {
    /// Counter value after forward progress. Non-split OUT starts at one, so
    /// a single extra XACTERR on top of it is tolerated.
    pub fn baseline(kind: ChannelKind) -> u8 {
        if !kind.split && kind.direction == UsbDirection::Out {
            1
        } else {
            0
        }
    }

    pub fn new(kind: ChannelKind) -> Self {
        Self {
            error_count: Self::baseline(kind),
            do_csplit: false,
        }
    }
}

/// The key the interrupt decode table is indexed by
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelKind {
    pub direction: UsbDirection,
    /// Full/low-speed device behind a high-speed hub
    pub split: bool,
    pub ep_type: EndpointType,
}

impl ChannelKind {
    pub fn new(direction: UsbDirection, split: bool, ep_type: EndpointType) -> Self {
        Self {
            direction,
            split,
            ep_type,
        }
    }
}

/// Control transfer progress on a channel.
///
/// `cur_stg` is 0 while the SETUP is in flight, 1 during the data stage and
/// 2 once the status stage has been programmed. It only moves forward;
/// a new transfer starts from [`ControlState::begin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlState {
    setup: SetupPacket,
    stage: ControlStage,
}

impl ControlState {
    pub fn begin(setup: SetupPacket) -> Self {
        Self {
            setup,
            stage: ControlStage::Setup,
        }
    }

    pub fn setup(&self) -> &SetupPacket {
        &self.setup
    }

    pub fn stage(&self) -> ControlStage {
        self.stage
    }

    pub fn cur_stg(&self) -> u8 {
        self.stage.index()
    }

    pub fn data_stg_in(&self) -> bool {
        self.setup.data_direction().is_in()
    }

    pub fn data_stg_skip(&self) -> bool {
        !self.setup.has_data_stage()
    }

    /// Address the device takes once this transfer completes
    pub fn set_addr(&self) -> Option<u8> {
        self.setup.set_address_target()
    }

    /// Move past the stage that just completed and return the one to
    /// program next. `None` once the status stage is done.
    pub fn continue_stage(&mut self) -> Option<ControlStage> {
        if self.is_done() {
            return None;
        }
        self.stage = self.stage.next(&self.setup);
        Some(self.stage)
    }

    pub fn is_done(&self) -> bool {
        self.stage.is_status()
    }
}

/// HCCHAR for a transfer. The direction bit is rewritten per stage.
pub fn encode_hcchar(
    ep: u8,
    dev_addr: u8,
    mps: u16,
    ep_type: EndpointType,
    direction: UsbDirection,
    low_speed: bool,
) -> u32 {
    let mut hcchar = (mps as u32 & HCCHAR_MPS_MASK)
        | (((ep & 0x0f) as u32) << HCCHAR_EPNUM_POS)
        | ((ep_type as u32) << HCCHAR_EPTYPE_POS)
        | (1 << HCCHAR_EC_POS)
        | (((dev_addr & 0x7f) as u32) << HCCHAR_DEVADDR_POS);
    if direction.is_in() {
        hcchar |= HCCHAR_EPDIR;
    }
    if low_speed {
        hcchar |= HCCHAR_LSPDDEV;
    }
    hcchar
}

/// Polling period of a periodic endpoint in `HFNUM` ticks.
///
/// High-speed and isochronous endpoints encode `b_interval` as an exponent,
/// full- and low-speed interrupt endpoints as a frame count. The frame
/// counter ticks once per microframe while the root port runs at high speed.
pub fn poll_period(
    ep_type: EndpointType,
    b_interval: u8,
    dev_high_speed: bool,
    root_high_speed: bool,
) -> u16 {
    let frames = if dev_high_speed || ep_type == EndpointType::Isochronous {
        1u32 << (b_interval.clamp(1, 16) - 1)
    } else {
        b_interval.max(1) as u32
    };
    let ticks = if root_high_speed && !dev_high_speed {
        frames * 8
    } else {
        frames
    };
    ticks.min(HFNUM_MAX_FRNUM as u32 / 2) as u16
}

/// Frame number `ticks` after `frnum`
pub fn frame_after(frnum: u16, ticks: u16) -> u16 {
    frnum.wrapping_add(ticks) & HFNUM_MAX_FRNUM
}

/// `now` is at or past `due`, modulo the frame counter wrap.
pub fn frame_reached(now: u16, due: u16) -> bool {
    now.wrapping_sub(due) & HFNUM_MAX_FRNUM <= HFNUM_MAX_FRNUM / 2
}

/// ODDFRM for a periodic transaction issued in the frame after `frnum`
pub fn oddfrm_for(frnum: u16) -> u32 {
    if frame_after(frnum, 1) & 1 != 0 {
        HCCHAR_ODDFRM
    } else {
        0
    }
}

pub fn encode_hctsiz(size: u32, pktcnt: u32, pid: Pid) -> u32 {
    (size & HCTSIZ_XFERSIZE_MASK)
        | ((pktcnt << HCTSIZ_PKTCNT_POS) & HCTSIZ_PKTCNT_MASK)
        | ((pid as u32) << HCTSIZ_PID_POS)
}

/// HCSPLT for a device on `port` of the high-speed hub at `hub_addr`
pub fn encode_hcsplt(hub_addr: u8, port: u8) -> u32 {
    HCSPLT_SPLTENA
        | ((port & 0x7f) as u32)
        | (((hub_addr & 0x7f) as u32) << HCSPLT_HUBADDR_POS)
        | (HCSPLT_XACTPOS_ALL << HCSPLT_XACTPOS_POS)
}
