//! USB chapter 9 types shared by the device and host drivers
//!
//! Setup packet layout, standard request codes, endpoint address helpers and
//! the speed/direction/type enumerations used throughout the drivers.

use crate::error::{UsbError, UsbResult};

/// USB bus speeds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbSpeed {
    Low,   // 1.5 Mbps
    Full,  // 12 Mbps
    High,  // 480 Mbps
    Super, // 5 Gbps
}

/// USB endpoint types, encoded as in bmAttributes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointType {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl EndpointType {
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Self::Control,
            1 => Self::Isochronous,
            2 => Self::Bulk,
            _ => Self::Interrupt,
        }
    }

    pub fn is_periodic(self) -> bool {
        matches!(self, Self::Isochronous | Self::Interrupt)
    }
}

/// USB transfer direction, relative to the host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbDirection {
    Out = 0,
    In = 1,
}

impl UsbDirection {
    pub fn opposite(self) -> Self {
        match self {
            Self::Out => Self::In,
            Self::In => Self::Out,
        }
    }

    pub fn is_in(self) -> bool {
        self == Self::In
    }
}

/// Endpoint address helpers
pub mod ep_addr {
    use super::UsbDirection;

    pub const DIR_IN: u8 = 0x80;
    pub const EP0_OUT: u8 = 0x00;
    pub const EP0_IN: u8 = 0x80;

    pub const fn index(addr: u8) -> u8 {
        addr & 0x0f
    }

    pub const fn is_in(addr: u8) -> bool {
        addr & DIR_IN != 0
    }

    pub fn direction(addr: u8) -> UsbDirection {
        if is_in(addr) {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }

    pub const fn is_control(addr: u8) -> bool {
        index(addr) == 0
    }
}

/// Standard request codes
#[allow(dead_code)]
pub mod request {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_DESCRIPTOR: u8 = 0x07;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
    pub const GET_INTERFACE: u8 = 0x0A;
    pub const SET_INTERFACE: u8 = 0x0B;
    pub const SYNCH_FRAME: u8 = 0x0C;
    pub const SET_SEL: u8 = 0x30;
}

/// bmRequestType fields
pub mod reqtype {
    pub const DIR_TO_HOST: u8 = 0x80;
    pub const TYPE_MASK: u8 = 0x60;
    pub const TYPE_STANDARD: u8 = 0x00;
    pub const RECIPIENT_MASK: u8 = 0x1f;
    pub const RECIPIENT_DEVICE: u8 = 0x00;
}

/// The 8-byte SETUP packet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SetupPacket {
    pub bm_request_type: u8,
    pub b_request: u8,
    pub w_value: u16,
    pub w_index: u16,
    pub w_length: u16,
}

impl SetupPacket {
    pub const SIZE: usize = 8;

    pub fn parse(bytes: &[u8]) -> UsbResult<Self> {
        if bytes.len() < Self::SIZE {
            return Err(UsbError::InvalidArgument {
                name: "setup",
                value: "shorter than 8 bytes",
            });
        }
        Ok(Self {
            bm_request_type: bytes[0],
            b_request: bytes[1],
            w_value: u16::from_le_bytes([bytes[2], bytes[3]]),
            w_index: u16::from_le_bytes([bytes[4], bytes[5]]),
            w_length: u16::from_le_bytes([bytes[6], bytes[7]]),
        })
    }

    pub fn to_bytes(&self) -> [u8; 8] {
        let v = self.w_value.to_le_bytes();
        let i = self.w_index.to_le_bytes();
        let l = self.w_length.to_le_bytes();
        [
            self.bm_request_type,
            self.b_request,
            v[0],
            v[1],
            i[0],
            i[1],
            l[0],
            l[1],
        ]
    }

    /// Direction of the data stage, meaningful only when `w_length != 0`
    pub fn data_direction(&self) -> UsbDirection {
        if self.bm_request_type & reqtype::DIR_TO_HOST != 0 {
            UsbDirection::In
        } else {
            UsbDirection::Out
        }
    }

    pub fn has_data_stage(&self) -> bool {
        self.w_length != 0
    }

    pub fn is_standard_device(&self) -> bool {
        self.bm_request_type & reqtype::TYPE_MASK == reqtype::TYPE_STANDARD
            && self.bm_request_type & reqtype::RECIPIENT_MASK == reqtype::RECIPIENT_DEVICE
    }

    /// New address carried by a standard SET_ADDRESS request
    pub fn set_address_target(&self) -> Option<u8> {
        if self.is_standard_device() && self.b_request == request::SET_ADDRESS {
            Some((self.w_value & 0x7f) as u8)
        } else {
            None
        }
    }
}
