//! Control transfer stage machine
//!
//! Both controllers walk the same progression:
//!
//! ```text
//! Setup ──► Data(In | Out) ──► Status(opposite of data)
//!   │                               ▲
//!   └──── (wLength == 0) ──► Status(In)
//! ```
//!
//! The device driver uses it to validate which buffer the stack may queue
//! next on EP0 and which TRB type to use; the host driver uses it to pick the
//! direction and PID of the next stage it programs into a channel.

use super::ch9::{SetupPacket, UsbDirection};

/// Stage of a control transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlStage {
    Setup,
    Data(UsbDirection),
    Status(UsbDirection),
}

impl ControlStage {
    /// Stage following a completed SETUP.
    pub fn after_setup(setup: &SetupPacket) -> Self {
        if setup.has_data_stage() {
            Self::Data(setup.data_direction())
        } else {
            // No data stage: status is always device-to-host
            Self::Status(UsbDirection::In)
        }
    }

    /// Stage following the completion of `self`.
    ///
    /// `setup` is only consulted when leaving the Setup stage. Status wraps
    /// back to Setup for the next transfer.
    pub fn next(self, setup: &SetupPacket) -> Self {
        match self {
            Self::Setup => Self::after_setup(setup),
            Self::Data(dir) => Self::Status(dir.opposite()),
            Self::Status(_) => Self::Setup,
        }
    }

    /// Monotonic stage index: 0 setup, 1 data, 2 status
    pub fn index(self) -> u8 {
        match self {
            Self::Setup => 0,
            Self::Data(_) => 1,
            Self::Status(_) => 2,
        }
    }

    /// Bus direction of the stage. SETUP is always host-to-device.
    pub fn direction(self) -> UsbDirection {
        match self {
            Self::Setup => UsbDirection::Out,
            Self::Data(dir) | Self::Status(dir) => dir,
        }
    }

    pub fn is_status(self) -> bool {
        matches!(self, Self::Status(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drivers::usb::ch9::request;

    fn setup(bm_request_type: u8, w_length: u16) -> SetupPacket {
        SetupPacket {
            bm_request_type,
            b_request: request::GET_DESCRIPTOR,
            w_length,
            ..Default::default()
        }
    }

    #[test]
    fn test_no_data_goes_to_status_in() {
        let s = setup(0x00, 0);
        assert_eq!(
            ControlStage::Setup.next(&s),
            ControlStage::Status(UsbDirection::In)
        );
    }

    #[test]
    fn test_status_opposes_data() {
        let s = setup(0x80, 18);
        let data = ControlStage::Setup.next(&s);
        assert_eq!(data, ControlStage::Data(UsbDirection::In));
        assert_eq!(data.next(&s), ControlStage::Status(UsbDirection::Out));

        let s = setup(0x00, 4);
        let data = ControlStage::Setup.next(&s);
        assert_eq!(data.next(&s), ControlStage::Status(UsbDirection::In));
    }

    #[test]
    fn test_stage_index_is_monotonic_within_transfer() {
        let s = setup(0x80, 64);
        let mut stage = ControlStage::Setup;
        let mut last = stage.index();
        for _ in 0..2 {
            stage = stage.next(&s);
            assert!(stage.index() > last);
            last = stage.index();
        }
        assert_eq!(stage.next(&s), ControlStage::Setup);
        assert_eq!(ControlStage::Setup.direction(), UsbDirection::Out);
    }
}
