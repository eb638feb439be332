//! Root port state machine
//!
//! ```text
//!  NotPowered ──power on──► Disconnected ──connect + debounce──► Disabled
//!                                ▲                                   │
//!                                │                                 reset
//!                                │                                   ▼
//!                             Recovery ◄──error/overcurrent──── Resetting
//!                                ▲                                   │
//!                                └──────────disconnect──────── Enabled
//! ```
//!
//! The interrupt handler turns `GINTSTS`/`HPRT` into a [`HwPortEvent`]
//! with [`decode_port_intr`]; the handler then maps it onto the
//! [`PortEvent`] the worker acts on.

use super::regs::*;
use crate::drivers::usb::ch9::UsbSpeed;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortState {
    NotPowered,
    Disconnected,
    /// Device connected, bus not reset yet
    Disabled,
    Resetting,
    Enabled,
    /// Tearing down after an error, the port is re-initialized next
    Recovery,
}

impl PortState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotPowered => "not powered",
            Self::Disconnected => "disconnected",
            Self::Disabled => "disabled",
            Self::Resetting => "resetting",
            Self::Enabled => "enabled",
            Self::Recovery => "recovery",
        }
    }
}

/// Port events handled by the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    Connection,
    Enabled,
    Disconnection,
    Error,
    Overcurrent,
}

/// What the port hardware reported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HwPortEvent {
    Conn,
    Disconn,
    Enabled,
    Disabled,
    Overcurrent,
    OvercurrentCleared,
}

/// Interrupt-side port flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortFlags {
    /// Connect/disconnect interrupts are masked until the worker debounces
    pub lock_enabled: bool,
    /// The port reported enabled and no disable has been seen since
    pub conn_dev_ena: bool,
    /// Software disabled the port and expects the disable interrupt
    pub waiting_disable: bool,
}

/// Decode the port part of a core interrupt.
///
/// `hprt` is zero when `GINTSTS.PRTINT` was clear. A disconnect wins over
/// an overcurrent change, which wins over an enable change, which wins over
/// a connect. A connect is ignored while the debounce lock is held.
pub fn decode_port_intr(gintsts: u32, hprt: u32, flags: &PortFlags) -> Option<HwPortEvent> {
    if gintsts & GINTSTS_DISCONNINT != 0 {
        Some(HwPortEvent::Disconn)
    } else if hprt & HPRT_OVRCURRCHNG != 0 {
        if hprt & HPRT_OVRCURRACT != 0 {
            Some(HwPortEvent::Overcurrent)
        } else {
            Some(HwPortEvent::OvercurrentCleared)
        }
    } else if hprt & HPRT_ENCHNG != 0 {
        if hprt & HPRT_ENA != 0 {
            Some(HwPortEvent::Enabled)
        } else {
            Some(HwPortEvent::Disabled)
        }
    } else if hprt & HPRT_CONNDET != 0 && !flags.lock_enabled {
        Some(HwPortEvent::Conn)
    } else {
        None
    }
}

/// Speed of the device on the port
pub fn port_speed(hprt: u32) -> Option<UsbSpeed> {
    match (hprt & HPRT_SPD_MASK) >> HPRT_SPD_POS {
        HPRT_SPD_HIGH => Some(UsbSpeed::High),
        HPRT_SPD_FULL => Some(UsbSpeed::Full),
        HPRT_SPD_LOW => Some(UsbSpeed::Low),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_has_priority() {
        let flags = PortFlags::default();
        let hprt = HPRT_CONNDET | HPRT_ENCHNG | HPRT_OVRCURRCHNG;
        assert_eq!(
            decode_port_intr(GINTSTS_DISCONNINT | GINTSTS_PRTINT, hprt, &flags),
            Some(HwPortEvent::Disconn)
        );
        assert_eq!(
            decode_port_intr(GINTSTS_PRTINT, hprt | HPRT_OVRCURRACT, &flags),
            Some(HwPortEvent::Overcurrent)
        );
        assert_eq!(
            decode_port_intr(GINTSTS_PRTINT, hprt, &flags),
            Some(HwPortEvent::OvercurrentCleared)
        );
        assert_eq!(
            decode_port_intr(GINTSTS_PRTINT, HPRT_ENCHNG | HPRT_CONNDET, &flags),
            Some(HwPortEvent::Disabled)
        );
        assert_eq!(
            decode_port_intr(GINTSTS_PRTINT, HPRT_ENCHNG | HPRT_ENA, &flags),
            Some(HwPortEvent::Enabled)
        );
    }

    #[test]
    fn test_connect_ignored_while_locked() {
        let mut flags = PortFlags::default();
        assert_eq!(
            decode_port_intr(GINTSTS_PRTINT, HPRT_CONNDET | HPRT_CONNSTS, &flags),
            Some(HwPortEvent::Conn)
        );
        flags.lock_enabled = true;
        assert_eq!(
            decode_port_intr(GINTSTS_PRTINT, HPRT_CONNDET | HPRT_CONNSTS, &flags),
            None
        );
        assert_eq!(decode_port_intr(0, 0, &flags), None);
    }

    #[test]
    fn test_port_speed() {
        assert_eq!(port_speed(0), Some(UsbSpeed::High));
        assert_eq!(port_speed(HPRT_SPD_FULL << HPRT_SPD_POS), Some(UsbSpeed::Full));
        assert_eq!(port_speed(HPRT_SPD_LOW << HPRT_SPD_POS), Some(UsbSpeed::Low));
        assert_eq!(port_speed(3 << HPRT_SPD_POS), None);
    }
}
