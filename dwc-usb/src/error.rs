//! Error types for the DesignWare USB drivers
//!
//! Every fallible driver operation returns [`UsbResult`]. The variants carry
//! enough static context to be logged without allocation, and
//! [`UsbError::errno`] maps each of them onto the negative errno value a
//! C USB stack expects from its controller driver.

use core::fmt;

/// Main driver error type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsbError {
    /// Resource temporarily busy, retry later (ring full, channel busy)
    Busy,
    /// Transfer was cancelled before completion
    Aborted,
    /// Transfer or controller I/O failure
    Io {
        operation: &'static str,
    },
    /// Endpoint returned a STALL handshake
    Stalled,
    /// A hardware bit did not reach the expected state in time
    Timeout {
        operation: &'static str,
        duration_us: u64,
    },
    /// A controller command completed with a non-OK status
    CommandFailed {
        command: u32,
        status: u32,
    },
    /// The transfer ring of an endpoint has no free TRB
    RingFull {
        endpoint: u8,
    },

    /// Generic errors
    InvalidArgument {
        name: &'static str,
        value: &'static str,
    },
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },
    NotSupported {
        operation: &'static str,
    },
    NoDevice,
    ResourceExhausted {
        resource: &'static str,
    },
}

/// Result type alias for driver operations
pub type UsbResult<T> = Result<T, UsbError>;

/// Zephyr/newlib errno values used at the stack boundary
pub mod errno {
    pub const EIO: i32 = 5;
    pub const ENOMEM: i32 = 12;
    pub const EBUSY: i32 = 16;
    pub const ENODEV: i32 = 19;
    pub const EINVAL: i32 = 22;
    pub const EPIPE: i32 = 32;
    pub const ENOSYS: i32 = 88;
    pub const ECONNABORTED: i32 = 113;
    pub const ETIMEDOUT: i32 = 116;
    pub const ENOTSUP: i32 = 134;
}

impl UsbError {
    /// Negative errno equivalent of this error.
    pub fn errno(&self) -> i32 {
        let code = match self {
            Self::Busy | Self::RingFull { .. } => errno::EBUSY,
            Self::Aborted => errno::ECONNABORTED,
            Self::Io { .. } | Self::CommandFailed { .. } => errno::EIO,
            Self::Stalled => errno::EPIPE,
            Self::Timeout { .. } => errno::ETIMEDOUT,
            Self::InvalidArgument { .. } | Self::InvalidState { .. } => errno::EINVAL,
            Self::NotSupported { .. } => errno::ENOSYS,
            Self::NoDevice => errno::ENODEV,
            Self::ResourceExhausted { .. } => errno::ENOMEM,
        };
        -code
    }

    /// Whether the caller may retry the same request later unchanged.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Busy | Self::RingFull { .. })
    }
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Busy => write!(f, "Resource busy"),
            Self::Aborted => write!(f, "Transfer aborted"),
            Self::Io { operation } => write!(f, "I/O error during {}", operation),
            Self::Stalled => write!(f, "Endpoint stalled"),
            Self::Timeout {
                operation,
                duration_us,
            } => {
                write!(f, "Timeout during {}: {} us", operation, duration_us)
            }
            Self::CommandFailed { command, status } => {
                write!(
                    f,
                    "Command 0x{:x} failed with status 0x{:x}",
                    command, status
                )
            }
            Self::RingFull { endpoint } => {
                write!(f, "Transfer ring of endpoint 0x{:02x} is full", endpoint)
            }
            Self::InvalidArgument { name, value } => {
                write!(f, "Invalid argument '{}': {}", name, value)
            }
            Self::InvalidState { expected, actual } => {
                write!(f, "Invalid state: expected {}, got {}", expected, actual)
            }
            Self::NotSupported { operation } => {
                write!(f, "Operation not supported: {}", operation)
            }
            Self::NoDevice => write!(f, "No device"),
            Self::ResourceExhausted { resource } => write!(f, "Resource exhausted: {}", resource),
        }
    }
}

#[cfg(test)]
mod tests {
    use alloc::string::ToString;

    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(UsbError::Busy.errno(), -16);
        assert_eq!(UsbError::RingFull { endpoint: 0x81 }.errno(), -16);
        assert_eq!(UsbError::Aborted.errno(), -113);
        assert_eq!(UsbError::Stalled.errno(), -32);
        assert_eq!(
            UsbError::NotSupported {
                operation: "dequeue"
            }
            .errno(),
            -88
        );
        assert_eq!(
            UsbError::CommandFailed {
                command: 0x04,
                status: 1
            }
            .errno(),
            -5
        );
    }

    #[test]
    fn test_transient_errors() {
        assert!(UsbError::Busy.is_transient());
        assert!(UsbError::RingFull { endpoint: 1 }.is_transient());
        assert!(!UsbError::Aborted.is_transient());
        assert!(!UsbError::NoDevice.is_transient());
    }

    #[test]
    fn test_display() {
        let err = UsbError::Timeout {
            operation: "DEPCMD",
            duration_us: 10_000,
        };
        assert_eq!(err.to_string(), "Timeout during DEPCMD: 10000 us");
        assert_eq!(
            UsbError::RingFull { endpoint: 0x81 }.to_string(),
            "Transfer ring of endpoint 0x81 is full"
        );
    }
}
