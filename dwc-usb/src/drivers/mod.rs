//! Device drivers

pub mod usb;
