//! Payload handling module.
//!
//! Provides Intel HEX parsing for the firmware image downloaded at bring-up.

pub mod firmware;
pub mod hex;

pub use firmware::{FirmwareError, FirmwareImage, FirmwareRecord, RecordKind};
