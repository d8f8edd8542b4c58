//! Protocol module - EZ-USB firmware load and loop-back definitions.

pub mod constants;
pub mod request;

pub use constants::*;
pub use request::VendorRequest;
