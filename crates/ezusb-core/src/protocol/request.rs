//! Vendor control request encoding.

use byteorder::{ByteOrder, LittleEndian};

use super::constants::{ANCHOR_LOAD_INTERNAL, K8051_USBCS};

/// bmRequestType bits.
pub const REQUEST_DIR_OUT: u8 = 0x00;
pub const REQUEST_TYPE_VENDOR: u8 = 0x40;
pub const REQUEST_RECIPIENT_DEVICE: u8 = 0x00;

/// A host-to-device vendor request on the default control pipe.
///
/// `wLength` is implied by the payload passed alongside the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VendorRequest {
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl VendorRequest {
    /// Firmware load write at `address` in 8051 memory.
    pub fn anchor_write(address: u16) -> Self {
        Self {
            request: ANCHOR_LOAD_INTERNAL,
            value: address,
            index: 0,
        }
    }

    /// Write to the USBCS register (CPU reset control).
    pub fn cpu_reset() -> Self {
        Self::anchor_write(K8051_USBCS)
    }

    /// bmRequestType for this request.
    pub fn request_type(&self) -> u8 {
        REQUEST_DIR_OUT | REQUEST_TYPE_VENDOR | REQUEST_RECIPIENT_DEVICE
    }

    /// Encode the 8-byte SETUP packet for a payload of `len` bytes.
    pub fn setup_packet(&self, len: u16) -> [u8; 8] {
        let mut setup = [0u8; 8];
        setup[0] = self.request_type();
        setup[1] = self.request;
        LittleEndian::write_u16(&mut setup[2..4], self.value);
        LittleEndian::write_u16(&mut setup[4..6], self.index);
        LittleEndian::write_u16(&mut setup[6..8], len);
        setup
    }
}
