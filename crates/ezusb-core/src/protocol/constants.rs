//! Protocol constants for the Anchor Chips EZ-USB reference design.
//!
//! Derived from the EZ-USB technical reference (CPUCS / USBCS register map
//! and the "Firmware Load" vendor request).

// ============================================================================
// Device Identification
// ============================================================================

/// Anchor Chips Vendor ID (0x0547)
pub const ANCHOR_VENDOR_ID: u16 = 1351;

/// Product ID of the blank part, before firmware has been loaded (0x2001)
pub const ANCHOR_PRODUCT_ID: u16 = 8193;

/// Product ID the part re-enumerates with once the bulk test firmware runs (0x1002)
pub const BULK_TEST_PRODUCT_ID: u16 = 4098;

/// bcdDevice of the blank part accepted for bring-up
pub const ANCHOR_RELEASE: u16 = 1;

// ============================================================================
// Firmware Load
// ============================================================================

/// "Firmware Load" vendor request (host-to-device, vendor, device recipient)
pub const ANCHOR_LOAD_INTERNAL: u8 = 0xA0;

/// 8051 control/status register; bit 0 holds the CPU in reset
pub const K8051_USBCS: u16 = 0x7F92;

/// Value written to USBCS to hold the 8051 in reset
pub const CPU_RESET_ASSERT: u8 = 1;

/// Value written to USBCS to let the 8051 run
pub const CPU_RESET_RELEASE: u8 = 0;

/// Default timeout for control transfers (milliseconds)
pub const CONTROL_TIMEOUT_MS: u64 = 1000;

// ============================================================================
// Bulk Loop-back Test
// ============================================================================

/// Message written by the bulk loop-back test
pub const TEST_MESSAGE: &[u8] = b"Bulk I/O Test";

/// Pipe reference of the bulk OUT endpoint used by the test firmware
pub const BULK_OUT_PIPE: u8 = 2;

/// Pipe reference of the bulk IN endpoint used by the test firmware
pub const BULK_IN_PIPE: u8 = 9;

/// Size of the per-test transfer buffer
pub const TRANSFER_BUFFER_SIZE: usize = 64;

/// Usable read window; one byte stays reserved as a terminator
pub const READ_WINDOW: usize = TRANSFER_BUFFER_SIZE - 1;

// ============================================================================
// I/O Kit compatible status codes (reported in log lines)
// ============================================================================

pub const STATUS_ERROR: u32 = 0xE000_02BC;
pub const STATUS_NO_RESOURCES: u32 = 0xE000_02BE;
pub const STATUS_NO_DEVICE: u32 = 0xE000_02C0;
pub const STATUS_EXCLUSIVE_ACCESS: u32 = 0xE000_02C5;
pub const STATUS_BAD_ARGUMENT: u32 = 0xE000_02C2;
pub const STATUS_NOT_OPEN: u32 = 0xE000_02CD;
pub const STATUS_TIMEOUT: u32 = 0xE000_02D6;
pub const STATUS_ABORTED: u32 = 0xE000_02EB;
pub const STATUS_NOT_RESPONDING: u32 = 0xE000_02ED;
pub const STATUS_PIPE_STALLED: u32 = 0xE000_404F;
