//! EZUSB-Core: firmware bring-up and bulk loop-back testing for Anchor Chips
//! EZ-USB parts.
//!
//! A blank part enumerates with the raw identity. Its 8051 is held in
//! reset, the firmware image is written to internal RAM with vendor
//! requests, and reset is released; the part then re-enumerates with the
//! bulk test identity and echoes the one's complement of whatever it
//! receives on its bulk OUT pipe.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Identity constants, vendor request encoding, status codes
//! - **Payload**: Intel HEX firmware images
//! - **Transport**: Device and interface capabilities (nusb, mock)
//! - **Engine**: Bring-up, interface discovery, bulk test (sync and async)
//! - **Notify**: Arrival and removal subscriptions (nusb hotplug, mock)
//! - **Router**: Per-class handling of device batches
//! - **Events**: Observer pattern for output decoupling
//! - **Session**: Configuration and the single-threaded event loop
//!
//! # Example
//!
//! ```no_run
//! use ezusb_core::session::{NotifierConfig, NotifierSession};
//!
//! let config = NotifierConfig {
//!     firmware_path: Some("bulktest.hex".into()),
//!     ..Default::default()
//! };
//!
//! let session = NotifierSession::new(config);
//! session.run().expect("notifier failed");
//! ```

pub mod device;
pub mod engine;
pub mod events;
pub mod notify;
pub mod payload;
pub mod protocol;
pub mod router;
pub mod session;
pub mod transport;

// Re-exports for convenience
pub use device::{DeviceError, DeviceIdentity, IdentityClass, IdentityMatch};
pub use engine::{BringUpError, BringUpStep, BulkTestError, TestMode};
pub use events::{LoaderEvent, LoaderObserver, LogLevel, NullObserver, TracingObserver};
pub use notify::{NotificationPort, NotifyError, NusbNotificationPort};
pub use payload::{FirmwareError, FirmwareImage, FirmwareRecord};
pub use protocol::VendorRequest;
pub use router::{DeviceRouter, IdentityTable};
pub use session::{NotifierConfig, NotifierSession, SessionSummary, run_event_loop};
pub use transport::{MockUsb, NusbProvider, TransportError};
