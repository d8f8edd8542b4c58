//! Transport layer module.

pub mod mock;
pub mod nusb;
pub mod traits;

pub use mock::{MockCall, MockDeviceSpec, MockFault, MockInterfaceSpec, MockUsb};
pub use nusb::{NusbDevice, NusbInterface, NusbProvider};
pub use traits::{
    DeviceControl, DeviceProvider, InterfaceControl, InterfaceFilter, PipeDirection,
    PipeProperties, PipeRef, PipeTransferType, TransferCompletion, TransportError,
};
