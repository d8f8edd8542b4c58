//! USB transfer primitives.
//!
//! Defines the capability traits the bring-up and bulk test engines are
//! written against, allowing different implementations (nusb, mock, etc.).

use std::fmt;

use futures::future::LocalBoxFuture;
use thiserror::Error;

use crate::device::DeviceIdentity;
use crate::protocol::VendorRequest;
use crate::protocol::constants::*;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to open device: {0}")]
    OpenFailed(String),

    #[error("Device is not open")]
    NotOpen,

    #[error("Configuration index {index} not found")]
    ConfigurationNotFound { index: u8 },

    #[error("Failed to set configuration: {0}")]
    ConfigurationFailed(String),

    #[error("Failed to claim interface {interface}: {message}")]
    ClaimInterfaceFailed { interface: u8, message: String },

    #[error("Pipe {pipe} not found")]
    PipeNotFound { pipe: PipeRef },

    #[error("Control transfer failed: {0}")]
    ControlFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Pipe stalled")]
    Stall,

    #[error("Transfer aborted")]
    Aborted,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// Numeric status code reported alongside the message in log lines.
    pub fn code(&self) -> u32 {
        match self {
            TransportError::Disconnected => STATUS_NO_DEVICE,
            TransportError::OpenFailed(_) => STATUS_EXCLUSIVE_ACCESS,
            TransportError::NotOpen => STATUS_NOT_OPEN,
            TransportError::ConfigurationNotFound { .. } | TransportError::PipeNotFound { .. } => {
                STATUS_BAD_ARGUMENT
            }
            TransportError::ClaimInterfaceFailed { .. } => STATUS_EXCLUSIVE_ACCESS,
            TransportError::Stall => STATUS_PIPE_STALLED,
            TransportError::Aborted => STATUS_ABORTED,
            TransportError::Timeout { .. } => STATUS_TIMEOUT,
            TransportError::ControlFailed(_)
            | TransportError::WriteFailed(_)
            | TransportError::ReadFailed(_) => STATUS_NOT_RESPONDING,
            TransportError::ConfigurationFailed(_) | TransportError::Io(_) => STATUS_ERROR,
        }
    }
}

/// Endpoint direction as reported by pipe properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeDirection {
    Out,
    In,
    None,
    Any,
}

impl fmt::Display for PipeDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeDirection::Out => write!(f, "out"),
            PipeDirection::In => write!(f, "in"),
            PipeDirection::None => write!(f, "none"),
            PipeDirection::Any => write!(f, "any"),
        }
    }
}

/// Endpoint transfer type as reported by pipe properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipeTransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
    Any,
}

impl fmt::Display for PipeTransferType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipeTransferType::Control => write!(f, "control"),
            PipeTransferType::Isochronous => write!(f, "isoc"),
            PipeTransferType::Bulk => write!(f, "bulk"),
            PipeTransferType::Interrupt => write!(f, "interrupt"),
            PipeTransferType::Any => write!(f, "any"),
        }
    }
}

/// Index (1..=N) into an open interface's endpoint list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeRef(pub u8);

impl PipeRef {
    /// Zero-based position in the endpoint list, `None` for the control pipe.
    pub fn index(self) -> Option<usize> {
        (self.0 as usize).checked_sub(1)
    }
}

impl fmt::Display for PipeRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Properties of one pipe on an open interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipeProperties {
    pub direction: PipeDirection,
    pub transfer_type: PipeTransferType,
    /// Endpoint address including the direction bit.
    pub address: u8,
    pub max_packet_size: u16,
    pub interval: u8,
}

/// Interface match criteria; `None` means "don't care".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InterfaceFilter {
    pub class: Option<u8>,
    pub subclass: Option<u8>,
    pub protocol: Option<u8>,
    pub alt_setting: Option<u8>,
}

impl InterfaceFilter {
    /// Matches every interface and alternate setting.
    pub fn dont_care() -> Self {
        Self::default()
    }

    pub fn matches(&self, class: u8, subclass: u8, protocol: u8, alt_setting: u8) -> bool {
        self.class.is_none_or(|c| c == class)
            && self.subclass.is_none_or(|s| s == subclass)
            && self.protocol.is_none_or(|p| p == protocol)
            && self.alt_setting.is_none_or(|a| a == alt_setting)
    }
}

/// Result of an asynchronous pipe transfer.
#[derive(Debug)]
pub struct TransferCompletion {
    pub status: Result<(), TransportError>,
    /// Bytes moved by the transfer.
    pub actual_len: usize,
    /// Received bytes (IN transfers only).
    pub data: Vec<u8>,
}

impl TransferCompletion {
    pub fn written(actual_len: usize) -> Self {
        Self {
            status: Ok(()),
            actual_len,
            data: Vec::new(),
        }
    }

    pub fn received(data: Vec<u8>) -> Self {
        Self {
            status: Ok(()),
            actual_len: data.len(),
            data,
        }
    }

    pub fn failed(error: TransportError) -> Self {
        Self {
            status: Err(error),
            actual_len: 0,
            data: Vec::new(),
        }
    }
}

/// Device-level capability, obtained for one enumerated device.
///
/// Dropping the value releases the device.
pub trait DeviceControl {
    type Interface: InterfaceControl + 'static;

    /// Vendor, product and release number from the device descriptor.
    fn identity(&self) -> Result<DeviceIdentity, TransportError>;

    /// Open the device for exclusive access.
    fn open(&mut self) -> Result<(), TransportError>;

    /// Close a previously opened device.
    fn close(&mut self) -> Result<(), TransportError>;

    fn num_configurations(&self) -> Result<u8, TransportError>;

    /// bConfigurationValue of the configuration descriptor at `index`.
    fn configuration_value(&self, index: u8) -> Result<u8, TransportError>;

    fn set_configuration(&mut self, value: u8) -> Result<(), TransportError>;

    /// Host-to-device vendor request on the default control pipe.
    fn control_write(&mut self, request: VendorRequest, data: &[u8])
    -> Result<(), TransportError>;

    /// Interfaces of the active configuration matching `filter`, unopened.
    fn find_interfaces(
        &mut self,
        filter: &InterfaceFilter,
    ) -> Result<Vec<Self::Interface>, TransportError>;
}

/// Interface-level capability.
///
/// Dropping the value releases the interface.
pub trait InterfaceControl {
    fn class(&self) -> u8;

    fn subclass(&self) -> u8;

    /// Open the interface; this instantiates its pipes.
    fn open(&mut self) -> Result<(), TransportError>;

    fn close(&mut self) -> Result<(), TransportError>;

    fn num_endpoints(&self) -> Result<u8, TransportError>;

    fn pipe_properties(&self, pipe: PipeRef) -> Result<PipeProperties, TransportError>;

    /// Blocking bulk write; returns bytes written.
    fn write_pipe(&mut self, pipe: PipeRef, data: &[u8]) -> Result<usize, TransportError>;

    /// Blocking bulk read into `buf`; returns bytes read.
    fn read_pipe(&mut self, pipe: PipeRef, buf: &mut [u8]) -> Result<usize, TransportError>;

    /// Queue a bulk write; the future resolves when the transfer completes.
    fn write_pipe_async(
        &mut self,
        pipe: PipeRef,
        data: Vec<u8>,
    ) -> LocalBoxFuture<'static, TransferCompletion>;

    /// Queue a bulk read of up to `len` bytes.
    fn read_pipe_async(&mut self, pipe: PipeRef, len: usize)
    -> LocalBoxFuture<'static, TransferCompletion>;
}

/// Turns an enumeration object into a device capability.
///
/// The enumeration object is consumed, so it is released as soon as the
/// device capability exists.
pub trait DeviceProvider {
    type Candidate;
    type Device: DeviceControl;

    fn create_device(&self, candidate: Self::Candidate) -> Result<Self::Device, TransportError>;
}
