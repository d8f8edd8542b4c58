//! Device identity, scoped handles and the per-device error taxonomy.

use std::fmt;
use std::ops::{Deref, DerefMut};

use thiserror::Error;
use tracing::warn;

use crate::engine::bringup::{BringUpError, BringUpStep};
use crate::engine::bulk::BulkTestError;
use crate::engine::discovery::DiscoveryError;
use crate::transport::{DeviceControl, InterfaceControl, TransportError};

/// Identity fields from the device descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DeviceIdentity {
    pub vendor_id: u16,
    pub product_id: u16,
    /// bcdDevice
    pub release: u16,
}

impl DeviceIdentity {
    pub fn new(vendor_id: u16, product_id: u16, release: u16) -> Self {
        Self {
            vendor_id,
            product_id,
            release,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04X}:{:04X} rev {:04X}",
            self.vendor_id, self.product_id, self.release
        )
    }
}

/// Which of the two identities a device presents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IdentityClass {
    /// Blank part waiting for firmware.
    Raw,
    /// Part running the bulk test firmware.
    Tested,
}

impl fmt::Display for IdentityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdentityClass::Raw => write!(f, "raw"),
            IdentityClass::Tested => write!(f, "bulk test"),
        }
    }
}

/// Expected identity for one class; `release: None` accepts any release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityMatch {
    pub vendor_id: u16,
    pub product_id: u16,
    pub release: Option<u16>,
}

impl IdentityMatch {
    pub fn matches(&self, identity: &DeviceIdentity) -> bool {
        identity.vendor_id == self.vendor_id
            && identity.product_id == self.product_id
            && self.release.is_none_or(|r| r == identity.release)
    }
}

impl fmt::Display for IdentityMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04X}:{:04X}", self.vendor_id, self.product_id)?;
        if let Some(release) = self.release {
            write!(f, " rev {:04X}", release)?;
        }
        Ok(())
    }
}

/// Why one device's sequence was abandoned.
#[derive(Error, Debug)]
pub enum DeviceError {
    #[error("unable to enumerate: {0}")]
    Enumeration(#[source] TransportError),

    #[error("no interface found")]
    NoInterface,

    #[error("unable to create a plugin: {0}")]
    PluginCreation(#[source] TransportError),

    #[error("couldn't query the device interface: {0}")]
    InterfaceQuery(#[source] TransportError),

    #[error("found device I didn't want ({found}, expected {expected})")]
    IdentityMismatch {
        expected: IdentityMatch,
        found: DeviceIdentity,
    },

    #[error("unable to open: {0}")]
    Open(#[source] TransportError),

    #[error("unable to configure device: {0}")]
    Configuration(#[source] TransportError),

    #[error("device has no configurations")]
    NoConfigurations,

    #[error("{step} failed: {source}")]
    ControlTransfer {
        step: BringUpStep,
        #[source]
        source: TransportError,
    },

    #[error("bulk test failed: {0}")]
    BulkTransfer(#[from] BulkTestError),
}

impl DeviceError {
    /// Numeric status for log lines.
    pub fn code(&self) -> u32 {
        use crate::protocol::constants::{STATUS_ERROR, STATUS_NO_RESOURCES};
        match self {
            DeviceError::Enumeration(e)
            | DeviceError::PluginCreation(e)
            | DeviceError::InterfaceQuery(e)
            | DeviceError::Open(e)
            | DeviceError::Configuration(e)
            | DeviceError::ControlTransfer { source: e, .. } => e.code(),
            DeviceError::NoConfigurations => STATUS_NO_RESOURCES,
            DeviceError::BulkTransfer(e) => e.code(),
            DeviceError::NoInterface | DeviceError::IdentityMismatch { .. } => STATUS_ERROR,
        }
    }
}

impl From<BringUpError> for DeviceError {
    fn from(e: BringUpError) -> Self {
        match e {
            BringUpError::NoConfigurations => DeviceError::NoConfigurations,
            BringUpError::Configure(source) => DeviceError::Configuration(source),
            BringUpError::Control { step, source } => DeviceError::ControlTransfer { step, source },
        }
    }
}

impl From<DiscoveryError> for DeviceError {
    fn from(e: DiscoveryError) -> Self {
        match e {
            DiscoveryError::Enumerate(source) => DeviceError::Enumeration(source),
            DiscoveryError::NoInterface => DeviceError::NoInterface,
            DiscoveryError::Open(source) => DeviceError::Open(source),
            DiscoveryError::Endpoints(source) => DeviceError::InterfaceQuery(source),
        }
    }
}

/// An opened device; closed on drop, then released with the inner value.
pub struct OpenDevice<D: DeviceControl> {
    device: D,
}

impl<D: DeviceControl> OpenDevice<D> {
    /// Open `device`. On failure the device is released before returning.
    pub fn open(mut device: D) -> Result<Self, TransportError> {
        device.open()?;
        Ok(Self { device })
    }
}

impl<D: DeviceControl> Deref for OpenDevice<D> {
    type Target = D;

    fn deref(&self) -> &D {
        &self.device
    }
}

impl<D: DeviceControl> DerefMut for OpenDevice<D> {
    fn deref_mut(&mut self) -> &mut D {
        &mut self.device
    }
}

impl<D: DeviceControl> Drop for OpenDevice<D> {
    fn drop(&mut self) {
        if let Err(e) = self.device.close() {
            warn!(code = %format!("{:08x}", e.code()), "unable to close device: {}", e);
        }
    }
}

/// An opened interface; closed on drop, then released with the inner value.
pub struct OpenInterface<I: InterfaceControl> {
    interface: I,
}

impl<I: InterfaceControl> OpenInterface<I> {
    /// Open `interface`. On failure the interface is released before returning.
    pub fn open(mut interface: I) -> Result<Self, TransportError> {
        interface.open()?;
        Ok(Self { interface })
    }
}

impl<I: InterfaceControl> Deref for OpenInterface<I> {
    type Target = I;

    fn deref(&self) -> &I {
        &self.interface
    }
}

impl<I: InterfaceControl> DerefMut for OpenInterface<I> {
    fn deref_mut(&mut self) -> &mut I {
        &mut self.interface
    }
}

impl<I: InterfaceControl> Drop for OpenInterface<I> {
    fn drop(&mut self) {
        if let Err(e) = self.interface.close() {
            warn!(code = %format!("{:08x}", e.code()), "unable to close interface: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{DeviceProvider, MockCall, MockDeviceSpec, MockFault, MockUsb};

    #[test]
    fn test_identity_match() {
        let raw = IdentityMatch {
            vendor_id: 1351,
            product_id: 8193,
            release: Some(1),
        };
        assert!(raw.matches(&DeviceIdentity::new(1351, 8193, 1)));
        assert!(!raw.matches(&DeviceIdentity::new(1351, 8193, 2)));
        assert!(!raw.matches(&DeviceIdentity::new(1351, 4098, 1)));

        let any_release = IdentityMatch {
            release: None,
            ..raw
        };
        assert!(any_release.matches(&DeviceIdentity::new(1351, 8193, 7)));
    }

    #[test]
    fn test_open_device_closes_then_releases() {
        let usb = MockUsb::new();
        let device = usb.create_device(MockDeviceSpec::raw(1)).unwrap();
        {
            let _open = OpenDevice::open(device).unwrap();
        }
        assert_eq!(
            usb.calls_for(1),
            vec![
                MockCall::CreateDevice,
                MockCall::Open,
                MockCall::Close,
                MockCall::Release
            ]
        );
    }

    #[test]
    fn test_failed_open_releases_without_close() {
        let usb = MockUsb::new();
        let mut spec = MockDeviceSpec::raw(1);
        spec.fail_open = Some(MockFault::Disconnected);
        let device = usb.create_device(spec).unwrap();

        assert!(OpenDevice::open(device).is_err());
        assert_eq!(usb.count(1, &MockCall::Close), 0);
        assert_eq!(usb.count(1, &MockCall::Release), 1);
    }

    #[test]
    fn test_bring_up_error_maps_to_taxonomy() {
        let err: DeviceError = BringUpError::NoConfigurations.into();
        assert!(matches!(err, DeviceError::NoConfigurations));

        let err: DeviceError = BringUpError::Control {
            step: BringUpStep::Download(3),
            source: TransportError::Stall,
        }
        .into();
        assert!(matches!(
            err,
            DeviceError::ControlTransfer {
                step: BringUpStep::Download(3),
                ..
            }
        ));
    }
}
