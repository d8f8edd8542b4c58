//! Interface and endpoint discovery on a bulk test device.

use thiserror::Error;
use tracing::{debug, error, warn};

use crate::device::OpenInterface;
use crate::events::{LoaderEvent, LoaderObserver};
use crate::transport::{
    DeviceControl, InterfaceControl, InterfaceFilter, PipeProperties, PipeRef, TransportError,
};

#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("unable to create interface iterator: {0}")]
    Enumerate(#[source] TransportError),

    #[error("no interface found")]
    NoInterface,

    #[error("unable to open interface: {0}")]
    Open(#[source] TransportError),

    #[error("unable to get number of endpoints: {0}")]
    Endpoints(#[source] TransportError),
}

/// The opened first interface with its enumerated pipes.
pub struct DiscoveredInterface<I: InterfaceControl> {
    pub interface: OpenInterface<I>,
    pub class: u8,
    pub subclass: u8,
    /// Properties for pipe references 1..=N, in order. Pipes whose
    /// properties could not be read are absent.
    pub pipes: Vec<(PipeRef, PipeProperties)>,
}

impl<I: InterfaceControl> DiscoveredInterface<I> {
    pub fn pipe(&self, pipe: PipeRef) -> Option<&PipeProperties> {
        self.pipes.iter().find(|(p, _)| *p == pipe).map(|(_, props)| props)
    }
}

/// Open the first interface of `device` and enumerate its pipes.
///
/// Only the first interface is used; the rest are released unopened.
pub fn find_interface<D, O>(
    device: &mut D,
    observer: &O,
) -> Result<DiscoveredInterface<D::Interface>, DiscoveryError>
where
    D: DeviceControl,
    O: LoaderObserver,
{
    let mut interfaces = device
        .find_interfaces(&InterfaceFilter::dont_care())
        .map_err(|e| {
            error!("unable to create interface iterator (err = {:08x})", e.code());
            DiscoveryError::Enumerate(e)
        })?;

    if interfaces.is_empty() {
        return Err(DiscoveryError::NoInterface);
    }
    let first = interfaces.swap_remove(0);
    drop(interfaces);

    let class = first.class();
    let subclass = first.subclass();
    debug!(class, subclass, "Interface found");

    let interface = OpenInterface::open(first).map_err(|e| {
        error!("unable to open interface (err = {:08x})", e.code());
        DiscoveryError::Open(e)
    })?;

    let endpoints = interface.num_endpoints().map_err(|e| {
        error!("unable to get number of endpoints (err = {:08x})", e.code());
        DiscoveryError::Endpoints(e)
    })?;

    observer.on_event(&LoaderEvent::InterfaceFound {
        class,
        subclass,
        endpoints,
    });

    let mut pipes = Vec::with_capacity(endpoints as usize);
    for n in 1..=endpoints {
        let pipe = PipeRef(n);
        match interface.pipe_properties(pipe) {
            Ok(properties) => {
                observer.on_event(&LoaderEvent::Pipe { pipe, properties });
                pipes.push((pipe, properties));
            }
            Err(e) => {
                warn!("unable to get properties of pipe {} (err = {:08x})", pipe, e.code());
            }
        }
    }

    Ok(DiscoveredInterface {
        interface,
        class,
        subclass,
        pipes,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::OpenDevice;
    use crate::events::NullObserver;
    use crate::events::testing::RecordingObserver;
    use crate::transport::{
        DeviceProvider, MockCall, MockDeviceSpec, MockFault, MockInterfaceSpec, MockUsb,
        PipeDirection,
    };

    #[test]
    fn test_first_interface_opened_and_pipes_listed() {
        let usb = MockUsb::new();
        let observer = RecordingObserver::default();
        let mut dev = OpenDevice::open(usb.create_device(MockDeviceSpec::bulk_test(1)).unwrap())
            .unwrap();

        let found = find_interface(&mut *dev, &observer).unwrap();
        assert_eq!((found.class, found.subclass), (0xFF, 0xFF));
        assert_eq!(found.pipes.len(), 14);
        assert_eq!(found.pipe(PipeRef(2)).unwrap().direction, PipeDirection::Out);
        assert_eq!(found.pipe(PipeRef(9)).unwrap().direction, PipeDirection::In);

        let pipe_events = observer
            .events()
            .iter()
            .filter(|e| matches!(e, LoaderEvent::Pipe { .. }))
            .count();
        assert_eq!(pipe_events, 14);
    }

    #[test]
    fn test_only_first_interface_used() {
        let usb = MockUsb::new();
        let mut spec = MockDeviceSpec::bulk_test(1);
        spec.interfaces.push(MockInterfaceSpec::default());
        let mut dev = OpenDevice::open(usb.create_device(spec).unwrap()).unwrap();

        let found = find_interface(&mut *dev, &NullObserver).unwrap();
        assert_eq!(usb.count(1, &MockCall::InterfaceOpen), 1);
        // the second interface is released without ever being opened
        assert_eq!(usb.count(1, &MockCall::InterfaceRelease), 1);

        drop(found);
        assert_eq!(usb.count(1, &MockCall::InterfaceClose), 1);
        assert_eq!(usb.count(1, &MockCall::InterfaceRelease), 2);
    }

    #[test]
    fn test_no_interface() {
        let usb = MockUsb::new();
        let mut dev = OpenDevice::open(usb.create_device(MockDeviceSpec::raw(1)).unwrap())
            .unwrap();
        assert!(matches!(
            find_interface(&mut *dev, &NullObserver),
            Err(DiscoveryError::NoInterface)
        ));
    }

    #[test]
    fn test_open_failure_releases_interface() {
        let usb = MockUsb::new();
        let mut spec = MockDeviceSpec::bulk_test(1);
        spec.interfaces[0].fail_open = Some(MockFault::NotResponding);
        let mut dev = OpenDevice::open(usb.create_device(spec).unwrap()).unwrap();

        assert!(matches!(
            find_interface(&mut *dev, &NullObserver),
            Err(DiscoveryError::Open(_))
        ));
        assert_eq!(usb.count(1, &MockCall::InterfaceClose), 0);
        assert_eq!(usb.count(1, &MockCall::InterfaceRelease), 1);
    }
}
