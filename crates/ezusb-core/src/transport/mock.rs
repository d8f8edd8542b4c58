//! Simulated USB transport for testing.
//!
//! Every primitive call lands in a shared log so tests can assert on the
//! exact sequence the engines issued, including close and release.

use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{self, LocalBoxFuture};

use super::traits::{
    DeviceControl, DeviceProvider, InterfaceControl, InterfaceFilter, PipeDirection,
    PipeProperties, PipeRef, PipeTransferType, TransferCompletion, TransportError,
};
use crate::device::DeviceIdentity;
use crate::protocol::VendorRequest;
use crate::protocol::constants::*;

/// One recorded primitive call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockCall {
    CreateDevice,
    Open,
    NumConfigurations,
    SetConfiguration(u8),
    ControlWrite { request: VendorRequest, data: Vec<u8> },
    FindInterfaces,
    InterfaceOpen,
    WritePipe { pipe: u8, data: Vec<u8> },
    ReadPipe { pipe: u8, len: usize },
    WritePipeAsync { pipe: u8, data: Vec<u8> },
    ReadPipeAsync { pipe: u8, len: usize },
    InterfaceClose,
    InterfaceRelease,
    Close,
    Release,
}

/// Fault injected into a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFault {
    Stall,
    Timeout,
    Disconnected,
    NotResponding,
}

impl MockFault {
    fn to_error(self) -> TransportError {
        match self {
            MockFault::Stall => TransportError::Stall,
            MockFault::Timeout => TransportError::Timeout { timeout_ms: 1000 },
            MockFault::Disconnected => TransportError::Disconnected,
            MockFault::NotResponding => TransportError::ControlFailed("not responding".into()),
        }
    }
}

/// How the simulated firmware answers a bulk read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EchoMode {
    /// One's complement of the last write (the bulk test firmware).
    Complement,
    /// The last write unchanged.
    Verbatim,
}

/// Simulated interface behaviour.
#[derive(Debug, Clone)]
pub struct MockInterfaceSpec {
    pub class: u8,
    pub subclass: u8,
    pub pipes: Vec<PipeProperties>,
    pub fail_open: Option<MockFault>,
    pub fail_write: Option<MockFault>,
    pub fail_read: Option<MockFault>,
    pub echo: EchoMode,
}

impl Default for MockInterfaceSpec {
    /// Vendor-specific interface with bulk EP1-7 OUT then EP1-7 IN, so pipe
    /// 2 is EP2 OUT and pipe 9 is EP2 IN.
    fn default() -> Self {
        let out = (1..=7u8).map(|n| bulk_pipe(PipeDirection::Out, n));
        let inp = (1..=7u8).map(|n| bulk_pipe(PipeDirection::In, 0x80 | n));
        Self {
            class: 0xFF,
            subclass: 0xFF,
            pipes: out.chain(inp).collect(),
            fail_open: None,
            fail_write: None,
            fail_read: None,
            echo: EchoMode::Complement,
        }
    }
}

fn bulk_pipe(direction: PipeDirection, address: u8) -> PipeProperties {
    PipeProperties {
        direction,
        transfer_type: PipeTransferType::Bulk,
        address,
        max_packet_size: 64,
        interval: 0,
    }
}

/// Simulated enumeration object; also the candidate type of [`MockUsb`].
#[derive(Debug, Clone)]
pub struct MockDeviceSpec {
    /// Distinguishes devices in the call log.
    pub serial: u32,
    pub identity: DeviceIdentity,
    pub configurations: u8,
    pub fail_plugin: bool,
    pub fail_identity: bool,
    pub fail_open: Option<MockFault>,
    pub fail_set_configuration: Option<MockFault>,
    /// Fail the n-th (zero-based) control write on this device.
    pub fail_control_write: Option<(usize, MockFault)>,
    pub interfaces: Vec<MockInterfaceSpec>,
}

impl MockDeviceSpec {
    /// Blank part as it enumerates before firmware load.
    pub fn raw(serial: u32) -> Self {
        Self::with_identity(
            serial,
            DeviceIdentity::new(ANCHOR_VENDOR_ID, ANCHOR_PRODUCT_ID, ANCHOR_RELEASE),
        )
    }

    /// Part running the bulk test firmware.
    pub fn bulk_test(serial: u32) -> Self {
        let mut spec = Self::with_identity(
            serial,
            DeviceIdentity::new(ANCHOR_VENDOR_ID, BULK_TEST_PRODUCT_ID, 0),
        );
        spec.interfaces = vec![MockInterfaceSpec::default()];
        spec
    }

    pub fn with_identity(serial: u32, identity: DeviceIdentity) -> Self {
        Self {
            serial,
            identity,
            configurations: 1,
            fail_plugin: false,
            fail_identity: false,
            fail_open: None,
            fail_set_configuration: None,
            fail_control_write: None,
            interfaces: Vec::new(),
        }
    }

    pub fn release(mut self, release: u16) -> Self {
        self.identity.release = release;
        self
    }

    pub fn failing_control_write(mut self, nth: usize, fault: MockFault) -> Self {
        self.fail_control_write = Some((nth, fault));
        self
    }
}

type CallLog = Arc<Mutex<Vec<(u32, MockCall)>>>;

/// Simulated device provider with a shared call log.
#[derive(Debug, Clone, Default)]
pub struct MockUsb {
    log: CallLog,
}

impl MockUsb {
    pub fn new() -> Self {
        Self::default()
    }

    /// All calls, tagged with the device serial.
    pub fn calls(&self) -> Vec<(u32, MockCall)> {
        self.log.lock().unwrap().clone()
    }

    /// Calls made on one device.
    pub fn calls_for(&self, serial: u32) -> Vec<MockCall> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == serial)
            .map(|(_, c)| c.clone())
            .collect()
    }

    /// Number of times `call` was made on one device.
    pub fn count(&self, serial: u32, call: &MockCall) -> usize {
        self.calls_for(serial).iter().filter(|c| *c == call).count()
    }

    /// Control writes made on one device, in order.
    pub fn control_writes(&self, serial: u32) -> Vec<(VendorRequest, Vec<u8>)> {
        self.calls_for(serial)
            .into_iter()
            .filter_map(|c| match c {
                MockCall::ControlWrite { request, data } => Some((request, data)),
                _ => None,
            })
            .collect()
    }
}

fn record(log: &CallLog, serial: u32, call: MockCall) {
    log.lock().unwrap().push((serial, call));
}

impl DeviceProvider for MockUsb {
    type Candidate = MockDeviceSpec;
    type Device = MockDevice;

    fn create_device(&self, candidate: MockDeviceSpec) -> Result<MockDevice, TransportError> {
        record(&self.log, candidate.serial, MockCall::CreateDevice);
        if candidate.fail_plugin {
            return Err(TransportError::OpenFailed("plugin unavailable".into()));
        }
        Ok(MockDevice {
            spec: candidate,
            log: Arc::clone(&self.log),
            opened: false,
            control_writes: 0,
        })
    }
}

/// Simulated device capability.
pub struct MockDevice {
    spec: MockDeviceSpec,
    log: CallLog,
    opened: bool,
    control_writes: usize,
}

impl MockDevice {
    fn record(&self, call: MockCall) {
        record(&self.log, self.spec.serial, call);
    }

    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.opened {
            Ok(())
        } else {
            Err(TransportError::NotOpen)
        }
    }
}

impl DeviceControl for MockDevice {
    type Interface = MockInterface;

    fn identity(&self) -> Result<DeviceIdentity, TransportError> {
        if self.spec.fail_identity {
            return Err(TransportError::Disconnected);
        }
        Ok(self.spec.identity)
    }

    fn open(&mut self) -> Result<(), TransportError> {
        self.record(MockCall::Open);
        if let Some(fault) = self.spec.fail_open {
            return Err(fault.to_error());
        }
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.record(MockCall::Close);
        self.ensure_open()?;
        self.opened = false;
        Ok(())
    }

    fn num_configurations(&self) -> Result<u8, TransportError> {
        self.record(MockCall::NumConfigurations);
        self.ensure_open()?;
        Ok(self.spec.configurations)
    }

    fn configuration_value(&self, index: u8) -> Result<u8, TransportError> {
        self.ensure_open()?;
        if index < self.spec.configurations {
            Ok(index + 1)
        } else {
            Err(TransportError::ConfigurationNotFound { index })
        }
    }

    fn set_configuration(&mut self, value: u8) -> Result<(), TransportError> {
        self.record(MockCall::SetConfiguration(value));
        self.ensure_open()?;
        match self.spec.fail_set_configuration {
            Some(fault) => Err(fault.to_error()),
            None => Ok(()),
        }
    }

    fn control_write(
        &mut self,
        request: VendorRequest,
        data: &[u8],
    ) -> Result<(), TransportError> {
        self.record(MockCall::ControlWrite {
            request,
            data: data.to_vec(),
        });
        self.ensure_open()?;
        let nth = self.control_writes;
        self.control_writes += 1;
        match self.spec.fail_control_write {
            Some((fail_at, fault)) if fail_at == nth => Err(fault.to_error()),
            _ => Ok(()),
        }
    }

    fn find_interfaces(
        &mut self,
        filter: &InterfaceFilter,
    ) -> Result<Vec<MockInterface>, TransportError> {
        self.record(MockCall::FindInterfaces);
        self.ensure_open()?;
        Ok(self
            .spec
            .interfaces
            .iter()
            .filter(|i| filter.matches(i.class, i.subclass, 0, 0))
            .map(|i| MockInterface {
                serial: self.spec.serial,
                spec: i.clone(),
                log: Arc::clone(&self.log),
                opened: false,
                last_write: Vec::new(),
            })
            .collect())
    }
}

impl Drop for MockDevice {
    fn drop(&mut self) {
        self.record(MockCall::Release);
    }
}

/// Simulated interface capability with a loop-back endpoint pair.
pub struct MockInterface {
    serial: u32,
    spec: MockInterfaceSpec,
    log: CallLog,
    opened: bool,
    last_write: Vec<u8>,
}

impl MockInterface {
    fn record(&self, call: MockCall) {
        record(&self.log, self.serial, call);
    }

    fn check_pipe(&self, pipe: PipeRef) -> Result<PipeProperties, TransportError> {
        if !self.opened {
            return Err(TransportError::NotOpen);
        }
        pipe.index()
            .and_then(|i| self.spec.pipes.get(i))
            .copied()
            .ok_or(TransportError::PipeNotFound { pipe })
    }

    fn write(&mut self, pipe: PipeRef, data: &[u8]) -> Result<usize, TransportError> {
        self.check_pipe(pipe)?;
        if let Some(fault) = self.spec.fail_write {
            return Err(fault.to_error());
        }
        self.last_write = data.to_vec();
        Ok(data.len())
    }

    fn echo(&self, pipe: PipeRef, len: usize) -> Result<Vec<u8>, TransportError> {
        self.check_pipe(pipe)?;
        if let Some(fault) = self.spec.fail_read {
            return Err(fault.to_error());
        }
        Ok(self
            .last_write
            .iter()
            .take(len)
            .map(|b| match self.spec.echo {
                EchoMode::Complement => !b,
                EchoMode::Verbatim => *b,
            })
            .collect())
    }
}

impl InterfaceControl for MockInterface {
    fn class(&self) -> u8 {
        self.spec.class
    }

    fn subclass(&self) -> u8 {
        self.spec.subclass
    }

    fn open(&mut self) -> Result<(), TransportError> {
        self.record(MockCall::InterfaceOpen);
        if let Some(fault) = self.spec.fail_open {
            return Err(fault.to_error());
        }
        self.opened = true;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.record(MockCall::InterfaceClose);
        if !self.opened {
            return Err(TransportError::NotOpen);
        }
        self.opened = false;
        Ok(())
    }

    fn num_endpoints(&self) -> Result<u8, TransportError> {
        if !self.opened {
            return Err(TransportError::NotOpen);
        }
        Ok(self.spec.pipes.len() as u8)
    }

    fn pipe_properties(&self, pipe: PipeRef) -> Result<PipeProperties, TransportError> {
        self.check_pipe(pipe)
    }

    fn write_pipe(&mut self, pipe: PipeRef, data: &[u8]) -> Result<usize, TransportError> {
        self.record(MockCall::WritePipe {
            pipe: pipe.0,
            data: data.to_vec(),
        });
        self.write(pipe, data)
    }

    fn read_pipe(&mut self, pipe: PipeRef, buf: &mut [u8]) -> Result<usize, TransportError> {
        self.record(MockCall::ReadPipe {
            pipe: pipe.0,
            len: buf.len(),
        });
        let data = self.echo(pipe, buf.len())?;
        buf[..data.len()].copy_from_slice(&data);
        Ok(data.len())
    }

    fn write_pipe_async(
        &mut self,
        pipe: PipeRef,
        data: Vec<u8>,
    ) -> LocalBoxFuture<'static, TransferCompletion> {
        self.record(MockCall::WritePipeAsync {
            pipe: pipe.0,
            data: data.clone(),
        });
        let completion = match self.write(pipe, &data) {
            Ok(n) => TransferCompletion::written(n),
            Err(e) => TransferCompletion::failed(e),
        };
        future::ready(completion).boxed_local()
    }

    fn read_pipe_async(
        &mut self,
        pipe: PipeRef,
        len: usize,
    ) -> LocalBoxFuture<'static, TransferCompletion> {
        self.record(MockCall::ReadPipeAsync { pipe: pipe.0, len });
        let completion = match self.echo(pipe, len) {
            Ok(data) => TransferCompletion::received(data),
            Err(e) => TransferCompletion::failed(e),
        };
        future::ready(completion).boxed_local()
    }
}

impl Drop for MockInterface {
    fn drop(&mut self) {
        self.record(MockCall::InterfaceRelease);
    }
}
