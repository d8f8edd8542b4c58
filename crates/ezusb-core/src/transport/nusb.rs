//! nusb-based transfer primitives.

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{self, LocalBoxFuture};
use nusb::descriptors::TransferType;
use nusb::transfer::{
    Buffer, Bulk, ControlOut, ControlType, Direction, In, Out, Recipient, TransferError,
};
use nusb::{DeviceInfo, Interface, MaybeFuture};
use tracing::{debug, info, instrument, trace};

use super::traits::{
    DeviceControl, DeviceProvider, InterfaceControl, InterfaceFilter, PipeDirection,
    PipeProperties, PipeRef, PipeTransferType, TransferCompletion, TransportError,
};
use crate::device::DeviceIdentity;
use crate::protocol::VendorRequest;

/// Map an endpoint reader/writer error, keeping timeouts distinct.
fn stream_error(e: std::io::Error, timeout: Duration) -> TransportError {
    match e.kind() {
        ErrorKind::TimedOut => TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        },
        _ => TransportError::Io(e),
    }
}

impl From<TransferError> for TransportError {
    fn from(e: TransferError) -> Self {
        match e {
            TransferError::Stall => TransportError::Stall,
            TransferError::Disconnected => TransportError::Disconnected,
            TransferError::Cancelled => TransportError::Aborted,
            other => TransportError::ControlFailed(other.to_string()),
        }
    }
}

/// Creates [`NusbDevice`]s from hotplug / enumeration results.
#[derive(Debug, Clone)]
pub struct NusbProvider {
    timeout: Duration,
}

impl NusbProvider {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl DeviceProvider for NusbProvider {
    type Candidate = DeviceInfo;
    type Device = NusbDevice;

    fn create_device(&self, candidate: DeviceInfo) -> Result<NusbDevice, TransportError> {
        Ok(NusbDevice {
            info: candidate,
            device: None,
            timeout: self.timeout,
        })
    }
}

/// One USB device, opened on demand.
pub struct NusbDevice {
    info: DeviceInfo,
    device: Option<nusb::Device>,
    timeout: Duration,
}

impl NusbDevice {
    fn device(&self) -> Result<&nusb::Device, TransportError> {
        self.device.as_ref().ok_or(TransportError::NotOpen)
    }
}

impl DeviceControl for NusbDevice {
    type Interface = NusbInterface;

    fn identity(&self) -> Result<DeviceIdentity, TransportError> {
        Ok(DeviceIdentity::new(
            self.info.vendor_id(),
            self.info.product_id(),
            self.info.device_version(),
        ))
    }

    #[instrument(level = "debug", skip(self), fields(id = ?self.info.id()))]
    fn open(&mut self) -> Result<(), TransportError> {
        if self.device.is_some() {
            return Ok(());
        }
        let device = self
            .info
            .open()
            .wait()
            .map_err(|e| TransportError::OpenFailed(e.to_string()))?;
        self.device = Some(device);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.device.take().map(drop).ok_or(TransportError::NotOpen)
    }

    fn num_configurations(&self) -> Result<u8, TransportError> {
        Ok(self.device()?.configurations().count() as u8)
    }

    fn configuration_value(&self, index: u8) -> Result<u8, TransportError> {
        self.device()?
            .configurations()
            .nth(index as usize)
            .map(|c| c.configuration_value())
            .ok_or(TransportError::ConfigurationNotFound { index })
    }

    fn set_configuration(&mut self, value: u8) -> Result<(), TransportError> {
        self.device()?
            .set_configuration(value)
            .wait()
            .map_err(|e| TransportError::ConfigurationFailed(e.to_string()))
    }

    #[instrument(level = "trace", skip(self, data), fields(len = data.len()))]
    fn control_write(
        &mut self,
        request: VendorRequest,
        data: &[u8],
    ) -> Result<(), TransportError> {
        trace!(setup = ?request.setup_packet(data.len() as u16), "Control OUT");
        self.device()?
            .control_out(
                ControlOut {
                    control_type: ControlType::Vendor,
                    recipient: Recipient::Device,
                    request: request.request,
                    value: request.value,
                    index: request.index,
                    data,
                },
                self.timeout,
            )
            .wait()?;
        Ok(())
    }

    fn find_interfaces(
        &mut self,
        filter: &InterfaceFilter,
    ) -> Result<Vec<NusbInterface>, TransportError> {
        let device = self.device()?.clone();
        let config = device
            .active_configuration()
            .map_err(|e| TransportError::ConfigurationFailed(e.to_string()))?;

        let mut found = Vec::new();
        for group in config.interfaces() {
            for alt in group.alt_settings() {
                if !filter.matches(
                    alt.class(),
                    alt.subclass(),
                    alt.protocol(),
                    alt.alternate_setting(),
                ) {
                    continue;
                }

                let pipes = alt
                    .endpoints()
                    .map(|ep| PipeProperties {
                        direction: match ep.direction() {
                            Direction::In => PipeDirection::In,
                            Direction::Out => PipeDirection::Out,
                        },
                        transfer_type: match ep.transfer_type() {
                            TransferType::Control => PipeTransferType::Control,
                            TransferType::Isochronous => PipeTransferType::Isochronous,
                            TransferType::Bulk => PipeTransferType::Bulk,
                            TransferType::Interrupt => PipeTransferType::Interrupt,
                        },
                        address: ep.address(),
                        max_packet_size: ep.max_packet_size() as u16,
                        interval: ep.interval(),
                    })
                    .collect();

                found.push(NusbInterface {
                    device: device.clone(),
                    timeout: self.timeout,
                    number: alt.interface_number(),
                    alt_setting: alt.alternate_setting(),
                    class: alt.class(),
                    subclass: alt.subclass(),
                    pipes,
                    interface: None,
                });
            }
        }

        debug!(count = found.len(), "Enumerated interfaces");
        Ok(found)
    }
}

/// One interface alternate setting, claimed on open.
pub struct NusbInterface {
    device: nusb::Device,
    /// Bound on each blocking bulk transfer.
    timeout: Duration,
    number: u8,
    alt_setting: u8,
    class: u8,
    subclass: u8,
    pipes: Vec<PipeProperties>,
    interface: Option<Interface>,
}

impl NusbInterface {
    fn interface(&self) -> Result<&Interface, TransportError> {
        self.interface.as_ref().ok_or(TransportError::NotOpen)
    }

    fn pipe(&self, pipe: PipeRef) -> Result<&PipeProperties, TransportError> {
        pipe.index()
            .and_then(|i| self.pipes.get(i))
            .ok_or(TransportError::PipeNotFound { pipe })
    }
}

impl InterfaceControl for NusbInterface {
    fn class(&self) -> u8 {
        self.class
    }

    fn subclass(&self) -> u8 {
        self.subclass
    }

    #[instrument(
        level = "debug",
        skip(self),
        fields(interface = self.number, alt = self.alt_setting)
    )]
    fn open(&mut self) -> Result<(), TransportError> {
        let interface = self.device.claim_interface(self.number).wait().map_err(|e| {
            TransportError::ClaimInterfaceFailed {
                interface: self.number,
                message: e.to_string(),
            }
        })?;

        if self.alt_setting != 0 {
            interface
                .set_alt_setting(self.alt_setting)
                .wait()
                .map_err(|e| TransportError::ClaimInterfaceFailed {
                    interface: self.number,
                    message: e.to_string(),
                })?;
        }

        info!(interface = self.number, "Interface opened");
        self.interface = Some(interface);
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        self.interface.take().map(drop).ok_or(TransportError::NotOpen)
    }

    fn num_endpoints(&self) -> Result<u8, TransportError> {
        self.interface()?;
        Ok(self.pipes.len() as u8)
    }

    fn pipe_properties(&self, pipe: PipeRef) -> Result<PipeProperties, TransportError> {
        self.interface()?;
        self.pipe(pipe).copied()
    }

    #[instrument(skip(self, data), fields(pipe = pipe.0, len = data.len()))]
    fn write_pipe(&mut self, pipe: PipeRef, data: &[u8]) -> Result<usize, TransportError> {
        let address = self.pipe(pipe)?.address;
        let ep = self
            .interface()?
            .endpoint::<Bulk, Out>(address)
            .map_err(|e| TransportError::WriteFailed(e.to_string()))?;

        let mut writer = ep.writer(4096).with_write_timeout(self.timeout);
        writer
            .write_all(data)
            .map_err(|e| stream_error(e, self.timeout))?;
        writer
            .flush()
            .map_err(|e| stream_error(e, self.timeout))?;

        debug!(bytes_written = data.len(), "Write complete");
        Ok(data.len())
    }

    #[instrument(skip(self, buf), fields(pipe = pipe.0, max_len = buf.len()))]
    fn read_pipe(&mut self, pipe: PipeRef, buf: &mut [u8]) -> Result<usize, TransportError> {
        let address = self.pipe(pipe)?.address;
        let ep = self
            .interface()?
            .endpoint::<Bulk, In>(address)
            .map_err(|e| TransportError::ReadFailed(e.to_string()))?;

        let mut reader = ep.reader(4096).with_read_timeout(self.timeout);
        let n = reader
            .read(buf)
            .map_err(|e| stream_error(e, self.timeout))?;

        debug!(bytes_read = n, "Read complete");
        Ok(n)
    }

    fn write_pipe_async(
        &mut self,
        pipe: PipeRef,
        data: Vec<u8>,
    ) -> LocalBoxFuture<'static, TransferCompletion> {
        let endpoint = self.pipe(pipe).map(|p| p.address).and_then(|address| {
            self.interface()?
                .endpoint::<Bulk, Out>(address)
                .map_err(|e| TransportError::WriteFailed(e.to_string()))
        });
        let mut ep = match endpoint {
            Ok(ep) => ep,
            Err(e) => return future::ready(TransferCompletion::failed(e)).boxed_local(),
        };

        async move {
            ep.submit(Buffer::from(data));
            let completion = ep.next_complete().await;
            match completion.status {
                Ok(()) => TransferCompletion::written(completion.actual_len),
                Err(e) => TransferCompletion::failed(e.into()),
            }
        }
        .boxed_local()
    }

    fn read_pipe_async(
        &mut self,
        pipe: PipeRef,
        len: usize,
    ) -> LocalBoxFuture<'static, TransferCompletion> {
        let endpoint = self.pipe(pipe).map(|p| p.address).and_then(|address| {
            self.interface()?
                .endpoint::<Bulk, In>(address)
                .map_err(|e| TransportError::ReadFailed(e.to_string()))
        });
        let mut ep = match endpoint {
            Ok(ep) => ep,
            Err(e) => return future::ready(TransferCompletion::failed(e)).boxed_local(),
        };

        // IN requests are issued in whole packets.
        let packet = ep.max_packet_size().max(1);
        let requested = len.div_ceil(packet).max(1) * packet;

        async move {
            let buffer = ep.allocate(requested);
            ep.submit(buffer);
            let completion = ep.next_complete().await;
            match completion.status {
                Ok(()) => TransferCompletion::received(
                    completion.buffer.iter().take(len).copied().collect(),
                ),
                Err(e) => TransferCompletion::failed(e.into()),
            }
        }
        .boxed_local()
    }
}
