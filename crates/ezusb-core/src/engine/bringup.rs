//! Device bring-up: configure, hold the 8051 in reset, download the
//! firmware image, release reset.
//!
//! After a successful run the part reboots into the new firmware and
//! re-enumerates with the bulk test product ID.

use std::fmt;

use thiserror::Error;
use tracing::{debug, error, info, instrument};

use crate::events::{LoaderEvent, LoaderObserver};
use crate::payload::FirmwareImage;
use crate::protocol::VendorRequest;
use crate::protocol::constants::{CPU_RESET_ASSERT, CPU_RESET_RELEASE};
use crate::transport::{DeviceControl, TransportError};

/// Bring-up steps, in the order they always run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpStep {
    Configure,
    AssertReset,
    /// Download of the record at this index.
    Download(usize),
    DeassertReset,
}

impl fmt::Display for BringUpStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BringUpStep::Configure => write!(f, "configure"),
            BringUpStep::AssertReset => write!(f, "assert reset"),
            BringUpStep::Download(index) => write!(f, "download {}", index),
            BringUpStep::DeassertReset => write!(f, "de-assert reset"),
        }
    }
}

#[derive(Error, Debug)]
pub enum BringUpError {
    #[error("device reports no configurations")]
    NoConfigurations,

    #[error("unable to configure device: {0}")]
    Configure(#[source] TransportError),

    #[error("AnchorWrite {step} returned err 0x{:08x}", .source.code())]
    Control {
        step: BringUpStep,
        #[source]
        source: TransportError,
    },
}

impl BringUpError {
    /// Step that failed.
    pub fn step(&self) -> BringUpStep {
        match self {
            BringUpError::NoConfigurations | BringUpError::Configure(_) => BringUpStep::Configure,
            BringUpError::Control { step, .. } => *step,
        }
    }
}

/// Outcome of a completed bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BringUpSummary {
    pub configuration: u8,
    pub records: usize,
    pub bytes: usize,
}

/// Select the first configuration. Returns the applied configuration value.
pub fn configure<D: DeviceControl>(device: &mut D) -> Result<u8, BringUpError> {
    let count = device
        .num_configurations()
        .map_err(BringUpError::Configure)?;
    if count == 0 {
        return Err(BringUpError::NoConfigurations);
    }

    let value = device.configuration_value(0).map_err(|e| {
        error!("unable to get config descriptor for index 0 (err = {:08x})", e.code());
        BringUpError::Configure(e)
    })?;

    device.set_configuration(value).map_err(|e| {
        error!("unable to set configuration to value {} (err={:08x})", value, e.code());
        BringUpError::Configure(e)
    })?;

    debug!(configuration = value, "Configuration set");
    Ok(value)
}

/// Write `count` bytes at `address` in 8051 memory.
pub fn anchor_write<D: DeviceControl>(
    device: &mut D,
    address: u16,
    data: &[u8],
) -> Result<(), TransportError> {
    device.control_write(VendorRequest::anchor_write(address), data)
}

/// Hold (`true`) or release (`false`) the 8051 reset line.
pub fn set_cpu_reset<D: DeviceControl>(device: &mut D, hold: bool) -> Result<(), TransportError> {
    let value = if hold {
        CPU_RESET_ASSERT
    } else {
        CPU_RESET_RELEASE
    };
    let request = VendorRequest::cpu_reset();
    device.control_write(request, &[value])
}

/// Send every data record in order, stopping at the first failure.
///
/// Returns `(records, bytes)` sent.
pub fn download<D: DeviceControl, O: LoaderObserver>(
    device: &mut D,
    image: &FirmwareImage,
    observer: &O,
) -> Result<(usize, usize), BringUpError> {
    let total = image.payload_size() as u64;
    let mut sent = 0usize;
    let mut records = 0usize;

    for (index, record) in image.data_records().enumerate() {
        anchor_write(device, record.address, &record.data).map_err(|source| {
            error!("AnchorWrite download {} returned err 0x{:x}!", index, source.code());
            BringUpError::Control {
                step: BringUpStep::Download(index),
                source,
            }
        })?;

        sent += record.data.len();
        records += 1;
        observer.on_event(&LoaderEvent::Progress {
            record: index,
            address: record.address,
            length: record.len(),
            current: sent as u64,
            total,
        });
    }

    Ok((records, sent))
}

/// Run the full bring-up sequence on an opened raw device.
///
/// Steps always run Configure, AssertReset, Download, DeassertReset and
/// stop at the first failure. A failed de-assert is logged and returned but
/// the download is still considered attempted.
#[instrument(level = "info", skip_all)]
pub fn bring_up<D: DeviceControl, O: LoaderObserver>(
    device: &mut D,
    image: &FirmwareImage,
    observer: &O,
) -> Result<BringUpSummary, BringUpError> {
    observer.on_event(&LoaderEvent::Step {
        step: BringUpStep::Configure,
    });
    let configuration = configure(device)?;

    observer.on_event(&LoaderEvent::Step {
        step: BringUpStep::AssertReset,
    });
    set_cpu_reset(device, true).map_err(|source| {
        error!("AnchorWrite reset returned err 0x{:x}!", source.code());
        BringUpError::Control {
            step: BringUpStep::AssertReset,
            source,
        }
    })?;

    let (records, bytes) = download(device, image, observer)?;

    observer.on_event(&LoaderEvent::Step {
        step: BringUpStep::DeassertReset,
    });
    set_cpu_reset(device, false).map_err(|source| {
        error!("AnchorWrite run returned err 0x{:x}!", source.code());
        BringUpError::Control {
            step: BringUpStep::DeassertReset,
            source,
        }
    })?;

    info!(records, bytes, "Firmware download complete");
    observer.on_event(&LoaderEvent::BringUpComplete { records, bytes });

    Ok(BringUpSummary {
        configuration,
        records,
        bytes,
    })
}
