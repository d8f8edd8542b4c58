//! Event system for output decoupling.
//!
//! The engines report progress through an observer so the CLI (and tests)
//! can consume it without coupling to the core logic.

use std::fmt;

use crate::device::{DeviceIdentity, IdentityClass};
use crate::engine::bringup::BringUpStep;
use crate::transport::{PipeProperties, PipeRef};

/// Log level for events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Transfer direction of a bulk test event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketDirection {
    Tx, // Host -> Device
    Rx, // Device -> Host
}

impl fmt::Display for PacketDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PacketDirection::Tx => write!(f, "TX"),
            PacketDirection::Rx => write!(f, "RX"),
        }
    }
}

/// Events emitted while routing, bringing up and testing devices.
#[derive(Debug, Clone)]
pub enum LoaderEvent {
    /// A matching device surfaced.
    DeviceAdded {
        class: IdentityClass,
        identity: DeviceIdentity,
    },
    /// Devices of a class went away.
    DeviceRemoved { class: IdentityClass, count: usize },
    /// A bring-up step started.
    Step { step: BringUpStep },
    /// Firmware download progress.
    Progress {
        record: usize,
        address: u16,
        length: u16,
        current: u64,
        total: u64,
    },
    /// Firmware is loaded and the CPU released from reset.
    BringUpComplete { records: usize, bytes: usize },
    /// The first interface of a bulk test device was opened.
    InterfaceFound {
        class: u8,
        subclass: u8,
        endpoints: u8,
    },
    /// One pipe of the open interface.
    Pipe {
        pipe: PipeRef,
        properties: PipeProperties,
    },
    /// Bulk test transfer.
    Bulk {
        direction: PacketDirection,
        pipe: PipeRef,
        length: usize,
        text: String,
    },
    /// Log message.
    Log { level: LogLevel, message: String },
    /// Error with numeric status.
    Error { code: u32, message: String },
}

/// Observer trait for receiving loader events.
pub trait LoaderObserver {
    /// Called when an event occurs.
    fn on_event(&self, event: &LoaderEvent);
}

/// No-op observer that discards all events.
pub struct NullObserver;

impl LoaderObserver for NullObserver {
    fn on_event(&self, _event: &LoaderEvent) {}
}

/// Observer that logs events using tracing.
pub struct TracingObserver;

impl LoaderObserver for TracingObserver {
    fn on_event(&self, event: &LoaderEvent) {
        match event {
            LoaderEvent::DeviceAdded { class, identity } => {
                tracing::info!(class = %class, identity = %identity, "Device added");
            }
            LoaderEvent::DeviceRemoved { class, count } => {
                tracing::info!(class = %class, count, "Device removed");
            }
            LoaderEvent::Step { step } => {
                tracing::debug!(step = %step, "Bring-up step");
            }
            LoaderEvent::Progress {
                record,
                address,
                length,
                current,
                total,
            } => {
                let pct = if *total > 0 {
                    (*current * 100) / *total
                } else {
                    0
                };
                tracing::trace!(
                    record,
                    address = %format!("0x{:04X}", address),
                    length,
                    progress = %format!("{}%", pct),
                    "Firmware record sent"
                );
            }
            LoaderEvent::BringUpComplete { records, bytes } => {
                tracing::info!(records, bytes, "Firmware downloaded, device will re-enumerate");
            }
            LoaderEvent::InterfaceFound {
                class,
                subclass,
                endpoints,
            } => {
                tracing::info!(class, subclass, endpoints, "Interface found");
            }
            LoaderEvent::Pipe { pipe, properties } => {
                tracing::info!(
                    "pipeRef {}: direction {}, transfer type {}, maxPacketSize {}",
                    pipe,
                    properties.direction,
                    properties.transfer_type,
                    properties.max_packet_size
                );
            }
            LoaderEvent::Bulk {
                direction: PacketDirection::Tx,
                length,
                text,
                ..
            } => {
                tracing::info!("Wrote \"{}\" ({} bytes) to bulk endpoint", text, length);
            }
            LoaderEvent::Bulk {
                direction: PacketDirection::Rx,
                length,
                text,
                ..
            } => {
                tracing::info!("Read \"{}\" ({} bytes) from bulk endpoint", text, length);
            }
            LoaderEvent::Log { level, message } => match level {
                LogLevel::Trace => tracing::trace!("{}", message),
                LogLevel::Debug => tracing::debug!("{}", message),
                LogLevel::Info => tracing::info!("{}", message),
                LogLevel::Warn => tracing::warn!("{}", message),
                LogLevel::Error => tracing::error!("{}", message),
            },
            LoaderEvent::Error { code, message } => {
                tracing::error!(code = %format!("{:08x}", code), "{}", message);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    /// Observer that keeps every event for later assertions.
    #[derive(Default)]
    pub struct RecordingObserver {
        events: Mutex<Vec<LoaderEvent>>,
    }

    impl RecordingObserver {
        pub fn events(&self) -> Vec<LoaderEvent> {
            self.events.lock().unwrap().clone()
        }

        pub fn received_text(&self) -> Vec<String> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    LoaderEvent::Bulk {
                        direction: PacketDirection::Rx,
                        text,
                        ..
                    } => Some(text),
                    _ => None,
                })
                .collect()
        }

        pub fn errors(&self) -> Vec<u32> {
            self.events()
                .into_iter()
                .filter_map(|e| match e {
                    LoaderEvent::Error { code, .. } => Some(code),
                    _ => None,
                })
                .collect()
        }
    }

    impl LoaderObserver for RecordingObserver {
        fn on_event(&self, event: &LoaderEvent) {
            self.events.lock().unwrap().push(event.clone());
        }
    }
}
