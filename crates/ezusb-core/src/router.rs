//! Device event router.
//!
//! Receives batches of arriving and departing devices for the two identity
//! classes and runs each arriving device through its class action: firmware
//! bring-up for raw parts, discovery and the bulk test for parts running the
//! test firmware. Devices in a batch are handled strictly one after
//! another; a failure only ends that device's sequence.

use std::sync::Arc;

use futures::FutureExt;
use futures::future::LocalBoxFuture;
use tracing::{debug, error, instrument};

use crate::device::{DeviceError, IdentityClass, IdentityMatch, OpenDevice};
use crate::engine::bringup::{bring_up, configure};
use crate::engine::bulk::{
    BulkPipes, BulkTestError, BulkTestReport, TestMode, run_async, run_sync,
};
use crate::engine::discovery::find_interface;
use crate::events::{LoaderEvent, LoaderObserver, LogLevel};
use crate::payload::FirmwareImage;
use crate::protocol::constants::{
    ANCHOR_PRODUCT_ID, ANCHOR_RELEASE, ANCHOR_VENDOR_ID, BULK_TEST_PRODUCT_ID, TEST_MESSAGE,
};
use crate::transport::{DeviceControl, DeviceProvider};

/// Async bulk test left running after its device was handled.
pub type ScheduledTest = LocalBoxFuture<'static, Result<BulkTestReport, BulkTestError>>;

/// Expected identities of both classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IdentityTable {
    pub raw: IdentityMatch,
    pub tested: IdentityMatch,
}

impl IdentityTable {
    /// Raw parts must match release exactly; tested parts match any release.
    pub fn new(
        vendor_id: u16,
        product_id: u16,
        bulk_test_product_id: u16,
        raw_release: u16,
    ) -> Self {
        Self {
            raw: IdentityMatch {
                vendor_id,
                product_id,
                release: Some(raw_release),
            },
            tested: IdentityMatch {
                vendor_id,
                product_id: bulk_test_product_id,
                release: None,
            },
        }
    }

    pub fn filter(&self, class: IdentityClass) -> IdentityMatch {
        match class {
            IdentityClass::Raw => self.raw,
            IdentityClass::Tested => self.tested,
        }
    }
}

impl Default for IdentityTable {
    fn default() -> Self {
        Self::new(
            ANCHOR_VENDOR_ID,
            ANCHOR_PRODUCT_ID,
            BULK_TEST_PRODUCT_ID,
            ANCHOR_RELEASE,
        )
    }
}

/// Per-class position.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ClassPhase {
    /// Waiting for the next batch.
    #[default]
    Unseen,
    /// Draining a batch.
    Processing,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassStats {
    pub phase: ClassPhase,
    pub devices_seen: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Async bulk tests handed to the event loop; their outcome is
    /// counted there.
    pub scheduled: usize,
    pub removed: usize,
}

/// Outcome of draining one arrival batch.
pub struct DrainReport {
    pub class: IdentityClass,
    pub processed: usize,
    /// Devices fully handled within the batch.
    pub succeeded: usize,
    pub failed: usize,
    /// Async bulk tests still in flight; the caller schedules them. A
    /// device whose test is here counts as neither succeeded nor failed.
    pub scheduled: Vec<ScheduledTest>,
}

impl std::fmt::Debug for DrainReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DrainReport")
            .field("class", &self.class)
            .field("processed", &self.processed)
            .field("succeeded", &self.succeeded)
            .field("failed", &self.failed)
            .field("scheduled", &self.scheduled.len())
            .finish()
    }
}

pub struct DeviceRouter<P: DeviceProvider, O: LoaderObserver> {
    provider: P,
    observer: Arc<O>,
    identities: IdentityTable,
    firmware: Arc<FirmwareImage>,
    mode: TestMode,
    pipes: BulkPipes,
    raw: ClassStats,
    tested: ClassStats,
}

impl<P, O> DeviceRouter<P, O>
where
    P: DeviceProvider,
    O: LoaderObserver + 'static,
{
    pub fn new(
        provider: P,
        identities: IdentityTable,
        firmware: Arc<FirmwareImage>,
        observer: Arc<O>,
    ) -> Self {
        Self {
            provider,
            observer,
            identities,
            firmware,
            mode: TestMode::from_build(),
            pipes: BulkPipes::default(),
            raw: ClassStats::default(),
            tested: ClassStats::default(),
        }
    }

    pub fn with_test_mode(mut self, mode: TestMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn identities(&self) -> &IdentityTable {
        &self.identities
    }

    pub fn test_mode(&self) -> TestMode {
        self.mode
    }

    pub fn stats(&self, class: IdentityClass) -> &ClassStats {
        match class {
            IdentityClass::Raw => &self.raw,
            IdentityClass::Tested => &self.tested,
        }
    }

    pub fn phase(&self, class: IdentityClass) -> ClassPhase {
        self.stats(class).phase
    }

    fn stats_mut(&mut self, class: IdentityClass) -> &mut ClassStats {
        match class {
            IdentityClass::Raw => &mut self.raw,
            IdentityClass::Tested => &mut self.tested,
        }
    }

    /// Drain an arrival batch, handling every device in order.
    #[instrument(level = "debug", skip(self, devices), fields(class = %class))]
    pub fn on_added<I>(&mut self, class: IdentityClass, devices: I) -> DrainReport
    where
        I: IntoIterator<Item = P::Candidate>,
    {
        self.stats_mut(class).phase = ClassPhase::Processing;
        let mut report = DrainReport {
            class,
            processed: 0,
            succeeded: 0,
            failed: 0,
            scheduled: Vec::new(),
        };

        for candidate in devices {
            report.processed += 1;
            match self.handle_device(class, candidate) {
                Ok(Some(test)) => report.scheduled.push(test),
                Ok(None) => report.succeeded += 1,
                Err(e) => {
                    error!(code = %format!("{:08x}", e.code()), "{} device: {}", class, e);
                    self.observer.on_event(&LoaderEvent::Error {
                        code: e.code(),
                        message: e.to_string(),
                    });
                    report.failed += 1;
                }
            }
        }

        let stats = self.stats_mut(class);
        stats.devices_seen += report.processed;
        stats.succeeded += report.succeeded;
        stats.failed += report.failed;
        stats.scheduled += report.scheduled.len();
        stats.phase = ClassPhase::Unseen;

        debug!(
            processed = report.processed,
            failed = report.failed,
            scheduled = report.scheduled.len(),
            "Arrival batch drained"
        );
        report
    }

    /// Drain a removal batch. Nothing is held per device, so this only
    /// counts.
    pub fn on_removed<I>(&mut self, class: IdentityClass, devices: I) -> usize
    where
        I: IntoIterator,
    {
        let count = devices.into_iter().count();
        self.stats_mut(class).removed += count;
        if count > 0 {
            self.observer
                .on_event(&LoaderEvent::DeviceRemoved { class, count });
        }
        count
    }

    fn handle_device(
        &self,
        class: IdentityClass,
        candidate: P::Candidate,
    ) -> Result<Option<ScheduledTest>, DeviceError> {
        // the candidate is consumed here
        let device = self
            .provider
            .create_device(candidate)
            .map_err(DeviceError::PluginCreation)?;

        let identity = device.identity().map_err(DeviceError::InterfaceQuery)?;
        let expected = self.identities.filter(class);
        if !expected.matches(&identity) {
            return Err(DeviceError::IdentityMismatch {
                expected,
                found: identity,
            });
        }
        self.observer
            .on_event(&LoaderEvent::DeviceAdded { class, identity });

        let mut device = OpenDevice::open(device).map_err(DeviceError::Open)?;

        match class {
            IdentityClass::Raw => {
                bring_up(&mut *device, &self.firmware, &*self.observer)?;
                self.observer.on_event(&LoaderEvent::Log {
                    level: LogLevel::Info,
                    message: format!("{} loaded, waiting for re-enumeration", identity),
                });
                Ok(None)
            }
            IdentityClass::Tested => {
                configure(&mut *device)?;
                let found = find_interface(&mut *device, &*self.observer)?;
                match self.mode {
                    TestMode::Sync => {
                        let mut interface = found.interface;
                        run_sync(&mut *interface, self.pipes, TEST_MESSAGE, &*self.observer)?;
                        Ok(None)
                    }
                    TestMode::Async => {
                        let test = run_async(
                            found.interface,
                            self.pipes,
                            TEST_MESSAGE.to_vec(),
                            Arc::clone(&self.observer),
                        );
                        Ok(Some(test.boxed_local()))
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::NullObserver;
    use crate::events::testing::RecordingObserver;
    use crate::payload::FirmwareRecord;
    use crate::protocol::constants::{K8051_USBCS, STATUS_NOT_RESPONDING, STATUS_TIMEOUT};
    use crate::transport::{
        MockCall, MockDeviceSpec, MockFault, MockInterfaceSpec, MockUsb, TransportError,
    };

    fn firmware() -> Arc<FirmwareImage> {
        Arc::new(FirmwareImage::from_records(vec![
            FirmwareRecord::data(0x0000, vec![0x02, 0x00, 0x4E]),
            FirmwareRecord::data(0x0030, vec![0x02, 0x33]),
            FirmwareRecord::end_of_file(),
        ]))
    }

    fn router<O: LoaderObserver + 'static>(
        usb: &MockUsb,
        observer: Arc<O>,
        mode: TestMode,
    ) -> DeviceRouter<MockUsb, O> {
        DeviceRouter::new(usb.clone(), IdentityTable::default(), firmware(), observer)
            .with_test_mode(mode)
    }

    #[test]
    fn test_raw_device_full_sequence() {
        let usb = MockUsb::new();
        let mut router = router(&usb, Arc::new(NullObserver), TestMode::Sync);

        let report = router.on_added(IdentityClass::Raw, vec![MockDeviceSpec::raw(1)]);
        assert_eq!((report.processed, report.succeeded, report.failed), (1, 1, 0));

        let calls = usb.calls_for(1);
        assert_eq!(
            &calls[..4],
            &[
                MockCall::CreateDevice,
                MockCall::Open,
                MockCall::NumConfigurations,
                MockCall::SetConfiguration(1),
            ]
        );
        let writes = usb.control_writes(1);
        assert_eq!(writes.len(), 4);
        assert_eq!((writes[0].0.value, writes[0].1.as_slice()), (K8051_USBCS, &[1u8][..]));
        assert_eq!(writes[1].0.value, 0x0000);
        assert_eq!(writes[2].0.value, 0x0030);
        assert_eq!((writes[3].0.value, writes[3].1.as_slice()), (K8051_USBCS, &[0u8][..]));
        assert_eq!(&calls[calls.len() - 2..], &[MockCall::Close, MockCall::Release]);
        assert_eq!(usb.count(1, &MockCall::Close), 1);
        assert_eq!(usb.count(1, &MockCall::Release), 1);
    }

    #[test]
    fn test_wrong_release_rejected_before_open() {
        let usb = MockUsb::new();
        let observer = Arc::new(RecordingObserver::default());
        let mut router = router(&usb, Arc::clone(&observer), TestMode::Sync);

        let report = router.on_added(IdentityClass::Raw, vec![MockDeviceSpec::raw(1).release(2)]);
        assert_eq!(report.failed, 1);
        assert_eq!(usb.calls_for(1), vec![MockCall::CreateDevice, MockCall::Release]);
        assert_eq!(observer.errors().len(), 1);
    }

    #[test]
    fn test_fan_out_continues_past_failure() {
        let usb = MockUsb::new();
        let mut router = router(&usb, Arc::new(NullObserver), TestMode::Sync);

        let mut broken = MockDeviceSpec::raw(2);
        broken.fail_open = Some(MockFault::NotResponding);
        let mut no_config = MockDeviceSpec::raw(3);
        no_config.configurations = 0;
        let batch = vec![
            MockDeviceSpec::raw(1),
            broken,
            no_config,
            MockDeviceSpec::raw(4).failing_control_write(1, MockFault::Stall),
            MockDeviceSpec::raw(5),
        ];

        let report = router.on_added(IdentityClass::Raw, batch);
        assert_eq!(report.processed, 5);
        assert_eq!(report.succeeded, 2);
        assert_eq!(report.failed, 3);

        for serial in 1..=5 {
            assert_eq!(usb.count(serial, &MockCall::CreateDevice), 1);
            assert_eq!(usb.count(serial, &MockCall::Release), 1);
        }
        // a device that never opened is never closed
        assert_eq!(usb.count(2, &MockCall::Close), 0);
        assert_eq!(usb.count(3, &MockCall::Close), 1);
        assert_eq!(usb.control_writes(4).len(), 2);
        assert_eq!(usb.control_writes(5).len(), 4);
    }

    #[test]
    fn test_plugin_failure_counts_as_failed() {
        let usb = MockUsb::new();
        let mut router = router(&usb, Arc::new(NullObserver), TestMode::Sync);
        let mut spec = MockDeviceSpec::raw(1);
        spec.fail_plugin = true;

        let report = router.on_added(IdentityClass::Raw, vec![spec, MockDeviceSpec::raw(2)]);
        assert_eq!((report.succeeded, report.failed), (1, 1));
        assert_eq!(usb.calls_for(1), vec![MockCall::CreateDevice]);
    }

    #[test]
    fn test_tested_device_sync() {
        let usb = MockUsb::new();
        let observer = Arc::new(RecordingObserver::default());
        let mut router = router(&usb, Arc::clone(&observer), TestMode::Sync);

        let report = router.on_added(IdentityClass::Tested, vec![MockDeviceSpec::bulk_test(7)]);
        assert_eq!(report.succeeded, 1);
        assert!(report.scheduled.is_empty());
        assert_eq!(observer.received_text(), vec!["Bulk I/O Test".to_string()]);

        let calls = usb.calls_for(7);
        let tail = &calls[calls.len() - 4..];
        assert_eq!(
            tail,
            &[
                MockCall::InterfaceClose,
                MockCall::InterfaceRelease,
                MockCall::Close,
                MockCall::Release,
            ]
        );
        assert!(usb.control_writes(7).is_empty());
    }

    fn bulk_test_with(serial: u32, edit: impl FnOnce(&mut MockInterfaceSpec)) -> MockDeviceSpec {
        let mut spec = MockDeviceSpec::bulk_test(serial);
        edit(&mut spec.interfaces[0]);
        spec
    }

    #[test]
    fn test_tested_fan_out_releases_each_interface() {
        let usb = MockUsb::new();
        let observer = Arc::new(RecordingObserver::default());
        let mut router = router(&usb, Arc::clone(&observer), TestMode::Sync);

        let batch = vec![
            bulk_test_with(1, |i| i.fail_open = Some(MockFault::NotResponding)),
            bulk_test_with(2, |i| i.fail_read = Some(MockFault::Timeout)),
            MockDeviceSpec::bulk_test(3),
        ];
        let report = router.on_added(IdentityClass::Tested, batch);
        assert_eq!((report.processed, report.succeeded, report.failed), (3, 1, 2));

        // an interface that never opened is released but not closed
        assert_eq!(usb.count(1, &MockCall::InterfaceClose), 0);
        assert_eq!(usb.count(1, &MockCall::InterfaceRelease), 1);
        for serial in [2, 3] {
            assert_eq!(usb.count(serial, &MockCall::InterfaceClose), 1);
            assert_eq!(usb.count(serial, &MockCall::InterfaceRelease), 1);
        }
        for serial in 1..=3 {
            assert_eq!(usb.count(serial, &MockCall::Close), 1);
            assert_eq!(usb.count(serial, &MockCall::Release), 1);
        }

        // the bulk test reports its own failure before the router does
        assert_eq!(
            observer.errors(),
            vec![STATUS_NOT_RESPONDING, STATUS_TIMEOUT, STATUS_TIMEOUT]
        );
        assert_eq!(observer.received_text(), vec!["Bulk I/O Test".to_string()]);
    }

    #[tokio::test]
    async fn test_tested_fan_out_async_write_failure() {
        let usb = MockUsb::new();
        let mut router = router(&usb, Arc::new(NullObserver), TestMode::Async);

        let batch = vec![
            bulk_test_with(1, |i| i.fail_write = Some(MockFault::Stall)),
            MockDeviceSpec::bulk_test(2),
        ];
        let report = router.on_added(IdentityClass::Tested, batch);
        assert_eq!(report.scheduled.len(), 2);

        let mut results = Vec::new();
        for test in report.scheduled {
            results.push(test.await);
        }
        assert!(matches!(
            results[0],
            Err(BulkTestError::Write {
                source: TransportError::Stall,
                ..
            })
        ));
        assert_eq!(results[1].as_ref().unwrap().text, "Bulk I/O Test");

        assert_eq!(usb.count(1, &MockCall::ReadPipeAsync { pipe: 9, len: 63 }), 0);
        for serial in [1, 2] {
            assert_eq!(usb.count(serial, &MockCall::InterfaceClose), 1);
            assert_eq!(usb.count(serial, &MockCall::InterfaceRelease), 1);
            assert_eq!(usb.count(serial, &MockCall::Release), 1);
        }
    }

    #[test]
    fn test_tested_device_wrong_class_rejected() {
        let usb = MockUsb::new();
        let mut router = router(&usb, Arc::new(NullObserver), TestMode::Sync);

        let report = router.on_added(IdentityClass::Tested, vec![MockDeviceSpec::raw(1)]);
        assert_eq!(report.failed, 1);
        assert_eq!(usb.count(1, &MockCall::Open), 0);
    }

    #[tokio::test]
    async fn test_tested_device_async_schedules_test() {
        let usb = MockUsb::new();
        let observer = Arc::new(RecordingObserver::default());
        let mut router = router(&usb, Arc::clone(&observer), TestMode::Async);

        let batch = vec![MockDeviceSpec::bulk_test(7)];
        let mut report = router.on_added(IdentityClass::Tested, batch);
        assert_eq!(report.scheduled.len(), 1);
        // not counted until the test completes
        assert_eq!((report.succeeded, report.failed), (0, 0));
        let stats = router.stats(IdentityClass::Tested);
        assert_eq!((stats.succeeded, stats.scheduled), (0, 1));
        // device handle is already closed, the interface stays open for the test
        assert_eq!(usb.count(7, &MockCall::Close), 1);
        assert_eq!(usb.count(7, &MockCall::InterfaceClose), 0);

        let result = report.scheduled.remove(0).await.unwrap();
        assert_eq!(result.text, "Bulk I/O Test");
        assert_eq!(usb.count(7, &MockCall::InterfaceClose), 1);
        assert_eq!(usb.count(7, &MockCall::InterfaceRelease), 1);
    }

    #[test]
    fn test_phase_and_stats() {
        let usb = MockUsb::new();
        let mut router = router(&usb, Arc::new(NullObserver), TestMode::Sync);
        assert_eq!(router.phase(IdentityClass::Raw), ClassPhase::Unseen);

        let batch = vec![MockDeviceSpec::raw(1), MockDeviceSpec::raw(2).release(9)];
        router.on_added(IdentityClass::Raw, batch);
        assert_eq!(router.phase(IdentityClass::Raw), ClassPhase::Unseen);

        let removed = router.on_removed(IdentityClass::Raw, vec![(), ()]);
        assert_eq!(removed, 2);

        let stats = router.stats(IdentityClass::Raw);
        assert_eq!(stats.devices_seen, 2);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.removed, 2);
        assert_eq!(*router.stats(IdentityClass::Tested), ClassStats::default());
    }

    #[test]
    fn test_empty_batch() {
        let usb = MockUsb::new();
        let mut router = router(&usb, Arc::new(NullObserver), TestMode::Sync);
        let report = router.on_added(IdentityClass::Raw, Vec::new());
        assert_eq!(report.processed, 0);
        assert_eq!(router.on_removed(IdentityClass::Tested, Vec::<()>::new()), 0);
        assert!(usb.calls().is_empty());
    }
}
