//! Notifier session: startup, subscription arming and the event loop.

use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::task::Poll;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::device::IdentityClass;
use crate::engine::bulk::{BulkTestError, BulkTestReport};
use crate::events::{LoaderObserver, TracingObserver};
use crate::notify::{Notification, NotificationPort, NotifyError, NusbNotificationPort};
use crate::payload::FirmwareImage;
use crate::protocol::constants::{
    ANCHOR_PRODUCT_ID, ANCHOR_RELEASE, ANCHOR_VENDOR_ID, BULK_TEST_PRODUCT_ID, CONTROL_TIMEOUT_MS,
};
use crate::router::{ClassStats, DeviceRouter, IdentityTable, ScheduledTest};
use crate::transport::{DeviceProvider, NusbProvider};

/// Configuration for a notifier session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Vendor ID of the raw part.
    pub vendor_id: u16,
    /// Product ID of the raw part.
    pub product_id: u16,
    /// Product ID the part enumerates with once the test firmware runs.
    pub bulk_test_product_id: u16,
    /// Release number a raw part must report.
    pub raw_release: u16,
    /// Intel HEX firmware image.
    pub firmware_path: Option<PathBuf>,
    /// Timeout for each control transfer and each blocking bulk transfer.
    pub control_timeout_ms: u64,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            vendor_id: ANCHOR_VENDOR_ID,
            product_id: ANCHOR_PRODUCT_ID,
            bulk_test_product_id: BULK_TEST_PRODUCT_ID,
            raw_release: ANCHOR_RELEASE,
            firmware_path: None,
            control_timeout_ms: CONTROL_TIMEOUT_MS,
        }
    }
}

impl NotifierConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: NotifierConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn identities(&self) -> IdentityTable {
        IdentityTable::new(
            self.vendor_id,
            self.product_id,
            self.bulk_test_product_id,
            self.raw_release,
        )
    }

    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
}

/// Why the event loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    /// Interrupt received.
    Interrupted,
    /// The notification port stopped delivering.
    PortClosed,
}

/// Counters gathered over one event loop run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSummary {
    pub exit: LoopExit,
    pub raw: ClassStats,
    pub tested: ClassStats,
    pub tests_passed: usize,
    pub tests_failed: usize,
}

enum LoopEvent<C> {
    Shutdown(std::io::Result<()>),
    TestDone(Result<BulkTestReport, BulkTestError>),
    Notification(Option<Notification<C>>),
}

/// Create the four subscriptions and drain their initial iterators.
///
/// Order: raw arrivals, raw removals, tested arrivals, tested removals.
fn arm<N, P, O>(
    port: &mut N,
    router: &mut DeviceRouter<P, O>,
    tests: &mut FuturesUnordered<ScheduledTest>,
) -> Result<(), NotifyError>
where
    N: NotificationPort<Candidate = P::Candidate>,
    P: DeviceProvider,
    O: LoaderObserver + 'static,
{
    for class in [IdentityClass::Raw, IdentityClass::Tested] {
        let filter = router.identities().filter(class);

        let present = port.add_first_match(class, filter)?;
        tests.extend(router.on_added(class, present).scheduled);

        let removed = port.add_terminated(class, filter)?;
        router.on_removed(class, removed);
    }
    Ok(())
}

/// Run the router against `port` until `shutdown` resolves or the port
/// closes. The port is destroyed before returning.
///
/// Bulk tests still in flight are abandoned on interrupt and awaited when
/// the port closes.
pub async fn run_event_loop<N, P, O, S>(
    mut port: N,
    mut router: DeviceRouter<P, O>,
    shutdown: S,
) -> Result<SessionSummary>
where
    N: NotificationPort<Candidate = P::Candidate>,
    P: DeviceProvider,
    O: LoaderObserver + 'static,
    S: Future<Output = std::io::Result<()>>,
{
    tokio::pin!(shutdown);

    // The first poll installs the interrupt handler; arming may block on
    // device I/O, so it has to happen before that.
    if let Poll::Ready(result) = futures::poll!(&mut shutdown) {
        if let Err(e) = result {
            warn!("interrupt handler failed: {}", e);
        }
        info!("Interrupted before arming, shutting down");
        port.destroy();
        return Ok(SessionSummary {
            exit: LoopExit::Interrupted,
            raw: *router.stats(IdentityClass::Raw),
            tested: *router.stats(IdentityClass::Tested),
            tests_passed: 0,
            tests_failed: 0,
        });
    }

    let mut tests: FuturesUnordered<ScheduledTest> = FuturesUnordered::new();
    let mut passed = 0usize;
    let mut failed = 0usize;
    let mut record = |result: Result<BulkTestReport, BulkTestError>| match result {
        Ok(report) => {
            info!(text = %report.text, "Bulk test passed");
            passed += 1;
        }
        Err(_) => failed += 1,
    };

    if let Err(e) = arm(&mut port, &mut router, &mut tests) {
        port.destroy();
        return Err(e).context("unable to arm device notifications");
    }
    info!(in_flight = tests.len(), "Waiting for device notifications");

    let exit = loop {
        let event = tokio::select! {
            biased;
            result = &mut shutdown => LoopEvent::Shutdown(result),
            Some(result) = tests.next(), if !tests.is_empty() => LoopEvent::TestDone(result),
            notification = port.next_notification() => LoopEvent::Notification(notification),
        };

        match event {
            LoopEvent::Shutdown(result) => {
                if let Err(e) = result {
                    warn!("interrupt handler failed: {}", e);
                }
                info!("Interrupted, shutting down");
                break LoopExit::Interrupted;
            }
            LoopEvent::TestDone(result) => record(result),
            LoopEvent::Notification(Some(Notification::Matched { class, devices })) => {
                tests.extend(router.on_added(class, devices).scheduled);
            }
            LoopEvent::Notification(Some(Notification::Terminated { class, devices })) => {
                router.on_removed(class, devices);
            }
            LoopEvent::Notification(None) => {
                info!("Notification port closed");
                break LoopExit::PortClosed;
            }
        }
    };

    port.destroy();

    if exit == LoopExit::PortClosed {
        while let Some(result) = tests.next().await {
            record(result);
        }
    }

    Ok(SessionSummary {
        exit,
        raw: *router.stats(IdentityClass::Raw),
        tested: *router.stats(IdentityClass::Tested),
        tests_passed: passed,
        tests_failed: failed,
    })
}

/// Notifier session - loads firmware, watches for devices and runs until
/// interrupted.
pub struct NotifierSession<O: LoaderObserver> {
    config: NotifierConfig,
    observer: Arc<O>,
}

impl NotifierSession<TracingObserver> {
    /// Create a new session with default tracing observer.
    pub fn new(config: NotifierConfig) -> Self {
        Self::with_observer(config, Arc::new(TracingObserver))
    }
}

impl<O: LoaderObserver + 'static> NotifierSession<O> {
    /// Create a new session with a custom observer.
    pub fn with_observer(config: NotifierConfig, observer: Arc<O>) -> Self {
        Self { config, observer }
    }

    fn load_firmware(&self) -> Result<FirmwareImage> {
        let path = self
            .config
            .firmware_path
            .as_ref()
            .ok_or_else(|| anyhow!("no firmware image configured"))?;
        let image = FirmwareImage::load(path)
            .with_context(|| format!("unable to load firmware from {}", path.display()))?;
        if image.is_empty() {
            warn!("Firmware image has no data records");
        }
        Ok(image)
    }

    /// Run the session on a single-threaded runtime until interrupted.
    #[instrument(skip(self))]
    pub fn run(&self) -> Result<SessionSummary> {
        let firmware = Arc::new(self.load_firmware()?);
        let identities = self.config.identities();
        info!(
            raw = %identities.raw,
            tested = %identities.tested,
            "Looking for devices"
        );

        let port = NusbNotificationPort::new().context("unable to create notification port")?;
        let provider = NusbProvider::new(self.config.control_timeout());
        let router = DeviceRouter::new(provider, identities, firmware, Arc::clone(&self.observer));
        info!(mode = ?router.test_mode(), "Bulk test mode");

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .context("unable to start event loop")?;

        runtime.block_on(run_event_loop(port, router, tokio::signal::ctrl_c()))
    }
}
