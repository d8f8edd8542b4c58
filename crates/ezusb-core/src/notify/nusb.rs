//! Notification port backed by the nusb hotplug watcher.

use futures::{FutureExt, StreamExt};
use futures::future::LocalBoxFuture;
use nusb::hotplug::{HotplugEvent, HotplugWatch};
use nusb::{DeviceId, DeviceInfo, MaybeFuture};
use tracing::{debug, info, trace};

use super::{
    DeviceIterator, Notification, NotificationKind, NotificationPort, NotifyError, RemovedDevice,
    Subscriptions,
};
use crate::device::{DeviceIdentity, IdentityClass, IdentityMatch};

fn identity_of(info: &DeviceInfo) -> DeviceIdentity {
    DeviceIdentity::new(info.vendor_id(), info.product_id(), info.device_version())
}

pub struct NusbNotificationPort {
    watch: Option<HotplugWatch>,
    subscriptions: Subscriptions<DeviceId, DeviceInfo>,
}

impl NusbNotificationPort {
    /// Start watching for hotplug events and snapshot attached devices.
    ///
    /// The watch is created before the snapshot so no arrival between the
    /// two is lost; an arrival seen in both is reported once.
    pub fn new() -> Result<Self, NotifyError> {
        let watch = nusb::watch_devices().map_err(|e| NotifyError::Watch(e.to_string()))?;

        let mut subscriptions = Subscriptions::new();
        for info in Self::list()? {
            subscriptions.seed(info.id(), identity_of(&info));
        }

        info!("Notification port created");
        Ok(Self {
            watch: Some(watch),
            subscriptions,
        })
    }

    fn list() -> Result<Vec<DeviceInfo>, NotifyError> {
        Ok(nusb::list_devices()
            .wait()
            .map_err(|e| NotifyError::Enumerate(e.to_string()))?
            .collect())
    }

    fn ensure_live(&self) -> Result<(), NotifyError> {
        self.watch.as_ref().map(|_| ()).ok_or(NotifyError::Destroyed)
    }
}

impl NotificationPort for NusbNotificationPort {
    type Candidate = DeviceInfo;

    fn add_first_match(
        &mut self,
        class: IdentityClass,
        filter: IdentityMatch,
    ) -> Result<DeviceIterator<DeviceInfo>, NotifyError> {
        self.ensure_live()?;
        let listed = Self::list()?
            .into_iter()
            .map(|info| (info.id(), identity_of(&info), info));
        let present = self.subscriptions.add_first_match(class, filter, listed);
        debug!(class = %class, count = present.len(), "Devices already present");
        Ok(present.into_iter())
    }

    fn add_terminated(
        &mut self,
        class: IdentityClass,
        filter: IdentityMatch,
    ) -> Result<DeviceIterator<RemovedDevice>, NotifyError> {
        self.ensure_live()?;
        self.subscriptions
            .add(class, NotificationKind::Terminated, filter);
        Ok(Vec::new().into_iter())
    }

    fn next_notification(&mut self) -> LocalBoxFuture<'_, Option<Notification<DeviceInfo>>> {
        async move {
            loop {
                if let Some(notification) = self.subscriptions.pop() {
                    return Some(notification);
                }

                let Some(watch) = self.watch.as_mut() else {
                    return None;
                };
                let Some(event) = watch.next().await else {
                    return None;
                };
                match event {
                    HotplugEvent::Connected(info) => {
                        trace!(id = ?info.id(), "Device connected");
                        let identity = identity_of(&info);
                        self.subscriptions.attach(info.id(), identity, info);
                    }
                    HotplugEvent::Disconnected(id) => {
                        trace!(?id, "Device disconnected");
                        self.subscriptions.detach(&id);
                    }
                }
            }
        }
        .boxed_local()
    }

    fn destroy(&mut self) {
        if self.watch.take().is_some() {
            info!(
                subscriptions = self.subscriptions.len(),
                "Notification port destroyed"
            );
        }
        self.subscriptions.clear();
    }
}
