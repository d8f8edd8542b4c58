//! Scripted notification port for testing the session loop.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{self, LocalBoxFuture};

use super::{
    DeviceIterator, Notification, NotificationKind, NotificationPort, NotifyError, RemovedDevice,
    Subscriptions,
};
use crate::device::{IdentityClass, IdentityMatch};
use crate::transport::MockDeviceSpec;

/// One scripted hotplug event.
#[derive(Debug, Clone)]
pub enum MockHotplug {
    Arrive(MockDeviceSpec),
    /// Device with this serial goes away.
    Depart(u32),
}

/// State observable after the port has been moved into a session.
#[derive(Debug, Default)]
pub struct MockPortLog {
    pub subscriptions: Vec<(IdentityClass, NotificationKind)>,
    pub destroyed: bool,
}

pub struct MockNotificationPort {
    present: Vec<MockDeviceSpec>,
    script: VecDeque<MockHotplug>,
    subscriptions: Subscriptions<u32, MockDeviceSpec>,
    /// Keep the port open once the script runs out.
    hold_open: bool,
    log: Arc<Mutex<MockPortLog>>,
}

impl MockNotificationPort {
    /// Port with `present` devices attached before any subscription.
    pub fn new(present: Vec<MockDeviceSpec>) -> Self {
        let mut subscriptions = Subscriptions::new();
        for spec in &present {
            subscriptions.seed(spec.serial, spec.identity);
        }
        Self {
            present,
            script: VecDeque::new(),
            subscriptions,
            hold_open: false,
            log: Arc::default(),
        }
    }

    pub fn script(mut self, events: impl IntoIterator<Item = MockHotplug>) -> Self {
        self.script.extend(events);
        self
    }

    /// Attach a device after the port was created: it is listed by later
    /// subscriptions and its arrival event is queued at the head of the
    /// script.
    pub fn plug(mut self, spec: MockDeviceSpec) -> Self {
        self.script.push_front(MockHotplug::Arrive(spec.clone()));
        self.present.push(spec);
        self
    }

    /// Do not close the port when the script is exhausted.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn log(&self) -> Arc<Mutex<MockPortLog>> {
        Arc::clone(&self.log)
    }

    fn record(&self, class: IdentityClass, kind: NotificationKind) -> Result<(), NotifyError> {
        let mut log = self.log.lock().map_err(|_| NotifyError::Destroyed)?;
        if log.destroyed {
            return Err(NotifyError::Destroyed);
        }
        log.subscriptions.push((class, kind));
        Ok(())
    }

    fn is_destroyed(&self) -> bool {
        self.log.lock().map(|l| l.destroyed).unwrap_or(true)
    }
}

impl NotificationPort for MockNotificationPort {
    type Candidate = MockDeviceSpec;

    fn add_first_match(
        &mut self,
        class: IdentityClass,
        filter: IdentityMatch,
    ) -> Result<DeviceIterator<MockDeviceSpec>, NotifyError> {
        self.record(class, NotificationKind::FirstMatch)?;
        let listed = self
            .present
            .iter()
            .map(|spec| (spec.serial, spec.identity, spec.clone()));
        let present = self.subscriptions.add_first_match(class, filter, listed);
        Ok(present.into_iter())
    }

    fn add_terminated(
        &mut self,
        class: IdentityClass,
        filter: IdentityMatch,
    ) -> Result<DeviceIterator<RemovedDevice>, NotifyError> {
        self.record(class, NotificationKind::Terminated)?;
        self.subscriptions
            .add(class, NotificationKind::Terminated, filter);
        Ok(Vec::new().into_iter())
    }

    fn next_notification(&mut self) -> LocalBoxFuture<'_, Option<Notification<MockDeviceSpec>>> {
        loop {
            if self.is_destroyed() {
                return future::ready(None).boxed_local();
            }
            if let Some(notification) = self.subscriptions.pop() {
                return future::ready(Some(notification)).boxed_local();
            }
            match self.script.pop_front() {
                Some(MockHotplug::Arrive(spec)) => {
                    self.subscriptions.attach(spec.serial, spec.identity, spec);
                }
                Some(MockHotplug::Depart(serial)) => self.subscriptions.detach(&serial),
                None if self.hold_open => return future::pending().boxed_local(),
                None => return future::ready(None).boxed_local(),
            }
        }
    }

    fn destroy(&mut self) {
        if let Ok(mut log) = self.log.lock() {
            log.destroyed = true;
        }
        self.subscriptions.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::DeviceIdentity;

    fn raw_filter() -> IdentityMatch {
        IdentityMatch {
            vendor_id: 1351,
            product_id: 8193,
            release: Some(1),
        }
    }

    #[test]
    fn test_initial_iterator_lists_present_devices() {
        let mut port = MockNotificationPort::new(vec![
            MockDeviceSpec::raw(1),
            MockDeviceSpec::bulk_test(2),
            MockDeviceSpec::raw(3).release(2),
        ]);
        let present: Vec<_> = port
            .add_first_match(IdentityClass::Raw, raw_filter())
            .unwrap()
            .map(|s| s.serial)
            .collect();
        assert_eq!(present, vec![1]);
    }

    #[tokio::test]
    async fn test_script_delivers_batches() {
        let mut port = MockNotificationPort::new(Vec::new())
            .script([MockHotplug::Arrive(MockDeviceSpec::raw(5)), MockHotplug::Depart(5)]);
        assert_eq!(port.add_first_match(IdentityClass::Raw, raw_filter()).unwrap().len(), 0);
        assert_eq!(port.add_terminated(IdentityClass::Raw, raw_filter()).unwrap().len(), 0);

        assert!(matches!(
            port.next_notification().await,
            Some(Notification::Matched { class: IdentityClass::Raw, .. })
        ));
        match port.next_notification().await {
            Some(Notification::Terminated { devices, .. }) => {
                let removed: Vec<_> = devices.collect();
                assert_eq!(removed[0].identity, DeviceIdentity::new(1351, 8193, 1));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(port.next_notification().await.is_none());
    }

    #[tokio::test]
    async fn test_plugged_device_listed_once() {
        let mut port = MockNotificationPort::new(Vec::new()).plug(MockDeviceSpec::raw(4));
        let present: Vec<_> = port
            .add_first_match(IdentityClass::Raw, raw_filter())
            .unwrap()
            .map(|s| s.serial)
            .collect();
        assert_eq!(present, vec![4]);

        // the queued arrival is not delivered a second time
        assert!(port.next_notification().await.is_none());
    }

    #[tokio::test]
    async fn test_destroy_closes_port() {
        let mut port = MockNotificationPort::new(Vec::new()).hold_open();
        let log = port.log();
        port.destroy();
        assert!(port.next_notification().await.is_none());
        assert!(log.lock().unwrap().destroyed);
        assert!(port.add_terminated(IdentityClass::Raw, raw_filter()).is_err());
    }
}
