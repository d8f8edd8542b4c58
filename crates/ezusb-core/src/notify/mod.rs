//! Device arrival and removal notifications.
//!
//! A [`NotificationPort`] holds any number of subscriptions, each pairing an
//! identity filter with an event kind. Creating a subscription hands back
//! the devices that already match so the caller can drain them right away;
//! later batches arrive through [`NotificationPort::next_notification`].

pub mod mock;
pub mod nusb;

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

use futures::future::LocalBoxFuture;
use thiserror::Error;
use tracing::debug;

use crate::device::{DeviceIdentity, IdentityClass, IdentityMatch};

pub use mock::{MockHotplug, MockNotificationPort};
pub use nusb::NusbNotificationPort;

#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("unable to watch for devices: {0}")]
    Watch(String),

    #[error("unable to enumerate devices: {0}")]
    Enumerate(String),

    #[error("notification port destroyed")]
    Destroyed,
}

/// What a subscription reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// A matching device appeared.
    FirstMatch,
    /// A matching device went away.
    Terminated,
}

/// A device that has gone away. Only its last known identity survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemovedDevice {
    pub identity: DeviceIdentity,
}

/// Iterator handed out with a notification; must be drained to keep the
/// subscription armed.
pub type DeviceIterator<T> = std::vec::IntoIter<T>;

/// One batch for one subscription.
#[derive(Debug)]
pub enum Notification<C> {
    Matched {
        class: IdentityClass,
        devices: DeviceIterator<C>,
    },
    Terminated {
        class: IdentityClass,
        devices: DeviceIterator<RemovedDevice>,
    },
}

/// Source of device arrival and removal batches.
pub trait NotificationPort {
    /// Enumeration object delivered for arriving devices.
    type Candidate;

    /// Subscribe to arrivals matching `filter`. Returns devices already
    /// present.
    fn add_first_match(
        &mut self,
        class: IdentityClass,
        filter: IdentityMatch,
    ) -> Result<DeviceIterator<Self::Candidate>, NotifyError>;

    /// Subscribe to removals matching `filter`. The initial iterator is
    /// empty but still has to be drained.
    fn add_terminated(
        &mut self,
        class: IdentityClass,
        filter: IdentityMatch,
    ) -> Result<DeviceIterator<RemovedDevice>, NotifyError>;

    /// Next batch, or `None` once the port is closed.
    fn next_notification(&mut self) -> LocalBoxFuture<'_, Option<Notification<Self::Candidate>>>;

    /// Tear down every subscription. Further notifications resolve to `None`.
    fn destroy(&mut self);
}

#[derive(Debug, Clone, Copy)]
struct Subscription {
    class: IdentityClass,
    kind: NotificationKind,
    filter: IdentityMatch,
}

/// Routes raw attach/detach events to subscriptions.
///
/// Devices are remembered by key on attach so a detach, which carries
/// only the key, can still be matched against identity filters.
pub(crate) struct Subscriptions<K, C> {
    entries: Vec<Subscription>,
    attached: HashMap<K, DeviceIdentity>,
    pending: VecDeque<Notification<C>>,
}

impl<K: Eq + Hash, C: Clone> Subscriptions<K, C> {
    pub(crate) fn new() -> Self {
        Self {
            entries: Vec::new(),
            attached: HashMap::new(),
            pending: VecDeque::new(),
        }
    }

    pub(crate) fn add(
        &mut self,
        class: IdentityClass,
        kind: NotificationKind,
        filter: IdentityMatch,
    ) {
        debug!(class = %class, ?kind, filter = %filter, "Subscription added");
        self.entries.push(Subscription {
            class,
            kind,
            filter,
        });
    }

    /// Add a first-match subscription and return the `listed` devices it
    /// already matches.
    ///
    /// Every listed device is remembered as attached, so a connect event
    /// for it that was queued before the listing is not reported again.
    pub(crate) fn add_first_match<I>(
        &mut self,
        class: IdentityClass,
        filter: IdentityMatch,
        listed: I,
    ) -> Vec<C>
    where
        I: IntoIterator<Item = (K, DeviceIdentity, C)>,
    {
        self.add(class, NotificationKind::FirstMatch, filter);
        let mut present = Vec::new();
        for (key, identity, candidate) in listed {
            self.seed(key, identity);
            if filter.matches(&identity) {
                present.push(candidate);
            }
        }
        present
    }

    /// Record a device present before any event was seen.
    pub(crate) fn seed(&mut self, key: K, identity: DeviceIdentity) {
        self.attached.insert(key, identity);
    }

    /// Queue one `Matched` batch per matching first-match subscription.
    /// A key that is already attached is ignored.
    pub(crate) fn attach(&mut self, key: K, identity: DeviceIdentity, candidate: C) {
        if self.attached.insert(key, identity).is_some() {
            return;
        }
        for sub in self.matching(NotificationKind::FirstMatch, &identity) {
            self.pending.push_back(Notification::Matched {
                class: sub.class,
                devices: vec![candidate.clone()].into_iter(),
            });
        }
    }

    /// Queue one `Terminated` batch per matching terminated subscription.
    pub(crate) fn detach(&mut self, key: &K) {
        let Some(identity) = self.attached.remove(key) else {
            return;
        };
        for sub in self.matching(NotificationKind::Terminated, &identity) {
            self.pending.push_back(Notification::Terminated {
                class: sub.class,
                devices: vec![RemovedDevice { identity }].into_iter(),
            });
        }
    }

    pub(crate) fn pop(&mut self) -> Option<Notification<C>> {
        self.pending.pop_front()
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.pending.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    fn matching(&self, kind: NotificationKind, identity: &DeviceIdentity) -> Vec<Subscription> {
        self.entries
            .iter()
            .filter(|s| s.kind == kind && s.filter.matches(identity))
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(product_id: u16, release: Option<u16>) -> IdentityMatch {
        IdentityMatch {
            vendor_id: 1351,
            product_id,
            release,
        }
    }

    #[test]
    fn test_attach_routes_by_identity() {
        let mut subs: Subscriptions<u32, u32> = Subscriptions::new();
        subs.add(IdentityClass::Raw, NotificationKind::FirstMatch, filter(8193, Some(1)));
        subs.add(IdentityClass::Tested, NotificationKind::FirstMatch, filter(4098, None));

        subs.attach(1, DeviceIdentity::new(1351, 4098, 0), 1);
        match subs.pop() {
            Some(Notification::Matched { class, devices }) => {
                assert_eq!(class, IdentityClass::Tested);
                assert_eq!(devices.collect::<Vec<_>>(), vec![1]);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(subs.pop().is_none());
    }

    #[test]
    fn test_duplicate_attach_ignored() {
        let mut subs: Subscriptions<u32, u32> = Subscriptions::new();
        subs.add(IdentityClass::Raw, NotificationKind::FirstMatch, filter(8193, Some(1)));
        let raw = DeviceIdentity::new(1351, 8193, 1);
        subs.seed(7, raw);
        subs.attach(7, raw, 7);
        assert!(subs.pop().is_none());
    }

    #[test]
    fn test_listed_device_not_reported_twice() {
        let mut subs: Subscriptions<u32, u32> = Subscriptions::new();
        let raw = DeviceIdentity::new(1351, 8193, 1);
        let other = DeviceIdentity::new(0x1234, 0x0001, 0);

        let present = subs.add_first_match(
            IdentityClass::Raw,
            filter(8193, Some(1)),
            vec![(5, raw, 5), (6, other, 6)],
        );
        assert_eq!(present, vec![5]);

        // the watcher already had a connect event for device 5 queued
        subs.attach(5, raw, 5);
        assert!(subs.pop().is_none());

        // a later arrival still gets through
        subs.attach(8, raw, 8);
        assert!(matches!(subs.pop(), Some(Notification::Matched { .. })));

        // listed devices are tracked for removal
        subs.add(IdentityClass::Raw, NotificationKind::Terminated, filter(8193, Some(1)));
        subs.detach(&5);
        assert!(matches!(subs.pop(), Some(Notification::Terminated { .. })));
    }

    #[test]
    fn test_detach_uses_remembered_identity() {
        let mut subs: Subscriptions<u32, u32> = Subscriptions::new();
        subs.add(IdentityClass::Raw, NotificationKind::Terminated, filter(8193, Some(1)));
        subs.add(IdentityClass::Tested, NotificationKind::Terminated, filter(4098, None));

        subs.attach(3, DeviceIdentity::new(1351, 8193, 1), 3);
        subs.detach(&3);
        match subs.pop() {
            Some(Notification::Terminated { class, devices }) => {
                assert_eq!(class, IdentityClass::Raw);
                assert_eq!(devices.len(), 1);
            }
            other => panic!("unexpected {:?}", other),
        }

        // unknown key produces nothing
        subs.detach(&99);
        assert!(subs.pop().is_none());
    }
}
