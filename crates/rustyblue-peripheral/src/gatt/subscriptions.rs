//! Subscription manager
//!
//! Tracks which centrals receive pushes for which characteristics and fans
//! value updates out to them. A fan-out snapshots the value and the subscriber
//! set together under the characteristic's value lock, then sends with no lock
//! held, so a slow or vanished central never blocks the others.

use super::table::AttributeTable;
use super::types::{CharacteristicId, NotificationReport, SubscriberHandle};
use super::lock;
use crate::adapter::PlatformAdapter;
use crate::error::{NotificationFailure, PeripheralError, PeripheralResult};
use log::{debug, trace, warn};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

#[derive(Default)]
struct SubscriptionState {
    /// Subscriber -> characteristics it is subscribed to, never empty sets
    by_subscriber: BTreeMap<SubscriberHandle, BTreeSet<CharacteristicId>>,
    /// Set once the peripheral stops; wakes and releases any waiter
    closed: bool,
}

impl SubscriptionState {
    fn is_connected(&self) -> bool {
        !self.by_subscriber.is_empty()
    }
}

#[derive(Default)]
pub struct SubscriptionManager {
    state: Mutex<SubscriptionState>,
    first_subscriber: Condvar,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SubscriptionState> {
        lock(&self.state)
    }

    /// Returns `true` if the pair was not already subscribed.
    ///
    /// Fails with `NotAdvertising` once the manager is closed.
    pub fn subscribe(&self, id: CharacteristicId, subscriber: SubscriberHandle) -> PeripheralResult<bool> {
        let mut state = self.state();
        if state.closed {
            return Err(PeripheralError::NotAdvertising);
        }
        let was_connected = state.is_connected();
        let added = state
            .by_subscriber
            .entry(subscriber.clone())
            .or_default()
            .insert(id);

        if added {
            debug!("{} subscribed to {}", subscriber, id);
        }
        if !was_connected {
            self.first_subscriber.notify_all();
        }
        Ok(added)
    }

    /// Returns `true` if the pair was subscribed
    pub fn unsubscribe(&self, id: CharacteristicId, subscriber: &SubscriberHandle) -> bool {
        let mut state = self.state();
        let Some(set) = state.by_subscriber.get_mut(subscriber) else {
            return false;
        };
        let removed = set.remove(&id);
        if set.is_empty() {
            state.by_subscriber.remove(subscriber);
        }
        if removed {
            debug!("{} unsubscribed from {}", subscriber, id);
        }
        removed
    }

    /// Drop every subscription held by `subscriber` in one step
    pub fn disconnect(&self, subscriber: &SubscriberHandle) -> Vec<CharacteristicId> {
        let removed: Vec<_> = self
            .state()
            .by_subscriber
            .remove(subscriber)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        debug!("{} disconnected, dropped {} subscriptions", subscriber, removed.len());
        removed
    }

    /// Forget every subscriber, leaving the manager open
    pub fn clear(&self) {
        self.state().by_subscriber.clear();
    }

    /// Forget every subscriber and release anyone waiting for a connection
    pub fn close(&self) {
        let mut state = self.state();
        state.by_subscriber.clear();
        state.closed = true;
        self.first_subscriber.notify_all();
    }

    /// Current subscribers of a characteristic
    pub fn subscribers(&self, id: CharacteristicId) -> Vec<SubscriberHandle> {
        self.state()
            .by_subscriber
            .iter()
            .filter(|(_, set)| set.contains(&id))
            .map(|(subscriber, _)| subscriber.clone())
            .collect()
    }

    /// Whether at least one central is subscribed to anything
    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn is_any_subscribed(&self, id: CharacteristicId) -> bool {
        self.state().by_subscriber.values().any(|set| set.contains(&id))
    }

    pub fn subscriber_count(&self) -> usize {
        self.state().by_subscriber.len()
    }

    /// Block until the first subscriber appears.
    ///
    /// Returns `false` if the timeout elapsed or the manager was closed first.
    pub fn wait_for_connection(&self, timeout: Option<Duration>) -> bool {
        let state = self.state();
        let waiting = |state: &mut SubscriptionState| !state.is_connected() && !state.closed;
        let state = match timeout {
            Some(timeout) => {
                self.first_subscriber
                    .wait_timeout_while(state, timeout, waiting)
                    .unwrap_or_else(PoisonError::into_inner)
                    .0
            }
            None => self
                .first_subscriber
                .wait_while(state, waiting)
                .unwrap_or_else(PoisonError::into_inner),
        };
        state.is_connected()
    }

    /// Send the current value of `id` to every current subscriber
    pub fn notify_all<A>(
        &self,
        table: &AttributeTable,
        adapter: &A,
        id: CharacteristicId,
    ) -> PeripheralResult<NotificationReport>
    where
        A: PlatformAdapter + ?Sized,
    {
        let slot = table.slot(id)?;
        let (value, targets) = {
            let mut cell = slot.lock_value();
            cell.dirty = false;
            (cell.value.clone(), self.subscribers(id))
        };
        let kind = slot.properties.notification_kind();

        let mut report = NotificationReport::default();
        for subscriber in targets {
            report.attempted += 1;
            if let Err(reason) = adapter.send_notification(id, &subscriber, &value, kind) {
                warn!("Failed to notify {} on {}: {}", subscriber, id, reason);
                report.failures.push(NotificationFailure { subscriber, reason });
            }
        }

        trace!(
            "Fan-out of {} on {}: {}/{} delivered",
            hex::encode(&value),
            id,
            report.delivered(),
            report.attempted
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::LoopbackAdapter;
    use crate::gatt::types::{AttributePermissions, CharacteristicProperties, NotificationKind};
    use crate::uuid::Uuid;
    use std::sync::Arc;
    use std::thread;

    fn table_with(properties: CharacteristicProperties) -> (AttributeTable, CharacteristicId) {
        let table = AttributeTable::new();
        let service = table.add_service(Uuid::from_u16(0x1234)).unwrap();
        let id = table
            .add_characteristic(
                service,
                Uuid::from_u16(0x5678),
                properties,
                AttributePermissions::read_write(),
                vec![],
            )
            .unwrap();
        (table, id)
    }

    fn handle(name: &str) -> SubscriberHandle {
        SubscriberHandle::from(name)
    }

    #[test]
    fn test_subscribe_unsubscribe_transitions() {
        let manager = SubscriptionManager::new();
        let id = CharacteristicId(3);

        assert!(!manager.is_connected());
        assert!(manager.subscribe(id, handle("a")).unwrap());
        assert!(!manager.subscribe(id, handle("a")).unwrap());
        assert!(manager.is_connected());
        assert!(manager.is_any_subscribed(id));

        assert!(manager.unsubscribe(id, &handle("a")));
        assert!(!manager.unsubscribe(id, &handle("a")));
        assert!(!manager.is_connected());
        assert_eq!(manager.subscriber_count(), 0);
    }

    #[test]
    fn test_disconnect_drops_all_subscriptions() {
        let manager = SubscriptionManager::new();
        let (a, b) = (CharacteristicId(3), CharacteristicId(5));
        manager.subscribe(a, handle("phone")).unwrap();
        manager.subscribe(b, handle("phone")).unwrap();
        manager.subscribe(a, handle("watch")).unwrap();

        let mut dropped = manager.disconnect(&handle("phone"));
        dropped.sort();
        assert_eq!(dropped, vec![a, b]);
        assert_eq!(manager.subscribers(a), vec![handle("watch")]);
        assert!(manager.subscribers(b).is_empty());
        assert!(manager.disconnect(&handle("phone")).is_empty());
    }

    #[test]
    fn test_notify_all_without_subscribers() {
        let (table, id) = table_with(CharacteristicProperties::NOTIFY);
        let adapter = LoopbackAdapter::new();
        let manager = SubscriptionManager::new();

        let report = manager.notify_all(&table, &adapter, id).unwrap();
        assert_eq!(report, NotificationReport::default());
        assert!(adapter.sent().is_empty());
    }

    #[test]
    fn test_notify_all_partial_failure() {
        let (table, id) = table_with(CharacteristicProperties::NOTIFY);
        table.set_value(id, b"Welcome").unwrap();
        let adapter = LoopbackAdapter::new();
        adapter.fail_notifications_to("b");
        let manager = SubscriptionManager::new();
        for name in ["a", "b", "c"] {
            manager.subscribe(id, handle(name)).unwrap();
        }

        let report = manager.notify_all(&table, &adapter, id).unwrap();

        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered(), 2);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].subscriber, handle("b"));
        let receivers: Vec<_> = adapter.sent().into_iter().map(|n| n.subscriber).collect();
        assert_eq!(receivers, vec![handle("a"), handle("c")]);
        assert!(!table.is_dirty(id).unwrap());
    }

    #[test]
    fn test_indicate_only_characteristic_uses_indications() {
        let (table, id) = table_with(CharacteristicProperties::READ | CharacteristicProperties::INDICATE);
        let adapter = LoopbackAdapter::new();
        let manager = SubscriptionManager::new();
        manager.subscribe(id, handle("a")).unwrap();

        manager.notify_all(&table, &adapter, id).unwrap();
        assert_eq!(adapter.sent()[0].kind, NotificationKind::Indicate);
    }

    #[test]
    fn test_wait_for_connection() {
        let manager = Arc::new(SubscriptionManager::new());
        assert!(!manager.wait_for_connection(Some(Duration::from_millis(10))));

        let waiter = {
            let manager = manager.clone();
            thread::spawn(move || manager.wait_for_connection(Some(Duration::from_secs(5))))
        };
        thread::sleep(Duration::from_millis(20));
        manager.subscribe(CharacteristicId(3), handle("a")).unwrap();
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_close_releases_waiters() {
        let manager = Arc::new(SubscriptionManager::new());
        let waiter = {
            let manager = manager.clone();
            thread::spawn(move || manager.wait_for_connection(None))
        };
        thread::sleep(Duration::from_millis(20));
        manager.close();
        assert!(!waiter.join().unwrap());
    }

    #[test]
    fn test_closed_manager_refuses_subscriptions() {
        let manager = SubscriptionManager::new();
        let id = CharacteristicId(3);
        manager.subscribe(id, handle("a")).unwrap();
        manager.close();

        assert_eq!(manager.subscribe(id, handle("b")), Err(PeripheralError::NotAdvertising));
        assert!(!manager.is_connected());
        assert!(!manager.wait_for_connection(Some(Duration::from_millis(10))));
    }
}
