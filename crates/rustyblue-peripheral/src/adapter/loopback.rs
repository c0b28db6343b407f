//! In-memory platform adapter
//!
//! Stands in for an OS Bluetooth stack: remote centrals are simulated by calling
//! [`LoopbackAdapter::read`], [`LoopbackAdapter::write`],
//! [`LoopbackAdapter::subscribe`] and friends, and every notification the engine
//! sends is recorded for inspection. Failures can be injected per subscriber.

use super::{
    PlatformAdapter, ReadRequestSink, SubscriptionEvent, SubscriptionSink, WriteRequestSink,
};
use crate::error::{AdapterError, PeripheralError, PeripheralResult};
use crate::gatt::types::{
    CharacteristicId, NotificationKind, PublishedService, SubscriberHandle, SubscriptionChange,
    WriteOutcome,
};
use crate::gatt::{lock, read, write};
use log::trace;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, RwLock};

/// A notification recorded by the loopback adapter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentNotification {
    pub characteristic: CharacteristicId,
    pub subscriber: SubscriberHandle,
    pub value: Vec<u8>,
    pub kind: NotificationKind,
}

#[derive(Default)]
struct Sinks {
    read: Option<ReadRequestSink>,
    write: Option<WriteRequestSink>,
    subscription: Option<SubscriptionSink>,
}

#[derive(Default)]
struct LoopbackState {
    published: Mutex<Option<Vec<PublishedService>>>,
    sinks: RwLock<Sinks>,
    sent: Mutex<Vec<SentNotification>>,
    subscribed: Mutex<BTreeMap<CharacteristicId, BTreeSet<SubscriberHandle>>>,
    failing: Mutex<BTreeSet<SubscriberHandle>>,
    publish_failure: Mutex<Option<String>>,
    unpublish_failure: Mutex<Option<String>>,
}

/// In-memory adapter, cheap to clone; clones share state
#[derive(Clone, Default)]
pub struct LoopbackAdapter {
    state: Arc<LoopbackState>,
}

impl LoopbackAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `publish` calls fail with the given reason
    pub fn fail_publish(&self, reason: Option<&str>) {
        *lock(&self.state.publish_failure) = reason.map(str::to_owned);
    }

    /// Make the next `unpublish` calls fail with the given reason
    pub fn fail_unpublish(&self, reason: Option<&str>) {
        *lock(&self.state.unpublish_failure) = reason.map(str::to_owned);
    }

    /// Make every notification to `subscriber` fail
    pub fn fail_notifications_to(&self, subscriber: impl Into<SubscriberHandle>) {
        lock(&self.state.failing).insert(subscriber.into());
    }

    pub fn published(&self) -> Option<Vec<PublishedService>> {
        lock(&self.state.published).clone()
    }

    pub fn is_published(&self) -> bool {
        lock(&self.state.published).is_some()
    }

    /// Every notification sent so far, in order
    pub fn sent(&self) -> Vec<SentNotification> {
        lock(&self.state.sent).clone()
    }

    pub fn take_sent(&self) -> Vec<SentNotification> {
        std::mem::take(&mut *lock(&self.state.sent))
    }

    /// Simulate a remote read
    pub fn read(&self, characteristic: CharacteristicId) -> PeripheralResult<Vec<u8>> {
        let sink = read(&self.state.sinks).read.clone();
        let sink = sink.ok_or(PeripheralError::NotAdvertising)?;
        sink(characteristic)
    }

    /// Simulate a remote write
    pub fn write(&self, characteristic: CharacteristicId, value: &[u8]) -> PeripheralResult<WriteOutcome> {
        let sink = read(&self.state.sinks).write.clone();
        let sink = sink.ok_or(PeripheralError::NotAdvertising)?;
        sink(characteristic, value)
    }

    /// Simulate a central enabling notifications
    pub fn subscribe(
        &self,
        characteristic: CharacteristicId,
        subscriber: impl Into<SubscriberHandle>,
    ) -> PeripheralResult<()> {
        let subscriber = subscriber.into();
        self.deliver(SubscriptionEvent::Changed {
            characteristic,
            subscriber: subscriber.clone(),
            change: SubscriptionChange::Subscribe,
        })?;
        lock(&self.state.subscribed)
            .entry(characteristic)
            .or_default()
            .insert(subscriber);
        Ok(())
    }

    /// Simulate a central disabling notifications
    pub fn unsubscribe(
        &self,
        characteristic: CharacteristicId,
        subscriber: impl Into<SubscriberHandle>,
    ) -> PeripheralResult<()> {
        let subscriber = subscriber.into();
        self.deliver(SubscriptionEvent::Changed {
            characteristic,
            subscriber: subscriber.clone(),
            change: SubscriptionChange::Unsubscribe,
        })?;
        if let Some(set) = lock(&self.state.subscribed).get_mut(&characteristic) {
            set.remove(&subscriber);
        }
        Ok(())
    }

    /// Simulate a central dropping its connection
    pub fn disconnect(&self, subscriber: impl Into<SubscriberHandle>) -> PeripheralResult<()> {
        let subscriber = subscriber.into();
        self.deliver(SubscriptionEvent::Disconnected {
            subscriber: subscriber.clone(),
        })?;
        for set in lock(&self.state.subscribed).values_mut() {
            set.remove(&subscriber);
        }
        Ok(())
    }

    fn deliver(&self, event: SubscriptionEvent) -> PeripheralResult<()> {
        let sink = read(&self.state.sinks).subscription.clone();
        let sink = sink.ok_or(PeripheralError::NotAdvertising)?;
        sink(event)
    }
}

impl PlatformAdapter for LoopbackAdapter {
    fn publish(&self, services: &[PublishedService]) -> Result<(), AdapterError> {
        if let Some(reason) = lock(&self.state.publish_failure).clone() {
            return Err(AdapterError::new(reason));
        }
        *lock(&self.state.published) = Some(services.to_vec());
        Ok(())
    }

    fn unpublish(&self) -> Result<(), AdapterError> {
        if let Some(reason) = lock(&self.state.unpublish_failure).clone() {
            return Err(AdapterError::new(reason));
        }
        *lock(&self.state.published) = None;
        *write(&self.state.sinks) = Sinks::default();
        lock(&self.state.subscribed).clear();
        Ok(())
    }

    fn on_read_request(&self, sink: ReadRequestSink) -> Result<(), AdapterError> {
        write(&self.state.sinks).read = Some(sink);
        Ok(())
    }

    fn on_write_request(&self, sink: WriteRequestSink) -> Result<(), AdapterError> {
        write(&self.state.sinks).write = Some(sink);
        Ok(())
    }

    fn on_subscription_change(&self, sink: SubscriptionSink) -> Result<(), AdapterError> {
        write(&self.state.sinks).subscription = Some(sink);
        Ok(())
    }

    fn send_notification(
        &self,
        characteristic: CharacteristicId,
        subscriber: &SubscriberHandle,
        value: &[u8],
        kind: NotificationKind,
    ) -> Result<(), AdapterError> {
        if lock(&self.state.failing).contains(subscriber) {
            return Err(AdapterError::new(format!("{} is unreachable", subscriber)));
        }

        trace!(
            "loopback {:?} {} -> {}: {}",
            kind,
            characteristic,
            subscriber,
            hex::encode(value)
        );
        lock(&self.state.sent).push(SentNotification {
            characteristic,
            subscriber: subscriber.clone(),
            value: value.to_vec(),
            kind,
        });
        Ok(())
    }

    fn is_any_subscribed(&self, characteristic: CharacteristicId) -> bool {
        lock(&self.state.subscribed)
            .get(&characteristic)
            .is_some_and(|set| !set.is_empty())
    }
}
