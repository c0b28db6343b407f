//! Platform adapter interface
//!
//! A platform adapter binds the engine to an OS Bluetooth stack (BlueZ,
//! CoreBluetooth, WinRT, ...). The engine publishes its attribute table through
//! it, receives remote requests through the registered sinks and pushes value
//! updates back out with [`PlatformAdapter::send_notification`].
//!
//! Sinks may be invoked from any thread, including several at once.

pub mod loopback;

use crate::error::{AdapterError, PeripheralResult};
use crate::gatt::types::{
    CharacteristicId, NotificationKind, PublishedService, SubscriberHandle, SubscriptionChange,
    WriteOutcome,
};
use std::sync::Arc;

pub use loopback::{LoopbackAdapter, SentNotification};

/// Subscription-related event raised by a platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// A central enabled or disabled pushes for one characteristic
    Changed {
        characteristic: CharacteristicId,
        subscriber: SubscriberHandle,
        change: SubscriptionChange,
    },
    /// A central went away, taking all of its subscriptions with it
    Disconnected { subscriber: SubscriberHandle },
}

/// Answers a remote read with the value to return
pub type ReadRequestSink = Arc<dyn Fn(CharacteristicId) -> PeripheralResult<Vec<u8>> + Send + Sync>;

/// Handles a remote write, reporting whether it was accepted
pub type WriteRequestSink =
    Arc<dyn Fn(CharacteristicId, &[u8]) -> PeripheralResult<WriteOutcome> + Send + Sync>;

/// Receives subscribe, unsubscribe and disconnect events
pub type SubscriptionSink = Arc<dyn Fn(SubscriptionEvent) -> PeripheralResult<()> + Send + Sync>;

/// OS-specific BLE peripheral mechanism consumed by the engine
pub trait PlatformAdapter: Send + Sync {
    /// Expose the services to remote centrals.
    ///
    /// The sinks are live while this runs, so events may be delivered before
    /// it returns. If it fails, subscriptions made in the meantime are dropped.
    fn publish(&self, services: &[PublishedService]) -> Result<(), AdapterError>;

    /// Withdraw everything previously published
    fn unpublish(&self) -> Result<(), AdapterError>;

    fn on_read_request(&self, sink: ReadRequestSink) -> Result<(), AdapterError>;

    fn on_write_request(&self, sink: WriteRequestSink) -> Result<(), AdapterError>;

    fn on_subscription_change(&self, sink: SubscriptionSink) -> Result<(), AdapterError>;

    /// Push a value to a single subscribed central
    fn send_notification(
        &self,
        characteristic: CharacteristicId,
        subscriber: &SubscriberHandle,
        value: &[u8],
        kind: NotificationKind,
    ) -> Result<(), AdapterError>;

    /// The platform's own view of whether anyone is subscribed
    fn is_any_subscribed(&self, characteristic: CharacteristicId) -> bool;
}
