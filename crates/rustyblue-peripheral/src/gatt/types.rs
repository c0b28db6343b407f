//! Common types for the GATT peripheral
//!
//! Identifiers, property and permission flags, handler signatures and the
//! published view of the attribute table handed to platform adapters.

use crate::error::NotificationFailure;
use crate::uuid::Uuid;
use bitflags::bitflags;
use std::fmt;
use std::sync::Arc;

/// Lowest attribute handle, handles are allocated upwards from here
pub const ATT_HANDLE_MIN: u16 = 0x0001;

/// Largest attribute value permitted by ATT
pub const ATT_MAX_VALUE_LEN: usize = 512;

/// Handle of a registered service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceId(pub(crate) u16);

impl ServiceId {
    pub fn handle(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for ServiceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Value handle of a registered characteristic
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CharacteristicId(pub(crate) u16);

impl CharacteristicId {
    pub fn handle(&self) -> u16 {
        self.0
    }
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:04x}", self.0)
    }
}

/// Opaque identifier of a remote central, as reported by the platform
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberHandle(String);

impl SubscriberHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SubscriberHandle {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for SubscriberHandle {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for SubscriberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

bitflags! {
    /// Characteristic property bits, as carried in a characteristic declaration
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct CharacteristicProperties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

impl CharacteristicProperties {
    /// Whether a central may subscribe to value pushes
    pub fn can_subscribe(&self) -> bool {
        self.intersects(Self::NOTIFY | Self::INDICATE)
    }

    /// The kind of push used for this characteristic. Notify wins when both are set.
    pub fn notification_kind(&self) -> NotificationKind {
        if self.contains(Self::INDICATE) && !self.contains(Self::NOTIFY) {
            NotificationKind::Indicate
        } else {
            NotificationKind::Notify
        }
    }
}

bitflags! {
    /// Attribute permissions
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct AttributePermissions: u8 {
        const READABLE = 0x01;
        const WRITEABLE = 0x02;
        const READ_ENCRYPTION_REQUIRED = 0x04;
        const WRITE_ENCRYPTION_REQUIRED = 0x08;
    }
}

impl AttributePermissions {
    pub fn read_write() -> Self {
        Self::READABLE | Self::WRITEABLE
    }

    /// Readable, including reads that require an encrypted link
    pub fn allows_read(&self) -> bool {
        self.intersects(Self::READABLE | Self::READ_ENCRYPTION_REQUIRED)
    }

    /// Writeable, including writes that require an encrypted link
    pub fn allows_write(&self) -> bool {
        self.intersects(Self::WRITEABLE | Self::WRITE_ENCRYPTION_REQUIRED)
    }
}

/// How a value push is delivered. Indications are acknowledged by the central.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Notify,
    Indicate,
}

/// Result of a remote write as reported back to the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Accept,
    Reject,
}

/// Subscription transition reported by the adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionChange {
    Subscribe,
    Unsubscribe,
}

/// Lifecycle of the peripheral, strictly forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeripheralState {
    Unstarted,
    Advertising,
    Stopped,
}

/// Produces the response to a remote read from the characteristic's current value.
///
/// Runs on the adapter's event thread with the characteristic's handler gate held,
/// so it must return promptly.
pub type ReadHandler = Arc<dyn Fn(CharacteristicId, &[u8]) -> Vec<u8> + Send + Sync>;

/// Decides the value accepted for a remote write.
///
/// Receives the proposed value; `Some(value)` is stored, `None` rejects the write
/// and leaves the stored value untouched. Same promptness obligation as
/// [`ReadHandler`].
pub type WriteHandler = Arc<dyn Fn(CharacteristicId, &[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// A characteristic as published to the platform
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedCharacteristic {
    pub id: CharacteristicId,
    pub service: ServiceId,
    pub uuid: Uuid,
    pub properties: CharacteristicProperties,
    pub permissions: AttributePermissions,
    pub value: Vec<u8>,
}

/// A service as published to the platform, characteristics in registration order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedService {
    pub id: ServiceId,
    pub uuid: Uuid,
    pub characteristics: Vec<PublishedCharacteristic>,
}

/// Aggregate outcome of a notification fan-out
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NotificationReport {
    /// Number of `send_notification` attempts made
    pub attempted: usize,
    /// Subscribers whose send failed
    pub failures: Vec<NotificationFailure>,
}

impl NotificationReport {
    pub fn delivered(&self) -> usize {
        self.attempted.saturating_sub(self.failures.len())
    }

    pub fn is_complete(&self) -> bool {
        self.failures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AdapterError;

    #[test]
    fn test_report_counts() {
        let failure = NotificationFailure {
            subscriber: SubscriberHandle::from("a"),
            reason: AdapterError::new("gone"),
        };
        let report = NotificationReport {
            attempted: 3,
            failures: vec![failure.clone()],
        };
        assert_eq!(report.delivered(), 2);
        assert!(!report.is_complete());

        // Hand-built reports may list more failures than attempts
        let report = NotificationReport {
            attempted: 0,
            failures: vec![failure],
        };
        assert_eq!(report.delivered(), 0);
    }

    #[test]
    fn test_notification_kind_prefers_notify() {
        let both = CharacteristicProperties::NOTIFY | CharacteristicProperties::INDICATE;
        assert_eq!(both.notification_kind(), NotificationKind::Notify);
        assert_eq!(
            CharacteristicProperties::INDICATE.notification_kind(),
            NotificationKind::Indicate
        );
        assert!(!CharacteristicProperties::READ.can_subscribe());
    }
}
