//! Error types for the rustyblue-peripheral library
//!
//! Registration and lookup errors are returned synchronously and never retried.
//! Adapter failures are fatal to the operation that hit them, not to the server.

use crate::gatt::types::{CharacteristicId, ServiceId, SubscriberHandle};
use crate::uuid::Uuid;
use thiserror::Error;

/// A failure reported by a platform adapter
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("adapter error: {reason}")]
pub struct AdapterError {
    pub reason: String,
}

impl AdapterError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Errors returned by the peripheral engine
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PeripheralError {
    #[error("service {0} is already registered")]
    DuplicateService(Uuid),

    #[error("characteristic {uuid} is already registered on service {service}")]
    DuplicateCharacteristic { service: ServiceId, uuid: Uuid },

    #[error("unknown service: {0}")]
    UnknownService(ServiceId),

    #[error("unknown characteristic: {0}")]
    UnknownCharacteristic(CharacteristicId),

    #[error("no service with UUID {0}")]
    UnknownServiceUuid(Uuid),

    #[error("no characteristic {uuid} under service {service}")]
    UnknownCharacteristicUuid { service: ServiceId, uuid: Uuid },

    #[error("peripheral has already been started")]
    AlreadyStarted,

    #[error("no services registered")]
    NoServicesRegistered,

    #[error("permission denied on characteristic {0}")]
    PermissionDenied(CharacteristicId),

    #[error("value of {len} bytes exceeds the {max} byte limit")]
    InvalidValueLength { len: usize, max: usize },

    #[error("characteristic {0} does not support notifications or indications")]
    SubscriptionNotSupported(CharacteristicId),

    #[error("peripheral is not advertising")]
    NotAdvertising,

    #[error("attribute handle space exhausted")]
    HandleSpaceExhausted,

    #[error(transparent)]
    Adapter(#[from] AdapterError),
}

/// A single subscriber that could not be notified
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("notification to {subscriber} failed: {reason}")]
pub struct NotificationFailure {
    pub subscriber: SubscriberHandle,
    pub reason: AdapterError,
}

/// Result type used throughout the engine
pub type PeripheralResult<T> = Result<T, PeripheralError>;
