//! GATT (Generic Attribute Profile) peripheral
//!
//! This module provides the server side of GATT: the attribute table, the
//! dispatcher answering remote requests, the subscription manager pushing
//! value updates, and the [`PeripheralServer`] façade over all three.

pub mod dispatcher;
pub mod server;
pub mod subscriptions;
pub mod table;
pub mod types;


pub use dispatcher::CallbackDispatcher;
pub use server::{PeripheralConfig, PeripheralServer};
pub use subscriptions::SubscriptionManager;
pub use table::AttributeTable;
pub use types::{
    AttributePermissions, CharacteristicId, CharacteristicProperties, NotificationKind,
    NotificationReport, PeripheralState, PublishedCharacteristic, PublishedService, ReadHandler,
    ServiceId, SubscriberHandle, SubscriptionChange, WriteHandler, WriteOutcome,
};

use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

// Guarded data is only ever replaced wholesale and user handlers run under the
// handler gate, which guards nothing, so a poisoned lock still holds valid data.

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}
