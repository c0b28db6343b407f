//! Peripheral server
//!
//! Façade tying the attribute table, callback dispatcher and subscription
//! manager to a platform adapter, and owning the peripheral lifecycle.

use super::dispatcher::CallbackDispatcher;
use super::subscriptions::SubscriptionManager;
use super::table::AttributeTable;
use super::types::*;
use super::{lock, read, write};
use crate::adapter::{PlatformAdapter, SubscriptionEvent};
use crate::error::{PeripheralError, PeripheralResult};
use crate::uuid::Uuid;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

/// Peripheral server configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeripheralConfig {
    /// Local name the peripheral is known by
    pub name: String,
    /// Push the new value to subscribers after every accepted remote write
    pub notify_on_write: bool,
    /// Largest characteristic value accepted, in bytes
    pub max_value_len: usize,
}

impl Default for PeripheralConfig {
    fn default() -> Self {
        Self {
            name: String::from("rustyblue"),
            notify_on_write: true,
            max_value_len: ATT_MAX_VALUE_LEN,
        }
    }
}

struct ServerInner<A> {
    config: RwLock<PeripheralConfig>,
    adapter: A,
    table: Arc<AttributeTable>,
    dispatcher: CallbackDispatcher,
    subscriptions: SubscriptionManager,
    /// Lifecycle; held across registration, start and stop
    state: Mutex<PeripheralState>,
    /// Mirrors `state == Advertising` for the event path
    advertising: AtomicBool,
}

impl<A: PlatformAdapter> ServerInner<A> {
    fn ensure_advertising(&self) -> PeripheralResult<()> {
        if self.advertising.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(PeripheralError::NotAdvertising)
        }
    }

    fn notify_all(&self, id: CharacteristicId) -> PeripheralResult<NotificationReport> {
        self.subscriptions.notify_all(&self.table, &self.adapter, id)
    }

    fn handle_read(&self, id: CharacteristicId) -> PeripheralResult<Vec<u8>> {
        self.ensure_advertising()?;
        self.dispatcher.handle_read(id)
    }

    fn handle_write(&self, id: CharacteristicId, value: &[u8]) -> PeripheralResult<WriteOutcome> {
        self.ensure_advertising()?;
        let outcome = self.dispatcher.handle_write(id, value)?;

        if outcome == WriteOutcome::Accept && read(&self.config).notify_on_write {
            let report = self.notify_all(id)?;
            if !report.is_complete() {
                warn!(
                    "Write to {} reached {}/{} subscribers",
                    id,
                    report.delivered(),
                    report.attempted
                );
            }
        }
        Ok(outcome)
    }

    fn handle_subscription(&self, event: SubscriptionEvent) -> PeripheralResult<()> {
        self.ensure_advertising()?;
        match event {
            SubscriptionEvent::Changed {
                characteristic,
                subscriber,
                change: SubscriptionChange::Subscribe,
            } => {
                let slot = self.table.slot(characteristic)?;
                if !slot.properties.can_subscribe() {
                    return Err(PeripheralError::SubscriptionNotSupported(characteristic));
                }
                if self.subscriptions.subscribe(characteristic, subscriber.clone())? {
                    info!("New subscription from {} on {}", subscriber, characteristic);
                }
            }
            SubscriptionEvent::Changed {
                characteristic,
                subscriber,
                change: SubscriptionChange::Unsubscribe,
            } => {
                self.table.slot(characteristic)?;
                self.subscriptions.unsubscribe(characteristic, &subscriber);
            }
            SubscriptionEvent::Disconnected { subscriber } => {
                self.subscriptions.disconnect(&subscriber);
            }
        }
        Ok(())
    }
}

/// A BLE GATT peripheral.
///
/// Cloning yields another handle to the same peripheral, which is how handlers
/// and other threads reach it; there is no process-wide instance.
pub struct PeripheralServer<A: PlatformAdapter + 'static> {
    inner: Arc<ServerInner<A>>,
}

impl<A: PlatformAdapter + 'static> Clone for PeripheralServer<A> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A: PlatformAdapter + 'static> PeripheralServer<A> {
    /// Create a peripheral with the default configuration
    pub fn new(adapter: A) -> Self {
        Self::with_config(adapter, PeripheralConfig::default())
    }

    pub fn with_config(adapter: A, config: PeripheralConfig) -> Self {
        let table = Arc::new(AttributeTable::with_max_value_len(config.max_value_len));
        Self {
            inner: Arc::new(ServerInner {
                config: RwLock::new(config),
                adapter,
                dispatcher: CallbackDispatcher::new(table.clone()),
                table,
                subscriptions: SubscriptionManager::new(),
                state: Mutex::new(PeripheralState::Unstarted),
                advertising: AtomicBool::new(false),
            }),
        }
    }

    pub fn config(&self) -> PeripheralConfig {
        read(&self.inner.config).clone()
    }

    /// Replace the configuration. Only allowed before the peripheral starts.
    pub fn set_config(&self, config: PeripheralConfig) -> PeripheralResult<()> {
        let state = lock(&self.inner.state);
        if *state != PeripheralState::Unstarted {
            return Err(PeripheralError::AlreadyStarted);
        }
        self.inner.table.set_max_value_len(config.max_value_len);
        *write(&self.inner.config) = config;
        Ok(())
    }

    pub fn name(&self) -> String {
        read(&self.inner.config).name.clone()
    }

    pub fn state(&self) -> PeripheralState {
        *lock(&self.inner.state)
    }

    pub fn is_advertising(&self) -> bool {
        self.inner.advertising.load(Ordering::Acquire)
    }

    pub fn adapter(&self) -> &A {
        &self.inner.adapter
    }

    pub fn table(&self) -> &AttributeTable {
        &self.inner.table
    }

    /// Register a service
    pub fn add_service(&self, uuid: Uuid) -> PeripheralResult<ServiceId> {
        let state = lock(&self.inner.state);
        if *state != PeripheralState::Unstarted {
            return Err(PeripheralError::AlreadyStarted);
        }
        self.inner.table.add_service(uuid)
    }

    /// Register a characteristic on a service
    pub fn add_characteristic(
        &self,
        service: ServiceId,
        uuid: Uuid,
        properties: CharacteristicProperties,
        permissions: AttributePermissions,
        initial_value: Vec<u8>,
    ) -> PeripheralResult<CharacteristicId> {
        let state = lock(&self.inner.state);
        if *state != PeripheralState::Unstarted {
            return Err(PeripheralError::AlreadyStarted);
        }
        self.inner
            .table
            .add_characteristic(service, uuid, properties, permissions, initial_value)
    }

    /// Install the handler answering remote reads of `id`
    pub fn set_read_handler<F>(&self, id: CharacteristicId, handler: F) -> PeripheralResult<()>
    where
        F: Fn(CharacteristicId, &[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        self.inner.table.set_read_handler(id, Some(Arc::new(handler)))
    }

    /// Install the handler deciding the value accepted for remote writes to `id`
    pub fn set_write_handler<F>(&self, id: CharacteristicId, handler: F) -> PeripheralResult<()>
    where
        F: Fn(CharacteristicId, &[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.inner.table.set_write_handler(id, Some(Arc::new(handler)))
    }

    pub fn clear_handlers(&self, id: CharacteristicId) -> PeripheralResult<()> {
        self.inner.table.set_read_handler(id, None)?;
        self.inner.table.set_write_handler(id, None)
    }

    pub fn characteristic_id(&self, service_uuid: &Uuid, uuid: &Uuid) -> Option<CharacteristicId> {
        self.inner.table.find_characteristic(service_uuid, uuid)
    }

    pub fn get_value(&self, id: CharacteristicId) -> PeripheralResult<Vec<u8>> {
        self.inner.table.get_value(id)
    }

    /// Publish the attribute table and begin serving remote requests
    pub fn start(&self) -> PeripheralResult<()> {
        let mut state = lock(&self.inner.state);
        if *state != PeripheralState::Unstarted {
            return Err(PeripheralError::AlreadyStarted);
        }
        if self.inner.table.is_empty() {
            return Err(PeripheralError::NoServicesRegistered);
        }

        self.wire_sinks()?;
        let services = self.inner.table.services();

        // Events may arrive before publish returns
        self.inner.advertising.store(true, Ordering::Release);
        if let Err(err) = self.inner.adapter.publish(&services) {
            self.inner.advertising.store(false, Ordering::Release);
            self.inner.subscriptions.clear();
            return Err(err.into());
        }

        self.inner.table.freeze();
        *state = PeripheralState::Advertising;

        info!(
            "Peripheral {:?} advertising {} service(s)",
            read(&self.inner.config).name,
            services.len()
        );
        Ok(())
    }

    /// Each sink holds a weak handle so the adapter never keeps the server alive.
    fn wire_sinks(&self) -> PeripheralResult<()> {
        let adapter = &self.inner.adapter;

        let weak = Arc::downgrade(&self.inner);
        adapter.on_read_request(Arc::new(move |id: CharacteristicId| {
            upgrade(&weak)?.handle_read(id)
        }))?;

        let weak = Arc::downgrade(&self.inner);
        adapter.on_write_request(Arc::new(move |id: CharacteristicId, value: &[u8]| {
            upgrade(&weak)?.handle_write(id, value)
        }))?;

        let weak = Arc::downgrade(&self.inner);
        adapter.on_subscription_change(Arc::new(move |event: SubscriptionEvent| {
            upgrade(&weak)?.handle_subscription(event)
        }))?;

        Ok(())
    }

    /// Stop serving and withdraw the publication. Calling it again is a no-op.
    ///
    /// The peripheral is `Stopped` afterwards even if the adapter fails to
    /// unpublish; that failure is still returned.
    pub fn stop(&self) -> PeripheralResult<()> {
        let mut state = lock(&self.inner.state);
        let previous = *state;
        if previous == PeripheralState::Stopped {
            return Ok(());
        }

        *state = PeripheralState::Stopped;
        self.inner.advertising.store(false, Ordering::Release);
        self.inner.table.freeze();
        self.inner.subscriptions.close();

        if previous == PeripheralState::Advertising {
            if let Err(err) = self.inner.adapter.unpublish() {
                warn!("Adapter failed to unpublish: {}", err);
                return Err(err.into());
            }
        }

        info!("Peripheral {:?} stopped", read(&self.inner.config).name);
        Ok(())
    }

    /// Set a value, then push it to every current subscriber
    pub fn update_value(&self, id: CharacteristicId, value: &[u8]) -> PeripheralResult<NotificationReport> {
        self.inner.table.set_value(id, value)?;
        self.inner.notify_all(id)
    }

    pub fn update_value_by_uuid(
        &self,
        service_uuid: &Uuid,
        uuid: &Uuid,
        value: &[u8],
    ) -> PeripheralResult<NotificationReport> {
        let id = self.characteristic_id(service_uuid, uuid).ok_or_else(|| {
            debug!("No characteristic {} under service {}", uuid, service_uuid);
            match self.inner.table.find_service(service_uuid) {
                Some(service) => PeripheralError::UnknownCharacteristicUuid {
                    service,
                    uuid: *uuid,
                },
                None => PeripheralError::UnknownServiceUuid(*service_uuid),
            }
        })?;
        self.update_value(id, value)
    }

    /// Push the stored value again without changing it
    pub fn notify(&self, id: CharacteristicId) -> PeripheralResult<NotificationReport> {
        self.inner.notify_all(id)
    }

    /// True iff at least one central is subscribed to any characteristic
    pub fn is_connected(&self) -> bool {
        self.inner.subscriptions.is_connected()
    }

    pub fn is_subscribed(&self, id: CharacteristicId) -> bool {
        self.inner.subscriptions.is_any_subscribed(id)
    }

    pub fn subscribers(&self, id: CharacteristicId) -> Vec<SubscriberHandle> {
        self.inner.subscriptions.subscribers(id)
    }

    /// Block until a central subscribes, the timeout elapses or the peripheral stops
    pub fn wait_for_connection(&self, timeout: Option<Duration>) -> bool {
        self.inner.subscriptions.wait_for_connection(timeout)
    }
}

fn upgrade<A>(weak: &Weak<ServerInner<A>>) -> PeripheralResult<Arc<ServerInner<A>>> {
    weak.upgrade().ok_or(PeripheralError::NotAdvertising)
}
