//! Attribute table
//!
//! Registry of services and characteristics keyed by handle. The shape of the
//! table is fixed once it is frozen; only characteristic values and handlers
//! change afterwards.

use super::types::*;
use super::{lock, read, write};
use crate::error::{PeripheralError, PeripheralResult};
use crate::uuid::Uuid;
use log::trace;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

/// Current value of a characteristic and whether it changed since the last fan-out
#[derive(Debug)]
pub(crate) struct ValueCell {
    pub(crate) value: Vec<u8>,
    pub(crate) dirty: bool,
}

/// Per-characteristic state shared between the table, dispatcher and notifier
pub(crate) struct CharacteristicSlot {
    pub(crate) id: CharacteristicId,
    pub(crate) service: ServiceId,
    pub(crate) uuid: Uuid,
    pub(crate) properties: CharacteristicProperties,
    pub(crate) permissions: AttributePermissions,
    value: Mutex<ValueCell>,
    /// Serializes handler invocations, taken before `value`
    handler_gate: Mutex<()>,
    read_handler: RwLock<Option<ReadHandler>>,
    write_handler: RwLock<Option<WriteHandler>>,
}

impl CharacteristicSlot {
    pub(crate) fn lock_value(&self) -> MutexGuard<'_, ValueCell> {
        lock(&self.value)
    }

    pub(crate) fn enter_handler(&self) -> MutexGuard<'_, ()> {
        lock(&self.handler_gate)
    }

    pub(crate) fn read_handler(&self) -> Option<ReadHandler> {
        read(&self.read_handler).clone()
    }

    pub(crate) fn write_handler(&self) -> Option<WriteHandler> {
        read(&self.write_handler).clone()
    }

    fn published(&self) -> PublishedCharacteristic {
        PublishedCharacteristic {
            id: self.id,
            service: self.service,
            uuid: self.uuid,
            properties: self.properties,
            permissions: self.permissions,
            value: self.lock_value().value.clone(),
        }
    }
}

struct ServiceEntry {
    uuid: Uuid,
    characteristics: Vec<CharacteristicId>,
}

/// Attribute table
pub struct AttributeTable {
    services: RwLock<BTreeMap<ServiceId, ServiceEntry>>,
    characteristics: RwLock<BTreeMap<CharacteristicId, Arc<CharacteristicSlot>>>,
    next_handle: Mutex<u16>,
    frozen: AtomicBool,
    max_value_len: AtomicUsize,
}

impl Default for AttributeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl AttributeTable {
    /// Create an empty table accepting values up to the ATT maximum length
    pub fn new() -> Self {
        Self::with_max_value_len(ATT_MAX_VALUE_LEN)
    }

    pub fn with_max_value_len(max_value_len: usize) -> Self {
        Self {
            services: RwLock::new(BTreeMap::new()),
            characteristics: RwLock::new(BTreeMap::new()),
            next_handle: Mutex::new(ATT_HANDLE_MIN),
            frozen: AtomicBool::new(false),
            max_value_len: AtomicUsize::new(max_value_len),
        }
    }

    pub fn max_value_len(&self) -> usize {
        self.max_value_len.load(Ordering::Acquire)
    }

    pub(crate) fn set_max_value_len(&self, max_value_len: usize) {
        self.max_value_len.store(max_value_len, Ordering::Release);
    }

    /// Reject any further registration
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        read(&self.services).is_empty()
    }

    fn ensure_mutable(&self) -> PeripheralResult<()> {
        if self.is_frozen() {
            Err(PeripheralError::AlreadyStarted)
        } else {
            Ok(())
        }
    }

    fn check_len(&self, value: &[u8]) -> PeripheralResult<()> {
        let max = self.max_value_len();
        if value.len() > max {
            return Err(PeripheralError::InvalidValueLength {
                len: value.len(),
                max,
            });
        }
        Ok(())
    }

    fn allocate_handle(&self) -> PeripheralResult<u16> {
        let mut next = lock(&self.next_handle);
        let handle = *next;
        *next = handle
            .checked_add(1)
            .ok_or(PeripheralError::HandleSpaceExhausted)?;
        Ok(handle)
    }

    /// Register a service
    pub fn add_service(&self, uuid: Uuid) -> PeripheralResult<ServiceId> {
        self.ensure_mutable()?;

        let mut services = write(&self.services);
        if services.values().any(|entry| entry.uuid == uuid) {
            return Err(PeripheralError::DuplicateService(uuid));
        }

        let id = ServiceId(self.allocate_handle()?);
        services.insert(
            id,
            ServiceEntry {
                uuid,
                characteristics: Vec::new(),
            },
        );

        trace!("Registered service {} at {}", uuid, id);
        Ok(id)
    }

    /// Register a characteristic under an existing service
    pub fn add_characteristic(
        &self,
        service: ServiceId,
        uuid: Uuid,
        properties: CharacteristicProperties,
        permissions: AttributePermissions,
        initial_value: Vec<u8>,
    ) -> PeripheralResult<CharacteristicId> {
        self.ensure_mutable()?;
        self.check_len(&initial_value)?;

        let mut services = write(&self.services);
        let entry = services
            .get_mut(&service)
            .ok_or(PeripheralError::UnknownService(service))?;

        let mut characteristics = write(&self.characteristics);
        let duplicate = entry
            .characteristics
            .iter()
            .filter_map(|id| characteristics.get(id))
            .any(|slot| slot.uuid == uuid);
        if duplicate {
            return Err(PeripheralError::DuplicateCharacteristic { service, uuid });
        }

        let id = CharacteristicId(self.allocate_handle()?);
        characteristics.insert(
            id,
            Arc::new(CharacteristicSlot {
                id,
                service,
                uuid,
                properties,
                permissions,
                value: Mutex::new(ValueCell {
                    value: initial_value,
                    dirty: false,
                }),
                handler_gate: Mutex::new(()),
                read_handler: RwLock::new(None),
                write_handler: RwLock::new(None),
            }),
        );
        entry.characteristics.push(id);

        trace!(
            "Registered characteristic {} at {} under service {}",
            uuid,
            id,
            service
        );
        Ok(id)
    }

    pub(crate) fn slot(&self, id: CharacteristicId) -> PeripheralResult<Arc<CharacteristicSlot>> {
        read(&self.characteristics)
            .get(&id)
            .cloned()
            .ok_or(PeripheralError::UnknownCharacteristic(id))
    }

    /// Current value of a characteristic
    pub fn get_value(&self, id: CharacteristicId) -> PeripheralResult<Vec<u8>> {
        Ok(self.slot(id)?.lock_value().value.clone())
    }

    /// Replace a characteristic value and mark it dirty for the next fan-out
    pub fn set_value(&self, id: CharacteristicId, value: &[u8]) -> PeripheralResult<()> {
        self.check_len(value)?;
        let slot = self.slot(id)?;
        let mut cell = slot.lock_value();
        cell.value = value.to_vec();
        cell.dirty = true;
        Ok(())
    }

    /// Whether the value changed since the last fan-out
    pub fn is_dirty(&self, id: CharacteristicId) -> PeripheralResult<bool> {
        Ok(self.slot(id)?.lock_value().dirty)
    }

    pub fn set_read_handler(
        &self,
        id: CharacteristicId,
        handler: Option<ReadHandler>,
    ) -> PeripheralResult<()> {
        let slot = self.slot(id)?;
        *write(&slot.read_handler) = handler;
        Ok(())
    }

    pub fn set_write_handler(
        &self,
        id: CharacteristicId,
        handler: Option<WriteHandler>,
    ) -> PeripheralResult<()> {
        let slot = self.slot(id)?;
        *write(&slot.write_handler) = handler;
        Ok(())
    }

    /// Published view of a single characteristic
    pub fn characteristic(&self, id: CharacteristicId) -> PeripheralResult<PublishedCharacteristic> {
        Ok(self.slot(id)?.published())
    }

    /// Published view of a single service and its characteristics
    pub fn service(&self, id: ServiceId) -> PeripheralResult<PublishedService> {
        let services = read(&self.services);
        let entry = services.get(&id).ok_or(PeripheralError::UnknownService(id))?;
        Ok(self.publish_entry(id, entry))
    }

    /// Characteristic ids owned by a service, in registration order
    pub fn service_characteristics(&self, service: ServiceId) -> PeripheralResult<Vec<CharacteristicId>> {
        read(&self.services)
            .get(&service)
            .map(|entry| entry.characteristics.clone())
            .ok_or(PeripheralError::UnknownService(service))
    }

    pub fn find_service(&self, uuid: &Uuid) -> Option<ServiceId> {
        read(&self.services)
            .iter()
            .find(|(_, entry)| entry.uuid == *uuid)
            .map(|(id, _)| *id)
    }

    /// Locate a characteristic by its service and characteristic UUIDs
    pub fn find_characteristic(&self, service_uuid: &Uuid, uuid: &Uuid) -> Option<CharacteristicId> {
        let services = read(&self.services);
        let characteristics = read(&self.characteristics);
        services
            .values()
            .find(|entry| entry.uuid == *service_uuid)?
            .characteristics
            .iter()
            .copied()
            .find(|id| characteristics.get(id).is_some_and(|slot| slot.uuid == *uuid))
    }

    /// Snapshot of every service in handle order, as handed to the adapter
    pub fn services(&self) -> Vec<PublishedService> {
        read(&self.services)
            .iter()
            .map(|(id, entry)| self.publish_entry(*id, entry))
            .collect()
    }

    fn publish_entry(&self, id: ServiceId, entry: &ServiceEntry) -> PublishedService {
        let characteristics = read(&self.characteristics);
        PublishedService {
            id,
            uuid: entry.uuid,
            characteristics: entry
                .characteristics
                .iter()
                .filter_map(|cid| characteristics.get(cid))
                .map(|slot| slot.published())
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rw() -> (CharacteristicProperties, AttributePermissions) {
        (
            CharacteristicProperties::READ | CharacteristicProperties::WRITE,
            AttributePermissions::read_write(),
        )
    }

    #[test]
    fn test_initial_value_is_returned() {
        let table = AttributeTable::new();
        let service = table.add_service(Uuid::from_u16(0x1234)).unwrap();
        let (props, perms) = rw();
        let id = table
            .add_characteristic(service, Uuid::from_u16(0x5678), props, perms, b"hello".to_vec())
            .unwrap();

        assert_eq!(table.get_value(id).unwrap(), b"hello");
        assert!(!table.is_dirty(id).unwrap());
        assert_eq!(table.characteristic(id).unwrap().uuid, Uuid::from_u16(0x5678));

        let published = table.service(service).unwrap();
        assert_eq!(published.uuid, Uuid::from_u16(0x1234));
        assert_eq!(published.characteristics[0].service, service);
        assert_eq!(published.characteristics[0].value, b"hello");
    }

    #[test]
    fn test_handles_are_sequential() {
        let table = AttributeTable::new();
        let service = table.add_service(Uuid::from_u16(0x1800)).unwrap();
        let (props, perms) = rw();
        let first = table
            .add_characteristic(service, Uuid::from_u16(0x2A00), props, perms, vec![])
            .unwrap();
        let second = table
            .add_characteristic(service, Uuid::from_u16(0x2A01), props, perms, vec![])
            .unwrap();

        assert_eq!(service.handle(), ATT_HANDLE_MIN);
        assert_eq!(first.handle(), ATT_HANDLE_MIN + 1);
        assert_eq!(second.handle(), ATT_HANDLE_MIN + 2);
        assert_eq!(table.service_characteristics(service).unwrap(), vec![first, second]);
    }

    #[test]
    fn test_duplicate_service_rejected() {
        let table = AttributeTable::new();
        let uuid = Uuid::new_random_v4();
        table.add_service(uuid).unwrap();

        assert_eq!(table.add_service(uuid), Err(PeripheralError::DuplicateService(uuid)));
        assert_eq!(table.services().len(), 1);
    }

    #[test]
    fn test_duplicate_characteristic_leaves_table_unchanged() {
        let table = AttributeTable::new();
        let service = table.add_service(Uuid::from_u16(0x1234)).unwrap();
        let (props, perms) = rw();
        let uuid = Uuid::from_u16(0x5678);
        let id = table
            .add_characteristic(service, uuid, props, perms, b"first".to_vec())
            .unwrap();
        let before = table.services();

        let result = table.add_characteristic(service, uuid, props, perms, b"second".to_vec());

        assert_eq!(result, Err(PeripheralError::DuplicateCharacteristic { service, uuid }));
        assert_eq!(table.services(), before);
        assert_eq!(table.get_value(id).unwrap(), b"first");
    }

    #[test]
    fn test_same_characteristic_uuid_in_two_services() {
        let table = AttributeTable::new();
        let (props, perms) = rw();
        let uuid = Uuid::from_u16(0x2A19);
        let a = table.add_service(Uuid::from_u16(0x180F)).unwrap();
        let b = table.add_service(Uuid::from_u16(0x180A)).unwrap();
        let in_a = table.add_characteristic(a, uuid, props, perms, vec![1]).unwrap();
        let in_b = table.add_characteristic(b, uuid, props, perms, vec![2]).unwrap();

        assert_ne!(in_a, in_b);
        assert_eq!(table.find_characteristic(&Uuid::from_u16(0x180A), &uuid), Some(in_b));
        assert_eq!(table.find_service(&Uuid::from_u16(0x180F)), Some(a));
    }

    #[test]
    fn test_unknown_ids() {
        let table = AttributeTable::new();
        let (props, perms) = rw();
        let missing = ServiceId(0x0042);
        assert_eq!(
            table.add_characteristic(missing, Uuid::from_u16(1), props, perms, vec![]),
            Err(PeripheralError::UnknownService(missing))
        );
        let missing = CharacteristicId(0x0043);
        assert_eq!(
            table.set_value(missing, b"x"),
            Err(PeripheralError::UnknownCharacteristic(missing))
        );
        assert_eq!(
            table.get_value(missing),
            Err(PeripheralError::UnknownCharacteristic(missing))
        );
    }

    #[test]
    fn test_set_value_marks_dirty() {
        let table = AttributeTable::new();
        let service = table.add_service(Uuid::from_u16(0x1234)).unwrap();
        let (props, perms) = rw();
        let id = table
            .add_characteristic(service, Uuid::from_u16(0x5678), props, perms, vec![])
            .unwrap();

        table.set_value(id, b"Welcome").unwrap();
        assert_eq!(table.get_value(id).unwrap(), b"Welcome");
        assert!(table.is_dirty(id).unwrap());
    }

    #[test]
    fn test_frozen_table_rejects_registration() {
        let table = AttributeTable::new();
        let service = table.add_service(Uuid::from_u16(0x1234)).unwrap();
        table.freeze();
        let (props, perms) = rw();

        assert_eq!(
            table.add_service(Uuid::from_u16(0x4321)),
            Err(PeripheralError::AlreadyStarted)
        );
        assert_eq!(
            table.add_characteristic(service, Uuid::from_u16(0x5678), props, perms, vec![]),
            Err(PeripheralError::AlreadyStarted)
        );
    }

    #[test]
    fn test_value_length_limit() {
        let table = AttributeTable::with_max_value_len(4);
        let service = table.add_service(Uuid::from_u16(0x1234)).unwrap();
        let (props, perms) = rw();

        assert_eq!(
            table.add_characteristic(service, Uuid::from_u16(1), props, perms, vec![0; 5]),
            Err(PeripheralError::InvalidValueLength { len: 5, max: 4 })
        );
        let id = table
            .add_characteristic(service, Uuid::from_u16(1), props, perms, vec![0; 4])
            .unwrap();
        assert_eq!(
            table.set_value(id, b"12345"),
            Err(PeripheralError::InvalidValueLength { len: 5, max: 4 })
        );
        assert_eq!(table.get_value(id).unwrap(), vec![0; 4]);
    }
}
