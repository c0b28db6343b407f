//! Callback dispatcher
//!
//! Routes remote read and write requests to the handlers registered on each
//! characteristic, falling back to the stored value. Handler invocations for a
//! characteristic are serialized through its handler gate.

use super::table::AttributeTable;
use super::types::{CharacteristicId, WriteOutcome};
use crate::error::{PeripheralError, PeripheralResult};
use log::{debug, trace};
use std::sync::Arc;

pub struct CallbackDispatcher {
    table: Arc<AttributeTable>,
}

impl CallbackDispatcher {
    pub fn new(table: Arc<AttributeTable>) -> Self {
        Self { table }
    }

    /// Produce the response to a remote read
    pub fn handle_read(&self, id: CharacteristicId) -> PeripheralResult<Vec<u8>> {
        let slot = self.table.slot(id)?;
        if !slot.permissions.allows_read() {
            debug!("Read of {} denied by permissions", id);
            return Err(PeripheralError::PermissionDenied(id));
        }

        let _gate = slot.enter_handler();
        let current = slot.lock_value().value.clone();
        let response = match slot.read_handler() {
            Some(handler) => handler(id, &current),
            None => current,
        };

        trace!("Read {} -> {}", id, hex::encode(&response));
        Ok(response)
    }

    /// Apply a remote write, storing whatever value the handler accepts
    pub fn handle_write(&self, id: CharacteristicId, proposed: &[u8]) -> PeripheralResult<WriteOutcome> {
        let slot = self.table.slot(id)?;
        if !slot.permissions.allows_write() {
            debug!("Write to {} denied by permissions", id);
            return Err(PeripheralError::PermissionDenied(id));
        }

        let _gate = slot.enter_handler();
        let accepted = match slot.write_handler() {
            Some(handler) => handler(id, proposed),
            None => Some(proposed.to_vec()),
        };

        match accepted {
            Some(value) => {
                self.table.set_value(id, &value)?;
                trace!("Write {} <- {}", id, hex::encode(&value));
                Ok(WriteOutcome::Accept)
            }
            None => {
                debug!("Write to {} rejected by handler", id);
                Ok(WriteOutcome::Reject)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gatt::types::{AttributePermissions, CharacteristicProperties};
    use crate::uuid::Uuid;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn setup(permissions: AttributePermissions) -> (Arc<AttributeTable>, CallbackDispatcher, CharacteristicId) {
        let table = Arc::new(AttributeTable::new());
        let service = table.add_service(Uuid::from_u16(0x1234)).unwrap();
        let id = table
            .add_characteristic(
                service,
                Uuid::from_u16(0x5678),
                CharacteristicProperties::READ | CharacteristicProperties::WRITE,
                permissions,
                b"initial".to_vec(),
            )
            .unwrap();
        let dispatcher = CallbackDispatcher::new(table.clone());
        (table, dispatcher, id)
    }

    #[test]
    fn test_read_without_handler_returns_stored_value() {
        let (_table, dispatcher, id) = setup(AttributePermissions::read_write());
        assert_eq!(dispatcher.handle_read(id).unwrap(), b"initial");
    }

    #[test]
    fn test_read_handler_sees_current_value() {
        let (table, dispatcher, id) = setup(AttributePermissions::read_write());
        table
            .set_read_handler(
                id,
                Some(Arc::new(|_: CharacteristicId, current: &[u8]| {
                    let mut response = current.to_vec();
                    response.extend_from_slice(b"!");
                    response
                })),
            )
            .unwrap();

        assert_eq!(dispatcher.handle_read(id).unwrap(), b"initial!");
        // The handler's response is not stored
        assert_eq!(table.get_value(id).unwrap(), b"initial");
    }

    #[test]
    fn test_write_without_handler_stores_value() {
        let (table, dispatcher, id) = setup(AttributePermissions::read_write());
        assert_eq!(dispatcher.handle_write(id, b"written").unwrap(), WriteOutcome::Accept);
        assert_eq!(table.get_value(id).unwrap(), b"written");
    }

    #[test]
    fn test_write_handler_decides_stored_value() {
        let (table, dispatcher, id) = setup(AttributePermissions::read_write());
        table
            .set_write_handler(
                id,
                Some(Arc::new(|_: CharacteristicId, proposed: &[u8]| {
                    if proposed.is_empty() {
                        None
                    } else {
                        Some(proposed.to_ascii_uppercase())
                    }
                })),
            )
            .unwrap();

        assert_eq!(dispatcher.handle_write(id, b"abc").unwrap(), WriteOutcome::Accept);
        assert_eq!(table.get_value(id).unwrap(), b"ABC");

        assert_eq!(dispatcher.handle_write(id, b"").unwrap(), WriteOutcome::Reject);
        assert_eq!(table.get_value(id).unwrap(), b"ABC");
    }

    #[test]
    fn test_permissions_enforced() {
        let (table, dispatcher, id) = setup(AttributePermissions::READABLE);
        assert_eq!(
            dispatcher.handle_write(id, b"nope"),
            Err(PeripheralError::PermissionDenied(id))
        );
        assert_eq!(table.get_value(id).unwrap(), b"initial");

        let (_table, dispatcher, id) = setup(AttributePermissions::WRITEABLE);
        assert_eq!(dispatcher.handle_read(id), Err(PeripheralError::PermissionDenied(id)));
    }

    #[test]
    fn test_handlers_are_serialized_per_characteristic() {
        let (table, dispatcher, id) = setup(AttributePermissions::read_write());
        let active = Arc::new(AtomicUsize::new(0));
        let overlaps = Arc::new(AtomicUsize::new(0));
        {
            let active = active.clone();
            let overlaps = overlaps.clone();
            table
                .set_write_handler(
                    id,
                    Some(Arc::new(move |_: CharacteristicId, proposed: &[u8]| {
                        if active.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlaps.fetch_add(1, Ordering::SeqCst);
                        }
                        thread::sleep(Duration::from_millis(2));
                        active.fetch_sub(1, Ordering::SeqCst);
                        Some(proposed.to_vec())
                    })),
                )
                .unwrap();
        }

        let dispatcher = Arc::new(dispatcher);
        let barrier = Arc::new(Barrier::new(4));
        let workers: Vec<_> = (0..4u8)
            .map(|n| {
                let dispatcher = dispatcher.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    for _ in 0..5 {
                        dispatcher.handle_write(id, &[n]).unwrap();
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
        assert_eq!(table.get_value(id).unwrap().len(), 1);
    }
}
