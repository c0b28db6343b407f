//! RustyBlue Peripheral - a BLE GATT peripheral engine
//!
//! This library maps one abstract GATT data model (services containing
//! characteristics) onto a platform adapter that talks to the OS Bluetooth
//! stack. It answers remote reads and writes through per-characteristic
//! handlers, tracks which centrals are subscribed, and fans value updates out
//! to all of them with per-subscriber failure isolation.
//!
//! ```no_run
//! use rustyblue_peripheral::adapter::LoopbackAdapter;
//! use rustyblue_peripheral::gatt::{
//!     AttributePermissions, CharacteristicProperties, PeripheralServer,
//! };
//! use rustyblue_peripheral::Uuid;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let server = PeripheralServer::new(LoopbackAdapter::new());
//! let service = server.add_service("A07498CA-AD5B-474E-940D-16F1FBE7E8CD".parse()?)?;
//! let characteristic = server.add_characteristic(
//!     service,
//!     "51FF12BB-3ED8-46E5-B4F9-D64E2FEC021B".parse::<Uuid>()?,
//!     CharacteristicProperties::READ | CharacteristicProperties::WRITE | CharacteristicProperties::INDICATE,
//!     AttributePermissions::read_write(),
//!     Vec::new(),
//! )?;
//! server.start()?;
//! server.wait_for_connection(None);
//! server.update_value(characteristic, b"Welcome")?;
//! server.stop()?;
//! # Ok(())
//! # }
//! ```

pub mod adapter;
pub mod error;
pub mod gatt;
pub mod uuid;

// Re-export common types for convenience
pub use adapter::{LoopbackAdapter, PlatformAdapter, SubscriptionEvent};
pub use error::{AdapterError, NotificationFailure, PeripheralError, PeripheralResult};
pub use gatt::{
    AttributePermissions, CharacteristicId, CharacteristicProperties, NotificationReport,
    PeripheralConfig, PeripheralServer, PeripheralState, ServiceId, SubscriberHandle,
    WriteOutcome,
};
pub use uuid::{Uuid, UuidParseError};
