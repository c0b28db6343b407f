//! Example of an echo peripheral
//!
//! Publishes one service with a read/write/indicate characteristic, waits for a
//! central to subscribe, then indicates every line typed on stdin until `quit`.
//! A simulated central on the loopback adapter subscribes and writes so the
//! example runs without Bluetooth hardware.
//!
//! Run with `RUST_LOG=debug` to see the engine's log output.

use rustyblue_peripheral::adapter::LoopbackAdapter;
use rustyblue_peripheral::gatt::{
    AttributePermissions, CharacteristicId, CharacteristicProperties, PeripheralServer,
};
use rustyblue_peripheral::Uuid;
use std::io::BufRead;
use std::thread;
use std::time::Duration;

const SERVICE_UUID: &str = "A07498CA-AD5B-474E-940D-16F1FBE7E8CD";
const CHARACTERISTIC_UUID: &str = "51FF12BB-3ED8-46E5-B4F9-D64E2FEC021B";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let adapter = LoopbackAdapter::new();
    let server = PeripheralServer::new(adapter.clone());

    let service = server.add_service(SERVICE_UUID.parse()?)?;
    let echo = server.add_characteristic(
        service,
        CHARACTERISTIC_UUID.parse::<Uuid>()?,
        CharacteristicProperties::READ
            | CharacteristicProperties::WRITE
            | CharacteristicProperties::INDICATE,
        AttributePermissions::read_write(),
        Vec::new(),
    )?;
    println!("Added echo service {}", SERVICE_UUID);

    server.set_read_handler(echo, |id, current| {
        println!("Central read {}: {:?}", id, String::from_utf8_lossy(current));
        current.to_vec()
    })?;
    server.set_write_handler(echo, |id, proposed| {
        println!("Central wrote {}: {:?}", id, String::from_utf8_lossy(proposed));
        Some(proposed.to_vec())
    })?;

    server.start()?;
    println!("Peripheral '{}' is advertising", server.name());

    let central = spawn_central(adapter.clone(), echo);

    println!("Waiting for a central to subscribe...");
    if !server.wait_for_connection(Some(Duration::from_secs(30))) {
        println!("No central connected");
        server.stop()?;
        return Ok(());
    }
    println!("Central connected");

    server.update_value(echo, b"Welcome")?;

    println!("Type a line to send it, or 'quit' to stop");
    for line in std::io::stdin().lock().lines() {
        let line = line?;
        if line.trim() == "quit" {
            break;
        }
        let report = server.update_value(echo, line.as_bytes())?;
        println!("Sent to {}/{} subscriber(s)", report.delivered(), report.attempted);
    }

    server.stop()?;
    println!("Peripheral stopped");

    let _ = central.join();
    for sent in adapter.take_sent() {
        println!(
            "{} received {:?}",
            sent.subscriber,
            String::from_utf8_lossy(&sent.value)
        );
    }
    Ok(())
}

/// Subscribe a pretend central and have it write a greeting back
fn spawn_central(adapter: LoopbackAdapter, echo: CharacteristicId) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        thread::sleep(Duration::from_millis(500));
        // Platforms such as CoreBluetooth identify centrals by a random UUID
        let central = Uuid::new_random_v4().to_string();
        if let Err(e) = adapter.subscribe(echo, central) {
            eprintln!("Central failed to subscribe: {}", e);
            return;
        }
        thread::sleep(Duration::from_millis(100));
        if let Err(e) = adapter.write(echo, b"hello from central") {
            eprintln!("Central write failed: {}", e);
        }
        match adapter.read(echo) {
            Ok(value) => println!("Central read back {:?}", String::from_utf8_lossy(&value)),
            Err(e) => eprintln!("Central read failed: {}", e),
        }
    })
}
