use std::time::Duration;

use skylink_core::config::{Config, DeviceConfig, SessionDefaults, TransportConfig};
use skylink_core::logging;

use skylink_engine::event::{SessionEvent, SessionEventKind};
use skylink_engine::{HasShutter, HasTemperatureSensor, MovesAbsolute, SessionRegistry, Slews};

fn simulated(name: &str, driver: &str) -> DeviceConfig {
    DeviceConfig::new(
        name,
        driver,
        TransportConfig::Simulated {
            model: driver.to_string(),
        },
    )
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    logging::init()?;

    // Every device here talks to an in-process simulator
    let config = Config {
        session: SessionDefaults {
            poll_interval_ms: 250,
            ..SessionDefaults::default()
        },
        devices: vec![
            simulated("focuser", "frame-focuser"),
            simulated("dome", "dome"),
            simulated("mount", "alpaca-telescope"),
        ],
        ..Config::default()
    };

    let registry = SessionRegistry::from_config(&config)?;

    // Watch state changes across the whole observatory
    let mut events = registry.event_bus().subscribe::<SessionEvent>()?;
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let SessionEventKind::StateChanged { from, to } = event.kind {
                println!("[{}] {} -> {}", event.device, from, to);
            }
        }
    });

    for (name, result) in registry.connect_all().await {
        println!("{}: {}", name, if result.is_ok() { "connected" } else { "failed" });
    }

    let focuser = registry.get("focuser")?;
    let _position = focuser.subscribe("position", |change| {
        println!("focuser position {:?} -> {:?}", change.old, change.new);
    });
    println!("focuser temperature: {:?}", focuser.temperature().await?);

    let dome = registry.get("dome")?;
    let mount = registry.get("mount")?;

    // Run three operations at once, one per device
    let focus = focuser.move_to(1500).await?;
    let shutter = dome.open_shutter().await?;
    let slew = mount.slew_to(5.5, 22.0).await?;

    for handle in [focus, shutter, slew] {
        let op = tokio::time::timeout(Duration::from_secs(30), handle.wait()).await?;
        println!("{} {} finished: {}", op.kind(), op.id, op.status);
    }

    registry.disconnect_all().await;
    Ok(())
}
