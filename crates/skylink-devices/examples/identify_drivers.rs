use std::time::Duration;

use skylink_core::config::{DeviceConfig, TransportConfig};
use skylink_devices::device::TransportAddress;
use skylink_devices::drivers::{self, DRIVER_NAMES};
use skylink_devices::property::PropertyStore;
use skylink_devices::sim;
use skylink_devices::transport::{Connector, Link};

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize the logger
    let subscriber = FmtSubscriber::builder()
        .with_max_level(Level::DEBUG)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Identify and poll each driver against its simulator
    for name in DRIVER_NAMES {
        let config = DeviceConfig::new(
            *name,
            *name,
            TransportConfig::Simulated {
                model: name.to_string(),
            },
        );
        let mut driver = drivers::build(&config)?;
        let connector = sim::connector_for(name)?;
        let address = TransportAddress::from(&config.transport);

        let transport = connector.open(&address, Duration::from_secs(1)).await?;
        let mut link = Link::new(transport, Duration::from_secs(1));

        let info = driver.handshake(&mut link).await?;
        info!("{} ({}) firmware {}", name, driver.kind(), info.firmware);

        let store = PropertyStore::from_schema(&driver.schema());
        for reading in driver.poll(&mut link, &store).await? {
            println!("  {:<20} {}", reading.key, reading.value);
        }
        link.close().await?;
    }

    Ok(())
}
