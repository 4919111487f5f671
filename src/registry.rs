use crate::bus::i2c::LinuxI2cBus;
use crate::config::load_bus_config;
use crate::config::sensor_config::SensorConfig;
use crate::errors::{RegistryError, RegistryResult, SensorError};
use crate::sensors::{create_sensor_driver, SensorDriver};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

pub type BusMap = HashMap<String, Arc<Mutex<LinuxI2cBus>>>;

/// Opens every configured bus, creates the configured drivers and runs their
/// init sequences. A sensor that fails init aborts startup; a half-configured
/// hub is worse than a loud failure.
pub async fn init_all(
    sensor_config: &SensorConfig,
) -> RegistryResult<(Vec<Box<dyn SensorDriver + Send>>, BusMap)> {
    let config_path = std::env::var("CONFIG_PATH").unwrap_or_else(|_| "config".to_string());
    let bus_config_path = format!("{}/buses.toml", config_path);
    let bus_cfg = load_bus_config(&bus_config_path)?;

    let mut bus_map: BusMap = HashMap::new();
    for b in bus_cfg.buses.iter() {
        if b.r#type != "i2c" {
            info!("[registry] skipping bus {} (type '{}')", b.id, b.r#type);
            continue;
        }
        let bus = LinuxI2cBus::new(&b.path).map_err(|e| {
            RegistryError::RegistrationError(SensorError::I2cError(e))
        })?;
        info!("[registry] opened bus {} at {}", b.id, b.path);
        bus_map.insert(b.id.clone(), Arc::new(Mutex::new(bus)));
    }

    let mut sensors: Vec<Box<dyn SensorDriver + Send>> = Vec::new();
    info!(
        "[registry] initializing {} sensor(s)...",
        sensor_config.sensors.len()
    );
    for s in sensor_config.sensors.iter() {
        let mut sensor = create_sensor_driver(s).map_err(RegistryError::DriverCreationError)?;
        info!(
            "[registry] registering sensor: id={} driver={} bus={} address={:#04x}",
            s.id, s.driver, s.bus, s.address
        );

        let bus_arc = bus_map.get(&s.bus).ok_or_else(|| {
            RegistryError::DriverCreationError(SensorError::BusNotFound { bus: s.bus.clone() })
        })?;
        let mut bus = bus_arc.lock().await;
        sensor
            .init(&mut *bus)
            .await
            .map_err(RegistryError::RegistrationError)?;
        drop(bus);
        sensors.push(sensor);
    }

    Ok((sensors, bus_map))
}
