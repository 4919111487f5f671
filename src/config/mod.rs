pub mod bus_config;
pub mod sensor_config;

pub use bus_config::{load_bus_config, BusConfig};
pub use sensor_config::{load_sensor_config, SensorConfig};
