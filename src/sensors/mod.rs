#[cfg(feature = "mlx90614")]
pub mod mlx90614;
#[cfg(feature = "ncir2")]
pub mod ncir2;
#[cfg(feature = "thermal2")]
pub mod thermal2;

use crate::bus::i2c::I2cBus;
use crate::config::sensor_config::SensorEntry;
use crate::errors::{SensorError, SensorResult};
use async_trait::async_trait;

/// Which of the two temperature alarms an operation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Alarm {
    Low = 0,
    High = 1,
}

/// LED color as exposed by devices with an RGB status LED
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Rgb {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// Frame statistics for one thermal-array subpage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThermalStats {
    pub median_c: f32,
    pub average_c: f32,
    pub most_diff_c: f32,
    pub most_diff_xy: (u8, u8),
    pub lowest_c: f32,
    pub lowest_xy: (u8, u8),
    pub highest_c: f32,
    pub highest_xy: (u8, u8),
}

/// Half-frame of pixel temperatures from a thermal array
#[derive(Debug, Clone, PartialEq)]
pub struct ThermalImage {
    /// 0: even rows, 1: odd rows
    pub subpage: u8,
    pub width: u8,
    pub height: u8,
    /// Row major within the subpage, `width * height` entries
    pub pixels_c: Vec<f32>,
}

/// A decoded measurement snapshot; channels a device lacks (or flagged
/// invalid by the device) stay `None`
#[derive(Debug, Default, Clone)]
pub struct ThermoFrame {
    pub ambient_c: Option<f32>,
    pub object_c: Option<f32>,
    pub object2_c: Option<f32>,
    pub stats: Option<ThermalStats>,
    pub image: Option<ThermalImage>,
}

#[async_trait]
pub trait SensorDriver: Send + Sync {
    async fn init(&mut self, bus: &mut dyn I2cBus) -> SensorResult<()>;
    async fn read(&mut self, bus: &mut dyn I2cBus) -> SensorResult<ThermoFrame>;
    fn id(&self) -> &str;
    fn bus(&self) -> &str;
    /// Native measurement interval derived from the device configuration
    fn interval_ms(&self) -> u64;
}

pub trait SensorFactory: Sync {
    fn name(&self) -> &'static str;
    fn create(&self, entry: &SensorEntry) -> SensorResult<Box<dyn SensorDriver + Send>>;
}

#[cfg(feature = "mlx90614")]
pub use self::mlx90614::{MLX90614BAA_FACTORY, MLX90614_FACTORY};
#[cfg(feature = "ncir2")]
pub use self::ncir2::NCIR2_FACTORY;
#[cfg(feature = "thermal2")]
pub use self::thermal2::THERMAL2_FACTORY;

pub static SENSOR_FACTORIES: &[&dyn SensorFactory] = &[
    #[cfg(feature = "mlx90614")]
    &MLX90614_FACTORY,
    #[cfg(feature = "mlx90614")]
    &MLX90614BAA_FACTORY,
    #[cfg(feature = "ncir2")]
    &NCIR2_FACTORY,
    #[cfg(feature = "thermal2")]
    &THERMAL2_FACTORY,
];

pub fn create_sensor_driver(entry: &SensorEntry) -> SensorResult<Box<dyn SensorDriver + Send>> {
    SENSOR_FACTORIES
        .iter()
        .find(|f| f.name() == entry.driver)
        .ok_or_else(|| SensorError::UnsupportedDriver {
            driver: entry.driver.clone(),
        })?
        .create(entry)
}
