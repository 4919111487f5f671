use crate::errors::{ConfigError, ConfigResult};
use serde::Deserialize;
use std::fs;

#[cfg(feature = "mlx90614")]
use crate::sensors::mlx90614::{Fir, Gain, Iir, IrSensor};
#[cfg(feature = "thermal2")]
use crate::sensors::thermal2::Refresh;

/// Root configuration struct expecting `[[sensor]]` TOML array format
#[derive(Debug, Deserialize)]
pub struct SensorConfig {
    #[serde(rename = "sensor")]
    pub sensors: Vec<SensorEntry>,
}

/// One sensor entry, matching each `[[sensor]]` section.
///
/// Device-specific settings are optional; a driver falls back to its defaults
/// for any it does not find and rejects ones it does not understand at init.
#[derive(Debug, Deserialize)]
pub struct SensorEntry {
    pub id: String,
    pub driver: String,
    pub bus: String,
    pub address: u8,
    /// Overrides the driver's native measurement interval
    pub interval_ms: Option<u64>,

    // MLX90614 filter/gain settings
    #[cfg(feature = "mlx90614")]
    pub iir: Option<Iir>,
    #[cfg(feature = "mlx90614")]
    pub fir: Option<Fir>,
    #[cfg(feature = "mlx90614")]
    pub gain: Option<Gain>,
    #[cfg(feature = "mlx90614")]
    pub ir_sensor: Option<IrSensor>,

    /// Target emissivity, 0.1..=1.0 (MLX90614, NCIR2)
    #[cfg(any(feature = "mlx90614", feature = "ncir2"))]
    pub emissivity: Option<f32>,

    // Thermal2 settings
    #[cfg(feature = "thermal2")]
    pub refresh_rate: Option<Refresh>,
    #[cfg(feature = "thermal2")]
    pub noise_filter: Option<u8>,
    #[cfg(feature = "thermal2")]
    pub monitor_width: Option<u8>,
    #[cfg(feature = "thermal2")]
    pub monitor_height: Option<u8>,
    #[cfg(feature = "thermal2")]
    pub led_enabled: Option<bool>,
    #[cfg(feature = "thermal2")]
    pub buzzer_enabled: Option<bool>,
}

/// Loads sensor config from TOML file
pub fn load_sensor_config(path: &str) -> ConfigResult<SensorConfig> {
    let content = fs::read_to_string(path).map_err(|e| ConfigError::LoadError {
        path: path.to_string(),
        source: e,
    })?;
    let parsed: SensorConfig = toml::from_str(&content)?;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_entry() {
        let cfg: SensorConfig = toml::from_str(
            r#"
            [[sensor]]
            id = "ncir0"
            driver = "ncir2"
            bus = "i2c0"
            address = 0x5A
            "#,
        )
        .unwrap();
        assert_eq!(cfg.sensors.len(), 1);
        assert_eq!(cfg.sensors[0].driver, "ncir2");
        assert_eq!(cfg.sensors[0].address, 0x5A);
        assert!(cfg.sensors[0].interval_ms.is_none());
    }

    #[cfg(feature = "mlx90614")]
    #[test]
    fn parse_mlx90614_settings() {
        let cfg: SensorConfig = toml::from_str(
            r#"
            [[sensor]]
            id = "ir0"
            driver = "mlx90614baa"
            bus = "i2c0"
            address = 0x5A
            iir = "filter100"
            fir = "filter1024"
            gain = "coeff12_5"
            ir_sensor = "dual"
            emissivity = 0.95
            "#,
        )
        .unwrap();
        let s = &cfg.sensors[0];
        assert_eq!(s.iir, Some(Iir::Filter100));
        assert_eq!(s.fir, Some(Fir::Filter1024));
        assert_eq!(s.gain, Some(Gain::Coeff12_5));
        assert_eq!(s.ir_sensor, Some(IrSensor::Dual));
        assert_eq!(s.emissivity, Some(0.95));
    }

    #[cfg(feature = "thermal2")]
    #[test]
    fn parse_thermal2_settings() {
        let cfg: SensorConfig = toml::from_str(
            r#"
            [[sensor]]
            id = "cam0"
            driver = "thermal2"
            bus = "i2c0"
            address = 0x32
            refresh_rate = "16hz"
            noise_filter = 8
            monitor_width = 15
            monitor_height = 11
            led_enabled = true
            "#,
        )
        .unwrap();
        let s = &cfg.sensors[0];
        assert_eq!(s.refresh_rate, Some(Refresh::Rate16Hz));
        assert_eq!(s.noise_filter, Some(8));
        assert_eq!(s.led_enabled, Some(true));
    }
}
