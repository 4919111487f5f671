//! NCIR2 infrared thermometer driver.
//!
//! Plain register-mapped I2C device built around an MLX90614 core: object
//! temperature, emissivity, low/high temperature alarms with LED and buzzer
//! actions, plus a user-controllable buzzer, RGB LED and button. Multi-byte
//! values are little endian. Settings persist only after an explicit save.

use crate::bus::i2c::I2cBus;
use crate::config::sensor_config::SensorEntry;
use crate::errors::{SensorError, SensorResult};
use crate::sensors::{Alarm, Rgb, SensorDriver, SensorFactory, ThermoFrame};
use async_trait::async_trait;
use tracing::debug;

const REG_TEMPERATURE: u8 = 0x00;
const REG_EMISSIVITY: u8 = 0x10;
const REG_ALARM_TEMPERATURE: u8 = 0x20;
const REG_ALARM_LED: u8 = 0x30;
const REG_ALARM_BUZZER: u8 = 0x40;
const REG_BUZZER: u8 = 0x50;
const REG_BUZZER_CONTROL: u8 = 0x53;
const REG_LED: u8 = 0x60;
const REG_BUTTON: u8 = 0x70;
const REG_SAVE_CONFIG: u8 = 0x80;
const REG_CHIP_TEMPERATURE: u8 = 0x90;
const REG_FIRMWARE_VERSION: u8 = 0xFE;
const REG_I2C_ADDRESS: u8 = 0xFF;

const DEFAULT_INTERVAL_MS: u64 = 250;

/// User buzzer settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BuzzerConfig {
    pub freq_hz: u16,
    /// Duty cycle, 0.0..=1.0
    pub duty: f32,
}

/// Alarm buzzer settings; the buzzer beeps at `interval_ms` while the alarm
/// condition holds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlarmBuzzerConfig {
    pub freq_hz: u16,
    /// Beep interval, 1..=5000 ms
    pub interval_ms: u16,
    /// Duty cycle, 0.0..=1.0
    pub duty: f32,
}

// The duty register is piecewise linear: 0..=127 spans 0%..50%,
// 128..=255 spans 50%..100%.
fn raw_to_duty(raw: u8) -> f32 {
    if raw < 128 {
        raw as f32 / 127.0 * 0.5
    } else {
        (raw as f32 - 127.0) / 128.0 * 0.5 + 0.5
    }
}

fn duty_to_raw(duty: f32) -> u8 {
    let duty = duty.clamp(0.0, 1.0);
    if duty <= 0.5 {
        (duty * 255.0) as u8
    } else {
        (127.0 + 128.0 * (2.0 * (duty - 0.5))) as u8
    }
}

pub struct Ncir2 {
    id: String,
    address: u8,
    bus_id: String,
    emissivity: Option<f32>,
    interval_ms: u64,
}

impl Ncir2 {
    fn new(
        id: String,
        address: u8,
        bus_id: String,
        emissivity: Option<f32>,
        interval_ms: u64,
    ) -> Self {
        Self {
            id,
            address,
            bus_id,
            emissivity,
            interval_ms,
        }
    }

    async fn read_reg(&self, bus: &mut dyn I2cBus, reg: u8, buf: &mut [u8]) -> SensorResult<()> {
        bus.read_bytes(self.address, reg, buf).await?;
        Ok(())
    }

    async fn read_i16(&self, bus: &mut dyn I2cBus, reg: u8) -> SensorResult<i16> {
        let mut buf = [0u8; 2];
        self.read_reg(bus, reg, &mut buf).await?;
        Ok(i16::from_le_bytes(buf))
    }

    async fn read_u16(&self, bus: &mut dyn I2cBus, reg: u8) -> SensorResult<u16> {
        let mut buf = [0u8; 2];
        self.read_reg(bus, reg, &mut buf).await?;
        Ok(u16::from_le_bytes(buf))
    }

    async fn read_u8(&self, bus: &mut dyn I2cBus, reg: u8) -> SensorResult<u8> {
        let mut buf = [0u8; 1];
        self.read_reg(bus, reg, &mut buf).await?;
        Ok(buf[0])
    }

    /// Object temperature in Celsius
    pub async fn read_temperature(&self, bus: &mut dyn I2cBus) -> SensorResult<f32> {
        Ok(self.read_i16(bus, REG_TEMPERATURE).await? as f32 * 0.01)
    }

    /// Internal (die) temperature in Celsius
    pub async fn read_chip_temperature(&self, bus: &mut dyn I2cBus) -> SensorResult<f32> {
        Ok(self.read_i16(bus, REG_CHIP_TEMPERATURE).await? as f32 * 0.01)
    }

    pub async fn read_emissivity(&self, bus: &mut dyn I2cBus) -> SensorResult<f32> {
        Ok(self.read_u16(bus, REG_EMISSIVITY).await? as f32 / 65535.0)
    }

    pub async fn write_emissivity(&self, bus: &mut dyn I2cBus, e: f32) -> SensorResult<()> {
        if !(0.1..=1.0).contains(&e) {
            return Err(SensorError::ConfigError {
                sensor: self.id.clone(),
                reason: format!("emissivity must be between 0.1 and 1.0 ({e})"),
            });
        }
        let raw = (65535.0 * e).round() as u16;
        bus.write_bytes(self.address, REG_EMISSIVITY, &raw.to_le_bytes())
            .await?;
        Ok(())
    }

    /// Alarm threshold temperature in Celsius
    pub async fn read_alarm_temperature(
        &self,
        bus: &mut dyn I2cBus,
        alarm: Alarm,
    ) -> SensorResult<f32> {
        let reg = REG_ALARM_TEMPERATURE + 2 * alarm as u8;
        Ok(self.read_i16(bus, reg).await? as f32 * 0.01)
    }

    pub async fn write_alarm_temperature(
        &self,
        bus: &mut dyn I2cBus,
        alarm: Alarm,
        celsius: f32,
    ) -> SensorResult<()> {
        let reg = REG_ALARM_TEMPERATURE + 2 * alarm as u8;
        let raw = (celsius * 100.0).round() as i16;
        bus.write_bytes(self.address, reg, &raw.to_le_bytes()).await?;
        Ok(())
    }

    pub async fn read_alarm_led(&self, bus: &mut dyn I2cBus, alarm: Alarm) -> SensorResult<Rgb> {
        let reg = REG_ALARM_LED + 3 * alarm as u8;
        let mut buf = [0u8; 3];
        self.read_reg(bus, reg, &mut buf).await?;
        Ok(Rgb {
            r: buf[0],
            g: buf[1],
            b: buf[2],
        })
    }

    pub async fn write_alarm_led(
        &self,
        bus: &mut dyn I2cBus,
        alarm: Alarm,
        rgb: Rgb,
    ) -> SensorResult<()> {
        let reg = REG_ALARM_LED + 3 * alarm as u8;
        bus.write_bytes(self.address, reg, &[rgb.r, rgb.g, rgb.b])
            .await?;
        Ok(())
    }

    /// The alarm buzzer registers cannot be read as one block; the firmware
    /// only answers single-field reads past 0x40.
    pub async fn read_alarm_buzzer(
        &self,
        bus: &mut dyn I2cBus,
        alarm: Alarm,
    ) -> SensorResult<AlarmBuzzerConfig> {
        let base = REG_ALARM_BUZZER + 5 * alarm as u8;
        let freq_hz = self.read_u16(bus, base).await?;
        let interval_ms = self.read_u16(bus, base + 2).await?;
        let duty = raw_to_duty(self.read_u8(bus, base + 4).await?);
        Ok(AlarmBuzzerConfig {
            freq_hz,
            interval_ms,
            duty,
        })
    }

    pub async fn write_alarm_buzzer(
        &self,
        bus: &mut dyn I2cBus,
        alarm: Alarm,
        cfg: AlarmBuzzerConfig,
    ) -> SensorResult<()> {
        if !(1..=5000).contains(&cfg.interval_ms) {
            return Err(SensorError::ConfigError {
                sensor: self.id.clone(),
                reason: format!("beep interval must be 1..=5000 ms ({})", cfg.interval_ms),
            });
        }
        let base = REG_ALARM_BUZZER + 5 * alarm as u8;
        let [f_lo, f_hi] = cfg.freq_hz.to_le_bytes();
        let [i_lo, i_hi] = cfg.interval_ms.to_le_bytes();
        bus.write_bytes(
            self.address,
            base,
            &[f_lo, f_hi, i_lo, i_hi, duty_to_raw(cfg.duty)],
        )
        .await?;
        Ok(())
    }

    pub async fn read_buzzer(&self, bus: &mut dyn I2cBus) -> SensorResult<BuzzerConfig> {
        let freq_hz = self.read_u16(bus, REG_BUZZER).await?;
        let duty = raw_to_duty(self.read_u8(bus, REG_BUZZER + 2).await?);
        Ok(BuzzerConfig { freq_hz, duty })
    }

    pub async fn write_buzzer(&self, bus: &mut dyn I2cBus, cfg: BuzzerConfig) -> SensorResult<()> {
        let [f_lo, f_hi] = cfg.freq_hz.to_le_bytes();
        bus.write_bytes(
            self.address,
            REG_BUZZER,
            &[f_lo, f_hi, duty_to_raw(cfg.duty)],
        )
        .await?;
        Ok(())
    }

    pub async fn write_buzzer_control(&self, bus: &mut dyn I2cBus, on: bool) -> SensorResult<()> {
        bus.write_byte(self.address, REG_BUZZER_CONTROL, on as u8)
            .await?;
        Ok(())
    }

    pub async fn read_led(&self, bus: &mut dyn I2cBus) -> SensorResult<Rgb> {
        let mut buf = [0u8; 3];
        self.read_reg(bus, REG_LED, &mut buf).await?;
        Ok(Rgb {
            r: buf[0],
            g: buf[1],
            b: buf[2],
        })
    }

    pub async fn write_led(&self, bus: &mut dyn I2cBus, rgb: Rgb) -> SensorResult<()> {
        bus.write_bytes(self.address, REG_LED, &[rgb.r, rgb.g, rgb.b])
            .await?;
        Ok(())
    }

    /// The register reads 0 while the button is held down
    pub async fn button_pressed(&self, bus: &mut dyn I2cBus) -> SensorResult<bool> {
        Ok(self.read_u8(bus, REG_BUTTON).await? == 0)
    }

    /// Persists the current emissivity and alarm settings to flash
    pub async fn save_config(&self, bus: &mut dyn I2cBus) -> SensorResult<()> {
        bus.write_byte(self.address, REG_SAVE_CONFIG, 1).await?;
        Ok(())
    }

    pub async fn firmware_version(&self, bus: &mut dyn I2cBus) -> SensorResult<u8> {
        self.read_u8(bus, REG_FIRMWARE_VERSION).await
    }

    /// Writes a new slave address and switches the driver over; the device
    /// answers on the new address after a power cycle.
    pub async fn change_i2c_address(&mut self, bus: &mut dyn I2cBus, address: u8) -> SensorResult<()> {
        if !(0x08..=0x77).contains(&address) {
            return Err(SensorError::ConfigError {
                sensor: self.id.clone(),
                reason: format!("invalid I2C address {address:#04x}"),
            });
        }
        bus.write_byte(self.address, REG_I2C_ADDRESS, address).await?;
        self.address = address;
        Ok(())
    }
}

#[async_trait]
impl SensorDriver for Ncir2 {
    async fn init(&mut self, bus: &mut dyn I2cBus) -> SensorResult<()> {
        let fw = self.firmware_version(bus).await?;
        if fw == 0 {
            return Err(SensorError::InitError {
                sensor: self.id.clone(),
                reason: "firmware version register reads 0".to_string(),
            });
        }
        debug!("[{}] firmware version {}", self.id, fw);

        if let Some(e) = self.emissivity {
            let current = self.read_emissivity(bus).await?;
            if (current - e).abs() > 0.5 / 65535.0 {
                self.write_emissivity(bus, e).await?;
                self.save_config(bus).await?;
            }
        }
        Ok(())
    }

    async fn read(&mut self, bus: &mut dyn I2cBus) -> SensorResult<ThermoFrame> {
        let object_c = self.read_temperature(bus).await?;
        let ambient_c = self.read_chip_temperature(bus).await?;
        Ok(ThermoFrame {
            ambient_c: Some(ambient_c),
            object_c: Some(object_c),
            ..ThermoFrame::default()
        })
    }

    fn id(&self) -> &str {
        &self.id
    }

    fn bus(&self) -> &str {
        &self.bus_id
    }

    fn interval_ms(&self) -> u64 {
        self.interval_ms
    }
}

pub struct Ncir2Factory;

pub static NCIR2_FACTORY: Ncir2Factory = Ncir2Factory;

impl SensorFactory for Ncir2Factory {
    fn name(&self) -> &'static str {
        "ncir2"
    }

    fn create(&self, entry: &SensorEntry) -> SensorResult<Box<dyn SensorDriver + Send>> {
        if let Some(e) = entry.emissivity {
            if !(0.1..=1.0).contains(&e) {
                return Err(SensorError::ConfigError {
                    sensor: entry.id.clone(),
                    reason: format!("emissivity must be between 0.1 and 1.0 ({e})"),
                });
            }
        }
        Ok(Box::new(Ncir2::new(
            entry.id.clone(),
            entry.address,
            entry.bus.clone(),
            entry.emissivity,
            entry.interval_ms.unwrap_or(DEFAULT_INTERVAL_MS),
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::{MockBus, Transfer};

    const ADDR: u8 = 0x5A;

    fn driver() -> Ncir2 {
        Ncir2::new(
            "ncir0".to_string(),
            ADDR,
            "i2c0".to_string(),
            None,
            DEFAULT_INTERVAL_MS,
        )
    }

    fn read(reg: u8, response: Vec<u8>) -> Transfer {
        Transfer::Read {
            address: ADDR,
            reg,
            response,
        }
    }

    fn write(reg: u8, data: Vec<u8>) -> Transfer {
        Transfer::Write {
            address: ADDR,
            reg,
            data,
        }
    }

    #[test]
    fn duty_conversion_is_piecewise_linear() {
        assert_eq!(duty_to_raw(0.0), 0);
        assert_eq!(duty_to_raw(1.0), 255);
        assert!((raw_to_duty(127) - 0.5).abs() < 0.01);
        assert!((raw_to_duty(255) - 1.0).abs() < 0.001);
        for raw in [0u8, 40, 127, 128, 200, 255] {
            let round = duty_to_raw(raw_to_duty(raw));
            assert!(round.abs_diff(raw) <= 1, "raw {raw} -> {round}");
        }
    }

    #[tokio::test]
    async fn read_decodes_signed_centidegrees() {
        let mut bus = MockBus::new(vec![
            read(REG_TEMPERATURE, vec![0xE3, 0x09]),      // 25.31 C
            read(REG_CHIP_TEMPERATURE, vec![0x0C, 0xFE]), // -5.00 C
        ]);
        let mut d = driver();
        let frame = d.read(&mut bus).await.unwrap();
        bus.done();
        assert!((frame.object_c.unwrap() - 25.31).abs() < 0.001);
        assert!((frame.ambient_c.unwrap() + 5.0).abs() < 0.001);
        assert!(frame.image.is_none());
    }

    #[tokio::test]
    async fn bus_failures_propagate() {
        let mut bus = MockBus::new(vec![Transfer::ReadError {
            address: ADDR,
            reg: REG_TEMPERATURE,
        }]);
        let mut d = driver();
        assert!(matches!(
            d.read(&mut bus).await,
            Err(SensorError::I2cError(_))
        ));
        bus.done();
    }

    #[tokio::test]
    async fn init_rejects_zero_firmware_version() {
        let mut bus = MockBus::new(vec![read(REG_FIRMWARE_VERSION, vec![0x00])]);
        let mut d = driver();
        assert!(matches!(
            d.init(&mut bus).await,
            Err(SensorError::InitError { .. })
        ));
    }

    #[tokio::test]
    async fn init_applies_configured_emissivity() {
        let mut bus = MockBus::new(vec![
            read(REG_FIRMWARE_VERSION, vec![0x02]),
            read(REG_EMISSIVITY, vec![0xFF, 0xFF]), // currently 1.0
            write(REG_EMISSIVITY, vec![0x32, 0xF3]), // 0.95
            write(REG_SAVE_CONFIG, vec![0x01]),
        ]);
        let mut d = Ncir2::new(
            "ncir0".to_string(),
            ADDR,
            "i2c0".to_string(),
            Some(0.95),
            DEFAULT_INTERVAL_MS,
        );
        d.init(&mut bus).await.unwrap();
        bus.done();
    }

    #[tokio::test]
    async fn init_skips_emissivity_already_in_effect() {
        let mut bus = MockBus::new(vec![
            read(REG_FIRMWARE_VERSION, vec![0x02]),
            read(REG_EMISSIVITY, vec![0x32, 0xF3]),
        ]);
        let mut d = Ncir2::new(
            "ncir0".to_string(),
            ADDR,
            "i2c0".to_string(),
            Some(0.95),
            DEFAULT_INTERVAL_MS,
        );
        d.init(&mut bus).await.unwrap();
        bus.done();
    }

    #[tokio::test]
    async fn alarm_registers_are_strided_per_alarm() {
        let mut bus = MockBus::new(vec![
            write(0x22, vec![0x88, 0x13]), // high alarm at 50.00 C
            read(0x20, vec![0x18, 0xFC]),  // low alarm at -10.00 C
            write(0x33, vec![0xFF, 0x00, 0x00]), // high alarm LED red
        ]);
        let d = driver();
        d.write_alarm_temperature(&mut bus, Alarm::High, 50.0)
            .await
            .unwrap();
        let low = d.read_alarm_temperature(&mut bus, Alarm::Low).await.unwrap();
        d.write_alarm_led(&mut bus, Alarm::High, Rgb { r: 0xFF, g: 0, b: 0 })
            .await
            .unwrap();
        bus.done();
        assert!((low + 10.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn alarm_buzzer_reads_fields_individually() {
        let mut bus = MockBus::new(vec![
            read(0x45, vec![0xA0, 0x0F]), // high alarm freq 4000 Hz
            read(0x47, vec![0xF4, 0x01]), // interval 500 ms
            read(0x49, vec![127]),        // duty 0.5
        ]);
        let d = driver();
        let cfg = d.read_alarm_buzzer(&mut bus, Alarm::High).await.unwrap();
        bus.done();
        assert_eq!(cfg.freq_hz, 4000);
        assert_eq!(cfg.interval_ms, 500);
        assert!((cfg.duty - 0.5).abs() < 0.01);
    }

    #[tokio::test]
    async fn alarm_buzzer_write_validates_interval() {
        let mut bus = MockBus::new(vec![write(0x40, vec![0xA0, 0x0F, 0xF4, 0x01, 127])]);
        let d = driver();
        let cfg = AlarmBuzzerConfig {
            freq_hz: 4000,
            interval_ms: 500,
            duty: 0.5,
        };
        d.write_alarm_buzzer(&mut bus, Alarm::Low, cfg).await.unwrap();
        bus.done();

        let mut bus = MockBus::new(vec![]);
        let bad = AlarmBuzzerConfig {
            interval_ms: 6000,
            ..cfg
        };
        assert!(matches!(
            d.write_alarm_buzzer(&mut bus, Alarm::Low, bad).await,
            Err(SensorError::ConfigError { .. })
        ));
    }

    #[tokio::test]
    async fn buzzer_roundtrip_and_control() {
        let mut bus = MockBus::new(vec![
            write(REG_BUZZER, vec![0xD0, 0x07, 255]), // 2000 Hz, full duty
            read(REG_BUZZER, vec![0xD0, 0x07]),
            read(0x52, vec![255]),
            write(REG_BUZZER_CONTROL, vec![0x01]),
            write(REG_BUZZER_CONTROL, vec![0x00]),
        ]);
        let d = driver();
        d.write_buzzer(
            &mut bus,
            BuzzerConfig {
                freq_hz: 2000,
                duty: 1.0,
            },
        )
        .await
        .unwrap();
        let cfg = d.read_buzzer(&mut bus).await.unwrap();
        d.write_buzzer_control(&mut bus, true).await.unwrap();
        d.write_buzzer_control(&mut bus, false).await.unwrap();
        bus.done();
        assert_eq!(cfg.freq_hz, 2000);
        assert!((cfg.duty - 1.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn button_register_is_inverted() {
        let mut bus = MockBus::new(vec![
            read(REG_BUTTON, vec![0x00]),
            read(REG_BUTTON, vec![0x01]),
        ]);
        let d = driver();
        assert!(d.button_pressed(&mut bus).await.unwrap());
        assert!(!d.button_pressed(&mut bus).await.unwrap());
        bus.done();
    }

    #[tokio::test]
    async fn address_change_validates_range() {
        let mut d = driver();
        let mut bus = MockBus::new(vec![write(REG_I2C_ADDRESS, vec![0x5B])]);
        d.change_i2c_address(&mut bus, 0x5B).await.unwrap();
        bus.done();

        let mut bus = MockBus::new(vec![]);
        assert!(d.change_i2c_address(&mut bus, 0x00).await.is_err());
    }
}
