//! Thermal2 32x24 thermal imaging camera driver.
//!
//! The device streams half-frames (subpages) of 384 pixels each; subpage 0
//! carries the even rows and subpage 1 the odd rows. Every frame comes with a
//! precomputed statistics block over a configurable monitor region. Pixel
//! statistics and image data are fetched in a single 784-byte batch read.
//! Multi-byte register values are little endian except the device ID and
//! firmware version.

use crate::bus::i2c::I2cBus;
use crate::config::sensor_config::SensorEntry;
use crate::errors::{SensorError, SensorResult};
use crate::sensors::{
    Alarm, Rgb, SensorDriver, SensorFactory, ThermalImage, ThermalStats, ThermoFrame,
};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

pub const DEFAULT_ADDRESS: u8 = 0x32;
pub const DEVICE_ID: u16 = 0x9064;

/// Full sensor array dimensions; a subpage holds half the rows
pub const WIDTH: u8 = 32;
pub const HEIGHT: u8 = 24;
const SUBPAGE_PIXELS: usize = (WIDTH as usize) * (HEIGHT as usize) / 2;

const REG_BUTTON_STATUS: u8 = 0x00;
const REG_DEVICE_ID: u8 = 0x04;
const REG_FIRMWARE_VERSION: u8 = 0x06;
const REG_I2C_ADDRESS: u8 = 0x08;
const REG_FUNCTION_CONTROL: u8 = 0x0A;
const REG_REFRESH_RATE: u8 = 0x0B;
const REG_NOISE_FILTER: u8 = 0x0C;
const REG_MONITOR_SIZE: u8 = 0x10;
const REG_ALARM_ENABLE: u8 = 0x11;
const REG_BUZZER_FREQ: u8 = 0x12;
const REG_BUZZER_DUTY: u8 = 0x14;
const REG_LED: u8 = 0x15;
const REG_LOW_ALARM_THRESHOLD: u8 = 0x20;
const REG_LOW_ALARM_BUZZER: u8 = 0x22;
const REG_LOW_ALARM_LED: u8 = 0x25;
// The high alarm block mirrors the low one at +0x10
const ALARM_STRIDE: u8 = 0x10;
const REG_DATA_REFRESH: u8 = 0x6E;
const REG_STATS: u8 = 0x70;

// Function control bits
pub const FUNCTION_BUZZER: u8 = 0x01;
pub const FUNCTION_LED: u8 = 0x02;
pub const FUNCTION_AUTO_REFRESH: u8 = 0x04;

// Stats block (16 bytes) + pixel array (768 bytes) in one transaction
const BATCH_LEN: usize = 16 + SUBPAGE_PIXELS * 2;

const SINGLESHOT_TIMEOUT_MS: u64 = 5000;

/// Frame refresh rate; also the subpage alternation rate in periodic mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum Refresh {
    #[serde(rename = "0.5hz")]
    Rate0_5Hz = 0,
    #[serde(rename = "1hz")]
    Rate1Hz = 1,
    #[serde(rename = "2hz")]
    Rate2Hz = 2,
    #[serde(rename = "4hz")]
    Rate4Hz = 3,
    #[serde(rename = "8hz")]
    Rate8Hz = 4,
    #[serde(rename = "16hz")]
    Rate16Hz = 5,
    #[serde(rename = "32hz")]
    Rate32Hz = 6,
    #[serde(rename = "64hz")]
    Rate64Hz = 7,
}

const INTERVAL_TABLE: [u64; 8] = [2000, 1000, 500, 250, 125, 62, 31, 15];

impl Refresh {
    fn from_bits(b: u8) -> Self {
        match b & 0x07 {
            0 => Refresh::Rate0_5Hz,
            1 => Refresh::Rate1Hz,
            2 => Refresh::Rate2Hz,
            3 => Refresh::Rate4Hz,
            4 => Refresh::Rate8Hz,
            5 => Refresh::Rate16Hz,
            6 => Refresh::Rate32Hz,
            _ => Refresh::Rate64Hz,
        }
    }

    /// Time between subpages at this rate
    pub fn interval_ms(self) -> u64 {
        INTERVAL_TABLE[self as usize]
    }
}

pub fn raw_to_celsius(raw: u16) -> f32 {
    raw as f32 / 128.0 - 64.0
}

pub fn celsius_to_raw(celsius: f32) -> u16 {
    ((celsius + 64.0) * 128.0).round().clamp(0.0, 65535.0) as u16
}

/// Snapshot of the button status register
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ButtonStatus(pub u8);

impl ButtonStatus {
    pub fn is_pressed(self) -> bool {
        self.0 & 0x01 != 0
    }
    pub fn was_pressed(self) -> bool {
        self.0 & 0x02 != 0
    }
    pub fn was_released(self) -> bool {
        self.0 & 0x04 != 0
    }
    pub fn was_clicked(self) -> bool {
        self.0 & 0x08 != 0
    }
    pub fn was_held(self) -> bool {
        self.0 & 0x10 != 0
    }
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    refresh_rate: Refresh,
    noise_filter: u8,
    monitor_width: u8,
    monitor_height: u8,
    led_enabled: bool,
    buzzer_enabled: bool,
}

pub struct Thermal2 {
    id: String,
    address: u8,
    bus_id: String,
    settings: Settings,
    interval_ms: u64,
    periodic: bool,
}

impl Thermal2 {
    fn new(id: String, address: u8, bus_id: String, settings: Settings, interval_ms: u64) -> Self {
        Self {
            id,
            address,
            bus_id,
            settings,
            interval_ms,
            periodic: false,
        }
    }

    fn busy_guard(&self) -> SensorResult<()> {
        if self.periodic {
            return Err(SensorError::Busy {
                sensor: self.id.clone(),
            });
        }
        Ok(())
    }

    async fn read_u8(&self, bus: &mut dyn I2cBus, reg: u8) -> SensorResult<u8> {
        let mut buf = [0u8; 1];
        bus.read_bytes(self.address, reg, &mut buf).await?;
        Ok(buf[0])
    }

    async fn read_u16_be(&self, bus: &mut dyn I2cBus, reg: u8) -> SensorResult<u16> {
        let mut buf = [0u8; 2];
        bus.read_bytes(self.address, reg, &mut buf).await?;
        Ok(u16::from_be_bytes(buf))
    }

    async fn read_u16_le(&self, bus: &mut dyn I2cBus, reg: u8) -> SensorResult<u16> {
        let mut buf = [0u8; 2];
        bus.read_bytes(self.address, reg, &mut buf).await?;
        Ok(u16::from_le_bytes(buf))
    }

    pub async fn read_device_id(&self, bus: &mut dyn I2cBus) -> SensorResult<u16> {
        self.read_u16_be(bus, REG_DEVICE_ID).await
    }

    pub async fn firmware_version(&self, bus: &mut dyn I2cBus) -> SensorResult<u16> {
        self.read_u16_be(bus, REG_FIRMWARE_VERSION).await
    }

    /// Reads the button status and acknowledges it; the firmware latches the
    /// event bits until the read value is written back.
    pub async fn read_button(&self, bus: &mut dyn I2cBus) -> SensorResult<ButtonStatus> {
        let v = self.read_u8(bus, REG_BUTTON_STATUS).await?;
        bus.write_byte(self.address, REG_BUTTON_STATUS, v).await?;
        Ok(ButtonStatus(v))
    }

    pub async fn read_function_control(&self, bus: &mut dyn I2cBus) -> SensorResult<u8> {
        self.read_u8(bus, REG_FUNCTION_CONTROL).await
    }

    pub async fn write_function_control(&self, bus: &mut dyn I2cBus, bits: u8) -> SensorResult<()> {
        self.busy_guard()?;
        bus.write_byte(self.address, REG_FUNCTION_CONTROL, bits & 0x07)
            .await?;
        Ok(())
    }

    async fn write_function_control_bit(
        &self,
        bus: &mut dyn I2cBus,
        bit: u8,
        enabled: bool,
    ) -> SensorResult<()> {
        let fc = self.read_function_control(bus).await?;
        let fc = (fc & !bit) | if enabled { bit } else { 0 };
        bus.write_byte(self.address, REG_FUNCTION_CONTROL, fc & 0x07)
            .await?;
        Ok(())
    }

    pub async fn read_refresh_rate(&self, bus: &mut dyn I2cBus) -> SensorResult<Refresh> {
        Ok(Refresh::from_bits(self.read_u8(bus, REG_REFRESH_RATE).await?))
    }

    pub async fn write_refresh_rate(&self, bus: &mut dyn I2cBus, rate: Refresh) -> SensorResult<()> {
        self.busy_guard()?;
        bus.write_byte(self.address, REG_REFRESH_RATE, rate as u8)
            .await?;
        Ok(())
    }

    pub async fn read_noise_filter(&self, bus: &mut dyn I2cBus) -> SensorResult<u8> {
        self.read_u8(bus, REG_NOISE_FILTER).await
    }

    pub async fn write_noise_filter(&self, bus: &mut dyn I2cBus, level: u8) -> SensorResult<()> {
        if level > 15 {
            return Err(SensorError::ConfigError {
                sensor: self.id.clone(),
                reason: format!("noise filter level must be 0..=15 ({level})"),
            });
        }
        bus.write_byte(self.address, REG_NOISE_FILTER, level).await?;
        Ok(())
    }

    /// Size of the region the statistics block is computed over, as
    /// half-extents from the array center
    pub async fn read_monitor_size(&self, bus: &mut dyn I2cBus) -> SensorResult<(u8, u8)> {
        let v = self.read_u8(bus, REG_MONITOR_SIZE).await?;
        Ok((v & 0x0F, (v >> 4) & 0x0F))
    }

    pub async fn write_monitor_size(
        &self,
        bus: &mut dyn I2cBus,
        width: u8,
        height: u8,
    ) -> SensorResult<()> {
        if width > 15 || height > 11 {
            return Err(SensorError::ConfigError {
                sensor: self.id.clone(),
                reason: format!("monitor size must be at most 15x11 ({width}x{height})"),
            });
        }
        bus.write_byte(self.address, REG_MONITOR_SIZE, (height << 4) | width)
            .await?;
        Ok(())
    }

    pub async fn read_alarm_enabled(&self, bus: &mut dyn I2cBus) -> SensorResult<u8> {
        self.read_u8(bus, REG_ALARM_ENABLE).await
    }

    pub async fn write_alarm_enabled(&self, bus: &mut dyn I2cBus, bits: u8) -> SensorResult<()> {
        bus.write_byte(self.address, REG_ALARM_ENABLE, bits).await?;
        Ok(())
    }

    pub async fn read_alarm_temperature(
        &self,
        bus: &mut dyn I2cBus,
        alarm: Alarm,
    ) -> SensorResult<f32> {
        let reg = REG_LOW_ALARM_THRESHOLD + ALARM_STRIDE * alarm as u8;
        Ok(raw_to_celsius(self.read_u16_le(bus, reg).await?))
    }

    pub async fn write_alarm_temperature(
        &self,
        bus: &mut dyn I2cBus,
        alarm: Alarm,
        celsius: f32,
    ) -> SensorResult<()> {
        let reg = REG_LOW_ALARM_THRESHOLD + ALARM_STRIDE * alarm as u8;
        bus.write_bytes(self.address, reg, &celsius_to_raw(celsius).to_le_bytes())
            .await?;
        Ok(())
    }

    /// Alarm buzzer frequency in Hz and beep interval in ms (5..=255)
    pub async fn read_alarm_buzzer(
        &self,
        bus: &mut dyn I2cBus,
        alarm: Alarm,
    ) -> SensorResult<(u16, u8)> {
        let reg = REG_LOW_ALARM_BUZZER + ALARM_STRIDE * alarm as u8;
        let mut buf = [0u8; 3];
        bus.read_bytes(self.address, reg, &mut buf).await?;
        Ok((u16::from_le_bytes([buf[0], buf[1]]), buf[2]))
    }

    pub async fn write_alarm_buzzer(
        &self,
        bus: &mut dyn I2cBus,
        alarm: Alarm,
        freq_hz: u16,
        interval_ms: u8,
    ) -> SensorResult<()> {
        if interval_ms < 5 {
            return Err(SensorError::ConfigError {
                sensor: self.id.clone(),
                reason: format!("beep interval must be 5..=255 ms ({interval_ms})"),
            });
        }
        let reg = REG_LOW_ALARM_BUZZER + ALARM_STRIDE * alarm as u8;
        let [lo, hi] = freq_hz.to_le_bytes();
        bus.write_bytes(self.address, reg, &[lo, hi, interval_ms])
            .await?;
        Ok(())
    }

    pub async fn read_alarm_led(&self, bus: &mut dyn I2cBus, alarm: Alarm) -> SensorResult<Rgb> {
        let reg = REG_LOW_ALARM_LED + ALARM_STRIDE * alarm as u8;
        let mut buf = [0u8; 3];
        bus.read_bytes(self.address, reg, &mut buf).await?;
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
        let reg = REG_LOW_ALARM_LED + ALARM_STRIDE * alarm as u8;
        bus.write_bytes(self.address, reg, &[rgb.r, rgb.g, rgb.b])
            .await?;
        Ok(())
    }

    /// User buzzer frequency in Hz and duty 0..=255
    pub async fn read_buzzer(&self, bus: &mut dyn I2cBus) -> SensorResult<(u16, u8)> {
        let mut buf = [0u8; 3];
        bus.read_bytes(self.address, REG_BUZZER_FREQ, &mut buf).await?;
        Ok((u16::from_le_bytes([buf[0], buf[1]]), buf[2]))
    }

    pub async fn write_buzzer(&self, bus: &mut dyn I2cBus, freq_hz: u16, duty: u8) -> SensorResult<()> {
        let [lo, hi] = freq_hz.to_le_bytes();
        bus.write_bytes(self.address, REG_BUZZER_FREQ, &[lo, hi, duty])
            .await?;
        Ok(())
    }

    pub async fn write_buzzer_duty(&self, bus: &mut dyn I2cBus, duty: u8) -> SensorResult<()> {
        bus.write_byte(self.address, REG_BUZZER_DUTY, duty).await?;
        Ok(())
    }

    pub async fn read_led(&self, bus: &mut dyn I2cBus) -> SensorResult<Rgb> {
        let mut buf = [0u8; 3];
        bus.read_bytes(self.address, REG_LED, &mut buf).await?;
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

    /// The address register holds the address and its bitwise inverse; a
    /// mismatch means the register content is not trustworthy
    pub async fn read_i2c_address(&self, bus: &mut dyn I2cBus) -> SensorResult<u8> {
        let mut buf = [0u8; 2];
        bus.read_bytes(self.address, REG_I2C_ADDRESS, &mut buf).await?;
        if buf[0] != !buf[1] {
            return Err(SensorError::DataError {
                sensor: self.id.clone(),
                reason: format!(
                    "address register inconsistent ({:#04x}/{:#04x})",
                    buf[0], buf[1]
                ),
            });
        }
        Ok(buf[0])
    }

    pub async fn change_i2c_address(&mut self, bus: &mut dyn I2cBus, address: u8) -> SensorResult<()> {
        if !(0x08..=0x77).contains(&address) {
            return Err(SensorError::ConfigError {
                sensor: self.id.clone(),
                reason: format!("invalid I2C address {address:#04x}"),
            });
        }
        bus.write_bytes(self.address, REG_I2C_ADDRESS, &[address, !address])
            .await?;
        self.address = address;
        Ok(())
    }

    /// Returns (fresh, subpage); `fresh` clears once the data is read
    async fn read_data_status(&self, bus: &mut dyn I2cBus) -> SensorResult<(bool, u8)> {
        let mut buf = [0u8; 2];
        bus.read_bytes(self.address, REG_DATA_REFRESH, &mut buf).await?;
        Ok((buf[0] != 0, buf[1]))
    }

    /// Triggers one capture when auto refresh is off
    async fn request_data(&self, bus: &mut dyn I2cBus) -> SensorResult<()> {
        bus.write_byte(self.address, REG_DATA_REFRESH, 0).await?;
        Ok(())
    }

    async fn read_data(&self, bus: &mut dyn I2cBus, subpage: u8) -> SensorResult<ThermoFrame> {
        let mut buf = [0u8; BATCH_LEN];
        bus.read_block(self.address, REG_STATS, &mut buf).await?;

        let word = |i: usize| u16::from_le_bytes([buf[i], buf[i + 1]]);
        let stats = ThermalStats {
            median_c: raw_to_celsius(word(0)),
            average_c: raw_to_celsius(word(2)),
            most_diff_c: raw_to_celsius(word(4)),
            most_diff_xy: (buf[6], buf[7]),
            lowest_c: raw_to_celsius(word(8)),
            lowest_xy: (buf[10], buf[11]),
            highest_c: raw_to_celsius(word(12)),
            highest_xy: (buf[14], buf[15]),
        };

        let pixels_c = buf[16..]
            .chunks_exact(2)
            .map(|c| raw_to_celsius(u16::from_le_bytes([c[0], c[1]])))
            .collect();

        Ok(ThermoFrame {
            stats: Some(stats),
            image: Some(ThermalImage {
                subpage,
                width: WIDTH,
                height: HEIGHT / 2,
                pixels_c,
            }),
            ..ThermoFrame::default()
        })
    }

    /// One capture of both subpages; only valid while periodic measurement
    /// is stopped
    pub async fn measure_singleshot(
        &mut self,
        bus: &mut dyn I2cBus,
    ) -> SensorResult<(ThermoFrame, ThermoFrame)> {
        self.busy_guard()?;

        let interval = self.read_refresh_rate(bus).await?.interval_ms();
        let mut pages: [Option<ThermoFrame>; 2] = [None, None];

        self.request_data(bus).await?;
        sleep(Duration::from_millis(interval)).await;

        let deadline = Instant::now() + Duration::from_millis(SINGLESHOT_TIMEOUT_MS);
        let mut done = 0;
        while done < 2 && Instant::now() <= deadline {
            let (fresh, subpage) = self.read_data_status(bus).await?;
            if !fresh {
                continue;
            }
            let frame = self.read_data(bus, subpage & 0x01).await?;
            pages[(subpage & 0x01) as usize] = Some(frame);
            done += 1;
            if done < 2 {
                self.request_data(bus).await?;
                sleep(Duration::from_millis(interval)).await;
            }
        }

        match pages {
            [Some(p0), Some(p1)] => Ok((p0, p1)),
            _ => Err(SensorError::ReadError {
                sensor: self.id.clone(),
                reason: "singleshot capture timed out".to_string(),
            }),
        }
    }

    pub fn stop_periodic(&mut self) {
        self.periodic = false;
    }
}

#[async_trait]
impl SensorDriver for Thermal2 {
    async fn init(&mut self, bus: &mut dyn I2cBus) -> SensorResult<()> {
        let id = self.read_device_id(bus).await?;
        if id != DEVICE_ID {
            return Err(SensorError::WrongChipId {
                sensor: self.id.clone(),
                expected: DEVICE_ID,
                actual: id,
            });
        }
        let fw = self.firmware_version(bus).await?;
        if fw == 0 {
            return Err(SensorError::InitError {
                sensor: self.id.clone(),
                reason: "firmware version register reads 0".to_string(),
            });
        }
        debug!("[{}] device {:#06x} firmware {}", self.id, id, fw);

        // Clear any latched button events from before reset
        bus.write_byte(self.address, REG_BUTTON_STATUS, 1).await?;

        let fc = (self.settings.buzzer_enabled as u8 * FUNCTION_BUZZER)
            | (self.settings.led_enabled as u8 * FUNCTION_LED);
        self.write_function_control(bus, fc).await?;
        self.write_buzzer(bus, 0, 0).await?;
        self.write_led(bus, Rgb::default()).await?;
        self.write_monitor_size(bus, self.settings.monitor_width, self.settings.monitor_height)
            .await?;
        self.write_noise_filter(bus, self.settings.noise_filter).await?;

        // Start periodic measurement at the configured rate
        self.write_refresh_rate(bus, self.settings.refresh_rate).await?;
        self.write_function_control_bit(bus, FUNCTION_AUTO_REFRESH, true)
            .await?;
        self.periodic = true;
        Ok(())
    }

    async fn read(&mut self, bus: &mut dyn I2cBus) -> SensorResult<ThermoFrame> {
        let (fresh, subpage) = self.read_data_status(bus).await?;
        if !fresh {
            return Err(SensorError::NotReady {
                sensor: self.id.clone(),
            });
        }
        let frame = self.read_data(bus, subpage & 0x01).await?;

        let button = self.read_button(bus).await?;
        if button.was_clicked() || button.was_held() {
            debug!(
                "[{}] button clicked={} held={}",
                self.id,
                button.was_clicked(),
                button.was_held()
            );
        }

        Ok(frame)
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

pub struct Thermal2Factory;

pub static THERMAL2_FACTORY: Thermal2Factory = Thermal2Factory;

impl SensorFactory for Thermal2Factory {
    fn name(&self) -> &'static str {
        "thermal2"
    }

    fn create(&self, entry: &SensorEntry) -> SensorResult<Box<dyn SensorDriver + Send>> {
        let settings = Settings {
            refresh_rate: entry.refresh_rate.unwrap_or(Refresh::Rate4Hz),
            noise_filter: entry.noise_filter.unwrap_or(8),
            monitor_width: entry.monitor_width.unwrap_or(15),
            monitor_height: entry.monitor_height.unwrap_or(11),
            led_enabled: entry.led_enabled.unwrap_or(true),
            buzzer_enabled: entry.buzzer_enabled.unwrap_or(false),
        };
        if settings.noise_filter > 15 {
            return Err(SensorError::ConfigError {
                sensor: entry.id.clone(),
                reason: format!("noise filter level must be 0..=15 ({})", settings.noise_filter),
            });
        }
        if settings.monitor_width > 15 || settings.monitor_height > 11 {
            return Err(SensorError::ConfigError {
                sensor: entry.id.clone(),
                reason: format!(
                    "monitor size must be at most 15x11 ({}x{})",
                    settings.monitor_width, settings.monitor_height
                ),
            });
        }
        let interval_ms = entry
            .interval_ms
            .unwrap_or_else(|| settings.refresh_rate.interval_ms());
        Ok(Box::new(Thermal2::new(
            entry.id.clone(),
            entry.address,
            entry.bus.clone(),
            settings,
            interval_ms,
        )))
    }
}
