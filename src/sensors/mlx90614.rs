//! MLX90614 infrared thermometer driver (SMBus mode).
//!
//! Every word transfer carries a PEC byte (CRC-8, poly 0x07) computed over the
//! fully addressed frame; a mismatch fails the transfer. Settings live in the
//! device EEPROM and only take effect after the next power-on reset, so this
//! driver configures the config word and emissivity once at init and keeps a
//! mirror of the EEPROM cells it read.

use crate::bus::i2c::I2cBus;
use crate::config::sensor_config::SensorEntry;
use crate::errors::{SensorError, SensorResult};
use crate::sensors::{SensorDriver, SensorFactory, ThermoFrame};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::time::{sleep, Duration};
use tracing::{debug, warn};

// RAM cells
const READ_TAMBIENT: u8 = 0x06;
const READ_TOBJECT_1: u8 = 0x07;
const READ_TOBJECT_2: u8 = 0x08;
// EEPROM cells
const EEPROM_TO_MAX: u8 = 0x20;
const EEPROM_TO_MIN: u8 = 0x21;
const EEPROM_PWMCTRL: u8 = 0x22;
const EEPROM_TARANGE: u8 = 0x23;
const EEPROM_EMISSIVITY: u8 = 0x24;
const EEPROM_CONFIG: u8 = 0x25;
const EEPROM_ADDR: u8 = 0x2E;
const EEPROM_ID0: u8 = 0x3C;

// EEPROM cell erase/write settle time (typ 5ms, max 10ms)
const EEPROM_WRITE_DELAY_MS: u64 = 10;

/// Infinite Impulse Response filter setting (config word bits 2..0)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Iir {
    /// 50% (a1 = 0.5, b1 = 0.5)
    Filter50 = 0,
    Filter25 = 1,
    Filter17 = 2,
    Filter13 = 3,
    /// 100% (filter bypassed)
    Filter100 = 4,
    Filter80 = 5,
    Filter67 = 6,
    Filter57 = 7,
}

impl Iir {
    fn from_bits(b: u16) -> Self {
        match b & 0x07 {
            0 => Iir::Filter50,
            1 => Iir::Filter25,
            2 => Iir::Filter17,
            3 => Iir::Filter13,
            4 => Iir::Filter100,
            5 => Iir::Filter80,
            6 => Iir::Filter67,
            _ => Iir::Filter57,
        }
    }
}

/// Finite Impulse Response filter length (config word bits 10..8).
/// Settings below `Filter128` are not recommended by the datasheet and have
/// no defined measurement interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Fir {
    Filter8 = 0,
    Filter16 = 1,
    Filter32 = 2,
    Filter64 = 3,
    Filter128 = 4,
    Filter256 = 5,
    Filter512 = 6,
    Filter1024 = 7,
}

impl Fir {
    fn from_bits(b: u16) -> Self {
        match b & 0x07 {
            0 => Fir::Filter8,
            1 => Fir::Filter16,
            2 => Fir::Filter32,
            3 => Fir::Filter64,
            4 => Fir::Filter128,
            5 => Fir::Filter256,
            6 => Fir::Filter512,
            _ => Fir::Filter1024,
        }
    }
}

/// Amplifier gain coefficient (config word bits 13..11)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gain {
    /// Amplifier bypassed
    Coeff1 = 0,
    Coeff3 = 1,
    Coeff6 = 2,
    Coeff12_5 = 3,
    Coeff25 = 4,
    Coeff50 = 5,
    Coeff100 = 6,
}

impl Gain {
    fn from_bits(b: u16) -> Self {
        match b & 0x07 {
            0 => Gain::Coeff1,
            1 => Gain::Coeff3,
            2 => Gain::Coeff6,
            3 => Gain::Coeff12_5,
            4 => Gain::Coeff25,
            5 => Gain::Coeff50,
            _ => Gain::Coeff100,
        }
    }
}

/// Single or dual IR sensor operation (config word bit 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IrSensor {
    Single = 0,
    Dual = 1,
}

/// PWM pin output mapping (config word bits 5..4)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Output {
    /// PWM1: Ta, PWM2: To1
    TaTo1 = 0,
    /// PWM1: Ta, PWM2: To2
    TaTo2 = 1,
    /// PWM1: To2
    To2 = 2,
    /// PWM1: To1, PWM2: To2
    To1To2 = 3,
}

impl Output {
    fn from_bits(b: u16) -> Self {
        match b & 0x03 {
            0 => Output::TaTo1,
            1 => Output::TaTo2,
            2 => Output::To2,
            _ => Output::To1To2,
        }
    }
}

/// Decoded view of the EEPROM config word (cell 0x25)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConfigWord(pub u16);

impl ConfigWord {
    pub fn iir(self) -> Iir {
        Iir::from_bits(self.0)
    }
    pub fn output(self) -> Output {
        Output::from_bits(self.0 >> 4)
    }
    pub fn ir_sensor(self) -> IrSensor {
        if (self.0 >> 6) & 1 == 0 {
            IrSensor::Single
        } else {
            IrSensor::Dual
        }
    }
    pub fn positive_ks(self) -> bool {
        self.0 & (1 << 7) != 0
    }
    pub fn fir(self) -> Fir {
        Fir::from_bits(self.0 >> 8)
    }
    pub fn gain(self) -> Gain {
        Gain::from_bits(self.0 >> 11)
    }
    pub fn positive_kf2(self) -> bool {
        self.0 & (1 << 14) != 0
    }

    pub fn set_iir(&mut self, iir: Iir) {
        self.0 = (self.0 & !0x07) | iir as u16;
    }
    pub fn set_output(&mut self, o: Output) {
        self.0 = (self.0 & !(0x03 << 4)) | ((o as u16) << 4);
    }
    pub fn set_ir_sensor(&mut self, irs: IrSensor) {
        self.0 = (self.0 & !(1 << 6)) | ((irs as u16) << 6);
    }
    pub fn set_positive_ks(&mut self, pos: bool) {
        self.0 = (self.0 & !(1 << 7)) | ((pos as u16) << 7);
    }
    pub fn set_fir(&mut self, fir: Fir) {
        self.0 = (self.0 & !(0x07 << 8)) | ((fir as u16) << 8);
    }
    pub fn set_gain(&mut self, gain: Gain) {
        self.0 = (self.0 & !(0x07 << 11)) | ((gain as u16) << 11);
    }
    pub fn set_positive_kf2(&mut self, pos: bool) {
        self.0 = (self.0 & !(1 << 14)) | ((pos as u16) << 14);
    }
}

/// Decoded view of the EEPROM PWMCTRL word (cell 0x22)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PwmCtrl(pub u16);

impl PwmCtrl {
    pub fn extended_mode(self) -> bool {
        self.0 & 0x01 == 0
    }
    pub fn enabled(self) -> bool {
        self.0 & (1 << 1) != 0
    }
    pub fn push_pull(self) -> bool {
        (self.0 >> 2) & 1 != 0
    }
    pub fn thermal_relay_mode(self) -> bool {
        (self.0 >> 3) & 1 != 0
    }
    pub fn repetition(self) -> u16 {
        (self.0 >> 4) & 0x1F
    }
    /// PWM period in milliseconds
    pub fn period_ms(self) -> f32 {
        let raw = (self.0 >> 9) & 0x7F;
        let raw = if raw != 0 { raw } else { 128 };
        1.024 * if self.extended_mode() { 2.0 } else { 1.0 } * raw as f32
    }
}

/// Mirror of the device non-volatile calibration/configuration cells
#[derive(Debug, Clone, Copy, Default)]
pub struct Eeprom {
    pub to_max: u16,
    pub to_min: u16,
    pub pwm_ctrl: u16,
    pub ta_range: u16,
    pub emissivity: u16,
    pub config: u16,
    pub addr: u16,
    pub id: [u16; 4],
}

/// One measurement snapshot of linearized raw words.
/// `[0]`: ambient, `[1]`: object 1, `[2]`: object 2. Bit 15 set flags an
/// invalid channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Measurement {
    pub raw: [u16; 3],
}

impl Default for Measurement {
    fn default() -> Self {
        // All channels flagged invalid until read
        Self { raw: [0x8000; 3] }
    }
}

impl Measurement {
    fn kelvin(raw: u16) -> Option<f32> {
        (raw & 0x8000 == 0).then(|| raw as f32 * 0.02)
    }

    pub fn ambient_kelvin(&self) -> Option<f32> {
        Self::kelvin(self.raw[0])
    }
    pub fn ambient_celsius(&self) -> Option<f32> {
        self.ambient_kelvin().map(|k| k - 273.15)
    }
    pub fn ambient_fahrenheit(&self) -> Option<f32> {
        self.ambient_celsius().map(|c| c * 9.0 / 5.0 + 32.0)
    }
    pub fn object1_kelvin(&self) -> Option<f32> {
        Self::kelvin(self.raw[1])
    }
    pub fn object1_celsius(&self) -> Option<f32> {
        self.object1_kelvin().map(|k| k - 273.15)
    }
    pub fn object1_fahrenheit(&self) -> Option<f32> {
        self.object1_celsius().map(|c| c * 9.0 / 5.0 + 32.0)
    }
    pub fn object2_kelvin(&self) -> Option<f32> {
        Self::kelvin(self.raw[2])
    }
    pub fn object2_celsius(&self) -> Option<f32> {
        self.object2_kelvin().map(|k| k - 273.15)
    }
    pub fn object2_fahrenheit(&self) -> Option<f32> {
        self.object2_celsius().map(|c| c * 9.0 / 5.0 + 32.0)
    }
}

// Object temperature limit cells use 0.01 K/LSB
fn to_raw_to_celsius(t: u16) -> f32 {
    t as f32 * 0.01 - 273.15
}

fn celsius_to_to_raw(c: f32) -> u16 {
    let v = c.clamp(-273.15, 382.2);
    (100.0 * (v + 0.005 + 273.15)) as u16
}

// Ambient range cell packs two 8-bit limits at 0.64 degC/LSB offset -38.2
fn ta_raw_to_celsius(t: u8) -> f32 {
    t as f32 * 64.0 / 100.0 - 38.2
}

fn celsius_to_ta_raw(c: f32) -> u8 {
    let v = c.clamp(-38.2, 125.0);
    (100.0 * (v + 0.32 + 38.2) / 64.0) as u8
}

fn raw_to_emissivity(e: u16) -> f32 {
    e as f32 / 65535.0
}

fn emissivity_to_raw(e: f32) -> u16 {
    (65535.0 * e).round() as u16
}

/// CRC-8 as used for the SMBus PEC (poly 0x07, init 0, no reflection)
fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &b in data {
        crc ^= b;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x07
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Measurement interval in ms, indexed `[IIR][FIR - Filter128]`.
/// A-series devices.
const INTERVAL_TABLE_A: [[u64; 4]; 8] = [
    [300, 370, 540, 860],
    [700, 880, 1300, 2000],
    [1100, 1400, 2000, 3300],
    [1500, 1900, 2800, 4500],
    [40, 50, 60, 100],
    [120, 160, 220, 350],
    [240, 300, 430, 700],
    [260, 340, 480, 780],
];

/// B and D series devices (the BAA unit)
const INTERVAL_TABLE_BD: [[u64; 4]; 8] = [
    [470, 600, 840, 1330],
    [1100, 1400, 2000, 3200],
    [1800, 2200, 3200, 5000],
    [2400, 3000, 4300, 7000],
    [60, 70, 100, 140],
    [200, 240, 340, 540],
    [380, 480, 670, 1100],
    [420, 530, 750, 1200],
];

/// Device series; the BAA variant has dual IR sensors and slower settling
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variant {
    A,
    Baa,
}

impl Variant {
    fn interval_ms(self, iir: Iir, fir: Fir) -> Option<u64> {
        let f = fir as usize;
        if f < 4 {
            return None;
        }
        let table = match self {
            Variant::A => &INTERVAL_TABLE_A,
            Variant::Baa => &INTERVAL_TABLE_BD,
        };
        Some(table[iir as usize][f - 4])
    }

    fn has_dual_sensors(self) -> bool {
        matches!(self, Variant::Baa)
    }
}

#[derive(Debug, Clone, Copy)]
struct Settings {
    iir: Iir,
    fir: Fir,
    gain: Gain,
    ir_sensor: IrSensor,
    emissivity: f32,
}

pub struct Mlx90614 {
    id: String,
    address: u8,
    bus_id: String,
    variant: Variant,
    settings: Settings,
    eeprom: Eeprom,
    interval_ms: u64,
    periodic: bool,
}

impl Mlx90614 {
    fn new(
        id: String,
        address: u8,
        bus_id: String,
        variant: Variant,
        settings: Settings,
        interval_ms: u64,
    ) -> Self {
        Self {
            id,
            address,
            bus_id,
            variant,
            settings,
            eeprom: Eeprom::default(),
            interval_ms,
            periodic: false,
        }
    }

    /// Mirror of the EEPROM cells read at init
    pub fn eeprom(&self) -> &Eeprom {
        &self.eeprom
    }

    fn busy_guard(&self) -> SensorResult<()> {
        if self.periodic {
            return Err(SensorError::Busy {
                sensor: self.id.clone(),
            });
        }
        Ok(())
    }

    async fn read_word(&self, bus: &mut dyn I2cBus, reg: u8) -> SensorResult<u16> {
        let mut buf = [0u8; 3];
        bus.read_bytes(self.address, reg, &mut buf).await?;
        // PEC covers the addressed frame: slave W, reg, slave R, low, high
        let frame = [
            self.address << 1,
            reg,
            (self.address << 1) | 0x01,
            buf[0],
            buf[1],
        ];
        let computed = crc8(&frame);
        if computed != buf[2] {
            return Err(SensorError::PecMismatch {
                reg,
                computed,
                received: buf[2],
            });
        }
        Ok(u16::from_le_bytes([buf[0], buf[1]]))
    }

    async fn write_word(&self, bus: &mut dyn I2cBus, reg: u8, val: u16) -> SensorResult<()> {
        let [lo, hi] = val.to_le_bytes();
        let pec = crc8(&[self.address << 1, reg, lo, hi]);
        bus.write_bytes(self.address, reg, &[lo, hi, pec]).await?;
        Ok(())
    }

    /// Erase-then-write an EEPROM cell. The new value only takes effect after
    /// the next power-on reset.
    async fn write_eeprom(&self, bus: &mut dyn I2cBus, reg: u8, val: u16) -> SensorResult<()> {
        if reg & 0x20 == 0 {
            return Err(SensorError::ConfigError {
                sensor: self.id.clone(),
                reason: format!("register {reg:#04x} is not an EEPROM cell"),
            });
        }
        self.write_word(bus, reg, 0).await?;
        sleep(Duration::from_millis(EEPROM_WRITE_DELAY_MS)).await;
        self.write_word(bus, reg, val).await?;
        sleep(Duration::from_millis(EEPROM_WRITE_DELAY_MS)).await;
        Ok(())
    }

    async fn read_eeprom_mirror(&self, bus: &mut dyn I2cBus) -> SensorResult<Eeprom> {
        let mut e = Eeprom {
            to_max: self.read_word(bus, EEPROM_TO_MAX).await?,
            to_min: self.read_word(bus, EEPROM_TO_MIN).await?,
            pwm_ctrl: self.read_word(bus, EEPROM_PWMCTRL).await?,
            ta_range: self.read_word(bus, EEPROM_TARANGE).await?,
            emissivity: self.read_word(bus, EEPROM_EMISSIVITY).await?,
            config: self.read_word(bus, EEPROM_CONFIG).await?,
            addr: self.read_word(bus, EEPROM_ADDR).await?,
            id: [0; 4],
        };
        for (i, slot) in e.id.iter_mut().enumerate() {
            *slot = self.read_word(bus, EEPROM_ID0 + i as u8).await?;
        }
        Ok(e)
    }

    pub async fn read_config(&self, bus: &mut dyn I2cBus) -> SensorResult<ConfigWord> {
        Ok(ConfigWord(self.read_word(bus, EEPROM_CONFIG).await?))
    }

    pub async fn write_config(&mut self, bus: &mut dyn I2cBus, c: ConfigWord) -> SensorResult<()> {
        self.busy_guard()?;
        self.write_eeprom(bus, EEPROM_CONFIG, c.0).await?;
        self.eeprom.config = c.0;
        Ok(())
    }

    async fn update_config<F>(&mut self, bus: &mut dyn I2cBus, f: F) -> SensorResult<()>
    where
        F: FnOnce(&mut ConfigWord) + Send,
    {
        let mut c = self.read_config(bus).await?;
        f(&mut c);
        self.write_config(bus, c).await
    }

    pub async fn write_iir(&mut self, bus: &mut dyn I2cBus, iir: Iir) -> SensorResult<()> {
        self.update_config(bus, |c| c.set_iir(iir)).await
    }

    pub async fn write_fir(&mut self, bus: &mut dyn I2cBus, fir: Fir) -> SensorResult<()> {
        if fir < Fir::Filter128 {
            warn!("[{}] FIR settings below filter128 are not recommended", self.id);
        }
        self.update_config(bus, |c| c.set_fir(fir)).await
    }

    pub async fn write_gain(&mut self, bus: &mut dyn I2cBus, gain: Gain) -> SensorResult<()> {
        self.update_config(bus, |c| c.set_gain(gain)).await
    }

    pub async fn write_ir_sensor(&mut self, bus: &mut dyn I2cBus, irs: IrSensor) -> SensorResult<()> {
        self.update_config(bus, |c| c.set_ir_sensor(irs)).await
    }

    pub async fn write_output(&mut self, bus: &mut dyn I2cBus, o: Output) -> SensorResult<()> {
        self.update_config(bus, |c| c.set_output(o)).await
    }

    pub async fn write_positive_ks(&mut self, bus: &mut dyn I2cBus, pos: bool) -> SensorResult<()> {
        self.update_config(bus, |c| c.set_positive_ks(pos)).await
    }

    pub async fn write_positive_kf2(&mut self, bus: &mut dyn I2cBus, pos: bool) -> SensorResult<()> {
        self.update_config(bus, |c| c.set_positive_kf2(pos)).await
    }

    pub async fn read_emissivity(&self, bus: &mut dyn I2cBus) -> SensorResult<f32> {
        Ok(raw_to_emissivity(
            self.read_word(bus, EEPROM_EMISSIVITY).await?,
        ))
    }

    pub async fn write_emissivity(&mut self, bus: &mut dyn I2cBus, e: f32) -> SensorResult<()> {
        self.busy_guard()?;
        if !(0.1..=1.0).contains(&e) {
            return Err(SensorError::ConfigError {
                sensor: self.id.clone(),
                reason: format!("emissivity must be between 0.1 and 1.0 ({e})"),
            });
        }
        let raw = emissivity_to_raw(e);
        self.write_eeprom(bus, EEPROM_EMISSIVITY, raw).await?;
        self.eeprom.emissivity = raw;
        Ok(())
    }

    /// Object temperature measurement limits in Celsius
    pub async fn read_object_min_max(&self, bus: &mut dyn I2cBus) -> SensorResult<(f32, f32)> {
        let min = self.read_word(bus, EEPROM_TO_MIN).await?;
        let max = self.read_word(bus, EEPROM_TO_MAX).await?;
        Ok((to_raw_to_celsius(min), to_raw_to_celsius(max)))
    }

    pub async fn write_object_min_max(
        &mut self,
        bus: &mut dyn I2cBus,
        min_c: f32,
        max_c: f32,
    ) -> SensorResult<()> {
        self.busy_guard()?;
        let (min, max) = (celsius_to_to_raw(min_c), celsius_to_to_raw(max_c));
        if min > max {
            return Err(SensorError::ConfigError {
                sensor: self.id.clone(),
                reason: format!("need min <= max ({min} > {max})"),
            });
        }
        self.write_eeprom(bus, EEPROM_TO_MIN, min).await?;
        self.write_eeprom(bus, EEPROM_TO_MAX, max).await?;
        self.eeprom.to_min = min;
        self.eeprom.to_max = max;
        Ok(())
    }

    /// Ambient temperature measurement limits in Celsius
    pub async fn read_ambient_min_max(&self, bus: &mut dyn I2cBus) -> SensorResult<(f32, f32)> {
        let v = self.read_word(bus, EEPROM_TARANGE).await?;
        Ok((
            ta_raw_to_celsius((v & 0xFF) as u8),
            ta_raw_to_celsius((v >> 8) as u8),
        ))
    }

    pub async fn write_ambient_min_max(
        &mut self,
        bus: &mut dyn I2cBus,
        min_c: f32,
        max_c: f32,
    ) -> SensorResult<()> {
        self.busy_guard()?;
        let (min, max) = (celsius_to_ta_raw(min_c), celsius_to_ta_raw(max_c));
        if min > max {
            return Err(SensorError::ConfigError {
                sensor: self.id.clone(),
                reason: format!("need min <= max ({min} > {max})"),
            });
        }
        let v = (max as u16) << 8 | min as u16;
        self.write_eeprom(bus, EEPROM_TARANGE, v).await?;
        self.eeprom.ta_range = v;
        Ok(())
    }

    pub async fn read_i2c_address(&self, bus: &mut dyn I2cBus) -> SensorResult<u8> {
        Ok((self.read_word(bus, EEPROM_ADDR).await? & 0xFF) as u8)
    }

    /// Writes a new slave address to EEPROM and switches the driver over.
    /// The device answers on the new address after the next power-on reset.
    pub async fn change_i2c_address(&mut self, bus: &mut dyn I2cBus, address: u8) -> SensorResult<()> {
        self.busy_guard()?;
        if !(0x08..=0x77).contains(&address) {
            return Err(SensorError::ConfigError {
                sensor: self.id.clone(),
                reason: format!("invalid I2C address {address:#04x}"),
            });
        }
        self.write_eeprom(bus, EEPROM_ADDR, address as u16).await?;
        self.eeprom.addr = address as u16;
        self.address = address;
        Ok(())
    }

    /// Stop periodic measurement, releasing the config-write guard
    pub fn stop_periodic(&mut self) {
        self.periodic = false;
    }

    pub fn start_periodic(&mut self) {
        self.periodic = true;
    }

    async fn read_measurement(&self, bus: &mut dyn I2cBus) -> SensorResult<Measurement> {
        let mut m = Measurement::default();
        m.raw[0] = self.read_word(bus, READ_TAMBIENT).await?;
        m.raw[1] = self.read_word(bus, READ_TOBJECT_1).await?;
        if self.variant.has_dual_sensors() {
            m.raw[2] = self.read_word(bus, READ_TOBJECT_2).await?;
        }
        Ok(m)
    }
}

#[async_trait]
impl SensorDriver for Mlx90614 {
    async fn init(&mut self, bus: &mut dyn I2cBus) -> SensorResult<()> {
        self.eeprom = self.read_eeprom_mirror(bus).await?;

        let c = ConfigWord(self.eeprom.config);
        let pc = PwmCtrl(self.eeprom.pwm_ctrl);
        debug!(
            "[{}] eeprom to_max={:.2}C to_min={:.2}C emissivity={:.3} config={:#06x} \
             id={:04x}:{:04x}:{:04x}:{:04x}",
            self.id,
            to_raw_to_celsius(self.eeprom.to_max),
            to_raw_to_celsius(self.eeprom.to_min),
            raw_to_emissivity(self.eeprom.emissivity),
            self.eeprom.config,
            self.eeprom.id[0],
            self.eeprom.id[1],
            self.eeprom.id[2],
            self.eeprom.id[3],
        );
        debug!(
            "[{}] config iir={:?} fir={:?} gain={:?} irs={:?} output={:?} pwm_enabled={}",
            self.id,
            c.iir(),
            c.fir(),
            c.gain(),
            c.ir_sensor(),
            c.output(),
            pc.enabled(),
        );

        // EEPROM cells wear out; only rewrite what actually changed
        let target_emissivity = emissivity_to_raw(self.settings.emissivity);
        if self.eeprom.emissivity != target_emissivity {
            self.write_emissivity(bus, self.settings.emissivity).await?;
        }

        let mut target = c;
        target.set_iir(self.settings.iir);
        target.set_fir(self.settings.fir);
        target.set_gain(self.settings.gain);
        target.set_ir_sensor(self.settings.ir_sensor);
        if target != c {
            self.write_config(bus, target).await?;
        }

        self.start_periodic();
        Ok(())
    }

    async fn read(&mut self, bus: &mut dyn I2cBus) -> SensorResult<ThermoFrame> {
        let m = self.read_measurement(bus).await?;
        Ok(ThermoFrame {
            ambient_c: m.ambient_celsius(),
            object_c: m.object1_celsius(),
            object2_c: m.object2_celsius(),
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

pub struct Mlx90614Factory {
    name: &'static str,
    variant: Variant,
}

pub static MLX90614_FACTORY: Mlx90614Factory = Mlx90614Factory {
    name: "mlx90614",
    variant: Variant::A,
};

pub static MLX90614BAA_FACTORY: Mlx90614Factory = Mlx90614Factory {
    name: "mlx90614baa",
    variant: Variant::Baa,
};

impl SensorFactory for Mlx90614Factory {
    fn name(&self) -> &'static str {
        self.name
    }

    fn create(&self, entry: &SensorEntry) -> SensorResult<Box<dyn SensorDriver + Send>> {
        let settings = Settings {
            iir: entry.iir.unwrap_or(Iir::Filter100),
            fir: entry.fir.unwrap_or(Fir::Filter1024),
            gain: entry.gain.unwrap_or(Gain::Coeff12_5),
            ir_sensor: entry.ir_sensor.unwrap_or(IrSensor::Single),
            emissivity: entry.emissivity.unwrap_or(1.0),
        };
        if !(0.1..=1.0).contains(&settings.emissivity) {
            return Err(SensorError::ConfigError {
                sensor: entry.id.clone(),
                reason: format!(
                    "emissivity must be between 0.1 and 1.0 ({})",
                    settings.emissivity
                ),
            });
        }
        if settings.ir_sensor == IrSensor::Dual && !self.variant.has_dual_sensors() {
            return Err(SensorError::ConfigError {
                sensor: entry.id.clone(),
                reason: "dual IR sensor mode requires the BAA variant".to_string(),
            });
        }
        let native = self
            .variant
            .interval_ms(settings.iir, settings.fir)
            .ok_or_else(|| SensorError::ConfigError {
                sensor: entry.id.clone(),
                reason: "FIR below filter128 has no defined measurement interval".to_string(),
            })?;
        let interval_ms = entry.interval_ms.unwrap_or(native);

        Ok(Box::new(Mlx90614::new(
            entry.id.clone(),
            entry.address,
            entry.bus.clone(),
            self.variant,
            settings,
            interval_ms,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::mock::{MockBus, Transfer};

    const ADDR: u8 = 0x5A;

    fn entry(driver: &str) -> SensorEntry {
        toml::from_str(&format!(
            r#"
            id = "ir0"
            driver = "{driver}"
            bus = "i2c0"
            address = 0x5A
            "#
        ))
        .unwrap()
    }

    fn driver(variant: Variant) -> Mlx90614 {
        let factory = match variant {
            Variant::A => &MLX90614_FACTORY,
            Variant::Baa => &MLX90614BAA_FACTORY,
        };
        let e = entry(factory.name);
        let settings = Settings {
            iir: e.iir.unwrap_or(Iir::Filter100),
            fir: e.fir.unwrap_or(Fir::Filter1024),
            gain: e.gain.unwrap_or(Gain::Coeff12_5),
            ir_sensor: e.ir_sensor.unwrap_or(IrSensor::Single),
            emissivity: e.emissivity.unwrap_or(1.0),
        };
        let native = variant.interval_ms(settings.iir, settings.fir).unwrap();
        Mlx90614::new(e.id, e.address, e.bus, variant, settings, native)
    }

    fn read(reg: u8, lo: u8, hi: u8, pec: u8) -> Transfer {
        Transfer::Read {
            address: ADDR,
            reg,
            response: vec![lo, hi, pec],
        }
    }

    #[test]
    fn crc8_matches_smbus_pec() {
        assert_eq!(crc8(&[0x01]), 0x07);
        assert_eq!(crc8(&[0x00]), 0x00);
        // PEC over an addressed read frame for Ta = 0x3AF7 at address 0x5A
        assert_eq!(crc8(&[0xB4, 0x06, 0xB5, 0xF7, 0x3A]), 0xC9);
    }

    #[test]
    fn config_word_bitfields() {
        let mut c = ConfigWord::default();
        c.set_iir(Iir::Filter100);
        c.set_output(Output::To1To2);
        c.set_ir_sensor(IrSensor::Dual);
        c.set_positive_ks(true);
        c.set_fir(Fir::Filter1024);
        c.set_gain(Gain::Coeff100);
        c.set_positive_kf2(true);
        assert_eq!(c.0, 0x77F4);

        assert_eq!(c.iir(), Iir::Filter100);
        assert_eq!(c.output(), Output::To1To2);
        assert_eq!(c.ir_sensor(), IrSensor::Dual);
        assert!(c.positive_ks());
        assert_eq!(c.fir(), Fir::Filter1024);
        assert_eq!(c.gain(), Gain::Coeff100);
        assert!(c.positive_kf2());

        // Mutating one field leaves the others alone
        c.set_gain(Gain::Coeff1);
        assert_eq!(c.iir(), Iir::Filter100);
        assert_eq!(c.fir(), Fir::Filter1024);
        assert_eq!(c.gain(), Gain::Coeff1);
    }

    #[test]
    fn temperature_conversions() {
        assert_eq!(celsius_to_to_raw(0.0), 27315);
        assert!((to_raw_to_celsius(27315) - 0.0).abs() < 0.01);
        // Clamped to the datasheet object range
        assert_eq!(celsius_to_to_raw(1000.0), celsius_to_to_raw(382.2));
        // Ambient range roundtrip
        let raw = celsius_to_ta_raw(25.0);
        assert!((ta_raw_to_celsius(raw) - 25.0).abs() < 0.64);
        // Emissivity endpoints
        assert_eq!(emissivity_to_raw(1.0), 0xFFFF);
        assert!((raw_to_emissivity(0xFFFF) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn measurement_decode_flags_invalid_channels() {
        let m = Measurement {
            raw: [0x3AF7, 0x3B4A, 0x8000],
        };
        assert!((m.ambient_celsius().unwrap() - 28.75).abs() < 0.01);
        assert!((m.object1_celsius().unwrap() - 30.41).abs() < 0.01);
        assert_eq!(m.object2_celsius(), None);
        assert!((m.object1_fahrenheit().unwrap() - 86.74).abs() < 0.02);

        assert_eq!(Measurement::default().ambient_kelvin(), None);
    }

    #[test]
    fn interval_tables_per_variant() {
        assert_eq!(
            Variant::A.interval_ms(Iir::Filter100, Fir::Filter1024),
            Some(100)
        );
        assert_eq!(
            Variant::Baa.interval_ms(Iir::Filter100, Fir::Filter1024),
            Some(140)
        );
        assert_eq!(
            Variant::A.interval_ms(Iir::Filter13, Fir::Filter1024),
            Some(4500)
        );
        assert_eq!(Variant::A.interval_ms(Iir::Filter100, Fir::Filter64), None);
    }

    #[test]
    fn factory_rejects_bad_settings() {
        let mut e = entry("mlx90614");
        e.emissivity = Some(0.05);
        assert!(MLX90614_FACTORY.create(&e).is_err());

        let mut e = entry("mlx90614");
        e.fir = Some(Fir::Filter32);
        assert!(MLX90614_FACTORY.create(&e).is_err());

        // Dual mode only exists on the BAA unit
        let mut e = entry("mlx90614");
        e.ir_sensor = Some(IrSensor::Dual);
        assert!(MLX90614_FACTORY.create(&e).is_err());
        let mut e = entry("mlx90614baa");
        e.ir_sensor = Some(IrSensor::Dual);
        assert!(MLX90614BAA_FACTORY.create(&e).is_ok());
    }

    #[tokio::test]
    async fn init_reads_eeprom_and_skips_redundant_writes() {
        // Device already holds the default config (0x1F04) and emissivity
        // 0xFFFF, so init must not touch the EEPROM.
        let mut bus = MockBus::new(vec![
            read(0x20, 0x93, 0x99, 0xB2), // to_max
            read(0x21, 0xE3, 0x62, 0xE9), // to_min
            read(0x22, 0x01, 0x02, 0x9D), // pwm_ctrl
            read(0x23, 0x62, 0x96, 0xA4), // ta_range
            read(0x24, 0xFF, 0xFF, 0xD6), // emissivity
            read(0x25, 0x04, 0x1F, 0xED), // config
            read(0x2E, 0x5A, 0xBE, 0xD3), // addr
            read(0x3C, 0x11, 0x11, 0x10),
            read(0x3D, 0x22, 0x22, 0x59),
            read(0x3E, 0x33, 0x33, 0x56),
            read(0x3F, 0x44, 0x44, 0xCB),
        ]);

        let mut d = driver(Variant::A);
        d.init(&mut bus).await.unwrap();
        bus.done();

        assert_eq!(d.eeprom().config, 0x1F04);
        assert_eq!(d.eeprom().id, [0x1111, 0x2222, 0x3333, 0x4444]);
        assert_eq!(d.interval_ms(), 100);
    }

    #[tokio::test]
    async fn read_decodes_ambient_and_object() {
        let mut bus = MockBus::new(vec![
            read(READ_TAMBIENT, 0xF7, 0x3A, 0xC9),
            read(READ_TOBJECT_1, 0x4A, 0x3B, 0x7E),
        ]);

        let mut d = driver(Variant::A);
        let frame = d.read(&mut bus).await.unwrap();
        bus.done();

        assert!((frame.ambient_c.unwrap() - 28.75).abs() < 0.01);
        assert!((frame.object_c.unwrap() - 30.41).abs() < 0.01);
        // Single-sensor variant never reads To2
        assert_eq!(frame.object2_c, None);
    }

    #[tokio::test]
    async fn baa_variant_reads_second_object_channel() {
        let mut bus = MockBus::new(vec![
            read(READ_TAMBIENT, 0xF7, 0x3A, 0xC9),
            read(READ_TOBJECT_1, 0x4A, 0x3B, 0x7E),
            read(READ_TOBJECT_2, 0x00, 0x80, 0x5D), // flagged invalid
        ]);

        let mut d = driver(Variant::Baa);
        let frame = d.read(&mut bus).await.unwrap();
        bus.done();

        assert!(frame.object_c.is_some());
        assert_eq!(frame.object2_c, None);
    }

    #[tokio::test]
    async fn pec_mismatch_is_rejected() {
        let mut bus = MockBus::new(vec![read(READ_TAMBIENT, 0xF7, 0x3A, 0x00)]);
        let mut d = driver(Variant::A);
        let err = d.read(&mut bus).await.unwrap_err();
        assert!(matches!(err, SensorError::PecMismatch { reg: 0x06, .. }));
    }

    #[tokio::test]
    async fn emissivity_write_erases_then_writes() {
        let mut bus = MockBus::new(vec![
            Transfer::Write {
                address: ADDR,
                reg: 0x24,
                data: vec![0x00, 0x00, 0x28],
            },
            Transfer::Write {
                address: ADDR,
                reg: 0x24,
                data: vec![0x32, 0xF3, 0x2C],
            },
        ]);

        let mut d = driver(Variant::A);
        d.write_emissivity(&mut bus, 0.95).await.unwrap();
        bus.done();
        assert_eq!(d.eeprom().emissivity, 0xF332);
    }

    #[tokio::test]
    async fn config_writes_rejected_while_periodic() {
        let mut bus = MockBus::new(vec![]);
        let mut d = driver(Variant::A);
        d.start_periodic();

        assert!(matches!(
            d.write_emissivity(&mut bus, 0.9).await,
            Err(SensorError::Busy { .. })
        ));
        assert!(matches!(
            d.write_config(&mut bus, ConfigWord(0)).await,
            Err(SensorError::Busy { .. })
        ));

        d.stop_periodic();
        // Now it gets as far as the bus, which is empty, so the guard is gone
        assert!(matches!(
            d.write_object_min_max(&mut bus, 10.0, 0.0).await,
            Err(SensorError::ConfigError { .. })
        ));
    }

    #[test]
    fn pwm_ctrl_decoding() {
        let pc = PwmCtrl(0x0201);
        assert!(!pc.extended_mode());
        assert!(!pc.enabled());
        assert_eq!(pc.repetition(), 0);
        assert!((pc.period_ms() - 1.024).abs() < 0.001);
    }
}
