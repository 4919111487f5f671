use async_trait::async_trait;
use thiserror::Error;

#[cfg(target_os = "linux")]
use i2cdev::core::I2CDevice;
#[cfg(target_os = "linux")]
use i2cdev::linux::{LinuxI2CDevice, LinuxI2CError};

/// I2C bus error type - uniform across platforms so drivers stay portable
#[derive(Debug, Error)]
pub enum I2cError {
    #[error("I2C transfer failed: {0}")]
    Transfer(String),

    #[error("I2C bus unavailable at '{path}': {reason}")]
    Unavailable { path: String, reason: String },

    #[error("I2C is only supported on Linux")]
    Unsupported,
}

#[cfg(target_os = "linux")]
impl From<LinuxI2CError> for I2cError {
    fn from(e: LinuxI2CError) -> Self {
        I2cError::Transfer(e.to_string())
    }
}

/// Register-addressed I2C access shared by all sensor drivers.
///
/// `read_bytes`/`write_bytes` use SMBus byte/block transfers and are limited to
/// 32 bytes per call; `read_block` performs a raw register-pointer write
/// followed by a plain read and has no such limit (the Thermal2 pixel batch
/// needs 784 bytes in one transaction).
#[async_trait]
pub trait I2cBus: Send {
    async fn read_bytes(&mut self, address: u8, reg: u8, buf: &mut [u8]) -> Result<(), I2cError>;
    async fn write_bytes(&mut self, address: u8, reg: u8, data: &[u8]) -> Result<(), I2cError>;
    async fn read_block(&mut self, address: u8, reg: u8, buf: &mut [u8]) -> Result<(), I2cError>;

    async fn write_byte(&mut self, address: u8, reg: u8, byte: u8) -> Result<(), I2cError> {
        self.write_bytes(address, reg, &[byte]).await
    }
}

/// I2C bus implementation over the Linux i2c-dev interface
#[cfg(target_os = "linux")]
pub struct LinuxI2cBus {
    device: LinuxI2CDevice,
}

#[cfg(target_os = "linux")]
impl LinuxI2cBus {
    pub fn new(path: &str) -> Result<Self, I2cError> {
        let device = LinuxI2CDevice::new(path, 0).map_err(|e| I2cError::Unavailable {
            path: path.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { device })
    }
}

#[cfg(target_os = "linux")]
#[async_trait]
impl I2cBus for LinuxI2cBus {
    async fn read_bytes(&mut self, address: u8, reg: u8, buf: &mut [u8]) -> Result<(), I2cError> {
        self.device.set_slave_address(address as u16)?;

        if buf.len() == 1 {
            // Use SMBus read byte data for single byte reads
            buf[0] = self.device.smbus_read_byte_data(reg)?;
        } else {
            // Use SMBus block read for multi-byte reads
            let temp_buf = self.device.smbus_read_i2c_block_data(reg, buf.len() as u8)?;
            buf.copy_from_slice(&temp_buf);
        }

        Ok(())
    }

    async fn write_bytes(&mut self, address: u8, reg: u8, data: &[u8]) -> Result<(), I2cError> {
        self.device.set_slave_address(address as u16)?;
        self.device.smbus_write_i2c_block_data(reg, data)?;
        Ok(())
    }

    async fn read_block(&mut self, address: u8, reg: u8, buf: &mut [u8]) -> Result<(), I2cError> {
        self.device.set_slave_address(address as u16)?;
        // Set the register pointer, then stream the payload in one read
        self.device.write(&[reg])?;
        self.device.read(buf)?;
        Ok(())
    }

    async fn write_byte(&mut self, address: u8, reg: u8, byte: u8) -> Result<(), I2cError> {
        self.device.set_slave_address(address as u16)?;
        self.device.smbus_write_byte_data(reg, byte)?;
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
pub struct LinuxI2cBus {
    _phantom: std::marker::PhantomData<()>,
}

#[cfg(not(target_os = "linux"))]
impl LinuxI2cBus {
    pub fn new(_path: &str) -> Result<Self, I2cError> {
        Err(I2cError::Unsupported)
    }
}

#[cfg(not(target_os = "linux"))]
#[async_trait]
impl I2cBus for LinuxI2cBus {
    async fn read_bytes(&mut self, _address: u8, _reg: u8, _buf: &mut [u8]) -> Result<(), I2cError> {
        Err(I2cError::Unsupported)
    }

    async fn write_bytes(&mut self, _address: u8, _reg: u8, _data: &[u8]) -> Result<(), I2cError> {
        Err(I2cError::Unsupported)
    }

    async fn read_block(&mut self, _address: u8, _reg: u8, _buf: &mut [u8]) -> Result<(), I2cError> {
        Err(I2cError::Unsupported)
    }
}
