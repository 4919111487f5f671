use crate::bus::i2c::I2cError;
use thiserror::Error;

/// Comprehensive error types for the Thermo SensorHub
#[derive(Error, Debug)]
pub enum SensorError {
    #[error("I2C communication failed: {0}")]
    I2cError(#[from] I2cError),

    #[error("Sensor '{sensor}' initialization failed: {reason}")]
    InitError { sensor: String, reason: String },

    #[error("Sensor '{sensor}' read failed: {reason}")]
    ReadError { sensor: String, reason: String },

    #[error("Invalid sensor configuration for '{sensor}': {reason}")]
    ConfigError { sensor: String, reason: String },

    #[error("Sensor '{sensor}' returned invalid data: {reason}")]
    DataError { sensor: String, reason: String },

    #[error("Sensor '{sensor}' has no fresh measurement yet")]
    NotReady { sensor: String },

    #[error("Sensor '{sensor}' is busy: periodic measurement is running")]
    Busy { sensor: String },

    #[error("PEC mismatch on register {reg:#04x}: computed {computed:#04x}, received {received:#04x}")]
    PecMismatch { reg: u8, computed: u8, received: u8 },

    #[error("Unsupported sensor driver: '{driver}'")]
    UnsupportedDriver { driver: String },

    #[error("Bus '{bus}' not found or unavailable")]
    BusNotFound { bus: String },

    #[error("Sensor '{sensor}' wrong chip ID: expected {expected:#06x}, got {actual:#06x}")]
    WrongChipId { sensor: String, expected: u16, actual: u16 },
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to load configuration from '{path}': {source}")]
    LoadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration format: {0}")]
    FormatError(#[from] toml::de::Error),

    #[error("Invalid configuration value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// gRPC service errors
#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("gRPC server failed to start: {0}")]
    ServerStartError(#[from] tonic::transport::Error),

    #[error("Failed to publish sensor data: {reason}")]
    PublishError { reason: String },
}

/// Registry and initialization errors
#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Sensor registration failed: {0}")]
    RegistrationError(#[source] SensorError),

    #[error("Bus initialization failed: {0}")]
    BusInitError(#[from] ConfigError),

    #[error("Failed to create sensor driver: {0}")]
    DriverCreationError(#[source] SensorError),
}

/// Result type aliases for convenience
pub type SensorResult<T> = Result<T, SensorError>;
pub type ConfigResult<T> = Result<T, ConfigError>;
pub type ServiceResult<T> = Result<T, ServiceError>;
pub type RegistryResult<T> = Result<T, RegistryError>;
