//! Host-side hub for I2C infrared thermometry devices.
//!
//! Drivers for the MLX90614 (SMBus with PEC), NCIR2 and Thermal2 imaging
//! units share one bus abstraction; a per-sensor scheduler polls them at
//! their native measurement intervals and streams decoded frames over gRPC.

pub mod bus;
pub mod config;
pub mod errors;
pub mod grpc_service;
pub mod messages;
pub mod registry;
pub mod scheduler;
pub mod sensors;

pub use errors::{ConfigError, RegistryError, SensorError, ServiceError};
pub use messages::SensorMessage;
pub use sensors::{SensorDriver, ThermoFrame};
