//! Sensor Hardware Layer
//!
//! Register-level access to MPU-6050 inertial sensors over a blocking I2C bus.
//!
//! - `register_io`: bit/byte/word primitives over `embedded_hal::i2c::I2c`
//! - `registers`: register map and device constants
//! - `sensor_config`: typed configuration and derived values
//! - `mpu6050`: the sensor driver, calibration included
//! - `bus`: bus topology and handle providers
//! - `mock`: simulated buses for tests and `--simulate` runs

pub mod bus;
pub mod mock;
pub mod mpu6050;
pub mod register_io;
pub mod registers;
pub mod sensor_config;

pub use bus::{BusAddress, BusProvider};
pub use mpu6050::{CalibrationParams, Mpu6050, SensorSnapshot};
pub use register_io::RegisterIo;
pub use sensor_config::{AccelRange, ClockSource, DlpfMode, GyroRange, SensorConfig};

#[cfg(feature = "hardware")]
pub use bus::LinuxBusProvider;
