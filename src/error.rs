//! Custom error types for the application.
//!
//! This module defines the primary error type, `DaqError`, shared by the register driver,
//! the device manager, the command layer and the offline session tools. Using the
//! `thiserror` crate, it provides a centralized and consistent way to handle the
//! failures that can occur, from contract violations at the bit level to missing
//! files during session decoding.
//!
//! ## Error Hierarchy
//!
//! - **`Range`** / **`Value`**: programmer-contract violations in register access (bit
//!   index, field length or value width). Surfaced immediately, never retried.
//! - **`BusUnreachable`**: the addressed device did not acknowledge. This is the one bus
//!   fault the command layer translates into a "connection lost" status.
//! - **`Bus`**: any other bus fault (arbitration loss, overrun, ...).
//! - **`NotFound`** / **`InvalidCommand`** / **`Structure`**: unknown sensor ids, unknown
//!   command names and malformed command arguments. Reported as status messages.
//! - **`Busy`**: a command was submitted while another one is still running.
//! - **`Session`** / **`Transfer`**: session merge/decode and file hand-off failures.
//! - Ambient wrappers for configuration, I/O and serialization errors.
//!
//! By using `#[from]`, `DaqError` can be created from the underlying error types,
//! simplifying error handling throughout the crate with the `?` operator.

use thiserror::Error;

/// Convenience alias for results using the application error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

/// Every failure the crate reports. Variants are described by their messages.
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum DaqError {
    #[error("Range error: {0}")]
    Range(String),

    #[error("Value error: {0}")]
    Value(String),

    #[error("Device at address {address:#04x} is unreachable")]
    BusUnreachable { address: u8 },

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("Invalid command structure: {0}")]
    Structure(String),

    #[error("Manager is busy")]
    Busy,

    #[error("Configuration error: {0}")]
    Config(#[from] Box<figment::Error>),

    #[error("Configuration validation error: {0}")]
    Configuration(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Settings error: {0}")]
    Toml(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Transfer error: {0}")]
    Transfer(String),
}

impl DaqError {
    /// Classify an I2C bus error.
    ///
    /// A missing acknowledge means nobody answered at `address`; every other kind is
    /// reported as a generic bus fault.
    pub fn from_bus<E: embedded_hal::i2c::Error>(address: u8, err: E) -> Self {
        use embedded_hal::i2c::ErrorKind;

        match err.kind() {
            ErrorKind::NoAcknowledge(_) => DaqError::BusUnreachable { address },
            kind => DaqError::Bus(format!("{kind:?} at address {address:#04x}")),
        }
    }

    /// True when the error means "device not responding".
    pub fn is_unreachable(&self) -> bool {
        matches!(self, DaqError::BusUnreachable { .. })
    }
}

impl From<figment::Error> for DaqError {
    fn from(value: figment::Error) -> Self {
        DaqError::Config(Box::new(value))
    }
}

impl From<toml::de::Error> for DaqError {
    fn from(value: toml::de::Error) -> Self {
        DaqError::Toml(value.to_string())
    }
}

impl From<toml::ser::Error> for DaqError {
    fn from(value: toml::ser::Error) -> Self {
        DaqError::Toml(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embedded_hal::i2c::{ErrorKind, NoAcknowledgeSource};

    #[test]
    fn no_acknowledge_is_unreachable() {
        let err = DaqError::from_bus(0x68, ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
        assert!(err.is_unreachable());
        assert_eq!(err.to_string(), "Device at address 0x68 is unreachable");
    }

    #[test]
    fn other_bus_faults_stay_generic() {
        let err = DaqError::from_bus(0x69, ErrorKind::ArbitrationLoss);
        assert!(!err.is_unreachable());
        match err {
            DaqError::Bus(msg) => assert!(msg.contains("ArbitrationLoss")),
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn busy_message_matches_status_text() {
        assert_eq!(DaqError::Busy.to_string(), "Manager is busy");
    }
}
