//! Bus topology and bus handle providers.
//!
//! Every sensor owns its own bus handle; a [`BusProvider`] opens one handle per
//! sensor for a given bus index. The simulated provider lives in
//! [`crate::hardware::mock`]; the Linux `/dev/i2c-N` provider is compiled with the
//! `hardware` feature.

use std::fmt;

use embedded_hal::i2c::I2c;

use crate::error::AppResult;

/// A physical location on the bus topology; not necessarily occupied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BusAddress {
    /// Bus index (`/dev/i2c-N`)
    pub bus: u8,
    /// 7-bit device address
    pub address: u8,
}

impl BusAddress {
    #[allow(missing_docs)]
    pub fn new(bus: u8, address: u8) -> Self {
        Self { bus, address }
    }

    /// Sensor id for this location on node `device_id`: `{device_id}_B{bus}A{address}`.
    pub fn sensor_id(&self, device_id: &str) -> String {
        format!("{}_B{}A{}", device_id, self.bus, self.address)
    }

    /// Cartesian product of candidate buses and addresses, bus-major.
    pub fn candidates(buses: &[u8], addresses: &[u8]) -> Vec<BusAddress> {
        buses
            .iter()
            .flat_map(|&bus| addresses.iter().map(move |&address| Self::new(bus, address)))
            .collect()
    }
}

impl fmt::Display for BusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "bus {} address {:#04x}", self.bus, self.address)
    }
}

/// Opens bus handles by bus index.
pub trait BusProvider: Send + 'static {
    /// Handle type; one is opened per sensor.
    type Bus: I2c + Send + 'static;

    /// Open a new handle on bus `bus`.
    fn open(&self, bus: u8) -> AppResult<Self::Bus>;
}

#[cfg(feature = "hardware")]
pub use linux::LinuxBusProvider;

#[cfg(feature = "hardware")]
mod linux {
    use linux_embedded_hal::I2cdev;

    use super::BusProvider;
    use crate::error::{AppResult, DaqError};

    /// Opens `/dev/i2c-{bus}` character devices.
    #[derive(Debug, Clone, Default)]
    pub struct LinuxBusProvider;

    impl BusProvider for LinuxBusProvider {
        type Bus = I2cdev;

        fn open(&self, bus: u8) -> AppResult<Self::Bus> {
            let path = format!("/dev/i2c-{bus}");
            I2cdev::new(&path).map_err(|e| DaqError::Bus(format!("failed to open {path}: {e}")))
        }
    }
}
