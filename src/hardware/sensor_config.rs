//! Sensor configuration model.
//!
//! Typed versions of the MPU-6050 configuration fields, together with the values
//! derived from them (sample rate, unit-conversion factors, FIFO package length).
//! All enums serialize as their raw register value so command arguments, persisted
//! settings and session descriptors stay numeric.

use serde::{Deserialize, Serialize};

use crate::error::DaqError;
use crate::hardware::registers::{DEFAULT_GYRO_OUTPUT_RATE, DLPF_GYRO_OUTPUT_RATE};

macro_rules! register_enum {
    (
        $(#[$meta:meta])*
        $name:ident { $($(#[$vmeta:meta])* $variant:ident = $value:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(try_from = "u8", into = "u8")]
        pub enum $name {
            $($(#[$vmeta])* $variant = $value),+
        }

        impl TryFrom<u8> for $name {
            type Error = DaqError;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $($value => Ok(Self::$variant),)+
                    other => Err(DaqError::Value(format!(
                        "{} is not a valid {}",
                        other,
                        stringify!($name)
                    ))),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> u8 {
                value as u8
            }
        }
    };
}

register_enum! {
    /// Clock source selection (PWR_MGMT_1 CLKSEL).
    ClockSource {
        /// Internal 8 MHz oscillator
        Internal = 0,
        /// PLL with X gyro reference
        PllXGyro = 1,
        /// PLL with Y gyro reference
        PllYGyro = 2,
        /// PLL with Z gyro reference
        PllZGyro = 3,
        /// PLL with external 32.768 kHz reference
        PllExt32K = 4,
        /// PLL with external 19.2 MHz reference
        PllExt19M = 5,
        /// Reserved encoding
        Reserved = 6,
        /// Stops the clock and keeps the timing generator in reset
        KeepReset = 7,
    }
}

register_enum! {
    /// Digital low-pass filter mode (CONFIG DLPF_CFG), named by accel bandwidth in Hz.
    DlpfMode {
        /// 260 Hz accel / 256 Hz gyro, the only mode with an 8 kHz gyro output rate
        Bw256 = 0,
        /// 188 Hz
        Bw188 = 1,
        /// 98 Hz
        Bw98 = 2,
        /// 42 Hz
        Bw42 = 3,
        /// 20 Hz
        Bw20 = 4,
        /// 10 Hz
        Bw10 = 5,
        /// 5 Hz
        Bw5 = 6,
    }
}

register_enum! {
    /// Accelerometer full-scale range (ACCEL_CONFIG AFS_SEL).
    AccelRange {
        /// ±2 g
        G2 = 0,
        /// ±4 g
        G4 = 1,
        /// ±8 g
        G8 = 2,
        /// ±16 g
        G16 = 3,
    }
}

register_enum! {
    /// Gyroscope full-scale range (GYRO_CONFIG FS_SEL).
    GyroRange {
        /// ±250 °/s
        Dps250 = 0,
        /// ±500 °/s
        Dps500 = 1,
        /// ±1000 °/s
        Dps1000 = 2,
        /// ±2000 °/s
        Dps2000 = 3,
    }
}

impl DlpfMode {
    /// Gyro output rate associated with this filter mode (Hz).
    pub fn gyro_output_rate(self) -> f64 {
        match self {
            DlpfMode::Bw256 => DEFAULT_GYRO_OUTPUT_RATE,
            _ => DLPF_GYRO_OUTPUT_RATE,
        }
    }
}

impl AccelRange {
    /// Physical units (g) per raw count.
    pub fn factor(self) -> f64 {
        let full_scale = match self {
            AccelRange::G2 => 2.0,
            AccelRange::G4 => 4.0,
            AccelRange::G8 => 8.0,
            AccelRange::G16 => 16.0,
        };
        full_scale / 32768.0
    }
}

impl GyroRange {
    /// Physical units (°/s) per raw count.
    pub fn factor(self) -> f64 {
        let full_scale = match self {
            GyroRange::Dps250 => 250.0,
            GyroRange::Dps500 => 500.0,
            GyroRange::Dps1000 => 1000.0,
            GyroRange::Dps2000 => 2000.0,
        };
        full_scale / 32768.0
    }
}

/// Complete mutable configuration of one sensor.
///
/// Field names match the `configure_sensors` command arguments.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorConfig {
    /// Clock source
    pub clock_source: ClockSource,
    /// Low-pass filter, which also fixes the gyro output rate
    pub dlpf_mode: DlpfMode,
    /// Sample-rate divisor (SMPLRT_DIV)
    pub rate: u8,
    /// Accelerometer range
    pub full_scale_accel_range: AccelRange,
    /// Gyroscope range
    pub full_scale_gyro_range: GyroRange,
    /// Accelerometer x/y/z (6 bytes per frame)
    pub accel_fifo_enabled: bool,
    /// Gyroscope x (2 bytes per frame)
    pub x_gyro_fifo_enabled: bool,
    /// Gyroscope y (2 bytes per frame)
    pub y_gyro_fifo_enabled: bool,
    /// Gyroscope z (2 bytes per frame)
    pub z_gyro_fifo_enabled: bool,
}

impl Default for SensorConfig {
    /// State after [`Mpu6050::reset`](crate::hardware::Mpu6050::reset).
    fn default() -> Self {
        Self {
            clock_source: ClockSource::Internal,
            dlpf_mode: DlpfMode::Bw5,
            rate: 0,
            full_scale_accel_range: AccelRange::G2,
            full_scale_gyro_range: GyroRange::Dps250,
            accel_fifo_enabled: false,
            x_gyro_fifo_enabled: false,
            y_gyro_fifo_enabled: false,
            z_gyro_fifo_enabled: false,
        }
    }
}

impl SensorConfig {
    /// Samples per second: gyro output rate / (1 + divisor).
    pub fn sample_rate(&self) -> f64 {
        self.dlpf_mode.gyro_output_rate() / (1.0 + f64::from(self.rate))
    }

    /// See [`AccelRange::factor`].
    pub fn accel_factor(&self) -> f64 {
        self.full_scale_accel_range.factor()
    }

    /// See [`GyroRange::factor`].
    pub fn gyro_factor(&self) -> f64 {
        self.full_scale_gyro_range.factor()
    }

    /// Bytes per FIFO frame for the enabled axes (0..=12, always even).
    pub fn package_length(&self) -> usize {
        let mut length = 0;
        if self.accel_fifo_enabled {
            length += 6;
        }
        for enabled in [
            self.x_gyro_fifo_enabled,
            self.y_gyro_fifo_enabled,
            self.z_gyro_fifo_enabled,
        ] {
            if enabled {
                length += 2;
            }
        }
        length
    }
}
