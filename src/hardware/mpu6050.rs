//! InvenSense MPU-6050 Driver
//!
//! One physical sensor: cached configuration that is written through to the device on
//! every change, unit-conversion factors, the offset calibration control loop and the
//! raw FIFO accessors used by the capture loop.
//!
//! Protocol overview:
//! - Registers are single bytes, 16-bit quantities are big-endian register pairs
//! - FIFO frames hold accel x/y/z then gyro x/y/z, each only if enabled
//! - The FIFO holds 1024 bytes; a block read moves at most 32 bytes
//!
//! # Example Usage
//!
//! ```
//! use imu_daq::hardware::mock::SimulatedBoard;
//! use imu_daq::hardware::Mpu6050;
//!
//! let board = SimulatedBoard::with_sensors(&[(1, 0x68)]);
//! let mut sensor = Mpu6050::new("node_B1A104", 1, board.bus(1), 0x68).unwrap();
//! assert!(sensor.is_connected());
//! sensor.set_accel_fifo_enabled(true).unwrap();
//! assert_eq!(sensor.package_length(), 6);
//! ```

use embedded_hal::i2c::I2c;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{AppResult, DaqError};
use crate::hardware::register_io::RegisterIo;
use crate::hardware::registers::*;
use crate::hardware::sensor_config::{AccelRange, ClockSource, DlpfMode, GyroRange, SensorConfig};

/// Parameters of the offset calibration loop.
///
/// Field names match the `calibrate_sensors` command arguments; the three tuning
/// parameters are optional there.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationParams {
    /// Iteration cap per axis
    pub max_iters: usize,
    /// Leading iterations that apply the full error instead of `epsilon` of it
    pub rough_iters: usize,
    /// Readings averaged per iteration
    pub buffer_size: usize,
    /// Learning rate
    #[serde(default = "default_epsilon")]
    pub epsilon: f64,
    /// Momentum
    #[serde(default = "default_mu")]
    pub mu: f64,
    /// Velocity below which a converged axis stops
    #[serde(default = "default_v_threshold")]
    pub v_threshold: f64,
}

fn default_epsilon() -> f64 {
    0.1
}

fn default_mu() -> f64 {
    0.5
}

fn default_v_threshold() -> f64 {
    0.05
}

impl CalibrationParams {
    /// Parameters with the default tuning (epsilon 0.1, momentum 0.5, threshold 0.05).
    pub fn new(max_iters: usize, rough_iters: usize, buffer_size: usize) -> Self {
        Self {
            max_iters,
            rough_iters,
            buffer_size,
            epsilon: default_epsilon(),
            mu: default_mu(),
            v_threshold: default_v_threshold(),
        }
    }
}

/// Configuration of a sensor at capture time, with the values derived from it.
///
/// Stored per sensor in session descriptors; decode relies on it because the live
/// configuration may change after the capture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorSnapshot {
    /// See [`SensorConfig::clock_source`]
    pub clock_source: ClockSource,
    /// See [`SensorConfig::dlpf_mode`]
    pub dlpf_mode: DlpfMode,
    /// See [`SensorConfig::rate`]
    pub rate: u8,
    /// Samples per second
    pub sample_rate: f64,
    /// See [`SensorConfig::full_scale_accel_range`]
    pub full_scale_accel_range: AccelRange,
    /// See [`SensorConfig::full_scale_gyro_range`]
    pub full_scale_gyro_range: GyroRange,
    /// g per raw count
    pub accel_factor: f64,
    /// °/s per raw count
    pub gyro_factor: f64,
    /// Accelerometer x/y/z in the FIFO
    pub accel_fifo_enabled: bool,
    /// Gyroscope x in the FIFO
    pub x_gyro_fifo_enabled: bool,
    /// Gyroscope y in the FIFO
    pub y_gyro_fifo_enabled: bool,
    /// Gyroscope z in the FIFO
    pub z_gyro_fifo_enabled: bool,
    /// Bytes per FIFO frame
    pub package_length: usize,
}

impl From<SensorConfig> for SensorSnapshot {
    fn from(config: SensorConfig) -> Self {
        Self {
            clock_source: config.clock_source,
            dlpf_mode: config.dlpf_mode,
            rate: config.rate,
            sample_rate: config.sample_rate(),
            full_scale_accel_range: config.full_scale_accel_range,
            full_scale_gyro_range: config.full_scale_gyro_range,
            accel_factor: config.accel_factor(),
            gyro_factor: config.gyro_factor(),
            accel_fifo_enabled: config.accel_fifo_enabled,
            x_gyro_fifo_enabled: config.x_gyro_fifo_enabled,
            y_gyro_fifo_enabled: config.y_gyro_fifo_enabled,
            z_gyro_fifo_enabled: config.z_gyro_fifo_enabled,
            package_length: config.package_length(),
        }
    }
}

/// One of the six calibrated axes: where to read it and where its offset lives.
struct Axis {
    name: &'static str,
    data: u8,
    offset: u8,
    offset_factor: f64,
}

const CALIBRATION_AXES: [Axis; 6] = [
    Axis { name: "accel_x", data: ACCEL_XOUT_H, offset: XA_OFFS_H, offset_factor: ACCEL_OFFSET_FACTOR },
    Axis { name: "accel_y", data: ACCEL_YOUT_H, offset: YA_OFFS_H, offset_factor: ACCEL_OFFSET_FACTOR },
    Axis { name: "accel_z", data: ACCEL_ZOUT_H, offset: ZA_OFFS_H, offset_factor: ACCEL_OFFSET_FACTOR },
    Axis { name: "gyro_x", data: GYRO_XOUT_H, offset: XG_OFFS_USRH, offset_factor: GYRO_OFFSET_FACTOR },
    Axis { name: "gyro_y", data: GYRO_YOUT_H, offset: YG_OFFS_USRH, offset_factor: GYRO_OFFSET_FACTOR },
    Axis { name: "gyro_z", data: GYRO_ZOUT_H, offset: ZG_OFFS_USRH, offset_factor: GYRO_OFFSET_FACTOR },
];

/// Driver for one MPU-6050 on its own bus handle.
pub struct Mpu6050<I> {
    id: String,
    bus: u8,
    io: RegisterIo<I>,
    config: SensorConfig,
}

impl<I: I2c> Mpu6050<I> {
    /// Open a sensor: wake it, enable its FIFO and read back the current configuration.
    ///
    /// # Errors
    /// Fails with [`DaqError::BusUnreachable`] if nothing answers at `address`.
    pub fn new(id: impl Into<String>, bus: u8, handle: I, address: u8) -> AppResult<Self> {
        let mut io = RegisterIo::new(handle, address);
        io.write_bit(PWR_MGMT_1, PWR1_SLEEP_BIT, false)?;
        io.write_bit(USER_CTRL, USERCTRL_FIFO_EN_BIT, true)?;
        let config = read_config(&mut io)?;
        Ok(Self {
            id: id.into(),
            bus,
            io,
            config,
        })
    }

    /// Sensor id, `{device}_B{bus}A{address}`.
    pub fn id(&self) -> &str {
        &self.id
    }

    #[allow(missing_docs)]
    pub fn bus(&self) -> u8 {
        self.bus
    }

    #[allow(missing_docs)]
    pub fn address(&self) -> u8 {
        self.io.address()
    }

    /// Cached configuration.
    pub fn config(&self) -> SensorConfig {
        self.config
    }

    /// Cached configuration with its derived values, for session metadata.
    pub fn snapshot(&self) -> SensorSnapshot {
        self.config.into()
    }

    /// True if the device answers with the expected WHO_AM_I identity.
    ///
    /// An unreachable device reports `false` rather than an error.
    pub fn is_connected(&mut self) -> bool {
        match self.io.read_bits(WHO_AM_I, WHO_AM_I_BIT, WHO_AM_I_LENGTH) {
            Ok(value) => value == WHO_AM_I_VALUE,
            Err(err) => {
                debug!(sensor_id = %self.id, error = %err, "connection test failed");
                false
            }
        }
    }

    /// Restore factory defaults, then wake the device and re-enable its FIFO.
    #[instrument(skip(self), fields(sensor_id = %self.id))]
    pub fn reset(&mut self) -> AppResult<()> {
        self.io.write_bit(PWR_MGMT_1, PWR1_DEVICE_RESET_BIT, true)?;
        self.io.write_bit(PWR_MGMT_1, PWR1_SLEEP_BIT, false)?;
        self.io.write_bit(USER_CTRL, USERCTRL_FIFO_EN_BIT, true)?;
        let defaults = SensorConfig::default();
        self.set_dlpf_mode(defaults.dlpf_mode)?;
        self.config = defaults;
        debug!("sensor reset");
        Ok(())
    }

    /// Write every field of `config` to the device.
    pub fn apply(&mut self, config: &SensorConfig) -> AppResult<()> {
        self.set_clock_source(config.clock_source)?;
        self.set_dlpf_mode(config.dlpf_mode)?;
        self.set_rate(config.rate)?;
        self.set_full_scale_accel_range(config.full_scale_accel_range)?;
        self.set_full_scale_gyro_range(config.full_scale_gyro_range)?;
        self.set_accel_fifo_enabled(config.accel_fifo_enabled)?;
        self.set_x_gyro_fifo_enabled(config.x_gyro_fifo_enabled)?;
        self.set_y_gyro_fifo_enabled(config.y_gyro_fifo_enabled)?;
        self.set_z_gyro_fifo_enabled(config.z_gyro_fifo_enabled)
    }

    /// Clock source (`PWR_MGMT_1.CLKSEL`).
    pub fn set_clock_source(&mut self, source: ClockSource) -> AppResult<()> {
        self.io
            .write_bits(PWR_MGMT_1, PWR1_CLKSEL_BIT, PWR1_CLKSEL_LENGTH, source.into())?;
        self.config.clock_source = source;
        Ok(())
    }

    /// Low-pass filter; also selects the 8 kHz or 1 kHz gyro output rate.
    pub fn set_dlpf_mode(&mut self, mode: DlpfMode) -> AppResult<()> {
        self.io
            .write_bits(CONFIG, CFG_DLPF_CFG_BIT, CFG_DLPF_CFG_LENGTH, mode.into())?;
        self.config.dlpf_mode = mode;
        Ok(())
    }

    /// Sample-rate divisor.
    pub fn set_rate(&mut self, rate: u8) -> AppResult<()> {
        self.io.write_byte(SMPLRT_DIV, rate)?;
        self.config.rate = rate;
        Ok(())
    }

    /// Accelerometer full-scale range (`ACCEL_CONFIG.AFS_SEL`).
    pub fn set_full_scale_accel_range(&mut self, range: AccelRange) -> AppResult<()> {
        self.io.write_bits(
            ACCEL_CONFIG,
            ACONFIG_AFS_SEL_BIT,
            ACONFIG_AFS_SEL_LENGTH,
            range.into(),
        )?;
        self.config.full_scale_accel_range = range;
        Ok(())
    }

    /// Gyroscope full-scale range (`GYRO_CONFIG.FS_SEL`).
    pub fn set_full_scale_gyro_range(&mut self, range: GyroRange) -> AppResult<()> {
        self.io.write_bits(
            GYRO_CONFIG,
            GCONFIG_FS_SEL_BIT,
            GCONFIG_FS_SEL_LENGTH,
            range.into(),
        )?;
        self.config.full_scale_gyro_range = range;
        Ok(())
    }

    /// Route accelerometer x/y/z into the FIFO.
    pub fn set_accel_fifo_enabled(&mut self, enabled: bool) -> AppResult<()> {
        self.io.write_bit(FIFO_EN, ACCEL_FIFO_EN_BIT, enabled)?;
        self.config.accel_fifo_enabled = enabled;
        Ok(())
    }

    /// Route gyroscope x into the FIFO.
    pub fn set_x_gyro_fifo_enabled(&mut self, enabled: bool) -> AppResult<()> {
        self.io.write_bit(FIFO_EN, XG_FIFO_EN_BIT, enabled)?;
        self.config.x_gyro_fifo_enabled = enabled;
        Ok(())
    }

    /// Route gyroscope y into the FIFO.
    pub fn set_y_gyro_fifo_enabled(&mut self, enabled: bool) -> AppResult<()> {
        self.io.write_bit(FIFO_EN, YG_FIFO_EN_BIT, enabled)?;
        self.config.y_gyro_fifo_enabled = enabled;
        Ok(())
    }

    /// Route gyroscope z into the FIFO.
    pub fn set_z_gyro_fifo_enabled(&mut self, enabled: bool) -> AppResult<()> {
        self.io.write_bit(FIFO_EN, ZG_FIFO_EN_BIT, enabled)?;
        self.config.z_gyro_fifo_enabled = enabled;
        Ok(())
    }

    /// Samples per second at the cached configuration.
    pub fn sample_rate(&self) -> f64 {
        self.config.sample_rate()
    }

    /// g per raw accelerometer count.
    pub fn accel_factor(&self) -> f64 {
        self.config.accel_factor()
    }

    /// °/s per raw gyroscope count.
    pub fn gyro_factor(&self) -> f64 {
        self.config.gyro_factor()
    }

    /// Bytes per FIFO frame.
    pub fn package_length(&self) -> usize {
        self.config.package_length()
    }

    /// Die temperature in °C.
    pub fn temperature(&mut self) -> AppResult<f64> {
        let raw = self.io.read_signed_word(TEMP_OUT_H)?;
        Ok(f64::from(raw) * TEMP_FACTOR + TEMP_OFFSET)
    }

    /// Drive the raw bias of every axis to its target by adjusting the offset registers.
    ///
    /// Accelerometer x/y and all gyroscope axes are driven to 0, accelerometer z to
    /// the raw-count equivalent of 1 g at the current range. Axes are processed in
    /// a fixed order: accel x, y, z, then gyro x, y, z.
    #[instrument(skip(self), fields(sensor_id = %self.id))]
    pub fn calibrate(&mut self, params: &CalibrationParams) -> AppResult<()> {
        if params.buffer_size == 0 {
            return Err(DaqError::Value("calibration buffer size must be positive".into()));
        }
        let one_g = 1.0 / self.accel_factor();
        for axis in &CALIBRATION_AXES {
            let target = if axis.data == ACCEL_ZOUT_H { one_g } else { 0.0 };
            let iterations = self.calibrate_axis(axis, target, params)?;
            debug!(axis = axis.name, iterations, "axis calibrated");
        }
        Ok(())
    }

    /// Momentum-damped proportional controller for one axis; returns iterations used.
    fn calibrate_axis(
        &mut self,
        axis: &Axis,
        target: f64,
        params: &CalibrationParams,
    ) -> AppResult<usize> {
        let mut velocity = 0.0;
        let mut offset = 0.0;
        self.io.write_signed_word(axis.offset, 0)?;

        for iteration in 0..params.max_iters {
            let mut sum = 0.0;
            for _ in 0..params.buffer_size {
                sum += f64::from(self.io.read_signed_word(axis.data)?);
            }
            let delta = sum / params.buffer_size as f64 - target;

            if iteration < params.rough_iters {
                offset += params.mu * velocity - delta;
            } else {
                offset += params.mu * velocity - delta * params.epsilon;
            }
            velocity = params.mu * velocity - delta * params.epsilon;

            if delta.abs() < axis.offset_factor && velocity.abs() < params.v_threshold {
                return Ok(iteration + 1);
            }
            let register = (offset / axis.offset_factor)
                .round()
                .clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16;
            self.io.write_signed_word(axis.offset, register)?;
        }
        Ok(params.max_iters)
    }

    /// Bytes currently queued in the hardware FIFO.
    pub fn fifo_count(&mut self) -> AppResult<usize> {
        Ok(usize::from(self.io.read_word(FIFO_COUNTH)?))
    }

    /// Drain `length` bytes (at most one 32-byte transaction) from the FIFO.
    pub fn fifo_bytes(&mut self, length: usize) -> AppResult<Vec<u8>> {
        self.io.read_bytes(FIFO_R_W, length)
    }

    /// Discard the FIFO contents.
    pub fn reset_fifo(&mut self) -> AppResult<()> {
        self.io.write_bit(USER_CTRL, USERCTRL_FIFO_RESET_BIT, true)
    }
}

fn read_config<I: I2c>(io: &mut RegisterIo<I>) -> AppResult<SensorConfig> {
    Ok(SensorConfig {
        clock_source: io
            .read_bits(PWR_MGMT_1, PWR1_CLKSEL_BIT, PWR1_CLKSEL_LENGTH)?
            .try_into()?,
        dlpf_mode: dlpf_from_register(io.read_bits(CONFIG, CFG_DLPF_CFG_BIT, CFG_DLPF_CFG_LENGTH)?),
        rate: io.read_byte(SMPLRT_DIV)?,
        full_scale_accel_range: io
            .read_bits(ACCEL_CONFIG, ACONFIG_AFS_SEL_BIT, ACONFIG_AFS_SEL_LENGTH)?
            .try_into()?,
        full_scale_gyro_range: io
            .read_bits(GYRO_CONFIG, GCONFIG_FS_SEL_BIT, GCONFIG_FS_SEL_LENGTH)?
            .try_into()?,
        accel_fifo_enabled: io.read_bit(FIFO_EN, ACCEL_FIFO_EN_BIT)?,
        x_gyro_fifo_enabled: io.read_bit(FIFO_EN, XG_FIFO_EN_BIT)?,
        y_gyro_fifo_enabled: io.read_bit(FIFO_EN, YG_FIFO_EN_BIT)?,
        z_gyro_fifo_enabled: io.read_bit(FIFO_EN, ZG_FIFO_EN_BIT)?,
    })
}

// DLPF_CFG 7 is reserved and behaves like the unfiltered mode.
fn dlpf_from_register(value: u8) -> DlpfMode {
    DlpfMode::try_from(value).unwrap_or(DlpfMode::Bw256)
}
