//! MPU-6050 register map and constants.
//!
//! Register and bit-field names follow the datasheet and are left undocumented.
#![allow(missing_docs)]

/// Default 7-bit bus address (AD0 low).
pub const DEFAULT_ADDRESS: u8 = 0x68;
/// Alternate 7-bit bus address (AD0 high).
pub const ALTERNATE_ADDRESS: u8 = 0x69;

// Offset registers (big-endian pairs)
pub const XA_OFFS_H: u8 = 0x06;
pub const YA_OFFS_H: u8 = 0x08;
pub const ZA_OFFS_H: u8 = 0x0A;
pub const XG_OFFS_USRH: u8 = 0x13;
pub const YG_OFFS_USRH: u8 = 0x15;
pub const ZG_OFFS_USRH: u8 = 0x17;

pub const SMPLRT_DIV: u8 = 0x19;
pub const CONFIG: u8 = 0x1A;
pub const GYRO_CONFIG: u8 = 0x1B;
pub const ACCEL_CONFIG: u8 = 0x1C;
pub const FIFO_EN: u8 = 0x23;

pub const ACCEL_XOUT_H: u8 = 0x3B;
pub const ACCEL_YOUT_H: u8 = 0x3D;
pub const ACCEL_ZOUT_H: u8 = 0x3F;
pub const TEMP_OUT_H: u8 = 0x41;
pub const GYRO_XOUT_H: u8 = 0x43;
pub const GYRO_YOUT_H: u8 = 0x45;
pub const GYRO_ZOUT_H: u8 = 0x47;

pub const USER_CTRL: u8 = 0x6A;
pub const PWR_MGMT_1: u8 = 0x6B;
pub const FIFO_COUNTH: u8 = 0x72;
pub const FIFO_R_W: u8 = 0x74;
pub const WHO_AM_I: u8 = 0x75;

// Bit fields: (high bit, length) pairs follow the register's datasheet layout.
pub const CFG_DLPF_CFG_BIT: u8 = 2;
pub const CFG_DLPF_CFG_LENGTH: u8 = 3;

pub const GCONFIG_FS_SEL_BIT: u8 = 4;
pub const GCONFIG_FS_SEL_LENGTH: u8 = 2;

pub const ACONFIG_AFS_SEL_BIT: u8 = 4;
pub const ACONFIG_AFS_SEL_LENGTH: u8 = 2;

pub const XG_FIFO_EN_BIT: u8 = 6;
pub const YG_FIFO_EN_BIT: u8 = 5;
pub const ZG_FIFO_EN_BIT: u8 = 4;
pub const ACCEL_FIFO_EN_BIT: u8 = 3;

pub const USERCTRL_FIFO_EN_BIT: u8 = 6;
pub const USERCTRL_FIFO_RESET_BIT: u8 = 2;

pub const PWR1_DEVICE_RESET_BIT: u8 = 7;
pub const PWR1_SLEEP_BIT: u8 = 6;
pub const PWR1_CLKSEL_BIT: u8 = 2;
pub const PWR1_CLKSEL_LENGTH: u8 = 3;

pub const WHO_AM_I_BIT: u8 = 6;
pub const WHO_AM_I_LENGTH: u8 = 6;
/// Expected content of the WHO_AM_I field (bits 6..1).
pub const WHO_AM_I_VALUE: u8 = 0x34;

/// Hardware FIFO capacity in bytes.
pub const FIFO_CAPACITY: usize = 1024;
/// Largest block transfer allowed in one bus transaction.
pub const MAX_TRANSACTION_BYTES: usize = 32;

/// Gyro output rate with the widest DLPF bandwidth (Hz).
pub const DEFAULT_GYRO_OUTPUT_RATE: f64 = 8000.0;
/// Gyro output rate with any other DLPF mode (Hz).
pub const DLPF_GYRO_OUTPUT_RATE: f64 = 1000.0;

/// Raw accelerometer counts per accel offset register LSB.
pub const ACCEL_OFFSET_FACTOR: f64 = 8.0;
/// Raw gyroscope counts per gyro offset register LSB.
pub const GYRO_OFFSET_FACTOR: f64 = 4.0;

/// °C per raw temperature count.
pub const TEMP_FACTOR: f64 = 1.0 / 340.0;
/// °C at a raw temperature reading of zero.
pub const TEMP_OFFSET: f64 = 36.53;
