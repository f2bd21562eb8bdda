//! Register-level access to one device on a two-wire bus.
//!
//! `RegisterIo` wraps a blocking `embedded_hal::i2c::I2c` handle and a 7-bit device
//! address, and provides the bit/byte/word read-modify-write primitives the sensor
//! driver is built on. Every operation is synchronous and maps bus faults through
//! [`DaqError::from_bus`]; nothing is retried here.
//!
//! Words are big-endian and span two consecutive byte registers (`reg`, `reg + 1`).

use embedded_hal::i2c::I2c;

use crate::error::{AppResult, DaqError};
use crate::hardware::registers::MAX_TRANSACTION_BYTES;

/// Register accessor bound to one device address.
pub struct RegisterIo<I> {
    bus: I,
    address: u8,
}

impl<I: I2c> RegisterIo<I> {
    /// Bind a bus handle to a device address.
    pub fn new(bus: I, address: u8) -> Self {
        Self { bus, address }
    }

    /// Device address this accessor talks to.
    pub fn address(&self) -> u8 {
        self.address
    }

    /// Release the underlying bus handle.
    pub fn into_inner(self) -> I {
        self.bus
    }

    /// Read one register.
    pub fn read_byte(&mut self, reg: u8) -> AppResult<u8> {
        let mut buf = [0u8; 1];
        self.bus
            .write_read(self.address, &[reg], &mut buf)
            .map_err(|e| DaqError::from_bus(self.address, e))?;
        Ok(buf[0])
    }

    /// Write one register.
    pub fn write_byte(&mut self, reg: u8, value: u8) -> AppResult<()> {
        self.bus
            .write(self.address, &[reg, value])
            .map_err(|e| DaqError::from_bus(self.address, e))
    }

    /// Set or clear one bit, leaving the rest of the register untouched.
    pub fn write_bit(&mut self, reg: u8, bit: u8, value: bool) -> AppResult<()> {
        check_bit(bit)?;
        let mut byte = self.read_byte(reg)?;
        if value {
            byte |= 1 << bit;
        } else {
            byte &= !(1 << bit);
        }
        self.write_byte(reg, byte)
    }

    /// Replace the `length`-bit field whose most significant bit is `high_bit`.
    pub fn write_bits(&mut self, reg: u8, high_bit: u8, length: u8, value: u8) -> AppResult<()> {
        let mask = field_mask(high_bit, length)?;
        if u16::from(value) >= 1u16 << length {
            return Err(DaqError::Value(format!(
                "value {value} does not fit in {length} bits"
            )));
        }
        let shift = high_bit + 1 - length;
        let byte = self.read_byte(reg)?;
        let byte = (byte & !mask) | (value << shift);
        self.write_byte(reg, byte)
    }

    /// Test one bit.
    pub fn read_bit(&mut self, reg: u8, bit: u8) -> AppResult<bool> {
        check_bit(bit)?;
        let byte = self.read_byte(reg)?;
        Ok(byte & (1 << bit) != 0)
    }

    /// Read the `length`-bit field whose most significant bit is `high_bit`.
    pub fn read_bits(&mut self, reg: u8, high_bit: u8, length: u8) -> AppResult<u8> {
        let mask = field_mask(high_bit, length)?;
        let byte = self.read_byte(reg)?;
        Ok((byte & mask) >> (high_bit + 1 - length))
    }

    /// Write a big-endian word to `reg` and `reg + 1`.
    pub fn write_word(&mut self, reg: u8, value: u16) -> AppResult<()> {
        let [high, low] = value.to_be_bytes();
        self.write_byte(reg, high)?;
        self.write_byte(reg.wrapping_add(1), low)
    }

    /// Two's-complement variant of [`write_word`](Self::write_word).
    pub fn write_signed_word(&mut self, reg: u8, value: i16) -> AppResult<()> {
        self.write_word(reg, value as u16)
    }

    /// Read a big-endian word from `reg` and `reg + 1` in one transaction.
    pub fn read_word(&mut self, reg: u8) -> AppResult<u16> {
        let mut buf = [0u8; 2];
        self.read_into(reg, &mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    #[allow(missing_docs)]
    pub fn read_signed_word(&mut self, reg: u8) -> AppResult<i16> {
        Ok(self.read_word(reg)? as i16)
    }

    /// Block read starting at `reg`, capped at one bus transaction.
    pub fn read_bytes(&mut self, reg: u8, length: usize) -> AppResult<Vec<u8>> {
        check_block(length)?;
        let mut buf = vec![0u8; length];
        self.read_into(reg, &mut buf)?;
        Ok(buf)
    }

    /// Block write starting at `reg`, capped at one bus transaction.
    pub fn write_bytes(&mut self, reg: u8, values: &[u8]) -> AppResult<()> {
        check_block(values.len())?;
        let mut frame = Vec::with_capacity(values.len() + 1);
        frame.push(reg);
        frame.extend_from_slice(values);
        self.bus
            .write(self.address, &frame)
            .map_err(|e| DaqError::from_bus(self.address, e))
    }

    fn read_into(&mut self, reg: u8, buf: &mut [u8]) -> AppResult<()> {
        self.bus
            .write_read(self.address, &[reg], buf)
            .map_err(|e| DaqError::from_bus(self.address, e))
    }
}

fn check_bit(bit: u8) -> AppResult<()> {
    if bit > 7 {
        return Err(DaqError::Range(format!("bit index {bit} is out of range 0..=7")));
    }
    Ok(())
}

/// Mask covering bits `[high_bit - length + 1, high_bit]`.
fn field_mask(high_bit: u8, length: u8) -> AppResult<u8> {
    check_bit(high_bit)?;
    if length == 0 || length > high_bit + 1 {
        return Err(DaqError::Range(format!(
            "field of {length} bits does not fit below bit {high_bit}"
        )));
    }
    let width = ((1u16 << length) - 1) as u8;
    Ok(width << (high_bit + 1 - length))
}

fn check_block(length: usize) -> AppResult<()> {
    if length > MAX_TRANSACTION_BYTES {
        return Err(DaqError::Range(format!(
            "block of {length} bytes exceeds the {MAX_TRANSACTION_BYTES}-byte transaction cap"
        )));
    }
    Ok(())
}
