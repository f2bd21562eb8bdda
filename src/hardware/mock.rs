//! Mock Hardware Implementations
//!
//! Provides a simulated set of I2C buses populated with MPU-6050 devices, for testing
//! without physical hardware and for the binary's `--simulate` mode.
//!
//! # Model
//!
//! - One register file per (bus, address), initialised to power-on values
//!   (sleep enabled, WHO_AM_I = 0x68).
//! - Raw accelerometer/gyroscope readings are `bias + offset_register * lsb_factor`,
//!   so the calibration controller can drive them to target.
//! - The FIFO holds at most 1024 bytes. In [`FillMode::Realtime`] it fills with frames
//!   at the configured sample rate while FIFO output is enabled; in
//!   [`FillMode::Manual`] only [`SimulatedBoard::push_fifo`] adds bytes.
//! - Detached devices answer with `NoAcknowledge`, like an unplugged sensor.
//!
//! Every FIFO block read is recorded so tests can check transaction sizes.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;

use embedded_hal::i2c::{ErrorKind, ErrorType, I2c, NoAcknowledgeSource, Operation};
use parking_lot::Mutex;

use crate::error::AppResult;
use crate::hardware::bus::BusProvider;
use crate::hardware::registers::*;

/// How a simulated FIFO receives data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillMode {
    /// Frames appear at the configured sample rate.
    Realtime,
    /// Frames appear only through [`SimulatedBoard::push_fifo`].
    Manual,
}

/// Register-level model of one MPU-6050.
#[derive(Debug)]
struct SimulatedMpu6050 {
    regs: [u8; 128],
    fifo: VecDeque<u8>,
    /// Raw readings with zero offsets: accel x/y/z, gyro x/y/z.
    bias: [i32; 6],
    temperature_raw: i16,
    fill_mode: FillMode,
    fifo_epoch: Instant,
    produced: u64,
    fifo_read_sizes: Vec<usize>,
}

impl SimulatedMpu6050 {
    fn new() -> Self {
        let mut device = Self {
            regs: [0; 128],
            fifo: VecDeque::with_capacity(FIFO_CAPACITY),
            bias: [120, -80, 16_384 + 300, 25, -40, 10],
            temperature_raw: -520,
            fill_mode: FillMode::Realtime,
            fifo_epoch: Instant::now(),
            produced: 0,
            fifo_read_sizes: Vec::new(),
        };
        device.power_on();
        device
    }

    fn power_on(&mut self) {
        self.regs = [0; 128];
        self.regs[PWR_MGMT_1 as usize] = 1 << PWR1_SLEEP_BIT;
        self.regs[WHO_AM_I as usize] = WHO_AM_I_VALUE << 1;
        self.clear_fifo();
    }

    fn clear_fifo(&mut self) {
        self.fifo.clear();
        self.fifo_epoch = Instant::now();
        self.produced = 0;
    }

    fn bit(&self, reg: u8, bit: u8) -> bool {
        self.regs[reg as usize] & (1 << bit) != 0
    }

    fn offset(&self, reg: u8) -> i32 {
        i32::from(i16::from_be_bytes([
            self.regs[reg as usize],
            self.regs[reg as usize + 1],
        ]))
    }

    /// Current raw readings: accel x/y/z, gyro x/y/z.
    fn readings(&self) -> [i16; 6] {
        let offsets = [
            self.offset(XA_OFFS_H) * ACCEL_OFFSET_FACTOR as i32,
            self.offset(YA_OFFS_H) * ACCEL_OFFSET_FACTOR as i32,
            self.offset(ZA_OFFS_H) * ACCEL_OFFSET_FACTOR as i32,
            self.offset(XG_OFFS_USRH) * GYRO_OFFSET_FACTOR as i32,
            self.offset(YG_OFFS_USRH) * GYRO_OFFSET_FACTOR as i32,
            self.offset(ZG_OFFS_USRH) * GYRO_OFFSET_FACTOR as i32,
        ];
        let mut out = [0i16; 6];
        for (i, slot) in out.iter_mut().enumerate() {
            let raw = self.bias[i] + offsets[i];
            *slot = raw.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16;
        }
        out
    }

    fn frame(&self) -> Vec<u8> {
        let readings = self.readings();
        let mut frame = Vec::with_capacity(12);
        if self.bit(FIFO_EN, ACCEL_FIFO_EN_BIT) {
            for value in &readings[..3] {
                frame.extend_from_slice(&value.to_be_bytes());
            }
        }
        for (axis, bit) in [XG_FIFO_EN_BIT, YG_FIFO_EN_BIT, ZG_FIFO_EN_BIT]
            .into_iter()
            .enumerate()
        {
            if self.bit(FIFO_EN, bit) {
                frame.extend_from_slice(&readings[3 + axis].to_be_bytes());
            }
        }
        frame
    }

    fn sample_rate(&self) -> f64 {
        let dlpf = self.regs[CONFIG as usize] & 0x07;
        let output_rate = if dlpf == 0 || dlpf == 7 {
            DEFAULT_GYRO_OUTPUT_RATE
        } else {
            DLPF_GYRO_OUTPUT_RATE
        };
        output_rate / (1.0 + f64::from(self.regs[SMPLRT_DIV as usize]))
    }

    fn push(&mut self, bytes: &[u8]) {
        for byte in bytes {
            if self.fifo.len() >= FIFO_CAPACITY {
                break;
            }
            self.fifo.push_back(*byte);
        }
    }

    fn refill(&mut self) {
        if self.fill_mode != FillMode::Realtime || !self.bit(USER_CTRL, USERCTRL_FIFO_EN_BIT) {
            return;
        }
        let frame = self.frame();
        let expected = (self.fifo_epoch.elapsed().as_secs_f64() * self.sample_rate()) as u64;
        if frame.is_empty() {
            self.produced = expected;
            return;
        }
        while self.produced < expected {
            if self.fifo.len() >= FIFO_CAPACITY {
                self.produced = expected;
                break;
            }
            // The hardware keeps the leading bytes of a frame that does not fit.
            self.push(&frame);
            self.produced += 1;
        }
    }

    fn read_register(&mut self, reg: u8) -> u8 {
        match reg {
            ACCEL_XOUT_H..=0x48 => {
                let readings = self.readings();
                let index = (reg - ACCEL_XOUT_H) as usize;
                let word = match index / 2 {
                    0..=2 => readings[index / 2],
                    3 => self.temperature_raw,
                    n => readings[n - 1],
                };
                word.to_be_bytes()[index % 2]
            }
            FIFO_COUNTH | 0x73 => {
                self.refill();
                (self.fifo.len() as u16).to_be_bytes()[(reg - FIFO_COUNTH) as usize]
            }
            FIFO_R_W => {
                self.refill();
                self.fifo.pop_front().unwrap_or(0)
            }
            _ => self.regs.get(reg as usize).copied().unwrap_or(0),
        }
    }

    fn write_register(&mut self, reg: u8, value: u8) {
        match reg {
            PWR_MGMT_1 if value & (1 << PWR1_DEVICE_RESET_BIT) != 0 => self.power_on(),
            USER_CTRL => {
                let was_enabled = self.bit(USER_CTRL, USERCTRL_FIFO_EN_BIT);
                self.regs[USER_CTRL as usize] = value & !(1 << USERCTRL_FIFO_RESET_BIT);
                if value & (1 << USERCTRL_FIFO_RESET_BIT) != 0
                    || (!was_enabled && self.bit(USER_CTRL, USERCTRL_FIFO_EN_BIT))
                {
                    self.clear_fifo();
                }
            }
            FIFO_R_W => self.push(&[value]),
            WHO_AM_I => {}
            _ => {
                if let Some(slot) = self.regs.get_mut(reg as usize) {
                    *slot = value;
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct BoardState {
    devices: HashMap<(u8, u8), SimulatedMpu6050>,
}

/// A set of simulated I2C buses shared by every handle opened from it.
#[derive(Debug, Clone, Default)]
pub struct SimulatedBoard {
    state: Arc<Mutex<BoardState>>,
}

impl SimulatedBoard {
    /// Empty board: every address is unoccupied.
    pub fn new() -> Self {
        Self::default()
    }

    /// Board with one sensor at each (bus, address) pair.
    pub fn with_sensors(locations: &[(u8, u8)]) -> Self {
        let board = Self::new();
        for &(bus, address) in locations {
            board.attach(bus, address);
        }
        board
    }

    /// Plug a fresh sensor in (power-on state, realtime FIFO).
    pub fn attach(&self, bus: u8, address: u8) {
        self.state
            .lock()
            .devices
            .insert((bus, address), SimulatedMpu6050::new());
    }

    /// Unplug a sensor; further transactions to it fail with `NoAcknowledge`.
    pub fn detach(&self, bus: u8, address: u8) {
        self.state.lock().devices.remove(&(bus, address));
    }

    /// Open a handle on one bus.
    pub fn bus(&self, bus: u8) -> SimulatedBus {
        SimulatedBus {
            state: Arc::clone(&self.state),
            bus,
        }
    }

    /// Switch a sensor between realtime and manual FIFO filling.
    pub fn set_fill_mode(&self, bus: u8, address: u8, mode: FillMode) {
        self.with_device(bus, address, |device| device.fill_mode = mode);
    }

    /// Raw readings with zero offsets: accel x/y/z, gyro x/y/z.
    pub fn set_bias(&self, bus: u8, address: u8, bias: [i32; 6]) {
        self.with_device(bus, address, |device| device.bias = bias);
    }

    /// Append bytes to a FIFO (truncated at hardware capacity).
    pub fn push_fifo(&self, bus: u8, address: u8, bytes: &[u8]) {
        self.with_device(bus, address, |device| device.push(bytes));
    }

    /// Fill a FIFO to hardware capacity.
    pub fn fill_fifo(&self, bus: u8, address: u8) {
        self.with_device(bus, address, |device| {
            let missing = FIFO_CAPACITY - device.fifo.len();
            device.push(&vec![0u8; missing]);
        });
    }

    /// Sizes of every FIFO block read so far.
    pub fn fifo_read_sizes(&self, bus: u8, address: u8) -> Vec<usize> {
        self.state
            .lock()
            .devices
            .get(&(bus, address))
            .map(|device| device.fifo_read_sizes.clone())
            .unwrap_or_default()
    }

    /// Current value of a plain register.
    pub fn register(&self, bus: u8, address: u8, reg: u8) -> Option<u8> {
        self.state
            .lock()
            .devices
            .get(&(bus, address))
            .and_then(|device| device.regs.get(reg as usize).copied())
    }

    /// Current raw readings (accel x/y/z, gyro x/y/z) including offsets.
    pub fn readings(&self, bus: u8, address: u8) -> Option<[i16; 6]> {
        self.state
            .lock()
            .devices
            .get(&(bus, address))
            .map(SimulatedMpu6050::readings)
    }

    fn with_device(&self, bus: u8, address: u8, f: impl FnOnce(&mut SimulatedMpu6050)) {
        if let Some(device) = self.state.lock().devices.get_mut(&(bus, address)) {
            f(device);
        }
    }
}

impl BusProvider for SimulatedBoard {
    type Bus = SimulatedBus;

    fn open(&self, bus: u8) -> AppResult<Self::Bus> {
        Ok(self.bus(bus))
    }
}

/// Handle on one simulated bus.
#[derive(Debug, Clone)]
pub struct SimulatedBus {
    state: Arc<Mutex<BoardState>>,
    bus: u8,
}

impl ErrorType for SimulatedBus {
    type Error = ErrorKind;
}

impl I2c for SimulatedBus {
    fn transaction(
        &mut self,
        address: u8,
        operations: &mut [Operation<'_>],
    ) -> Result<(), Self::Error> {
        let mut state = self.state.lock();
        let device = state
            .devices
            .get_mut(&(self.bus, address))
            .ok_or(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address))?;

        let mut pointer = 0u8;
        for operation in operations.iter_mut() {
            match operation {
                Operation::Write(bytes) => {
                    if let Some((&reg, data)) = bytes.split_first() {
                        pointer = reg;
                        for (i, &value) in data.iter().enumerate() {
                            let target = if reg == FIFO_R_W {
                                reg
                            } else {
                                reg.wrapping_add(i as u8)
                            };
                            device.write_register(target, value);
                        }
                    }
                }
                Operation::Read(buffer) => {
                    if pointer == FIFO_R_W {
                        device.fifo_read_sizes.push(buffer.len());
                    }
                    for (i, slot) in buffer.iter_mut().enumerate() {
                        let target = if pointer == FIFO_R_W {
                            pointer
                        } else {
                            pointer.wrapping_add(i as u8)
                        };
                        *slot = device.read_register(target);
                    }
                }
            }
        }
        Ok(())
    }
}
