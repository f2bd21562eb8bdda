//! Fixed-duration FIFO capture loop.
//!
//! The loop busy-polls every participating FIFO until the session duration has
//! elapsed. Each poll reads the FIFO depth; a depth at hardware capacity records an
//! overflow timestamp (capture continues), and a depth above one transaction's worth
//! of whole packages drains exactly that many packages into the channel's sink.
//!
//! Every channel's FIFO is reset at the start, but channels whose package length is
//! zero are never polled. The first error from any
//! source or sink aborts the whole capture.

use std::io::Write;

use chrono::Utc;
use embedded_hal::i2c::I2c;
use tracing::{debug, trace};

use crate::error::AppResult;
use crate::hardware::registers::{FIFO_CAPACITY, MAX_TRANSACTION_BYTES};
use crate::hardware::Mpu6050;

/// Wall-clock time source, in seconds since the Unix epoch.
pub trait Clock {
    #[allow(missing_docs)]
    fn now(&self) -> f64;
}

/// [`Clock`] backed by the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> f64 {
        Utc::now().timestamp_micros() as f64 / 1_000_000.0
    }
}

/// The FIFO side of a sensor, as seen by the capture loop.
pub trait FifoSource {
    /// Bytes per frame with the current configuration.
    fn package_length(&self) -> usize;
    /// Bytes queued.
    fn fifo_count(&mut self) -> AppResult<usize>;
    /// Pop `length` bytes in one transaction.
    fn fifo_bytes(&mut self, length: usize) -> AppResult<Vec<u8>>;
    /// Discard everything queued.
    fn reset_fifo(&mut self) -> AppResult<()>;
}

impl<I: I2c> FifoSource for Mpu6050<I> {
    fn package_length(&self) -> usize {
        Mpu6050::package_length(self)
    }

    fn fifo_count(&mut self) -> AppResult<usize> {
        Mpu6050::fifo_count(self)
    }

    fn fifo_bytes(&mut self, length: usize) -> AppResult<Vec<u8>> {
        Mpu6050::fifo_bytes(self, length)
    }

    fn reset_fifo(&mut self) -> AppResult<()> {
        Mpu6050::reset_fifo(self)
    }
}

/// One sensor's participation in a capture: its FIFO, its raw output and its tallies.
pub struct CaptureChannel<'a, W> {
    source: &'a mut dyn FifoSource,
    sink: W,
    package_length: usize,
    packages_per_read: usize,
    overflows: Vec<f64>,
    n_packages: usize,
}

impl<'a, W: Write> CaptureChannel<'a, W> {
    /// Raw frames drained from `source` are appended to `sink`.
    pub fn new(source: &'a mut dyn FifoSource, sink: W) -> Self {
        let package_length = source.package_length();
        let packages_per_read = if package_length == 0 {
            0
        } else {
            MAX_TRANSACTION_BYTES / package_length
        };
        Self {
            source,
            sink,
            package_length,
            packages_per_read,
            overflows: Vec::new(),
            n_packages: 0,
        }
    }

    fn is_active(&self) -> bool {
        self.packages_per_read > 0
    }

    /// Bytes moved per drain: whole packages that fit in one transaction.
    fn drain_size(&self) -> usize {
        self.package_length * self.packages_per_read
    }

    fn poll(&mut self, elapsed: f64) -> AppResult<()> {
        let depth = self.source.fifo_count()?;
        if depth == FIFO_CAPACITY {
            trace!(elapsed, "fifo overflow");
            self.overflows.push(elapsed);
        }
        if depth > self.drain_size() {
            let bytes = self.source.fifo_bytes(self.drain_size())?;
            self.sink.write_all(&bytes)?;
            self.n_packages += self.packages_per_read;
        }
        Ok(())
    }

    /// Flush and release the sink, returning `(overflows, n_packages)`.
    pub fn finish(mut self) -> AppResult<(Vec<f64>, usize)> {
        self.sink.flush()?;
        Ok((self.overflows, self.n_packages))
    }
}

/// Run the capture loop for `duration` seconds; returns the start timestamp.
///
/// Every channel's FIFO is reset immediately before the start time is taken.
pub fn run_capture<C: Clock, W: Write>(
    clock: &C,
    channels: &mut [CaptureChannel<'_, W>],
    duration: f64,
) -> AppResult<f64> {
    for channel in channels.iter_mut() {
        channel.source.reset_fifo()?;
    }
    let start = clock.now();
    debug!(start, duration, channels = channels.len(), "capture started");

    loop {
        let elapsed = clock.now() - start;
        if elapsed >= duration {
            break;
        }
        for channel in channels.iter_mut().filter(|c| c.is_active()) {
            let elapsed = clock.now() - start;
            channel.poll(elapsed)?;
        }
    }

    debug!(
        packages = ?channels.iter().map(|c| c.n_packages).collect::<Vec<_>>(),
        "capture finished"
    );
    Ok(start)
}
