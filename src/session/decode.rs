//! Raw FIFO stream decoding.

use std::path::Path;

use crate::error::{AppResult, DaqError};
use crate::hardware::SensorSnapshot;

use super::Crop;

/// Physical-unit readings of one sensor, one row per frame.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedTable {
    /// Header names, accelerometer columns first
    pub columns: Vec<&'static str>,
    /// One value per column in each row
    pub rows: Vec<Vec<f64>>,
}

impl DecodedTable {
    /// Write the table as CSV with a header row; a table with no columns yields an
    /// empty file.
    pub fn write_csv(&self, path: &Path) -> AppResult<()> {
        let mut writer = csv::Writer::from_path(path)?;
        if !self.columns.is_empty() {
            writer.write_record(&self.columns)?;
            for row in &self.rows {
                writer.write_record(row.iter().map(f64::to_string))?;
            }
        }
        writer.flush()?;
        Ok(())
    }
}

/// Enabled columns in frame order, each flagged as accelerometer or gyroscope.
fn layout(snapshot: &SensorSnapshot) -> Vec<(&'static str, bool)> {
    let mut columns = Vec::with_capacity(6);
    if snapshot.accel_fifo_enabled {
        columns.extend([("accel_x", true), ("accel_y", true), ("accel_z", true)]);
    }
    for (enabled, name) in [
        (snapshot.x_gyro_fifo_enabled, "gyro_x"),
        (snapshot.y_gyro_fifo_enabled, "gyro_y"),
        (snapshot.z_gyro_fifo_enabled, "gyro_z"),
    ] {
        if enabled {
            columns.push((name, false));
        }
    }
    columns
}

/// Decode the cropped part of a raw stream captured with `snapshot`.
///
/// Frames are big-endian signed 16-bit words in the order accel x/y/z, gyro x/y/z,
/// with disabled axes absent. Accel words scale by the recorded accel factor and gyro
/// words by the recorded gyro factor.
pub fn decode_stream(snapshot: &SensorSnapshot, crop: Crop, raw: &[u8]) -> AppResult<DecodedTable> {
    let layout = layout(snapshot);
    let package_length = snapshot.package_length;
    if package_length != layout.len() * 2 {
        return Err(DaqError::Session(format!(
            "package length {package_length} does not match {} enabled axes",
            layout.len()
        )));
    }

    let columns = layout.iter().map(|(name, _)| *name).collect();
    if crop.is_empty() || package_length == 0 {
        return Ok(DecodedTable {
            columns,
            rows: Vec::new(),
        });
    }

    let begin = crop.start * package_length;
    let end = crop.end * package_length;
    let bytes = raw.get(begin..end).ok_or_else(|| {
        DaqError::Session(format!(
            "crop [{}, {}) needs {end} bytes but the stream has {}",
            crop.start,
            crop.end,
            raw.len()
        ))
    })?;

    let rows = bytes
        .chunks_exact(package_length)
        .map(|frame| {
            frame
                .chunks_exact(2)
                .zip(&layout)
                .map(|(word, &(_, is_accel))| {
                    let raw = f64::from(i16::from_be_bytes([word[0], word[1]]));
                    if is_accel {
                        raw * snapshot.accel_factor
                    } else {
                        raw * snapshot.gyro_factor
                    }
                })
                .collect()
        })
        .collect();

    Ok(DecodedTable { columns, rows })
}
