//! Session descriptors and offline session processing.
//!
//! A session directory holds `metadata/` and `raw_data/`. Before merging,
//! `metadata/` contains one `<device id>_session_info.yml` fragment per contributing
//! node; [`SessionStore::merge`] folds them into a single `session_info.yml` with
//! per-sensor crop windows and deletes the fragments. [`SessionStore::decode`] then
//! writes one `<file>.csv` per sensor into the session directory.

mod decode;
mod merge;

pub use decode::{decode_stream, DecodedTable};
pub use merge::merge_fragments;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{AppResult, DaqError};
use crate::hardware::SensorSnapshot;

/// Metadata subdirectory of a session.
pub const METADATA_DIR: &str = "metadata";
/// Raw FIFO stream subdirectory of a session.
pub const RAW_DATA_DIR: &str = "raw_data";
/// Combined descriptor written by merge.
pub const MERGED_FILE_NAME: &str = "session_info.yml";
const FRAGMENT_SUFFIX: &str = "_session_info.yml";

/// Start time (Unix seconds) and duration (seconds) of one node's capture.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[allow(missing_docs)]
pub struct SessionTime {
    pub start: f64,
    pub duration: f64,
}

/// One node's contribution to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionFragment {
    /// Session name
    pub name: String,
    /// Node that captured the fragment
    pub device_id: String,
    /// Capture start and requested duration
    pub time: SessionTime,
    /// Configuration of each sensor at capture time
    pub sensors: BTreeMap<String, SensorSnapshot>,
    /// Elapsed seconds of every poll that found the FIFO full, per sensor
    pub overflows: BTreeMap<String, Vec<f64>>,
    /// Raw file name under `raw_data/`, per sensor.
    pub files: BTreeMap<String, String>,
    /// Whole packages written to each raw file
    pub n_packages: BTreeMap<String, usize>,
}

impl SessionFragment {
    /// File name of the fragment written by node `device_id`.
    pub fn file_name(device_id: &str) -> String {
        format!("{device_id}{FRAGMENT_SUFFIX}")
    }

    /// Read a fragment from YAML.
    pub fn load(path: &Path) -> AppResult<Self> {
        Ok(serde_yaml::from_reader(BufReader::new(File::open(path)?))?)
    }

    /// Write the fragment as YAML.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        Ok(serde_yaml::to_writer(BufWriter::new(File::create(path)?), self)?)
    }
}

/// Retained `[start, end)` package range of one sensor stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "[usize; 2]", into = "[usize; 2]")]
pub struct Crop {
    /// First retained package
    pub start: usize,
    /// One past the last retained package
    pub end: usize,
}

impl Crop {
    #[allow(missing_docs)]
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Retained packages; zero when `end <= start`.
    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    #[allow(missing_docs)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl From<[usize; 2]> for Crop {
    fn from([start, end]: [usize; 2]) -> Self {
        Self { start, end }
    }
}

impl From<Crop> for [usize; 2] {
    fn from(crop: Crop) -> Self {
        [crop.start, crop.end]
    }
}

/// Per-device start times and the common duration of a merged session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedTime {
    /// Capture start of each device, Unix seconds
    pub start: BTreeMap<String, f64>,
    /// Shortest requested duration
    pub duration: f64,
}

/// All fragments of a session, aligned to a common reference start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergedSession {
    /// Session name
    pub name: String,
    /// Sensor ids owned by each device.
    pub devices: BTreeMap<String, Vec<String>>,
    /// Device start times
    pub time: MergedTime,
    /// Capture-time configuration, per sensor
    pub sensors: BTreeMap<String, SensorSnapshot>,
    #[allow(missing_docs)]
    pub overflows: BTreeMap<String, Vec<f64>>,
    #[allow(missing_docs)]
    pub files: BTreeMap<String, String>,
    #[allow(missing_docs)]
    pub n_packages: BTreeMap<String, usize>,
    /// Aligned package window of each raw stream
    pub crops: BTreeMap<String, Crop>,
}

impl MergedSession {
    /// Latest device start: the instant every aligned stream begins at.
    pub fn reference_start(&self) -> Option<f64> {
        self.time.start.values().copied().reduce(f64::max)
    }

    /// Common crop length of every sensor that streamed data.
    pub fn aligned_length(&self) -> usize {
        self.sensors
            .iter()
            .filter(|(_, snapshot)| snapshot.package_length > 0)
            .filter_map(|(id, _)| self.crops.get(id).map(Crop::len))
            .next()
            .unwrap_or(0)
    }

    /// Read a merged descriptor from YAML.
    pub fn load(path: &Path) -> AppResult<Self> {
        Ok(serde_yaml::from_reader(BufReader::new(File::open(path)?))?)
    }

    /// Write the merged descriptor as YAML.
    pub fn save(&self, path: &Path) -> AppResult<()> {
        Ok(serde_yaml::to_writer(BufWriter::new(File::create(path)?), self)?)
    }
}

/// Listing entry for one session directory.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionSummary {
    /// Directory name
    pub name: String,
    /// Contributing nodes, sorted
    pub device_ids: Vec<String>,
    /// Sensors of every node, sorted by device
    pub sensor_ids: Vec<String>,
    /// Earliest device start, Unix seconds.
    pub timestamp: Option<f64>,
    /// UTC date, `YYYY-MM-DD`.
    pub date: Option<String>,
    /// UTC time of day, `HH:MM:SS`.
    pub time: Option<String>,
    /// Requested capture duration, seconds
    pub duration: Option<f64>,
    /// Overflow timestamps per sensor
    pub overflows: BTreeMap<String, Vec<f64>>,
    /// A merged descriptor exists
    pub merged: bool,
    /// Every CSV of the merged session exists
    pub decoded: bool,
}

/// A session directory on disk.
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    /// Open an existing session directory.
    ///
    /// # Errors
    /// Fails with [`DaqError::NotFound`] if the directory has no `metadata/`.
    pub fn open(dir: impl Into<PathBuf>) -> AppResult<Self> {
        let dir = dir.into();
        if !dir.join(METADATA_DIR).is_dir() {
            return Err(DaqError::NotFound(format!(
                "no metadata directory in {}",
                dir.display()
            )));
        }
        Ok(Self { dir })
    }

    /// Session directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Session name: the directory's base name.
    pub fn name(&self) -> String {
        self.dir
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn metadata_dir(&self) -> PathBuf {
        self.dir.join(METADATA_DIR)
    }

    fn merged_path(&self) -> PathBuf {
        self.metadata_dir().join(MERGED_FILE_NAME)
    }

    fn fragment_paths(&self) -> AppResult<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in fs::read_dir(self.metadata_dir())? {
            let path = entry?.path();
            let is_fragment = path
                .file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.ends_with(FRAGMENT_SUFFIX));
            if is_fragment && path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();
        Ok(paths)
    }

    /// Unmerged fragments, ordered by file name.
    pub fn fragments(&self) -> AppResult<Vec<SessionFragment>> {
        self.fragment_paths()?
            .iter()
            .map(|path| SessionFragment::load(path))
            .collect()
    }

    /// The combined descriptor, if the session has been merged.
    pub fn merged(&self) -> AppResult<Option<MergedSession>> {
        let path = self.merged_path();
        if path.is_file() {
            MergedSession::load(&path).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Fold all fragments into `session_info.yml` and delete them.
    ///
    /// Merging an already merged session with no new fragments returns the existing
    /// descriptor unchanged.
    ///
    /// # Errors
    /// [`DaqError::Session`] if there is nothing to merge, or if new fragments
    /// appeared next to an existing merged descriptor.
    pub fn merge(&self) -> AppResult<MergedSession> {
        let paths = self.fragment_paths()?;
        let existing = self.merged()?;
        match (paths.is_empty(), existing) {
            (true, Some(merged)) => {
                debug!(session = %self.name(), "session already merged");
                return Ok(merged);
            }
            (true, None) => {
                return Err(DaqError::Session(format!(
                    "session \"{}\" has no fragments to merge",
                    self.name()
                )))
            }
            (false, Some(_)) => {
                return Err(DaqError::Session(format!(
                    "session \"{}\" is already merged but has {} new fragment(s)",
                    self.name(),
                    paths.len()
                )))
            }
            (false, None) => {}
        }

        let fragments = paths
            .iter()
            .map(|path| SessionFragment::load(path))
            .collect::<AppResult<Vec<_>>>()?;
        let merged = merge_fragments(fragments)?;
        merged.save(&self.merged_path())?;
        for path in &paths {
            fs::remove_file(path)?;
        }
        info!(
            session = %merged.name,
            devices = merged.devices.len(),
            aligned_length = merged.aligned_length(),
            "session merged"
        );
        Ok(merged)
    }

    /// Decode every sensor stream into `<file>.csv`; returns the files written.
    pub fn decode(&self) -> AppResult<Vec<PathBuf>> {
        let merged = self.merged()?.ok_or_else(|| {
            DaqError::Session(format!("session \"{}\" must be merged before decoding", self.name()))
        })?;

        let mut written = Vec::with_capacity(merged.sensors.len());
        for (sensor_id, snapshot) in &merged.sensors {
            let file = merged.files.get(sensor_id).ok_or_else(|| {
                DaqError::Session(format!("no raw file recorded for sensor \"{sensor_id}\""))
            })?;
            let crop = merged.crops.get(sensor_id).copied().ok_or_else(|| {
                DaqError::Session(format!("no crop window for sensor \"{sensor_id}\""))
            })?;
            let raw = fs::read(self.dir.join(RAW_DATA_DIR).join(file))?;
            let table = decode_stream(snapshot, crop, &raw)?;
            let target = self.dir.join(format!("{file}.csv"));
            table.write_csv(&target)?;
            debug!(sensor_id = %sensor_id, rows = table.rows.len(), "sensor decoded");
            written.push(target);
        }
        info!(session = %merged.name, files = written.len(), "session decoded");
        Ok(written)
    }

    /// True once every sensor of the merged session has its CSV.
    pub fn is_decoded(&self) -> AppResult<bool> {
        Ok(match self.merged()? {
            Some(merged) => merged
                .files
                .values()
                .all(|file| self.dir.join(format!("{file}.csv")).is_file()),
            None => false,
        })
    }

    /// Listing entry; falls back to the fragments when the session is not merged.
    pub fn summary(&self) -> AppResult<SessionSummary> {
        let mut summary = SessionSummary {
            name: self.name(),
            device_ids: Vec::new(),
            sensor_ids: Vec::new(),
            timestamp: None,
            date: None,
            time: None,
            duration: None,
            overflows: BTreeMap::new(),
            merged: false,
            decoded: false,
        };

        if let Some(merged) = self.merged()? {
            summary.merged = true;
            summary.decoded = self.is_decoded()?;
            summary.timestamp = merged.time.start.values().copied().reduce(f64::min);
            summary.duration = Some(merged.time.duration);
            summary.overflows = merged.overflows;
            for (device_id, sensor_ids) in merged.devices {
                summary.device_ids.push(device_id);
                summary.sensor_ids.extend(sensor_ids);
            }
        } else {
            for fragment in self.fragments()? {
                if summary.duration.is_none() {
                    summary.duration = Some(fragment.time.duration);
                }
                summary.timestamp = Some(match summary.timestamp {
                    Some(ts) => ts.min(fragment.time.start),
                    None => fragment.time.start,
                });
                summary.device_ids.push(fragment.device_id);
                summary.sensor_ids.extend(fragment.sensors.into_keys());
                summary.overflows.extend(fragment.overflows);
            }
        }

        if let Some(datetime) = summary.timestamp.and_then(utc_datetime) {
            summary.date = Some(datetime.format("%Y-%m-%d").to_string());
            summary.time = Some(datetime.format("%H:%M:%S").to_string());
        }
        Ok(summary)
    }
}

fn utc_datetime(timestamp: f64) -> Option<DateTime<Utc>> {
    let seconds = timestamp.floor();
    let nanos = ((timestamp - seconds) * 1e9) as u32;
    DateTime::from_timestamp(seconds as i64, nanos.min(999_999_999))
}

/// Summaries of every session directory under `root`, sorted by name.
///
/// Subdirectories without `metadata/` are skipped.
pub fn list_sessions(root: &Path) -> AppResult<Vec<SessionSummary>> {
    let mut summaries = Vec::new();
    for entry in fs::read_dir(root)? {
        let path = entry?.path();
        if !path.is_dir() {
            continue;
        }
        match SessionStore::open(&path) {
            Ok(store) => summaries.push(store.summary()?),
            Err(DaqError::NotFound(_)) => debug!(path = %path.display(), "not a session"),
            Err(err) => return Err(err),
        }
    }
    summaries.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(summaries)
}
