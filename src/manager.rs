//! Device manager for one collection node.
//!
//! `DeviceManager` owns the live sensor set of a node. Discovery probes every
//! configured (bus, address) pair and rebuilds the set wholesale; per-sensor
//! commands look sensors up by id; `start_capture_session` runs the capture loop over
//! every live sensor and writes the raw streams plus the node's session fragment.
//!
//! The manager performs no locking of its own. All calls are expected to be
//! serialized by [`crate::executor::CommandExecutor`].

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::capture::{run_capture, CaptureChannel, Clock, FifoSource, SystemClock};
use crate::error::{AppResult, DaqError};
use crate::hardware::{BusAddress, BusProvider, CalibrationParams, Mpu6050, SensorConfig};
use crate::session::{SessionFragment, SessionTime, METADATA_DIR, RAW_DATA_DIR};

/// Location of one live sensor, as published in the connected-sensors report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SensorInfo {
    /// Sensor id, `{device}_B{bus}A{address}`
    pub id: String,
    #[allow(missing_docs)]
    pub bus: u8,
    #[allow(missing_docs)]
    pub address: u8,
}

/// Owner of the live sensors attached to one node.
pub struct DeviceManager<P: BusProvider> {
    device_id: String,
    buses: Vec<u8>,
    addresses: Vec<u8>,
    provider: P,
    sensors: BTreeMap<String, Mpu6050<P::Bus>>,
}

impl<P: BusProvider> DeviceManager<P> {
    /// Create a manager and run a first discovery pass.
    pub fn new(device_id: impl Into<String>, buses: Vec<u8>, addresses: Vec<u8>, provider: P) -> Self {
        let mut manager = Self {
            device_id: device_id.into(),
            buses,
            addresses,
            provider,
            sensors: BTreeMap::new(),
        };
        manager.discover_sensors();
        manager
    }

    /// Node identifier prefixing every sensor id.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Configured bus indices.
    pub fn buses(&self) -> &[u8] {
        &self.buses
    }

    /// Configured candidate addresses.
    pub fn addresses(&self) -> &[u8] {
        &self.addresses
    }

    /// Probe every configured location and replace the live sensor set.
    ///
    /// Unreachable locations are skipped; sensors that vanished are dropped.
    pub fn discover_sensors(&mut self) {
        let mut sensors = BTreeMap::new();
        for location in BusAddress::candidates(&self.buses, &self.addresses) {
            let id = location.sensor_id(&self.device_id);
            match self.probe(&id, location) {
                Ok(Some(sensor)) => {
                    sensors.insert(id, sensor);
                }
                Ok(None) => debug!(%location, "no sensor identified"),
                Err(err) => debug!(%location, error = %err, "location skipped"),
            }
        }
        debug!(device_id = %self.device_id, count = sensors.len(), "discovery finished");
        self.sensors = sensors;
    }

    fn probe(&self, id: &str, location: BusAddress) -> AppResult<Option<Mpu6050<P::Bus>>> {
        let handle = self.provider.open(location.bus)?;
        let mut sensor = Mpu6050::new(id, location.bus, handle, location.address)?;
        Ok(sensor.is_connected().then_some(sensor))
    }

    /// Ids of live sensors, sorted.
    pub fn sensor_ids(&self) -> Vec<String> {
        self.sensors.keys().cloned().collect()
    }

    /// Locations of live sensors, in id order.
    pub fn sensors(&self) -> Vec<SensorInfo> {
        self.sensors
            .values()
            .map(|sensor| SensorInfo {
                id: sensor.id().to_string(),
                bus: sensor.bus(),
                address: sensor.address(),
            })
            .collect()
    }

    /// True if `sensor_id` is live.
    pub fn contains(&self, sensor_id: &str) -> bool {
        self.sensors.contains_key(sensor_id)
    }

    /// Cached configuration of a live sensor.
    pub fn sensor_config(&self, sensor_id: &str) -> AppResult<SensorConfig> {
        self.sensors
            .get(sensor_id)
            .map(Mpu6050::config)
            .ok_or_else(|| not_found(sensor_id))
    }

    fn sensor_mut(&mut self, sensor_id: &str) -> AppResult<&mut Mpu6050<P::Bus>> {
        self.sensors
            .get_mut(sensor_id)
            .ok_or_else(|| not_found(sensor_id))
    }

    /// Apply `config` to one sensor.
    #[instrument(skip(self, config))]
    pub fn configure_sensor(&mut self, sensor_id: &str, config: &SensorConfig) -> AppResult<()> {
        self.sensor_mut(sensor_id)?.apply(config)
    }

    /// Apply `config` to every live sensor, stopping at the first failure.
    pub fn configure_all(&mut self, config: &SensorConfig) -> AppResult<()> {
        for sensor in self.sensors.values_mut() {
            sensor.apply(config)?;
        }
        Ok(())
    }

    /// Reset one sensor to its power-on configuration.
    pub fn reset_sensor(&mut self, sensor_id: &str) -> AppResult<()> {
        self.sensor_mut(sensor_id)?.reset()
    }

    /// Reset every live sensor.
    pub fn reset_all(&mut self) -> AppResult<()> {
        for sensor in self.sensors.values_mut() {
            sensor.reset()?;
        }
        Ok(())
    }

    /// Calibrate the offsets of one sensor.
    pub fn calibrate_sensor(&mut self, sensor_id: &str, params: &CalibrationParams) -> AppResult<()> {
        self.sensor_mut(sensor_id)?.calibrate(params)
    }

    /// Calibrate every live sensor in id order.
    pub fn calibrate_all(&mut self, params: &CalibrationParams) -> AppResult<()> {
        for sensor in self.sensors.values_mut() {
            sensor.calibrate(params)?;
        }
        Ok(())
    }

    /// Die temperature of one sensor in °C.
    pub fn temperature(&mut self, sensor_id: &str) -> AppResult<f64> {
        self.sensor_mut(sensor_id)?.temperature()
    }

    /// Ids of live sensors that no longer answer.
    pub fn unreachable_sensors(&mut self) -> Vec<String> {
        self.sensors
            .iter_mut()
            .filter_map(|(id, sensor)| (!sensor.is_connected()).then(|| id.clone()))
            .collect()
    }

    /// Capture from every live sensor for `duration` seconds into `session_dir`.
    ///
    /// Writes `raw_data/<sensor id>` per sensor and
    /// `metadata/<device id>_session_info.yml`, and returns the fragment written.
    pub fn start_capture_session(
        &mut self,
        session_dir: &Path,
        name: &str,
        duration: f64,
    ) -> AppResult<SessionFragment> {
        self.start_capture_session_with_clock(&SystemClock, session_dir, name, duration)
    }

    /// [`start_capture_session`](Self::start_capture_session) with an explicit clock.
    #[instrument(skip(self, clock, session_dir), fields(device_id = %self.device_id))]
    pub fn start_capture_session_with_clock<C: Clock>(
        &mut self,
        clock: &C,
        session_dir: &Path,
        name: &str,
        duration: f64,
    ) -> AppResult<SessionFragment> {
        if !duration.is_finite() || duration < 0.0 {
            return Err(DaqError::Value(format!("invalid session duration {duration}")));
        }
        let metadata_dir = session_dir.join(METADATA_DIR);
        let raw_dir = session_dir.join(RAW_DATA_DIR);
        fs::create_dir_all(&metadata_dir)?;
        fs::create_dir_all(&raw_dir)?;

        let mut fragment = SessionFragment {
            name: name.to_string(),
            device_id: self.device_id.clone(),
            time: SessionTime {
                start: 0.0,
                duration,
            },
            sensors: BTreeMap::new(),
            overflows: BTreeMap::new(),
            files: BTreeMap::new(),
            n_packages: BTreeMap::new(),
        };
        for (id, sensor) in &self.sensors {
            fragment.sensors.insert(id.clone(), sensor.snapshot());
            fragment.files.insert(id.clone(), id.clone());
        }
        if self.sensors.is_empty() {
            warn!("capturing with no live sensors");
        }

        let ids = self.sensor_ids();
        let mut channels = Vec::with_capacity(ids.len());
        for (id, sensor) in self.sensors.iter_mut() {
            let file = File::create(raw_dir.join(id))?;
            channels.push(CaptureChannel::new(
                sensor as &mut dyn FifoSource,
                BufWriter::new(file),
            ));
        }

        info!(session = name, duration, sensors = ids.len(), "capture session started");
        fragment.time.start = run_capture(clock, &mut channels, duration)?;

        for (id, channel) in ids.into_iter().zip(channels) {
            let (overflows, n_packages) = channel.finish()?;
            if !overflows.is_empty() {
                warn!(sensor_id = %id, count = overflows.len(), "fifo overflowed during capture");
            }
            fragment.overflows.insert(id.clone(), overflows);
            fragment.n_packages.insert(id, n_packages);
        }

        let path = metadata_dir.join(SessionFragment::file_name(&self.device_id));
        fragment.save(&path)?;
        info!(session = name, path = %path.display(), "capture session finished");
        Ok(fragment)
    }
}

fn not_found(sensor_id: &str) -> DaqError {
    DaqError::NotFound(format!("sensor \"{sensor_id}\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{FillMode, SimulatedBoard};
    use crate::hardware::registers::FIFO_CAPACITY;
    use crate::hardware::{AccelRange, DlpfMode};
    use tempfile::TempDir;

    fn manager(board: &SimulatedBoard) -> DeviceManager<SimulatedBoard> {
        DeviceManager::new("node", vec![0, 1], vec![0x68, 0x69], board.clone())
    }

    #[test]
    fn discovery_replaces_the_sensor_set() {
        let board = SimulatedBoard::with_sensors(&[(0, 0x68), (1, 0x69)]);
        let mut manager = manager(&board);
        assert_eq!(manager.sensor_ids(), vec!["node_B0A104", "node_B1A105"]);

        board.detach(0, 0x68);
        board.attach(1, 0x68);
        manager.discover_sensors();
        assert_eq!(manager.sensor_ids(), vec!["node_B1A104", "node_B1A105"]);
        assert_eq!(
            manager.sensors()[0],
            SensorInfo {
                id: "node_B1A104".into(),
                bus: 1,
                address: 0x68
            }
        );
    }

    #[test]
    fn unknown_ids_are_not_found() {
        let board = SimulatedBoard::with_sensors(&[(0, 0x68)]);
        let mut manager = manager(&board);
        let err = manager.reset_sensor("node_B3A104").unwrap_err();
        assert!(matches!(err, DaqError::NotFound(_)));
        assert!(manager.temperature("nope").is_err());
    }

    #[test]
    fn configure_and_reset_by_id() {
        let board = SimulatedBoard::with_sensors(&[(0, 0x68), (0, 0x69)]);
        let mut manager = manager(&board);
        let config = SensorConfig {
            dlpf_mode: DlpfMode::Bw98,
            full_scale_accel_range: AccelRange::G4,
            accel_fifo_enabled: true,
            ..SensorConfig::default()
        };
        manager.configure_sensor("node_B0A104", &config).unwrap();
        assert_eq!(manager.sensor_config("node_B0A104").unwrap(), config);
        assert_ne!(manager.sensor_config("node_B0A105").unwrap(), config);

        manager.configure_all(&config).unwrap();
        assert_eq!(manager.sensor_config("node_B0A105").unwrap(), config);

        manager.reset_all().unwrap();
        assert_eq!(
            manager.sensor_config("node_B0A104").unwrap(),
            SensorConfig::default()
        );
    }

    #[test]
    fn unreachable_sensors_lists_detached_devices() {
        let board = SimulatedBoard::with_sensors(&[(0, 0x68), (1, 0x68)]);
        let mut manager = manager(&board);
        board.detach(1, 0x68);
        assert_eq!(manager.unreachable_sensors(), vec!["node_B1A104"]);
    }

    #[test]
    fn capture_writes_raw_streams_and_fragment() {
        let board = SimulatedBoard::with_sensors(&[(0, 0x68), (0, 0x69)]);
        let mut manager = manager(&board);
        let config = SensorConfig {
            dlpf_mode: DlpfMode::Bw188,
            accel_fifo_enabled: true,
            z_gyro_fifo_enabled: true,
            ..SensorConfig::default()
        };
        manager.configure_sensor("node_B0A104", &config).unwrap();

        let dir = TempDir::new().unwrap();
        let fragment = manager
            .start_capture_session(dir.path(), "walk", 0.2)
            .unwrap();

        assert_eq!(fragment.sensors.len(), 2);
        assert_eq!(fragment.files["node_B0A104"], "node_B0A104");
        assert_eq!(fragment.n_packages["node_B0A105"], 0);
        assert!(fragment.n_packages["node_B0A104"] > 0);
        assert!(fragment.time.start > 0.0);

        let raw = fs::read(dir.path().join(RAW_DATA_DIR).join("node_B0A104")).unwrap();
        assert_eq!(raw.len(), fragment.n_packages["node_B0A104"] * 8);
        let idle = fs::read(dir.path().join(RAW_DATA_DIR).join("node_B0A105")).unwrap();
        assert!(idle.is_empty());
        assert!(board
            .fifo_read_sizes(0, 0x68)
            .iter()
            .all(|&n| n == 32));

        let saved = SessionFragment::load(
            &dir.path()
                .join(METADATA_DIR)
                .join("node_session_info.yml"),
        )
        .unwrap();
        assert_eq!(saved, fragment);
    }

    #[test]
    fn full_fifo_is_recorded_once_and_drained_in_whole_packages() {
        let board = SimulatedBoard::with_sensors(&[(0, 0x68)]);
        board.set_fill_mode(0, 0x68, FillMode::Manual);
        let mut manager = manager(&board);
        manager
            .configure_all(&SensorConfig {
                accel_fifo_enabled: true,
                x_gyro_fifo_enabled: true,
                y_gyro_fifo_enabled: true,
                z_gyro_fifo_enabled: true,
                ..SensorConfig::default()
            })
            .unwrap();
        let package_length = 12;

        let filler = {
            let board = board.clone();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(50));
                board.fill_fifo(0, 0x68);
            })
        };
        let dir = TempDir::new().unwrap();
        let fragment = manager
            .start_capture_session(dir.path(), "burst", 0.2)
            .unwrap();
        filler.join().unwrap();

        let id = "node_B0A104";
        assert_eq!(fragment.overflows[id].len(), 1);
        let at = fragment.overflows[id][0];
        assert!(at > 0.0 && at < 0.2, "overflow at {at}");

        // 1024 bytes drain 24 at a time until no more than one drain remains.
        let n_packages = fragment.n_packages[id];
        assert_eq!(n_packages, (FIFO_CAPACITY - 16) / package_length);
        let raw = fs::read(dir.path().join(RAW_DATA_DIR).join(id)).unwrap();
        assert_eq!(raw.len(), n_packages * package_length);
        assert_eq!(raw.len() % package_length, 0);

        let saved = SessionFragment::load(
            &dir.path()
                .join(METADATA_DIR)
                .join("node_session_info.yml"),
        )
        .unwrap();
        assert_eq!(saved.overflows[id], fragment.overflows[id]);
        assert_eq!(saved.n_packages[id], n_packages);
    }

    #[test]
    fn capture_aborts_when_a_sensor_disappears() {
        let board = SimulatedBoard::with_sensors(&[(0, 0x68)]);
        board.set_fill_mode(0, 0x68, FillMode::Manual);
        let mut manager = manager(&board);
        manager
            .configure_all(&SensorConfig {
                accel_fifo_enabled: true,
                ..SensorConfig::default()
            })
            .unwrap();
        board.detach(0, 0x68);

        let dir = TempDir::new().unwrap();
        let err = manager
            .start_capture_session(dir.path(), "lost", 0.1)
            .unwrap_err();
        assert!(err.is_unreachable());
    }
}
