//! Command flows through `NodeService` against a simulated board.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use imu_daq::command::{Command, ConfigureArgs, SensorSelection};
use imu_daq::config::{I2cConfig, NodeConfig, StorageConfig, TransferConfig};
use imu_daq::hardware::mock::SimulatedBoard;
use imu_daq::hardware::{DlpfMode, SensorConfig};
use imu_daq::node::NodeService;
use imu_daq::settings_store::SensorSettingsStore;
use imu_daq::status::{ChannelSink, DataMessage, StatusBody, StatusKind, StatusMessage};
use imu_daq::transfer::LocalDirUploader;
use serde_json::json;
use tempfile::TempDir;
use tokio::sync::mpsc::UnboundedReceiver;

fn config(dir: &Path) -> NodeConfig {
    NodeConfig {
        device_id: "rpi".into(),
        log_level: "debug".into(),
        i2c: I2cConfig {
            buses: vec![1],
            addresses: vec![0x68, 0x69],
        },
        storage: StorageConfig {
            capture_dir: dir.join("capture"),
            sessions_dir: dir.join("sessions"),
            settings_path: dir.join("config/sensor_settings.toml"),
        },
        transfer: TransferConfig {
            sessions_root: dir.join("sessions"),
            base_url: "http://hub:8000/sessions".into(),
        },
    }
}

fn start_node(
    board: &SimulatedBoard,
    dir: &Path,
) -> (NodeService<SimulatedBoard>, UnboundedReceiver<StatusMessage>) {
    let config = config(dir);
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let uploader = LocalDirUploader::new(&config.transfer.sessions_root, &config.transfer.base_url);
    let service = NodeService::new(
        config,
        board.clone(),
        Arc::new(ChannelSink::new(tx)),
        Box::new(uploader),
    )
    .unwrap();
    service.start();
    (service, rx)
}

fn drain(rx: &mut UnboundedReceiver<StatusMessage>) -> Vec<StatusMessage> {
    let mut out = Vec::new();
    while let Ok(message) = rx.try_recv() {
        out.push(message);
    }
    out
}

fn wait_idle(service: &NodeService<SimulatedBoard>) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while service.is_busy() {
        assert!(Instant::now() < deadline, "node stayed busy");
        std::thread::sleep(Duration::from_millis(5));
    }
}

fn has_text(messages: &[StatusMessage], kind: StatusKind, text: &str) -> bool {
    messages
        .iter()
        .any(|m| m.kind == kind && m.msg == StatusBody::Text(text.to_string()))
}

fn accel_only() -> SensorConfig {
    SensorConfig {
        dlpf_mode: DlpfMode::Bw5,
        rate: 9,
        accel_fifo_enabled: true,
        ..SensorConfig::default()
    }
}

fn configure_all(service: &NodeService<SimulatedBoard>) {
    service
        .dispatch(
            Command::ConfigureSensors(ConfigureArgs {
                sensor_ids: None,
                config: accel_only(),
            }),
            true,
        )
        .unwrap();
}

#[test]
fn session_runs_in_background_and_rejects_concurrent_commands() {
    let dir = TempDir::new().unwrap();
    let board = SimulatedBoard::with_sensors(&[(1, 0x68)]);
    let (service, mut rx) = start_node(&board, dir.path());
    configure_all(&service);
    drain(&mut rx);

    let start = json!({"command": "start_session", "args": {"session_name": "walk", "duration": 0.3}});
    service.handle_message(&start.to_string());
    assert!(service.is_busy());
    service.handle_message(r#"{"command": "get_connected_sensors", "args": {}}"#);

    wait_idle(&service);
    let messages = drain(&mut rx);
    assert!(has_text(&messages, StatusKind::Error, "Manager is busy"));
    assert!(has_text(&messages, StatusKind::Success, "Session \"walk\" finished"));

    let notice = messages
        .iter()
        .find_map(|m| match &m.msg {
            StatusBody::Data(DataMessage::SessionPart(notice)) => Some(notice.clone()),
            _ => None,
        })
        .expect("session part notice");
    assert_eq!(notice.session_name, "walk");
    assert_eq!(notice.file_name, "walk_rpi");
    assert_eq!(notice.url, "http://hub:8000/sessions/walk/walk_rpi");

    let delivered = dir.path().join("sessions/walk");
    assert!(delivered.join("metadata/rpi_session_info.yml").is_file());
    assert!(delivered.join("raw_data/rpi_B1A104").is_file());

    // Only the delivered copy remains; the capture directory is cleaned up.
    let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("capture"))
        .unwrap()
        .collect();
    assert!(leftovers.is_empty());

    service.shutdown();
}

#[test]
fn sensor_lost_during_capture_is_reported_by_id() {
    let dir = TempDir::new().unwrap();
    let board = SimulatedBoard::with_sensors(&[(1, 0x68)]);
    let (service, mut rx) = start_node(&board, dir.path());
    configure_all(&service);
    drain(&mut rx);

    let start = json!({"command": "start_session", "args": {"session_name": "fall", "duration": 2.0}});
    service.handle_message(&start.to_string());
    std::thread::sleep(Duration::from_millis(200));
    board.detach(1, 0x68);

    wait_idle(&service);
    let messages = drain(&mut rx);
    assert!(has_text(
        &messages,
        StatusKind::Error,
        "Connection with sensors \"rpi_B1A104\" lost"
    ));
    assert!(!has_text(&messages, StatusKind::Success, "Session \"fall\" finished"));
    assert!(!dir.path().join("sessions/fall").exists());
}

#[test]
fn settings_are_persisted_restored_and_forgotten() {
    let dir = TempDir::new().unwrap();
    let settings_path = dir.path().join("config/sensor_settings.toml");

    {
        let board = SimulatedBoard::with_sensors(&[(1, 0x68)]);
        let (service, mut rx) = start_node(&board, dir.path());
        configure_all(&service);
        assert!(has_text(&drain(&mut rx), StatusKind::Success, "Sensors configured"));
        service.shutdown();
    }
    let stored = SensorSettingsStore::open(&settings_path).unwrap();
    assert_eq!(stored.get("rpi_B1A104").unwrap().config, accel_only());

    // A freshly powered board comes back with its stored configuration.
    let board = SimulatedBoard::with_sensors(&[(1, 0x68)]);
    let (service, mut rx) = start_node(&board, dir.path());
    assert!(has_text(
        &drain(&mut rx),
        StatusKind::Success,
        "Sensor configurations loaded"
    ));
    let restored = service.with_state(|state| state.manager.sensor_config("rpi_B1A104").unwrap());
    assert_eq!(restored, accel_only());

    service
        .dispatch(Command::ResetSensors(SensorSelection::all()), true)
        .unwrap();
    assert!(has_text(&drain(&mut rx), StatusKind::Success, "Sensors reset"));
    let stored = SensorSettingsStore::open(&settings_path).unwrap();
    assert!(stored.get("rpi_B1A104").is_none());
    let reset = service.with_state(|state| state.manager.sensor_config("rpi_B1A104").unwrap());
    assert_eq!(reset, SensorConfig::default());
}

#[test]
fn newly_attached_sensor_gets_its_settings_before_the_command() {
    let dir = TempDir::new().unwrap();
    let mut store = SensorSettingsStore::open(dir.path().join("config/sensor_settings.toml")).unwrap();
    store.set("rpi_B1A105", accel_only()).unwrap();

    let board = SimulatedBoard::with_sensors(&[(1, 0x68)]);
    let (service, mut rx) = start_node(&board, dir.path());
    drain(&mut rx);

    board.attach(1, 0x69);
    service.dispatch(Command::GetConnectedSensors, true).unwrap();
    let messages = drain(&mut rx);

    assert!(has_text(
        &messages,
        StatusKind::Success,
        "Sensor configurations loaded"
    ));
    let reports: Vec<usize> = messages
        .iter()
        .filter_map(|m| match &m.msg {
            StatusBody::Data(DataMessage::ConnectedSensors(report)) => Some(report.sensors.len()),
            _ => None,
        })
        .collect();
    assert_eq!(reports, vec![2, 2]);

    let config = service.with_state(|state| state.manager.sensor_config("rpi_B1A105").unwrap());
    assert_eq!(config, accel_only());
}
