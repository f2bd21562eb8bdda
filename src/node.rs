//! Collection node service.
//!
//! `NodeService` ties the pieces of one node together: it parses inbound commands,
//! runs them on the [`CommandExecutor`] against the node's [`DeviceManager`] and
//! persisted settings, and reports every outcome through the status [`Publisher`].
//!
//! Each command body is wrapped the same way:
//! 1. rediscover sensors; if new sensors appeared, restore their persisted settings
//!    and publish a fresh connected-sensors report,
//! 2. run the command,
//! 3. translate any failure into one ERROR status message.
//!
//! Unreachable sensors become `Connection with sensors "<id>", ... lost`; other
//! failures become `Error while running command: <error>`.

use std::collections::BTreeSet;
use std::fs;
use std::sync::Arc;

use tracing::{info, info_span, warn};

use crate::command::{CalibrateArgs, Command, ConfigureArgs, SensorSelection, SessionArgs};
use crate::config::NodeConfig;
use crate::error::{AppResult, DaqError};
use crate::executor::CommandExecutor;
use crate::hardware::BusProvider;
use crate::manager::DeviceManager;
use crate::settings_store::SensorSettingsStore;
use crate::status::{ConnectedSensors, DataMessage, Publisher, StatusSink};
use crate::transfer::SessionUploader;

/// State mutated by commands; owned by the executor.
pub struct NodeState<P: BusProvider> {
    /// Live sensors
    pub manager: DeviceManager<P>,
    /// Persisted sensor settings
    pub settings: SensorSettingsStore,
}

/// Read-only collaborators shared with every command.
struct NodeContext {
    config: NodeConfig,
    publisher: Publisher,
    uploader: Box<dyn SessionUploader>,
}

/// Command front end of one collection node.
pub struct NodeService<P: BusProvider> {
    context: Arc<NodeContext>,
    executor: CommandExecutor<NodeState<P>>,
}

impl<P: BusProvider> NodeService<P> {
    /// Discover sensors on `provider`, load persisted settings and start the worker.
    pub fn new(
        config: NodeConfig,
        provider: P,
        sink: Arc<dyn StatusSink>,
        uploader: Box<dyn SessionUploader>,
    ) -> AppResult<Self> {
        let manager = DeviceManager::new(
            config.device_id.clone(),
            config.i2c.buses.clone(),
            config.i2c.addresses.clone(),
            provider,
        );
        let settings = SensorSettingsStore::open(&config.storage.settings_path)?;
        let executor = CommandExecutor::new(NodeState { manager, settings })?;
        let publisher = Publisher::new(config.device_id.clone(), sink);

        Ok(Self {
            context: Arc::new(NodeContext {
                config,
                publisher,
                uploader,
            }),
            executor,
        })
    }

    /// Startup sequence: report connected sensors and restore their settings.
    ///
    /// Runs on the calling thread before any command can be submitted.
    pub fn start(&self) {
        let _ = self.dispatch(Command::GetConnectedSensors, true);
        let _ = self.dispatch(
            Command::LoadSensorsConfigurations(SensorSelection::all()),
            true,
        );
    }

    /// Handle one inbound JSON command envelope.
    ///
    /// Parse failures are published as ERROR messages; valid commands are handed to
    /// the worker and run in the background.
    pub fn handle_message(&self, text: &str) {
        match Command::parse(text) {
            Ok(command) => {
                info!(command = command.name(), "Executing command");
                let _ = self.dispatch(command, false);
            }
            Err(err) => self.context.publisher.error(err.to_string(), Some(&err)),
        }
    }

    /// Submit a parsed command.
    ///
    /// # Errors
    /// [`DaqError::Busy`] when another command is running; the rejection is also
    /// published.
    pub fn dispatch(&self, command: Command, synchronous: bool) -> AppResult<()> {
        let context = Arc::clone(&self.context);
        let result = self.executor.submit(
            move |state: &mut NodeState<P>| run_wrapped(&context, state, command),
            synchronous,
        );
        if let Err(err) = &result {
            self.context.publisher.error(err.to_string(), None);
        }
        result
    }

    /// True while a command is queued or running.
    pub fn is_busy(&self) -> bool {
        self.executor.is_busy()
    }

    /// Run `f` with the node state; waits for a running command to finish.
    pub fn with_state<R>(&self, f: impl FnOnce(&NodeState<P>) -> R) -> R {
        let target = self.executor.target();
        let state = target.lock();
        f(&state)
    }

    /// Let the running command finish, then stop the worker.
    pub fn shutdown(self) {
        self.executor.shutdown();
    }
}

fn run_wrapped<P: BusProvider>(context: &NodeContext, state: &mut NodeState<P>, command: Command) {
    let span = info_span!("command", name = command.name());
    let _enter = span.enter();

    if let Err(err) = refresh_then_run(context, state, command) {
        let text = failure_message(state, &err);
        context.publisher.error(text, Some(&err));
    }
}

fn refresh_then_run<P: BusProvider>(
    context: &NodeContext,
    state: &mut NodeState<P>,
    command: Command,
) -> AppResult<()> {
    let previous: BTreeSet<String> = state.manager.sensor_ids().into_iter().collect();
    state.manager.discover_sensors();
    let new_ids: Vec<String> = state
        .manager
        .sensor_ids()
        .into_iter()
        .filter(|id| !previous.contains(id))
        .collect();
    if !new_ids.is_empty() {
        info!(sensors = ?new_ids, "new sensors connected");
        load_configurations(context, state, &SensorSelection::only(new_ids))?;
        connected_sensors(context, state);
    }
    execute(context, state, command)
}

fn execute<P: BusProvider>(
    context: &NodeContext,
    state: &mut NodeState<P>,
    command: Command,
) -> AppResult<()> {
    match command {
        Command::GetConnectedSensors => {
            connected_sensors(context, state);
            Ok(())
        }
        Command::LoadSensorsConfigurations(selection) => {
            load_configurations(context, state, &selection)
        }
        Command::ResetSensors(selection) => {
            for id in select(state, selection.sensor_ids) {
                state.manager.reset_sensor(&id)?;
                state.settings.remove(&id)?;
            }
            context.publisher.success("Sensors reset");
            Ok(())
        }
        Command::ConfigureSensors(ConfigureArgs { sensor_ids, config }) => {
            for id in select(state, sensor_ids) {
                state.manager.configure_sensor(&id, &config)?;
                state.settings.set(&id, config)?;
            }
            context.publisher.success("Sensors configured");
            Ok(())
        }
        Command::CalibrateSensors(CalibrateArgs { sensor_ids, params }) => {
            for id in select(state, sensor_ids) {
                state.manager.calibrate_sensor(&id, &params)?;
            }
            context.publisher.success("Sensors calibrated");
            Ok(())
        }
        Command::StartSession(args) => start_session(context, state, args),
    }
}

fn connected_sensors<P: BusProvider>(context: &NodeContext, state: &NodeState<P>) {
    let manager = &state.manager;
    context
        .publisher
        .data(DataMessage::ConnectedSensors(ConnectedSensors {
            id: manager.device_id().to_string(),
            buses: manager.buses().to_vec(),
            addresses: manager.addresses().to_vec(),
            sensors: manager.sensors(),
        }));
}

fn load_configurations<P: BusProvider>(
    context: &NodeContext,
    state: &mut NodeState<P>,
    selection: &SensorSelection,
) -> AppResult<()> {
    for id in select(state, selection.sensor_ids.clone()) {
        if let Some(settings) = state.settings.get(&id) {
            let config = settings.config;
            state.manager.configure_sensor(&id, &config)?;
        }
    }
    context.publisher.success("Sensor configurations loaded");
    Ok(())
}

fn start_session<P: BusProvider>(
    context: &NodeContext,
    state: &mut NodeState<P>,
    SessionArgs {
        session_name,
        duration,
    }: SessionArgs,
) -> AppResult<()> {
    validate_session_name(&session_name)?;
    let device_id = context.config.device_id.as_str();
    let capture_root = &context.config.storage.capture_dir;
    fs::create_dir_all(capture_root)?;
    let workdir = tempfile::Builder::new()
        .prefix("imu-session-")
        .tempdir_in(capture_root)?;
    let session_dir = workdir.path().join(&session_name);

    state
        .manager
        .start_capture_session(&session_dir, &session_name, duration)?;

    let part_name = format!("{session_name}_{device_id}");
    match context
        .uploader
        .upload(&session_name, &part_name, &session_dir)
    {
        Ok(notice) => context.publisher.data(DataMessage::SessionPart(notice)),
        Err(err) => context
            .publisher
            .error(format!("Error while uploading session: {err}"), Some(&err)),
    }

    if let Err(err) = workdir.close() {
        warn!(error = %err, "failed to remove capture directory");
    }
    context
        .publisher
        .success(format!("Session \"{session_name}\" finished"));
    Ok(())
}

/// Session names become directory names on every node and on the session host.
fn validate_session_name(name: &str) -> AppResult<()> {
    let invalid = name.is_empty()
        || name == "."
        || name == ".."
        || name.contains(['/', '\\'])
        || name.chars().any(char::is_control);
    if invalid {
        return Err(DaqError::Value(format!("invalid session name {name:?}")));
    }
    Ok(())
}

/// `None` selects every live sensor; otherwise unknown ids are dropped.
fn select<P: BusProvider>(state: &NodeState<P>, sensor_ids: Option<Vec<String>>) -> Vec<String> {
    match sensor_ids {
        None => state.manager.sensor_ids(),
        Some(ids) => ids
            .into_iter()
            .filter(|id| state.manager.contains(id))
            .collect(),
    }
}

fn failure_message<P: BusProvider>(state: &mut NodeState<P>, err: &DaqError) -> String {
    match err {
        err if err.is_unreachable() => {
            let faulty = state.manager.unreachable_sensors();
            if faulty.is_empty() {
                "Connection with sensors lost".to_string()
            } else {
                let names: Vec<String> = faulty.iter().map(|id| format!("\"{id}\"")).collect();
                format!("Connection with sensors {} lost", names.join(", "))
            }
        }
        DaqError::Structure(_) => err.to_string(),
        err => format!("Error while running command: {err}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{I2cConfig, StorageConfig, TransferConfig};
    use crate::hardware::mock::SimulatedBoard;
    use crate::status::{ChannelSink, StatusBody, StatusKind, StatusMessage};
    use crate::transfer::LocalDirUploader;
    use tempfile::TempDir;
    use tokio::sync::mpsc::UnboundedReceiver;

    fn node(
        board: SimulatedBoard,
        dir: &TempDir,
    ) -> (NodeService<SimulatedBoard>, UnboundedReceiver<StatusMessage>) {
        let config = NodeConfig {
            device_id: "rpi".into(),
            log_level: "info".into(),
            i2c: I2cConfig {
                buses: vec![1],
                addresses: vec![0x68, 0x69],
            },
            storage: StorageConfig {
                capture_dir: dir.path().join("capture"),
                sessions_dir: dir.path().join("sessions"),
                settings_path: dir.path().join("settings.toml"),
            },
            transfer: TransferConfig::default(),
        };
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let uploader = LocalDirUploader::new(dir.path().join("sessions"), "file://sessions");
        let service =
            NodeService::new(config, board, Arc::new(ChannelSink::new(tx)), Box::new(uploader))
                .unwrap();
        (service, rx)
    }

    fn texts(rx: &mut UnboundedReceiver<StatusMessage>) -> Vec<(StatusKind, String)> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let StatusBody::Text(text) = message.msg {
                out.push((message.kind, text));
            }
        }
        out
    }

    #[test]
    fn startup_reports_sensors_and_loads_settings() {
        let dir = TempDir::new().unwrap();
        let (service, mut rx) = node(SimulatedBoard::with_sensors(&[(1, 0x68)]), &dir);
        service.start();

        let first = rx.try_recv().unwrap();
        let StatusBody::Data(DataMessage::ConnectedSensors(report)) = &first.msg else {
            panic!("expected connected sensors report, got {first:?}");
        };
        assert_eq!(report.id, "rpi");
        assert_eq!(report.sensors.len(), 1);
        assert_eq!(report.sensors[0].id, "rpi_B1A104");
        assert_eq!(
            texts(&mut rx),
            vec![(StatusKind::Success, "Sensor configurations loaded".to_string())]
        );
    }

    #[test]
    fn parse_errors_are_published() {
        let dir = TempDir::new().unwrap();
        let (service, mut rx) = node(SimulatedBoard::new(), &dir);
        service.handle_message(r#"{"command": "fly"}"#);
        service.handle_message(r#"{"command": "reset_sensors", "args": {}}"#);
        let messages = texts(&mut rx);
        assert_eq!(messages[0], (StatusKind::Error, "Invalid command: fly".to_string()));
        assert!(messages[1].1.starts_with("Invalid command structure:"));
    }

    #[test]
    fn unknown_sensor_ids_are_ignored() {
        let dir = TempDir::new().unwrap();
        let (service, mut rx) = node(SimulatedBoard::with_sensors(&[(1, 0x68)]), &dir);
        service
            .dispatch(
                Command::ResetSensors(SensorSelection::only(["rpi_B9A1"])),
                true,
            )
            .unwrap();
        assert_eq!(
            texts(&mut rx),
            vec![(StatusKind::Success, "Sensors reset".to_string())]
        );
    }

    #[test]
    fn invalid_session_name_is_reported() {
        let dir = TempDir::new().unwrap();
        let (service, mut rx) = node(SimulatedBoard::with_sensors(&[(1, 0x68)]), &dir);
        service
            .dispatch(
                Command::StartSession(SessionArgs {
                    session_name: "../escape".into(),
                    duration: 0.0,
                }),
                true,
            )
            .unwrap();
        let messages = texts(&mut rx);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].0, StatusKind::Error);
        assert!(messages[0].1.starts_with("Error while running command:"));
    }

    #[test]
    fn validate_session_names() {
        assert!(validate_session_name("walk_01").is_ok());
        assert!(validate_session_name("").is_err());
        assert!(validate_session_name("..").is_err());
        assert!(validate_session_name("a/b").is_err());
    }
}
