//! Inbound command parsing.
//!
//! Commands arrive as JSON envelopes, `{"command": "<name>", "args": {...}}`. The
//! name is looked up in a fixed table; the arguments are deserialized into the
//! typed payload of that command. Unknown names fail with
//! [`DaqError::InvalidCommand`]; a malformed envelope or missing/invalid arguments
//! fail with [`DaqError::Structure`].
//!
//! `sensor_ids` must always be present, but may be `null` to select every known
//! sensor.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppResult, DaqError};
use crate::hardware::{CalibrationParams, SensorConfig};

/// Sensors targeted by a command; `None` selects all known sensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorSelection {
    /// Target ids; unknown ids are ignored
    #[serde(deserialize_with = "Option::deserialize")]
    pub sensor_ids: Option<Vec<String>>,
}

impl SensorSelection {
    /// Every live sensor.
    pub fn all() -> Self {
        Self { sensor_ids: None }
    }

    /// Just the listed ids.
    pub fn only<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            sensor_ids: Some(ids.into_iter().map(Into::into).collect()),
        }
    }
}

/// Arguments of `configure_sensors`: a selection plus a full configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigureArgs {
    /// Target ids, `None` for all
    #[serde(deserialize_with = "Option::deserialize")]
    pub sensor_ids: Option<Vec<String>>,
    /// Configuration applied to each target
    #[serde(flatten)]
    pub config: SensorConfig,
}

/// Arguments of `calibrate_sensors`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrateArgs {
    /// Target ids, `None` for all
    #[serde(deserialize_with = "Option::deserialize")]
    pub sensor_ids: Option<Vec<String>>,
    /// Calibration tuning
    #[serde(flatten)]
    pub params: CalibrationParams,
}

/// Arguments of `start_session`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionArgs {
    /// Becomes the session directory name
    pub session_name: String,
    /// Capture duration in seconds
    pub duration: f64,
}

/// A parsed node command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Report topology and live sensors
    GetConnectedSensors,
    /// Re-apply persisted settings
    LoadSensorsConfigurations(SensorSelection),
    /// Restore power-on defaults and forget persisted settings
    ResetSensors(SensorSelection),
    /// Apply and persist a configuration
    ConfigureSensors(ConfigureArgs),
    /// Compute offset registers
    CalibrateSensors(CalibrateArgs),
    /// Capture a session in the background
    StartSession(SessionArgs),
}

type Parser = fn(Value) -> AppResult<Command>;

const COMMANDS: &[(&str, Parser)] = &[
    ("get_connected_sensors", parse_get_connected_sensors),
    ("load_sensors_configurations", parse_load_sensors_configurations),
    ("reset_sensors", parse_reset_sensors),
    ("configure_sensors", parse_configure_sensors),
    ("calibrate_sensors", parse_calibrate_sensors),
    ("start_session", parse_start_session),
];

fn parse_get_connected_sensors(_: Value) -> AppResult<Command> {
    Ok(Command::GetConnectedSensors)
}

fn parse_load_sensors_configurations(args: Value) -> AppResult<Command> {
    args_of(args).map(Command::LoadSensorsConfigurations)
}

fn parse_reset_sensors(args: Value) -> AppResult<Command> {
    args_of(args).map(Command::ResetSensors)
}

fn parse_configure_sensors(args: Value) -> AppResult<Command> {
    args_of(args).map(Command::ConfigureSensors)
}

fn parse_calibrate_sensors(args: Value) -> AppResult<Command> {
    args_of(args).map(Command::CalibrateSensors)
}

fn parse_start_session(args: Value) -> AppResult<Command> {
    args_of(args).map(Command::StartSession)
}

#[derive(Deserialize)]
struct Envelope {
    command: String,
    #[serde(default)]
    args: Value,
}

fn args_of<T: DeserializeOwned>(args: Value) -> AppResult<T> {
    serde_json::from_value(args).map_err(|e| DaqError::Structure(e.to_string()))
}

impl Command {
    /// Parse a JSON envelope.
    pub fn parse(text: &str) -> AppResult<Self> {
        let envelope: Envelope =
            serde_json::from_str(text).map_err(|e| DaqError::Structure(e.to_string()))?;
        Self::from_parts(&envelope.command, envelope.args)
    }

    /// Resolve `name` in the command table and parse `args` for it.
    pub fn from_parts(name: &str, args: Value) -> AppResult<Self> {
        let (_, parse) = COMMANDS
            .iter()
            .find(|(known, _)| *known == name)
            .ok_or_else(|| DaqError::InvalidCommand(name.to_string()))?;
        parse(args)
    }

    /// Wire name of the command.
    pub fn name(&self) -> &'static str {
        match self {
            Command::GetConnectedSensors => "get_connected_sensors",
            Command::LoadSensorsConfigurations(_) => "load_sensors_configurations",
            Command::ResetSensors(_) => "reset_sensors",
            Command::ConfigureSensors(_) => "configure_sensors",
            Command::CalibrateSensors(_) => "calibrate_sensors",
            Command::StartSession(_) => "start_session",
        }
    }

    /// The JSON envelope that [`parse`](Self::parse) accepts for this command.
    pub fn to_envelope(&self) -> AppResult<Value> {
        let args = match self {
            Command::GetConnectedSensors => Value::Object(Default::default()),
            Command::LoadSensorsConfigurations(selection) | Command::ResetSensors(selection) => {
                serde_json::to_value(selection)?
            }
            Command::ConfigureSensors(args) => serde_json::to_value(args)?,
            Command::CalibrateSensors(args) => serde_json::to_value(args)?,
            Command::StartSession(args) => serde_json::to_value(args)?,
        };
        Ok(serde_json::json!({ "command": self.name(), "args": args }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::{AccelRange, ClockSource, DlpfMode, GyroRange};
    use serde_json::json;

    #[test]
    fn parses_commands_without_args() {
        assert_eq!(
            Command::parse(r#"{"command": "get_connected_sensors"}"#).unwrap(),
            Command::GetConnectedSensors
        );
    }

    #[test]
    fn null_sensor_ids_select_all() {
        let command =
            Command::parse(r#"{"command": "reset_sensors", "args": {"sensor_ids": null}}"#).unwrap();
        assert_eq!(command, Command::ResetSensors(SensorSelection::all()));
    }

    #[test]
    fn missing_sensor_ids_is_a_structure_error() {
        let err = Command::parse(r#"{"command": "reset_sensors", "args": {}}"#).unwrap_err();
        assert!(matches!(err, DaqError::Structure(_)));
        assert!(err.to_string().starts_with("Invalid command structure:"));
        assert!(err.to_string().contains("sensor_ids"));
    }

    #[test]
    fn unknown_command_is_invalid() {
        let err = Command::parse(r#"{"command": "self_destruct", "args": {}}"#).unwrap_err();
        assert_eq!(err.to_string(), "Invalid command: self_destruct");
    }

    #[test]
    fn configure_args_are_typed() {
        let command = Command::from_parts(
            "configure_sensors",
            json!({
                "sensor_ids": ["rpi_B1A104"],
                "clock_source": 1,
                "dlpf_mode": 0,
                "rate": 9,
                "full_scale_accel_range": 2,
                "full_scale_gyro_range": 3,
                "accel_fifo_enabled": true,
                "x_gyro_fifo_enabled": true,
                "y_gyro_fifo_enabled": false,
                "z_gyro_fifo_enabled": false
            }),
        )
        .unwrap();
        let Command::ConfigureSensors(args) = command else {
            panic!("wrong command");
        };
        assert_eq!(args.sensor_ids, Some(vec!["rpi_B1A104".to_string()]));
        assert_eq!(args.config.clock_source, ClockSource::PllXGyro);
        assert_eq!(args.config.dlpf_mode, DlpfMode::Bw256);
        assert_eq!(args.config.full_scale_accel_range, AccelRange::G8);
        assert_eq!(args.config.full_scale_gyro_range, GyroRange::Dps2000);
        assert_eq!(args.config.package_length(), 8);
    }

    #[test]
    fn out_of_range_register_value_is_rejected() {
        let err = Command::from_parts(
            "configure_sensors",
            json!({
                "sensor_ids": null,
                "clock_source": 0,
                "dlpf_mode": 7,
                "rate": 0,
                "full_scale_accel_range": 0,
                "full_scale_gyro_range": 0,
                "accel_fifo_enabled": true,
                "x_gyro_fifo_enabled": false,
                "y_gyro_fifo_enabled": false,
                "z_gyro_fifo_enabled": false
            }),
        )
        .unwrap_err();
        assert!(matches!(err, DaqError::Structure(_)));
    }

    #[test]
    fn calibration_tuning_is_optional() {
        let command = Command::from_parts(
            "calibrate_sensors",
            json!({"sensor_ids": null, "max_iters": 50, "rough_iters": 5, "buffer_size": 100, "mu": 0.3}),
        )
        .unwrap();
        let Command::CalibrateSensors(args) = command else {
            panic!("wrong command");
        };
        assert_eq!(args.params.max_iters, 50);
        assert_eq!(args.params.mu, 0.3);
        assert_eq!(args.params.epsilon, 0.1);
    }

    #[test]
    fn envelope_parses_back() {
        let commands = [
            Command::GetConnectedSensors,
            Command::LoadSensorsConfigurations(SensorSelection::only(["a", "b"])),
            Command::StartSession(SessionArgs {
                session_name: "walk".into(),
                duration: 2.5,
            }),
        ];
        for command in commands {
            let text = command.to_envelope().unwrap().to_string();
            assert_eq!(Command::parse(&text).unwrap(), command);
        }
    }
}
