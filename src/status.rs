//! Outbound status messages and their transports.
//!
//! Every message carries the node's device id, a type and either a short text or a
//! structured DATA payload:
//!
//! ```json
//! {"device_id": "rpi", "type": "SUCCESS", "msg": "Sensors configured"}
//! {"device_id": "rpi", "type": "DATA", "msg": {"type": "session_part", "data": {...}}}
//! ```
//!
//! [`Publisher`] logs each message locally at the level implied by its type and
//! forwards it to a [`StatusSink`].

use std::io::Write;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info, trace, warn};

use crate::manager::SensorInfo;

/// Message type, serialized upper-case (`"SUCCESS"`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[allow(missing_docs)]
pub enum StatusKind {
    Error,
    Success,
    Warning,
    Info,
    Data,
}

/// Node topology and live sensors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectedSensors {
    /// Device id of the node
    pub id: String,
    /// Configured bus numbers
    pub buses: Vec<u8>,
    /// Configured candidate addresses
    pub addresses: Vec<u8>,
    /// Sensors that answered discovery
    pub sensors: Vec<SensorInfo>,
}

/// Where one node's part of a session was delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionPartNotice {
    /// Session the part belongs to
    pub session_name: String,
    /// Part name, `<session>_<device>`
    pub file_name: String,
    /// Location of the delivered part
    pub url: String,
}

/// Structured DATA payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum DataMessage {
    /// Reply to `get_connected_sensors`
    ConnectedSensors(ConnectedSensors),
    /// A finished session part
    SessionPart(SessionPartNotice),
}

/// Message body: plain text, or a DATA payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StatusBody {
    /// Short human-readable text
    Text(String),
    /// Structured payload
    Data(DataMessage),
}

/// One status line sent by a node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusMessage {
    /// Sending node
    pub device_id: String,
    /// Message type
    #[serde(rename = "type")]
    pub kind: StatusKind,
    /// Text or DATA payload
    pub msg: StatusBody,
}

/// Destination of status messages.
pub trait StatusSink: Send + Sync {
    /// Deliver one message. Transport failures are logged, not returned.
    fn publish(&self, message: &StatusMessage);
}

/// Sink with no transport; messages only reach the local log.
#[derive(Debug, Default)]
pub struct TracingSink;

impl StatusSink for TracingSink {
    fn publish(&self, message: &StatusMessage) {
        trace!(?message, "status message");
    }
}

/// Forwards messages into an in-process channel.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    sender: UnboundedSender<StatusMessage>,
}

impl ChannelSink {
    /// Wrap the sending half of a status channel.
    pub fn new(sender: UnboundedSender<StatusMessage>) -> Self {
        Self { sender }
    }
}

impl StatusSink for ChannelSink {
    fn publish(&self, message: &StatusMessage) {
        if self.sender.send(message.clone()).is_err() {
            warn!("status receiver dropped; message discarded");
        }
    }
}

/// Writes one JSON document per line.
pub struct JsonLinesSink<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    /// Each message is flushed after its newline.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

impl<W: Write + Send> StatusSink for JsonLinesSink<W> {
    fn publish(&self, message: &StatusMessage) {
        let mut writer = self.writer.lock();
        let result = serde_json::to_writer(&mut *writer, message)
            .map_err(std::io::Error::from)
            .and_then(|()| writer.write_all(b"\n"))
            .and_then(|()| writer.flush());
        if let Err(err) = result {
            error!(error = %err, "failed to write status message");
        }
    }
}

/// Builds, logs and forwards the status messages of one node.
#[derive(Clone)]
pub struct Publisher {
    device_id: String,
    sink: Arc<dyn StatusSink>,
}

impl Publisher {
    /// Messages are stamped with `device_id`.
    pub fn new(device_id: impl Into<String>, sink: Arc<dyn StatusSink>) -> Self {
        Self {
            device_id: device_id.into(),
            sink,
        }
    }

    /// Log the message at the level its kind implies, then forward it.
    pub fn publish(&self, kind: StatusKind, msg: StatusBody) {
        let message = StatusMessage {
            device_id: self.device_id.clone(),
            kind,
            msg,
        };
        match (&message.kind, &message.msg) {
            (StatusKind::Error, StatusBody::Text(text)) => error!("{text}"),
            (StatusKind::Warning, StatusBody::Text(text)) => warn!("{text}"),
            (StatusKind::Success | StatusKind::Info, StatusBody::Text(text)) => info!("{text}"),
            (_, body) => debug!(?body, "data message"),
        }
        self.sink.publish(&message);
    }

    /// Publish a SUCCESS text.
    pub fn success(&self, text: impl Into<String>) {
        self.publish(StatusKind::Success, StatusBody::Text(text.into()));
    }

    /// Publish an INFO text.
    pub fn info(&self, text: impl Into<String>) {
        self.publish(StatusKind::Info, StatusBody::Text(text.into()));
    }

    /// Publish a short error; `detail` is logged locally only.
    pub fn error(&self, text: impl Into<String>, detail: Option<&dyn std::error::Error>) {
        if let Some(detail) = detail {
            error!(error = ?detail, "command failure detail");
        }
        self.publish(StatusKind::Error, StatusBody::Text(text.into()));
    }

    /// Publish a DATA payload.
    pub fn data(&self, data: DataMessage) {
        self.publish(StatusKind::Data, StatusBody::Data(data));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn text_messages_serialize_flat() {
        let message = StatusMessage {
            device_id: "rpi".into(),
            kind: StatusKind::Success,
            msg: StatusBody::Text("Sensors reset".into()),
        };
        assert_eq!(
            serde_json::to_value(&message).unwrap(),
            json!({"device_id": "rpi", "type": "SUCCESS", "msg": "Sensors reset"})
        );
    }

    #[test]
    fn data_messages_are_tagged() {
        let message = StatusMessage {
            device_id: "rpi".into(),
            kind: StatusKind::Data,
            msg: StatusBody::Data(DataMessage::SessionPart(SessionPartNotice {
                session_name: "walk".into(),
                file_name: "walk_rpi".into(),
                url: "file://sessions/walk/walk_rpi".into(),
            })),
        };
        let value = serde_json::to_value(&message).unwrap();
        assert_eq!(value["type"], "DATA");
        assert_eq!(value["msg"]["type"], "session_part");
        assert_eq!(value["msg"]["data"]["file_name"], "walk_rpi");

        let parsed: StatusMessage = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, message);
    }

    #[test]
    fn json_lines_sink_writes_one_line_per_message() {
        let sink = Arc::new(JsonLinesSink::new(Vec::new()));
        let publisher = Publisher::new("rpi", sink.clone());
        publisher.success("Sensors calibrated");
        publisher.error("Manager is busy", None);
        drop(publisher);

        let sink = Arc::try_unwrap(sink).ok().unwrap();
        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[1].contains("\"type\":\"ERROR\""));
    }

    #[test]
    fn channel_sink_forwards_messages() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let publisher = Publisher::new("rpi", Arc::new(ChannelSink::new(tx)));
        publisher.info("hello");
        let message = rx.try_recv().unwrap();
        assert_eq!(message.kind, StatusKind::Info);
        assert_eq!(message.msg, StatusBody::Text("hello".into()));
    }
}
