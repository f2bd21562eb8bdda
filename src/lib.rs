//! # IMU DAQ Core Library
//!
//! Multi-node inertial data acquisition around the MPU-6050. Each collection node
//! drives the sensors attached to its I2C buses, captures their FIFO streams on
//! command, and hands its part of a session to a shared session tree where the
//! parts of all nodes are merged into one time-aligned dataset.
//!
//! ## Crate Structure
//!
//! - **`hardware`**: register-level bus access, the MPU-6050 driver with its
//!   configuration model and offset calibration, bus providers (Linux `/dev/i2c-N`
//!   behind the `hardware` feature, and a simulated board).
//! - **`capture`**: the fixed-duration capture loop draining sensor FIFOs.
//! - **`manager`**: `DeviceManager`, the live sensor set of one node.
//! - **`executor`**: single-worker command serialization with busy rejection.
//! - **`command`**: typed inbound commands parsed from JSON envelopes.
//! - **`status`**: outbound status messages and their sinks.
//! - **`node`**: `NodeService`, the command front end of a node.
//! - **`settings_store`**: persisted per-sensor settings.
//! - **`transfer`**: delivery of session parts to the session tree.
//! - **`session`**: session descriptors, cross-node merge and decode to CSV.
//! - **`config`**, **`logging`**, **`error`**: ambient configuration, tracing setup
//!   and the crate-wide `DaqError`.

pub mod capture;
pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod hardware;
pub mod logging;
pub mod manager;
pub mod node;
pub mod session;
pub mod settings_store;
pub mod status;
pub mod transfer;
