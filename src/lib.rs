//! OctopusMQ: multi-protocol message broker. The library exposes the
//! bridge subsystem (§1-§5) plus the ambient config/error/logging/bus
//! stack the `octopusmq` binary (`src/main.rs`) wires together; the
//! MQTT and DDS protocol bodies stay stubs (§1 non-goals).

pub mod adapter;
pub mod address;
pub mod bus;
pub mod cli;
pub mod codec;
pub mod config;
pub mod connection;
pub mod error;
pub mod logging;
pub mod packet;
pub mod server;
