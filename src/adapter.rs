//! The process-wide adapter pool (§4.6, §9): a small tagged handle
//! exposing exactly `run`/`stop`/`inject_publish`, per the design note
//! that rules out a deeper trait-object hierarchy for this scale.
//!
//! MQTT and DDS stay stubs (§1 non-goals) — they accept construction
//! from config and park immediately, so the pool, the bus fan-out, and
//! the CLI wiring are all exercised end-to-end without any protocol
//! logic behind them.

use std::sync::Arc;

use crate::bus::{AdapterTag, Message, MessageQueue};
use crate::config::AdapterConfig;
use crate::error::BridgeError;
use crate::server::{Server, ServerHandle};

/// A protocol body the bridge fans publications into or out of. MQTT
/// and DDS are out of scope (§1) and never do real work; they exist so
/// the adapter pool has something to dispatch `inject_publish` to.
enum Body {
    Mqtt,
    Dds,
    Bridge(ServerHandle),
}

pub struct AdapterHandle {
    pub tag: AdapterTag,
    pub name: String,
    body: Body,
}

impl AdapterHandle {
    /// Starts a bridge adapter: binds the UDP socket, runs the reactor
    /// on a dedicated thread (§5), and returns immediately.
    pub fn start_bridge(
        tag: AdapterTag,
        config: &AdapterConfig,
        bridge: &crate::config::BridgeSettings,
        queue: Arc<MessageQueue>,
    ) -> Result<Self, BridgeError> {
        let phy = crate::address::resolve_interface(&config.interface)?;
        let (server, handle) = Server::new(phy, config.port, bridge.clone(), queue, tag)?;
        let name = config.display_name();
        let handle = server.spawn(handle, format!("bridge:{name}"));
        Ok(Self {
            tag,
            name,
            body: Body::Bridge(handle),
        })
    }

    /// MQTT and DDS adapters have no protocol loop to run (§1); they
    /// exist only as a stub occupying a `(tag, name)` slot in the pool.
    pub fn start_stub(tag: AdapterTag, config: &AdapterConfig, is_mqtt: bool) -> Self {
        Self {
            tag,
            name: config.display_name(),
            body: if is_mqtt { Body::Mqtt } else { Body::Dds },
        }
    }

    /// Pushes one publication batch into this adapter, if it is a
    /// bridge; MQTT/DDS stubs silently discard it (§1 — their protocol
    /// bodies are not implemented).
    pub fn inject_publish(&self, publications: Vec<crate::packet::Publication>) {
        if let Body::Bridge(handle) = &self.body {
            handle.inject_publish(publications);
        }
    }

    pub fn stop(&mut self) {
        if let Body::Bridge(handle) = &mut self.body {
            handle.stop();
        }
    }
}

/// Bus dispatcher (§4.6): drains the queue and calls `inject_publish`
/// on every adapter but the message's origin, giving O(N_adapters)
/// fan-out with no loops. Runs on the control thread, outside any
/// bridge's reactor.
pub fn dispatch_bus_message(adapters: &mut [AdapterHandle], origin: AdapterTag, message: Message) {
    for adapter in adapters.iter_mut() {
        if adapter.tag != origin {
            adapter.inject_publish(vec![message.clone()]);
        }
    }
}
