//! `octopusmq`: wires the CLI, the settings loader, the adapter pool,
//! and the shared bus together. The bridge subsystem (§4) is the one
//! adapter kind with real protocol logic behind it (§1).

use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use log::{error, info, Level};

use octopusmq::adapter::{dispatch_bus_message, AdapterHandle};
use octopusmq::bus::{AdapterTag, MessageQueue};
use octopusmq::cli::Args;
use octopusmq::config::{AdapterProtocol, Settings};
use octopusmq::error::BridgeError;
use octopusmq::logging::{AnsiLogger, TimestampMode};

/// Bus capacity; per §5 the queue is logically unbounded, but a real
/// process needs a finite bound to avoid unchecked growth when every
/// adapter is slow to drain.
const BUS_CAPACITY: usize = 4096;
const DISPATCH_POLL: Duration = Duration::from_millis(50);

fn main() -> ExitCode {
    let args = Args::parse();

    if AnsiLogger::new(TimestampMode::Absolute)
        .install(Level::Info)
        .is_err()
    {
        eprintln!("logger already installed");
    }

    info!("octopusmq v{} starting", env!("CARGO_PKG_VERSION"));
    if args.daemon {
        info!("--daemon requested; running in foreground (no platform fork performed)");
    }

    let settings = match Settings::from_file(&args.settings) {
        Ok(s) => s,
        Err(e) => {
            error!("failed to load settings from {:?}: {e}", args.settings);
            return ExitCode::FAILURE;
        }
    };

    match run(settings) {
        Ok(()) => {
            info!("octopusmq shut down cleanly");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("fatal: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(settings: Settings) -> Result<(), BridgeError> {
    let queue = Arc::new(MessageQueue::new(BUS_CAPACITY));
    let next_tag = AtomicU32::new(0);
    let mut adapters = Vec::with_capacity(settings.adapters.len());

    for adapter_config in &settings.adapters {
        let tag = AdapterTag(next_tag.fetch_add(1, Ordering::Relaxed));
        let handle = match &adapter_config.protocol {
            AdapterProtocol::Bridge(bridge) => {
                AdapterHandle::start_bridge(tag, adapter_config, bridge, Arc::clone(&queue))?
            }
            AdapterProtocol::Mqtt { .. } => AdapterHandle::start_stub(tag, adapter_config, true),
            AdapterProtocol::Dds { .. } => AdapterHandle::start_stub(tag, adapter_config, false),
        };
        info!("adapter `{}` started ({})", handle.name, adapter_config.protocol_name());
        adapters.push(handle);
    }

    let running = Arc::new(AtomicBool::new(true));
    let ctrlc_flag = Arc::clone(&running);
    ctrlc::set_handler(move || {
        ctrlc_flag.store(false, Ordering::SeqCst);
    })
    .expect("failed to install Ctrl+C handler");

    info!("octopusmq running with {} adapter(s); Ctrl+C to stop", adapters.len());

    // Control-thread dispatcher (§4.6/§9): drains the bus and fans each
    // message out to every adapter but its origin.
    while running.load(Ordering::SeqCst) {
        for item in queue.drain() {
            dispatch_bus_message(&mut adapters, item.origin, item.message);
        }
        std::thread::sleep(DISPATCH_POLL);
    }

    info!("shutdown requested, stopping adapters");
    for adapter in &mut adapters {
        adapter.stop();
    }

    Ok(())
}
