//! Worker registry and per-worker loops.
//!
//! Each worker runs in its own OS process (the supervisor re-executes this
//! binary) and wires one monitor to one broker session and the shared store.
//! Loops are single-threaded and cooperative: observe the shutdown token,
//! pump the session, act, sleep via the pump budget.

use std::time::Duration;
use tracing::{info, warn};

use warden_core::broker::{pump, BrokerSession, ConnectionStatus, SessionObserver};
use warden_core::config::{Config, Paths};
use warden_core::connector::Connector;
use warden_core::error::{Result, WardenError};
use warden_core::heartbeat::Heartbeater;
use warden_core::reporter::Reporter;
use warden_core::shutdown::ShutdownToken;
use warden_core::store::Store;

use crate::transport::MqttTransport;

const TICK: Duration = Duration::from_secs(1);
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

pub struct WorkerSpec {
    pub name: &'static str,
    run: fn(&ShutdownToken) -> Result<()>,
}

pub const WORKERS: &[WorkerSpec] = &[
    WorkerSpec {
        name: "connector",
        run: run_connector,
    },
    WorkerSpec {
        name: "heartbeat",
        run: run_heartbeat,
    },
    WorkerSpec {
        name: "reporter",
        run: run_reporter,
    },
];

pub fn names() -> Vec<&'static str> {
    WORKERS.iter().map(|spec| spec.name).collect()
}

/// Dispatches to a registered worker. Unrecovered errors propagate to the
/// entry point, which logs and exits; the supervisor's relaunch takes over
/// from there.
pub fn run(name: &str, token: &ShutdownToken) -> Result<()> {
    let spec = WORKERS
        .iter()
        .find(|spec| spec.name == name)
        .ok_or_else(|| WardenError::UnknownWorker(name.to_string()))?;

    info!(worker = %name, pid = std::process::id(), "starting worker");
    let result = (spec.run)(token);
    info!(worker = %name, pid = std::process::id(), "stopping worker");
    result
}

fn open_runtime() -> Result<(Config, Store)> {
    let paths = Paths::resolve()?;
    let config = Config::load(&paths.config_path())?;
    let store = Store::open(&paths.storage_dir())?;
    Ok((config, store))
}

fn run_connector(token: &ShutdownToken) -> Result<()> {
    let (config, store) = open_runtime()?;
    let mut connector = Connector::new(&config.broker, store)?;
    let mut session = MqttTransport::new("wardenconnector", &config.broker);
    connector.set_running()?;

    while token.active() {
        if session.connection_status() != ConnectionStatus::Connected {
            let status = session.reconnect(false);
            pump(&mut session, &mut connector, Duration::ZERO);
            // A pending attempt is not a failed one; only a broken
            // connection counts against the attempt budget.
            if status == ConnectionStatus::Disconnected && token.active() {
                connector.on_not_connect(&mut session);
            }
            continue;
        }
        pump(&mut session, &mut connector, TICK);
    }

    session.disconnect();
    connector.set_stopped()
}

fn run_heartbeat(token: &ShutdownToken) -> Result<()> {
    let (config, store) = open_runtime()?;
    let mut heartbeater = Heartbeater::new(&config.heartbeat, store)?;
    let mut session = MqttTransport::new("wardenheartbeat", &config.broker);
    heartbeater.set_running()?;
    heartbeater.wait_for_initial_signal(&mut session, token);

    while token.active() {
        if session.connection_status() != ConnectionStatus::Connected {
            let status = session.reconnect(false);
            pump(&mut session, &mut heartbeater, Duration::ZERO);
            if status == ConnectionStatus::Connected {
                // Re-baseline after an outage so broker downtime is not
                // charged to the automation service.
                heartbeater.wait_for_initial_signal(&mut session, token);
            }
            continue;
        }
        heartbeater.publish_pending(&mut session);
        pump(&mut session, &mut heartbeater, TICK);
        heartbeater.monitor(&mut session, token);
    }

    let stopped = heartbeater.set_stopped(&mut session);
    session.disconnect();
    stopped
}

fn run_reporter(token: &ShutdownToken) -> Result<()> {
    let (config, store) = open_runtime()?;
    let mut reporter = Reporter::new(store);
    let mut session = MqttTransport::new("wardenreporter", &config.broker);
    reporter.set_running()?;

    while token.active() {
        pump(&mut session, &mut reporter, TICK);
        if session.connection_status() != ConnectionStatus::Connected {
            session.reconnect(false);
            pump(&mut session, &mut reporter, Duration::ZERO);
            continue;
        }
        if let Err(err) = reporter.send_report(&mut session) {
            warn!(error = %err, "failed to publish report");
        }
        if !token.wait_timeout(REPORT_INTERVAL) {
            break;
        }
    }

    session.disconnect();
    reporter.set_stopped()
}
