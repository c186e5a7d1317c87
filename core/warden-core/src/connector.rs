//! Connection health monitor.
//!
//! Owns one broker session's health: counts consecutive failed connection
//! attempts, restarts the broker service after the attempt budget is spent,
//! and classifies disconnects against a lifetime stability ratio so a single
//! drop in an otherwise long, healthy session is not reported as instability.

use chrono::{DateTime, Utc};
use std::fmt::Display;
use std::thread;
use std::time::Duration;
use tracing::warn;

use crate::broker::{BrokerSession, SessionObserver};
use crate::command::exec_command;
use crate::config::BrokerConfig;
use crate::error::Result;
use crate::metrics;
use crate::store::Store;

const MAX_ATTEMPTS: u32 = 3;
const DEFAULT_BACKOFF: Duration = Duration::from_secs(5);
const DEFAULT_RECONNECT_WAIT: Duration = Duration::from_secs(60);
const STABILITY_THRESHOLD: f64 = 0.90;

pub struct Connector {
    store: Store,
    restart_command: String,
    attempts: u32,
    failed_connections: i64,
    broker_restarts: i64,
    started_at: DateTime<Utc>,
    connected_at: DateTime<Utc>,
    connected_secs: f64,
    backoff: Duration,
    reconnect_wait: Duration,
    registered: bool,
}

impl Connector {
    /// Seeds persisted counters from the store and mirrors them back so the
    /// report reflects them even before the first event.
    pub fn new(config: &BrokerConfig, store: Store) -> Result<Self> {
        store.put(metrics::BROKER_CONNECTION, metrics::CONNECTION_NOT_STABLE)?;
        let broker_restarts = store.get_i64(metrics::BROKER_RESTARTS)?;
        store.put(metrics::BROKER_RESTARTS, broker_restarts)?;
        let failed_connections = store.get_i64(metrics::FAILED_CONNECTIONS)?;
        store.put(metrics::FAILED_CONNECTIONS, failed_connections)?;

        let now = Utc::now();
        Ok(Self {
            store,
            restart_command: config.restart_command.clone(),
            attempts: 0,
            failed_connections,
            broker_restarts,
            started_at: now,
            connected_at: now,
            connected_secs: 0.0,
            backoff: DEFAULT_BACKOFF,
            reconnect_wait: DEFAULT_RECONNECT_WAIT,
            registered: false,
        })
    }

    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_reconnect_wait(mut self, wait: Duration) -> Self {
        self.reconnect_wait = wait;
        self
    }

    pub fn set_running(&self) -> Result<()> {
        self.store
            .put(metrics::CONNECTOR_STATUS, metrics::STATUS_RUNNING)
    }

    pub fn set_stopped(&self) -> Result<()> {
        self.store
            .put(metrics::CONNECTOR_STATUS, metrics::STATUS_NOT_RUNNING)
    }

    /// Lifetime stability: the share of this session spent connected.
    /// Accumulates connected time up to now, so it must only be consulted
    /// while (or immediately after) being connected.
    pub fn is_stable(&mut self) -> bool {
        let now = Utc::now();
        self.connected_secs += seconds_between(self.connected_at, now);
        self.connected_at = now;
        let session_secs = seconds_between(self.started_at, now);
        session_secs > 0.0 && self.connected_secs / session_secs >= STABILITY_THRESHOLD
    }

    fn register_metrics(&mut self, session: &mut dyn BrokerSession) -> Result<()> {
        for def in metrics::CONNECTOR_METRICS {
            session.publish(&metrics::config_topic(def.key), &metrics::discovery_payload(def))?;
        }
        publish_state(session, metrics::CONNECTOR_STATUS, metrics::STATUS_RUNNING)?;
        publish_state(session, metrics::BROKER_CONNECTION, metrics::CONNECTION_STABLE)?;
        publish_state(session, metrics::FAILED_CONNECTIONS, self.failed_connections)?;
        publish_state(session, metrics::BROKER_RESTARTS, self.broker_restarts)?;
        let last_restart = self.store.get(metrics::LAST_BROKER_RESTART)?.unwrap_or_default();
        publish_state(session, metrics::LAST_BROKER_RESTART, last_restart)?;
        Ok(())
    }

    fn mirror_put(&self, key: &str, value: impl Display) {
        if let Err(err) = self.store.put(key, value) {
            warn!(key, error = %err, "failed to mirror metric");
        }
    }

    fn mirror_inc(&self, key: &str, current: i64) -> i64 {
        match self.store.inc(key, 1, current) {
            Ok(next) => next,
            Err(err) => {
                warn!(key, error = %err, "failed to mirror counter");
                current + 1
            }
        }
    }
}

impl SessionObserver for Connector {
    fn on_connect(&mut self, session: &mut dyn BrokerSession) {
        self.connected_at = Utc::now();
        self.mirror_put(metrics::BROKER_CONNECTION, metrics::CONNECTION_STABLE);
        // Discovery registration and initial values go out exactly once per
        // process; retried on the next connect if the broker refuses.
        if !self.registered {
            match self.register_metrics(session) {
                Ok(()) => self.registered = true,
                Err(err) => warn!(error = %err, "failed to register connector metrics"),
            }
        }
    }

    fn on_disconnect(&mut self, _session: &mut dyn BrokerSession) {
        // A single drop in a long, healthy session is not instability.
        if !self.is_stable() {
            self.mirror_put(metrics::BROKER_CONNECTION, metrics::CONNECTION_NOT_STABLE);
        }
    }

    fn on_not_connect(&mut self, session: &mut dyn BrokerSession) {
        if self.attempts >= MAX_ATTEMPTS {
            warn!(attempts = self.attempts, "max connection attempts reached");
            warn!(command = %self.restart_command, "restarting broker service");
            if exec_command(&self.restart_command) {
                self.broker_restarts = self.mirror_inc(metrics::BROKER_RESTARTS, self.broker_restarts);
                self.mirror_put(metrics::LAST_BROKER_RESTART, metrics::timestamp_now());
                session.wait_connection(self.reconnect_wait);
                // Deliberate: the attempt budget resets once the restart
                // command succeeds, whether or not the broker came back
                // within the wait window.
                self.attempts = 0;
            } else {
                warn!(command = %self.restart_command, "broker restart command failed");
            }
        } else {
            self.attempts += 1;
            self.failed_connections =
                self.mirror_inc(metrics::FAILED_CONNECTIONS, self.failed_connections);
            warn!(
                attempt = self.attempts,
                max = MAX_ATTEMPTS,
                "broker is not responding"
            );
            thread::sleep(self.backoff);
        }
    }
}

fn publish_state(
    session: &mut dyn BrokerSession,
    metric: &str,
    value: impl Display,
) -> Result<()> {
    session.publish(&metrics::state_topic(metric), &value.to_string())
}

fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_milliseconds() as f64 / 1000.0
}
