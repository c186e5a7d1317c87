//! Heartbeat monitor for the dependent automation service.
//!
//! The service publishes a periodic liveness beacon on a known topic. Missing
//! beacons escalate through bounded tiers: tolerate up to three misses,
//! restart the service up to three times, then reboot the host. A genuine
//! beacon at any tier clears every counter.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::VecDeque;
use std::fmt::Display;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::broker::{pump, BrokerSession, SessionObserver};
use crate::command::exec_command;
use crate::config::HeartbeatConfig;
use crate::error::Result;
use crate::metrics;
use crate::shutdown::ShutdownToken;
use crate::store::Store;

const MAX_MISSES: u32 = 3;
const MAX_RESTART_ATTEMPTS: u32 = 3;
const DEFAULT_SIGNAL_WAIT: Duration = Duration::from_secs(300);

pub struct Heartbeater {
    store: Store,
    topic: String,
    service_command: String,
    reboot_command: String,
    interval: i64,
    tolerance: i64,
    misses: u32,
    attempts: u32,
    missed_total: i64,
    service_restarts: i64,
    system_reboots: i64,
    last_signal_at: Option<DateTime<Utc>>,
    last_observed_signal_at: Option<DateTime<Utc>>,
    signal_wait: Duration,
    pending: VecDeque<(String, String)>,
    registered: bool,
}

impl Heartbeater {
    /// Seeds persisted counters from the store and mirrors them back.
    pub fn new(config: &HeartbeatConfig, store: Store) -> Result<Self> {
        let missed_total = store.get_i64(metrics::MISSED_HEARTBEATS)?;
        store.put(metrics::MISSED_HEARTBEATS, missed_total)?;
        let service_restarts = store.get_i64(metrics::SERVICE_RESTARTS)?;
        store.put(metrics::SERVICE_RESTARTS, service_restarts)?;
        let system_reboots = store.get_i64(metrics::SYSTEM_REBOOTS)?;
        store.put(metrics::SYSTEM_REBOOTS, system_reboots)?;

        Ok(Self {
            store,
            topic: config.topic.clone(),
            service_command: config.service_restart_command.clone(),
            reboot_command: config.system_reboot_command.clone(),
            interval: config.interval,
            tolerance: config.tolerance,
            misses: 0,
            attempts: 0,
            missed_total,
            service_restarts,
            system_reboots,
            last_signal_at: None,
            last_observed_signal_at: None,
            signal_wait: DEFAULT_SIGNAL_WAIT,
            pending: VecDeque::new(),
            registered: false,
        })
    }

    pub fn with_signal_wait(mut self, wait: Duration) -> Self {
        self.signal_wait = wait;
        self
    }

    pub fn set_running(&self) -> Result<()> {
        self.store
            .put(metrics::HEARTBEAT_STATUS, metrics::STATUS_RUNNING)
    }

    pub fn set_stopped(&self, session: &mut dyn BrokerSession) -> Result<()> {
        let _ = session.publish(
            &metrics::state_topic(metrics::HEARTBEAT_STATUS),
            metrics::STATUS_NOT_RUNNING,
        );
        self.store
            .put(metrics::HEARTBEAT_STATUS, metrics::STATUS_NOT_RUNNING)
    }

    /// Blocks until the first beacon arrives or the wait budget elapses. On
    /// timeout the baseline is seeded to now so a cold start does not
    /// immediately escalate.
    pub fn wait_for_initial_signal(
        &mut self,
        session: &mut dyn BrokerSession,
        token: &ShutdownToken,
    ) {
        self.last_signal_at = None;
        self.last_observed_signal_at = None;
        info!("waiting for a heartbeat from the automation service");
        let deadline = Instant::now() + self.signal_wait;
        while token.active() && self.last_signal_at.is_none() && Instant::now() < deadline {
            pump(&mut *session, self, Duration::from_secs(1));
        }

        if self.last_signal_at.is_some() {
            info!("automation service is reachable");
        } else {
            let now = Utc::now();
            self.last_signal_at = Some(now);
            self.last_observed_signal_at = Some(now);
            warn!("automation service still not reachable, seeding baseline");
        }
    }

    /// Called once per poll tick. Compares the elapsed time since the last
    /// beacon against `interval + tolerance` and walks the escalation tiers.
    pub fn monitor(&mut self, session: &mut dyn BrokerSession, token: &ShutdownToken) {
        let Some(last_signal) = self.last_signal_at else {
            return;
        };

        let now = Utc::now();
        if (now - last_signal).num_seconds() > self.interval + self.tolerance {
            warn!("heartbeat threshold reached");
            if self.misses < MAX_MISSES {
                self.misses += 1;
                // Hysteresis: advance the baseline by one interval so a
                // single gap is counted once per interval-sized slice, not
                // once per poll tick.
                self.last_signal_at =
                    Some(last_signal + ChronoDuration::seconds(self.interval));
                self.missed_total =
                    self.mirror_inc(metrics::MISSED_HEARTBEATS, self.missed_total);
                self.queue_state(metrics::MISSED_HEARTBEATS, self.missed_total);
                warn!(
                    miss = self.misses,
                    max = MAX_MISSES,
                    "tolerating missed heartbeat"
                );
            } else if self.attempts < MAX_RESTART_ATTEMPTS {
                self.attempts += 1;
                self.misses = 0;
                warn!(
                    attempt = self.attempts,
                    max = MAX_RESTART_ATTEMPTS,
                    command = %self.service_command,
                    "miss budget exhausted, restarting automation service"
                );
                if exec_command(&self.service_command) {
                    self.service_restarts =
                        self.mirror_inc(metrics::SERVICE_RESTARTS, self.service_restarts);
                    self.queue_state(metrics::SERVICE_RESTARTS, self.service_restarts);
                    let stamp = metrics::timestamp_now();
                    self.mirror_put(metrics::LAST_SERVICE_RESTART, &stamp);
                    self.queue_state(metrics::LAST_SERVICE_RESTART, &stamp);
                    self.wait_for_initial_signal(session, token);
                }
            } else {
                warn!("heartbeat still failing after 3 service restarts");
                warn!(command = %self.reboot_command, "rebooting host");
                // Counters are persisted first: the process does not expect
                // to survive the command.
                self.system_reboots =
                    self.mirror_inc(metrics::SYSTEM_REBOOTS, self.system_reboots);
                self.queue_state(metrics::SYSTEM_REBOOTS, self.system_reboots);
                let stamp = metrics::timestamp_now();
                self.mirror_put(metrics::LAST_SYSTEM_REBOOT, &stamp);
                self.queue_state(metrics::LAST_SYSTEM_REBOOT, &stamp);
                exec_command(&self.reboot_command);
            }
            self.last_observed_signal_at = self.last_signal_at;
        }

        if self.last_observed_signal_at != self.last_signal_at {
            // A genuine beacon arrived since the last escalation step;
            // recovery at any tier clears every counter.
            self.misses = 0;
            self.attempts = 0;
        }
    }

    /// Flushes queued metric states to the broker, stopping at the first
    /// failure so unsent states are retried next tick.
    pub fn publish_pending(&mut self, session: &mut dyn BrokerSession) {
        while let Some((metric, value)) = self.pending.pop_front() {
            if let Err(err) = session.publish(&metrics::state_topic(&metric), &value) {
                warn!(metric = %metric, error = %err, "failed to publish metric state");
                self.pending.push_front((metric, value));
                break;
            }
        }
    }

    fn register_metrics(&mut self, session: &mut dyn BrokerSession) -> Result<()> {
        for def in metrics::HEARTBEAT_METRICS {
            session.publish(&metrics::config_topic(def.key), &metrics::discovery_payload(def))?;
        }
        publish_state(session, metrics::HEARTBEAT_STATUS, metrics::STATUS_RUNNING)?;
        publish_state(session, metrics::MISSED_HEARTBEATS, self.missed_total)?;
        publish_state(session, metrics::SERVICE_RESTARTS, self.service_restarts)?;
        publish_state(session, metrics::SYSTEM_REBOOTS, self.system_reboots)?;
        for metric in [
            metrics::LAST_HEARTBEAT,
            metrics::LAST_SERVICE_RESTART,
            metrics::LAST_SYSTEM_REBOOT,
        ] {
            let value = self.store.get(metric)?.unwrap_or_default();
            publish_state(session, metric, value)?;
        }
        Ok(())
    }

    fn queue_state(&mut self, metric: &str, value: impl Display) {
        self.pending.push_back((metric.to_string(), value.to_string()));
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

impl SessionObserver for Heartbeater {
    fn on_connect(&mut self, session: &mut dyn BrokerSession) {
        info!(topic = %self.topic, "subscribing to heartbeat topic");
        if let Err(err) = session.subscribe(&self.topic) {
            warn!(topic = %self.topic, error = %err, "failed to subscribe");
        }
        if !self.registered {
            match self.register_metrics(session) {
                Ok(()) => self.registered = true,
                Err(err) => warn!(error = %err, "failed to register heartbeat metrics"),
            }
        }
    }

    fn on_message(&mut self, _session: &mut dyn BrokerSession, topic: &str, _payload: &str) {
        if topic != self.topic {
            return;
        }
        self.last_signal_at = Some(Utc::now());
        let stamp = metrics::timestamp_now();
        self.mirror_put(metrics::LAST_HEARTBEAT, &stamp);
        self.queue_state(metrics::LAST_HEARTBEAT, stamp);
    }
}

fn publish_state(
    session: &mut dyn BrokerSession,
    metric: &str,
    value: impl Display,
) -> Result<()> {
    session.publish(&metrics::state_topic(metric), &value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::FakeSession;
    use crate::broker::{ConnectionStatus, SessionEvent};

    const INTERVAL: i64 = 30;
    const TOLERANCE: i64 = 5;

    fn heartbeater(store: Store, service_command: &str, reboot_command: &str) -> Heartbeater {
        let config = HeartbeatConfig {
            topic: "homeassistant/heartbeat".to_string(),
            interval: INTERVAL,
            tolerance: TOLERANCE,
            service_restart_command: service_command.to_string(),
            system_reboot_command: reboot_command.to_string(),
        };
        Heartbeater::new(&config, store)
            .expect("heartbeater")
            .with_signal_wait(Duration::ZERO)
    }

    fn temp_store(temp: &tempfile::TempDir) -> Store {
        Store::open(temp.path()).expect("open store")
    }

    fn set_gap(heartbeater: &mut Heartbeater, seconds: i64) {
        heartbeater.last_signal_at = Some(Utc::now() - ChronoDuration::seconds(seconds));
    }

    #[test]
    fn in_time_signal_produces_no_action() {
        let temp = tempfile::tempdir().expect("temp dir");
        let store = temp_store(&temp);
        let mut hb = heartbeater(store.clone(), "true", "true");
        let mut session = FakeSession::new(ConnectionStatus::Connected);
        let token = ShutdownToken::new();

        set_gap(&mut hb, INTERVAL);
        for _ in 0..5 {
            hb.monitor(&mut session, &token);
        }
        set_gap(&mut hb, INTERVAL + TOLERANCE);
        hb.monitor(&mut session, &token);

        assert_eq!(hb.misses, 0);
        assert_eq!(store.get_i64(metrics::MISSED_HEARTBEATS).expect("get"), 0);
    }

    #[test]
    fn monitor_without_a_baseline_is_a_no_op() {
        let temp = tempfile::tempdir().expect("temp dir");
        let mut hb = heartbeater(temp_store(&temp), "true", "true");
        let mut session = FakeSession::new(ConnectionStatus::Connected);
        hb.monitor(&mut session, &ShutdownToken::new());
        assert_eq!(hb.misses, 0);
    }

    #[test]
    fn a_gap_counts_once_per_interval_slice() {
        let temp = tempfile::tempdir().expect("temp dir");
        let store = temp_store(&temp);
        let mut hb = heartbeater(store.clone(), "true", "true");
        let mut session = FakeSession::new(ConnectionStatus::Connected);
        let token = ShutdownToken::new();

        set_gap(&mut hb, INTERVAL + TOLERANCE + 1);
        hb.monitor(&mut session, &token);
        assert_eq!(hb.misses, 1);

        // The baseline advanced one interval, so the same gap is in time on
        // the next tick.
        hb.monitor(&mut session, &token);
        assert_eq!(hb.misses, 1);
        assert_eq!(store.get_i64(metrics::MISSED_HEARTBEATS).expect("get"), 1);
    }

    #[test]
    fn a_long_gap_is_counted_in_interval_slices_not_ticks() {
        let temp = tempfile::tempdir().expect("temp dir");
        let store = temp_store(&temp);
        let config = HeartbeatConfig {
            interval: 10,
            tolerance: 0,
            service_restart_command: "true".to_string(),
            system_reboot_command: "true".to_string(),
            ..HeartbeatConfig::default()
        };
        let mut hb = Heartbeater::new(&config, store)
            .expect("heartbeater")
            .with_signal_wait(Duration::ZERO);
        let mut session = FakeSession::new(ConnectionStatus::Connected);
        let token = ShutdownToken::new();

        hb.last_signal_at = Some(Utc::now() - ChronoDuration::seconds(35));
        for _ in 0..5 {
            hb.monitor(&mut session, &token);
        }

        // 35 seconds of gap at a 10 second interval is three slices; the
        // remaining 5 seconds are in time.
        assert_eq!(hb.misses, 3);
        assert_eq!(hb.attempts, 0);
    }

    #[test]
    fn escalation_walks_misses_then_restarts_then_reboot() {
        let temp = tempfile::tempdir().expect("temp dir");
        let store = temp_store(&temp);
        let mut hb = heartbeater(store.clone(), "true", "true");
        let mut session = FakeSession::new(ConnectionStatus::Connected);
        let token = ShutdownToken::new();
        let gap = INTERVAL + TOLERANCE + 1;

        for cycle in 1..=3i64 {
            for miss in 1..=3u32 {
                set_gap(&mut hb, gap);
                hb.monitor(&mut session, &token);
                assert_eq!(hb.misses, miss);
                assert_eq!(
                    store.get_i64(metrics::MISSED_HEARTBEATS).expect("get"),
                    (cycle - 1) * 3 + i64::from(miss)
                );
            }
            set_gap(&mut hb, gap);
            hb.monitor(&mut session, &token);
            assert_eq!(hb.misses, 0);
            assert_eq!(hb.attempts, cycle as u32);
            assert_eq!(
                store.get_i64(metrics::SERVICE_RESTARTS).expect("get"),
                cycle
            );
            assert_eq!(store.get_i64(metrics::SYSTEM_REBOOTS).expect("get"), 0);
        }

        // Restart budget exhausted: three more misses, then the reboot tier.
        for _ in 0..3 {
            set_gap(&mut hb, gap);
            hb.monitor(&mut session, &token);
        }
        set_gap(&mut hb, gap);
        hb.monitor(&mut session, &token);

        assert_eq!(store.get_i64(metrics::SYSTEM_REBOOTS).expect("get"), 1);
        assert_eq!(store.get_i64(metrics::SERVICE_RESTARTS).expect("get"), 3);
        assert!(store.get(metrics::LAST_SYSTEM_REBOOT).expect("get").is_some());
    }

    #[test]
    fn reboot_counter_is_persisted_even_when_the_command_fails() {
        let temp = tempfile::tempdir().expect("temp dir");
        let store = temp_store(&temp);
        let mut hb = heartbeater(store.clone(), "true", "false");
        let mut session = FakeSession::new(ConnectionStatus::Connected);
        let token = ShutdownToken::new();

        hb.misses = 3;
        hb.attempts = 3;
        set_gap(&mut hb, INTERVAL + TOLERANCE + 1);
        hb.monitor(&mut session, &token);

        assert_eq!(store.get_i64(metrics::SYSTEM_REBOOTS).expect("get"), 1);
    }

    #[test]
    fn failed_service_restart_does_not_advance_the_restart_counter() {
        let temp = tempfile::tempdir().expect("temp dir");
        let store = temp_store(&temp);
        let mut hb = heartbeater(store.clone(), "false", "true");
        let mut session = FakeSession::new(ConnectionStatus::Connected);
        let token = ShutdownToken::new();
        let gap = INTERVAL + TOLERANCE + 1;

        for _ in 0..3 {
            set_gap(&mut hb, gap);
            hb.monitor(&mut session, &token);
        }
        set_gap(&mut hb, gap);
        hb.monitor(&mut session, &token);

        // The attempt is spent but nothing else moves; the next gap starts
        // tolerating again.
        assert_eq!(hb.attempts, 1);
        assert_eq!(hb.misses, 0);
        assert_eq!(store.get_i64(metrics::SERVICE_RESTARTS).expect("get"), 0);

        set_gap(&mut hb, gap);
        hb.monitor(&mut session, &token);
        assert_eq!(hb.misses, 1);
    }

    #[test]
    fn a_real_signal_clears_every_tier() {
        let temp = tempfile::tempdir().expect("temp dir");
        let store = temp_store(&temp);
        let mut hb = heartbeater(store.clone(), "true", "true");
        let mut session = FakeSession::new(ConnectionStatus::Connected);
        let token = ShutdownToken::new();
        let gap = INTERVAL + TOLERANCE + 1;

        for _ in 0..4 {
            set_gap(&mut hb, gap);
            hb.monitor(&mut session, &token);
        }
        assert_eq!(hb.attempts, 1);

        hb.on_message(&mut session, "homeassistant/heartbeat", "beat");
        hb.monitor(&mut session, &token);

        assert_eq!(hb.misses, 0);
        assert_eq!(hb.attempts, 0);
    }

    #[test]
    fn signals_on_other_topics_are_ignored() {
        let temp = tempfile::tempdir().expect("temp dir");
        let mut hb = heartbeater(temp_store(&temp), "true", "true");
        let mut session = FakeSession::new(ConnectionStatus::Connected);

        hb.on_message(&mut session, "homeassistant/other", "noise");
        assert!(hb.last_signal_at.is_none());

        hb.on_message(&mut session, "homeassistant/heartbeat", "beat");
        assert!(hb.last_signal_at.is_some());
    }

    #[test]
    fn initial_wait_picks_up_a_queued_signal() {
        let temp = tempfile::tempdir().expect("temp dir");
        let store = temp_store(&temp);
        let mut hb = heartbeater(store.clone(), "true", "true")
            .with_signal_wait(Duration::from_secs(1));
        let mut session = FakeSession::new(ConnectionStatus::Connected);
        session.queue(SessionEvent::Message {
            topic: "homeassistant/heartbeat".to_string(),
            payload: "beat".to_string(),
        });

        hb.wait_for_initial_signal(&mut session, &ShutdownToken::new());

        assert!(hb.last_signal_at.is_some());
        assert!(store.get(metrics::LAST_HEARTBEAT).expect("get").is_some());
    }

    #[test]
    fn initial_wait_timeout_seeds_the_baseline() {
        let temp = tempfile::tempdir().expect("temp dir");
        let store = temp_store(&temp);
        let mut hb = heartbeater(store.clone(), "true", "true");
        let mut session = FakeSession::new(ConnectionStatus::Connecting);
        let token = ShutdownToken::new();

        hb.wait_for_initial_signal(&mut session, &token);
        assert!(hb.last_signal_at.is_some());

        hb.monitor(&mut session, &token);
        assert_eq!(hb.misses, 0);
        assert_eq!(store.get_i64(metrics::MISSED_HEARTBEATS).expect("get"), 0);
    }

    #[test]
    fn pending_states_flush_in_order_and_survive_publish_failures() {
        let temp = tempfile::tempdir().expect("temp dir");
        let mut hb = heartbeater(temp_store(&temp), "true", "true");
        let mut session = FakeSession::new(ConnectionStatus::Connected);

        hb.queue_state(metrics::MISSED_HEARTBEATS, 1);
        hb.queue_state(metrics::SERVICE_RESTARTS, 2);

        session.fail_publish = true;
        hb.publish_pending(&mut session);
        assert_eq!(hb.pending.len(), 2);

        session.fail_publish = false;
        hb.publish_pending(&mut session);
        assert!(hb.pending.is_empty());
        assert_eq!(
            session.published,
            vec![
                (metrics::state_topic(metrics::MISSED_HEARTBEATS), "1".to_string()),
                (metrics::state_topic(metrics::SERVICE_RESTARTS), "2".to_string()),
            ]
        );
    }

    #[test]
    fn connect_subscribes_every_time_but_registers_once() {
        let temp = tempfile::tempdir().expect("temp dir");
        let mut hb = heartbeater(temp_store(&temp), "true", "true");
        let mut session = FakeSession::new(ConnectionStatus::Connected);

        hb.on_connect(&mut session);
        hb.on_connect(&mut session);

        assert_eq!(
            session.subscribed,
            vec![
                "homeassistant/heartbeat".to_string(),
                "homeassistant/heartbeat".to_string(),
            ]
        );
        let config_messages = session
            .published
            .iter()
            .filter(|(topic, _)| topic.ends_with("/config"))
            .count();
        assert_eq!(config_messages, metrics::HEARTBEAT_METRICS.len());
    }

    #[test]
    fn counters_seed_from_persisted_values() {
        let temp = tempfile::tempdir().expect("temp dir");
        let store = temp_store(&temp);
        store.put(metrics::MISSED_HEARTBEATS, 5).expect("seed");

        let mut hb = heartbeater(store.clone(), "true", "true");
        let mut session = FakeSession::new(ConnectionStatus::Connected);
        set_gap(&mut hb, INTERVAL + TOLERANCE + 1);
        hb.monitor(&mut session, &ShutdownToken::new());

        assert_eq!(store.get_i64(metrics::MISSED_HEARTBEATS).expect("get"), 6);
    }
}
