//! Reporting worker: republishes accumulated state.
//!
//! No decision logic lives here. The reporter reads every key/value row and
//! publishes one JSON object to the report topic; the dashboard consumes it
//! together with the per-metric discovery announcements.

use serde_json::{Map, Value};
use tracing::warn;

use crate::broker::{BrokerSession, SessionObserver};
use crate::error::Result;
use crate::metrics;
use crate::store::Store;

pub struct Reporter {
    store: Store,
    registered: bool,
}

impl Reporter {
    pub fn new(store: Store) -> Self {
        Self {
            store,
            registered: false,
        }
    }

    pub fn set_running(&self) -> Result<()> {
        self.store
            .put(&metrics::worker_status_key("reporter"), metrics::STATUS_RUNNING)
    }

    pub fn set_stopped(&self) -> Result<()> {
        self.store.put(
            &metrics::worker_status_key("reporter"),
            metrics::STATUS_NOT_RUNNING,
        )
    }

    /// Publishes the full key/value state as one JSON object. An empty store
    /// publishes nothing.
    pub fn send_report(&self, session: &mut dyn BrokerSession) -> Result<()> {
        let rows = self.store.get_all()?;
        if rows.is_empty() {
            return Ok(());
        }

        let mut report = Map::new();
        for (key, value) in rows {
            report.insert(key, Value::String(value));
        }
        session.publish(metrics::REPORT_TOPIC, &Value::Object(report).to_string())
    }

    fn register_metrics(&self, session: &mut dyn BrokerSession) -> Result<()> {
        for def in metrics::CONNECTOR_METRICS.iter().chain(metrics::HEARTBEAT_METRICS) {
            session.publish(&metrics::config_topic(def.key), &metrics::discovery_payload(def))?;
        }
        Ok(())
    }
}

impl SessionObserver for Reporter {
    fn on_connect(&mut self, session: &mut dyn BrokerSession) {
        if !self.registered {
            match self.register_metrics(session) {
                Ok(()) => self.registered = true,
                Err(err) => warn!(error = %err, "failed to register metric discovery"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::testing::FakeSession;
    use crate::broker::ConnectionStatus;

    #[test]
    fn report_carries_every_stored_row() {
        let temp = tempfile::tempdir().expect("temp dir");
        let store = Store::open(temp.path()).expect("open store");
        store.put("connectorStatus", "Running").expect("put");
        store.put(metrics::MISSED_HEARTBEATS, 4).expect("put");

        let reporter = Reporter::new(store);
        let mut session = FakeSession::new(ConnectionStatus::Connected);
        reporter.send_report(&mut session).expect("send report");

        let (topic, payload) = session.published.pop().expect("one publish");
        assert_eq!(topic, metrics::REPORT_TOPIC);
        let report: Value = serde_json::from_str(&payload).expect("valid json");
        assert_eq!(report["connectorStatus"], "Running");
        assert_eq!(report[metrics::MISSED_HEARTBEATS], "4");
    }

    #[test]
    fn empty_store_publishes_nothing() {
        let temp = tempfile::tempdir().expect("temp dir");
        let store = Store::open(temp.path()).expect("open store");

        let reporter = Reporter::new(store);
        let mut session = FakeSession::new(ConnectionStatus::Connected);
        reporter.send_report(&mut session).expect("send report");

        assert!(session.published.is_empty());
    }

    #[test]
    fn discovery_registration_happens_once() {
        let temp = tempfile::tempdir().expect("temp dir");
        let store = Store::open(temp.path()).expect("open store");

        let mut reporter = Reporter::new(store);
        let mut session = FakeSession::new(ConnectionStatus::Connected);
        reporter.on_connect(&mut session);
        reporter.on_connect(&mut session);

        let expected = metrics::CONNECTOR_METRICS.len() + metrics::HEARTBEAT_METRICS.len();
        assert_eq!(session.published.len(), expected);
    }
}
