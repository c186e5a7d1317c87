//! Broker-session contract consumed by the monitors.
//!
//! The wire-level publish/subscribe client lives behind `BrokerSession`; the
//! daemon provides a thin transport wrapper and tests provide a scripted
//! fake. Monitors implement `SessionObserver` and are wired to a session by
//! their worker loop, which pumps the session and dispatches the drained
//! events - a capability contract instead of callbacks assigned onto a shared
//! client object.

use std::time::Duration;

use crate::error::Result;

/// Tri-state connection status mirrored from the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionStatus {
    /// Wire code used when mirroring the status into metrics.
    pub fn code(self) -> u8 {
        match self {
            ConnectionStatus::Disconnected => 0,
            ConnectionStatus::Connecting => 1,
            ConnectionStatus::Connected => 2,
        }
    }
}

/// Events surfaced by pumping a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Message { topic: String, payload: String },
}

/// A live session with the message broker.
///
/// `drive` pumps the transport for up to `budget` and returns the events that
/// accumulated, including any buffered by `reconnect` / `wait_connection`.
/// A zero budget drains the buffer without pumping.
pub trait BrokerSession {
    fn connection_status(&self) -> ConnectionStatus;

    /// Initiates a connection; equivalent to a single bounded reconnect
    /// attempt.
    fn connect(&mut self) -> ConnectionStatus {
        self.reconnect(false)
    }

    /// Attempts to (re)connect. With `wait` false this is one bounded
    /// attempt; with `wait` true it blocks until connected.
    fn reconnect(&mut self, wait: bool) -> ConnectionStatus;

    /// Blocks until connected or the timeout elapses, returning the final
    /// status.
    fn wait_connection(&mut self, timeout: Duration) -> ConnectionStatus;

    fn drive(&mut self, budget: Duration) -> Vec<SessionEvent>;

    fn publish(&mut self, topic: &str, payload: &str) -> Result<()>;

    fn subscribe(&mut self, topic: &str) -> Result<()>;

    fn disconnect(&mut self);
}

/// Hooks a monitor registers against its session. All hooks default to
/// no-ops so implementors override only what they observe.
pub trait SessionObserver {
    fn on_connect(&mut self, _session: &mut dyn BrokerSession) {}

    fn on_disconnect(&mut self, _session: &mut dyn BrokerSession) {}

    fn on_message(&mut self, _session: &mut dyn BrokerSession, _topic: &str, _payload: &str) {}

    /// Invoked by the worker's reconnect loop after a failed connection
    /// attempt.
    fn on_not_connect(&mut self, _session: &mut dyn BrokerSession) {}
}

/// Pumps the session for `budget` and dispatches the drained events to the
/// observer.
pub fn pump(
    session: &mut dyn BrokerSession,
    observer: &mut dyn SessionObserver,
    budget: Duration,
) {
    for event in session.drive(budget) {
        match event {
            SessionEvent::Connected => observer.on_connect(session),
            SessionEvent::Disconnected => observer.on_disconnect(session),
            SessionEvent::Message { topic, payload } => {
                observer.on_message(session, &topic, &payload)
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::WardenError;
    use std::collections::VecDeque;

    /// Scripted session for monitor tests: events queued here are returned by
    /// the next `drive`, and every publish/subscribe/wait is recorded.
    pub struct FakeSession {
        pub status: ConnectionStatus,
        pub queued: VecDeque<SessionEvent>,
        pub published: Vec<(String, String)>,
        pub subscribed: Vec<String>,
        pub wait_connection_calls: Vec<Duration>,
        pub wait_connection_result: ConnectionStatus,
        pub fail_publish: bool,
    }

    impl FakeSession {
        pub fn new(status: ConnectionStatus) -> Self {
            Self {
                status,
                queued: VecDeque::new(),
                published: Vec::new(),
                subscribed: Vec::new(),
                wait_connection_calls: Vec::new(),
                wait_connection_result: ConnectionStatus::Connected,
                fail_publish: false,
            }
        }

        pub fn queue(&mut self, event: SessionEvent) {
            self.queued.push_back(event);
        }
    }

    impl BrokerSession for FakeSession {
        fn connection_status(&self) -> ConnectionStatus {
            self.status
        }

        fn reconnect(&mut self, _wait: bool) -> ConnectionStatus {
            self.status
        }

        fn wait_connection(&mut self, timeout: Duration) -> ConnectionStatus {
            self.wait_connection_calls.push(timeout);
            self.status = self.wait_connection_result;
            self.status
        }

        fn drive(&mut self, _budget: Duration) -> Vec<SessionEvent> {
            self.queued.drain(..).collect()
        }

        fn publish(&mut self, topic: &str, payload: &str) -> Result<()> {
            if self.fail_publish {
                return Err(WardenError::Broker("publish refused".to_string()));
            }
            self.published.push((topic.to_string(), payload.to_string()));
            Ok(())
        }

        fn subscribe(&mut self, topic: &str) -> Result<()> {
            self.subscribed.push(topic.to_string());
            Ok(())
        }

        fn disconnect(&mut self) {
            self.status = ConnectionStatus::Disconnected;
        }
    }
}
