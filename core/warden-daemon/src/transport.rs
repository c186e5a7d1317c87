//! Thin MQTT transport wrapper implementing the broker-session contract.
//!
//! A background thread pumps the rumqttc event loop and forwards the raw
//! notifications over a channel; `drive` drains that channel within its time
//! budget and translates notifications into session events. No decision
//! logic lives here - escalation belongs to the monitors.

use rumqttc::{Client, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use std::collections::VecDeque;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use warden_core::broker::{BrokerSession, ConnectionStatus, SessionEvent};
use warden_core::config::BrokerConfig;
use warden_core::error::{Result, WardenError};

const KEEP_ALIVE: Duration = Duration::from_secs(30);
const CHANNEL_CAPACITY: usize = 32;
const ERROR_PACE: Duration = Duration::from_secs(1);

enum Notification {
    ConnAck(bool),
    Publish { topic: String, payload: String },
    Disconnect,
    ConnectionError,
}

pub struct MqttTransport {
    client: Client,
    notifications: Receiver<Notification>,
    connected: bool,
    broken: bool,
    buffered: VecDeque<SessionEvent>,
    host: String,
    port: u16,
}

impl MqttTransport {
    pub fn new(client_id: &str, config: &BrokerConfig) -> Self {
        let mut options = MqttOptions::new(client_id, &config.host, config.port);
        options.set_keep_alive(KEEP_ALIVE);
        if let (Some(user), Some(pass)) = (&config.username, &config.password) {
            options.set_credentials(user.as_str(), pass.as_str());
        }

        let (client, mut connection) = Client::new(options, CHANNEL_CAPACITY);
        let (tx, rx) = mpsc::channel();

        // The event loop reconnects on its own as long as it keeps being
        // iterated; errors are paced so a dead broker does not spin.
        thread::spawn(move || {
            for notification in connection.iter() {
                let forwarded = match notification {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        tx.send(Notification::ConnAck(ack.code == ConnectReturnCode::Success))
                    }
                    Ok(Event::Incoming(Packet::Publish(publish))) => tx.send(Notification::Publish {
                        topic: publish.topic.clone(),
                        payload: String::from_utf8_lossy(&publish.payload).into_owned(),
                    }),
                    Ok(Event::Incoming(Packet::Disconnect)) => tx.send(Notification::Disconnect),
                    Ok(_) => Ok(()),
                    Err(err) => {
                        debug!(error = %err, "broker event loop error");
                        let sent = tx.send(Notification::ConnectionError);
                        thread::sleep(ERROR_PACE);
                        sent
                    }
                };
                if forwarded.is_err() {
                    break;
                }
            }
        });

        Self {
            client,
            notifications: rx,
            connected: false,
            broken: false,
            buffered: VecDeque::new(),
            host: config.host.clone(),
            port: config.port,
        }
    }

    fn pump(&mut self, budget: Duration) {
        let deadline = Instant::now() + budget;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.notifications.recv_timeout(remaining) {
                Ok(Notification::ConnAck(accepted)) => {
                    if accepted {
                        info!(host = %self.host, port = self.port, "connected to broker");
                        self.connected = true;
                        self.broken = false;
                        self.buffered.push_back(SessionEvent::Connected);
                    } else {
                        self.mark_disconnected();
                        self.broken = true;
                    }
                }
                Ok(Notification::Publish { topic, payload }) => {
                    self.buffered.push_back(SessionEvent::Message { topic, payload });
                }
                Ok(Notification::Disconnect) => {
                    self.mark_disconnected();
                }
                Ok(Notification::ConnectionError) => {
                    self.mark_disconnected();
                    self.broken = true;
                }
                Err(RecvTimeoutError::Timeout) => break,
                Err(RecvTimeoutError::Disconnected) => {
                    self.mark_disconnected();
                    self.broken = true;
                    break;
                }
            }
        }
    }

    fn mark_disconnected(&mut self) {
        if self.connected {
            info!(host = %self.host, port = self.port, "disconnected from broker");
            self.buffered.push_back(SessionEvent::Disconnected);
        }
        self.connected = false;
    }
}

impl BrokerSession for MqttTransport {
    fn connection_status(&self) -> ConnectionStatus {
        if self.connected {
            ConnectionStatus::Connected
        } else if self.broken {
            ConnectionStatus::Disconnected
        } else {
            ConnectionStatus::Connecting
        }
    }

    fn reconnect(&mut self, wait: bool) -> ConnectionStatus {
        info!(host = %self.host, port = self.port, "connecting to broker");
        loop {
            self.pump(Duration::from_secs(1));
            if self.connected || !wait {
                return self.connection_status();
            }
        }
    }

    fn wait_connection(&mut self, timeout: Duration) -> ConnectionStatus {
        let deadline = Instant::now() + timeout;
        while !self.connected {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            self.pump(remaining.min(Duration::from_secs(1)));
        }
        self.connection_status()
    }

    fn drive(&mut self, budget: Duration) -> Vec<SessionEvent> {
        if !budget.is_zero() {
            self.pump(budget);
        }
        self.buffered.drain(..).collect()
    }

    fn publish(&mut self, topic: &str, payload: &str) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, true, payload)
            .map_err(|err| WardenError::Broker(err.to_string()))
    }

    fn subscribe(&mut self, topic: &str) -> Result<()> {
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .map_err(|err| WardenError::Broker(err.to_string()))
    }

    fn disconnect(&mut self) {
        let _ = self.client.disconnect();
    }
}
