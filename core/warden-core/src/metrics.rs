//! Metric keys, discovery metadata, and topic formatting.
//!
//! Every counter and status Warden exposes is mirrored into the key/value
//! store under these keys and announced to the gateway's dashboard via
//! retained discovery messages.

use chrono::Utc;
use serde_json::json;

pub const STATUS_RUNNING: &str = "Running";
pub const STATUS_NOT_RUNNING: &str = "Not Running";
pub const STATUS_LAUNCHING: &str = "Launching";
pub const STATUS_LAUNCHED: &str = "Launched";

pub const CONNECTION_STABLE: &str = "Stable";
pub const CONNECTION_NOT_STABLE: &str = "Not Stable";

pub const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub const CONNECTOR_STATUS: &str = "wdConnectorStatus";
pub const BROKER_CONNECTION: &str = "wdBrokerConnection";
pub const FAILED_CONNECTIONS: &str = "wdFailedConnections";
pub const BROKER_RESTARTS: &str = "wdBrokerRestarts";
pub const LAST_BROKER_RESTART: &str = "wdLastBrokerRestart";

pub const HEARTBEAT_STATUS: &str = "wdHeartbeatStatus";
pub const MISSED_HEARTBEATS: &str = "wdMissedHeartbeats";
pub const SERVICE_RESTARTS: &str = "wdServiceRestarts";
pub const LAST_SERVICE_RESTART: &str = "wdLastServiceRestart";
pub const SYSTEM_REBOOTS: &str = "wdSystemReboots";
pub const LAST_SYSTEM_REBOOT: &str = "wdLastSystemReboot";
pub const LAST_HEARTBEAT: &str = "wdLastHeartbeat";

pub const REPORT_TOPIC: &str = "warden/report";

/// Discovery metadata for one exposed metric.
#[derive(Debug, Clone, Copy)]
pub struct MetricDef {
    pub key: &'static str,
    pub name: &'static str,
    pub icon: &'static str,
}

pub const CONNECTOR_METRICS: &[MetricDef] = &[
    MetricDef {
        key: CONNECTOR_STATUS,
        name: "Connector Status",
        icon: "mdi:access-point",
    },
    MetricDef {
        key: BROKER_CONNECTION,
        name: "Broker Connection",
        icon: "mdi:network",
    },
    MetricDef {
        key: FAILED_CONNECTIONS,
        name: "Failed Connections",
        icon: "mdi:sync-alert",
    },
    MetricDef {
        key: BROKER_RESTARTS,
        name: "Broker Restarts",
        icon: "mdi:restart",
    },
    MetricDef {
        key: LAST_BROKER_RESTART,
        name: "Last Broker Restart",
        icon: "mdi:calendar-clock",
    },
];

pub const HEARTBEAT_METRICS: &[MetricDef] = &[
    MetricDef {
        key: HEARTBEAT_STATUS,
        name: "Heartbeat Status",
        icon: "mdi:heart-pulse",
    },
    MetricDef {
        key: MISSED_HEARTBEATS,
        name: "Missed Heartbeats",
        icon: "mdi:pipe-leak",
    },
    MetricDef {
        key: SERVICE_RESTARTS,
        name: "Service Restarts",
        icon: "mdi:restart",
    },
    MetricDef {
        key: LAST_SERVICE_RESTART,
        name: "Last Service Restart",
        icon: "mdi:calendar-clock",
    },
    MetricDef {
        key: SYSTEM_REBOOTS,
        name: "System Reboots",
        icon: "mdi:server",
    },
    MetricDef {
        key: LAST_SYSTEM_REBOOT,
        name: "Last System Reboot",
        icon: "mdi:calendar-clock",
    },
    MetricDef {
        key: LAST_HEARTBEAT,
        name: "Last Heartbeat",
        icon: "mdi:calendar-clock",
    },
];

/// Key under which the supervisor mirrors a worker's process status.
pub fn worker_status_key(worker: &str) -> String {
    format!("{worker}Status")
}

pub fn state_topic(metric: &str) -> String {
    format!("homeassistant/sensor/{metric}/state")
}

pub fn config_topic(metric: &str) -> String {
    format!("homeassistant/sensor/{metric}/config")
}

/// Retained discovery payload announcing a metric to the dashboard.
pub fn discovery_payload(def: &MetricDef) -> String {
    json!({
        "name": def.name,
        "state_topic": state_topic(def.key),
        "icon": def.icon,
    })
    .to_string()
}

/// Wall-clock timestamp in the format used for published metric values.
pub fn timestamp_now() -> String {
    Utc::now().format(TIME_FORMAT).to_string()
}
