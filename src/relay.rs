//! Status broadcast relay: at-most-once fan-out of deployment status and
//! metrics snapshots to subscribed viewers.
//!
//! The relay keeps one broadcast channel per deployment plus one global
//! channel. There is no replay buffer and no durability: a subscriber only
//! sees messages published after it subscribed. Within one deployment's
//! stream, delivery order equals publish order, best-effort per connection.
//! A broken subscriber connection is isolated to its own socket loop and
//! never blocks delivery to the others.
//!
//! This in-process registry is the single-instance default. Handlers only
//! touch `publish`/`subscribe`/`subscribe_all`, so a broker-backed
//! implementation can replace it for horizontal scaling.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::models::{DeploymentMetrics, DeploymentStatus};

/// Channel capacity per topic. Slow subscribers that lag past this many
/// messages miss the overflow (at-most-once, never blocking the publisher).
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum RelayMessage {
    #[serde(rename_all = "camelCase")]
    StatusChanged {
        deployment_id: i64,
        status: DeploymentStatus,
        metrics: DeploymentMetrics,
    },
    #[serde(rename_all = "camelCase")]
    MetricsUpdated {
        deployment_id: i64,
        metrics: DeploymentMetrics,
    },
}

impl RelayMessage {
    pub fn deployment_id(&self) -> i64 {
        match self {
            Self::StatusChanged { deployment_id, .. } => *deployment_id,
            Self::MetricsUpdated { deployment_id, .. } => *deployment_id,
        }
    }
}

pub struct StatusRelay {
    global: broadcast::Sender<String>,
    topics: Mutex<HashMap<i64, broadcast::Sender<String>>>,
}

impl Default for StatusRelay {
    fn default() -> Self {
        Self::new()
    }
}

impl StatusRelay {
    pub fn new() -> Self {
        let (global, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            global,
            topics: Mutex::new(HashMap::new()),
        }
    }

    /// Subscribe to one deployment's update stream. The topic channel is
    /// created lazily; publishes before the first subscriber are dropped.
    pub fn subscribe(&self, deployment_id: i64) -> broadcast::Receiver<String> {
        let mut topics = match self.topics.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        topics
            .entry(deployment_id)
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .subscribe()
    }

    /// Subscribe to updates across all deployments.
    pub fn subscribe_all(&self) -> broadcast::Receiver<String> {
        self.global.subscribe()
    }

    /// Serialize and deliver a message to the deployment's topic and the
    /// global stream. Returns silently when no subscriber is listening.
    pub fn publish(&self, msg: &RelayMessage) {
        let json = match serde_json::to_string(msg) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize relay message");
                return;
            }
        };

        // Ignore send errors: they only mean no receivers are connected.
        let _ = self.global.send(json.clone());

        let mut topics = match self.topics.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        let deployment_id = msg.deployment_id();
        if let Some(tx) = topics.get(&deployment_id) {
            if tx.send(json).is_err() {
                // Last subscriber went away; drop the idle topic.
                topics.remove(&deployment_id);
            }
        }
    }

    /// Number of live subscribers on a deployment's topic.
    pub fn subscriber_count(&self, deployment_id: i64) -> usize {
        let topics = match self.topics.lock() {
            Ok(t) => t,
            Err(poisoned) => poisoned.into_inner(),
        };
        topics
            .get(&deployment_id)
            .map(|tx| tx.receiver_count())
            .unwrap_or(0)
    }
}
