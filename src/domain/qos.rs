//! Quality of Service policies for link consumption

use serde::{Deserialize, Serialize};

/// How a downstream node reads its input stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum QoS {
    /// Skip to the newest entry if behind; at-most-once.
    /// Best for live inference - a stale camera frame is worthless.
    Realtime,
    /// Read every entry through a consumer group; at-least-once within the
    /// retention window. Best for logging and sinks.
    Durable,
    /// Durable until the group lags past a threshold, then skip to the tip.
    Balanced,
}

impl QoS {
    pub fn as_str(&self) -> &'static str {
        match self {
            QoS::Realtime => "REALTIME",
            QoS::Durable => "DURABLE",
            QoS::Balanced => "BALANCED",
        }
    }
}
