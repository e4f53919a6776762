//! The compact dialect.
//!
//! Newer agents send flat, tagged objects instead of the enveloped legacy
//! frames. The tag is PascalCase, which is also how the decoder tells the
//! dialects apart.

use serde::{Deserialize, Serialize};

/// All inbound compact messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CompactMessage {
    /// Registration hello.
    Register {
        agent_id: String,

        #[serde(default)]
        version: Option<String>,

        #[serde(default)]
        hostname: Option<String>,
    },

    /// Reduced heartbeat: aggregate gauges only, no per-container breakdown.
    Heartbeat {
        uptime_secs: u64,
        cpu_usage: f64,
        memory_usage: f64,
        container_count: u32,
    },

    /// Container lifecycle report.
    ContainerStatus {
        container_id: String,

        status: String,

        #[serde(default)]
        exit_code: Option<i64>,
    },

    /// One-off task result.
    TaskResult {
        task_id: String,

        success: bool,

        #[serde(default)]
        message: Option<String>,
    },

    /// Response to a command frame.
    CommandResponse {
        request_id: String,

        success: bool,

        #[serde(default)]
        data: Option<serde_json::Value>,

        #[serde(default)]
        error: Option<String>,
    },
}
