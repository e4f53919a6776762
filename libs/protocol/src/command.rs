//! The command catalog the hub can push to agents.

use serde::{Deserialize, Serialize};

/// Commands issued by the control plane over the agent socket.
///
/// These are the `type` values of outbound command frames. Agents that do
/// not understand a command reply with `success: false` rather than
/// dropping the frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Deploy,
    Stop,
    Scale,
    Restart,
    Exec,
    LogsSubscribe,
    ContainerRestart,
    ContainerStop,
    DeployCertificate,
    Ping,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::Deploy => "deploy",
            CommandType::Stop => "stop",
            CommandType::Scale => "scale",
            CommandType::Restart => "restart",
            CommandType::Exec => "exec",
            CommandType::LogsSubscribe => "logs_subscribe",
            CommandType::ContainerRestart => "container_restart",
            CommandType::ContainerStop => "container_stop",
            CommandType::DeployCertificate => "deploy_certificate",
            CommandType::Ping => "ping",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "deploy" => Some(CommandType::Deploy),
            "stop" => Some(CommandType::Stop),
            "scale" => Some(CommandType::Scale),
            "restart" => Some(CommandType::Restart),
            "exec" => Some(CommandType::Exec),
            "logs_subscribe" => Some(CommandType::LogsSubscribe),
            "container_restart" => Some(CommandType::ContainerRestart),
            "container_stop" => Some(CommandType::ContainerStop),
            "deploy_certificate" => Some(CommandType::DeployCertificate),
            "ping" => Some(CommandType::Ping),
            _ => None,
        }
    }
}

impl std::fmt::Display for CommandType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
