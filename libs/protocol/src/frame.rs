//! Frame decoding and dialect normalization.
//!
//! This is the only place that knows there are two dialects. [`decode`]
//! sniffs the dialect from the `type` spelling and parses the matching
//! shape; [`InboundFrame::into_event`] flattens both into [`AgentEvent`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::compact::CompactMessage;
use crate::error::ProtocolError;
use crate::event::{
    AgentAlert, AgentEvent, CommandResponse, ContainerEvent, ContainerStatusReport,
    DeployStatusReport, Dialect, HeartbeatReport, Hello, TaskResultReport, TelemetryBatch,
};
use crate::legacy;

/// The legacy envelope as it appears on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LegacyFrame {
    #[serde(default)]
    pub id: Option<String>,

    #[serde(rename = "type")]
    pub kind: String,

    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,

    #[serde(default)]
    pub payload: serde_json::Value,
}

/// A decoded inbound frame, still dialect-tagged.
#[derive(Debug, Clone)]
pub enum InboundFrame {
    Legacy(LegacyFrame),
    Compact(CompactMessage),
}

impl InboundFrame {
    /// The dialect this frame arrived in.
    pub fn dialect(&self) -> Dialect {
        match self {
            InboundFrame::Legacy(_) => Dialect::Legacy,
            InboundFrame::Compact(_) => Dialect::Compact,
        }
    }

    /// Normalizes the frame into the canonical event type.
    pub fn into_event(self) -> Result<AgentEvent, ProtocolError> {
        match self {
            InboundFrame::Legacy(frame) => legacy_event(frame),
            InboundFrame::Compact(msg) => Ok(compact_event(msg)),
        }
    }
}

/// Decodes one frame of text, sniffing the dialect from the `type` spelling.
pub fn decode(text: &str) -> Result<InboundFrame, ProtocolError> {
    let value: serde_json::Value = serde_json::from_str(text)?;

    let kind = value
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if kind.chars().next().is_some_and(|c| c.is_ascii_uppercase()) {
        known_compact_type(&kind)?;
        let msg: CompactMessage = serde_json::from_value(value)
            .map_err(|e| ProtocolError::invalid_payload(&kind, e))?;
        Ok(InboundFrame::Compact(msg))
    } else {
        known_legacy_type(&kind)?;
        let frame: LegacyFrame = serde_json::from_value(value)
            .map_err(|e| ProtocolError::invalid_payload(&kind, e))?;
        Ok(InboundFrame::Legacy(frame))
    }
}

fn known_legacy_type(kind: &str) -> Result<(), ProtocolError> {
    match kind {
        "agent_hello" | "heartbeat" | "deploy_status" | "container_status" | "task_result"
        | "telemetry_batch" | "alert" | "command_response" => Ok(()),
        other => Err(ProtocolError::UnknownType(other.to_string())),
    }
}

fn known_compact_type(kind: &str) -> Result<(), ProtocolError> {
    match kind {
        "Register" | "Heartbeat" | "ContainerStatus" | "TaskResult" | "CommandResponse" => Ok(()),
        other => Err(ProtocolError::UnknownType(other.to_string())),
    }
}

fn legacy_event(frame: LegacyFrame) -> Result<AgentEvent, ProtocolError> {
    let kind = frame.kind.as_str();
    let payload = frame.payload;

    macro_rules! parse {
        ($ty:ty) => {
            serde_json::from_value::<$ty>(payload)
                .map_err(|e| ProtocolError::invalid_payload(kind, e))?
        };
    }

    let event = match kind {
        "agent_hello" => {
            let p = parse!(legacy::HelloPayload);
            AgentEvent::Hello(Hello {
                dialect: Dialect::Legacy,
                agent_id: p.agent_id,
                agent_version: p.agent_version,
                hostname: p.hostname,
                os: p.os,
                arch: p.arch,
                runtime_version: p.runtime_version,
                public_ip: p.public_ip,
                resources: p.resources,
            })
        }
        "heartbeat" => {
            let p = parse!(legacy::HeartbeatPayload);
            AgentEvent::Heartbeat(HeartbeatReport {
                cpu_usage: p.cpu_usage,
                memory_usage: p.memory_usage,
                disk_usage: p.disk_usage,
                container_count: p.containers.len() as u32,
                containers: p.containers,
                uptime_secs: p.uptime_secs,
            })
        }
        "deploy_status" => {
            let p = parse!(legacy::DeployStatusPayload);
            AgentEvent::DeployStatus(DeployStatusReport {
                deployment_id: p.deployment_id,
                status: p.status,
                message: p.message,
                container_id: p.container_id,
            })
        }
        "container_status" => {
            let p = parse!(legacy::ContainerStatusPayload);
            AgentEvent::ContainerStatus(ContainerStatusReport {
                container_id: p.container_id,
                service_id: p.service_id,
                event: ContainerEvent::parse(&p.event),
                exit_code: p.exit_code,
                message: p.message,
            })
        }
        "task_result" => {
            let p = parse!(legacy::TaskResultPayload);
            AgentEvent::TaskResult(TaskResultReport {
                task_id: p.task_id,
                deployment_id: p.deployment_id,
                success: p.success,
                message: p.message,
                output: p.output,
            })
        }
        "telemetry_batch" => {
            let p = parse!(legacy::TelemetryBatchPayload);
            AgentEvent::TelemetryBatch(TelemetryBatch { entries: p.entries })
        }
        "alert" => {
            let p = parse!(legacy::AgentAlertPayload);
            AgentEvent::Alert(AgentAlert {
                alert_type: p.alert_type,
                severity: p.severity,
                title: p.title,
                message: p.message,
                dedupe_key: p.dedupe_key,
                service_id: p.service_id,
            })
        }
        "command_response" => {
            let p = parse!(legacy::CommandResponsePayload);
            AgentEvent::CommandResponse(CommandResponse {
                request_id: p.request_id,
                success: p.success,
                data: p.data,
                error: p.error,
            })
        }
        other => return Err(ProtocolError::UnknownType(other.to_string())),
    };

    Ok(event)
}

fn compact_event(msg: CompactMessage) -> AgentEvent {
    match msg {
        CompactMessage::Register {
            agent_id,
            version,
            hostname,
        } => AgentEvent::Hello(Hello {
            dialect: Dialect::Compact,
            agent_id,
            agent_version: version,
            hostname,
            os: None,
            arch: None,
            runtime_version: None,
            public_ip: None,
            resources: None,
        }),
        CompactMessage::Heartbeat {
            uptime_secs,
            cpu_usage,
            memory_usage,
            container_count,
        } => AgentEvent::Heartbeat(HeartbeatReport {
            cpu_usage: Some(cpu_usage),
            memory_usage: Some(memory_usage),
            disk_usage: None,
            container_count,
            containers: Vec::new(),
            uptime_secs: Some(uptime_secs),
        }),
        CompactMessage::ContainerStatus {
            container_id,
            status,
            exit_code,
        } => AgentEvent::ContainerStatus(ContainerStatusReport {
            container_id,
            service_id: None,
            event: ContainerEvent::parse(&status),
            exit_code,
            message: None,
        }),
        CompactMessage::TaskResult {
            task_id,
            success,
            message,
        } => AgentEvent::TaskResult(TaskResultReport {
            task_id,
            deployment_id: None,
            success,
            message,
            output: None,
        }),
        CompactMessage::CommandResponse {
            request_id,
            success,
            data,
            error,
        } => AgentEvent::CommandResponse(CommandResponse {
            request_id,
            success,
            data,
            error,
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_decode_legacy_heartbeat() {
        let text = json!({
            "id": "m1",
            "type": "heartbeat",
            "timestamp": "2025-06-01T12:00:00Z",
            "payload": {
                "cpu_usage": 12.5,
                "memory_usage": 40.0,
                "disk_usage": 55.5,
                "containers": [
                    {"container_id": "c1", "state": "running"},
                    {"container_id": "c2", "state": "exited", "health": "unhealthy"}
                ]
            }
        })
        .to_string();

        let frame = decode(&text).unwrap();
        assert_eq!(frame.dialect(), Dialect::Legacy);

        let AgentEvent::Heartbeat(hb) = frame.into_event().unwrap() else {
            panic!("expected heartbeat");
        };
        assert_eq!(hb.cpu_usage, Some(12.5));
        assert_eq!(hb.disk_usage, Some(55.5));
        assert_eq!(hb.container_count, 2);
        assert_eq!(hb.containers.len(), 2);
    }

    #[test]
    fn test_decode_compact_heartbeat() {
        let text = json!({
            "type": "Heartbeat",
            "uptime_secs": 3600,
            "cpu_usage": 7.25,
            "memory_usage": 31.0,
            "container_count": 4
        })
        .to_string();

        let frame = decode(&text).unwrap();
        assert_eq!(frame.dialect(), Dialect::Compact);

        let AgentEvent::Heartbeat(hb) = frame.into_event().unwrap() else {
            panic!("expected heartbeat");
        };
        assert_eq!(hb.uptime_secs, Some(3600));
        assert_eq!(hb.container_count, 4);
        // Compact heartbeats carry no per-container breakdown and no disk gauge.
        assert!(hb.containers.is_empty());
        assert_eq!(hb.disk_usage, None);
    }

    #[test]
    fn test_decode_compact_register() {
        let text = json!({
            "type": "Register",
            "agent_id": "agent-7",
            "version": "2.3.1",
            "hostname": "edge-1"
        })
        .to_string();

        let AgentEvent::Hello(hello) = decode(&text).unwrap().into_event().unwrap() else {
            panic!("expected hello");
        };
        assert_eq!(hello.dialect, Dialect::Compact);
        assert_eq!(hello.agent_id, "agent-7");
        assert_eq!(hello.agent_version.as_deref(), Some("2.3.1"));
    }

    #[test]
    fn test_decode_legacy_hello() {
        let text = json!({
            "id": "m2",
            "type": "agent_hello",
            "timestamp": "2025-06-01T12:00:00Z",
            "payload": {
                "agent_id": "agent-3",
                "agent_version": "1.9.0",
                "os": "linux",
                "arch": "x86_64",
                "resources": {"cpu_cores": 8.0, "memory_bytes": 16000000000i64}
            }
        })
        .to_string();

        let AgentEvent::Hello(hello) = decode(&text).unwrap().into_event().unwrap() else {
            panic!("expected hello");
        };
        assert_eq!(hello.dialect, Dialect::Legacy);
        assert_eq!(hello.os.as_deref(), Some("linux"));
        assert_eq!(hello.resources.unwrap().cpu_cores, Some(8.0));
    }

    #[test]
    fn test_decode_missing_type() {
        let err = decode(r#"{"payload": {}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::MissingType));
    }

    #[test]
    fn test_decode_unknown_legacy_type() {
        let err = decode(r#"{"type": "mystery", "payload": {}}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(t) if t == "mystery"));
    }

    #[test]
    fn test_decode_unknown_compact_type() {
        let err = decode(r#"{"type": "Mystery"}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownType(t) if t == "Mystery"));
    }

    #[test]
    fn test_decode_malformed_hello_payload() {
        // agent_id is required
        let text = json!({
            "type": "agent_hello",
            "payload": {"agent_version": "1.0.0"}
        })
        .to_string();

        let err = decode(&text).unwrap().into_event().unwrap_err();
        assert!(matches!(err, ProtocolError::InvalidPayload { .. }));
    }

    #[test]
    fn test_decode_command_response_both_dialects() {
        let legacy = json!({
            "type": "command_response",
            "payload": {"request_id": "req_x", "success": true, "data": {"ok": 1}}
        })
        .to_string();
        let compact = json!({
            "type": "CommandResponse",
            "request_id": "req_x",
            "success": false,
            "error": "unsupported"
        })
        .to_string();

        let AgentEvent::CommandResponse(a) = decode(&legacy).unwrap().into_event().unwrap() else {
            panic!("expected command response");
        };
        let AgentEvent::CommandResponse(b) = decode(&compact).unwrap().into_event().unwrap()
        else {
            panic!("expected command response");
        };
        assert!(a.success);
        assert!(!b.success);
        assert_eq!(b.error.as_deref(), Some("unsupported"));
    }
}
