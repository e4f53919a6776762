//! # shipway-protocol
//!
//! The wire protocol spoken between the control plane and its agents.
//!
//! Frames travel as JSON text over a persistent bidirectional socket. Two
//! inbound dialects must be accepted simultaneously:
//!
//! - the **legacy** dialect: an envelope `{ id, type, timestamp, payload }`
//!   with lower-snake `type` values (`agent_hello`, `heartbeat`,
//!   `deploy_status`, ...);
//! - the **compact** dialect: a flat object tagged by a PascalCase `type`
//!   (`Register`, `Heartbeat`, `ContainerStatus`, ...) with a reduced
//!   payload shape.
//!
//! Dialect detection happens per message by `type` spelling and is isolated
//! to [`frame::decode`]; everything past that boundary works with one
//! canonical [`AgentEvent`] type. Outbound messages know which dialect the
//! peer registered with and render themselves accordingly.

pub mod close;
pub mod command;
pub mod compact;
pub mod error;
pub mod event;
pub mod frame;
pub mod legacy;
pub mod outbound;

pub use close::*;
pub use command::CommandType;
pub use compact::CompactMessage;
pub use error::ProtocolError;
pub use event::{
    AgentAlert, AgentEvent, CommandResponse, ContainerEvent, ContainerState,
    ContainerStatusReport, DeployStatusReport, Dialect, HeartbeatReport, Hello, ResourceSnapshot,
    TaskResultReport, TelemetryBatch,
};
pub use frame::{decode, InboundFrame, LegacyFrame};
pub use outbound::{AgentConfig, CommandFrame, PendingDeployment, ServerMessage};
