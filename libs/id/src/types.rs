//! Typed ID definitions for the platform resources the control plane touches.

use crate::define_id;

// Tenancy
define_id!(OrgId, "org");

// Fleet
define_id!(ServerId, "srv");

// Application model
define_id!(ServiceId, "svc");
define_id!(DeploymentId, "dpl");

// Alerting
define_id!(AlertId, "alr");

// Command correlation
define_id!(RequestId, "req");
