//! Audit action vocabulary. The engine owns no persistence layer of its
//! own, so this is not a file-backed log: each lifecycle transition is
//! recorded as a structured `tracing` event carrying one of these variants
//! in its `action` field, and it is the embedding application's log sink
//! that archives the event stream.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    InstanceCreated,
    InstanceStarted,
    InstanceStopped,
    InstanceShutdown,
    InstanceDeleted,
    RootUserReset,
    MarkedActive,
    VhostAdded,
    VhostRemoved,
    PortAdded,
    PortRemoved,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::InstanceCreated => "instance_created",
            AuditAction::InstanceStarted => "instance_started",
            AuditAction::InstanceStopped => "instance_stopped",
            AuditAction::InstanceShutdown => "instance_shutdown",
            AuditAction::InstanceDeleted => "instance_deleted",
            AuditAction::RootUserReset => "root_user_reset",
            AuditAction::MarkedActive => "marked_active",
            AuditAction::VhostAdded => "vhost_added",
            AuditAction::VhostRemoved => "vhost_removed",
            AuditAction::PortAdded => "port_added",
            AuditAction::PortRemoved => "port_removed",
        }
    }
}
