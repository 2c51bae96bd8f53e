//! Queue-owned records: replication log, representation log, durable
//! operations, checkpoints and device credentials.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::fixture::FixtureEntry;
use super::instance::InstanceRef;
use super::metadata::Metadata;

/// Closed set of durable operation kinds. The tag is what gets persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    CreateSpace,
    CreateRoom,
    CreateSubspace,
    AddExistingSubspace,
    CreateDevicesSubspace,
    CreateAppsSubspace,
    CreateServicesSubspace,
    InviteDevice,
    AcceptInvite,
    CreateDeviceSubroom,
    RegisterDeviceAccount,
    SetDisplayName,
}

impl OperationKind {
    pub const ALL: [OperationKind; 12] = [
        OperationKind::CreateSpace,
        OperationKind::CreateRoom,
        OperationKind::CreateSubspace,
        OperationKind::AddExistingSubspace,
        OperationKind::CreateDevicesSubspace,
        OperationKind::CreateAppsSubspace,
        OperationKind::CreateServicesSubspace,
        OperationKind::InviteDevice,
        OperationKind::AcceptInvite,
        OperationKind::CreateDeviceSubroom,
        OperationKind::RegisterDeviceAccount,
        OperationKind::SetDisplayName,
    ];

    pub fn tag(&self) -> &'static str {
        match self {
            OperationKind::CreateSpace => "create_space",
            OperationKind::CreateRoom => "create_room",
            OperationKind::CreateSubspace => "create_subspace",
            OperationKind::AddExistingSubspace => "add_existing_subspace",
            OperationKind::CreateDevicesSubspace => "create_devices_subspace",
            OperationKind::CreateAppsSubspace => "create_apps_subspace",
            OperationKind::CreateServicesSubspace => "create_services_subspace",
            OperationKind::InviteDevice => "invite_device",
            OperationKind::AcceptInvite => "accept_invite",
            OperationKind::CreateDeviceSubroom => "create_device_subroom",
            OperationKind::RegisterDeviceAccount => "register_device_account",
            OperationKind::SetDisplayName => "set_display_name",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.tag() == tag)
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.tag())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Pending,
    Done,
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::Done => "done",
            OperationStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(OperationStatus::Pending),
            "done" => Some(OperationStatus::Done),
            "failed" => Some(OperationStatus::Failed),
            _ => None,
        }
    }
}

/// One idempotent side-effecting unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DurableOperation {
    pub id: Uuid,
    /// Creation order, assigned by the store on first insert.
    pub seq: i64,
    pub instance: InstanceRef,
    pub channel_id: Uuid,
    pub kind: OperationKind,
    pub metadata: Metadata,
    pub status: OperationStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub date_created: DateTime<Utc>,
}

impl DurableOperation {
    pub fn new(
        kind: OperationKind,
        instance: InstanceRef,
        channel_id: Uuid,
        metadata: Metadata,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq: 0,
            instance,
            channel_id,
            kind,
            metadata,
            status: OperationStatus::Pending,
            attempts: 0,
            last_error: None,
            date_created: Utc::now(),
        }
    }

    pub fn is_pending(&self) -> bool {
        self.status == OperationStatus::Pending
    }
}

/// A queued local mutation waiting to be pushed on a channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationLogEntry {
    pub id: Uuid,
    pub seq: i64,
    /// Entries sharing a transaction id are flushed as one fixture.
    pub txn_id: Uuid,
    pub channel_id: Uuid,
    pub instance: InstanceRef,
    pub payload: FixtureEntry,
    pub deleted: bool,
    pub date_created: DateTime<Utc>,
}

impl ReplicationLogEntry {
    pub fn new(txn_id: Uuid, channel_id: Uuid, instance: InstanceRef, payload: FixtureEntry) -> Self {
        Self {
            id: Uuid::new_v4(),
            seq: 0,
            txn_id,
            channel_id,
            instance,
            payload,
            deleted: false,
            date_created: Utc::now(),
        }
    }
}

/// A pending materialization step that must be applied before the
/// replication log entry it belongs to is pushed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepresentationLogEntry {
    pub id: Uuid,
    pub seq: i64,
    pub replication_log_id: Uuid,
    pub instance: InstanceRef,
    pub channel_id: Uuid,
    pub kind: OperationKind,
    pub metadata: Metadata,
    pub deleted: bool,
}

impl RepresentationLogEntry {
    /// Turns a planned operation into a representation step tied to `log`.
    pub fn from_operation(log: &ReplicationLogEntry, operation: DurableOperation) -> Self {
        Self {
            id: operation.id,
            seq: 0,
            replication_log_id: log.id,
            instance: operation.instance,
            channel_id: operation.channel_id,
            kind: operation.kind,
            metadata: operation.metadata,
            deleted: false,
        }
    }

    /// The step as a runnable operation.
    pub fn to_operation(&self) -> DurableOperation {
        let mut operation =
            DurableOperation::new(self.kind, self.instance, self.channel_id, self.metadata.clone());
        operation.id = self.id;
        operation.seq = self.seq;
        operation
    }
}

/// Per-device cursor into one queue's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub queue: String,
    pub device_id: Uuid,
    /// `None` means the queue is read from the beginning.
    pub cursor: Option<String>,
    pub date_modified: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(queue: impl Into<String>, device_id: Uuid, cursor: Option<String>) -> Self {
        Self {
            queue: queue.into(),
            device_id,
            cursor,
            date_modified: Utc::now(),
        }
    }
}

/// Account a device uses on one transport endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceCredentials {
    pub device_id: Uuid,
    pub endpoint: String,
    pub account_id: String,
    pub access_token: String,
    pub password: String,
}
