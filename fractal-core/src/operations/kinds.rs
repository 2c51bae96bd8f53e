//! The `(plan, run)` pair of every operation kind, selected by tag.
//!
//! `plan` is pure and may include other kinds' plans. `run` performs the
//! transport calls and returns metadata to merge back. Every `run` looks at
//! existing metadata first and returns early when the resource is already in
//! place, and parent ids are read from the store when the operation runs, not
//! when it is planned.

use rand::Rng;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use crate::context::{Credentials, ReplicationContext};
use crate::error::{ReplicationError, Result, TransportError};
use crate::models::metadata::{APPS_ROOM_ID, DEVICES_ROOM_ID, ROOM_ID, SERVICES_ROOM_ID};
use crate::models::{
    Channel, DeviceCredentials, DurableOperation, Entity, EntityKind, Instance, InstanceKind,
    InstanceRef, Metadata, OperationKind,
};
use crate::representation::{origin_alias, seed_state, HierarchyBuilder, DEVICES_ROOT_STATE};
use crate::store::Store;
use crate::transport::{StateEvent, Transport};

/// Operation metadata keys.
pub const NAME: &str = "name";
pub const METADATA_LABEL: &str = "metadata_label";
pub const CHILD_LABEL: &str = "child_label";
pub const PARENT_LABEL: &str = "parent_label";
pub const DEVICES_ROOT: &str = "devices_root";
pub const DISPLAY_NAME: &str = "display_name";

/// What a successful run changes locally.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunOutput {
    /// Metadata to merge into each referenced instance.
    pub patches: Vec<(InstanceRef, Metadata)>,
    pub credentials: Option<DeviceCredentials>,
}

impl RunOutput {
    fn patch(target: InstanceRef, label: &str, room_id: &str) -> Self {
        Self {
            patches: vec![(target, Metadata::new().with(label, room_id))],
            credentials: None,
        }
    }
}

/// Collaborators available to `run`.
pub struct RunEnv<'a> {
    pub ctx: &'a ReplicationContext,
    pub store: &'a dyn Store,
    pub transport: &'a dyn Transport,
}

impl RunEnv<'_> {
    async fn channel(&self, id: Uuid) -> Result<Channel> {
        self.store
            .channel(id)
            .await?
            .ok_or_else(|| ReplicationError::missing(format!("channel {}", id)))
    }

    fn user_session(&self, channel: &Channel) -> Result<&Credentials> {
        self.ctx.session_for(&channel.endpoint)
    }

    /// Session of a device's own account on the channel's endpoint.
    async fn device_session(&self, device_id: Uuid, channel: &Channel) -> Result<Credentials> {
        let creds = self
            .store
            .device_credentials(device_id, &channel.endpoint)
            .await?
            .ok_or_else(|| {
                ReplicationError::missing(format!(
                    "device {} has no account on {}",
                    device_id, channel.endpoint
                ))
            })?;
        Ok(Credentials::new(
            creds.access_token,
            creds.endpoint,
            creds.account_id,
        ))
    }
}

fn operation(
    kind: OperationKind,
    target: InstanceRef,
    channel: &Channel,
    metadata: Metadata,
) -> DurableOperation {
    DurableOperation::new(kind, target, channel.id, metadata)
}

fn space_op(target: InstanceRef, channel: &Channel, name: &str, label: &str) -> DurableOperation {
    operation(
        OperationKind::CreateSpace,
        target,
        channel,
        Metadata::new().with(NAME, name).with(METADATA_LABEL, label),
    )
}

fn room_op(target: InstanceRef, channel: &Channel, name: &str, label: &str) -> DurableOperation {
    operation(
        OperationKind::CreateRoom,
        target,
        channel,
        Metadata::new().with(NAME, name).with(METADATA_LABEL, label),
    )
}

/// Links `target.metadata[child_label]` under `channel.metadata[parent_label]`.
fn link_op(
    kind: OperationKind,
    target: InstanceRef,
    channel: &Channel,
    child_label: &str,
    parent_label: &str,
) -> DurableOperation {
    operation(
        kind,
        target,
        channel,
        Metadata::new()
            .with(CHILD_LABEL, child_label)
            .with(PARENT_LABEL, parent_label),
    )
}

/// A channel-level namespace space (Devices, Apps, Services) linked under the
/// channel's root space.
fn namespace_subspace(
    kind: OperationKind,
    channel: &Channel,
    name: &str,
    label: &str,
) -> Vec<DurableOperation> {
    let target = InstanceRef::new(InstanceKind::Channel, channel.id);
    let mut create = space_op(target, channel, name, label);
    if kind == OperationKind::CreateDevicesSubspace {
        create.metadata.insert(DEVICES_ROOT, true);
    }
    vec![create, link_op(kind, target, channel, label, ROOM_ID)]
}

fn require_entity<'e>(
    instance: &'e Instance,
    kind: OperationKind,
    accept: impl Fn(EntityKind) -> bool,
) -> Result<&'e Entity> {
    match instance.as_entity() {
        Some(entity) if accept(entity.kind) => Ok(entity),
        _ => Err(ReplicationError::config(format!(
            "{} cannot be planned for {}",
            kind,
            instance.reference()
        ))),
    }
}

/// Plans `kind` for `instance` on `channel`.
pub fn plan(kind: OperationKind, instance: &Instance, channel: &Channel) -> Result<Vec<DurableOperation>> {
    let target = instance.reference();
    match kind {
        OperationKind::CreateSpace => Ok(vec![space_op(target, channel, instance.name(), ROOM_ID)]),
        OperationKind::CreateRoom => Ok(vec![room_op(target, channel, instance.name(), ROOM_ID)]),
        OperationKind::CreateSubspace => {
            let entity = require_entity(instance, kind, |k| k.is_database())?;
            let mut ops = plan(OperationKind::CreateSpace, instance, channel)?;
            ops.push(link_op(
                kind,
                target,
                channel,
                ROOM_ID,
                entity.namespace().metadata_label(),
            ));
            Ok(ops)
        }
        OperationKind::AddExistingSubspace => {
            let entity = require_entity(instance, kind, |k| k.is_database())?;
            Ok(vec![link_op(
                kind,
                target,
                channel,
                ROOM_ID,
                entity.namespace().metadata_label(),
            )])
        }
        OperationKind::CreateDevicesSubspace => {
            Ok(namespace_subspace(kind, channel, "Devices", DEVICES_ROOM_ID))
        }
        OperationKind::CreateAppsSubspace => Ok(namespace_subspace(kind, channel, "Apps", APPS_ROOM_ID)),
        OperationKind::CreateServicesSubspace => {
            Ok(namespace_subspace(kind, channel, "Services", SERVICES_ROOM_ID))
        }
        OperationKind::InviteDevice | OperationKind::AcceptInvite => {
            require_entity(instance, kind, |k| k == EntityKind::DeviceMembership)?;
            Ok(vec![operation(
                kind,
                target,
                channel,
                Metadata::new().with(NAME, instance.name()),
            )])
        }
        OperationKind::CreateDeviceSubroom => {
            let membership = require_entity(instance, kind, |k| k == EntityKind::DeviceMembership)?;
            let room_label = channel.id.to_string();
            let mut ops = plan(OperationKind::InviteDevice, instance, channel)?;
            ops.extend(plan(OperationKind::AcceptInvite, instance, channel)?);
            ops.push(room_op(target, channel, &membership.name, &room_label));
            ops.push(link_op(kind, target, channel, &room_label, DEVICES_ROOM_ID));
            Ok(ops)
        }
        OperationKind::RegisterDeviceAccount => {
            require_entity(instance, kind, |k| k == EntityKind::Device)?;
            let mut ops = vec![operation(
                kind,
                target,
                channel,
                Metadata::new().with(NAME, instance.name()),
            )];
            ops.extend(plan(OperationKind::SetDisplayName, instance, channel)?);
            Ok(ops)
        }
        OperationKind::SetDisplayName => {
            require_entity(instance, kind, |k| k == EntityKind::Device)?;
            Ok(vec![operation(
                kind,
                target,
                channel,
                Metadata::new()
                    .with(NAME, instance.name())
                    .with(DISPLAY_NAME, instance.name()),
            )])
        }
    }
}

fn required<'m>(op: &'m DurableOperation, key: &str) -> Result<&'m str> {
    op.metadata.get_str(key).ok_or_else(|| {
        ReplicationError::config(format!("{} operation {} is missing {}", op.kind, op.id, key))
    })
}

/// Runs one operation against the transport.
pub async fn run(env: &RunEnv<'_>, op: &DurableOperation) -> Result<RunOutput> {
    let channel = env.channel(op.channel_id).await?;
    let instance = env.store.instance(op.instance).await?;

    match op.kind {
        OperationKind::CreateSpace => run_create_space(env, op, &instance, &channel).await,
        OperationKind::CreateRoom => run_create_room(env, op, &instance, &channel).await,
        OperationKind::CreateSubspace
        | OperationKind::AddExistingSubspace
        | OperationKind::CreateDevicesSubspace
        | OperationKind::CreateAppsSubspace
        | OperationKind::CreateDeviceSubroom => run_link(env, op, &instance, &channel).await,
        OperationKind::CreateServicesSubspace => {
            let output = run_link(env, op, &instance, &channel).await?;
            add_members_to_services(env, &channel).await?;
            Ok(output)
        }
        OperationKind::InviteDevice => run_invite_device(env, &instance, &channel).await,
        OperationKind::AcceptInvite => run_accept_invite(env, &instance, &channel).await,
        OperationKind::RegisterDeviceAccount => run_register_device(env, op, &instance, &channel).await,
        OperationKind::SetDisplayName => run_set_display_name(env, op, &instance, &channel).await,
    }
}

async fn run_create_space(
    env: &RunEnv<'_>,
    op: &DurableOperation,
    instance: &Instance,
    channel: &Channel,
) -> Result<RunOutput> {
    let label = required(op, METADATA_LABEL)?;
    if let Some(room_id) = instance.metadata().get_str(label) {
        debug!(room_id, label, "Space already realized");
        return Ok(RunOutput::default());
    }
    let name = required(op, NAME)?;
    let session = env.user_session(channel)?;

    let (owner, subject_id) = match instance {
        Instance::Channel(ch) => {
            let database = env.store.entity(ch.database_id).await?.ok_or_else(|| {
                ReplicationError::missing(format!("database {}", ch.database_id))
            })?;
            (database.to_fixture()?, ch.database_id)
        }
        Instance::Entity(entity) => (entity.to_fixture()?, entity.id),
    };
    let mut state = seed_state(&owner, &channel.to_fixture()?);
    if op.metadata.get_bool(DEVICES_ROOT) == Some(true) {
        state.push(StateEvent::new(
            DEVICES_ROOT_STATE,
            "",
            json!({ "database": channel.database_id }),
        ));
    }
    let alias = (channel.origin && label == ROOM_ID).then(|| origin_alias(&subject_id));

    let room_id = HierarchyBuilder::new(env.transport, session)
        .create_space(name, state, alias)
        .await?;

    let mut output = RunOutput::patch(instance.reference(), label, &room_id);
    if let Instance::Channel(ch) = instance {
        if ch.origin && label == ROOM_ID {
            output.patches.push((
                InstanceRef::new(InstanceKind::Database, ch.database_id),
                Metadata::new().with(ROOM_ID, room_id),
            ));
        }
    }
    Ok(output)
}

async fn run_create_room(
    env: &RunEnv<'_>,
    op: &DurableOperation,
    instance: &Instance,
    channel: &Channel,
) -> Result<RunOutput> {
    let label = required(op, METADATA_LABEL)?;
    if let Some(room_id) = instance.metadata().get_str(label) {
        debug!(room_id, label, "Room already realized");
        return Ok(RunOutput::default());
    }
    let name = required(op, NAME)?;
    let session = env.user_session(channel)?;

    // A device's room is shared with the device's own account.
    let member = match instance.as_entity() {
        Some(entity) if entity.kind == EntityKind::DeviceMembership => {
            let device_id = entity.device_id.ok_or_else(|| {
                ReplicationError::config(format!("membership {} has no device", entity.id))
            })?;
            Some(env.device_session(device_id, channel).await?)
        }
        _ => None,
    };
    let invites = member.iter().map(|m| m.identity.clone()).collect();

    let room_id = HierarchyBuilder::new(env.transport, session)
        .create_room(name, invites)
        .await?;
    if let Some(member) = &member {
        HierarchyBuilder::new(env.transport, member)
            .join(&room_id)
            .await?;
    }
    Ok(RunOutput::patch(instance.reference(), label, &room_id))
}

async fn run_link(
    env: &RunEnv<'_>,
    op: &DurableOperation,
    instance: &Instance,
    channel: &Channel,
) -> Result<RunOutput> {
    let child_label = required(op, CHILD_LABEL)?;
    let parent_label = required(op, PARENT_LABEL)?;
    let child = instance.metadata().get_str(child_label).ok_or_else(|| {
        ReplicationError::missing(format!("{} has no {}", instance.reference(), child_label))
    })?;
    let parent = channel.metadata.get_str(parent_label).ok_or_else(|| {
        ReplicationError::missing(format!("channel {} has no {}", channel.id, parent_label))
    })?;
    let session = env.user_session(channel)?;

    HierarchyBuilder::new(env.transport, session)
        .link_child(parent, child)
        .await?;
    Ok(RunOutput::default())
}

/// Invites every member device with an account on the endpoint into the
/// Services subspace and joins it on the device's behalf.
async fn add_members_to_services(env: &RunEnv<'_>, channel: &Channel) -> Result<()> {
    let Some(services) = channel.metadata.get_str(SERVICES_ROOM_ID) else {
        return Err(ReplicationError::missing(format!(
            "channel {} has no {}",
            channel.id, SERVICES_ROOM_ID
        )));
    };
    let session = env.user_session(channel)?;
    let memberships = env
        .store
        .children(channel.database_id, EntityKind::DeviceMembership)
        .await?;

    for membership in memberships {
        let Some(device_id) = membership.device_id else {
            continue;
        };
        let device = match env.device_session(device_id, channel).await {
            Ok(device) => device,
            Err(ReplicationError::MissingPrerequisite(reason)) => {
                debug!(reason = %reason, "Skipping device without account");
                continue;
            }
            Err(e) => return Err(e),
        };
        HierarchyBuilder::new(env.transport, session)
            .invite(services, &device.identity)
            .await?;
        HierarchyBuilder::new(env.transport, &device)
            .join(services)
            .await?;
    }
    Ok(())
}

fn membership_device(instance: &Instance) -> Result<Uuid> {
    instance
        .as_entity()
        .and_then(|entity| entity.device_id)
        .ok_or_else(|| ReplicationError::config(format!("{} has no device", instance.reference())))
}

fn devices_room(channel: &Channel) -> Result<&str> {
    channel.devices_room_id().ok_or_else(|| {
        ReplicationError::missing(format!("channel {} has no {}", channel.id, DEVICES_ROOM_ID))
    })
}

async fn run_invite_device(env: &RunEnv<'_>, instance: &Instance, channel: &Channel) -> Result<RunOutput> {
    let device = env.device_session(membership_device(instance)?, channel).await?;
    let room_id = devices_room(channel)?;
    let session = env.user_session(channel)?;

    HierarchyBuilder::new(env.transport, session)
        .invite(room_id, &device.identity)
        .await?;
    Ok(RunOutput::default())
}

async fn run_accept_invite(env: &RunEnv<'_>, instance: &Instance, channel: &Channel) -> Result<RunOutput> {
    let device = env.device_session(membership_device(instance)?, channel).await?;
    let room_id = devices_room(channel)?;

    HierarchyBuilder::new(env.transport, &device)
        .join(room_id)
        .await?;
    Ok(RunOutput::default())
}

/// Account local part for a device name.
pub fn device_username(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

fn random_password() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill(&mut bytes);
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

async fn run_register_device(
    env: &RunEnv<'_>,
    op: &DurableOperation,
    instance: &Instance,
    channel: &Channel,
) -> Result<RunOutput> {
    let device = require_entity(instance, op.kind, |k| k == EntityKind::Device)?;
    if env
        .store
        .device_credentials(device.id, &channel.endpoint)
        .await?
        .is_some()
    {
        debug!(device = %device.name, endpoint = %channel.endpoint, "Device account already registered");
        return Ok(RunOutput::default());
    }
    let name = required(op, NAME)?;
    let session = env.user_session(channel)?;
    let password = random_password();

    let creds = match env
        .transport
        .register_account(session, &device_username(name), &password)
        .await
    {
        Ok(creds) => creds,
        Err(TransportError::AlreadyExists(account)) => {
            return Err(ReplicationError::config(format!(
                "account {} exists but its credentials are not stored",
                account
            )))
        }
        Err(e) => return Err(e.into()),
    };
    info!(device = %device.name, account = %creds.identity, "Registered device account");

    Ok(RunOutput {
        patches: Vec::new(),
        credentials: Some(DeviceCredentials {
            device_id: device.id,
            endpoint: channel.endpoint.clone(),
            account_id: creds.identity,
            access_token: creds.access_token,
            password,
        }),
    })
}

/// `"<owner>'s <name>"` when the owner's account id is known.
pub fn display_name_for(name: &str, owner_id: Option<&str>) -> String {
    let owner = owner_id.and_then(|id| {
        id.trim_start_matches('@')
            .split(':')
            .next()
            .filter(|local| !local.is_empty())
    });
    match owner {
        Some(owner) => format!("{}'s {}", owner, name),
        None => name.to_string(),
    }
}

async fn run_set_display_name(
    env: &RunEnv<'_>,
    op: &DurableOperation,
    instance: &Instance,
    channel: &Channel,
) -> Result<RunOutput> {
    let device = require_entity(instance, op.kind, |k| k == EntityKind::Device)?;
    let name = op
        .metadata
        .get_str(DISPLAY_NAME)
        .unwrap_or(device.name.as_str());
    let display_name = display_name_for(name, device.owner_id.as_deref());
    let session = env.device_session(device.id, channel).await?;

    env.transport
        .set_display_name(&session, &display_name)
        .await?;
    Ok(RunOutput::default())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(ops: &[DurableOperation]) -> Vec<OperationKind> {
        ops.iter().map(|op| op.kind).collect()
    }

    #[test]
    fn test_create_subspace_is_space_plus_link() {
        let db = Entity::database("Home");
        let app = Entity::app("Photos", &db);
        let channel = Channel::new(db.id, "http://a").with_origin(true);

        let ops = plan(OperationKind::CreateSubspace, &app.clone().into(), &channel).unwrap();

        assert_eq!(
            kinds(&ops),
            vec![OperationKind::CreateSpace, OperationKind::CreateSubspace]
        );
        assert_eq!(ops[1].metadata.get_str(PARENT_LABEL), Some(APPS_ROOM_ID));
        assert!(ops.iter().all(|op| op.instance.id == app.id));
    }

    #[test]
    fn test_add_existing_picks_namespace_from_type_tags() {
        let db = Entity::database("Home");
        let channel = Channel::new(db.id, "http://b");

        let cases = [
            (db.clone(), ROOM_ID),
            (Entity::service("Sync", &db), SERVICES_ROOM_ID),
            (Entity::app("Photos", &db), APPS_ROOM_ID),
        ];
        for (entity, label) in cases {
            let ops = plan(OperationKind::AddExistingSubspace, &entity.into(), &channel).unwrap();
            assert_eq!(kinds(&ops), vec![OperationKind::AddExistingSubspace]);
            assert_eq!(ops[0].metadata.get_str(PARENT_LABEL), Some(label));
            assert_eq!(ops[0].metadata.get_str(CHILD_LABEL), Some(ROOM_ID));
        }
    }

    #[test]
    fn test_device_subroom_plan_order() {
        let db = Entity::database("Home");
        let device = Entity::device("Laptop");
        let membership = Entity::membership(&device, &db);
        let channel = Channel::new(db.id, "http://a");

        let ops = plan(OperationKind::CreateDeviceSubroom, &membership.into(), &channel).unwrap();

        assert_eq!(
            kinds(&ops),
            vec![
                OperationKind::InviteDevice,
                OperationKind::AcceptInvite,
                OperationKind::CreateRoom,
                OperationKind::CreateDeviceSubroom,
            ]
        );
        let label = channel.id.to_string();
        assert_eq!(ops[2].metadata.get_str(METADATA_LABEL), Some(label.as_str()));
        assert_eq!(ops[3].metadata.get_str(PARENT_LABEL), Some(DEVICES_ROOM_ID));
    }

    #[test]
    fn test_devices_subspace_targets_channel_and_is_tagged() {
        let db = Entity::database("Home");
        let channel = Channel::new(db.id, "http://a");

        let ops = plan(OperationKind::CreateDevicesSubspace, &db.into(), &channel).unwrap();

        assert_eq!(ops.len(), 2);
        assert!(ops
            .iter()
            .all(|op| op.instance == InstanceRef::new(InstanceKind::Channel, channel.id)));
        assert_eq!(ops[0].metadata.get_bool(DEVICES_ROOT), Some(true));
        assert_eq!(ops[1].metadata.get_str(CHILD_LABEL), Some(DEVICES_ROOM_ID));
    }

    #[test]
    fn test_register_plan_includes_display_name() {
        let device = Entity::device("Laptop");
        let channel = Channel::new(uuid::Uuid::new_v4(), "http://a");
        let ops = plan(OperationKind::RegisterDeviceAccount, &device.into(), &channel).unwrap();
        assert_eq!(
            kinds(&ops),
            vec![OperationKind::RegisterDeviceAccount, OperationKind::SetDisplayName]
        );
    }

    #[test]
    fn test_plan_rejects_wrong_instance_kind() {
        let db = Entity::database("Home");
        let channel = Channel::new(db.id, "http://a");
        let err = plan(OperationKind::InviteDevice, &db.into(), &channel).unwrap_err();
        assert!(matches!(err, ReplicationError::Configuration(_)));
    }

    #[test]
    fn test_display_name_uses_owner_local_part() {
        assert_eq!(display_name_for("Laptop", Some("@alice:localhost")), "alice's Laptop");
        assert_eq!(display_name_for("Laptop", None), "Laptop");
    }

    #[test]
    fn test_device_username_is_lowercase() {
        assert_eq!(device_username("My Laptop"), "my_laptop");
        assert_eq!(device_username("pi-4.B"), "pi-4.b");
    }
}
