//! Plans for whole entities: a database with its devices, a nested app or
//! service, a single device membership.

use crate::error::{ReplicationError, Result};
use crate::models::{Channel, DurableOperation, Entity, EntityKind, Instance, OperationKind};
use crate::store::Store;

use super::kinds::plan;

/// A device membership together with its device.
#[derive(Debug, Clone)]
pub struct Member {
    pub membership: Entity,
    pub device: Entity,
}

impl Member {
    pub fn new(membership: Entity, device: Entity) -> Self {
        Self { membership, device }
    }
}

/// Loads every member of a database.
pub async fn load_members(store: &dyn Store, database_id: uuid::Uuid) -> Result<Vec<Member>> {
    let memberships = store
        .children(database_id, EntityKind::DeviceMembership)
        .await?;
    let mut members = Vec::with_capacity(memberships.len());
    for membership in memberships {
        let Some(device_id) = membership.device_id else {
            continue;
        };
        if let Some(device) = store.entity(device_id).await? {
            members.push(Member::new(membership, device));
        }
    }
    Ok(members)
}

/// Operations realizing a root database on `channel`.
///
/// Root space, Devices subspace, an account and a room per member device,
/// Apps and Services subspaces. On any channel other than the origin the
/// database's existing space is then linked under the new root.
pub fn plan_database(
    database: &Entity,
    channel: &Channel,
    members: &[Member],
) -> Result<Vec<DurableOperation>> {
    if database.kind != EntityKind::Database {
        return Err(ReplicationError::config(format!(
            "{} is not a root database",
            database
        )));
    }
    if channel.database_id != database.id {
        return Err(ReplicationError::config(format!(
            "channel {} does not belong to {}",
            channel.id, database
        )));
    }

    let channel_instance = Instance::Channel(channel.clone());
    let database_instance = Instance::Entity(database.clone());

    let mut ops = plan(OperationKind::CreateSpace, &channel_instance, channel)?;
    // The root space is named after the database, not the channel.
    if let Some(create) = ops.first_mut() {
        create.metadata.insert(super::kinds::NAME, database.name.clone());
    }
    ops.extend(plan(OperationKind::CreateDevicesSubspace, &database_instance, channel)?);
    for member in members {
        ops.extend(plan_device_membership(member, channel)?);
    }
    ops.extend(plan(OperationKind::CreateAppsSubspace, &database_instance, channel)?);
    ops.extend(plan(OperationKind::CreateServicesSubspace, &database_instance, channel)?);
    if !channel.origin {
        ops.extend(plan(OperationKind::AddExistingSubspace, &database_instance, channel)?);
    }
    Ok(ops)
}

/// Operations placing an app or service on `channel`: a fresh space on the
/// origin, a link to the existing one anywhere else.
pub fn plan_nested_database(entity: &Entity, channel: &Channel) -> Result<Vec<DurableOperation>> {
    if !matches!(entity.kind, EntityKind::App | EntityKind::Service) {
        return Err(ReplicationError::config(format!(
            "{} is not an app or service",
            entity
        )));
    }
    let kind = if channel.origin {
        OperationKind::CreateSubspace
    } else {
        OperationKind::AddExistingSubspace
    };
    plan(kind, &Instance::Entity(entity.clone()), channel)
}

/// Operations giving a member device an account and a room on `channel`.
pub fn plan_device_membership(member: &Member, channel: &Channel) -> Result<Vec<DurableOperation>> {
    let mut ops = plan(
        OperationKind::RegisterDeviceAccount,
        &Instance::Entity(member.device.clone()),
        channel,
    )?;
    ops.extend(plan(
        OperationKind::CreateDeviceSubroom,
        &Instance::Entity(member.membership.clone()),
        channel,
    )?);
    Ok(ops)
}

/// Operations needed when `entity` first appears on `channel`. Root
/// databases are planned when their channels are added; devices travel with
/// their memberships.
pub async fn plan_first_appearance(
    store: &dyn Store,
    entity: &Entity,
    channel: &Channel,
) -> Result<Vec<DurableOperation>> {
    match entity.kind {
        EntityKind::App | EntityKind::Service => plan_nested_database(entity, channel),
        EntityKind::DeviceMembership => {
            let Some(device_id) = entity.device_id else {
                return Err(ReplicationError::config(format!("{} has no device", entity)));
            };
            let device = store
                .entity(device_id)
                .await?
                .ok_or_else(|| ReplicationError::missing(format!("device {}", device_id)))?;
            plan_device_membership(&Member::new(entity.clone(), device), channel)
        }
        EntityKind::Database | EntityKind::Device => Ok(Vec::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::metadata::ROOM_ID;
    use crate::models::InstanceKind;
    use crate::operations::kinds::{NAME, PARENT_LABEL};

    fn setup() -> (Entity, Member) {
        let db = Entity::database("Home");
        let device = Entity::device("Laptop");
        let membership = Entity::membership(&device, &db);
        (db, Member::new(membership, device))
    }

    #[test]
    fn test_origin_plan_has_no_link_existing() {
        let (db, member) = setup();
        let origin = Channel::new(db.id, "http://a").with_origin(true);

        let ops = plan_database(&db, &origin, &[member]).unwrap();
        let kinds: Vec<_> = ops.iter().map(|op| op.kind).collect();

        assert_eq!(kinds[0], OperationKind::CreateSpace);
        assert_eq!(ops[0].instance.kind, InstanceKind::Channel);
        assert_eq!(ops[0].metadata.get_str(NAME), Some("Home"));
        assert!(kinds.contains(&OperationKind::CreateDevicesSubspace));
        assert!(kinds.contains(&OperationKind::RegisterDeviceAccount));
        assert!(kinds.contains(&OperationKind::CreateDeviceSubroom));
        assert!(kinds.contains(&OperationKind::CreateAppsSubspace));
        assert!(kinds.contains(&OperationKind::CreateServicesSubspace));
        assert!(!kinds.contains(&OperationKind::AddExistingSubspace));
    }

    #[test]
    fn test_second_channel_links_existing_exactly_once() {
        let (db, member) = setup();
        let second = Channel::new(db.id, "http://b");

        let ops = plan_database(&db, &second, &[member]).unwrap();
        let links: Vec<_> = ops
            .iter()
            .filter(|op| op.kind == OperationKind::AddExistingSubspace)
            .collect();

        assert_eq!(links.len(), 1);
        assert_eq!(links[0].instance.id, db.id);
        assert_eq!(links[0].metadata.get_str(PARENT_LABEL), Some(ROOM_ID));
        assert_eq!(ops.last().map(|op| op.kind), Some(OperationKind::AddExistingSubspace));
    }

    #[test]
    fn test_device_ops_come_after_devices_subspace() {
        let (db, member) = setup();
        let origin = Channel::new(db.id, "http://a").with_origin(true);

        let ops = plan_database(&db, &origin, &[member]).unwrap();
        let position = |kind| ops.iter().position(|op| op.kind == kind).unwrap();

        assert!(position(OperationKind::CreateDevicesSubspace) < position(OperationKind::RegisterDeviceAccount));
        assert!(position(OperationKind::RegisterDeviceAccount) < position(OperationKind::InviteDevice));
        assert!(position(OperationKind::InviteDevice) < position(OperationKind::CreateDeviceSubroom));
    }

    #[test]
    fn test_nested_database_depends_on_origin() {
        let (db, _) = setup();
        let app = Entity::app("Photos", &db);
        let origin = Channel::new(db.id, "http://a").with_origin(true);
        let second = Channel::new(db.id, "http://b");

        let on_origin: Vec<_> = plan_nested_database(&app, &origin)
            .unwrap()
            .into_iter()
            .map(|op| op.kind)
            .collect();
        assert_eq!(on_origin, vec![OperationKind::CreateSpace, OperationKind::CreateSubspace]);

        let elsewhere: Vec<_> = plan_nested_database(&app, &second)
            .unwrap()
            .into_iter()
            .map(|op| op.kind)
            .collect();
        assert_eq!(elsewhere, vec![OperationKind::AddExistingSubspace]);
    }

    #[test]
    fn test_plan_database_rejects_foreign_channel() {
        let (db, _) = setup();
        let other = Channel::new(uuid::Uuid::new_v4(), "http://a");
        assert!(matches!(
            plan_database(&db, &other, &[]),
            Err(ReplicationError::Configuration(_))
        ));
    }
}
