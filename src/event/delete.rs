use super::{DeleteEvent, DeleteEventListener, snapshot_of_row};
use crate::action::{Action, ActionData, ActionId};
use crate::completion::CompletionHandle;
use crate::context::{EntityEntry, EntityStatus};
use crate::core::{EntityKey, PersistError, Result, Value};
use crate::metamodel::{AssociationKind, EntityDescriptor, EntityRef};
use crate::session::SessionCore;
use std::sync::Arc;
use tracing::{Level, event};

/// Schedules deletes.
///
/// The entry is marked `Deleted` before any round trip. One-to-many children
/// with remove cascade are deleted first, many-to-one targets with remove
/// cascade after this entity's delete succeeded.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultDeleteEventListener;

impl DeleteEventListener for DefaultDeleteEventListener {
    fn on_delete(&self, core: &mut SessionCore, event: &mut DeleteEvent) -> CompletionHandle<()> {
        match delete(core, event) {
            Ok(handle) => handle,
            Err(err) => {
                event!(Level::DEBUG, error = %err, "delete rejected");
                CompletionHandle::failed(err)
            }
        }
    }
}

fn delete(core: &mut SessionCore, event: &mut DeleteEvent) -> Result<CompletionHandle<()>> {
    let descriptor = core.metamodel().descriptor_of(event.entity.as_entity())?;
    let id = event
        .entity
        .identifier()
        .filter(|id| !id.is_null())
        .ok_or_else(|| PersistError::TransientObject {
            entity: descriptor.entity_name().to_string(),
            message: "cannot remove an instance without identifier".to_string(),
        })?;
    descriptor.check_identifier(&id)?;
    let key = descriptor.key(id.clone());

    if event.ancestors.contains(&key) {
        return Ok(CompletionHandle::completed(()));
    }

    match core.context().status(&key) {
        Some(EntityStatus::Deleted) => Ok(CompletionHandle::completed(())),
        Some(EntityStatus::Saving) | Some(EntityStatus::Managed) => {
            schedule_delete(core, event, &descriptor, key)
        }
        None => Ok(delete_detached(core, event, descriptor, key, id)),
    }
}

/// The key is not managed: look for the row, reassociate it and delete it.
fn delete_detached(
    core: &mut SessionCore,
    event: &mut DeleteEvent,
    descriptor: Arc<EntityDescriptor>,
    key: EntityKey,
    id: Value,
) -> CompletionHandle<()> {
    event.deferred = true;
    let executor = core.executor();
    let lookup_descriptor = Arc::clone(&descriptor);
    let lookup = CompletionHandle::from_future(async move {
        executor.load(&lookup_descriptor, &id).await
    });

    let entity = event.entity.clone();
    let ancestors = event.ancestors.clone();
    let cascading = event.cascading;
    core.resume_after(lookup, "remove", move |core, result| {
        let row = match result {
            Ok(Some(row)) => row,
            Ok(None) => return CompletionHandle::completed(()),
            Err(err) => return CompletionHandle::failed(err),
        };

        let mut retry = DeleteEvent {
            cascading,
            ..DeleteEvent::cascaded(entity, ancestors)
        };
        if !core.context().contains(&key) {
            let (loaded_state, version) = snapshot_of_row(&descriptor, &row);
            let entry = EntityEntry::new(
                Arc::clone(&descriptor),
                Some(key.id().clone()),
                EntityStatus::Managed,
                retry.entity.as_entity().clone_boxed(),
                loaded_state,
                version,
            );
            core.context_mut().add_entry(key.clone(), entry);
        }
        let handle = core.fire_delete(&mut retry);
        CompletionHandle::all(vec![handle, core.flush_if_auto()])
    })
}

/// Everything needed to enqueue the delete of one managed entry.
struct DeletePlan {
    descriptor: Arc<EntityDescriptor>,
    key: EntityKey,
    generation: u64,
    deleted_state: Vec<Value>,
    version: Option<i64>,
    insert_action: Option<ActionId>,
}

fn schedule_delete(
    core: &mut SessionCore,
    event: &mut DeleteEvent,
    descriptor: &Arc<EntityDescriptor>,
    key: EntityKey,
) -> Result<CompletionHandle<()>> {
    let entry = core.context_mut().get_mut(&key).ok_or_else(|| {
        PersistError::IllegalState(format!("{} vanished while scheduling its delete", key))
    })?;
    let deleted_state = descriptor.column_values(&*entry.instance)?;
    entry.status = EntityStatus::Deleted;
    entry.deleted_state = Some(deleted_state.clone());
    let plan = DeletePlan {
        descriptor: Arc::clone(descriptor),
        key: key.clone(),
        generation: entry.generation(),
        deleted_state,
        version: entry.version,
        insert_action: entry.insert_action,
    };

    let mut ancestors = event.ancestors.clone();
    ancestors.push(key);

    let (children, owners) = cascade_targets(descriptor, &event.entity);
    let mut child_handles = Vec::new();
    let mut scheduled = Vec::new();
    let mut deferred = false;
    for child in children {
        let mut child_event = DeleteEvent::cascaded(child, ancestors.clone());
        child_handles.push(core.fire_delete(&mut child_event));
        scheduled.extend(child_event.scheduled_action);
        deferred |= child_event.deferred;
    }

    let own = if deferred {
        // Children still wait for their rows; queue the parent once they are done.
        event.deferred = true;
        let waiting = CompletionHandle::all(child_handles);
        core.resume_after(waiting, "remove cascade", move |core, result| {
            if let Err(err) = result {
                revert_delete(core, &plan.key, plan.generation);
                return CompletionHandle::failed(err);
            }
            let still_deleted = core
                .context_mut()
                .get_current(&plan.key, plan.generation)
                .is_some_and(|entry| entry.is_deleted());
            if !still_deleted {
                return CompletionHandle::completed(());
            }
            match enqueue_delete(core, plan, Vec::new()) {
                Ok((_, handle)) => CompletionHandle::all(vec![handle, core.flush_if_auto()]),
                Err(err) => CompletionHandle::failed(err),
            }
        })
    } else {
        let (action_id, handle) = enqueue_delete(core, plan, scheduled)?;
        event.scheduled_action = Some(action_id);
        child_handles.push(handle);
        CompletionHandle::all(child_handles)
    };

    Ok(cascade_to_owners(core, own, owners, ancestors))
}

/// `(one-to-many children, many-to-one targets)` reached through remove cascades.
fn cascade_targets(descriptor: &EntityDescriptor, entity: &EntityRef) -> (Vec<EntityRef>, Vec<EntityRef>) {
    let mut children = Vec::new();
    let mut owners = Vec::new();
    for association in descriptor.associations() {
        if !association.cascade.includes_remove() {
            continue;
        }
        let related = entity.as_entity().related(&association.name);
        match association.kind {
            AssociationKind::OneToMany { .. } => children.extend(related),
            AssociationKind::ManyToOne { .. } => owners.extend(related),
        }
    }
    (children, owners)
}

fn enqueue_delete(
    core: &mut SessionCore,
    plan: DeletePlan,
    depends_on: Vec<ActionId>,
) -> Result<(ActionId, CompletionHandle<()>)> {
    let action_id = core.queue_mut().next_action_id();
    let (mut action, handle) = Action::new(
        action_id,
        Arc::clone(&plan.descriptor),
        ActionData::Delete {
            id: plan.key.id().clone(),
            deleted_state: plan.deleted_state,
            version: plan.version,
        },
    );
    for dependency in depends_on {
        action.depends_on(dependency);
    }
    if let Some(insert) = plan.insert_action {
        if core.queue().contains(insert) {
            action.depends_on(insert);
        }
    }

    let key = plan.key.clone();
    let generation = plan.generation;
    action.on_settled(move |core, result| match result {
        Ok(_) => {
            let removed = core
                .context_mut()
                .get(&key)
                .is_some_and(|entry| entry.generation() == generation && entry.is_deleted());
            if removed {
                core.context_mut().remove_current(&key, generation);
            }
            core.statistics().record_delete();
        }
        Err(err) => {
            event!(Level::DEBUG, key = %key, error = %err, "delete failed, entity stays managed");
            revert_delete(core, &key, generation);
        }
    });

    if let Err(err) = core.queue_mut().add_action(action) {
        revert_delete(core, &plan.key, plan.generation);
        return Err(err);
    }
    event!(
        Level::DEBUG,
        entity = %plan.descriptor.entity_name(),
        action = %action_id,
        "delete scheduled"
    );
    Ok((action_id, handle.map(|_| ())))
}

fn revert_delete(core: &mut SessionCore, key: &EntityKey, generation: u64) {
    if let Some(entry) = core.context_mut().get_current(key, generation) {
        if entry.is_deleted() {
            entry.status = EntityStatus::Managed;
            entry.deleted_state = None;
        }
    }
}

/// Deletes many-to-one targets once `own` succeeded.
fn cascade_to_owners(
    core: &mut SessionCore,
    own: CompletionHandle<()>,
    owners: Vec<EntityRef>,
    ancestors: Vec<EntityKey>,
) -> CompletionHandle<()> {
    if owners.is_empty() {
        return own;
    }
    core.resume_after(own, "remove cascade", move |core, result| {
        if let Err(err) = result {
            return CompletionHandle::failed(err);
        }
        let mut handles: Vec<CompletionHandle<()>> = owners
            .into_iter()
            .map(|owner| core.fire_delete(&mut DeleteEvent::cascaded(owner, ancestors.clone())))
            .collect();
        handles.push(core.flush_if_auto());
        CompletionHandle::all(handles)
    })
}
