use super::{PersistEvent, PersistEventListener};
use crate::action::{Action, ActionData, ActionId, ActionOutcome};
use crate::completion::CompletionHandle;
use crate::context::{EntityEntry, EntityStatus};
use crate::core::{EntityKey, PersistError, Result, Value};
use crate::metamodel::{AssociationKind, EntityDescriptor, GeneratedId};
use crate::session::SessionCore;
use std::sync::Arc;
use tracing::{Level, event};

/// Schedules the insert of a transient entity and cascades along persist
/// associations: many-to-one targets before the insert, one-to-many children
/// after it succeeded.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultPersistEventListener;

impl PersistEventListener for DefaultPersistEventListener {
    fn on_persist(&self, core: &mut SessionCore, event: &mut PersistEvent) -> CompletionHandle<()> {
        match persist(core, event) {
            Ok(handle) => handle,
            Err(err) => {
                event!(Level::DEBUG, error = %err, "persist rejected");
                CompletionHandle::failed(err)
            }
        }
    }
}

fn persist(core: &mut SessionCore, event: &mut PersistEvent) -> Result<CompletionHandle<()>> {
    let descriptor = core.metamodel().descriptor_of(event.entity.as_entity())?;

    let generated = match event.entity.identifier() {
        Some(id) if !id.is_null() => GeneratedId::Value(id),
        _ => descriptor
            .id_strategy()
            .generate(descriptor.entity_name(), event.entity.as_entity())?,
    };

    let id = match generated {
        GeneratedId::ShortCircuit => return Ok(CompletionHandle::completed(())),
        GeneratedId::Pending => None,
        GeneratedId::Value(id) => {
            descriptor.check_identifier(&id)?;
            event.entity.set_identifier(id.clone());
            Some(id)
        }
    };
    let key = id.clone().map(|id| descriptor.key(id));

    if let Some(key) = &key {
        if event.ancestors.contains(key) {
            return Ok(CompletionHandle::completed(()));
        }
        match core.context().status(key) {
            Some(EntityStatus::Saving) | Some(EntityStatus::Managed) => {
                if event.cascading {
                    return Ok(CompletionHandle::completed(()));
                }
                return Err(PersistError::DuplicateEntity {
                    entity: descriptor.entity_name().to_string(),
                    id: key.id().to_string(),
                });
            }
            Some(EntityStatus::Deleted) => return Ok(persist_after_delete(core, event)),
            None => {}
        }
    }

    let mut ancestors = event.ancestors.clone();
    ancestors.extend(key.clone());

    let mut handles = Vec::new();
    let targets = cascade_to_owners(core, event, &descriptor, &ancestors, &mut handles)?;

    let values = descriptor.column_values(event.entity.as_entity())?;
    let version = descriptor.is_versioned().then_some(0);

    let action_id = core.queue_mut().next_action_id();
    let (mut action, action_handle) = Action::new(
        action_id,
        Arc::clone(&descriptor),
        ActionData::Insert {
            id: id.clone(),
            values: values.clone(),
            version,
        },
    );
    for dependency in targets.dependencies {
        action.depends_on(dependency);
    }
    for (column, source) in targets.patches {
        action.patch_foreign_key(column, source);
    }

    let mut entry = EntityEntry::new(
        Arc::clone(&descriptor),
        id.clone(),
        EntityStatus::Saving,
        event.entity.as_entity().clone_boxed(),
        values,
        version,
    );
    entry.insert_action = Some(action_id);

    match &key {
        Some(key) => {
            let generation = core.context_mut().add_entry(key.clone(), entry);
            let key = key.clone();
            action.on_settled(move |core, result| settle_insert(core, &key, generation, result));
        }
        None => {
            core.context_mut().add_delayed(action_id, entry);
            let (completer, generated_id) = CompletionHandle::pending("generated identifier");
            event.generated_identifier = Some(generated_id);
            let entity_name = descriptor.entity_name().to_string();
            action.on_settled(move |core, result| {
                match result {
                    Ok(outcome) => match &outcome.generated_id {
                        Some(generated) => {
                            if let Some(entry) = core.context_mut().delayed_mut(action_id) {
                                apply_patches(entry, outcome);
                            }
                            core.context_mut().resolve_delayed(action_id, generated.clone());
                            core.statistics().record_insert();
                            completer.complete(generated.clone());
                        }
                        None => {
                            core.context_mut().discard_delayed(action_id);
                            completer.fail(PersistError::IdentifierGeneration {
                                entity: entity_name,
                                message: "insert returned no identifier".to_string(),
                            });
                        }
                    },
                    Err(err) => {
                        core.context_mut().discard_delayed(action_id);
                        completer.fail(err.clone());
                    }
                }
            });
        }
    }

    if let Err(err) = core.queue_mut().add_action(action) {
        match &key {
            Some(key) => {
                core.context_mut().remove(key);
            }
            None => {
                core.context_mut().discard_delayed(action_id);
            }
        }
        return Err(err);
    }
    event.insert_action = Some(action_id);
    event!(
        Level::DEBUG,
        entity = %descriptor.entity_name(),
        action = %action_id,
        "insert scheduled"
    );

    handles.push(cascade_to_children(
        core,
        event,
        &descriptor,
        key.map(|key| key.id().clone()),
        ancestors,
        action_handle,
    ));
    Ok(CompletionHandle::all(handles))
}

/// The key still has a delete in the queue or in flight; persist again once
/// a flush settled it.
fn persist_after_delete(core: &mut SessionCore, event: &PersistEvent) -> CompletionHandle<()> {
    let entity = event.entity.clone();
    let ancestors = event.ancestors.clone();
    let cascading = event.cascading;
    let flush = core.flush();
    core.resume_after(flush, "persist", move |core, result| {
        if let Err(err) = result {
            return CompletionHandle::failed(err);
        }
        let mut retry = PersistEvent {
            cascading,
            ..PersistEvent::cascaded(entity, ancestors)
        };
        let handle = core.fire_persist(&mut retry);
        CompletionHandle::all(vec![handle, core.flush_if_auto()])
    })
}

#[derive(Default)]
struct OwnerLinks {
    dependencies: Vec<ActionId>,
    /// `(column index, insert generating the value)`
    patches: Vec<(usize, ActionId)>,
}

/// Resolves the foreign keys of many-to-one associations, persisting
/// targets first where the association cascades persist.
fn cascade_to_owners(
    core: &mut SessionCore,
    event: &mut PersistEvent,
    descriptor: &EntityDescriptor,
    ancestors: &[EntityKey],
    handles: &mut Vec<CompletionHandle<()>>,
) -> Result<OwnerLinks> {
    let mut links = OwnerLinks::default();

    for association in descriptor.associations() {
        let AssociationKind::ManyToOne { fk_column } = &association.kind else {
            continue;
        };
        let Some(column) = descriptor.foreign_key_index(association) else {
            continue;
        };
        let Some(target) = event.entity.as_entity().related(&association.name).into_iter().next()
        else {
            continue;
        };
        let current = event
            .entity
            .as_entity()
            .column_pairs()
            .get(column)
            .map(|(_, value)| value.clone())
            .unwrap_or(Value::Null);
        if !current.is_null() {
            continue;
        }

        if association.cascade.includes_persist() {
            let mut owner_event = PersistEvent::cascaded(target, ancestors.to_vec());
            handles.push(core.fire_persist(&mut owner_event));

            if let Some(insert) = owner_event.insert_action {
                links.dependencies.push(insert);
            }
            match owner_event.entity.identifier().filter(|id| !id.is_null()) {
                Some(id) => {
                    event.entity.as_entity_mut().assign_column(fk_column, id)?;
                }
                None => {
                    let ticket = owner_event.insert_action.ok_or_else(|| {
                        PersistError::TransientObject {
                            entity: association.target.clone(),
                            message: format!(
                                "'{}.{}' references an instance that was not persisted",
                                descriptor.entity_name(),
                                association.name
                            ),
                        }
                    })?;
                    if !core.queue().contains(ticket) {
                        return Err(illegal_in_flight(descriptor, &association.name));
                    }
                    links.patches.push((column, ticket));
                }
            }
        } else {
            let target_descriptor = core.metamodel().descriptor_of(target.as_entity())?;
            let id = target.identifier().filter(|id| !id.is_null()).ok_or_else(|| {
                PersistError::TransientObject {
                    entity: target_descriptor.entity_name().to_string(),
                    message: format!(
                        "'{}.{}' references an unsaved transient instance",
                        descriptor.entity_name(),
                        association.name
                    ),
                }
            })?;
            let target_key = target_descriptor.key(id.clone());
            if let Some(entry) = core.context().get(&target_key) {
                if let Some(insert) = entry.insert_action {
                    if core.queue().contains(insert) {
                        links.dependencies.push(insert);
                    }
                }
            }
            event.entity.as_entity_mut().assign_column(fk_column, id)?;
        }
    }
    Ok(links)
}

fn illegal_in_flight(descriptor: &EntityDescriptor, association: &str) -> PersistError {
    PersistError::IllegalState(format!(
        "'{}.{}' references an entity whose generated identifier belongs to an insert already in flight",
        descriptor.entity_name(),
        association
    ))
}

/// Persists one-to-many children once the parent's insert succeeded.
fn cascade_to_children(
    core: &mut SessionCore,
    event: &PersistEvent,
    descriptor: &EntityDescriptor,
    known_id: Option<Value>,
    ancestors: Vec<EntityKey>,
    insert: CompletionHandle<ActionOutcome>,
) -> CompletionHandle<()> {
    let mut children = Vec::new();
    for association in descriptor.associations() {
        if let AssociationKind::OneToMany { mapped_by } = &association.kind {
            if association.cascade.includes_persist() {
                for child in event.entity.as_entity().related(&association.name) {
                    children.push((mapped_by.clone(), child));
                }
            }
        }
    }
    if children.is_empty() {
        return insert.map(|_| ());
    }

    core.resume_after(insert, "persist cascade", move |core, result| {
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(err) => return CompletionHandle::failed(err),
        };
        let Some(parent_id) = known_id.or(outcome.generated_id) else {
            return CompletionHandle::failed(PersistError::IllegalState(
                "parent identifier unknown after insert".to_string(),
            ));
        };

        let mut ancestors = ancestors;
        let mut handles = Vec::new();
        for (mapped_by, mut child) in children {
            if let Err(err) = child.as_entity_mut().assign_column(&mapped_by, parent_id.clone()) {
                handles.push(CompletionHandle::failed(err));
                continue;
            }
            let mut child_event = PersistEvent::cascaded(child, ancestors.clone());
            handles.push(core.fire_persist(&mut child_event));
            if let Some(id) = child_event.entity.identifier() {
                if let Ok(child_descriptor) = core.metamodel().descriptor_of(child_event.entity.as_entity()) {
                    ancestors.push(child_descriptor.key(id));
                }
            }
        }
        handles.push(core.flush_if_auto());
        CompletionHandle::all(handles)
    })
}

fn settle_insert(
    core: &mut SessionCore,
    key: &EntityKey,
    generation: u64,
    result: &Result<ActionOutcome>,
) {
    match result {
        Ok(outcome) => {
            if let Some(entry) = core.context_mut().get_current(key, generation) {
                apply_patches(entry, outcome);
                entry.insert_action = None;
                if entry.status == EntityStatus::Saving {
                    entry.status = EntityStatus::Managed;
                }
            }
            core.statistics().record_insert();
        }
        Err(err) => {
            event!(Level::DEBUG, key = %key, error = %err, "insert failed, dropping entry");
            core.context_mut().remove_current(key, generation);
        }
    }
}

/// Copies foreign keys filled in at execution time onto the managed instance.
fn apply_patches(entry: &mut EntityEntry, outcome: &ActionOutcome) {
    for (column, value) in &outcome.patched {
        let Some(mapping) = entry.descriptor.columns().get(*column) else {
            continue;
        };
        let name = mapping.name.clone();
        if entry.instance.assign_column(&name, value.clone()).is_ok() {
            if let Some(slot) = entry.loaded_state.get_mut(*column) {
                *slot = value.clone();
            }
        }
    }
}

