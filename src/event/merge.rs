use super::{LoadEvent, MergeEvent, MergeEventListener, PersistEvent};
use crate::completion::CompletionHandle;
use crate::context::EntityStatus;
use crate::core::{EntityKey, PersistError, Result};
use crate::metamodel::EntityRef;
use crate::session::SessionCore;

/// Copies detached state onto the managed instance.
///
/// The change reaches the database through the next flush's dirty check.
/// An instance without identifier, or without a row, is persisted instead.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultMergeEventListener;

impl MergeEventListener for DefaultMergeEventListener {
    fn on_merge(
        &self,
        core: &mut SessionCore,
        event: &mut MergeEvent,
    ) -> Option<CompletionHandle<EntityRef>> {
        let descriptor = match core.metamodel().descriptor_of(event.entity.as_entity()) {
            Ok(descriptor) => descriptor,
            Err(err) => return Some(CompletionHandle::failed(err)),
        };
        let Some(id) = event.entity.identifier().filter(|id| !id.is_null()) else {
            return Some(persist_copy(core, event.entity.clone()));
        };
        if let Err(err) = descriptor.check_identifier(&id) {
            return Some(CompletionHandle::failed(err));
        }
        let key = descriptor.key(id.clone());

        if core.context().contains(&key) {
            return Some(CompletionHandle::from_result(
                copy_onto_managed(core, &key, &event.entity).map(|_| event.entity.clone()),
            ));
        }

        let loaded = core.fire_load(&mut LoadEvent::new(descriptor, id));
        let entity = event.entity.clone();
        Some(core.resume_after(loaded, "merge", move |core, result| match result {
            Err(err) => CompletionHandle::failed(err),
            Ok(None) => persist_copy(core, entity),
            Ok(Some(_)) => CompletionHandle::from_result(
                copy_onto_managed(core, &key, &entity).map(|_| entity),
            ),
        }))
    }
}

fn copy_onto_managed(
    core: &mut SessionCore,
    key: &EntityKey,
    entity: &EntityRef,
) -> Result<()> {
    match core.context_mut().get_mut(key) {
        Some(entry) if entry.status == EntityStatus::Deleted => Err(PersistError::IllegalState(
            format!("Cannot merge {}: it is scheduled for deletion", key),
        )),
        Some(entry) => {
            entry.instance = entity.as_entity().clone_boxed();
            Ok(())
        }
        None => Err(PersistError::IllegalState(format!(
            "{} left the persistence context during merge",
            key
        ))),
    }
}

/// Persists a copy, following persist's auto-flush rule, and resolves with
/// the copy carrying its identifier.
fn persist_copy(core: &mut SessionCore, entity: EntityRef) -> CompletionHandle<EntityRef> {
    let mut persist = PersistEvent::new(entity);
    let handle = core.fire_persist(&mut persist);
    let flush = core.flush_if_auto();
    let mut merged = persist.entity;
    let generated = persist.generated_identifier.take();

    CompletionHandle::all(vec![handle, flush]).and_then(move |_| match generated {
        Some(generated) => generated.map(move |id| {
            merged.set_identifier(id);
            merged
        }),
        None => CompletionHandle::completed(merged),
    })
}
