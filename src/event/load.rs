use super::{LoadEvent, LoadEventListener, snapshot_of_row};
use crate::completion::CompletionHandle;
use crate::context::{EntityEntry, EntityStatus};
use crate::core::{EntityKey, Result, Row};
use crate::metamodel::{EntityDescriptor, EntityRef};
use crate::session::SessionCore;
use std::sync::Arc;
use tracing::{Level, event};

/// Answers loads from the persistence context, falling back to a read.
///
/// Pending inserts whose identifier the database still has to generate are
/// flushed before the read, so the read sees them.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultLoadEventListener;

impl LoadEventListener for DefaultLoadEventListener {
    fn on_load(
        &self,
        core: &mut SessionCore,
        event: &mut LoadEvent,
    ) -> Option<CompletionHandle<Option<EntityRef>>> {
        if let Err(err) = event.descriptor.check_identifier(&event.id) {
            return Some(CompletionHandle::failed(err));
        }
        let key = event.descriptor.key(event.id.clone());

        if let Some(entry) = core.context().get(&key) {
            let found = (!entry.is_deleted()).then(|| EntityRef::from_boxed(entry.instance.clone_boxed()));
            core.statistics().record_cache_hit();
            event!(Level::TRACE, key = %key, "load answered from context");
            return Some(CompletionHandle::completed(found));
        }

        let before = if core.queue().has_unresolved_insert_actions() {
            core.flush()
        } else {
            CompletionHandle::completed(())
        };
        let executor = core.executor();
        let descriptor = Arc::clone(&event.descriptor);
        let id = event.id.clone();
        let read = before.and_then(move |_| {
            CompletionHandle::from_future(async move { executor.load(&descriptor, &id).await })
        });

        let descriptor = Arc::clone(&event.descriptor);
        Some(core.resume_after(read, "load", move |core, result| {
            CompletionHandle::from_result(
                result.and_then(|row| materialize(core, &descriptor, key, row)),
            )
        }))
    }
}

/// Turns a fetched row into a managed instance, unless the key became
/// managed while the read was in flight.
fn materialize(
    core: &mut SessionCore,
    descriptor: &Arc<EntityDescriptor>,
    key: EntityKey,
    row: Option<Row>,
) -> Result<Option<EntityRef>> {
    let Some(row) = row else {
        return Ok(None);
    };
    if let Some(entry) = core.context().get(&key) {
        if entry.is_deleted() {
            return Ok(None);
        }
        return Ok(Some(EntityRef::from_boxed(entry.instance.clone_boxed())));
    }

    let instance = descriptor.instantiate(&row)?;
    let (loaded_state, version) = snapshot_of_row(descriptor, &row);
    let found = EntityRef::from_boxed(instance.clone_boxed());
    let entry = EntityEntry::new(
        Arc::clone(descriptor),
        Some(key.id().clone()),
        EntityStatus::Managed,
        instance,
        loaded_state,
        version,
    );
    core.context_mut().add_entry(key, entry);
    core.statistics().record_load();
    Ok(Some(found))
}
