use super::{FlushEvent, FlushEventListener};
use crate::action::{Action, ActionData};
use crate::completion::CompletionHandle;
use crate::context::EntityStatus;
use crate::core::{EntityKey, Result, Value};
use crate::metamodel::EntityDescriptor;
use crate::session::SessionCore;
use std::sync::Arc;
use tracing::{Level, event};

/// Dirty-checks managed entries, schedules their updates and executes the
/// whole queue as one batch.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFlushEventListener;

impl FlushEventListener for DefaultFlushEventListener {
    fn on_flush(&self, core: &mut SessionCore, event: &mut FlushEvent) -> CompletionHandle<()> {
        match schedule_updates(core) {
            Ok(count) => event.scheduled_updates = count,
            Err(err) => return CompletionHandle::failed(err),
        }
        core.execute_pending_actions()
    }
}

struct UpdatePlan {
    descriptor: Arc<EntityDescriptor>,
    key: EntityKey,
    generation: u64,
    current: Vec<Value>,
    dirty: Vec<usize>,
    version: Option<i64>,
}

/// Queues an update for every managed entry whose state differs from its
/// snapshot. Entries with an update already in flight are skipped.
fn schedule_updates(core: &mut SessionCore) -> Result<usize> {
    let mut plans = Vec::new();
    for (key, entry) in core.context().iter() {
        if entry.status != EntityStatus::Managed || entry.update_in_flight {
            continue;
        }
        let current = entry.descriptor.column_values(&*entry.instance)?;
        let dirty = entry.descriptor.dirty_columns(&entry.loaded_state, &current);
        if dirty.is_empty() {
            continue;
        }
        plans.push(UpdatePlan {
            descriptor: Arc::clone(&entry.descriptor),
            key: key.clone(),
            generation: entry.generation(),
            current,
            dirty,
            version: entry.version,
        });
    }

    let count = plans.len();
    for plan in plans {
        let action_id = core.queue_mut().next_action_id();
        let next_version = plan.version.map(|version| (version, version + 1));
        let (mut action, _handle) = Action::new(
            action_id,
            Arc::clone(&plan.descriptor),
            ActionData::Update {
                id: plan.key.id().clone(),
                values: plan.current.clone(),
                dirty: plan.dirty,
                version: next_version,
            },
        );

        let key = plan.key.clone();
        let generation = plan.generation;
        let written = plan.current;
        action.on_settled(move |core, result| match result {
            Ok(_) => {
                if let Some(entry) = core.context_mut().get_current(&key, generation) {
                    entry.loaded_state = written;
                    entry.version = next_version.map(|(_, next)| next);
                    entry.update_in_flight = false;
                }
                core.statistics().record_update();
            }
            Err(err) => {
                event!(Level::WARN, key = %key, error = %err, "update failed, evicting entity");
                core.context_mut().remove_current(&key, generation);
            }
        });

        if let Some(entry) = core.context_mut().get_current(&plan.key, plan.generation) {
            entry.update_in_flight = true;
        }
        if let Err(err) = core.queue_mut().add_action(action) {
            if let Some(entry) = core.context_mut().get_current(&plan.key, plan.generation) {
                entry.update_in_flight = false;
            }
            return Err(err);
        }
        event!(Level::DEBUG, key = %plan.key, action = %action_id, "update scheduled");
    }
    Ok(count)
}
