use super::{Action, ActionData, ActionExecutor, ActionId, ActionKind, ActionOutcome};
use crate::core::{EntityKey, PersistError, Result, Value};
use std::collections::{HashMap, VecDeque};
use tracing::{Level, event};

/// Pending actions of one session, grouped by kind.
///
/// Inserts run before deletes, deletes before updates. Within a kind actions
/// keep their enqueue order, except that an insert waits for the inserts of
/// the rows it references and a delete waits for the deletes of the rows
/// referencing it.
#[derive(Debug, Default)]
pub struct ActionQueue {
    insertions: VecDeque<Action>,
    deletions: VecDeque<Action>,
    updates: VecDeque<Action>,
    executing: Option<ActionKind>,
    next_id: u64,
}

/// Summary of one `execute_actions` run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub total: usize,
    pub failed: usize,
    pub inserts: usize,
    pub deletes: usize,
    pub updates: usize,
    pub first_error: Option<PersistError>,
}

impl BatchReport {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }

    pub fn into_result(self) -> Result<()> {
        match self.first_error {
            Some(first) if self.failed > 0 => Err(PersistError::FlushFailed {
                failed: self.failed,
                total: self.total,
                first: Box::new(first),
            }),
            _ => Ok(()),
        }
    }

    fn record(&mut self, kind: ActionKind, result: &Result<ActionOutcome>) {
        self.total += 1;
        match kind {
            ActionKind::Insert => self.inserts += 1,
            ActionKind::Delete => self.deletes += 1,
            ActionKind::Update => self.updates += 1,
        }
        if let Err(err) = result {
            self.failed += 1;
            if self.first_error.is_none() {
                self.first_error = Some(err.clone());
            }
        }
    }
}

struct OrderNode {
    id: ActionId,
    key: Option<EntityKey>,
    references: Vec<EntityKey>,
    dependencies: Vec<ActionId>,
}

/// Outcome of an executed action, kept for dependents in the same batch.
enum Executed {
    Succeeded(Option<Value>),
    Failed,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_action_id(&mut self) -> ActionId {
        self.next_id += 1;
        ActionId::new(self.next_id)
    }

    /// Enqueues `action`; rejected while actions of the same kind execute.
    ///
    /// A rejected action is failed with the returned error.
    pub fn add_action(&mut self, action: Action) -> Result<()> {
        let kind = action.kind();
        if self.executing == Some(kind) {
            let err = PersistError::IllegalState(format!(
                "Cannot add {} action while {} actions are executing",
                kind, kind
            ));
            action.settle_detached(Err(err.clone()));
            return Err(err);
        }
        match kind {
            ActionKind::Insert => self.insertions.push_back(action),
            ActionKind::Delete => self.deletions.push_back(action),
            ActionKind::Update => self.updates.push_back(action),
        }
        Ok(())
    }

    pub fn contains(&self, id: ActionId) -> bool {
        self.insertions
            .iter()
            .chain(&self.deletions)
            .chain(&self.updates)
            .any(|action| action.id() == id)
    }

    /// True while an insert still waits for a database-generated identifier.
    pub fn has_unresolved_insert_actions(&self) -> bool {
        self.insertions
            .iter()
            .any(|action| action.is_unresolved_insert())
    }

    pub fn number_of_insertions(&self) -> usize {
        self.insertions.len()
    }

    pub fn number_of_deletions(&self) -> usize {
        self.deletions.len()
    }

    pub fn number_of_updates(&self) -> usize {
        self.updates.len()
    }

    pub fn len(&self) -> usize {
        self.insertions.len() + self.deletions.len() + self.updates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Id of the most recently created action.
    pub fn last_action_id(&self) -> ActionId {
        ActionId::new(self.next_id)
    }

    /// Removes the pending actions created after `mark`, newest first.
    pub fn take_after(&mut self, mark: ActionId) -> Vec<Action> {
        let mut taken = Vec::new();
        for group in [&mut self.insertions, &mut self.deletions, &mut self.updates] {
            let (kept, later): (VecDeque<Action>, VecDeque<Action>) =
                group.drain(..).partition(|action| action.id() <= mark);
            *group = kept;
            taken.extend(later);
        }
        taken.sort_by_key(|action| std::cmp::Reverse(action.id()));
        taken
    }

    /// Drops every pending action; their completions resolve as abandoned.
    pub fn clear(&mut self) {
        self.insertions.clear();
        self.deletions.clear();
        self.updates.clear();
    }

    /// Moves every pending action into a new queue, keeping the id counter here.
    pub fn drain_batch(&mut self) -> ActionQueue {
        ActionQueue {
            insertions: std::mem::take(&mut self.insertions),
            deletions: std::mem::take(&mut self.deletions),
            updates: std::mem::take(&mut self.updates),
            executing: None,
            next_id: self.next_id,
        }
    }

    /// Reorders one group so foreign keys are satisfied at every step.
    /// Actions caught in a reference cycle keep their enqueue order.
    fn order(&mut self, kind: ActionKind) {
        let pending = match kind {
            ActionKind::Insert => &mut self.insertions,
            ActionKind::Delete => &mut self.deletions,
            ActionKind::Update => return,
        };
        if pending.len() < 2 {
            return;
        }

        let mut actions: Vec<Option<Action>> = pending.drain(..).map(Some).collect();
        let nodes: Vec<OrderNode> = actions
            .iter()
            .flatten()
            .map(|action| OrderNode {
                id: action.id(),
                key: action.request().key(),
                references: action.request().referenced_keys(),
                dependencies: action.dependencies().to_vec(),
            })
            .collect();

        // `i` has to run after `j`.
        let must_follow = |i: usize, j: usize| {
            let (first, then) = match kind {
                ActionKind::Delete => (&nodes[i], &nodes[j]),
                _ => (&nodes[j], &nodes[i]),
            };
            nodes[i].dependencies.contains(&nodes[j].id)
                || first.key.as_ref().is_some_and(|key| then.references.contains(key))
        };

        let count = nodes.len();
        let mut placed = vec![false; count];
        for _ in 0..count {
            let ready = (0..count).filter(|&i| !placed[i]).find(|&i| {
                (0..count).all(|j| j == i || placed[j] || !must_follow(i, j))
            });
            let Some(next) = ready.or_else(|| (0..count).find(|&i| !placed[i])) else {
                break;
            };
            placed[next] = true;
            if let Some(action) = actions[next].take() {
                pending.push_back(action);
            }
        }
    }

    fn pop(&mut self, kind: ActionKind) -> Option<Action> {
        match kind {
            ActionKind::Insert => self.insertions.pop_front(),
            ActionKind::Delete => self.deletions.pop_front(),
            ActionKind::Update => self.updates.pop_front(),
        }
    }

    /// Executes every action in order and hands each one with its result to
    /// `settle`. A failure does not stop independent actions; an action whose
    /// dependency failed is failed without a round trip.
    pub async fn execute_actions<F>(
        &mut self,
        executor: &dyn ActionExecutor,
        mut settle: F,
    ) -> BatchReport
    where
        F: FnMut(Action, Result<ActionOutcome>) + Send,
    {
        let mut report = BatchReport::default();
        let mut executed: HashMap<ActionId, Executed> = HashMap::new();

        for kind in ActionKind::EXECUTION_ORDER {
            self.executing = Some(kind);
            self.order(kind);
            while let Some(mut action) = self.pop(kind) {
                let result = match prepare(&mut action, &executed) {
                    Ok(patched) => executor
                        .execute(action.request())
                        .await
                        .map(|mut outcome| {
                            outcome.patched = patched;
                            outcome
                        }),
                    Err(err) => Err(err),
                };

                match &result {
                    Ok(outcome) => {
                        executed.insert(action.id(), Executed::Succeeded(outcome.generated_id.clone()));
                    }
                    Err(err) => {
                        event!(
                            Level::WARN,
                            action = %action.id(),
                            entity = %action.descriptor().entity_name(),
                            error = %err,
                            "action failed"
                        );
                        executed.insert(action.id(), Executed::Failed);
                    }
                }
                report.record(kind, &result);
                settle(action, result);
            }
        }
        self.executing = None;
        report
    }
}

/// Checks dependencies and fills foreign keys from earlier inserts.
fn prepare(
    action: &mut Action,
    executed: &HashMap<ActionId, Executed>,
) -> Result<Vec<(usize, Value)>> {
    for dependency in action.dependencies() {
        if let Some(Executed::Failed) = executed.get(dependency) {
            return Err(PersistError::database(format!(
                "{} skipped: {} it depends on failed",
                action.id(),
                dependency
            )));
        }
    }

    let mut patched = Vec::new();
    for (column, source) in action.fk_patches().to_vec() {
        let value = match executed.get(&source) {
            Some(Executed::Succeeded(Some(id))) => id.clone(),
            _ => {
                return Err(PersistError::IllegalState(format!(
                    "{} needs the identifier generated by {}, which did not run in this batch",
                    action.id(),
                    source
                )));
            }
        };
        if let ActionData::Insert { values, .. } = &mut action.request_mut().data {
            if let Some(slot) = values.get_mut(column) {
                *slot = value.clone();
                patched.push((column, value));
            }
        }
    }
    Ok(patched)
}
