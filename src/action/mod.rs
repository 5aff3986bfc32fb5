//! Deferred units of database work.
//!
//! Every [`Action`] carries its own [`Completer`]; settle hooks registered by
//! listeners run on the session sequencer right before that completer
//! resolves, so context state transitions are visible to whoever observes
//! the completion.

pub mod queue;

pub use queue::{ActionQueue, BatchReport};

use crate::completion::{CompletionHandle, Completer};
use crate::core::{EntityKey, Result, Value};
use crate::metamodel::EntityDescriptor;
use crate::session::SessionCore;
use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ActionId(u64);

impl ActionId {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ActionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "action#{}", self.0)
    }
}

/// Execution group; groups run in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Insert,
    Delete,
    Update,
}

impl ActionKind {
    pub const EXECUTION_ORDER: [ActionKind; 3] =
        [ActionKind::Insert, ActionKind::Delete, ActionKind::Update];
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Insert => write!(f, "insert"),
            Self::Delete => write!(f, "delete"),
            Self::Update => write!(f, "update"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ActionData {
    Insert {
        /// `None` when the database generates the identifier.
        id: Option<Value>,
        values: Vec<Value>,
        version: Option<i64>,
    },
    Update {
        id: Value,
        /// Current values of every mapped column.
        values: Vec<Value>,
        /// Indexes of the columns that changed.
        dirty: Vec<usize>,
        /// `(expected, next)` when the entity is versioned.
        version: Option<(i64, i64)>,
    },
    Delete {
        id: Value,
        deleted_state: Vec<Value>,
        version: Option<i64>,
    },
}

/// The part of an action the mutation executor reads.
#[derive(Debug, Clone)]
pub struct ActionRequest {
    pub id: ActionId,
    pub descriptor: Arc<EntityDescriptor>,
    pub data: ActionData,
}

impl ActionRequest {
    pub fn kind(&self) -> ActionKind {
        match self.data {
            ActionData::Insert { .. } => ActionKind::Insert,
            ActionData::Update { .. } => ActionKind::Update,
            ActionData::Delete { .. } => ActionKind::Delete,
        }
    }

    /// Row written by this action, once its identifier is known.
    pub fn key(&self) -> Option<EntityKey> {
        match &self.data {
            ActionData::Insert { id, .. } => id.clone().map(|id| self.descriptor.key(id)),
            ActionData::Update { id, .. } | ActionData::Delete { id, .. } => {
                Some(self.descriptor.key(id.clone()))
            }
        }
    }

    /// Rows this action points at through many-to-one foreign keys.
    pub fn referenced_keys(&self) -> Vec<EntityKey> {
        let values = match &self.data {
            ActionData::Insert { values, .. } | ActionData::Update { values, .. } => values,
            ActionData::Delete { deleted_state, .. } => deleted_state,
        };
        self.descriptor
            .associations()
            .iter()
            .filter_map(|association| {
                let value = values.get(self.descriptor.foreign_key_index(association)?)?;
                (!value.is_null())
                    .then(|| EntityKey::new(association.target.as_str(), value.clone()))
            })
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionOutcome {
    /// Identifier assigned by the database, for identity inserts.
    pub generated_id: Option<Value>,
    pub rows: u64,
    /// Foreign key values filled in from earlier inserts of the same batch.
    pub patched: Vec<(usize, Value)>,
}

pub type SettleHook = Box<dyn FnOnce(&mut SessionCore, &Result<ActionOutcome>) + Send>;

/// Performs the database round trip of one action.
#[async_trait]
pub trait ActionExecutor: Send + Sync {
    async fn execute(&self, request: &ActionRequest) -> Result<ActionOutcome>;
}

pub struct Action {
    request: ActionRequest,
    depends_on: Vec<ActionId>,
    /// `(column index, source insert)` pairs.
    fk_patches: Vec<(usize, ActionId)>,
    completer: Completer<ActionOutcome>,
    hooks: Vec<SettleHook>,
}

impl Action {
    pub fn new(
        id: ActionId,
        descriptor: Arc<EntityDescriptor>,
        data: ActionData,
    ) -> (Self, CompletionHandle<ActionOutcome>) {
        let (completer, handle) = CompletionHandle::pending("action");
        (
            Self {
                request: ActionRequest {
                    id,
                    descriptor,
                    data,
                },
                depends_on: Vec::new(),
                fk_patches: Vec::new(),
                completer,
                hooks: Vec::new(),
            },
            handle,
        )
    }

    pub fn id(&self) -> ActionId {
        self.request.id
    }

    pub fn kind(&self) -> ActionKind {
        self.request.kind()
    }

    pub fn request(&self) -> &ActionRequest {
        &self.request
    }

    pub fn descriptor(&self) -> &Arc<EntityDescriptor> {
        &self.request.descriptor
    }

    /// Insert whose identifier is still to be generated by the database.
    pub fn is_unresolved_insert(&self) -> bool {
        matches!(self.request.data, ActionData::Insert { id: None, .. })
    }

    pub fn depends_on(&mut self, other: ActionId) {
        if !self.depends_on.contains(&other) {
            self.depends_on.push(other);
        }
    }

    pub fn dependencies(&self) -> &[ActionId] {
        &self.depends_on
    }

    /// Fills `column` from the identifier generated by `source` before executing.
    pub fn patch_foreign_key(&mut self, column: usize, source: ActionId) {
        self.depends_on(source);
        self.fk_patches.push((column, source));
    }

    pub fn on_settled<F>(&mut self, hook: F)
    where
        F: FnOnce(&mut SessionCore, &Result<ActionOutcome>) + Send + 'static,
    {
        self.hooks.push(Box::new(hook));
    }

    /// Runs the settle hooks against the session, then resolves the completion.
    pub fn settle(self, core: &mut SessionCore, result: Result<ActionOutcome>) {
        for hook in self.hooks {
            hook(core, &result);
        }
        self.completer.settle(result);
    }

    /// Resolves the completion without running settle hooks.
    pub fn settle_detached(self, result: Result<ActionOutcome>) {
        self.completer.settle(result);
    }

    pub(crate) fn request_mut(&mut self) -> &mut ActionRequest {
        &mut self.request
    }

    pub(crate) fn fk_patches(&self) -> &[(usize, ActionId)] {
        &self.fk_patches
    }
}

impl fmt::Debug for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("id", &self.request.id)
            .field("kind", &self.kind())
            .field("entity", &self.request.descriptor.entity_name())
            .field("depends_on", &self.depends_on)
            .finish()
    }
}
