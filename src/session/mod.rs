//! Public entry point.
//!
//! A [`Session`] is a cloneable handle to one sequencer task. Every call
//! becomes a job in the sequencer's mailbox and returns a
//! [`CompletionHandle`] right away; jobs run strictly in the order they were
//! submitted, and database work runs on separate tasks.

mod core;
mod factory;
mod settings;
mod statistics;

pub use self::core::SessionCore;
pub use self::factory::{SessionFactory, SessionFactoryBuilder};
pub use self::settings::Settings;
pub use self::statistics::{Statistics, StatisticsSnapshot};

use self::core::{Job, SessionCommand};
use crate::completion::CompletionHandle;
use crate::context::EntityStatus;
use crate::core::{PersistError, Value};
use crate::event::{DeleteEvent, LoadEvent, MergeEvent, PersistEvent};
use crate::metamodel::{Entity, EntityRef};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Clone)]
pub struct Session {
    id: u64,
    sender: mpsc::UnboundedSender<SessionCommand>,
    statistics: Arc<Statistics>,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        sender: mpsc::UnboundedSender<SessionCommand>,
        statistics: Arc<Statistics>,
    ) -> Self {
        Self {
            id,
            sender,
            statistics,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Posts `op` to the sequencer and forwards its outcome.
    fn submit<T, F>(&self, label: &'static str, op: F) -> CompletionHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut SessionCore) -> CompletionHandle<T> + Send + 'static,
    {
        let (completer, handle) = CompletionHandle::pending(label);
        let job: Job = Box::new(move |core: &mut SessionCore| {
            if core.is_closed() {
                completer.fail(PersistError::SessionClosed);
                return;
            }
            op(core).forward_to(completer);
        });
        match self.sender.send(SessionCommand::Run(job)) {
            Ok(()) => handle,
            Err(_) => CompletionHandle::failed(PersistError::SessionClosed),
        }
    }

    /// Makes `entity` persistent. With auto-flush the handle resolves once
    /// the insert (and its cascades) reached the database.
    pub fn persist<E: Entity>(&self, entity: E) -> CompletionHandle<()> {
        self.submit("persist", move |core| {
            let mut event = PersistEvent::new(EntityRef::new(entity));
            let persisted = core.fire_persist(&mut event);
            CompletionHandle::all(vec![persisted, core.flush_if_auto()])
        })
    }

    /// Like [`Session::persist`], resolving with the identifier, including
    /// identifiers generated by the database.
    pub fn save<E: Entity>(&self, entity: E) -> CompletionHandle<Value> {
        self.submit("save", move |core| {
            let mut event = PersistEvent::new(EntityRef::new(entity));
            let persisted = core.fire_persist(&mut event);
            let flushed = core.flush_if_auto();
            let identifier = match event.generated_identifier.take() {
                Some(generated) => generated,
                None => match event.entity.identifier() {
                    Some(id) => CompletionHandle::completed(id),
                    None => CompletionHandle::failed(PersistError::IdentifierGeneration {
                        entity: core
                            .metamodel()
                            .descriptor::<E>()
                            .map(|descriptor| descriptor.entity_name().to_string())
                            .unwrap_or_default(),
                        message: "the generator skipped the insert".to_string(),
                    }),
                },
            };
            CompletionHandle::all(vec![persisted, flushed]).and_then(move |_| identifier)
        })
    }

    /// Resolves empty when no row exists.
    pub fn find<E: Entity>(&self, id: impl Into<Value>) -> CompletionHandle<Option<E>> {
        let id = id.into();
        self.submit("find", move |core| load::<E>(core, id))
    }

    /// Like [`Session::find`], failing with `EntityNotFound` when no row exists.
    pub fn get_reference<E: Entity>(&self, id: impl Into<Value>) -> CompletionHandle<E> {
        let id = id.into();
        self.submit("get reference", move |core| {
            let entity = match core.metamodel().descriptor::<E>() {
                Ok(descriptor) => descriptor.entity_name().to_string(),
                Err(err) => return CompletionHandle::failed(err),
            };
            let missing = id.to_string();
            load::<E>(core, id).and_then(move |found| match found {
                Some(found) => CompletionHandle::completed(found),
                None => CompletionHandle::failed(PersistError::EntityNotFound { entity, id: missing }),
            })
        })
    }

    /// Deletes the row of `entity`. Already deleted or missing rows succeed.
    pub fn remove<E: Entity>(&self, entity: &E) -> CompletionHandle<()> {
        let entity = EntityRef::new(entity.clone());
        self.submit("remove", move |core| {
            let removed = core.fire_delete(&mut DeleteEvent::new(entity));
            CompletionHandle::all(vec![removed, core.flush_if_auto()])
        })
    }

    /// Executes every pending change.
    pub fn flush(&self) -> CompletionHandle<()> {
        self.submit("flush", |core| core.flush())
    }

    /// Copies the state of `entity` onto the managed instance and resolves
    /// with the merged instance.
    pub fn merge<E: Entity>(&self, entity: &E) -> CompletionHandle<E> {
        let entity = EntityRef::new(entity.clone());
        self.submit("merge", move |core| {
            let descriptor = match core.metamodel().descriptor::<E>() {
                Ok(descriptor) => descriptor,
                Err(err) => return CompletionHandle::failed(err),
            };
            core.fire_merge(&mut MergeEvent::new(entity))
                .and_then(move |merged| CompletionHandle::from_result(merged.to_typed::<E>(&descriptor)))
        })
    }

    /// True when `entity` is managed and not scheduled for deletion.
    pub fn contains<E: Entity>(&self, entity: &E) -> CompletionHandle<bool> {
        let id = entity.identifier();
        self.submit("contains", move |core| {
            let contained = match (core.metamodel().descriptor::<E>(), id) {
                (Ok(descriptor), Some(id)) => core
                    .context()
                    .get(&descriptor.key(id))
                    .is_some_and(|entry| !entry.is_deleted()),
                (Err(err), _) => return CompletionHandle::failed(err),
                (Ok(_), None) => false,
            };
            CompletionHandle::completed(contained)
        })
    }

    pub fn entity_status<E: Entity>(&self, id: impl Into<Value>) -> CompletionHandle<Option<EntityStatus>> {
        let id = id.into();
        self.submit("entity status", move |core| {
            CompletionHandle::from_result(
                core.metamodel()
                    .descriptor::<E>()
                    .map(|descriptor| core.context().status(&descriptor.key(id))),
            )
        })
    }

    /// Runs `work` as one unit of work.
    ///
    /// Auto-flush is suspended while `work` runs. When the handle returned by
    /// `work` succeeds, everything it queued is flushed; when it fails, the
    /// actions queued since the start are dropped (their handles resolve as
    /// abandoned) and the returned handle fails with the error of `work`.
    ///
    /// Handles of persist and remove calls made inside `work` resolve only at
    /// commit, so `work` must not wait on them. Statements already flushed
    /// explicitly inside `work` are not undone.
    pub fn in_transaction<T, F>(&self, work: F) -> CompletionHandle<T>
    where
        T: Send + 'static,
        F: FnOnce(Session) -> CompletionHandle<T> + Send + 'static,
    {
        let begun = self.submit("begin transaction", |core| {
            CompletionHandle::from_result(core.begin_transaction())
        });
        let session = self.clone();
        let (completer, finished) = CompletionHandle::pending("transaction");
        CompletionHandle::from_future(async move {
            begun.await?;
            match work(session.clone()).await {
                Ok(value) => {
                    session
                        .submit("commit", |core| core.commit_transaction())
                        .await?;
                    Ok(value)
                }
                Err(err) => {
                    // A closed session has nothing left to roll back.
                    let _ = session
                        .submit("rollback", |core| {
                            core.rollback_transaction();
                            CompletionHandle::completed(())
                        })
                        .await;
                    Err(err)
                }
            }
        })
        .forward_to(completer);
        finished
    }

    /// Detaches `entity`. Its queued actions still execute.
    pub fn evict<E: Entity>(&self, entity: &E) -> CompletionHandle<()> {
        let id = entity.identifier();
        self.submit("evict", move |core| {
            let descriptor = match core.metamodel().descriptor::<E>() {
                Ok(descriptor) => descriptor,
                Err(err) => return CompletionHandle::failed(err),
            };
            if let Some(id) = id {
                core.context_mut().remove(&descriptor.key(id));
            }
            CompletionHandle::completed(())
        })
    }

    /// Detaches everything and drops queued actions; their handles resolve
    /// as abandoned.
    pub fn clear(&self) -> CompletionHandle<()> {
        self.submit("clear", |core| {
            core.clear();
            CompletionHandle::completed(())
        })
    }

    /// Rejects further calls. Resolves once in-flight batches settled.
    pub fn close(&self) -> CompletionHandle<()> {
        self.submit("close", |core| {
            core.close();
            core.idle()
        })
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.statistics.snapshot()
    }
}

fn load<E: Entity>(core: &mut SessionCore, id: Value) -> CompletionHandle<Option<E>> {
    let descriptor = match core.metamodel().descriptor::<E>() {
        Ok(descriptor) => descriptor,
        Err(err) => return CompletionHandle::failed(err),
    };
    let loaded = core.fire_load(&mut LoadEvent::new(Arc::clone(&descriptor), id));
    loaded.and_then(move |found| {
        CompletionHandle::from_result(found.map(|entity| entity.to_typed::<E>(&descriptor)).transpose())
    })
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}
