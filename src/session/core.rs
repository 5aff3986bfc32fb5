use super::factory::FactoryShared;
use super::settings::Settings;
use super::statistics::Statistics;
use crate::action::{ActionId, ActionQueue, BatchReport};
use crate::completion::CompletionHandle;
use crate::context::PersistenceContext;
use crate::core::{PersistError, Result};
use crate::event::{DeleteEvent, FlushEvent, LoadEvent, MergeEvent, PersistEvent};
use crate::executor::MutationExecutor;
use crate::metamodel::{EntityRef, Metamodel};
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{Instrument, Level, event, info_span};

pub(crate) type Job = Box<dyn FnOnce(&mut SessionCore) + Send>;

pub(crate) enum SessionCommand {
    Run(Job),
}

type Tail = Shared<BoxFuture<'static, ()>>;

/// State owned by one session sequencer.
///
/// Listeners receive `&mut SessionCore`; every method here runs on the
/// sequencer task and returns without waiting for I/O.
pub struct SessionCore {
    id: u64,
    shared: Arc<FactoryShared>,
    context: PersistenceContext,
    queue: ActionQueue,
    mailbox: mpsc::WeakUnboundedSender<SessionCommand>,
    /// Completes when the last executed batch settled.
    tail: Option<Tail>,
    statistics: Arc<Statistics>,
    /// Last action created before the running unit of work began.
    transaction: Option<ActionId>,
    closed: bool,
}

impl SessionCore {
    pub(crate) fn new(
        id: u64,
        shared: Arc<FactoryShared>,
        mailbox: mpsc::WeakUnboundedSender<SessionCommand>,
        statistics: Arc<Statistics>,
    ) -> Self {
        Self {
            id,
            shared,
            context: PersistenceContext::new(),
            queue: ActionQueue::new(),
            mailbox,
            tail: None,
            statistics,
            transaction: None,
            closed: false,
        }
    }

    pub fn session_id(&self) -> u64 {
        self.id
    }

    pub fn metamodel(&self) -> &Metamodel {
        &self.shared.metamodel
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    pub fn executor(&self) -> Arc<MutationExecutor> {
        Arc::clone(&self.shared.executor)
    }

    pub fn statistics(&self) -> &Arc<Statistics> {
        &self.statistics
    }

    pub fn context(&self) -> &PersistenceContext {
        &self.context
    }

    pub fn context_mut(&mut self) -> &mut PersistenceContext {
        &mut self.context
    }

    pub fn queue(&self) -> &ActionQueue {
        &self.queue
    }

    pub fn queue_mut(&mut self) -> &mut ActionQueue {
        &mut self.queue
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn fire_persist(&mut self, event: &mut PersistEvent) -> CompletionHandle<()> {
        let listeners = Arc::clone(&self.shared.listeners);
        let handles = listeners
            .persist
            .iter()
            .map(|listener| listener.on_persist(self, event))
            .collect();
        CompletionHandle::all(handles)
    }

    pub fn fire_delete(&mut self, event: &mut DeleteEvent) -> CompletionHandle<()> {
        let listeners = Arc::clone(&self.shared.listeners);
        let handles = listeners
            .delete
            .iter()
            .map(|listener| listener.on_delete(self, event))
            .collect();
        CompletionHandle::all(handles)
    }

    pub fn fire_flush(&mut self, event: &mut FlushEvent) -> CompletionHandle<()> {
        let listeners = Arc::clone(&self.shared.listeners);
        let handles = listeners
            .flush
            .iter()
            .map(|listener| listener.on_flush(self, event))
            .collect();
        CompletionHandle::all(handles)
    }

    pub fn fire_load(&mut self, event: &mut LoadEvent) -> CompletionHandle<Option<EntityRef>> {
        let listeners = Arc::clone(&self.shared.listeners);
        for listener in &listeners.load {
            if let Some(handle) = listener.on_load(self, event) {
                return handle;
            }
        }
        CompletionHandle::failed(PersistError::IllegalState(format!(
            "No load listener answered the load of '{}'",
            event.descriptor.entity_name()
        )))
    }

    pub fn fire_merge(&mut self, event: &mut MergeEvent) -> CompletionHandle<EntityRef> {
        let listeners = Arc::clone(&self.shared.listeners);
        for listener in &listeners.merge {
            if let Some(handle) = listener.on_merge(self, event) {
                return handle;
            }
        }
        CompletionHandle::failed(PersistError::IllegalState(
            "No merge listener answered the merge".to_string(),
        ))
    }

    pub fn flush(&mut self) -> CompletionHandle<()> {
        self.fire_flush(&mut FlushEvent::new())
    }

    /// Flushes when the factory was built with `auto_flush`, unless a unit
    /// of work is running.
    pub fn flush_if_auto(&mut self) -> CompletionHandle<()> {
        if self.settings().auto_flush && self.transaction.is_none() {
            self.fire_flush(&mut FlushEvent::auto())
        } else {
            CompletionHandle::completed(())
        }
    }

    /// Runs `continuation` on the sequencer once `handle` settled.
    ///
    /// The continuation gets the outcome either way. If the session is gone
    /// by then the returned handle fails with `SessionClosed`.
    pub fn resume_after<T, U, K>(
        &self,
        handle: CompletionHandle<T>,
        label: &'static str,
        continuation: K,
    ) -> CompletionHandle<U>
    where
        T: Send + 'static,
        U: Send + 'static,
        K: FnOnce(&mut SessionCore, Result<T>) -> CompletionHandle<U> + Send + 'static,
    {
        let (completer, resumed) = CompletionHandle::pending(label);
        let mailbox = self.mailbox.clone();
        handle.when_complete(move |outcome| {
            let Some(sender) = mailbox.upgrade() else {
                completer.fail(PersistError::SessionClosed);
                return;
            };
            let job: Job = Box::new(move |core: &mut SessionCore| {
                continuation(core, outcome).forward_to(completer);
            });
            // A refused job drops its completer, which abandons the handle.
            let _ = sender.send(SessionCommand::Run(job));
        });
        resumed
    }

    /// Hands every queued action to the executor as one batch.
    ///
    /// Batches of a session run strictly one after another. The returned
    /// handle resolves after every action of the batch settled on the
    /// sequencer; with nothing queued it resolves once earlier batches are done.
    pub fn execute_pending_actions(&mut self) -> CompletionHandle<()> {
        let mut batch = self.queue.drain_batch();
        let previous = self.tail.take();

        if batch.is_empty() {
            let Some(previous) = previous else {
                self.statistics.record_flush();
                return CompletionHandle::completed(());
            };
            self.tail = Some(previous.clone());
            let statistics = Arc::clone(&self.statistics);
            return CompletionHandle::from_future(async move {
                previous.await;
                statistics.record_flush();
                Ok(())
            });
        }

        let Some(mailbox) = self.mailbox.upgrade() else {
            batch.clear();
            return CompletionHandle::failed(PersistError::SessionClosed);
        };

        let (done_tx, done_rx) = oneshot::channel::<()>();
        let tail: Tail = async move {
            let _ = done_rx.await;
        }
        .boxed()
        .shared();
        self.tail = Some(tail);

        let (completer, flushed) = CompletionHandle::pending("flush");
        let executor = Arc::clone(&self.shared.executor);
        let span = info_span!(
            "rxorm.flush",
            session = self.id,
            inserts = batch.number_of_insertions(),
            deletes = batch.number_of_deletions(),
            updates = batch.number_of_updates()
        );

        tokio::spawn(
            async move {
                if let Some(previous) = previous {
                    previous.await;
                }
                let settle_mailbox = mailbox.clone();
                let report = batch
                    .execute_actions(&*executor, move |action, result| {
                        let job: Job = Box::new(move |core: &mut SessionCore| action.settle(core, result));
                        let _ = settle_mailbox.send(SessionCommand::Run(job));
                    })
                    .await;
                log_report(&report);

                let job: Job = Box::new(move |core: &mut SessionCore| {
                    core.statistics.record_flush();
                    completer.settle(report.into_result());
                });
                let _ = mailbox.send(SessionCommand::Run(job));
                let _ = done_tx.send(());
            }
            .instrument(span),
        );
        flushed
    }

    /// Completes once every batch executed so far settled.
    pub(crate) fn idle(&self) -> CompletionHandle<()> {
        match self.tail.clone() {
            Some(tail) => CompletionHandle::from_future(async move {
                tail.await;
                Ok(())
            }),
            None => CompletionHandle::completed(()),
        }
    }

    pub(crate) fn begin_transaction(&mut self) -> Result<()> {
        if self.transaction.is_some() {
            return Err(PersistError::IllegalState(
                "a transaction is already active".to_string(),
            ));
        }
        self.transaction = Some(self.queue.last_action_id());
        event!(Level::DEBUG, session = self.id, "transaction begun");
        Ok(())
    }

    pub(crate) fn commit_transaction(&mut self) -> CompletionHandle<()> {
        self.transaction = None;
        event!(Level::DEBUG, session = self.id, "transaction committing");
        self.flush()
    }

    /// Fails the actions queued since the transaction began, running their
    /// settle hooks so context entries are rolled back as well.
    pub(crate) fn rollback_transaction(&mut self) {
        let Some(mark) = self.transaction.take() else {
            return;
        };
        let dropped = self.queue.take_after(mark);
        event!(
            Level::DEBUG,
            session = self.id,
            dropped = dropped.len(),
            "transaction rolled back"
        );
        for action in dropped {
            action.settle(
                self,
                Err(PersistError::Abandoned("rolled back".to_string())),
            );
        }
    }

    /// Drops every entry and every queued action.
    pub(crate) fn clear(&mut self) {
        self.transaction = None;
        let abandoned = self.queue.len();
        self.queue.clear();
        self.context.clear();
        if abandoned > 0 {
            event!(Level::DEBUG, session = self.id, abandoned, "pending actions abandoned");
        }
    }

    pub(crate) fn close(&mut self) {
        self.clear();
        self.closed = true;
    }
}

fn log_report(report: &BatchReport) {
    if report.is_success() {
        event!(
            Level::DEBUG,
            total = report.total,
            inserts = report.inserts,
            deletes = report.deletes,
            updates = report.updates,
            "batch executed"
        );
    } else {
        event!(
            Level::WARN,
            total = report.total,
            failed = report.failed,
            "batch executed with failures"
        );
    }
}

/// Sequencer loop: runs jobs in arrival order until every sender is gone.
pub(crate) async fn run_sequencer(
    mut core: SessionCore,
    mut mailbox: mpsc::UnboundedReceiver<SessionCommand>,
) {
    event!(Level::DEBUG, session = core.id, "session opened");
    while let Some(command) = mailbox.recv().await {
        match command {
            SessionCommand::Run(job) => job(&mut core),
        }
    }
    core.clear();
    event!(Level::DEBUG, session = core.id, "session finished");
}
