use super::Session;
use super::core::{SessionCore, run_sequencer};
use super::settings::Settings;
use super::statistics::{Statistics, StatisticsSnapshot};
use crate::connection::ConnectionProvider;
use crate::core::{PersistError, Result};
use crate::event::{
    DeleteEventListener, EventListeners, FlushEventListener, LoadEventListener,
    MergeEventListener, PersistEventListener,
};
use crate::executor::MutationExecutor;
use crate::metamodel::{Entity, Metamodel};
use crate::sql::{PgStatementCompiler, StatementCompiler};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{Level, event};

/// Everything sessions of one factory share. Immutable once built.
pub(crate) struct FactoryShared {
    pub(crate) metamodel: Metamodel,
    pub(crate) executor: Arc<MutationExecutor>,
    pub(crate) settings: Settings,
    pub(crate) listeners: Arc<EventListeners>,
    pub(crate) statistics: Arc<Statistics>,
    next_session: AtomicU64,
}

/// Opens sessions over one metamodel, compiler and connection provider.
#[derive(Clone)]
pub struct SessionFactory {
    shared: Arc<FactoryShared>,
}

impl SessionFactory {
    pub fn builder() -> SessionFactoryBuilder {
        SessionFactoryBuilder::default()
    }

    /// Spawns a session sequencer on the current tokio runtime.
    pub fn open_session(&self) -> Result<Session> {
        let runtime = Handle::try_current().map_err(|_| {
            PersistError::IllegalState("Sessions must be opened inside a tokio runtime".to_string())
        })?;

        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        let statistics = Arc::new(Statistics::child_of(Arc::clone(&self.shared.statistics)));
        let (sender, receiver) = mpsc::unbounded_channel();
        let core = SessionCore::new(
            id,
            Arc::clone(&self.shared),
            sender.downgrade(),
            Arc::clone(&statistics),
        );
        runtime.spawn(run_sequencer(core, receiver));

        Ok(Session::new(id, sender, statistics))
    }

    pub fn metamodel(&self) -> &Metamodel {
        &self.shared.metamodel
    }

    pub fn settings(&self) -> &Settings {
        &self.shared.settings
    }

    /// Totals over every session opened by this factory.
    pub fn statistics(&self) -> StatisticsSnapshot {
        self.shared.statistics.snapshot()
    }
}

type Registration = Box<dyn FnOnce(&mut Metamodel) -> Result<()> + Send>;

#[derive(Default)]
pub struct SessionFactoryBuilder {
    registrations: Vec<Registration>,
    compiler: Option<Arc<dyn StatementCompiler>>,
    provider: Option<Arc<dyn ConnectionProvider>>,
    settings: Settings,
    listeners: Vec<Box<dyn FnOnce(&mut EventListeners) + Send>>,
}

impl SessionFactoryBuilder {
    pub fn register<E: Entity>(mut self) -> Self {
        self.registrations
            .push(Box::new(|metamodel| metamodel.register::<E>().map(|_| ())));
        self
    }

    /// Defaults to [`PgStatementCompiler`] configured from the settings.
    pub fn compiler(mut self, compiler: Arc<dyn StatementCompiler>) -> Self {
        self.compiler = Some(compiler);
        self
    }

    pub fn provider(mut self, provider: Arc<dyn ConnectionProvider>) -> Self {
        self.provider = Some(provider);
        self
    }

    pub fn settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn persist_listener(mut self, listener: Arc<dyn PersistEventListener>) -> Self {
        self.listeners
            .push(Box::new(move |listeners| listeners.append_persist(listener)));
        self
    }

    pub fn delete_listener(mut self, listener: Arc<dyn DeleteEventListener>) -> Self {
        self.listeners
            .push(Box::new(move |listeners| listeners.append_delete(listener)));
        self
    }

    pub fn load_listener(mut self, listener: Arc<dyn LoadEventListener>) -> Self {
        self.listeners
            .push(Box::new(move |listeners| listeners.append_load(listener)));
        self
    }

    pub fn flush_listener(mut self, listener: Arc<dyn FlushEventListener>) -> Self {
        self.listeners
            .push(Box::new(move |listeners| listeners.append_flush(listener)));
        self
    }

    pub fn merge_listener(mut self, listener: Arc<dyn MergeEventListener>) -> Self {
        self.listeners
            .push(Box::new(move |listeners| listeners.append_merge(listener)));
        self
    }

    pub fn build(self) -> Result<SessionFactory> {
        self.settings.validate()?;

        let mut metamodel = Metamodel::new();
        for registration in self.registrations {
            registration(&mut metamodel)?;
        }
        metamodel.validate()?;

        let provider = self.provider.ok_or_else(|| {
            PersistError::Configuration("A connection provider is required".to_string())
        })?;
        let compiler = self.compiler.unwrap_or_else(|| {
            Arc::new(PgStatementCompiler::new(
                self.settings.placeholder_style,
                self.settings.statement_cache_size,
            ))
        });

        let mut listeners = EventListeners::with_defaults();
        for append in self.listeners {
            append(&mut listeners);
        }

        event!(
            Level::INFO,
            entities = metamodel.len(),
            auto_flush = self.settings.auto_flush,
            "session factory built"
        );
        Ok(SessionFactory {
            shared: Arc::new(FactoryShared {
                metamodel,
                executor: Arc::new(MutationExecutor::new(compiler, provider)),
                settings: self.settings,
                listeners: Arc::new(listeners),
                statistics: Arc::new(Statistics::new()),
                next_session: AtomicU64::new(0),
            }),
        })
    }
}
