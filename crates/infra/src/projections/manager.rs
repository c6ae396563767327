//! Registry and coordinator of the listeners attached to one event store.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

use chronicle_events::{EventListener, Projector};

use crate::applied_events::AppliedEventsLog;
use crate::event_store::EventStore;
use crate::listeners::{
    ApplyInterceptor, CatchUpError, CatchUpOutcome, EventListenerInvoker, ProgressCallback,
    ResetFn,
};

#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error("no listener registered under '{0}'")]
    UnknownListener(String),

    #[error("a listener is already registered under '{0}'")]
    DuplicateListener(String),

    #[error("listener '{listener_id}' handles {rust_type}, which has no registered event type")]
    UnregisteredEventType {
        listener_id: String,
        rust_type: &'static str,
    },

    #[error("listener '{0}' is not a projector and cannot be replayed")]
    NotAProjector(String),

    #[error("projector '{listener_id}' could not be reset")]
    Reset {
        listener_id: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error(transparent)]
    CatchUp(CatchUpError),
}

impl ProjectionError {
    pub fn is_contention(&self) -> bool {
        matches!(self, ProjectionError::CatchUp(err) if err.is_contention())
    }
}

impl From<CatchUpError> for ProjectionError {
    fn from(err: CatchUpError) -> Self {
        match err {
            CatchUpError::ResetFailed { listener_id, source } => {
                ProjectionError::Reset { listener_id, source }
            }
            other => ProjectionError::CatchUp(other),
        }
    }
}

/// Description of one registered listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerInfo {
    pub listener_id: String,
    /// Stored event-type names the listener has handlers for.
    pub event_types: Vec<String>,
    pub is_projector: bool,
}

#[async_trait]
trait ManagedListener: Send + Sync {
    fn info(&self) -> ListenerInfo;

    async fn catch_up(&self) -> Result<CatchUpOutcome, ProjectionError>;

    async fn replay(&self) -> Result<CatchUpOutcome, ProjectionError>;
}

struct Slot<L> {
    listener_id: String,
    listener: Mutex<L>,
    invoker: EventListenerInvoker<L>,
    reset_state: Option<ResetFn<L>>,
}

#[async_trait]
impl<L: EventListener> ManagedListener for Slot<L> {
    fn info(&self) -> ListenerInfo {
        ListenerInfo {
            listener_id: self.listener_id.clone(),
            event_types: self.invoker.applier().handled_event_types(),
            is_projector: self.reset_state.is_some(),
        }
    }

    async fn catch_up(&self) -> Result<CatchUpOutcome, ProjectionError> {
        let mut listener = self.listener.lock().await;
        Ok(self.invoker.catch_up(&mut listener).await?)
    }

    async fn replay(&self) -> Result<CatchUpOutcome, ProjectionError> {
        let reset_state = self
            .reset_state
            .ok_or_else(|| ProjectionError::NotAProjector(self.listener_id.clone()))?;

        let mut listener = self.listener.lock().await;
        Ok(self.invoker.replay_with_reset(&mut listener, reset_state).await?)
    }
}

/// Owns the listeners of one event store and runs catch-up/replay for them.
///
/// Listeners are registered explicitly at startup. Each one lives behind an
/// async mutex, so calls through the manager for the same listener queue up
/// in-process; across processes the applied-events reservation decides.
pub struct ProjectionManager {
    store: EventStore,
    log: Arc<dyn AppliedEventsLog>,
    interceptors: Vec<Arc<dyn ApplyInterceptor>>,
    progress: Option<ProgressCallback>,
    listeners: BTreeMap<String, Arc<dyn ManagedListener>>,
}

impl ProjectionManager {
    pub fn new(store: EventStore, log: Arc<dyn AppliedEventsLog>) -> Self {
        Self {
            store,
            log,
            interceptors: Vec::new(),
            progress: None,
            listeners: BTreeMap::new(),
        }
    }

    /// Interceptor installed on every listener registered after this call.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn ApplyInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    /// Progress callback installed on every listener registered after this call.
    pub fn with_progress(mut self, callback: ProgressCallback) -> Self {
        self.progress = Some(callback);
        self
    }

    pub fn event_store_id(&self) -> &str {
        self.store.id()
    }

    pub fn event_store(&self) -> &EventStore {
        &self.store
    }

    pub fn register_listener<L: EventListener>(&mut self, listener: L) -> Result<(), ProjectionError> {
        self.register(listener, None)
    }

    pub fn register_projector<P: Projector>(&mut self, projector: P) -> Result<(), ProjectionError> {
        self.register(projector, Some(P::reset))
    }

    fn register<L: EventListener>(
        &mut self,
        listener: L,
        reset_state: Option<ResetFn<L>>,
    ) -> Result<(), ProjectionError> {
        let listener_id = listener.listener_id().to_string();
        if self.listeners.contains_key(&listener_id) {
            return Err(ProjectionError::DuplicateListener(listener_id));
        }

        let mut invoker = EventListenerInvoker::new(self.store.clone(), self.log.clone());
        if let Some(rust_type) = invoker.applier().unnamed_handler_types().into_iter().next() {
            return Err(ProjectionError::UnregisteredEventType {
                listener_id,
                rust_type,
            });
        }
        for interceptor in &self.interceptors {
            invoker = invoker.with_interceptor(interceptor.clone());
        }
        if let Some(progress) = &self.progress {
            invoker = invoker.with_progress(progress.clone());
        }

        let slot = Slot {
            listener_id: listener_id.clone(),
            listener: Mutex::new(listener),
            invoker,
            reset_state,
        };
        info!(
            listener_id = %listener_id,
            event_store_id = %self.store.id(),
            projector = slot.reset_state.is_some(),
            "listener registered"
        );
        self.listeners.insert(listener_id, Arc::new(slot));
        Ok(())
    }

    /// Registered listeners, ordered by id.
    pub fn projections(&self) -> Vec<ListenerInfo> {
        self.listeners.values().map(|l| l.info()).collect()
    }

    /// Stored event-type name → ids of the listeners handling it.
    pub fn subscriptions(&self) -> BTreeMap<String, Vec<String>> {
        let mut subscriptions: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for info in self.projections() {
            for event_type in info.event_types {
                subscriptions
                    .entry(event_type)
                    .or_default()
                    .push(info.listener_id.clone());
            }
        }
        subscriptions
    }

    pub async fn catch_up(&self, listener_id: &str) -> Result<CatchUpOutcome, ProjectionError> {
        self.slot(listener_id)?.catch_up().await
    }

    /// Catch up every listener, one after the other. A failing listener does
    /// not stop the others.
    pub async fn catch_up_all(&self) -> Vec<(String, Result<CatchUpOutcome, ProjectionError>)> {
        let mut results = Vec::with_capacity(self.listeners.len());
        for (listener_id, slot) in &self.listeners {
            let result = slot.catch_up().await;
            if let Err(err) = &result {
                if !err.is_contention() {
                    warn!(listener_id = %listener_id, error = %err, "catch-up failed");
                }
            }
            results.push((listener_id.clone(), result));
        }
        results
    }

    /// Reset a projector's read model and mark, then rebuild it from the first event.
    pub async fn replay(&self, listener_id: &str) -> Result<CatchUpOutcome, ProjectionError> {
        self.slot(listener_id)?.replay().await
    }

    /// Replay every registered projector; plain listeners are left alone.
    pub async fn replay_all(&self) -> Vec<(String, Result<CatchUpOutcome, ProjectionError>)> {
        let mut results = Vec::new();
        for (listener_id, slot) in &self.listeners {
            if !slot.info().is_projector {
                continue;
            }
            let result = slot.replay().await;
            if let Err(err) = &result {
                warn!(listener_id = %listener_id, error = %err, "replay failed");
            }
            results.push((listener_id.clone(), result));
        }
        results
    }

    fn slot(&self, listener_id: &str) -> Result<&Arc<dyn ManagedListener>, ProjectionError> {
        self.listeners
            .get(listener_id)
            .ok_or_else(|| ProjectionError::UnknownListener(listener_id.to_string()))
    }
}

impl core::fmt::Debug for ProjectionManager {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProjectionManager")
            .field("event_store_id", &self.store.id())
            .field("listeners", &self.listeners.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
