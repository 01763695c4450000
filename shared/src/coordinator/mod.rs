//! Optimistic mutation coordinator.
//!
//! One [`Coordinator`] is created per client session and shared by handle.
//! It serializes write operations across the whole application (at most one
//! mutation in flight), remembers the last failed attempt per
//! entity+operation so forms can be re-populated, and publishes immutable
//! snapshots to selector-based observers.
//!
//! Lifecycle of one (entity, operation) pair:
//!
//! ```text
//! Idle -> Working -> Succeeded -> Idle        (after the close delay)
//!                 -> Failed    -> Idle        (error record cached)
//! ```

mod observer;
mod sheet;
mod state;

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

use crate::model::{Entity, EntityId, MutationInput, OperationKind};
use crate::remote::{MutationEndpoint, RemoteFailure};
use crate::{truncate_utf8_safe, ConfigError, MAX_ERROR_MESSAGE_LENGTH, SUCCESS_CLOSE_DELAY};

use observer::{Observer, ObserverRegistry, SelectorObserver, VersionObserver};

pub use observer::Subscription;
pub use sheet::{OperationSheet, OperationView};
pub use state::{
    summarize_names, CoordinatorState, ErrorCache, ErrorRecord, Notice, NoticeKind, WorkStats,
    WorkingSlot,
};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// How long a successful mutation stays visible before its view closes.
    /// Zero closes immediately.
    pub success_close_delay_ms: u64,
    pub max_error_message_len: usize,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            success_close_delay_ms: u64::try_from(SUCCESS_CLOSE_DELAY.as_millis())
                .unwrap_or(u64::MAX),
            max_error_message_len: MAX_ERROR_MESSAGE_LENGTH,
        }
    }
}

impl CoordinatorConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_error_message_len == 0 {
            return Err(ConfigError::MustBePositive {
                field: "max_error_message_len",
            });
        }
        Ok(())
    }

    #[must_use]
    pub const fn success_close_delay(&self) -> Duration {
        Duration::from_millis(self.success_close_delay_ms)
    }
}

/// The entity+operation a mutation is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MutationTarget {
    pub entity_id: EntityId,
    pub entity_name: String,
    pub operation: OperationKind,
}

impl MutationTarget {
    pub fn new(
        entity_id: impl Into<EntityId>,
        entity_name: impl Into<String>,
        operation: OperationKind,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            entity_name: entity_name.into(),
            operation,
        }
    }

    pub fn for_entity<E: Entity>(entity: &E, operation: OperationKind) -> Self {
        Self::new(entity.id(), entity.display_name(), operation)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkOutcome {
    /// Another mutation was in flight; the effect never ran.
    Rejected,
    Succeeded,
    Failed,
}

#[derive(Default)]
struct Control {
    /// View of the currently open operation.
    active_view: Option<Arc<dyn OperationView>>,
    /// View that was open when the running (or last successful) work began.
    work_view: Option<Arc<dyn OperationView>>,
    close_task: Option<JoinHandle<()>>,
    work_seq: u64,
    next_revision: u64,
}

struct Core<E> {
    state: Arc<CoordinatorState<E>>,
    control: Control,
}

struct Inner<E> {
    core: Mutex<Core<E>>,
    observers: Arc<ObserverRegistry<E>>,
    config: CoordinatorConfig,
}

/// Cloneable handle to the session's coordination state.
pub struct Coordinator<E: Entity> {
    inner: Arc<Inner<E>>,
}

impl<E: Entity> Clone for Coordinator<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: Entity> std::fmt::Debug for Coordinator<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("state", &self.snapshot())
            .field("config", &self.inner.config)
            .finish()
    }
}

type ViewToClose = Option<Arc<dyn OperationView>>;

fn same_view(a: &Arc<dyn OperationView>, b: &Arc<dyn OperationView>) -> bool {
    std::ptr::eq(Arc::as_ptr(a).cast::<()>(), Arc::as_ptr(b).cast::<()>())
}

fn close_view(view: ViewToClose) {
    if let Some(view) = view {
        view.close();
    }
}

/// Ends a success phase: the slot goes idle and, if the view the work ran
/// under is still the open one, the selection is dropped and that view is
/// returned so the caller can close it outside the lock.
fn finish_success_locked<E>(state: &mut CoordinatorState<E>, control: &mut Control) -> ViewToClose {
    state.working = WorkingSlot::idle();
    let view = control.work_view.take()?;
    let still_open = control
        .active_view
        .as_ref()
        .is_some_and(|active| same_view(active, &view));
    if !still_open {
        return None;
    }
    state.clear_selection();
    control.active_view = None;
    Some(view)
}

/// Releases the working slot if the effect is dropped before settling.
struct WorkToken<'a, E: Entity> {
    coordinator: &'a Coordinator<E>,
    seq: u64,
    armed: bool,
}

impl<E: Entity> Drop for WorkToken<'_, E> {
    fn drop(&mut self) {
        if self.armed {
            self.coordinator.abandon_work(self.seq);
        }
    }
}

impl<E: Entity> Coordinator<E> {
    pub fn new(config: CoordinatorConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self::from_valid_config(config))
    }

    #[must_use]
    pub fn with_defaults() -> Self {
        Self::from_valid_config(CoordinatorConfig::default())
    }

    fn from_valid_config(config: CoordinatorConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: Mutex::new(Core {
                    state: Arc::new(CoordinatorState::default()),
                    control: Control::default(),
                }),
                observers: Arc::new(ObserverRegistry::new()),
                config,
            }),
        }
    }

    #[must_use]
    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    fn lock(&self) -> MutexGuard<'_, Core<E>> {
        self.inner
            .core
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Applies `f` to a copy of the current snapshot and publishes it if
    /// anything changed. Observers run after the lock is released.
    fn update<R>(&self, f: impl FnOnce(&mut CoordinatorState<E>, &mut Control) -> R) -> R {
        let (result, published) = {
            let mut core = self.lock();
            let mut next = (*core.state).clone();
            let result = f(&mut next, &mut core.control);

            if next.same_content(&core.state) {
                (result, None)
            } else {
                next.version = core.state.version + 1;
                let next = Arc::new(next);
                core.state = Arc::clone(&next);
                (result, Some(next))
            }
        };

        if let Some(state) = published {
            self.inner.observers.notify_all(&state);
        }
        result
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<CoordinatorState<E>> {
        Arc::clone(&self.lock().state)
    }

    /// Selects `entity`, marks `operation` open and opens `view`.
    ///
    /// A success phase still waiting for its delayed close is finished on the
    /// spot, and a different view that was open gets closed first.
    pub fn open_operation(
        &self,
        entity: Arc<E>,
        operation: OperationKind,
        view: Arc<dyn OperationView>,
    ) {
        let entity_id = entity.id();
        let previous = self.update(|state, control| {
            if let Some(task) = control.close_task.take() {
                task.abort();
                if state.working.is_success {
                    state.working = WorkingSlot::idle();
                }
                control.work_view = None;
            }
            state.selected_entity = Some(entity);
            state.open_operation = Some(operation);
            state.pending_close = false;
            control.active_view.replace(Arc::clone(&view))
        });

        debug!(entity_id = %entity_id, operation = %operation, "operation opened");
        if let Some(previous) = previous {
            if !same_view(&previous, &view) {
                previous.close();
            }
        }
        view.open();
    }

    /// Handles a view close. While a mutation runs the close is deferred and
    /// `false` is returned; otherwise the selection is cleared.
    pub fn close_if_idle(&self) -> bool {
        self.update(|state, control| {
            if state.working.is_working {
                state.pending_close = true;
                return false;
            }
            if let Some(task) = control.close_task.take() {
                task.abort();
            }
            if state.working.is_success {
                state.working = WorkingSlot::idle();
            }
            control.work_view = None;
            control.active_view = None;
            state.clear_selection();
            true
        })
    }

    #[must_use]
    pub fn sheet(&self, kind: OperationKind) -> OperationSheet<E> {
        OperationSheet::new(self.clone(), kind)
    }

    /// Runs `effect` as the application's single in-flight mutation.
    ///
    /// The effect reports failure by recording an error for the target
    /// (see [`Coordinator::set_error`]); finishing without one is success.
    #[instrument(
        skip(self, effect),
        fields(entity_id = %target.entity_id, operation = %target.operation)
    )]
    pub async fn work<F, Fut>(&self, target: MutationTarget, effect: F) -> WorkOutcome
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = ()>,
    {
        let started = self.update(|state, control| {
            if state.working.is_working {
                state.stats.rejected += 1;
                return None;
            }

            let finished_view = match control.close_task.take() {
                Some(task) => {
                    task.abort();
                    finish_success_locked(state, control)
                }
                None => None,
            };

            state.working = WorkingSlot::started(&target);
            control.work_seq += 1;
            control.work_view = control.active_view.clone();
            Some((control.work_seq, control.next_revision, finished_view))
        });

        let Some((seq, start_revision, finished_view)) = started else {
            debug!("mutation rejected, another one is in flight");
            return WorkOutcome::Rejected;
        };
        close_view(finished_view);
        info!("mutation started");

        let mut token = WorkToken {
            coordinator: self,
            seq,
            armed: true,
        };
        effect().await;
        token.armed = false;

        self.settle(&target, seq, start_revision)
    }

    fn settle(&self, target: &MutationTarget, seq: u64, start_revision: u64) -> WorkOutcome {
        let delay = self.inner.config.success_close_delay();
        let weak = Arc::downgrade(&self.inner);

        let (outcome, view) = self.update(|state, control| {
            let failure = state
                .error_for(&target.entity_id, target.operation)
                .filter(|record| record.revision > start_revision)
                .map(|record| record.message.clone());

            if let Some(message) = failure {
                state.working = WorkingSlot::idle();
                state.stats.failed += 1;
                state.last_notice = Some(Notice::new(NoticeKind::Error, target, message));
                control.work_view = None;
                if state.pending_close {
                    state.clear_selection();
                    control.active_view = None;
                }
                return (WorkOutcome::Failed, None);
            }

            state.remove_errors(&target.entity_id, Some(target.operation));
            state.working.is_working = false;
            state.working.is_success = true;
            state.stats.succeeded += 1;
            state.last_notice = Some(Notice::new(
                NoticeKind::Success,
                target,
                format!(
                    "{} for {}",
                    target.operation.success_phrase(),
                    target.entity_name
                ),
            ));

            if state.pending_close {
                state.working = WorkingSlot::idle();
                state.clear_selection();
                control.active_view = None;
                control.work_view = None;
                return (WorkOutcome::Succeeded, None);
            }

            let runtime = tokio::runtime::Handle::try_current().ok();
            match runtime {
                Some(runtime) if !delay.is_zero() => {
                    control.close_task = Some(runtime.spawn(delayed_close(weak, seq, delay)));
                    (WorkOutcome::Succeeded, None)
                }
                _ => (WorkOutcome::Succeeded, finish_success_locked(state, control)),
            }
        });

        match outcome {
            WorkOutcome::Failed => warn!("mutation failed"),
            _ => info!("mutation succeeded"),
        }
        close_view(view);
        outcome
    }

    fn finish_success(&self, seq: u64) {
        let view = self.update(|state, control| {
            if control.work_seq != seq || !state.working.is_success {
                return None;
            }
            control.close_task = None;
            finish_success_locked(state, control)
        });
        close_view(view);
    }

    fn abandon_work(&self, seq: u64) {
        let abandoned = self.update(|state, control| {
            if control.work_seq != seq || !state.working.is_working {
                return false;
            }
            state.working = WorkingSlot::idle();
            control.work_view = None;
            if state.pending_close {
                state.clear_selection();
                control.active_view = None;
            }
            true
        });
        if abandoned {
            warn!(seq, "mutation dropped before settling, slot released");
        }
    }

    /// [`Coordinator::work`] around one endpoint call. A `success: false`
    /// reply or a failed call is recorded as the error for `target`.
    #[instrument(
        skip(self, input, endpoint),
        fields(entity_id = %target.entity_id, operation = %target.operation)
    )]
    pub async fn submit<M>(
        &self,
        target: MutationTarget,
        input: MutationInput,
        endpoint: &M,
    ) -> WorkOutcome
    where
        M: MutationEndpoint + ?Sized,
    {
        let effect_target = target.clone();
        self.work(target, move || async move {
            let failure = match endpoint.call(&effect_target.entity_id, &input).await {
                Ok(response) => response.into_result().err(),
                Err(e) => Some(RemoteFailure::from(&e)),
            };
            if let Some(failure) = failure {
                self.set_error_record(&effect_target, ErrorRecord::from_failure(input, failure));
            }
        })
        .await
    }

    /// Records (or overwrites) the failed attempt for `target`.
    pub fn set_error(
        &self,
        target: &MutationTarget,
        input: MutationInput,
        message: impl Into<String>,
    ) {
        self.set_error_record(target, ErrorRecord::new(input, message));
    }

    pub fn set_error_record(&self, target: &MutationTarget, mut record: ErrorRecord) {
        truncate_utf8_safe(&mut record.message, self.inner.config.max_error_message_len);
        warn!(
            entity_id = %target.entity_id,
            operation = %target.operation,
            message = %record.message,
            "mutation error recorded"
        );
        self.update(|state, control| {
            control.next_revision += 1;
            record.revision = control.next_revision;
            state.insert_error(&target.entity_id, &target.entity_name, target.operation, record);
        });
    }

    /// Drops the cached failure for one operation, or for every operation of
    /// the entity when `operation` is `None`. Returns whether anything was
    /// removed.
    pub fn clear_error(&self, entity_id: &EntityId, operation: Option<OperationKind>) -> bool {
        self.update(|state, _| !state.remove_errors(entity_id, operation).is_empty())
    }

    /// User-requested reset of a failed form: clears the record and hands it
    /// back so the caller can restore its values.
    pub fn reset_attempt(
        &self,
        entity_id: &EntityId,
        operation: OperationKind,
    ) -> Option<ErrorRecord> {
        self.update(|state, _| state.remove_errors(entity_id, Some(operation)).pop())
    }

    #[must_use]
    pub fn attempted_input(
        &self,
        entity_id: &EntityId,
        operation: OperationKind,
    ) -> Option<MutationInput> {
        self.snapshot()
            .error_for(entity_id, operation)
            .map(|record| record.input.clone())
    }

    /// Calls `callback` whenever the slice picked by `selector` changes.
    pub fn subscribe<S, Sel, Cb>(&self, selector: Sel, callback: Cb) -> Subscription
    where
        S: PartialEq + Clone + Send + Sync + 'static,
        Sel: Fn(&CoordinatorState<E>) -> S + Send + Sync + 'static,
        Cb: Fn(&S) + Send + Sync + 'static,
    {
        let current = self.snapshot();
        let initial = selector(&*current);
        let watcher = Arc::new(SelectorObserver::new(selector, callback, current.version, initial));
        let subscription = self.inner.observers.register(watcher.clone());
        // a commit between the snapshot and registration would otherwise be missed
        let latest = self.snapshot();
        Observer::<E>::notify(&*watcher, &*latest);
        subscription
    }

    /// Calls `callback` with every new snapshot.
    pub fn subscribe_all<Cb>(&self, callback: Cb) -> Subscription
    where
        Cb: Fn(&CoordinatorState<E>) + Send + Sync + 'static,
    {
        let current = self.snapshot();
        let watcher = Arc::new(VersionObserver::new(callback, current.version));
        let subscription = self.inner.observers.register(watcher.clone());
        let latest = self.snapshot();
        Observer::<E>::notify(&*watcher, &*latest);
        subscription
    }
}

impl<E: Entity> Default for Coordinator<E> {
    fn default() -> Self {
        Self::with_defaults()
    }
}

async fn delayed_close<E: Entity>(inner: Weak<Inner<E>>, seq: u64, delay: Duration) {
    tokio::time::sleep(delay).await;
    if let Some(inner) = inner.upgrade() {
        Coordinator { inner }.finish_success(seq);
    }
}
