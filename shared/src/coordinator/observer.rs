//! Selector-based change notification.
//!
//! An observer keeps the last value its selector produced and its callback
//! only runs when a newer snapshot selects something different. Snapshots
//! older than the last one seen are ignored, so out-of-order delivery from
//! concurrent commits cannot roll a consumer back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use super::state::CoordinatorState;

pub(crate) trait Observer<E>: Send + Sync {
    fn notify(&self, state: &CoordinatorState<E>);
}

struct Seen<S> {
    version: u64,
    value: S,
}

pub(crate) struct SelectorObserver<S, Sel, Cb> {
    selector: Sel,
    callback: Cb,
    seen: Mutex<Seen<S>>,
}

impl<S, Sel, Cb> SelectorObserver<S, Sel, Cb> {
    pub(crate) fn new(selector: Sel, callback: Cb, version: u64, initial: S) -> Self {
        Self {
            selector,
            callback,
            seen: Mutex::new(Seen {
                version,
                value: initial,
            }),
        }
    }
}

impl<E, S, Sel, Cb> Observer<E> for SelectorObserver<S, Sel, Cb>
where
    S: PartialEq + Clone + Send + Sync,
    Sel: Fn(&CoordinatorState<E>) -> S + Send + Sync,
    Cb: Fn(&S) + Send + Sync,
{
    fn notify(&self, state: &CoordinatorState<E>) {
        let next = (self.selector)(state);
        {
            let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
            if state.version <= seen.version {
                return;
            }
            seen.version = state.version;
            if seen.value == next {
                return;
            }
            seen.value = next.clone();
        }
        (self.callback)(&next);
    }
}

/// Sees every committed snapshot, in version order.
pub(crate) struct VersionObserver<Cb> {
    callback: Cb,
    seen: Mutex<u64>,
}

impl<Cb> VersionObserver<Cb> {
    pub(crate) fn new(callback: Cb, version: u64) -> Self {
        Self {
            callback,
            seen: Mutex::new(version),
        }
    }
}

impl<E, Cb> Observer<E> for VersionObserver<Cb>
where
    Cb: Fn(&CoordinatorState<E>) + Send + Sync,
{
    fn notify(&self, state: &CoordinatorState<E>) {
        {
            let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
            if state.version <= *seen {
                return;
            }
            *seen = state.version;
        }
        (self.callback)(state);
    }
}

pub(crate) trait Deregister: Send + Sync {
    fn deregister(&self, id: u64);
}

pub(crate) struct ObserverRegistry<E> {
    next_id: AtomicU64,
    observers: Mutex<Vec<(u64, Arc<dyn Observer<E>>)>>,
}

impl<E: 'static> ObserverRegistry<E> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            observers: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn register(self: &Arc<Self>, observer: Arc<dyn Observer<E>>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, observer));

        let registry: Arc<dyn Deregister> = Arc::clone(self) as Arc<dyn Deregister>;
        Subscription {
            id,
            registry: Arc::downgrade(&registry),
        }
    }

    /// Runs every observer against `state`. Must be called without holding
    /// the coordinator lock; callbacks may call back into the coordinator.
    pub(crate) fn notify_all(&self, state: &CoordinatorState<E>) {
        let observers: Vec<Arc<dyn Observer<E>>> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect();

        for observer in observers {
            observer.notify(state);
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<E: 'static> Deregister for ObserverRegistry<E> {
    fn deregister(&self, id: u64) {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(observer_id, _)| *observer_id != id);
    }
}

/// Keeps an observer registered until dropped.
#[must_use = "dropping a Subscription unsubscribes immediately"]
pub struct Subscription {
    id: u64,
    registry: Weak<dyn Deregister>,
}

impl Subscription {
    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.deregister(self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Member;
    use std::sync::atomic::AtomicUsize;

    fn with_version(version: u64, open: bool) -> CoordinatorState<Member> {
        CoordinatorState {
            pending_close: open,
            version,
            ..CoordinatorState::default()
        }
    }

    fn counting_observer(
        hits: &Arc<AtomicUsize>,
    ) -> Arc<dyn Observer<Member>> {
        let hits = Arc::clone(hits);
        Arc::new(SelectorObserver::new(
            |state: &CoordinatorState<Member>| state.pending_close,
            move |_: &bool| {
                hits.fetch_add(1, Ordering::SeqCst);
            },
            0,
            false,
        ))
    }

    #[test]
    fn test_callback_only_on_slice_change() {
        let registry = Arc::new(ObserverRegistry::<Member>::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let _sub = registry.register(counting_observer(&hits));

        registry.notify_all(&with_version(1, false));
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        registry.notify_all(&with_version(2, true));
        registry.notify_all(&with_version(3, true));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stale_snapshot_ignored() {
        let registry = Arc::new(ObserverRegistry::<Member>::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let _sub = registry.register(counting_observer(&hits));

        registry.notify_all(&with_version(5, true));
        registry.notify_all(&with_version(4, false));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_drop_deregisters() {
        let registry = Arc::new(ObserverRegistry::<Member>::new());
        let hits = Arc::new(AtomicUsize::new(0));

        let sub = registry.register(counting_observer(&hits));
        assert_eq!(registry.len(), 1);
        sub.unsubscribe();
        assert_eq!(registry.len(), 0);

        registry.notify_all(&with_version(1, true));
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_version_observer_sees_each_commit_once() {
        let registry = Arc::new(ObserverRegistry::<Member>::new());
        let versions = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&versions);
        let _sub = registry.register(Arc::new(VersionObserver::new(
            move |state: &CoordinatorState<Member>| sink.lock().unwrap().push(state.version),
            0,
        )));

        registry.notify_all(&with_version(1, false));
        registry.notify_all(&with_version(1, false));
        registry.notify_all(&with_version(3, false));
        registry.notify_all(&with_version(2, true));

        assert_eq!(*versions.lock().unwrap(), vec![1, 3]);
    }

    #[test]
    fn test_subscription_outliving_registry_is_harmless() {
        let registry = Arc::new(ObserverRegistry::<Member>::new());
        let hits = Arc::new(AtomicUsize::new(0));
        let sub = registry.register(counting_observer(&hits));
        drop(registry);
        drop(sub);
    }
}
