use std::sync::Arc;

use super::Coordinator;
use crate::model::{Entity, EntityId, MutationInput, OperationKind};

/// Presentation-side handle of an action sheet (payment form, delete
/// confirmation, ...). Implemented by the shell.
pub trait OperationView: Send + Sync {
    fn open(&self);
    fn close(&self);
}

/// Open/close pair for one operation kind, bound to the shared coordinator.
///
/// Any number of sheets may exist for the same kind; they all read and write
/// the same coordinator state and so always agree.
pub struct OperationSheet<E: Entity> {
    coordinator: Coordinator<E>,
    kind: OperationKind,
}

impl<E: Entity> Clone for OperationSheet<E> {
    fn clone(&self) -> Self {
        Self {
            coordinator: self.coordinator.clone(),
            kind: self.kind,
        }
    }
}

impl<E: Entity> OperationSheet<E> {
    pub(crate) fn new(coordinator: Coordinator<E>, kind: OperationKind) -> Self {
        Self { coordinator, kind }
    }

    #[must_use]
    pub const fn kind(&self) -> OperationKind {
        self.kind
    }

    pub fn open(&self, entity: Arc<E>, view: Arc<dyn OperationView>) {
        self.coordinator.open_operation(entity, self.kind, view);
    }

    /// Closes the sheet if this kind is the one open. Returns `false` when
    /// the close was deferred because a mutation is still running.
    pub fn close(&self) -> bool {
        if self.coordinator.snapshot().open_operation != Some(self.kind) {
            return true;
        }
        self.coordinator.close_if_idle()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.coordinator.snapshot().open_operation == Some(self.kind)
    }

    #[must_use]
    pub fn is_open_for(&self, entity_id: &EntityId) -> bool {
        self.coordinator.snapshot().is_open_for(entity_id, self.kind)
    }

    /// Values to pre-fill the form with for `entity_id`: the cached failed
    /// attempt when there is one, otherwise `None` (use live entity data).
    #[must_use]
    pub fn attempted_input(&self, entity_id: &EntityId) -> Option<MutationInput> {
        self.coordinator.attempted_input(entity_id, self.kind)
    }
}
