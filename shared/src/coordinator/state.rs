use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

use super::MutationTarget;
use crate::model::{Entity, EntityId, MutationInput, OperationKind};
use crate::remote::RemoteFailure;
use crate::UnixTimeMs;

/// The single application-wide "mutation in flight" marker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingSlot {
    pub entity_id: Option<EntityId>,
    pub entity_name: Option<String>,
    pub operation: Option<OperationKind>,
    pub is_working: bool,
    pub is_success: bool,
}

impl WorkingSlot {
    #[must_use]
    pub fn idle() -> Self {
        Self::default()
    }

    pub(crate) fn started(target: &MutationTarget) -> Self {
        Self {
            entity_id: Some(target.entity_id.clone()),
            entity_name: Some(target.entity_name.clone()),
            operation: Some(target.operation),
            is_working: true,
            is_success: false,
        }
    }

    #[must_use]
    pub fn is_for(&self, entity_id: &EntityId) -> bool {
        self.entity_id.as_ref() == Some(entity_id)
    }

    #[must_use]
    pub fn is_working_on(&self, entity_id: &EntityId) -> bool {
        self.is_working && self.is_for(entity_id)
    }
}

/// The last failed attempt for one entity+operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub input: MutationInput,
    pub message: String,
    #[serde(default)]
    pub field_errors: BTreeMap<String, Vec<String>>,
    pub recorded_at: UnixTimeMs,
    /// Monotonic write counter, assigned by the coordinator.
    #[serde(default)]
    pub revision: u64,
}

impl ErrorRecord {
    pub fn new(input: MutationInput, message: impl Into<String>) -> Self {
        Self {
            input,
            message: message.into(),
            field_errors: BTreeMap::new(),
            recorded_at: UnixTimeMs::now(),
            revision: 0,
        }
    }

    #[must_use]
    pub fn from_failure(input: MutationInput, failure: RemoteFailure) -> Self {
        Self {
            field_errors: failure.field_errors,
            ..Self::new(input, failure.message)
        }
    }

    #[must_use]
    pub fn with_field_errors(mut self, field_errors: BTreeMap<String, Vec<String>>) -> Self {
        self.field_errors = field_errors;
        self
    }
}

pub type ErrorCache = BTreeMap<EntityId, BTreeMap<OperationKind, ErrorRecord>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeKind {
    Success,
    Error,
}

/// The one user-visible outcome message of a settled mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub id: Uuid,
    pub kind: NoticeKind,
    pub entity_id: EntityId,
    pub operation: OperationKind,
    pub message: String,
}

impl Notice {
    pub(crate) fn new(
        kind: NoticeKind,
        target: &MutationTarget,
        message: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            entity_id: target.entity_id.clone(),
            operation: target.operation,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkStats {
    pub succeeded: u64,
    pub failed: u64,
    pub rejected: u64,
}

/// Immutable snapshot of everything the coordinator tracks.
///
/// Every update builds a new snapshot from a copy of the previous one, so a
/// held `Arc<CoordinatorState>` never changes underneath its reader.
pub struct CoordinatorState<E> {
    pub selected_entity: Option<Arc<E>>,
    pub open_operation: Option<OperationKind>,
    pub working: WorkingSlot,
    pub error_cache: ErrorCache,
    pub error_entity_names: BTreeMap<EntityId, String>,
    /// A view close was requested while a mutation was in flight.
    pub pending_close: bool,
    pub last_notice: Option<Notice>,
    pub stats: WorkStats,
    pub version: u64,
}

impl<E> Default for CoordinatorState<E> {
    fn default() -> Self {
        Self {
            selected_entity: None,
            open_operation: None,
            working: WorkingSlot::idle(),
            error_cache: ErrorCache::new(),
            error_entity_names: BTreeMap::new(),
            pending_close: false,
            last_notice: None,
            stats: WorkStats::default(),
            version: 0,
        }
    }
}

impl<E> Clone for CoordinatorState<E> {
    fn clone(&self) -> Self {
        Self {
            selected_entity: self.selected_entity.clone(),
            open_operation: self.open_operation,
            working: self.working.clone(),
            error_cache: self.error_cache.clone(),
            error_entity_names: self.error_entity_names.clone(),
            pending_close: self.pending_close,
            last_notice: self.last_notice.clone(),
            stats: self.stats,
            version: self.version,
        }
    }
}

impl<E: Entity> fmt::Debug for CoordinatorState<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoordinatorState")
            .field("selected_entity", &self.selected_entity.as_ref().map(|e| e.id()))
            .field("open_operation", &self.open_operation)
            .field("working", &self.working)
            .field("error_cache", &self.error_cache)
            .field("pending_close", &self.pending_close)
            .field("stats", &self.stats)
            .field("version", &self.version)
            .finish_non_exhaustive()
    }
}

impl<E: Entity> CoordinatorState<E> {
    #[must_use]
    pub fn selected_entity_id(&self) -> Option<EntityId> {
        self.selected_entity.as_ref().map(|e| e.id())
    }

    #[must_use]
    pub fn is_open_for(&self, entity_id: &EntityId, operation: OperationKind) -> bool {
        self.open_operation == Some(operation)
            && self.selected_entity_id().as_ref() == Some(entity_id)
    }

    /// True when nothing but the version differs.
    pub(crate) fn same_content(&self, other: &Self) -> bool {
        let same_selection = match (&self.selected_entity, &other.selected_entity) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        };
        same_selection
            && self.open_operation == other.open_operation
            && self.working == other.working
            && self.error_cache == other.error_cache
            && self.error_entity_names == other.error_entity_names
            && self.pending_close == other.pending_close
            && self.last_notice == other.last_notice
            && self.stats == other.stats
    }
}

impl<E> CoordinatorState<E> {
    #[must_use]
    pub fn has_errors_for_entity(&self, entity_id: &EntityId) -> bool {
        self.error_cache.contains_key(entity_id)
    }

    #[must_use]
    pub fn has_error_for_operation(&self, entity_id: &EntityId, operation: OperationKind) -> bool {
        self.error_for(entity_id, operation).is_some()
    }

    #[must_use]
    pub fn error_for(
        &self,
        entity_id: &EntityId,
        operation: OperationKind,
    ) -> Option<&ErrorRecord> {
        self.error_cache.get(entity_id)?.get(&operation)
    }

    /// Number of entity+operation pairs with a cached failure.
    #[must_use]
    pub fn total_error_count(&self) -> usize {
        self.error_cache.values().map(BTreeMap::len).sum()
    }

    /// Banner text naming the entities with cached failures: `"Ana"` or
    /// `"Ana and 2 more"`.
    #[must_use]
    pub fn error_entity_display_name(&self) -> Option<String> {
        summarize_names(
            self.error_cache
                .keys()
                .filter_map(|id| self.error_entity_names.get(id))
                .map(String::as_str),
        )
    }

    pub(crate) fn insert_error(
        &mut self,
        entity_id: &EntityId,
        entity_name: &str,
        operation: OperationKind,
        record: ErrorRecord,
    ) {
        self.error_cache
            .entry(entity_id.clone())
            .or_default()
            .insert(operation, record);
        self.error_entity_names
            .insert(entity_id.clone(), entity_name.to_string());
    }

    /// Removes one operation's record, or all of them when `operation` is
    /// `None`. An entity with no records left is dropped from the cache.
    pub(crate) fn remove_errors(
        &mut self,
        entity_id: &EntityId,
        operation: Option<OperationKind>,
    ) -> Vec<ErrorRecord> {
        let removed = match operation {
            Some(operation) => {
                let Some(records) = self.error_cache.get_mut(entity_id) else {
                    return Vec::new();
                };
                records.remove(&operation).into_iter().collect()
            }
            None => self
                .error_cache
                .remove(entity_id)
                .map(|records| records.into_values().collect())
                .unwrap_or_default(),
        };

        if self
            .error_cache
            .get(entity_id)
            .is_some_and(BTreeMap::is_empty)
        {
            self.error_cache.remove(entity_id);
        }
        if !self.error_cache.contains_key(entity_id) {
            self.error_entity_names.remove(entity_id);
        }
        removed
    }

    pub(crate) fn clear_selection(&mut self) {
        self.selected_entity = None;
        self.open_operation = None;
        self.pending_close = false;
    }
}

/// `None` for no names, the name for one, `"<first> and <n> more"` otherwise.
#[must_use]
pub fn summarize_names<'a>(names: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let mut names = names.into_iter();
    let first = names.next()?;
    let rest = names.count();
    if rest == 0 {
        Some(first.to_string())
    } else {
        Some(format!("{first} and {rest} more"))
    }
}
