// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-flight download registry.
//!
//! Platform callbacks carry nothing but the task handle. This table maps
//! that handle back to the caller's record. It is the single source of
//! truth for "is this download still interesting": a handle that is not
//! present means every callback for it is ignored.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::record::PendingDownload;
use super::types::TaskId;
use crate::locks::resilient_lock;

/// Handle → record table behind a single lock.
#[derive(Debug, Default)]
pub(crate) struct InFlightRegistry {
    entries: Mutex<HashMap<TaskId, Arc<PendingDownload>>>,
}

impl InFlightRegistry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register a record. A stale record under the same handle is replaced
    /// and returned.
    pub(crate) fn insert(&self, id: TaskId, record: Arc<PendingDownload>) -> Option<Arc<PendingDownload>> {
        resilient_lock(&self.entries).insert(id, record)
    }

    pub(crate) fn lookup(&self, id: TaskId) -> Option<Arc<PendingDownload>> {
        resilient_lock(&self.entries).get(&id).cloned()
    }

    /// Remove a record. Removing an absent handle is a no-op.
    pub(crate) fn remove(&self, id: TaskId) -> Option<Arc<PendingDownload>> {
        resilient_lock(&self.entries).remove(&id)
    }

    pub(crate) fn contains(&self, id: TaskId) -> bool {
        resilient_lock(&self.entries).contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        resilient_lock(&self.entries).len()
    }

    pub(crate) fn task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = resilient_lock(&self.entries).keys().copied().collect();
        ids.sort();
        ids
    }
}
