//! Tagged persistent handles.
//!
//! Objects that must be torn down when their isolate shuts down are
//! registered here with a [`HandleKind`]. The shutdown sweep partitions the
//! table by kind and calls `close()` on every async resource.

use crate::context::ContextId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kind tag of a tracked handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum HandleKind {
    /// Object with a `close()` method run during the shutdown sweep
    AsyncResource,
    /// Binary buffer; released without a callback
    Buffer,
}

/// Id of a tracked handle, unique per isolate
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct HandleId(u64);

impl HandleId {
    /// Raw numeric value
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Public view of a tracked handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HandleInfo {
    /// Handle id
    pub id: HandleId,
    /// Kind tag
    pub kind: HandleKind,
    /// Context the object was created in
    pub context: ContextId,
}

pub(crate) struct TrackedHandle {
    pub(crate) info: HandleInfo,
    pub(crate) object: v8::Global<v8::Object>,
}

/// Handles removed from the table, split by kind.
#[derive(Default)]
pub(crate) struct HandleBuckets {
    pub(crate) async_resources: Vec<TrackedHandle>,
    pub(crate) buffers: Vec<TrackedHandle>,
}

#[derive(Default)]
pub(crate) struct HandleTable {
    next_id: u64,
    entries: BTreeMap<HandleId, TrackedHandle>,
}

impl HandleTable {
    pub(crate) fn insert(
        &mut self,
        kind: HandleKind,
        context: ContextId,
        object: v8::Global<v8::Object>,
    ) -> HandleId {
        self.next_id += 1;
        let id = HandleId(self.next_id);
        self.entries.insert(
            id,
            TrackedHandle {
                info: HandleInfo { id, kind, context },
                object,
            },
        );
        id
    }

    pub(crate) fn get(&self, id: HandleId) -> Option<&TrackedHandle> {
        self.entries.get(&id)
    }

    pub(crate) fn remove(&mut self, id: HandleId) -> Option<TrackedHandle> {
        self.entries.remove(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn visit(&self) -> Vec<HandleInfo> {
        self.entries.values().map(|h| h.info).collect()
    }

    /// Drop every handle created in `context`, returning how many went.
    pub(crate) fn release_context(&mut self, context: ContextId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, h| h.info.context != context);
        before - self.entries.len()
    }

    /// Remove the handles of the given contexts, partitioned by kind.
    pub(crate) fn drain_partitioned(&mut self, contexts: &[ContextId]) -> HandleBuckets {
        let ids: Vec<HandleId> = self
            .entries
            .values()
            .filter(|h| contexts.contains(&h.info.context))
            .map(|h| h.info.id)
            .collect();

        let mut buckets = HandleBuckets::default();
        for id in ids {
            if let Some(handle) = self.entries.remove(&id) {
                match handle.info.kind {
                    HandleKind::AsyncResource => buckets.async_resources.push(handle),
                    HandleKind::Buffer => buckets.buffers.push(handle),
                }
            }
        }
        buckets
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_handle_id_display() {
        assert_eq!(HandleId(7).to_string(), "h7");
        assert_eq!(HandleId(7).get(), 7);
    }

    #[test]
    fn test_handle_kind_serialization() {
        let json = serde_json::to_string(&HandleKind::AsyncResource).unwrap();
        assert_eq!(json, "\"asyncResource\"");
    }

    #[test]
    fn test_empty_table_partition() {
        let mut table = HandleTable::default();
        let buckets = table.drain_partitioned(&[ContextId::new(1)]);
        assert!(buckets.async_resources.is_empty());
        assert!(buckets.buffers.is_empty());
        assert_eq!(table.len(), 0);
        assert!(table.visit().is_empty());
    }
}
