//! Entity snapshots.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// An ordered map of field name to JSON value.
///
/// Patches submitted by mutations and the field content of snapshots share
/// this representation.
pub type FieldMap = BTreeMap<String, Value>;

/// A point-in-time view of a single entity.
///
/// Snapshots carry the server-assigned update timestamp in milliseconds
/// since the Unix epoch. A timestamp of `0` means the server never reported
/// one (e.g. an optimistic local write that has not been confirmed yet);
/// conflict resolution falls back to a field-level merge in that case.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    fields: FieldMap,
    updated_at_ms: u64,
}

impl Snapshot {
    /// Creates a snapshot from fields and a server timestamp.
    pub fn new(fields: FieldMap, updated_at_ms: u64) -> Self {
        Self {
            fields,
            updated_at_ms,
        }
    }

    /// Creates an empty snapshot with no timestamp.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Returns the field map.
    pub fn fields(&self) -> &FieldMap {
        &self.fields
    }

    /// Returns the value of a single field, if present.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Returns the server-assigned update timestamp in milliseconds.
    pub fn updated_at_ms(&self) -> u64 {
        self.updated_at_ms
    }

    /// Returns true if the server ever assigned a timestamp.
    pub fn has_timestamp(&self) -> bool {
        self.updated_at_ms > 0
    }

    /// Returns a copy with the given timestamp.
    pub fn with_timestamp(mut self, updated_at_ms: u64) -> Self {
        self.updated_at_ms = updated_at_ms;
        self
    }

    /// Applies a patch, overwriting patched fields and keeping the rest.
    ///
    /// The timestamp is untouched; callers stamp the result themselves once
    /// the server confirms the write.
    pub fn apply_patch(&mut self, patch: &FieldMap) {
        for (name, value) in patch {
            self.fields.insert(name.clone(), value.clone());
        }
    }

    /// Returns true if every field in `patch` matches this snapshot exactly.
    ///
    /// Fields outside the patch are ignored: confirmation only checks the
    /// fields the local mutation touched.
    pub fn matches_patch(&self, patch: &FieldMap) -> bool {
        patch
            .iter()
            .all(|(name, value)| self.fields.get(name) == Some(value))
    }

    /// Returns the names of patch fields whose values differ here.
    pub fn diverging_fields(&self, patch: &FieldMap) -> Vec<String> {
        patch
            .iter()
            .filter(|(name, value)| self.fields.get(*name) != Some(value))
            .map(|(name, _)| name.clone())
            .collect()
    }
}
