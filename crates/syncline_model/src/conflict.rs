//! Conflict records and resolution.

use crate::ids::EntityId;
use crate::snapshot::Snapshot;

/// How a conflict was resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionStrategy {
    /// Both sides carried server timestamps; the later writer won.
    LastWriterWins,
    /// At least one side lacked a timestamp; fields were merged, local
    /// values taking precedence on direct key conflicts.
    FieldMerge,
}

/// Which value the resolution produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictOutcome {
    /// The local value stands and must be reasserted remotely.
    LocalWins,
    /// The server value stands; the local value is discarded.
    ServerWins,
    /// A merged value stands and must be submitted remotely.
    Merged,
}

/// A divergence between a local optimistic value and the confirmed server
/// value for one entity.
///
/// Conflict records are ephemeral: they exist only while a divergence is
/// being resolved and are never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct ConflictRecord {
    /// The entity in conflict.
    pub entity_id: EntityId,
    /// The local optimistic snapshot.
    pub local: Snapshot,
    /// The confirmed server snapshot.
    pub server: Snapshot,
    /// The strategy that applied.
    pub strategy: ResolutionStrategy,
    /// Which side won.
    pub outcome: ConflictOutcome,
    /// The snapshot both sides should converge to.
    pub resolved: Snapshot,
}

impl ConflictRecord {
    /// Resolves a divergence between local and server snapshots.
    ///
    /// When both sides carry server-assigned timestamps, last-writer-wins
    /// applies: the local value stands only when its timestamp is strictly
    /// newer, otherwise the server value is accepted (ties go to the
    /// server). When either side lacks a timestamp, falls back to a
    /// field-level merge: the union of both versions' fields, local values
    /// winning direct key conflicts.
    pub fn resolve(entity_id: EntityId, local: Snapshot, server: Snapshot) -> Self {
        if local.has_timestamp() && server.has_timestamp() {
            let (outcome, resolved) = if local.updated_at_ms() > server.updated_at_ms() {
                (ConflictOutcome::LocalWins, local.clone())
            } else {
                (ConflictOutcome::ServerWins, server.clone())
            };
            return Self {
                entity_id,
                local,
                server,
                strategy: ResolutionStrategy::LastWriterWins,
                outcome,
                resolved,
            };
        }

        let mut merged = server.clone();
        merged.apply_patch(local.fields());
        let merged = merged.with_timestamp(local.updated_at_ms().max(server.updated_at_ms()));

        Self {
            entity_id,
            local,
            server,
            strategy: ResolutionStrategy::FieldMerge,
            outcome: ConflictOutcome::Merged,
            resolved: merged,
        }
    }

    /// Returns true if the resolved value must be (re)submitted remotely.
    pub fn needs_resubmit(&self) -> bool {
        matches!(
            self.outcome,
            ConflictOutcome::LocalWins | ConflictOutcome::Merged
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::FieldMap;
    use proptest::prelude::*;
    use serde_json::json;

    fn snap(pairs: &[(&str, serde_json::Value)], ts: u64) -> Snapshot {
        let fields: FieldMap = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect();
        Snapshot::new(fields, ts)
    }

    #[test]
    fn newer_local_wins() {
        let record = ConflictRecord::resolve(
            EntityId(7),
            snap(&[("quality", json!(5))], 200),
            snap(&[("quality", json!(3))], 100),
        );

        assert_eq!(record.strategy, ResolutionStrategy::LastWriterWins);
        assert_eq!(record.outcome, ConflictOutcome::LocalWins);
        assert_eq!(record.resolved.get("quality"), Some(&json!(5)));
        assert!(record.needs_resubmit());
    }

    #[test]
    fn ties_go_to_the_server() {
        let record = ConflictRecord::resolve(
            EntityId(7),
            snap(&[("quality", json!(5))], 100),
            snap(&[("quality", json!(3))], 100),
        );

        assert_eq!(record.outcome, ConflictOutcome::ServerWins);
        assert_eq!(record.resolved.get("quality"), Some(&json!(3)));
        assert!(!record.needs_resubmit());
    }

    #[test]
    fn missing_timestamp_falls_back_to_merge() {
        let record = ConflictRecord::resolve(
            EntityId(7),
            snap(&[("quality", json!(4.5))], 0),
            snap(&[("quality", json!(3)), ("reviews", json!(12))], 100),
        );

        assert_eq!(record.strategy, ResolutionStrategy::FieldMerge);
        assert_eq!(record.outcome, ConflictOutcome::Merged);
        // Local wins the direct key conflict, server-only fields survive.
        assert_eq!(record.resolved.get("quality"), Some(&json!(4.5)));
        assert_eq!(record.resolved.get("reviews"), Some(&json!(12)));
        assert_eq!(record.resolved.updated_at_ms(), 100);
        assert!(record.needs_resubmit());
    }

    proptest! {
        // Last-writer-wins convergence: local wins iff strictly newer, for
        // every timestamp pair including equality.
        #[test]
        fn lww_convergence(t_local in 1u64..10_000, t_server in 1u64..10_000) {
            let record = ConflictRecord::resolve(
                EntityId(1),
                snap(&[("v", json!("local"))], t_local),
                snap(&[("v", json!("server"))], t_server),
            );

            if t_local > t_server {
                prop_assert_eq!(record.outcome, ConflictOutcome::LocalWins);
                prop_assert_eq!(record.resolved.get("v"), Some(&json!("local")));
            } else {
                prop_assert_eq!(record.outcome, ConflictOutcome::ServerWins);
                prop_assert_eq!(record.resolved.get("v"), Some(&json!("server")));
            }
        }
    }
}
