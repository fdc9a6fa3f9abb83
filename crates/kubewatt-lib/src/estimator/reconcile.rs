//! Retiring series of containers that disappeared between ticks

use crate::models::{ContainerIdentity, PowerKind, Snapshot};
use crate::observability::MetricsSink;
use std::collections::HashSet;

/// What one publication changed
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileOutcome {
    /// `(node, container)` pairs whose series were removed
    pub removed: Vec<(String, ContainerIdentity)>,
    pub upserted: usize,
}

/// Remembers the previously published snapshot, and nothing older.
///
/// Not synchronized; the estimator loop owns it and runs one tick at a
/// time.
#[derive(Debug, Default)]
pub struct ReconciliationCache {
    previous: Option<Snapshot>,
}

impl ReconciliationCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish `current` to `sink`: remove containers that are gone since
    /// the last call, upsert everything present, then keep `current`.
    pub fn publish(&mut self, current: Snapshot, sink: &dyn MetricsSink) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();

        if let Some(previous) = &self.previous {
            for (node, containers) in previous {
                let present: HashSet<&ContainerIdentity> = current
                    .get(node)
                    .map(|cs| cs.iter().map(|c| &c.identity).collect())
                    .unwrap_or_default();

                for container in containers {
                    if !present.contains(&container.identity) {
                        sink.remove(node, &container.identity, PowerKind::Dynamic);
                        outcome.removed.push((node.clone(), container.identity.clone()));
                    }
                }
            }
        }

        for (node, containers) in &current {
            for container in containers {
                sink.upsert(node, &container.identity, PowerKind::Dynamic, container.value);
                outcome.upserted += 1;
            }
        }

        self.previous = Some(current);
        outcome
    }

    pub fn previous(&self) -> Option<&Snapshot> {
        self.previous.as_ref()
    }
}
