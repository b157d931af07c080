/*!
 * Statistics Module
 *
 * Counter registration happens once, before the first fork; after the
 * registry freezes, every child lays its counters out in an identical
 * shared memory block, which is what makes reap-time history merging a
 * plain slot-by-slot walk.
 */

pub mod histogram;
pub mod memblock;

pub use histogram::{BinLayout, HistogramRegistry};
pub use memblock::{Kbs, StatMemblock, MEMBLOCK_SIG};

use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::core::errors::StatError;
use crate::core::types::StatResult;

/// Slot interpretation. Counters and KB accumulators sum on merge; the
/// time and mean types merge as a running mean weighted by instance count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatType {
    Counter,
    Kbs,
    TimeUs,
    TimeMs,
    IntMean,
}

#[derive(Debug, Clone)]
struct Entry {
    label: String,
    ty: StatType,
    group: usize,
}

#[derive(Debug, Clone)]
struct Group {
    name: String,
    master: Option<usize>,
}

/// Registered statistic entries, deduplicated per `(label, group)`.
pub struct StatRegistry {
    entries: Mutex<Vec<Entry>>,
    groups: Mutex<Vec<Group>>,
    frozen: AtomicBool,
}

impl Default for StatRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl StatRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            groups: Mutex::new(vec![Group {
                name: "General".to_string(),
                master: None,
            }]),
            frozen: AtomicBool::new(false),
        }
    }

    /// Register (or find) a group by name.
    pub fn register_group(&self, name: &str) -> StatResult<usize> {
        self.register_group_with_master(name, None)
    }

    pub fn register_group_with_master(
        &self,
        name: &str,
        master: Option<usize>,
    ) -> StatResult<usize> {
        if self.is_frozen() {
            return Err(StatError::RegistryFrozen);
        }
        let mut groups = self.groups.lock();
        if let Some(id) = groups.iter().position(|g| g.name == name) {
            return Ok(id);
        }
        groups.push(Group {
            name: name.to_string(),
            master,
        });
        Ok(groups.len() - 1)
    }

    /// Register an entry and get its slot id. Registering the same label in
    /// the same group again returns the existing id; a conflicting type is
    /// an error.
    pub fn register(&self, label: &str, ty: StatType, group: usize) -> StatResult<usize> {
        if self.is_frozen() {
            return Err(StatError::RegistryFrozen);
        }
        let mut entries = self.entries.lock();
        if let Some(id) = entries
            .iter()
            .position(|e| e.label == label && e.group == group)
        {
            if entries[id].ty != ty {
                let group_name = self
                    .groups
                    .lock()
                    .get(group)
                    .map(|g| g.name.clone())
                    .unwrap_or_default();
                return Err(StatError::TypeMismatch {
                    label: label.to_string(),
                    group: group_name,
                });
            }
            return Ok(id);
        }
        entries.push(Entry {
            label: label.to_string(),
            ty,
            group,
        });
        Ok(entries.len() - 1)
    }

    /// Lock the table. Called right before the first fork; the memblock
    /// layout of every child is derived from the frozen entry count.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn entry_type(&self, id: usize) -> Option<StatType> {
        self.entries.lock().get(id).map(|e| e.ty)
    }

    /// Per-slot types in slot order; the merge walks this.
    #[must_use]
    pub fn slot_types(&self) -> Vec<StatType> {
        self.entries.lock().iter().map(|e| e.ty).collect()
    }

    #[must_use]
    pub fn find(&self, label: &str, group: usize) -> Option<usize> {
        self.entries
            .lock()
            .iter()
            .position(|e| e.label == label && e.group == group)
    }

    /// Bytes one child's statistics block occupies.
    #[must_use]
    pub fn memblock_size(&self) -> usize {
        StatMemblock::size_for(self.count())
    }

    /// Snapshot entry metadata paired with raw slot values. Group labels
    /// include the master group when one was declared.
    #[must_use]
    pub fn describe(&self, values: &[u64]) -> StatsSnapshot {
        let entries = self.entries.lock();
        let groups = self.groups.lock();
        let group_label = |id: usize| -> String {
            let Some(g) = groups.get(id) else {
                return String::new();
            };
            match g.master.and_then(|m| groups.get(m)) {
                Some(master) => format!("{}/{}", master.name, g.name),
                None => g.name.clone(),
            }
        };
        let stats = entries
            .iter()
            .enumerate()
            .map(|(id, e)| {
                let raw = values.get(id).copied().unwrap_or(0);
                StatEntrySnapshot {
                    label: e.label.clone(),
                    group: group_label(e.group),
                    value: match e.ty {
                        StatType::Counter => StatValue::Counter(raw),
                        StatType::Kbs => {
                            let kbs = Kbs::from_bytes(raw);
                            StatValue::Kbs {
                                kilobytes: kbs.kilobytes(),
                                bytes: kbs.remainder_bytes(),
                            }
                        }
                        StatType::TimeUs => StatValue::TimeUs(raw),
                        StatType::TimeMs => StatValue::TimeMs(raw),
                        StatType::IntMean => StatValue::Mean(raw),
                    },
                }
            })
            .collect();
        StatsSnapshot { stats }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StatValue {
    Counter(u64),
    Kbs { kilobytes: u64, bytes: u64 },
    TimeUs(u64),
    TimeMs(u64),
    Mean(u64),
}

#[derive(Debug, Serialize)]
pub struct StatEntrySnapshot {
    pub label: String,
    pub group: String,
    pub value: StatValue,
}

#[derive(Debug, Serialize)]
pub struct StatsSnapshot {
    pub stats: Vec<StatEntrySnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn registration_dedups_per_label_and_group() {
        let reg = StatRegistry::new();
        let g = reg.register_group("Service alpha").unwrap();
        let a = reg.register("requests", StatType::Counter, 0).unwrap();
        let b = reg.register("requests", StatType::Counter, g).unwrap();
        let a2 = reg.register("requests", StatType::Counter, 0).unwrap();
        assert_ne!(a, b);
        assert_eq!(a, a2);
        assert_eq!(reg.count(), 2);
    }

    #[test]
    fn conflicting_type_is_rejected() {
        let reg = StatRegistry::new();
        reg.register("bytes", StatType::Kbs, 0).unwrap();
        assert!(matches!(
            reg.register("bytes", StatType::Counter, 0),
            Err(StatError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn frozen_registry_rejects_registration() {
        let reg = StatRegistry::new();
        reg.register("before", StatType::Counter, 0).unwrap();
        reg.freeze();
        assert!(matches!(
            reg.register("after", StatType::Counter, 0),
            Err(StatError::RegistryFrozen)
        ));
        assert!(matches!(
            reg.register_group("late group"),
            Err(StatError::RegistryFrozen)
        ));
    }

    #[test]
    fn groups_dedup_by_name() {
        let reg = StatRegistry::new();
        let a = reg.register_group("Service x").unwrap();
        let b = reg.register_group("Service x").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn snapshot_splits_kbs_and_labels_groups() {
        let reg = StatRegistry::new();
        let master = reg.register_group("Services").unwrap();
        let g = reg
            .register_group_with_master("echo", Some(master))
            .unwrap();
        let req = reg.register("requests", StatType::Counter, g).unwrap();
        let bytes = reg.register("bytes", StatType::Kbs, g).unwrap();

        let mut values = vec![0u64; reg.count()];
        values[req] = 5;
        values[bytes] = 2048 + 7;

        let snap = reg.describe(&values);
        assert_eq!(snap.stats[req].group, "Services/echo");
        assert!(matches!(snap.stats[req].value, StatValue::Counter(5)));
        assert!(matches!(
            snap.stats[bytes].value,
            StatValue::Kbs {
                kilobytes: 2,
                bytes: 7
            }
        ));
        // The dump command serializes this structure.
        serde_json::to_string(&snap).unwrap();
    }
}
