use crate::kafka::TopicPartition;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

/// A unit of fetch work: one partition's high-water mark, or one group's
/// committed offsets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum FetchUnit {
    Partition(TopicPartition),
    Group(String),
}

impl fmt::Display for FetchUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Partition(tp) => write!(f, "partition {tp}"),
            Self::Group(group) => write!(f, "group {group}"),
        }
    }
}

/// The tracked partitions and groups as of one metadata refresh. Never
/// mutated after construction.
#[derive(Debug, Default)]
pub struct Universe {
    partitions: HashMap<TopicPartition, i32>,
    partition_list: Vec<TopicPartition>,
    groups: HashMap<String, HashSet<TopicPartition>>,
    refreshed_at: Option<SystemTime>,
}

impl Universe {
    /// `partitions` maps each tracked partition to its leader broker id.
    pub fn new(
        partitions: HashMap<TopicPartition, i32>,
        groups: HashMap<String, HashSet<TopicPartition>>,
    ) -> Self {
        let mut partition_list: Vec<TopicPartition> = partitions.keys().cloned().collect();
        partition_list.sort_unstable();

        Self {
            partitions,
            partition_list,
            groups,
            refreshed_at: Some(SystemTime::now()),
        }
    }

    pub fn tracks_partition(&self, tp: &TopicPartition) -> bool {
        self.partitions.contains_key(tp)
    }

    pub fn tracks_group(&self, group: &str) -> bool {
        self.groups.contains_key(group)
    }

    pub fn tracks_unit(&self, unit: &FetchUnit) -> bool {
        match unit {
            FetchUnit::Partition(tp) => self.tracks_partition(tp),
            FetchUnit::Group(group) => self.tracks_group(group),
        }
    }

    pub fn leader(&self, tp: &TopicPartition) -> Option<i32> {
        self.partitions.get(tp).copied()
    }

    /// Tracked partitions in `(topic, partition)` order.
    pub fn partitions(&self) -> &[TopicPartition] {
        &self.partition_list
    }

    pub fn group_partitions(&self, group: &str) -> Option<&HashSet<TopicPartition>> {
        self.groups.get(group)
    }

    pub fn units(&self) -> impl Iterator<Item = FetchUnit> + '_ {
        self.partition_list
            .iter()
            .cloned()
            .map(FetchUnit::Partition)
            .chain(self.groups.keys().cloned().map(FetchUnit::Group))
    }

    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }

    pub fn refreshed_at(&self) -> Option<SystemTime> {
        self.refreshed_at
    }
}

/// Shared, atomically replaceable universe.
///
/// Readers get the whole old or the whole new universe. `replace` holds the
/// write side while its callback runs, and `read` holds the shared side, so
/// work done under `read` never interleaves with a replacement.
#[derive(Debug, Default)]
pub struct UniverseHandle {
    current: RwLock<Arc<Universe>>,
}

impl UniverseHandle {
    pub fn load(&self) -> Arc<Universe> {
        Arc::clone(&self.current.read().unwrap_or_else(PoisonError::into_inner))
    }

    pub fn read<R>(&self, f: impl FnOnce(&Universe) -> R) -> R {
        let guard = self.current.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    pub fn replace(&self, next: Universe, on_replace: impl FnOnce(&Universe)) {
        let mut guard = self.current.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(next);
        on_replace(&guard);
    }
}
