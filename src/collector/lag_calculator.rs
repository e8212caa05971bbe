use crate::cluster::universe::Universe;
use crate::kafka::client::TopicPartition;
use crate::metrics::definitions::{
    HELP_GROUP_LAG, HELP_GROUP_OFFSET, HELP_PARTITION_LATEST_OFFSET, LABEL_GROUP,
    METRIC_GROUP_LAG, METRIC_GROUP_OFFSET, METRIC_PARTITION_LATEST_OFFSET,
};
use crate::metrics::store::{MetricsStore, group_partition_labels, partition_labels};
use dashmap::DashMap;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, trace};

/// Offset lag of a committed position behind the high-water mark. A commit
/// ahead of the observed high-water mark is a read race, not negative lag.
pub fn lag(high_water_mark: i64, committed: i64) -> i64 {
    high_water_mark.saturating_sub(committed).max(0)
}

/// Keeps the last known offsets per partition and per group and turns them
/// into latest-offset, committed-offset and lag series.
///
/// Callers hold the universe's shared lock while recording and its exclusive
/// lock while pruning, so the books only ever reference units of the
/// universe they were checked against.
pub struct LagEngine {
    store: Arc<MetricsStore>,
    high_water_marks: DashMap<TopicPartition, i64>,
    committed: DashMap<String, HashMap<TopicPartition, i64>>,
}

impl LagEngine {
    pub fn new(store: Arc<MetricsStore>) -> Self {
        Self {
            store,
            high_water_marks: DashMap::new(),
            committed: DashMap::new(),
        }
    }

    pub fn store(&self) -> &Arc<MetricsStore> {
        &self.store
    }

    /// Returns false when `tp` is not tracked and the result was discarded.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_high_water_mark(
        &self,
        universe: &Universe,
        tp: &TopicPartition,
        offset: i64,
    ) -> bool {
        if !universe.tracks_partition(tp) {
            trace!(topic = %tp.topic, partition = tp.partition, "Discarding offset for untracked partition");
            return false;
        }

        // The entry guard orders this lag recomputation against a concurrent
        // group update reading the same high-water mark.
        let mut hwm = self.high_water_marks.entry(tp.clone()).or_insert(offset);
        *hwm = offset;

        self.store.set(
            METRIC_PARTITION_LATEST_OFFSET,
            partition_labels(tp),
            offset as f64,
            HELP_PARTITION_LATEST_OFFSET,
        );

        for group in self.committed.iter() {
            if let Some(&committed) = group.value().get(tp) {
                self.store.set(
                    METRIC_GROUP_LAG,
                    group_partition_labels(group.key(), tp),
                    lag(offset, committed) as f64,
                    HELP_GROUP_LAG,
                );
            }
        }

        drop(hwm);
        true
    }

    /// Replace `group`'s committed offsets with `offsets`. Returns false when
    /// the group is not tracked and the result was discarded.
    #[allow(clippy::cast_precision_loss)]
    pub fn record_committed_offsets(
        &self,
        universe: &Universe,
        group: &str,
        offsets: HashMap<TopicPartition, i64>,
    ) -> bool {
        if !universe.tracks_group(group) {
            trace!(group = group, "Discarding offsets for untracked group");
            return false;
        }

        let mut tracked = HashMap::with_capacity(offsets.len());
        for (tp, offset) in offsets {
            if universe.tracks_partition(&tp) {
                tracked.insert(tp, offset);
            } else {
                self.remove_group_partition(group, &tp);
            }
        }

        let previous = self
            .committed
            .insert(group.to_string(), tracked.clone())
            .unwrap_or_default();
        for tp in previous.keys().filter(|tp| !tracked.contains_key(*tp)) {
            debug!(group = group, topic = %tp.topic, partition = tp.partition, "Group no longer commits to partition");
            self.remove_group_partition(group, tp);
        }

        for (tp, committed) in &tracked {
            let labels = group_partition_labels(group, tp);
            self.store.set(
                METRIC_GROUP_OFFSET,
                labels.clone(),
                *committed as f64,
                HELP_GROUP_OFFSET,
            );

            match self.high_water_marks.get(tp) {
                Some(hwm) => {
                    self.store.set(
                        METRIC_GROUP_LAG,
                        labels,
                        lag(*hwm, *committed) as f64,
                        HELP_GROUP_LAG,
                    );
                }
                None => {
                    // Lag appears once the partition's own fetch lands
                    self.store.remove(METRIC_GROUP_LAG, &labels);
                }
            }
        }

        true
    }

    /// Forget every partition and group `universe` no longer tracks, along
    /// with the series derived from them.
    pub fn prune(&self, universe: &Universe) -> usize {
        self.high_water_marks
            .retain(|tp, _| universe.tracks_partition(tp));
        self.committed.retain(|group, offsets| {
            offsets.retain(|tp, _| universe.tracks_partition(tp));
            universe.tracks_group(group)
        });

        let removed = self.store.retain(|series| {
            let partition_tracked = series
                .topic_partition()
                .is_none_or(|tp| universe.tracks_partition(&tp));
            let group_tracked = series
                .label(LABEL_GROUP)
                .is_none_or(|group| universe.tracks_group(group));
            partition_tracked && group_tracked
        });

        if removed > 0 {
            debug!(removed = removed, "Pruned series for units outside the universe");
        }
        removed
    }

    /// Partitions `group` held a committed offset for at its last recorded
    /// fetch.
    pub fn committed_partitions(&self, group: &str) -> Option<HashSet<TopicPartition>> {
        self.committed
            .get(group)
            .map(|offsets| offsets.keys().cloned().collect())
    }

    #[cfg(test)]
    pub fn high_water_mark(&self, tp: &TopicPartition) -> Option<i64> {
        self.high_water_marks.get(tp).map(|hwm| *hwm)
    }

    #[cfg(test)]
    pub fn committed_offset(&self, group: &str, tp: &TopicPartition) -> Option<i64> {
        self.committed
            .get(group)
            .and_then(|offsets| offsets.get(tp).copied())
    }

    fn remove_group_partition(&self, group: &str, tp: &TopicPartition) {
        let labels = group_partition_labels(group, tp);
        self.store.remove(METRIC_GROUP_OFFSET, &labels);
        self.store.remove(METRIC_GROUP_LAG, &labels);
    }
}
