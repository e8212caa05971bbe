use crate::kafka::TopicPartition;
use crate::metrics::definitions::{LABEL_GROUP, LABEL_PARTITION, LABEL_TOPIC};
use dashmap::DashMap;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Label set, kept sorted so equal sets compare and hash equal.
pub type Labels = BTreeMap<String, String>;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    pub name: String,
    pub labels: Labels,
}

#[derive(Debug, Clone)]
pub struct MetricSeries {
    pub name: String,
    pub labels: Labels,
    pub value: f64,
    pub updated_at: SystemTime,
    pub help: &'static str,
}

impl MetricSeries {
    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    /// The `(topic, partition)` this series refers to, if it has both labels.
    pub fn topic_partition(&self) -> Option<TopicPartition> {
        let topic = self.label(LABEL_TOPIC)?;
        let partition = self.label(LABEL_PARTITION)?.parse().ok()?;
        Some(TopicPartition::new(topic, partition))
    }
}

pub fn partition_labels(tp: &TopicPartition) -> Labels {
    let mut labels = Labels::new();
    labels.insert(LABEL_TOPIC.to_string(), tp.topic.clone());
    labels.insert(LABEL_PARTITION.to_string(), tp.partition.to_string());
    labels
}

pub fn group_partition_labels(group: &str, tp: &TopicPartition) -> Labels {
    let mut labels = partition_labels(tp);
    labels.insert(LABEL_GROUP.to_string(), group.to_string());
    labels
}

/// Latest value per series, plus exporter health.
///
/// Every `set` replaces the whole record under the entry's shard lock, so a
/// concurrent `snapshot` sees either the old or the new series.
pub struct MetricsStore {
    series: DashMap<SeriesKey, MetricSeries>,
    healthy: AtomicBool,
    last_refresh_timestamp: AtomicU64,
    tracked_partitions: AtomicUsize,
    tracked_groups: AtomicUsize,
}

impl MetricsStore {
    pub fn new() -> Self {
        Self {
            series: DashMap::new(),
            healthy: AtomicBool::new(true),
            last_refresh_timestamp: AtomicU64::new(0),
            tracked_partitions: AtomicUsize::new(0),
            tracked_groups: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, name: &str, labels: Labels, value: f64, help: &'static str) {
        let key = SeriesKey {
            name: name.to_string(),
            labels: labels.clone(),
        };
        self.series.insert(
            key,
            MetricSeries {
                name: name.to_string(),
                labels,
                value,
                updated_at: SystemTime::now(),
                help,
            },
        );
    }

    pub fn remove(&self, name: &str, labels: &Labels) -> bool {
        let key = SeriesKey {
            name: name.to_string(),
            labels: labels.clone(),
        };
        self.series.remove(&key).is_some()
    }

    /// Drop every series for which `keep` returns false.
    pub fn retain(&self, mut keep: impl FnMut(&MetricSeries) -> bool) -> usize {
        let before = self.series.len();
        self.series.retain(|_, series| keep(series));
        before.saturating_sub(self.series.len())
    }

    #[cfg(test)]
    pub fn get(&self, name: &str, labels: &Labels) -> Option<MetricSeries> {
        let key = SeriesKey {
            name: name.to_string(),
            labels: labels.clone(),
        };
        self.series.get(&key).map(|entry| entry.value().clone())
    }

    /// Copy of every series, ordered by name then labels.
    pub fn snapshot(&self) -> Vec<MetricSeries> {
        let mut entries: Vec<(SeriesKey, MetricSeries)> = self
            .series
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().map(|(_, series)| series).collect()
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    #[allow(dead_code)]
    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    pub fn record_refresh(&self, at: SystemTime, partitions: usize, groups: usize) {
        let secs = at.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs());
        self.last_refresh_timestamp.store(secs, Ordering::SeqCst);
        self.tracked_partitions.store(partitions, Ordering::SeqCst);
        self.tracked_groups.store(groups, Ordering::SeqCst);
    }

    /// Unix seconds of the last successful refresh; 0 before the first one.
    pub fn last_refresh_timestamp(&self) -> u64 {
        self.last_refresh_timestamp.load(Ordering::SeqCst)
    }

    pub fn tracked_partitions(&self) -> usize {
        self.tracked_partitions.load(Ordering::SeqCst)
    }

    pub fn tracked_groups(&self) -> usize {
        self.tracked_groups.load(Ordering::SeqCst)
    }
}

impl Default for MetricsStore {
    fn default() -> Self {
        Self::new()
    }
}
