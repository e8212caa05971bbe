//! In-memory cluster used by scheduler, refresher and lifecycle tests.

use super::client::{Broker, ClusterClient, ClusterMetadata, PartitionInfo, TopicPartition};
use crate::error::{Result, ScrapeError};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Default)]
struct MockState {
    topics: HashMap<String, Vec<PartitionInfo>>,
    high_water_marks: HashMap<TopicPartition, i64>,
    groups: Vec<String>,
    committed: HashMap<String, HashMap<TopicPartition, i64>>,
    fail_metadata: bool,
    metadata_requests: usize,
    failing_partitions: HashSet<TopicPartition>,
    failing_groups: HashSet<String>,
    latency: Option<Duration>,
    started: HashMap<String, Vec<Instant>>,
    succeeded: HashMap<String, Vec<Instant>>,
    in_flight: HashMap<String, usize>,
    max_in_flight: HashMap<String, usize>,
}

#[derive(Default)]
pub struct MockClusterClient {
    state: Mutex<MockState>,
}

fn partition_key(tp: &TopicPartition) -> String {
    format!("partition:{tp}")
}

fn group_key(group: &str) -> String {
    format!("group:{group}")
}

impl MockClusterClient {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn add_topic(&self, topic: &str, partitions: i32) {
        let infos = (0..partitions)
            .map(|partition| PartitionInfo {
                partition,
                leader: 1,
            })
            .collect();
        self.state().topics.insert(topic.to_string(), infos);
    }

    pub fn remove_topic(&self, topic: &str) {
        let mut state = self.state();
        state.topics.remove(topic);
        state.high_water_marks.retain(|tp, _| tp.topic != topic);
    }

    pub fn set_high_water_mark(&self, tp: &TopicPartition, offset: i64) {
        self.state().high_water_marks.insert(tp.clone(), offset);
    }

    pub fn add_group(&self, group: &str) {
        let mut state = self.state();
        if !state.groups.iter().any(|g| g == group) {
            state.groups.push(group.to_string());
        }
    }

    pub fn set_committed(&self, group: &str, tp: &TopicPartition, offset: i64) {
        self.state()
            .committed
            .entry(group.to_string())
            .or_default()
            .insert(tp.clone(), offset);
    }

    pub fn set_fail_metadata(&self, fail: bool) {
        self.state().fail_metadata = fail;
    }

    pub fn set_fail_partition(&self, tp: &TopicPartition, fail: bool) {
        let mut state = self.state();
        if fail {
            state.failing_partitions.insert(tp.clone());
        } else {
            state.failing_partitions.remove(tp);
        }
    }

    pub fn set_fail_group(&self, group: &str, fail: bool) {
        let mut state = self.state();
        if fail {
            state.failing_groups.insert(group.to_string());
        } else {
            state.failing_groups.remove(group);
        }
    }

    pub fn set_latency(&self, latency: Option<Duration>) {
        self.state().latency = latency;
    }

    /// Start instants of every high-water-mark fetch attempt for `tp`.
    pub fn partition_fetch_starts(&self, tp: &TopicPartition) -> Vec<Instant> {
        self.state()
            .started
            .get(&partition_key(tp))
            .cloned()
            .unwrap_or_default()
    }

    /// Start instants of the successful high-water-mark fetches for `tp`.
    pub fn partition_fetch_successes(&self, tp: &TopicPartition) -> Vec<Instant> {
        self.state()
            .succeeded
            .get(&partition_key(tp))
            .cloned()
            .unwrap_or_default()
    }

    pub fn group_fetch_starts(&self, group: &str) -> Vec<Instant> {
        self.state()
            .started
            .get(&group_key(group))
            .cloned()
            .unwrap_or_default()
    }

    pub fn metadata_requests(&self) -> usize {
        self.state().metadata_requests
    }

    pub fn max_concurrent_partition_fetches(&self, tp: &TopicPartition) -> usize {
        self.state()
            .max_in_flight
            .get(&partition_key(tp))
            .copied()
            .unwrap_or(0)
    }

    pub fn in_flight_total(&self) -> usize {
        self.state().in_flight.values().sum()
    }

    fn begin(&self, key: &str) -> (Instant, Option<Duration>) {
        let mut state = self.state();
        let now = Instant::now();
        state.started.entry(key.to_string()).or_default().push(now);
        let count = {
            let count = state.in_flight.entry(key.to_string()).or_default();
            *count += 1;
            *count
        };
        let max = state.max_in_flight.entry(key.to_string()).or_default();
        *max = (*max).max(count);
        (now, state.latency)
    }

    fn finish(&self, key: &str, started: Instant, success: bool) {
        let mut state = self.state();
        if let Some(count) = state.in_flight.get_mut(key) {
            *count = count.saturating_sub(1);
        }
        if success {
            state.succeeded.entry(key.to_string()).or_default().push(started);
        }
    }

    async fn simulate(&self, key: &str, fails: bool) -> Instant {
        let (started, latency) = self.begin(key);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        self.finish(key, started, !fails);
        started
    }
}

#[async_trait]
impl ClusterClient for MockClusterClient {
    async fn fetch_cluster_metadata(&self) -> Result<ClusterMetadata> {
        let mut state = self.state();
        state.metadata_requests += 1;
        if state.fail_metadata {
            return Err(ScrapeError::Fetch("metadata unavailable".to_string()));
        }
        Ok(ClusterMetadata {
            brokers: vec![Broker {
                id: 1,
                host: "localhost".to_string(),
                port: 9092,
            }],
            topics: state.topics.clone(),
        })
    }

    async fn fetch_high_water_mark(&self, tp: &TopicPartition) -> Result<i64> {
        let fails = self.state().failing_partitions.contains(tp);
        self.simulate(&partition_key(tp), fails).await;
        if fails {
            return Err(ScrapeError::Fetch(format!("timeout fetching {tp}")));
        }
        Ok(self.state().high_water_marks.get(tp).copied().unwrap_or(0))
    }

    async fn list_consumer_groups(&self) -> Result<Vec<String>> {
        let state = self.state();
        if state.fail_metadata {
            return Err(ScrapeError::Fetch("metadata unavailable".to_string()));
        }
        Ok(state.groups.clone())
    }

    async fn fetch_committed_offsets(
        &self,
        group: &str,
        partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, i64>> {
        let fails = self.state().failing_groups.contains(group);
        self.simulate(&group_key(group), fails).await;
        if fails {
            return Err(ScrapeError::Fetch(format!(
                "coordinator unavailable for {group}"
            )));
        }

        let state = self.state();
        let requested: HashSet<&TopicPartition> = partitions.iter().collect();
        Ok(state
            .committed
            .get(group)
            .map(|offsets| {
                offsets
                    .iter()
                    .filter(|(tp, _)| requested.contains(tp))
                    .map(|(tp, offset)| (tp.clone(), *offset))
                    .collect()
            })
            .unwrap_or_default())
    }
}
