use crate::cluster::universe::{FetchUnit, Universe, UniverseHandle};
use crate::collector::lag_calculator::LagEngine;
use crate::collector::scheduler::{FetchPolicy, UnitTable};
use crate::config::CompiledFilters;
use crate::error::{Result, ScrapeError};
use crate::kafka::{ClusterClient, TopicPartition};
use crate::lifecycle::Lifecycle;
use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, SystemTime};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, trace, warn};

/// Concurrent OffsetFetch calls while discovering group partitions.
const MAX_CONCURRENT_GROUP_DISCOVERY: usize = 16;

/// Consecutive failed refreshes before the exporter reports itself down.
const UNHEALTHY_AFTER_FAILURES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    pub brokers: usize,
    pub partitions: usize,
    pub groups: usize,
    pub dropped_units: usize,
    pub pruned_series: usize,
}

/// A group's discovery OffsetFetch, applied as the group's own fetch once
/// the new universe is published.
struct GroupFetch {
    group: String,
    started: Instant,
    result: Result<HashMap<TopicPartition, i64>>,
}

/// Group units claimed for discovery. Claims still held on drop, as when a
/// refresh times out mid-discovery, are released.
struct DiscoveryClaims<'a> {
    units: &'a UnitTable,
    claimed: Vec<FetchUnit>,
}

impl<'a> DiscoveryClaims<'a> {
    fn new(units: &'a UnitTable) -> Self {
        Self {
            units,
            claimed: Vec::new(),
        }
    }

    fn claim_if_due(&mut self, unit: FetchUnit, policy: &FetchPolicy, now: Instant) -> bool {
        if !self.units.try_begin_due(&unit, policy, now) {
            return false;
        }
        self.claimed.push(unit);
        true
    }

    /// The claims were settled through `UnitTable::complete`.
    fn settle(&mut self) {
        self.claimed.clear();
    }
}

impl Drop for DiscoveryClaims<'_> {
    fn drop(&mut self) {
        for unit in &self.claimed {
            self.units.release(unit);
        }
    }
}

/// Periodically rebuilds the tracked universe from cluster metadata.
pub struct MetadataRefresher {
    client: Arc<dyn ClusterClient>,
    filters: CompiledFilters,
    universe: Arc<UniverseHandle>,
    units: Arc<UnitTable>,
    engine: Arc<LagEngine>,
    policy: FetchPolicy,
    interval: Duration,
    consecutive_failures: AtomicU32,
}

impl MetadataRefresher {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        filters: CompiledFilters,
        universe: Arc<UniverseHandle>,
        units: Arc<UnitTable>,
        engine: Arc<LagEngine>,
        policy: FetchPolicy,
        interval: Duration,
    ) -> Self {
        Self {
            client,
            filters,
            universe,
            units,
            engine,
            policy,
            interval,
            consecutive_failures: AtomicU32::new(0),
        }
    }

    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, lifecycle: Lifecycle) {
        info!(interval = ?self.interval, "Starting metadata refresh loop");

        // The first refresh already ran during startup
        let start = Instant::now() + self.interval;
        let mut interval = tokio::time::interval_at(start, self.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = lifecycle.token().cancelled() => {
                    info!("Received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    self.refresh_tracked().await;
                }
            }
        }

        info!("Metadata refresh loop stopped");
    }

    /// Run one refresh bounded by the refresh interval and update the
    /// exporter's health from the outcome. Returns whether it succeeded.
    pub async fn refresh_tracked(&self) -> bool {
        let outcome = match tokio::time::timeout(self.interval, self.refresh_once()).await {
            Ok(result) => result,
            Err(_elapsed) => Err(ScrapeError::Fetch(format!(
                "metadata refresh timed out after {:?}",
                self.interval
            ))),
        };
        let store = self.engine.store();

        match outcome {
            Ok(summary) => {
                let previous = self.consecutive_failures.swap(0, Ordering::SeqCst);
                if previous >= UNHEALTHY_AFTER_FAILURES {
                    info!(failures = previous, "Metadata refresh recovered");
                }
                store.set_healthy(true);
                debug!(
                    dropped_units = summary.dropped_units,
                    pruned_series = summary.pruned_series,
                    "Metadata refresh succeeded"
                );
                true
            }
            Err(e) => {
                let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
                error!(
                    error = %e,
                    consecutive_failures = failures,
                    "Metadata refresh failed, keeping previous universe"
                );
                if failures >= UNHEALTHY_AFTER_FAILURES {
                    store.set_healthy(false);
                }
                false
            }
        }
    }

    /// List brokers, topics and groups, derive the new universe and publish
    /// it. The previous universe stays in place if any listing fails.
    #[instrument(skip(self))]
    pub async fn refresh_once(&self) -> Result<RefreshSummary> {
        let started = Instant::now();

        let metadata = self.client.fetch_cluster_metadata().await?;
        let brokers = metadata.brokers.len();
        let listed: Vec<String> = metadata.brokers.iter().map(ToString::to_string).collect();
        debug!(brokers = ?listed, "Listed brokers");

        let total_topics = metadata.topics.len();
        let partitions: HashMap<TopicPartition, i32> = metadata
            .topics
            .into_iter()
            .filter(|(topic, _)| self.filters.matches_topic(topic))
            .flat_map(|(topic, infos)| {
                infos
                    .into_iter()
                    .map(move |info| (TopicPartition::new(topic.clone(), info.partition), info.leader))
            })
            .collect();

        let all_groups = self.client.list_consumer_groups().await?;
        let total_groups = all_groups.len();
        let groups: Vec<String> = all_groups
            .into_iter()
            .filter(|g| self.filters.matches_group(g))
            .collect();

        let mut candidates: Vec<TopicPartition> = partitions.keys().cloned().collect();
        candidates.sort_unstable();
        let mut claims = DiscoveryClaims::new(&self.units);
        let (group_partitions, group_fetches) =
            self.discover_group_partitions(groups, &candidates, &mut claims).await;

        let next = Universe::new(partitions, group_partitions);
        let (partition_count, group_count) = (next.partition_count(), next.group_count());
        let refreshed_at = next.refreshed_at().unwrap_or_else(SystemTime::now);

        let mut dropped_units = 0;
        let mut pruned_series = 0;
        self.universe.replace(next, |universe| {
            dropped_units = self.units.reconcile(universe);
            pruned_series = self.engine.prune(universe);

            // Discovery doubles as each claimed group's scheduled fetch
            for fetch in group_fetches {
                let fetched_at = match fetch.result {
                    Ok(offsets) => {
                        self.engine
                            .record_committed_offsets(universe, &fetch.group, offsets);
                        Some(fetch.started)
                    }
                    Err(_) => None,
                };
                self.units
                    .complete(universe, &FetchUnit::Group(fetch.group), fetched_at);
            }
            claims.settle();
        });
        self.engine
            .store()
            .record_refresh(refreshed_at, partition_count, group_count);

        info!(
            brokers = brokers,
            topics = total_topics,
            partitions = partition_count,
            groups = group_count,
            listed_groups = total_groups,
            dropped_units = dropped_units,
            pruned_series = pruned_series,
            elapsed_ms = %started.elapsed().as_millis(),
            "Refreshed cluster metadata"
        );

        Ok(RefreshSummary {
            brokers,
            partitions: partition_count,
            groups: group_count,
            dropped_units,
            pruned_series,
        })
    }

    /// Partitions each group has committed offsets for.
    ///
    /// Groups that are due for a fetch are claimed in the unit table and
    /// fetched here; the results come back as `GroupFetch`es to be recorded
    /// once the universe is published. A group fetched within the floor, or
    /// with a fetch already in flight, is not asked again and keeps what the
    /// lag engine last recorded for it. So does a group whose fetch fails.
    async fn discover_group_partitions(
        &self,
        groups: Vec<String>,
        candidates: &[TopicPartition],
        claims: &mut DiscoveryClaims<'_>,
    ) -> (HashMap<String, HashSet<TopicPartition>>, Vec<GroupFetch>) {
        let current = self.universe.load();
        let candidate_set: HashSet<&TopicPartition> = candidates.iter().collect();
        let known = |group: &str| -> HashSet<TopicPartition> {
            self.engine
                .committed_partitions(group)
                .or_else(|| current.group_partitions(group).cloned())
                .unwrap_or_default()
                .into_iter()
                .filter(|tp| candidate_set.contains(tp))
                .collect()
        };

        let now = Instant::now();
        let mut discovered = HashMap::with_capacity(groups.len());
        let mut to_fetch = Vec::new();
        for group in groups {
            if claims.claim_if_due(FetchUnit::Group(group.clone()), &self.policy, now) {
                to_fetch.push(group);
            } else {
                trace!(group = group, "Group fetched recently, keeping its recorded partitions");
                let set = known(&group);
                discovered.insert(group, set);
            }
        }

        let mut stream = futures::stream::iter(to_fetch)
            .map(|group| async move {
                let started = Instant::now();
                let result = self.client.fetch_committed_offsets(&group, candidates).await;
                GroupFetch {
                    group,
                    started,
                    result,
                }
            })
            .buffer_unordered(MAX_CONCURRENT_GROUP_DISCOVERY);

        let mut fetches = Vec::new();
        while let Some(fetch) = stream.next().await {
            let set = match &fetch.result {
                Ok(offsets) => offsets.keys().cloned().collect(),
                Err(e) => {
                    warn!(group = fetch.group, error = %e, "Failed to discover group partitions, keeping previous set");
                    known(&fetch.group)
                }
            };
            discovered.insert(fetch.group.clone(), set);
            fetches.push(fetch);
        }
        (discovered, fetches)
    }
}

impl std::fmt::Debug for MetadataRefresher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetadataRefresher")
            .field("interval", &self.interval)
            .field("filters", &self.filters)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collector::scheduler::UnitState;
    use crate::config::ClusterConfig;
    use crate::kafka::mock::MockClusterClient;
    use crate::metrics::store::MetricsStore;

    const MIN: Duration = Duration::from_secs(15);
    const MAX: Duration = Duration::from_secs(40);

    struct Harness {
        client: Arc<MockClusterClient>,
        universe: Arc<UniverseHandle>,
        units: Arc<UnitTable>,
        engine: Arc<LagEngine>,
        refresher: Arc<MetadataRefresher>,
    }

    impl Harness {
        fn group_state(&self, group: &str) -> UnitState {
            self.units
                .state(&FetchUnit::Group(group.to_string()))
                .unwrap_or_default()
        }
    }

    /// Every group counts as due, so each refresh asks each group again.
    fn harness(topics: &str, groups: &str) -> Harness {
        harness_with_policy(topics, groups, FetchPolicy::new(Duration::ZERO, MAX))
    }

    fn harness_with_policy(topics: &str, groups: &str, policy: FetchPolicy) -> Harness {
        let client = Arc::new(MockClusterClient::new());
        let universe = Arc::new(UniverseHandle::default());
        let units = Arc::new(UnitTable::new());
        let engine = Arc::new(LagEngine::new(Arc::new(MetricsStore::new())));
        let filters = ClusterConfig {
            bootstrap_servers: "localhost".to_string(),
            topics: topics.to_string(),
            groups: groups.to_string(),
            ..ClusterConfig::default()
        }
        .compile_filters()
        .unwrap();

        let refresher = MetadataRefresher::new(
            Arc::clone(&client) as Arc<dyn ClusterClient>,
            filters,
            Arc::clone(&universe),
            Arc::clone(&units),
            Arc::clone(&engine),
            policy,
            Duration::from_secs(60),
        );

        Harness {
            client,
            universe,
            units,
            engine,
            refresher: Arc::new(refresher),
        }
    }

    #[tokio::test]
    async fn test_refresh_builds_filtered_universe() {
        let h = harness("^orders", "^billing$");
        h.client.add_topic("orders", 2);
        h.client.add_topic("payments", 1);
        h.client.add_group("billing");
        h.client.add_group("shipping");
        h.client.set_committed("billing", &TopicPartition::new("orders", 0), 5);
        h.client.set_committed("billing", &TopicPartition::new("payments", 0), 9);

        let summary = h.refresher.refresh_once().await.unwrap();
        assert_eq!(summary.partitions, 2);
        assert_eq!(summary.groups, 1);

        let u = h.universe.load();
        assert!(u.tracks_partition(&TopicPartition::new("orders", 1)));
        assert!(!u.tracks_partition(&TopicPartition::new("payments", 0)));
        assert!(!u.tracks_group("shipping"));
        assert_eq!(
            u.group_partitions("billing"),
            Some(&HashSet::from([TopicPartition::new("orders", 0)]))
        );
        assert_eq!(h.engine.store().tracked_partitions(), 2);
        assert!(h.engine.store().last_refresh_timestamp() > 0);
        assert_eq!(h.client.metadata_requests(), 1);
    }

    #[tokio::test]
    async fn test_default_group_pattern_tracks_no_group() {
        let h = harness("", "");
        h.client.add_topic("orders", 1);
        h.client.add_group("billing");

        h.refresher.refresh_once().await.unwrap();
        assert_eq!(h.universe.load().group_count(), 0);
    }

    #[tokio::test]
    async fn test_deleted_topic_leaves_no_series() {
        let h = harness("", ".*");
        let orders = TopicPartition::new("orders", 0);
        let payments = TopicPartition::new("payments", 0);
        h.client.add_topic("orders", 1);
        h.client.add_topic("payments", 1);
        h.client.add_group("billing");
        h.client.set_committed("billing", &payments, 3);
        h.refresher.refresh_once().await.unwrap();

        let u = h.universe.load();
        h.engine.record_high_water_mark(&u, &orders, 10);
        h.engine.record_high_water_mark(&u, &payments, 10);
        h.engine
            .record_committed_offsets(&u, "billing", HashMap::from([(payments.clone(), 3)]));
        assert!(
            h.engine
                .store()
                .snapshot()
                .iter()
                .any(|s| s.label("group") == Some("billing"))
        );

        h.client.remove_topic("payments");
        let summary = h.refresher.refresh_once().await.unwrap();

        assert_eq!(summary.pruned_series, 3);
        let snapshot = h.engine.store().snapshot();
        assert!(!snapshot.is_empty());
        assert!(snapshot.iter().all(|s| s.label("topic") != Some("payments")));
    }

    #[tokio::test]
    async fn test_failed_refresh_keeps_universe_and_tracks_health() {
        let h = harness("", "");
        h.client.add_topic("orders", 3);
        assert!(h.refresher.refresh_tracked().await);
        let store = Arc::clone(h.engine.store());

        h.client.set_fail_metadata(true);
        h.client.add_topic("payments", 1);
        for _ in 0..2 {
            assert!(!h.refresher.refresh_tracked().await);
            assert!(store.is_healthy());
        }
        assert_eq!(h.universe.load().partition_count(), 3);

        assert!(!h.refresher.refresh_tracked().await);
        assert!(!store.is_healthy());

        h.client.set_fail_metadata(false);
        assert!(h.refresher.refresh_tracked().await);
        assert!(store.is_healthy());
        assert_eq!(h.universe.load().partition_count(), 4);
    }

    #[tokio::test]
    async fn test_group_failure_keeps_previous_partitions() {
        let h = harness("", "^billing$");
        let tp = TopicPartition::new("orders", 0);
        h.client.add_topic("orders", 1);
        h.client.add_group("billing");
        h.client.set_committed("billing", &tp, 1);
        h.refresher.refresh_once().await.unwrap();

        h.client.set_fail_group("billing", true);
        h.refresher.refresh_once().await.unwrap();

        assert_eq!(
            h.universe.load().group_partitions("billing"),
            Some(&HashSet::from([tp]))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_refreshes_on_interval_until_shutdown() {
        let h = harness("", "");
        h.client.add_topic("orders", 1);
        let lifecycle = Lifecycle::new();

        lifecycle.spawn(Arc::clone(&h.refresher).run(lifecycle.clone()));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(h.universe.load().partition_count(), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(h.universe.load().partition_count(), 1);

        lifecycle.shutdown();
        assert!(lifecycle.wait(Duration::from_secs(1)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_discovery_records_group_fetch() {
        let h = harness_with_policy("", "^billing$", FetchPolicy::new(MIN, MAX));
        let tp = TopicPartition::new("orders", 0);
        h.client.add_topic("orders", 1);
        h.client.add_group("billing");
        h.client.set_committed("billing", &tp, 5);

        let before = Instant::now();
        h.refresher.refresh_once().await.unwrap();

        let state = h.group_state("billing");
        assert!(!state.in_flight);
        assert_eq!(state.last_fetched_at, Some(before));
        assert_eq!(h.engine.committed_offset("billing", &tp), Some(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recently_fetched_group_is_not_asked_again() {
        let h = harness_with_policy("", "^billing$", FetchPolicy::new(MIN, MAX));
        let tp = TopicPartition::new("orders", 0);
        h.client.add_topic("orders", 1);
        h.client.add_group("billing");
        h.client.set_committed("billing", &tp, 5);

        h.refresher.refresh_once().await.unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;
        h.refresher.refresh_once().await.unwrap();

        assert_eq!(h.client.group_fetch_starts("billing").len(), 1);
        assert_eq!(
            h.universe.load().group_partitions("billing"),
            Some(&HashSet::from([tp.clone()]))
        );

        tokio::time::sleep(Duration::from_secs(5)).await;
        h.refresher.refresh_once().await.unwrap();
        assert_eq!(h.client.group_fetch_starts("billing").len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_refresh_releases_group_claim() {
        let h = harness_with_policy("", "^billing$", FetchPolicy::new(MIN, MAX));
        h.client.add_topic("orders", 1);
        h.client.add_group("billing");
        h.client.set_latency(Some(Duration::from_secs(120)));

        assert!(!h.refresher.refresh_tracked().await);

        let state = h.group_state("billing");
        assert!(!state.in_flight);
        assert_eq!(state.last_fetched_at, None);
    }
}
