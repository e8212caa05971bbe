use crate::cluster::universe::{FetchUnit, Universe, UniverseHandle};
use crate::collector::lag_calculator::LagEngine;
use crate::config::ScrapeConfig;
use crate::error::Result;
use crate::kafka::{ClusterClient, TopicPartition};
use crate::lifecycle::Lifecycle;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, instrument, trace, warn};

/// A single tick dispatching more units than this is logged as a burst.
const LARGE_TICK_WARN_THRESHOLD: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Due {
    NotDue,
    Eligible,
    Mandatory,
}

/// Debounce with a ceiling: a unit may be re-fetched once `min` has passed
/// since its last successful fetch and must be once `max` has.
#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    min: Duration,
    max: Duration,
}

impl FetchPolicy {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self { min, max }
    }

    pub fn classify(&self, last_fetched_at: Option<Instant>, now: Instant) -> Due {
        let Some(last) = last_fetched_at else {
            return Due::Mandatory;
        };

        let age = now.saturating_duration_since(last);
        if age >= self.max {
            Due::Mandatory
        } else if age >= self.min {
            Due::Eligible
        } else {
            Due::NotDue
        }
    }
}

impl From<&ScrapeConfig> for FetchPolicy {
    fn from(config: &ScrapeConfig) -> Self {
        Self::new(
            config.fetch_offset_min_interval,
            config.fetch_offset_max_interval,
        )
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UnitState {
    /// Start instant of the latest successful fetch.
    pub last_fetched_at: Option<Instant>,
    pub in_flight: bool,
}

/// Scheduling state per fetch unit.
#[derive(Debug, Default)]
pub struct UnitTable {
    units: DashMap<FetchUnit, UnitState>,
}

impl UnitTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Align the table with a freshly published universe. Runs under the
    /// universe's exclusive lock. Returns the number of entries dropped.
    pub fn reconcile(&self, universe: &Universe) -> usize {
        let before = self.units.len();
        // In-flight entries are dropped by their completion instead
        self.units
            .retain(|unit, state| state.in_flight || universe.tracks_unit(unit));
        let dropped = before.saturating_sub(self.units.len());

        for unit in universe.units() {
            self.units.entry(unit).or_default();
        }
        dropped
    }

    pub fn state(&self, unit: &FetchUnit) -> Option<UnitState> {
        self.units.get(unit).map(|state| *state)
    }

    /// Mark `unit` in flight. False if a fetch for it is already outstanding.
    pub fn try_begin(&self, unit: &FetchUnit) -> bool {
        let mut state = self.units.entry(unit.clone()).or_default();
        if state.in_flight {
            return false;
        }
        state.in_flight = true;
        true
    }

    /// Like `try_begin`, but only for a unit `policy` finds due at `now`.
    /// The check and the claim happen under the same entry lock.
    pub fn try_begin_due(&self, unit: &FetchUnit, policy: &FetchPolicy, now: Instant) -> bool {
        let mut state = self.units.entry(unit.clone()).or_default();
        if state.in_flight || policy.classify(state.last_fetched_at, now) == Due::NotDue {
            return false;
        }
        state.in_flight = true;
        true
    }

    /// Clear `in_flight`. `fetched_at` is the start of a successful fetch and
    /// is `None` for a failed one, which leaves `last_fetched_at` untouched.
    pub fn complete(&self, universe: &Universe, unit: &FetchUnit, fetched_at: Option<Instant>) {
        if !universe.tracks_unit(unit) {
            self.units.remove(unit);
            return;
        }

        if let Some(mut state) = self.units.get_mut(unit) {
            state.in_flight = false;
            if let Some(at) = fetched_at {
                state.last_fetched_at = Some(state.last_fetched_at.map_or(at, |prev| prev.max(at)));
            }
        }
    }

    /// Drop a claim taken with `try_begin` whose fetch never ran to
    /// completion. Fetch history is left as it was.
    pub fn release(&self, unit: &FetchUnit) {
        if let Some(mut state) = self.units.get_mut(unit) {
            state.in_flight = false;
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.units.iter().filter(|entry| entry.in_flight).count()
    }
}

/// Drives periodic offset fetches for every unit in the current universe.
pub struct FetchScheduler {
    client: Arc<dyn ClusterClient>,
    universe: Arc<UniverseHandle>,
    units: Arc<UnitTable>,
    engine: Arc<LagEngine>,
    policy: FetchPolicy,
    tick_interval: Duration,
    max_concurrent_fetches: Option<usize>,
}

impl FetchScheduler {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        universe: Arc<UniverseHandle>,
        units: Arc<UnitTable>,
        engine: Arc<LagEngine>,
        config: &ScrapeConfig,
    ) -> Self {
        Self {
            client,
            universe,
            units,
            engine,
            policy: FetchPolicy::from(config),
            tick_interval: config.effective_tick_interval(),
            max_concurrent_fetches: config.max_concurrent_fetches,
        }
    }

    #[cfg(test)]
    pub fn with_max_concurrent_fetches(mut self, cap: Option<usize>) -> Self {
        self.max_concurrent_fetches = cap;
        self
    }

    #[cfg(test)]
    pub fn units(&self) -> &Arc<UnitTable> {
        &self.units
    }

    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, lifecycle: Lifecycle) {
        info!(
            tick_interval = ?self.tick_interval,
            fetch_min = ?self.policy.min,
            fetch_max = ?self.policy.max,
            max_concurrent_fetches = ?self.max_concurrent_fetches,
            "Starting fetch scheduler"
        );

        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                () = lifecycle.token().cancelled() => {
                    info!("Received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    self.tick(&lifecycle);
                }
            }
        }

        info!(in_flight = self.units.in_flight_count(), "Fetch scheduler stopped");
    }

    /// Units to dispatch now: mandatory ones first, then the stalest eligible
    /// ones while the concurrency cap allows.
    pub fn plan(&self, universe: &Universe, now: Instant) -> Vec<FetchUnit> {
        let mut candidates: Vec<(Due, Option<Instant>, FetchUnit)> = universe
            .units()
            .filter_map(|unit| {
                let state = self.units.state(&unit).unwrap_or_default();
                if state.in_flight {
                    return None;
                }
                match self.policy.classify(state.last_fetched_at, now) {
                    Due::NotDue => None,
                    due => Some((due, state.last_fetched_at, unit)),
                }
            })
            .collect();

        // Never-fetched (None) sorts before any instant
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

        let mut budget = self
            .max_concurrent_fetches
            .map(|cap| cap.saturating_sub(self.units.in_flight_count()));

        candidates
            .into_iter()
            .filter_map(|(due, _, unit)| {
                let Some(left) = budget.as_mut() else {
                    return Some(unit);
                };
                if due == Due::Mandatory {
                    *left = left.saturating_sub(1);
                    Some(unit)
                } else if *left > 0 {
                    *left -= 1;
                    Some(unit)
                } else {
                    None
                }
            })
            .collect()
    }

    /// One scheduling pass. Returns the number of fetches dispatched.
    pub fn tick(self: &Arc<Self>, lifecycle: &Lifecycle) -> usize {
        if lifecycle.is_shutting_down() {
            return 0;
        }

        let universe = self.universe.load();
        let now = Instant::now();
        let mut dispatched = 0;

        for unit in self.plan(&universe, now) {
            if !self.units.try_begin(&unit) {
                continue;
            }
            let scheduler = Arc::clone(self);
            lifecycle.spawn(async move { scheduler.fetch(unit, now).await });
            dispatched += 1;
        }

        if dispatched > LARGE_TICK_WARN_THRESHOLD {
            warn!(
                dispatched = dispatched,
                units = universe.partition_count() + universe.group_count(),
                "Large fetch burst in a single tick"
            );
        } else if dispatched > 0 {
            trace!(dispatched = dispatched, "Dispatched fetches");
        }
        dispatched
    }

    async fn fetch(&self, unit: FetchUnit, started: Instant) {
        let result = match &unit {
            FetchUnit::Partition(tp) => self.fetch_partition(tp, started).await,
            FetchUnit::Group(group) => self.fetch_group(group, started).await,
        };

        if let Err(e) = result {
            let leader = match &unit {
                FetchUnit::Partition(tp) => self.universe.load().leader(tp),
                FetchUnit::Group(_) => None,
            };
            warn!(
                unit = %unit,
                leader = ?leader,
                error = %e,
                "Offset fetch failed, retrying on a later tick"
            );
            self.universe
                .read(|universe| self.units.complete(universe, &unit, None));
        }
    }

    #[instrument(level = "debug", skip_all, fields(topic = %tp.topic, partition = tp.partition))]
    async fn fetch_partition(&self, tp: &TopicPartition, started: Instant) -> Result<()> {
        let offset = self.client.fetch_high_water_mark(tp).await?;

        let recorded = self.universe.read(|universe| {
            let recorded = self.engine.record_high_water_mark(universe, tp, offset);
            self.units
                .complete(universe, &FetchUnit::Partition(tp.clone()), Some(started));
            recorded
        });
        trace!(offset = offset, recorded = recorded, "Fetched high-water mark");
        Ok(())
    }

    #[instrument(level = "debug", skip_all, fields(group = group))]
    async fn fetch_group(&self, group: &str, started: Instant) -> Result<()> {
        let partitions = self.universe.load().partitions().to_vec();
        let offsets = self
            .client
            .fetch_committed_offsets(group, &partitions)
            .await?;
        let count = offsets.len();

        self.universe.read(|universe| {
            self.engine
                .record_committed_offsets(universe, group, offsets);
            self.units
                .complete(universe, &FetchUnit::Group(group.to_string()), Some(started));
        });
        debug!(partitions = count, "Fetched committed offsets");
        Ok(())
    }
}

impl std::fmt::Debug for FetchScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FetchScheduler")
            .field("policy", &self.policy)
            .field("tick_interval", &self.tick_interval)
            .field("max_concurrent_fetches", &self.max_concurrent_fetches)
            .finish_non_exhaustive()
    }
}
