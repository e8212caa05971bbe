use crate::cluster::refresher::{MetadataRefresher, RefreshSummary};
use crate::cluster::universe::{Universe, UniverseHandle};
use crate::collector::lag_calculator::LagEngine;
use crate::collector::scheduler::{FetchPolicy, FetchScheduler, UnitTable};
use crate::config::Config;
use crate::error::Result;
use crate::kafka::ClusterClient;
use crate::lifecycle::Lifecycle;
use crate::metrics::store::MetricsStore;
use std::sync::Arc;
use tracing::{info, instrument};

/// Owns the shared scrape state and wires the refresher and scheduler to it.
pub struct ClusterManager {
    refresher: Arc<MetadataRefresher>,
    scheduler: Arc<FetchScheduler>,
    store: Arc<MetricsStore>,
    universe: Arc<UniverseHandle>,
}

impl ClusterManager {
    pub fn new(
        client: Arc<dyn ClusterClient>,
        config: &Config,
        store: Arc<MetricsStore>,
    ) -> Result<Self> {
        let filters = config.cluster.compile_filters()?;
        let universe = Arc::new(UniverseHandle::default());
        let units = Arc::new(UnitTable::new());
        let engine = Arc::new(LagEngine::new(Arc::clone(&store)));

        let refresher = MetadataRefresher::new(
            Arc::clone(&client),
            filters,
            Arc::clone(&universe),
            Arc::clone(&units),
            Arc::clone(&engine),
            FetchPolicy::from(&config.scrape),
            config.scrape.metadata_refresh_interval,
        );
        let scheduler = FetchScheduler::new(
            client,
            Arc::clone(&universe),
            units,
            engine,
            &config.scrape,
        );

        info!(
            topics = config.cluster.topics,
            groups = config.cluster.groups,
            refresh_interval = ?config.scrape.metadata_refresh_interval,
            fetch_min = ?config.scrape.fetch_offset_min_interval,
            fetch_max = ?config.scrape.fetch_offset_max_interval,
            "Created cluster manager"
        );

        Ok(Self {
            refresher: Arc::new(refresher),
            scheduler: Arc::new(scheduler),
            store,
            universe,
        })
    }

    /// Run the first metadata refresh, then start the refresh and fetch loops
    /// on `lifecycle`. A failed first refresh is returned to the caller.
    #[instrument(skip_all)]
    pub async fn start(&self, lifecycle: &Lifecycle) -> Result<RefreshSummary> {
        let summary = self.refresher.refresh_once().await?;
        self.store.set_healthy(true);

        lifecycle.spawn(Arc::clone(&self.refresher).run(lifecycle.clone()));
        lifecycle.spawn(Arc::clone(&self.scheduler).run(lifecycle.clone()));

        info!(
            brokers = summary.brokers,
            partitions = summary.partitions,
            groups = summary.groups,
            "Started scrape loops"
        );
        Ok(summary)
    }

    pub fn universe(&self) -> Arc<Universe> {
        self.universe.load()
    }
}

impl std::fmt::Debug for ClusterManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterManager")
            .field("refresher", &self.refresher)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}
