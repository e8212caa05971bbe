use crate::config::ClusterConfig;
use crate::error::{Result, ScrapeError};
use async_trait::async_trait;
use rdkafka::admin::AdminClient;
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use std::collections::HashMap;
use std::ffi::{CStr, CString};
use std::fmt;
use std::os::raw::c_char;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
}

impl TopicPartition {
    pub fn new(topic: impl Into<String>, partition: i32) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broker {
    pub id: i32,
    pub host: String,
    pub port: i32,
}

impl Broker {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.id, self.host, self.port)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionInfo {
    pub partition: i32,
    /// Broker id of the partition leader; -1 when leaderless.
    pub leader: i32,
}

/// Brokers and topics as reported by a single metadata request.
#[derive(Debug, Clone, Default)]
pub struct ClusterMetadata {
    pub brokers: Vec<Broker>,
    pub topics: HashMap<String, Vec<PartitionInfo>>,
}

/// Capabilities the scraper needs from the cluster.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Brokers plus every topic's partitions and leaders. Topics whose
    /// metadata carries an error are left out.
    async fn fetch_cluster_metadata(&self) -> Result<ClusterMetadata>;

    async fn list_brokers(&self) -> Result<Vec<Broker>> {
        Ok(self.fetch_cluster_metadata().await?.brokers)
    }

    async fn fetch_high_water_mark(&self, tp: &TopicPartition) -> Result<i64>;

    async fn list_consumer_groups(&self) -> Result<Vec<String>>;

    /// Committed offsets of `group` over `partitions`. Partitions the group
    /// never committed to are left out of the result.
    async fn fetch_committed_offsets(
        &self,
        group: &str,
        partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, i64>>;
}

pub struct KafkaClient {
    admin: Arc<AdminClient<DefaultClientContext>>,
    consumer: Arc<BaseConsumer>,
    timeout: Duration,
}

impl KafkaClient {
    pub fn new(config: &ClusterConfig, timeout: Duration) -> Result<Self> {
        let mut client_config = ClientConfig::new();
        client_config
            .set("bootstrap.servers", config.bootstrap_hosts().join(","))
            .set("client.id", "kafka-offset-exporter");

        for (key, value) in &config.consumer_properties {
            client_config.set(key, value);
        }

        let admin: AdminClient<DefaultClientContext> =
            client_config.create().map_err(ScrapeError::Kafka)?;

        let consumer: BaseConsumer = client_config
            .clone()
            .set("group.id", "kafka-offset-exporter-internal")
            .set("enable.auto.commit", "false")
            .create()
            .map_err(ScrapeError::Kafka)?;

        Ok(Self {
            admin: Arc::new(admin),
            consumer: Arc::new(consumer),
            timeout,
        })
    }
}

#[async_trait]
impl ClusterClient for KafkaClient {
    #[instrument(skip(self))]
    async fn fetch_cluster_metadata(&self) -> Result<ClusterMetadata> {
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || -> Result<ClusterMetadata> {
            let metadata = consumer.fetch_metadata(None, timeout)?;

            let brokers = metadata
                .brokers()
                .iter()
                .map(|b| Broker {
                    id: b.id(),
                    host: b.host().to_string(),
                    port: b.port(),
                })
                .collect();

            let mut topics = HashMap::with_capacity(metadata.topics().len());
            for topic in metadata.topics() {
                if let Some(err) = topic.error() {
                    warn!(topic = topic.name(), error = ?err, "Skipping topic with metadata error");
                    continue;
                }

                let partitions = topic
                    .partitions()
                    .iter()
                    .map(|p| PartitionInfo {
                        partition: p.id(),
                        leader: p.leader(),
                    })
                    .collect();
                topics.insert(topic.name().to_string(), partitions);
            }

            debug!(topics = topics.len(), "Fetched cluster metadata");
            Ok(ClusterMetadata { brokers, topics })
        })
        .await?
    }

    async fn fetch_high_water_mark(&self, tp: &TopicPartition) -> Result<i64> {
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.timeout;
        let tp = tp.clone();

        tokio::task::spawn_blocking(move || -> Result<i64> {
            let (_low, high) = consumer.fetch_watermarks(&tp.topic, tp.partition, timeout)?;
            Ok(high)
        })
        .await?
    }

    #[instrument(skip(self))]
    async fn list_consumer_groups(&self) -> Result<Vec<String>> {
        let consumer = Arc::clone(&self.consumer);
        let timeout = self.timeout;

        tokio::task::spawn_blocking(move || -> Result<Vec<String>> {
            let group_list = consumer.fetch_group_list(None, timeout)?;
            let groups: Vec<String> = group_list
                .groups()
                .iter()
                .map(|g| g.name().to_string())
                .collect();
            debug!(count = groups.len(), "Listed consumer groups");
            Ok(groups)
        })
        .await?
    }

    async fn fetch_committed_offsets(
        &self,
        group: &str,
        partitions: &[TopicPartition],
    ) -> Result<HashMap<TopicPartition, i64>> {
        if partitions.is_empty() {
            return Ok(HashMap::new());
        }

        let admin = Arc::clone(&self.admin);
        let timeout = self.timeout;
        let group = group.to_string();
        let partitions = partitions.to_vec();

        tokio::task::spawn_blocking(move || list_group_offsets(&admin, &group, &partitions, timeout))
            .await?
    }
}

/// ListConsumerGroupOffsets through the shared admin handle, so fetching a
/// group's offsets needs no consumer of its own.
#[instrument(level = "debug", skip(admin, partitions, timeout), fields(count = partitions.len()))]
fn list_group_offsets(
    admin: &AdminClient<DefaultClientContext>,
    group: &str,
    partitions: &[TopicPartition],
    timeout: Duration,
) -> Result<HashMap<TopicPartition, i64>> {
    use rdkafka::bindings::*;

    let group_cstr = CString::new(group)
        .map_err(|e| ScrapeError::Admin(format!("group id contains a null byte: {e}")))?;
    let topic_cstrs = partitions
        .iter()
        .map(|tp| CString::new(tp.topic.as_str()))
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| ScrapeError::Admin(format!("topic name contains a null byte: {e}")))?;
    let timeout_ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    let capacity = i32::try_from(partitions.len()).unwrap_or(i32::MAX);

    /// Frees every native handle acquired below, whichever way we return.
    struct Native {
        tpl: *mut rd_kafka_topic_partition_list_t,
        request: *mut rd_kafka_ListConsumerGroupOffsets_t,
        options: *mut rd_kafka_AdminOptions_t,
        queue: *mut rd_kafka_queue_t,
        event: *mut rd_kafka_event_t,
    }

    impl Drop for Native {
        fn drop(&mut self) {
            unsafe {
                if !self.event.is_null() {
                    rd_kafka_event_destroy(self.event);
                }
                if !self.queue.is_null() {
                    rd_kafka_queue_destroy(self.queue);
                }
                if !self.options.is_null() {
                    rd_kafka_AdminOptions_destroy(self.options);
                }
                // The request copies its partition list, so both are ours
                if !self.request.is_null() {
                    rd_kafka_ListConsumerGroupOffsets_destroy(self.request);
                }
                if !self.tpl.is_null() {
                    rd_kafka_topic_partition_list_destroy(self.tpl);
                }
            }
        }
    }

    let mut native = Native {
        tpl: std::ptr::null_mut(),
        request: std::ptr::null_mut(),
        options: std::ptr::null_mut(),
        queue: std::ptr::null_mut(),
        event: std::ptr::null_mut(),
    };

    unsafe {
        let rk = admin.inner().native_ptr();

        native.tpl = rd_kafka_topic_partition_list_new(capacity);
        if native.tpl.is_null() {
            return Err(ScrapeError::Admin("failed to allocate partition list".into()));
        }
        for (tp, topic) in partitions.iter().zip(&topic_cstrs) {
            rd_kafka_topic_partition_list_add(native.tpl, topic.as_ptr(), tp.partition);
        }

        native.request = rd_kafka_ListConsumerGroupOffsets_new(group_cstr.as_ptr(), native.tpl);
        if native.request.is_null() {
            return Err(ScrapeError::Admin(
                "failed to create ListConsumerGroupOffsets request".into(),
            ));
        }

        native.options = rd_kafka_AdminOptions_new(
            rk,
            rd_kafka_admin_op_t::RD_KAFKA_ADMIN_OP_LISTCONSUMERGROUPOFFSETS,
        );
        if native.options.is_null() {
            return Err(ScrapeError::Admin("failed to create admin options".into()));
        }

        let mut errstr = [0 as c_char; 512];
        let err = rd_kafka_AdminOptions_set_request_timeout(
            native.options,
            timeout_ms,
            errstr.as_mut_ptr(),
            errstr.len(),
        );
        if err != rd_kafka_resp_err_t::RD_KAFKA_RESP_ERR_NO_ERROR {
            let msg = CStr::from_ptr(errstr.as_ptr()).to_string_lossy();
            return Err(ScrapeError::Admin(format!("failed to set request timeout: {msg}")));
        }

        native.queue = rd_kafka_queue_new(rk);
        if native.queue.is_null() {
            return Err(ScrapeError::Admin("failed to create result queue".into()));
        }

        let mut requests = [native.request];
        rd_kafka_ListConsumerGroupOffsets(
            rk,
            requests.as_mut_ptr(),
            requests.len(),
            native.options,
            native.queue,
        );

        native.event = rd_kafka_queue_poll(native.queue, timeout_ms);
        if native.event.is_null() {
            return Err(ScrapeError::Admin(format!(
                "ListConsumerGroupOffsets timed out after {timeout:?}"
            )));
        }

        let event_type = rd_kafka_event_type(native.event);
        if event_type != RD_KAFKA_EVENT_LISTCONSUMERGROUPOFFSETS_RESULT {
            return Err(ScrapeError::Admin(format!(
                "unexpected admin event type {event_type}"
            )));
        }

        if rd_kafka_event_error(native.event) != rd_kafka_resp_err_t::RD_KAFKA_RESP_ERR_NO_ERROR {
            return Err(ScrapeError::Admin(format!(
                "ListConsumerGroupOffsets failed: {}",
                c_message(rd_kafka_event_error_string(native.event))
            )));
        }

        let result = rd_kafka_event_ListConsumerGroupOffsets_result(native.event);
        if result.is_null() {
            return Err(ScrapeError::Admin(
                "ListConsumerGroupOffsets returned no result".into(),
            ));
        }

        let mut group_count: usize = 0;
        let group_results = rd_kafka_ListConsumerGroupOffsets_result_groups(result, &mut group_count);

        let mut offsets = HashMap::new();
        for i in 0..group_count {
            let group_result = *group_results.add(i);

            // A per-group error (e.g. coordinator loading) is transient; an
            // empty map here would wipe the group's series instead
            let group_error = rd_kafka_group_result_error(group_result);
            if !group_error.is_null()
                && rd_kafka_error_code(group_error) != rd_kafka_resp_err_t::RD_KAFKA_RESP_ERR_NO_ERROR
            {
                return Err(ScrapeError::Admin(format!(
                    "offsets for group {group} unavailable: {}",
                    c_message(rd_kafka_error_string(group_error))
                )));
            }

            let list = rd_kafka_group_result_partitions(group_result);
            if list.is_null() {
                continue;
            }

            let count = usize::try_from((*list).cnt).unwrap_or(0);
            for j in 0..count {
                let elem = &*(*list).elems.add(j);
                // RD_KAFKA_OFFSET_INVALID (-1001) means nothing committed
                if elem.offset < 0 || elem.err != rd_kafka_resp_err_t::RD_KAFKA_RESP_ERR_NO_ERROR {
                    continue;
                }
                let topic = CStr::from_ptr(elem.topic).to_string_lossy().into_owned();
                offsets.insert(TopicPartition::new(topic, elem.partition), elem.offset);
            }
        }

        debug!(committed = offsets.len(), "Fetched committed offsets");
        Ok(offsets)
    }
}

/// # Safety
/// `ptr` must be null or a NUL-terminated string owned by librdkafka.
unsafe fn c_message(ptr: *const c_char) -> String {
    if ptr.is_null() {
        "unknown error".to_string()
    } else {
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }
}

impl fmt::Debug for KafkaClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaClient")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
