pub const METRIC_PARTITION_LATEST_OFFSET: &str = "kafka_partition_latest_offset";

pub const METRIC_GROUP_OFFSET: &str = "kafka_consumergroup_group_offset";
pub const METRIC_GROUP_LAG: &str = "kafka_consumergroup_group_lag";

pub const METRIC_UP: &str = "kafka_offset_exporter_up";
pub const METRIC_LAST_REFRESH_TIMESTAMP: &str =
    "kafka_offset_exporter_last_refresh_timestamp_seconds";
pub const METRIC_TRACKED_PARTITIONS: &str = "kafka_offset_exporter_tracked_partitions";
pub const METRIC_TRACKED_GROUPS: &str = "kafka_offset_exporter_tracked_groups";

pub const LABEL_GROUP: &str = "group";
pub const LABEL_TOPIC: &str = "topic";
pub const LABEL_PARTITION: &str = "partition";

pub const HELP_PARTITION_LATEST_OFFSET: &str = "Latest (high watermark) offset for a partition";
pub const HELP_GROUP_OFFSET: &str = "Last committed offset for a consumer group partition";
pub const HELP_GROUP_LAG: &str =
    "Offset lag (high_watermark - committed) for a consumer group partition";
pub const HELP_UP: &str = "1 if cluster metadata is being refreshed successfully, 0 otherwise";
pub const HELP_LAST_REFRESH_TIMESTAMP: &str =
    "Unix timestamp of the last successful metadata refresh";
pub const HELP_TRACKED_PARTITIONS: &str = "Number of partitions in the tracked universe";
pub const HELP_TRACKED_GROUPS: &str = "Number of consumer groups in the tracked universe";
