use crate::metrics::definitions::{
    HELP_LAST_REFRESH_TIMESTAMP, HELP_TRACKED_GROUPS, HELP_TRACKED_PARTITIONS, HELP_UP,
    METRIC_LAST_REFRESH_TIMESTAMP, METRIC_TRACKED_GROUPS, METRIC_TRACKED_PARTITIONS, METRIC_UP,
};
use crate::metrics::store::{Labels, MetricsStore};
use std::fmt::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Renders the metrics store in the Prometheus text exposition format.
#[derive(Clone)]
pub struct PrometheusExporter {
    store: Arc<MetricsStore>,
}

impl PrometheusExporter {
    pub fn new(store: Arc<MetricsStore>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &Arc<MetricsStore> {
        &self.store
    }

    pub fn render_metrics(&self) -> String {
        let snapshot = self.store.snapshot();
        let mut output = String::with_capacity(snapshot.len() * 96 + 1024);

        // Snapshot is sorted by name, so each name's series are contiguous
        let mut current: Option<&str> = None;
        for series in &snapshot {
            if current != Some(series.name.as_str()) {
                let _ = writeln!(output, "# HELP {} {}", series.name, series.help);
                let _ = writeln!(output, "# TYPE {} gauge", series.name);
                current = Some(series.name.as_str());
            }
            // The sample timestamp is when the value was last fetched, so a
            // stalled fetch shows up as an ageing sample
            let _ = writeln!(
                output,
                "{}{} {} {}",
                series.name,
                render_labels(&series.labels),
                series.value,
                timestamp_millis(series.updated_at)
            );
        }

        write_gauge(&mut output, METRIC_UP, HELP_UP, u8::from(self.store.is_healthy()));
        write_gauge(
            &mut output,
            METRIC_LAST_REFRESH_TIMESTAMP,
            HELP_LAST_REFRESH_TIMESTAMP,
            self.store.last_refresh_timestamp(),
        );
        write_gauge(
            &mut output,
            METRIC_TRACKED_PARTITIONS,
            HELP_TRACKED_PARTITIONS,
            self.store.tracked_partitions(),
        );
        write_gauge(
            &mut output,
            METRIC_TRACKED_GROUPS,
            HELP_TRACKED_GROUPS,
            self.store.tracked_groups(),
        );

        output
    }
}

fn timestamp_millis(at: SystemTime) -> u128 {
    at.duration_since(UNIX_EPOCH)
        .map_or(0, |since_epoch| since_epoch.as_millis())
}

fn write_gauge(output: &mut String, name: &str, help: &str, value: impl std::fmt::Display) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} gauge");
    let _ = writeln!(output, "{name} {value}");
}

fn render_labels(labels: &Labels) -> String {
    if labels.is_empty() {
        return String::new();
    }

    // BTreeMap iteration is already key-ordered
    let label_str = labels
        .iter()
        .map(|(k, v)| format!("{}=\"{}\"", k, escape_label_value(v)))
        .collect::<Vec<_>>()
        .join(",");

    format!("{{{label_str}}}")
}

fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}
