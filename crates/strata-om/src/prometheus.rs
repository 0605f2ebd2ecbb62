//! Prometheus text exposition of metrics records
//!
//! Records are pushed into the sink; the sink keeps the latest line for
//! every series (metric name plus tag set) and writes them all on export:
//!
//! ```text
//! # TYPE om_metrics_num_bucket_deletes counter
//! om_metrics_num_bucket_deletes{context="om",hostname="om1"} 12
//! ```

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write;

/// Metric type as exported
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    pub name: String,
    pub kind: MetricKind,
    pub value: f64,
}

/// Named group of metrics sharing one tag set
#[derive(Debug, Clone, PartialEq)]
pub struct MetricsRecord {
    pub name: String,
    pub tags: Vec<(String, String)>,
    pub metrics: Vec<Metric>,
}

impl MetricsRecord {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tags: Vec::new(),
            metrics: Vec::new(),
        }
    }

    #[must_use]
    pub fn tag(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.push((name.into(), value.into()));
        self
    }

    #[must_use]
    pub fn metric(mut self, name: impl Into<String>, kind: MetricKind, value: f64) -> Self {
        self.metrics.push(Metric {
            name: name.into(),
            kind,
            value,
        });
        self
    }
}

/// In-memory Prometheus sink
pub struct PrometheusSink {
    /// Lower-cased tag names left out of series keys
    excluded_tags: HashSet<String>,
    /// Series key -> rendered `# TYPE` and sample lines
    lines: RwLock<BTreeMap<String, String>>,
}

impl PrometheusSink {
    pub fn new(excluded_tags: &[String]) -> Self {
        Self {
            excluded_tags: excluded_tags.iter().map(|t| t.to_lowercase()).collect(),
            lines: RwLock::new(BTreeMap::new()),
        }
    }

    /// Store the current value of every metric in `record`
    pub fn put_metrics(&self, record: &MetricsRecord) {
        let labels = self.render_labels(&record.tags);
        let mut lines = self.lines.write();
        for metric in &record.metrics {
            let name = prometheus_name(&record.name, &metric.name);
            let series = format!("{name}{{{labels}}}");
            let mut text = String::new();
            let _ = writeln!(text, "# TYPE {} {}", name, metric.kind.as_str());
            let _ = writeln!(text, "{} {}", series, metric.value);
            lines.insert(series, text);
        }
    }

    pub fn export(&self) -> String {
        self.lines.read().values().map(String::as_str).collect()
    }

    pub fn series_count(&self) -> usize {
        self.lines.read().len()
    }

    fn render_labels(&self, tags: &[(String, String)]) -> String {
        tags.iter()
            .map(|(name, value)| (name.to_lowercase(), value))
            .filter(|(name, _)| !self.excluded_tags.contains(name))
            .map(|(name, value)| format!("{name}=\"{value}\""))
            .collect::<Vec<_>>()
            .join(",")
    }
}

impl Default for PrometheusSink {
    fn default() -> Self {
        Self::new(&["numopenconnectionsperuser".to_string()])
    }
}

/// `OMMetrics` + `NumBucketDeletes` -> `om_metrics_num_bucket_deletes`
pub fn prometheus_name(record_name: &str, metric_name: &str) -> String {
    normalize_name(&format!(
        "{}{}",
        capitalize(record_name),
        capitalize(metric_name)
    ))
}

/// Split CamelCase into lower-case words joined by `_`, then collapse any
/// run of non-alphanumeric characters into a single `_`.
///
/// A word boundary sits before an upper-case letter that follows a
/// lower-case letter or digit, and before the last capital of an acronym
/// that starts a new word (`OMMetrics` -> `om_metrics`).
pub fn normalize_name(base: &str) -> String {
    let chars: Vec<char> = base.chars().collect();
    let mut split = String::with_capacity(base.len() + 8);
    for (i, &c) in chars.iter().enumerate() {
        if i > 0 && c.is_ascii_uppercase() {
            let prev = chars[i - 1];
            let starts_word = chars.get(i + 1).is_some_and(char::is_ascii_lowercase);
            if !(prev.is_ascii_uppercase() || prev == '_') || starts_word {
                split.push('_');
            }
        }
        split.extend(c.to_lowercase());
    }

    let mut normalized = String::with_capacity(split.len());
    let mut in_separator = false;
    for c in split.chars() {
        if c.is_ascii_alphanumeric() {
            normalized.push(c);
            in_separator = false;
        } else if !in_separator {
            normalized.push('_');
            in_separator = true;
        }
    }
    normalized
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    chars.next().map_or_else(String::new, |first| {
        first.to_uppercase().chain(chars).collect()
    })
}
