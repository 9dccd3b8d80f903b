//! Metric registry
//!
//! Owns every counter and histogram family the interceptor writes into. The
//! registry is an explicit value: construct it once at startup and hand a
//! clone to each interceptor. Clones share the same underlying state.
//!
//! Declaration goes through a small table guarded by a mutex so that
//! redeclaring a family with the same shape is a no-op and a conflicting
//! shape is rejected. Updates never touch that table; `increment` and
//! `observe` go straight to prometheus's atomic counters.

use crate::error::{MetricsError, Result};
use parking_lot::Mutex;
use prometheus::proto;
use prometheus::{Encoder, Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, TextEncoder};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Kind of aggregate a family holds
#[derive(Debug, Clone, PartialEq)]
pub enum MetricKind {
    Counter,
    Histogram { buckets: Vec<f64> },
}

/// Shape of a metric family: name, help text, label names and kind
#[derive(Debug, Clone, PartialEq)]
pub struct FamilyOpts {
    pub name: String,
    pub help: String,
    pub label_names: Vec<String>,
    pub kind: MetricKind,
}

impl FamilyOpts {
    pub fn counter(name: impl Into<String>, help: impl Into<String>, label_names: &[&str]) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            label_names: label_names.iter().map(|l| l.to_string()).collect(),
            kind: MetricKind::Counter,
        }
    }

    pub fn histogram(
        name: impl Into<String>,
        help: impl Into<String>,
        label_names: &[&str],
        buckets: Vec<f64>,
    ) -> Self {
        Self {
            name: name.into(),
            help: help.into(),
            label_names: label_names.iter().map(|l| l.to_string()).collect(),
            kind: MetricKind::Histogram { buckets },
        }
    }

    fn label_refs(&self) -> Vec<&str> {
        self.label_names.iter().map(String::as_str).collect()
    }
}

/// Counter family keyed by label values
#[derive(Clone)]
pub struct CounterFamily {
    vec: IntCounterVec,
}

impl CounterFamily {
    /// Add one to the counter for `label_values`, creating it on first use
    pub fn increment(&self, label_values: &[&str]) {
        self.vec.with_label_values(label_values).inc();
    }
}

/// Histogram family keyed by label values
#[derive(Clone)]
pub struct HistogramFamily {
    vec: HistogramVec,
}

impl HistogramFamily {
    /// Record `value` for `label_values`, creating the histogram on first use
    pub fn observe(&self, label_values: &[&str], value: f64) {
        self.vec.with_label_values(label_values).observe(value);
    }
}

/// A declared family of either kind
#[derive(Clone)]
pub enum Family {
    Counter(CounterFamily),
    Histogram(HistogramFamily),
}

/// Point-in-time view of one histogram series
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistogramSample {
    pub count: u64,
    pub sum: f64,
}

struct Declared {
    opts: FamilyOpts,
    family: Family,
}

struct RegistryInner {
    prometheus: prometheus::Registry,
    declared: Mutex<HashMap<String, Declared>>,
}

/// Process-wide store of metric families
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Registry {
    /// Create a registry backed by a fresh prometheus registry
    pub fn new() -> Self {
        Self::with_prometheus(prometheus::Registry::new())
    }

    /// Declare families into an existing prometheus registry, e.g. the one a
    /// host's `/metrics` endpoint already gathers from
    pub fn with_prometheus(prometheus: prometheus::Registry) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                prometheus,
                declared: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Declare a family once
    ///
    /// Redeclaring a name with an identical shape returns the existing
    /// family. A different shape fails with `ConflictingDeclaration`.
    pub fn declare(&self, opts: FamilyOpts) -> Result<Family> {
        let mut declared = self.inner.declared.lock();

        if let Some(existing) = declared.get(&opts.name) {
            if existing.opts == opts {
                return Ok(existing.family.clone());
            }
            error!(name = %opts.name, "metric family redeclared with a different shape");
            return Err(MetricsError::ConflictingDeclaration { name: opts.name });
        }

        let labels = opts.label_refs();
        let family = match &opts.kind {
            MetricKind::Counter => {
                let vec = IntCounterVec::new(Opts::new(&opts.name, &opts.help), &labels)?;
                self.inner.prometheus.register(Box::new(vec.clone()))?;
                Family::Counter(CounterFamily { vec })
            }
            MetricKind::Histogram { buckets } => {
                let histogram_opts = HistogramOpts {
                    common_opts: Opts::new(&opts.name, &opts.help),
                    buckets: buckets.clone(),
                };
                validate_buckets(&histogram_opts)?;
                let vec = HistogramVec::new(histogram_opts, &labels)?;
                self.inner.prometheus.register(Box::new(vec.clone()))?;
                Family::Histogram(HistogramFamily { vec })
            }
        };

        debug!(name = %opts.name, labels = ?opts.label_names, "declared metric family");
        declared.insert(
            opts.name.clone(),
            Declared {
                opts,
                family: family.clone(),
            },
        );
        Ok(family)
    }

    pub fn declare_counter(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
    ) -> Result<CounterFamily> {
        match self.declare(FamilyOpts::counter(name, help, label_names))? {
            Family::Counter(family) => Ok(family),
            Family::Histogram(_) => Err(MetricsError::ConflictingDeclaration {
                name: name.to_string(),
            }),
        }
    }

    pub fn declare_histogram(
        &self,
        name: &str,
        help: &str,
        label_names: &[&str],
        buckets: Vec<f64>,
    ) -> Result<HistogramFamily> {
        match self.declare(FamilyOpts::histogram(name, help, label_names, buckets))? {
            Family::Histogram(family) => Ok(family),
            Family::Counter(_) => Err(MetricsError::ConflictingDeclaration {
                name: name.to_string(),
            }),
        }
    }

    /// The underlying prometheus registry
    pub fn prometheus(&self) -> &prometheus::Registry {
        &self.inner.prometheus
    }

    /// Snapshot every family for exposition
    pub fn gather(&self) -> Vec<proto::MetricFamily> {
        self.inner.prometheus.gather()
    }

    /// Render all families in the Prometheus text format
    pub fn encode_text(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.gather(), &mut buffer)?;
        String::from_utf8(buffer)
            .map_err(|e| prometheus::Error::Msg(e.to_string()).into())
    }

    /// Current value of a counter series, `None` if it was never touched
    pub fn counter_value(&self, name: &str, labels: &[(&str, &str)]) -> Option<u64> {
        self.find_metric(name, labels)
            .map(|metric| metric.get_counter().get_value() as u64)
    }

    /// Current count and sum of a histogram series, `None` if never observed
    pub fn histogram_sample(&self, name: &str, labels: &[(&str, &str)]) -> Option<HistogramSample> {
        self.find_metric(name, labels).map(|metric| {
            let histogram = metric.get_histogram();
            HistogramSample {
                count: histogram.get_sample_count(),
                sum: histogram.get_sample_sum(),
            }
        })
    }

    fn find_metric(&self, name: &str, labels: &[(&str, &str)]) -> Option<proto::Metric> {
        self.gather()
            .into_iter()
            .find(|family| family.get_name() == name)?
            .get_metric()
            .iter()
            .find(|metric| labels_match(metric, labels))
            .cloned()
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

/// HistogramVec defers bucket checks to the first child series, where a bad
/// layout panics. Building an unlabeled histogram runs the same checks now.
fn validate_buckets(opts: &HistogramOpts) -> Result<()> {
    if opts.buckets.iter().any(|bound| bound.is_nan()) {
        let msg = format!("histogram buckets must not contain NaN: {:?}", opts.buckets);
        return Err(prometheus::Error::Msg(msg).into());
    }
    Histogram::with_opts(opts.clone())?;
    Ok(())
}

fn labels_match(metric: &proto::Metric, labels: &[(&str, &str)]) -> bool {
    let pairs = metric.get_label();
    pairs.len() == labels.len()
        && labels.iter().all(|(name, value)| {
            pairs
                .iter()
                .any(|pair| pair.get_name() == *name && pair.get_value() == *value)
        })
}
