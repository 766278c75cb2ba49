//! Metrics collection and reporting for the classification engine.
//!
//! The hot path only bumps plain counters; this module turns them into an
//! inspectable, exportable form. Users can register custom metrics next to
//! the built-in ones and print them or save them to a JSON file.
//!
//! # Example
//!
//! ```
//! use flowctx::metrics::{CounterMetric, Metric, MetricsCollector};
//!
//! let mut metrics = MetricsCollector::new();
//! metrics.register(Box::new(CounterMetric::with_value("input_batches", 12)));
//! metrics.increment_counter("input_batches", 1);
//! assert_eq!(metrics.to_json()["input_batches"]["value"], 13);
//! ```

use crate::manager::Counters;
use anyhow::Result;
use serde_json::{Value, json};
use std::any::Any;
use std::collections::BTreeMap;
use std::fs::File;
use std::io::Write;

/// Trait for custom metrics.
pub trait Metric: Send + Sync + Any {
    /// The name of this metric (e.g. `cache_hit`).
    fn name(&self) -> &str;

    /// The current value of this metric as a JSON value.
    fn value(&self) -> Value;

    /// Optional description of what this metric measures.
    fn description(&self) -> Option<&str> {
        None
    }

    /// Cast to `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;
}

/// A monotonically increasing counter.
#[derive(Debug, Clone)]
pub struct CounterMetric {
    name: String,
    /// Current count.
    pub count: u64,
}

impl CounterMetric {
    /// A named counter starting at `value`.
    #[must_use]
    pub fn with_value(name: &str, value: u64) -> Self {
        Self {
            name: name.to_string(),
            count: value,
        }
    }
}

impl Metric for CounterMetric {
    fn name(&self) -> &str {
        &self.name
    }

    fn value(&self) -> Value {
        json!(self.count)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Container collecting metrics for inspection and export.
#[derive(Default)]
pub struct MetricsCollector {
    metrics: BTreeMap<String, Box<dyn Metric>>,
}

impl MetricsCollector {
    /// An empty collector.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a metric, replacing any metric of the same name.
    pub fn register(&mut self, metric: Box<dyn Metric>) {
        self.metrics.insert(metric.name().to_string(), metric);
    }

    /// Register several metrics at once.
    pub fn register_all(&mut self, metrics: Vec<Box<dyn Metric>>) {
        for metric in metrics {
            self.register(metric);
        }
    }

    /// Add `value` to the counter called `name`, creating it at zero
    /// first when missing.
    pub fn increment_counter(&mut self, name: &str, value: u64) {
        match self
            .metrics
            .get_mut(name)
            .and_then(|m| m.as_any().downcast_ref::<CounterMetric>().cloned())
        {
            Some(counter) => {
                self.register(Box::new(CounterMetric::with_value(
                    name,
                    counter.count + value,
                )));
            }
            None => self.register(Box::new(CounterMetric::with_value(name, value))),
        }
    }

    /// Current value of a counter, if registered.
    #[must_use]
    pub fn counter(&self, name: &str) -> Option<u64> {
        self.metrics
            .get(name)?
            .as_any()
            .downcast_ref::<CounterMetric>()
            .map(|c| c.count)
    }

    /// All metrics as one JSON object.
    #[must_use]
    pub fn to_json(&self) -> Value {
        let mut out = serde_json::Map::new();
        for (name, metric) in &self.metrics {
            let mut obj = serde_json::Map::new();
            obj.insert("value".to_string(), metric.value());
            if let Some(desc) = metric.description() {
                obj.insert("description".to_string(), json!(desc));
            }
            out.insert(name.clone(), Value::Object(obj));
        }
        Value::Object(out)
    }

    /// Print all metrics to stdout.
    pub fn print(&self) {
        println!("=== Metrics ===");
        for (name, metric) in &self.metrics {
            println!("{name}: {}", metric.value());
        }
    }

    /// Save all metrics to a JSON file.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors.
    pub fn save_to_file(&self, path: &str) -> Result<()> {
        let mut file = File::create(path)?;
        file.write_all(serde_json::to_string_pretty(&self.to_json())?.as_bytes())?;
        Ok(())
    }
}

impl Counters {
    /// Export the hot-path counters into `collector`.
    pub fn register_into(&self, collector: &mut MetricsCollector) {
        collector.register_all(vec![
            Box::new(CounterMetric::with_value("cache_hit", self.cache_hit)),
            Box::new(CounterMetric::with_value("cache_miss", self.cache_miss)),
            Box::new(CounterMetric::with_value("cache_sharing", self.cache_sharing)),
            Box::new(CounterMetric::with_value("early_dropped", self.early_dropped)),
            Box::new(CounterMetric::with_value("unclassified", self.unclassified)),
            Box::new(CounterMetric::with_value(
                "builder_forced_flush",
                self.builder_forced_flush,
            )),
            Box::new(CounterMetric::with_value(
                "timeout_released",
                self.timeout_released,
            )),
        ]);
    }
}
