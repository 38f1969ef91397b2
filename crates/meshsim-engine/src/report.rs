//! Run statistics, periodic datapoints, the end-of-run summary and the
//! dependency graph export.

use crate::operation::OperationRegistry;
use meshsim_core::{FailureReason, ServiceId, SimTime};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Counters accumulated while the simulation runs.
#[derive(Debug, Default)]
pub struct RunStats {
    generated: u64,
    completed: u64,
    /// Final failures of user requests.
    failures: BTreeMap<FailureReason, u64>,
    /// Dependencies given up on inside the system, by reason.
    dependency_failures: BTreeMap<FailureReason, u64>,
    retries: u64,
    /// Response times of completed user requests, in seconds.
    response_times: Vec<f64>,
}

impl RunStats {
    pub fn record_generated(&mut self) {
        self.generated += 1;
    }

    pub fn record_completed(&mut self, response_time: f64) {
        self.completed += 1;
        self.response_times.push(response_time);
    }

    pub fn record_failed(&mut self, reason: FailureReason) {
        *self.failures.entry(reason).or_insert(0) += 1;
    }

    pub fn record_dependency_failure(&mut self, reason: FailureReason) {
        *self.dependency_failures.entry(reason).or_insert(0) += 1;
    }

    pub fn record_retry(&mut self) {
        self.retries += 1;
    }

    pub fn generated(&self) -> u64 {
        self.generated
    }

    pub fn completed(&self) -> u64 {
        self.completed
    }

    pub fn failed(&self) -> u64 {
        self.failures.values().sum()
    }

    pub fn failures(&self, reason: FailureReason) -> u64 {
        self.failures.get(&reason).copied().unwrap_or(0)
    }

    pub fn dependency_failures(&self, reason: FailureReason) -> u64 {
        self.dependency_failures.get(&reason).copied().unwrap_or(0)
    }

    pub fn retries(&self) -> u64 {
        self.retries
    }

    pub fn response_times(&self) -> &[f64] {
        &self.response_times
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ResponseTimes {
    pub mean: f64,
    pub p50: f64,
    pub p99: f64,
    pub max: f64,
}

impl ResponseTimes {
    pub fn from_samples(samples: &[f64]) -> Self {
        if samples.is_empty() {
            return Self::default();
        }
        let mean = samples.iter().sum::<f64>() / samples.len() as f64;
        let (p50, p99) = compute_percentiles(samples);
        let max = samples.iter().copied().fold(f64::MIN, f64::max);
        Self { mean, p50, p99, max }
    }
}

/// Compute P50 and P99 from unsorted samples.
///
/// Returns (p50, p99). If empty, returns (0.0, 0.0).
fn compute_percentiles(samples: &[f64]) -> (f64, f64) {
    if samples.is_empty() {
        return (0.0, 0.0);
    }

    let mut sorted = samples.to_vec();
    sorted.sort_unstable_by(f64::total_cmp);

    let p50_idx = (sorted.len() as f64 * 0.50) as usize;
    let p99_idx = (sorted.len() as f64 * 0.99) as usize;

    let p50 = sorted[p50_idx.min(sorted.len() - 1)];
    let p99 = sorted[p99_idx.min(sorted.len() - 1)];

    (p50, p99)
}

/// End-of-run summary of one experiment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationSummary {
    pub experiment: String,
    pub seed: u64,
    /// Simulated time at which the run stopped.
    pub end_time: f64,
    pub events_processed: u64,
    pub generated: u64,
    pub completed: u64,
    pub failed: u64,
    pub failures: BTreeMap<FailureReason, u64>,
    pub dependency_failures: BTreeMap<FailureReason, u64>,
    pub retries: u64,
    /// User requests still inside the system at the end.
    pub in_flight: u64,
    pub response_times: ResponseTimes,
    /// Instances counting towards each service's target at the end.
    pub instances: BTreeMap<String, usize>,
}

impl SimulationSummary {
    pub fn from_stats(
        experiment: &str,
        seed: u64,
        end_time: SimTime,
        events_processed: u64,
        stats: &RunStats,
        instances: BTreeMap<String, usize>,
    ) -> Self {
        let failed = stats.failed();
        Self {
            experiment: experiment.to_string(),
            seed,
            end_time: end_time.as_secs(),
            events_processed,
            generated: stats.generated,
            completed: stats.completed,
            failed,
            failures: stats.failures.clone(),
            dependency_failures: stats.dependency_failures.clone(),
            retries: stats.retries,
            in_flight: stats.generated.saturating_sub(stats.completed + failed),
            response_times: ResponseTimes::from_samples(&stats.response_times),
            instances,
        }
    }

    /// Share of generated requests that completed.
    pub fn success_rate(&self) -> f64 {
        if self.generated == 0 {
            return 0.0;
        }
        self.completed as f64 / self.generated as f64
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for SimulationSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "experiment:  {} (seed {})", self.experiment, self.seed)?;
        writeln!(f, "ended at:    {:.3}s after {} events", self.end_time, self.events_processed)?;
        writeln!(
            f,
            "requests:    {} generated, {} completed, {} failed, {} in flight",
            self.generated, self.completed, self.failed, self.in_flight
        )?;
        writeln!(f, "success:     {:.2}%", self.success_rate() * 100.0)?;
        writeln!(
            f,
            "response:    mean {:.4}s  p50 {:.4}s  p99 {:.4}s  max {:.4}s",
            self.response_times.mean,
            self.response_times.p50,
            self.response_times.p99,
            self.response_times.max
        )?;
        writeln!(f, "retries:     {}", self.retries)?;
        for (reason, count) in &self.failures {
            writeln!(f, "failed:      {reason} x{count}")?;
        }
        for (reason, count) in &self.dependency_failures {
            writeln!(f, "dependency:  {reason} x{count}")?;
        }
        for (service, count) in &self.instances {
            writeln!(f, "instances:   {service} = {count}")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub time: f64,
    pub value: f64,
}

/// Named time series sampled during a run.
///
/// Series names are `<entity>.<metric>`, e.g. `backend#0.cpu.usage`.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Reporter {
    series: BTreeMap<String, Vec<DataPoint>>,
}

impl Reporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: impl Into<String>, time: SimTime, value: f64) {
        self.series.entry(name.into()).or_default().push(DataPoint {
            time: time.as_secs(),
            value,
        });
    }

    pub fn series(&self, name: &str) -> Option<&[DataPoint]> {
        self.series.get(name).map(Vec::as_slice)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.series.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

/// One service in the dependency graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: usize,
    pub name: String,
    pub operations: Vec<String>,
    pub instances: usize,
}

/// A possible call from an operation of `source` to an operation of `target`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphLink {
    pub source: usize,
    pub target: usize,
    pub operation: String,
    pub target_operation: String,
    pub probability: f64,
}

/// Services and the calls between them, as configured.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub experiment: String,
    pub nodes: Vec<GraphNode>,
    pub links: Vec<GraphLink>,
}

impl DependencyGraph {
    /// `instances` reports the live instance count of a service.
    pub fn build(
        experiment: &str,
        registry: &OperationRegistry,
        instances: impl Fn(ServiceId) -> usize,
    ) -> Self {
        let mut nodes = Vec::with_capacity(registry.service_count());
        let mut links = Vec::new();
        for idx in 0..registry.service_count() {
            let service = ServiceId(idx);
            let mut operations = Vec::new();
            for op in registry.operations_of(service) {
                operations.push(op.name.clone());
                for dep in &op.dependencies {
                    let target_operation = registry
                        .operation(dep.target)
                        .map(|t| t.name.clone())
                        .unwrap_or_else(|_| dep.target.to_string());
                    links.push(GraphLink {
                        source: idx,
                        target: dep.service.0,
                        operation: op.name.clone(),
                        target_operation,
                        probability: dep.probability,
                    });
                }
            }
            nodes.push(GraphNode {
                id: idx,
                name: registry.service_name(service).to_string(),
                operations,
                instances: instances(service),
            });
        }
        Self {
            experiment: experiment.to_string(),
            nodes,
            links,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    /// Graphviz rendering, one box per service.
    pub fn to_dot(&self) -> String {
        let mut out = format!("digraph {:?} {{\n    node [shape=box];\n", self.experiment);
        for node in &self.nodes {
            let label = format!(
                "{}\\n{}\\n{} instances",
                node.name,
                node.operations.join(", "),
                node.instances
            );
            out.push_str(&format!("    {:?} [label=\"{label}\"];\n", node.name));
        }
        for link in &self.links {
            let (Some(source), Some(target)) =
                (self.nodes.get(link.source), self.nodes.get(link.target))
            else {
                continue;
            };
            let mut label = format!("{} -> {}", link.operation, link.target_operation);
            if link.probability < 1.0 {
                label.push_str(&format!(" ({:.2})", link.probability));
            }
            out.push_str(&format!(
                "    {:?} -> {:?} [label=\"{label}\"];\n",
                source.name, target.name
            ));
        }
        out.push_str("}\n");
        out
    }
}
