//! Experiment configuration parser.
//!
//! An experiment is a single TOML document:
//!
//! ```toml
//! [experiment]
//! name = "checkout"
//! duration = 60.0
//! seed = 7
//!
//! [[services]]
//! name = "frontend"
//! capacity = 1000
//! instances = 2
//!
//! [[services.operations]]
//! name = "index"
//! demand = 100
//! dependencies = [{ service = "catalog", operation = "list" }]
//!
//! [[generators]]
//! service = "frontend"
//! operation = "index"
//! interval = 0.1
//! ```

use crate::error::{SimError, SimResult};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimConfig {
    pub experiment: ExperimentConfig,
    #[serde(default)]
    pub network: NetworkConfig,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub generators: Vec<GeneratorConfig>,
    #[serde(default)]
    pub events: Vec<ExperimentEventConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfig {
    pub name: String,
    /// Simulated seconds to run.
    pub duration: f64,
    #[serde(default = "default_seed")]
    pub seed: u64,
    /// Sampling period of the reporter; no sampling when absent.
    pub report_interval: Option<f64>,
}

/// Latency added to every internal request, drawn uniformly from
/// `[min_latency, max_latency]`. User requests arrive without latency.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default)]
    pub min_latency: f64,
    #[serde(default)]
    pub max_latency: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub name: String,
    /// Total CPU capacity of one instance, in demand units per second.
    #[serde(default = "default_capacity")]
    pub capacity: u64,
    #[serde(default = "default_instances")]
    pub instances: usize,
    #[serde(default = "default_thread_pool")]
    pub thread_pool_size: usize,
    #[serde(default)]
    pub scheduler: PolicyConfig,
    #[serde(default)]
    pub load_balancer: BalancerKind,
    #[serde(default)]
    pub patterns: Vec<PatternConfig>,
    pub autoscaler: Option<AutoscalerConfig>,
    #[serde(default)]
    pub operations: Vec<OperationConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationConfig {
    pub name: String,
    pub demand: u64,
    #[serde(default)]
    pub dependencies: Vec<DependencyConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencyConfig {
    pub service: String,
    pub operation: String,
    #[serde(default = "default_probability")]
    pub probability: f64,
    /// Extra network delay in seconds added on top of the network latency.
    #[serde(default)]
    pub extra_delay: f64,
}

/// CPU scheduling policy of a service's instances.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PolicyConfig {
    #[default]
    Fifo,
    ShortestProcessNext,
    RoundRobin {
        #[serde(default)]
        min_quantum: Option<u64>,
    },
    MultiLevelFeedback {
        #[serde(default)]
        levels: Option<usize>,
    },
}

/// Instance selection strategy of a service's load balancer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalancerKind {
    Random,
    #[default]
    Even,
    Utilization,
    RoundRobin,
}

/// Resilience pattern attached to every instance of a service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PatternConfig {
    CircuitBreaker(CircuitBreakerConfig),
    Retry(RetryConfig),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    #[serde(default = "default_rolling_window")]
    pub rolling_window: usize,
    /// Error rate that opens the circuit. Values in (1, 100] are percentages.
    #[serde(default = "default_error_threshold")]
    pub error_threshold: f64,
    /// Seconds an open circuit waits before probing with one request.
    #[serde(default = "default_sleep_window")]
    pub sleep_window: f64,
    /// Maximum concurrent connections per target service; unlimited when absent.
    pub request_volume_threshold: Option<u32>,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            rolling_window: default_rolling_window(),
            error_threshold: default_error_threshold(),
            sleep_window: default_sleep_window(),
            request_volume_threshold: None,
        }
    }
}

impl CircuitBreakerConfig {
    /// Error threshold as a fraction in [0, 1].
    pub fn error_threshold_fraction(&self) -> f64 {
        if self.error_threshold > 1.0 && self.error_threshold <= 100.0 {
            self.error_threshold / 100.0
        } else {
            self.error_threshold
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_tries")]
    pub max_tries: u32,
    #[serde(default = "default_base_backoff")]
    pub base_backoff: f64,
    #[serde(default = "default_backoff_base")]
    pub backoff_base: f64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff: f64,
    /// Full jitter on the backoff delay. Off unless asked for.
    #[serde(default)]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_tries: default_max_tries(),
            base_backoff: default_base_backoff(),
            backoff_base: default_backoff_base(),
            max_backoff: default_max_backoff(),
            jitter: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoscalerConfig {
    /// Target average relative work demand of running instances.
    #[serde(default = "default_target_demand")]
    pub target_demand: f64,
    #[serde(default = "default_min_instances")]
    pub min_instances: usize,
    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
    /// Seconds between two evaluations.
    #[serde(default = "default_autoscale_interval")]
    pub interval: f64,
    #[serde(default)]
    pub scale_up_hold: f64,
    #[serde(default = "default_scale_down_hold")]
    pub scale_down_hold: f64,
}

impl Default for AutoscalerConfig {
    fn default() -> Self {
        Self {
            target_demand: default_target_demand(),
            min_instances: default_min_instances(),
            max_instances: default_max_instances(),
            interval: default_autoscale_interval(),
            scale_up_hold: 0.0,
            scale_down_hold: default_scale_down_hold(),
        }
    }
}

/// Fires user requests for one operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratorConfig {
    pub service: String,
    pub operation: String,
    #[serde(flatten)]
    pub arrivals: ArrivalConfig,
    /// Offset of the first request, or of time zero of a profile.
    #[serde(default)]
    pub start: f64,
    pub stop: Option<f64>,
    /// Maximum number of requests to fire.
    pub count: Option<u64>,
}

/// When a generator fires, picked by the keys present.
///
/// ```toml
/// [[generators]]
/// service = "frontend"
/// operation = "index"
/// profile = "load/weekday.csv"
/// repeating = true
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArrivalConfig {
    /// One request every `interval` seconds.
    Interval { interval: f64 },
    /// A load profile of `time;rate` lines: `rate` requests at each `time`.
    /// A repeating profile starts over `repetition_skip` seconds after its
    /// last step. Relative paths resolve against the experiment file.
    Profile {
        profile: PathBuf,
        #[serde(default)]
        repeating: bool,
        #[serde(default = "default_repetition_skip")]
        repetition_skip: f64,
    },
}

/// Orchestration or chaos action applied at a fixed simulated time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ExperimentEventConfig {
    KillInstances {
        service: String,
        count: usize,
        at: f64,
    },
    Scale {
        service: String,
        instances: usize,
        at: f64,
    },
    /// Adds latency to the outbound dependencies of a service, or of one
    /// of its operations. Permanent unless `duration` is given.
    Delay {
        service: String,
        operation: Option<String>,
        extra: f64,
        at: f64,
        duration: Option<f64>,
    },
}

impl ExperimentEventConfig {
    pub fn at(&self) -> f64 {
        match self {
            ExperimentEventConfig::KillInstances { at, .. }
            | ExperimentEventConfig::Scale { at, .. }
            | ExperimentEventConfig::Delay { at, .. } => *at,
        }
    }

    pub fn service(&self) -> &str {
        match self {
            ExperimentEventConfig::KillInstances { service, .. }
            | ExperimentEventConfig::Scale { service, .. }
            | ExperimentEventConfig::Delay { service, .. } => service,
        }
    }
}

fn default_seed() -> u64 {
    42
}
fn default_capacity() -> u64 {
    1000
}
fn default_instances() -> usize {
    1
}
fn default_thread_pool() -> usize {
    1
}
fn default_probability() -> f64 {
    1.0
}
fn default_rolling_window() -> usize {
    20
}
fn default_error_threshold() -> f64 {
    0.5
}
fn default_sleep_window() -> f64 {
    0.5
}
fn default_max_tries() -> u32 {
    5
}
fn default_base_backoff() -> f64 {
    0.01
}
fn default_backoff_base() -> f64 {
    3.0
}
fn default_max_backoff() -> f64 {
    1.0
}
fn default_repetition_skip() -> f64 {
    1.0
}
fn default_target_demand() -> f64 {
    0.5
}
fn default_min_instances() -> usize {
    1
}
fn default_max_instances() -> usize {
    10
}
fn default_autoscale_interval() -> f64 {
    1.0
}
fn default_scale_down_hold() -> f64 {
    5.0
}

impl SimConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config = Self::from_toml_str(&content)?;
        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    /// Anchor relative load profile paths at `base`.
    pub fn resolve_paths(&mut self, base: &Path) {
        for generator in &mut self.generators {
            if let ArrivalConfig::Profile { profile, .. } = &mut generator.arrivals {
                if profile.is_relative() {
                    *profile = base.join(&*profile);
                }
            }
        }
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: SimConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a two-tier experiment: a gateway calling one backend.
    pub fn scaffold(name: &str) -> Self {
        SimConfig {
            experiment: ExperimentConfig {
                name: name.to_string(),
                duration: 60.0,
                seed: default_seed(),
                report_interval: Some(1.0),
            },
            network: NetworkConfig {
                min_latency: 0.001,
                max_latency: 0.003,
            },
            services: vec![
                ServiceConfig {
                    name: "gateway".to_string(),
                    capacity: 1000,
                    instances: 2,
                    thread_pool_size: 4,
                    scheduler: PolicyConfig::RoundRobin { min_quantum: None },
                    load_balancer: BalancerKind::Even,
                    patterns: vec![
                        PatternConfig::CircuitBreaker(CircuitBreakerConfig::default()),
                        PatternConfig::Retry(RetryConfig::default()),
                    ],
                    autoscaler: None,
                    operations: vec![OperationConfig {
                        name: "index".to_string(),
                        demand: 50,
                        dependencies: vec![DependencyConfig {
                            service: "backend".to_string(),
                            operation: "query".to_string(),
                            probability: 1.0,
                            extra_delay: 0.0,
                        }],
                    }],
                },
                ServiceConfig {
                    name: "backend".to_string(),
                    capacity: 1000,
                    instances: 1,
                    thread_pool_size: 2,
                    scheduler: PolicyConfig::Fifo,
                    load_balancer: BalancerKind::Utilization,
                    patterns: Vec::new(),
                    autoscaler: Some(AutoscalerConfig::default()),
                    operations: vec![OperationConfig {
                        name: "query".to_string(),
                        demand: 200,
                        dependencies: Vec::new(),
                    }],
                },
            ],
            generators: vec![GeneratorConfig {
                service: "gateway".to_string(),
                operation: "index".to_string(),
                arrivals: ArrivalConfig::Interval { interval: 0.05 },
                start: 0.0,
                stop: None,
                count: None,
            }],
            events: Vec::new(),
        }
    }

    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Check the semantic constraints serde cannot express.
    pub fn validate(&self) -> SimResult<()> {
        let exp = &self.experiment;
        ensure(
            exp.duration.is_finite() && exp.duration > 0.0,
            "experiment duration must be positive",
        )?;
        if let Some(interval) = exp.report_interval {
            ensure(interval > 0.0, "report_interval must be positive")?;
        }
        let net = &self.network;
        ensure(
            net.min_latency >= 0.0 && net.max_latency >= net.min_latency,
            "network latency range must satisfy 0 <= min_latency <= max_latency",
        )?;

        let mut names = HashSet::new();
        for service in &self.services {
            if !names.insert(service.name.as_str()) {
                return invalid(format!("duplicate service '{}'", service.name));
            }
            service.validate()?;
        }

        for service in &self.services {
            for op in &service.operations {
                for dep in &op.dependencies {
                    self.check_target(&dep.service, &dep.operation).map_err(|e| {
                        SimError::InvalidConfig(format!(
                            "dependency of {}.{}: {e}",
                            service.name, op.name
                        ))
                    })?;
                }
            }
        }

        for generator in &self.generators {
            self.check_target(&generator.service, &generator.operation)?;
            match &generator.arrivals {
                ArrivalConfig::Interval { interval } => ensure(
                    interval.is_finite() && *interval > 0.0,
                    "generator interval must be positive",
                )?,
                ArrivalConfig::Profile {
                    repetition_skip, ..
                } => ensure(
                    repetition_skip.is_finite() && *repetition_skip >= 0.0,
                    "generator repetition_skip must not be negative",
                )?,
            }
            ensure(generator.start >= 0.0, "generator start must not be negative")?;
        }

        for event in &self.events {
            if self.service(event.service()).is_none() {
                return Err(SimError::UnknownService(event.service().to_string()));
            }
            ensure(event.at() >= 0.0, "event time must not be negative")?;
            if let ExperimentEventConfig::Delay {
                service,
                operation,
                extra,
                duration,
                ..
            } = event
            {
                if let Some(op) = operation {
                    self.check_target(service, op)?;
                }
                ensure(*extra >= 0.0, "injected delay must not be negative")?;
                if let Some(duration) = duration {
                    ensure(*duration > 0.0, "delay duration must be positive")?;
                }
            }
        }
        Ok(())
    }

    fn check_target(&self, service: &str, operation: &str) -> SimResult<()> {
        let svc = self
            .service(service)
            .ok_or_else(|| SimError::UnknownService(service.to_string()))?;
        if svc.operations.iter().any(|o| o.name == operation) {
            Ok(())
        } else {
            Err(SimError::UnknownOperation(format!("{service}.{operation}")))
        }
    }
}

impl ServiceConfig {
    fn validate(&self) -> SimResult<()> {
        let name = &self.name;
        ensure(self.capacity > 0, &format!("service '{name}' needs a positive capacity"))?;
        ensure(
            self.thread_pool_size > 0,
            &format!("service '{name}' needs a positive thread_pool_size"),
        )?;
        match &self.scheduler {
            PolicyConfig::MultiLevelFeedback { levels: Some(0) } => {
                return invalid(format!("service '{name}' needs at least one feedback level"));
            }
            PolicyConfig::RoundRobin { min_quantum: Some(0) } => {
                return invalid(format!("service '{name}' needs a positive min_quantum"));
            }
            _ => {}
        }

        let mut ops = HashSet::new();
        for op in &self.operations {
            if !ops.insert(op.name.as_str()) {
                return invalid(format!("duplicate operation '{name}.{}'", op.name));
            }
            for dep in &op.dependencies {
                ensure(
                    (0.0..=1.0).contains(&dep.probability),
                    &format!("dependency probability of '{name}.{}' must be in [0, 1]", op.name),
                )?;
                ensure(
                    dep.extra_delay >= 0.0,
                    &format!("extra_delay of '{name}.{}' must not be negative", op.name),
                )?;
            }
        }

        for pattern in &self.patterns {
            match pattern {
                PatternConfig::CircuitBreaker(cb) => {
                    ensure(
                        cb.rolling_window > 0,
                        &format!("circuit breaker of '{name}' needs a rolling_window > 0"),
                    )?;
                    ensure(
                        (0.0..=100.0).contains(&cb.error_threshold),
                        &format!(
                            "circuit breaker of '{name}' needs an error_threshold in [0, 1] or (1, 100]"
                        ),
                    )?;
                    ensure(
                        cb.sleep_window >= 0.0,
                        &format!("circuit breaker of '{name}' needs a sleep_window >= 0"),
                    )?;
                }
                PatternConfig::Retry(retry) => {
                    ensure(
                        retry.base_backoff >= 0.0 && retry.max_backoff >= 0.0,
                        &format!("retry backoff of '{name}' must not be negative"),
                    )?;
                }
            }
        }

        if let Some(auto) = &self.autoscaler {
            ensure(
                auto.target_demand > 0.0,
                &format!("autoscaler of '{name}' needs a positive target_demand"),
            )?;
            ensure(
                auto.interval > 0.0,
                &format!("autoscaler of '{name}' needs a positive interval"),
            )?;
            ensure(
                auto.min_instances <= auto.max_instances,
                &format!("autoscaler of '{name}' has min_instances > max_instances"),
            )?;
        }
        Ok(())
    }
}

fn ensure(cond: bool, msg: &str) -> SimResult<()> {
    if cond { Ok(()) } else { invalid(msg.to_string()) }
}

fn invalid<T>(msg: String) -> SimResult<T> {
    Err(SimError::InvalidConfig(msg))
}
