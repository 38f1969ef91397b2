//! Autoscaler: demand-driven instance scaling for one service.

use meshsim_core::SimTime;
use meshsim_core::config::AutoscalerConfig;
use tracing::debug;

/// A scaling decision for a single service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScaleDecision {
    /// Scale to the specified instance count.
    ScaleTo(usize),
    /// No change needed.
    NoChange,
}

/// What the autoscaler observes about its service at one evaluation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DemandSample {
    /// Instances counting towards the target (created, starting or running).
    pub instances: usize,
    /// Mean relative work demand of the running instances.
    pub average_demand: f64,
}

impl DemandSample {
    pub fn from_demands(instances: usize, demands: &[f64]) -> Self {
        let average_demand = if demands.is_empty() {
            0.0
        } else {
            demands.iter().sum::<f64>() / demands.len() as f64
        };
        Self {
            instances,
            average_demand,
        }
    }
}

/// Evaluates demand samples for one service and decides on its instance count.
#[derive(Debug)]
pub struct Autoscaler {
    service: String,
    config: AutoscalerConfig,
    /// Last time we scaled up.
    last_scale_up: Option<SimTime>,
    /// Last time we scaled down.
    last_scale_down: Option<SimTime>,
}

impl Autoscaler {
    pub fn new(service: impl Into<String>, config: AutoscalerConfig) -> Self {
        Self {
            service: service.into(),
            config,
            last_scale_up: None,
            last_scale_down: None,
        }
    }

    pub fn interval(&self) -> f64 {
        self.config.interval
    }

    pub fn config(&self) -> &AutoscalerConfig {
        &self.config
    }

    fn held(last: Option<SimTime>, hold: f64, now: SimTime) -> bool {
        last.is_some_and(|at| now - at < hold)
    }

    /// Evaluate one sample taken at `now` and return a scaling decision.
    pub fn evaluate(&mut self, now: SimTime, sample: DemandSample) -> ScaleDecision {
        let cfg = &self.config;
        let current = sample.instances;

        // Out of bounds, e.g. after instances were killed.
        let bounded = current.clamp(cfg.min_instances, cfg.max_instances);
        if bounded != current {
            debug!(service = %self.service, from = current, to = bounded, "restoring instance bounds");
            if bounded > current {
                self.last_scale_up = Some(now);
            } else {
                self.last_scale_down = Some(now);
            }
            return ScaleDecision::ScaleTo(bounded);
        }
        if current == 0 {
            return ScaleDecision::NoChange;
        }

        let target = cfg.target_demand;
        let ratio = sample.average_demand / target;

        // Scale up: demand exceeds target (10% headroom).
        if sample.average_demand > target * 1.1
            && !Self::held(self.last_scale_up, cfg.scale_up_hold, now)
        {
            let desired = ((current as f64) * ratio).ceil() as usize;
            let clamped = desired.min(cfg.max_instances);

            if clamped > current {
                self.last_scale_up = Some(now);
                debug!(
                    service = %self.service,
                    from = current,
                    to = clamped,
                    demand = sample.average_demand,
                    target,
                    "scaling up"
                );
                return ScaleDecision::ScaleTo(clamped);
            }
        }

        // Scale down: demand is below target by more than the tolerance.
        if sample.average_demand < target * 0.9
            && current > cfg.min_instances
            && !Self::held(self.last_scale_down, cfg.scale_down_hold, now)
        {
            let desired = ((current as f64) * ratio).ceil() as usize;
            let clamped = desired.max(cfg.min_instances);

            if clamped < current {
                self.last_scale_down = Some(now);
                debug!(
                    service = %self.service,
                    from = current,
                    to = clamped,
                    demand = sample.average_demand,
                    target,
                    "scaling down"
                );
                return ScaleDecision::ScaleTo(clamped);
            }
        }

        ScaleDecision::NoChange
    }
}
