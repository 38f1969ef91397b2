//! A microservice: its instances, load balancer and optional autoscaler.

use crate::instance::{InstanceCtx, InstanceState, MicroserviceInstance};
use crate::load_balancer::{Candidate, LoadBalancer};
use indexmap::IndexMap;
use meshsim_autoscale::Autoscaler;
use meshsim_core::config::{PatternConfig, PolicyConfig, ServiceConfig};
use meshsim_core::{InstanceKey, ServiceId, SimResult, SimTime};
use meshsim_cpu::{Cpu, build_policy};
use meshsim_patterns::PatternSet;
use rand::Rng;
use tracing::{info, warn};

#[derive(Debug)]
pub struct Microservice {
    id: ServiceId,
    name: String,
    capacity: u64,
    thread_pool_size: usize,
    policy: PolicyConfig,
    patterns: Vec<PatternConfig>,
    /// Instances by per-service index, in spawn order. Terminated ones are pruned.
    instances: IndexMap<u32, MicroserviceInstance>,
    next_index: u32,
    target: usize,
    balancer: LoadBalancer,
    autoscaler: Option<Autoscaler>,
}

impl Microservice {
    pub fn new(id: ServiceId, config: &ServiceConfig) -> Self {
        Self {
            id,
            name: config.name.clone(),
            capacity: config.capacity,
            thread_pool_size: config.thread_pool_size,
            policy: config.scheduler.clone(),
            patterns: config.patterns.clone(),
            instances: IndexMap::new(),
            next_index: 0,
            target: 0,
            balancer: LoadBalancer::new(config.name.clone(), config.load_balancer),
            autoscaler: config
                .autoscaler
                .clone()
                .map(|cfg| Autoscaler::new(config.name.clone(), cfg)),
        }
    }

    pub fn id(&self) -> ServiceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn target(&self) -> usize {
        self.target
    }

    pub fn balancer(&self) -> &LoadBalancer {
        &self.balancer
    }

    pub fn autoscaler_mut(&mut self) -> Option<&mut Autoscaler> {
        self.autoscaler.as_mut()
    }

    pub fn has_autoscaler(&self) -> bool {
        self.autoscaler.is_some()
    }

    pub fn instance(&self, key: InstanceKey) -> Option<&MicroserviceInstance> {
        if key.service != self.id {
            return None;
        }
        self.instances.get(&key.index)
    }

    pub fn instance_mut(&mut self, key: InstanceKey) -> Option<&mut MicroserviceInstance> {
        if key.service != self.id {
            return None;
        }
        self.instances.get_mut(&key.index)
    }

    pub fn instances(&self) -> impl Iterator<Item = &MicroserviceInstance> {
        self.instances.values()
    }

    /// Instances counting towards the target: created, starting or running.
    pub fn instance_count(&self) -> usize {
        self.instances
            .values()
            .filter(|i| i.state().is_active())
            .count()
    }

    pub fn running_count(&self) -> usize {
        self.instances
            .values()
            .filter(|i| i.state() == InstanceState::Running)
            .count()
    }

    /// Relative work demand of every running instance.
    pub fn relative_work_demands(&self, now: SimTime) -> Vec<f64> {
        self.instances
            .values()
            .filter(|i| i.state() == InstanceState::Running)
            .map(|i| i.relative_work_demand(now))
            .collect()
    }

    /// Spawn and start one instance.
    pub fn start_instance(&mut self) -> SimResult<InstanceKey> {
        let index = self.next_index;
        self.next_index += 1;
        let key = InstanceKey::new(self.id, index);
        let cpu = Cpu::new(
            self.capacity,
            self.thread_pool_size,
            build_policy(&self.policy),
        );
        let mut instance = MicroserviceInstance::new(
            key,
            format!("{}#{}", self.name, index),
            cpu,
            PatternSet::build(&self.patterns),
        );
        instance.start()?;
        self.instances.insert(index, instance);
        Ok(key)
    }

    /// Start or shut down instances until `target` of them count as active.
    pub fn scale_to(&mut self, target: usize, ctx: &mut InstanceCtx<'_>) -> SimResult<()> {
        let before = self.instance_count();
        self.target = target;
        while self.instance_count() < target {
            self.start_instance()?;
        }
        while self.instance_count() > target {
            // Least utilized running instance; the oldest wins ties.
            let victim = self
                .instances
                .values()
                .filter(|i| i.state() == InstanceState::Running)
                .min_by(|a, b| a.usage().total_cmp(&b.usage()))
                .map(MicroserviceInstance::key);
            let Some(victim) = victim else {
                break;
            };
            if let Some(instance) = self.instances.get_mut(&victim.index) {
                instance.start_shutdown(ctx)?;
            }
        }
        let after = self.instance_count();
        if before != after {
            info!(service = %self.name, from = before, to = after, "scaled");
        }
        Ok(())
    }

    /// Kill the first `count` live instances. Counts beyond the live set are ignored.
    pub fn kill_instances(&mut self, count: usize, ctx: &mut InstanceCtx<'_>) -> SimResult<usize> {
        let victims: Vec<u32> = self
            .instances
            .iter()
            .filter(|(_, i)| i.state() != InstanceState::Killed && i.state() != InstanceState::Shutdown)
            .map(|(idx, _)| *idx)
            .take(count)
            .collect();
        for idx in &victims {
            if let Some(instance) = self.instances.get_mut(idx) {
                instance.die(ctx)?;
            }
        }
        if victims.len() < count {
            warn!(
                service = %self.name,
                requested = count,
                killed = victims.len(),
                "fewer live instances than requested kills"
            );
        }
        Ok(victims.len())
    }

    /// Route one request to a running instance.
    pub fn pick_instance<R: Rng + ?Sized>(
        &mut self,
        now: SimTime,
        rng: &mut R,
    ) -> SimResult<InstanceKey> {
        let candidates: Vec<Candidate> = self
            .instances
            .values()
            .filter(|i| i.state() == InstanceState::Running)
            .map(|i| Candidate {
                key: i.key(),
                relative_demand: i.relative_work_demand(now),
            })
            .collect();
        self.balancer.select(&candidates, rng)
    }

    /// Drop instances that finished shutting down or were killed.
    pub fn prune(&mut self) {
        self.instances.retain(|_, i| !i.state().is_terminated());
    }
}
