//! The simulation: sole owner of all mutable state, driven one event at a time.

use crate::event::{AUTOSCALE_PRIORITY, LIFECYCLE_PRIORITY, NETWORK_PRIORITY, REPORT_PRIORITY, SimEvent};
use crate::generator::Generator;
use crate::instance::{InstanceCtx, InstanceState, MicroserviceInstance};
use crate::microservice::Microservice;
use crate::network::{DelayInjection, Network};
use crate::operation::OperationRegistry;
use crate::report::{DependencyGraph, Reporter, RunStats, SimulationSummary};
use crate::request::{RequestArena, RequestKind, Requester};
use meshsim_autoscale::{DemandSample, ScaleDecision};
use meshsim_core::config::ExperimentEventConfig;
use meshsim_core::{
    DependencyId, FailureReason, InstanceKey, OperationId, ProcessId, RequestId, ServiceId,
    SimConfig, SimError, SimResult, SimTime,
};
use meshsim_kernel::SimContext;
use meshsim_patterns::SendVerdict;
use std::collections::BTreeMap;
use tracing::{debug, info, trace, warn};

/// Borrow the shared state instances work against, leaving `services` free.
macro_rules! ctx {
    ($self:ident) => {
        InstanceCtx {
            sim: &mut $self.sim,
            arena: &mut $self.arena,
            registry: &$self.registry,
            stats: &mut $self.stats,
        }
    };
}

fn instance_mut(
    services: &mut [Microservice],
    key: InstanceKey,
) -> Option<&mut MicroserviceInstance> {
    services.get_mut(key.service.0)?.instance_mut(key)
}

pub struct Simulation {
    name: String,
    duration: f64,
    report_interval: Option<f64>,
    events: Vec<ExperimentEventConfig>,
    initial_instances: Vec<usize>,
    sim: SimContext<SimEvent>,
    arena: RequestArena,
    registry: OperationRegistry,
    services: Vec<Microservice>,
    generators: Vec<Generator>,
    network: Network,
    stats: RunStats,
    reporter: Reporter,
    events_processed: u64,
    started: bool,
}

impl Simulation {
    pub fn new(config: SimConfig) -> SimResult<Self> {
        config.validate()?;
        let registry = OperationRegistry::from_config(&config)?;
        let services = config
            .services
            .iter()
            .enumerate()
            .map(|(idx, svc)| Microservice::new(ServiceId(idx), svc))
            .collect();
        let generators = config
            .generators
            .iter()
            .map(|g| Generator::from_config(g, &registry))
            .collect::<SimResult<Vec<_>>>()?;

        Ok(Self {
            name: config.experiment.name.clone(),
            duration: config.experiment.duration,
            report_interval: config.experiment.report_interval,
            events: config.events.clone(),
            initial_instances: config.services.iter().map(|s| s.instances).collect(),
            sim: SimContext::new(config.experiment.seed),
            arena: RequestArena::new(),
            registry,
            services,
            generators,
            network: Network::new(&config.network),
            stats: RunStats::default(),
            reporter: Reporter::new(),
            events_processed: 0,
            started: false,
        })
    }

    pub fn now(&self) -> SimTime {
        self.sim.now()
    }

    pub fn seed(&self) -> u64 {
        self.sim.seed()
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    pub fn reporter(&self) -> &Reporter {
        &self.reporter
    }

    pub fn registry(&self) -> &OperationRegistry {
        &self.registry
    }

    pub fn events_processed(&self) -> u64 {
        self.events_processed
    }

    /// Requests of any kind alive in the system.
    pub fn requests_in_system(&self) -> usize {
        self.arena.len()
    }

    pub fn service(&self, name: &str) -> Option<&Microservice> {
        let id = self.registry.service_id(name).ok()?;
        self.services.get(id.0)
    }

    pub fn services(&self) -> &[Microservice] {
        &self.services
    }

    pub fn generators(&self) -> &[Generator] {
        &self.generators
    }

    fn service_index(&self, name: &str) -> SimResult<usize> {
        Ok(self.registry.service_id(name)?.0)
    }

    /// Spawn starting instances and schedule generators, autoscalers,
    /// reporting and experiment events. Idempotent.
    pub fn start(&mut self) -> SimResult<()> {
        if self.started {
            return Ok(());
        }
        self.started = true;
        info!(experiment = %self.name, seed = self.sim.seed(), duration = self.duration, "simulation starting");

        for idx in 0..self.services.len() {
            let target = self.initial_instances.get(idx).copied().unwrap_or(0);
            let mut ctx = ctx!(self);
            self.services[idx].scale_to(target, &mut ctx)?;
            if let Some(scaler) = self.services[idx].autoscaler_mut() {
                let interval = scaler.interval();
                self.sim.schedule_in(
                    interval,
                    AUTOSCALE_PRIORITY,
                    SimEvent::Autoscale {
                        service: ServiceId(idx),
                    },
                );
            }
        }
        for (idx, generator) in self.generators.iter_mut().enumerate() {
            if let Some(at) = generator.first_fire() {
                self.sim
                    .schedule_at(at, LIFECYCLE_PRIORITY, SimEvent::Generate { generator: idx });
            }
        }
        for (idx, event) in self.events.iter().enumerate() {
            self.sim.schedule_at(
                SimTime(event.at()),
                LIFECYCLE_PRIORITY,
                SimEvent::Experiment { index: idx },
            );
        }
        if self.report_interval.is_some() {
            self.sim
                .schedule_at(SimTime::ZERO, REPORT_PRIORITY, SimEvent::Report);
        }
        Ok(())
    }

    /// Process the next event if it is due no later than the experiment end.
    pub fn step(&mut self) -> SimResult<bool> {
        self.step_within(self.duration)
    }

    fn step_within(&mut self, limit: f64) -> SimResult<bool> {
        match self.sim.peek_time() {
            Some(t) if t.as_secs() <= limit => {}
            _ => return Ok(false),
        }
        let Some((id, event)) = self.sim.pop_next() else {
            return Ok(false);
        };
        self.events_processed += 1;
        trace!(event = %id, time = %self.sim.now(), ?event, "dispatch");
        self.dispatch(event)?;
        for service in &mut self.services {
            service.prune();
        }
        Ok(true)
    }

    /// Process every event due up to `time` (capped at the experiment end).
    pub fn run_until(&mut self, time: f64) -> SimResult<()> {
        self.start()?;
        let limit = time.min(self.duration);
        while self.step_within(limit)? {}
        Ok(())
    }

    pub fn run(&mut self) -> SimResult<SimulationSummary> {
        self.run_until(self.duration)?;
        let summary = self.summary();
        info!(
            experiment = %self.name,
            events = self.events_processed,
            completed = summary.completed,
            failed = summary.failed,
            "simulation finished"
        );
        Ok(summary)
    }

    pub fn summary(&self) -> SimulationSummary {
        let instances: BTreeMap<String, usize> = self
            .services
            .iter()
            .map(|s| (s.name().to_string(), s.instance_count()))
            .collect();
        SimulationSummary::from_stats(
            &self.name,
            self.sim.seed(),
            self.sim.now(),
            self.events_processed,
            &self.stats,
            instances,
        )
    }

    /// Call graph of the experiment with the current instance counts.
    pub fn dependency_graph(&self) -> DependencyGraph {
        DependencyGraph::build(&self.name, &self.registry, |service| {
            self.services
                .get(service.0)
                .map_or(0, Microservice::instance_count)
        })
    }

    /// Inject one user request for `service.operation` now.
    ///
    /// Returns `None` when the service had no instance to take it.
    pub fn submit_request(&mut self, service: &str, operation: &str) -> SimResult<Option<RequestId>> {
        self.start()?;
        let op = self.registry.lookup(service, operation)?;
        let service = self.registry.service_id(service)?;
        self.submit_user(service, op)
    }

    /// Orchestration: scale a service to `instances`.
    pub fn scale(&mut self, service: &str, instances: usize) -> SimResult<()> {
        self.start()?;
        let idx = self.service_index(service)?;
        let mut ctx = ctx!(self);
        self.services[idx].scale_to(instances, &mut ctx)?;
        self.services[idx].prune();
        Ok(())
    }

    /// Chaos: kill `count` instances of a service.
    pub fn kill_instances(&mut self, service: &str, count: usize) -> SimResult<usize> {
        self.start()?;
        let idx = self.service_index(service)?;
        let mut ctx = ctx!(self);
        let killed = self.services[idx].kill_instances(count, &mut ctx)?;
        self.services[idx].prune();
        Ok(killed)
    }

    fn dispatch(&mut self, event: SimEvent) -> SimResult<()> {
        match event {
            SimEvent::Generate { generator } => self.on_generate(generator),
            SimEvent::Send { request } => self.on_send(request),
            SimEvent::Arrive { request, instance } => self.on_arrive(request, instance),
            SimEvent::Fail { request, reason } => self.on_fail(request, reason),
            SimEvent::BurstCompleted {
                instance,
                process,
                quantum,
            } => self.on_burst(instance, process, quantum),
            SimEvent::HalfOpen { instance, target } => {
                if let Some(inst) = instance_mut(&mut self.services, instance) {
                    inst.on_half_open(target);
                }
                Ok(())
            }
            SimEvent::Autoscale { service } => self.on_autoscale(service),
            SimEvent::Report => {
                self.sample();
                if let Some(interval) = self.report_interval {
                    self.sim.schedule_in(interval, REPORT_PRIORITY, SimEvent::Report);
                }
                Ok(())
            }
            SimEvent::Experiment { index } => self.on_experiment(index),
            SimEvent::DelayEnded { index } => {
                if let Some(ExperimentEventConfig::Delay {
                    service, operation, ..
                }) = self.events.get(index)
                {
                    let service = self.registry.service_id(service)?;
                    let operation = match operation {
                        Some(op) => Some(self.registry.lookup(self.registry.service_name(service), op)?),
                        None => None,
                    };
                    self.network.remove(service, operation);
                    info!(%service, "delay injection ended");
                }
                Ok(())
            }
        }
    }

    fn on_generate(&mut self, index: usize) -> SimResult<()> {
        let now = self.sim.now();
        let Some(generator) = self.generators.get_mut(index) else {
            return Ok(());
        };
        let (service, operation) = (generator.service(), generator.operation());
        if let Some(next) = generator.fire(now) {
            self.sim
                .schedule_at(next, LIFECYCLE_PRIORITY, SimEvent::Generate { generator: index });
        }
        self.submit_user(service, operation)?;
        Ok(())
    }

    fn submit_user(
        &mut self,
        service: ServiceId,
        operation: OperationId,
    ) -> SimResult<Option<RequestId>> {
        self.stats.record_generated();
        let now = self.sim.now();
        let op = self.registry.operation(operation)?;
        let id = self.arena.create_user(op, now, self.sim.rng());
        let svc = self
            .services
            .get_mut(service.0)
            .ok_or_else(|| SimError::UnknownService(service.to_string()))?;
        match svc.pick_instance(now, self.sim.rng()) {
            Ok(key) => {
                let event = self.sim.schedule_in(
                    0.0,
                    NETWORK_PRIORITY,
                    SimEvent::Arrive {
                        request: id,
                        instance: key,
                    },
                );
                self.arena.get_mut(id)?.in_flight = Some(event);
                Ok(Some(id))
            }
            Err(SimError::NoInstanceAvailable(name)) => {
                debug!(request = %id, service = %name, "no instance for user request");
                self.stats.record_failed(FailureReason::NoInstanceAvailable);
                self.arena.discard(id);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn schedule_fail(&mut self, request: RequestId, reason: FailureReason) -> SimResult<()> {
        let event = self
            .sim
            .schedule_in(0.0, NETWORK_PRIORITY, SimEvent::Fail { request, reason });
        self.arena.get_mut(request)?.in_flight = Some(event);
        Ok(())
    }

    fn on_send(&mut self, id: RequestId) -> SimResult<()> {
        let Ok(request) = self.arena.get_mut(id) else {
            return Ok(());
        };
        request.in_flight = None;
        let (kind, sender) = (request.kind, request.sender);
        match kind {
            RequestKind::Answer {
                answered,
                destination: Requester::User,
            } => {
                let now = self.sim.now();
                let created = self.arena.get(answered)?.created_at;
                let response_time = now - created;
                self.stats.record_completed(response_time);
                if let Requester::Instance(key) = sender {
                    if let Some(inst) = instance_mut(&mut self.services, key) {
                        inst.answer_delivered(id);
                    }
                }
                self.arena.discard(id);
                self.arena.discard(answered);
                debug!(request = %answered, response_time, "user request completed");
                Ok(())
            }
            RequestKind::Answer {
                destination: Requester::Instance(target),
                ..
            } => {
                let latency = self.network.latency(self.sim.rng());
                let event = self.sim.schedule_in(
                    latency,
                    NETWORK_PRIORITY,
                    SimEvent::Arrive {
                        request: id,
                        instance: target,
                    },
                );
                self.arena.get_mut(id)?.in_flight = Some(event);
                Ok(())
            }
            RequestKind::Internal { dependency } => self.send_internal(id, sender, dependency),
            RequestKind::User => {
                warn!(request = %id, "user request on the send path ignored");
                Ok(())
            }
        }
    }

    fn send_internal(
        &mut self,
        id: RequestId,
        sender: Requester,
        dependency: DependencyId,
    ) -> SimResult<()> {
        let Requester::Instance(sender) = sender else {
            return Ok(());
        };
        let verdict = {
            let mut ctx = ctx!(self);
            match instance_mut(&mut self.services, sender) {
                Some(inst) if !inst.state().is_terminated() => inst.before_send(id, &mut ctx)?,
                _ => {
                    ctx.arena.discard(id);
                    return Ok(());
                }
            }
        };
        if let SendVerdict::Reject(reason) = verdict {
            debug!(request = %id, %reason, "send rejected");
            return self.schedule_fail(id, reason);
        }

        let Ok(dep) = self.arena.dependency(dependency) else {
            debug!(request = %id, %dependency, "send for a released dependency dropped");
            self.arena.discard(id);
            return Ok(());
        };
        let (target_service, extra_delay, parent) = (dep.service, dep.extra_delay, dep.parent);
        let parent_operation = self.arena.get(parent).map(|r| r.operation).ok();
        let now = self.sim.now();
        let service = self
            .services
            .get_mut(target_service.0)
            .ok_or_else(|| SimError::UnknownService(target_service.to_string()))?;
        match service.pick_instance(now, self.sim.rng()) {
            Ok(target) => {
                let mut latency = self.network.latency(self.sim.rng()) + extra_delay;
                if let Some(op) = parent_operation {
                    latency += self.network.injected_delay(sender.service, op);
                }
                let event = self.sim.schedule_in(
                    latency,
                    NETWORK_PRIORITY,
                    SimEvent::Arrive {
                        request: id,
                        instance: target,
                    },
                );
                self.arena.get_mut(id)?.in_flight = Some(event);
                Ok(())
            }
            Err(SimError::NoInstanceAvailable(name)) => {
                debug!(request = %id, service = %name, "no instance for internal request");
                self.schedule_fail(id, FailureReason::NoInstanceAvailable)
            }
            Err(e) => Err(e),
        }
    }

    fn on_arrive(&mut self, id: RequestId, target: InstanceKey) -> SimResult<()> {
        let Ok(request) = self.arena.get_mut(id) else {
            return Ok(());
        };
        request.in_flight = None;
        let (is_answer, sender) = (request.is_answer(), request.sender);
        if let Requester::Instance(key) = sender {
            if let Some(inst) = instance_mut(&mut self.services, key) {
                if is_answer {
                    inst.answer_delivered(id);
                } else {
                    inst.internal_send_arrived(id);
                }
            }
        }

        let accepted = {
            let mut ctx = ctx!(self);
            match instance_mut(&mut self.services, target) {
                Some(inst) if inst.can_handle(id, ctx.arena) => {
                    inst.handle(id, &mut ctx)?;
                    true
                }
                _ => false,
            }
        };
        if !accepted {
            let reason = if is_answer {
                FailureReason::RequestingInstanceDied
            } else {
                FailureReason::HandlingInstanceDied
            };
            debug!(request = %id, instance = %target, %reason, "arrival rejected");
            self.schedule_fail(id, reason)?;
        }
        Ok(())
    }

    fn on_fail(&mut self, id: RequestId, reason: FailureReason) -> SimResult<()> {
        let Ok(request) = self.arena.get_mut(id) else {
            return Ok(());
        };
        request.in_flight = None;
        let (sender, answered) = (request.sender, request.answered());
        match sender {
            Requester::User => {
                self.stats.record_failed(reason);
                self.arena.discard(id);
                debug!(request = %id, %reason, "user request failed");
            }
            Requester::Instance(key) => {
                let mut ctx = ctx!(self);
                match instance_mut(&mut self.services, key) {
                    Some(inst) if inst.state() != InstanceState::Killed => {
                        if let Err(e) = inst.on_request_failed(id, reason, &mut ctx) {
                            match e {
                                SimError::NotRequestedHere { .. } => {
                                    warn!(error = %e, "failure dropped");
                                }
                                _ => return Err(e),
                            }
                        }
                    }
                    _ => {
                        ctx.arena.discard(id);
                        if let Some(answered) = answered {
                            ctx.arena.discard(answered);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn on_burst(&mut self, instance: InstanceKey, process: ProcessId, quantum: u64) -> SimResult<()> {
        let mut ctx = ctx!(self);
        match instance_mut(&mut self.services, instance) {
            Some(inst) => inst.on_burst_completed(process, quantum, &mut ctx),
            None => {
                trace!(%instance, %process, "burst for a removed instance");
                Ok(())
            }
        }
    }

    fn on_autoscale(&mut self, service: ServiceId) -> SimResult<()> {
        let now = self.sim.now();
        let svc = self
            .services
            .get_mut(service.0)
            .ok_or_else(|| SimError::UnknownService(service.to_string()))?;
        let sample = DemandSample::from_demands(svc.instance_count(), &svc.relative_work_demands(now));
        let Some(scaler) = svc.autoscaler_mut() else {
            return Ok(());
        };
        let decision = scaler.evaluate(now, sample);
        let interval = scaler.interval();
        if let ScaleDecision::ScaleTo(target) = decision {
            let mut ctx = ctx!(self);
            svc.scale_to(target, &mut ctx)?;
        }
        self.sim
            .schedule_in(interval, AUTOSCALE_PRIORITY, SimEvent::Autoscale { service });
        Ok(())
    }

    fn on_experiment(&mut self, index: usize) -> SimResult<()> {
        let Some(event) = self.events.get(index).cloned() else {
            return Ok(());
        };
        let idx = self.service_index(event.service())?;
        match event {
            ExperimentEventConfig::KillInstances { service, count, .. } => {
                let mut ctx = ctx!(self);
                let killed = self.services[idx].kill_instances(count, &mut ctx)?;
                info!(%service, killed, "instances killed");
            }
            ExperimentEventConfig::Scale {
                service, instances, ..
            } => {
                let mut ctx = ctx!(self);
                self.services[idx].scale_to(instances, &mut ctx)?;
                info!(%service, instances, "service scaled");
            }
            ExperimentEventConfig::Delay {
                service,
                operation,
                extra,
                duration,
                ..
            } => {
                let operation = match &operation {
                    Some(op) => Some(self.registry.lookup(&service, op)?),
                    None => None,
                };
                self.network.inject(DelayInjection {
                    service: ServiceId(idx),
                    operation,
                    extra,
                });
                if let Some(duration) = duration {
                    self.sim
                        .schedule_in(duration, LIFECYCLE_PRIORITY, SimEvent::DelayEnded { index });
                }
                info!(%service, extra, ?duration, "delay injected");
            }
        }
        Ok(())
    }

    fn sample(&mut self) {
        let now = self.sim.now();
        let reporter = &mut self.reporter;
        for svc in &self.services {
            let name = svc.name();
            reporter.add(format!("{name}.instance_count"), now, svc.instance_count() as f64);
            for (key, share) in svc.balancer().selection_frequency() {
                reporter.add(format!("{name}#{}.load_share", key.index), now, share);
            }
            for inst in svc.instances() {
                let p = inst.name();
                let cpu = inst.cpu();
                reporter.add(format!("{p}.state"), now, inst.state().level());
                reporter.add(
                    format!("{p}.requests_in_system"),
                    now,
                    inst.requests_in_system() as f64,
                );
                reporter.add(
                    format!("{p}.not_computed"),
                    now,
                    inst.not_computed(&self.arena) as f64,
                );
                reporter.add(
                    format!("{p}.waiting_for_dependencies"),
                    now,
                    inst.waiting_for_dependencies(&self.arena) as f64,
                );
                reporter.add(
                    format!("{p}.open_dependencies"),
                    now,
                    inst.open_dependency_count() as f64,
                );
                reporter.add(format!("{p}.cpu.usage"), now, cpu.usage());
                reporter.add(
                    format!("{p}.cpu.relative_work_demand"),
                    now,
                    cpu.relative_work_demand(now),
                );
                reporter.add(format!("{p}.cpu.active_processes"), now, cpu.active_count() as f64);
                reporter.add(format!("{p}.cpu.total_processes"), now, cpu.process_count() as f64);
                if let Some(breaker) = &inst.patterns().breaker {
                    for (target, stats) in breaker.stats() {
                        let t = self.registry.service_name(target);
                        reporter.add(format!("{p}.breaker[{t}].state"), now, stats.status.level());
                        reporter.add(
                            format!("{p}.breaker[{t}].successes"),
                            now,
                            stats.successes as f64,
                        );
                        reporter.add(
                            format!("{p}.breaker[{t}].failures"),
                            now,
                            stats.failures as f64,
                        );
                        reporter.add(format!("{p}.breaker[{t}].error_rate"), now, stats.error_rate);
                    }
                }
            }
        }
    }
}
