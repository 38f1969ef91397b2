//! One running replica of a microservice.
//!
//! An instance owns a CPU and its resilience patterns and tracks the
//! requests it handles. Every handled request goes through the same
//! decision each time it is touched:
//!
//! ```text
//!   computation done ──────────────▶ send answer, forget request
//!   dependencies done ─────────────▶ submit demand to the CPU
//!   otherwise ─────────────────────▶ send one internal request per open dependency
//! ```
//!
//! Failures of requests this instance sent come back through
//! [`MicroserviceInstance::on_request_failed`], which decides between
//! retrying, failing fast, and cascading the failure to the parent.

use crate::event::{LIFECYCLE_PRIORITY, NETWORK_PRIORITY, SimEvent};
use crate::operation::OperationRegistry;
use crate::report::RunStats;
use crate::request::{RequestArena, RequestKind};
use indexmap::IndexSet;
use meshsim_core::{
    DependencyId, EventId, FailureReason, InstanceKey, ProcessId, RequestId, ServiceId, SimError,
    SimResult, SimTime,
};
use meshsim_cpu::{BurstOutcome, BurstScheduler, Cpu};
use meshsim_kernel::SimContext;
use meshsim_patterns::{HalfOpenArm, PatternSet, RetryDecision, SendVerdict};
use std::fmt;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceState {
    Created,
    Starting,
    Running,
    ShuttingDown,
    Shutdown,
    Killed,
}

impl InstanceState {
    /// Counts towards the service's instance target.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            InstanceState::Created | InstanceState::Starting | InstanceState::Running
        )
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, InstanceState::Shutdown | InstanceState::Killed)
    }

    /// Numeric encoding for reporting.
    pub fn level(&self) -> f64 {
        match self {
            InstanceState::Created => 0.0,
            InstanceState::Starting => 1.0,
            InstanceState::Running => 2.0,
            InstanceState::ShuttingDown => 3.0,
            InstanceState::Shutdown => 4.0,
            InstanceState::Killed => -1.0,
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceState::Created => "CREATED",
            InstanceState::Starting => "STARTING",
            InstanceState::Running => "RUNNING",
            InstanceState::ShuttingDown => "SHUTTING_DOWN",
            InstanceState::Shutdown => "SHUTDOWN",
            InstanceState::Killed => "KILLED",
        };
        f.write_str(s)
    }
}

/// Shared simulation state an instance works against while handling an event.
pub struct InstanceCtx<'a> {
    pub sim: &'a mut SimContext<SimEvent>,
    pub arena: &'a mut RequestArena,
    pub registry: &'a OperationRegistry,
    pub stats: &'a mut RunStats,
}

/// Times CPU bursts of one instance on the event kernel.
struct Bursts<'a> {
    sim: &'a mut SimContext<SimEvent>,
    instance: InstanceKey,
}

impl BurstScheduler for Bursts<'_> {
    fn now(&self) -> SimTime {
        self.sim.now()
    }

    fn schedule_burst(&mut self, process: ProcessId, quantum: u64, after: f64) -> EventId {
        let event = SimEvent::BurstCompleted {
            instance: self.instance,
            process,
            quantum,
        };
        let priority = event.priority();
        self.sim.schedule_in(after, priority, event)
    }

    fn cancel_burst(&mut self, event: EventId) -> bool {
        self.sim.cancel(event)
    }
}

#[derive(Debug)]
pub struct MicroserviceInstance {
    key: InstanceKey,
    name: String,
    state: InstanceState,
    cpu: Cpu,
    patterns: PatternSet,
    /// Requests currently handled here, in arrival order.
    handled: IndexSet<RequestId>,
    /// Dependencies of handled requests waiting for an answer.
    open_dependencies: IndexSet<DependencyId>,
    /// Answers sent but not yet delivered.
    outbound_answers: IndexSet<RequestId>,
    /// Internal requests sent but not yet arrived at their target.
    internal_sends: IndexSet<RequestId>,
}

impl MicroserviceInstance {
    pub fn new(key: InstanceKey, name: impl Into<String>, cpu: Cpu, patterns: PatternSet) -> Self {
        Self {
            key,
            name: name.into(),
            state: InstanceState::Created,
            cpu,
            patterns,
            handled: IndexSet::new(),
            open_dependencies: IndexSet::new(),
            outbound_answers: IndexSet::new(),
            internal_sends: IndexSet::new(),
        }
    }

    pub fn key(&self) -> InstanceKey {
        self.key
    }

    /// `service#index`
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn cpu(&self) -> &Cpu {
        &self.cpu
    }

    pub fn patterns(&self) -> &PatternSet {
        &self.patterns
    }

    pub fn usage(&self) -> f64 {
        self.cpu.usage()
    }

    pub fn relative_work_demand(&self, now: SimTime) -> f64 {
        self.cpu.relative_work_demand(now)
    }

    pub fn requests_in_system(&self) -> usize {
        self.handled.len()
    }

    pub fn is_handling(&self, request: RequestId) -> bool {
        self.handled.contains(&request)
    }

    pub fn open_dependency_count(&self) -> usize {
        self.open_dependencies.len()
    }

    pub fn outbound_answer_count(&self) -> usize {
        self.outbound_answers.len()
    }

    pub fn internal_send_count(&self) -> usize {
        self.internal_sends.len()
    }

    /// Handled requests whose computation has not finished.
    pub fn not_computed(&self, arena: &RequestArena) -> usize {
        self.handled
            .iter()
            .filter(|id| arena.get(**id).is_ok_and(|r| !r.computation_completed))
            .count()
    }

    /// Handled requests still waiting on at least one dependency.
    pub fn waiting_for_dependencies(&self, arena: &RequestArena) -> usize {
        self.handled
            .iter()
            .filter(|id| !arena.dependencies_completed(**id))
            .count()
    }

    /// Nothing handled and nothing of ours on the wire.
    pub fn is_quiescent(&self) -> bool {
        self.handled.is_empty()
            && self.open_dependencies.is_empty()
            && self.outbound_answers.is_empty()
            && self.internal_sends.is_empty()
            && self.cpu.is_idle()
    }

    fn illegal(&self, action: &'static str) -> SimError {
        SimError::IllegalTransition {
            entity: self.name.clone(),
            from: self.state.to_string(),
            action,
        }
    }

    pub fn start(&mut self) -> SimResult<()> {
        match self.state {
            InstanceState::Created | InstanceState::Shutdown => {
                self.state = InstanceState::Starting;
                // No startup delay is modelled.
                self.state = InstanceState::Running;
                info!(instance = %self.name, "instance started");
                Ok(())
            }
            _ => Err(self.illegal("start")),
        }
    }

    pub fn start_shutdown(&mut self, ctx: &mut InstanceCtx<'_>) -> SimResult<()> {
        match self.state {
            InstanceState::Created | InstanceState::Running => {
                self.state = InstanceState::ShuttingDown;
                info!(instance = %self.name, in_flight = self.handled.len(), "instance shutting down");
                if self.handled.is_empty() {
                    self.end_shutdown(ctx)?;
                }
                Ok(())
            }
            _ => Err(self.illegal("start_shutdown")),
        }
    }

    fn end_shutdown(&mut self, ctx: &mut InstanceCtx<'_>) -> SimResult<()> {
        if self.state != InstanceState::ShuttingDown {
            return Err(self.illegal("end_shutdown"));
        }
        self.state = InstanceState::Shutdown;
        self.shutdown_patterns(ctx);
        info!(instance = %self.name, "instance shut down");
        Ok(())
    }

    fn shutdown_patterns(&mut self, ctx: &mut InstanceCtx<'_>) {
        if let Some(breaker) = self.patterns.breaker.as_mut() {
            for timer in breaker.shutdown() {
                ctx.sim.cancel(timer);
            }
        }
        if let Some(retry) = self.patterns.retry.as_mut() {
            retry.shutdown();
        }
    }

    /// Hard stop. Everything in progress here is dropped or failed.
    pub fn die(&mut self, ctx: &mut InstanceCtx<'_>) -> SimResult<()> {
        if self.state == InstanceState::Killed {
            return Err(self.illegal("die"));
        }
        self.state = InstanceState::Killed;
        self.shutdown_patterns(ctx);

        let dropped = {
            let mut bursts = Bursts {
                sim: &mut *ctx.sim,
                instance: self.key,
            };
            self.cpu.clear(&mut bursts)
        };

        // Answers that never left: their requesters learn that the handler died.
        for answer in std::mem::take(&mut self.outbound_answers) {
            if let Some(req) = ctx.arena.discard(answer) {
                if let Some(event) = req.in_flight {
                    ctx.sim.cancel(event);
                }
                if let Some(answered) = req.answered() {
                    schedule_fail(ctx, answered, FailureReason::HandlingInstanceDied);
                }
            }
        }
        for request in std::mem::take(&mut self.internal_sends) {
            if let Some(req) = ctx.arena.discard(request) {
                if let Some(event) = req.in_flight {
                    ctx.sim.cancel(event);
                }
            }
        }
        self.open_dependencies.clear();
        for request in std::mem::take(&mut self.handled) {
            schedule_fail(ctx, request, FailureReason::HandlingInstanceDied);
        }
        warn!(
            instance = %self.name,
            dropped_processes = dropped.len(),
            "instance killed"
        );
        Ok(())
    }

    pub fn can_handle(&self, request: RequestId, arena: &RequestArena) -> bool {
        match self.state {
            InstanceState::Running => true,
            // Draining: only work belonging to requests already here.
            InstanceState::ShuttingDown => {
                self.handled.contains(&request)
                    || arena
                        .get(request)
                        .ok()
                        .and_then(|r| r.parent)
                        .is_some_and(|parent| self.handled.contains(&parent))
            }
            _ => false,
        }
    }

    /// Accept a request or answer that arrived at this instance.
    pub fn handle(&mut self, id: RequestId, ctx: &mut InstanceCtx<'_>) -> SimResult<()> {
        if !self.can_handle(id, ctx.arena) {
            return Err(SimError::CannotHandle {
                instance: self.name.clone(),
                request: id,
                state: self.state.to_string(),
            });
        }
        let request = ctx.arena.get_mut(id)?;
        request.in_flight = None;
        if let RequestKind::Answer { answered, .. } = request.kind {
            return self.handle_answer(id, answered, ctx);
        }
        request.handler = Some(self.key);
        if self.handled.insert(id) {
            debug!(instance = %self.name, request = %id, "request accepted");
        }
        self.process(id, ctx)
    }

    fn process(&mut self, id: RequestId, ctx: &mut InstanceCtx<'_>) -> SimResult<()> {
        let request = ctx.arena.get(id)?;
        let dependencies_done = ctx.arena.dependencies_completed(id);
        if request.computation_completed && dependencies_done {
            return self.answer(id, ctx);
        }
        if dependencies_done {
            let demand = ctx.registry.operation(request.operation)?.demand;
            let mut bursts = Bursts {
                sim: &mut *ctx.sim,
                instance: self.key,
            };
            let process = self.cpu.submit(demand, Some(id), &mut bursts);
            debug!(instance = %self.name, request = %id, %process, demand, "computing");
            return Ok(());
        }
        self.send_dependencies(id, ctx)
    }

    fn answer(&mut self, id: RequestId, ctx: &mut InstanceCtx<'_>) -> SimResult<()> {
        let answer = ctx.arena.create_answer(id, self.key, ctx.sim.now())?;
        self.outbound_answers.insert(answer);
        let event = ctx
            .sim
            .schedule_in(0.0, NETWORK_PRIORITY, SimEvent::Send { request: answer });
        ctx.arena.get_mut(answer)?.in_flight = Some(event);
        self.handled.shift_remove(&id);
        debug!(instance = %self.name, request = %id, %answer, "request completed");

        if self.state == InstanceState::ShuttingDown && self.handled.is_empty() {
            self.end_shutdown(ctx)?;
        }
        Ok(())
    }

    fn send_dependencies(&mut self, id: RequestId, ctx: &mut InstanceCtx<'_>) -> SimResult<()> {
        let dependencies = ctx.arena.get(id)?.dependencies.clone();
        let now = ctx.sim.now();
        for dependency in dependencies {
            let dep = ctx.arena.dependency(dependency)?;
            if dep.completed || self.open_dependencies.contains(&dependency) {
                continue;
            }
            let target = ctx.registry.operation(dep.target)?;
            let child = ctx
                .arena
                .create_internal(dependency, target, self.key, now, ctx.sim.rng())?;
            self.open_dependencies.insert(dependency);
            self.send_internal(child, 0.0, ctx)?;
            debug!(
                instance = %self.name,
                request = %id,
                %dependency,
                %child,
                target = %ctx.registry.qualified_name(target.id),
                "dependency requested"
            );
        }
        Ok(())
    }

    fn send_internal(
        &mut self,
        request: RequestId,
        delay: f64,
        ctx: &mut InstanceCtx<'_>,
    ) -> SimResult<()> {
        self.internal_sends.insert(request);
        let event = ctx
            .sim
            .schedule_in(delay, NETWORK_PRIORITY, SimEvent::Send { request });
        ctx.arena.get_mut(request)?.in_flight = Some(event);
        Ok(())
    }

    fn handle_answer(
        &mut self,
        answer: RequestId,
        answered: RequestId,
        ctx: &mut InstanceCtx<'_>,
    ) -> SimResult<()> {
        let dependency = ctx.arena.get(answered).ok().and_then(|r| r.dependency());
        let live = dependency.and_then(|dep| {
            let record = ctx.arena.dependency(dep).ok()?;
            (record.child == Some(answered) && self.open_dependencies.contains(&dep))
                .then_some((dep, record.parent))
        });

        if let Some((dependency, parent)) = live {
            self.open_dependencies.shift_remove(&dependency);
            if let Some(retry) = self.patterns.retry.as_mut() {
                retry.on_result(dependency);
            }
            let arm = self
                .patterns
                .breaker
                .as_mut()
                .and_then(|breaker| breaker.on_result(dependency));
            if let Some(arm) = arm {
                self.arm_half_open(arm, ctx);
            }
            ctx.arena.complete_dependency(dependency)?;
            debug!(instance = %self.name, %dependency, request = %parent, "dependency answered");

            if self.handled.contains(&parent) && ctx.arena.dependencies_completed(parent) {
                self.process(parent, ctx)?;
            }
        } else {
            debug!(instance = %self.name, %answer, "stale answer dropped");
        }
        ctx.arena.discard(answer);
        ctx.arena.discard(answered);
        Ok(())
    }

    pub fn on_burst_completed(
        &mut self,
        process: ProcessId,
        quantum: u64,
        ctx: &mut InstanceCtx<'_>,
    ) -> SimResult<()> {
        let outcome = {
            let mut bursts = Bursts {
                sim: &mut *ctx.sim,
                instance: self.key,
            };
            self.cpu.on_burst_completed(process, quantum, &mut bursts)?
        };
        let BurstOutcome::Finished(done) = outcome else {
            return Ok(());
        };
        let Some(id) = done.request() else {
            return Ok(());
        };
        if !self.handled.contains(&id) {
            return Ok(());
        }
        ctx.arena.get_mut(id)?.computation_completed = true;
        self.process(id, ctx)
    }

    /// Run the sender-side patterns for an internal request leaving this instance.
    pub fn before_send(
        &mut self,
        request: RequestId,
        ctx: &mut InstanceCtx<'_>,
    ) -> SimResult<SendVerdict> {
        let Some(dependency) = ctx.arena.get(request)?.dependency() else {
            return Ok(SendVerdict::Proceed);
        };
        let target = ctx.arena.dependency(dependency)?.service;
        if let Some(retry) = self.patterns.retry.as_mut() {
            retry.on_send(dependency);
        }
        let Some(breaker) = self.patterns.breaker.as_mut() else {
            return Ok(SendVerdict::Proceed);
        };
        let (verdict, arm) = breaker.on_send(dependency, target);
        if let Some(arm) = arm {
            self.arm_half_open(arm, ctx);
        }
        Ok(verdict)
    }

    fn arm_half_open(&mut self, arm: HalfOpenArm, ctx: &mut InstanceCtx<'_>) {
        let event = ctx.sim.schedule_in(
            arm.after,
            LIFECYCLE_PRIORITY,
            SimEvent::HalfOpen {
                instance: self.key,
                target: arm.target,
            },
        );
        if let Some(breaker) = self.patterns.breaker.as_mut() {
            breaker.set_half_open_timer(arm.target, event);
        }
    }

    pub fn on_half_open(&mut self, target: ServiceId) {
        if let Some(breaker) = self.patterns.breaker.as_mut() {
            breaker.to_half_open(target);
        }
    }

    /// An answer sent from here reached its destination.
    pub fn answer_delivered(&mut self, answer: RequestId) {
        self.outbound_answers.shift_remove(&answer);
    }

    /// An internal request sent from here reached its target.
    pub fn internal_send_arrived(&mut self, request: RequestId) {
        self.internal_sends.shift_remove(&request);
    }

    /// A request sent by this instance failed.
    pub fn on_request_failed(
        &mut self,
        id: RequestId,
        reason: FailureReason,
        ctx: &mut InstanceCtx<'_>,
    ) -> SimResult<()> {
        let kind = ctx.arena.get(id)?.kind;
        let dependency = match kind {
            RequestKind::Answer { answered, .. } => {
                // Lost answers are not retried.
                self.outbound_answers.shift_remove(&id);
                debug!(instance = %self.name, answer = %id, %reason, "answer lost");
                ctx.arena.discard(id);
                ctx.arena.discard(answered);
                return Ok(());
            }
            RequestKind::User => {
                return Err(SimError::NotRequestedHere {
                    request: id,
                    instance: self.name.clone(),
                });
            }
            RequestKind::Internal { dependency } => dependency,
        };

        self.internal_sends.shift_remove(&id);
        let arm = self
            .patterns
            .breaker
            .as_mut()
            .and_then(|breaker| breaker.on_failed(dependency));
        if let Some(arm) = arm {
            self.arm_half_open(arm, ctx);
        }

        let rejected_by_breaker = matches!(
            reason,
            FailureReason::CircuitOpen | FailureReason::VolumeThresholdReached
        );
        if self.patterns.breaker.is_some() && rejected_by_breaker {
            return self.let_request_fail(id, reason, ctx);
        }

        if reason != FailureReason::MaxRetriesReached {
            if let Some(retry) = self.patterns.retry.as_mut() {
                match retry.on_failure(dependency, reason, ctx.sim.rng()) {
                    RetryDecision::Retry { attempt, delay } => {
                        return self.retry(id, dependency, attempt, delay, ctx);
                    }
                    RetryDecision::Exhausted => {
                        return self.let_request_fail(id, FailureReason::MaxRetriesReached, ctx);
                    }
                    RetryDecision::NotHandled => {}
                }
            }
        }
        self.let_request_fail(id, reason, ctx)
    }

    fn retry(
        &mut self,
        failed: RequestId,
        dependency: DependencyId,
        attempt: u32,
        delay: f64,
        ctx: &mut InstanceCtx<'_>,
    ) -> SimResult<()> {
        let Ok(dep) = ctx.arena.dependency(dependency) else {
            ctx.arena.discard(failed);
            return Ok(());
        };
        let still_wanted = dep.child == Some(failed)
            && self.open_dependencies.contains(&dependency)
            && self.handled.contains(&dep.parent);
        if !still_wanted {
            if let Some(retry) = self.patterns.retry.as_mut() {
                retry.forget(dependency);
            }
            ctx.arena.discard(failed);
            return Ok(());
        }

        let target = ctx.registry.operation(dep.target)?;
        let now = ctx.sim.now();
        let fresh = ctx
            .arena
            .create_internal(dependency, target, self.key, now, ctx.sim.rng())?;
        self.send_internal(fresh, delay, ctx)?;
        ctx.stats.record_retry();
        ctx.arena.discard(failed);
        debug!(instance = %self.name, %dependency, attempt, delay, request = %fresh, "retrying");
        Ok(())
    }

    /// Give up on `id` and fail its parent.
    fn let_request_fail(
        &mut self,
        id: RequestId,
        reason: FailureReason,
        ctx: &mut InstanceCtx<'_>,
    ) -> SimResult<()> {
        let Some(dependency) = ctx.arena.get(id)?.dependency() else {
            ctx.arena.discard(id);
            return Ok(());
        };
        let Ok(dep) = ctx.arena.dependency(dependency) else {
            ctx.arena.discard(id);
            return Ok(());
        };
        if dep.child != Some(id) {
            // Superseded by a newer request for the same dependency.
            ctx.arena.discard(id);
            return Ok(());
        }
        let parent = dep.parent;
        if !self.open_dependencies.contains(&dependency) || !self.handled.contains(&parent) {
            ctx.arena.discard(id);
            return Err(SimError::NotRequestedHere {
                request: id,
                instance: self.name.clone(),
            });
        }

        ctx.stats.record_dependency_failure(reason);
        debug!(instance = %self.name, request = %id, %parent, %reason, "dependency failed");
        ctx.arena.discard(id);
        self.fail_parent(parent, ctx)
    }

    /// Fail `parent` to its sender and drop everything still running for it.
    fn fail_parent(&mut self, parent: RequestId, ctx: &mut InstanceCtx<'_>) -> SimResult<()> {
        schedule_fail(ctx, parent, FailureReason::DependencyNotAvailable);

        let dependencies = ctx.arena.get(parent)?.dependencies.clone();
        for dependency in dependencies {
            self.open_dependencies.shift_remove(&dependency);
            if let Some(retry) = self.patterns.retry.as_mut() {
                retry.forget(dependency);
            }
            if let Some(breaker) = self.patterns.breaker.as_mut() {
                breaker.forget(dependency);
            }
            let child = ctx.arena.dependency(dependency).ok().and_then(|d| d.child);
            if let Some(child) = child {
                if self.internal_sends.shift_remove(&child) {
                    if let Some(req) = ctx.arena.discard(child) {
                        if let Some(event) = req.in_flight {
                            ctx.sim.cancel(event);
                        }
                    }
                }
            }
        }
        self.handled.shift_remove(&parent);

        if self.state == InstanceState::ShuttingDown && self.handled.is_empty() {
            self.end_shutdown(ctx)?;
        }
        Ok(())
    }
}

fn schedule_fail(ctx: &mut InstanceCtx<'_>, request: RequestId, reason: FailureReason) {
    let event = ctx
        .sim
        .schedule_in(0.0, NETWORK_PRIORITY, SimEvent::Fail { request, reason });
    if let Ok(req) = ctx.arena.get_mut(request) {
        req.in_flight = Some(event);
    }
}
