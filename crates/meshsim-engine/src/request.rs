//! Requests, network dependencies and the arena that owns them.
//!
//! Parent and child links are ids into the arena, never references. A
//! request lives until it is answered to a user, answered back to its
//! parent instance, or fails at its sender.

use crate::operation::Operation;
use meshsim_core::{
    DependencyId, EventId, InstanceKey, OperationId, RequestId, ServiceId, SimError, SimResult,
    SimTime,
};
use rand::Rng;
use std::collections::HashMap;

/// Who sent a request, and therefore who learns about its failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Requester {
    /// Workload outside the simulated system.
    User,
    Instance(InstanceKey),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Originated by a workload generator.
    User,
    /// Traversal of one network dependency of a parent request.
    Internal { dependency: DependencyId },
    /// The return trip of a completed request.
    Answer {
        answered: RequestId,
        destination: Requester,
    },
}

#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub kind: RequestKind,
    pub operation: OperationId,
    pub sender: Requester,
    pub parent: Option<RequestId>,
    /// Instance currently handling the request.
    pub handler: Option<InstanceKey>,
    /// Dependencies instantiated for this execution, in declaration order.
    pub dependencies: Vec<DependencyId>,
    pub computation_completed: bool,
    pub created_at: SimTime,
    /// Pending send or arrival event while on the wire.
    pub in_flight: Option<EventId>,
}

impl Request {
    pub fn is_answer(&self) -> bool {
        matches!(self.kind, RequestKind::Answer { .. })
    }

    pub fn dependency(&self) -> Option<DependencyId> {
        match self.kind {
            RequestKind::Internal { dependency } => Some(dependency),
            _ => None,
        }
    }

    pub fn answered(&self) -> Option<RequestId> {
        match self.kind {
            RequestKind::Answer { answered, .. } => Some(answered),
            _ => None,
        }
    }
}

/// One instantiated edge from a parent request to a target operation.
#[derive(Debug, Clone)]
pub struct NetworkDependency {
    pub id: DependencyId,
    pub parent: RequestId,
    pub target: OperationId,
    pub service: ServiceId,
    pub extra_delay: f64,
    /// The internal request currently satisfying this dependency.
    pub child: Option<RequestId>,
    pub completed: bool,
}

#[derive(Debug, Default)]
pub struct RequestArena {
    requests: HashMap<RequestId, Request>,
    dependencies: HashMap<DependencyId, NetworkDependency>,
    next_request: u64,
    next_dependency: u64,
}

impl RequestArena {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(
        &mut self,
        kind: RequestKind,
        operation: OperationId,
        sender: Requester,
        parent: Option<RequestId>,
        now: SimTime,
    ) -> RequestId {
        let id = RequestId(self.next_request);
        self.next_request += 1;
        self.requests.insert(
            id,
            Request {
                id,
                kind,
                operation,
                sender,
                parent,
                handler: None,
                dependencies: Vec::new(),
                computation_completed: false,
                created_at: now,
                in_flight: None,
            },
        );
        id
    }

    /// Roll each dependency description of `operation` and attach the ones that fire.
    fn instantiate_dependencies<R: Rng + ?Sized>(
        &mut self,
        request: RequestId,
        operation: &Operation,
        rng: &mut R,
    ) {
        let mut ids = Vec::new();
        for description in &operation.dependencies {
            let p = description.probability;
            if !(p >= 1.0 || (p > 0.0 && rng.gen_bool(p))) {
                continue;
            }
            let id = DependencyId(self.next_dependency);
            self.next_dependency += 1;
            self.dependencies.insert(
                id,
                NetworkDependency {
                    id,
                    parent: request,
                    target: description.target,
                    service: description.service,
                    extra_delay: description.extra_delay,
                    child: None,
                    completed: false,
                },
            );
            ids.push(id);
        }
        if let Some(req) = self.requests.get_mut(&request) {
            req.dependencies = ids;
        }
    }

    pub fn create_user<R: Rng + ?Sized>(
        &mut self,
        operation: &Operation,
        now: SimTime,
        rng: &mut R,
    ) -> RequestId {
        let id = self.insert(RequestKind::User, operation.id, Requester::User, None, now);
        self.instantiate_dependencies(id, operation, rng);
        id
    }

    /// A fresh internal request for `dependency`, replacing its current child.
    pub fn create_internal<R: Rng + ?Sized>(
        &mut self,
        dependency: DependencyId,
        target: &Operation,
        sender: InstanceKey,
        now: SimTime,
        rng: &mut R,
    ) -> SimResult<RequestId> {
        let parent = self.dependency(dependency)?.parent;
        let id = self.insert(
            RequestKind::Internal { dependency },
            target.id,
            Requester::Instance(sender),
            Some(parent),
            now,
        );
        self.instantiate_dependencies(id, target, rng);
        if let Some(dep) = self.dependencies.get_mut(&dependency) {
            dep.child = Some(id);
        }
        Ok(id)
    }

    pub fn create_answer(
        &mut self,
        answered: RequestId,
        sender: InstanceKey,
        now: SimTime,
    ) -> SimResult<RequestId> {
        let request = self.get(answered)?;
        let kind = RequestKind::Answer {
            answered,
            destination: request.sender,
        };
        let operation = request.operation;
        let parent = request.parent;
        Ok(self.insert(
            kind,
            operation,
            Requester::Instance(sender),
            parent,
            now,
        ))
    }

    pub fn get(&self, id: RequestId) -> SimResult<&Request> {
        self.requests.get(&id).ok_or(SimError::UnknownRequest(id))
    }

    pub fn get_mut(&mut self, id: RequestId) -> SimResult<&mut Request> {
        self.requests.get_mut(&id).ok_or(SimError::UnknownRequest(id))
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.requests.contains_key(&id)
    }

    pub fn dependency(&self, id: DependencyId) -> SimResult<&NetworkDependency> {
        self.dependencies
            .get(&id)
            .ok_or(SimError::UnknownDependency(id))
    }

    /// Whether every dependency of `request` has been answered.
    pub fn dependencies_completed(&self, request: RequestId) -> bool {
        self.requests.get(&request).is_some_and(|req| {
            req.dependencies
                .iter()
                .all(|dep| self.dependencies.get(dep).is_none_or(|d| d.completed))
        })
    }

    /// Mark `dependency` answered. Returns its parent.
    pub fn complete_dependency(&mut self, dependency: DependencyId) -> SimResult<RequestId> {
        let dep = self
            .dependencies
            .get_mut(&dependency)
            .ok_or(SimError::UnknownDependency(dependency))?;
        dep.completed = true;
        Ok(dep.parent)
    }

    /// Drop a request and the dependency records it owns.
    pub fn discard(&mut self, id: RequestId) -> Option<Request> {
        let request = self.requests.remove(&id)?;
        for dep in &request.dependencies {
            self.dependencies.remove(dep);
        }
        Some(request)
    }

    /// Requests still alive anywhere in the system.
    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }

    pub fn dependency_count(&self) -> usize {
        self.dependencies.len()
    }
}
