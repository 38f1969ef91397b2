//! Operations and the registry resolving them by name.

use meshsim_core::config::SimConfig;
use meshsim_core::{OperationId, ServiceId, SimError, SimResult};
use std::collections::HashMap;

/// A possible call from one operation to another.
#[derive(Debug, Clone, PartialEq)]
pub struct DependencyDescription {
    pub target: OperationId,
    pub service: ServiceId,
    pub probability: f64,
    pub extra_delay: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: OperationId,
    pub service: ServiceId,
    pub name: String,
    pub demand: u64,
    pub dependencies: Vec<DependencyDescription>,
}

/// All operations of an experiment, immutable after load.
#[derive(Debug, Clone, Default)]
pub struct OperationRegistry {
    operations: Vec<Operation>,
    services: Vec<String>,
    service_ids: HashMap<String, ServiceId>,
    by_name: HashMap<(ServiceId, String), OperationId>,
}

impl OperationRegistry {
    pub fn from_config(config: &SimConfig) -> SimResult<Self> {
        let mut registry = OperationRegistry::default();
        for (idx, service) in config.services.iter().enumerate() {
            let id = ServiceId(idx);
            registry.services.push(service.name.clone());
            registry.service_ids.insert(service.name.clone(), id);
        }

        // Ids first so dependencies may point forward.
        for service in &config.services {
            let service_id = registry.service_id(&service.name)?;
            for op in &service.operations {
                let id = OperationId(registry.operations.len());
                registry.by_name.insert((service_id, op.name.clone()), id);
                registry.operations.push(Operation {
                    id,
                    service: service_id,
                    name: op.name.clone(),
                    demand: op.demand,
                    dependencies: Vec::new(),
                });
            }
        }

        for service in &config.services {
            let service_id = registry.service_id(&service.name)?;
            for op in &service.operations {
                let id = registry.lookup_in(service_id, &op.name)?;
                let mut dependencies = Vec::with_capacity(op.dependencies.len());
                for dep in &op.dependencies {
                    let target = registry.lookup(&dep.service, &dep.operation)?;
                    dependencies.push(DependencyDescription {
                        target,
                        service: registry.operations[target.0].service,
                        probability: dep.probability,
                        extra_delay: dep.extra_delay,
                    });
                }
                registry.operations[id.0].dependencies = dependencies;
            }
        }
        Ok(registry)
    }

    pub fn operation(&self, id: OperationId) -> SimResult<&Operation> {
        self.operations
            .get(id.0)
            .ok_or_else(|| SimError::UnknownOperation(id.to_string()))
    }

    pub fn service_id(&self, name: &str) -> SimResult<ServiceId> {
        self.service_ids
            .get(name)
            .copied()
            .ok_or_else(|| SimError::UnknownService(name.to_string()))
    }

    pub fn service_name(&self, id: ServiceId) -> &str {
        self.services.get(id.0).map(String::as_str).unwrap_or("?")
    }

    pub fn lookup(&self, service: &str, operation: &str) -> SimResult<OperationId> {
        let service_id = self.service_id(service)?;
        self.lookup_in(service_id, operation)
            .map_err(|_| SimError::UnknownOperation(format!("{service}.{operation}")))
    }

    fn lookup_in(&self, service: ServiceId, operation: &str) -> SimResult<OperationId> {
        self.by_name
            .get(&(service, operation.to_string()))
            .copied()
            .ok_or_else(|| SimError::UnknownOperation(operation.to_string()))
    }

    pub fn operations_of(&self, service: ServiceId) -> impl Iterator<Item = &Operation> {
        self.operations.iter().filter(move |op| op.service == service)
    }

    /// `service.operation`
    pub fn qualified_name(&self, id: OperationId) -> String {
        match self.operations.get(id.0) {
            Some(op) => format!("{}.{}", self.service_name(op.service), op.name),
            None => id.to_string(),
        }
    }

    pub fn service_count(&self) -> usize {
        self.services.len()
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_resolves_forward_dependencies() {
        let config = SimConfig::scaffold("registry");
        let registry = OperationRegistry::from_config(&config).unwrap();
        assert_eq!(registry.service_count(), 2);
        assert_eq!(registry.len(), 2);

        let index = registry.lookup("gateway", "index").unwrap();
        let query = registry.lookup("backend", "query").unwrap();
        let op = registry.operation(index).unwrap();
        assert_eq!(op.demand, 50);
        assert_eq!(op.dependencies.len(), 1);
        assert_eq!(op.dependencies[0].target, query);
        assert_eq!(op.dependencies[0].service, registry.service_id("backend").unwrap());
        assert_eq!(registry.qualified_name(query), "backend.query");
    }

    #[test]
    fn test_unknown_names() {
        let registry = OperationRegistry::from_config(&SimConfig::scaffold("x")).unwrap();
        assert_eq!(
            registry.lookup("nope", "index"),
            Err(SimError::UnknownService("nope".to_string()))
        );
        assert_eq!(
            registry.lookup("gateway", "nope"),
            Err(SimError::UnknownOperation("gateway.nope".to_string()))
        );
    }
}
