//! Service registry - resolves incoming calls to implementations.

use crate::description::{RunnableCallDescription, ServiceDescription};
use dashmap::DashMap;
use std::sync::Arc;

/// Mutable mapping from service id to service description.
///
/// Safe to mutate while calls are being dispatched. A call resolves its
/// description once, when it is opened, so replacing or removing a service
/// never affects calls already running.
#[derive(Default)]
pub struct ServiceRegistry {
    /// Services indexed by service id.
    services: DashMap<String, Arc<ServiceDescription>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a service, replacing any service with the same id.
    /// Returns the replaced service.
    pub fn register(&self, description: ServiceDescription) -> Option<Arc<ServiceDescription>> {
        let service_id = description.service_id().to_string();
        let previous = self.services.insert(service_id.clone(), Arc::new(description));
        if previous.is_some() {
            tracing::debug!("Replaced service '{}'", service_id);
        } else {
            tracing::debug!("Registered service '{}'", service_id);
        }
        previous
    }

    /// Removes a service.
    pub fn unregister(&self, service_id: &str) -> Option<Arc<ServiceDescription>> {
        let removed = self.services.remove(service_id).map(|(_, service)| service);
        if removed.is_some() {
            tracing::debug!("Unregistered service '{}'", service_id);
        }
        removed
    }

    /// Looks up one call. Unknown services and calls yield `None`.
    pub fn resolve(&self, service_id: &str, call_id: &str) -> Option<RunnableCallDescription> {
        self.services
            .get(service_id)
            .and_then(|service| service.call(call_id).cloned())
    }

    pub fn service(&self, service_id: &str) -> Option<Arc<ServiceDescription>> {
        self.services.get(service_id).map(|service| service.clone())
    }

    pub fn contains(&self, service_id: &str) -> bool {
        self.services.contains_key(service_id)
    }

    /// Registered service ids, sorted.
    pub fn service_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.services.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}
