//! In-memory saga store.

use chrono::{DateTime, Utc};
use rushtix_core::repository::RepoFuture;
use rushtix_core::{DomainError, SagaId, SagaInstance, SagaStore};
use std::collections::HashMap;
use std::sync::Mutex;

/// Saga instances in a map.
#[derive(Default)]
pub struct MemorySagaStore {
    instances: Mutex<HashMap<SagaId, SagaInstance>>,
}

impl MemorySagaStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of one instance, for assertions.
    #[must_use]
    pub fn snapshot(&self, id: SagaId) -> Option<SagaInstance> {
        self.instances.lock().ok()?.get(&id).cloned()
    }

    /// Every instance, for assertions.
    #[must_use]
    pub fn all(&self) -> Vec<SagaInstance> {
        self.instances
            .lock()
            .map(|i| i.values().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<SagaId, SagaInstance>>, DomainError> {
        self.instances
            .lock()
            .map_err(|_| DomainError::Internal("saga store poisoned".to_string()))
    }
}

impl SagaStore for MemorySagaStore {
    fn insert(&self, instance: &SagaInstance) -> RepoFuture<'_, ()> {
        let instance = instance.clone();
        Box::pin(async move {
            self.lock()?.insert(instance.id, instance);
            Ok(())
        })
    }

    fn get(&self, id: SagaId) -> RepoFuture<'_, Option<SagaInstance>> {
        Box::pin(async move { Ok(self.lock()?.get(&id).cloned()) })
    }

    fn update(&self, instance: &SagaInstance) -> RepoFuture<'_, ()> {
        let instance = instance.clone();
        Box::pin(async move {
            self.lock()?.insert(instance.id, instance);
            Ok(())
        })
    }

    fn find_in_flight(&self, limit: u32) -> RepoFuture<'_, Vec<SagaInstance>> {
        Box::pin(async move {
            let mut in_flight: Vec<SagaInstance> = self
                .lock()?
                .values()
                .filter(|i| i.status.is_in_flight())
                .cloned()
                .collect();
            in_flight.sort_by_key(|i| i.started_at);
            in_flight.truncate(limit as usize);
            Ok(in_flight)
        })
    }

    fn find_timed_out(
        &self,
        now: DateTime<Utc>,
        limit: u32,
    ) -> RepoFuture<'_, Vec<SagaInstance>> {
        Box::pin(async move {
            let mut timed_out: Vec<SagaInstance> = self
                .lock()?
                .values()
                .filter(|i| {
                    i.status.is_in_flight()
                        && i.steps.iter().any(|s| {
                            s.step_index == i.current_step
                                && s.finished_at.is_none()
                                && s.timeout_at < now
                        })
                })
                .cloned()
                .collect();
            timed_out.sort_by_key(|i| i.started_at);
            timed_out.truncate(limit as usize);
            Ok(timed_out)
        })
    }
}
