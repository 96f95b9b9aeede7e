//! Worker spawning and tracking.
//!
//! One spawned task per claimed CR, deduplicated in-process by `cr_id`.
//! True ownership is still the status CAS in the executor — the registry
//! only avoids pointless duplicate spawns and supports recovery of runs
//! orphaned by a dead worker.

use crate::errors::StoreError;
use crate::executor::Executor;
use crate::store::RunStore;
use gantry_common::run::RunStatus;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

#[derive(Clone)]
pub struct WorkerRegistry {
    executor: Executor,
    active: Arc<Mutex<HashMap<String, JoinHandle<()>>>>,
}

impl WorkerRegistry {
    pub fn new(executor: Executor) -> Self {
        Self {
            executor,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Spawn a worker for a CR unless one is already in flight here.
    pub fn spawn(&self, cr_id: &str) {
        let mut active = self.active.lock().expect("worker registry poisoned");
        active.retain(|_, handle| !handle.is_finished());
        if active.contains_key(cr_id) {
            tracing::debug!(cr_id, "worker already active; not spawning another");
            return;
        }

        let executor = self.executor.clone();
        let registry = Arc::clone(&self.active);
        let cr = cr_id.to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = executor.run(&cr).await {
                tracing::error!(cr_id = %cr, error = %format!("{:#}", anyhow::Error::new(e)), "worker failed");
            }
            registry
                .lock()
                .expect("worker registry poisoned")
                .remove(&cr);
        });
        active.insert(cr_id.to_string(), handle);
    }

    pub fn is_active(&self, cr_id: &str) -> bool {
        let active = self.active.lock().expect("worker registry poisoned");
        active.get(cr_id).is_some_and(|handle| !handle.is_finished())
    }

    /// Recover runs stuck in `running` with no live worker (pod-failure
    /// recovery at startup): reset them to `pending` and respawn.
    pub fn recover_orphans(&self, store: &RunStore) -> Result<usize, StoreError> {
        let mut recovered = 0;
        for run in store.list_runs(1000)? {
            if run.status == RunStatus::Running && !self.is_active(&run.cr_id) {
                if store.update_status(&run.cr_id, RunStatus::Running, RunStatus::Pending)? {
                    tracing::info!(cr_id = %run.cr_id, "recovering orphaned run");
                    self.spawn(&run.cr_id);
                    recovered += 1;
                }
            }
        }
        Ok(recovered)
    }

    /// Abort every in-flight worker (process shutdown).
    pub fn shutdown(&self) {
        let mut active = self.active.lock().expect("worker registry poisoned");
        for (cr_id, handle) in active.drain() {
            tracing::info!(cr_id = %cr_id, "aborting worker on shutdown");
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::ratelimit::TokenBucket;
    use crate::agent::scripted::ScriptedBackend;
    use crate::agent::AgentRunner;
    use crate::bus::EventBus;
    use crate::intervene::InterventionRegistry;
    use crate::store::Database;
    use gantry_common::snapshot::{ConfigSnapshot, RetryPolicy};

    fn registry() -> (WorkerRegistry, RunStore) {
        let db = Database::in_memory().unwrap();
        let store = RunStore::new(db.clone());
        let bus = EventBus::new(db.clone(), "default");
        let interventions = InterventionRegistry::new(db, bus.clone());
        let runner = AgentRunner::new(
            Arc::new(ScriptedBackend::new()),
            Arc::new(TokenBucket::per_minute(6000)),
            RetryPolicy { max_attempts: 2, base_delay_secs: 0 },
        );
        let scratch = std::env::temp_dir().join(format!("gantry-worker-{}", uuid::Uuid::new_v4()));
        let executor = Executor::new(
            store.clone(),
            bus,
            interventions,
            runner,
            scratch.join("runs"),
            scratch.join("clones"),
        );
        (WorkerRegistry::new(executor), store)
    }

    async fn wait_until_idle(registry: &WorkerRegistry, cr_id: &str) {
        for _ in 0..100 {
            if !registry.is_active(cr_id) {
                return;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        panic!("worker did not finish");
    }

    #[tokio::test]
    async fn worker_runs_the_pipeline_for_a_cr() {
        let (registry, store) = registry();
        let cr_id = store
            .create_run(
                None,
                "t",
                "api",
                &ConfigSnapshot::default(),
                &serde_json::json!({"title": "t", "source": "api"}),
            )
            .unwrap();
        registry.spawn(&cr_id);
        wait_until_idle(&registry, &cr_id).await;
        // No repos: the run pauses, proving the worker drove the graph.
        assert_eq!(store.get_run(&cr_id).unwrap().status, RunStatus::Paused);
    }

    #[tokio::test]
    async fn duplicate_spawn_is_a_no_op() {
        let (registry, store) = registry();
        let cr_id = store
            .create_run(
                None,
                "t",
                "api",
                &ConfigSnapshot::default(),
                &serde_json::json!({"title": "t", "source": "api"}),
            )
            .unwrap();
        registry.spawn(&cr_id);
        registry.spawn(&cr_id);
        wait_until_idle(&registry, &cr_id).await;
        assert_eq!(store.get_run(&cr_id).unwrap().status, RunStatus::Paused);
    }

    #[tokio::test]
    async fn recover_orphans_resets_and_respawns() {
        let (registry, store) = registry();
        let cr_id = store
            .create_run(
                None,
                "t",
                "api",
                &ConfigSnapshot::default(),
                &serde_json::json!({"title": "t", "source": "api"}),
            )
            .unwrap();
        // A dead worker left the run in `running`.
        store.update_status(&cr_id, RunStatus::Pending, RunStatus::Running).unwrap();

        let recovered = registry.recover_orphans(&store).unwrap();
        assert_eq!(recovered, 1);
        wait_until_idle(&registry, &cr_id).await;
        assert_eq!(store.get_run(&cr_id).unwrap().status, RunStatus::Paused);
    }
}
