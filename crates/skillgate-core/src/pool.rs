//! Worker pool: bounded concurrent execution with the A/B traffic split.
//!
//! Tasks are addressed to a baseline skill. While that skill has live
//! variation candidates, every second task goes to a candidate (rotating
//! among them) so the trial collects samples on both sides.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use skillgate_state::{ExecutionRecord, LifecycleState};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::domain::{Result, SkillError};
use crate::engine::{ExecutionEngine, TaskContext};
use crate::registry::SkillRegistry;

pub struct WorkerPool {
    engine: Arc<ExecutionEngine>,
    registry: Arc<SkillRegistry>,
    permits: Arc<Semaphore>,
    dispatched: Mutex<HashMap<String, u64>>,
}

impl WorkerPool {
    pub fn new(engine: Arc<ExecutionEngine>, registry: Arc<SkillRegistry>, workers: usize) -> Self {
        Self {
            engine,
            registry,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            dispatched: Mutex::new(HashMap::new()),
        }
    }

    /// Next pick for `skill_id`. Even picks are the baseline itself.
    fn next_pick(&self, skill_id: &str) -> u64 {
        let mut map = self.dispatched.lock().unwrap_or_else(|e| e.into_inner());
        let n = map.entry(skill_id.to_string()).or_insert(0);
        let pick = *n;
        *n += 1;
        pick
    }

    /// The skill id that should serve the next task addressed to `skill_id`.
    pub async fn route(&self, skill_id: &str) -> Result<String> {
        let record = self.registry.record(skill_id).await?;
        if record.state == LifecycleState::Retired {
            return Err(SkillError::SkillRetired(skill_id.to_string()));
        }

        let mut candidates: Vec<String> = self
            .registry
            .candidates_of(skill_id)
            .await?
            .into_iter()
            .filter(|c| c.parent.as_ref().map(|p| p.version) == Some(record.version))
            .map(|c| c.skill_id)
            .collect();
        if candidates.is_empty() {
            return Ok(skill_id.to_string());
        }
        candidates.sort();

        let pick = self.next_pick(skill_id);
        if pick % 2 == 0 {
            return Ok(skill_id.to_string());
        }
        let slot = ((pick / 2) % candidates.len() as u64) as usize;
        Ok(candidates.swap_remove(slot))
    }

    /// Run one task, waiting for a free worker.
    pub async fn run(&self, skill_id: &str, task: TaskContext) -> Result<ExecutionRecord> {
        let target = self.route(skill_id).await?;
        let skill = self.registry.get(&target).await?;
        if skill.lifecycle_state == LifecycleState::Retired {
            return Err(SkillError::SkillRetired(target));
        }
        debug!(
            skill_id = %skill_id,
            routed_to = %target,
            task_id = %task.task_id,
            "dispatching task"
        );

        let _permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| SkillError::Config("worker pool closed".into()))?;
        Ok(self.engine.execute(&skill, &task).await)
    }

    /// Spawn [`run`](Self::run) onto the runtime.
    pub fn submit(
        self: &Arc<Self>,
        skill_id: impl Into<String>,
        task: TaskContext,
    ) -> JoinHandle<Result<ExecutionRecord>> {
        let pool = Arc::clone(self);
        let skill_id = skill_id.into();
        tokio::spawn(async move { pool.run(&skill_id, task).await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Skill, Step, ValidationPattern};
    use crate::engine::{Executor, ExecutorError, ExecutorSet};
    use async_trait::async_trait;
    use serde_json::{json, Value};
    use skillgate_state::fakes::{MemoryExecutionLog, MemoryRegistryStore};
    use skillgate_state::{ExecutionLog, ParentRef, StreamKey};

    struct Echo;

    #[async_trait]
    impl Executor for Echo {
        fn executor_class(&self) -> &str {
            "chat"
        }

        async fn run_step(
            &self,
            instructions: &str,
            _context: &Value,
        ) -> std::result::Result<Value, ExecutorError> {
            Ok(json!(instructions))
        }
    }

    fn skill(id: &str) -> Skill {
        Skill {
            id: id.into(),
            version: 1,
            lifecycle_state: LifecycleState::Prototype,
            primary_executor_class: "chat".into(),
            fidelity_threshold: 0.9,
            min_executions_for_promotion: 100,
            steps: vec![Step {
                index: 0,
                instructions: "hello".into(),
                validation_pattern: ValidationPattern::NonEmpty,
            }],
            parent: None,
        }
    }

    async fn pool() -> (Arc<WorkerPool>, Arc<SkillRegistry>, Arc<MemoryExecutionLog>) {
        let registry = Arc::new(SkillRegistry::new(Arc::new(MemoryRegistryStore::new())));
        let log = Arc::new(MemoryExecutionLog::new());
        let executors = ExecutorSet::new().with(Arc::new(Echo));
        let engine = Arc::new(ExecutionEngine::new(executors, log.clone()));
        registry.register(&skill("greeting")).await.unwrap();
        (Arc::new(WorkerPool::new(engine, registry.clone(), 4)), registry, log)
    }

    #[tokio::test]
    async fn without_candidates_everything_goes_to_baseline() {
        let (pool, _, log) = pool().await;
        for i in 0..4 {
            pool.run("greeting", TaskContext::new(format!("t{i}"), json!({}))).await.unwrap();
        }
        assert_eq!(log.len(&StreamKey::new("greeting", 1)).await.unwrap(), 4);
    }

    #[tokio::test]
    async fn live_candidate_gets_half_the_traffic() {
        let (pool, registry, log) = pool().await;
        let parent = ParentRef { skill_id: "greeting".into(), version: 1 };
        let mut cand = skill("greeting.v1.c1");
        cand.parent = Some(parent.clone());
        registry.register_candidate(&cand, parent).await.unwrap();

        let handles: Vec<_> = (0..10)
            .map(|i| pool.submit("greeting", TaskContext::new(format!("t{i}"), json!({}))))
            .collect();
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(log.len(&StreamKey::new("greeting", 1)).await.unwrap(), 5);
        assert_eq!(log.len(&StreamKey::new("greeting.v1.c1", 1)).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn retired_skills_are_refused() {
        let (pool, registry, _) = pool().await;
        let parent = ParentRef { skill_id: "greeting".into(), version: 1 };
        let mut cand = skill("greeting.v1.c1");
        cand.parent = Some(parent.clone());
        registry.register_candidate(&cand, parent).await.unwrap();
        registry.archive_candidate("greeting.v1.c1").await.unwrap();

        let err = pool
            .run("greeting.v1.c1", TaskContext::new("t", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, SkillError::SkillRetired(_)));
    }
}
