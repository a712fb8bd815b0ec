//! Wiring shared by the binaries: open the stores named by a
//! [`PipelineConfig`] and build each component over them.

use std::sync::Arc;

use skillgate_state::fakes::{
    MemoryAggregateStore, MemoryApprovalLog, MemoryExecutionLog, MemoryLifecycleLog,
    MemoryRegistryStore,
};
use skillgate_state::fs::{FsApprovalLog, FsExecutionLog, FsLifecycleLog, FsRegistryStore};
use skillgate_state::{
    AggregateStore, ApprovalLog, ExecutionLog, LifecycleLog, RegistryStore, StorageError,
    SurrealAggregateStore, SurrealHandle,
};
use tracing::info;

use crate::aggregate::Aggregator;
use crate::config::PipelineConfig;
use crate::domain::{Result, SkillError};
use crate::engine::{ExecutionEngine, ExecutorSet};
use crate::monitor::RollbackMonitor;
use crate::ops::LifecycleOps;
use crate::pool::WorkerPool;
use crate::query::MetricsQuery;
use crate::registry::SkillRegistry;
use crate::variation::VariationManager;

pub struct Pipeline {
    config: PipelineConfig,
    registry: Arc<SkillRegistry>,
    executions: Arc<dyn ExecutionLog>,
    aggregates: Arc<dyn AggregateStore>,
    approvals: Arc<dyn ApprovalLog>,
    history: Arc<dyn LifecycleLog>,
}

impl Pipeline {
    /// File-backed logs and registry under `data_dir`, SurrealDB aggregates
    /// at `aggregate_url`.
    pub async fn open(config: PipelineConfig) -> Result<Self> {
        let root = config.data_dir.clone();
        std::fs::create_dir_all(&root)?;

        let url = config.aggregate_url();
        let handle = SurrealHandle::connect(&url)
            .await
            .map_err(|e| SkillError::Storage(StorageError::Unavailable(e.to_string())))?;
        info!(data_dir = %root.display(), aggregate_url = %url, "pipeline stores opened");

        Ok(Self::from_parts(
            config,
            Arc::new(FsRegistryStore::new(&root)?),
            Arc::new(FsExecutionLog::new(&root)?),
            Arc::new(SurrealAggregateStore::new(handle)),
            Arc::new(FsApprovalLog::new(&root)?),
            Arc::new(FsLifecycleLog::new(&root)?),
        ))
    }

    /// Everything in memory. Nothing survives the process.
    pub fn in_memory(config: PipelineConfig) -> Self {
        Self::from_parts(
            config,
            Arc::new(MemoryRegistryStore::new()),
            Arc::new(MemoryExecutionLog::new()),
            Arc::new(MemoryAggregateStore::new()),
            Arc::new(MemoryApprovalLog::new()),
            Arc::new(MemoryLifecycleLog::new()),
        )
    }

    pub fn from_parts(
        config: PipelineConfig,
        registry_store: Arc<dyn RegistryStore>,
        executions: Arc<dyn ExecutionLog>,
        aggregates: Arc<dyn AggregateStore>,
        approvals: Arc<dyn ApprovalLog>,
        history: Arc<dyn LifecycleLog>,
    ) -> Self {
        let registry = SkillRegistry::new(registry_store)
            .with_policy(config.approval_policy())
            .with_retry(config.retry_policy())
            .with_rollback_floor(config.monitor.rollback_floor);
        Self {
            config,
            registry: Arc::new(registry),
            executions,
            aggregates,
            approvals,
            history,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn registry(&self) -> Arc<SkillRegistry> {
        self.registry.clone()
    }

    pub fn metrics(&self) -> MetricsQuery {
        MetricsQuery::new(
            self.aggregates.clone(),
            self.config.aggregator.bucket_secs,
            self.config.monitor.window,
        )
    }

    pub fn ops(&self) -> LifecycleOps {
        LifecycleOps::new(
            self.registry(),
            self.metrics(),
            self.executions.clone(),
            self.approvals.clone(),
            self.history.clone(),
        )
        .with_batch_interval(self.config.batch_interval())
    }

    pub fn aggregator(&self) -> Aggregator {
        Aggregator::new(
            self.executions.clone(),
            self.aggregates.clone(),
            self.config.aggregator_config(),
        )
    }

    pub fn monitor(&self) -> RollbackMonitor {
        RollbackMonitor::new(
            self.registry(),
            self.metrics(),
            self.history.clone(),
            self.config.monitor_config(),
        )
    }

    pub fn variation(&self) -> VariationManager {
        VariationManager::new(
            self.registry(),
            self.metrics(),
            self.history.clone(),
            self.config.variation_config(),
        )
    }

    pub fn engine(&self, executors: ExecutorSet) -> ExecutionEngine {
        ExecutionEngine::new(executors, self.executions.clone())
            .with_step_timeout(self.config.step_timeout())
            .with_retry(self.config.retry_policy())
    }

    pub fn pool(&self, executors: ExecutorSet) -> WorkerPool {
        WorkerPool::new(
            Arc::new(self.engine(executors)),
            self.registry(),
            self.config.engine.max_concurrency,
        )
    }
}
