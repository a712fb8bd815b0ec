//! Execution engine: runs a skill's steps in order against one task.
//!
//! Each step's output is validated before the next step runs. The first
//! validation failure, executor error or step timeout halts the chain; the
//! partial run is still scored and appended. Exactly one `ExecutionRecord` is
//! appended per invocation and nothing about a single run is ever returned as
//! an `Err`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use skillgate_state::{ExecutionLog, ExecutionRecord, StepAttempt};
use tracing::Instrument;
use uuid::Uuid;

use crate::domain::{Skill, ValidationPattern};
use crate::metrics::METRICS;
use crate::obs;
use crate::retry::RetryPolicy;
use crate::scorer::FidelityScorer;

const SUMMARY_CHARS: usize = 200;

/// Failure raised by an executor. Recorded, never propagated.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct ExecutorError(pub String);

/// The agent that interprets step instructions.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Matched against `Skill::primary_executor_class`.
    fn executor_class(&self) -> &str;

    /// Run one step. `context` is `{task_id, input, outputs: [..]}` where
    /// `outputs` holds every earlier step's output in order.
    async fn run_step(&self, instructions: &str, context: &Value) -> Result<Value, ExecutorError>;
}

/// Executors keyed by class.
#[derive(Clone, Default)]
pub struct ExecutorSet {
    executors: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, executor: Arc<dyn Executor>) -> Self {
        self.register(executor);
        self
    }

    pub fn register(&mut self, executor: Arc<dyn Executor>) {
        self.executors
            .insert(executor.executor_class().to_string(), executor);
    }

    pub fn get(&self, class: &str) -> Option<Arc<dyn Executor>> {
        self.executors.get(class).cloned()
    }
}

/// One task handed to a skill.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskContext {
    pub task_id: String,
    pub input: Value,
    /// What the final output must satisfy for the outcome to count as correct.
    pub expected_outcome: Option<ValidationPattern>,
}

impl TaskContext {
    pub fn new(task_id: impl Into<String>, input: Value) -> Self {
        Self {
            task_id: task_id.into(),
            input,
            expected_outcome: None,
        }
    }

    pub fn expecting(mut self, outcome: ValidationPattern) -> Self {
        self.expected_outcome = Some(outcome);
        self
    }
}

pub struct ExecutionEngine {
    executors: ExecutorSet,
    log: Arc<dyn ExecutionLog>,
    scorer: FidelityScorer,
    step_timeout: Duration,
    append_retry: RetryPolicy,
}

impl ExecutionEngine {
    pub fn new(executors: ExecutorSet, log: Arc<dyn ExecutionLog>) -> Self {
        Self {
            executors,
            log,
            scorer: FidelityScorer,
            step_timeout: Duration::from_secs(30),
            append_retry: RetryPolicy::default().without_timeout(),
        }
    }

    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Appends are not idempotent, so the policy's attempt timeout is dropped.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.append_retry = retry.without_timeout();
        self
    }

    /// Run `skill` against `task` and append the resulting record.
    pub async fn execute(&self, skill: &Skill, task: &TaskContext) -> ExecutionRecord {
        let execution_id = Uuid::new_v4();
        let span = obs::execution_span(&execution_id.to_string(), &skill.id, skill.version);
        self.run(execution_id, skill, task).instrument(span).await
    }

    async fn run(&self, execution_id: Uuid, skill: &Skill, task: &TaskContext) -> ExecutionRecord {
        let timestamp = Utc::now();
        let started = Instant::now();

        let mut attempts: Vec<StepAttempt> = Vec::with_capacity(skill.steps.len());
        let mut outputs: Vec<Value> = Vec::with_capacity(skill.steps.len());
        let mut exception: Option<String> = None;

        match self.executors.get(&skill.primary_executor_class) {
            None => {
                exception = Some(format!(
                    "no executor registered for class {}",
                    skill.primary_executor_class
                ));
            }
            Some(executor) => {
                let mut steps: Vec<_> = skill.steps.iter().collect();
                steps.sort_by_key(|s| s.index);

                for step in steps {
                    let context = json!({
                        "task_id": task.task_id,
                        "input": task.input,
                        "outputs": outputs,
                    });
                    let run = tokio::time::timeout(
                        self.step_timeout,
                        executor.run_step(&step.instructions, &context),
                    )
                    .await;

                    let output = match run {
                        Ok(Ok(output)) => output,
                        Ok(Err(e)) => {
                            exception = Some(format!("step {}: {e}", step.index));
                            attempts.push(StepAttempt {
                                step_index: step.index,
                                output_summary: format!("executor error: {e}"),
                                validation_passed: false,
                            });
                            break;
                        }
                        Err(_elapsed) => {
                            exception = Some(format!(
                                "step {} timed out after {}ms",
                                step.index,
                                self.step_timeout.as_millis()
                            ));
                            attempts.push(StepAttempt {
                                step_index: step.index,
                                output_summary: "timed out".into(),
                                validation_passed: false,
                            });
                            break;
                        }
                    };

                    let verdict = self.scorer.validate(&output, &step.validation_pattern);
                    attempts.push(StepAttempt {
                        step_index: step.index,
                        output_summary: summarize(&output),
                        validation_passed: verdict.is_ok(),
                    });
                    if let Err(reason) = verdict {
                        METRICS.inc_steps_failed();
                        obs::emit_step_failed(&skill.id, step.index, &reason);
                        break;
                    }
                    outputs.push(output);
                }
            }
        }

        if let Some(reason) = &exception {
            METRICS.inc_steps_failed();
            obs::emit_step_failed(&skill.id, attempts.len().saturating_sub(1), reason);
        }

        let passed = attempts.iter().filter(|a| a.validation_passed).count();
        let completed = exception.is_none() && passed == skill.steps.len();
        let record = ExecutionRecord {
            execution_id,
            skill_id: skill.id.clone(),
            skill_version: skill.version,
            timestamp,
            overall_fidelity: self.scorer.fidelity(passed, attempts.len()),
            outcome_correct: self.scorer.outcome(
                task.expected_outcome.as_ref(),
                outputs.last(),
                completed,
            ),
            duration_ms: started.elapsed().as_millis() as u64,
            exception,
            steps: attempts,
        };

        let appended = self
            .append_retry
            .run("append", || self.log.append(&record))
            .await;
        match appended {
            Ok(()) => {
                METRICS.inc_executions();
                obs::emit_execution_recorded(
                    &record.skill_id,
                    record.skill_version,
                    record.overall_fidelity,
                    record.steps.len(),
                    record.exception.is_some(),
                );
            }
            Err(e) => {
                METRICS.inc_append_failures();
                obs::emit_append_failed(&record.skill_id, &e);
            }
        }
        record
    }
}

fn summarize(output: &Value) -> String {
    let text = match output {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if text.chars().count() <= SUMMARY_CHARS {
        return text;
    }
    let mut cut: String = text.chars().take(SUMMARY_CHARS).collect();
    cut.push('…');
    cut
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Step;
    use skillgate_state::fakes::MemoryExecutionLog;
    use skillgate_state::{LifecycleState, StreamKey};
    use std::sync::Mutex;

    /// Echoes instructions back as `{"text": ..}` and remembers what it saw.
    #[derive(Default)]
    struct Echo {
        seen: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl Executor for Echo {
        fn executor_class(&self) -> &str {
            "echo"
        }

        async fn run_step(
            &self,
            instructions: &str,
            context: &Value,
        ) -> Result<Value, ExecutorError> {
            self.seen.lock().unwrap().push(context.clone());
            match instructions {
                "raise" => Err(ExecutorError("model refused".into())),
                "hang" => {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(Value::Null)
                }
                other => Ok(json!({ "text": other })),
            }
        }
    }

    fn skill_with(instructions: &[&str]) -> Skill {
        Skill {
            id: "greeting".into(),
            version: 1,
            lifecycle_state: LifecycleState::Production,
            primary_executor_class: "echo".into(),
            fidelity_threshold: 0.9,
            min_executions_for_promotion: 100,
            steps: instructions
                .iter()
                .enumerate()
                .map(|(index, text)| Step {
                    index,
                    instructions: text.to_string(),
                    validation_pattern: ValidationPattern::Contains { text: "ok".into() },
                })
                .collect(),
            parent: None,
        }
    }

    fn engine(echo: Arc<Echo>, log: Arc<MemoryExecutionLog>) -> ExecutionEngine {
        ExecutionEngine::new(ExecutorSet::new().with(echo), log)
            .with_step_timeout(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn all_steps_pass() {
        let log = Arc::new(MemoryExecutionLog::new());
        let echo = Arc::new(Echo::default());
        let task = TaskContext::new("t1", json!({"name": "Ada"}))
            .expecting(ValidationPattern::Contains { text: "ok 3".into() });
        let record = engine(echo.clone(), log.clone())
            .execute(&skill_with(&["ok 1", "ok 2", "ok 3"]), &task)
            .await;

        assert_eq!(record.steps.len(), 3);
        assert_eq!(record.overall_fidelity, 1.0);
        assert_eq!(record.outcome_correct, Some(true));
        assert!(record.exception.is_none());
        assert_eq!(log.len(&StreamKey::new("greeting", 1)).await.unwrap(), 1);

        let seen = echo.seen.lock().unwrap();
        assert_eq!(seen[2]["outputs"].as_array().unwrap().len(), 2);
        assert_eq!(seen[0]["input"]["name"], "Ada");
    }

    #[tokio::test]
    async fn stops_on_first_validation_failure() {
        let log = Arc::new(MemoryExecutionLog::new());
        let echo = Arc::new(Echo::default());
        let skill = skill_with(&["ok 1", "nope", "ok 3", "ok 4"]);
        let record = engine(echo.clone(), log.clone())
            .execute(&skill, &TaskContext::new("t", Value::Null))
            .await;

        assert_eq!(record.steps.len(), 2);
        assert!(!record.steps[1].validation_passed);
        assert_eq!(record.overall_fidelity, 0.5);
        assert!(record.exception.is_none());
        assert_eq!(record.outcome_correct, None);
        assert_eq!(echo.seen.lock().unwrap().len(), 2);
        assert_eq!(log.total(), 1);
    }

    #[tokio::test]
    async fn executor_error_is_recorded_as_exception() {
        let log = Arc::new(MemoryExecutionLog::new());
        let task = TaskContext::new("t", Value::Null).expecting(ValidationPattern::NonEmpty);
        let record = engine(Arc::new(Echo::default()), log.clone())
            .execute(&skill_with(&["ok 1", "raise", "ok 3"]), &task)
            .await;

        assert_eq!(record.steps.len(), 2);
        assert_eq!(record.overall_fidelity, 0.5);
        assert!(record.exception.as_deref().unwrap().contains("model refused"));
        assert_eq!(record.outcome_correct, Some(false));
        assert_eq!(log.total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn step_timeout_is_an_exception() {
        let log = Arc::new(MemoryExecutionLog::new());
        let record = engine(Arc::new(Echo::default()), log.clone())
            .execute(&skill_with(&["hang", "ok 2"]), &TaskContext::new("t", Value::Null))
            .await;

        assert_eq!(record.steps.len(), 1);
        assert_eq!(record.overall_fidelity, 0.0);
        assert!(record.exception.as_deref().unwrap().contains("timed out"));
        assert_eq!(log.total(), 1);
    }

    #[tokio::test]
    async fn missing_executor_class_records_zero_attempts() {
        let log = Arc::new(MemoryExecutionLog::new());
        let mut skill = skill_with(&["ok"]);
        skill.primary_executor_class = "vision".into();
        let record = engine(Arc::new(Echo::default()), log.clone())
            .execute(&skill, &TaskContext::new("t", Value::Null))
            .await;

        assert!(record.steps.is_empty());
        assert_eq!(record.overall_fidelity, 0.0);
        assert!(record.exception.is_some());
        assert_eq!(log.total(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn append_failure_still_returns_the_record() {
        let log = Arc::new(MemoryExecutionLog::new());
        log.fail_next_appends(100);
        let record = engine(Arc::new(Echo::default()), log.clone())
            .execute(&skill_with(&["ok"]), &TaskContext::new("t", Value::Null))
            .await;
        assert_eq!(record.overall_fidelity, 1.0);
        assert_eq!(log.total(), 0);
    }

    #[test]
    fn long_outputs_are_truncated() {
        let long = Value::String("x".repeat(500));
        assert_eq!(summarize(&long).chars().count(), SUMMARY_CHARS + 1);
    }
}
