use crate::provider::InferenceProvider;
use shared::types::{Task, TaskOutcome, TaskType};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{error, info, warn};

/// Task-type to model routing, defaults plus operator overrides.
#[derive(Debug, Clone, Default)]
pub struct ModelTable {
    overrides: HashMap<TaskType, String>,
}

impl ModelTable {
    pub fn with_overrides(overrides: HashMap<TaskType, String>) -> Self {
        Self { overrides }
    }

    pub fn model_for(&self, task_type: TaskType) -> &str {
        self.overrides
            .get(&task_type)
            .map(String::as_str)
            .unwrap_or_else(|| task_type.default_model())
    }
}

/// Runs tasks against the inference provider, bounding concurrency with
/// a semaphore and retrying transient provider failures a fixed number
/// of times before declaring the task failed.
pub struct TaskExecutor {
    provider: Arc<dyn InferenceProvider>,
    models: ModelTable,
    semaphore: Semaphore,
    max_retries: u32,
    retry_delay: Duration,
}

impl TaskExecutor {
    pub fn new(
        provider: Arc<dyn InferenceProvider>,
        models: ModelTable,
        concurrency: usize,
        max_retries: u32,
    ) -> Self {
        Self {
            provider,
            models,
            semaphore: Semaphore::new(concurrency),
            max_retries,
            retry_delay: Duration::from_millis(500),
        }
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub async fn execute(&self, task: &Task) -> TaskOutcome {
        let _permit = match self.semaphore.acquire().await {
            Ok(permit) => permit,
            Err(_) => return TaskOutcome::failure(task.id, "executor is shut down"),
        };

        let model = self.models.model_for(task.task_type);
        let prompt = build_prompt(task);
        info!(
            task_id = %task.id,
            task_type = task.task_type.as_str(),
            model,
            "executing task"
        );

        let mut attempt: u32 = 0;
        loop {
            match self.provider.generate(&prompt, model).await {
                Ok(output) => return TaskOutcome::success(task.id, output),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    attempt += 1;
                    warn!(
                        task_id = %task.id,
                        attempt,
                        error = %e,
                        "transient inference failure, retrying"
                    );
                    tokio::time::sleep(self.retry_delay * attempt).await;
                }
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "task execution failed");
                    return TaskOutcome::failure(task.id, e.to_string());
                }
            }
        }
    }
}

fn build_prompt(task: &Task) -> String {
    format!("{}\n\nInput:\n{}", task.task_type.goal(), task.payload)
}
