//! Dispatch from task type to the code that runs it

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, RwLock};

/// Consumer of claimed jobs: `(task_type, input) -> output`
#[async_trait]
pub trait TaskRunner: Send + Sync {
    async fn run(&self, task_type: &str, input: serde_json::Value)
        -> anyhow::Result<serde_json::Value>;
}

type TaskFn =
    Arc<dyn Fn(serde_json::Value) -> BoxFuture<'static, anyhow::Result<serde_json::Value>> + Send + Sync>;

/// Runner that looks the task type up in a table of registered handlers
#[derive(Default)]
pub struct TaskRegistry {
    handlers: RwLock<HashMap<String, TaskFn>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an async handler for a task type, replacing any previous one
    pub fn register<F, Fut>(&self, task_type: &str, handler: F) -> &Self
    where
        F: Fn(serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<serde_json::Value>> + Send + 'static,
    {
        let handler: TaskFn = Arc::new(
            move |input| -> BoxFuture<'static, anyhow::Result<serde_json::Value>> {
                Box::pin(handler(input))
            },
        );
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(task_type.to_string(), handler);
        self
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(task_type)
    }

    pub fn task_types(&self) -> Vec<String> {
        self.handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }
}

#[async_trait]
impl TaskRunner for TaskRegistry {
    async fn run(
        &self,
        task_type: &str,
        input: serde_json::Value,
    ) -> anyhow::Result<serde_json::Value> {
        // clone out so the lock is not held across the await
        let handler = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(task_type)
            .cloned();

        match handler {
            Some(handler) => handler(input).await,
            None => anyhow::bail!("No handler registered for task type {}", task_type),
        }
    }
}
