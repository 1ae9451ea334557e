//! Job handlers and the registry that resolves them by job type.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::job::Job;

/// What a handler receives for one attempt.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Snapshot of the job as claimed (attempts already counted).
    pub job: Job,
    /// Cancelled when the deadline passes or the worker is killed.
    pub cancel: CancellationToken,
}

impl JobContext {
    pub fn new(job: Job, cancel: CancellationToken) -> Self {
        Self { job, cancel }
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.job.payload
    }

    /// Whether the attempt has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

/// Executes jobs of one type.
///
/// Returning `Err` counts as a failed attempt; the error and its cause chain
/// are stored on the job.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Job type this handler serves.
    fn job_type(&self) -> &str;

    async fn handle(&self, ctx: JobContext) -> anyhow::Result<()>;
}

/// Registry of job handlers, keyed by job type.
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, Arc<dyn JobHandler>>>,
}

impl HandlerRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Registry pre-populated with the built-in handlers.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register_builtins();
        registry
    }

    /// Register a handler, replacing any previous one for the same type.
    pub async fn register(&self, handler: Arc<dyn JobHandler>) {
        let job_type = handler.job_type().to_string();
        if self
            .handlers
            .write()
            .await
            .insert(job_type.clone(), handler)
            .is_some()
        {
            tracing::warn!(job_type = %job_type, "Replaced existing job handler");
        } else {
            tracing::debug!("Registered job handler: {}", job_type);
        }
    }

    /// Register the built-in handlers (sync version for startup).
    pub fn register_builtins(&self) {
        if let Ok(mut handlers) = self.handlers.try_write() {
            for handler in crate::worker::builtin::builtin_handlers() {
                tracing::debug!("Registered job handler: {}", handler.job_type());
                handlers.insert(handler.job_type().to_string(), handler);
            }
        }
    }

    /// Unregister a handler.
    pub async fn unregister(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.write().await.remove(job_type)
    }

    /// Get the handler for a job type.
    pub async fn get(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.read().await.get(job_type).cloned()
    }

    pub async fn has(&self, job_type: &str) -> bool {
        self.handlers.read().await.contains_key(job_type)
    }

    /// List all registered job types.
    pub async fn list(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.read().await.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get the number of registered handlers.
    pub fn count(&self) -> usize {
        self.handlers.try_read().map(|h| h.len()).unwrap_or(0)
    }
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}
