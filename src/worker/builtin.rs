//! Built-in job handlers: `log` and `sleep`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;

use crate::worker::handler::{JobContext, JobHandler};

/// All built-in handlers.
pub fn builtin_handlers() -> Vec<Arc<dyn JobHandler>> {
    vec![Arc::new(LogHandler), Arc::new(SleepHandler)]
}

/// Logs the payload at info level.
#[derive(Debug, Default)]
pub struct LogHandler;

#[async_trait]
impl JobHandler for LogHandler {
    fn job_type(&self) -> &str {
        "log"
    }

    async fn handle(&self, ctx: JobContext) -> anyhow::Result<()> {
        let message = ctx
            .payload()
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("");
        tracing::info!(
            job_id = %ctx.job.id,
            queue = %ctx.job.queue,
            payload = %ctx.payload(),
            "{message}"
        );
        Ok(())
    }
}

/// Sleeps for `payload.seconds` (fractional allowed), stopping early on cancellation.
#[derive(Debug, Default)]
pub struct SleepHandler;

#[async_trait]
impl JobHandler for SleepHandler {
    fn job_type(&self) -> &str {
        "sleep"
    }

    async fn handle(&self, ctx: JobContext) -> anyhow::Result<()> {
        let seconds = ctx
            .payload()
            .get("seconds")
            .and_then(|s| s.as_f64())
            .context("sleep job requires a numeric 'seconds' field")?;
        if !seconds.is_finite() || seconds < 0.0 {
            anyhow::bail!("sleep duration must be a non-negative number, got {seconds}");
        }

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs_f64(seconds)) => Ok(()),
            _ = ctx.cancel.cancelled() => anyhow::bail!("sleep cancelled"),
        }
    }
}
