use jobkeeper::{QueueConfig, QueueManager};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = QueueConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {e}");
        eprintln!("  export JOBKEEPER_ENCRYPTION_KEY=...");
        std::process::exit(1);
    });

    eprintln!("⚙️  jobkeeper v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Database: {}", config.db_path.display());
    eprintln!("   Queue: {} ({} workers)", config.queue, config.workers);
    eprintln!(
        "   Scheduler: every {}s",
        config.check_interval.as_secs()
    );

    // ── Queue ───────────────────────────────────────────────────────────
    let manager = QueueManager::open(&config).await.unwrap_or_else(|e| {
        eprintln!(
            "Error: Failed to open job store at {}: {}",
            config.db_path.display(),
            e
        );
        std::process::exit(1);
    });

    let handlers = manager.handlers().list().await;
    tracing::info!(handlers = ?handlers, "Job handlers registered");

    manager
        .spawn_workers(&config.queue, config.workers, config.worker_options())
        .await;
    manager.spawn_scheduler().await;

    // ── Run until Ctrl-C or every worker slot has ended ─────────────────
    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result?;
            tracing::info!("Shutdown requested");
        }
        _ = manager.wait_for_workers() => {
            tracing::warn!("All workers exited");
        }
    }

    let exits = manager.shutdown().await;
    tracing::info!(exits = ?exits, "Shutdown complete");
    Ok(())
}
