use std::sync::Arc;

use convoflow::admin::{self, AdminState};
use convoflow::classifier::{OllamaClassifier, OllamaConfig};
use convoflow::config::Config;
use convoflow::db;
use convoflow::logging;
use convoflow::pipeline::{Orchestrator, RunOutcome};
use convoflow::store::PgConversationStore;
use tokio::signal;
use tokio_util::sync::CancellationToken;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env()?;
    logging::init(cfg.log_format);

    let admin_addr = cfg.admin_addr.clone();
    tracing::info!(
        mode = cfg.pipeline.mode.as_str(),
        batch_size = cfg.pipeline.batch_size,
        max_concurrent = cfg.pipeline.max_concurrent,
        retry_ceiling = cfg.pipeline.retry_ceiling,
        pool_size = cfg.pool_size(),
        model = %cfg.ollama_model,
        admin = admin_addr.as_deref().unwrap_or("disabled"),
        migrate_on_startup = cfg.migrate_on_startup,
        "convoflow worker starting"
    );

    let pool = db::make_pool(&cfg.database_url, cfg.pool_size()).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let store = Arc::new(PgConversationStore::new(pool));
    let classifier = Arc::new(OllamaClassifier::new(OllamaConfig {
        timeout: cfg.pipeline.classify_timeout,
        ..OllamaConfig::new(cfg.ollama_endpoint.clone(), cfg.ollama_model.clone())
    })?);

    let orchestrator = Orchestrator::new(cfg.pipeline.clone(), store, classifier).await?;

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("stop requested; finishing in-flight items");
            cancel.cancel();
        });
    }

    // ---- admin task ----
    // never raced against the run: a failing admin server cancels the token
    // and the run winds down like it does on a signal
    let admin_handle = admin_addr.map(|addr| {
        let state = AdminState {
            batch_dir: cfg.pipeline.batch_dir.clone(),
        };
        let cancel = cancel.clone();
        tokio::spawn(async move { admin::serve(&addr, state, cancel).await })
    });

    let summary = orchestrator.run(cancel.clone()).await?;
    println!("{}", serde_json::to_string_pretty(&summary)?);

    cancel.cancel();
    if let Some(handle) = admin_handle {
        if let Err(e) = handle.await? {
            anyhow::bail!("admin server failed: {e}");
        }
    }

    match summary.outcome {
        RunOutcome::Completed | RunOutcome::Stopped => Ok(()),
        RunOutcome::Aborted(reason) => anyhow::bail!("run aborted: {reason}"),
        RunOutcome::Fatal(reason) => anyhow::bail!("run halted: {reason}"),
    }
}

/// Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
