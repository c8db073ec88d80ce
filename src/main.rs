use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use match_coordinator::clock::{Clock, SystemClock};
use match_coordinator::config::{CliArgs, CoordinatorConfig};
use match_coordinator::dead_letter::{DeadLetterSink, SpoolDeadLetterSink};
use match_coordinator::ledger::LocalLedger;
use match_coordinator::queue::LocalWorkQueue;
use match_coordinator::server::{ApiToken, AppState, build_router};
use match_coordinator::store::AirtableStore;
use match_coordinator::verifier::Verifier;
use match_coordinator::worker::{Fulfiller, run_ledger_sweeper, spawn_workers};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env file is normal in deployment.
    let _ = dotenvy::dotenv();

    let args = CliArgs::try_parse()?;
    let config = CoordinatorConfig::try_from(args)?;

    init_tracing(config.log_json);
    info!(?config, "Starting match coordinator");

    run(config).await
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "match_coordinator=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

async fn run(config: CoordinatorConfig) -> anyhow::Result<()> {
    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("creating state dir {}", config.state_dir.display()))?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let dead_letters: Arc<dyn DeadLetterSink> =
        Arc::new(SpoolDeadLetterSink::new(&config.state_dir));

    let ledger = Arc::new(LocalLedger::open(config.ledger_path()).context("opening ledger")?);
    let queue = Arc::new(
        LocalWorkQueue::open(
            config.queue_path(),
            config.queue(),
            clock.clone(),
            dead_letters.clone(),
        )
        .context("opening work queue")?,
    );
    let store =
        Arc::new(AirtableStore::new(config.airtable.clone()).context("building store client")?);

    let verifier = Arc::new(Verifier::new(
        ledger.clone(),
        queue.clone(),
        clock.clone(),
        config.verifier(),
    ));
    let fulfiller = Arc::new(Fulfiller::new(
        ledger.clone(),
        store,
        dead_letters.clone(),
        clock.clone(),
        config.fulfiller(),
    ));

    let shutdown = CancellationToken::new();
    let mut tasks = spawn_workers(
        config.workers,
        queue.clone(),
        fulfiller,
        config.poll(),
        config.dependency_timeout,
        shutdown.clone(),
    );
    tasks.push(tokio::spawn(run_ledger_sweeper(
        ledger,
        clock,
        config.purge_interval,
        shutdown.clone(),
    )));

    let state = AppState::new(
        verifier,
        queue,
        dead_letters,
        ApiToken::new(config.api_token.clone()),
    );
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("binding {}", config.listen_addr))?;
    info!(addr = %config.listen_addr, workers = config.workers, "Listening");

    let serve_shutdown = shutdown.clone();
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            serve_shutdown.cancel();
        })
        .await;

    // The server may also stop on its own error; make sure workers follow.
    shutdown.cancel();
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "Background task panicked");
        }
    }

    served.context("HTTP server failed")?;
    info!("Shut down cleanly");
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C signal"),
        () = terminate => info!("Received SIGTERM signal"),
    }
}
