//! labfleet orchestrator
//!
//! Serves the deployment API and runs the provisioning and redispatch
//! workers in-process.

use std::sync::Arc;

use anyhow::Result;
use labfleet_orchestrator::{
    api, config,
    db::Database,
    dispatch::{ChannelQueue, MockProvisioner, ProvisioningWorker, RedispatchWorker, RetryPolicy},
    lifecycle::LifecycleManager,
    orchestrator::Orchestrator,
    resolver::CourseDirectory,
    state::AppState,
    store::{DeploymentStore, InMemoryDirectory, InMemoryStore},
    usage::{MemoryUsageStore, RedisUsageStore, UsageCache, UsageStore},
};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    let config = config::Config::from_env()?;

    // Prefer RUST_LOG, fall back to LABFLEET_LOG_LEVEL.
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.clone().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting labfleet orchestrator");
    info!(listen_addr = %config.listen_addr, "Configuration loaded");

    let db = match &config.database {
        Some(db_config) => {
            let db = match Database::connect(db_config).await {
                Ok(db) => db,
                Err(e) => {
                    error!(error = %e, "Failed to connect to database");
                    return Err(e.into());
                }
            };
            if config.dev_mode {
                info!("Running database migrations (dev mode)");
                if let Err(e) = db.run_migrations().await {
                    error!(error = %e, "Failed to run migrations");
                    return Err(e.into());
                }
            }
            Some(db)
        }
        None => {
            warn!("DATABASE_URL not set; using the in-memory store");
            None
        }
    };

    let (store, directory): (Arc<dyn DeploymentStore>, Arc<dyn CourseDirectory>) = match &db {
        Some(db) => (
            Arc::new(db.deployment_store()),
            Arc::new(db.course_directory()),
        ),
        None => {
            let directory = InMemoryDirectory::new();
            let demo = config.demo_roster;
            if demo.is_empty() {
                warn!(
                    "In-memory course directory is empty; every deployment request will fail \
                     with course_not_found. Set LABFLEET_DEMO_GROUPS / LABFLEET_DEMO_MEMBERS \
                     to seed a demo course"
                );
            } else {
                let course_id = directory.seed_course(demo.groups, demo.members).await;
                info!(
                    %course_id,
                    groups = demo.groups,
                    members = demo.members,
                    "Seeded demo course"
                );
            }
            (Arc::new(InMemoryStore::new()), Arc::new(directory))
        }
    };

    let usage_backend: Arc<dyn UsageStore> = match &config.redis_url {
        Some(url) => Arc::new(RedisUsageStore::connect(url).await?),
        None => {
            info!("REDIS_URL not set; using the in-process usage cache");
            Arc::new(MemoryUsageStore::new())
        }
    };
    let usage = UsageCache::new(usage_backend, config.usage_ttl);

    let (queue, jobs) = ChannelQueue::new(config.dispatch.queue_capacity);
    let lifecycle = LifecycleManager::new(Arc::clone(&store), Arc::new(queue))
        .with_lease(config.dispatch.delivery_lease);
    let retry = RetryPolicy::new(config.dispatch.max_attempts, config.dispatch.backoff_base);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // No real provider is wired in yet; the mock completes every job.
    let worker = Arc::new(
        ProvisioningWorker::new(
            lifecycle.clone(),
            Arc::new(MockProvisioner::new()),
            usage.clone(),
            config.dispatch.worker_concurrency,
        )
        .with_retry(retry.clone()),
    );
    let worker_handle = tokio::spawn(worker.run(jobs, shutdown_rx.clone()));

    let redispatch = RedispatchWorker::new(
        lifecycle.clone(),
        retry.clone(),
        config.dispatch.redispatch_interval,
    )
    .with_max_redeliveries(config.dispatch.max_redeliveries);
    let redispatch_handle = tokio::spawn({
        let shutdown_rx = shutdown_rx.clone();
        async move {
            redispatch.run(shutdown_rx).await;
        }
    });

    let orchestrator = Arc::new(Orchestrator::new(lifecycle, directory, usage, retry));
    let app = api::create_router(AppState::new(orchestrator, db));

    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    info!(addr = %config.listen_addr, "Listening for connections");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut shutdown_rx = shutdown_rx;
                loop {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                    if shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
                info!("HTTP server shutting down");
            })
            .await
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal");
        }
        result = server_handle => {
            match result {
                Ok(Ok(())) => info!("Server exited normally"),
                Ok(Err(e)) => error!(error = %e, "Server error"),
                Err(e) => error!(error = %e, "Server task panicked"),
            }
        }
    }

    let _ = shutdown_tx.send(true);

    info!("Waiting for workers to shut down...");
    let shutdown_timeout = std::time::Duration::from_secs(10);

    if let Err(e) = tokio::time::timeout(shutdown_timeout, worker_handle).await {
        warn!(error = %e, "Provisioning worker did not shut down in time");
    }

    if let Err(e) = tokio::time::timeout(shutdown_timeout, redispatch_handle).await {
        warn!(error = %e, "Redispatch worker did not shut down in time");
    }

    info!("Orchestrator shutdown complete");
    Ok(())
}
