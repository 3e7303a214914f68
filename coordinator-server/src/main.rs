use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tonic::transport::Server;
use tracing_subscriber::EnvFilter;

use coordinator_core::blob_store::LocalBlobStore;
use coordinator_core::clock::SystemClock;
use coordinator_core::config::CoordinatorConfig;
use coordinator_core::cron::CeremonyCron;
use coordinator_core::engine::CeremonyEngine;
use coordinator_core::refresh::RefreshHandler;
use coordinator_core::scheduler::Scheduler;
use coordinator_core::store_memory::MemoryStore;
use coordinator_core::sweeper::TimeoutSweeper;
use coordinator_core::verifier::Verifier;
use coordinator_core::vm_executor::DisabledVmExecutor;
use coordinator_core::zkey::CliZkeyVerifier;
use coordinator_server::grpc::proto::coordinator_server::CoordinatorServer;
use coordinator_server::grpc::CoordinatorService;

const SWEEP_INTERVAL: Duration = Duration::from_secs(60);
const CRON_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let config = CoordinatorConfig::from_env()?;
    let addr = std::env::var("GRPC_LISTEN_ADDR")
        .unwrap_or_else(|_| "0.0.0.0:50051".to_string())
        .parse()?;
    let blob_root = std::env::var("BLOB_ROOT").unwrap_or_else(|_| "./blob-data".to_string());
    let verifier_program =
        std::env::var("VERIFIER_PROGRAM").unwrap_or_else(|_| "snarkjs".to_string());

    let clock = Arc::new(SystemClock);
    let store = Arc::new(MemoryStore::new(clock.clone()));
    tokio::fs::create_dir_all(&blob_root).await?;
    let blob = Arc::new(LocalBlobStore::new(&blob_root));

    let verifier = Arc::new(Verifier::new(
        store.clone(),
        blob.clone(),
        Arc::new(DisabledVmExecutor),
        Arc::new(CliZkeyVerifier::new(&verifier_program)),
        clock.clone(),
        config.clone(),
    ));
    let engine = Arc::new(CeremonyEngine::new(
        store.clone(),
        blob.clone(),
        verifier,
        clock.clone(),
        config.clone(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler = Scheduler::new(store.clone(), clock.clone());
    let refresh = RefreshHandler::new(store.clone());
    let sweeper = TimeoutSweeper::new(store.clone(), clock.clone());
    let cron = CeremonyCron::new(store.clone(), clock.clone());

    let mut tasks = Vec::new();
    {
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { scheduler.run(rx).await }));
    }
    {
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { refresh.run(rx).await }));
    }
    {
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(
            async move { sweeper.run(rx, SWEEP_INTERVAL).await },
        ));
    }
    {
        let rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move { cron.run(rx, CRON_INTERVAL).await }));
    }

    let service = CoordinatorService {
        engine: engine.clone(),
        config,
    };

    tracing::info!("ceremony coordinator listening on {}", addr);

    Server::builder()
        .add_service(CoordinatorServer::new(service))
        .serve_with_shutdown(addr, async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received");
        })
        .await?;

    let _ = shutdown_tx.send(true);
    for task in tasks {
        let _ = task.await;
    }
    Ok(())
}
