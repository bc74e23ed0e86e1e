use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use workerpool_core::chain::{LocalSigner, MemoryChain};
use workerpool_core::config::SchedulerConfig;
use workerpool_core::detector::{
    self, Detector, FinalDeadlineTaskDetector, FinalizedTaskDetector, InitializedTaskDetector,
    UnstartedTxDetector,
};
use workerpool_core::lock::TaskLocks;
use workerpool_core::replicate::{ReplicateRecovery, ReplicateSupply};
use workerpool_core::store::MemoryStore;
use workerpool_core::task::{TaskUpdateRequestManager, TaskUpdater};
use workerpool_core::worker::MemoryWorkerRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = SchedulerConfig::from_env().context("invalid scheduler configuration")?;
    let signing_key = std::env::var("WORKERPOOL_SIGNING_KEY")
        .unwrap_or_else(|_| "workerpool-dev-key".to_string());

    eprintln!("Workerpool core v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Update routines: {}", config.update_pool_size);
    eprintln!(
        "   Detectors: every {}s",
        config.detector_interval.as_secs()
    );

    // ── Collaborators ────────────────────────────────────────────────────
    let store = Arc::new(MemoryStore::new());
    let chain = Arc::new(MemoryChain::new());
    let workers = Arc::new(MemoryWorkerRegistry::new());
    let signer = Arc::new(LocalSigner::new(signing_key));
    let locks = Arc::new(TaskLocks::new(config.longest_task_timeout));
    let cancel = CancellationToken::new();

    // ── Task update dispatch ─────────────────────────────────────────────
    let manager = TaskUpdateRequestManager::new(
        store.clone(),
        Arc::clone(&locks),
        &config,
        cancel.clone(),
    );
    let updater = TaskUpdater::new(
        store.clone(),
        store.clone(),
        workers.clone(),
        chain.clone(),
        manager.clone(),
    );
    manager.set_request_consumer(Arc::new(updater));
    let driver = manager.spawn(config.consume_interval, config.lock_sweep_interval);

    // ── Worker-facing services ───────────────────────────────────────────
    // No transport is exposed here; an embedding API owns these.
    let _supply = ReplicateSupply::new(
        store.clone(),
        store.clone(),
        workers.clone(),
        chain.clone(),
        signer.clone(),
        Arc::clone(&locks),
        &config,
    );
    let _recovery = ReplicateRecovery::new(
        store.clone(),
        store.clone(),
        workers,
        chain.clone(),
        chain.clone(),
        signer,
        manager.clone(),
    );

    // ── Detectors ────────────────────────────────────────────────────────
    let detectors: Vec<Arc<dyn Detector>> = vec![
        Arc::new(InitializedTaskDetector::new(
            store.clone(),
            chain.clone(),
            manager.clone(),
        )),
        Arc::new(FinalizedTaskDetector::new(
            store.clone(),
            chain,
            manager.clone(),
        )),
        Arc::new(UnstartedTxDetector::new(store.clone(), manager.clone())),
        Arc::new(FinalDeadlineTaskDetector::new(store, manager.clone())),
    ];
    let detector_handles: Vec<_> = detectors
        .into_iter()
        .map(|d| detector::spawn_detector(d, config.detector_interval, cancel.clone()))
        .collect();

    tracing::info!("Workerpool core started");
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;

    tracing::info!("Shutting down");
    manager.shutdown();
    driver.await.ok();
    for handle in detector_handles {
        handle.await.ok();
    }
    Ok(())
}
