use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use debridcache::config::Config;
use debridcache::core::Core;

/// Minimal process entry point wiring the coordinator core together (spec.md §1
/// "Out of scope (external collaborators)": the settings UI, WebDAV server, and
/// rclone mount process are peripheral and not part of this crate — in a full
/// deployment they'd sit in front of a shared `Core`, the way the teacher's
/// `main.rs` wires `DebridFileSystem` in front of `RealDebridClient`). This binary
/// just boots the core, starts its background tasks, and serves `Stats` on a
/// timer until told to shut down.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = Config::from_env()?;
    tracing::debug!(store_path = %config.store_path, "configuration loaded");

    let mut core = Core::new(config.clone())?;
    core.load_from_store().await?;

    let mount_pending = Arc::new(RwLock::new(true));
    let mount_flag = mount_pending.clone();
    core.start_scheduler(&config, "https://api.example-debrid.com/rest/1.0".to_string(), move || {
        let mount_flag = mount_flag.clone();
        tokio::spawn(async move {
            *mount_flag.write().await = false;
            info!("catalog is non-empty: mount trigger fired (external mount process would start here)");
        });
    });

    let core = Arc::new(core);
    let stats_core = core.clone();
    let stats_task = tokio::spawn(async move {
        loop {
            tokio::time::sleep(std::time::Duration::from_secs(60)).await;
            let stats = stats_core.stats();
            info!(
                total = stats.catalog.total_count,
                bytes = stats.catalog.total_bytes,
                expired_tokens = stats.expired_tokens,
                repair_pending = stats.repair_queue.pending.len(),
                "periodic stats"
            );
        }
    });

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutdown signal received"),
        Err(e) => warn!(error = %e, "failed to listen for shutdown signal"),
    }
    stats_task.abort();

    match Arc::try_unwrap(core) {
        Ok(core) => core.shutdown().await,
        Err(_) => warn!("core still has outstanding references at shutdown, skipping graceful drain"),
    }

    Ok(())
}
