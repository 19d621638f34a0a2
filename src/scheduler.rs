use std::time::Duration;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info};

use crate::storage::TempStorage;

/// Sweeps stale temp files once now, then on `cron`. The returned
/// scheduler must be kept alive for the job to keep running.
pub async fn start_janitor(storage: TempStorage, cron: &str, max_age: Duration) -> anyhow::Result<JobScheduler> {
    sweep(&storage, max_age).await;

    let sched = JobScheduler::new().await?;
    sched
        .add(Job::new_async(cron, move |_uuid, _l| {
            let storage = storage.clone();
            Box::pin(async move {
                sweep(&storage, max_age).await;
            })
        })?)
        .await?;

    sched.start().await?;
    info!("Temp janitor scheduled ({})", cron);
    Ok(sched)
}

async fn sweep(storage: &TempStorage, max_age: Duration) {
    match storage.sweep_older_than(max_age).await {
        Ok(0) => {}
        Ok(n) => info!("Janitor removed {} stale temp files from {}", n, storage.dir().display()),
        Err(e) => error!("Janitor sweep failed: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn startup_sweep_runs_before_scheduling() {
        let dir = tempdir().unwrap();
        let stale = dir.path().join("merged_old.mp4");
        tokio::fs::write(&stale, b"x").await.unwrap();

        let mut sched = start_janitor(TempStorage::new(dir.path()), "0 0 0 1 1 *", Duration::ZERO)
            .await
            .unwrap();
        assert!(!stale.exists());
        sched.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn invalid_cron_is_an_error() {
        let dir = tempdir().unwrap();
        assert!(start_janitor(TempStorage::new(dir.path()), "not a cron", Duration::ZERO).await.is_err());
    }
}
