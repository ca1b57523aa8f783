use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use clap::Parser;
use dotenvy::dotenv;
use tokio::time::{sleep, Duration};
use tracing::{error, info, warn};

use cc_common::db::{
    claim_next, cleanup, create_pool_from_url_checked, release_stuck, run_migrations,
};
use cc_common::logging::{init_tracing_subscriber, install_tracing_panic_hook};
use cc_metrics::init_metrics;

mod blob;
mod extract;
mod llm;
mod pipeline;

use extract::ExtractorConfig;
use llm::LlmConfig;
use pipeline::WorkerContext;

const STUCK_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(600);

#[derive(Debug, Parser)]
#[command(name = "cc-worker", about = "Process queued chart coding jobs")]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    db_url: String,

    /// Lease identity recorded on claimed jobs (default: worker-<host>-<pid>)
    #[arg(long)]
    worker_id: Option<String>,

    /// Idle poll interval in milliseconds
    #[arg(long, default_value_t = 2000)]
    poll_interval_ms: u64,

    /// Leases older than this are force-released at startup
    #[arg(long, default_value_t = 30)]
    stuck_minutes: i64,

    /// Retention window for completed jobs; 0 skips the startup sweep
    #[arg(long, default_value_t = 7)]
    cleanup_days: i64,

    /// Optional cap on how many jobs to process in one run
    #[arg(long)]
    max_jobs: Option<usize>,

    /// Exit when the queue is empty instead of polling
    #[arg(long, default_value_t = false)]
    exit_on_empty: bool,
}

fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "local".into());
    format!("worker-{host}-{}", std::process::id())
}

fn spawn_shutdown_flag() -> Arc<AtomicBool> {
    let flag = Arc::new(AtomicBool::new(false));
    let handle = flag.clone();

    tokio::spawn(async move {
        let ctrl_c = async {
            let _ = tokio::signal::ctrl_c().await;
        };

        #[cfg(unix)]
        let terminate = async {
            use tokio::signal::unix::{signal, SignalKind};
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                let _ = sigterm.recv().await;
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("termination signal received; draining current job");
        handle.store(true, Ordering::SeqCst);
    });

    flag
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_tracing_subscriber("cc-worker");
    install_tracing_panic_hook("cc-worker");
    init_metrics("cc-worker", "CC_WORKER_METRICS_PORT", 9897);

    let args = Cli::parse();
    let worker_id = args.worker_id.clone().unwrap_or_else(default_worker_id);
    let llm = LlmConfig::from_env()?;
    let extractor = ExtractorConfig::from_env();

    let pool = create_pool_from_url_checked(&args.db_url).await?;
    run_migrations(&pool).await?;

    let released = release_stuck(&pool, args.stuck_minutes).await?;
    if released > 0 {
        warn!(released, "released stuck leases at startup");
    }
    if args.cleanup_days > 0 {
        let purged = cleanup(&pool, args.cleanup_days).await?;
        if purged > 0 {
            info!(purged, "purged aged completed jobs");
        }
    }

    let status = pool.status();
    info!(
        size = status.size,
        available = status.available,
        worker_id = %worker_id,
        llm_model = %llm.model,
        ocr_url = %extractor.ocr_url,
        "worker ready"
    );

    let http = reqwest::Client::builder().build()?;
    let ctx = WorkerContext {
        pool,
        http,
        extractor,
        llm,
        worker_id: worker_id.clone(),
    };

    let shutdown = spawn_shutdown_flag();
    let max_jobs = args.max_jobs.unwrap_or(usize::MAX);
    let mut processed = 0usize;
    let mut last_sweep = std::time::Instant::now();

    while processed < max_jobs && !shutdown.load(Ordering::SeqCst) {
        if last_sweep.elapsed() >= STUCK_SWEEP_INTERVAL {
            last_sweep = std::time::Instant::now();
            match release_stuck(&ctx.pool, args.stuck_minutes).await {
                Ok(0) => {}
                Ok(released) => warn!(released, "released stuck leases"),
                Err(err) => warn!(error = %err, "periodic stuck sweep failed"),
            }
        }

        let job = match claim_next(&ctx.pool, &worker_id, Utc::now()).await {
            Ok(job) => job,
            Err(err) => {
                // Fail fast and pause; the queue has no in-process retry.
                error!(error = %err, "claim failed");
                sleep(Duration::from_millis(args.poll_interval_ms)).await;
                continue;
            }
        };

        let Some(job) = job else {
            if args.exit_on_empty {
                if processed == 0 {
                    info!("no claimable jobs; exiting");
                }
                break;
            }
            sleep(Duration::from_millis(args.poll_interval_ms)).await;
            continue;
        };

        metrics::counter!("worker_jobs_claimed_total").increment(1);
        pipeline::process_job(&ctx, &job).await;
        processed += 1;
    }

    info!(processed, "worker loop finished");
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(error = %err, "cc-worker failed");
        std::process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_id_is_host_and_pid_scoped() {
        let id = default_worker_id();
        assert!(id.starts_with("worker-"));
        assert!(id.ends_with(&std::process::id().to_string()));
    }
}
