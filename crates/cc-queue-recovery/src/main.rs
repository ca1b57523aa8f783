use clap::Parser;
use dotenvy::dotenv;
use tracing::{info, warn};

use cc_common::db::{cleanup, create_pool_from_url_checked, get_stats, release_stuck};
use cc_common::logging::{init_tracing_subscriber, install_tracing_panic_hook};

#[derive(Debug, Parser)]
#[command(
    name = "cc-queue-recovery",
    about = "Release stuck queue leases and purge aged completed jobs"
)]
struct Cli {
    /// PostgreSQL connection string
    #[arg(long, env = "DATABASE_URL")]
    db_url: String,

    /// Leases older than this many minutes are force-released
    #[arg(long, default_value_t = 30)]
    stuck_minutes: i64,

    /// Completed jobs older than this many days are deleted; 0 disables
    #[arg(long, default_value_t = 7)]
    cleanup_days: i64,

    /// Report what would be done without writing anything
    #[arg(long, default_value_t = false)]
    dry_run: bool,
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    init_tracing_subscriber("cc-queue-recovery");
    install_tracing_panic_hook("cc-queue-recovery");

    let args = Cli::parse();
    let pool = create_pool_from_url_checked(&args.db_url).await?;

    let stats = get_stats(&pool).await?;
    info!(
        pending = stats.pending,
        processing = stats.processing,
        failed = stats.failed,
        permanently_failed = stats.permanently_failed,
        waiting_for_retry = stats.waiting_for_retry,
        stale_processing = stats.stale_processing,
        "queue state before recovery"
    );

    if args.dry_run {
        info!(
            stale_processing = stats.stale_processing,
            "dry run: would release stale leases and purge aged completed jobs"
        );
        return Ok(());
    }

    let released = release_stuck(&pool, args.stuck_minutes).await?;
    if released > 0 {
        warn!(released, stuck_minutes = args.stuck_minutes, "released stuck leases");
    } else {
        info!("no stuck leases found");
    }

    if args.cleanup_days > 0 {
        let purged = cleanup(&pool, args.cleanup_days).await?;
        info!(purged, cleanup_days = args.cleanup_days, "purged aged completed jobs");
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        tracing::error!(error = %err, "cc-queue-recovery failed");
        std::process::exit(1);
    }
}
