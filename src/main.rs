use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use outreach_worker::config::Config;
use outreach_worker::routes::{self, HealthState};
use outreach_worker::services::{HealthJob, Job, JobOptions, JobScheduler};
use outreach_worker::{telemetry, AppContext};

#[derive(Parser)]
#[command(name = "outreach-worker", version, about = "Background jobs for the outreach platform")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the recurring jobs and the status endpoint until SIGINT/SIGTERM
    Serve,
    /// Zero every daily send counter whose period has rolled over
    ResetQuotas,
    /// Replay historical sent mail into the conversation store
    Backfill {
        /// Limit the replay to one organization
        #[arg(long)]
        org: Option<String>,
        #[arg(long, default_value_t = 500)]
        batch_size: i64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            return ExitCode::FAILURE;
        }
    };
    if let Err(e) = telemetry::init_tracing(config.log_format) {
        eprintln!("{e:#}");
        return ExitCode::FAILURE;
    }

    match run(cli.command.unwrap_or(Command::Serve), config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "worker failed");
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, config: Config) -> Result<ExitCode> {
    let ctx = AppContext::init(config).await?;
    let shutdown = CancellationToken::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    match command {
        Command::Serve => serve(ctx, shutdown).await,
        Command::ResetQuotas => {
            let job = ctx.quota_reset_job();
            Ok(run_one_shot(&job, shutdown).await)
        }
        Command::Backfill { org, batch_size } => {
            let job = ctx.backfill_job(org, batch_size);
            Ok(run_one_shot(&job, shutdown).await)
        }
    }
}

async fn run_one_shot(job: &dyn Job, shutdown: CancellationToken) -> ExitCode {
    let scheduler = JobScheduler::new(shutdown);
    match scheduler.run_once(job).await {
        Ok(()) => {
            tracing::info!(job = %job.name(), "one-shot job succeeded");
            ExitCode::SUCCESS
        }
        Err(e) => {
            tracing::error!(job = %job.name(), error = %format!("{e:#}"), "one-shot job failed");
            ExitCode::FAILURE
        }
    }
}

async fn serve(ctx: AppContext, shutdown: CancellationToken) -> Result<ExitCode> {
    let cfg = ctx.config.clone();
    let scheduler = Arc::new(JobScheduler::new(shutdown.clone()));

    scheduler.schedule(
        Arc::new(ctx.bounce_scanner()),
        cfg.scan_interval,
        JobOptions::delayed(cfg.scan_initial_delay),
    );
    scheduler.schedule(
        Arc::new(HealthJob::new(
            ctx.health.clone(),
            Arc::downgrade(&scheduler),
            cfg.stale_after,
        )),
        cfg.health_interval,
        JobOptions::default(),
    );
    // Let the app start up comfortably before the first maintenance pass
    scheduler.schedule(
        Arc::new(ctx.maintenance_job()),
        cfg.maintenance_interval,
        JobOptions::delayed(Duration::from_secs(60)),
    );
    if !cfg.quota_reset_interval.is_zero() {
        scheduler.schedule(
            Arc::new(ctx.quota_reset_job()),
            cfg.quota_reset_interval,
            JobOptions::default(),
        );
    }

    let app = routes::router(HealthState {
        monitor: ctx.health.clone(),
        scheduler: scheduler.clone(),
    });
    let addr = std::net::SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    tracing::info!("listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
        .await?;

    let drained = scheduler.shutdown(cfg.shutdown_timeout).await;
    Ok(if drained {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

async fn shutdown_signal() {
    use tokio::signal;
    let ctrl_c = async {
        signal::ctrl_c().await.ok();
    };
    #[cfg(unix)]
    let term = async {
        if let Ok(mut s) = signal::unix::signal(signal::unix::SignalKind::terminate()) {
            s.recv().await;
        }
    };
    #[cfg(not(unix))]
    let term = std::future::pending::<()>();
    tokio::select! { _ = ctrl_c => {}, _ = term => {} }
}
