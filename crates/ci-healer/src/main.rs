//! CLI entry point: heals a repository's CI failures against a single
//! branch and writes the result artifact (spec §2, §6).

use clap::Parser;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "ci-healer", about = "Autonomous CI-failure healing pipeline")]
struct Cli {
    /// Repository URL to clone (https or local path).
    repo_url: String,

    /// Branch name to create for the healed commits.
    #[arg(long, default_value = "ci-healer/auto-fix")]
    branch: String,

    /// Explicit run id; a UUID is generated when omitted.
    #[arg(long)]
    run_id: Option<String>,

    /// Directory to write log files into, in addition to stderr.
    #[arg(long, default_value = "./logs")]
    log_dir: std::path::PathBuf,
}

/// Holds the non-blocking file appender's flush guard for the process lifetime.
struct LogGuard {
    _guard: WorkerGuard,
}

fn init_logging(log_dir: &std::path::Path) -> anyhow::Result<LogGuard> {
    std::fs::create_dir_all(log_dir)?;
    let file_appender = tracing_appender::rolling::daily(log_dir, "ci-healer.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .json()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_writer(non_blocking);

    let stderr_layer = fmt::layer()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_ansi(true);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,ci_healer=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(file_layer)
        .with(stderr_layer)
        .init();

    Ok(LogGuard { _guard: guard })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _log_guard = init_logging(&cli.log_dir)?;

    let run_id = cli.run_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    tracing::info!(run_id = %run_id, repo_url = %cli.repo_url, branch = %cli.branch, "starting healing run");

    let state = ci_healer::run_healing(&cli.repo_url, &cli.branch, &run_id).await?;

    tracing::info!(
        run_id = %run_id,
        ci_status = %state.ci_status,
        score = state.scoring.total_score,
        "healing run complete"
    );

    println!("{}", serde_json::to_string_pretty(&state)?);
    Ok(())
}
