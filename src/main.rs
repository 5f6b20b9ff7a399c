use anyhow::{Context, Result};
use artemis::engine_config::EngineConfig;
use artemis::orchestrator::{Orchestrator, RunReport};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

/// Exit code for a pipeline that reached a failed terminal state.
const EXIT_FAILED: u8 = 1;
/// Exit code for configuration/validation errors before any stage ran.
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(name = "artemis")]
#[command(version, about = "Autonomous pipeline engine for kanban cards")]
struct Cli {
    #[arg(long, global = true)]
    project_dir: Option<PathBuf>,

    /// Path to artemis.toml (defaults to <project_dir>/artemis.toml).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the pipeline for a card (resumes automatically when a
    /// resumable checkpoint exists).
    Run {
        card_id: String,

        /// Completion provider: http or scripted.
        #[arg(long)]
        provider: Option<String>,

        #[arg(long)]
        model: Option<String>,

        #[arg(long)]
        board: Option<PathBuf>,

        #[arg(long)]
        daily_limit: Option<f64>,

        #[arg(long)]
        monthly_limit: Option<f64>,

        /// Per-stage timeout override, repeatable: --timeout development=900
        #[arg(long = "timeout", value_name = "STAGE=SECONDS")]
        timeouts: Vec<String>,

        /// Disable retries and circuit breakers (single attempt per stage).
        #[arg(long)]
        no_supervision: bool,
    },
    /// Resume an interrupted card; fails if there is nothing to resume.
    Resume { card_id: String },
    /// Show checkpoint progress for a card.
    Status { card_id: String },
    /// Re-print the last run report for a card.
    Report { card_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    // Provider keys come from the environment; .env is a convenience.
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let project_dir = match &cli.project_dir {
        Some(dir) => dir.clone(),
        None => match std::env::current_dir() {
            Ok(dir) => dir,
            Err(e) => {
                eprintln!("artemis: cannot determine working directory: {e}");
                return ExitCode::from(EXIT_CONFIG);
            }
        },
    };

    let _log_guard = init_tracing(&project_dir, cli.verbose);

    match run_command(&cli, &project_dir).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("artemis: {e:#}");
            ExitCode::from(EXIT_CONFIG)
        }
    }
}

async fn run_command(cli: &Cli, project_dir: &std::path::Path) -> Result<ExitCode> {
    let mut config = EngineConfig::load(project_dir, cli.config.as_deref())?;

    match &cli.command {
        Commands::Run {
            card_id,
            provider,
            model,
            board,
            daily_limit,
            monthly_limit,
            timeouts,
            no_supervision,
        } => {
            if let Some(provider) = provider {
                config.provider = provider.parse().map_err(anyhow::Error::msg)?;
            }
            if let Some(model) = model {
                config.model = model.clone();
            }
            if let Some(board) = board {
                config.board_file = project_dir.join(board);
            }
            if let Some(daily) = daily_limit {
                config.daily_limit = *daily;
            }
            if let Some(monthly) = monthly_limit {
                config.monthly_limit = *monthly;
            }
            for spec in timeouts {
                let (stage, seconds) = parse_timeout_override(spec)?;
                config.stage_timeouts.insert(stage, seconds);
            }
            if *no_supervision {
                config.supervision = false;
            }
            config.validate()?;

            let orchestrator = Orchestrator::new(config)?;
            let report = orchestrator.run_card(card_id).await?;
            print!("{}", report.render());
            Ok(exit_for(&report))
        }
        Commands::Resume { card_id } => {
            config.validate()?;
            let orchestrator = Orchestrator::new(config)?;
            if !orchestrator.checkpoints().can_resume(card_id) {
                anyhow::bail!("no resumable checkpoint for card {card_id}");
            }
            let report = orchestrator.run_card(card_id).await?;
            print!("{}", report.render());
            Ok(exit_for(&report))
        }
        Commands::Status { card_id } => {
            let orchestrator = Orchestrator::new(config)?;
            let checkpoint = orchestrator.checkpoints().load(card_id)?;
            println!(
                "card {card_id}: {} ({}/{} stages, resumed {} times)",
                checkpoint.status.as_str(),
                checkpoint.stages_completed,
                checkpoint.total_stages,
                checkpoint.resume_count,
            );
            if let Some(current) = checkpoint.current_stage {
                println!("current stage: {current}");
            }
            for stage in checkpoint.settled_stages() {
                if let Some(record) = checkpoint.stage_checkpoints.get(stage.as_str()) {
                    println!(
                        "  {:<14} {:<9} {:.2}s",
                        stage.as_str(),
                        record.status.as_str(),
                        record.duration_seconds
                    );
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Report { card_id } => {
            let orchestrator = Orchestrator::new(config)?;
            let path = orchestrator.report_path(card_id);
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("no report at {}", path.display()))?;
            let report: RunReport =
                serde_json::from_str(&content).context("report file is malformed")?;
            print!("{}", report.render());
            Ok(exit_for(&report))
        }
    }
}

fn exit_for(report: &RunReport) -> ExitCode {
    if report.completed() {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(EXIT_FAILED)
    }
}

fn parse_timeout_override(spec: &str) -> Result<(String, u64)> {
    let (stage, seconds) = spec
        .split_once('=')
        .ok_or_else(|| anyhow::anyhow!("invalid timeout override '{spec}' (expected STAGE=SECONDS)"))?;
    let seconds: u64 = seconds
        .parse()
        .with_context(|| format!("invalid timeout seconds in '{spec}'"))?;
    Ok((stage.to_string(), seconds))
}

/// Console logging via env-filter plus a JSON-lines engine log under the
/// state directory. The returned guard must stay alive for the appender.
fn init_tracing(
    project_dir: &std::path::Path,
    verbose: bool,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let default_filter = if verbose { "debug" } else { "info" };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_filter));

    let log_dir = project_dir.join(".artemis").join("logs");
    let file_layer = std::fs::create_dir_all(&log_dir).ok().map(|_| {
        let appender = tracing_appender::rolling::daily(&log_dir, "engine.log");
        tracing_appender::non_blocking(appender)
    });

    match file_layer {
        Some((writer, guard)) => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(writer),
                )
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().with_target(false))
                .init();
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timeout_override() {
        assert_eq!(
            parse_timeout_override("development=900").unwrap(),
            ("development".to_string(), 900)
        );
        assert!(parse_timeout_override("development").is_err());
        assert!(parse_timeout_override("development=fast").is_err());
    }
}
