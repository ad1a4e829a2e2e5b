use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use console::style;
use tracing_subscriber::EnvFilter;

use lockstep::config::Config;
use lockstep::controller::{OverrideDecision, RunController};
use lockstep::executor::{SimProfile, SimulatedExecutor};
use lockstep::gate::InMemoryHistory;
use lockstep::models::{RunInput, SessionStatus, Verdict, VerdictLabel};
use lockstep::server::{DEFAULT_PORT, ServerConfig, start_server};
use lockstep::stage;

#[derive(Parser)]
#[command(name = "lockstep")]
#[command(version, about = "Migration run orchestrator with a human-overridable risk gate")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Start the orchestrator HTTP/WebSocket server
    Serve {
        /// Port to serve on
        #[arg(short, long, default_value_t = DEFAULT_PORT)]
        port: u16,

        /// Risk score at or above which the gate holds (overrides config)
        #[arg(long)]
        block_threshold: Option<f64>,

        /// Bind on all interfaces with permissive CORS
        #[arg(long)]
        dev: bool,
    },
    /// Run one simulated migration in-process and print the verdict
    Run {
        /// Path to the repository to migrate
        repo_path: String,

        /// Restrict the run to one module
        #[arg(long)]
        target_module: Option<String>,

        /// Risk score at or above which the gate holds (overrides config)
        #[arg(long)]
        block_threshold: Option<f64>,

        /// Approve a gate hold as this reviewer instead of stopping
        #[arg(long)]
        approve: Option<String>,
    },
    /// List the fixed stage sequence
    Stages,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let cwd = std::env::current_dir().context("Failed to get current directory")?;

    match cli.command {
        Commands::Serve { port, block_threshold, dev } => {
            let mut config = Config::load(&cwd)?;
            if let Some(threshold) = block_threshold {
                config.gate.block_threshold = threshold;
            }
            config.validate()?;
            start_server(
                ServerConfig { port, dev_mode: dev },
                config,
                Arc::new(SimulatedExecutor::new(SimProfile::default())),
                Arc::new(InMemoryHistory::new()),
            )
            .await?;
        }
        Commands::Run { repo_path, target_module, block_threshold, approve } => {
            let mut config = Config::load(&cwd)?;
            if let Some(threshold) = block_threshold {
                config.gate.block_threshold = threshold;
            }
            config.validate()?;
            cmd_run(repo_path, target_module, approve, config).await?;
        }
        Commands::Stages => {
            for (i, stage) in stage::SEQUENCE.iter().enumerate() {
                println!("{}. {}", i + 1, stage);
            }
        }
    }
    Ok(())
}

/// Drive one run to a settled state, printing each transition as it lands.
async fn cmd_run(
    repo_path: String,
    target_module: Option<String>,
    mut approve: Option<String>,
    config: Config,
) -> Result<()> {
    let controller = Arc::new(RunController::new(
        Arc::new(SimulatedExecutor::new(SimProfile::default())),
        Arc::new(InMemoryHistory::new()),
        config,
    ));
    let session = controller.start(RunInput { repo_path, target_module }, None)?;
    println!("{} {}", style("Run").bold().cyan(), style(&session.id).bold());

    // Some(0) replays from the start of the log; the run may already be
    // several stages in by the time we attach.
    let mut subscription = controller.subscribe(&session.id, Some(0))?;
    loop {
        let transition = subscription.recv().await?;
        let marker = match transition.status {
            SessionStatus::Running => style("•").green(),
            SessionStatus::Held => style("⏸").yellow(),
            SessionStatus::Complete => style("✓").green().bold(),
            SessionStatus::Failed => style("✗").red().bold(),
            SessionStatus::Cancelled => style("✗").yellow(),
        };
        println!("  {} {:<20} {}", marker, transition.stage.to_string(), transition.payload_summary);

        if transition.status == SessionStatus::Held {
            let assessment = controller.risk_assessment(&session.id)?;
            println!(
                "\n{} score {:.2} ({})",
                style("Risk gate held the run:").yellow().bold(),
                assessment.score,
                assessment.level.as_str()
            );
            for warning in &assessment.warnings {
                println!("  {} {}: {}", style("⚠").yellow(), warning.function, warning.message);
            }
            match approve.take() {
                Some(approved_by) => {
                    controller.override_run(
                        &session.id,
                        OverrideDecision::Proceed { approved_by: approved_by.clone() },
                    )?;
                    println!("{} {}\n", style("Override approved by").yellow(), approved_by);
                }
                None => {
                    println!("\nRe-run with --approve <name> to override, or use the server API.");
                    return Ok(());
                }
            }
        }
        if transition.terminal {
            if transition.status == SessionStatus::Failed {
                let detail = transition
                    .error
                    .as_ref()
                    .map(|e| e.message.clone())
                    .unwrap_or_else(|| transition.payload_summary.clone());
                anyhow::bail!("Run failed: {}", detail);
            }
            break;
        }
    }

    if let Ok(verdict) = controller.verdict(&session.id) {
        print_verdict(&verdict);
    }
    Ok(())
}

fn print_verdict(verdict: &Verdict) {
    let label = match verdict.label {
        VerdictLabel::Safe => style(verdict.label.as_str()).green().bold(),
        VerdictLabel::Risky => style(verdict.label.as_str()).yellow().bold(),
        VerdictLabel::Blocked => style(verdict.label.as_str()).red().bold(),
    };
    println!("\n{} {}", style("Verdict:").bold(), label);
    println!("  behavior preserved  {:.1}%", verdict.behavior_preservation_pct);
    println!(
        "  drifts              {} critical, {} non-critical",
        verdict.critical_drifts, verdict.non_critical_drifts
    );
    println!("  test coverage       {:.1}%", verdict.test_coverage_pct);
    println!("  risk score          {:.2}", verdict.risk_score);
}
