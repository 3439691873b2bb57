use anyhow::{Context, bail};
use clap::{ArgAction, Parser, Subcommand, builder::BoolishValueParser};
use diagnosis_service::{AggregateCaseRequest, DiagnosisService};
use serde::Serialize;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Aggregate specialist assessments into an audited consensus diagnosis
#[derive(Parser, Debug)]
#[command(name = "diagnosis-service", version)]
struct Cli {
    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Aggregate one case read from a JSON file
    Aggregate { case: PathBuf },

    /// Record whether the predicted diagnosis turned out correct
    GroundTruth {
        case_id: String,
        #[arg(action = ArgAction::Set, value_parser = BoolishValueParser::new())]
        outcome: bool,
    },

    /// Print the audit entries recorded for a case
    Trail { case_id: String },

    /// Verify the audit chain
    Verify {
        #[arg(long)]
        from: Option<u64>,
        #[arg(long)]
        to: Option<u64>,
    },

    /// Print calibration statistics
    Calibration,
}

/// Logs go to stderr so stdout carries only the JSON results
fn init_tracing(json: bool) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "diagnosis_service=info,consensus_core=info".into());

    if json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_level(true)
                    .with_writer(std::io::stderr),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.json_logs);

    let service = DiagnosisService::from_env().context("failed to start diagnosis service")?;

    match cli.command {
        Command::Aggregate { case } => {
            let raw = std::fs::read_to_string(&case)
                .with_context(|| format!("failed to read {}", case.display()))?;
            let request: AggregateCaseRequest = serde_json::from_str(&raw)
                .with_context(|| format!("{} is not a valid case request", case.display()))?;

            match service.aggregate_case(request).await {
                Ok(report) => print_json(&report)?,
                Err(failure) => {
                    print_json(&failure)?;
                    return Err(failure.into());
                }
            }
        }
        Command::GroundTruth { case_id, outcome } => {
            let record = service.submit_ground_truth(&case_id, outcome)?;
            print_json(&record)?;
        }
        Command::Trail { case_id } => {
            let entries = service.audit_trail(&case_id)?;
            info!(case_id = %case_id, entries = entries.len(), "Audit trail loaded");
            print_json(&entries)?;
        }
        Command::Verify { from, to } => {
            let report = service.verify_ledger(from, to)?;
            print_json(&report)?;
            if !report.valid {
                bail!(
                    "audit chain invalid at sequence {}",
                    report
                        .first_invalid_sequence
                        .map_or_else(|| "?".to_string(), |s| s.to_string())
                );
            }
        }
        Command::Calibration => print_json(&service.calibration_summary())?,
    }

    Ok(())
}
