//! AUTOMATE CLI - execution-and-governance core.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::Level;

use automate_approval::PolicyTable;
use automate_core::OrgId;
use automate_exec::Orchestrator;
use automate_ledger::{BudgetPeriod, OrgBudget};

mod config;
mod demo;

use config::ConfigFile;

#[derive(Parser)]
#[command(name = "automate")]
#[command(about = "Task graph orchestrator with approval gating and budget guardrails", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scripted demo campaign
    Demo {
        /// Org/scheduler configuration file
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Validate the approval policy table for completeness
    PolicyCheck,
    /// Print the parsed configuration
    ConfigShow {
        /// Configuration file to inspect
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_max_level(Level::INFO)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Demo { config } => {
            let config = match config {
                Some(path) => ConfigFile::load(&path)?,
                None => ConfigFile::default(),
            };

            let orchestrator =
                Orchestrator::with_config(demo::demo_registry(), config.scheduler_config());

            let org = if config.orgs.is_empty() {
                // Built-in demo org when no config is given.
                let org = OrgId::new("demo-org");
                orchestrator.configure_org(
                    org.clone(),
                    OrgBudget::new(100.0, BudgetPeriod::Daily).with_default_cap(2),
                    Default::default(),
                );
                org
            } else {
                for section in &config.orgs {
                    orchestrator.configure_org(
                        section.org_id(),
                        section.budget(),
                        section.approval_policy(),
                    );
                }
                config.orgs[0].org_id()
            };

            demo::run(&orchestrator, org).await?;
        }
        Commands::PolicyCheck => {
            let table = PolicyTable::standard();
            table.validate()?;
            println!("Policy table is complete ({} combinations)", table.rows().len());
            for (externality, risk_tier, cost_class, mode) in table.rows() {
                let mode = match mode {
                    automate_core::ApprovalMode::None => "none".to_string(),
                    automate_core::ApprovalMode::Confirm => "confirm".to_string(),
                    automate_core::ApprovalMode::Chained { chain } => format!(
                        "chained({})",
                        chain
                            .iter()
                            .map(|role| role.to_string())
                            .collect::<Vec<_>>()
                            .join(" -> ")
                    ),
                };
                println!(
                    "  {:10?} {:8?} {:6?} -> {}",
                    externality, risk_tier, cost_class, mode
                );
            }
        }
        Commands::ConfigShow { config } => {
            let config = ConfigFile::load(&config)?;
            for org in &config.orgs {
                println!(
                    "org {} | allocated {:.2} ({:?}) | default cap {}",
                    org.id, org.allocated, org.period, org.default_cap
                );
                for (domain, cap) in &org.caps {
                    println!("  cap {domain} = {cap}");
                }
            }
            let scheduler = config.scheduler_config();
            println!(
                "scheduler | max attempts {} | backoff {:?} | timeout {:?}",
                scheduler.max_attempts, scheduler.backoff_base, scheduler.task_timeout
            );
        }
    }

    Ok(())
}
