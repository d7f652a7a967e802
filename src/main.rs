use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use console::style;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use foreman::builder::CommandBuilder;
use foreman::catalog::{Catalog, FeatureSpec};
use foreman::claims::ClaimManager;
use foreman::config::Config;
use foreman::decisions::DecisionQueue;
use foreman::lock::DirLock;
use foreman::mergeplan;
use foreman::notify::{ConsoleNotifier, NullNotifier, ProgressCounts};
use foreman::orchestrator::Orchestrator;
use foreman::shutdown::ShutdownFlag;
use foreman::state::FeatureStatus;
use foreman::store::StateStore;
use foreman::ui::RunUi;
use foreman::vcs::GitVcs;

#[derive(Parser)]
#[command(name = "foreman")]
#[command(version, about = "Claim-based multi-agent development orchestrator")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create `.foreman/` with a starter catalog and config
    Init,
    /// Run the orchestrator until the backlog drains
    Run {
        /// Override the configured worker count
        #[arg(short, long)]
        workers: Option<usize>,
    },
    /// Show per-feature status and counts
    Status,
    /// Compute and write the merge plan for completed features
    Plan,
    /// List pending decisions
    Decisions {
        /// Remove decision records older than this many days
        #[arg(long)]
        cleanup_days: Option<u64>,
    },
    /// Answer a pending decision
    Answer {
        decision_id: String,
        answer: String,
        /// Who is answering (defaults to $USER)
        #[arg(long)]
        by: Option<String>,
    },
    /// Cancel a pending decision
    CancelDecision {
        decision_id: String,
        #[arg(long, default_value = "cancelled by operator")]
        reason: String,
    },
    /// Break a named lock whose holder is dead
    ForceUnlock { name: String },
    /// Reset a blocked feature back to pending
    Reset { feature_id: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };
    let config = Config::new(project_dir, cli.verbose)?;

    match &cli.command {
        Commands::Init => cmd_init(&config),
        Commands::Run { workers } => cmd_run(config, *workers).await,
        Commands::Status => cmd_status(&config),
        Commands::Plan => cmd_plan(&config),
        Commands::Decisions { cleanup_days } => cmd_decisions(&config, *cleanup_days),
        Commands::Answer {
            decision_id,
            answer,
            by,
        } => cmd_answer(&config, decision_id, answer, by.as_deref()),
        Commands::CancelDecision {
            decision_id,
            reason,
        } => cmd_cancel_decision(&config, decision_id, reason),
        Commands::ForceUnlock { name } => cmd_force_unlock(&config, name),
        Commands::Reset { feature_id } => cmd_reset(&config, feature_id),
    }
}

fn load_catalog(config: &Config) -> Result<Catalog> {
    if !config.catalog_path.exists() {
        bail!(
            "No catalog at {}. Run 'foreman init' first.",
            config.catalog_path.display()
        );
    }
    Catalog::load(&config.catalog_path)
}

fn open_claims(config: &Config, catalog: &Catalog) -> ClaimManager {
    let store = Arc::new(StateStore::new(
        &config.state_path,
        &config.locks_path,
        config.claim_lock_timeout,
        catalog,
    ));
    ClaimManager::new(
        store,
        Arc::new(catalog.clone()),
        Arc::new(NullNotifier),
        &config.feature_branch_prefix,
    )
}

fn open_decisions(config: &Config) -> DecisionQueue {
    DecisionQueue::new(
        &config.decisions_path,
        &config.locks_path,
        config.lock_timeout,
        Arc::new(NullNotifier),
    )
}

fn cmd_init(config: &Config) -> Result<()> {
    config.ensure_directories()?;

    if config.catalog_path.exists() {
        println!("Catalog already exists at {}", config.catalog_path.display());
    } else {
        let starter = Catalog {
            features: vec![
                FeatureSpec::new("scaffold", "Project scaffolding", vec![], 1),
                FeatureSpec::new("first-feature", "First real feature", vec!["scaffold".into()], 2),
            ],
            integration_tests: Vec::new(),
        };
        starter.save(&config.catalog_path)?;
        println!("Wrote starter catalog to {}", config.catalog_path.display());
    }

    let toml_path = config.project_dir.join(".foreman/foreman.toml");
    if !toml_path.exists() {
        std::fs::write(
            &toml_path,
            "[workers]\ncount = 3\n\n[builder]\ncmd = \"claude\"\n",
        )
        .context("Failed to write foreman.toml")?;
        println!("Wrote default config to {}", toml_path.display());
    }
    println!(
        "{} add .foreman/state.json and .foreman/costs.csv to .gitignore; the catalog is meant to be committed, the state is not.",
        style("note:").yellow().bold()
    );
    Ok(())
}

async fn cmd_run(mut config: Config, workers: Option<usize>) -> Result<()> {
    if let Some(n) = workers {
        config.num_workers = n;
    }
    let catalog = load_catalog(&config)?;
    let total = catalog.len() as u64;

    let shutdown = ShutdownFlag::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("interrupt received; shutting down");
                shutdown.trigger();
            }
        });
    }

    let builder = CommandBuilder::new(
        &config.builder_cmd,
        &config.builder_args,
        &config.project_dir,
        &config.log_dir,
    );
    let vcs = GitVcs::open(&config.project_dir)
        .context("foreman run requires a git repository")?;

    let orchestrator = Orchestrator::new(
        config.clone(),
        catalog,
        Arc::new(builder),
        Arc::new(vcs),
        Arc::new(ConsoleNotifier),
        shutdown.clone(),
    );

    // Progress bars polling the shared state until the run lands.
    let ui = Arc::new(RunUi::new(total));
    let ui_task = {
        let ui = ui.clone();
        let claims = orchestrator.claims().clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                if let Ok(counts) = claims.counts() {
                    ui.update(&counts);
                    ui.activity(&format!(
                        "{} pending, {} in progress",
                        counts.pending, counts.in_progress
                    ));
                }
                if shutdown.sleep(Duration::from_secs(1)).await {
                    return;
                }
            }
        })
    };

    let report = orchestrator.run().await?;
    ui_task.abort();
    ui.finish(if report.drained { "drained" } else { "interrupted" });

    println!();
    println!(
        "{} {} completed, {} blocked, {} pending, {} in progress",
        style("Run finished:").bold(),
        report.counts.completed,
        report.counts.blocked,
        report.counts.pending,
        report.counts.in_progress
    );
    if report.daily_cost > 0.0 {
        println!("Daily cost: ${:.2}", report.daily_cost);
    }
    if !report.blocked.is_empty() {
        println!("\n{}", style("Blocked features need attention:").red().bold());
        for (id, reason) in &report.blocked {
            println!("  {} — {}", style(id).bold(), reason);
        }
    }
    if report.merge_plan.is_some() {
        println!("Merge plan written to {}", config.merge_plan_path.display());
    }
    Ok(())
}

fn cmd_status(config: &Config) -> Result<()> {
    let catalog = load_catalog(config)?;
    let claims = open_claims(config, &catalog);
    let doc = claims.store().load()?;

    for feature in &doc.features {
        let name = catalog.get(&feature.id).map(|s| s.name.as_str()).unwrap_or("");
        let status = match feature.status {
            FeatureStatus::Pending => style("pending").dim(),
            FeatureStatus::InProgress => style("in progress").cyan(),
            FeatureStatus::Completed => style("completed").green(),
            FeatureStatus::Blocked => style("blocked").red(),
        };
        let mut detail = String::new();
        if let Some(worker) = &feature.claimed_by {
            detail.push_str(&format!(" [{}]", worker));
        }
        if let Some(reason) = &feature.blocked_reason {
            detail.push_str(&format!(" — {}", reason));
        }
        if let Some(url) = &feature.pr_url {
            detail.push_str(&format!(" — {}", url));
        }
        println!("{:<20} {:<12} {}{}", feature.id, status, name, detail);
    }

    let counts = ProgressCounts::from_document(&doc);
    println!(
        "\n{} pending, {} in progress, {} completed, {} blocked",
        counts.pending, counts.in_progress, counts.completed, counts.blocked
    );
    Ok(())
}

fn cmd_plan(config: &Config) -> Result<()> {
    let catalog = load_catalog(config)?;
    let claims = open_claims(config, &catalog);
    let doc = claims.store().load()?;

    let plan = mergeplan::plan(&catalog, &doc)?;
    let rendered = plan.render_markdown(&config.default_branch);
    std::fs::write(&config.merge_plan_path, &rendered)
        .context("Failed to write merge plan")?;
    print!("{}", rendered);
    println!("\nWritten to {}", config.merge_plan_path.display());
    Ok(())
}

fn cmd_decisions(config: &Config, cleanup_days: Option<u64>) -> Result<()> {
    let queue = open_decisions(config);

    if let Some(days) = cleanup_days {
        let removed = queue.cleanup(Duration::from_secs(days * 86_400))?;
        println!("Removed {} old decision records", removed);
        return Ok(());
    }

    let pending = queue.pending()?;
    if pending.is_empty() {
        println!("No pending decisions.");
        return Ok(());
    }
    for decision in pending {
        println!(
            "{}\n  {} (feature {}, worker {})\n  options: {}\n  answer with: foreman answer {} <option>",
            style(&decision.id).bold(),
            decision.question,
            decision.requesting_feature,
            decision.requesting_worker,
            decision.options.join(" | "),
            decision.id
        );
    }
    Ok(())
}

fn cmd_answer(
    config: &Config,
    decision_id: &str,
    answer: &str,
    by: Option<&str>,
) -> Result<()> {
    let answerer = by
        .map(String::from)
        .or_else(|| std::env::var("USER").ok())
        .unwrap_or_else(|| "operator".to_string());
    let queue = open_decisions(config);
    queue.answer(decision_id, answer, &answerer)?;
    println!("Answered {} with '{}' as {}", decision_id, answer, answerer);
    Ok(())
}

fn cmd_cancel_decision(config: &Config, decision_id: &str, reason: &str) -> Result<()> {
    let queue = open_decisions(config);
    queue.cancel(decision_id, reason)?;
    println!("Cancelled {}", decision_id);
    Ok(())
}

fn cmd_force_unlock(config: &Config, name: &str) -> Result<()> {
    let locks = DirLock::new(&config.locks_path);
    match locks.inspect(name) {
        Some(owner) => println!(
            "Breaking lock '{}' held by pid {} on {} for {}s",
            name,
            owner.pid,
            owner.host,
            owner.age().num_seconds()
        ),
        None if locks.is_held(name) => println!("Breaking lock '{}' (no owner metadata)", name),
        None => {
            println!("Lock '{}' is not held.", name);
            return Ok(());
        }
    }
    locks.force_release(name)?;
    Ok(())
}

fn cmd_reset(config: &Config, feature_id: &str) -> Result<()> {
    let catalog = load_catalog(config)?;
    let claims = open_claims(config, &catalog);
    claims.store().load()?;
    claims.reset(feature_id)?;
    println!("Feature '{}' reset to pending.", feature_id);
    Ok(())
}
