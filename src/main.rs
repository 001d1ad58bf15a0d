use clap::Parser;
use colored::*;
use eyre::{Context, Result, bail};
use log::info;
use std::fs;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use dogood::audit::{AuditLog, actions};
use dogood::cli::Cli;
use dogood::cli::commands::Commands;
use dogood::config::Config;
use dogood::coordination::{ClaimManager, RateLimiter, StrikeTracker, TrustState};
use dogood::factory::{AgentFactory, CommandRunner, StaticCandidates};
use dogood::store::{AgentStore, ClaimStatus, now_ms};

/// Agent id recorded for audit entries made by hand from the CLI.
const OPERATOR_ID: &str = "operator";

fn setup_logging() -> Result<()> {
    // Create log directory
    let log_dir = dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("dogood")
        .join("logs");

    fs::create_dir_all(&log_dir).context("Failed to create log directory")?;

    let log_file = log_dir.join("dogood.log");

    // Setup env_logger with file output
    let target = Box::new(
        fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_file)
            .context("Failed to open log file")?,
    );

    env_logger::Builder::from_default_env()
        .target(env_logger::Target::Pipe(target))
        .init();

    info!("Logging initialized, writing to: {}", log_file.display());
    Ok(())
}

/// Everything a command handler needs, built over one shared store.
struct Services {
    store: Arc<Mutex<AgentStore>>,
    claims: ClaimManager,
    rate: RateLimiter,
    strikes: StrikeTracker,
    audit: AuditLog,
}

fn build_services(config: &Config) -> Result<Services> {
    let store = Arc::new(Mutex::new(
        AgentStore::open_at(&config.storage.data_dir).context("Failed to open agent store")?,
    ));
    let claims = ClaimManager::new(
        Arc::clone(&store),
        config.claims.ttl_ms(),
        config.claims.retry_attempts,
        config.claims.retry_delay(),
    )?;
    let rate = RateLimiter::new(Arc::clone(&store), config.rate_limits.poll_interval());
    for category in &config.rate_limits.categories {
        rate.register(&category.name, category.window_ms(), category.max_per_window)?;
    }
    let strikes = StrikeTracker::new(
        Arc::clone(&store),
        config.strikes.max_strikes,
        config.strikes.cooldown_ms(),
    )?;
    let audit = AuditLog::new(Arc::clone(&store));
    Ok(Services {
        store,
        claims,
        rate,
        strikes,
        audit,
    })
}

fn run_application(cli: &Cli, config: &Config) -> Result<()> {
    info!("Starting application");

    if cli.is_verbose() {
        println!("{}", "Verbose mode enabled".yellow());
    }

    let services = build_services(config)?;

    match &cli.command {
        Commands::Factory {
            candidates,
            max_agents,
            max_items,
        } => handle_factory_command(candidates, *max_agents, *max_items, &services, config),
        Commands::Status { limit } => handle_status_command(*limit, &services, config),
        Commands::Trust { repo } => handle_trust_command(repo, &services),
        Commands::RecordMerge { repo } => handle_record_merge_command(repo, &services),
        Commands::RecordStrike { repo, reason } => {
            handle_record_strike_command(repo, reason.as_deref(), &services, config)
        }
        Commands::Redeem { repo, amount } => handle_redeem_command(repo, *amount, &services),
        Commands::Release {
            work_item,
            owner,
            abandon,
        } => handle_release_command(work_item, owner, *abandon, &services),
        Commands::Audit { limit } => handle_audit_command(*limit, &services),
        Commands::Sweep => handle_sweep_command(&services),
    }
}

fn handle_factory_command(
    candidates: &PathBuf,
    max_agents: Option<usize>,
    max_items: Option<usize>,
    services: &Services,
    config: &Config,
) -> Result<()> {
    info!("Running factory over {}", candidates.display());

    if config.factory.solve_command.is_empty() {
        bail!("No solve_command configured; set factory.solve_command in the config file");
    }
    let runner = CommandRunner::new(&config.factory.solve_command, &config.factory.model)
        .ok_or_else(|| eyre::eyre!("solve_command must name a program"))?;
    let source = StaticCandidates::from_json_file(candidates)
        .context("Failed to load candidate file")?;

    let mut factory_config = config.factory_config();
    if let Some(max) = max_agents {
        factory_config.max_agents = max;
    }
    if let Some(max) = max_items {
        factory_config.max_items = max;
    }

    println!(
        "{} {} (max {} agents)",
        "Running factory over".cyan(),
        candidates.display(),
        factory_config.max_agents
    );

    let mut factory = AgentFactory::new(
        Arc::new(runner),
        Arc::new(source),
        Arc::clone(&services.store),
        services.claims.clone(),
        services.rate.clone(),
        services.strikes.clone(),
        services.audit.clone(),
        factory_config,
    );

    let runtime = tokio::runtime::Runtime::new().context("Failed to build runtime")?;
    let stats = runtime.block_on(factory.run())?;

    println!(
        "{} {} started, {} succeeded, {} skipped, {} requeued, {} failed",
        "Done:".green(),
        stats.started,
        stats.succeeded,
        stats.skipped,
        stats.requeued,
        stats.failed
    );
    Ok(())
}

fn handle_status_command(limit: usize, services: &Services, config: &Config) -> Result<()> {
    info!("Showing status");

    println!(
        "{} {}",
        "Active claims:".green(),
        services.claims.count_active()?
    );

    println!("{}", "Rate budget:".green());
    for category in &config.rate_limits.categories {
        match services.rate.state(&category.name)? {
            Some(state) => {
                let now = now_ms();
                println!(
                    "  {}: {}/{} used, {} remaining this window",
                    category.name,
                    state.used,
                    state.max_per_window,
                    state.remaining(now)
                );
            }
            None => println!("  {}: {}", category.name, "not registered".yellow()),
        }
    }

    let contributions = {
        let store = services.store.lock().unwrap();
        store.list_contributions(limit)?
    };
    println!("{}", "Recent contributions:".green());
    if contributions.is_empty() {
        println!("  (none)");
    }
    for c in contributions {
        let status = match c.status.as_str() {
            "pr_submitted" => c.status.as_str().green(),
            "failed" => c.status.as_str().red(),
            other => other.normal(),
        };
        println!(
            "  {} {} by {} [{}] {}",
            c.work_item,
            status,
            c.agent_id,
            c.model,
            c.pr_url.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn handle_trust_command(repo: &str, services: &Services) -> Result<()> {
    info!("Showing trust for {}", repo);

    match services.strikes.state(repo)? {
        TrustState::Clean => println!("{} {}", repo, "clean".green()),
        TrustState::Cooldown { until } => {
            println!("{} {} until {}", repo, "cooling down".yellow(), format_ts(until));
        }
        TrustState::EligibleWithStrikes { strikes } => {
            println!("{} {} ({} strikes)", repo, "eligible".green(), strikes);
        }
        TrustState::PermanentlyExcluded => {
            println!("{} {}", repo, "permanently excluded".red());
        }
    }
    if let Some(trust) = services.strikes.trust(repo)? {
        println!(
            "  {} merges, last at {}",
            trust.merges,
            trust.last_merge_at.map_or("-".to_string(), format_ts)
        );
    }
    Ok(())
}

fn handle_record_merge_command(repo: &str, services: &Services) -> Result<()> {
    info!("Recording merge for {}", repo);

    services.strikes.record_merge(repo)?;
    services.audit.record(OPERATOR_ID, repo, actions::MERGE, "")?;
    println!("{} merge recorded for {}", "OK:".green(), repo);
    Ok(())
}

fn handle_record_strike_command(
    repo: &str,
    reason: Option<&str>,
    services: &Services,
    config: &Config,
) -> Result<()> {
    info!("Recording strike for {}: {:?}", repo, reason);

    let strikes = services.strikes.record_strike(repo)?;
    services
        .audit
        .record(OPERATOR_ID, repo, actions::STRIKE, reason.unwrap_or(""))?;
    if strikes >= config.strikes.max_strikes {
        println!(
            "{} {} at {} strikes, permanently excluded",
            "Warning:".red(),
            repo,
            strikes
        );
    } else {
        println!(
            "{} {} now at {}/{} strikes",
            "OK:".green(),
            repo,
            strikes,
            config.strikes.max_strikes
        );
    }
    Ok(())
}

fn handle_redeem_command(repo: &str, amount: u32, services: &Services) -> Result<()> {
    info!("Redeeming {} strikes for {}", amount, repo);

    let strikes = services.strikes.redeem(repo, amount)?;
    services
        .audit
        .record(OPERATOR_ID, repo, actions::REDEEM, &amount.to_string())?;
    println!("{} {} now at {} strikes", "OK:".green(), repo, strikes);
    Ok(())
}

fn handle_release_command(
    work_item: &str,
    owner: &str,
    abandon: bool,
    services: &Services,
) -> Result<()> {
    info!("Releasing {} for {} (abandon: {})", work_item, owner, abandon);

    let status = if abandon {
        ClaimStatus::Abandoned
    } else {
        ClaimStatus::Completed
    };
    let released = services
        .claims
        .release_at(work_item, owner, status, now_ms())?;
    if released {
        let action = if abandon {
            actions::CLAIM_ABANDONED
        } else {
            actions::CLAIM_RELEASED
        };
        services.audit.record(owner, work_item, action, "manual")?;
        println!("{} {} released", "OK:".green(), work_item);
    } else {
        println!(
            "{} no live claim on {} held by {}",
            "No-op:".yellow(),
            work_item,
            owner
        );
    }
    Ok(())
}

fn handle_audit_command(limit: usize, services: &Services) -> Result<()> {
    info!("Showing {} audit entries", limit);

    let entries = services.audit.recent(limit)?;
    if entries.is_empty() {
        println!("(no audit entries)");
    }
    for entry in entries {
        println!(
            "{} {} {} {} {}",
            format_ts(entry.at).cyan(),
            entry.agent_id,
            entry.repo,
            entry.action.bold(),
            entry.details
        );
    }
    Ok(())
}

fn handle_sweep_command(services: &Services) -> Result<()> {
    let swept = services.claims.sweep_expired()?;
    println!("{} {} stale claim rows deleted", "OK:".green(), swept);
    Ok(())
}

fn format_ts(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ms.to_string())
}

fn main() -> Result<()> {
    // Setup logging first
    setup_logging().context("Failed to setup logging")?;

    // Parse CLI arguments
    let cli = Cli::parse();

    // Load configuration
    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;

    info!("Starting with config from: {:?}", cli.config);

    // Run the main application logic
    run_application(&cli, &config).context("Application failed")?;

    Ok(())
}
