//! Lockwait CLI - lock-wait coordination core

mod simulate;

use clap::{Parser, Subcommand};
use lockwait_core::config::{Config, LockingConfig};
use lockwait_core::lock::{ConflictTable, LockManager};
use simulate::SimulationReport;
use std::time::Duration;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "lockwait")]
#[command(author, version, about = "Lock-wait coordination core", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Output format (text or json)
    #[arg(long, global = true, default_value = "text")]
    format: OutputFormat,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Run a lock-wait scenario against a live lock manager
    Simulate {
        #[command(subcommand)]
        scenario: Scenario,

        /// Override locking.deadlock_timeout_ms
        #[arg(long, global = true)]
        deadlock_timeout_ms: Option<u64>,

        /// Override locking.lock_timeout_ms
        #[arg(long, global = true)]
        lock_timeout_ms: Option<u64>,

        /// Override locking.log_lock_waits
        #[arg(long, global = true)]
        log_lock_waits: bool,
    },

    /// Run health check
    Doctor,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show configuration file path
    Path,
}

#[derive(Subcommand)]
enum Scenario {
    /// Workers mixing shared and exclusive locks on one resource
    Contention {
        #[arg(short, long, default_value_t = 4)]
        workers: usize,
        #[arg(short, long, default_value_t = 25)]
        rounds: usize,
    },
    /// A ring of workers waiting on each other
    Deadlock {
        #[arg(short, long, default_value_t = 2)]
        workers: usize,
    },
    /// A waiter giving up after its lock timeout
    Timeout,
    /// A waiter interrupted by a cancel request
    Cancel,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("lockwait=info".parse()?),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Config { action } => cmd_config(action, cli.quiet),

        Commands::Simulate {
            scenario,
            deadlock_timeout_ms,
            lock_timeout_ms,
            log_lock_waits,
        } => {
            let mut locking = Config::load()?.locking;
            if let Some(ms) = deadlock_timeout_ms {
                locking.deadlock_timeout_ms = ms;
            }
            if let Some(ms) = lock_timeout_ms {
                locking.lock_timeout_ms = ms;
            }
            if log_lock_waits {
                locking.log_lock_waits = true;
            }
            cmd_simulate(scenario, locking, cli.format, cli.quiet).await
        }

        Commands::Doctor => cmd_doctor(cli.quiet).await,
    }
}

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            for (key, value) in config.list()? {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

async fn cmd_simulate(
    scenario: Scenario,
    locking: LockingConfig,
    format: OutputFormat,
    quiet: bool,
) -> anyhow::Result<()> {
    let workers_needed = match &scenario {
        Scenario::Contention { workers, .. } | Scenario::Deadlock { workers } => *workers,
        Scenario::Timeout | Scenario::Cancel => 2,
    };
    let locking = if locking.max_workers < workers_needed {
        locking.with_max_workers(workers_needed)
    } else {
        locking
    };

    let manager = LockManager::new(locking, ConflictTable::shared_exclusive())?;
    let report = match scenario {
        Scenario::Contention { workers, rounds } => {
            simulate::contention(manager, workers, rounds).await?
        }
        Scenario::Deadlock { workers } => simulate::deadlock(manager, workers).await?,
        Scenario::Timeout => simulate::timeout(manager).await?,
        Scenario::Cancel => simulate::cancel(manager).await?,
    };

    info!(scenario = %report.scenario, elapsed_ms = report.elapsed_ms, "Simulation finished");
    print_report(&report, format, quiet)
}

fn print_report(report: &SimulationReport, format: OutputFormat, quiet: bool) -> anyhow::Result<()> {
    if format == OutputFormat::Json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    if quiet {
        println!(
            "{} granted={} deadlocks={} timeouts={} cancelled={}",
            report.scenario, report.granted, report.deadlocks, report.timeouts, report.cancelled
        );
        return Ok(());
    }

    println!("Scenario: {}", report.scenario);
    println!("  Workers:    {}", report.workers);
    println!("  Granted:    {}", report.granted);
    println!("  Deadlocks:  {}", report.deadlocks);
    println!("  Timeouts:   {}", report.timeouts);
    println!("  Cancelled:  {}", report.cancelled);
    println!("  Elapsed:    {} ms", report.elapsed_ms);
    if !report.events.is_empty() {
        println!("  Events:");
        for (kind, count) in &report.events {
            println!("    {}: {}", kind, count);
        }
    }
    for err in &report.other_errors {
        println!("  Error: {}", err);
    }
    Ok(())
}

async fn cmd_doctor(quiet: bool) -> anyhow::Result<()> {
    if !quiet {
        println!("Lockwait Health Check");
        println!("=====================");
        println!();
    }

    let mut all_ok = true;

    let locking = match Config::load() {
        Ok(config) => {
            if !quiet {
                println!("[OK] Configuration: Valid");
            }
            config.locking
        }
        Err(e) => {
            all_ok = false;
            if !quiet {
                println!("[!!] Configuration: Error - {}", e);
            }
            LockingConfig::default()
        }
    };

    // Self-test with a short deadlock timeout so the check is quick.
    let self_test = locking
        .clone()
        .with_max_workers(2)
        .with_deadlock_timeout(Duration::from_millis(20))
        .with_lock_timeout(Duration::from_secs(5));
    match LockManager::new(self_test, ConflictTable::shared_exclusive()) {
        Ok(manager) => {
            if !quiet {
                println!("[OK] Lock manager: Started (timer thread running)");
            }
            match simulate::deadlock(manager, 2).await {
                Ok(report) if report.deadlocks == 1 && report.granted == 1 => {
                    if !quiet {
                        println!(
                            "[OK] Deadlock detection: Resolved a 2-worker cycle in {} ms",
                            report.elapsed_ms
                        );
                    }
                }
                Ok(report) => {
                    all_ok = false;
                    warn!(deadlocks = report.deadlocks, granted = report.granted, "Unexpected self-test result");
                    if !quiet {
                        println!(
                            "[!!] Deadlock detection: Expected 1 deadlock and 1 grant, got {} and {}",
                            report.deadlocks, report.granted
                        );
                    }
                }
                Err(e) => {
                    all_ok = false;
                    if !quiet {
                        println!("[!!] Deadlock detection: Error - {}", e);
                    }
                }
            }
        }
        Err(e) => {
            all_ok = false;
            if !quiet {
                println!("[!!] Lock manager: Error - [{}] {}", e.code(), e);
            }
        }
    }

    if !quiet {
        println!(
            "[OK] Registry: {} worker slots, {} partitions",
            locking.max_workers, locking.num_partitions
        );
        println!();
    }

    if all_ok {
        if !quiet {
            println!("All checks passed.");
        }
        Ok(())
    } else {
        Err(anyhow::anyhow!("Health check failed"))
    }
}
