use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use trueno_sweep::api::ExperimentQueryApi;
use trueno_sweep::config::EngineConfig;
use trueno_sweep::experiment::DefinitionExpander;
use trueno_sweep::repository::RunRecord;
use trueno_sweep::runner::{EngineContext, RunnerOptions, SweepRunner};
use trueno_sweep::selector::{MetricCriterion, Selection, SelectionScope};

#[derive(Parser)]
#[command(author, version, about = "Experiment sweeps over partitioned sales data", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Engine configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Override the run store directory
    #[arg(long, global = true)]
    store: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Expand a definition file and run every experiment
    Run {
        /// Label grouping the runs of this sweep
        #[arg(long)]
        execution_name: String,
        /// Experiment definition file
        #[arg(long)]
        experiments_list: PathBuf,
        /// Override the sales table path
        #[arg(long)]
        data: Option<PathBuf>,
        /// Worker threads
        #[arg(long)]
        workers: Option<usize>,
    },
    /// List execution names
    List,
    /// List the runs of one sweep
    Runs {
        /// Sweep label
        execution_name: String,
        /// Print full records as JSON lines
        #[arg(long)]
        json: bool,
    },
    /// Rank runs and print the leaderboard
    Select {
        /// Restrict to one sweep
        #[arg(long)]
        execution_name: Option<String>,
        /// Restrict to one store context
        #[arg(long)]
        store_context: Option<String>,
        /// Restrict to one experiment spec
        #[arg(long)]
        experiment_id: Option<String>,
        /// Ranked criteria, e.g. `min:val.rmse,max:val.r2`
        #[arg(long, default_value = "min:val.rmse")]
        criteria: String,
        /// Leaderboard rows to print
        #[arg(long, default_value_t = 10)]
        limit: usize,
    },
    /// Serve the read-only query API over HTTP
    #[cfg(feature = "server")]
    Serve {
        /// Listen address
        #[arg(long)]
        bind: Option<String>,
    },
}

fn load_config(cli: &Cli) -> Result<EngineConfig> {
    let config = match &cli.config {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => EngineConfig::default(),
    };
    let mut config = config.with_env_overrides()?;
    if let Some(store) = &cli.store {
        config.store_dir.clone_from(store);
    }
    Ok(config)
}

fn print_run(run: &RunRecord) {
    let rmse = run
        .metric("val.rmse")
        .map_or_else(|| "-".to_string(), |v| format!("{v:.4}"));
    println!(
        "{:>4}  {:<24} {:<10} {:<9} val.rmse={:<10} {}",
        run.sequence(),
        run.experiment_id(),
        run.store_context(),
        run.status().as_str(),
        rmse,
        run.run_id()
    );
    if let Some(error) = run.error() {
        println!("      error: {error}");
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("trueno_sweep=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli)?;

    match cli.command {
        Commands::Run {
            execution_name,
            experiments_list,
            data,
            workers,
        } => {
            if let Some(data) = data {
                config.data_path = data;
            }
            if let Some(workers) = workers {
                config.workers = workers;
                config.validate()?;
            }
            let context = EngineContext::open(&config)
                .with_context(|| format!("opening data {}", config.data_path.display()))?;
            let set = DefinitionExpander::new(&context.estimators)
                .with_default_target(&config.target_column)
                .expand_file(&execution_name, &experiments_list)
                .with_context(|| format!("expanding {}", experiments_list.display()))?;

            let report = SweepRunner::new(context, RunnerOptions::from(&config)).run(&set)?;
            for run in &report.runs {
                print_run(run);
            }
            println!(
                "{}: {} succeeded, {} failed, {} skipped",
                report.execution_name,
                report.succeeded(),
                report.failed(),
                report.skipped
            );
        }
        Commands::List => {
            let api = ExperimentQueryApi::new(EngineContext::open_store(&config)?);
            for name in api.list_executions()? {
                println!("{name}");
            }
        }
        Commands::Runs {
            execution_name,
            json,
        } => {
            let api = ExperimentQueryApi::new(EngineContext::open_store(&config)?);
            for run in api.list_runs(&execution_name)? {
                if json {
                    println!("{}", serde_json::to_string(&run)?);
                } else {
                    print_run(&run);
                }
            }
        }
        Commands::Select {
            execution_name,
            store_context,
            experiment_id,
            criteria,
            limit,
        } => {
            let api = ExperimentQueryApi::new(EngineContext::open_store(&config)?);
            let scope = SelectionScope {
                execution_name,
                store_context,
                experiment_id,
            };
            let criteria = MetricCriterion::parse_list(&criteria)?;
            match api.select(&scope, &criteria)? {
                Selection::Selected { best, leaderboard } => {
                    println!("best: {} ({})", best.run_id(), best.experiment_id());
                    for run in leaderboard.iter().take(limit) {
                        print_run(run);
                    }
                }
                Selection::NoEligibleRun => println!("no eligible run in scope"),
            }
        }
        #[cfg(feature = "server")]
        Commands::Serve { bind } => {
            if let Some(bind) = bind {
                config.bind_addr = bind;
            }
            let api = ExperimentQueryApi::new(EngineContext::open_store(&config)?);
            tokio::runtime::Runtime::new()?
                .block_on(trueno_sweep::api::http::serve(api, &config.bind_addr))?;
        }
    }
    Ok(())
}
