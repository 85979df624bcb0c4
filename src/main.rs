use adapter_prefetch::config::{parse_size, Config};
use adapter_prefetch::simulate::{self, SimulationReport};
use anyhow::{bail, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;

#[derive(Parser)]
#[command(
    name = "adapter-prefetch",
    version,
    about = "Predictive prefetching of LoRA adapter weights into a fixed device slot pool"
)]
struct Cli {
    /// Config file (defaults to $ADAPTER_PREFETCH_CONFIG or ./adapter-prefetch.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay a synthetic adapter trace through the slot pool
    Simulate {
        #[command(flatten)]
        overrides: Overrides,

        /// Disable prediction and prefetch (purely reactive pool)
        #[arg(long)]
        no_prefetch: bool,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,

        /// Also print Prometheus text metrics
        #[arg(long)]
        prometheus: bool,
    },
    /// Run the same trace with prefetch on and off
    Compare {
        #[command(flatten)]
        overrides: Overrides,

        /// Print both reports as JSON
        #[arg(long)]
        json: bool,
    },
    /// Print the default config file, or write it to PATH
    InitConfig {
        /// Output path (e.g. adapter-prefetch.toml)
        path: Option<PathBuf>,

        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

/// Command-line overrides for config file values
#[derive(Args)]
struct Overrides {
    /// Number of device slots
    #[arg(long)]
    slots: Option<usize>,

    /// Slot capacity (e.g. "4M", "512K")
    #[arg(long)]
    slot_bytes: Option<String>,

    /// Batches remembered by the predictor
    #[arg(long)]
    history_window: Option<usize>,

    /// Adapters prefetched per batch at most
    #[arg(long)]
    max_predictions: Option<usize>,

    /// Emulated host->device bandwidth in MB/s (0 = unthrottled)
    #[arg(long)]
    bandwidth: Option<u64>,

    /// Number of batches to replay
    #[arg(long)]
    batches: Option<usize>,

    /// Size of the adapter catalog
    #[arg(long)]
    adapters: Option<usize>,

    /// Adapters required per batch
    #[arg(long)]
    batch_size: Option<usize>,

    /// Probability a batch repeats the previous one
    #[arg(long)]
    reuse: Option<f64>,

    /// Emulated compute per batch in milliseconds
    #[arg(long)]
    compute_ms: Option<u64>,

    /// Trace seed
    #[arg(long)]
    seed: Option<u64>,
}

impl Overrides {
    fn apply(self, config: &mut Config) -> Result<()> {
        if let Some(v) = self.slots {
            config.pool.num_slots = v;
        }
        if let Some(v) = self.slot_bytes {
            config.pool.slot_bytes = parse_size(&v)?;
        }
        if let Some(v) = self.history_window {
            config.prefetch.history_window = v;
        }
        if let Some(v) = self.max_predictions {
            config.prefetch.max_predictions = v;
        }
        if let Some(v) = self.bandwidth {
            config.transfer.bandwidth_mb_s = v;
        }
        if let Some(v) = self.batches {
            config.simulate.batches = v;
        }
        if let Some(v) = self.adapters {
            config.simulate.adapters = v;
        }
        if let Some(v) = self.batch_size {
            config.simulate.batch_size = v;
        }
        if let Some(v) = self.reuse {
            config.simulate.reuse_probability = v;
        }
        if let Some(v) = self.compute_ms {
            config.simulate.compute_ms = v;
        }
        if let Some(v) = self.seed {
            config.simulate.seed = v;
        }
        config.validate()?;
        Ok(())
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::load_from_file(path),
        None => Config::load(),
    }
}

fn report_json(report: &SimulationReport) -> serde_json::Value {
    serde_json::json!({
        "label": report.label,
        "batches": report.batches,
        "elapsed_ms": report.elapsed.as_secs_f64() * 1000.0,
        "checksum": report.checksum,
        "metrics": report.metrics.to_json(),
    })
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Simulate {
            overrides,
            no_prefetch,
            json,
            prometheus,
        } => {
            let mut config = load_config(cli.config.as_ref())?;
            overrides.apply(&mut config)?;
            if no_prefetch {
                config.prefetch.enable_prefetch = false;
            }

            let label = if config.prefetch.enable_prefetch { "prefetch" } else { "reactive" };
            let report = simulate::run(&config, label)?;

            if json {
                println!("{}", serde_json::to_string_pretty(&report_json(&report))?);
            } else {
                println!("=== adapter-prefetch simulation ===");
                println!(
                    "Pool: {} slots x {:.2} MB | history_window={} max_predictions={}",
                    config.pool.num_slots,
                    config.pool.slot_bytes as f64 / (1024.0 * 1024.0),
                    config.prefetch.history_window,
                    config.prefetch.max_predictions
                );
                println!("{}", report);
            }
            if prometheus {
                print!("{}", report.prometheus);
            }
        }

        Commands::Compare { overrides, json } => {
            let mut config = load_config(cli.config.as_ref())?;
            overrides.apply(&mut config)?;
            let (with, without) = simulate::compare(&config)?;

            if json {
                let out = serde_json::json!({
                    "prefetch": report_json(&with),
                    "reactive": report_json(&without),
                });
                println!("{}", serde_json::to_string_pretty(&out)?);
            } else {
                println!("=== Prefetch vs reactive ===");
                println!("{}", with);
                println!("{}", without);
                let saved = without.metrics.misses as i64 - with.metrics.misses as i64;
                println!(
                    "Blocking copies avoided: {} | wall time {:.2}s vs {:.2}s",
                    saved,
                    with.elapsed.as_secs_f64(),
                    without.elapsed.as_secs_f64()
                );
            }
        }

        Commands::InitConfig { path, force } => match path {
            None => print!("{}", Config::default_toml()),
            Some(path) => {
                if path.exists() && !force {
                    bail!("{} already exists (use --force to overwrite)", path.display());
                }
                std::fs::write(&path, Config::default_toml())?;
                info!("Wrote default config to {}", path.display());
            }
        },
    }

    Ok(())
}

