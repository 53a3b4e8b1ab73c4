//! voxscaled: the voxscale daemon.
//!
//! Single binary that assembles the control loop for one GPU worker fleet:
//! - State store (redb)
//! - Backlog monitor
//! - Scaling decision engine
//! - Fleet controller + fallback supervisor
//! - Operator REST API
//!
//! # Usage
//!
//! ```text
//! voxscaled run --config /etc/voxscale/voxscale.toml --port 8460
//! voxscaled simulate --cycles 120 --peak-rate 6
//! voxscaled init --queue story-tasks --fleet gpu-workers --max 2
//! ```

mod daemon;
mod simulate;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use voxscale_core::ControlConfig;

const DEFAULT_FILTER: &str = "info,voxscaled=debug,voxscale=debug";

#[derive(Parser)]
#[command(name = "voxscaled", about = "Queue-depth-driven GPU fleet autoscaler")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the control loop and the operator API.
    Run {
        /// Path to voxscale.toml.
        #[arg(long, default_value = "voxscale.toml")]
        config: PathBuf,

        /// Port to listen on. Overrides `[api].listen`.
        #[arg(long)]
        port: Option<u16>,

        /// Data directory for persistent state. Overrides `[store].data_dir`.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },

    /// Drive the control loop against a simulated queue and fleet.
    Simulate {
        /// Config to simulate. A two-worker scaffold with a CPU-mock
        /// fallback is used when absent.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Number of control cycles to run.
        #[arg(long, default_value = "60")]
        cycles: u32,

        /// Messages per second outside the peak.
        #[arg(long, default_value = "0.2")]
        base_rate: f64,

        /// Messages per second during the peak.
        #[arg(long, default_value = "3.0")]
        peak_rate: f64,

        /// Cycle at which the peak starts.
        #[arg(long, default_value = "5")]
        peak_start: u32,

        /// Length of the peak in cycles.
        #[arg(long, default_value = "15")]
        peak_cycles: u32,

        /// Messages per second one worker drains.
        #[arg(long, default_value = "1.0")]
        worker_rate: f64,
    },

    /// Write a starter voxscale.toml.
    Init {
        #[arg(long, default_value = "story-tasks")]
        queue: String,

        #[arg(long, default_value = "gpu-workers")]
        fleet: String,

        #[arg(long, default_value = "0")]
        min: u32,

        #[arg(long, default_value = "2")]
        max: u32,

        /// Output path.
        #[arg(long, default_value = "voxscale.toml")]
        output: PathBuf,
    },
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run {
            config,
            port,
            data_dir,
        } => daemon::run(&config, port, data_dir).await,
        Command::Simulate {
            config,
            cycles,
            base_rate,
            peak_rate,
            peak_start,
            peak_cycles,
            worker_rate,
        } => {
            let config = match config {
                Some(path) => ControlConfig::from_file(&path)?,
                None => simulate::default_config(),
            };
            let workload = simulate::Workload {
                base_rate,
                peak_rate,
                peak_start,
                peak_cycles,
                worker_rate,
            };
            simulate::run(&config, &workload, cycles).await
        }
        Command::Init {
            queue,
            fleet,
            min,
            max,
            output,
        } => {
            let config = ControlConfig::scaffold(&queue, &fleet, min, max);
            config.validate()?;
            if output.exists() {
                anyhow::bail!("{} already exists", output.display());
            }
            std::fs::write(&output, config.to_toml_string()?)?;
            tracing::info!(path = %output.display(), "config written");
            Ok(())
        }
    }
}
