use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "vastup",
    version,
    about = "Spot-market GPU fleet for video frame interpolation and super-resolution upscaling"
)]
pub struct Cli {
    /// Local baseline config (JSON). Remote config referenced by its
    /// `config_url` key is deep-merged on top.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Spot-market API key.
    #[arg(long, global = true, env = "VASTUP_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Spot-market API base URL.
    #[arg(
        long,
        global = true,
        env = "VASTUP_MARKET_URL",
        default_value = "https://console.vast.ai/api/v0"
    )]
    pub market_url: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Plan the batch, rent one instance per job, and supervise the fleet
    /// until interrupted (Ctrl-C detaches; instances are left as they are).
    Run {
        /// Stop after planning and print the plan.
        #[arg(long)]
        dry_run: bool,
    },
    /// Print the batch plan without renting anything.
    Plan,
    /// Execute the processing pipeline on this machine. This is what the
    /// baked-in launch command runs on the rented worker.
    Worker {
        /// Directory for per-job workspaces and the pending-upload journal.
        #[arg(long, env = "VASTUP_WORK_DIR", default_value = "/workspace/vastup-work")]
        work_dir: PathBuf,
    },
    /// List spot offers matching the configured preset, best first.
    Offers,
    /// Attach a log watcher to an existing instance.
    Watch {
        instance_id: u64,
    },
}
