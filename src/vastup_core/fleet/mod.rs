mod launch;
mod plan;
mod supervise;

pub use launch::{build_launch_script, build_worker_env, launch_job, select_offer};
pub use plan::{describe_plan, output_key_for, plan_jobs};
pub use supervise::{FleetSummary, LaunchedJob, supervise_jobs};
