use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::str::FromStr;
use tracing::Level;
use tracing_subscriber::EnvFilter;
use wcar::player::{Player, RepConfig};
use wcar::show::capture_summary;
use wcar::transform::Transform;

#[derive(Parser, Debug)]
#[clap(
    name = "gantry-replay",
    version = "0.1.0",
    about = "Transform, inspect and replay gantry workload captures."
)]
struct ReplayArgs {
    #[clap(long, value_name = "LOG_LEVEL")]
    log_level: Option<String>,
    #[clap(subcommand)]
    command: ReplayCommand,
}

#[derive(Subcommand, Debug)]
enum ReplayCommand {
    /// Sort the capture and derive its transaction schedule.
    Transform {
        /// Base name of the capture file set (without extension).
        capture: PathBuf,
    },
    /// Replay a transformed capture against a target server.
    Replay {
        capture: PathBuf,
        #[clap(long, default_value = "127.0.0.1")]
        host: String,
        #[clap(long, default_value_t = 3306)]
        port: u16,
        #[clap(long, default_value = "root")]
        user: String,
        #[clap(long, default_value = "")]
        password: String,
        /// Clock multiplier; 0 replays as fast as possible.
        #[clap(long, default_value_t = 1.0)]
        speed: f64,
        /// Kill the youngest victim when replay sessions deadlock.
        #[clap(long, default_value_t = false)]
        deadlock_monitor: bool,
    },
    /// Print statistics of a capture (and its replay, if any).
    Show { capture: PathBuf },
}

fn main() -> anyhow::Result<()> {
    let args = ReplayArgs::parse();
    let level = Level::from_str(args.log_level.as_deref().unwrap_or("INFO"))?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("INFO")),
        )
        .with_max_level(level)
        .init();

    match args.command {
        ReplayCommand::Transform { capture } => {
            let transform = Transform::run(&capture)?;
            println!(
                "{} events, {} transactions, {} parallel sessions",
                transform.sort_report().events,
                transform.transactions().len(),
                transform.max_parallel_sessions()
            );
        }
        ReplayCommand::Replay {
            capture,
            host,
            port,
            user,
            password,
            speed,
            deadlock_monitor,
        } => {
            let player = Player::new(RepConfig {
                capture,
                host,
                port,
                user,
                password,
                sim_speed: speed,
                enable_deadlock_monitor: deadlock_monitor,
            })?;
            let report = player.replay()?;
            println!(
                "replayed {} events ({} errors, {} transactions, {} forced advances)",
                report.events, report.errors, report.transactions, report.forced_advances
            );
        }
        ReplayCommand::Show { capture } => {
            let summary = capture_summary(&capture)?;
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }
    Ok(())
}
