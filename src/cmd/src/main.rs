mod bootstrap;

use anyhow::Context;
use bootstrap::ObjectGraph;
use clap::Parser;
use common::ShutdownMessage;
use config::loader::ConfigLoader;
use proxy::diff::commands::DiffCommands;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::sync::watch::Receiver;
use tracing::{info, warn, Level};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[clap(
    name = "gantryd",
    version = "0.1.0",
    about = "MySQL proxy with workload capture/replay and traffic comparison."
)]
struct DaemonArgs {
    /// Main configuration file; additional files live in <config>.d/.
    #[clap(long, value_name = "FILE", default_value = "/etc/gantry.cnf")]
    config: PathBuf,
    /// Directory holding runtime-persisted configuration changes.
    #[clap(long, value_name = "DIR")]
    runtime_dir: Option<PathBuf>,
    /// Overrides the [maxscale] threads setting.
    #[clap(long, value_name = "THREADS")]
    threads: Option<usize>,
    #[clap(long, value_name = "LOG_LEVEL")]
    log_level: Option<String>,
}

async fn shutdown_signal() -> ShutdownMessage {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        ctrl_c_v = ctrl_c => {
            ShutdownMessage::Cancel(format!("gantryd received ctrl_c signal {ctrl_c_v:?}"))
        },
        v = terminate => {
            ShutdownMessage::Cancel(format!("gantryd received terminate signal {v:?}"))
        },
    }
}

fn start_monitors(
    graph: &ObjectGraph,
    runtime: &tokio::runtime::Runtime,
    shutdown_rx: &Receiver<ShutdownMessage>,
) {
    for monitor in &graph.monitors {
        let monitor = Arc::clone(monitor);
        let shutdown_rx = shutdown_rx.clone();
        runtime.spawn(async move {
            monitor.run(shutdown_rx).await;
        });
    }
}

fn main() -> anyhow::Result<()> {
    let args = DaemonArgs::parse();
    let log_level_string = args.log_level.clone().unwrap_or("INFO".to_string());
    let level = Level::from_str(log_level_string.as_str())?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("INFO"))
        .add_directive(level.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();

    let mut loader = ConfigLoader::new(&args.config);
    if let Some(runtime_dir) = &args.runtime_dir {
        loader = loader.with_runtime_dir(runtime_dir);
    }
    let loaded = loader
        .load()
        .with_context(|| format!("loading {}", args.config.display()))?;

    let graph = ObjectGraph::build(&loaded)?;
    graph.summary();

    let pool = bootstrap::build_pool(&loaded, args.threads);
    info!("gantryd running with {} routing workers", pool.worker_count());

    if let Some(raw) = loaded.globals.get("rebalance_period") {
        let param = config::Param::new(
            "rebalance_period",
            "session rebalancing interval",
            config::ParamKind::Duration,
        );
        let period = param
            .parse(raw)
            .map_err(|e| anyhow::anyhow!("rebalance_period: {e}"))?
            .as_duration()
            .unwrap_or_default();
        let threshold: i64 = loaded
            .globals
            .get("rebalance_threshold")
            .and_then(|t| t.parse().ok())
            .unwrap_or(20);
        if !period.is_zero() {
            std::sync::Arc::clone(&pool).start_rebalance(period, threshold);
        }
    }

    let diff_commands = Arc::new(DiffCommands::new(Arc::clone(&pool)));
    graph.register_diff_objects(&diff_commands);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("GANTRY_MAIN")
        .build()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownMessage::Init);
    start_monitors(&graph, &runtime, &shutdown_rx);

    for filter_name in &graph.autostart_captures {
        match graph.capture_commands.start(filter_name, None, None, None) {
            Ok(out) => info!("capture '{filter_name}' started at boot: {out}"),
            Err(e) => warn!("capture '{filter_name}' could not start: {}", e.0),
        }
    }

    runtime.block_on(async {
        let mut listener_tasks = Vec::new();
        for listener in graph.listeners {
            let pool = Arc::clone(&pool);
            let shutdown_rx = shutdown_rx.clone();
            listener_tasks.push(tokio::spawn(async move {
                if let Err(e) = listener.run(pool, shutdown_rx).await {
                    warn!("listener '{}' failed: {e}", listener.name());
                }
            }));
        }

        let shutdown_msg = shutdown_signal().await;
        if let ShutdownMessage::Cancel(msg) = &shutdown_msg {
            info!("{msg}");
        }
        shutdown_tx.send(shutdown_msg).ok();
        for task in listener_tasks {
            let _ = task.await;
        }
    });

    pool.shutdown();
    Ok(())
}
