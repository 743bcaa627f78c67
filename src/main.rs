use clap::Parser;
use log::{error, info, warn};
use ruche::configuration::Config;
use ruche::control_plane::ControlPlane;
use ruche::router::FrontendRouter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;

#[derive(Parser)]
#[command(name = "ruche")]
#[command(version)]
#[command(about = "A remotely drivable Linux sandbox control plane")]
struct Args {
    /// Optional TOML configuration file
    config_file: Option<PathBuf>,

    /// Override the control-plane port
    #[arg(long, env = "RUCHE_CONTROL_PORT")]
    control_port: Option<u16>,

    /// Override the front-end router port
    #[arg(long, env = "RUCHE_ROUTER_PORT")]
    router_port: Option<u16>,

    /// Also run the front-end preview router in this process
    #[arg(long)]
    with_router: bool,
}

#[tokio::main]
async fn main() {
    // Respect RUST_LOG for the overall level; keep the HTTP stack quiet.
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("hyper", log::LevelFilter::Warn)
        .filter_module("reqwest", log::LevelFilter::Warn)
        .filter_module("tungstenite", log::LevelFilter::Warn)
        .format_target(false)
        .init();

    println!(
        "
    ██████╗ ██╗   ██╗ ██████╗██╗  ██╗███████╗
    ██╔══██╗██║   ██║██╔════╝██║  ██║██╔════╝
    ██████╔╝██║   ██║██║     ███████║█████╗
    ██╔══██╗██║   ██║██║     ██╔══██║██╔══╝
    ██║  ██║╚██████╔╝╚██████╗██║  ██║███████╗
    ╚═╝  ╚═╝ ╚═════╝  ╚═════╝╚═╝  ╚═╝╚══════╝
    ==========================================
      Remotely drivable sandbox v{}
    ==========================================
    ",
        env!("CARGO_PKG_VERSION")
    );

    let args = Args::parse();

    let mut config = match &args.config_file {
        Some(path) => match Config::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("Failed to load configuration from {}: {}", path.display(), e);
                std::process::exit(1);
            }
        },
        None => Config::from_env(),
    };
    if let Some(port) = args.control_port {
        config.control_port = port;
    }
    if let Some(port) = args.router_port {
        config.router_port = port;
    }
    let config = Arc::new(config);

    info!("Ruche control plane starting up");

    let plane = ControlPlane::new(config.clone());
    let registry = plane.registry();
    let reaper = registry.spawn_reaper(Duration::from_secs(30));

    let control_task = tokio::spawn(async move {
        plane.start().await;
    });

    let router_task = if args.with_router {
        let router = Arc::new(FrontendRouter::new(config.clone()));
        info!("Front-end router enabled on port {}", config.router_port);
        Some(tokio::spawn(router.start()))
    } else {
        None
    };

    info!("Ruche is now operational");

    match signal::ctrl_c().await {
        Ok(()) => {
            info!("Shutdown signal received, stopping sandbox...");
        }
        Err(e) => {
            error!("Failed to listen for shutdown signal: {}", e);
        }
    }

    // Tear down every sandbox (shells, processes, kernels) with a bounded
    // grace period, then stop the servers.
    match tokio::time::timeout(Duration::from_secs(10), registry.destroy_all()).await {
        Ok(()) => info!("Sandbox teardown completed"),
        Err(_) => warn!("Sandbox teardown timed out after 10 seconds"),
    }

    reaper.abort();
    if let Some(task) = router_task {
        task.abort();
    }
    control_task.abort();
    info!("Ruche shutdown completed");
}
