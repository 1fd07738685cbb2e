//! slirpgate: user-space network gateway.
//!
//! Binds the configured local forwards on the host and relays their traffic
//! into the guest, preserving client addresses where the routing policy
//! allows it.

use clap::Parser;
use serde::Serialize;
use slirpgate::config::{CliOverrides, GatewayConfig};
use slirpgate::dns::read_resolv_conf;
use slirpgate::gateway::{Direction, Forwarder, HostStack, ListenerManager};
use slirpgate::GatewayState;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

/// slirpgate: user-space network gateway
#[derive(Parser, Debug)]
#[command(name = "slirpgate", version, about = "User-space network gateway")]
struct Cli {
    /// Local forward: host listens, guest receives
    /// (`<scheme>://[bind_ip:]bind_port:[target_ip:]target_port`)
    #[arg(short = 'L', long = "local", value_name = "RULE")]
    local: Vec<String>,

    /// Remote forward: guest connects, host receives
    #[arg(short = 'R', long = "remote", value_name = "RULE")]
    remote: Vec<String>,

    /// Config file path
    #[arg(long, default_value = "~/.slirpgate/config.toml")]
    config: String,

    /// Do not log individual connections
    #[arg(short, long)]
    quiet: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Print helper capabilities as JSON and exit
    #[arg(long)]
    print_capabilities: bool,

    /// Resolver configuration to advertise to the guest
    #[arg(long, value_name = "PATH")]
    resolv_conf: Option<String>,
}

#[derive(Serialize)]
struct Capabilities {
    #[serde(rename = "type")]
    kind: &'static str,
    features: [&'static str; 2],
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.print_capabilities {
        let caps = Capabilities {
            kind: "slirp-helper",
            features: ["ipv4", "ipv6"],
        };
        return match serde_json::to_string_pretty(&caps) {
            Ok(json) => {
                println!("{json}");
                ExitCode::SUCCESS
            }
            Err(e) => {
                eprintln!("cannot encode capabilities: {e}");
                ExitCode::FAILURE
            }
        };
    }

    // Initialize tracing
    use tracing_subscriber::EnvFilter;
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "starting slirpgate");

    let config_path = PathBuf::from(&cli.config);
    let config = match GatewayConfig::load(
        Some(&config_path),
        CliOverrides {
            local: &cli.local,
            remote: &cli.remote,
            quiet: cli.quiet,
            resolv_conf: cli.resolv_conf.as_deref(),
        },
    ) {
        Ok(cfg) => cfg,
        Err(e) => {
            error!(error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    let dns = read_resolv_conf(&config.resolv_conf);
    if dns.unknown_opt {
        info!(path = %config.resolv_conf.display(), "resolv.conf has unsupported options, ignored");
    }
    info!(servers = ?dns.servers, "guest nameservers");

    let state = Arc::new(GatewayState::new(&config, &dns));
    let forwarder = Arc::new(Forwarder::new(
        state.clone(),
        Arc::new(HostStack),
        Direction::Local,
    ));
    let listeners = ListenerManager::new(forwarder);

    let mut active = 0usize;
    for rule in &config.local_forwards {
        match listeners.start(Arc::new(rule.clone())).await {
            Ok(_) => active += 1,
            Err(e) => error!(rule = %rule, error = %e, "local forward disabled"),
        }
    }
    for rule in &config.remote_forwards {
        info!(rule = %rule, "remote forward registered, accepting on the guest side");
    }

    let (remote_tcp, remote_udp) = state.remote_counts();
    if active == 0 && remote_tcp + remote_udp == 0 {
        warn!("no forwards configured");
    }
    info!(
        local = active,
        remote_tcp,
        remote_udp,
        "gateway running"
    );

    shutdown_signal().await;
    // Listener loops and in-flight sessions end with the runtime.
    info!("received shutdown signal, closing");
    ExitCode::SUCCESS
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(e) => {
                warn!(error = %e, "cannot install SIGTERM handler");
                ctrl_c.await.ok();
            }
        }
    }

    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
    }
}
