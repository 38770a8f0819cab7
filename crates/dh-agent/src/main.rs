//! Dockhand agent daemon
//!
//! Registers the node with the control plane, keeps the container engine
//! running and up to date, and exposes it through a NAT tunnel when the
//! node cannot be reached directly.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use dh_agent::backoff::RetryPolicy;
use dh_agent::client::{http_client, ControlPlaneClient};
use dh_agent::credentials;
use dh_agent::distributor::{BinaryDistributor, GpgVerifier, UpdatePaths};
use dh_agent::lifecycle::{exit_process, Coordinator, Maintenance};
use dh_agent::logging;
use dh_agent::registration::{FileIdentityStore, NodeEndpoints, RegistrationEngine};
use dh_agent::supervisor::{set_own_priority, spawn_priority_guard, DaemonCommand, Supervisor, AGENT_PRIORITY};
use dh_agent::telemetry::TelemetrySink;
use dh_agent::tunnel::{TunnelConfig, TunnelManager};
use dh_agent::{DaemonHandle, SharedConfig, TerminationState};
use dh_core::config::{load_config, save_config};
use dh_core::{pidfile, AgentConfig, AgentPaths, AgentSettings, ConfigError};

/// Exit status of the fatal-error path
const FATAL_EXIT_CODE: i32 = 1;

#[derive(Parser)]
#[command(name = "dockhand-agent")]
#[command(about = "Dockhand agent - registers this node and supervises its container engine")]
#[command(version)]
struct Args {
    /// Enable debug mode (daemon debug output, request tracing)
    #[arg(long)]
    debug: bool,

    /// Print log to stdout instead of the agent log file
    #[arg(long)]
    stdout: bool,

    /// Standalone mode, skipping registration with the control plane
    #[arg(long)]
    standalone: bool,

    /// Override 'DockerHost'
    #[arg(long)]
    docker_host: Option<String>,

    /// Additional flags passed to the docker daemon
    #[arg(long, default_value = "")]
    docker_opts: String,

    /// Override 'TutumHost'
    #[arg(long)]
    tutum_host: Option<String>,

    /// Override 'TutumToken'
    #[arg(long)]
    tutum_token: Option<String>,

    /// Override 'TutumUUID'
    #[arg(long)]
    tutum_uuid: Option<String>,

    /// Token for the public tunnel service
    #[arg(long)]
    ngrok_token: Option<String>,

    /// Never open a NAT tunnel
    #[arg(long)]
    skip_nat_tunnel: bool,

    /// Filesystem root all agent paths are resolved under
    #[arg(long, default_value = "/")]
    root: PathBuf,

    /// Endpoint receiving error reports
    #[arg(long, env = "DOCKHAND_TELEMETRY_URL")]
    telemetry_url: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Set items in the config file and exit
    ///
    /// Supported items: CertCommonName, DockerHost, TutumHost, TutumToken, TutumUUID
    Set {
        #[arg(required = true, value_name = "KEY=VALUE")]
        items: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let paths = AgentPaths::under(&args.root);

    if let Some(Command::Set { items }) = &args.command {
        let path = paths.config_file();
        set_items(&path, items).with_context(|| format!("Failed to update {:?}", path))?;
        println!("Configuration saved to {}", path.display());
        return Ok(());
    }

    paths
        .create_dirs()
        .context("Failed to create agent directories")?;
    let log_file = logging::init(&args.log_level, args.debug, args.stdout, &paths.agent_log())?;
    tracing::info!("Dockhand agent {} starting...", env!("CARGO_PKG_VERSION"));

    let pid_file = paths.pid_file();
    pidfile::claim_pid_file(&pid_file).context("Failed to write PID file")?;

    let settings = AgentSettings::default();
    let retry = RetryPolicy::new(settings.backoff);
    let http = http_client().unwrap_or_else(|e| fatal(&pid_file, "Cannot build HTTP client", &e));
    let telemetry = TelemetrySink::spawn(http.clone(), args.telemetry_url.clone());

    let mut config = load_or_create(&paths.config_file()).unwrap_or_else(|e| {
        telemetry.report("Failed to load configuration file", &e, None);
        fatal(&pid_file, "Failed to load configuration file", &e)
    });
    apply_overrides(&mut config, &args);
    let shared = SharedConfig::new(config);

    let snapshot = shared.snapshot();
    let client = ControlPlaneClient::new(http.clone(), &snapshot.tutum_host, &snapshot.tutum_token)
        .with_debug(args.debug);

    // Registration
    let mut endpoints = NodeEndpoints::default();
    let engine = if args.standalone {
        let common_name = match snapshot.cert_common_name.as_str() {
            "" => "*",
            name => name,
        };
        if let Err(e) = credentials::ensure_certificates(&paths.key_file(), &paths.cert_file(), common_name) {
            fatal(&pid_file, "Cannot create TLS certificate", &e);
        }
        None
    } else {
        let store = Arc::new(FileIdentityStore::new(paths.config_file()));
        let mut engine = RegistrationEngine::new(client.clone(), shared.clone(), store, paths.clone(), retry)
            .with_verify_retry_interval(settings.verify_retry_interval)
            .with_telemetry(telemetry.clone());
        if let Err(e) = engine.register().await {
            fatal(&pid_file, "Registration failed", &e);
        }
        endpoints = engine.endpoints().clone();
        Some(engine)
    };

    // Container engine binary
    let distributor = BinaryDistributor::new(http.clone(), retry, Arc::new(GpgVerifier::new()));
    distributor
        .ensure_present(
            &endpoints.docker_binary_url,
            &paths.docker_binary(),
            Some(paths.docker_symlink()),
        )
        .await;

    // Supervision and signals
    let snapshot = shared.snapshot();
    let spec = DaemonCommand::new(paths.docker_binary(), &snapshot.docker_host)
        .tls(&paths.cert_file(), &paths.key_file(), &paths.ca_file())
        .debug(args.debug)
        .extra_options(&args.docker_opts)
        .build();
    let handle = DaemonHandle::new();
    let termination = Arc::new(TerminationState::new());
    let supervisor = Supervisor::new(
        spec,
        paths.docker_log(),
        handle.clone(),
        termination.clone(),
        telemetry.clone(),
    )
    .with_stop_poll_interval(settings.stop_poll_interval)
    .with_crash_log_lines(settings.crash_log_lines);

    let _signals = Coordinator::new(supervisor.clone(), termination.clone(), &pid_file, log_file)
        .install()
        .unwrap_or_else(|e| fatal(&pid_file, "Cannot install signal handlers", &e));

    if let Err(e) = set_own_priority(AGENT_PRIORITY) {
        tracing::warn!("Cannot renice agent to {}: {}", AGENT_PRIORITY, e);
    }
    spawn_priority_guard(handle.clone(), settings.priority_scan_interval);

    tracing::info!("Starting docker daemon...");
    if let Err(e) = supervisor.start() {
        tracing::error!("Cannot start docker daemon: {}", e);
        telemetry.report("Cannot start docker daemon", &e, None);
    }

    // Tunnel and verification
    if let Some(engine) = &engine {
        if !endpoints.ngrok_binary_url.is_empty() {
            tracing::info!("Downloading NAT tunnel module...");
            distributor
                .ensure_present(&endpoints.ngrok_binary_url, &paths.ngrok_binary(), None)
                .await;
        }

        if args.skip_nat_tunnel {
            tracing::info!("Skip NAT tunnel");
        } else {
            tracing::info!("Loading NAT tunnel module...");
            let tunnel = TunnelConfig {
                binary: paths.ngrok_binary(),
                log_path: paths.ngrok_log(),
                config_path: paths.ngrok_config(),
                public_ip: endpoints.public_ip.clone(),
                common_name: snapshot.cert_common_name.clone(),
                port: snapshot.docker_port(),
                auth_token: args.ngrok_token.clone().filter(|t| !t.is_empty()),
            };
            let manager = TunnelManager::new(client.clone(), shared.clone(), retry).with_intervals(
                settings.port_poll_interval,
                settings.probe_timeout,
                settings.tunnel_restart_delay,
            );
            tokio::spawn(manager.run(tunnel));
        }

        engine.spawn_verification();
    }

    tracing::info!("Docker server started. Entering maintenance loop");
    Maintenance::new(
        distributor,
        supervisor,
        termination,
        UpdatePaths::from_layout(&paths),
        settings.heartbeat_interval,
        settings.stop_deadline,
    )
    .run()
    .await;

    Ok(())
}

/// Log the final error line and leave through the fatal path
fn fatal(pid_file: &Path, what: &str, error: &dyn std::fmt::Display) -> ! {
    tracing::error!("{}: {}", what, error);
    exit_process(pid_file, FATAL_EXIT_CODE)
}

/// Load the config file, creating it with defaults when missing
fn load_or_create(path: &Path) -> Result<AgentConfig, ConfigError> {
    tracing::info!("Checking if config file exists...");
    if !path.exists() {
        save_config(path, &AgentConfig::default())?;
    }
    tracing::info!("Loading configuration file...");
    Ok(load_config::<AgentConfig>(path)?.with_defaults())
}

fn set_items(path: &Path, items: &[String]) -> Result<(), ConfigError> {
    let mut config = match load_config::<AgentConfig>(path) {
        Ok(config) => config,
        Err(ConfigError::NotFound(_)) => AgentConfig::default(),
        Err(e) => return Err(e),
    };
    for item in items {
        config.set_item(item)?;
    }
    save_config(path, &config)
}

fn apply_overrides(config: &mut AgentConfig, args: &Args) {
    let overrides = [
        ("DockerHost", &args.docker_host, &mut config.docker_host),
        ("TutumHost", &args.tutum_host, &mut config.tutum_host),
        ("TutumToken", &args.tutum_token, &mut config.tutum_token),
        ("TutumUUID", &args.tutum_uuid, &mut config.tutum_uuid),
    ];
    for (name, value, field) in overrides {
        if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
            if name == "TutumToken" {
                tracing::info!("Override '{}' from command line flag", name);
            } else {
                tracing::info!("Override '{}' from command line flag: {}", name, value);
            }
            *field = value.to_string();
        }
    }
}
