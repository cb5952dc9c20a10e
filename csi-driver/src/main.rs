//! Synology CSI Driver
//!
//! Kubernetes CSI driver that provisions volumes on Synology arrays and
//! attaches them on worker nodes.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::UnixListener;
use tokio::signal;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{Level, error, info, warn};
use tracing_subscriber::FmtSubscriber;

use synology_csi::config::{self, DriverConfig, NamingConfig, Timeouts};
use synology_csi::csi::controller_server::ControllerServer;
use synology_csi::csi::identity_server::IdentityServer;
use synology_csi::csi::node_server::NodeServer;
use synology_csi::identity::{DRIVER_NAME, DRIVER_VERSION};
use synology_csi::metrics;
use synology_csi::naming::Naming;
use synology_csi::platform::LinuxHost;
use synology_csi::types::FsGroupChangePolicy;
use synology_csi::{
    ArraySessionManager, ControllerService, IdentityService, NodeService, Provisioner, StagingEngine,
};

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "synology-csi-driver")]
#[command(about = "Synology CSI Driver for Kubernetes")]
struct Args {
    /// CSI endpoint (unix:///path/to/socket or tcp://host:port)
    #[arg(
        long,
        env = "CSI_ENDPOINT",
        default_value = "unix:///var/lib/kubelet/plugins/csi.san.synology.com/csi.sock"
    )]
    endpoint: String,

    /// Node ID for this CSI node (defaults to the hostname)
    #[arg(long = "nodeid", env = "CSI_NODE_ID")]
    node_id: Option<String>,

    /// Path to the array client-info YAML file
    #[arg(long, env = "CSI_CLIENT_INFO", default_value = "/etc/synology/client-info.yml")]
    client_info: PathBuf,

    /// Driver name
    #[arg(long, default_value = DRIVER_NAME)]
    driver_name: String,

    /// Serve the Controller service
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    controller: bool,

    /// Serve the Node service
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    node: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Debug logging, including DSM WebAPI request summaries
    #[arg(long)]
    debug: bool,

    /// Aggregate iSCSI sessions through dm-multipath
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    multipath: bool,

    /// When to re-apply the pod fsGroup (OnRootMismatch, Always, None)
    #[arg(long, default_value = "OnRootMismatch")]
    fsgroup_change_policy: FsGroupChangePolicy,

    #[arg(long, default_value = "k8s-csi")]
    iscsi_target_prefix: String,

    #[arg(long, default_value = "iqn.2000-01.com.synology:")]
    iscsi_iqn_prefix: String,

    #[arg(long, default_value = "k8s-csi")]
    iscsi_lun_prefix: String,

    #[arg(long, default_value = "k8s-csi")]
    share_prefix: String,

    #[arg(long, default_value = "{{.LunPrefix}}-{{.VolumeHandle}}")]
    lun_name_template: String,

    #[arg(long, default_value = "{{.SharePrefix}}-{{.VolumeHandle}}")]
    share_name_template: String,

    #[arg(long, default_value = "{{.PVCNamespace}}/{{.PVCName}}")]
    lun_description_template: String,

    #[arg(long, default_value = "{{.PVCNamespace}}/{{.PVCName}}")]
    share_description_template: String,

    #[arg(long, default_value = "snapshot-{{.SnapshotHandle}}")]
    lun_snapshot_name_template: String,

    #[arg(long, default_value = "snapshot-{{.SnapshotHandle}}")]
    share_snapshot_name_template: String,

    #[arg(long, default_value = "{{.VolumeSnapshotNamespace}}/{{.VolumeSnapshotName}}")]
    snapshot_description_template: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,

    #[arg(long, default_value_t = 15)]
    lock_timeout_secs: u64,

    #[arg(long, default_value_t = 30)]
    api_timeout_secs: u64,

    #[arg(long, default_value_t = 60)]
    device_timeout_secs: u64,

    #[arg(long, default_value_t = 60)]
    multipath_timeout_secs: u64,

    #[arg(long, default_value_t = 120)]
    command_timeout_secs: u64,
}

impl Args {
    fn driver_config(&self, node_id: String) -> DriverConfig {
        DriverConfig {
            multipath_enabled: self.multipath,
            fs_group_change_policy: self.fsgroup_change_policy,
            naming: NamingConfig {
                target_prefix: self.iscsi_target_prefix.clone(),
                iqn_prefix: self.iscsi_iqn_prefix.clone(),
                lun_prefix: self.iscsi_lun_prefix.clone(),
                share_prefix: self.share_prefix.clone(),
                lun_name_template: self.lun_name_template.clone(),
                share_name_template: self.share_name_template.clone(),
                lun_description_template: self.lun_description_template.clone(),
                share_description_template: self.share_description_template.clone(),
                lun_snapshot_name_template: self.lun_snapshot_name_template.clone(),
                share_snapshot_name_template: self.share_snapshot_name_template.clone(),
                snapshot_description_template: self.snapshot_description_template.clone(),
            },
            timeouts: Timeouts {
                lock: Duration::from_secs(self.lock_timeout_secs),
                api: Duration::from_secs(self.api_timeout_secs),
                device: Duration::from_secs(self.device_timeout_secs),
                multipath: Duration::from_secs(self.multipath_timeout_secs),
                command: Duration::from_secs(self.command_timeout_secs),
            },
            debug: self.debug,
            ..DriverConfig::new(self.driver_name.clone(), node_id)
        }
    }
}

/// Where the gRPC server listens.
enum Listen {
    Unix(PathBuf),
    Tcp(std::net::SocketAddr),
}

fn parse_endpoint(endpoint: &str) -> Result<Listen, String> {
    if let Some(path) = endpoint.strip_prefix("unix://") {
        if path.is_empty() {
            return Err(format!("Invalid endpoint '{endpoint}': empty socket path"));
        }
        return Ok(Listen::Unix(PathBuf::from(path)));
    }
    if let Some(addr) = endpoint.strip_prefix("tcp://") {
        return addr
            .parse()
            .map(Listen::Tcp)
            .map_err(|e| format!("Invalid endpoint '{endpoint}': {e}"));
    }
    Err(format!(
        "Invalid endpoint '{endpoint}': expected unix:// or tcp://"
    ))
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let level = if args.debug {
        Level::DEBUG
    } else {
        match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    let node_id = match &args.node_id {
        Some(id) => id.clone(),
        None => hostname::get()?.to_string_lossy().to_string(),
    };
    let config = Arc::new(args.driver_config(node_id));
    let listen = parse_endpoint(&args.endpoint)?;

    info!(
        driver_name = %config.driver_name,
        version = DRIVER_VERSION,
        endpoint = %args.endpoint,
        node_id = %config.node_id,
        controller_mode = args.controller,
        node_mode = args.node,
        multipath = config.multipath_enabled,
        "Starting Synology CSI Driver"
    );

    let naming = Naming::with_templates(config.naming.clone())?;

    let mut arrays = None;
    let controller = if args.controller {
        let clients = config::load_client_info(&args.client_info).await?;
        let manager = Arc::new(ArraySessionManager::with_dsm_clients(
            clients,
            &config.timeouts,
            config.debug,
        )?);
        let reachable = manager.login_all().await;
        let configured = manager.hosts().len();
        if reachable < configured {
            warn!(reachable, configured, "Not every array could be logged in to at startup");
        } else {
            info!(arrays = configured, "Logged in to all arrays");
        }
        let provisioner = Arc::new(Provisioner::new(&config, Arc::clone(&manager), naming.clone()));
        arrays = Some(manager);
        Some(ControllerServer::new(ControllerService::new(provisioner)))
    } else {
        None
    };

    let node = if args.node {
        let host = Arc::new(LinuxHost::new(config.timeouts.command));
        let engine = Arc::new(StagingEngine::new(&config, host, naming));
        Some(NodeServer::new(NodeService::new(engine, config.node_id.clone())))
    } else {
        None
    };

    let router = Server::builder()
        .add_service(IdentityServer::new(IdentityService::new(
            config.driver_name.clone(),
            args.controller,
        )))
        .add_optional_service(controller)
        .add_optional_service(node);

    let shutdown = async {
        shutdown_signal().await;
        info!("Shutdown signal received, draining connections...");
    };

    match listen {
        Listen::Unix(path) => {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            // A socket left behind by a previous instance blocks bind
            match tokio::fs::remove_file(&path).await {
                Ok(()) => info!(path = %path.display(), "Removed stale socket"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            let listener = UnixListener::bind(&path)?;
            info!(path = %path.display(), "gRPC server listening");
            router
                .serve_with_incoming_shutdown(UnixListenerStream::new(listener), shutdown)
                .await?;
        }
        Listen::Tcp(addr) => {
            info!(%addr, "gRPC server listening");
            router.serve_with_shutdown(addr, shutdown).await?;
        }
    }

    if let Some(arrays) = arrays {
        arrays.release_all().await;
    }

    info!("Synology CSI Driver shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or SIGHUP)
async fn shutdown_signal() {
    use signal::unix::{SignalKind, signal};

    // Install signal handlers, logging errors but continuing with available handlers
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to install SIGINT handler: {}", e);
            None
        }
    };

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => Some(s),
        Err(e) => {
            error!("Failed to install SIGHUP handler: {}", e);
            None
        }
    };

    async fn recv(handler: &mut Option<signal::unix::Signal>) {
        match handler {
            Some(handler) => {
                handler.recv().await;
            }
            None => std::future::pending().await,
        }
    }

    tokio::select! {
        _ = recv(&mut sigterm) => {
            info!("Received SIGTERM");
        }
        _ = recv(&mut sigint) => {
            info!("Received SIGINT");
        }
        _ = recv(&mut sighup) => {
            info!("Received SIGHUP, shutting down");
        }
    }
}
