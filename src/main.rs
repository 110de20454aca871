//! Cluster Operator - Single-Writer Replication for MariaDB
//!
//! Runs a cluster node, bulk-imports SQL dumps through a node's gateway,
//! and queries node status.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use clap::{Parser, Subcommand};
use ed25519_dalek::{Signer, SigningKey};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cluster_operator::api::{AppState, HttpServer};
use cluster_operator::auth::{AllowList, Ed25519Verifier, IdentityService};
use cluster_operator::backlog::Backlog;
use cluster_operator::config::OperatorConfig;
use cluster_operator::error::{Error, Result};
use cluster_operator::executor::{MariaDbExecutor, QueryExecutor, RecordingExecutor};
use cluster_operator::import::{ExecutorSink, ImportReport, Importer, StatementSink};
use cluster_operator::network::{ClusterGateway, GatewayClient, GatewayContext};
use cluster_operator::replication::{
    CoordinatorConfig, FanOut, QueryRouter, ReplicationCoordinator, WritePath,
};
use cluster_operator::state::ClusterMembership;

/// Cluster Operator - Single-Writer Replication for MariaDB
#[derive(Parser)]
#[command(name = "cluster-operator")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "cluster-operator.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a cluster node
    Start {
        /// Act as master without probing peers (initial cluster bootstrap)
        #[arg(long)]
        bootstrap: bool,
    },

    /// Import .sql files or directories through a node's gateway
    Import {
        /// Files or directories to import
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Gateway address of any cluster node
        #[arg(short, long, default_value = "127.0.0.1:7071")]
        address: String,

        /// Base64 ed25519 secret key used to log in when the node requires sessions
        #[arg(long)]
        signing_key: Option<PathBuf>,

        /// Split and count statements without sending them
        #[arg(long)]
        dry_run: bool,
    },

    /// Show a node's status
    Status {
        /// Node API address to query
        #[arg(short, long, default_value = "localhost:8008")]
        address: String,
    },

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "cluster-operator.toml")]
        output: PathBuf,

        /// Node ID
        #[arg(long, default_value = "node-1")]
        node_id: String,

        /// Gateway address peers use to reach this node
        #[arg(long, default_value = "127.0.0.1:7071")]
        advertise_address: String,
    },

    /// Validate configuration file
    Validate,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Config level applies when no override is given; commands that do not
    // need a config file fall back to "info"
    let level = cli.log_level.clone().unwrap_or_else(|| {
        OperatorConfig::from_file(&cli.config)
            .map(|c| c.logging.level)
            .unwrap_or_else(|_| "info".to_string())
    });
    init_logging(&level);

    match cli.command {
        Commands::Start { bootstrap } => run_start(cli.config, bootstrap).await,
        Commands::Import {
            paths,
            address,
            signing_key,
            dry_run,
        } => run_import(paths, address, signing_key, dry_run).await,
        Commands::Status { address } => run_status(address).await,
        Commands::Init {
            output,
            node_id,
            advertise_address,
        } => run_init(output, node_id, advertise_address),
        Commands::Validate => run_validate(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start a cluster node
async fn run_start(config_path: PathBuf, bootstrap: bool) -> Result<()> {
    tracing::info!("Starting cluster operator node...");

    let mut config = match OperatorConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            return Err(e);
        }
    };
    if bootstrap {
        config.cluster.bootstrap = true;
    }
    tracing::info!("Loaded configuration for node: {}", config.node.id);

    if let Err(e) = std::fs::create_dir_all(config.data_dir()) {
        tracing::error!("Failed to create data directory {:?}: {}", config.data_dir(), e);
        return Err(e.into());
    }

    let backlog = Arc::new(Backlog::open(&config.backlog_path())?);
    tracing::info!(
        "Backlog opened at {:?}, sequence {}",
        config.backlog_path(),
        backlog.sequence_number()
    );

    let executor: Arc<dyn QueryExecutor> = match MariaDbExecutor::new(&config.database).await {
        Ok(e) => Arc::new(e),
        Err(e) => {
            tracing::error!("Failed to connect to MariaDB: {}", e);
            return Err(e);
        }
    };

    let membership = Arc::new(ClusterMembership::new(config.advertise_address().to_string()));
    for peer in config.peer_addresses() {
        membership.add_peer(peer).await;
    }
    tracing::info!("Known peers: {:?}", membership.peer_addresses().await);

    let fanout = FanOut::new();
    let write_path = Arc::new(WritePath::new(
        Arc::clone(&executor),
        Arc::clone(&backlog),
        Arc::clone(&fanout),
    ));
    let coordinator = Arc::new(ReplicationCoordinator::new(
        CoordinatorConfig::from_config(&config),
        Arc::clone(&membership),
        Arc::clone(&backlog),
        Arc::clone(&executor),
    ));
    let router = Arc::new(QueryRouter::new(
        Arc::clone(&executor),
        write_path,
        Arc::clone(&coordinator),
    ));

    let identity = Arc::new(IdentityService::new(&config.auth));
    let verifier = Ed25519Verifier::from_config(&config.auth)?;
    tracing::info!("Login keys configured: {}", verifier.key_count());
    identity.init(verifier)?;

    let gateway = Arc::new(ClusterGateway::new(
        config.node.bind_address.clone(),
        GatewayContext {
            router,
            backlog: Arc::clone(&backlog),
            membership: Arc::clone(&membership),
            fanout: Arc::clone(&fanout),
            identity: Arc::clone(&identity),
            allow_list: AllowList::new(&config.gateway.allow_list),
            require_session: config.require_login(),
            page_size: config.backlog.page_size,
            subscriber_buffer: config.gateway.subscriber_buffer,
        },
    ));
    let listener = match TcpListener::bind(&config.node.bind_address).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!("Failed to bind gateway to {}: {}", config.node.bind_address, e);
            return Err(e.into());
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let gateway_handle = {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move {
            if let Err(e) = gateway.serve(listener).await {
                tracing::error!("Gateway error: {}", e);
            }
        })
    };

    let health_handle = {
        let coordinator = Arc::clone(&coordinator);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { coordinator.run_health_checks(shutdown).await })
    };

    let rotation_handle = {
        let identity = Arc::clone(&identity);
        let period = Duration::from_secs(config.auth.login_phrase_rotation_secs.max(1));
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { identity.rotate_phrases(period, shutdown).await })
    };

    let http_handle = {
        let server = HttpServer::new(
            config.api.clone(),
            AppState {
                node_id: config.node.id.clone(),
                coordinator: Arc::clone(&coordinator),
                membership: Arc::clone(&membership),
                backlog: Arc::clone(&backlog),
                fanout: Arc::clone(&fanout),
                executor: Arc::clone(&executor),
                started_at: Instant::now(),
            },
        );
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = server.start(shutdown).await {
                tracing::error!("HTTP API error: {}", e);
            }
        })
    };

    tracing::info!("Node {} running at {}", config.node.id, config.advertise_address());

    let result = tokio::select! {
        result = coordinator.run(shutdown_rx) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal");
            Ok(())
        }
    };

    // Cleanup
    let _ = shutdown_tx.send(true);
    gateway.stop();
    for handle in [gateway_handle, health_handle, rotation_handle, http_handle] {
        if tokio::time::timeout(Duration::from_secs(5), handle).await.is_err() {
            tracing::warn!("Task did not stop in time");
        }
    }

    match &result {
        Ok(()) => tracing::info!("Cluster operator shutdown complete"),
        Err(e) => tracing::error!("Cluster operator stopped: {}", e),
    }
    result
}

/// Import SQL dumps
async fn run_import(
    paths: Vec<PathBuf>,
    address: String,
    signing_key: Option<PathBuf>,
    dry_run: bool,
) -> Result<()> {
    let recorder = Arc::new(RecordingExecutor::new());
    let sink: Arc<dyn StatementSink> = if dry_run {
        tracing::info!("Dry run: statements are split and counted, not sent");
        Arc::new(ExecutorSink(recorder.clone()))
    } else {
        let client = GatewayClient::connect(
            &address,
            Duration::from_secs(10),
            Duration::from_secs(300),
            None,
        )
        .await?;
        if let Some(path) = signing_key {
            login(&client, &path).await?;
        }
        Arc::new(client)
    };

    let importer = Importer::new(sink)
        .on_progress(|p| {
            tracing::debug!(
                "[{}/{}] {}: {}/{} bytes",
                p.file_no,
                p.total_files,
                p.file_path.display(),
                p.bytes_processed,
                p.total_bytes
            );
        })
        .on_file_completed(|done| match done.error {
            None => println!("[{}/{}] ✓ {}", done.file_no, done.total_files, done.file_path.display()),
            Some(e) => println!(
                "[{}/{}] ✗ {}: {}",
                done.file_no,
                done.total_files,
                done.file_path.display(),
                e
            ),
        });

    let report = importer.import(&paths).await?;
    print_report(&report);
    if dry_run {
        println!("Statements split: {}", recorder.executed().len());
    }

    match report.failed.first() {
        None => Ok(()),
        Some(failed) => Err(Error::Import {
            path: failed.path.display().to_string(),
            reason: format!("{} of {} file(s) failed", report.failed.len(), report.failed.len() + report.imported.len()),
        }),
    }
}

/// Log in with a base64 ed25519 secret key file
async fn login(client: &GatewayClient, key_path: &std::path::Path) -> Result<()> {
    let content = std::fs::read_to_string(key_path)?;
    let bytes = BASE64
        .decode(content.trim())
        .map_err(|e| Error::Config(format!("Invalid signing key encoding: {}", e)))?;
    let secret: [u8; 32] = bytes
        .try_into()
        .map_err(|_| Error::Config("Invalid signing key length (expected 32 bytes)".into()))?;
    let key = SigningKey::from_bytes(&secret);

    let phrase = client.get_login_phrase().await?;
    let signature = BASE64.encode(key.sign(phrase.as_bytes()).to_bytes());
    client.login(&phrase, &signature).await?;
    tracing::info!("Logged in to {}", client.address());
    Ok(())
}

fn print_report(report: &ImportReport) {
    println!();
    println!("Imported:   {} file(s)", report.imported.len());
    println!("Failed:     {} file(s)", report.failed.len());
    println!("Statements: {}", report.statements);
    for failed in &report.failed {
        println!("  {}: {}", failed.path.display(), failed.error);
    }
}

/// Check node status
async fn run_status(address: String) -> Result<()> {
    for endpoint in ["status", "cluster"] {
        let url = format!("http://{}/{}", address, endpoint);
        let response = match reqwest::get(&url).await {
            Ok(r) => r,
            Err(e) => {
                eprintln!("Failed to get {}: {}", endpoint, e);
                return Err(Error::Network(e.to_string()));
            }
        };
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::Network(e.to_string()))?;
        let pretty = serde_json::to_string_pretty(&body).map_err(|e| Error::Internal(e.to_string()))?;
        println!("{}", pretty);
    }
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, node_id: String, advertise_address: String) -> Result<()> {
    let config_content = config_template(&node_id, &advertise_address);

    // The template must stay loadable
    OperatorConfig::from_str(&config_content)?;

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your database and cluster settings.");
    println!(
        "Then start with: cluster-operator --config {} start",
        output.display()
    );

    Ok(())
}

fn config_template(node_id: &str, advertise_address: &str) -> String {
    format!(
        r#"# Cluster Operator Configuration
# Generated configuration file

[node]
id = "{node_id}"
bind_address = "0.0.0.0:7071"
data_dir = "/var/lib/cluster-operator/{node_id}"
# Must be the address peers dial; nodes compare these to pick a master
advertise_address = "{advertise_address}"

[database]
host = "localhost"
port = 3306
user = "root"
password = "changeme"
# database = "myapp"
pool_size = 1
connect_timeout_secs = 30
query_timeout_secs = 300

[backlog]
page_size = 100

[cluster]
bootstrap = false
peers = []
# peers = ["node-2.example.com:7071", "node-3.example.com:7071"]
discovery_retry_ms = 5000
health_check_interval_secs = 120

[gateway]
allow_list = ["127.0.0.1", "::1"]
require_session = false
subscriber_buffer = 4096

[auth]
# owner_key = "base64 ed25519 public key"
admin_keys = []
session_ttl_secs = 86400
login_phrase_rotation_secs = 900
login_max_age_secs = 1800

[api]
enabled = true
bind_address = "0.0.0.0:8008"

[logging]
level = "info"
"#
    )
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match OperatorConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Node ID: {}", config.node.id);
            println!("  Gateway: {}", config.node.bind_address);
            println!("  Advertise: {}", config.advertise_address());
            println!(
                "  Database: {}@{}:{}/{}",
                config.database.user,
                config.database.host,
                config.database.port,
                config.database.database.as_deref().unwrap_or("(all)")
            );
            println!("  Peers: {}", config.peer_addresses().len());
            println!("  Bootstrap: {}", config.cluster.bootstrap);
            println!("  Sessions required: {}", config.require_login());
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}
