use std::path::PathBuf;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::sync::watch;

use catalogd::config::{self, Config, TlsPaths};
use catalogd::error::{Error, Result};
use catalogd::reconciler::Reconciler;
use catalogd::secrets::CredentialBridge;
use catalogd::{
    gc, server, ImagePuller, InMemoryRecordStore, LocalDirStorage, RecordStore, RegistryClient,
    UnpackCache,
};

#[derive(Parser)]
#[command(name = "catalogd", about = "Catalog content service for cluster catalogs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print the catalogd version and exit
    Version,
    /// Run the catalog reconciler daemon
    Serve(ServeArgs),
}

#[derive(Args)]
struct ServeArgs {
    /// Address the metrics endpoint binds to; requires TLS
    #[arg(long, default_value = "")]
    metrics_bind_address: String,

    /// Address the probe endpoint binds to
    #[arg(long, default_value = ":8081")]
    health_probe_bind_address: String,

    /// Address the pprof endpoint binds to; empty disables profiling
    #[arg(long, default_value = "")]
    pprof_bind_address: String,

    /// Enable leader election so only one replica reconciles
    #[arg(long)]
    leader_elect: bool,

    /// Namespace for internal state; discovered in-cluster when empty
    #[arg(long, default_value = "")]
    system_namespace: String,

    /// Address the catalog content server binds to
    #[arg(long, default_value = ":8443")]
    catalogs_server_addr: String,

    /// Host used in content URLs written to catalog status
    #[arg(long, default_value = "")]
    external_address: String,

    /// Directory for caches: unpack tree, staging, served content
    #[arg(long, default_value = "/var/cache")]
    cache_dir: PathBuf,

    /// Interval between unpack cache garbage collections
    #[arg(long, default_value = "12h")]
    gc_interval: String,

    /// Certificate for serving catalog content over TLS
    #[arg(long, default_value = "")]
    tls_cert: String,

    /// Key for serving catalog content over TLS
    #[arg(long, default_value = "")]
    tls_key: String,

    /// Port the admission webhook server binds to
    #[arg(long, default_value_t = 9443)]
    webhook_server_port: u16,

    /// Directory of additional CA certificates trusted for registry pulls
    #[arg(long)]
    ca_certs_dir: Option<PathBuf>,

    /// Pull secret used for all catalog images, as <namespace>/<name>
    #[arg(long, default_value = "")]
    global_pull_secret: String,
}

fn main() {
    let cli = Cli::parse();
    let result = match cli.command {
        Command::Version => {
            println!("catalogd version {}", catalogd::version::version());
            Ok(())
        }
        Command::Serve(args) => serve(args),
    };
    if let Err(e) = result {
        eprintln!("catalogd: {}", e);
        std::process::exit(1);
    }
}

fn serve(args: ServeArgs) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let options = validate(&args)?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| Error::Config(format!("failed to start runtime: {}", e)))?
        .block_on(run(options))
}

struct ServeOptions {
    config: Config,
    metrics_addr: Option<String>,
    global_pull_secret: Option<(String, String)>,
    leader_elect: bool,
    webhook_server_port: u16,
}

fn validate(args: &ServeArgs) -> Result<ServeOptions> {
    // The certificate and key only make sense as a pair.
    let tls = match (args.tls_cert.is_empty(), args.tls_key.is_empty()) {
        (true, true) => None,
        (false, false) => Some(TlsPaths {
            cert: PathBuf::from(&args.tls_cert),
            key: PathBuf::from(&args.tls_key),
        }),
        _ => {
            return Err(Error::Config(
                "tls-cert and tls-key flags must be used together".to_string(),
            ))
        }
    };

    // Metrics are only served over TLS. With TLS configured and no explicit
    // address, metrics come up on the default port.
    let metrics_addr = match (&tls, args.metrics_bind_address.as_str()) {
        (None, "") => None,
        (None, _) => {
            return Err(Error::Config(
                "metrics-bind-address requires tls-cert and tls-key".to_string(),
            ))
        }
        (Some(_), "") => Some(":7443".to_string()),
        (Some(_), addr) => Some(addr.to_string()),
    };

    let global_pull_secret = if args.global_pull_secret.is_empty() {
        None
    } else {
        Some(config::parse_namespaced_name(&args.global_pull_secret)?)
    };

    let gc_interval = config::parse_duration(&args.gc_interval)?;
    let system_namespace = config::discover_system_namespace(&args.system_namespace);

    let mut config = Config::new(args.cache_dir.clone());
    config.catalogs_addr = normalize_addr(&args.catalogs_server_addr);
    config.probe_addr = normalize_addr(&args.health_probe_bind_address);
    config.external_address = if args.external_address.is_empty() {
        format!("catalogd-service.{}.svc", system_namespace)
    } else {
        args.external_address.clone()
    };
    config.system_namespace = system_namespace;
    config.gc_interval = gc_interval;
    config.tls = tls;
    config.ca_certs_dir = args.ca_certs_dir.clone();

    if !args.pprof_bind_address.is_empty() {
        tracing::warn!(
            addr = %args.pprof_bind_address,
            "profiling endpoint is not available in this build; flag ignored"
        );
    }

    Ok(ServeOptions {
        config,
        metrics_addr: metrics_addr.map(|a| normalize_addr(&a)),
        global_pull_secret,
        leader_elect: args.leader_elect,
        webhook_server_port: args.webhook_server_port,
    })
}

/// Accept Go-style `:8443` listen addresses alongside full `host:port`.
fn normalize_addr(addr: &str) -> String {
    if let Some(port) = addr.strip_prefix(':') {
        format!("0.0.0.0:{}", port)
    } else {
        addr.to_string()
    }
}

async fn run(options: ServeOptions) -> Result<()> {
    let config = options.config;
    config::ensure_layout(&config)?;

    tracing::info!(
        version = %catalogd::version::version(),
        cache_dir = %config.cache_dir.display(),
        namespace = %config.system_namespace,
        "starting catalogd"
    );
    if options.leader_elect {
        tracing::info!("leader election requested; this build runs as the sole leader");
    }
    tracing::info!(
        port = options.webhook_server_port,
        "admission defaulting is applied by the record store in this build"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Credential bridge: the watched pull-secret feed is an external
    // collaborator; the daemon owns the channel and the on-disk mirror.
    let bridge = Arc::new(CredentialBridge::new(&config.tmp_root())?);
    let (_secret_tx, secret_rx) = watch::channel::<Option<Vec<u8>>>(None);
    if let Some((namespace, name)) = &options.global_pull_secret {
        tracing::info!(
            secret = %format!("{}/{}", namespace, name),
            path = %bridge.path().display(),
            "watching global pull secret"
        );
    }

    let registry = Arc::new(RegistryClient::new(
        bridge.path().to_path_buf(),
        config.ca_certs_dir.as_deref(),
    )?);
    let cache = UnpackCache::new(config.unpack_root())?;
    let storage = Arc::new(LocalDirStorage::new(config.served_root(), config.base_url())?);
    let puller = Arc::new(ImagePuller::new(
        cache.clone(),
        registry,
        config.tmp_root(),
        config.layer_concurrency,
    ));

    let store: Arc<dyn RecordStore> = Arc::new(InMemoryRecordStore::new());
    let reconciler = Reconciler::new(store.clone(), puller, storage.clone(), cache.clone());

    let mut tasks = Vec::new();

    // Reconciler workers.
    tasks.push(tokio::spawn(
        reconciler.clone().run(config.worker_count, shutdown_rx.clone()),
    ));

    // Garbage collector, on its own timer.
    tasks.push(tokio::spawn(gc::run(
        store.clone(),
        cache.clone(),
        config.gc_interval,
        shutdown_rx.clone(),
    )));

    // Credential bridge; a secret change revalidates every catalog.
    {
        let bridge = bridge.clone();
        let reconciler = reconciler.clone();
        let shutdown_rx = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            let on_change = move || {
                let reconciler = reconciler.clone();
                tokio::spawn(async move {
                    if let Err(e) = reconciler.enqueue_all().await {
                        tracing::error!(error = %e, "failed to revalidate catalogs");
                    }
                });
            };
            bridge.run(secret_rx, on_change, shutdown_rx).await;
        }));
    }

    // Content server, probe server, and (with TLS) the metrics endpoint.
    {
        let router = server::catalogs_router(storage.clone());
        let addr = config.catalogs_addr.clone();
        let tls = config.tls.clone();
        let shutdown_rx = shutdown_rx.clone();
        let timeout = config.shutdown_timeout;
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server::serve(&addr, router, tls, shutdown_rx, timeout).await {
                tracing::error!(error = %e, "catalog server exited");
            }
        }));
    }
    {
        let addr = config.probe_addr.clone();
        let shutdown_rx = shutdown_rx.clone();
        let timeout = config.shutdown_timeout;
        tasks.push(tokio::spawn(async move {
            if let Err(e) =
                server::serve(&addr, server::probe_router(), None, shutdown_rx, timeout).await
            {
                tracing::error!(error = %e, "probe server exited");
            }
        }));
    }
    if let Some(metrics_addr) = options.metrics_addr {
        let router = axum::Router::new().route(
            "/metrics",
            axum::routing::get(|| async { "# catalogd metrics\n" }),
        );
        let tls = config.tls.clone();
        let shutdown_rx = shutdown_rx.clone();
        let timeout = config.shutdown_timeout;
        tasks.push(tokio::spawn(async move {
            if let Err(e) = server::serve(&metrics_addr, router, tls, shutdown_rx, timeout).await {
                tracing::error!(error = %e, "metrics server exited");
            }
        }));
    }

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| Error::Config(format!("failed to listen for shutdown signal: {}", e)))?;
    tracing::info!("shutting down");
    let _ = shutdown_tx.send(true);

    let drain = async {
        for task in tasks {
            let _ = task.await;
        }
    };
    if tokio::time::timeout(config.shutdown_timeout, drain)
        .await
        .is_err()
    {
        tracing::warn!("shutdown timed out before all tasks drained");
    }
    Ok(())
}
