use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use clap::{Parser, Subcommand, ValueEnum};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use driftwatch::clients::{
    ConfigMapSettingsProvider, HttpManifestSource, KubeAppStore, KubeConnector,
    KubeProjectStore, SecretClusterRegistry, SettingsProvider,
};
use driftwatch::controller::autosync::{
    SelfHealConfig, DEFAULT_SELF_HEAL_BACKOFF_CAP_SECS, DEFAULT_SELF_HEAL_BACKOFF_FACTOR,
    DEFAULT_SELF_HEAL_BACKOFF_SECS, DEFAULT_SELF_HEAL_COOLDOWN_SECS,
};
use driftwatch::controller::sharding::infer_shard;
use driftwatch::controller::state::DEFAULT_REPO_ERROR_GRACE_SECONDS;
use driftwatch::controller::sync::{wave_delay_from_env, Backoff};
use driftwatch::controller::{
    ApplicationController, AppStateManager, ClusterSharding, ClusterTaintManager,
    ControllerConfig, LiveStateCache, ShardingAlgorithm,
};
use driftwatch::crd::{AppProject, Application};
use driftwatch::Error;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the application controller
    Run(RunArgs),
    /// Show version and build information
    Version,
    /// Show the applications and projects known to the cluster
    Info(InfoArgs),
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Parser, Debug)]
struct RunArgs {
    /// Controller namespace
    #[arg(long, env = "DRIFTWATCH_NAMESPACE", default_value = "driftwatch")]
    namespace: String,

    /// Further namespaces whose applications are reconciled, glob patterns allowed
    #[arg(long, env = "DRIFTWATCH_APPLICATION_NAMESPACES", value_delimiter = ',')]
    application_namespaces: Vec<String>,

    /// Number of application status processors
    #[arg(long, env = "DRIFTWATCH_STATUS_PROCESSORS", default_value_t = 20)]
    status_processors: usize,

    /// Number of application operation processors
    #[arg(long, env = "DRIFTWATCH_OPERATION_PROCESSORS", default_value_t = 10)]
    operation_processors: usize,

    /// Seconds between application resyncs
    #[arg(long, env = "DRIFTWATCH_APP_RESYNC_PERIOD", default_value_t = 180)]
    app_resync_period: i64,

    /// Seconds between hard refreshes, 0 disables
    #[arg(long, env = "DRIFTWATCH_APP_HARD_RESYNC_PERIOD", default_value_t = 0)]
    app_hard_resync_period: i64,

    /// Upper bound in seconds of the delay spreading resync refreshes
    #[arg(long, env = "DRIFTWATCH_APP_RESYNC_JITTER", default_value_t = 60)]
    app_resync_jitter: u64,

    /// Fixed self-heal wait in seconds, used when the backoff is disabled
    #[arg(long, env = "DRIFTWATCH_SELF_HEAL_TIMEOUT", default_value_t = 0)]
    self_heal_timeout: i64,

    /// Initial self-heal backoff in seconds, 0 disables the backoff
    #[arg(long, env = "DRIFTWATCH_SELF_HEAL_BACKOFF_TIMEOUT", default_value_t = DEFAULT_SELF_HEAL_BACKOFF_SECS)]
    self_heal_backoff_timeout: i64,

    #[arg(long, env = "DRIFTWATCH_SELF_HEAL_BACKOFF_FACTOR", default_value_t = DEFAULT_SELF_HEAL_BACKOFF_FACTOR)]
    self_heal_backoff_factor: f64,

    #[arg(long, env = "DRIFTWATCH_SELF_HEAL_BACKOFF_CAP", default_value_t = DEFAULT_SELF_HEAL_BACKOFF_CAP_SECS)]
    self_heal_backoff_cap: i64,

    /// Seconds after a successful operation until self-heal attempts are counted afresh
    #[arg(long, env = "DRIFTWATCH_SELF_HEAL_COOLDOWN", default_value_t = DEFAULT_SELF_HEAL_COOLDOWN_SECS)]
    self_heal_cooldown: i64,

    /// Manifest server base URL
    #[arg(long, env = "DRIFTWATCH_REPO_SERVER", default_value = "http://driftwatch-repo-server:8081")]
    repo_server: String,

    /// Manifest server request timeout in seconds
    #[arg(long, env = "DRIFTWATCH_REPO_SERVER_TIMEOUT", default_value_t = 60)]
    repo_server_timeout: u64,

    /// Seconds a repository error is tolerated before it is reported
    #[arg(long, env = "DRIFTWATCH_REPO_ERROR_GRACE_PERIOD", default_value_t = DEFAULT_REPO_ERROR_GRACE_SECONDS)]
    repo_error_grace_period: i64,

    /// Shard of this replica, inferred from the hostname when unset
    #[arg(long, env = "DRIFTWATCH_SHARD")]
    shard: Option<i64>,

    #[arg(long, env = "DRIFTWATCH_REPLICAS", default_value_t = 1)]
    replicas: i64,

    /// legacy, round-robin or consistent-hashing
    #[arg(long, env = "DRIFTWATCH_SHARDING_METHOD", default_value = "legacy")]
    sharding_method: String,

    /// Concurrent apply/delete calls across all clusters
    #[arg(long, env = "DRIFTWATCH_KUBECTL_PARALLELISM_LIMIT", default_value_t = 20)]
    kubectl_parallelism_limit: usize,

    /// Address of the probe and metrics server
    #[arg(long, env = "DRIFTWATCH_METRICS_ADDR", default_value = "0.0.0.0:8082")]
    metrics_addr: std::net::SocketAddr,

    #[arg(long, env = "DRIFTWATCH_LOG_FORMAT", value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Seconds between settings ConfigMap reloads
    #[arg(long, env = "DRIFTWATCH_SETTINGS_RELOAD", default_value_t = 30)]
    settings_reload: u64,
}

#[derive(Parser, Debug)]
struct InfoArgs {
    /// Controller namespace
    #[arg(long, env = "DRIFTWATCH_NAMESPACE", default_value = "driftwatch")]
    namespace: String,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Args::parse();

    match args.command {
        Commands::Version => {
            println!("driftwatch controller v{}", env!("CARGO_PKG_VERSION"));
            println!("Build Date: {}", env!("BUILD_DATE"));
            println!("Git SHA: {}", env!("GIT_SHA"));
            println!("Rust Version: {}", env!("RUST_VERSION"));
            Ok(())
        }
        Commands::Info(info_args) => run_info(info_args).await,
        Commands::Run(run_args) => run_controller(run_args).await,
    }
}

async fn run_info(args: InfoArgs) -> Result<(), Error> {
    let client = kube::Client::try_default().await?;

    let apps: Api<Application> = Api::all(client.clone());
    let projects: Api<AppProject> = Api::namespaced(client, &args.namespace);
    let apps = apps.list(&Default::default()).await?;
    let projects = projects.list(&Default::default()).await?;

    println!("Applications: {}", apps.items.len());
    println!("AppProjects: {}", projects.items.len());
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let env_filter = EnvFilter::builder()
        .with_default_directive(Level::INFO.into())
        .from_env_lossy();

    let fmt_layer = match format {
        LogFormat::Text => fmt::layer().with_target(true).boxed(),
        LogFormat::Json => fmt::layer().json().with_target(true).boxed(),
    };

    let registry = tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer);

    if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let otel_layer = driftwatch::telemetry::init_telemetry(&registry);
        registry.with(otel_layer).init();
        info!("OpenTelemetry tracing initialized");
    } else {
        registry.init();
        info!("OpenTelemetry tracing disabled (OTEL_EXPORTER_OTLP_ENDPOINT not set)");
    }
}

fn hostname_identity() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| {
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown-host".to_string())
    })
}

fn self_heal_config(args: &RunArgs) -> SelfHealConfig {
    let backoff = (args.self_heal_backoff_timeout > 0).then(|| Backoff {
        base: Duration::seconds(args.self_heal_backoff_timeout),
        factor: args.self_heal_backoff_factor,
        max: Duration::seconds(args.self_heal_backoff_cap),
    });
    SelfHealConfig {
        timeout: Duration::seconds(args.self_heal_timeout),
        backoff,
        cooldown: Duration::seconds(args.self_heal_cooldown),
    }
}

async fn run_controller(args: RunArgs) -> Result<(), Error> {
    init_tracing(args.log_format);

    info!("Starting driftwatch controller v{}", env!("CARGO_PKG_VERSION"));

    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes cluster");

    let identity = hostname_identity();
    let shard = match args.shard {
        Some(shard) => shard,
        None if args.replicas > 1 => infer_shard(&identity).ok_or_else(|| {
            Error::ConfigError(format!(
                "cannot infer shard from hostname '{}', set --shard",
                identity
            ))
        })?,
        None => 0,
    };
    if shard < 0 || shard >= args.replicas.max(1) {
        return Err(Error::ConfigError(format!(
            "shard {} out of range for {} replicas",
            shard, args.replicas
        )));
    }
    let algorithm: ShardingAlgorithm = args.sharding_method.parse()?;
    let sharding = Arc::new(ClusterSharding::new(shard, args.replicas, algorithm));
    info!(shard, replicas = args.replicas, ?algorithm, "Sharding configured");

    let settings_provider = Arc::new(ConfigMapSettingsProvider::new(
        client.clone(),
        &args.namespace,
    ));
    let settings = settings_provider.settings().await?;

    let registry = Arc::new(SecretClusterRegistry::new(client.clone(), &args.namespace));
    let connector = Arc::new(KubeConnector::new(args.kubectl_parallelism_limit));
    let manifests = Arc::new(HttpManifestSource::new(
        &args.repo_server,
        StdDuration::from_secs(args.repo_server_timeout),
    )?);

    let (cache_tx, cache_rx) = mpsc::unbounded_channel();
    let live = Arc::new(LiveStateCache::new(
        registry.clone(),
        connector.clone(),
        sharding.clone(),
        Arc::new(ClusterTaintManager::new()),
        settings,
        cache_tx,
    ));

    let state = Arc::new(
        AppStateManager::new(
            manifests,
            live.clone(),
            registry,
            connector,
            settings_provider.clone(),
            &args.namespace,
        )
        .with_repo_error_grace(Duration::seconds(args.repo_error_grace_period)),
    );

    let config = ControllerConfig {
        namespace: args.namespace.clone(),
        application_namespaces: args.application_namespaces.clone(),
        status_processors: args.status_processors,
        operation_processors: args.operation_processors,
        resync_period: Duration::seconds(args.app_resync_period),
        hard_resync_period: Duration::seconds(args.app_hard_resync_period),
        resync_jitter: StdDuration::from_secs(args.app_resync_jitter),
        self_heal: self_heal_config(&args),
        wave_delay: wave_delay_from_env(),
    };

    let controller = Arc::new(ApplicationController::new(
        config,
        Arc::new(KubeAppStore::new(client.clone())),
        Arc::new(KubeProjectStore::new(client.clone(), &args.namespace)),
        state,
        sharding,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    {
        let lease_client = client.clone();
        let lease_ns = std::env::var("POD_NAMESPACE").unwrap_or_else(|_| args.namespace.clone());
        let identity = identity.clone();
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            run_shard_heartbeat(lease_client, &lease_ns, shard, &identity, shutdown).await;
        });
    }

    {
        let provider = settings_provider.clone();
        let live = live.clone();
        let period = StdDuration::from_secs(args.settings_reload.max(1));
        let mut shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = interval.tick() => match provider.reload().await {
                        Ok(true) => {
                            info!("Settings changed, invalidating cluster caches");
                            if let Ok(settings) = provider.settings().await {
                                live.invalidate(settings).await;
                            }
                        }
                        Ok(false) => {}
                        Err(e) => warn!("Failed to reload settings: {}", e),
                    },
                }
            }
        });
    }

    #[cfg(feature = "rest-api")]
    {
        let addr = args.metrics_addr;
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move {
            if let Err(e) = driftwatch::rest_api::run_server(addr, shutdown).await {
                error!("Metrics server error: {:?}", e);
            }
        });
    }

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Received shutdown signal"),
            Err(e) => error!("Failed to listen for shutdown signal: {}", e),
        }
        let _ = shutdown_tx.send(true);
    });

    let result = controller.run(cache_rx, shutdown_rx).await;

    driftwatch::telemetry::shutdown_telemetry();

    result
}

const LEASE_PREFIX: &str = "driftwatch-controller-shard";
const LEASE_DURATION_SECS: i32 = 15;
const RENEW_INTERVAL: StdDuration = StdDuration::from_secs(10);
const RETRY_INTERVAL: StdDuration = StdDuration::from_secs(5);

/// Keep the per-shard lease renewed so a second replica claiming the same
/// shard is noticed
async fn run_shard_heartbeat(
    client: kube::Client,
    namespace: &str,
    shard: i64,
    identity: &str,
    mut shutdown: watch::Receiver<bool>,
) {
    let leases: Api<Lease> = Api::namespaced(client, namespace);
    let lease_name = format!("{}-{}", LEASE_PREFIX, shard);
    let mut held = false;

    loop {
        let wait = match try_acquire_or_renew(&leases, &lease_name, namespace, identity).await {
            Ok(true) => {
                if !held {
                    info!("Holding lease {} for shard {}", lease_name, shard);
                }
                held = true;
                RENEW_INTERVAL
            }
            Ok(false) => {
                warn!(
                    "Lease {} is held by another replica, shard {} may be processed twice",
                    lease_name, shard
                );
                held = false;
                RETRY_INTERVAL
            }
            Err(e) => {
                warn!("Shard heartbeat error: {:?}", e);
                held = false;
                RETRY_INTERVAL
            }
        };
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(wait) => {}
        }
    }
}

async fn try_acquire_or_renew(
    leases: &Api<Lease>,
    lease_name: &str,
    namespace: &str,
    identity: &str,
) -> Result<bool, kube::Error> {
    let now = Utc::now();

    match leases.get_opt(lease_name).await? {
        Some(existing) => {
            let spec = existing.spec.as_ref();
            let current_holder = spec.and_then(|s| s.holder_identity.as_deref());

            if current_holder == Some(identity) {
                let patch = serde_json::json!({
                    "spec": {
                        "renewTime": MicroTime(now),
                        "leaseDurationSeconds": LEASE_DURATION_SECS,
                    }
                });
                leases
                    .patch(lease_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await?;
                return Ok(true);
            }

            let expired = spec
                .and_then(|s| s.renew_time.as_ref())
                .map(|renew| {
                    let duration = spec
                        .and_then(|s| s.lease_duration_seconds)
                        .unwrap_or(LEASE_DURATION_SECS);
                    now > renew.0 + Duration::seconds(i64::from(duration))
                })
                .unwrap_or(true);

            if !expired {
                return Ok(false);
            }
            info!("Lease held by {:?} has expired, taking over", current_holder);
            let patch = serde_json::json!({
                "spec": {
                    "holderIdentity": identity,
                    "acquireTime": MicroTime(now),
                    "renewTime": MicroTime(now),
                    "leaseDurationSeconds": LEASE_DURATION_SECS,
                }
            });
            leases
                .patch(lease_name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(true)
        }
        None => {
            let lease = Lease {
                metadata: ObjectMeta {
                    name: Some(lease_name.to_string()),
                    namespace: Some(namespace.to_string()),
                    ..Default::default()
                },
                spec: Some(LeaseSpec {
                    holder_identity: Some(identity.to_string()),
                    acquire_time: Some(MicroTime(now)),
                    renew_time: Some(MicroTime(now)),
                    lease_duration_seconds: Some(LEASE_DURATION_SECS),
                    ..Default::default()
                }),
            };
            leases.create(&PostParams::default(), &lease).await?;
            info!("Created lease {} with holder {}", lease_name, identity);
            Ok(true)
        }
    }
}
