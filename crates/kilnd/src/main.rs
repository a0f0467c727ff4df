use anyhow::Context;
use clap::Parser;
use futures::FutureExt;
use kilnd::api;
use models::Backend;
use pool::BackendPool;
use scheduler::{RemoteExecutor, Scheduler};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use storage::{GcsStorage, LocalStorage, Storage};
use store::{BuildStore, MemoryStore, PgStore};

/// kilnd is the kiln build service: it accepts declarative package
/// builds over HTTP and schedules them onto remote build workers.
#[derive(Debug, Parser)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Address to listen on for API requests.
    #[clap(long, env = "KILN_LISTEN", default_value = "0.0.0.0:8080")]
    listen: String,
    /// URL of the postgres database. When omitted, builds are kept in
    /// a single-process in-memory store.
    #[clap(long = "database", env = "DATABASE_URL")]
    database_url: Option<String>,
    /// Local directory for logs and artifacts.
    #[clap(long, env = "KILN_OUTPUT_DIR", default_value = "./kiln-data")]
    output_dir: PathBuf,
    /// Cloud storage bucket. Cloud mode is selected when non-empty.
    #[clap(long, env = "KILN_BUCKET", default_value = "")]
    bucket: String,
    /// Default executor endpoint, registered as a backend of the host
    /// architecture at startup.
    #[clap(long = "executor", env = "KILN_EXECUTOR")]
    executor: Option<String>,
    /// Additional backends, as ADDR,ARCH[,KEY=VALUE...]. Repeatable.
    #[clap(long = "backend")]
    backends: Vec<String>,
    /// Architecture assumed when a build names none.
    #[clap(long, env = "KILN_ARCH")]
    arch: Option<String>,
    /// Scheduler poll interval in milliseconds.
    #[clap(long, default_value_t = 1000)]
    poll_interval_ms: u64,
    /// Bound on concurrently building packages.
    #[clap(long, default_value_t = 8)]
    max_parallel: u32,
    /// Bound on concurrently building packages per backend; 0 means
    /// unlimited.
    #[clap(long, default_value_t = 0)]
    backend_occupancy: u32,
    /// Claim lease in seconds: running packages older than this are
    /// requeued at startup and on every sweep.
    #[clap(long, default_value_t = 900)]
    lease_timeout_secs: u64,
}

fn main() -> anyhow::Result<()> {
    // Reasonable defaults for structured logs on stderr.
    let subscriber = tracing_subscriber::FmtSubscriber::builder()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .finish();
    tracing::subscriber::set_global_default(subscriber).expect("setting tracing default failed");

    let args = Args::parse();
    tracing::info!(?args, "started!");

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    let task = runtime.spawn(async move { async_main(args).await });
    let result = runtime.block_on(task);

    tracing::info!(?result, "main function completed, shutting down runtime");
    runtime.shutdown_timeout(Duration::from_secs(10));
    result?
}

async fn async_main(args: Args) -> anyhow::Result<()> {
    // Bind early, so requests dispatched while the rest of the process
    // comes up aren't refused.
    let listener = tokio::net::TcpListener::bind(&args.listen)
        .await
        .context("failed to bind server port")?;

    let store: Arc<dyn BuildStore> = match &args.database_url {
        Some(database_url) => {
            let store = PgStore::connect(database_url)
                .await
                .context("connecting to database")?;
            store.migrate().await.context("applying store schema")?;
            Arc::new(store)
        }
        None => {
            tracing::warn!("no database configured; using the in-memory store");
            Arc::new(MemoryStore::new())
        }
    };

    let storage: Arc<dyn Storage> = if args.bucket.is_empty() {
        Arc::new(LocalStorage::new(&args.output_dir).context("preparing output directory")?)
    } else {
        Arc::new(GcsStorage::new(&args.bucket))
    };

    let default_arch = args
        .arch
        .clone()
        .unwrap_or_else(|| std::env::consts::ARCH.to_string());

    let pool = Arc::new(BackendPool::new());
    if let Some(executor) = &args.executor {
        pool.add(Backend {
            addr: executor.clone(),
            arch: default_arch.clone(),
            labels: Default::default(),
        })
        .context("registering default executor backend")?;
    }
    for flag in &args.backends {
        pool.add(parse_backend_flag(flag)?)
            .with_context(|| format!("registering backend {flag:?}"))?;
    }

    let scheduler = Scheduler::new(
        store.clone(),
        pool.clone(),
        storage,
        Arc::new(RemoteExecutor::new()),
        scheduler::Config {
            poll_interval: Duration::from_millis(args.poll_interval_ms),
            max_parallel: args.max_parallel,
            backend_occupancy: (args.backend_occupancy > 0).then_some(args.backend_occupancy),
            lease_timeout: Duration::from_secs(args.lease_timeout_secs),
        },
    );

    // Share-able future which completes when the server should exit.
    let shutdown = shutdown_signal().shared();

    let router = api::build_router(Arc::new(api::AppState {
        store,
        pool,
        default_arch,
    }));
    let api_server = axum::serve(listener, router).with_graceful_shutdown(shutdown.clone());
    let api_server = async move { anyhow::Result::<()>::Ok(api_server.await?) };

    let scheduler_loop = async move {
        scheduler.run(shutdown).await;
        anyhow::Result::<()>::Ok(())
    };

    let ((), ()) = tokio::try_join!(api_server, scheduler_loop)?;
    Ok(())
}

async fn shutdown_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
    {
        Ok(sigterm) => sigterm,
        Err(err) => {
            tracing::error!(error = ?err, "failed to install SIGTERM handler");
            return tokio::signal::ctrl_c().map(|_| ()).await;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

/// Parse a `--backend` flag of the form `ADDR,ARCH[,KEY=VALUE...]`.
fn parse_backend_flag(flag: &str) -> anyhow::Result<Backend> {
    let mut parts = flag.split(',');
    let addr = parts.next().unwrap_or_default().trim();
    let arch = parts.next().unwrap_or_default().trim();
    if addr.is_empty() || arch.is_empty() {
        anyhow::bail!("backend flag {flag:?} must look like ADDR,ARCH[,KEY=VALUE...]");
    }

    let mut labels = std::collections::BTreeMap::new();
    for label in parts {
        let (key, value) = label
            .split_once('=')
            .with_context(|| format!("label {label:?} of backend {flag:?} is not KEY=VALUE"))?;
        labels.insert(key.trim().to_string(), value.trim().to_string());
    }
    Ok(Backend {
        addr: addr.to_string(),
        arch: arch.to_string(),
        labels,
    })
}
