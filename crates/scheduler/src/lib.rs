use chrono::{DateTime, Utc};
use models::{Build, BuildStatus, PackageJob, PackageStatus};
use pool::BackendPool;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use storage::Storage;
use store::BuildStore;
use tokio_util::sync::CancellationToken;

mod executor;

pub use executor::{ExecuteOptions, ExecutionReport, Executor, ExecutorError, RemoteExecutor};

/// Tuning knobs of the scheduler control loop.
#[derive(Debug, Clone)]
pub struct Config {
    /// Pause between control loop passes.
    pub poll_interval: Duration,
    /// Global bound on concurrently executing packages.
    pub max_parallel: u32,
    /// Optional bound on concurrently executing packages per backend.
    pub backend_occupancy: Option<u32>,
    /// Claim lease: a `running` package older than this is considered
    /// orphaned by a dead scheduler and reset to `pending`.
    pub lease_timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(1),
            max_parallel: 8,
            backend_occupancy: None,
            lease_timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Scheduler advances every active Build to a terminal state: it polls
/// the store, settles dependency state, claims ready packages, and
/// drives each claim on its own bounded task through the executor and
/// out to storage.
///
/// Multiple instances may run against one store; the store's claim
/// atomicity keeps them from ever executing the same package twice.
pub struct Scheduler {
    store: Arc<dyn BuildStore>,
    pool: Arc<BackendPool>,
    storage: Arc<dyn Storage>,
    executor: Arc<dyn Executor>,
    config: Config,
    permits: Arc<tokio::sync::Semaphore>,
    backend_slots: Mutex<HashMap<String, Arc<tokio::sync::Semaphore>>>,
    cancel: CancellationToken,
}

/// Immutable per-build inputs threaded to each execution task, so no
/// shared Build structure leaks between the loop and its workers.
#[derive(Clone)]
struct BuildContext {
    build_id: String,
    arch: String,
    selector: BTreeMap<String, String>,
    with_test: bool,
    debug: bool,
    created_at: DateTime<Utc>,
}

impl Scheduler {
    pub fn new(
        store: Arc<dyn BuildStore>,
        pool: Arc<BackendPool>,
        storage: Arc<dyn Storage>,
        executor: Arc<dyn Executor>,
        config: Config,
    ) -> Arc<Self> {
        let permits = Arc::new(tokio::sync::Semaphore::new(config.max_parallel as usize));
        Arc::new(Self {
            store,
            pool,
            storage,
            executor,
            config,
            permits,
            backend_slots: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
        })
    }

    /// Run the control loop until `shutdown` resolves, then cancel
    /// in-flight executions and drain them before returning.
    pub async fn run(self: Arc<Self>, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);

        // Sweep expired claims immediately at startup (crash recovery),
        // then once per lease interval.
        let mut next_sweep = tokio::time::Instant::now();

        loop {
            if tokio::time::Instant::now() >= next_sweep {
                match self.store.requeue_stale(self.config.lease_timeout).await {
                    Ok(0) => {}
                    Ok(requeued) => {
                        tracing::info!(requeued, "reset expired package claims");
                    }
                    Err(err) => {
                        tracing::warn!(error = ?err, "failed to sweep stale package claims");
                    }
                }
                next_sweep = tokio::time::Instant::now() + self.config.lease_timeout;
            }

            let pause = match self.tick().await {
                Ok(()) => self.config.poll_interval,
                Err(err) => {
                    // The store is unreachable or similar: stay alive
                    // and back off rather than exiting.
                    tracing::warn!(error = ?err, "scheduler pass failed, backing off");
                    self.config.poll_interval * 5
                }
            };

            tokio::select! {
                () = &mut shutdown => break,
                () = tokio::time::sleep(pause) => {}
            }
        }

        tracing::info!("scheduler signaled to stop, draining running packages");
        self.cancel.cancel();
        // All permits are returned only once every spawned execution
        // has persisted its outcome.
        let _ = self.permits.acquire_many(self.config.max_parallel).await;
    }

    /// One pass: reconcile every active build and claim as much ready
    /// work as the concurrency budget allows.
    async fn tick(self: &Arc<Self>) -> store::Result<()> {
        let builds = self.store.list_active_builds().await?;

        let mut queue_depth = 0i64;
        for mut build in builds {
            queue_depth += build
                .packages
                .iter()
                .filter(|p| matches!(p.status, PackageStatus::Pending | PackageStatus::Blocked))
                .count() as i64;

            if let Err(err) = self.advance_build(&mut build).await {
                tracing::warn!(build = %build.id, error = ?err, "failed to advance build");
            }
        }
        metrics::QUEUE_DEPTH.set(queue_depth);
        Ok(())
    }

    async fn advance_build(self: &Arc<Self>, build: &mut Build) -> store::Result<()> {
        if self.reconcile(build).await? {
            self.dispatch_claims(build).await?;
        }
        Ok(())
    }

    /// Settle dependency state and the overall status of one build.
    /// Returns whether the build is still active.
    async fn reconcile(&self, build: &mut Build) -> store::Result<bool> {
        // Waiting packages move between pending, blocked, and skipped
        // as their dependencies settle. Iterate to a fixed point so a
        // chain of skips collapses within a single pass.
        let mut dirty: HashMap<usize, Option<String>> = HashMap::new();
        loop {
            let statuses: HashMap<String, PackageStatus> = build
                .packages
                .iter()
                .map(|p| (p.name.clone(), p.status))
                .collect();

            let mut changed = false;
            for (index, package) in build.packages.iter_mut().enumerate() {
                if !matches!(
                    package.status,
                    PackageStatus::Pending | PackageStatus::Blocked
                ) {
                    continue;
                }

                let mut failed_dependency = None;
                let mut waiting = false;
                for dependency in &package.dependencies {
                    match statuses.get(dependency) {
                        // External names never block scheduling.
                        None => {}
                        Some(PackageStatus::Success) => {}
                        Some(PackageStatus::Failed) | Some(PackageStatus::Skipped) => {
                            failed_dependency = Some(dependency.clone());
                            break;
                        }
                        Some(_) => waiting = true,
                    }
                }

                let next = match &failed_dependency {
                    Some(_) => PackageStatus::Skipped,
                    None if waiting => PackageStatus::Blocked,
                    None => PackageStatus::Pending,
                };
                if next != package.status {
                    package.status = next;
                    if next == PackageStatus::Skipped {
                        package.finished_at = Some(Utc::now());
                        package.error = failed_dependency
                            .as_ref()
                            .map(|dep| format!("skipped: dependency {dep:?} did not succeed"));
                    }
                    dirty.insert(index, failed_dependency);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        for index in dirty.keys() {
            let package = &build.packages[*index];
            if package.status == PackageStatus::Skipped {
                metrics::PACKAGES_COMPLETED
                    .with_label_values(&[package.status.as_str()])
                    .inc();
                tracing::info!(
                    build = %build.id,
                    package = %package.name,
                    error = package.error.as_deref().unwrap_or_default(),
                    "skipped package",
                );
            }
            self.store.update_package(&build.id, package).await?;
        }

        if build.packages.iter().all(|p| p.status.is_terminal()) {
            let was_active = build.status.is_active();
            build.status = build.roll_up();
            build.started_at.get_or_insert_with(Utc::now);
            build.finished_at = Some(Utc::now());
            self.store.update_build(build).await?;
            if was_active {
                metrics::BUILDS_COMPLETED
                    .with_label_values(&[build.status.as_str()])
                    .inc();
                tracing::info!(build = %build.id, status = %build.status.as_str(), "build finished");
            }
            return Ok(false);
        }

        if build.status == BuildStatus::Pending {
            build.status = BuildStatus::Running;
            build.started_at = Some(Utc::now());
            self.store.update_build(build).await?;
        }
        Ok(true)
    }

    /// Claim ready packages of the build until either none remain or
    /// the global concurrency budget is exhausted, spawning one task
    /// per claim.
    async fn dispatch_claims(self: &Arc<Self>, build: &Build) -> store::Result<()> {
        let context = BuildContext {
            build_id: build.id.clone(),
            arch: build.spec.arch.clone(),
            selector: build.spec.backend_selector.clone(),
            with_test: build.spec.with_test,
            debug: build.spec.debug,
            created_at: build.created_at,
        };

        loop {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                return Ok(());
            };
            match self.store.claim_ready_package(&build.id).await {
                Ok(Some(package)) => {
                    metrics::CLAIMS.inc();
                    let this = self.clone();
                    let context = context.clone();
                    tokio::spawn(async move {
                        let _permit = permit;
                        this.execute_claimed(context, package).await;
                    });
                }
                Ok(None) => return Ok(()),
                Err(err) => return Err(err),
            }
        }
    }

    /// Drive one claimed package to a terminal state, persisting the
    /// outcome. Never propagates: any failure lands on the package.
    #[tracing::instrument(skip_all, fields(build = %context.build_id, package = %package.name))]
    async fn execute_claimed(&self, context: BuildContext, mut package: PackageJob) {
        let backend = match self.pool.select(&context.arch, &context.selector) {
            Ok(backend) => backend,
            Err(err) => {
                self.finish(
                    &context,
                    &mut package,
                    PackageStatus::Failed,
                    Some(format!("no backend available: {err}")),
                )
                .await;
                return;
            }
        };

        package.backend = Some(backend.clone());
        if let Err(err) = self.store.update_package(&context.build_id, &package).await {
            tracing::warn!(error = ?err, "failed to record assigned backend");
        }

        // Per-backend occupancy: wait for a slot on the chosen worker.
        let slot = match self.config.backend_occupancy {
            None => None,
            Some(limit) => {
                let slots = {
                    let mut map = self.backend_slots.lock().unwrap();
                    map.entry(backend.addr.clone())
                        .or_insert_with(|| Arc::new(tokio::sync::Semaphore::new(limit as usize)))
                        .clone()
                };
                tokio::select! {
                    () = self.cancel.cancelled() => {
                        self.finish(
                            &context,
                            &mut package,
                            PackageStatus::Failed,
                            Some("build cancelled".to_string()),
                        )
                        .await;
                        return;
                    }
                    acquired = slots.acquire_owned() => acquired.ok(),
                }
            }
        };

        let occupancy = metrics::BACKEND_OCCUPANCY.with_label_values(&[&backend.addr]);
        occupancy.inc();
        let (status, error) = self.drive(&context, &mut package, &backend).await;
        occupancy.dec();
        drop(slot);

        self.finish(&context, &mut package, status, error).await;
    }

    /// Execute remotely and persist logs and artifacts. Returns the
    /// terminal (status, error) pair; URL and metric fields are filled
    /// on `package` in place.
    async fn drive(
        &self,
        context: &BuildContext,
        package: &mut PackageJob,
        backend: &models::Backend,
    ) -> (PackageStatus, Option<String>) {
        let output_dir = match self.storage.output_dir(&context.build_id).await {
            Ok(dir) => dir,
            Err(err) => {
                return (
                    PackageStatus::Failed,
                    Some(format!("storage: {err}")),
                );
            }
        };
        let options = ExecuteOptions {
            with_test: context.with_test,
            debug: context.debug,
            output_dir: output_dir.clone(),
        };

        let started = std::time::Instant::now();
        let result = self
            .executor
            .execute(&self.cancel, package, backend, &options)
            .await;
        let build_seconds = started.elapsed().as_secs_f64();

        match result {
            Ok(report) => {
                let log = report.log;
                if let Err(err) = self.store_log(context, package, log).await {
                    return (PackageStatus::Failed, Some(format!("storage: {err}")));
                }

                let synced = std::time::Instant::now();
                match self
                    .storage
                    .sync_output_dir(&context.build_id, &output_dir, &self.cancel)
                    .await
                {
                    Ok(summary) => {
                        metrics::STORAGE_SYNC_SECONDS.observe(synced.elapsed().as_secs_f64());
                        package.output_url =
                            Some(self.storage.artifacts_url(&context.build_id).to_string());
                        let queued_seconds = package
                            .started_at
                            .map(|at| (at - context.created_at).num_milliseconds() as f64 / 1e3)
                            .unwrap_or_default();
                        package.metrics = Some(models::PackageMetrics {
                            queued_seconds,
                            build_seconds,
                            artifact_bytes: summary.bytes,
                        });
                        (PackageStatus::Success, None)
                    }
                    Err(err) => (PackageStatus::Failed, Some(format!("storage: {err}"))),
                }
            }
            Err(ExecutorError::Cancelled) => {
                (PackageStatus::Failed, Some("build cancelled".to_string()))
            }
            Err(ExecutorError::Failed { message, log }) => {
                // Best effort: a failed build's log is still worth keeping.
                if let Err(err) = self.store_log(context, package, log).await {
                    tracing::warn!(error = ?err, "failed to persist log of failed package");
                }
                (PackageStatus::Failed, Some(message))
            }
            Err(err) => (PackageStatus::Failed, Some(err.to_string())),
        }
    }

    async fn store_log(
        &self,
        context: &BuildContext,
        package: &mut PackageJob,
        log: Vec<u8>,
    ) -> storage::Result<()> {
        if log.is_empty() {
            return Ok(());
        }
        let url = self
            .storage
            .write_log(
                &context.build_id,
                &package.name,
                Box::new(std::io::Cursor::new(log)),
            )
            .await?;
        package.log_url = Some(url.to_string());
        Ok(())
    }

    async fn finish(
        &self,
        context: &BuildContext,
        package: &mut PackageJob,
        status: PackageStatus,
        error: Option<String>,
    ) {
        package.status = status;
        package.finished_at = Some(Utc::now());
        package.error = error;

        metrics::PACKAGES_COMPLETED
            .with_label_values(&[status.as_str()])
            .inc();
        match status {
            PackageStatus::Success => {
                tracing::info!("package built");
            }
            _ => {
                tracing::warn!(
                    status = %status.as_str(),
                    error = package.error.as_deref().unwrap_or_default(),
                    "package did not build",
                );
            }
        }

        if let Err(err) = self.store.update_package(&context.build_id, package).await {
            tracing::error!(error = ?err, "failed to persist package outcome");
        }
    }
}
