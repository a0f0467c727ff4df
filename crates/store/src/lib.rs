use models::{Build, BuildSpec, PackageJob};
use std::time::Duration;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Error is a reason why a store operation failed. `NotFound` is
/// distinguished so the API layer can answer 404 rather than 500.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("build {0:?} is not known")]
    NotFound(String),
    #[error("database error")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

/// BuildStore is the durable repository of Builds and their
/// PackageJobs, shared by the API and every scheduler instance.
///
/// Each operation is a self-contained transaction: callers hold no
/// handles across calls, and the structs passed in and out are
/// snapshots. The one non-trivial primitive is
/// [`claim_ready_package`](Self::claim_ready_package), which must be
/// safe under concurrent callers across processes.
#[async_trait::async_trait]
pub trait BuildStore: Send + Sync + 'static {
    /// Atomically insert a Build plus one PackageJob row per package,
    /// in the order given (`position` = index), all `pending`. A fresh
    /// build ID is allocated; partial state is never visible.
    async fn create_build(&self, packages: Vec<PackageJob>, spec: BuildSpec) -> Result<Build>;

    /// The build with all of its packages, ordered by `position`.
    async fn get_build(&self, id: &str) -> Result<Build>;

    /// Persist the build's {status, started_at, finished_at}.
    async fn update_build(&self, build: &Build) -> Result<()>;

    /// Every build, in created-at order.
    async fn list_builds(&self) -> Result<Vec<Build>>;

    /// Builds with status pending or running, in created-at order.
    async fn list_active_builds(&self) -> Result<Vec<Build>>;

    /// Persist the package's mutable fields: {status, started_at,
    /// finished_at, error, log_url, output_url, backend, metrics}.
    /// Pipelines and source files are replaced only when a non-empty
    /// replacement is supplied.
    async fn update_package(&self, build_id: &str, package: &PackageJob) -> Result<()>;

    /// Atomically transition one ready package of the build from
    /// `pending` to `running` and return it, or None when no package is
    /// ready. A package is ready when every dependency naming a peer
    /// package of the same build has status `success`; dependency names
    /// with no in-build peer never block. Ties break by `position`.
    ///
    /// The same package is never returned to two concurrent callers.
    async fn claim_ready_package(&self, build_id: &str) -> Result<Option<PackageJob>>;

    /// Crash recovery: reset every `running` package whose claim lease
    /// has expired (`started_at` older than `older_than`) back to
    /// `pending`, clearing its backend assignment. Returns the number
    /// of packages reset.
    async fn requeue_stale(&self, older_than: Duration) -> Result<u64>;
}

/// Whether every in-build dependency of a package is satisfied, given
/// the (name => status) view of its build. Shared by both store
/// implementations so the memory and SQL claim paths agree exactly.
pub(crate) fn dependencies_satisfied<'a, I>(dependencies: I, peers: &PeerStatuses<'_>) -> bool
where
    I: IntoIterator<Item = &'a String>,
{
    dependencies.into_iter().all(|name| {
        match peers.get(name.as_str()) {
            // External dependency: present in no peer row, never blocks.
            None => true,
            Some(status) => matches!(status, models::PackageStatus::Success),
        }
    })
}

pub(crate) type PeerStatuses<'a> =
    std::collections::HashMap<&'a str, models::PackageStatus>;
