use super::{dependencies_satisfied, BuildStore, Error, PeerStatuses, Result};
use chrono::{DateTime, Utc};
use models::{Backend, Build, BuildSpec, BuildStatus, PackageJob, PackageMetrics, PackageStatus};
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::Executor;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::time::Duration;

/// PgStore is the production [`BuildStore`], backed by Postgres.
///
/// Every operation is one transaction. The claim primitive relies on
/// `FOR UPDATE SKIP LOCKED` row locks so that concurrent scheduler
/// instances never receive the same package.
pub struct PgStore {
    pool: PgPool,
}

const PACKAGE_COLUMNS: &str = r#"
    id, build_id, name, status, config_yaml, dependencies,
    started_at, finished_at, error, log_path, output_path,
    backend, pipelines, source_files, metrics, position
"#;

impl PgStore {
    /// Connect to `database_url`, preferring TLS, with a bounded
    /// acquire timeout so a wedged database surfaces as an error
    /// rather than a hung scheduler tick.
    pub async fn connect(database_url: &str) -> Result<Self> {
        let options = PgConnectOptions::from_str(database_url)?
            .application_name(&format!("kilnd-{}", std::process::id()));
        let pool = PgPoolOptions::new()
            .acquire_timeout(Duration::from_secs(5))
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply `schema.sql`. Idempotent.
    pub async fn migrate(&self) -> Result<()> {
        self.pool.execute(include_str!("../schema.sql")).await?;
        Ok(())
    }

    async fn packages_of(&self, build_ids: &[String]) -> Result<Vec<PackageRow>> {
        let rows = sqlx::query_as::<_, PackageRow>(&format!(
            "SELECT {PACKAGE_COLUMNS}
             FROM package_jobs
             WHERE build_id = ANY($1)
             ORDER BY build_id, position"
        ))
        .bind(build_ids)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn list_where(&self, predicate: &str) -> Result<Vec<Build>> {
        let builds = sqlx::query_as::<_, BuildRow>(&format!(
            "SELECT id, status, created_at, started_at, finished_at, spec
             FROM builds {predicate}
             ORDER BY created_at, id"
        ))
        .fetch_all(&self.pool)
        .await?;

        let ids: Vec<String> = builds.iter().map(|b| b.id.clone()).collect();
        let mut packages: BTreeMap<String, Vec<PackageJob>> = BTreeMap::new();
        for row in self.packages_of(&ids).await? {
            packages
                .entry(row.build_id.clone())
                .or_default()
                .push(row.into_job());
        }

        Ok(builds
            .into_iter()
            .map(|row| {
                let jobs = packages.remove(&row.id).unwrap_or_default();
                row.into_build(jobs)
            })
            .collect())
    }
}

#[async_trait::async_trait]
impl BuildStore for PgStore {
    async fn create_build(&self, packages: Vec<PackageJob>, spec: BuildSpec) -> Result<Build> {
        let build = Build::new(spec, packages);

        let mut txn = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO builds (id, status, created_at, spec)
             VALUES ($1, $2, $3, $4)",
        )
        .bind(&build.id)
        .bind(build.status)
        .bind(build.created_at)
        .bind(Json(&build.spec))
        .execute(&mut txn)
        .await?;

        for package in &build.packages {
            sqlx::query(
                "INSERT INTO package_jobs
                   (build_id, name, status, config_yaml, dependencies,
                    pipelines, source_files, position)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
            )
            .bind(&build.id)
            .bind(&package.name)
            .bind(package.status)
            .bind(&package.config_yaml)
            .bind(&package.dependencies)
            .bind(Json(&package.pipelines))
            .bind(Json(&package.source_files))
            .bind(package.position)
            .execute(&mut txn)
            .await?;
        }
        txn.commit().await?;

        Ok(build)
    }

    async fn get_build(&self, id: &str) -> Result<Build> {
        let row = sqlx::query_as::<_, BuildRow>(
            "SELECT id, status, created_at, started_at, finished_at, spec
             FROM builds WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(id.to_string()))?;

        let packages = self
            .packages_of(&[id.to_string()])
            .await?
            .into_iter()
            .map(PackageRow::into_job)
            .collect();
        Ok(row.into_build(packages))
    }

    async fn update_build(&self, build: &Build) -> Result<()> {
        let done = sqlx::query(
            "UPDATE builds
             SET status = $2, started_at = $3, finished_at = $4
             WHERE id = $1",
        )
        .bind(&build.id)
        .bind(build.status)
        .bind(build.started_at)
        .bind(build.finished_at)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(Error::NotFound(build.id.clone()));
        }
        Ok(())
    }

    async fn list_builds(&self) -> Result<Vec<Build>> {
        self.list_where("").await
    }

    async fn list_active_builds(&self) -> Result<Vec<Build>> {
        self.list_where("WHERE status IN ('pending', 'running')")
            .await
    }

    async fn update_package(&self, build_id: &str, package: &PackageJob) -> Result<()> {
        let pipelines = (!package.pipelines.is_empty()).then(|| Json(&package.pipelines));
        let source_files = (!package.source_files.is_empty()).then(|| Json(&package.source_files));

        let done = sqlx::query(
            "UPDATE package_jobs SET
                status = $3,
                started_at = $4,
                finished_at = $5,
                error = $6,
                log_path = $7,
                output_path = $8,
                backend = $9,
                metrics = $10,
                pipelines = COALESCE($11, pipelines),
                source_files = COALESCE($12, source_files)
             WHERE build_id = $1 AND name = $2",
        )
        .bind(build_id)
        .bind(&package.name)
        .bind(package.status)
        .bind(package.started_at)
        .bind(package.finished_at)
        .bind(&package.error)
        .bind(&package.log_url)
        .bind(&package.output_url)
        .bind(package.backend.as_ref().map(Json))
        .bind(package.metrics.as_ref().map(Json))
        .bind(pipelines)
        .bind(source_files)
        .execute(&self.pool)
        .await?;

        if done.rows_affected() == 0 {
            return Err(Error::NotFound(format!("{build_id}/{}", package.name)));
        }
        Ok(())
    }

    async fn claim_ready_package(&self, build_id: &str) -> Result<Option<PackageJob>> {
        let mut txn = self.pool.begin().await?;

        let known: Option<(String,)> = sqlx::query_as("SELECT id FROM builds WHERE id = $1")
            .bind(build_id)
            .fetch_optional(&mut txn)
            .await?;
        if known.is_none() {
            return Err(Error::NotFound(build_id.to_string()));
        }

        // Snapshot every peer status for dependency evaluation. A
        // dependency only ever satisfies via `success`, which is
        // terminal and immutable, so this read needs no lock.
        let peers: Vec<(String, PackageStatus)> =
            sqlx::query_as("SELECT name, status FROM package_jobs WHERE build_id = $1")
                .bind(build_id)
                .fetch_all(&mut txn)
                .await?;
        let peers: PeerStatuses<'_> = peers
            .iter()
            .map(|(name, status)| (name.as_str(), *status))
            .collect();

        // Lock the pending rows in position order, skipping any row a
        // concurrent claimer already holds, then take the first row
        // whose in-build dependencies have all succeeded.
        let locked = sqlx::query_as::<_, PackageRow>(&format!(
            "SELECT {PACKAGE_COLUMNS}
             FROM package_jobs
             WHERE build_id = $1 AND status = 'pending'
             ORDER BY position
             FOR UPDATE SKIP LOCKED"
        ))
        .bind(build_id)
        .fetch_all(&mut txn)
        .await?;
        tracing::debug!(build_id, locked = locked.len(), "evaluating pending packages");

        for row in locked {
            if !dependencies_satisfied(&row.dependencies, &peers) {
                continue;
            }
            let claimed = sqlx::query_as::<_, PackageRow>(&format!(
                "UPDATE package_jobs
                 SET status = 'running', started_at = NOW()
                 WHERE id = $1
                 RETURNING {PACKAGE_COLUMNS}"
            ))
            .bind(row.id)
            .fetch_one(&mut txn)
            .await?;
            txn.commit().await?;
            return Ok(Some(claimed.into_job()));
        }

        txn.rollback().await?;
        Ok(None)
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|err| Error::Internal(err.to_string()))?;

        let done = sqlx::query(
            "UPDATE package_jobs
             SET status = 'pending', started_at = NULL, backend = NULL, error = NULL
             WHERE status = 'running'
               AND (started_at IS NULL OR started_at < $1)",
        )
        .bind(cutoff)
        .execute(&self.pool)
        .await?;
        Ok(done.rows_affected())
    }
}

#[derive(sqlx::FromRow)]
struct BuildRow {
    id: String,
    status: BuildStatus,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    spec: Json<BuildSpec>,
}

impl BuildRow {
    fn into_build(self, packages: Vec<PackageJob>) -> Build {
        Build {
            id: self.id,
            spec: self.spec.0,
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            packages,
        }
    }
}

#[derive(sqlx::FromRow)]
struct PackageRow {
    id: i64,
    build_id: String,
    name: String,
    status: PackageStatus,
    config_yaml: String,
    dependencies: Vec<String>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    error: Option<String>,
    log_path: Option<String>,
    output_path: Option<String>,
    backend: Option<Json<Backend>>,
    pipelines: Option<Json<BTreeMap<String, String>>>,
    source_files: Option<Json<BTreeMap<String, Vec<u8>>>>,
    metrics: Option<Json<PackageMetrics>>,
    position: i32,
}

impl PackageRow {
    fn into_job(self) -> PackageJob {
        PackageJob {
            build_id: self.build_id,
            name: self.name,
            config_yaml: self.config_yaml,
            dependencies: self.dependencies,
            status: self.status,
            started_at: self.started_at,
            finished_at: self.finished_at,
            error: self.error,
            log_url: self.log_path,
            output_url: self.output_path,
            backend: self.backend.map(|b| b.0),
            pipelines: self.pipelines.map(|p| p.0).unwrap_or_default(),
            source_files: self.source_files.map(|s| s.0).unwrap_or_default(),
            metrics: self.metrics.map(|m| m.0),
            position: self.position,
        }
    }
}
