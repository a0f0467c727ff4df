use super::{dependencies_satisfied, BuildStore, Error, PeerStatuses, Result};
use chrono::Utc;
use models::{Build, BuildSpec, BuildStatus, PackageJob, PackageStatus};
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

/// MemoryStore keeps builds in a process-wide map under a single
/// mutex. It implements the full [`BuildStore`] contract, including
/// claim atomicity, and backs single-process deployments and tests.
pub struct MemoryStore {
    builds: Mutex<HashMap<String, Build>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            builds: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl BuildStore for MemoryStore {
    async fn create_build(&self, packages: Vec<PackageJob>, spec: BuildSpec) -> Result<Build> {
        let build = Build::new(spec, packages);
        let mut builds = self.builds.lock().unwrap();
        builds.insert(build.id.clone(), build.clone());
        Ok(build)
    }

    async fn get_build(&self, id: &str) -> Result<Build> {
        let builds = self.builds.lock().unwrap();
        builds
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    async fn update_build(&self, build: &Build) -> Result<()> {
        let mut builds = self.builds.lock().unwrap();
        let stored = builds
            .get_mut(&build.id)
            .ok_or_else(|| Error::NotFound(build.id.clone()))?;
        stored.status = build.status;
        stored.started_at = build.started_at;
        stored.finished_at = build.finished_at;
        Ok(())
    }

    async fn list_builds(&self) -> Result<Vec<Build>> {
        let builds = self.builds.lock().unwrap();
        let mut all: Vec<Build> = builds.values().cloned().collect();
        all.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(all)
    }

    async fn list_active_builds(&self) -> Result<Vec<Build>> {
        let mut all = self.list_builds().await?;
        all.retain(|b| matches!(b.status, BuildStatus::Pending | BuildStatus::Running));
        Ok(all)
    }

    async fn update_package(&self, build_id: &str, package: &PackageJob) -> Result<()> {
        let mut builds = self.builds.lock().unwrap();
        let build = builds
            .get_mut(build_id)
            .ok_or_else(|| Error::NotFound(build_id.to_string()))?;
        let stored = build
            .packages
            .iter_mut()
            .find(|p| p.name == package.name)
            .ok_or_else(|| Error::NotFound(format!("{build_id}/{}", package.name)))?;

        stored.status = package.status;
        stored.started_at = package.started_at;
        stored.finished_at = package.finished_at;
        stored.error = package.error.clone();
        stored.log_url = package.log_url.clone();
        stored.output_url = package.output_url.clone();
        stored.backend = package.backend.clone();
        stored.metrics = package.metrics;
        if !package.pipelines.is_empty() {
            stored.pipelines = package.pipelines.clone();
        }
        if !package.source_files.is_empty() {
            stored.source_files = package.source_files.clone();
        }
        Ok(())
    }

    async fn claim_ready_package(&self, build_id: &str) -> Result<Option<PackageJob>> {
        let mut builds = self.builds.lock().unwrap();
        let build = builds
            .get_mut(build_id)
            .ok_or_else(|| Error::NotFound(build_id.to_string()))?;

        let peers: PeerStatuses<'_> = build
            .packages
            .iter()
            .map(|p| (p.name.as_str(), p.status))
            .collect();

        // Packages are kept in position order, so the first eligible
        // hit is also the position tie-break winner.
        let claimed = build.packages.iter().position(|p| {
            p.status == PackageStatus::Pending && dependencies_satisfied(&p.dependencies, &peers)
        });

        match claimed {
            None => Ok(None),
            Some(index) => {
                let package = &mut build.packages[index];
                package.status = PackageStatus::Running;
                package.started_at = Some(Utc::now());
                Ok(Some(package.clone()))
            }
        }
    }

    async fn requeue_stale(&self, older_than: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than)
                .map_err(|err| Error::Internal(err.to_string()))?;
        let mut requeued = 0;

        let mut builds = self.builds.lock().unwrap();
        for build in builds.values_mut() {
            for package in &mut build.packages {
                let expired = package.status == PackageStatus::Running
                    && package.started_at.map_or(true, |at| at < cutoff);
                if expired {
                    package.status = PackageStatus::Pending;
                    package.started_at = None;
                    package.backend = None;
                    package.error = None;
                    requeued += 1;
                }
            }
        }
        Ok(requeued)
    }
}
