use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub mod api;
mod spec;
mod status;

pub use spec::{BuildSource, BuildSpec};
pub use status::{BuildStatus, PackageStatus};

/// Build is a submission which produces zero or more package artifacts
/// from an ordered DAG of PackageJobs. It is created once via the API
/// and thereafter driven by the scheduler until every package reaches
/// a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    /// Opaque identifier, `bld-` followed by eight random hex digits.
    pub id: String,
    pub spec: BuildSpec,
    pub status: BuildStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    /// Packages in submission order (ascending `position`).
    pub packages: Vec<PackageJob>,
}

impl Build {
    /// Create a new pending Build over `packages`, assigning a fresh ID
    /// and stamping each package with it and with its submission position.
    pub fn new(spec: BuildSpec, mut packages: Vec<PackageJob>) -> Self {
        let id = new_build_id();
        for (position, package) in packages.iter_mut().enumerate() {
            package.build_id = id.clone();
            package.position = position as i32;
        }
        Self {
            id,
            spec,
            status: BuildStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            packages,
        }
    }

    pub fn package(&self, name: &str) -> Option<&PackageJob> {
        self.packages.iter().find(|p| p.name == name)
    }

    /// The overall status implied by the current package statuses.
    pub fn roll_up(&self) -> BuildStatus {
        let statuses: Vec<PackageStatus> = self.packages.iter().map(|p| p.status).collect();
        BuildStatus::roll_up(&statuses)
    }
}

/// PackageJob is one node of a Build's DAG: the unit of claim and of
/// remote execution. Unique within its Build by name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageJob {
    pub build_id: String,
    pub name: String,
    /// Raw declarative configuration for this package.
    pub config_yaml: String,
    /// Names of packages this one depends upon. Names which don't match
    /// a peer package of the same Build are external and never block
    /// scheduling.
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub status: PackageStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub log_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    /// Backend assigned at claim time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<Backend>,
    /// Shared pipeline definitions resolved for this package (path => YAML).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pipelines: BTreeMap<String, String>,
    /// Source files materialised into the package workspace (path => bytes).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source_files: BTreeMap<String, Vec<u8>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<PackageMetrics>,
    /// Submission order within the Build, for deterministic iteration.
    pub position: i32,
}

impl PackageJob {
    pub fn new(name: &str, config_yaml: &str, dependencies: Vec<String>) -> Self {
        Self {
            build_id: String::new(),
            name: name.to_string(),
            config_yaml: config_yaml.to_string(),
            dependencies,
            status: PackageStatus::Pending,
            started_at: None,
            finished_at: None,
            error: None,
            log_url: None,
            output_url: None,
            backend: None,
            pipelines: BTreeMap::new(),
            source_files: BTreeMap::new(),
            metrics: None,
            position: 0,
        }
    }
}

/// Backend describes one remote worker endpoint capable of executing a
/// package's build graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backend {
    /// Socket URL of the worker's graph executor.
    pub addr: String,
    /// Architecture tag, e.g. `x86_64` or `aarch64`.
    pub arch: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Backend {
    /// Whether every key of `selector` equals this backend's label value
    /// for that key.
    pub fn matches_selector(&self, selector: &BTreeMap<String, String>) -> bool {
        selector
            .iter()
            .all(|(k, v)| self.labels.get(k).map_or(false, |have| have == v))
    }
}

/// Artifact is the logical (name, URL, size) record returned by storage
/// listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub url: String,
    pub size: u64,
}

/// Coarse per-package timings and sizes recorded by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PackageMetrics {
    /// Seconds spent waiting between build creation and claim.
    pub queued_seconds: f64,
    /// Seconds spent executing on the backend.
    pub build_seconds: f64,
    /// Total artifact bytes synced to storage.
    pub artifact_bytes: u64,
}

/// Mint a fresh build ID: `bld-` plus eight random hex digits.
pub fn new_build_id() -> String {
    format!("bld-{:08x}", rand::random::<u32>())
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn build_ids_are_prefixed_hex() {
        let id = new_build_id();
        assert_eq!(id.len(), 12);
        assert!(id.starts_with("bld-"));
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn new_build_stamps_packages() {
        let packages = vec![
            PackageJob::new("zlib", "package:\n  name: zlib\n", vec![]),
            PackageJob::new("curl", "package:\n  name: curl\n", vec!["zlib".to_string()]),
        ];
        let build = Build::new(BuildSpec::default(), packages);

        assert_eq!(build.status, BuildStatus::Pending);
        assert_eq!(build.packages.len(), 2);
        for (index, package) in build.packages.iter().enumerate() {
            assert_eq!(package.build_id, build.id);
            assert_eq!(package.position, index as i32);
            assert_eq!(package.status, PackageStatus::Pending);
        }
        assert_eq!(build.package("curl").unwrap().dependencies, vec!["zlib"]);
        assert!(build.package("openssl").is_none());
    }

    #[test]
    fn selector_match_requires_every_key() {
        let backend = Backend {
            addr: "http://worker-1:9090".to_string(),
            arch: "x86_64".to_string(),
            labels: [("zone", "us-east1"), ("tier", "large")]
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        };

        assert!(backend.matches_selector(&BTreeMap::new()));
        assert!(backend.matches_selector(
            &[("zone".to_string(), "us-east1".to_string())].into_iter().collect()
        ));
        assert!(!backend.matches_selector(
            &[("zone".to_string(), "us-west1".to_string())].into_iter().collect()
        ));
        assert!(!backend.matches_selector(
            &[("gpu".to_string(), "true".to_string())].into_iter().collect()
        ));
    }

    #[test]
    fn package_job_serde_round_trip() {
        let mut job = PackageJob::new("curl", "package:\n  name: curl\n", vec!["zlib".into()]);
        job.build_id = "bld-00c0ffee".to_string();
        job.source_files
            .insert("patches/musl.patch".to_string(), b"--- a\n+++ b\n".to_vec());
        job.pipelines
            .insert("pipelines/fetch.yaml".to_string(), "steps: []\n".to_string());

        let encoded = serde_json::to_string(&job).unwrap();
        let decoded: PackageJob = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded.name, job.name);
        assert_eq!(decoded.dependencies, job.dependencies);
        assert_eq!(decoded.source_files, job.source_files);
        assert_eq!(decoded.pipelines, job.pipelines);
    }
}
