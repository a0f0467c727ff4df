use models::Artifact;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use url::Url;

mod gcs;
mod local;

pub use gcs::{GcsStorage, RetryPolicy};
pub use local::LocalStorage;

/// Reader is a streaming source of log or artifact bytes.
pub type Reader = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o failure under {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("storage request failed")]
    Http(#[from] reqwest::Error),
    #[error("storage responded {status} for {key:?}: {body}")]
    Status { key: String, status: u16, body: String },
    #[error("upload of {key:?} failed after {attempts} attempts")]
    RetriesExhausted {
        key: String,
        attempts: u32,
        #[source]
        source: Box<Error>,
    },
    #[error("storage operation cancelled")]
    Cancelled,
    #[error("{0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

// Connection-level failures which only identify themselves in the
// rendered error text.
const TRANSIENT_MARKERS: &[&str] = &[
    "connection reset",
    "connection refused",
    "timeout",
    "temporary failure",
];

impl Error {
    /// Whether this failure is worth another attempt: retryable HTTP
    /// statuses, deadline expiry, and connection-level failures.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Status { status, .. } => matches!(status, 429 | 500 | 502 | 503 | 504),
            Error::Http(err) => {
                if err.is_timeout() || err.is_connect() {
                    return true;
                }
                let text = format!("{err:?}").to_ascii_lowercase();
                TRANSIENT_MARKERS.iter().any(|marker| text.contains(marker))
            }
            _ => false,
        }
    }
}

/// Summary of a completed output-directory sync.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncSummary {
    pub files: usize,
    pub bytes: u64,
}

/// Storage is the durable sink for build logs and artifact files.
///
/// Two implementations: [`LocalStorage`] writes a rooted directory
/// tree and answers `file://` URLs; [`GcsStorage`] uploads to a cloud
/// bucket and answers `gs://` URLs. The API returns either opaquely.
#[async_trait::async_trait]
pub trait Storage: Send + Sync + 'static {
    /// Stream-write the log of one package build. Returns its URL.
    async fn write_log(&self, build_id: &str, package: &str, reader: Reader) -> Result<Url>;

    /// Stream-write a single artifact; the content type is inferred
    /// from the file extension.
    async fn write_artifact(&self, build_id: &str, name: &str, reader: Reader) -> Result<Url>;

    /// The URL of a previously written package log, if any.
    async fn log_url(&self, build_id: &str, package: &str) -> Result<Option<Url>>;

    /// Every artifact stored for the build.
    async fn list_artifacts(&self, build_id: &str) -> Result<Vec<Artifact>>;

    /// A local path the executor may write build outputs into. For
    /// local storage this is the persistent output location; for cloud
    /// storage it is a fresh scratch directory to be synced afterward.
    async fn output_dir(&self, build_id: &str) -> Result<PathBuf>;

    /// Upload every regular file under `local`: files whose relative
    /// path contains a `logs` component or carries a `.log` suffix go
    /// to the logs namespace, everything else to artifacts.
    async fn sync_output_dir(
        &self,
        build_id: &str,
        local: &Path,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary>;

    /// The URL of the build's artifact namespace.
    fn artifacts_url(&self, build_id: &str) -> Url;
}

/// Infer a content type from a file name. Unknown extensions are left
/// unset rather than guessed.
pub fn content_type_for(name: &str) -> Option<&'static str> {
    if name.ends_with(".tar.gz") {
        Some("application/gzip")
    } else if name.ends_with(".apk") {
        Some("application/vnd.apk")
    } else if name.ends_with(".log") {
        Some("text/plain")
    } else {
        None
    }
}

pub(crate) enum ObjectKind {
    Log,
    Artifact,
}

pub(crate) struct PlanItem {
    pub abs: PathBuf,
    pub rel: String,
    pub kind: ObjectKind,
}

/// Walk `local` and build the upload plan for a sync: every regular
/// file, classified into the logs or artifacts namespace.
pub(crate) fn plan_output_dir(local: &Path) -> Result<Vec<PlanItem>> {
    let mut plan = Vec::new();
    for entry in walkdir::WalkDir::new(local).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|err| Error::Io {
            path: local.to_path_buf(),
            source: err.into(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        let rel_path = entry
            .path()
            .strip_prefix(local)
            .expect("walked entries live under the walk root");
        let rel = rel_path.to_string_lossy().replace('\\', "/");
        let kind = if rel.ends_with(".log")
            || rel_path
                .components()
                .any(|c| c.as_os_str() == std::ffi::OsStr::new("logs"))
        {
            ObjectKind::Log
        } else {
            ObjectKind::Artifact
        };
        plan.push(PlanItem {
            abs: entry.path().to_path_buf(),
            rel,
            kind,
        });
    }
    Ok(plan)
}
