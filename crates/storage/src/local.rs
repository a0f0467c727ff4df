use super::{plan_output_dir, Error, ObjectKind, Reader, Result, Storage, SyncSummary};
use models::Artifact;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use url::Url;

/// LocalStorage keeps logs and artifacts under a rooted directory:
///
/// ```text
/// <root>/logs/<build>/<package>.log
/// <root>/artifacts/<build>/<relative path>
/// <root>/out/<build>/            (executor output location)
/// ```
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    /// Create the root directory if needed and canonicalize it, so
    /// every returned `file://` URL is absolute.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root).map_err(|source| Error::Io {
            path: root.clone(),
            source,
        })?;
        let root = root.canonicalize().map_err(|source| Error::Io {
            path: root.clone(),
            source,
        })?;
        Ok(Self { root })
    }

    fn log_path(&self, build_id: &str, package: &str) -> PathBuf {
        self.root.join("logs").join(build_id).join(format!("{package}.log"))
    }

    fn artifact_path(&self, build_id: &str, name: &str) -> PathBuf {
        self.root.join("artifacts").join(build_id).join(name)
    }

    async fn write_file(&self, path: &Path, mut reader: Reader) -> Result<Url> {
        let parent = path.parent().expect("storage paths always have a parent");
        tokio::fs::create_dir_all(parent).await.map_err(|source| Error::Io {
            path: parent.to_path_buf(),
            source,
        })?;
        let mut file = tokio::fs::File::create(path).await.map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tokio::io::copy(&mut reader, &mut file)
            .await
            .map_err(|source| Error::Io {
                path: path.to_path_buf(),
                source,
            })?;
        file_url(path)
    }
}

fn file_url(path: &Path) -> Result<Url> {
    Url::from_file_path(path)
        .map_err(|()| Error::Internal(format!("path {path:?} is not an absolute file URL")))
}

#[async_trait::async_trait]
impl Storage for LocalStorage {
    async fn write_log(&self, build_id: &str, package: &str, reader: Reader) -> Result<Url> {
        self.write_file(&self.log_path(build_id, package), reader).await
    }

    async fn write_artifact(&self, build_id: &str, name: &str, reader: Reader) -> Result<Url> {
        self.write_file(&self.artifact_path(build_id, name), reader).await
    }

    async fn log_url(&self, build_id: &str, package: &str) -> Result<Option<Url>> {
        let path = self.log_path(build_id, package);
        match tokio::fs::try_exists(&path).await {
            Ok(true) => Ok(Some(file_url(&path)?)),
            Ok(false) => Ok(None),
            Err(source) => Err(Error::Io { path, source }),
        }
    }

    async fn list_artifacts(&self, build_id: &str) -> Result<Vec<Artifact>> {
        let base = self.root.join("artifacts").join(build_id);
        if !base.exists() {
            return Ok(Vec::new());
        }

        let mut artifacts = Vec::new();
        for entry in walkdir::WalkDir::new(&base).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(|err| Error::Io {
                path: base.clone(),
                source: err.into(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry
                .path()
                .strip_prefix(&base)
                .expect("walked entries live under the walk root")
                .to_string_lossy()
                .replace('\\', "/");
            let size = entry
                .metadata()
                .map_err(|err| Error::Io {
                    path: entry.path().to_path_buf(),
                    source: err.into(),
                })?
                .len();
            artifacts.push(Artifact {
                name,
                url: file_url(entry.path())?.to_string(),
                size,
            });
        }
        Ok(artifacts)
    }

    async fn output_dir(&self, build_id: &str) -> Result<PathBuf> {
        let dir = self.root.join("out").join(build_id);
        tokio::fs::create_dir_all(&dir).await.map_err(|source| Error::Io {
            path: dir.clone(),
            source,
        })?;
        Ok(dir)
    }

    async fn sync_output_dir(
        &self,
        build_id: &str,
        local: &Path,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary> {
        let mut summary = SyncSummary::default();
        for item in plan_output_dir(local)? {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            let dest = match item.kind {
                ObjectKind::Log => self.root.join("logs").join(build_id).join(&item.rel),
                ObjectKind::Artifact => self.artifact_path(build_id, &item.rel),
            };
            let parent = dest.parent().expect("storage paths always have a parent");
            tokio::fs::create_dir_all(parent).await.map_err(|source| Error::Io {
                path: parent.to_path_buf(),
                source,
            })?;
            let bytes = tokio::fs::copy(&item.abs, &dest).await.map_err(|source| Error::Io {
                path: item.abs.clone(),
                source,
            })?;
            summary.files += 1;
            summary.bytes += bytes;
        }
        Ok(summary)
    }

    fn artifacts_url(&self, build_id: &str) -> Url {
        file_url(&self.root.join("artifacts").join(build_id))
            .expect("storage root is canonicalized at construction")
    }
}
