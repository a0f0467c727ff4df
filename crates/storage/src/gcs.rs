use super::{
    content_type_for, plan_output_dir, Error, ObjectKind, Reader, Result, Storage, SyncSummary,
};
use models::Artifact;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Backoff applied to transient upload failures: an explicit loop of
/// (attempt, sleep, reopen, upload), doubling the delay up to `cap`.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base: Duration::from_millis(500),
            cap: Duration::from_secs(10),
        }
    }
}

/// GcsStorage uploads logs and artifacts to a Google Cloud Storage
/// bucket through its JSON API, and answers `gs://` URLs.
///
/// The endpoint is overridable so tests can stand in a local stub
/// server; authorization uses a bearer token taken from
/// `GOOGLE_OAUTH_ACCESS_TOKEN` when present.
pub struct GcsStorage {
    bucket: String,
    prefix: String,
    endpoint: Url,
    http: reqwest::Client,
    token: Option<String>,
    upload_permits: Arc<tokio::sync::Semaphore>,
    retry: RetryPolicy,
}

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com/";
const DEFAULT_UPLOAD_CONCURRENCY: usize = 50;

impl GcsStorage {
    pub fn new(bucket: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            prefix: String::new(),
            endpoint: Url::parse(DEFAULT_ENDPOINT).expect("default endpoint parses"),
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .timeout(Duration::from_secs(300))
                .build()
                .expect("reqwest client builds"),
            token: std::env::var("GOOGLE_OAUTH_ACCESS_TOKEN").ok(),
            upload_permits: Arc::new(tokio::sync::Semaphore::new(DEFAULT_UPLOAD_CONCURRENCY)),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: Url) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Key prefix inside the bucket, normalized to end with `/`.
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        let mut prefix = prefix.trim_start_matches('/').to_string();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }
        self.prefix = prefix;
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_upload_concurrency(mut self, permits: usize) -> Self {
        self.upload_permits = Arc::new(tokio::sync::Semaphore::new(permits));
        self
    }

    fn log_key(&self, build_id: &str, package: &str) -> String {
        format!("{}logs/{build_id}/{package}.log", self.prefix)
    }

    fn artifact_key(&self, build_id: &str, name: &str) -> String {
        format!("{}artifacts/{build_id}/{name}", self.prefix)
    }

    fn object_url(&self, key: &str) -> Url {
        Url::parse(&format!("gs://{}/{key}", self.bucket)).expect("bucket keys form valid URLs")
    }

    /// One attempt: upload `body` as the object at `key`.
    async fn put_object(&self, key: &str, content_type: Option<&str>, body: Vec<u8>) -> Result<()> {
        let mut url = self
            .endpoint
            .join(&format!("upload/storage/v1/b/{}/o", self.bucket))
            .map_err(|err| Error::Internal(err.to_string()))?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", key);

        let mut request = self.http.post(url).body(body);
        if let Some(content_type) = content_type {
            request = request.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                key: key.to_string(),
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Upload with the retry policy, classifying each failure as
    /// transient or terminal. `reopen` produces a fresh body per
    /// attempt so a consumed reader never poisons the next try.
    async fn put_with_retry<F, Fut>(
        &self,
        cancel: &CancellationToken,
        key: &str,
        content_type: Option<&str>,
        reopen: F,
    ) -> Result<u64>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<Vec<u8>>>,
    {
        let mut delay = self.retry.base;
        let mut attempt = 0;
        loop {
            attempt += 1;
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }

            let body = reopen().await?;
            let bytes = body.len() as u64;
            match self.put_object(key, content_type, body).await {
                Ok(()) => return Ok(bytes),
                Err(err) if err.is_transient() && attempt < self.retry.max_attempts => {
                    tracing::warn!(%key, attempt, ?delay, error = %err, "transient upload failure, retrying");
                    tokio::select! {
                        () = cancel.cancelled() => return Err(Error::Cancelled),
                        () = tokio::time::sleep(delay) => {}
                    }
                    delay = std::cmp::min(delay * 2, self.retry.cap);
                }
                Err(err) if err.is_transient() => {
                    return Err(Error::RetriesExhausted {
                        key: key.to_string(),
                        attempts: attempt,
                        source: Box::new(err),
                    });
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn put_bytes(&self, key: &str, content_type: Option<&str>, body: Vec<u8>) -> Result<()> {
        let cancel = CancellationToken::new();
        self.put_with_retry(&cancel, key, content_type, || {
            let body = body.clone();
            async move { Ok(body) }
        })
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl Storage for GcsStorage {
    async fn write_log(&self, build_id: &str, package: &str, mut reader: Reader) -> Result<Url> {
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.map_err(|source| Error::Io {
            path: PathBuf::from(format!("{build_id}/{package}.log")),
            source,
        })?;
        let key = self.log_key(build_id, package);
        self.put_bytes(&key, Some("text/plain"), body).await?;
        Ok(self.object_url(&key))
    }

    async fn write_artifact(&self, build_id: &str, name: &str, mut reader: Reader) -> Result<Url> {
        let mut body = Vec::new();
        reader.read_to_end(&mut body).await.map_err(|source| Error::Io {
            path: PathBuf::from(name),
            source,
        })?;
        let key = self.artifact_key(build_id, name);
        self.put_bytes(&key, content_type_for(name), body).await?;
        Ok(self.object_url(&key))
    }

    async fn log_url(&self, build_id: &str, package: &str) -> Result<Option<Url>> {
        let key = self.log_key(build_id, package);
        let mut url = self
            .endpoint
            .join(&format!("storage/v1/b/{}/o", self.bucket))
            .map_err(|err| Error::Internal(err.to_string()))?;
        url.path_segments_mut()
            .map_err(|()| Error::Internal("endpoint cannot be a base URL".to_string()))?
            .push(&key);

        let mut request = self.http.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(Error::Status {
                key,
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        Ok(Some(self.object_url(&key)))
    }

    async fn list_artifacts(&self, build_id: &str) -> Result<Vec<Artifact>> {
        let namespace = format!("{}artifacts/{build_id}/", self.prefix);
        let mut url = self
            .endpoint
            .join(&format!("storage/v1/b/{}/o", self.bucket))
            .map_err(|err| Error::Internal(err.to_string()))?;
        url.query_pairs_mut().append_pair("prefix", &namespace);

        let mut request = self.http.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Status {
                key: namespace,
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let listing: ObjectListing = response.json().await?;
        Ok(listing
            .items
            .into_iter()
            .map(|object| {
                let name = object
                    .name
                    .strip_prefix(&namespace)
                    .unwrap_or(&object.name)
                    .to_string();
                Artifact {
                    url: self.object_url(&object.name).to_string(),
                    size: object.size.parse().unwrap_or(0),
                    name,
                }
            })
            .collect())
    }

    async fn output_dir(&self, _build_id: &str) -> Result<PathBuf> {
        // A fresh scratch tree per call; the scheduler syncs and
        // removes it when the package completes.
        let dir = tempfile::Builder::new()
            .prefix("kiln-out-")
            .tempdir()
            .map_err(|source| Error::Io {
                path: std::env::temp_dir(),
                source,
            })?;
        Ok(dir.into_path())
    }

    async fn sync_output_dir(
        &self,
        build_id: &str,
        local: &Path,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary> {
        let plan = plan_output_dir(local)?;
        let cancel = cancel.child_token();

        let uploads = plan.iter().map(|item| {
            let cancel = cancel.clone();
            let permits = self.upload_permits.clone();
            let key = match item.kind {
                ObjectKind::Log => format!("{}logs/{build_id}/{}", self.prefix, item.rel),
                ObjectKind::Artifact => self.artifact_key(build_id, &item.rel),
            };
            async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| Error::Cancelled)?;
                let path = item.abs.clone();
                let outcome = self
                    .put_with_retry(&cancel, &key, content_type_for(&item.rel), || {
                        let path = path.clone();
                        async move {
                            tokio::fs::read(&path).await.map_err(|source| Error::Io {
                                path: path.clone(),
                                source,
                            })
                        }
                    })
                    .await;
                if outcome.is_err() {
                    // Terminal failures abort the remaining uploads.
                    cancel.cancel();
                }
                outcome
            }
        });

        let mut summary = SyncSummary::default();
        let mut first_error = None;
        for outcome in futures::future::join_all(uploads).await {
            match outcome {
                Ok(bytes) => {
                    summary.files += 1;
                    summary.bytes += bytes;
                }
                // Keep the terminal cause, not a sibling's cancellation.
                Err(err) => match &first_error {
                    None => first_error = Some(err),
                    Some(Error::Cancelled) if !matches!(err, Error::Cancelled) => {
                        first_error = Some(err)
                    }
                    _ => {}
                },
            }
        }
        match first_error {
            None => Ok(summary),
            Some(err) => Err(err),
        }
    }

    fn artifacts_url(&self, build_id: &str) -> Url {
        self.object_url(&format!("{}artifacts/{build_id}", self.prefix))
    }
}

#[derive(serde::Deserialize)]
struct ObjectListing {
    #[serde(default)]
    items: Vec<ObjectRecord>,
}

#[derive(serde::Deserialize)]
struct ObjectRecord {
    name: String,
    // The JSON API renders sizes as decimal strings.
    #[serde(default)]
    size: String,
}
