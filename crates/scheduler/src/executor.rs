use futures::StreamExt;
use models::{Backend, PackageJob};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// ExecuteOptions carries the per-build flags and the local directory
/// the executor must leave build outputs under.
#[derive(Debug, Clone)]
pub struct ExecuteOptions {
    pub with_test: bool,
    pub debug: bool,
    pub output_dir: PathBuf,
}

/// ExecutionReport is what a successful remote execution leaves
/// behind, beyond the artifact files in the output directory.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub log: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("build cancelled")]
    Cancelled,
    /// The remote build ran and failed; any log collected so far is
    /// preserved so it can still be persisted for the package.
    #[error("{message}")]
    Failed { message: String, log: Vec<u8> },
    #[error("backend transport failed")]
    Transport(#[from] reqwest::Error),
}

/// Executor drives one claimed package to completion on a chosen
/// backend: it compiles the package's pipelines and sources into the
/// worker's graph representation, streams remote execution, and on
/// success leaves artifacts under `options.output_dir` and returns the
/// collected log bytes.
#[async_trait::async_trait]
pub trait Executor: Send + Sync + 'static {
    async fn execute(
        &self,
        cancel: &CancellationToken,
        package: &PackageJob,
        backend: &Backend,
        options: &ExecuteOptions,
    ) -> Result<ExecutionReport, ExecutorError>;
}

/// RemoteExecutor speaks to a worker's graph executor over its socket
/// URL: it posts the graph submission and consumes a stream of
/// newline-delimited JSON frames until a terminal `done` frame.
pub struct RemoteExecutor {
    http: reqwest::Client,
}

impl RemoteExecutor {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .connect_timeout(Duration::from_secs(10))
                .build()
                .expect("reqwest client builds"),
        }
    }
}

impl Default for RemoteExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(serde::Serialize)]
struct GraphSubmission<'a> {
    package: &'a str,
    config: &'a str,
    dependencies: &'a [String],
    pipelines: &'a BTreeMap<String, String>,
    source_files: &'a BTreeMap<String, Vec<u8>>,
    with_test: bool,
    debug: bool,
}

/// One frame of the worker's execution stream.
#[derive(serde::Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
enum Frame {
    Log {
        line: String,
    },
    Done {
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
}

#[async_trait::async_trait]
impl Executor for RemoteExecutor {
    #[tracing::instrument(skip_all, fields(package = %package.name, backend = %backend.addr))]
    async fn execute(
        &self,
        cancel: &CancellationToken,
        package: &PackageJob,
        backend: &Backend,
        options: &ExecuteOptions,
    ) -> Result<ExecutionReport, ExecutorError> {
        let submission = GraphSubmission {
            package: &package.name,
            config: &package.config_yaml,
            dependencies: &package.dependencies,
            pipelines: &package.pipelines,
            source_files: &package.source_files,
            with_test: options.with_test,
            debug: options.debug,
        };
        let url = format!("{}/v1/graphs", backend.addr.trim_end_matches('/'));

        tokio::select! {
            biased;
            () = cancel.cancelled() => Err(ExecutorError::Cancelled),
            result = self.stream_execution(&url, &submission) => result,
        }
    }
}

impl RemoteExecutor {
    async fn stream_execution(
        &self,
        url: &str,
        submission: &GraphSubmission<'_>,
    ) -> Result<ExecutionReport, ExecutorError> {
        let response = self.http.post(url).json(submission).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ExecutorError::Failed {
                message: format!("backend rejected graph submission: {status}: {body}"),
                log: Vec::new(),
            });
        }

        let mut stream = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();
        let mut log: Vec<u8> = Vec::new();

        while let Some(chunk) = stream.next().await {
            buffer.extend_from_slice(&chunk?);
            while let Some(newline) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=newline).collect();
                let line = &line[..line.len() - 1];
                if line.is_empty() {
                    continue;
                }
                match serde_json::from_slice::<Frame>(line) {
                    Ok(Frame::Log { line }) => {
                        log.extend_from_slice(line.as_bytes());
                        log.push(b'\n');
                    }
                    Ok(Frame::Done { ok: true, .. }) => {
                        return Ok(ExecutionReport { log });
                    }
                    Ok(Frame::Done { ok: false, error }) => {
                        return Err(ExecutorError::Failed {
                            message: error.unwrap_or_else(|| "build failed".to_string()),
                            log,
                        });
                    }
                    // Workers may interleave raw output with frames;
                    // keep it rather than dropping it on the floor.
                    Err(_) => {
                        log.extend_from_slice(line);
                        log.push(b'\n');
                    }
                }
            }
        }

        Err(ExecutorError::Failed {
            message: "executor stream ended without a terminal frame".to_string(),
            log,
        })
    }
}
