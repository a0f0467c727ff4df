//! Typed client over the kiln HTTP API, used by remote submissions.

use models::api::{
    BackendListing, CreateBuildRequest, CreateBuildResponse, RemoveBackendRequest,
};
use models::{Backend, Build};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request failed")]
    Http(#[from] reqwest::Error),
    #[error("invalid endpoint path")]
    Url(#[from] url::ParseError),
    /// A non-2xx answer; `message` is the server's text body.
    #[error("kiln answered {status}: {message}")]
    Api { status: u16, message: String },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Client for one kiln server endpoint.
#[derive(Clone)]
pub struct Client {
    endpoint: Url,
    http: reqwest::Client,
}

impl Client {
    pub fn new(endpoint: Url) -> Self {
        Self {
            endpoint,
            http: reqwest::Client::new(),
        }
    }

    pub async fn health(&self) -> Result<()> {
        let response = self.http.get(self.endpoint.join("healthz")?).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    pub async fn create_build(&self, request: &CreateBuildRequest) -> Result<CreateBuildResponse> {
        let response = self
            .http
            .post(self.endpoint.join("api/v1/builds")?)
            .json(request)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn list_builds(&self) -> Result<Vec<Build>> {
        let response = self
            .http
            .get(self.endpoint.join("api/v1/builds")?)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn get_build(&self, id: &str) -> Result<Build> {
        let response = self
            .http
            .get(self.endpoint.join(&format!("api/v1/builds/{id}"))?)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn list_backends(&self, arch: Option<&str>) -> Result<BackendListing> {
        let mut url = self.endpoint.join("api/v1/backends")?;
        if let Some(arch) = arch {
            url.query_pairs_mut().append_pair("arch", arch);
        }
        let response = self.http.get(url).send().await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn add_backend(&self, backend: &Backend) -> Result<Backend> {
        let response = self
            .http
            .post(self.endpoint.join("api/v1/backends")?)
            .json(backend)
            .send()
            .await?;
        Ok(Self::check(response).await?.json().await?)
    }

    pub async fn remove_backend(&self, addr: &str) -> Result<()> {
        let response = self
            .http
            .delete(self.endpoint.join("api/v1/backends")?)
            .json(&RemoveBackendRequest {
                addr: addr.to_string(),
            })
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        Err(Error::Api {
            status: status.as_u16(),
            message: response.text().await.unwrap_or_default(),
        })
    }
}
