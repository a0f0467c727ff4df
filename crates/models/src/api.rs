use crate::Backend;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Request body of `POST /api/v1/builds`. Exactly one of
/// `config_yaml`, `configs`, or `git_source` selects the package
/// configuration source.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateBuildRequest {
    /// A single inline package configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_yaml: Option<String>,
    /// Many inline package configurations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub configs: Vec<String>,
    /// Clone a repository and discover its package configurations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub git_source: Option<GitSource>,
    /// Shared pipeline library (path => YAML).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pipelines: BTreeMap<String, String>,
    /// Files materialised into each package's workspace
    /// (package name => relative path => bytes).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source_files: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    /// Target architecture; the server's host architecture if unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arch: Option<String>,
    /// Label equality constraints any chosen backend must satisfy.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub backend_selector: BTreeMap<String, String>,
    #[serde(default)]
    pub with_test: bool,
    #[serde(default)]
    pub debug: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitSource {
    pub url: String,
    #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

/// Response body of `POST /api/v1/builds`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateBuildResponse {
    pub id: String,
    /// Package names in submission order.
    pub packages: Vec<String>,
}

/// Response body of `GET /api/v1/backends`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendListing {
    pub backends: Vec<Backend>,
    pub architectures: Vec<String>,
}

/// Request body of `DELETE /api/v1/backends`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoveBackendRequest {
    pub addr: String,
}
