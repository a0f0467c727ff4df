use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// BuildSpec is the declarative description of a multi-package build.
/// The scheduler treats it as immutable once the Build is created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BuildSpec {
    /// Target architecture for every package of this build.
    pub arch: String,
    /// Label equality constraints a chosen backend must satisfy.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub backend_selector: BTreeMap<String, String>,
    /// Shared pipeline library (path => YAML).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub pipelines: BTreeMap<String, String>,
    /// Per-package source trees (package name => path => bytes).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub source_files: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    /// Run the package test pipelines after a successful build.
    #[serde(default)]
    pub with_test: bool,
    /// Forward debug output from the executor.
    #[serde(default)]
    pub debug: bool,
    /// Where the package configurations came from.
    #[serde(default)]
    pub source: BuildSource,
}

impl Default for BuildSpec {
    fn default() -> Self {
        Self {
            arch: std::env::consts::ARCH.to_string(),
            backend_selector: BTreeMap::new(),
            pipelines: BTreeMap::new(),
            source_files: BTreeMap::new(),
            with_test: false,
            debug: false,
            source: BuildSource::Inline,
        }
    }
}

/// BuildSource identifies where a Build's package configurations were
/// obtained from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum BuildSource {
    /// Configurations were submitted inline with the request.
    Inline,
    /// Configurations were discovered from a cloned git repository.
    Git {
        url: String,
        #[serde(default, rename = "ref", skip_serializing_if = "Option::is_none")]
        reference: Option<String>,
    },
}

impl Default for BuildSource {
    fn default() -> Self {
        Self::Inline
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn spec_round_trips_through_json() {
        let mut spec = BuildSpec {
            arch: "aarch64".to_string(),
            with_test: true,
            source: BuildSource::Git {
                url: "https://git.example.com/packages.git".to_string(),
                reference: Some("release-2026.07".to_string()),
            },
            ..Default::default()
        };
        spec.backend_selector
            .insert("zone".to_string(), "us-east1".to_string());
        spec.pipelines
            .insert("pipelines/fetch.yaml".to_string(), "steps: []\n".to_string());
        spec.source_files.insert(
            "curl".to_string(),
            [("series".to_string(), b"musl.patch\n".to_vec())].into_iter().collect(),
        );

        let encoded = serde_json::to_value(&spec).unwrap();
        let decoded: BuildSpec = serde_json::from_value(encoded.clone()).unwrap();
        assert_eq!(serde_json::to_value(&decoded).unwrap(), encoded);
        assert_eq!(decoded.source, spec.source);
    }

    #[test]
    fn git_source_uses_ref_key() {
        let source = BuildSource::Git {
            url: "https://git.example.com/p.git".to_string(),
            reference: Some("main".to_string()),
        };
        let value = serde_json::to_value(&source).unwrap();
        assert_eq!(value["type"], "git");
        assert_eq!(value["ref"], "main");
    }

    #[test]
    fn default_spec_targets_host_arch() {
        let spec = BuildSpec::default();
        assert_eq!(spec.arch, std::env::consts::ARCH);
        assert_eq!(spec.source, BuildSource::Inline);
        assert!(!spec.with_test && !spec.debug);
    }
}
