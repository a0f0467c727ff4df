//! Minimal package-configuration extraction.
//!
//! Full configuration linting belongs to the build layer; the server
//! only needs each package's identity and its in-build dependency
//! names to assemble the job DAG. Everything else in the document is
//! carried opaquely to the executor.

use anyhow::Context;

#[derive(Debug, serde::Deserialize)]
struct Document {
    package: PackageSection,
    #[serde(default)]
    dependencies: Vec<String>,
}

#[derive(Debug, serde::Deserialize)]
struct PackageSection {
    #[serde(default)]
    name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageConfig {
    pub name: String,
    pub dependencies: Vec<String>,
}

/// Extract the package name and dependency list from one declarative
/// configuration document.
pub fn parse_package(config_yaml: &str) -> anyhow::Result<PackageConfig> {
    let document: Document =
        serde_yaml::from_str(config_yaml).context("parsing package configuration")?;
    if document.package.name.is_empty() {
        anyhow::bail!("package.name is required");
    }

    let mut dependencies = Vec::new();
    for dependency in document.dependencies {
        if dependency == document.package.name {
            anyhow::bail!("package {:?} depends on itself", document.package.name);
        }
        if !dependencies.contains(&dependency) {
            dependencies.push(dependency);
        }
    }

    Ok(PackageConfig {
        name: document.package.name,
        dependencies,
    })
}

#[cfg(test)]
mod test {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_name_and_dependencies() {
        let parsed = parse_package(
            r#"
package:
  name: curl
  version: 8.9.0
  epoch: 0
dependencies:
  - zlib
  - openssl
  - zlib
environment:
  contents:
    packages:
      - build-base
pipeline:
  - uses: fetch
  - runs: make install
"#,
        )
        .unwrap();
        assert_eq!(parsed.name, "curl");
        // Duplicates collapse, order is preserved.
        assert_eq!(parsed.dependencies, vec!["zlib", "openssl"]);
    }

    #[test]
    fn dependencies_are_optional() {
        let parsed = parse_package("package:\n  name: zlib\n").unwrap();
        assert_eq!(parsed.name, "zlib");
        assert!(parsed.dependencies.is_empty());
    }

    #[test]
    fn rejects_nameless_and_self_dependent_packages() {
        assert!(parse_package("package: {}\n").is_err());
        assert!(parse_package("dependencies: [a]\n").is_err());
        assert!(parse_package("not yaml: [").is_err());
        assert!(
            parse_package("package:\n  name: curl\ndependencies:\n  - curl\n").is_err(),
            "self-dependency must be rejected"
        );
    }
}
