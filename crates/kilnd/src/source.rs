//! Git source discovery: clone the submitted repository and collect
//! its top-level package configurations.

use anyhow::Context;

/// Shallow-clone `url` (optionally at `reference`) and return the
/// contents of its top-level `*.yaml`/`*.yml` documents in file-name
/// order. Nested directories are left alone: by convention they hold
/// pipelines and per-package sources, not package configurations.
pub async fn discover_git_configs(
    url: &str,
    reference: Option<&str>,
) -> anyhow::Result<Vec<String>> {
    let checkout = tempfile::tempdir().context("creating checkout directory")?;

    let mut clone = tokio::process::Command::new("git");
    clone.arg("clone").arg("--quiet").arg("--depth").arg("1");
    if let Some(reference) = reference {
        clone.arg("--branch").arg(reference);
    }
    clone.arg(url).arg(checkout.path());

    tracing::debug!(%url, ?reference, "cloning build source");
    let output = clone.output().await.context("running git clone")?;
    if !output.status.success() {
        anyhow::bail!(
            "git clone of {url} failed: {}",
            String::from_utf8_lossy(&output.stderr).trim(),
        );
    }

    let mut discovered = Vec::new();
    let mut entries = tokio::fs::read_dir(checkout.path())
        .await
        .context("reading checkout")?;
    while let Some(entry) = entries.next_entry().await.context("reading checkout")? {
        if !entry.file_type().await.map(|t| t.is_file()).unwrap_or(false) {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !(name.ends_with(".yaml") || name.ends_with(".yml")) {
            continue;
        }
        let content = tokio::fs::read_to_string(entry.path())
            .await
            .with_context(|| format!("reading {name}"))?;
        discovered.push((name, content));
    }
    if discovered.is_empty() {
        anyhow::bail!("no package configurations found in {url}");
    }

    discovered.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(discovered.into_iter().map(|(_, content)| content).collect())
}
