use pretty_assertions::assert_eq;
use storage::{LocalStorage, Storage};
use tokio_util::sync::CancellationToken;

fn reader(bytes: &'static [u8]) -> storage::Reader {
    Box::new(bytes)
}

#[tokio::test]
async fn writes_answer_file_urls() {
    let root = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(root.path()).unwrap();

    let log_url = storage
        .write_log("bld-0a1b2c3d", "curl", reader(b"fetch...\nbuild...\n"))
        .await
        .unwrap();
    assert_eq!(log_url.scheme(), "file");
    assert!(log_url.path().ends_with("logs/bld-0a1b2c3d/curl.log"));

    let found = storage.log_url("bld-0a1b2c3d", "curl").await.unwrap();
    assert_eq!(found, Some(log_url));
    assert_eq!(storage.log_url("bld-0a1b2c3d", "zlib").await.unwrap(), None);

    let artifact_url = storage
        .write_artifact("bld-0a1b2c3d", "x86_64/curl-8.9.0-r0.apk", reader(b"apk bytes"))
        .await
        .unwrap();
    assert!(artifact_url
        .path()
        .ends_with("artifacts/bld-0a1b2c3d/x86_64/curl-8.9.0-r0.apk"));

    let content = std::fs::read(artifact_url.to_file_path().unwrap()).unwrap();
    assert_eq!(content, b"apk bytes");
}

#[tokio::test]
async fn list_artifacts_reports_relative_names_and_sizes() {
    let root = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(root.path()).unwrap();

    storage
        .write_artifact("bld-0a1b2c3d", "x86_64/curl-8.9.0-r0.apk", reader(b"12345"))
        .await
        .unwrap();
    storage
        .write_artifact("bld-0a1b2c3d", "APKINDEX.tar.gz", reader(b"123"))
        .await
        .unwrap();
    // Artifacts of other builds must not leak into the listing.
    storage
        .write_artifact("bld-ffffffff", "other.apk", reader(b"x"))
        .await
        .unwrap();

    let artifacts = storage.list_artifacts("bld-0a1b2c3d").await.unwrap();
    let summary: Vec<(&str, u64)> = artifacts.iter().map(|a| (a.name.as_str(), a.size)).collect();
    assert_eq!(
        summary,
        vec![("APKINDEX.tar.gz", 3), ("x86_64/curl-8.9.0-r0.apk", 5)]
    );
    assert_eq!(storage.list_artifacts("bld-00000000").await.unwrap(), vec![]);
}

#[tokio::test]
async fn sync_splits_logs_from_artifacts() {
    let root = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(root.path()).unwrap();

    let out = storage.output_dir("bld-0a1b2c3d").await.unwrap();
    std::fs::create_dir_all(out.join("logs")).unwrap();
    std::fs::create_dir_all(out.join("x86_64")).unwrap();
    std::fs::write(out.join("logs/steps.txt"), b"step log").unwrap();
    std::fs::write(out.join("melange.log"), b"top log").unwrap();
    std::fs::write(out.join("x86_64/curl-8.9.0-r0.apk"), b"apk").unwrap();
    std::fs::write(out.join("x86_64/curl-doc-8.9.0-r0.apk"), b"doc").unwrap();

    let summary = storage
        .sync_output_dir("bld-0a1b2c3d", &out, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(summary.files, 4);
    assert_eq!(summary.bytes, 8 + 7 + 3 + 3);

    // Log-suffixed and logs/-nested files land in the logs namespace.
    assert!(root.path().join("logs/bld-0a1b2c3d/logs/steps.txt").is_file());
    assert!(root.path().join("logs/bld-0a1b2c3d/melange.log").is_file());

    let artifacts = storage.list_artifacts("bld-0a1b2c3d").await.unwrap();
    let names: Vec<&str> = artifacts.iter().map(|a| a.name.as_str()).collect();
    assert_eq!(
        names,
        vec!["x86_64/curl-8.9.0-r0.apk", "x86_64/curl-doc-8.9.0-r0.apk"]
    );
}

#[tokio::test]
async fn sync_honors_cancellation() {
    let root = tempfile::tempdir().unwrap();
    let storage = LocalStorage::new(root.path()).unwrap();

    let out = storage.output_dir("bld-0a1b2c3d").await.unwrap();
    std::fs::write(out.join("a.apk"), b"a").unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = storage.sync_output_dir("bld-0a1b2c3d", &out, &cancel).await;
    assert!(matches!(result, Err(storage::Error::Cancelled)));
}
