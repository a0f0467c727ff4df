//! API surface tests: a real server on an ephemeral port, driven
//! through the typed client.

use kiln_client::Client;
use kilnd::api::{build_router, AppState};
use models::api::CreateBuildRequest;
use models::{Backend, BuildStatus, PackageStatus};
use pool::BackendPool;
use pretty_assertions::assert_eq;
use std::collections::BTreeMap;
use std::sync::Arc;
use store::MemoryStore;
use url::Url;

async fn spawn_server() -> Client {
    let app = Arc::new(AppState {
        store: Arc::new(MemoryStore::new()),
        pool: Arc::new(BackendPool::new()),
        default_arch: "x86_64".to_string(),
    });
    let router = build_router(app);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    Client::new(Url::parse(&format!("http://{addr}/")).unwrap())
}

fn backend(addr: &str, arch: &str) -> Backend {
    Backend {
        addr: addr.to_string(),
        arch: arch.to_string(),
        labels: BTreeMap::new(),
    }
}

#[tokio::test]
async fn health_answers_ok() {
    let client = spawn_server().await;
    client.health().await.unwrap();
}

#[tokio::test]
async fn backend_management_lifecycle() {
    let client = spawn_server().await;

    client
        .add_backend(&backend("http://w1:9090", "x86_64"))
        .await
        .unwrap();
    client
        .add_backend(&backend("http://w2:9090", "aarch64"))
        .await
        .unwrap();

    // Duplicate registration conflicts; a backend without an arch is
    // a validation failure.
    match client
        .add_backend(&backend("http://w1:9090", "x86_64"))
        .await
        .unwrap_err()
    {
        kiln_client::Error::Api { status, .. } => assert_eq!(status, 409),
        other => panic!("expected API error, got {other:?}"),
    }
    match client
        .add_backend(&backend("http://w3:9090", ""))
        .await
        .unwrap_err()
    {
        kiln_client::Error::Api { status, .. } => assert_eq!(status, 400),
        other => panic!("expected API error, got {other:?}"),
    }

    let listing = client.list_backends(None).await.unwrap();
    assert_eq!(listing.backends.len(), 2);
    assert_eq!(listing.architectures, vec!["aarch64", "x86_64"]);

    let filtered = client.list_backends(Some("aarch64")).await.unwrap();
    assert_eq!(filtered.backends.len(), 1);
    assert_eq!(filtered.backends[0].addr, "http://w2:9090");

    client.remove_backend("http://w2:9090").await.unwrap();
    // The last backend may not be removed.
    match client.remove_backend("http://w1:9090").await.unwrap_err() {
        kiln_client::Error::Api { status, .. } => assert_eq!(status, 409),
        other => panic!("expected API error, got {other:?}"),
    }
    // Unknown backends answer 404.
    match client.remove_backend("http://gone:9090").await.unwrap_err() {
        kiln_client::Error::Api { status, .. } => assert_eq!(status, 404),
        other => panic!("expected API error, got {other:?}"),
    }
}

#[tokio::test]
async fn create_build_validates_the_source_selector() {
    let client = spawn_server().await;

    // No source at all.
    let err = client
        .create_build(&CreateBuildRequest::default())
        .await
        .unwrap_err();
    match err {
        kiln_client::Error::Api { status, message } => {
            assert_eq!(status, 400);
            assert!(message.contains("exactly one of"));
        }
        other => panic!("expected API error, got {other:?}"),
    }

    // Two sources at once.
    let err = client
        .create_build(&CreateBuildRequest {
            config_yaml: Some("package:\n  name: a\n".to_string()),
            configs: vec!["package:\n  name: b\n".to_string()],
            ..Default::default()
        })
        .await
        .unwrap_err();
    match err {
        kiln_client::Error::Api { status, .. } => assert_eq!(status, 400),
        other => panic!("expected API error, got {other:?}"),
    }

    // Broken configuration document.
    let err = client
        .create_build(&CreateBuildRequest {
            config_yaml: Some("package: [".to_string()),
            ..Default::default()
        })
        .await
        .unwrap_err();
    match err {
        kiln_client::Error::Api { status, message } => {
            assert_eq!(status, 400);
            assert!(message.contains("invalid package configuration"));
        }
        other => panic!("expected API error, got {other:?}"),
    }

    // Duplicate package names within one build.
    let err = client
        .create_build(&CreateBuildRequest {
            configs: vec![
                "package:\n  name: curl\n".to_string(),
                "package:\n  name: curl\n".to_string(),
            ],
            ..Default::default()
        })
        .await
        .unwrap_err();
    match err {
        kiln_client::Error::Api { status, message } => {
            assert_eq!(status, 400);
            assert!(message.contains("duplicate package"));
        }
        other => panic!("expected API error, got {other:?}"),
    }
}

#[tokio::test]
async fn create_then_fetch_a_build() {
    let client = spawn_server().await;

    let mut source_files = BTreeMap::new();
    source_files.insert(
        "curl".to_string(),
        [("patches/musl.patch".to_string(), b"--- a\n".to_vec())]
            .into_iter()
            .collect::<BTreeMap<_, _>>(),
    );

    let created = client
        .create_build(&CreateBuildRequest {
            configs: vec![
                "package:\n  name: zlib\n".to_string(),
                "package:\n  name: curl\ndependencies:\n  - zlib\n".to_string(),
            ],
            pipelines: [("pipelines/fetch.yaml".to_string(), "steps: []\n".to_string())]
                .into_iter()
                .collect(),
            source_files,
            backend_selector: [("zone".to_string(), "us-east1".to_string())]
                .into_iter()
                .collect(),
            with_test: true,
            ..Default::default()
        })
        .await
        .unwrap();

    assert!(created.id.starts_with("bld-"));
    assert_eq!(created.packages, vec!["zlib", "curl"]);

    let build = client.get_build(&created.id).await.unwrap();
    assert_eq!(build.status, BuildStatus::Pending);
    // The server filled the host architecture in.
    assert_eq!(build.spec.arch, "x86_64");
    assert!(build.spec.with_test);
    assert_eq!(build.spec.backend_selector["zone"], "us-east1");

    let zlib = build.package("zlib").unwrap();
    assert_eq!(zlib.status, PackageStatus::Pending);
    assert_eq!(zlib.position, 0);
    assert!(zlib.source_files.is_empty());

    let curl = build.package("curl").unwrap();
    assert_eq!(curl.dependencies, vec!["zlib"]);
    assert!(curl.pipelines.contains_key("pipelines/fetch.yaml"));
    assert!(curl.source_files.contains_key("patches/musl.patch"));

    let listed = client.list_builds().await.unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, created.id);

    match client.get_build("bld-deadbeef").await.unwrap_err() {
        kiln_client::Error::Api { status, .. } => assert_eq!(status, 404),
        other => panic!("expected API error, got {other:?}"),
    }
}
