use models::{BuildSpec, PackageJob, PackageStatus};
use std::collections::HashSet;
use std::sync::Arc;
use store::{BuildStore, MemoryStore};

fn job(name: &str, deps: &[&str]) -> PackageJob {
    PackageJob::new(
        name,
        &format!("package:\n  name: {name}\n"),
        deps.iter().map(|d| d.to_string()).collect(),
    )
}

// N concurrent claimers over a build with `ready` independent packages
// must claim exactly the ready set, each package exactly once.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_claimers_never_share_a_package() {
    let store = Arc::new(MemoryStore::new());
    let packages: Vec<PackageJob> = (0..10).map(|i| job(&format!("pkg-{i}"), &[])).collect();
    let build = store
        .create_build(packages, BuildSpec::default())
        .await
        .unwrap();

    let mut claimers = Vec::new();
    for _ in 0..4 {
        let store = store.clone();
        let build_id = build.id.clone();
        claimers.push(tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(package) = store.claim_ready_package(&build_id).await.unwrap() {
                claimed.push(package.name);
                tokio::task::yield_now().await;
            }
            claimed
        }));
    }

    let mut all = Vec::new();
    for claimer in claimers {
        all.extend(claimer.await.unwrap());
    }

    let distinct: HashSet<&String> = all.iter().collect();
    assert_eq!(all.len(), 10, "every ready package claimed exactly once");
    assert_eq!(distinct.len(), 10, "no package claimed twice");

    // Everything is now running; further claims find nothing.
    assert!(store.claim_ready_package(&build.id).await.unwrap().is_none());
    let fetched = store.get_build(&build.id).await.unwrap();
    assert!(fetched
        .packages
        .iter()
        .all(|p| p.status == PackageStatus::Running));
}

// A claimed-but-unfinished dependency must hold back its dependents:
// claims expose packages in dependency order, never optimistically.
#[tokio::test]
async fn claims_wait_for_dependency_success() {
    let store = MemoryStore::new();
    let build = store
        .create_build(
            vec![job("base", &[]), job("lib", &["base"]), job("app", &["lib"])],
            BuildSpec::default(),
        )
        .await
        .unwrap();

    let base = store.claim_ready_package(&build.id).await.unwrap().unwrap();
    assert_eq!(base.name, "base");
    // `base` is running, not successful: nothing else is ready.
    assert!(store.claim_ready_package(&build.id).await.unwrap().is_none());

    let mut done = base;
    done.status = PackageStatus::Success;
    store.update_package(&build.id, &done).await.unwrap();

    let lib = store.claim_ready_package(&build.id).await.unwrap().unwrap();
    assert_eq!(lib.name, "lib");
}
