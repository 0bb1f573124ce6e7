mod common;

use common::{Project, can_bind_localhost, file_reference, gzip};
use httpmock::Method::GET;
use httpmock::MockServer;
use lockmirror_core::{Integrity, MirrorConfig, RegistrySettings};
use lockmirror_engine::{
    AfterRewrite, EngineError, Fetcher, Limiter, Reconciler, RemoveDerivedLockfile,
};
use lockmirror_storage::digest_file;
use serde_json::json;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

const FOO_TAR: &[u8] = b"package/package.json contents of foo 1.0.0";

async fn serve_foo(server: &MockServer) -> httpmock::Mock<'_> {
    let body = gzip(FOO_TAR).await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/foo/-/foo-1.0.0.tgz");
            then.status(200).body(body);
        })
        .await
}

fn foo_lock(url: &str) -> serde_json::Value {
    json!({
        "name": "app",
        "lockfileVersion": 3,
        "packages": {
            "": { "name": "app", "version": "1.0.0" },
            "node_modules/foo": { "version": "1.0.0", "resolved": url }
        }
    })
}

#[tokio::test]
async fn fetches_missing_entry_and_rewrites_record() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let mock = serve_foo(&server).await;
    let project = Project::new();
    project
        .write_lock(&foo_lock(&server.url("/foo/-/foo-1.0.0.tgz")))
        .await;

    let report = project
        .reconciler(RegistrySettings::default())
        .run(&project.lockfile())
        .await
        .unwrap();

    assert_eq!(mock.hits_async().await, 1);
    let entry = project.entry("foo@1.0.0.tar");
    assert_eq!(report.added, vec![entry.clone()]);
    assert!(report.removed.is_empty());
    assert!(report.failed.is_empty());
    assert!(report.manifest_written);

    // Stored decompressed, digested over the same bytes.
    assert_eq!(tokio::fs::read(&entry).await.unwrap(), FOO_TAR);
    let expected = Integrity::compute(FOO_TAR).to_sri();

    let lock = project.read_lock().await;
    let record = &lock["packages"]["node_modules/foo"];
    assert_eq!(record["version"], "1.0.0");
    assert_eq!(record["resolved"], file_reference(&entry));
    assert_eq!(record["integrity"], expected.as_str());
    assert_eq!(lock["packages"][""], json!({ "name": "app", "version": "1.0.0" }));

    let on_disk = digest_file(&entry).await.unwrap().unwrap();
    assert_eq!(on_disk.to_sri(), expected);
}

#[tokio::test]
async fn second_run_is_a_no_op() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let mock = serve_foo(&server).await;
    let project = Project::new();
    project
        .write_lock(&foo_lock(&server.url("/foo/-/foo-1.0.0.tgz")))
        .await;
    let reconciler = project.reconciler(RegistrySettings::default());

    reconciler.run(&project.lockfile()).await.unwrap();
    let first = project.read_lock_text().await;
    let modified = tokio::fs::metadata(project.lockfile())
        .await
        .unwrap()
        .modified()
        .unwrap();

    let report = reconciler.run(&project.lockfile()).await.unwrap();

    assert!(report.is_up_to_date());
    assert!(report.failed.is_empty());
    assert_eq!(mock.hits_async().await, 1);
    assert_eq!(project.read_lock_text().await, first);
    let modified_again = tokio::fs::metadata(project.lockfile())
        .await
        .unwrap()
        .modified()
        .unwrap();
    assert_eq!(modified, modified_again);
    assert_eq!(project.mirror_files().await, vec!["foo@1.0.0.tar"]);
}

#[tokio::test]
async fn removes_unreferenced_entries() {
    let project = Project::new();
    project.seed_entry("bar@2.0.0.tar", b"stale").await;
    project
        .write_lock(&json!({
            "packages": { "": { "name": "app", "version": "1.0.0" } }
        }))
        .await;
    let before = project.read_lock_text().await;

    let report = project
        .reconciler(RegistrySettings::default())
        .run(&project.lockfile())
        .await
        .unwrap();

    assert_eq!(report.removed, vec![project.entry("bar@2.0.0.tar")]);
    assert!(!report.manifest_written);
    assert!(project.mirror_files().await.is_empty());
    assert_eq!(project.read_lock_text().await, before);
}

#[tokio::test]
async fn workspace_root_records_are_left_alone() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let mock = serve_foo(&server).await;
    let project = Project::new();
    let url = server.url("/foo/-/foo-1.0.0.tgz");
    project
        .write_lock(&json!({
            "packages": {
                "": { "name": "app", "version": "1.0.0", "resolved": url },
                "packages/lib": { "version": "1.0.0", "resolved": url }
            }
        }))
        .await;
    let before = project.read_lock_text().await;

    let report = project
        .reconciler(RegistrySettings::default())
        .run(&project.lockfile())
        .await
        .unwrap();

    assert_eq!(mock.hits_async().await, 0);
    assert!(report.is_up_to_date());
    assert_eq!(project.read_lock_text().await, before);
    assert!(project.mirror_files().await.is_empty());
}

#[tokio::test]
async fn scoped_basic_auth_wins_over_host_token() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let body = gzip(FOO_TAR).await;
    let authorized = server
        .mock_async(|when, then| {
            when.method(GET)
                .path("/foo/-/foo-1.0.0.tgz")
                .header("authorization", "Basic BASIC1");
            then.status(200).body(body);
        })
        .await;

    let host = format!("//{}:{}", server.host(), server.port());
    let registries: RegistrySettings = [
        (format!("{host}/:_authToken"), "T1".to_string()),
        (format!("{host}/foo/:_auth"), "BASIC1".to_string()),
    ]
    .into_iter()
    .collect();

    let project = Project::new();
    project
        .write_lock(&foo_lock(&server.url("/foo/-/foo-1.0.0.tgz")))
        .await;

    let report = project
        .reconciler(registries)
        .run(&project.lockfile())
        .await
        .unwrap();

    assert_eq!(authorized.hits_async().await, 1);
    assert!(report.failed.is_empty());
    assert_eq!(report.added.len(), 1);
}

#[tokio::test]
async fn duplicate_specs_are_fetched_once() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let mock = serve_foo(&server).await;
    let project = Project::new();
    let url = server.url("/foo/-/foo-1.0.0.tgz");
    project
        .write_lock(&json!({
            "packages": {
                "node_modules/foo": { "version": "1.0.0", "resolved": url },
                "node_modules/a/node_modules/foo": { "version": "1.0.0", "resolved": url },
                "node_modules/b/node_modules/foo": { "version": "1.0.0", "resolved": url }
            }
        }))
        .await;

    let report = project
        .reconciler(RegistrySettings::default())
        .run(&project.lockfile())
        .await
        .unwrap();

    assert_eq!(mock.hits_async().await, 1);
    assert_eq!(report.added.len(), 1);

    let lock = project.read_lock().await;
    let entry = file_reference(&project.entry("foo@1.0.0.tar"));
    for path in [
        "node_modules/foo",
        "node_modules/a/node_modules/foo",
        "node_modules/b/node_modules/foo",
    ] {
        assert_eq!(lock["packages"][path]["resolved"], entry.as_str());
    }
}

#[tokio::test]
async fn failed_fetch_leaves_record_untouched() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let ok = serve_foo(&server).await;
    let missing = server
        .mock_async(|when, then| {
            when.method(GET).path("/gone/-/gone-1.0.0.tgz");
            then.status(404);
        })
        .await;

    let project = Project::new();
    let gone_url = server.url("/gone/-/gone-1.0.0.tgz");
    project
        .write_lock(&json!({
            "packages": {
                "node_modules/gone": { "version": "1.0.0", "resolved": gone_url },
                "node_modules/foo": {
                    "version": "1.0.0",
                    "resolved": server.url("/foo/-/foo-1.0.0.tgz")
                }
            }
        }))
        .await;

    let report = project
        .reconciler(RegistrySettings::default())
        .run(&project.lockfile())
        .await
        .unwrap();

    assert_eq!(ok.hits_async().await, 1);
    assert_eq!(missing.hits_async().await, 1);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].as_str(), "gone@1.0.0");
    assert_eq!(project.mirror_files().await, vec!["foo@1.0.0.tar"]);

    let lock = project.read_lock().await;
    assert_eq!(
        lock["packages"]["node_modules/gone"],
        json!({ "version": "1.0.0", "resolved": gone_url })
    );
}

#[tokio::test]
async fn empty_body_is_a_failure() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    server
        .mock_async(|when, then| {
            when.method(GET).path("/foo/-/foo-1.0.0.tgz");
            then.status(200);
        })
        .await;

    let project = Project::new();
    project
        .write_lock(&foo_lock(&server.url("/foo/-/foo-1.0.0.tgz")))
        .await;
    let before = project.read_lock_text().await;

    let report = project
        .reconciler(RegistrySettings::default())
        .run(&project.lockfile())
        .await
        .unwrap();

    assert_eq!(report.failed.len(), 1);
    assert!(!report.manifest_written);
    assert!(project.mirror_files().await.is_empty());
    assert_eq!(project.read_lock_text().await, before);
}

#[tokio::test]
async fn existing_entry_is_digested_without_fetching() {
    // Nothing listens on the discard port.
    let project = Project::new();
    project.seed_entry("foo@1.0.0.tar", FOO_TAR).await;
    project
        .write_lock(&foo_lock("http://127.0.0.1:9/foo/-/foo-1.0.0.tgz"))
        .await;

    let report = project
        .reconciler(RegistrySettings::default())
        .run(&project.lockfile())
        .await
        .unwrap();

    assert!(report.added.is_empty());
    assert!(report.failed.is_empty());
    assert!(report.manifest_written);
    assert_eq!(project.mirror_files().await, vec!["foo@1.0.0.tar"]);

    let lock = project.read_lock().await;
    assert_eq!(
        lock["packages"]["node_modules/foo"]["integrity"],
        Integrity::compute(FOO_TAR).to_sri().as_str()
    );
}

#[tokio::test]
async fn corrupt_entry_survives_failed_refetch() {
    let project = Project::new();
    let corrupt = [0x1f, 0x8b, 0x08, 0x00, 0xde, 0xad, 0xbe, 0xef];
    project.seed_entry("foo@1.0.0.tar", &corrupt).await;
    project
        .write_lock(&foo_lock("http://127.0.0.1:9/foo/-/foo-1.0.0.tgz"))
        .await;
    let before = project.read_lock_text().await;

    let report = project
        .reconciler(RegistrySettings::default())
        .run(&project.lockfile())
        .await
        .unwrap();

    assert_eq!(report.failed.len(), 1);
    assert!(report.removed.is_empty());
    assert_eq!(project.mirror_files().await, vec!["foo@1.0.0.tar"]);
    assert_eq!(
        tokio::fs::read(project.entry("foo@1.0.0.tar")).await.unwrap(),
        corrupt
    );
    assert_eq!(project.read_lock_text().await, before);
}

#[tokio::test]
async fn local_file_references_stay_alive() {
    let project = Project::new();
    project.seed_entry("vendored@0.1.0.tar", b"vendored").await;
    let vendored = project.entry("vendored@0.1.0.tar");
    project
        .write_lock(&json!({
            "packages": {
                "node_modules/renamed": {
                    "version": "9.9.9",
                    "resolved": file_reference(&vendored)
                }
            }
        }))
        .await;

    let report = project
        .reconciler(RegistrySettings::default())
        .run(&project.lockfile())
        .await
        .unwrap();

    assert!(report.is_up_to_date());
    assert!(vendored.exists());
}

#[tokio::test]
async fn missing_lockfile_aborts_before_touching_mirror() {
    let project = Project::new();

    let result = project
        .reconciler(RegistrySettings::default())
        .run(&project.lockfile())
        .await;

    assert!(matches!(result, Err(EngineError::ManifestMissing(_))));
    assert!(!project.mirror().exists());
}

#[tokio::test]
async fn malformed_lockfile_is_fatal() {
    let project = Project::new();
    tokio::fs::write(project.lockfile(), "{ not json")
        .await
        .unwrap();

    let result = project
        .reconciler(RegistrySettings::default())
        .run(&project.lockfile())
        .await;

    assert!(matches!(result, Err(EngineError::ManifestParse { .. })));
}

#[tokio::test]
async fn legacy_dependency_tree_is_rewritten() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    serve_foo(&server).await;
    let project = Project::new();
    let url = server.url("/foo/-/foo-1.0.0.tgz");
    project
        .write_lock(&json!({
            "packages": {
                "node_modules/foo": { "version": "1.0.0", "resolved": url }
            },
            "dependencies": {
                "a": {
                    "version": "2.0.0",
                    "dependencies": {
                        "foo": { "version": "1.0.0", "resolved": url }
                    }
                },
                "foo": { "version": "0.9.0", "resolved": "https://reg.example/foo-0.9.0.tgz" }
            }
        }))
        .await;

    project
        .reconciler(RegistrySettings::default())
        .run(&project.lockfile())
        .await
        .unwrap();

    let lock = project.read_lock().await;
    let entry = file_reference(&project.entry("foo@1.0.0.tar"));
    let nested = &lock["dependencies"]["a"]["dependencies"]["foo"];
    assert_eq!(nested["resolved"], entry.as_str());
    assert_eq!(
        nested["integrity"],
        Integrity::compute(FOO_TAR).to_sri().as_str()
    );
    assert_eq!(
        lock["dependencies"]["foo"]["resolved"],
        "https://reg.example/foo-0.9.0.tgz"
    );
    assert!(lock["dependencies"]["a"].get("resolved").is_none());
}

/// Answer every request with `body` after `delay`, recording the most
/// requests that were being answered at the same time.
async fn counting_server(body: Vec<u8>, delay: Duration) -> (SocketAddr, Arc<AtomicUsize>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let recorded = peak.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            let (active, peak, body) = (active.clone(), peak.clone(), body.clone());
            tokio::spawn(async move {
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                    match socket.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => request.extend_from_slice(&buf[..n]),
                    }
                }

                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                active.fetch_sub(1, Ordering::SeqCst);

                let head = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
                    body.len()
                );
                let _ = socket.write_all(head.as_bytes()).await;
                let _ = socket.write_all(&body).await;
                let _ = socket.shutdown().await;
            });
        }
    });

    (addr, recorded)
}

#[tokio::test]
async fn concurrent_fetches_stay_within_the_limit() {
    if !can_bind_localhost() {
        eprintln!("Skipping server tests: cannot bind to localhost");
        return;
    }

    let (addr, peak) = counting_server(gzip(b"tarball").await, Duration::from_millis(50)).await;
    let mut packages = serde_json::Map::new();
    for i in 0..8 {
        packages.insert(
            format!("node_modules/pkg{i}"),
            json!({
                "version": "1.0.0",
                "resolved": format!("http://{addr}/pkg{i}/-/pkg{i}-1.0.0.tgz")
            }),
        );
    }

    let project = Project::new();
    project.write_lock(&json!({ "packages": packages })).await;

    let report = project
        .reconciler(RegistrySettings::default())
        .with_limiter(Limiter::with_bound(2))
        .run(&project.lockfile())
        .await
        .unwrap();

    assert_eq!(report.added.len(), 8);
    assert!(report.failed.is_empty());
    assert_eq!(peak.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn relative_mirror_path_follows_the_lock_file() {
    // Nothing listens on the discard port.
    let project = Project::new();
    let app = project.dir.path().join("app");
    let mirror = app.join("vendor");
    tokio::fs::create_dir_all(&mirror).await.unwrap();
    tokio::fs::write(mirror.join("foo@1.0.0.tar"), FOO_TAR).await.unwrap();
    tokio::fs::write(mirror.join("bar@2.0.0.tar"), b"stale").await.unwrap();
    tokio::fs::write(mirror.join("keep.tar"), b"local").await.unwrap();

    let lockfile = app.join("package-lock.json");
    let lock = json!({
        "packages": {
            "": { "name": "app", "version": "1.0.0" },
            "node_modules/foo": {
                "version": "1.0.0",
                "resolved": "http://127.0.0.1:9/foo/-/foo-1.0.0.tgz"
            },
            "node_modules/keep": {
                "version": "0.1.0",
                "resolved": "file:vendor/keep.tar"
            }
        }
    });
    tokio::fs::write(&lockfile, serde_json::to_string_pretty(&lock).unwrap())
        .await
        .unwrap();

    let config = MirrorConfig::default().with_mirror_path("vendor");
    let report = Reconciler::new(config, Fetcher::new().unwrap())
        .run(&lockfile)
        .await
        .unwrap();

    assert!(report.failed.is_empty());
    assert_eq!(report.removed, vec![mirror.join("bar@2.0.0.tar")]);
    assert!(mirror.join("keep.tar").exists());
    assert!(!project.dir.path().join("vendor").exists());

    let lock: serde_json::Value =
        serde_json::from_str(&tokio::fs::read_to_string(&lockfile).await.unwrap()).unwrap();
    assert_eq!(
        lock["packages"]["node_modules/foo"]["resolved"],
        "file:vendor/foo@1.0.0.tar"
    );
}

#[tokio::test]
async fn many_slow_records_all_complete() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }

    let server = MockServer::start_async().await;
    let mut packages = serde_json::Map::new();
    let mut mocks = Vec::new();
    for i in 0..12 {
        let path = format!("/pkg{i}/-/pkg{i}-1.0.0.tgz");
        let body = gzip(format!("pkg{i}").as_bytes()).await;
        mocks.push(
            server
                .mock_async(|when, then| {
                    when.method(GET).path(path.clone());
                    then.status(200)
                        .delay(Duration::from_millis(20))
                        .body(body);
                })
                .await,
        );
        packages.insert(
            format!("node_modules/pkg{i}"),
            json!({ "version": "1.0.0", "resolved": server.url(&path) }),
        );
    }

    let project = Project::new();
    project
        .write_lock(&json!({ "packages": packages }))
        .await;

    let report = project
        .reconciler(RegistrySettings::default())
        .run(&project.lockfile())
        .await
        .unwrap();

    assert_eq!(report.added.len(), 12);
    assert!(report.failed.is_empty());
    for mock in &mocks {
        assert_eq!(mock.hits_async().await, 1);
    }
    assert_eq!(project.mirror_files().await.len(), 12);
}

#[derive(Clone, Default)]
struct RecordingHook {
    calls: Arc<Mutex<Vec<PathBuf>>>,
}

#[async_trait::async_trait]
impl AfterRewrite for RecordingHook {
    async fn after_rewrite(&self, lockfile: &Path) {
        self.calls.lock().unwrap().push(lockfile.to_path_buf());
    }
}

#[tokio::test]
async fn hook_runs_only_after_a_rewrite() {
    let project = Project::new();
    project.seed_entry("foo@1.0.0.tar", FOO_TAR).await;
    project
        .write_lock(&foo_lock("http://127.0.0.1:9/foo/-/foo-1.0.0.tgz"))
        .await;

    let hook = RecordingHook::default();
    let reconciler = project
        .reconciler(RegistrySettings::default())
        .with_hook(hook.clone());

    reconciler.run(&project.lockfile()).await.unwrap();
    reconciler.run(&project.lockfile()).await.unwrap();

    assert_eq!(*hook.calls.lock().unwrap(), vec![project.lockfile()]);
}

#[tokio::test]
async fn derived_lockfile_is_removed_after_rewrite() {
    let project = Project::new();
    project.seed_entry("foo@1.0.0.tar", FOO_TAR).await;
    project
        .write_lock(&foo_lock("http://127.0.0.1:9/foo/-/foo-1.0.0.tgz"))
        .await;
    let derived = project.dir.path().join("node_modules/.package-lock.json");
    tokio::fs::create_dir_all(derived.parent().unwrap())
        .await
        .unwrap();
    tokio::fs::write(&derived, "{}").await.unwrap();

    project
        .reconciler(RegistrySettings::default())
        .with_hook(RemoveDerivedLockfile::for_lockfile(&project.lockfile()))
        .run(&project.lockfile())
        .await
        .unwrap();

    assert!(!derived.exists());
}
