//! Tests of the repository collector against a mocked remote repository.

use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use flate2::Compression;
use flate2::write::GzEncoder;
use pretty_assertions::assert_eq;
use qpy_server::cache::FileLimitLru;
use qpy_server::collector::repo::RepoCollector;
use qpy_server::hash::hash_bytes;
use qpy_server::indexer::Indexer;
use qpy_server::package::PackageIdentifier;
use qpy_server::package::SourceId;
use qpy_server::package::SourceKind;
use qpy_server::settings::WorkerKind;
use qpy_server::worker::WorkerPool;
use qpy_server::worker::pool::WorkerFactory;
use serde_json::json;
use wiremock::Mock;
use wiremock::MockServer;
use wiremock::ResponseTemplate;
use wiremock::matchers::method;
use wiremock::matchers::path;

const SOURCE: SourceId = SourceId {
    kind: SourceKind::Repository,
    index: 0,
};

fn gzip(bytes: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes).expect("gzip write");
    encoder.finish().expect("gzip finish")
}

fn index_document(versions: &[(&str, &str, &[u8])]) -> serde_json::Value {
    json!({
        "packages": [{
            "manifest": {
                "short_name": "example",
                "namespace": "acme",
                "version": "0.0.0",
                "api_version": "0.2",
                "author": "Repo Author",
            },
            "versions": versions
                .iter()
                .map(|(version, archive_path, archive)| json!({
                    "version": version,
                    "api_version": "0.2",
                    "path": archive_path,
                    "size": archive.len(),
                    "sha256": hash_bytes(archive),
                }))
                .collect::<Vec<_>>(),
        }],
    })
}

async fn mount_repository(
    server: &MockServer,
    timestamp: i64,
    index: &serde_json::Value,
) -> Vec<u8> {
    let index_gz = gzip(&serde_json::to_vec(index).expect("serialize index"));
    let meta = json!({
        "timestamp": timestamp,
        "size": index_gz.len(),
        "sha256": hash_bytes(&index_gz),
    });

    Mock::given(method("GET"))
        .and(path("/META.json"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(serde_json::to_vec(&meta).expect("meta")))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/PACKAGES.json.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(index_gz.clone()))
        .mount(server)
        .await;
    index_gz
}

struct Fixture {
    _base: tempfile::TempDir,
    collector: Arc<RepoCollector>,
    indexer: Arc<Indexer>,
    package_cache: Arc<FileLimitLru>,
}

fn fixture(url: String) -> Fixture {
    let base = tempfile::tempdir().expect("tempdir");
    let package_cache = Arc::new(
        FileLimitLru::new(base.path().join("packages"), 1024 * 1024, "qpy", "Package cache")
            .expect("package cache"),
    );
    let index_cache = Arc::new(
        FileLimitLru::new(base.path().join("index"), 1024 * 1024, "gz", "Repo index cache")
            .expect("index cache"),
    );

    let factory = WorkerFactory {
        kind: WorkerKind::Thread,
        executable: PathBuf::new(),
        limits: qpy_protocol::WorkerResourceLimits {
            max_memory: 1024,
            max_cpu_time_seconds_per_call: 1.0,
        },
    };
    let indexer = Arc::new(Indexer::new(Arc::new(WorkerPool::new(1, 1024, factory))));

    let collector = Arc::new(RepoCollector::new(
        url,
        Duration::from_secs(3600),
        SOURCE,
        indexer.clone(),
        package_cache.clone(),
        index_cache,
    ));
    Fixture {
        _base: base,
        collector,
        indexer,
        package_cache,
    }
}

#[tokio::test]
async fn update_registers_index_contents() {
    let server = MockServer::start().await;
    let archive = b"archive-bytes-1".as_slice();
    let index = index_document(&[("1.0.0", "example-1.0.0.qpy", archive)]);
    mount_repository(&server, 1, &index).await;

    let fixture = fixture(server.uri());
    fixture.collector.update().await.expect("update");

    let hash = hash_bytes(archive);
    let package = fixture.indexer.get_by_hash(&hash).expect("indexed");
    assert_eq!(package.manifest().short_name, "example");
    assert_eq!(package.version().to_string(), "1.0.0");

    let identifier = PackageIdentifier {
        namespace: "acme".to_string(),
        short_name: "example".to_string(),
    };
    assert_eq!(fixture.indexer.get_by_identifier(&identifier).len(), 1);
}

#[tokio::test]
async fn unchanged_timestamp_skips_the_index_download() {
    let server = MockServer::start().await;
    let archive = b"archive-bytes-2".as_slice();
    let index = index_document(&[("1.0.0", "example-1.0.0.qpy", archive)]);
    mount_repository(&server, 7, &index).await;

    let fixture = fixture(server.uri());
    fixture.collector.update().await.expect("first update");
    fixture.collector.update().await.expect("second update");

    let requests = server.received_requests().await.expect("requests");
    let index_fetches = requests
        .iter()
        .filter(|request| request.url.path() == "/PACKAGES.json.gz")
        .count();
    assert_eq!(index_fetches, 1);
}

#[tokio::test]
async fn removed_packages_are_unregistered_on_the_next_update() {
    let server = MockServer::start().await;
    let kept = b"kept-archive".as_slice();
    let removed = b"removed-archive".as_slice();
    let index = index_document(&[
        ("1.0.0", "example-1.0.0.qpy", kept),
        ("0.9.0", "example-0.9.0.qpy", removed),
    ]);
    mount_repository(&server, 1, &index).await;

    let fixture = fixture(server.uri());
    fixture.collector.update().await.expect("first update");
    assert!(fixture.indexer.get_by_hash(&hash_bytes(removed)).is_some());

    server.reset().await;
    let shrunk = index_document(&[("1.0.0", "example-1.0.0.qpy", kept)]);
    mount_repository(&server, 2, &shrunk).await;

    fixture.collector.update().await.expect("second update");
    assert!(fixture.indexer.get_by_hash(&hash_bytes(removed)).is_none());
    assert!(fixture.indexer.get_by_hash(&hash_bytes(kept)).is_some());
}

#[tokio::test]
async fn get_path_downloads_and_caches_the_archive() {
    let server = MockServer::start().await;
    let archive = b"downloadable-archive".as_slice();
    let index = index_document(&[("1.0.0", "example-1.0.0.qpy", archive)]);
    mount_repository(&server, 1, &index).await;
    Mock::given(method("GET"))
        .and(path("/example-1.0.0.qpy"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(archive))
        .mount(&server)
        .await;

    let fixture = fixture(server.uri());
    fixture.collector.update().await.expect("update");

    let hash = hash_bytes(archive);
    let package = fixture.indexer.get_by_hash(&hash).expect("indexed");

    let path = fixture.collector.get_path(&package).await.expect("download");
    assert_eq!(std::fs::read(&path).expect("read"), archive);
    assert!(fixture.package_cache.contains(&hash).await);

    // A second request is served from the cache.
    let cached = fixture.collector.get_path(&package).await.expect("cached");
    assert_eq!(cached, path);
    let requests = server.received_requests().await.expect("requests");
    let downloads = requests
        .iter()
        .filter(|request| request.url.path() == "/example-1.0.0.qpy")
        .count();
    assert_eq!(downloads, 1);
}

#[tokio::test]
async fn corrupt_index_hash_fails_the_update() {
    let server = MockServer::start().await;
    let archive = b"archive".as_slice();
    let index = index_document(&[("1.0.0", "example-1.0.0.qpy", archive)]);
    let index_gz = gzip(&serde_json::to_vec(&index).expect("serialize"));

    let meta = json!({
        "timestamp": 1,
        "size": index_gz.len(),
        "sha256": "0".repeat(64),
    });
    Mock::given(method("GET"))
        .and(path("/META.json"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(serde_json::to_vec(&meta).expect("meta")))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/PACKAGES.json.gz"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(index_gz))
        .mount(&server)
        .await;

    let fixture = fixture(server.uri());
    let error = fixture.collector.update().await.expect_err("must fail");
    assert!(error.to_string().contains("sha256"));
    assert!(fixture.indexer.get_by_hash(&hash_bytes(archive)).is_none());
}
