use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use bytes::Bytes;
use chunk_install_cache::{
    config::CacheConfig,
    download::HttpTransport,
    error::{CacheResult, DownloadError, InstallError},
    metrics::CacheCounters,
    resolver::{
        ChunkBackend, ChunkContainer, ChunkDescriptor, DependencyResolver, PackageEntry,
        PackageStore, Redirect,
    },
    strategy::{DefragOptions, PurgeOptions, PurgeReport},
    ChunkId, ContentHandle, ContentHash, InstallCompletion, InstallManager, InstallOptions,
    PackageId,
};
use mockito::{Mock, Server, ServerGuard};
use tempdir::TempDir;
use tokio::sync::oneshot;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::util::SubscriberInitExt;

const TEMP_DIR_PREFIX: &str = "chunk_install_cache";
const CACHE_SIZE: u64 = 1 << 20;

/// Package graph and on-demand container served from memory.
#[derive(Default)]
struct Catalog {
    packages: HashMap<PackageId, PackageEntry>,
    payloads: HashMap<ChunkId, Bytes>,
}

impl Catalog {
    fn new(graph: &[(u64, &[u64])]) -> Self {
        let mut catalog = Self::default();

        for (key, imports) in graph {
            let package = PackageId(*key);
            catalog.packages.insert(
                package,
                PackageEntry {
                    imports: imports.iter().copied().map(PackageId).collect(),
                    soft_references: Vec::new(),
                },
            );
            catalog
                .payloads
                .insert(ChunkId::package(package), payload(*key));
        }

        catalog
    }
}

impl PackageStore for Catalog {
    fn get_entry(&self, package: PackageId) -> Option<PackageEntry> {
        self.packages.get(&package).cloned()
    }

    fn resolve_redirect(&self, _package: PackageId) -> Option<Redirect> {
        None
    }
}

impl ChunkContainer for Catalog {
    fn name(&self) -> &str {
        "ondemand"
    }

    fn find_chunk(&self, id: &ChunkId) -> Option<ChunkDescriptor> {
        self.payloads.get(id).map(|bytes| ChunkDescriptor {
            id: *id,
            hash: ContentHash::of(bytes),
            size: bytes.len() as u64,
        })
    }
}

struct NothingMounted;

impl ChunkBackend for NothingMounted {
    fn does_chunk_exist(&self, _id: &ChunkId) -> bool {
        false
    }

    fn get_size(&self, _id: &ChunkId) -> Option<u64> {
        None
    }
}

fn payload(key: u64) -> Bytes {
    Bytes::from(vec![key as u8; 1000 + key as usize * 100])
}

fn hash(key: u64) -> ContentHash {
    ContentHash::of(&payload(key))
}

fn roots(keys: &[u64]) -> Vec<PackageId> {
    keys.iter().copied().map(PackageId).collect()
}

pub struct TestSetup {
    pub server: ServerGuard,
    pub temp_dir: TempDir,
    pub counters: Arc<CacheCounters>,
    pub manager: InstallManager,
}

impl TestSetup {
    #[allow(clippy::missing_panics_doc)]
    pub async fn new(graph: &[(u64, &[u64])]) -> Self {
        Self::init_logger();

        let temp_dir = TempDir::new(TEMP_DIR_PREFIX).unwrap();
        tracing::info!("test directory {}", temp_dir.as_ref().display());

        let server = Server::new_async().await;
        let counters = Arc::new(CacheCounters::default());
        let manager = Self::manager(&server, &temp_dir, graph, counters.clone()).await;

        Self {
            server,
            temp_dir,
            counters,
            manager,
        }
    }

    async fn manager(
        server: &ServerGuard,
        temp_dir: &TempDir,
        graph: &[(u64, &[u64])],
        counters: Arc<CacheCounters>,
    ) -> InstallManager {
        let mut config = CacheConfig::with_directory(temp_dir.path());
        config.cache_size = CACHE_SIZE;
        config.file_capacity = CACHE_SIZE;
        config.max_concurrent_downloads = 2;

        let catalog = Arc::new(Catalog::new(graph));
        let resolver =
            DependencyResolver::new(catalog.clone(), Arc::new(NothingMounted), vec![catalog]);
        let transport = HttpTransport::new(&server.url()).unwrap();

        InstallManager::new(config, resolver, Arc::new(transport), counters)
            .await
            .unwrap()
    }

    /// Serves the chunk of package `key`, expecting `hits` requests for it.
    async fn serve(&mut self, key: u64, hits: usize) -> Mock {
        self.serve_body(key, payload(key), hits).await
    }

    async fn serve_body(&mut self, key: u64, body: Bytes, hits: usize) -> Mock {
        self.server
            .mock("GET", format!("/{}", hash(key).to_hex()).as_str())
            .with_status(200)
            .with_header("content-type", "application/octet-stream")
            .with_body(body)
            .expect(hits)
            .create_async()
            .await
    }

    fn enqueue_install(
        &self,
        keys: &[u64],
        handle: &ContentHandle,
        priority: i32,
    ) -> oneshot::Receiver<InstallCompletion> {
        let (tx, rx) = oneshot::channel();
        let options = InstallOptions {
            priority,
            ..InstallOptions::default()
        };

        self.manager.enqueue_install(
            roots(keys),
            handle,
            options,
            move |completion| {
                let _ = tx.send(completion);
            },
            None,
        );

        rx
    }

    async fn install(&self, keys: &[u64], handle: &ContentHandle) -> InstallCompletion {
        self.enqueue_install(keys, handle, 0).await.unwrap()
    }

    async fn purge(&self, options: PurgeOptions) -> CacheResult<PurgeReport> {
        let (tx, rx) = oneshot::channel();
        self.manager.enqueue_purge(options, 0, move |res| {
            let _ = tx.send(res);
        });
        rx.await.unwrap()
    }

    fn is_cached(&self, key: u64) -> bool {
        let size = payload(key).len() as u64;
        self.manager
            .cache()
            .is_cached(&ChunkId::package(PackageId(key)), hash(key).tag(), size)
    }

    fn init_logger() {
        tracing_subscriber::fmt()
            .with_max_level(LevelFilter::DEBUG)
            .finish()
            .try_init()
            .ok();
    }
}

#[tokio::test]
async fn test_install_downloads_only_missing_chunks() {
    let mut setup = TestSetup::new(&[(1, &[2]), (2, &[])]).await;
    let mock_p = setup.serve(1, 1).await;
    let mock_q = setup.serve(2, 1).await;
    let handle = setup.manager.create_content_handle();

    let completion = setup.install(&[2], &handle).await;
    completion.result.unwrap();
    assert_eq!(completion.progress.downloaded_chunk_count, 1);
    assert!(setup.is_cached(2));

    // Q is cached, so installing P only fetches P.
    let completion = setup.install(&[1], &handle).await;
    completion.result.unwrap();

    let progress = completion.progress;
    assert_eq!(progress.cached_chunk_count, 1);
    assert_eq!(progress.downloaded_chunk_count, 1);
    assert_eq!(progress.downloaded_size, payload(1).len() as u64);
    assert_eq!(progress.total_install_size, payload(1).len() as u64);
    assert!(progress.total_install_size < progress.total_content_size);

    mock_p.assert_async().await;
    mock_q.assert_async().await;

    let cached = setup
        .manager
        .cache()
        .read_chunk(&ChunkId::package(PackageId(1)), 0, payload(1).len() as u64)
        .unwrap();
    assert_eq!(cached.bytes, payload(1));
    assert_eq!(handle.reference_count(), 2);
}

#[tokio::test]
async fn test_installs_complete_in_priority_order() {
    let mut setup = TestSetup::new(&[(1, &[]), (2, &[]), (3, &[])]).await;
    for key in 1..=3 {
        setup.serve(key, 1).await;
    }
    let handle = setup.manager.create_content_handle();

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut receivers = Vec::new();

    for (key, priority) in [(1, 5), (2, 1), (3, 3)] {
        let (tx, rx) = oneshot::channel();
        let order = order.clone();
        let options = InstallOptions {
            priority,
            ..InstallOptions::default()
        };

        setup.manager.enqueue_install(
            roots(&[key]),
            &handle,
            options,
            move |completion| {
                order.lock().unwrap().push(priority);
                let _ = tx.send(completion);
            },
            None,
        );
        receivers.push(rx);
    }

    for rx in receivers {
        rx.await.unwrap().result.unwrap();
    }

    assert_eq!(*order.lock().unwrap(), vec![1, 3, 5]);
}

#[tokio::test]
async fn test_cancelled_queued_install_issues_no_download() {
    let mut setup = TestSetup::new(&[(1, &[]), (2, &[])]).await;
    let mock_first = setup.serve(1, 1).await;
    let mock_cancelled = setup.serve(2, 0).await;
    let handle = setup.manager.create_content_handle();

    let first = setup.enqueue_install(&[1], &handle, 0);

    let (tx, cancelled) = oneshot::channel();
    let request = setup.manager.enqueue_install(
        roots(&[2]),
        &handle,
        InstallOptions::default(),
        move |completion| {
            let _ = tx.send(completion);
        },
        None,
    );
    setup.manager.cancel(&request);
    assert!(request.is_cancelled());

    let completion = cancelled.await.unwrap();
    assert!(matches!(completion.result, Err(InstallError::Cancelled)));
    assert_eq!(completion.progress.downloaded_chunk_count, 0);

    first.await.unwrap().result.unwrap();

    mock_first.assert_async().await;
    mock_cancelled.assert_async().await;
    assert!(!setup.is_cached(2));
    assert_eq!(setup.counters.snapshot().cancelled_requests, 1);
}

#[tokio::test]
async fn test_purge_keeps_referenced_chunks() {
    let mut setup = TestSetup::new(&[(1, &[]), (2, &[])]).await;
    setup.serve(1, 1).await;
    setup.serve(2, 1).await;

    let kept = setup.manager.create_content_handle();
    let released = setup.manager.create_content_handle();

    setup.install(&[1], &kept).await.result.unwrap();
    setup.install(&[2], &released).await.result.unwrap();
    drop(released);

    let report = setup
        .purge(PurgeOptions {
            bytes_to_purge: None,
            defrag: true,
        })
        .await
        .unwrap();

    assert_eq!(report.purged_chunks, 1);
    assert_eq!(report.purged_bytes, payload(2).len() as u64);
    assert!(setup.is_cached(1));
    assert!(!setup.is_cached(2));

    let usage = setup.manager.cache_usage();
    assert_eq!(usage.chunk_count, 1);
    assert_eq!(usage.live_bytes, payload(1).len() as u64);
    assert_eq!(usage.cursor, usage.live_bytes);
}

#[tokio::test]
async fn test_hash_mismatch_fails_install() {
    let mut setup = TestSetup::new(&[(1, &[])]).await;
    setup
        .serve_body(1, Bytes::from_static(b"tampered"), 1)
        .await;
    let handle = setup.manager.create_content_handle();

    let completion = setup.install(&[1], &handle).await;

    assert!(matches!(
        completion.result,
        Err(InstallError::ReadError(DownloadError::HashMismatch { .. }))
    ));
    assert_eq!(completion.progress.downloaded_chunk_count, 0);
    assert!(!setup.is_cached(1));
    assert_eq!(setup.counters.snapshot().failed_requests, 1);
}

#[tokio::test]
async fn test_unknown_package_is_reported() {
    let setup = TestSetup::new(&[(1, &[7])]).await;
    let handle = setup.manager.create_content_handle();

    let completion = setup.install(&[1], &handle).await;

    match completion.result {
        Err(InstallError::UnknownChunkId { packages, chunks }) => {
            assert_eq!(packages, vec![PackageId(7)]);
            assert!(chunks.is_empty());
        }
        other => panic!("unexpected result: {other:?}"),
    }
}

#[tokio::test]
async fn test_foreign_content_handle_is_rejected() {
    let setup = TestSetup::new(&[(1, &[])]).await;

    let other_dir = TempDir::new(TEMP_DIR_PREFIX).unwrap();
    let other = TestSetup::manager(
        &setup.server,
        &other_dir,
        &[(1, &[])],
        Arc::new(CacheCounters::default()),
    )
    .await;
    let foreign = other.create_content_handle();

    let completion = setup.install(&[1], &foreign).await;

    assert!(matches!(
        completion.result,
        Err(InstallError::InvalidParameter(_))
    ));
}

#[tokio::test]
async fn test_request_handles_are_scoped_to_their_manager() {
    let mut setup = TestSetup::new(&[(1, &[])]).await;
    let mock = setup.serve(1, 1).await;

    let other_dir = TempDir::new(TEMP_DIR_PREFIX).unwrap();
    let other = TestSetup::manager(
        &setup.server,
        &other_dir,
        &[(1, &[])],
        Arc::new(CacheCounters::default()),
    )
    .await;
    let (verified_tx, verified_rx) = oneshot::channel();
    let verify = other.enqueue_verify(0, move |res| {
        let _ = verified_tx.send(res);
    });

    let handle = setup.manager.create_content_handle();
    let (tx, rx) = oneshot::channel();
    let install = setup.manager.enqueue_install(
        roots(&[1]),
        &handle,
        InstallOptions::default(),
        move |completion| {
            let _ = tx.send(completion);
        },
        None,
    );

    // Both managers number their requests from zero.
    assert_eq!(install.id(), verify.id());
    other.cancel(&install);
    other.update_priority(&install, -1);
    assert!(!install.is_cancelled());

    rx.await.unwrap().result.unwrap();
    verified_rx.await.unwrap().unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn test_maintenance_requests_report() {
    let mut setup = TestSetup::new(&[(1, &[]), (2, &[])]).await;
    setup.serve(1, 1).await;
    setup.serve(2, 1).await;
    let handle = setup.manager.create_content_handle();
    setup.install(&[1, 2], &handle).await.result.unwrap();

    let (tx, rx) = oneshot::channel();
    setup.manager.enqueue_verify(0, move |res| {
        let _ = tx.send(res);
    });
    let report = rx.await.unwrap().unwrap();
    assert_eq!(report.checked_entries, 2);
    assert_eq!(report.corrupt_entries, 0);

    let (tx, rx) = oneshot::channel();
    setup
        .manager
        .enqueue_defrag(DefragOptions::default(), 0, move |res| {
            let _ = tx.send(res);
        });
    let report = rx.await.unwrap().unwrap();
    assert!(!report.skipped);
    assert_eq!(report.moved_entries, 0);
    assert_eq!(report.dropped_entries, 0);
}

#[tokio::test]
async fn test_shutdown_cancels_queued_requests() {
    let setup = TestSetup::new(&[(1, &[])]).await;
    let handle = setup.manager.create_content_handle();

    let queued = setup.enqueue_install(&[1], &handle, 0);
    setup.manager.shutdown().await.unwrap();

    let completion = queued.await.unwrap();
    assert!(matches!(completion.result, Err(InstallError::Cancelled)));

    // Requests submitted after shutdown complete right away.
    let (tx, rx) = oneshot::channel();
    setup.manager.enqueue_verify(0, move |res| {
        let _ = tx.send(res);
    });
    assert!(rx.await.unwrap().is_err());
}

#[tokio::test]
async fn test_cache_survives_restart() {
    let mut setup = TestSetup::new(&[(1, &[])]).await;
    let mock = setup.serve(1, 1).await;
    let handle = setup.manager.create_content_handle();
    setup.install(&[1], &handle).await.result.unwrap();
    setup.manager.shutdown().await.unwrap();

    let TestSetup {
        server,
        temp_dir,
        manager,
        ..
    } = setup;
    drop(manager);

    let manager = TestSetup::manager(
        &server,
        &temp_dir,
        &[(1, &[])],
        Arc::new(CacheCounters::default()),
    )
    .await;
    let handle = manager.create_content_handle();

    let (tx, rx) = oneshot::channel();
    manager.enqueue_install(
        roots(&[1]),
        &handle,
        InstallOptions::default(),
        move |completion| {
            let _ = tx.send(completion);
        },
        None,
    );
    let completion = rx.await.unwrap();
    completion.result.unwrap();

    assert_eq!(completion.progress.cached_chunk_count, 1);
    assert_eq!(completion.progress.downloaded_chunk_count, 0);
    mock.assert_async().await;
}
