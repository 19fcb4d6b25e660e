//! Request orchestration.
//!
//! [`InstallManager`] owns a single worker task fed by an unbounded command channel. The worker
//! keeps pending requests ordered by `(priority, id)` and runs one at a time: installs are
//! resolved, checked against the cache and downloaded; maintenance requests run on the blocking
//! pool. Every request completes its callback exactly once.

mod request;

use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
};

use tokio::{
    sync::mpsc::{self, error::SendError, error::TryRecvError},
    task::JoinHandle,
};

use crate::{
    config::CacheConfig,
    content_handle::{ContentHandle, HandleRegistry},
    download::{ChunkOutcome, ChunkTransport, DownloadBatch, DownloadCoordinator, Priority},
    error::{CacheResult, InstallError},
    metrics::{MetricsSink, RequestKind},
    resolver::DependencyResolver,
    strategy::{
        CacheStrategy, CacheUsage, DefragOptions, DefragReport, PurgeOptions, PurgeReport,
        VerifyReport,
    },
    PackageId,
};

use request::{complete_maintenance, InstallRequest, Request, RequestStatus, Work};

pub use request::{
    InstallCallback, InstallCompletion, InstallOptions, InstallProgress, MaintenanceCallback,
    ProgressCallback, RequestHandle, RequestId,
};

static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(0);

enum Command {
    Enqueue(Request),
    Cancel(RequestId),
    UpdatePriority(RequestId, Priority),
    Shutdown,
}

pub struct InstallManager {
    id: u64,
    next_request_id: AtomicU64,
    strategy: Arc<CacheStrategy>,
    handles: Arc<Mutex<HandleRegistry>>,
    commands: mpsc::UnboundedSender<Command>,
    metrics: Arc<dyn MetricsSink>,
    worker: Mutex<Option<JoinHandle<()>>>,
    flush_task: JoinHandle<()>,
}

impl std::fmt::Debug for InstallManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstallManager")
            .field("id", &self.id)
            .field("strategy", &self.strategy)
            .finish_non_exhaustive()
    }
}

impl InstallManager {
    /// Opens the cache described by `config` and starts the worker. Must be called within a
    /// tokio runtime.
    #[tracing::instrument(skip_all, fields(directory = format_args!("{}", config.directory.display())), err(Debug))]
    pub async fn new(
        config: CacheConfig,
        resolver: DependencyResolver,
        transport: Arc<dyn ChunkTransport>,
        metrics: Arc<dyn MetricsSink>,
    ) -> CacheResult<Self> {
        let strategy = {
            let config = config.clone();
            let metrics = metrics.clone();
            tokio::task::spawn_blocking(move || CacheStrategy::open(&config, metrics)).await??
        };
        let strategy = Arc::new(strategy);
        let flush_task = strategy.spawn_flush_task(config.flush_interval());

        let id = NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed);
        let handles = Arc::new(Mutex::new(HandleRegistry::new(id)));
        let (commands, receiver) = mpsc::unbounded_channel();

        let worker = Worker {
            owner: id,
            commands: receiver,
            pending: BTreeMap::new(),
            active: None,
            resolver: Arc::new(resolver),
            coordinator: DownloadCoordinator::new(
                transport,
                strategy.clone(),
                metrics.clone(),
                config.max_concurrent_downloads,
            ),
            strategy: strategy.clone(),
            handles: handles.clone(),
            metrics: metrics.clone(),
        };
        let worker = tokio::spawn(worker.run());

        tracing::info!(manager = id, "install manager started");

        Ok(Self {
            id,
            next_request_id: AtomicU64::new(0),
            strategy,
            handles,
            commands,
            metrics,
            worker: Mutex::new(Some(worker)),
            flush_task,
        })
    }

    /// The cache installed chunks are read from.
    pub fn cache(&self) -> &Arc<CacheStrategy> {
        &self.strategy
    }

    #[allow(clippy::missing_panics_doc)]
    pub fn create_content_handle(&self) -> ContentHandle {
        self.handles.lock().unwrap().create()
    }

    /// Queues an install of `roots` and their imports. Every resolved chunk becomes referenced
    /// by `handle`.
    pub fn enqueue_install<F>(
        &self,
        roots: Vec<PackageId>,
        handle: &ContentHandle,
        options: InstallOptions,
        on_completed: F,
        on_progress: Option<ProgressCallback>,
    ) -> RequestHandle
    where
        F: FnOnce(InstallCompletion) + Send + 'static,
    {
        let priority = options.priority;
        let install = InstallRequest {
            roots,
            handle: handle.clone(),
            options,
            on_completed: Box::new(on_completed),
            on_progress,
            progress: InstallProgress::default(),
        };

        self.submit(priority, Work::Install(install))
    }

    /// Queues a purge of every chunk no live content handle references.
    pub fn enqueue_purge<F>(&self, options: PurgeOptions, priority: Priority, on_completed: F) -> RequestHandle
    where
        F: FnOnce(CacheResult<PurgeReport>) + Send + 'static,
    {
        let on_completed = Box::new(on_completed);
        self.submit(priority, Work::Purge { options, on_completed })
    }

    pub fn enqueue_defrag<F>(&self, options: DefragOptions, priority: Priority, on_completed: F) -> RequestHandle
    where
        F: FnOnce(CacheResult<DefragReport>) + Send + 'static,
    {
        let on_completed = Box::new(on_completed);
        self.submit(priority, Work::Defrag { options, on_completed })
    }

    pub fn enqueue_verify<F>(&self, priority: Priority, on_completed: F) -> RequestHandle
    where
        F: FnOnce(CacheResult<VerifyReport>) + Send + 'static,
    {
        let on_completed = Box::new(on_completed);
        self.submit(priority, Work::Verify { on_completed })
    }

    /// Cancels a request. Queued requests complete right away, an active install completes once
    /// its in-flight downloads are gone. Maintenance that already started runs to the end.
    pub fn cancel(&self, request: &RequestHandle) {
        if !self.issued(request) {
            return;
        }

        if request.status().cancel() {
            tracing::debug!(request = request.id(), "cancelling request");
            // The worker is gone after shutdown and has completed everything already.
            let _ = self.commands.send(Command::Cancel(request.id()));
        }
    }

    pub fn update_priority(&self, request: &RequestHandle, priority: Priority) {
        if !self.issued(request) {
            return;
        }

        let _ = self
            .commands
            .send(Command::UpdatePriority(request.id(), priority));
    }

    pub fn cache_usage(&self) -> CacheUsage {
        self.strategy.usage()
    }

    /// Completes every outstanding request as cancelled, waits for the worker and flushes the
    /// cache.
    #[allow(clippy::missing_panics_doc)]
    #[tracing::instrument(skip(self), fields(manager = self.id), err(Debug))]
    pub async fn shutdown(&self) -> CacheResult<()> {
        let _ = self.commands.send(Command::Shutdown);

        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            worker.await?;
        }

        self.flush_task.abort();

        let strategy = self.strategy.clone();
        tokio::task::spawn_blocking(move || strategy.flush()).await??;

        tracing::info!("install manager shut down");
        Ok(())
    }

    /// Request ids are only unique per manager.
    fn issued(&self, request: &RequestHandle) -> bool {
        let issued = request.manager() == self.id;
        if !issued {
            tracing::warn!(
                request = request.id(),
                manager = request.manager(),
                "ignoring request handle of another install manager"
            );
        }
        issued
    }

    fn submit(&self, priority: Priority, work: Work) -> RequestHandle {
        let id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let kind = work.kind();
        let status = Arc::new(RequestStatus::default());

        tracing::debug!(request = id, ?kind, priority, "enqueueing request");

        let request = Request {
            id,
            priority,
            status: status.clone(),
            work,
        };

        if let Err(SendError(Command::Enqueue(request))) = self.commands.send(Command::Enqueue(request)) {
            tracing::warn!(request = id, "install manager is shut down");
            request.status.cancel();
            request.complete_cancelled(&*self.metrics);
        }

        RequestHandle::new(self.id, id, kind, status)
    }
}

impl Drop for InstallManager {
    fn drop(&mut self) {
        self.flush_task.abort();
    }
}

/// Install whose downloads are in flight.
struct ActiveInstall {
    id: RequestId,
    status: Arc<RequestStatus>,
    install: InstallRequest,
    batch: DownloadBatch,
    error: Option<InstallError>,
}

struct Worker {
    /// Manager whose content handles are accepted.
    owner: u64,
    commands: mpsc::UnboundedReceiver<Command>,
    pending: BTreeMap<(Priority, RequestId), Request>,
    active: Option<ActiveInstall>,
    resolver: Arc<DependencyResolver>,
    coordinator: DownloadCoordinator,
    strategy: Arc<CacheStrategy>,
    handles: Arc<Mutex<HandleRegistry>>,
    metrics: Arc<dyn MetricsSink>,
}

impl Worker {
    async fn run(mut self) {
        'run: loop {
            // Take in everything already submitted so the next pick sees every priority.
            loop {
                match self.commands.try_recv() {
                    Ok(command) => {
                        if !self.handle_command(command) {
                            break 'run;
                        }
                    }
                    Err(TryRecvError::Empty) => break,
                    Err(TryRecvError::Disconnected) => break 'run,
                }
            }

            if self.active.is_none() {
                if let Some((_, request)) = self.pending.pop_first() {
                    self.start(request).await;
                    continue;
                }
            }

            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        break 'run;
                    };

                    if !self.handle_command(command) {
                        break 'run;
                    }
                }
                outcome = Self::next_outcome(self.active.as_mut()) => match outcome {
                    Some(outcome) => self.on_chunk_completed(outcome),
                    None => self.finish_active(),
                },
            }
        }

        self.stop();
    }

    async fn next_outcome(active: Option<&mut ActiveInstall>) -> Option<ChunkOutcome> {
        match active {
            Some(active) => active.batch.next().await,
            None => std::future::pending().await,
        }
    }

    /// Returns `false` once the worker has to stop.
    fn handle_command(&mut self, command: Command) -> bool {
        match command {
            Command::Enqueue(request) => self.enqueue(request),
            Command::Cancel(id) => self.cancel(id),
            Command::UpdatePriority(id, priority) => self.update_priority(id, priority),
            Command::Shutdown => return false,
        }

        true
    }

    fn enqueue(&mut self, request: Request) {
        match request.work {
            Work::Install(install) if !install.handle.is_owned_by(self.owner) => {
                request.status.fail();
                let error = InstallError::InvalidParameter(format!(
                    "content handle {} was created by another manager",
                    install.handle.id()
                ));
                install.complete(request.id, Err(error), &*self.metrics);
            }
            work => {
                let key = (request.priority, request.id);
                self.pending.insert(key, Request { work, ..request });
            }
        }
    }

    fn cancel(&mut self, id: RequestId) {
        let queued = self
            .pending
            .iter()
            .find(|(_, request)| request.id == id)
            .map(|(key, _)| *key);

        if let Some(request) = queued.and_then(|key| self.pending.remove(&key)) {
            request.complete_cancelled(&*self.metrics);
            return;
        }

        if let Some(active) = self.active.as_mut().filter(|active| active.id == id) {
            tracing::debug!(request = id, remaining = active.batch.len(), "cancelling downloads");
            active.batch.cancel();
        }
    }

    fn update_priority(&mut self, id: RequestId, priority: Priority) {
        let queued = self
            .pending
            .iter()
            .find(|(_, request)| request.id == id)
            .map(|(key, _)| *key);

        if let Some(mut request) = queued.and_then(|key| self.pending.remove(&key)) {
            request.priority = priority;
            self.pending.insert((priority, id), request);
            return;
        }

        if let Some(active) = self.active.as_mut().filter(|active| active.id == id) {
            active.batch.reprioritize(priority);
        }
    }

    async fn start(&mut self, request: Request) {
        if request.status.is_cancelled() {
            request.complete_cancelled(&*self.metrics);
            return;
        }

        let Request {
            id,
            priority,
            status,
            work,
        } = request;

        match work {
            Work::Install(install) => self.start_install(id, priority, status, install).await,
            Work::Purge {
                options,
                on_completed,
            } => {
                let referenced = self.handles.lock().unwrap().referenced();
                let strategy = self.strategy.clone();
                let result = run_blocking(move || strategy.purge(&referenced, &options)).await;
                status.complete();
                complete_maintenance(id, RequestKind::Purge, result, on_completed, &*self.metrics);
            }
            Work::Defrag {
                options,
                on_completed,
            } => {
                let strategy = self.strategy.clone();
                let result = run_blocking(move || strategy.defrag(&options)).await;
                status.complete();
                complete_maintenance(id, RequestKind::Defrag, result, on_completed, &*self.metrics);
            }
            Work::Verify { on_completed } => {
                let strategy = self.strategy.clone();
                let result = run_blocking(move || strategy.verify()).await;
                status.complete();
                complete_maintenance(id, RequestKind::Verify, result, on_completed, &*self.metrics);
            }
        }
    }

    /// Resolves the install, references its chunks and starts downloading the missing ones.
    #[tracing::instrument(skip(self, status, install), fields(roots = install.roots.len()))]
    async fn start_install(
        &mut self,
        id: RequestId,
        priority: Priority,
        status: Arc<RequestStatus>,
        mut install: InstallRequest,
    ) {
        let resolution = {
            let resolver = self.resolver.clone();
            let roots = install.roots.clone();
            let include_soft_references = install.options.include_soft_references;
            tokio::task::spawn_blocking(move || resolver.resolve(&roots, include_soft_references))
                .await
        };

        let resolution = match resolution {
            Ok(resolution) => resolution,
            Err(e) => {
                let error = InstallError::Unknown(format!("dependency resolution failed: {e}"));
                self.finish_install(id, &status, install, Some(error));
                return;
            }
        };

        if status.is_cancelled() {
            self.finish_install(id, &status, install, None);
            return;
        }

        if !resolution.is_complete() {
            let error = InstallError::UnknownChunkId {
                packages: resolution.missing_packages,
                chunks: resolution.missing_chunks,
            };
            self.finish_install(id, &status, install, Some(error));
            return;
        }

        install
            .handle
            .add_references(resolution.chunks.iter().map(|chunk| chunk.descriptor.id));

        let progress = &mut install.progress;
        progress.total_content_size = resolution
            .mounted_chunks
            .iter()
            .filter_map(|(_, size)| *size)
            .sum();

        let mut missing = Vec::new();
        for chunk in resolution.chunks {
            let descriptor = &chunk.descriptor;
            progress.total_content_size += descriptor.size;

            if self
                .strategy
                .is_cached(&descriptor.id, descriptor.hash.tag(), descriptor.size)
            {
                progress.cached_chunk_count += 1;
            } else {
                progress.total_install_size += descriptor.size;
                missing.push(chunk);
            }
        }

        tracing::info!(
            request = id,
            cached = install.progress.cached_chunk_count,
            missing = missing.len(),
            install_size = install.progress.total_install_size,
            "install resolved"
        );
        install.report_progress();

        if missing.is_empty() {
            self.finish_install(id, &status, install, None);
            return;
        }

        let mut batch = self.coordinator.start_batch(missing, priority);
        if status.is_cancelled() {
            batch.cancel();
        }

        self.active = Some(ActiveInstall {
            id,
            status,
            install,
            batch,
            error: None,
        });
    }

    fn on_chunk_completed(&mut self, outcome: ChunkOutcome) {
        let Some(active) = self.active.as_mut() else {
            return;
        };

        match outcome {
            Ok(chunk) => {
                let progress = &mut active.install.progress;
                progress.downloaded_size += chunk.descriptor.size;
                progress.downloaded_chunk_count += 1;
                active.install.report_progress();
            }
            Err(e) if active.status.fail() => {
                tracing::error!(request = active.id, "chunk download failed: {e}");
                active.error = Some(InstallError::ReadError(e));
                active.batch.cancel();
            }
            Err(e) => tracing::debug!(request = active.id, "ignoring chunk failure: {e}"),
        }

        if active.status.is_cancelled() {
            active.batch.cancel();
        }
    }

    /// Completes the active install once its batch is drained.
    fn finish_active(&mut self) {
        if let Some(mut active) = self.active.take() {
            let error = active.error.take();
            self.finish_install(active.id, &active.status, active.install, error);
        }
    }

    fn finish_install(
        &self,
        id: RequestId,
        status: &RequestStatus,
        install: InstallRequest,
        error: Option<InstallError>,
    ) {
        let result = match error {
            Some(error) if status.fail() || status.is_failed() => Err(error),
            _ if status.complete() => Ok(()),
            _ if status.is_cancelled() => Err(InstallError::Cancelled),
            _ => Err(InstallError::Unknown("install failed without an error".to_owned())),
        };

        install.complete(id, result, &*self.metrics);
    }

    /// Completes every outstanding request as cancelled.
    fn stop(&mut self) {
        if let Some(mut active) = self.active.take() {
            active.status.cancel();
            active.batch.cancel();
            let error = active.error.take();
            self.finish_install(active.id, &active.status, active.install, error);
        }

        while let Some((_, request)) = self.pending.pop_first() {
            request.status.cancel();
            request.complete_cancelled(&*self.metrics);
        }

        tracing::info!(manager = self.owner, "install manager worker stopped");
    }
}

async fn run_blocking<T, F>(f: F) -> CacheResult<T>
where
    F: FnOnce() -> CacheResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f).await?
}
