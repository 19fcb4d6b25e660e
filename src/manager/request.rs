use std::sync::{
    atomic::{AtomicU8, Ordering},
    Arc,
};

use tokio::runtime::Handle;

use crate::{
    content_handle::ContentHandle,
    download::Priority,
    error::{CacheError, CacheResult, InstallError, InstallResult},
    metrics::{MetricsSink, RequestKind, RequestOutcome},
    strategy::{DefragOptions, DefragReport, PurgeOptions, PurgeReport, VerifyReport},
    PackageId,
};

pub type RequestId = u64;

/// Invoked once when an install completes, whatever the outcome.
pub type InstallCallback = Box<dyn FnOnce(InstallCompletion) + Send>;
/// Invoked on the worker whenever install progress changes.
pub type ProgressCallback = Box<dyn FnMut(&InstallProgress) + Send>;
/// Invoked once when a maintenance request completes.
pub type MaintenanceCallback<T> = Box<dyn FnOnce(CacheResult<T>) + Send>;

#[derive(Debug, Clone, Default)]
pub struct InstallOptions {
    pub priority: Priority,
    pub include_soft_references: bool,
    /// Runtime the completion callback is dispatched to. Runs inline on the worker when unset.
    pub callback_runtime: Option<Handle>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct InstallProgress {
    /// Size of every chunk the install resolved to.
    pub total_content_size: u64,
    /// Size of the chunks that had to be downloaded.
    pub total_install_size: u64,
    pub downloaded_size: u64,
    pub cached_chunk_count: usize,
    pub downloaded_chunk_count: usize,
}

#[derive(Debug)]
pub struct InstallCompletion {
    pub result: InstallResult<()>,
    pub progress: InstallProgress,
}

/// Caller side of a queued request.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    manager: u64,
    id: RequestId,
    kind: RequestKind,
    status: Arc<RequestStatus>,
}

impl RequestHandle {
    pub(crate) fn new(
        manager: u64,
        id: RequestId,
        kind: RequestKind,
        status: Arc<RequestStatus>,
    ) -> Self {
        Self {
            manager,
            id,
            kind,
            status,
        }
    }

    pub(crate) fn manager(&self) -> u64 {
        self.manager
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn kind(&self) -> RequestKind {
        self.kind
    }

    pub fn is_cancelled(&self) -> bool {
        self.status.is_cancelled()
    }

    pub(crate) fn status(&self) -> &RequestStatus {
        &self.status
    }
}

/// Terminal state of a request, set once.
#[derive(Debug, Default)]
pub(crate) struct RequestStatus(AtomicU8);

impl RequestStatus {
    const UNSET: u8 = 0;
    const CANCELLED: u8 = 1;
    const FAILED: u8 = 2;
    const COMPLETED: u8 = 3;

    pub fn cancel(&self) -> bool {
        self.transition(Self::CANCELLED)
    }

    pub fn fail(&self) -> bool {
        self.transition(Self::FAILED)
    }

    pub fn complete(&self) -> bool {
        self.transition(Self::COMPLETED)
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire) == Self::CANCELLED
    }

    pub fn is_failed(&self) -> bool {
        self.0.load(Ordering::Acquire) == Self::FAILED
    }

    fn transition(&self, to: u8) -> bool {
        self.0
            .compare_exchange(Self::UNSET, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

pub(crate) struct Request {
    pub id: RequestId,
    pub priority: Priority,
    pub status: Arc<RequestStatus>,
    pub work: Work,
}

pub(crate) enum Work {
    Install(InstallRequest),
    Purge {
        options: PurgeOptions,
        on_completed: MaintenanceCallback<PurgeReport>,
    },
    Defrag {
        options: DefragOptions,
        on_completed: MaintenanceCallback<DefragReport>,
    },
    Verify {
        on_completed: MaintenanceCallback<VerifyReport>,
    },
}

pub(crate) struct InstallRequest {
    pub roots: Vec<PackageId>,
    pub handle: ContentHandle,
    pub options: InstallOptions,
    pub on_completed: InstallCallback,
    pub on_progress: Option<ProgressCallback>,
    pub progress: InstallProgress,
}

impl InstallRequest {
    pub fn report_progress(&mut self) {
        if let Some(on_progress) = self.on_progress.as_mut() {
            on_progress(&self.progress);
        }
    }

    /// Hands the outcome to the caller.
    pub fn complete(self, id: RequestId, result: InstallResult<()>, metrics: &dyn MetricsSink) {
        let outcome = match &result {
            Ok(()) => RequestOutcome::Ok,
            Err(InstallError::Cancelled) => RequestOutcome::Cancelled,
            Err(_) => RequestOutcome::Error,
        };

        match &result {
            Ok(()) => tracing::info!(
                request = id,
                downloaded = self.progress.downloaded_chunk_count,
                cached = self.progress.cached_chunk_count,
                "install completed"
            ),
            Err(InstallError::Cancelled) => tracing::info!(request = id, "install cancelled"),
            Err(e) => tracing::error!(request = id, "install failed: {e}"),
        }

        metrics.on_request_completed(RequestKind::Install, outcome);

        let completion = InstallCompletion {
            result,
            progress: self.progress,
        };
        let on_completed = self.on_completed;

        match self.options.callback_runtime {
            Some(runtime) => {
                runtime.spawn_blocking(move || on_completed(completion));
            }
            None => on_completed(completion),
        }
    }
}

impl Work {
    pub fn kind(&self) -> RequestKind {
        match self {
            Work::Install(_) => RequestKind::Install,
            Work::Purge { .. } => RequestKind::Purge,
            Work::Defrag { .. } => RequestKind::Defrag,
            Work::Verify { .. } => RequestKind::Verify,
        }
    }
}

impl Request {
    /// Completes the request without running it.
    pub fn complete_cancelled(self, metrics: &dyn MetricsSink) {
        let Self { id, work, .. } = self;

        match work {
            Work::Install(install) => install.complete(id, Err(InstallError::Cancelled), metrics),
            Work::Purge { on_completed, .. } => {
                let result = Err(CacheError::Cancelled);
                complete_maintenance(id, RequestKind::Purge, result, on_completed, metrics);
            }
            Work::Defrag { on_completed, .. } => {
                let result = Err(CacheError::Cancelled);
                complete_maintenance(id, RequestKind::Defrag, result, on_completed, metrics);
            }
            Work::Verify { on_completed } => {
                let result = Err(CacheError::Cancelled);
                complete_maintenance(id, RequestKind::Verify, result, on_completed, metrics);
            }
        }
    }
}

pub(crate) fn complete_maintenance<T>(
    id: RequestId,
    kind: RequestKind,
    result: CacheResult<T>,
    on_completed: MaintenanceCallback<T>,
    metrics: &dyn MetricsSink,
) where
    T: std::fmt::Debug,
{
    let outcome = match &result {
        Ok(report) => {
            tracing::info!(request = id, ?kind, ?report, "maintenance completed");
            RequestOutcome::Ok
        }
        Err(CacheError::Cancelled) => {
            tracing::info!(request = id, ?kind, "maintenance cancelled");
            RequestOutcome::Cancelled
        }
        Err(e) => {
            tracing::error!(request = id, ?kind, "maintenance failed: {e}");
            RequestOutcome::Error
        }
    };

    metrics.on_request_completed(kind, outcome);
    on_completed(result);
}
