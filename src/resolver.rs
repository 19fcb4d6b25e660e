//! Expansion of root packages into the chunks an install has to provide.

use std::{
    collections::{HashSet, VecDeque},
    sync::Arc,
};

use crate::{ChunkId, ChunkKind, ContentHash, PackageId};

/// Read backend of the containers already mounted locally.
pub trait ChunkBackend: Send + Sync {
    fn does_chunk_exist(&self, id: &ChunkId) -> bool;
    fn get_size(&self, id: &ChunkId) -> Option<u64>;
}

/// Dependency edges of a package.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PackageEntry {
    pub imports: Vec<PackageId>,
    /// Only followed when an install asks for soft references.
    pub soft_references: Vec<PackageId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    /// Name of whatever declared the redirect, for logging.
    pub source: String,
    pub target: PackageId,
}

/// Package graph provider.
pub trait PackageStore: Send + Sync {
    /// `None` when the package is unknown.
    fn get_entry(&self, package: PackageId) -> Option<PackageEntry>;
    fn resolve_redirect(&self, package: PackageId) -> Option<Redirect>;
}

/// Manifest record of an on-demand chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChunkDescriptor {
    pub id: ChunkId,
    /// Hash of the full chunk, also its address in the remote store.
    pub hash: ContentHash,
    pub size: u64,
}

/// Manifest of an on-demand container.
pub trait ChunkContainer: Send + Sync {
    fn name(&self) -> &str;
    fn find_chunk(&self, id: &ChunkId) -> Option<ChunkDescriptor>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedChunk {
    pub descriptor: ChunkDescriptor,
    /// Name of the container that listed the chunk.
    pub container: Arc<str>,
}

#[derive(Debug, Default, Clone)]
pub struct Resolution {
    /// Every package reached, redirects applied, in visiting order.
    pub packages: Vec<PackageId>,
    /// On-demand chunks in discovery order, without duplicates.
    pub chunks: Vec<ResolvedChunk>,
    /// Chunks served by mounted containers, with their size when known.
    pub mounted_chunks: Vec<(ChunkId, Option<u64>)>,
    pub missing_packages: Vec<PackageId>,
    /// Main package chunks found nowhere.
    pub missing_chunks: Vec<ChunkId>,
}

impl Resolution {
    pub fn is_complete(&self) -> bool {
        self.missing_packages.is_empty() && self.missing_chunks.is_empty()
    }
}

pub struct DependencyResolver {
    packages: Arc<dyn PackageStore>,
    backend: Arc<dyn ChunkBackend>,
    containers: Vec<Arc<dyn ChunkContainer>>,
}

impl std::fmt::Debug for DependencyResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let containers: Vec<_> = self.containers.iter().map(|c| c.name()).collect();
        f.debug_struct("DependencyResolver")
            .field("containers", &containers)
            .finish_non_exhaustive()
    }
}

impl DependencyResolver {
    pub fn new(
        packages: Arc<dyn PackageStore>,
        backend: Arc<dyn ChunkBackend>,
        containers: Vec<Arc<dyn ChunkContainer>>,
    ) -> Self {
        Self {
            packages,
            backend,
            containers,
        }
    }

    /// Breadth-first walk over the imports of `roots` (and soft references when asked).
    #[tracing::instrument(skip(self, roots), fields(roots = roots.len()))]
    pub fn resolve(&self, roots: &[PackageId], include_soft_references: bool) -> Resolution {
        let mut resolution = Resolution::default();
        let mut visited = HashSet::new();
        let mut seen_chunks = HashSet::new();
        let mut queue: VecDeque<PackageId> = roots.iter().copied().collect();

        while let Some(package) = queue.pop_front() {
            let package = self.follow_redirects(package);
            if !visited.insert(package) {
                continue;
            }

            let Some(entry) = self.packages.get_entry(package) else {
                tracing::debug!(%package, "package not found");
                resolution.missing_packages.push(package);
                continue;
            };

            resolution.packages.push(package);
            self.add_package_chunks(package, &mut resolution, &mut seen_chunks);

            queue.extend(entry.imports);
            if include_soft_references {
                queue.extend(entry.soft_references);
            }
        }

        tracing::debug!(
            packages = resolution.packages.len(),
            chunks = resolution.chunks.len(),
            mounted = resolution.mounted_chunks.len(),
            missing_packages = resolution.missing_packages.len(),
            missing_chunks = resolution.missing_chunks.len(),
            "resolved install"
        );

        resolution
    }

    fn follow_redirects(&self, mut package: PackageId) -> PackageId {
        let mut chain = HashSet::from([package]);

        while let Some(redirect) = self.packages.resolve_redirect(package) {
            if !chain.insert(redirect.target) {
                tracing::warn!(%package, source = %redirect.source, "redirect cycle");
                break;
            }

            tracing::debug!(from = %package, to = %redirect.target, source = %redirect.source, "following redirect");
            package = redirect.target;
        }

        package
    }

    fn add_package_chunks(
        &self,
        package: PackageId,
        resolution: &mut Resolution,
        seen: &mut HashSet<ChunkId>,
    ) {
        let main = ChunkId::package(package);
        if seen.insert(main) && !self.add_chunk(main, resolution) {
            resolution.missing_chunks.push(main);
        }

        // Bulk data is optional, absent kinds are skipped.
        for kind in ChunkKind::BULK_DATA_KINDS {
            let id = main.with_kind(kind);
            if seen.insert(id) {
                self.add_chunk(id, resolution);
            }
        }
    }

    /// Records where `id` comes from. Returns `false` if no source has it.
    fn add_chunk(&self, id: ChunkId, resolution: &mut Resolution) -> bool {
        if self.backend.does_chunk_exist(&id) {
            resolution
                .mounted_chunks
                .push((id, self.backend.get_size(&id)));
            return true;
        }

        let found = self.containers.iter().find_map(|container| {
            container.find_chunk(&id).map(|descriptor| ResolvedChunk {
                descriptor,
                container: Arc::from(container.name()),
            })
        });

        match found {
            Some(chunk) => {
                resolution.chunks.push(chunk);
                true
            }
            None => false,
        }
    }
}
