use std::{
    collections::HashSet,
    sync::{Arc, Mutex, Weak},
};

use crate::ChunkId;

/// Caller-owned token keeping installed chunks referenced.
///
/// Every chunk resolved for an install made with a handle stays referenced while any clone of
/// the handle is alive, and purges skip referenced chunks. Dropping the last clone releases the
/// references.
#[derive(Debug, Clone)]
pub struct ContentHandle {
    inner: Arc<HandleInner>,
}

#[derive(Debug)]
pub(crate) struct HandleInner {
    /// Manager that issued the handle.
    owner: u64,
    id: u64,
    references: Mutex<HashSet<ChunkId>>,
}

impl ContentHandle {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Number of chunks this handle references.
    pub fn reference_count(&self) -> usize {
        self.inner.references.lock().unwrap().len()
    }

    pub fn references(&self, id: &ChunkId) -> bool {
        self.inner.references.lock().unwrap().contains(id)
    }

    pub(crate) fn is_owned_by(&self, owner: u64) -> bool {
        self.inner.owner == owner
    }

    pub(crate) fn add_references<I>(&self, ids: I)
    where
        I: IntoIterator<Item = ChunkId>,
    {
        self.inner.references.lock().unwrap().extend(ids);
    }
}

/// Weak view of every handle a manager issued.
#[derive(Debug)]
pub(crate) struct HandleRegistry {
    owner: u64,
    next_id: u64,
    handles: Vec<Weak<HandleInner>>,
}

impl HandleRegistry {
    pub fn new(owner: u64) -> Self {
        Self {
            owner,
            next_id: 0,
            handles: Vec::new(),
        }
    }

    pub fn create(&mut self) -> ContentHandle {
        self.evict_dropped();

        let inner = Arc::new(HandleInner {
            owner: self.owner,
            id: self.next_id,
            references: Mutex::new(HashSet::new()),
        });
        self.next_id += 1;
        self.handles.push(Arc::downgrade(&inner));

        ContentHandle { inner }
    }

    /// Union of the references of every live handle.
    pub fn referenced(&mut self) -> HashSet<ChunkId> {
        self.evict_dropped();

        self.handles
            .iter()
            .filter_map(Weak::upgrade)
            .flat_map(|inner| {
                let references = inner.references.lock().unwrap();
                references.iter().copied().collect::<Vec<_>>()
            })
            .collect()
    }

    #[cfg(test)]
    pub fn live_count(&mut self) -> usize {
        self.evict_dropped();
        self.handles.len()
    }

    fn evict_dropped(&mut self) {
        self.handles.retain(|handle| handle.strong_count() > 0);
    }
}
