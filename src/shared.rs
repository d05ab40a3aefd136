//! Shareable index handle with an explicit loading state.
//!
//! A [`SharedMassIndex`] starts in [`MassIndexState::Loading`] and moves
//! exactly once to either `Ready` or `Failed`. `Failed` is terminal: every
//! later access reports [`MassIndexError::NotReady`] with the original reason.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::warn;

use crate::{MassIndex, MassIndexError, MassIndexReader, Result};

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MassIndexState {
    Loading,
    Ready,
    Failed,
}

#[derive(Debug)]
enum Slot<R: MassIndexReader> {
    Loading,
    Ready(Arc<MassIndex<R>>),
    Failed(String),
}

#[derive(Debug)]
struct Shared<R: MassIndexReader> {
    slot: Mutex<Slot<R>>,
    settled: Condvar,
}

/// Reference-counted handle to an index that may still be loading.
///
/// Clones share the same index. Once ready, lookups go through an
/// `Arc<MassIndex<R>>` without further locking.
#[derive(Debug)]
pub struct SharedMassIndex<R: MassIndexReader> {
    shared: Arc<Shared<R>>,
}

impl<R: MassIndexReader> Clone for SharedMassIndex<R> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<R: MassIndexReader> SharedMassIndex<R> {
    fn loading() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot::Loading),
                settled: Condvar::new(),
            }),
        }
    }

    /// Loads synchronously. A failed load yields a handle in the `Failed` state.
    pub fn load(reader: R) -> Self {
        let handle = Self::loading();
        handle.settle(MassIndex::load(reader));
        handle
    }

    fn settle(&self, result: Result<MassIndex<R>>) {
        let mut slot = self.shared.slot.lock();
        *slot = match result {
            Ok(index) => Slot::Ready(Arc::new(index)),
            Err(e) => {
                warn!(error = %e, "failed to load massindex");
                Slot::Failed(e.to_string())
            }
        };
        self.shared.settled.notify_all();
    }

    pub fn state(&self) -> MassIndexState {
        match &*self.shared.slot.lock() {
            Slot::Loading => MassIndexState::Loading,
            Slot::Ready(_) => MassIndexState::Ready,
            Slot::Failed(_) => MassIndexState::Failed,
        }
    }

    /// Returns the loaded index without blocking.
    ///
    /// # Errors
    ///
    /// [`MassIndexError::NotReady`] while loading or after a failed load.
    pub fn index(&self) -> Result<Arc<MassIndex<R>>> {
        Self::ready(&self.shared.slot.lock())
    }

    /// Blocks until loading settles, then behaves like [`index`](Self::index).
    pub fn wait(&self) -> Result<Arc<MassIndex<R>>> {
        let mut slot = self.shared.slot.lock();
        while matches!(*slot, Slot::Loading) {
            self.shared.settled.wait(&mut slot);
        }
        Self::ready(&slot)
    }

    fn ready(slot: &Slot<R>) -> Result<Arc<MassIndex<R>>> {
        match slot {
            Slot::Ready(index) => Ok(index.clone()),
            Slot::Loading => Err(MassIndexError::NotReady("still loading".to_string())),
            Slot::Failed(reason) => Err(MassIndexError::NotReady(format!(
                "loading failed: {}",
                reason
            ))),
        }
    }

    pub fn contains(&self, key: &[u8]) -> Result<bool> {
        Ok(self.index()?.contains(key))
    }

    /// First value of the group of `key`, if the key is present and its group
    /// is not empty.
    pub fn first(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let index = self.index()?;
        match index.get(key) {
            Some(values) => values.first(),
            None => Ok(None),
        }
    }
}

impl<R: MassIndexReader + Send + Sync + 'static> SharedMassIndex<R> {
    /// Starts loading on a dedicated thread and returns immediately.
    pub fn load_in_background(reader: R) -> Self {
        let handle = Self::loading();
        let loader = handle.clone();
        let spawned = std::thread::Builder::new()
            .name("massindex-loader".to_string())
            .spawn(move || loader.settle(MassIndex::load(reader)));
        if let Err(e) = spawned {
            handle.settle(Err(e.into()));
        }
        handle
    }
}
