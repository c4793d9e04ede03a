//! View contexts: independent cursors over the store's filtered, sorted view
//!
//! Each context keeps the filter and sort it was last queried with and a cached
//! copy of the matching items. The registry only keeps the set of open
//! contexts so that store mutations can mark all of them stale.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::debug;

use logscope_types::LogItem;

use crate::error::{EngineError, Result};
use crate::query::{Expr, SortSpec};

/// Opaque handle for an open view context
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(u64);

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "context#{}", self.0)
    }
}

/// Filtered items of a context, ordered by `sorted_by` once sorted
pub(crate) struct View {
    pub items: Vec<Arc<LogItem>>,
    pub sorted_by: Option<SortSpec>,
}

/// Per-context state
pub(crate) struct ContextState {
    /// Filter of the last query (`None` = match all)
    pub filter: Option<Expr>,
    /// Sort of the last query
    pub sort: SortSpec,
    /// Cached view; `None` means the filtered count must be recomputed
    pub view: Option<View>,
}

impl ContextState {
    fn new() -> Self {
        Self {
            filter: None,
            sort: SortSpec::default(),
            view: None,
        }
    }

    pub fn filtered_count(&self) -> Option<usize> {
        self.view.as_ref().map(|v| v.items.len())
    }
}

pub(crate) struct ContextSlot {
    /// Set by store mutations, cleared when a recount starts
    stale: AtomicBool,
    /// Number of filtered-count recomputations
    recounts: AtomicU64,
    pub state: Mutex<ContextState>,
}

impl ContextSlot {
    /// Take the stale mark, returning whether it was set
    pub fn take_stale(&self) -> bool {
        self.stale.swap(false, Ordering::AcqRel)
    }

    pub fn record_recount(&self) {
        self.recounts.fetch_add(1, Ordering::Relaxed);
    }
}

/// Cache state of a context, for diagnostics and tests
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContextInfo {
    /// Cached filtered count, `None` when stale or never computed
    pub filtered_count: Option<usize>,
    /// How many times the filtered count was recomputed
    pub recounts: u64,
}

/// Registry of open contexts
#[derive(Default)]
pub struct ContextRegistry {
    next_id: AtomicU64,
    slots: RwLock<HashMap<ContextId, Arc<ContextSlot>>>,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new independent context
    pub fn open(&self) -> ContextId {
        let id = ContextId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let slot = Arc::new(ContextSlot {
            stale: AtomicBool::new(false),
            recounts: AtomicU64::new(0),
            state: Mutex::new(ContextState::new()),
        });
        self.slots.write().insert(id, slot);
        debug!(%id, "Opened view context");
        id
    }

    /// Close a context and release its cached state
    pub fn close(&self, id: ContextId) -> Result<()> {
        match self.slots.write().remove(&id) {
            Some(_) => {
                debug!(%id, "Closed view context");
                Ok(())
            }
            None => Err(EngineError::InvalidContext(id)),
        }
    }

    pub(crate) fn slot(&self, id: ContextId) -> Result<Arc<ContextSlot>> {
        self.slots
            .read()
            .get(&id)
            .cloned()
            .ok_or(EngineError::InvalidContext(id))
    }

    /// Mark every open context stale
    ///
    /// Only touches one flag per context, never the contexts' cached items.
    pub fn invalidate_all(&self) {
        for slot in self.slots.read().values() {
            slot.stale.store(true, Ordering::Release);
        }
    }

    pub fn info(&self, id: ContextId) -> Result<ContextInfo> {
        let slot = self.slot(id)?;
        let filtered_count = if slot.stale.load(Ordering::Acquire) {
            None
        } else {
            slot.state.lock().filtered_count()
        };
        Ok(ContextInfo {
            filtered_count,
            recounts: slot.recounts.load(Ordering::Relaxed),
        })
    }

    pub fn is_open(&self, id: ContextId) -> bool {
        self.slots.read().contains_key(&id)
    }

    /// Number of open contexts
    pub fn len(&self) -> usize {
        self.slots.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_close() {
        let registry = ContextRegistry::new();
        let a = registry.open();
        let b = registry.open();
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);

        registry.close(a).unwrap();
        assert!(!registry.is_open(a));
        assert!(registry.is_open(b));
        assert!(matches!(registry.close(a), Err(EngineError::InvalidContext(id)) if id == a));
        assert!(matches!(registry.info(a), Err(EngineError::InvalidContext(_))));
    }

    #[test]
    fn test_invalidate_marks_every_context() {
        let registry = ContextRegistry::new();
        let ids: Vec<_> = (0..3).map(|_| registry.open()).collect();
        registry.invalidate_all();
        for id in ids {
            assert!(registry.slot(id).unwrap().take_stale());
            assert!(!registry.slot(id).unwrap().take_stale());
        }
    }
}
