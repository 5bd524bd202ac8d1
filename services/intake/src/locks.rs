use crate::product::ProductId;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// Per-product mutual exclusion.
///
/// One async mutex per product id, created on first use and dropped again when
/// the last holder or waiter lets go, so the map only ever holds ids that are
/// being worked on.
#[derive(Clone, Default)]
pub struct ProductLocks {
    locks: Arc<DashMap<ProductId, Arc<Mutex<()>>>>,
}

/// Exclusive access to one product; released on drop
pub struct ProductGuard {
    id: ProductId,
    guard: Option<OwnedMutexGuard<()>>,
    locks: Arc<DashMap<ProductId, Arc<Mutex<()>>>>,
}

impl ProductLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn mutex(&self, id: ProductId) -> Arc<Mutex<()>> {
        self.locks
            .entry(id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Wait until `id` is free
    pub async fn lock(&self, id: ProductId) -> ProductGuard {
        let guard = self.mutex(id).lock_owned().await;
        ProductGuard {
            id,
            guard: Some(guard),
            locks: self.locks.clone(),
        }
    }

    /// Take `id` only if nobody else holds it
    pub fn try_lock(&self, id: ProductId) -> Option<ProductGuard> {
        let guard = self.mutex(id).try_lock_owned().ok()?;
        Some(ProductGuard {
            id,
            guard: Some(guard),
            locks: self.locks.clone(),
        })
    }

    /// Number of ids currently tracked
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

impl Drop for ProductGuard {
    fn drop(&mut self) {
        // the guard holds a reference to the mutex; let it go before checking
        self.guard.take();
        self.locks
            .remove_if(&self.id, |_, mutex| Arc::strong_count(mutex) == 1);
    }
}
