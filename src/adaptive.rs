//! Live-tunable values shared between the ledger and its callers.
//!
//! Reads are lock-free through `ArcSwap` by default; the `adaptive-rwlock` feature swaps in a
//! `RwLock` backend for targets where arc-swap is unwanted.

use std::sync::Arc;

#[cfg(feature = "adaptive-rwlock")]
use std::sync::RwLock;

#[cfg(not(feature = "adaptive-rwlock"))]
use arc_swap::ArcSwap;

/// Shared handle to a value that can be replaced while readers keep going.
#[derive(Debug)]
pub struct DynamicConfig<T> {
    #[cfg(not(feature = "adaptive-rwlock"))]
    inner: Arc<ArcSwap<T>>,
    #[cfg(feature = "adaptive-rwlock")]
    inner: Arc<RwLock<T>>,
}

impl<T> Clone for DynamicConfig<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> DynamicConfig<T> {
    pub fn new(value: T) -> Self {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            Self { inner: Arc::new(ArcSwap::from_pointee(value)) }
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            Self { inner: Arc::new(RwLock::new(value)) }
        }
    }

    /// Snapshot the current value.
    #[cfg(not(feature = "adaptive-rwlock"))]
    pub fn get(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Snapshot the current value.
    #[cfg(feature = "adaptive-rwlock")]
    pub fn get(&self) -> Arc<T>
    where
        T: Clone,
    {
        let guard = self.inner.read().unwrap_or_else(std::sync::PoisonError::into_inner);
        Arc::new(guard.clone())
    }

    /// Replace the value; readers holding an older snapshot keep it until they drop it.
    pub fn set(&self, value: T) {
        #[cfg(not(feature = "adaptive-rwlock"))]
        {
            self.inner.store(Arc::new(value));
        }
        #[cfg(feature = "adaptive-rwlock")]
        {
            *self.inner.write().unwrap_or_else(std::sync::PoisonError::into_inner) = value;
        }
    }
}
