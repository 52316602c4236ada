//! Deferred construction of workers, workbenches, and stations.

use std::sync::Arc;

use crate::error::WorkError;

/// A deferred construction specification: call [`create`](Creator::create) to
/// build a fresh `T`. Creators are cloneable and reusable, so a station can
/// rebuild its payload and a registry can hand the same recipe to several
/// stations.
pub struct Creator<T> {
    build: Arc<dyn Fn() -> Result<T, WorkError> + Send + Sync>,
}

impl<T> Clone for Creator<T> {
    fn clone(&self) -> Self {
        Creator {
            build: Arc::clone(&self.build),
        }
    }
}

impl<T> Creator<T> {
    /// Wraps an infallible factory.
    pub fn new<F>(build: F) -> Self
    where
        F: Fn() -> T + Send + Sync + 'static,
    {
        Creator {
            build: Arc::new(move || Ok(build())),
        }
    }

    /// Wraps a factory that may fail with a construction error.
    pub fn try_new<F>(build: F) -> Self
    where
        F: Fn() -> Result<T, WorkError> + Send + Sync + 'static,
    {
        Creator {
            build: Arc::new(build),
        }
    }

    /// Builds a fresh instance.
    pub fn create(&self) -> Result<T, WorkError> {
        (self.build)()
    }

    /// Adapts the produced value, preserving fallibility.
    pub fn map<U, F>(self, adapt: F) -> Creator<U>
    where
        F: Fn(T) -> U + Send + Sync + 'static,
        T: 'static,
    {
        Creator {
            build: Arc::new(move || self.create().map(&adapt)),
        }
    }
}

impl<T> std::fmt::Debug for Creator<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Creator<{}>", std::any::type_name::<T>())
    }
}
