//! Memoization of diffraction, projection and correction matrices.
//!
//! Matrices are keyed by their full parameter tuple, with floats stored by bit
//! pattern, so identical parameters return the identical `Arc`. Only
//! homogeneous parameters are ever keyed; per-pixel layers bypass the cache.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, OnceLock};

use ndarray::Array5;
use num_complex::Complex64;

use crate::error::Result;

/// Stack of matrix grids, shape `(wavelengths, height, width, 4, 4)`.
pub type MatrixStack = Array5<Complex64>;

#[cfg(test)]
mod tests {
    use super::*;

    fn key(d: f64) -> MatrixKey {
        MatrixKey::new(MatrixKind::Diffraction, (4, 4))
            .float(d)
            .floats(&[1.0, 2.0])
    }

    fn value() -> Result<MatrixStack> {
        Ok(Array5::zeros((1, 4, 4, 4, 4)))
    }

    #[test]
    fn identical_keys_share_instance() {
        let cache = MatrixCache::new();
        let a = cache.get_or_try_insert(key(1.0), value).unwrap();
        let b = cache.get_or_try_insert(key(1.0), || panic!("recomputed")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn different_keys_are_distinct() {
        let cache = MatrixCache::new();
        let a = cache.get_or_try_insert(key(1.0), value).unwrap();
        let b = cache.get_or_try_insert(key(-1.0), value).unwrap();
        assert!(!Arc::ptr_eq(&a, &b));
        // 0.0 and -0.0 differ by bit pattern
        cache.get_or_try_insert(key(0.0), value).unwrap();
        cache.get_or_try_insert(key(-0.0), value).unwrap();
        assert_eq!(cache.len(), 4);
    }

    #[test]
    fn capacity_evicts_oldest() {
        let cache = MatrixCache::with_capacity(2);
        let first = cache.get_or_try_insert(key(1.0), value).unwrap();
        cache.get_or_try_insert(key(2.0), value).unwrap();
        cache.get_or_try_insert(key(3.0), value).unwrap();
        assert_eq!(cache.len(), 2);
        let again = cache.get_or_try_insert(key(1.0), value).unwrap();
        assert!(!Arc::ptr_eq(&first, &again));
    }

    #[test]
    fn clear_resets() {
        let cache = MatrixCache::new();
        cache.get_or_try_insert(key(1.0), value).unwrap();
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn failed_computation_is_not_cached() {
        let cache = MatrixCache::new();
        let err = cache.get_or_try_insert(key(1.0), || Err(crate::error::Error::data("boom")));
        assert!(err.is_err());
        assert!(cache.is_empty());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatrixKind {
    Diffraction,
    JonesDiffraction,
    Projection,
    JonesTransmission,
    Correction,
    JonesCorrection,
    CorrectedDiffraction,
    CorrectedJonesDiffraction,
    Jones2H,
}

/// Cache key: the matrix kind, the grid shape and every scalar parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MatrixKey {
    kind: MatrixKind,
    shape: (usize, usize),
    params: Vec<u64>,
}

impl MatrixKey {
    pub fn new(kind: MatrixKind, shape: (usize, usize)) -> Self {
        MatrixKey {
            kind,
            shape,
            params: Vec::new(),
        }
    }

    pub fn float(mut self, v: f64) -> Self {
        self.params.push(v.to_bits());
        self
    }

    pub fn floats(mut self, vs: &[f64]) -> Self {
        self.params.push(vs.len() as u64);
        self.params.extend(vs.iter().map(|v| v.to_bits()));
        self
    }

    pub fn complex(mut self, vs: &[Complex64]) -> Self {
        self.params.push(vs.len() as u64);
        for v in vs {
            self.params.push(v.re.to_bits());
            self.params.push(v.im.to_bits());
        }
        self
    }

    pub fn tag(mut self, v: u64) -> Self {
        self.params.push(v);
        self
    }
}

#[derive(Default)]
struct Entries {
    map: HashMap<MatrixKey, Arc<MatrixStack>>,
    order: VecDeque<MatrixKey>,
}

/// Thread-safe matrix cache with an optional FIFO capacity.
#[derive(Default)]
pub struct MatrixCache {
    entries: Mutex<Entries>,
    capacity: Option<usize>,
}

impl std::fmt::Debug for MatrixCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MatrixCache")
            .field("len", &self.len())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl MatrixCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        MatrixCache {
            entries: Mutex::default(),
            capacity: Some(capacity.max(1)),
        }
    }

    /// Process-wide default cache.
    pub fn global() -> &'static MatrixCache {
        static GLOBAL: OnceLock<MatrixCache> = OnceLock::new();
        GLOBAL.get_or_init(MatrixCache::new)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Entries> {
        // a poisoned lock only means another thread panicked mid-insert; the
        // map itself is always consistent
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        let mut entries = self.lock();
        entries.map.clear();
        entries.order.clear();
    }

    /// Returns the cached matrix for `key`, computing and installing it on a
    /// miss. Concurrent misses may compute twice; the first installed value
    /// wins and is returned to every caller.
    pub fn get_or_try_insert<F>(&self, key: MatrixKey, compute: F) -> Result<Arc<MatrixStack>>
    where
        F: FnOnce() -> Result<MatrixStack>,
    {
        if let Some(hit) = self.lock().map.get(&key) {
            return Ok(Arc::clone(hit));
        }
        log::debug!("computing {:?} matrix for grid {:?}", key.kind, key.shape);
        let value = Arc::new(compute()?);

        let mut entries = self.lock();
        if let Some(existing) = entries.map.get(&key) {
            return Ok(Arc::clone(existing));
        }
        entries.map.insert(key.clone(), Arc::clone(&value));
        entries.order.push_back(key);
        if let Some(capacity) = self.capacity {
            while entries.map.len() > capacity {
                match entries.order.pop_front() {
                    Some(oldest) => {
                        entries.map.remove(&oldest);
                    }
                    None => break,
                }
            }
        }
        Ok(value)
    }
}
