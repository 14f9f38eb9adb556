//! Small caches that sit above the store.
//!
//! Entries are keyed by a bucket string (usually the local day) and replaced
//! when the bucket changes. Writes never invalidate them, so readers may see
//! a value up to one bucket stale.

use std::sync::{Mutex, MutexGuard};

use chrono::Local;

use crate::error::Result;

/// Current local day as `YYYYMMDD`.
pub fn day_bucket() -> String {
    Local::now().format("%Y%m%d").to_string()
}

/// Holds one value for one bucket.
#[derive(Debug)]
pub struct DailyCache<T> {
    slot: Mutex<Option<(String, T)>>,
}

impl<T> Default for DailyCache<T> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
        }
    }
}

impl<T: Clone> DailyCache<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached value for `bucket`, computing it with `load` on a miss.
    ///
    /// A failed load leaves the previous entry in place.
    pub fn get_or_try_insert<F>(&self, bucket: &str, load: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let mut slot = self.lock();
        if let Some((cached_bucket, value)) = slot.as_ref() {
            if cached_bucket == bucket {
                return Ok(value.clone());
            }
        }
        let value = load()?;
        *slot = Some((bucket.to_string(), value.clone()));
        Ok(value)
    }

    pub fn clear(&self) {
        *self.lock() = None;
    }

    fn lock(&self) -> MutexGuard<'_, Option<(String, T)>> {
        // A panic while loading cannot leave a half-written entry behind.
        self.slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::cell::Cell;

    #[test]
    fn bucket_looks_like_a_date() {
        let bucket = day_bucket();
        assert_eq!(bucket.len(), 8);
        assert!(bucket.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn loads_once_per_bucket() {
        let cache = DailyCache::new();
        let loads = Cell::new(0);
        let load = || {
            loads.set(loads.get() + 1);
            Ok(loads.get() * 10)
        };

        assert_eq!(cache.get_or_try_insert("20240101", load).unwrap(), 10);
        assert_eq!(cache.get_or_try_insert("20240101", load).unwrap(), 10);
        assert_eq!(cache.get_or_try_insert("20240102", load).unwrap(), 20);
        assert_eq!(loads.get(), 2);

        cache.clear();
        assert_eq!(cache.get_or_try_insert("20240102", load).unwrap(), 30);
    }

    #[test]
    fn failed_load_keeps_old_entry() {
        let cache = DailyCache::new();
        cache.get_or_try_insert("a", || Ok(1)).unwrap();

        let err = cache
            .get_or_try_insert("b", || Err(EngineError::invalid("boom")))
            .unwrap_err();
        assert!(err.is_user_error());
        assert_eq!(cache.get_or_try_insert("a", || Ok(2)).unwrap(), 1);
    }
}
