//! Striped lock table for per-task critical sections.
//!
//! One mutex per task would grow without bound with the task history, so
//! task ids hash onto a fixed set of stripes. Two tasks sharing a stripe
//! serialise against each other, which is harmless; a task never waits on
//! itself because every mutation path takes the stripe exactly once.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

pub const DEFAULT_STRIPES: usize = 1024;

pub struct LockTable {
    stripes: Vec<Arc<Mutex<()>>>,
}

impl LockTable {
    pub fn new(stripes: usize) -> Self {
        let stripes = stripes.max(1);
        Self {
            stripes: (0..stripes).map(|_| Arc::new(Mutex::new(()))).collect(),
        }
    }

    fn stripe(&self, key: &str) -> Arc<Mutex<()>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        let index = (hasher.finish() as usize) % self.stripes.len();
        self.stripes[index].clone()
    }

    /// Acquires the stripe for `key`. The guard is owned so it can be held
    /// across await points (dispatch holds it across the `/task/run` call).
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        self.stripe(key).lock_owned().await
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}
