//! Striped per-key async locks

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use tokio::sync::{Mutex, MutexGuard};

/// Default number of lock stripes
pub const DEFAULT_STRIPES: usize = 64;

/// A fixed set of mutexes selected by key hash.
///
/// Two holders of the same key always serialize; different keys only
/// contend when they hash to the same stripe.
pub struct KeyLocks {
    stripes: Vec<Mutex<()>>,
}

impl KeyLocks {
    pub fn new(stripes: usize) -> Self {
        let stripes = stripes.max(1);
        Self {
            stripes: (0..stripes).map(|_| Mutex::new(())).collect(),
        }
    }

    /// Wait for exclusive access to `key`
    pub async fn lock(&self, key: &str) -> MutexGuard<'_, ()> {
        self.stripes[self.stripe(key)].lock().await
    }

    fn stripe(&self, key: &str) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.stripes.len() as u64) as usize
    }
}

impl Default for KeyLocks {
    fn default() -> Self {
        Self::new(DEFAULT_STRIPES)
    }
}
