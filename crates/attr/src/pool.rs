use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::bag::AttributeBag;

/// Free list of request bags. Released bags keep their allocated map
/// capacity, so steady-state traffic stops allocating.
#[derive(Clone, Default)]
pub struct BagPool {
    inner: Arc<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    free: Mutex<Vec<AttributeBag>>,
}

impl BagPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn acquire(&self) -> PooledBag {
        let bag = self.inner.free.lock().pop().unwrap_or_default();
        PooledBag {
            bag: Some(bag),
            pool: Arc::clone(&self.inner),
        }
    }

    pub fn idle(&self) -> usize {
        self.inner.free.lock().len()
    }
}

/// A bag borrowed from a pool. `done` (or drop) clears it and hands it back;
/// the release happens exactly once.
pub struct PooledBag {
    bag: Option<AttributeBag>,
    pool: Arc<PoolInner>,
}

impl PooledBag {
    pub fn done(self) {}
}

impl Deref for PooledBag {
    type Target = AttributeBag;

    fn deref(&self) -> &AttributeBag {
        self.bag.as_ref().expect("bag released")
    }
}

impl DerefMut for PooledBag {
    fn deref_mut(&mut self) -> &mut AttributeBag {
        self.bag.as_mut().expect("bag released")
    }
}

impl Drop for PooledBag {
    fn drop(&mut self) {
        if let Some(mut bag) = self.bag.take() {
            bag.reset_for_reuse();
            self.pool.free.lock().push(bag);
        }
    }
}
