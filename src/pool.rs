use std::collections::VecDeque;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use crate::error::{RagError, Result};

fn lock_state<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Bounded pool of reusable items with blocking acquisition.
///
/// All items are created up front by the factory. `acquire` parks the
/// caller on a condition variable until an item is free or the pool is
/// shut down; the returned guard hands the item back on drop. Teardown
/// wakes every waiter, which then observe `PoolClosed` instead of
/// deadlocking.
pub struct Pool<T> {
    shared: Arc<PoolShared<T>>,
    capacity: usize,
}

struct PoolShared<T> {
    state: Mutex<PoolState<T>>,
    available: Condvar,
}

struct PoolState<T> {
    idle: VecDeque<T>,
    closed: bool,
}

impl<T: Send + 'static> Pool<T> {
    pub fn new(capacity: usize, factory: impl Fn() -> Result<T>) -> Result<Self> {
        if capacity == 0 {
            return Err(RagError::Config("pool capacity must be positive".into()));
        }
        let mut idle = VecDeque::with_capacity(capacity);
        for _ in 0..capacity {
            idle.push_back(factory()?);
        }
        Ok(Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState { idle, closed: false }),
                available: Condvar::new(),
            }),
            capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks until an item is free. Returns `PoolClosed` once the
    /// pool has been shut down.
    pub fn acquire(&self) -> Result<PoolGuard<T>> {
        let mut state = lock_state(&self.shared.state);
        loop {
            if state.closed {
                return Err(RagError::PoolClosed);
            }
            if let Some(item) = state.idle.pop_front() {
                return Ok(PoolGuard {
                    item: Some(item),
                    shared: Arc::clone(&self.shared),
                });
            }
            state = self
                .shared
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Marks the pool closed, drops all idle items and wakes every
    /// blocked acquirer. Items currently leased are dropped when their
    /// guards go out of scope.
    pub fn shutdown(&self) {
        let drained: Vec<T> = {
            let mut state = lock_state(&self.shared.state);
            state.closed = true;
            state.idle.drain(..).collect()
        };
        drop(drained);
        self.shared.available.notify_all();
    }

    #[cfg(test)]
    fn idle_len(&self) -> usize {
        lock_state(&self.shared.state).idle.len()
    }
}

/// Scoped lease of a pooled item; returns the item on drop.
pub struct PoolGuard<T> {
    item: Option<T>,
    shared: Arc<PoolShared<T>>,
}

impl<T> Deref for PoolGuard<T> {
    type Target = T;

    fn deref(&self) -> &T {
        self.item.as_ref().expect("pool guard holds an item")
    }
}

impl<T> DerefMut for PoolGuard<T> {
    fn deref_mut(&mut self) -> &mut T {
        self.item.as_mut().expect("pool guard holds an item")
    }
}

impl<T> Drop for PoolGuard<T> {
    fn drop(&mut self) {
        let Some(item) = self.item.take() else { return };
        let mut state = lock_state(&self.shared.state);
        if state.closed {
            drop(state);
            drop(item);
            return;
        }
        state.idle.push_back(item);
        drop(state);
        self.shared.available.notify_one();
    }
}

/// Pool of inference contexts with lazy growth and use-count recycling.
///
/// `min_size` contexts are built eagerly; `acquire` builds another when
/// none are idle and fewer than `max_size` exist, otherwise it blocks.
/// Each release increments the context's use count; once it reaches
/// `max_uses` (0 disables) the context is destroyed to bound the memory
/// long-lived inference state accretes, and with `max_uses == 1` a
/// fresh replacement is built immediately so the pool stays warm.
///
/// A context handed out by `acquire` must be treated as freshly
/// reusable: callers clear any engine-internal decode state before each
/// independent decoding, the pool does not do it for them.
pub struct ContextPool<T> {
    shared: Arc<CtxShared<T>>,
}

type CtxFactory<T> = Box<dyn Fn() -> Result<T> + Send + Sync>;

struct CtxShared<T> {
    state: Mutex<CtxState<T>>,
    available: Condvar,
    factory: CtxFactory<T>,
    max_size: usize,
    max_uses: u32,
}

struct CtxState<T> {
    idle: VecDeque<CtxEntry<T>>,
    total: usize,
    closed: bool,
}

struct CtxEntry<T> {
    item: T,
    uses: u32,
}

impl<T: Send + 'static> ContextPool<T> {
    pub fn new(
        min_size: usize,
        max_size: usize,
        max_uses: u32,
        factory: impl Fn() -> Result<T> + Send + Sync + 'static,
    ) -> Result<Self> {
        if max_size == 0 || min_size > max_size {
            return Err(RagError::Config(format!(
                "invalid context pool bounds: min {min_size}, max {max_size}"
            )));
        }
        let mut idle = VecDeque::with_capacity(min_size);
        for _ in 0..min_size {
            idle.push_back(CtxEntry {
                item: factory()?,
                uses: 0,
            });
        }
        let total = idle.len();
        Ok(Self {
            shared: Arc::new(CtxShared {
                state: Mutex::new(CtxState {
                    idle,
                    total,
                    closed: false,
                }),
                available: Condvar::new(),
                factory: Box::new(factory),
                max_size,
                max_uses,
            }),
        })
    }

    /// Blocks until a context is free, growing the pool when below
    /// `max_size`. Construction can take seconds for large models, so
    /// it happens outside the pool lock.
    pub fn acquire(&self) -> Result<ContextLease<T>> {
        let mut state = lock_state(&self.shared.state);
        loop {
            if state.closed {
                return Err(RagError::PoolClosed);
            }
            if let Some(entry) = state.idle.pop_front() {
                return Ok(self.lease(entry));
            }
            if state.total < self.shared.max_size {
                state.total += 1;
                drop(state);
                match (self.shared.factory)() {
                    Ok(item) => return Ok(self.lease(CtxEntry { item, uses: 0 })),
                    Err(e) => {
                        let mut state = lock_state(&self.shared.state);
                        state.total -= 1;
                        drop(state);
                        self.shared.available.notify_one();
                        return Err(e);
                    }
                }
            }
            state = self
                .shared
                .available
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    fn lease(&self, entry: CtxEntry<T>) -> ContextLease<T> {
        ContextLease {
            entry: Some(entry),
            shared: Arc::clone(&self.shared),
        }
    }

    /// Marks the pool closed, destroys idle contexts and wakes all
    /// waiters.
    pub fn shutdown(&self) {
        let drained: Vec<CtxEntry<T>> = {
            let mut state = lock_state(&self.shared.state);
            state.closed = true;
            state.total -= state.idle.len();
            state.idle.drain(..).collect()
        };
        drop(drained);
        self.shared.available.notify_all();
    }

    /// Contexts currently in existence (idle plus leased).
    pub fn total(&self) -> usize {
        lock_state(&self.shared.state).total
    }
}

/// Scoped lease of an inference context.
pub struct ContextLease<T> {
    entry: Option<CtxEntry<T>>,
    shared: Arc<CtxShared<T>>,
}

impl<T> Deref for ContextLease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.entry.as_ref().expect("lease holds a context").item
    }
}

impl<T> DerefMut for ContextLease<T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.entry.as_mut().expect("lease holds a context").item
    }
}

impl<T> Drop for ContextLease<T> {
    fn drop(&mut self) {
        let Some(mut entry) = self.entry.take() else { return };
        let shared = &self.shared;

        let mut state = lock_state(&shared.state);
        if state.closed {
            state.total -= 1;
            drop(state);
            return;
        }

        entry.uses += 1;
        let retire = shared.max_uses > 0 && entry.uses >= shared.max_uses;
        if !retire {
            state.idle.push_back(entry);
            drop(state);
            shared.available.notify_one();
            return;
        }

        state.total -= 1;
        drop(state);
        // Free the retired context outside the lock; it may hold a
        // large inference state.
        drop(entry);

        if shared.max_uses == 1 {
            match (shared.factory)() {
                Ok(item) => {
                    let mut state = lock_state(&shared.state);
                    if state.closed {
                        drop(state);
                        drop(item);
                    } else {
                        state.total += 1;
                        state.idle.push_back(CtxEntry { item, uses: 0 });
                        drop(state);
                    }
                }
                Err(e) => {
                    tracing::warn!("failed to rebuild recycled context: {e}");
                }
            }
        }
        shared.available.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn acquire_release_restores_idle_count() {
        let pool = Pool::new(2, || Ok(0u32)).unwrap();
        assert_eq!(pool.idle_len(), 2);
        {
            let _a = pool.acquire().unwrap();
            let _b = pool.acquire().unwrap();
            assert_eq!(pool.idle_len(), 0);
        }
        assert_eq!(pool.idle_len(), 2);
    }

    #[test]
    fn at_most_capacity_items_in_use_concurrently() {
        let pool = Arc::new(Pool::new(3, || Ok(())).unwrap());
        let in_use = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let in_use = Arc::clone(&in_use);
                let max_seen = Arc::clone(&max_seen);
                std::thread::spawn(move || {
                    for _ in 0..20 {
                        let _guard = pool.acquire().unwrap();
                        let now = in_use.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_micros(200));
                        in_use.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert!(max_seen.load(Ordering::SeqCst) <= 3);
        assert_eq!(pool.idle_len(), 3);
    }

    #[test]
    fn shutdown_unblocks_waiting_acquirers() {
        let pool = Arc::new(Pool::new(1, || Ok(())).unwrap());
        let held = pool.acquire().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.acquire().map(|_| ()))
        };
        std::thread::sleep(Duration::from_millis(30));
        pool.shutdown();

        let result = waiter.join().unwrap();
        assert!(matches!(result, Err(RagError::PoolClosed)));
        drop(held);
        assert!(matches!(pool.acquire(), Err(RagError::PoolClosed)));
    }

    #[test]
    fn factory_failure_surfaces_at_construction() {
        let result: Result<Pool<u32>> =
            Pool::new(2, || Err(RagError::Engine("no backend".into())));
        assert!(matches!(result, Err(RagError::Engine(_))));
    }

    #[test]
    fn context_pool_grows_lazily_up_to_max() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let pool = ContextPool::new(1, 3, 0, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        assert_eq!(created.load(Ordering::SeqCst), 1);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        let c = pool.acquire().unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 3);
        assert_eq!(pool.total(), 3);
        drop((a, b, c));
        // Returned contexts are reused, not recreated.
        let _d = pool.acquire().unwrap();
        assert_eq!(created.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn context_pool_blocks_at_max_until_release() {
        let pool = Arc::new(ContextPool::new(1, 1, 0, || Ok(())).unwrap());
        let lease = pool.acquire().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || {
                let _lease = pool.acquire().unwrap();
            })
        };
        std::thread::sleep(Duration::from_millis(30));
        assert!(!waiter.is_finished());
        drop(lease);
        waiter.join().unwrap();
    }

    #[test]
    fn single_use_contexts_are_rebuilt_immediately() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let pool = ContextPool::new(1, 2, 1, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        drop(pool.acquire().unwrap());
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(pool.total(), 1);

        drop(pool.acquire().unwrap());
        assert_eq!(created.load(Ordering::SeqCst), 3);
        assert_eq!(pool.total(), 1);
    }

    #[test]
    fn multi_use_contexts_retire_after_budget() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&created);
        let pool = ContextPool::new(1, 1, 3, move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

        drop(pool.acquire().unwrap());
        drop(pool.acquire().unwrap());
        assert_eq!(pool.total(), 1);
        drop(pool.acquire().unwrap()); // third use retires the context
        assert_eq!(pool.total(), 0);
        assert_eq!(created.load(Ordering::SeqCst), 1);

        // The next acquire rebuilds lazily.
        drop(pool.acquire().unwrap());
        assert_eq!(created.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn context_pool_shutdown_unblocks_waiters() {
        let pool = Arc::new(ContextPool::new(1, 1, 0, || Ok(())).unwrap());
        let lease = pool.acquire().unwrap();

        let waiter = {
            let pool = Arc::clone(&pool);
            std::thread::spawn(move || pool.acquire().map(|_| ()))
        };
        std::thread::sleep(Duration::from_millis(30));
        pool.shutdown();
        assert!(matches!(waiter.join().unwrap(), Err(RagError::PoolClosed)));
        drop(lease);
        assert_eq!(pool.total(), 0);
    }
}
