use core::{
    cell::UnsafeCell,
    hint::spin_loop,
    ops::{Deref, DerefMut},
    sync::atomic::{AtomicUsize, Ordering},
};

/// The lock that serializes key transitions and patch passes.
///
/// A ticket lock: callers that race to enable or disable keys are served in
/// arrival order. It never sleeps, so it may be taken where scheduling is not
/// allowed.
pub struct PatchLock<T> {
    next: AtomicUsize,
    serving: AtomicUsize,
    inner: UnsafeCell<T>,
}

// Safety: mutual exclusion; only T: Send may cross threads.
unsafe impl<T: Send> Sync for PatchLock<T> {}

impl<T> PatchLock<T> {
    pub const fn new(inner: T) -> Self {
        Self {
            next: AtomicUsize::new(0),
            serving: AtomicUsize::new(0),
            inner: UnsafeCell::new(inner),
        }
    }

    /// Takes a ticket and spins until it is served.
    #[inline]
    pub fn lock(&self) -> PatchGuard<'_, T> {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        while self.serving.load(Ordering::Acquire) != ticket {
            spin_loop();
        }
        PatchGuard { lock: self }
    }

    /// Acquires only if nobody holds or waits for the lock.
    #[inline]
    pub fn try_lock(&self) -> Option<PatchGuard<'_, T>> {
        let serving = self.serving.load(Ordering::Relaxed);
        self.next
            .compare_exchange(serving, serving + 1, Ordering::Acquire, Ordering::Relaxed)
            .ok()
            .map(|_| PatchGuard { lock: self })
    }

    #[inline]
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut g = self.lock();
        f(&mut g)
    }

    #[inline]
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.next.load(Ordering::Relaxed) != self.serving.load(Ordering::Relaxed)
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

pub struct PatchGuard<'a, T> {
    lock: &'a PatchLock<T>,
}

impl<T> Deref for PatchGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.inner.get() }
    }
}

impl<T> DerefMut for PatchGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.inner.get() }
    }
}

impl<T> Drop for PatchGuard<'_, T> {
    fn drop(&mut self) {
        // Only the holder advances `serving`.
        let t = self.lock.serving.load(Ordering::Relaxed);
        self.lock.serving.store(t + 1, Ordering::Release);
    }
}
