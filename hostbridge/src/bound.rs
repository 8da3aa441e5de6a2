use std::{
    fmt,
    mem::ManuallyDrop,
    thread::{self, ThreadId},
};

/// Carries a thread-affine value through `Send + Sync` containers.
///
/// The value is reachable, and dropped, only on the thread that created the
/// wrapper. Dropping it anywhere else leaks the value.
pub struct ThreadBound<T> {
    value: ManuallyDrop<T>,
    owner: ThreadId,
}

// SAFETY: this is safe, the value is only touched on `owner`
unsafe impl<T> Send for ThreadBound<T> {}
// SAFETY: this is safe, the value is only touched on `owner`
unsafe impl<T> Sync for ThreadBound<T> {}

impl<T> ThreadBound<T> {
    pub fn new(value: T) -> Self {
        Self {
            value: ManuallyDrop::new(value),
            owner: thread::current().id(),
        }
    }

    pub fn owner(&self) -> ThreadId {
        self.owner
    }

    pub fn is_owner(&self) -> bool {
        thread::current().id() == self.owner
    }

    /// The value, if called on the owning thread.
    pub fn get(&self) -> Option<&T> {
        self.is_owner().then(|| &*self.value)
    }
}

impl<T> Drop for ThreadBound<T> {
    fn drop(&mut self) {
        if self.is_owner() {
            // SAFETY: dropped exactly once, on the owning thread
            unsafe { ManuallyDrop::drop(&mut self.value) };
        } else {
            log::warn!(
                "leaking a {} dropped off its owning thread",
                std::any::type_name::<T>()
            );
        }
    }
}

impl<T> fmt::Debug for ThreadBound<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadBound")
            .field("owner", &self.owner)
            .finish()
    }
}
