#![allow(unused_macros)]

/// Helper macro for locking items
///
/// Poisoned locks are reported as [`crate::Error::LockError`] instead of panicking.
///
/// ```rust, ignore
///  let mut arena = lock!(self.arena)?;
///  arena.used += 16;
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock.lock().map_err(|_| crate::Error::LockError)
    };
}
