#![allow(unused_macros)]

/// Helper macro for locking items
///
/// ```rust, ignore
///  let mut data = lock!(my_mutex);
///  data.some_field = 42;
/// ```
macro_rules! lock {
    ($lock:expr) => {
        $lock.lock().expect("Failed to acquire lock")
    };
}

/// Helper macro for contract-violation checks.
///
/// Precondition violations in this crate are embedder bugs with no recovery
/// path; they abort with a diagnostic naming the broken invariant.
///
/// ```rust, ignore
///  contract!(manager.is_locked_by_current_thread(), "restore_thread requires the big lock");
/// ```
macro_rules! contract {
    ($cond:expr, $($msg:tt)+) => {
        assert!($cond, "contract violation: {}", format_args!($($msg)+))
    };
}
