//! Time related utilities.

/// Returns the current unix epoch time in seconds (see ``time(2)``).
pub fn epoch_i64() -> i64 {
    unsafe { libc::time(std::ptr::null_mut()) as i64 }
}
