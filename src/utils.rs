use std::time::Duration;

pub fn version() -> String {
    format!("keywarp {}", env!("CARGO_PKG_VERSION"))
}

pub fn get_monotonic_time() -> Duration {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // Cannot fail with a valid clock id and pointer.
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
    }
    Duration::new(ts.tv_sec as u64, ts.tv_nsec as u32)
}

/// Raises the scheduling priority as far as the OS permits.
///
/// Keystroke latency is user-perceptible; the input path should win
/// against ordinary load. Failure without the right privileges is
/// expected and only worth a warning.
pub fn boost_priority() {
    let err = unsafe {
        *libc::__errno_location() = 0;
        libc::nice(-20);
        *libc::__errno_location()
    };
    if err != 0 {
        warn!(
            "failed to raise process priority: {}",
            std::io::Error::from_raw_os_error(err)
        );
    }
}
