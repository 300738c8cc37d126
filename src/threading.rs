//! Thread placement helpers for the worker runtime.

/// Number of cores currently online, as reported by the OS (at least 1).
pub fn online_cores() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no memory-safety preconditions.
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        if count > 0 {
            return count as usize;
        }
    }
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Pin the current thread to `core_id`.
///
/// Returns whether the kernel accepted the mask. On Linux this uses `pthread_setaffinity_np`; on
/// other platforms it is a no-op that returns `false`. Pinning may be refused inside containers
/// with a restricted cpuset, so callers treat failure as advisory.
pub fn pin_current_thread(core_id: usize) -> bool {
    #[cfg(target_os = "linux")]
    {
        use libc::{cpu_set_t, pthread_self, pthread_setaffinity_np, CPU_SET, CPU_SETSIZE, CPU_ZERO};
        if core_id >= CPU_SETSIZE as usize {
            return false;
        }
        // SAFETY: `set` is a properly sized, zero-initialised cpu_set_t owned by this frame.
        unsafe {
            let mut set: cpu_set_t = std::mem::zeroed();
            CPU_ZERO(&mut set);
            CPU_SET(core_id, &mut set);
            pthread_setaffinity_np(pthread_self(), std::mem::size_of::<cpu_set_t>(), &set) == 0
        }
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = core_id;
        false
    }
}

/// Core for worker `worker` given an offset, wrapped onto the online cores.
pub fn core_for_worker(worker: usize, offset: usize) -> usize {
    (offset + worker) % online_cores()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_assignment_wraps() {
        let cores = online_cores();
        assert!(cores >= 1);
        assert_eq!(core_for_worker(cores, 0), 0);
        assert_eq!(core_for_worker(1, cores - 1), 0);
    }

    #[test]
    fn out_of_range_core_is_refused() {
        assert!(!pin_current_thread(usize::MAX));
    }
}
