use anyhow::{Result, anyhow};

/// Pins the calling thread to a single logical CPU.
///
/// Uses `pthread_setaffinity_np` directly; the cpu_set_t is sized for the
/// 64-CPU ceiling the scheduler enforces at construction.
pub(crate) fn pin_current_thread(cpu: u32) -> Result<()> {
    let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
    unsafe {
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu as usize, &mut set);
    }

    let ret = unsafe {
        libc::pthread_setaffinity_np(
            libc::pthread_self(),
            std::mem::size_of::<libc::cpu_set_t>(),
            &set,
        )
    };

    if ret != 0 {
        return Err(anyhow!(
            "pthread_setaffinity_np failed with error code: {}",
            ret
        ));
    }

    Ok(())
}

/// Logical CPU the calling thread is currently executing on.
pub(crate) fn current_cpu() -> u32 {
    unsafe { libc::sched_getcpu() as u32 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pin_then_report_same_cpu() {
        let cpus = std::thread::available_parallelism().unwrap().get() as u32;
        let cpu = cpus - 1;

        // Pinning can fail in restricted cpusets; only assert when it took.
        if pin_current_thread(cpu).is_ok() {
            assert_eq!(current_cpu(), cpu);
        }
    }
}
