//! Thread affinity utilities (SPEC_FULL.md §4.11). Linux-only; a
//! no-op everywhere else, matching spec.md §4.3's "unknown strategy
//! name is logged and ignored" tolerance extended to "unsupported
//! platform is silently a no-op."

use crate::config::PinStrategy;

/// One thread's role in a pinning plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Read,
    Process,
}

fn logical_cpu_count() -> usize {
    // SAFETY: well-known sysconf name, always safe.
    unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN).max(1) as usize }
}

/// Compute which logical CPU index `thread_index` (0-based, within its
/// `role`) should be pinned to, given the strategy and how many
/// threads of each role exist. Returns `None` if the strategy leaves
/// this thread unpinned.
pub fn target_cpu(
    strategy: PinStrategy,
    role: Role,
    thread_index: usize,
    read_threads: usize,
    process_threads: usize,
) -> Option<usize> {
    let ncpu = logical_cpu_count();
    match strategy {
        PinStrategy::AllToOneLogical | PinStrategy::AllToOnePhysicalCore => Some(0),
        PinStrategy::ReadToFirstProcessToLast => match role {
            Role::Read => Some(0),
            Role::Process => Some(ncpu.saturating_sub(1)),
        },
        PinStrategy::StripeAcrossLogical | PinStrategy::StripeAcrossPhysicalCores => {
            let total_before = match role {
                Role::Read => 0,
                Role::Process => read_threads,
            };
            Some((total_before + thread_index) % ncpu)
        }
        PinStrategy::MixedLogicalReadPhysicalProcess => match role {
            Role::Read => Some(thread_index % ncpu),
            Role::Process => Some((read_threads + thread_index) % ncpu),
        },
        PinStrategy::MixedPhysicalReadLogicalProcess => match role {
            Role::Read => Some(thread_index % ncpu),
            Role::Process => Some((process_threads.saturating_sub(thread_index) + read_threads) % ncpu),
        },
    }
}

/// Pin the calling thread to `cpu` via `sched_setaffinity`. No-op
/// (returns `Ok`) on non-Linux platforms.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cpu: usize) -> std::io::Result<()> {
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        libc::CPU_SET(cpu, &mut set);
        let rc = libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set);
        if rc != 0 {
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cpu: usize) -> std::io::Result<()> {
    Ok(())
}

/// Apply a named strategy to the calling thread, given its role and
/// index. Logs and no-ops on an unrecognized strategy name (the
/// caller passes `None` from [`PinStrategy::parse`] in that case, so
/// there's nothing to do here but document the contract).
pub fn apply(
    strategy: Option<PinStrategy>,
    role: Role,
    thread_index: usize,
    read_threads: usize,
    process_threads: usize,
) {
    let Some(strategy) = strategy else {
        return;
    };
    if let Some(cpu) = target_cpu(strategy, role, thread_index, read_threads, process_threads) {
        if let Err(e) = pin_current_thread(cpu) {
            log::warn!("failed to pin thread to cpu {cpu}: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_to_one_pins_everyone_to_cpu_zero() {
        assert_eq!(target_cpu(PinStrategy::AllToOneLogical, Role::Read, 3, 4, 4), Some(0));
        assert_eq!(target_cpu(PinStrategy::AllToOneLogical, Role::Process, 0, 4, 4), Some(0));
    }

    #[test]
    fn read_to_first_process_to_last_differ() {
        let read = target_cpu(PinStrategy::ReadToFirstProcessToLast, Role::Read, 0, 2, 2).unwrap();
        let process = target_cpu(PinStrategy::ReadToFirstProcessToLast, Role::Process, 0, 2, 2).unwrap();
        assert_eq!(read, 0);
        assert!(process >= read);
    }

    #[test]
    fn stripe_advances_across_indices() {
        let a = target_cpu(PinStrategy::StripeAcrossLogical, Role::Read, 0, 4, 4).unwrap();
        let b = target_cpu(PinStrategy::StripeAcrossLogical, Role::Read, 1, 4, 4).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn pin_current_thread_does_not_error_on_cpu_zero() {
        assert!(pin_current_thread(0).is_ok());
    }
}
