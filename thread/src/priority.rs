use core::fmt;

/// A thread's scheduling priority, relative to other threads in the process.
///
/// On Linux, priorities map to per-thread nice values. Raising a thread above
/// [`Priority::Normal`] usually requires `CAP_SYS_NICE`; when the OS refuses,
/// a warning is reported and the thread runs at its inherited priority. On
/// other platforms, priorities are recorded but not applied.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Priority {
    /// Runs ahead of everything else.
    TimeCritical,
    /// Much higher than normal.
    Highest,
    /// Slightly higher than normal.
    AboveNormal,
    /// The priority threads start with.
    #[default]
    Normal,
    /// Slightly lower than normal.
    BelowNormal,
    /// Much lower than normal.
    Lower,
    /// Only runs when nothing else wants to.
    Lowest,
}

impl Priority {
    /// Every priority, from highest to lowest.
    pub const ALL: [Priority; 7] = [
        Priority::TimeCritical,
        Priority::Highest,
        Priority::AboveNormal,
        Priority::Normal,
        Priority::BelowNormal,
        Priority::Lower,
        Priority::Lowest,
    ];

    /// Returns the Linux nice value for this priority.
    #[must_use]
    pub const fn nice(self) -> i32 {
        match self {
            Priority::TimeCritical => -15,
            Priority::Highest => -10,
            Priority::AboveNormal => -5,
            Priority::Normal => 0,
            Priority::BelowNormal => 5,
            Priority::Lower => 10,
            Priority::Lowest => 19,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Applies `priority` to the calling thread.
#[cfg(target_os = "linux")]
pub(crate) fn apply(priority: Priority) {
    if priority == Priority::Normal {
        return;
    }

    // Safety: `gettid` has no preconditions.
    let tid = unsafe { libc::syscall(libc::SYS_gettid) };
    // Safety: `setpriority` only reads its arguments; with `PRIO_PROCESS`
    // and a thread id it affects only that thread.
    let res = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, priority.nice()) };
    if res != 0 {
        let error = std::io::Error::last_os_error();
        hyphae_util::report_warn!(
            "could not set thread priority to {priority} (nice {}): {error}",
            priority.nice()
        );
    } else {
        tracing::trace!(%priority, nice = priority.nice(), "thread priority set");
    }
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn apply(priority: Priority) {
    if priority != Priority::Normal {
        tracing::debug!(%priority, "thread priorities are not supported on this platform");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nice_values_are_ordered() {
        let nices = Priority::ALL.map(Priority::nice);
        assert!(nices.windows(2).all(|pair| pair[0] < pair[1]), "{nices:?}");
        assert_eq!(Priority::default().nice(), 0);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn lowering_priority_is_applied() {
        let nice = std::thread::spawn(|| {
            apply(Priority::Lowest);
            // Safety: `getpriority` has no preconditions.
            unsafe {
                let tid = libc::syscall(libc::SYS_gettid);
                libc::getpriority(libc::PRIO_PROCESS, tid as libc::id_t)
            }
        })
        .join()
        .unwrap();
        assert_eq!(nice, Priority::Lowest.nice());
    }
}
