use core::{
    fmt,
    sync::atomic::{AtomicU8, Ordering::*},
};

/// The lifecycle status of a [`Task`](super::Task).
///
/// ```text
///  Created ──dispatch──▶ Dispatched ◀──────▶ Pending
///     │                      │  ╲               │
///   cancel                   │   ╲ execute      │
///     ▼                      │    ▼             │
///  Cancelled ◀───cancel──────┤  Executing       │
///                            │    │             │
///  Abandoned ◀──abandon──────┘    ▼             │
///                              Completed        │
/// ```
///
/// `Completed`, `Cancelled` and `Abandoned` are terminal. A `Pending` task
/// may be cancelled or abandoned like a `Dispatched` one, and an `Executing`
/// task may be abandoned; its body still finishes running.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum TaskStatus {
    /// Constructed, but not yet handed to a scheduler.
    Created = 0,
    /// Queued to run.
    Dispatched = 1,
    /// Waiting for its dependency to be satisfied.
    Pending = 2,
    /// Its body is running.
    Executing = 3,
    /// Its body ran to completion (or panicked).
    Completed = 4,
    /// Cancelled before it started executing.
    Cancelled = 5,
    /// Abandoned by a scheduler that shut down before running it.
    Abandoned = 6,
}

impl TaskStatus {
    /// Returns `true` if the task can no longer change status.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Cancelled | TaskStatus::Abandoned
        )
    }

    fn from_bits(bits: u8) -> Self {
        match bits {
            0 => TaskStatus::Created,
            1 => TaskStatus::Dispatched,
            2 => TaskStatus::Pending,
            3 => TaskStatus::Executing,
            4 => TaskStatus::Completed,
            5 => TaskStatus::Cancelled,
            6 => TaskStatus::Abandoned,
            bits => hyphae_util::fatal!("invalid task status bits {bits:#x}"),
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub(crate) struct StatusCell(AtomicU8);

impl StatusCell {
    pub(crate) const fn new() -> Self {
        Self(AtomicU8::new(TaskStatus::Created as u8))
    }

    pub(crate) fn load(&self) -> TaskStatus {
        TaskStatus::from_bits(self.0.load(Acquire))
    }

    /// Moves to the status returned by `transition`, retrying if the status
    /// changes concurrently.
    ///
    /// Returns the status the cell moved away from, or the current status if
    /// `transition` refused to move.
    #[cfg_attr(test, track_caller)]
    pub(crate) fn transition(
        &self,
        mut transition: impl FnMut(TaskStatus) -> Option<TaskStatus>,
    ) -> Result<TaskStatus, TaskStatus> {
        let mut current = self.load();
        loop {
            let Some(next) = transition(current) else {
                return Err(current);
            };
            test_trace!(%current, %next, "StatusCell::transition");
            match self
                .0
                .compare_exchange_weak(current as u8, next as u8, AcqRel, Acquire)
            {
                Ok(_) => return Ok(current),
                Err(actual) => current = TaskStatus::from_bits(actual),
            }
        }
    }
}

impl fmt::Debug for StatusCell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.load().fmt(f)
    }
}
