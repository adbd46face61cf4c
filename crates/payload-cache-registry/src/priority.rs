//! Write urgency.

use background_workers::TaskPriority;

/// How urgently a save must reach disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WritePriority {
    /// Write on the caller's thread and return once persisted.
    ///
    /// Used for crash-time saves, which must land before the process dies.
    Synchronous,
    /// Queue on the I/O worker ahead of low-priority work.
    Normal,
    /// Best-effort background write that yields to everything else.
    Low,
}

impl WritePriority {
    /// Worker priority for asynchronous writes, `None` for synchronous ones.
    pub fn task_priority(self) -> Option<TaskPriority> {
        match self {
            WritePriority::Synchronous => None,
            WritePriority::Normal => Some(TaskPriority::High),
            WritePriority::Low => Some(TaskPriority::Low),
        }
    }
}

/// Why a session snapshot is being written.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SnapshotType {
    /// The session ended normally.
    NormalEnd,
    /// Periodic snapshot of a session still in progress.
    PeriodicCache,
    /// The process is crashing.
    Crash,
}

impl SnapshotType {
    pub fn write_priority(self) -> WritePriority {
        match self {
            SnapshotType::NormalEnd => WritePriority::Normal,
            SnapshotType::PeriodicCache => WritePriority::Low,
            SnapshotType::Crash => WritePriority::Synchronous,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crash_snapshots_are_written_synchronously() {
        assert_eq!(SnapshotType::Crash.write_priority(), WritePriority::Synchronous);
        assert_eq!(WritePriority::Synchronous.task_priority(), None);
    }

    #[test]
    fn periodic_snapshots_yield_to_normal_writes() {
        assert_eq!(
            SnapshotType::PeriodicCache.write_priority().task_priority(),
            Some(TaskPriority::Low)
        );
        assert_eq!(
            SnapshotType::NormalEnd.write_priority().task_priority(),
            Some(TaskPriority::High)
        );
    }
}
