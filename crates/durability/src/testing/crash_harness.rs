//! Crash injection for the save completion protocol

use crate::saver::RamSaver;

/// Points in `complete` at which a save can be cut short
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashPoint {
    /// Payloads written and flushed, index not yet written
    BeforeIndex,
    /// Index written, offset slot not yet updated
    BeforePublish,
}

impl CrashPoint {
    /// Get all crash points
    pub fn all() -> Vec<CrashPoint> {
        vec![CrashPoint::BeforeIndex, CrashPoint::BeforePublish]
    }

    /// Get description of crash point
    pub fn description(&self) -> &'static str {
        match self {
            CrashPoint::BeforeIndex => "After payload writes, before the index",
            CrashPoint::BeforePublish => "After the index write, before the offset backpatch",
        }
    }
}

/// Run `saver`'s completion protocol up to `point`, then drop it
///
/// The file is left exactly as a process killed at that point would leave
/// it: the offset slot still names the previous index (or is zero after a
/// first save).
pub fn complete_with_crash(mut saver: RamSaver, point: CrashPoint) {
    saver.finish(Some(point));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_points_described() {
        for point in CrashPoint::all() {
            assert!(!point.description().is_empty());
        }
        assert_eq!(CrashPoint::all().len(), 2);
    }
}
