use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use chrono::{SecondsFormat, Utc};
use hpo_core::ScopedLocation;
use tracing::Level;

/// Registry of active scoped log captures, shared by every context derived
/// from the same root context.
#[derive(Debug, Clone, Default)]
pub struct ScopedLogger {
    active: Arc<Mutex<Vec<(u64, ScopedLocation)>>>,
    next_id: Arc<AtomicU64>,
}

impl ScopedLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn register(&self, loc: ScopedLocation) -> ScopedLogHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, loc.clone()));
        ScopedLogHandle {
            logger: self.clone(),
            id,
            loc,
            released: false,
        }
    }

    fn release(&self, id: u64) -> bool {
        let mut active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let before = active.len();
        active.retain(|(handle, _)| *handle != id);
        active.len() != before
    }

    /// Capture locations that should receive a line emitted at `loc`:
    /// every active one that is `loc` or one of its ancestors.
    pub fn targets(&self, loc: &ScopedLocation) -> Vec<ScopedLocation> {
        let active = self.active.lock().unwrap_or_else(PoisonError::into_inner);
        let mut targets: Vec<ScopedLocation> = active
            .iter()
            .filter(|(_, capture)| capture.is_ancestor_or_equal(loc))
            .map(|(_, capture)| capture.clone())
            .collect();
        targets.sort();
        targets.dedup();
        targets
    }

    pub fn active_count(&self) -> usize {
        self.active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// One capture started by `add_scoped_logger_file_handler`. Released by
/// [`ScopedLogHandle::free`] or, failing that, when dropped.
#[derive(Debug)]
pub struct ScopedLogHandle {
    logger: ScopedLogger,
    id: u64,
    loc: ScopedLocation,
    released: bool,
}

impl ScopedLogHandle {
    pub fn location(&self) -> &ScopedLocation {
        &self.loc
    }

    pub fn free(mut self) {
        self.released = self.logger.release(self.id);
    }
}

impl Drop for ScopedLogHandle {
    fn drop(&mut self) {
        if !self.released {
            self.logger.release(self.id);
        }
    }
}

/// `<rfc3339> <LEVEL> [<location>] <message>`
pub fn format_line(level: Level, loc: &ScopedLocation, message: &str) -> String {
    format!(
        "{} {} [{}] {}",
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        level,
        loc,
        message
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_are_ancestors_of_the_emitter() {
        let logger = ScopedLogger::new();
        let root = ScopedLocation::root();
        let trial_0 = ScopedLocation::default_path(&[0, 0]).expect("loc");
        let trial_1 = ScopedLocation::default_path(&[0, 1]).expect("loc");
        let _root_capture = logger.register(root.clone());
        let _trial_capture = logger.register(trial_0.clone());

        assert_eq!(logger.targets(&trial_0), vec![root.clone(), trial_0.clone()]);
        assert_eq!(logger.targets(&trial_1), vec![root.clone()]);
        assert_eq!(logger.targets(&trial_0.push(0).expect("split")).len(), 2);
    }

    #[test]
    fn handle_is_released_once_by_free_or_drop() {
        let logger = ScopedLogger::new();
        let loc = ScopedLocation::root();
        let first = logger.register(loc.clone());
        {
            let _second = logger.register(loc.clone());
            assert_eq!(logger.active_count(), 2);
        }
        assert_eq!(logger.active_count(), 1);
        first.free();
        assert_eq!(logger.active_count(), 0);
        assert!(logger.targets(&loc).is_empty());
    }

    #[test]
    fn line_carries_level_and_location() {
        let loc = ScopedLocation::default_path(&[2]).expect("loc");
        let line = format_line(Level::WARN, &loc, "lock is stale");
        assert!(line.ends_with(" WARN [/default_project/default_client/2] lock is stale"));
    }
}
