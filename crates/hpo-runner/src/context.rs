use std::fmt;
use std::sync::Arc;

use hpo_core::{Dataclass, DataclassKind, HpoError, Result, ScopedLocation};
use tracing::Level;

use crate::repository::{HyperparamsRepository, InMemoryHyperparamsRepository};
use crate::scoped_log::{format_line, ScopedLogHandle, ScopedLogger};

/// Where an execution currently is in the experiment tree, plus the shared
/// repository and scoped logger it reports to.
///
/// The location is a value: [`AutoMlContext::push_attr`] and
/// [`AutoMlContext::copy`] return new contexts and never touch `self`.
#[derive(Clone)]
pub struct AutoMlContext {
    loc: ScopedLocation,
    repo: Arc<dyn HyperparamsRepository>,
    logger: ScopedLogger,
    silence_warnings: bool,
}

impl fmt::Debug for AutoMlContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AutoMlContext")
            .field("loc", &self.loc.to_string())
            .field("repo", &self.repo)
            .finish()
    }
}

impl AutoMlContext {
    /// Context at the root of `repo`.
    pub fn new(repo: Arc<dyn HyperparamsRepository>) -> Self {
        Self {
            loc: ScopedLocation::root(),
            repo,
            logger: ScopedLogger::new(),
            silence_warnings: false,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(InMemoryHyperparamsRepository::new()))
    }

    pub fn loc(&self) -> &ScopedLocation {
        &self.loc
    }

    pub fn repo(&self) -> &Arc<dyn HyperparamsRepository> {
        &self.repo
    }

    pub fn copy(&self) -> Self {
        self.clone()
    }

    /// Same repository and logger, other location. Nothing is created.
    pub fn with_loc(&self, loc: ScopedLocation) -> Self {
        Self {
            loc,
            repo: Arc::clone(&self.repo),
            logger: self.logger.clone(),
            silence_warnings: self.silence_warnings,
        }
    }

    /// Suppresses advisory warnings (such as trials missing from a summary)
    /// for this context and every context derived from it.
    pub fn with_silenced_warnings(mut self, silence: bool) -> Self {
        self.silence_warnings = silence;
        self
    }

    pub fn silences_warnings(&self) -> bool {
        self.silence_warnings
    }

    /// Descends one level to `node`, get-or-creating it in the repository.
    ///
    /// `node` must be of the kind one level below the current location; a
    /// root node pushed onto the root context yields a copy of it.
    pub fn push_attr(&self, node: impl Into<Dataclass>) -> Result<Self> {
        let node = node.into();
        if node.kind() == DataclassKind::Root && self.loc.is_empty() {
            return Ok(self.copy());
        }
        let expected = DataclassKind::from_depth(self.loc.len() + 1).ok_or_else(|| {
            HpoError::InvalidLocation(format!("{} is a leaf, nothing can be pushed", self.loc))
        })?;
        if node.kind() != expected {
            return Err(HpoError::InvalidLocation(format!(
                "cannot push a {} onto {} which expects a {}",
                node.kind(),
                self.loc,
                expected
            )));
        }
        let id = node.get_id().ok_or_else(|| {
            HpoError::InvalidLocation(format!("a {expected} needs an identifier"))
        })?;
        let loc = self.loc.push(id)?;
        self.repo.get_or_create(&loc, node)?;
        Ok(self.with_loc(loc))
    }

    /// Node at the current location.
    pub fn load(&self) -> Result<Dataclass> {
        self.repo.load(&self.loc)
    }

    /// Emits `message` as a tracing event and appends it to every active
    /// scoped log at or above this location.
    pub fn log(&self, level: Level, message: impl fmt::Display) {
        let message = message.to_string();
        match level {
            Level::ERROR => tracing::error!(location = %self.loc, "{message}"),
            Level::WARN => tracing::warn!(location = %self.loc, "{message}"),
            Level::INFO => tracing::info!(location = %self.loc, "{message}"),
            Level::DEBUG => tracing::debug!(location = %self.loc, "{message}"),
            _ => tracing::trace!(location = %self.loc, "{message}"),
        }
        let targets = self.logger.targets(&self.loc);
        if targets.is_empty() {
            return;
        }
        let line = format_line(level, &self.loc, &message);
        for target in targets {
            if let Err(err) = self.repo.append_log(&target, &line) {
                tracing::warn!(location = %target, error = %err, "failed to append scoped log");
            }
        }
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.log(Level::INFO, message);
    }

    pub fn warn(&self, message: impl fmt::Display) {
        self.log(Level::WARN, message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.log(Level::ERROR, message);
    }

    /// Starts capturing lines logged at or below this location. The capture
    /// ends when the returned handle is freed or dropped.
    pub fn add_scoped_logger_file_handler(&self) -> ScopedLogHandle {
        self.logger.register(self.loc.clone())
    }

    pub fn free_scoped_logger_file_handler(&self, handle: ScopedLogHandle) {
        handle.free();
    }

    /// Runs `f` with a scoped capture active at this location.
    pub fn with_scoped_log<R>(&self, f: impl FnOnce(&Self) -> R) -> R {
        let handle = self.add_scoped_logger_file_handler();
        let out = f(self);
        self.free_scoped_logger_file_handler(handle);
        out
    }

    pub fn read_scoped_logger_file(&self) -> Result<String> {
        self.repo.read_log(&self.loc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::RepositoryExt;
    use hpo_core::{
        ClientDataclass, LevelId, ProjectDataclass, RoundDataclass, TrialDataclass,
        DEFAULT_CLIENT, DEFAULT_PROJECT,
    };

    #[test]
    fn push_returns_a_new_context_and_creates_the_node() {
        let c0 = AutoMlContext::in_memory();
        let c1 = c0.push_attr(ProjectDataclass::new(DEFAULT_PROJECT)).expect("push");
        assert!(c0.loc().is_empty());
        assert_eq!(c1.loc().ids(), &[LevelId::from(DEFAULT_PROJECT)]);
        assert!(c0.repo().contains(c1.loc()).expect("contains"));

        let c2 = c1.push_attr(ClientDataclass::new(DEFAULT_CLIENT)).expect("push");
        assert_eq!(c2.loc().len(), 2);
        assert_eq!(c1.loc().len(), 1);
    }

    #[test]
    fn push_checks_the_kind_for_the_next_depth() {
        let c0 = AutoMlContext::in_memory();
        assert!(c0.push_attr(RoundDataclass::new(0)).is_err());
        let same = c0.push_attr(hpo_core::RootDataclass::new()).expect("root on root");
        assert_eq!(same.loc(), c0.loc());
        let c1 = c0.push_attr(ProjectDataclass::new("p")).expect("push");
        assert!(c1.push_attr(ProjectDataclass::new("p")).is_err());
    }

    #[test]
    fn push_keeps_existing_content() {
        let c0 = AutoMlContext::in_memory();
        let client = c0
            .push_attr(ProjectDataclass::new(DEFAULT_PROJECT))
            .and_then(|c| c.push_attr(ClientDataclass::new(DEFAULT_CLIENT).with_main_metric("MAE")))
            .expect("client");
        let again = c0
            .push_attr(ProjectDataclass::new(DEFAULT_PROJECT))
            .and_then(|c| c.push_attr(ClientDataclass::new(DEFAULT_CLIENT)))
            .expect("client");
        assert_eq!(again.loc(), client.loc());
        let stored: ClientDataclass = again.repo().load_as(again.loc()).expect("load");
        assert_eq!(stored.main_metric_name.as_deref(), Some("MAE"));
    }

    #[test]
    fn copied_context_changes_independently() {
        let c0 = AutoMlContext::in_memory();
        let deep = c0
            .with_loc(ScopedLocation::default_path(&[0, 0, 0]).expect("loc"))
            .copy();
        let mut loc = deep.loc().clone();
        loc.pop().expect("pop");
        loc.pop().expect("pop");
        let shallow = deep.with_loc(loc);
        assert_eq!(shallow.loc().len(), deep.loc().len() - 2);
        assert_ne!(shallow.loc(), deep.loc());
        assert!(c0.push_attr(TrialDataclass::default()).is_err());
    }

    #[test]
    fn handler_is_freed_even_when_the_scope_fails() {
        let c0 = AutoMlContext::in_memory();
        let result: std::result::Result<(), &str> = c0.with_scoped_log(|c| {
            c.info("before failure");
            Err("boom")
        });
        assert!(result.is_err());
        c0.info("after scope");
        let text = c0.read_scoped_logger_file().expect("read");
        assert!(text.contains("before failure"));
        assert!(!text.contains("after scope"));
    }
}
