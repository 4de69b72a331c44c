use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard, PoisonError};

use hpo_core::{
    check_placement, put_under, Dataclass, DataclassMut, DataclassNode, HpoError, LevelId, Result,
    RootDataclass, ScopedLocation,
};

/// Persistence boundary for the experiment tree.
///
/// Every operation is scoped to the subtree rooted at its location. Writes to
/// the same location are serialized; writes to disjoint locations may run in
/// parallel.
pub trait HyperparamsRepository: Send + Sync + fmt::Debug {
    /// Node at `loc` with its whole subtree. `NotFound` when any level is missing.
    fn load(&self, loc: &ScopedLocation) -> Result<Dataclass>;

    /// Stores `node` at `loc`, creating missing ancestors. Saving the same
    /// content twice is a no-op; ended trials and splits are read-only.
    fn save(&self, loc: &ScopedLocation, node: &Dataclass) -> Result<()>;

    /// Read-modify-write of the node at `loc` under its location lock. A
    /// missing node is handed to `f` empty.
    fn update(
        &self,
        loc: &ScopedLocation,
        f: &mut dyn FnMut(&mut Dataclass) -> Result<()>,
    ) -> Result<Dataclass>;

    /// Returns the node at `loc`, storing `node` there first if it is absent.
    fn get_or_create(&self, loc: &ScopedLocation, node: Dataclass) -> Result<Dataclass>;

    /// Adds `child` under `parent`. Numbered children get the next free
    /// number; named children are get-or-created.
    fn append_child(&self, parent: &ScopedLocation, child: Dataclass) -> Result<Dataclass>;

    fn append_log(&self, loc: &ScopedLocation, line: &str) -> Result<()>;

    /// Text captured for `loc`; empty when nothing was logged there.
    fn read_log(&self, loc: &ScopedLocation) -> Result<String>;

    fn contains(&self, loc: &ScopedLocation) -> Result<bool> {
        match self.load(loc) {
            Ok(_) => Ok(true),
            Err(HpoError::NotFound(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// Typed helpers over any repository.
pub trait RepositoryExt: HyperparamsRepository {
    fn load_as<T: DataclassNode>(&self, loc: &ScopedLocation) -> Result<T> {
        self.load(loc)?.into_node()
    }

    /// [`HyperparamsRepository::update`] on the concrete level type.
    fn update_as<T, R, F>(&self, loc: &ScopedLocation, f: F) -> Result<R>
    where
        T: DataclassNode,
        F: FnOnce(&mut T) -> Result<R>,
    {
        let mut f = Some(f);
        let mut out = None;
        self.update(loc, &mut |dc| {
            let f = f.take().ok_or_else(|| {
                HpoError::ConcurrentWriteConflict(format!("update of {loc} ran twice"))
            })?;
            out = Some(f(T::from_dataclass_mut(dc)?)?);
            Ok(())
        })?;
        out.ok_or_else(|| HpoError::NotFound(format!("update of {loc} produced no value")))
    }
}

impl<R: HyperparamsRepository + ?Sized> RepositoryExt for R {}

fn relative<'l>(base_loc: &ScopedLocation, loc: &'l ScopedLocation) -> Result<&'l [LevelId]> {
    if !base_loc.is_ancestor_or_equal(loc) {
        return Err(HpoError::InvalidLocation(format!(
            "{loc} is not inside {base_loc}"
        )));
    }
    Ok(&loc.ids()[base_loc.len()..])
}

/// `update` against an in-memory subtree rooted at `base_loc`.
pub(crate) fn update_in(
    base: DataclassMut<'_>,
    base_loc: &ScopedLocation,
    loc: &ScopedLocation,
    f: &mut dyn FnMut(&mut Dataclass) -> Result<()>,
) -> Result<Dataclass> {
    let rel = relative(base_loc, loc)?;
    let mut node = match base.view().descend(rel) {
        Some(existing) => existing.to_dataclass(),
        None => Dataclass::empty_at(loc)?,
    };
    f(&mut node)?;
    put_under(base, base_loc, loc, node.clone())?;
    Ok(node)
}

pub(crate) fn get_or_create_in(
    base: DataclassMut<'_>,
    base_loc: &ScopedLocation,
    loc: &ScopedLocation,
    node: Dataclass,
) -> Result<Dataclass> {
    check_placement(loc, &node)?;
    let rel = relative(base_loc, loc)?;
    if let Some(existing) = base.view().descend(rel) {
        return Ok(existing.to_dataclass());
    }
    put_under(base, base_loc, loc, node.clone())?;
    Ok(node)
}

/// Location `child` gets under `parent`. Numbered kinds take `next_number`.
pub(crate) fn child_location(
    parent: &ScopedLocation,
    child: &mut Dataclass,
    next_number: impl FnOnce() -> Result<usize>,
) -> Result<ScopedLocation> {
    let expected = parent.kind().child().ok_or_else(|| {
        HpoError::InvalidLocation(format!("{parent} addresses a leaf, it has no children"))
    })?;
    if child.kind() != expected {
        return Err(HpoError::InvalidLocation(format!(
            "cannot append a {} under {} which holds {}s",
            child.kind(),
            parent,
            expected
        )));
    }
    let id = if expected.is_numbered() {
        let id = LevelId::Number(next_number()?);
        child.set_id(id.clone())?;
        id
    } else {
        child.get_id().ok_or_else(|| {
            HpoError::InvalidLocation(format!("a {expected} needs an identifier"))
        })?
    };
    parent.push(id)
}

pub(crate) fn append_child_in(
    base: DataclassMut<'_>,
    base_loc: &ScopedLocation,
    parent: &ScopedLocation,
    mut child: Dataclass,
) -> Result<Dataclass> {
    let rel = relative(base_loc, parent)?;
    let next = base
        .view()
        .descend(rel)
        .map_or(0, |node| node.next_child_number());
    let loc = child_location(parent, &mut child, || Ok(next))?;
    get_or_create_in(base, base_loc, &loc, child)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Keeps the whole tree resident behind one mutex.
#[derive(Debug, Default)]
pub struct InMemoryHyperparamsRepository {
    root: Mutex<RootDataclass>,
    logs: Mutex<BTreeMap<ScopedLocation, String>>,
}

impl InMemoryHyperparamsRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_root(root: RootDataclass) -> Self {
        Self {
            root: Mutex::new(root),
            logs: Mutex::default(),
        }
    }

    /// Copy of the whole tree.
    pub fn snapshot(&self) -> RootDataclass {
        lock(&self.root).clone()
    }
}

impl HyperparamsRepository for InMemoryHyperparamsRepository {
    fn load(&self, loc: &ScopedLocation) -> Result<Dataclass> {
        let root = lock(&self.root);
        Ok(root.resolve(loc)?.to_dataclass())
    }

    fn save(&self, loc: &ScopedLocation, node: &Dataclass) -> Result<()> {
        lock(&self.root).put(loc, node.clone())
    }

    fn update(
        &self,
        loc: &ScopedLocation,
        f: &mut dyn FnMut(&mut Dataclass) -> Result<()>,
    ) -> Result<Dataclass> {
        let mut root = lock(&self.root);
        update_in(DataclassMut::Root(&mut root), &ScopedLocation::root(), loc, f)
    }

    fn get_or_create(&self, loc: &ScopedLocation, node: Dataclass) -> Result<Dataclass> {
        let mut root = lock(&self.root);
        get_or_create_in(DataclassMut::Root(&mut root), &ScopedLocation::root(), loc, node)
    }

    fn append_child(&self, parent: &ScopedLocation, child: Dataclass) -> Result<Dataclass> {
        let mut root = lock(&self.root);
        append_child_in(DataclassMut::Root(&mut root), &ScopedLocation::root(), parent, child)
    }

    fn append_log(&self, loc: &ScopedLocation, line: &str) -> Result<()> {
        let mut logs = lock(&self.logs);
        let text = logs.entry(loc.clone()).or_default();
        text.push_str(line.trim_end_matches('\n'));
        text.push('\n');
        Ok(())
    }

    fn read_log(&self, loc: &ScopedLocation) -> Result<String> {
        Ok(lock(&self.logs).get(loc).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hpo_core::{
        ClientDataclass, HyperparameterSamples, RoundDataclass, TrialDataclass, TrialStatus,
        DEFAULT_CLIENT,
    };
    use std::sync::Arc;
    use std::thread;

    fn client_loc() -> ScopedLocation {
        ScopedLocation::default_path(&[]).expect("loc")
    }

    #[test]
    fn load_distinguishes_missing_from_empty() {
        let repo = InMemoryHyperparamsRepository::new();
        assert!(matches!(repo.load(&client_loc()), Err(HpoError::NotFound(_))));
        assert!(!repo.contains(&client_loc()).expect("contains"));

        let stored = repo
            .get_or_create(&client_loc(), ClientDataclass::new(DEFAULT_CLIENT).into())
            .expect("create");
        assert_eq!(repo.load(&client_loc()).expect("load"), stored);
        assert!(repo.contains(&client_loc().parent().expect("project")).expect("contains"));
    }

    #[test]
    fn save_is_idempotent() {
        let repo = InMemoryHyperparamsRepository::new();
        let loc = ScopedLocation::default_path(&[0]).expect("loc");
        let round: Dataclass = RoundDataclass::new(0).into();
        repo.save(&loc, &round).expect("first");
        let first = repo.snapshot();
        repo.save(&loc, &round).expect("second");
        assert_eq!(repo.snapshot(), first);
    }

    #[test]
    fn append_child_numbers_rounds_trials_and_splits() {
        let repo = InMemoryHyperparamsRepository::new();
        let round_a = repo
            .append_child(&client_loc(), RoundDataclass::new(99).into())
            .expect("round");
        let round_b = repo
            .append_child(&client_loc(), RoundDataclass::new(0).into())
            .expect("round");
        assert_eq!(round_a.get_id(), Some(LevelId::Number(0)));
        assert_eq!(round_b.get_id(), Some(LevelId::Number(1)));

        let round_loc = ScopedLocation::default_path(&[1]).expect("loc");
        for expected in 0..3 {
            let trial = repo
                .append_child(&round_loc, TrialDataclass::default().into())
                .expect("trial");
            assert_eq!(trial.get_id(), Some(LevelId::Number(expected)));
        }
        assert!(repo
            .append_child(&round_loc, RoundDataclass::new(0).into())
            .is_err());
    }

    #[test]
    fn update_as_changes_one_trial() {
        let repo = InMemoryHyperparamsRepository::new();
        let trial_loc = ScopedLocation::default_path(&[0, 0]).expect("loc");
        let status = repo
            .update_as::<TrialDataclass, _, _>(&trial_loc, |t| {
                t.start()?;
                Ok(t.status())
            })
            .expect("start");
        assert_eq!(status, TrialStatus::Running);
        let trial: TrialDataclass = repo.load_as(&trial_loc).expect("load");
        assert_eq!(trial.status(), TrialStatus::Running);
        assert!(repo
            .update_as::<RoundDataclass, _, _>(&trial_loc, |_| Ok(()))
            .is_err());
    }

    #[test]
    fn failed_update_leaves_state_untouched() {
        let repo = InMemoryHyperparamsRepository::new();
        let trial_loc = ScopedLocation::default_path(&[0, 0]).expect("loc");
        repo.update_as::<TrialDataclass, _, _>(&trial_loc, |t| {
            t.start()?;
            Ok(())
        })
        .expect("start");
        let before = repo.snapshot();
        let err = repo
            .update_as::<TrialDataclass, _, _>(&trial_loc, |t| {
                t.hyperparams.insert("lr".to_string(), serde_json::json!(0.1));
                t.start()?;
                Ok(())
            })
            .expect_err("second start");
        assert!(matches!(err, HpoError::InvalidTransition { .. }));
        assert_eq!(repo.snapshot(), before);
    }

    #[test]
    fn concurrent_appends_get_distinct_numbers() {
        let repo = Arc::new(InMemoryHyperparamsRepository::new());
        let round_loc = ScopedLocation::default_path(&[0]).expect("loc");
        thread::scope(|s| {
            for _ in 0..8 {
                let repo = Arc::clone(&repo);
                let round_loc = round_loc.clone();
                s.spawn(move || {
                    let mut hp = HyperparameterSamples::new();
                    hp.insert("seed".to_string(), serde_json::json!(1));
                    repo.append_child(&round_loc, TrialDataclass::new(0, hp).into())
                        .expect("append");
                });
            }
        });
        let round: RoundDataclass = repo.load_as(&round_loc).expect("round");
        let numbers: Vec<usize> = round.trials.iter().map(|t| t.trial_number).collect();
        assert_eq!(numbers, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn logs_are_kept_per_location() {
        let repo = InMemoryHyperparamsRepository::new();
        let loc = client_loc();
        repo.append_log(&loc, "first").expect("log");
        repo.append_log(&loc, "second\n").expect("log");
        assert_eq!(repo.read_log(&loc).expect("read"), "first\nsecond\n");
        assert_eq!(repo.read_log(&ScopedLocation::root()).expect("read"), "");
    }
}
