//! Durable repository: one directory per project, client and round, one JSON
//! file per trial.
//!
//! ```text
//! <root>/<project>/<client>/client.json
//! <root>/<project>/<client>/round_<n>/trial_<m>.json
//! ```
//!
//! Writers take `create_new` lock files next to what they change: a trial
//! file is guarded by `.trial_<m>.lock`, everything shallower by the
//! `.<kind>.lock` file of its directory. Locks are always taken from the
//! coarser level to the finer one.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use hpo_core::fsutil::{atomic_write_json_pretty, ensure_dir};
use hpo_core::{
    check_placement, put_under, ClientDataclass, Dataclass, DataclassMut, DataclassNode,
    HpoError, ProjectDataclass, Result, RootDataclass, RoundDataclass, ScopedLocation,
    TrialDataclass,
};
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::config::RepositoryConfig;
use crate::lock::LocationLock;
use crate::repository::{
    append_child_in, child_location, get_or_create_in, update_in, HyperparamsRepository,
};

const CLIENT_FILE: &str = "client.json";
const TRIAL_DEPTH: usize = 4;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ClientRecord {
    client_name: String,
    #[serde(default)]
    main_metric_name: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OnDiskHyperparamsRepository {
    root_dir: PathBuf,
    config: RepositoryConfig,
}

fn trial_number(loc: &ScopedLocation) -> Result<usize> {
    loc.trial_number()
        .ok_or_else(|| HpoError::InvalidLocation(format!("{loc} does not address a trial")))
}

fn round_number(loc: &ScopedLocation) -> Result<usize> {
    loc.round_number()
        .ok_or_else(|| HpoError::InvalidLocation(format!("{loc} does not address a round")))
}

fn parse_trial_file(name: &str) -> Option<usize> {
    name.strip_prefix("trial_")?.strip_suffix(".json")?.parse().ok()
}

fn parse_round_dir(name: &str) -> Option<usize> {
    name.strip_prefix("round_")?.parse().ok()
}

/// Visible entries of `dir` as `(name, is_dir)`, sorted by name. Lock and
/// temp files start with a dot and are skipped.
fn list_dir(dir: &Path) -> Result<Vec<(String, bool)>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut entries = Vec::new();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name() {
        let entry = entry.map_err(std::io::Error::from)?;
        let name = entry.file_name().to_string_lossy().to_string();
        if name.starts_with('.') {
            continue;
        }
        entries.push((name, entry.file_type().is_dir()));
    }
    Ok(entries)
}

fn child_dirs(dir: &Path) -> Result<Vec<String>> {
    Ok(list_dir(dir)?
        .into_iter()
        .filter_map(|(name, is_dir)| is_dir.then_some(name))
        .collect())
}

fn round_numbers(client_dir: &Path) -> Result<Vec<usize>> {
    let mut numbers: Vec<usize> = child_dirs(client_dir)?
        .iter()
        .filter_map(|name| parse_round_dir(name))
        .collect();
    numbers.sort_unstable();
    Ok(numbers)
}

/// Trial numbers stored in `round_dir`; they must form `0..n`.
fn trial_numbers(round_dir: &Path) -> Result<Vec<usize>> {
    let mut numbers: Vec<usize> = list_dir(round_dir)?
        .into_iter()
        .filter(|(_, is_dir)| !is_dir)
        .filter_map(|(name, _)| parse_trial_file(&name))
        .collect();
    numbers.sort_unstable();
    if numbers.iter().enumerate().any(|(i, n)| i != *n) {
        return Err(HpoError::Serialization(format!(
            "trial files in {} are not numbered 0..{}: {:?}",
            round_dir.display(),
            numbers.len(),
            numbers
        )));
    }
    Ok(numbers)
}

fn dropped(loc: &ScopedLocation, what: impl std::fmt::Display) -> HpoError {
    HpoError::InvalidLocation(format!("saving {loc} would drop existing {what}"))
}

impl OnDiskHyperparamsRepository {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self::with_config(root_dir, RepositoryConfig::default())
    }

    pub fn with_config(root_dir: impl Into<PathBuf>, config: RepositoryConfig) -> Self {
        Self {
            root_dir: root_dir.into(),
            config,
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    /// Directory of the deepest level of `loc` above trials.
    fn dir_of(&self, loc: &ScopedLocation) -> PathBuf {
        let mut dir = self.root_dir.clone();
        for (depth, id) in loc.ids().iter().take(TRIAL_DEPTH - 1).enumerate() {
            if depth == 2 {
                dir.push(format!("round_{id}"));
            } else {
                dir.push(id.to_string());
            }
        }
        dir
    }

    pub fn trial_path(&self, trial_loc: &ScopedLocation) -> Result<PathBuf> {
        Ok(self
            .dir_of(trial_loc)
            .join(format!("trial_{}.json", trial_number(trial_loc)?)))
    }

    fn lock_dir(&self, loc: &ScopedLocation) -> Result<LocationLock> {
        let path = self.dir_of(loc).join(format!(".{}.lock", loc.kind()));
        LocationLock::acquire(&path, &self.config)
    }

    fn lock_trial(&self, trial_loc: &ScopedLocation) -> Result<LocationLock> {
        let path = self
            .dir_of(trial_loc)
            .join(format!(".trial_{}.lock", trial_number(trial_loc)?));
        LocationLock::acquire(&path, &self.config)
    }

    /// Append-only text log kept for `loc`.
    pub fn log_path(&self, loc: &ScopedLocation) -> PathBuf {
        let dir = self.dir_of(loc);
        let Some(trial) = loc.trial_number() else {
            return dir.join(format!("{}.log", loc.kind()));
        };
        let mut name = format!("trial_{trial}");
        if let Some(split) = loc.split_number() {
            name.push_str(&format!("_split_{split}"));
        }
        if let Some(metric) = loc.metric_name() {
            name.push('_');
            name.push_str(metric);
        }
        dir.join(format!("{name}.log"))
    }

    fn read_trial(&self, trial_loc: &ScopedLocation) -> Result<Option<TrialDataclass>> {
        let path = self.trial_path(trial_loc)?;
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let trial = TrialDataclass::from_dict(serde_json::from_str(&text)?)
            .map_err(|e| HpoError::Serialization(format!("{}: {}", path.display(), e)))?;
        if trial.trial_number != trial_number(trial_loc)? {
            return Err(HpoError::Serialization(format!(
                "{} holds trial {}",
                path.display(),
                trial.trial_number
            )));
        }
        Ok(Some(trial))
    }

    fn read_client_record(&self, client_dir: &Path) -> Result<Option<ClientRecord>> {
        match fs::read_to_string(client_dir.join(CLIENT_FILE)) {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn require_dir(&self, loc: &ScopedLocation) -> Result<PathBuf> {
        let dir = self.dir_of(loc);
        if dir.is_dir() {
            Ok(dir)
        } else {
            Err(HpoError::NotFound(format!("no {} at {}", loc.kind(), loc)))
        }
    }

    fn load_round(&self, loc: &ScopedLocation) -> Result<RoundDataclass> {
        let dir = self.require_dir(loc)?;
        let mut round = RoundDataclass::new(round_number(loc)?);
        for n in trial_numbers(&dir)? {
            let trial_loc = loc.push(n)?;
            let trial = self
                .read_trial(&trial_loc)?
                .ok_or_else(|| HpoError::NotFound(format!("trial file for {trial_loc} vanished")))?;
            round.trials.push(trial);
        }
        Ok(round)
    }

    fn load_client(&self, loc: &ScopedLocation) -> Result<ClientDataclass> {
        let dir = self.require_dir(loc)?;
        let name = loc.client_name().unwrap_or_default();
        let mut client = ClientDataclass::new(name);
        if let Some(record) = self.read_client_record(&dir)? {
            if record.client_name != name {
                return Err(HpoError::Serialization(format!(
                    "{} names client `{}`",
                    dir.join(CLIENT_FILE).display(),
                    record.client_name
                )));
            }
            client.main_metric_name = record.main_metric_name;
        }
        for n in round_numbers(&dir)? {
            client.rounds.insert(n, self.load_round(&loc.push(n)?)?);
        }
        Ok(client)
    }

    fn load_project(&self, loc: &ScopedLocation) -> Result<ProjectDataclass> {
        let dir = self.require_dir(loc)?;
        let mut project = ProjectDataclass::new(loc.project_name().unwrap_or_default());
        for name in child_dirs(&dir)? {
            let client = self.load_client(&loc.push(name.as_str())?)?;
            project.clients.insert(name, client);
        }
        Ok(project)
    }

    fn load_root(&self) -> Result<RootDataclass> {
        let mut root = RootDataclass::new();
        for name in child_dirs(&self.root_dir)? {
            let project = self.load_project(&ScopedLocation::root().push(name.as_str())?)?;
            root.projects.insert(name, project);
        }
        Ok(root)
    }

    fn load_node(&self, loc: &ScopedLocation) -> Result<Dataclass> {
        match loc.len() {
            0 => Ok(self.load_root()?.into()),
            1 => Ok(self.load_project(loc)?.into()),
            2 => Ok(self.load_client(loc)?.into()),
            3 => Ok(self.load_round(loc)?.into()),
            _ => {
                let trial_loc = loc.slice(TRIAL_DEPTH)?;
                let trial: Dataclass = self
                    .read_trial(&trial_loc)?
                    .ok_or_else(|| HpoError::NotFound(format!("no trial file for {trial_loc}")))?
                    .into();
                trial
                    .view()
                    .descend(&loc.ids()[TRIAL_DEPTH..])
                    .map(|node| node.to_dataclass())
                    .ok_or_else(|| HpoError::NotFound(format!("nothing at {loc} in {trial_loc}")))
            }
        }
    }

    /// Runs `f` on the trial stored at `trial_loc` and writes it back when it
    /// changed. `f` also learns whether the file already existed. A new trial
    /// must be the next one of its round; creating it needs the round lock,
    /// which the caller may already hold.
    fn modify_trial<R>(
        &self,
        trial_loc: &ScopedLocation,
        round_locked: bool,
        f: impl FnOnce(DataclassMut<'_>, bool) -> Result<R>,
    ) -> Result<R> {
        let path = self.trial_path(trial_loc)?;
        let _round_lock = if round_locked || path.exists() {
            None
        } else {
            Some(self.lock_dir(&trial_loc.slice(TRIAL_DEPTH - 1)?)?)
        };
        let _trial_lock = self.lock_trial(trial_loc)?;

        let n = trial_number(trial_loc)?;
        let before = self.read_trial(trial_loc)?;
        let existed = before.is_some();
        if !existed {
            let count = trial_numbers(&self.dir_of(trial_loc))?.len();
            if n != count {
                return Err(HpoError::InvalidLocation(format!(
                    "cannot create trial {n} in a round holding {count} trials"
                )));
            }
        }
        let mut trial = before
            .clone()
            .unwrap_or_else(|| TrialDataclass::new(n, Default::default()));
        let out = f(DataclassMut::Trial(&mut trial), existed)?;
        if before.as_ref() != Some(&trial) {
            trial.validate_keys()?;
            check_placement(trial_loc, &Dataclass::Trial(trial.clone()))?;
            atomic_write_json_pretty(&path, &trial)?;
            tracing::debug!(location = %trial_loc, path = %path.display(), "wrote trial");
        }
        Ok(out)
    }

    fn store_trial(&self, trial_loc: &ScopedLocation, trial: &TrialDataclass) -> Result<()> {
        self.modify_trial(trial_loc, true, |base, _| {
            put_under(base, trial_loc, trial_loc, trial.clone().into())
        })
    }

    /// Expects the round lock to be held.
    fn store_round(
        &self,
        loc: &ScopedLocation,
        round: &RoundDataclass,
        previous: Option<&RoundDataclass>,
    ) -> Result<()> {
        let dir = self.dir_of(loc);
        ensure_dir(&dir)?;
        let existing = trial_numbers(&dir)?.len();
        if round.trials.len() < existing {
            return Err(dropped(loc, format_args!("trials {}..{}", round.trials.len(), existing)));
        }
        for trial in &round.trials {
            if previous.and_then(|p| p.trials.get(trial.trial_number)) == Some(trial) {
                continue;
            }
            self.store_trial(&loc.push(trial.trial_number)?, trial)?;
        }
        Ok(())
    }

    /// Expects the client lock to be held.
    fn store_client(
        &self,
        loc: &ScopedLocation,
        client: &ClientDataclass,
        previous: Option<&ClientDataclass>,
    ) -> Result<()> {
        let dir = self.dir_of(loc);
        ensure_dir(&dir)?;
        let record = ClientRecord {
            client_name: client.client_name.clone(),
            main_metric_name: client.main_metric_name.clone(),
        };
        if self.read_client_record(&dir)?.as_ref() != Some(&record) {
            atomic_write_json_pretty(&dir.join(CLIENT_FILE), &record)?;
        }
        for n in round_numbers(&dir)? {
            if !client.rounds.contains_key(&n) {
                return Err(dropped(loc, format_args!("round {n}")));
            }
        }
        for (n, round) in &client.rounds {
            let prev = previous.and_then(|p| p.rounds.get(n));
            if prev == Some(round) {
                continue;
            }
            let round_loc = loc.push(*n)?;
            let _lock = self.lock_dir(&round_loc)?;
            self.store_round(&round_loc, round, prev)?;
        }
        Ok(())
    }

    /// Expects the project lock to be held.
    fn store_project(
        &self,
        loc: &ScopedLocation,
        project: &ProjectDataclass,
        previous: Option<&ProjectDataclass>,
    ) -> Result<()> {
        let dir = self.dir_of(loc);
        ensure_dir(&dir)?;
        for name in child_dirs(&dir)? {
            if !project.clients.contains_key(&name) {
                return Err(dropped(loc, format_args!("client `{name}`")));
            }
        }
        for (name, client) in &project.clients {
            let prev = previous.and_then(|p| p.clients.get(name));
            if prev == Some(client) {
                continue;
            }
            let client_loc = loc.push(name.as_str())?;
            let _lock = self.lock_dir(&client_loc)?;
            self.store_client(&client_loc, client, prev)?;
        }
        Ok(())
    }

    /// Expects the root lock to be held.
    fn store_root(&self, root: &RootDataclass, previous: Option<&RootDataclass>) -> Result<()> {
        ensure_dir(&self.root_dir)?;
        let loc = ScopedLocation::root();
        for name in child_dirs(&self.root_dir)? {
            if !root.projects.contains_key(&name) {
                return Err(dropped(&loc, format_args!("project `{name}`")));
            }
        }
        for (name, project) in &root.projects {
            let prev = previous.and_then(|p| p.projects.get(name));
            if prev == Some(project) {
                continue;
            }
            let project_loc = loc.push(name.as_str())?;
            let _lock = self.lock_dir(&project_loc)?;
            self.store_project(&project_loc, project, prev)?;
        }
        Ok(())
    }

    /// Writes a node shallower than a trial. The lock of `loc` must be held.
    fn store_locked(
        &self,
        loc: &ScopedLocation,
        node: &Dataclass,
        previous: Option<&Dataclass>,
    ) -> Result<()> {
        check_placement(loc, node)?;
        node.validate_keys()?;
        match (node, previous) {
            (Dataclass::Root(n), prev) => self.store_root(
                n,
                prev.and_then(|p| match p {
                    Dataclass::Root(p) => Some(p),
                    _ => None,
                }),
            ),
            (Dataclass::Project(n), prev) => self.store_project(
                loc,
                n,
                prev.and_then(|p| match p {
                    Dataclass::Project(p) => Some(p),
                    _ => None,
                }),
            ),
            (Dataclass::Client(n), prev) => self.store_client(
                loc,
                n,
                prev.and_then(|p| match p {
                    Dataclass::Client(p) => Some(p),
                    _ => None,
                }),
            ),
            (Dataclass::Round(n), prev) => self.store_round(
                loc,
                n,
                prev.and_then(|p| match p {
                    Dataclass::Round(p) => Some(p),
                    _ => None,
                }),
            ),
            (other, _) => Err(HpoError::InvalidLocation(format!(
                "a {} is stored inside its trial file",
                other.kind()
            ))),
        }
    }

    fn next_round_number(&self, client_loc: &ScopedLocation) -> Result<usize> {
        Ok(round_numbers(&self.dir_of(client_loc))?
            .last()
            .map_or(0, |n| n + 1))
    }
}

impl HyperparamsRepository for OnDiskHyperparamsRepository {
    fn load(&self, loc: &ScopedLocation) -> Result<Dataclass> {
        self.load_node(loc)
    }

    fn save(&self, loc: &ScopedLocation, node: &Dataclass) -> Result<()> {
        check_placement(loc, node)?;
        node.validate_keys()?;
        if loc.len() >= TRIAL_DEPTH {
            let trial_loc = loc.slice(TRIAL_DEPTH)?;
            return self.modify_trial(&trial_loc, false, |base, _| {
                put_under(base, &trial_loc, loc, node.clone())
            });
        }
        let _lock = self.lock_dir(loc)?;
        self.store_locked(loc, node, None)
    }

    fn update(
        &self,
        loc: &ScopedLocation,
        f: &mut dyn FnMut(&mut Dataclass) -> Result<()>,
    ) -> Result<Dataclass> {
        if loc.len() >= TRIAL_DEPTH {
            let trial_loc = loc.slice(TRIAL_DEPTH)?;
            return self.modify_trial(&trial_loc, false, |base, _| {
                update_in(base, &trial_loc, loc, f)
            });
        }
        let _lock = self.lock_dir(loc)?;
        let before = match self.load_node(loc) {
            Ok(node) => node,
            Err(HpoError::NotFound(_)) => Dataclass::empty_at(loc)?,
            Err(e) => return Err(e),
        };
        let mut node = before.clone();
        f(&mut node)?;
        self.store_locked(loc, &node, Some(&before))?;
        Ok(node)
    }

    fn get_or_create(&self, loc: &ScopedLocation, node: Dataclass) -> Result<Dataclass> {
        check_placement(loc, &node)?;
        if loc.len() == TRIAL_DEPTH {
            return self.modify_trial(loc, false, |base, existed| {
                if existed {
                    return Ok(base.view().to_dataclass());
                }
                put_under(base, loc, loc, node.clone())?;
                Ok(node)
            });
        }
        if loc.len() > TRIAL_DEPTH {
            let trial_loc = loc.slice(TRIAL_DEPTH)?;
            return self.modify_trial(&trial_loc, false, |base, _| {
                get_or_create_in(base, &trial_loc, loc, node)
            });
        }
        let Some(parent) = loc.parent() else {
            return Ok(self.load_root()?.into());
        };
        let _parent_lock = self.lock_dir(&parent)?;
        if self.dir_of(loc).is_dir() {
            return self.load_node(loc);
        }
        let _lock = self.lock_dir(loc)?;
        self.store_locked(loc, &node, None)?;
        Ok(node)
    }

    fn append_child(&self, parent: &ScopedLocation, mut child: Dataclass) -> Result<Dataclass> {
        if parent.len() >= TRIAL_DEPTH {
            let trial_loc = parent.slice(TRIAL_DEPTH)?;
            return self.modify_trial(&trial_loc, false, |base, _| {
                append_child_in(base, &trial_loc, parent, child)
            });
        }
        let _parent_lock = self.lock_dir(parent)?;
        if parent.len() == TRIAL_DEPTH - 1 {
            let count = trial_numbers(&self.dir_of(parent))?.len();
            let loc = child_location(parent, &mut child, || Ok(count))?;
            self.modify_trial(&loc, true, |base, _| {
                put_under(base, &loc, &loc, child.clone())
            })?;
            return Ok(child);
        }
        let loc = child_location(parent, &mut child, || self.next_round_number(parent))?;
        if self.dir_of(&loc).is_dir() {
            return self.load_node(&loc);
        }
        let _lock = self.lock_dir(&loc)?;
        self.store_locked(&loc, &child, None)?;
        Ok(child)
    }

    fn append_log(&self, loc: &ScopedLocation, line: &str) -> Result<()> {
        let path = self.log_path(loc);
        if let Some(parent) = path.parent() {
            ensure_dir(parent)?;
        }
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let mut text = line.trim_end_matches('\n').to_string();
        text.push('\n');
        file.write_all(text.as_bytes())?;
        Ok(())
    }

    fn read_log(&self, loc: &ScopedLocation) -> Result<String> {
        match fs::read_to_string(self.log_path(loc)) {
            Ok(text) => Ok(text),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(String::new()),
            Err(e) => Err(e.into()),
        }
    }
}
