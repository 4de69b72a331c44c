//! The persisted experiment tree.
//!
//! `Root -> Project -> Client -> Round -> Trial -> TrialSplit -> MetricResults`.
//! Each level is a plain record keyed in its parent's collection; the
//! [`Dataclass`] sum type and the borrowed [`DataclassRef`] / [`DataclassMut`]
//! views give typed dispatch over "any level" when resolving a
//! [`ScopedLocation`].

use std::collections::BTreeMap;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{HpoError, Result};
use crate::lifecycle::{aggregate_status, Lifecycle, SplitFailurePolicy, TrialStatus};
use crate::location::{validate_level_id, DataclassKind, LevelId, ScopedLocation};

pub type HyperparameterSamples = BTreeMap<String, Value>;

/// Compares two scores in the direction given by `higher_score_is_better`.
#[must_use]
pub fn is_better(candidate: f64, reference: f64, higher_score_is_better: bool) -> bool {
    if higher_score_is_better {
        candidate > reference
    } else {
        candidate < reference
    }
}

fn best_of(values: &[f64], higher_score_is_better: bool) -> Option<f64> {
    values.iter().copied().reduce(|best, v| {
        if is_better(v, best, higher_score_is_better) {
            v
        } else {
            best
        }
    })
}

fn ensure_finite(metric_name: &str, value: f64) -> Result<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(HpoError::Serialization(format!(
            "metric `{metric_name}` received non-finite value {value}"
        )))
    }
}

fn expect_name(kind: DataclassKind, id: LevelId) -> Result<String> {
    validate_level_id(kind, &id)?;
    match id {
        LevelId::Name(name) => Ok(name),
        LevelId::Number(n) => Err(HpoError::InvalidLocation(format!(
            "{kind} expects a name, got {n}"
        ))),
    }
}

fn expect_number(kind: DataclassKind, id: LevelId) -> Result<usize> {
    validate_level_id(kind, &id)?;
    match id {
        LevelId::Number(n) => Ok(n),
        LevelId::Name(name) => Err(HpoError::InvalidLocation(format!(
            "{kind} expects a number, got `{name}`"
        ))),
    }
}

fn key_mismatch(kind: DataclassKind, key: &dyn std::fmt::Display, id: &LevelId) -> HpoError {
    HpoError::Serialization(format!(
        "{kind} stored under key `{key}` reports id `{id}`"
    ))
}

/// Numbered children live in dense vectors: slot `n` holds child `n`.
fn slot_or_push<T>(items: &mut Vec<T>, n: usize, make: impl FnOnce() -> T) -> Result<&mut T> {
    if n == items.len() {
        items.push(make());
    }
    let len = items.len();
    items.get_mut(n).ok_or_else(|| {
        HpoError::InvalidLocation(format!(
            "cannot create child {n}: only {len} siblings exist"
        ))
    })
}

/// Common surface of every level of the tree.
pub trait DataclassNode:
    Clone + PartialEq + Serialize + DeserializeOwned + Into<Dataclass> + Sized
{
    const KIND: DataclassKind;

    /// Key this node uses in its parent's collection. `None` for the root.
    fn get_id(&self) -> Option<LevelId>;

    fn set_id(&mut self, id: LevelId) -> Result<()>;

    /// Checks that every child is stored under its own id.
    fn validate_keys(&self) -> Result<()>;

    fn from_dataclass(dc: Dataclass) -> Result<Self>;

    fn from_dataclass_mut(dc: &mut Dataclass) -> Result<&mut Self>;

    fn to_dict(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn from_dict(value: Value) -> Result<Self> {
        let node: Self = serde_json::from_value(value)?;
        node.validate_keys()?;
        Ok(node)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricResultsDataclass {
    pub metric_name: String,
    #[serde(default)]
    pub validation_values: Vec<f64>,
    #[serde(default)]
    pub train_values: Vec<f64>,
    #[serde(default)]
    pub higher_score_is_better: bool,
}

impl MetricResultsDataclass {
    pub fn new(metric_name: impl Into<String>, higher_score_is_better: bool) -> Self {
        Self {
            metric_name: metric_name.into(),
            validation_values: Vec::new(),
            train_values: Vec::new(),
            higher_score_is_better,
        }
    }

    pub fn add_train_result(&mut self, value: f64) -> Result<()> {
        ensure_finite(&self.metric_name, value)?;
        self.train_values.push(value);
        Ok(())
    }

    pub fn add_validation_result(&mut self, value: f64) -> Result<()> {
        ensure_finite(&self.metric_name, value)?;
        self.validation_values.push(value);
        Ok(())
    }

    #[must_use]
    pub fn best_validation_score(&self) -> Option<f64> {
        best_of(&self.validation_values, self.higher_score_is_better)
    }

    #[must_use]
    pub fn best_train_score(&self) -> Option<f64> {
        best_of(&self.train_values, self.higher_score_is_better)
    }

    /// True when the latest validation value beats every earlier one.
    #[must_use]
    pub fn is_new_best_score(&self) -> bool {
        match self.validation_values.split_last() {
            None => false,
            Some((_, [])) => true,
            Some((last, earlier)) => best_of(earlier, self.higher_score_is_better)
                .is_some_and(|best| is_better(*last, best, self.higher_score_is_better)),
        }
    }
}

impl DataclassNode for MetricResultsDataclass {
    const KIND: DataclassKind = DataclassKind::MetricResults;

    fn get_id(&self) -> Option<LevelId> {
        Some(LevelId::Name(self.metric_name.clone()))
    }

    fn set_id(&mut self, id: LevelId) -> Result<()> {
        self.metric_name = expect_name(Self::KIND, id)?;
        Ok(())
    }

    fn validate_keys(&self) -> Result<()> {
        for v in self.train_values.iter().chain(&self.validation_values) {
            ensure_finite(&self.metric_name, *v)?;
        }
        Ok(())
    }

    fn from_dataclass(dc: Dataclass) -> Result<Self> {
        match dc {
            Dataclass::MetricResults(node) => Ok(node),
            other => Err(wrong_kind(Self::KIND, other.kind())),
        }
    }

    fn from_dataclass_mut(dc: &mut Dataclass) -> Result<&mut Self> {
        match dc {
            Dataclass::MetricResults(node) => Ok(node),
            other => Err(wrong_kind(Self::KIND, other.kind())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialSplitDataclass {
    pub split_number: usize,
    #[serde(flatten)]
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub metric_results: BTreeMap<String, MetricResultsDataclass>,
}

impl TrialSplitDataclass {
    #[must_use]
    pub fn new(split_number: usize) -> Self {
        Self {
            split_number,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn status(&self) -> TrialStatus {
        self.lifecycle.status
    }

    pub fn start(&mut self) -> Result<&mut Self> {
        self.lifecycle.start()?;
        Ok(self)
    }

    pub fn end(&mut self, outcome: TrialStatus) -> Result<&mut Self> {
        self.lifecycle.end(outcome)?;
        Ok(self)
    }

    #[must_use]
    pub fn metric_results(&self, metric_name: &str) -> Option<&MetricResultsDataclass> {
        self.metric_results.get(metric_name)
    }

    /// Get-or-create the results for `metric_name`; fails once the split ended.
    pub fn metric_results_mut(
        &mut self,
        metric_name: &str,
        higher_score_is_better: bool,
    ) -> Result<&mut MetricResultsDataclass> {
        self.lifecycle.ensure_mutable("record metrics on")?;
        validate_level_id(DataclassKind::MetricResults, &LevelId::from(metric_name))?;
        Ok(self
            .metric_results
            .entry(metric_name.to_string())
            .or_insert_with(|| MetricResultsDataclass::new(metric_name, higher_score_is_better)))
    }

    pub fn add_metric_results_train(
        &mut self,
        metric_name: &str,
        value: f64,
        higher_score_is_better: bool,
    ) -> Result<()> {
        self.metric_results_mut(metric_name, higher_score_is_better)?
            .add_train_result(value)
    }

    pub fn add_metric_results_validation(
        &mut self,
        metric_name: &str,
        value: f64,
        higher_score_is_better: bool,
    ) -> Result<()> {
        self.metric_results_mut(metric_name, higher_score_is_better)?
            .add_validation_result(value)
    }
}

impl DataclassNode for TrialSplitDataclass {
    const KIND: DataclassKind = DataclassKind::TrialSplit;

    fn get_id(&self) -> Option<LevelId> {
        Some(LevelId::Number(self.split_number))
    }

    fn set_id(&mut self, id: LevelId) -> Result<()> {
        self.split_number = expect_number(Self::KIND, id)?;
        Ok(())
    }

    fn validate_keys(&self) -> Result<()> {
        for (key, metric) in &self.metric_results {
            if key != &metric.metric_name {
                return Err(key_mismatch(
                    DataclassKind::MetricResults,
                    key,
                    &LevelId::from(metric.metric_name.as_str()),
                ));
            }
            metric.validate_keys()?;
        }
        Ok(())
    }

    fn from_dataclass(dc: Dataclass) -> Result<Self> {
        match dc {
            Dataclass::TrialSplit(node) => Ok(node),
            other => Err(wrong_kind(Self::KIND, other.kind())),
        }
    }

    fn from_dataclass_mut(dc: &mut Dataclass) -> Result<&mut Self> {
        match dc {
            Dataclass::TrialSplit(node) => Ok(node),
            other => Err(wrong_kind(Self::KIND, other.kind())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialDataclass {
    pub trial_number: usize,
    #[serde(default)]
    pub hyperparams: HyperparameterSamples,
    #[serde(flatten)]
    pub lifecycle: Lifecycle,
    #[serde(default)]
    pub validation_splits: Vec<TrialSplitDataclass>,
}

impl TrialDataclass {
    #[must_use]
    pub fn new(trial_number: usize, hyperparams: HyperparameterSamples) -> Self {
        Self {
            trial_number,
            hyperparams,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn status(&self) -> TrialStatus {
        self.lifecycle.status
    }

    pub fn start(&mut self) -> Result<&mut Self> {
        self.lifecycle.start()?;
        Ok(self)
    }

    pub fn end(&mut self, outcome: TrialStatus) -> Result<&mut Self> {
        self.lifecycle.end(outcome)?;
        Ok(self)
    }

    /// Appends a PLANNED split numbered after the existing ones.
    pub fn new_split(&mut self) -> Result<&mut TrialSplitDataclass> {
        self.lifecycle.ensure_mutable("add a split to")?;
        let n = self.validation_splits.len();
        slot_or_push(&mut self.validation_splits, n, || TrialSplitDataclass::new(n))
    }

    #[must_use]
    pub fn split(&self, split_number: usize) -> Option<&TrialSplitDataclass> {
        self.validation_splits.get(split_number)
    }

    /// Mean over splits of each split's best validation value.
    #[must_use]
    pub fn validation_score(&self, metric_name: &str) -> Option<f64> {
        let scores: Vec<f64> = self
            .validation_splits
            .iter()
            .filter_map(|s| s.metric_results(metric_name))
            .filter_map(MetricResultsDataclass::best_validation_score)
            .collect();
        if scores.is_empty() {
            return None;
        }
        Some(scores.iter().sum::<f64>() / scores.len() as f64)
    }

    /// Direction recorded by the first split that reported `metric_name`.
    #[must_use]
    pub fn higher_score_is_better(&self, metric_name: &str) -> Option<bool> {
        self.validation_splits
            .iter()
            .find_map(|s| s.metric_results(metric_name))
            .map(|m| m.higher_score_is_better)
    }

    #[must_use]
    pub fn aggregate_status(&self, policy: SplitFailurePolicy) -> TrialStatus {
        aggregate_status(self.validation_splits.iter().map(TrialSplitDataclass::status), policy)
    }
}

impl DataclassNode for TrialDataclass {
    const KIND: DataclassKind = DataclassKind::Trial;

    fn get_id(&self) -> Option<LevelId> {
        Some(LevelId::Number(self.trial_number))
    }

    fn set_id(&mut self, id: LevelId) -> Result<()> {
        self.trial_number = expect_number(Self::KIND, id)?;
        Ok(())
    }

    fn validate_keys(&self) -> Result<()> {
        for (i, split) in self.validation_splits.iter().enumerate() {
            if split.split_number != i {
                return Err(key_mismatch(
                    DataclassKind::TrialSplit,
                    &i,
                    &LevelId::Number(split.split_number),
                ));
            }
            split.validate_keys()?;
        }
        Ok(())
    }

    fn from_dataclass(dc: Dataclass) -> Result<Self> {
        match dc {
            Dataclass::Trial(node) => Ok(node),
            other => Err(wrong_kind(Self::KIND, other.kind())),
        }
    }

    fn from_dataclass_mut(dc: &mut Dataclass) -> Result<&mut Self> {
        match dc {
            Dataclass::Trial(node) => Ok(node),
            other => Err(wrong_kind(Self::KIND, other.kind())),
        }
    }
}

/// One row of a round summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankedTrial {
    pub score: f64,
    pub trial_number: usize,
    pub hyperparams: HyperparameterSamples,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundDataclass {
    pub round_number: usize,
    #[serde(default)]
    pub trials: Vec<TrialDataclass>,
}

impl RoundDataclass {
    #[must_use]
    pub fn new(round_number: usize) -> Self {
        Self {
            round_number,
            trials: Vec::new(),
        }
    }

    /// Appends a PLANNED trial numbered after the existing ones.
    pub fn new_trial(&mut self, hyperparams: HyperparameterSamples) -> &mut TrialDataclass {
        let n = self.trials.len();
        self.trials.push(TrialDataclass::new(n, hyperparams));
        &mut self.trials[n]
    }

    #[must_use]
    pub fn trial(&self, trial_number: usize) -> Option<&TrialDataclass> {
        self.trials.get(trial_number)
    }

    /// Successful trials ranked best-first on `metric_name`; ties go to the
    /// lower trial number.
    #[must_use]
    pub fn summary(&self, metric_name: &str) -> Vec<RankedTrial> {
        let higher_score_is_better = self
            .trials
            .iter()
            .find_map(|t| t.higher_score_is_better(metric_name))
            .unwrap_or(false);
        let mut ranked: Vec<RankedTrial> = self
            .trials
            .iter()
            .filter(|t| t.status() == TrialStatus::Success)
            .filter_map(|t| {
                t.validation_score(metric_name).map(|score| RankedTrial {
                    score,
                    trial_number: t.trial_number,
                    hyperparams: t.hyperparams.clone(),
                })
            })
            .collect();
        ranked.sort_by(|a, b| {
            let by_score = if higher_score_is_better {
                b.score.total_cmp(&a.score)
            } else {
                a.score.total_cmp(&b.score)
            };
            by_score.then(a.trial_number.cmp(&b.trial_number))
        });
        ranked
    }
}

impl DataclassNode for RoundDataclass {
    const KIND: DataclassKind = DataclassKind::Round;

    fn get_id(&self) -> Option<LevelId> {
        Some(LevelId::Number(self.round_number))
    }

    fn set_id(&mut self, id: LevelId) -> Result<()> {
        self.round_number = expect_number(Self::KIND, id)?;
        Ok(())
    }

    fn validate_keys(&self) -> Result<()> {
        for (i, trial) in self.trials.iter().enumerate() {
            if trial.trial_number != i {
                return Err(key_mismatch(
                    DataclassKind::Trial,
                    &i,
                    &LevelId::Number(trial.trial_number),
                ));
            }
            trial.validate_keys()?;
        }
        Ok(())
    }

    fn from_dataclass(dc: Dataclass) -> Result<Self> {
        match dc {
            Dataclass::Round(node) => Ok(node),
            other => Err(wrong_kind(Self::KIND, other.kind())),
        }
    }

    fn from_dataclass_mut(dc: &mut Dataclass) -> Result<&mut Self> {
        match dc {
            Dataclass::Round(node) => Ok(node),
            other => Err(wrong_kind(Self::KIND, other.kind())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientDataclass {
    pub client_name: String,
    #[serde(default)]
    pub main_metric_name: Option<String>,
    #[serde(default)]
    pub rounds: BTreeMap<usize, RoundDataclass>,
}

impl ClientDataclass {
    pub fn new(client_name: impl Into<String>) -> Self {
        Self {
            client_name: client_name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_main_metric(mut self, metric_name: impl Into<String>) -> Self {
        self.main_metric_name = Some(metric_name.into());
        self
    }

    #[must_use]
    pub fn next_round_number(&self) -> usize {
        self.rounds.keys().next_back().map_or(0, |n| n + 1)
    }

    #[must_use]
    pub fn last_round(&self) -> Option<&RoundDataclass> {
        self.rounds.values().next_back()
    }
}

impl DataclassNode for ClientDataclass {
    const KIND: DataclassKind = DataclassKind::Client;

    fn get_id(&self) -> Option<LevelId> {
        Some(LevelId::Name(self.client_name.clone()))
    }

    fn set_id(&mut self, id: LevelId) -> Result<()> {
        self.client_name = expect_name(Self::KIND, id)?;
        Ok(())
    }

    fn validate_keys(&self) -> Result<()> {
        for (key, round) in &self.rounds {
            if *key != round.round_number {
                return Err(key_mismatch(
                    DataclassKind::Round,
                    key,
                    &LevelId::Number(round.round_number),
                ));
            }
            round.validate_keys()?;
        }
        Ok(())
    }

    fn from_dataclass(dc: Dataclass) -> Result<Self> {
        match dc {
            Dataclass::Client(node) => Ok(node),
            other => Err(wrong_kind(Self::KIND, other.kind())),
        }
    }

    fn from_dataclass_mut(dc: &mut Dataclass) -> Result<&mut Self> {
        match dc {
            Dataclass::Client(node) => Ok(node),
            other => Err(wrong_kind(Self::KIND, other.kind())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectDataclass {
    pub project_name: String,
    #[serde(default)]
    pub clients: BTreeMap<String, ClientDataclass>,
}

impl ProjectDataclass {
    pub fn new(project_name: impl Into<String>) -> Self {
        Self {
            project_name: project_name.into(),
            clients: BTreeMap::new(),
        }
    }
}

impl DataclassNode for ProjectDataclass {
    const KIND: DataclassKind = DataclassKind::Project;

    fn get_id(&self) -> Option<LevelId> {
        Some(LevelId::Name(self.project_name.clone()))
    }

    fn set_id(&mut self, id: LevelId) -> Result<()> {
        self.project_name = expect_name(Self::KIND, id)?;
        Ok(())
    }

    fn validate_keys(&self) -> Result<()> {
        for (key, client) in &self.clients {
            if key != &client.client_name {
                return Err(key_mismatch(
                    DataclassKind::Client,
                    key,
                    &LevelId::from(client.client_name.as_str()),
                ));
            }
            client.validate_keys()?;
        }
        Ok(())
    }

    fn from_dataclass(dc: Dataclass) -> Result<Self> {
        match dc {
            Dataclass::Project(node) => Ok(node),
            other => Err(wrong_kind(Self::KIND, other.kind())),
        }
    }

    fn from_dataclass_mut(dc: &mut Dataclass) -> Result<&mut Self> {
        match dc {
            Dataclass::Project(node) => Ok(node),
            other => Err(wrong_kind(Self::KIND, other.kind())),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RootDataclass {
    #[serde(default)]
    pub projects: BTreeMap<String, ProjectDataclass>,
}

impl RootDataclass {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves `loc` strictly: a missing intermediate key is `NotFound`.
    pub fn resolve(&self, loc: &ScopedLocation) -> Result<DataclassRef<'_>> {
        let mut node = DataclassRef::Root(self);
        for (depth, id) in loc.ids().iter().enumerate() {
            node = node.child(id).ok_or_else(|| {
                let reached = loc.slice(depth).unwrap_or_default();
                HpoError::NotFound(format!("no child `{id}` under {reached} (resolving {loc})"))
            })?;
        }
        Ok(node)
    }

    #[must_use]
    pub fn contains(&self, loc: &ScopedLocation) -> bool {
        self.resolve(loc).is_ok()
    }

    /// Walks to `loc`, creating missing nodes with default content.
    pub fn get_or_create_mut(&mut self, loc: &ScopedLocation) -> Result<DataclassMut<'_>> {
        let mut node = DataclassMut::Root(self);
        for id in loc.ids() {
            node = node.child_or_create(id)?;
        }
        Ok(node)
    }

    /// Stores `node` at `loc`, replacing what was there. See [`put_under`].
    pub fn put(&mut self, loc: &ScopedLocation, node: Dataclass) -> Result<()> {
        put_under(DataclassMut::Root(self), &ScopedLocation::root(), loc, node)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Self::from_dict(serde_json::from_str(text)?)
    }
}

impl DataclassNode for RootDataclass {
    const KIND: DataclassKind = DataclassKind::Root;

    fn get_id(&self) -> Option<LevelId> {
        None
    }

    fn set_id(&mut self, id: LevelId) -> Result<()> {
        Err(HpoError::InvalidLocation(format!(
            "the root has no identifier, cannot set `{id}`"
        )))
    }

    fn validate_keys(&self) -> Result<()> {
        for (key, project) in &self.projects {
            if key != &project.project_name {
                return Err(key_mismatch(
                    DataclassKind::Project,
                    key,
                    &LevelId::from(project.project_name.as_str()),
                ));
            }
            project.validate_keys()?;
        }
        Ok(())
    }

    fn from_dataclass(dc: Dataclass) -> Result<Self> {
        match dc {
            Dataclass::Root(node) => Ok(node),
            other => Err(wrong_kind(Self::KIND, other.kind())),
        }
    }

    fn from_dataclass_mut(dc: &mut Dataclass) -> Result<&mut Self> {
        match dc {
            Dataclass::Root(node) => Ok(node),
            other => Err(wrong_kind(Self::KIND, other.kind())),
        }
    }
}

fn wrong_kind(expected: DataclassKind, found: DataclassKind) -> HpoError {
    HpoError::InvalidLocation(format!("expected a {expected}, found a {found}"))
}

/// Any level of the tree, owned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dataclass {
    Root(RootDataclass),
    Project(ProjectDataclass),
    Client(ClientDataclass),
    Round(RoundDataclass),
    Trial(TrialDataclass),
    TrialSplit(TrialSplitDataclass),
    MetricResults(MetricResultsDataclass),
}

macro_rules! dataclass_from {
    ($($variant:ident => $ty:ty),* $(,)?) => {
        $(
            impl From<$ty> for Dataclass {
                fn from(node: $ty) -> Self {
                    Self::$variant(node)
                }
            }
        )*
    };
}

dataclass_from! {
    Root => RootDataclass,
    Project => ProjectDataclass,
    Client => ClientDataclass,
    Round => RoundDataclass,
    Trial => TrialDataclass,
    TrialSplit => TrialSplitDataclass,
    MetricResults => MetricResultsDataclass,
}

impl Dataclass {
    /// Empty node of `kind` carrying `id`.
    pub fn empty(kind: DataclassKind, id: Option<LevelId>) -> Result<Self> {
        let mut node = match kind {
            DataclassKind::Root => return Ok(Self::Root(RootDataclass::new())),
            DataclassKind::Project => Self::Project(ProjectDataclass::default()),
            DataclassKind::Client => Self::Client(ClientDataclass::default()),
            DataclassKind::Round => Self::Round(RoundDataclass::default()),
            DataclassKind::Trial => Self::Trial(TrialDataclass::default()),
            DataclassKind::TrialSplit => Self::TrialSplit(TrialSplitDataclass::default()),
            DataclassKind::MetricResults => {
                Self::MetricResults(MetricResultsDataclass::new(String::new(), false))
            }
        };
        let id = id.ok_or_else(|| {
            HpoError::InvalidLocation(format!("a {kind} needs an identifier"))
        })?;
        node.set_id(id)?;
        Ok(node)
    }

    /// Empty node matching the last level of `loc`.
    pub fn empty_at(loc: &ScopedLocation) -> Result<Self> {
        Self::empty(loc.kind(), loc.last().cloned())
    }

    #[must_use]
    pub fn kind(&self) -> DataclassKind {
        self.view().kind()
    }

    #[must_use]
    pub fn get_id(&self) -> Option<LevelId> {
        self.view().get_id()
    }

    pub fn set_id(&mut self, id: LevelId) -> Result<()> {
        match self {
            Self::Root(n) => n.set_id(id),
            Self::Project(n) => n.set_id(id),
            Self::Client(n) => n.set_id(id),
            Self::Round(n) => n.set_id(id),
            Self::Trial(n) => n.set_id(id),
            Self::TrialSplit(n) => n.set_id(id),
            Self::MetricResults(n) => n.set_id(id),
        }
    }

    pub fn validate_keys(&self) -> Result<()> {
        match self {
            Self::Root(n) => n.validate_keys(),
            Self::Project(n) => n.validate_keys(),
            Self::Client(n) => n.validate_keys(),
            Self::Round(n) => n.validate_keys(),
            Self::Trial(n) => n.validate_keys(),
            Self::TrialSplit(n) => n.validate_keys(),
            Self::MetricResults(n) => n.validate_keys(),
        }
    }

    #[must_use]
    pub fn view(&self) -> DataclassRef<'_> {
        match self {
            Self::Root(n) => DataclassRef::Root(n),
            Self::Project(n) => DataclassRef::Project(n),
            Self::Client(n) => DataclassRef::Client(n),
            Self::Round(n) => DataclassRef::Round(n),
            Self::Trial(n) => DataclassRef::Trial(n),
            Self::TrialSplit(n) => DataclassRef::TrialSplit(n),
            Self::MetricResults(n) => DataclassRef::MetricResults(n),
        }
    }

    pub fn view_mut(&mut self) -> DataclassMut<'_> {
        match self {
            Self::Root(n) => DataclassMut::Root(n),
            Self::Project(n) => DataclassMut::Project(n),
            Self::Client(n) => DataclassMut::Client(n),
            Self::Round(n) => DataclassMut::Round(n),
            Self::Trial(n) => DataclassMut::Trial(n),
            Self::TrialSplit(n) => DataclassMut::TrialSplit(n),
            Self::MetricResults(n) => DataclassMut::MetricResults(n),
        }
    }

    /// Unwraps into the concrete level type `T`.
    pub fn into_node<T: DataclassNode>(self) -> Result<T> {
        T::from_dataclass(self)
    }

    pub fn to_dict(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_dict(value: Value) -> Result<Self> {
        let node: Self = serde_json::from_value(value)?;
        node.validate_keys()?;
        Ok(node)
    }
}

/// Any level of the tree, borrowed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DataclassRef<'a> {
    Root(&'a RootDataclass),
    Project(&'a ProjectDataclass),
    Client(&'a ClientDataclass),
    Round(&'a RoundDataclass),
    Trial(&'a TrialDataclass),
    TrialSplit(&'a TrialSplitDataclass),
    MetricResults(&'a MetricResultsDataclass),
}

impl<'a> DataclassRef<'a> {
    #[must_use]
    pub fn kind(&self) -> DataclassKind {
        match self {
            Self::Root(_) => DataclassKind::Root,
            Self::Project(_) => DataclassKind::Project,
            Self::Client(_) => DataclassKind::Client,
            Self::Round(_) => DataclassKind::Round,
            Self::Trial(_) => DataclassKind::Trial,
            Self::TrialSplit(_) => DataclassKind::TrialSplit,
            Self::MetricResults(_) => DataclassKind::MetricResults,
        }
    }

    #[must_use]
    pub fn get_id(&self) -> Option<LevelId> {
        match self {
            Self::Root(n) => n.get_id(),
            Self::Project(n) => n.get_id(),
            Self::Client(n) => n.get_id(),
            Self::Round(n) => n.get_id(),
            Self::Trial(n) => n.get_id(),
            Self::TrialSplit(n) => n.get_id(),
            Self::MetricResults(n) => n.get_id(),
        }
    }

    #[must_use]
    pub fn lifecycle(&self) -> Option<&'a Lifecycle> {
        match self {
            Self::Trial(n) => Some(&n.lifecycle),
            Self::TrialSplit(n) => Some(&n.lifecycle),
            _ => None,
        }
    }

    #[must_use]
    pub fn child(&self, id: &LevelId) -> Option<DataclassRef<'a>> {
        match (self, id) {
            (Self::Root(n), LevelId::Name(name)) => n.projects.get(name).map(DataclassRef::Project),
            (Self::Project(n), LevelId::Name(name)) => n.clients.get(name).map(DataclassRef::Client),
            (Self::Client(n), LevelId::Number(i)) => n.rounds.get(i).map(DataclassRef::Round),
            (Self::Round(n), LevelId::Number(i)) => n.trials.get(*i).map(DataclassRef::Trial),
            (Self::Trial(n), LevelId::Number(i)) => {
                n.validation_splits.get(*i).map(DataclassRef::TrialSplit)
            }
            (Self::TrialSplit(n), LevelId::Name(name)) => {
                n.metric_results.get(name).map(DataclassRef::MetricResults)
            }
            _ => None,
        }
    }

    /// Follows `ids` down from this node.
    #[must_use]
    pub fn descend(self, ids: &[LevelId]) -> Option<DataclassRef<'a>> {
        ids.iter().try_fold(self, |node, id| node.child(id))
    }

    /// Ids of the direct children, in storage order.
    #[must_use]
    pub fn child_ids(&self) -> Vec<LevelId> {
        match self {
            Self::Root(n) => n.projects.keys().cloned().map(LevelId::Name).collect(),
            Self::Project(n) => n.clients.keys().cloned().map(LevelId::Name).collect(),
            Self::Client(n) => n.rounds.keys().copied().map(LevelId::Number).collect(),
            Self::Round(n) => (0..n.trials.len()).map(LevelId::Number).collect(),
            Self::Trial(n) => (0..n.validation_splits.len()).map(LevelId::Number).collect(),
            Self::TrialSplit(n) => n.metric_results.keys().cloned().map(LevelId::Name).collect(),
            Self::MetricResults(_) => Vec::new(),
        }
    }

    /// Number the next appended numbered child would get.
    #[must_use]
    pub fn next_child_number(&self) -> usize {
        self.child_ids()
            .iter()
            .filter_map(LevelId::as_number)
            .max()
            .map_or(0, |n| n + 1)
    }

    #[must_use]
    pub fn to_dataclass(&self) -> Dataclass {
        match self {
            Self::Root(n) => Dataclass::Root((*n).clone()),
            Self::Project(n) => Dataclass::Project((*n).clone()),
            Self::Client(n) => Dataclass::Client((*n).clone()),
            Self::Round(n) => Dataclass::Round((*n).clone()),
            Self::Trial(n) => Dataclass::Trial((*n).clone()),
            Self::TrialSplit(n) => Dataclass::TrialSplit((*n).clone()),
            Self::MetricResults(n) => Dataclass::MetricResults((*n).clone()),
        }
    }
}

/// Any level of the tree, mutably borrowed.
#[derive(Debug)]
pub enum DataclassMut<'a> {
    Root(&'a mut RootDataclass),
    Project(&'a mut ProjectDataclass),
    Client(&'a mut ClientDataclass),
    Round(&'a mut RoundDataclass),
    Trial(&'a mut TrialDataclass),
    TrialSplit(&'a mut TrialSplitDataclass),
    MetricResults(&'a mut MetricResultsDataclass),
}

impl<'a> DataclassMut<'a> {
    #[must_use]
    pub fn view(&self) -> DataclassRef<'_> {
        match self {
            Self::Root(n) => DataclassRef::Root(&**n),
            Self::Project(n) => DataclassRef::Project(&**n),
            Self::Client(n) => DataclassRef::Client(&**n),
            Self::Round(n) => DataclassRef::Round(&**n),
            Self::Trial(n) => DataclassRef::Trial(&**n),
            Self::TrialSplit(n) => DataclassRef::TrialSplit(&**n),
            Self::MetricResults(n) => DataclassRef::MetricResults(&**n),
        }
    }

    /// Descends to child `id`, creating it when absent.
    pub fn child_or_create(self, id: &LevelId) -> Result<DataclassMut<'a>> {
        let child_kind = match &self {
            Self::Root(_) => DataclassKind::Project,
            Self::Project(_) => DataclassKind::Client,
            Self::Client(_) => DataclassKind::Round,
            Self::Round(_) => DataclassKind::Trial,
            Self::Trial(_) => DataclassKind::TrialSplit,
            Self::TrialSplit(_) => DataclassKind::MetricResults,
            Self::MetricResults(_) => {
                return Err(HpoError::InvalidLocation(
                    "metric results have no children".to_string(),
                ))
            }
        };
        validate_level_id(child_kind, id)?;
        match (self, id) {
            (Self::Root(n), LevelId::Name(name)) => Ok(Self::Project(
                n.projects
                    .entry(name.clone())
                    .or_insert_with(|| ProjectDataclass::new(name.clone())),
            )),
            (Self::Project(n), LevelId::Name(name)) => Ok(Self::Client(
                n.clients
                    .entry(name.clone())
                    .or_insert_with(|| ClientDataclass::new(name.clone())),
            )),
            (Self::Client(n), LevelId::Number(i)) => Ok(Self::Round(
                n.rounds.entry(*i).or_insert_with(|| RoundDataclass::new(*i)),
            )),
            (Self::Round(n), LevelId::Number(i)) => {
                let i = *i;
                slot_or_push(&mut n.trials, i, || {
                    TrialDataclass::new(i, HyperparameterSamples::new())
                })
                .map(Self::Trial)
            }
            (Self::Trial(n), LevelId::Number(i)) => {
                let i = *i;
                if i >= n.validation_splits.len() {
                    n.lifecycle.ensure_mutable("add a split to")?;
                }
                slot_or_push(&mut n.validation_splits, i, || TrialSplitDataclass::new(i))
                    .map(Self::TrialSplit)
            }
            (Self::TrialSplit(n), LevelId::Name(name)) => {
                if !n.metric_results.contains_key(name) {
                    n.lifecycle.ensure_mutable("record metrics on")?;
                }
                Ok(Self::MetricResults(
                    n.metric_results
                        .entry(name.clone())
                        .or_insert_with(|| MetricResultsDataclass::new(name.clone(), false)),
                ))
            }
            (_, other) => Err(HpoError::InvalidLocation(format!(
                "`{other}` is not a valid {child_kind} identifier"
            ))),
        }
    }

    fn replace(self, node: Dataclass) -> Result<()> {
        match (self, node) {
            (Self::Root(slot), Dataclass::Root(n)) => *slot = n,
            (Self::Project(slot), Dataclass::Project(n)) => *slot = n,
            (Self::Client(slot), Dataclass::Client(n)) => *slot = n,
            (Self::Round(slot), Dataclass::Round(n)) => *slot = n,
            (Self::Trial(slot), Dataclass::Trial(n)) => *slot = n,
            (Self::TrialSplit(slot), Dataclass::TrialSplit(n)) => *slot = n,
            (Self::MetricResults(slot), Dataclass::MetricResults(n)) => *slot = n,
            (_, n) => {
                return Err(HpoError::InvalidLocation(format!(
                    "slot does not hold a {}",
                    n.kind()
                )))
            }
        }
        Ok(())
    }
}

/// Checks that `node` has the kind and id `loc` expects.
pub fn check_placement(loc: &ScopedLocation, node: &Dataclass) -> Result<()> {
    if node.kind() != loc.kind() {
        return Err(HpoError::InvalidLocation(format!(
            "cannot store a {} at {} which addresses a {}",
            node.kind(),
            loc,
            loc.kind()
        )));
    }
    if node.get_id().as_ref() != loc.last() {
        return Err(HpoError::InvalidLocation(format!(
            "{} with id `{}` cannot be stored at {}",
            node.kind(),
            node.get_id().map(|id| id.to_string()).unwrap_or_default(),
            loc
        )));
    }
    Ok(())
}

/// Stores `node` at `loc` inside the subtree `base`, which sits at `base_loc`.
///
/// Missing nodes between `base` and `loc` are created. The replacement may
/// only add history: ended trials and splits stay identical, children are
/// never dropped and metric sequences only grow.
pub fn put_under(
    base: DataclassMut<'_>,
    base_loc: &ScopedLocation,
    loc: &ScopedLocation,
    node: Dataclass,
) -> Result<()> {
    check_placement(loc, &node)?;
    if !base_loc.is_ancestor_or_equal(loc) {
        return Err(HpoError::InvalidLocation(format!(
            "{loc} is not inside {base_loc}"
        )));
    }
    node.validate_keys()?;
    let rel = &loc.ids()[base_loc.len()..];
    {
        let view = base.view();
        if let Some(existing) = view.descend(rel) {
            if existing == node.view() {
                return Ok(());
            }
            preserves_history(loc, existing, node.view())?;
        }
        for depth in 0..rel.len() {
            let Some(ancestor) = view.descend(&rel[..depth]) else {
                break;
            };
            if let Some(lc) = ancestor.lifecycle() {
                lc.ensure_mutable("modify a child of")?;
            }
        }
    }
    let mut slot = base;
    for id in rel {
        slot = slot.child_or_create(id)?;
    }
    slot.replace(node)
}

fn preserves_history(loc: &ScopedLocation, old: DataclassRef<'_>, new: DataclassRef<'_>) -> Result<()> {
    if let (Some(old_lc), true) = (old.lifecycle(), old != new) {
        old_lc.ensure_mutable("rewrite")?;
    }
    if let (DataclassRef::MetricResults(o), DataclassRef::MetricResults(n)) = (old, new) {
        if !n.train_values.starts_with(&o.train_values)
            || !n.validation_values.starts_with(&o.validation_values)
        {
            return Err(HpoError::InvalidLocation(format!(
                "{loc} would truncate recorded metric values"
            )));
        }
        return Ok(());
    }
    for id in old.child_ids() {
        let old_child = old.child(&id).ok_or_else(|| {
            HpoError::NotFound(format!("child `{id}` vanished under {loc}"))
        })?;
        let new_child = new.child(&id).ok_or_else(|| {
            HpoError::InvalidLocation(format!(
                "{loc} would drop existing {} `{id}`",
                old_child.kind()
            ))
        })?;
        if old_child != new_child {
            preserves_history(&loc.push(id.clone())?, old_child, new_child)?;
        }
    }
    Ok(())
}

pub fn to_json(value: &Value) -> Result<String> {
    Ok(serde_json::to_string_pretty(value)?)
}

pub fn from_json(text: &str) -> Result<Value> {
    Ok(serde_json::from_str(text)?)
}
