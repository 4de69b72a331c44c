//! Typed, prefix-shaped addresses into the experiment tree.
//!
//! A [`ScopedLocation`] holds at most six identifiers, one per level below
//! the root: project name, client name, round number, trial number, split
//! number and metric name. Level *k* is only ever present when every level
//! before it is present, so a location is always a path from the root.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{HpoError, Result};

pub const DEFAULT_PROJECT: &str = "default_project";
pub const DEFAULT_CLIENT: &str = "default_client";
pub const MAX_DEPTH: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataclassKind {
    Root,
    Project,
    Client,
    Round,
    Trial,
    TrialSplit,
    MetricResults,
}

impl DataclassKind {
    pub const ALL: [Self; 7] = [
        Self::Root,
        Self::Project,
        Self::Client,
        Self::Round,
        Self::Trial,
        Self::TrialSplit,
        Self::MetricResults,
    ];

    #[must_use]
    pub fn depth(self) -> usize {
        match self {
            Self::Root => 0,
            Self::Project => 1,
            Self::Client => 2,
            Self::Round => 3,
            Self::Trial => 4,
            Self::TrialSplit => 5,
            Self::MetricResults => 6,
        }
    }

    #[must_use]
    pub fn from_depth(depth: usize) -> Option<Self> {
        Self::ALL.get(depth).copied()
    }

    #[must_use]
    pub fn child(self) -> Option<Self> {
        Self::from_depth(self.depth() + 1)
    }

    #[must_use]
    pub fn parent(self) -> Option<Self> {
        self.depth().checked_sub(1).and_then(Self::from_depth)
    }

    /// Rounds, trials and splits are keyed by their position among siblings.
    #[must_use]
    pub fn is_numbered(self) -> bool {
        matches!(self, Self::Round | Self::Trial | Self::TrialSplit)
    }

    /// Name of the field holding the key a node uses in its parent.
    #[must_use]
    pub fn id_attr(self) -> Option<&'static str> {
        match self {
            Self::Root => None,
            Self::Project => Some("project_name"),
            Self::Client => Some("client_name"),
            Self::Round => Some("round_number"),
            Self::Trial => Some("trial_number"),
            Self::TrialSplit => Some("split_number"),
            Self::MetricResults => Some("metric_name"),
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Project => "project",
            Self::Client => "client",
            Self::Round => "round",
            Self::Trial => "trial",
            Self::TrialSplit => "trial_split",
            Self::MetricResults => "metric_results",
        }
    }
}

impl fmt::Display for DataclassKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One identifier inside a location.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LevelId {
    Number(usize),
    Name(String),
}

impl LevelId {
    #[must_use]
    pub fn as_name(&self) -> Option<&str> {
        match self {
            Self::Name(name) => Some(name),
            Self::Number(_) => None,
        }
    }

    #[must_use]
    pub fn as_number(&self) -> Option<usize> {
        match self {
            Self::Number(n) => Some(*n),
            Self::Name(_) => None,
        }
    }
}

impl fmt::Display for LevelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::Name(name) => f.write_str(name),
        }
    }
}

impl From<usize> for LevelId {
    fn from(value: usize) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for LevelId {
    fn from(value: &str) -> Self {
        Self::Name(value.to_string())
    }
}

impl From<String> for LevelId {
    fn from(value: String) -> Self {
        Self::Name(value)
    }
}

/// Checks that `id` may be stored at the level addressed by `kind`.
pub fn validate_level_id(kind: DataclassKind, id: &LevelId) -> Result<()> {
    match (kind, id) {
        (DataclassKind::Root, _) => Err(HpoError::InvalidLocation(
            "the root has no identifier".to_string(),
        )),
        (k, LevelId::Number(_)) if k.is_numbered() => Ok(()),
        (k, LevelId::Name(name)) if !k.is_numbered() => validate_name(k, name),
        (k, other) => Err(HpoError::InvalidLocation(format!(
            "{} expects a {} identifier, got `{}`",
            k,
            if k.is_numbered() { "numeric" } else { "named" },
            other
        ))),
    }
}

fn validate_name(kind: DataclassKind, name: &str) -> Result<()> {
    if name.is_empty() || name.starts_with('.') || name.contains(['/', '\\']) {
        return Err(HpoError::InvalidLocation(format!(
            "invalid {} name: `{}`",
            kind, name
        )));
    }
    Ok(())
}

/// Optional, per-level view of a location, used when levels come from
/// independent sources (CLI flags, partial configs).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocationParts {
    pub project_name: Option<String>,
    pub client_name: Option<String>,
    pub round_number: Option<usize>,
    pub trial_number: Option<usize>,
    pub split_number: Option<usize>,
    pub metric_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ScopedLocation {
    ids: Vec<LevelId>,
}

impl ScopedLocation {
    /// The empty location, which addresses the root.
    #[must_use]
    pub fn root() -> Self {
        Self::default()
    }

    pub fn from_ids<I>(ids: I) -> Result<Self>
    where
        I: IntoIterator<Item = LevelId>,
    {
        ids.into_iter()
            .try_fold(Self::root(), |loc, id| loc.push(id))
    }

    /// `default_project/default_client` followed by up to four numeric levels.
    pub fn default_path(numbers: &[usize]) -> Result<Self> {
        let mut ids = vec![LevelId::from(DEFAULT_PROJECT), LevelId::from(DEFAULT_CLIENT)];
        ids.extend(numbers.iter().copied().map(LevelId::Number));
        Self::from_ids(ids)
    }

    /// Returns a new location one level deeper; `self` is left untouched.
    pub fn push(&self, id: impl Into<LevelId>) -> Result<Self> {
        let id = id.into();
        let kind = DataclassKind::from_depth(self.ids.len() + 1).ok_or_else(|| {
            HpoError::InvalidLocation(format!("{self} is already at max depth {MAX_DEPTH}"))
        })?;
        validate_level_id(kind, &id)?;
        let mut ids = self.ids.clone();
        ids.push(id);
        Ok(Self { ids })
    }

    pub fn pop(&mut self) -> Result<LevelId> {
        self.ids
            .pop()
            .ok_or_else(|| HpoError::InvalidLocation("cannot pop the root location".to_string()))
    }

    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        let (_, head) = self.ids.split_last()?;
        Some(Self { ids: head.to_vec() })
    }

    /// Prefix of length `depth`.
    pub fn slice(&self, depth: usize) -> Result<Self> {
        if depth > self.ids.len() {
            return Err(HpoError::InvalidLocation(format!(
                "cannot slice {} (depth {}) to depth {}",
                self,
                self.ids.len(),
                depth
            )));
        }
        Ok(Self {
            ids: self.ids[..depth].to_vec(),
        })
    }

    /// Prefix ending at the level of `kind`.
    pub fn slice_to(&self, kind: DataclassKind) -> Result<Self> {
        self.slice(kind.depth())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    /// Kind of the node this location addresses.
    #[must_use]
    pub fn kind(&self) -> DataclassKind {
        DataclassKind::from_depth(self.ids.len()).unwrap_or(DataclassKind::MetricResults)
    }

    #[must_use]
    pub fn ids(&self) -> &[LevelId] {
        &self.ids
    }

    #[must_use]
    pub fn last(&self) -> Option<&LevelId> {
        self.ids.last()
    }

    /// Identifier stored at the level of `kind`, if the location reaches it.
    #[must_use]
    pub fn get(&self, kind: DataclassKind) -> Option<&LevelId> {
        kind.depth().checked_sub(1).and_then(|i| self.ids.get(i))
    }

    #[must_use]
    pub fn project_name(&self) -> Option<&str> {
        self.get(DataclassKind::Project).and_then(LevelId::as_name)
    }

    #[must_use]
    pub fn client_name(&self) -> Option<&str> {
        self.get(DataclassKind::Client).and_then(LevelId::as_name)
    }

    #[must_use]
    pub fn round_number(&self) -> Option<usize> {
        self.get(DataclassKind::Round).and_then(LevelId::as_number)
    }

    #[must_use]
    pub fn trial_number(&self) -> Option<usize> {
        self.get(DataclassKind::Trial).and_then(LevelId::as_number)
    }

    #[must_use]
    pub fn split_number(&self) -> Option<usize> {
        self.get(DataclassKind::TrialSplit).and_then(LevelId::as_number)
    }

    #[must_use]
    pub fn metric_name(&self) -> Option<&str> {
        self.get(DataclassKind::MetricResults).and_then(LevelId::as_name)
    }

    /// True when `self` is a prefix of `other` (equal locations included).
    #[must_use]
    pub fn is_ancestor_or_equal(&self, other: &Self) -> bool {
        other.ids.starts_with(&self.ids)
    }
}

impl TryFrom<LocationParts> for ScopedLocation {
    type Error = HpoError;

    fn try_from(parts: LocationParts) -> Result<Self> {
        let levels = [
            parts.project_name.map(LevelId::Name),
            parts.client_name.map(LevelId::Name),
            parts.round_number.map(LevelId::Number),
            parts.trial_number.map(LevelId::Number),
            parts.split_number.map(LevelId::Number),
            parts.metric_name.map(LevelId::Name),
        ];
        let mut loc = Self::root();
        let mut gap: Option<DataclassKind> = None;
        for (depth, level) in levels.into_iter().enumerate() {
            let kind = DataclassKind::ALL[depth + 1];
            match (level, gap) {
                (Some(_), Some(missing)) => {
                    return Err(HpoError::InvalidLocation(format!(
                        "{kind} is set but {missing} is not"
                    )));
                }
                (Some(id), None) => loc = loc.push(id)?,
                (None, None) => gap = Some(kind),
                (None, Some(_)) => {}
            }
        }
        Ok(loc)
    }
}

impl fmt::Display for ScopedLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.ids.is_empty() {
            return f.write_str("/");
        }
        for id in &self.ids {
            write!(f, "/{id}")?;
        }
        Ok(())
    }
}

impl FromStr for ScopedLocation {
    type Err = HpoError;

    fn from_str(s: &str) -> Result<Self> {
        let mut loc = Self::root();
        for segment in s.split('/').filter(|seg| !seg.is_empty()) {
            let kind = DataclassKind::from_depth(loc.len() + 1).ok_or_else(|| {
                HpoError::InvalidLocation(format!("`{s}` has more than {MAX_DEPTH} levels"))
            })?;
            let id = if kind.is_numbered() {
                let n = segment.parse::<usize>().map_err(|_| {
                    HpoError::InvalidLocation(format!("{kind} must be a number, got `{segment}`"))
                })?;
                LevelId::Number(n)
            } else {
                LevelId::from(segment)
            };
            loc = loc.push(id)?;
        }
        Ok(loc)
    }
}
