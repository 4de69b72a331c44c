//! Data model for hyperparameter-optimization campaigns: typed locations,
//! the experiment tree and the trial lifecycle.

pub mod dataclass;
pub mod error;
pub mod fsutil;
pub mod lifecycle;
pub mod location;

pub use dataclass::{
    check_placement, from_json, is_better, put_under, to_json, ClientDataclass, Dataclass,
    DataclassMut, DataclassNode, DataclassRef, HyperparameterSamples, MetricResultsDataclass,
    ProjectDataclass, RankedTrial, RootDataclass, RoundDataclass, TrialDataclass,
    TrialSplitDataclass,
};
pub use error::{HpoError, Result};
pub use lifecycle::{aggregate_status, Lifecycle, SplitFailurePolicy, TrialStatus};
pub use location::{
    DataclassKind, LevelId, LocationParts, ScopedLocation, DEFAULT_CLIENT, DEFAULT_PROJECT,
    MAX_DEPTH,
};
