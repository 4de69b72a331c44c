pub mod aggregates;
pub mod campaign;
pub mod config;
pub mod context;
pub mod lock;
pub mod on_disk;
pub mod repository;
pub mod scoped_log;

pub use aggregates::{ClientAgg, ProjectAgg, RootAgg, RoundAgg, TrialAgg, TrialSplitAgg};
pub use campaign::{
    grid_sampler, Campaign, CampaignReport, HyperparameterSampler, MetricReport, SplitReport,
    TrialExecutor, TrialOutcome,
};
pub use config::{CampaignConfig, HpoConfig, RepositoryConfig};
pub use context::AutoMlContext;
pub use lock::LocationLock;
pub use on_disk::OnDiskHyperparamsRepository;
pub use repository::{HyperparamsRepository, InMemoryHyperparamsRepository, RepositoryExt};
pub use scoped_log::{ScopedLogHandle, ScopedLogger};
