use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;

use anyhow::{anyhow, Context, Result};
use hpo_core::{HyperparameterSamples, RankedTrial, SplitFailurePolicy, TrialStatus};
use serde::Serialize;

use crate::aggregates::{RoundAgg, RootAgg, TrialAgg, TrialSplitAgg};
use crate::config::{CampaignConfig, HpoConfig};
use crate::context::AutoMlContext;
use crate::repository::HyperparamsRepository;

/// Produces the hyperparameters of one trial.
pub trait HyperparameterSampler: Send + Sync {
    fn sample(&self, trial_number: usize) -> Result<HyperparameterSamples>;
}

impl<F> HyperparameterSampler for F
where
    F: Fn(usize) -> Result<HyperparameterSamples> + Send + Sync,
{
    fn sample(&self, trial_number: usize) -> Result<HyperparameterSamples> {
        self(trial_number)
    }
}

/// Runs the pipeline for one split of one trial. Metrics may be recorded on
/// `split` while running or returned in the report.
pub trait TrialExecutor: Send + Sync {
    fn run(&self, hyperparams: &HyperparameterSamples, split: &TrialSplitAgg) -> Result<SplitReport>;
}

impl<F> TrialExecutor for F
where
    F: Fn(&HyperparameterSamples, &TrialSplitAgg) -> Result<SplitReport> + Send + Sync,
{
    fn run(&self, hyperparams: &HyperparameterSamples, split: &TrialSplitAgg) -> Result<SplitReport> {
        self(hyperparams, split)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricReport {
    pub metric_name: String,
    pub train_values: Vec<f64>,
    pub validation_values: Vec<f64>,
    pub higher_score_is_better: bool,
}

/// Outcome of one split as returned by a [`TrialExecutor`].
#[derive(Debug, Clone, PartialEq)]
pub struct SplitReport {
    pub status: TrialStatus,
    pub metrics: Vec<MetricReport>,
}

impl SplitReport {
    pub fn success() -> Self {
        Self {
            status: TrialStatus::Success,
            metrics: Vec::new(),
        }
    }

    pub fn with_status(status: TrialStatus) -> Self {
        Self {
            status,
            metrics: Vec::new(),
        }
    }

    pub fn with_metric(
        mut self,
        metric_name: impl Into<String>,
        train_values: Vec<f64>,
        validation_values: Vec<f64>,
        higher_score_is_better: bool,
    ) -> Self {
        self.metrics.push(MetricReport {
            metric_name: metric_name.into(),
            train_values,
            validation_values,
            higher_score_is_better,
        });
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrialOutcome {
    pub trial_number: usize,
    pub status: TrialStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CampaignReport {
    pub round_number: usize,
    pub trials: Vec<TrialOutcome>,
    pub best: Option<RankedTrial>,
}

impl CampaignReport {
    pub fn count(&self, status: TrialStatus) -> usize {
        self.trials.iter().filter(|t| t.status == status).count()
    }
}

/// Marks its trial ABORTED unless the trial was completed. Covers early
/// returns and panics outside the sampler and executor.
struct TrialGuard {
    trial: TrialAgg,
    done: bool,
}

impl TrialGuard {
    fn new(trial: TrialAgg) -> Self {
        Self { trial, done: false }
    }

    fn complete(&mut self, status: TrialStatus, error: Option<&str>) -> Result<()> {
        self.trial.close(status, error)?;
        self.done = true;
        Ok(())
    }
}

impl Drop for TrialGuard {
    fn drop(&mut self) {
        if !self.done {
            let reason = if thread::panicking() {
                "execution panicked"
            } else {
                "execution stopped before the trial ended"
            };
            if let Err(err) = self.trial.abort(reason) {
                tracing::warn!(location = %self.trial.context().loc(), error = %err, "failed to abort trial");
            }
        }
    }
}

struct Finished {
    outcome: TrialOutcome,
    error: Option<anyhow::Error>,
}

/// The loop that drives trials of one round: samples, runs every split,
/// records outcomes and isolates failing trials from their siblings.
pub struct Campaign {
    config: CampaignConfig,
    ctx: AutoMlContext,
}

impl Campaign {
    pub fn new(config: CampaignConfig, repo: Arc<dyn HyperparamsRepository>) -> Self {
        Self {
            config,
            ctx: AutoMlContext::new(repo),
        }
    }

    pub fn with_context(config: CampaignConfig, ctx: AutoMlContext) -> Self {
        Self { config, ctx }
    }

    /// Campaign over `repo` configured from a loaded [`HpoConfig`].
    pub fn from_config(config: &HpoConfig, repo: Arc<dyn HyperparamsRepository>) -> Self {
        let ctx = AutoMlContext::new(repo)
            .with_silenced_warnings(config.repository.silence_warnings);
        Self::with_context(config.campaign.clone(), ctx)
    }

    pub fn config(&self) -> &CampaignConfig {
        &self.config
    }

    pub fn context(&self) -> &AutoMlContext {
        &self.ctx
    }

    fn split_policy(&self) -> SplitFailurePolicy {
        SplitFailurePolicy {
            continue_on_split_failure: self.config.continue_on_split_failure,
        }
    }

    fn open_round(&self) -> Result<RoundAgg> {
        let client = RootAgg::new(self.ctx.copy())?
            .project(&self.config.project_name)?
            .client(&self.config.client_name)?;
        client.set_main_metric_name(&self.config.main_metric_name)?;
        if !self.config.start_new_round {
            if let Some(round) = client.last_round()? {
                return Ok(round);
            }
        }
        Ok(client.new_round()?)
    }

    /// Runs `n_trials` trials on `n_jobs` workers and ranks the round.
    ///
    /// With `continue_on_error` unset, the first failing trial stops the
    /// scheduling of new trials and its error is returned once the running
    /// ones have finished.
    pub fn run(
        &self,
        sampler: &dyn HyperparameterSampler,
        executor: &dyn TrialExecutor,
    ) -> Result<CampaignReport> {
        self.config.validate()?;
        let round = self.open_round().context("failed to open round")?;
        let round_number = round.round_number()?;
        round.context().info(format!(
            "starting {} trial(s) on {} worker(s)",
            self.config.n_trials, self.config.n_jobs
        ));

        let next = AtomicUsize::new(0);
        let stop = AtomicBool::new(false);
        let finished: Mutex<Vec<Finished>> = Mutex::new(Vec::new());
        let broken: Mutex<Vec<anyhow::Error>> = Mutex::new(Vec::new());
        let workers = self.config.n_jobs.min(self.config.n_trials).max(1);
        let tolerate = self.config.continue_on_error;

        let panicked = thread::scope(|s| {
            let (next, stop, finished, broken, round) = (&next, &stop, &finished, &broken, &round);
            let handles: Vec<_> = (0..workers)
                .map(|_| {
                    s.spawn(move || loop {
                        if stop.load(Ordering::SeqCst) {
                            break;
                        }
                        let index = next.fetch_add(1, Ordering::SeqCst);
                        if index >= self.config.n_trials {
                            break;
                        }
                        match self.run_trial(round, index, sampler, executor) {
                            Ok(done) => {
                                if done.error.is_some() && !tolerate {
                                    stop.store(true, Ordering::SeqCst);
                                }
                                finished
                                    .lock()
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .push(done);
                            }
                            Err(err) => {
                                tracing::error!(
                                    round = round_number,
                                    index,
                                    error = %format!("{err:#}"),
                                    "trial could not be recorded"
                                );
                                if !tolerate {
                                    stop.store(true, Ordering::SeqCst);
                                }
                                broken
                                    .lock()
                                    .unwrap_or_else(PoisonError::into_inner)
                                    .push(err);
                            }
                        }
                    })
                })
                .collect();
            let mut panicked = 0;
            for handle in handles {
                if handle.join().is_err() {
                    panicked += 1;
                    if !tolerate {
                        stop.store(true, Ordering::SeqCst);
                    }
                    tracing::error!(round = round_number, "campaign worker panicked");
                }
            }
            panicked
        });

        let mut finished = finished.into_inner().unwrap_or_else(PoisonError::into_inner);
        finished.sort_by_key(|f| f.outcome.trial_number);
        let mut first_error = None;
        let mut trials = Vec::with_capacity(finished.len());
        for f in finished {
            if first_error.is_none() {
                if let Some(err) = f.error {
                    first_error = Some((f.outcome.trial_number, err));
                }
            }
            trials.push(f.outcome);
        }
        if !tolerate {
            if let Some((n, err)) = first_error {
                return Err(err.context(format!("trial {n} of round {round_number} failed")));
            }
            let broken = broken.into_inner().unwrap_or_else(PoisonError::into_inner);
            if let Some(err) = broken.into_iter().next() {
                return Err(err.context(format!("round {round_number} could not record a trial")));
            }
            if panicked > 0 {
                return Err(anyhow!(
                    "{panicked} worker(s) of round {round_number} panicked"
                ));
            }
        }

        let best = round.best_trial(Some(self.config.main_metric_name.as_str()))?;
        let report = CampaignReport {
            round_number,
            trials,
            best,
        };
        round.context().info(format!(
            "round finished: {} succeeded, {} failed, {} aborted",
            report.count(TrialStatus::Success),
            report.count(TrialStatus::Failed),
            report.count(TrialStatus::Aborted)
        ));
        Ok(report)
    }

    /// Creates, runs and closes one trial. An `Err` means the trial could
    /// not be recorded at all; failures of the pipeline itself come back
    /// inside [`Finished`]. A panic in the sampler or the executor closes
    /// the trial ABORTED and the worker moves on to the next trial.
    fn run_trial(
        &self,
        round: &RoundAgg,
        index: usize,
        sampler: &dyn HyperparameterSampler,
        executor: &dyn TrialExecutor,
    ) -> Result<Finished> {
        let sampled = catch_unwind(AssertUnwindSafe(|| sampler.sample(index)))
            .unwrap_or_else(|payload| {
                Err(anyhow!("sampler panicked: {}", panic_message(&*payload)))
            })
            .with_context(|| format!("sampling hyperparameters for trial #{index}"));
        let hyperparams = sampled.as_ref().cloned().unwrap_or_default();
        let trial = round.new_trial(hyperparams)?;
        let trial_number = trial.trial_number()?;
        let handle = trial.context().add_scoped_logger_file_handler();
        let mut guard = TrialGuard::new(trial.clone());
        trial.start()?;

        let (status, first_error) = match sampled {
            Ok(hyperparams) => {
                let ran = catch_unwind(AssertUnwindSafe(|| {
                    self.run_splits(&trial, &hyperparams, executor)
                }));
                match ran {
                    Ok(outcome) => outcome?,
                    Err(payload) => (
                        TrialStatus::Aborted,
                        Some(anyhow!("execution panicked: {}", panic_message(&*payload))),
                    ),
                }
            }
            Err(err) => (TrialStatus::Failed, Some(err)),
        };
        let message = first_error.as_ref().map(|e| format!("{e:#}"));
        guard.complete(status, message.as_deref())?;
        handle.free();

        let error = match (status, first_error) {
            (TrialStatus::Success, _) => None,
            (_, Some(err)) => Some(err),
            (other, None) => Some(anyhow!("trial {trial_number} ended {other}")),
        };
        Ok(Finished {
            outcome: TrialOutcome {
                trial_number,
                status,
                error: message,
            },
            error,
        })
    }

    fn run_splits(
        &self,
        trial: &TrialAgg,
        hyperparams: &HyperparameterSamples,
        executor: &dyn TrialExecutor,
    ) -> Result<(TrialStatus, Option<anyhow::Error>)> {
        let policy = self.split_policy();
        let mut first_error: Option<anyhow::Error> = None;
        for _ in 0..self.config.n_splits {
            let split = trial.new_split()?;
            split.start()?;
            let ran = executor
                .run(hyperparams, &split)
                .and_then(|report| self.record_report(&split, &report).map(|()| report));
            match ran {
                Ok(report) => {
                    if report.status != TrialStatus::Success && first_error.is_none() {
                        first_error = Some(anyhow!(
                            "split {} ended {}",
                            split.split_number()?,
                            report.status
                        ));
                    }
                }
                Err(err) => {
                    if split.status()? == TrialStatus::Running {
                        split.end_with_error(TrialStatus::Failed, &format!("{err:#}"))?;
                    }
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
            }
            if first_error.is_some() && !policy.continue_on_split_failure {
                break;
            }
        }

        let status = trial.aggregate_status(policy)?;
        let status = if status.is_terminal() {
            status
        } else {
            TrialStatus::Failed
        };
        Ok((status, first_error))
    }

    /// Stores the metrics of `report` and ends `split` with its status. The
    /// main metric must be ranked in the configured direction.
    fn record_report(&self, split: &TrialSplitAgg, report: &SplitReport) -> Result<()> {
        record_metrics(split, report)?;
        let main_metric = self.config.main_metric_name.as_str();
        if let Some(metric) = split.metric_results(main_metric)? {
            if metric.higher_score_is_better != self.config.higher_score_is_better {
                return Err(anyhow!(
                    "main metric {main_metric} reported with higher_score_is_better={}, \
                     campaign expects {}",
                    metric.higher_score_is_better,
                    self.config.higher_score_is_better
                ));
            }
        }
        split
            .end(report.status)
            .with_context(|| format!("ending split with status {}", report.status))
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn record_metrics(split: &TrialSplitAgg, report: &SplitReport) -> Result<()> {
    for metric in &report.metrics {
        for value in &metric.train_values {
            split.add_metric_results_train(&metric.metric_name, *value, metric.higher_score_is_better)?;
        }
        for value in &metric.validation_values {
            split.add_metric_results_validation(
                &metric.metric_name,
                *value,
                metric.higher_score_is_better,
            )?;
        }
    }
    Ok(())
}

/// Samples from a fixed list, cycling when there are more trials than entries.
pub fn grid_sampler(grid: Vec<HyperparameterSamples>) -> impl HyperparameterSampler {
    move |i: usize| -> Result<HyperparameterSamples> {
        if grid.is_empty() {
            return Ok(BTreeMap::new());
        }
        Ok(grid[i % grid.len()].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repository::{InMemoryHyperparamsRepository, RepositoryExt};
    use hpo_core::{RoundDataclass, ScopedLocation};
    use serde_json::json;

    fn config(n_trials: usize, n_jobs: usize) -> CampaignConfig {
        CampaignConfig {
            n_trials,
            n_jobs,
            ..CampaignConfig::new("MAE")
        }
    }

    fn add_n_grid(values: &[i64]) -> impl HyperparameterSampler {
        grid_sampler(
            values
                .iter()
                .map(|v| {
                    let mut hp = HyperparameterSamples::new();
                    hp.insert("add_n".to_string(), json!(v));
                    hp
                })
                .collect(),
        )
    }

    fn mae_executor(hp: &HyperparameterSamples, _split: &TrialSplitAgg) -> Result<SplitReport> {
        let add_n = hp["add_n"].as_i64().ok_or_else(|| anyhow!("add_n missing"))? as f64;
        Ok(SplitReport::success().with_metric("MAE", vec![add_n], vec![(add_n - 5.0).abs()], false))
    }

    #[test]
    fn runs_every_trial_and_ranks_them() {
        let repo = Arc::new(InMemoryHyperparamsRepository::new());
        let campaign = Campaign::new(config(4, 2), repo.clone());
        let report = campaign
            .run(&add_n_grid(&[1, 4, 9, 6]), &mae_executor)
            .expect("campaign");
        assert_eq!(report.round_number, 0);
        assert_eq!(report.count(TrialStatus::Success), 4);
        let best = report.best.expect("best");
        assert_eq!(best.score, 1.0);
        assert_eq!(best.trial_number, 1);

        let round_loc = ScopedLocation::default_path(&[0]).expect("loc");
        let round: RoundDataclass = repo.load_as(&round_loc).expect("round");
        assert_eq!(round.trials.len(), 4);
    }

    #[test]
    fn failure_is_returned_when_errors_are_not_tolerated() {
        let repo = Arc::new(InMemoryHyperparamsRepository::new());
        let campaign = Campaign::new(config(3, 1), repo.clone());
        let executor = |hp: &HyperparameterSamples, split: &TrialSplitAgg| -> Result<SplitReport> {
            if hp["add_n"] == json!(4) {
                return Err(anyhow!("pipeline exploded"));
            }
            mae_executor(hp, split)
        };
        let err = campaign
            .run(&add_n_grid(&[1, 4, 9]), &executor)
            .expect_err("campaign fails");
        assert!(format!("{err:#}").contains("pipeline exploded"));
        assert!(format!("{err:#}").contains("trial 1"));

        let round: RoundDataclass = repo
            .load_as(&ScopedLocation::default_path(&[0]).expect("loc"))
            .expect("round");
        assert_eq!(round.trials.len(), 2);
        assert_eq!(round.trials[1].status(), TrialStatus::Failed);
        assert_eq!(round.trials[0].status(), TrialStatus::Success);
    }

    #[test]
    fn tolerated_failures_do_not_stop_the_round() {
        let repo = Arc::new(InMemoryHyperparamsRepository::new());
        let campaign = Campaign::new(
            CampaignConfig {
                continue_on_error: true,
                ..config(3, 3)
            },
            repo,
        );
        let executor = |hp: &HyperparameterSamples, split: &TrialSplitAgg| -> Result<SplitReport> {
            split.add_metric_results_validation("MAE", 7.0, false)?;
            if hp["add_n"] == json!(4) {
                return Err(anyhow!("pipeline exploded"));
            }
            Ok(SplitReport::success())
        };
        let report = campaign
            .run(&add_n_grid(&[1, 4, 9]), &executor)
            .expect("campaign");
        assert_eq!(report.count(TrialStatus::Success), 2);
        assert_eq!(report.count(TrialStatus::Failed), 1);
        let failed = report
            .trials
            .iter()
            .find(|t| t.status == TrialStatus::Failed)
            .expect("failed trial");
        assert!(failed.error.as_deref().is_some_and(|e| e.contains("pipeline exploded")));
    }

    #[test]
    fn reusing_the_last_round_appends_trials() {
        let repo = Arc::new(InMemoryHyperparamsRepository::new());
        Campaign::new(config(2, 1), repo.clone())
            .run(&add_n_grid(&[1]), &mae_executor)
            .expect("first");
        let report = Campaign::new(
            CampaignConfig {
                start_new_round: false,
                ..config(2, 1)
            },
            repo.clone(),
        )
        .run(&add_n_grid(&[2]), &mae_executor)
        .expect("second");
        assert_eq!(report.round_number, 0);
        let numbers: Vec<usize> = report.trials.iter().map(|t| t.trial_number).collect();
        assert_eq!(numbers, vec![2, 3]);
    }

    #[test]
    fn loaded_config_drives_splits_and_warnings() {
        let config = HpoConfig::from_yaml(
            "repository:\n  silence_warnings: true\ncampaign:\n  main_metric_name: MAE\n  n_trials: 2\n  n_splits: 3\n",
        )
        .expect("config");
        let repo = Arc::new(InMemoryHyperparamsRepository::new());
        let campaign = Campaign::from_config(&config, repo.clone());
        assert!(campaign.context().silences_warnings());
        let report = campaign
            .run(&add_n_grid(&[3, 7]), &mae_executor)
            .expect("campaign");
        assert_eq!(report.count(TrialStatus::Success), 2);

        let round: RoundDataclass = repo
            .load_as(&ScopedLocation::default_path(&[0]).expect("loc"))
            .expect("round");
        assert!(round.trials.iter().all(|t| t.validation_splits.len() == 3));
        assert_eq!(round.trials[0].validation_score("MAE"), Some(2.0));
    }

    #[test]
    fn panicking_trial_leaves_the_worker_running() {
        let repo = Arc::new(InMemoryHyperparamsRepository::new());
        let campaign = Campaign::new(
            CampaignConfig {
                continue_on_error: true,
                ..config(3, 1)
            },
            repo.clone(),
        );
        let executor = |hp: &HyperparameterSamples, split: &TrialSplitAgg| -> Result<SplitReport> {
            if hp["add_n"] == json!(1) {
                panic!("executor bug");
            }
            mae_executor(hp, split)
        };
        let report = campaign
            .run(&add_n_grid(&[1, 4, 9]), &executor)
            .expect("campaign");
        assert_eq!(report.trials.len(), 3);
        assert_eq!(report.trials[0].status, TrialStatus::Aborted);
        assert_eq!(
            report.trials[0].error.as_deref(),
            Some("execution panicked: executor bug")
        );
        assert_eq!(report.count(TrialStatus::Success), 2);

        let round: RoundDataclass = repo
            .load_as(&ScopedLocation::default_path(&[0]).expect("loc"))
            .expect("round");
        assert_eq!(round.trials.len(), 3);
        assert_eq!(round.trials[0].status(), TrialStatus::Aborted);
        assert_eq!(
            round.trials[0].split(0).expect("split").status(),
            TrialStatus::Aborted
        );
        assert!(round.trials[1..].iter().all(|t| t.status() == TrialStatus::Success));
    }

    #[test]
    fn panic_stops_the_round_when_errors_are_not_tolerated() {
        let repo = Arc::new(InMemoryHyperparamsRepository::new());
        let executor = |_: &HyperparameterSamples, _: &TrialSplitAgg| -> Result<SplitReport> {
            panic!("executor bug");
        };
        let err = Campaign::new(config(3, 1), repo.clone())
            .run(&add_n_grid(&[1]), &executor)
            .expect_err("campaign fails");
        assert!(format!("{err:#}").contains("execution panicked: executor bug"));

        let round: RoundDataclass = repo
            .load_as(&ScopedLocation::default_path(&[0]).expect("loc"))
            .expect("round");
        assert_eq!(round.trials.len(), 1);
    }

    #[test]
    fn rejected_metric_fails_the_trial_with_its_own_error() {
        let repo = Arc::new(InMemoryHyperparamsRepository::new());
        let campaign = Campaign::new(
            CampaignConfig {
                continue_on_error: true,
                ..config(2, 1)
            },
            repo.clone(),
        );
        let executor = |hp: &HyperparameterSamples, split: &TrialSplitAgg| -> Result<SplitReport> {
            if hp["add_n"] == json!(1) {
                return Ok(SplitReport::success().with_metric("MAE", vec![], vec![f64::NAN], false));
            }
            mae_executor(hp, split)
        };
        let report = campaign
            .run(&add_n_grid(&[1, 4]), &executor)
            .expect("campaign");
        assert_eq!(report.trials.len(), 2);
        assert_eq!(report.trials[0].status, TrialStatus::Failed);
        let error = report.trials[0].error.as_deref().expect("error");
        assert!(error.contains("non-finite"), "{error}");
        assert_eq!(report.trials[1].status, TrialStatus::Success);

        let round: RoundDataclass = repo
            .load_as(&ScopedLocation::default_path(&[0]).expect("loc"))
            .expect("round");
        let failed = &round.trials[0];
        assert_eq!(failed.status(), TrialStatus::Failed);
        assert!(failed.lifecycle.error.as_deref().is_some_and(|e| e.contains("non-finite")));
        let split = failed.split(0).expect("split");
        assert_eq!(split.status(), TrialStatus::Failed);
        assert!(split.lifecycle.error.as_deref().is_some_and(|e| e.contains("non-finite")));
    }

    #[test]
    fn non_terminal_split_status_fails_the_trial() {
        let repo = Arc::new(InMemoryHyperparamsRepository::new());
        let executor = |_: &HyperparameterSamples, _: &TrialSplitAgg| -> Result<SplitReport> {
            Ok(SplitReport::with_status(TrialStatus::Running))
        };
        let report = Campaign::new(
            CampaignConfig {
                continue_on_error: true,
                ..config(1, 1)
            },
            repo,
        )
        .run(&add_n_grid(&[1]), &executor)
        .expect("campaign");
        assert_eq!(report.trials.len(), 1);
        assert_eq!(report.trials[0].status, TrialStatus::Failed);
        let error = report.trials[0].error.as_deref().expect("error");
        assert!(error.contains("ending split with status running"), "{error}");
    }

    #[test]
    fn main_metric_reported_in_the_wrong_direction_fails_the_trial() {
        let repo = Arc::new(InMemoryHyperparamsRepository::new());
        let campaign = Campaign::new(
            CampaignConfig {
                higher_score_is_better: true,
                continue_on_error: true,
                ..config(1, 1)
            },
            repo,
        );
        let report = campaign
            .run(&add_n_grid(&[1]), &mae_executor)
            .expect("campaign");
        assert_eq!(report.trials[0].status, TrialStatus::Failed);
        let error = report.trials[0].error.as_deref().expect("error");
        assert!(error.contains("higher_score_is_better"), "{error}");
        assert!(report.best.is_none());
    }

    #[test]
    fn higher_scores_rank_first_when_configured() {
        let repo = Arc::new(InMemoryHyperparamsRepository::new());
        let campaign = Campaign::new(
            CampaignConfig {
                n_trials: 3,
                higher_score_is_better: true,
                ..CampaignConfig::new("accuracy")
            },
            repo,
        );
        let executor = |hp: &HyperparameterSamples, _: &TrialSplitAgg| -> Result<SplitReport> {
            let n = hp["add_n"].as_i64().ok_or_else(|| anyhow!("add_n missing"))? as f64;
            Ok(SplitReport::success().with_metric("accuracy", vec![], vec![n / 10.0], true))
        };
        let report = campaign
            .run(&add_n_grid(&[3, 9, 5]), &executor)
            .expect("campaign");
        let best = report.best.expect("best");
        assert_eq!(best.trial_number, 1);
        assert_eq!(best.score, 0.9);
    }

    #[test]
    fn trial_log_captures_the_start_of_the_trial() {
        let repo = Arc::new(InMemoryHyperparamsRepository::new());
        Campaign::new(config(1, 1), repo.clone())
            .run(&add_n_grid(&[1]), &mae_executor)
            .expect("campaign");
        let log = repo
            .read_log(&ScopedLocation::default_path(&[0, 0]).expect("loc"))
            .expect("log");
        let first = log.lines().next().expect("first line");
        assert!(first.ends_with("trial started"), "{first}");
        assert!(log.contains("split started"));
        assert!(log.contains("trial ended: success"));
    }
}
