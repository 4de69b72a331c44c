//! Operation-oriented views over one level of the tree.
//!
//! Each view holds a context narrowed to its node and mutates through the
//! repository at that location, so two views over disjoint trials never
//! touch each other's data.

use hpo_core::{
    ClientDataclass, DataclassNode, HpoError, HyperparameterSamples, MetricResultsDataclass,
    ProjectDataclass, RankedTrial, Result, RootDataclass, RoundDataclass, ScopedLocation,
    SplitFailurePolicy, TrialDataclass, TrialSplitDataclass, TrialStatus,
};

use crate::context::AutoMlContext;
use crate::repository::RepositoryExt;

fn number_of(loc: &ScopedLocation, n: Option<usize>) -> Result<usize> {
    n.ok_or_else(|| HpoError::InvalidLocation(format!("{loc} has no {} level", loc.kind())))
}

fn load<T: DataclassNode>(ctx: &AutoMlContext) -> Result<T> {
    ctx.repo().load_as(ctx.loc())
}

#[derive(Debug, Clone)]
pub struct RootAgg {
    ctx: AutoMlContext,
}

impl RootAgg {
    pub fn new(ctx: AutoMlContext) -> Result<Self> {
        if !ctx.loc().is_empty() {
            return Err(HpoError::InvalidLocation(format!(
                "root view needs the root context, got {}",
                ctx.loc()
            )));
        }
        Ok(Self { ctx })
    }

    pub fn context(&self) -> &AutoMlContext {
        &self.ctx
    }

    pub fn project(&self, name: &str) -> Result<ProjectAgg> {
        Ok(ProjectAgg {
            ctx: self.ctx.push_attr(ProjectDataclass::new(name))?,
        })
    }

    pub fn default_client(&self) -> Result<ClientAgg> {
        self.project(hpo_core::DEFAULT_PROJECT)?
            .client(hpo_core::DEFAULT_CLIENT)
    }

    pub fn dataclass(&self) -> Result<RootDataclass> {
        load(&self.ctx)
    }
}

#[derive(Debug, Clone)]
pub struct ProjectAgg {
    ctx: AutoMlContext,
}

impl ProjectAgg {
    pub fn context(&self) -> &AutoMlContext {
        &self.ctx
    }

    pub fn name(&self) -> &str {
        self.ctx.loc().project_name().unwrap_or_default()
    }

    pub fn client(&self, name: &str) -> Result<ClientAgg> {
        Ok(ClientAgg {
            ctx: self.ctx.push_attr(ClientDataclass::new(name))?,
        })
    }

    pub fn dataclass(&self) -> Result<ProjectDataclass> {
        load(&self.ctx)
    }
}

#[derive(Debug, Clone)]
pub struct ClientAgg {
    ctx: AutoMlContext,
}

impl ClientAgg {
    pub fn context(&self) -> &AutoMlContext {
        &self.ctx
    }

    pub fn name(&self) -> &str {
        self.ctx.loc().client_name().unwrap_or_default()
    }

    pub fn dataclass(&self) -> Result<ClientDataclass> {
        load(&self.ctx)
    }

    pub fn main_metric_name(&self) -> Result<Option<String>> {
        Ok(self.dataclass()?.main_metric_name)
    }

    pub fn set_main_metric_name(&self, metric_name: &str) -> Result<()> {
        hpo_core::location::validate_level_id(
            hpo_core::DataclassKind::MetricResults,
            &metric_name.into(),
        )?;
        self.ctx
            .repo()
            .update_as::<ClientDataclass, _, _>(self.ctx.loc(), |client| {
                client.main_metric_name = Some(metric_name.to_string());
                Ok(())
            })
    }

    /// Opens the round numbered after the last existing one.
    pub fn new_round(&self) -> Result<RoundAgg> {
        let round = self
            .ctx
            .repo()
            .append_child(self.ctx.loc(), RoundDataclass::default().into())?;
        let id = round.get_id().ok_or_else(|| {
            HpoError::InvalidLocation(format!("new round under {} has no number", self.ctx.loc()))
        })?;
        let ctx = self.ctx.with_loc(self.ctx.loc().push(id)?);
        ctx.info("new round");
        Ok(RoundAgg { ctx })
    }

    /// Existing round `round_number`.
    pub fn round(&self, round_number: usize) -> Result<RoundAgg> {
        let loc = self.ctx.loc().push(round_number)?;
        if !self.ctx.repo().contains(&loc)? {
            return Err(HpoError::NotFound(format!("no round at {loc}")));
        }
        Ok(RoundAgg {
            ctx: self.ctx.with_loc(loc),
        })
    }

    pub fn last_round(&self) -> Result<Option<RoundAgg>> {
        let client = self.dataclass()?;
        match client.rounds.keys().next_back() {
            Some(n) => self.round(*n).map(Some),
            None => Ok(None),
        }
    }

    pub fn round_numbers(&self) -> Result<Vec<usize>> {
        Ok(self.dataclass()?.rounds.into_keys().collect())
    }
}

#[derive(Debug, Clone)]
pub struct RoundAgg {
    ctx: AutoMlContext,
}

impl RoundAgg {
    pub fn context(&self) -> &AutoMlContext {
        &self.ctx
    }

    pub fn round_number(&self) -> Result<usize> {
        number_of(self.ctx.loc(), self.ctx.loc().round_number())
    }

    pub fn dataclass(&self) -> Result<RoundDataclass> {
        load(&self.ctx)
    }

    /// Appends a PLANNED trial numbered after the existing ones.
    pub fn new_trial(&self, hyperparams: HyperparameterSamples) -> Result<TrialAgg> {
        let trial = self
            .ctx
            .repo()
            .append_child(self.ctx.loc(), TrialDataclass::new(0, hyperparams).into())?;
        let id = trial.get_id().ok_or_else(|| {
            HpoError::InvalidLocation(format!("new trial under {} has no number", self.ctx.loc()))
        })?;
        Ok(TrialAgg {
            ctx: self.ctx.with_loc(self.ctx.loc().push(id)?),
        })
    }

    pub fn trial(&self, trial_number: usize) -> Result<TrialAgg> {
        let loc = self.ctx.loc().push(trial_number)?;
        if !self.ctx.repo().contains(&loc)? {
            return Err(HpoError::NotFound(format!("no trial at {loc}")));
        }
        Ok(TrialAgg {
            ctx: self.ctx.with_loc(loc),
        })
    }

    pub fn trials(&self) -> Result<Vec<TrialDataclass>> {
        Ok(self.dataclass()?.trials)
    }

    /// The client's main metric, the default ranking metric of its rounds.
    pub fn main_metric_name(&self) -> Result<Option<String>> {
        let client_loc = self.ctx.loc().slice_to(hpo_core::DataclassKind::Client)?;
        match self.ctx.repo().load_as::<ClientDataclass>(&client_loc) {
            Ok(client) => Ok(client.main_metric_name),
            Err(HpoError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Successful trials ranked best-first on `metric_name`, or on the
    /// client's main metric when `None`.
    pub fn summary(&self, metric_name: Option<&str>) -> Result<Vec<RankedTrial>> {
        let metric = match metric_name {
            Some(name) => name.to_string(),
            None => self.main_metric_name()?.ok_or_else(|| {
                HpoError::NotFound(format!(
                    "no metric given and no main metric recorded above {}",
                    self.ctx.loc()
                ))
            })?,
        };
        let round = self.dataclass()?;
        let ranked = round.summary(&metric);
        let unranked = round
            .trials
            .iter()
            .filter(|t| t.status() == TrialStatus::Success)
            .count()
            - ranked.len();
        if unranked > 0 && !self.ctx.silences_warnings() {
            self.ctx.warn(format!(
                "{unranked} successful trial(s) have no `{metric}` validation value"
            ));
        }
        Ok(ranked)
    }

    pub fn best_trial(&self, metric_name: Option<&str>) -> Result<Option<RankedTrial>> {
        Ok(self.summary(metric_name)?.into_iter().next())
    }
}

fn close_trial(trial: &mut TrialDataclass, outcome: TrialStatus, error: Option<&str>) -> Result<()> {
    for split in &mut trial.validation_splits {
        if split.status() == TrialStatus::Running {
            split
                .lifecycle
                .end_with_error(TrialStatus::Aborted, error.unwrap_or("trial ended first"))?;
        }
    }
    match error {
        Some(error) => trial.lifecycle.end_with_error(outcome, error),
        None => trial.lifecycle.end(outcome),
    }
}

#[derive(Debug, Clone)]
pub struct TrialAgg {
    ctx: AutoMlContext,
}

impl TrialAgg {
    pub fn context(&self) -> &AutoMlContext {
        &self.ctx
    }

    pub fn trial_number(&self) -> Result<usize> {
        number_of(self.ctx.loc(), self.ctx.loc().trial_number())
    }

    pub fn dataclass(&self) -> Result<TrialDataclass> {
        load(&self.ctx)
    }

    pub fn status(&self) -> Result<TrialStatus> {
        Ok(self.dataclass()?.status())
    }

    pub fn hyperparams(&self) -> Result<HyperparameterSamples> {
        Ok(self.dataclass()?.hyperparams)
    }

    fn modify<R>(&self, f: impl FnOnce(&mut TrialDataclass) -> Result<R>) -> Result<R> {
        self.ctx
            .repo()
            .update_as::<TrialDataclass, _, _>(self.ctx.loc(), f)
    }

    pub fn start(&self) -> Result<()> {
        self.modify(|t| t.lifecycle.start())?;
        self.ctx.info("trial started");
        Ok(())
    }

    pub fn end(&self, outcome: TrialStatus) -> Result<()> {
        self.modify(|t| t.lifecycle.end(outcome))?;
        self.ctx.info(format!("trial ended: {outcome}"));
        Ok(())
    }

    /// Ends the trial with `outcome`, keeping `error` as the reason.
    pub fn end_with_error(&self, outcome: TrialStatus, error: &str) -> Result<()> {
        self.modify(|t| t.lifecycle.end_with_error(outcome, error))?;
        self.ctx.error(format!("trial ended: {outcome}: {error}"));
        Ok(())
    }

    /// Ends a RUNNING trial with `outcome`. Splits still RUNNING are ended
    /// ABORTED first so no split outlives its trial.
    pub fn close(&self, outcome: TrialStatus, error: Option<&str>) -> Result<()> {
        self.modify(|t| close_trial(t, outcome, error))?;
        match error {
            Some(error) => self.ctx.error(format!("trial ended: {outcome}: {error}")),
            None => self.ctx.info(format!("trial ended: {outcome}")),
        }
        Ok(())
    }

    /// Closes the trial as ABORTED if it is still RUNNING. Returns whether
    /// anything changed.
    pub fn abort(&self, reason: &str) -> Result<bool> {
        let aborted = self.modify(|t| {
            if t.status() != TrialStatus::Running {
                return Ok(false);
            }
            close_trial(t, TrialStatus::Aborted, Some(reason))?;
            Ok(true)
        })?;
        if aborted {
            self.ctx.warn(format!("trial aborted: {reason}"));
        }
        Ok(aborted)
    }

    pub fn new_split(&self) -> Result<TrialSplitAgg> {
        let split = self
            .ctx
            .repo()
            .append_child(self.ctx.loc(), TrialSplitDataclass::default().into())?;
        let id = split.get_id().ok_or_else(|| {
            HpoError::InvalidLocation(format!("new split under {} has no number", self.ctx.loc()))
        })?;
        Ok(TrialSplitAgg {
            ctx: self.ctx.with_loc(self.ctx.loc().push(id)?),
        })
    }

    pub fn split(&self, split_number: usize) -> Result<TrialSplitAgg> {
        let loc = self.ctx.loc().push(split_number)?;
        if !self.ctx.repo().contains(&loc)? {
            return Err(HpoError::NotFound(format!("no split at {loc}")));
        }
        Ok(TrialSplitAgg {
            ctx: self.ctx.with_loc(loc),
        })
    }

    pub fn aggregate_status(&self, policy: SplitFailurePolicy) -> Result<TrialStatus> {
        Ok(self.dataclass()?.aggregate_status(policy))
    }

    pub fn validation_score(&self, metric_name: &str) -> Result<Option<f64>> {
        Ok(self.dataclass()?.validation_score(metric_name))
    }
}

#[derive(Debug, Clone)]
pub struct TrialSplitAgg {
    ctx: AutoMlContext,
}

impl TrialSplitAgg {
    pub fn context(&self) -> &AutoMlContext {
        &self.ctx
    }

    pub fn split_number(&self) -> Result<usize> {
        number_of(self.ctx.loc(), self.ctx.loc().split_number())
    }

    pub fn dataclass(&self) -> Result<TrialSplitDataclass> {
        load(&self.ctx)
    }

    pub fn status(&self) -> Result<TrialStatus> {
        Ok(self.dataclass()?.status())
    }

    fn modify<R>(&self, f: impl FnOnce(&mut TrialSplitDataclass) -> Result<R>) -> Result<R> {
        self.ctx
            .repo()
            .update_as::<TrialSplitDataclass, _, _>(self.ctx.loc(), f)
    }

    pub fn start(&self) -> Result<()> {
        self.modify(|s| s.lifecycle.start())?;
        self.ctx.info("split started");
        Ok(())
    }

    pub fn end(&self, outcome: TrialStatus) -> Result<()> {
        self.modify(|s| s.lifecycle.end(outcome))?;
        self.ctx.info(format!("split ended: {outcome}"));
        Ok(())
    }

    pub fn end_with_error(&self, outcome: TrialStatus, error: &str) -> Result<()> {
        self.modify(|s| s.lifecycle.end_with_error(outcome, error))?;
        self.ctx.error(format!("split ended: {outcome}: {error}"));
        Ok(())
    }

    pub fn add_metric_results_train(
        &self,
        metric_name: &str,
        value: f64,
        higher_score_is_better: bool,
    ) -> Result<()> {
        self.modify(|s| s.add_metric_results_train(metric_name, value, higher_score_is_better))
    }

    pub fn add_metric_results_validation(
        &self,
        metric_name: &str,
        value: f64,
        higher_score_is_better: bool,
    ) -> Result<()> {
        self.modify(|s| {
            s.add_metric_results_validation(metric_name, value, higher_score_is_better)
        })
    }

    pub fn metric_results(&self, metric_name: &str) -> Result<Option<MetricResultsDataclass>> {
        Ok(self.dataclass()?.metric_results(metric_name).cloned())
    }

    /// True when the last validation value of `metric_name` is its best so far.
    pub fn is_new_best_score(&self, metric_name: &str) -> Result<bool> {
        Ok(self
            .metric_results(metric_name)?
            .is_some_and(|m| m.is_new_best_score()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn client() -> ClientAgg {
        RootAgg::new(AutoMlContext::in_memory())
            .and_then(|root| root.default_client())
            .expect("client")
    }

    fn hp(add_n: i64) -> HyperparameterSamples {
        let mut hp = HyperparameterSamples::new();
        hp.insert("add_n".to_string(), json!(add_n));
        hp
    }

    fn run_trial(round: &RoundAgg, add_n: i64, scores: &[f64]) -> TrialAgg {
        let trial = round.new_trial(hp(add_n)).expect("trial");
        trial.start().expect("start");
        let split = trial.new_split().expect("split");
        split.start().expect("start");
        for score in scores {
            split.add_metric_results_validation("MAE", *score, false).expect("metric");
        }
        split.end(TrialStatus::Success).expect("end");
        trial.end(TrialStatus::Success).expect("end");
        trial
    }

    #[test]
    fn rounds_and_trials_are_numbered_in_order() {
        let client = client();
        assert!(client.last_round().expect("last").is_none());
        let r0 = client.new_round().expect("round");
        let r1 = client.new_round().expect("round");
        assert_eq!(r0.round_number().expect("n"), 0);
        assert_eq!(r1.round_number().expect("n"), 1);
        assert_eq!(
            client.last_round().expect("last").expect("some").round_number().expect("n"),
            1
        );
        let t0 = r1.new_trial(hp(1)).expect("trial");
        let t1 = r1.new_trial(hp(2)).expect("trial");
        assert_eq!(t0.trial_number().expect("n"), 0);
        assert_eq!(t1.trial_number().expect("n"), 1);
        assert_eq!(t1.status().expect("status"), TrialStatus::Planned);
        assert!(matches!(client.round(7), Err(HpoError::NotFound(_))));
    }

    #[test]
    fn summary_uses_the_main_metric() {
        let client = client();
        let round = client.new_round().expect("round");
        assert!(round.summary(None).is_err());
        client.set_main_metric_name("MAE").expect("metric");

        run_trial(&round, 1, &[3.0, 2.0]);
        run_trial(&round, 2, &[1.5]);
        let failed = round.new_trial(hp(3)).expect("trial");
        failed.start().expect("start");
        failed.end_with_error(TrialStatus::Failed, "diverged").expect("end");

        let ranked = round.summary(None).expect("summary");
        let order: Vec<usize> = ranked.iter().map(|r| r.trial_number).collect();
        assert_eq!(order, vec![1, 0]);
        assert_eq!(round.best_trial(Some("MAE")).expect("best").expect("some").score, 1.5);
        assert_eq!(
            failed.dataclass().expect("trial").lifecycle.error.as_deref(),
            Some("diverged")
        );
    }

    #[test]
    fn ended_trial_refuses_new_splits_and_metrics() {
        let round = client().new_round().expect("round");
        let trial = run_trial(&round, 1, &[1.0]);
        assert!(matches!(
            trial.new_split(),
            Err(HpoError::InvalidTransition { .. })
        ));
        let split = trial.split(0).expect("split");
        assert!(split.add_metric_results_train("MAE", 0.1, false).is_err());
        assert_eq!(
            split.metric_results("MAE").expect("read").expect("some").validation_values,
            vec![1.0]
        );
        assert!(!trial.abort("too late").expect("abort"));
    }

    #[test]
    fn abort_closes_running_splits() {
        let round = client().new_round().expect("round");
        let trial = round.new_trial(hp(1)).expect("trial");
        trial.start().expect("start");
        let split = trial.new_split().expect("split");
        split.start().expect("start");
        split.add_metric_results_validation("MAE", 4.0, false).expect("metric");

        assert!(trial.abort("worker stopped").expect("abort"));
        assert_eq!(trial.status().expect("status"), TrialStatus::Aborted);
        assert_eq!(split.status().expect("status"), TrialStatus::Aborted);
        assert_eq!(trial.validation_score("MAE").expect("score"), Some(4.0));
        assert_eq!(
            trial
                .aggregate_status(SplitFailurePolicy::default())
                .expect("aggregate"),
            TrialStatus::Aborted
        );
    }

    #[test]
    fn new_best_score_follows_direction() {
        let round = client().new_round().expect("round");
        let trial = round.new_trial(hp(1)).expect("trial");
        trial.start().expect("start");
        let split = trial.new_split().expect("split");
        split.start().expect("start");
        split.add_metric_results_validation("acc", 0.5, true).expect("metric");
        split.add_metric_results_validation("acc", 0.7, true).expect("metric");
        assert!(split.is_new_best_score("acc").expect("best"));
        split.add_metric_results_validation("acc", 0.6, true).expect("metric");
        assert!(!split.is_new_best_score("acc").expect("best"));
        assert!(!split.is_new_best_score("missing").expect("best"));
    }
}
