use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{HpoError, Result};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrialStatus {
    #[default]
    Planned,
    Running,
    Success,
    Failed,
    Aborted,
}

impl TrialStatus {
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Failed | Self::Aborted)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "planned" => Some(Self::Planned),
            "running" => Some(Self::Running),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "aborted" => Some(Self::Aborted),
            _ => None,
        }
    }
}

impl fmt::Display for TrialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status and timestamps shared by trials and trial splits.
///
/// `PLANNED -> RUNNING -> {SUCCESS, FAILED, ABORTED}`; terminal states are
/// final.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Lifecycle {
    pub status: TrialStatus,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Lifecycle {
    pub fn start(&mut self) -> Result<()> {
        self.start_at(Utc::now())
    }

    pub fn start_at(&mut self, at: DateTime<Utc>) -> Result<()> {
        if self.status != TrialStatus::Planned {
            return Err(HpoError::InvalidTransition {
                status: self.status,
                action: "start",
            });
        }
        self.status = TrialStatus::Running;
        self.start_time = Some(at);
        Ok(())
    }

    pub fn end(&mut self, outcome: TrialStatus) -> Result<()> {
        self.end_at(outcome, None, Utc::now())
    }

    pub fn end_with_error(&mut self, outcome: TrialStatus, error: impl Into<String>) -> Result<()> {
        self.end_at(outcome, Some(error.into()), Utc::now())
    }

    pub fn end_at(
        &mut self,
        outcome: TrialStatus,
        error: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if self.status != TrialStatus::Running {
            return Err(HpoError::InvalidTransition {
                status: self.status,
                action: "end",
            });
        }
        if !outcome.is_terminal() {
            return Err(HpoError::InvalidTransition {
                status: self.status,
                action: "end with a non-terminal outcome",
            });
        }
        self.status = outcome;
        self.end_time = Some(at);
        self.error = error;
        Ok(())
    }

    #[must_use]
    pub fn is_ended(&self) -> bool {
        self.status.is_terminal()
    }

    /// Fails when the node has ended and must only be read.
    pub fn ensure_mutable(&self, action: &'static str) -> Result<()> {
        if self.is_ended() {
            return Err(HpoError::InvalidTransition {
                status: self.status,
                action,
            });
        }
        Ok(())
    }
}

/// How a trial's status is derived from its splits. Supplied by the loop
/// driving the trials.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SplitFailurePolicy {
    pub continue_on_split_failure: bool,
}

pub fn aggregate_status<I>(splits: I, policy: SplitFailurePolicy) -> TrialStatus
where
    I: IntoIterator<Item = TrialStatus>,
{
    let mut total = 0usize;
    let mut pending = 0usize;
    let mut started = false;
    let mut successes = 0usize;
    let mut failed = false;
    let mut aborted = false;
    for status in splits {
        total += 1;
        match status {
            TrialStatus::Planned => pending += 1,
            TrialStatus::Running => {
                pending += 1;
                started = true;
            }
            TrialStatus::Success => {
                successes += 1;
                started = true;
            }
            TrialStatus::Failed => {
                failed = true;
                started = true;
            }
            TrialStatus::Aborted => {
                aborted = true;
                started = true;
            }
        }
    }

    if total == 0 {
        return TrialStatus::Planned;
    }
    if !policy.continue_on_split_failure {
        if failed {
            return TrialStatus::Failed;
        }
        if aborted {
            return TrialStatus::Aborted;
        }
    }
    if pending > 0 {
        return if started {
            TrialStatus::Running
        } else {
            TrialStatus::Planned
        };
    }
    if successes > 0 {
        TrialStatus::Success
    } else if failed {
        TrialStatus::Failed
    } else {
        TrialStatus::Aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_then_end_succeeds_once() {
        let mut lc = Lifecycle::default();
        lc.start().expect("start");
        lc.end(TrialStatus::Success).expect("end");
        assert_eq!(lc.status, TrialStatus::Success);
        assert!(lc.start_time.is_some());
        assert!(lc.end_time >= lc.start_time);
        assert!(lc.end(TrialStatus::Failed).is_err());
        assert!(lc.start().is_err());
    }

    #[test]
    fn double_start_and_early_end_are_rejected() {
        let mut lc = Lifecycle::default();
        let err = lc.end(TrialStatus::Success).expect_err("end before start");
        assert!(matches!(
            err,
            HpoError::InvalidTransition {
                status: TrialStatus::Planned,
                ..
            }
        ));
        lc.start().expect("start");
        assert!(matches!(
            lc.start(),
            Err(HpoError::InvalidTransition {
                status: TrialStatus::Running,
                ..
            })
        ));
        assert!(lc.end(TrialStatus::Running).is_err());
    }

    #[test]
    fn failure_message_is_kept() {
        let mut lc = Lifecycle::default();
        lc.start().expect("start");
        lc.end_with_error(TrialStatus::Failed, "boom").expect("end");
        assert_eq!(lc.error.as_deref(), Some("boom"));
        assert!(lc.ensure_mutable("append").is_err());
    }

    #[test]
    fn aggregate_fails_fast_without_tolerance() {
        use TrialStatus::*;
        let strict = SplitFailurePolicy::default();
        assert_eq!(aggregate_status(Vec::<TrialStatus>::new(), strict), Planned);
        assert_eq!(aggregate_status([Success, Success], strict), Success);
        assert_eq!(aggregate_status([Success, Failed], strict), Failed);
        assert_eq!(aggregate_status([Success, Running], strict), Running);
        assert_eq!(aggregate_status([Planned, Planned], strict), Planned);
        assert_eq!(aggregate_status([Running, Aborted], strict), Aborted);
    }

    #[test]
    fn aggregate_tolerates_split_failures_when_asked() {
        use TrialStatus::*;
        let tolerant = SplitFailurePolicy {
            continue_on_split_failure: true,
        };
        assert_eq!(aggregate_status([Success, Failed], tolerant), Success);
        assert_eq!(aggregate_status([Failed, Running], tolerant), Running);
        assert_eq!(aggregate_status([Failed, Aborted], tolerant), Failed);
        assert_eq!(aggregate_status([Aborted], tolerant), Aborted);
    }
}
