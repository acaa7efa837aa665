//! Pure parts of the dispatch loop: its states and the once-per-tick decision.

use std::time::Duration;

use crate::domain::models::config::IntervalConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchState {
    Start,
    SpecCheck,
    NextTarget,
    Dispatch,
    Terminate,
    Terminated,
}

impl DispatchState {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::SpecCheck => "spec-check",
            Self::NextTarget => "next-target",
            Self::Dispatch => "dispatch",
            Self::Terminate => "terminate",
            Self::Terminated => "terminated",
        }
    }
}

impl std::fmt::Display for DispatchState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What `SpecCheck` chooses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    NextTarget,
    Dispatch,
    Terminate,
}

/// Facts `SpecCheck` is evaluated on.
#[derive(Debug, Clone, Copy, Default)]
pub struct Snapshot {
    /// No target has been started yet.
    pub first: bool,
    /// The current target reached a quota or converged.
    pub expired: bool,
    /// Another target is queued.
    pub has_next: bool,
    /// Targets rotate through a queue.
    pub distributed: bool,
}

pub fn decide(s: &Snapshot) -> Decision {
    if s.distributed && s.first {
        return if s.has_next {
            Decision::NextTarget
        } else {
            Decision::Terminate
        };
    }
    match (s.expired, s.distributed && s.has_next) {
        (false, _) => Decision::Dispatch,
        (true, true) => Decision::NextTarget,
        (true, false) => Decision::Terminate,
    }
}

/// Budgets a target runs under; `None` is unbounded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Quotas {
    pub traces: Option<u64>,
    pub tests: Option<u64>,
    pub time: Option<Duration>,
}

impl From<&IntervalConfig> for Quotas {
    fn from(interval: &IntervalConfig) -> Self {
        Self {
            traces: interval.trace,
            tests: interval.tc,
            time: interval.time.map(Duration::from_secs),
        }
    }
}

/// Where the current target stands against its quotas.
#[derive(Debug, Clone, Copy, Default)]
pub struct Progress {
    pub unique_traces: u64,
    pub tests: u64,
    pub elapsed: Duration,
    pub converged: bool,
}

/// Which limit ended a target, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiry {
    Converged,
    TraceQuota,
    TestQuota,
    TimeQuota,
}

impl Expiry {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Converged => "converged",
            Self::TraceQuota => "trace quota reached",
            Self::TestQuota => "test case quota reached",
            Self::TimeQuota => "time quota reached",
        }
    }
}

pub fn expiry(quotas: &Quotas, progress: &Progress) -> Option<Expiry> {
    if progress.converged {
        Some(Expiry::Converged)
    } else if quotas.traces.is_some_and(|q| progress.unique_traces >= q) {
        Some(Expiry::TraceQuota)
    } else if quotas.tests.is_some_and(|q| progress.tests >= q) {
        Some(Expiry::TestQuota)
    } else if quotas.time.is_some_and(|q| progress.elapsed >= q) {
        Some(Expiry::TimeQuota)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(first: bool, expired: bool, has_next: bool, distributed: bool) -> Snapshot {
        Snapshot {
            first,
            expired,
            has_next,
            distributed,
        }
    }

    #[test]
    fn test_first_tick_rotates_in_distributed_mode() {
        assert_eq!(decide(&snap(true, false, true, true)), Decision::NextTarget);
        assert_eq!(decide(&snap(true, false, false, true)), Decision::Terminate);
    }

    #[test]
    fn test_single_target_mode_never_rotates() {
        assert_eq!(decide(&snap(true, false, true, false)), Decision::Dispatch);
        assert_eq!(decide(&snap(false, true, true, false)), Decision::Terminate);
    }

    #[test]
    fn test_expired_target_rotates_or_terminates() {
        assert_eq!(decide(&snap(false, false, true, true)), Decision::Dispatch);
        assert_eq!(decide(&snap(false, true, true, true)), Decision::NextTarget);
        assert_eq!(decide(&snap(false, true, false, true)), Decision::Terminate);
    }

    #[test]
    fn test_expiry_checks_each_quota() {
        let quotas = Quotas {
            traces: Some(10),
            tests: Some(5),
            time: Some(Duration::from_secs(60)),
        };
        let mut progress = Progress::default();
        assert_eq!(expiry(&quotas, &progress), None);

        progress.tests = 5;
        assert_eq!(expiry(&quotas, &progress), Some(Expiry::TestQuota));
        progress.unique_traces = 10;
        assert_eq!(expiry(&quotas, &progress), Some(Expiry::TraceQuota));
        progress.converged = true;
        assert_eq!(expiry(&quotas, &progress), Some(Expiry::Converged));

        let timed = Progress {
            elapsed: Duration::from_secs(61),
            ..Progress::default()
        };
        assert_eq!(expiry(&quotas, &timed), Some(Expiry::TimeQuota));
        assert_eq!(expiry(&Quotas::default(), &timed), None);
    }
}
