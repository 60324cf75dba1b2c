//! Signal types extracted from a worker's output log.

/// Everything the parser found in one log.
///
/// `pr_number` comes from an explicit `PR:<n>` marker; `heuristic_pr` from
/// the weaker phrase scan and is only consulted for phase masters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogSignals {
    pub complete: bool,
    pub blocked: Option<String>,
    pub failed: Option<String>,
    pub pr_number: Option<u64>,
    pub heuristic_pr: Option<u64>,
}

/// Terminal classification of one worker session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// `FAILED:<reason>` — unrecoverable error.
    Failed(String),
    /// `BLOCKED:<reason>` — work cannot proceed.
    Blocked(String),
    /// `COMPLETE` — work finished successfully.
    Complete,
    /// No explicit marker in the log.
    NoSignal,
}

impl LogSignals {
    /// Classify with the fixed precedence `FAILED > BLOCKED > COMPLETE`.
    pub fn verdict(&self) -> Verdict {
        if let Some(reason) = &self.failed {
            return Verdict::Failed(reason.clone());
        }
        if let Some(reason) = &self.blocked {
            return Verdict::Blocked(reason.clone());
        }
        if self.complete {
            return Verdict::Complete;
        }
        Verdict::NoSignal
    }

    /// The weaker "a PR seems to have been created" verdict. Only phase
    /// masters act on this.
    pub fn likely_complete(&self) -> bool {
        self.heuristic_pr.is_some()
    }

    /// Best available PR number: explicit marker wins over the heuristic.
    pub fn effective_pr(&self) -> Option<u64> {
        self.pr_number.or(self.heuristic_pr)
    }

    pub fn has_any(&self) -> bool {
        self.complete
            || self.blocked.is_some()
            || self.failed.is_some()
            || self.pr_number.is_some()
    }
}
