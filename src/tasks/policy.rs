use serde::Serialize;

use super::StepResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PolicyKind {
    /// Stop the group once anything worse than `CanContinue` comes back.
    Fail,
    /// Never stop; only remember the worst result.
    Continue,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskPolicy {
    kind: PolicyKind,
    state: StepResult,
}

impl TaskPolicy {
    pub fn new(kind: PolicyKind) -> Self {
        Self {
            kind,
            state: StepResult::Ok,
        }
    }

    pub fn fail() -> Self {
        Self::new(PolicyKind::Fail)
    }

    pub fn continue_on_error() -> Self {
        Self::new(PolicyKind::Continue)
    }

    pub fn kind(&self) -> PolicyKind {
        self.kind
    }

    /// Worst result seen so far.
    pub fn state(&self) -> StepResult {
        self.state
    }

    /// Folds `result` into the state and reports whether the group may go on.
    pub fn can_continue(&mut self, result: StepResult) -> bool {
        self.state = self.state.max(result);
        match self.kind {
            PolicyKind::Fail => self.state.permits_continuation(),
            PolicyKind::Continue => true,
        }
    }

    pub fn is_halted(&self) -> bool {
        self.kind == PolicyKind::Fail && !self.state.permits_continuation()
    }
}

impl Default for TaskPolicy {
    fn default() -> Self {
        Self::fail()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [StepResult; 4] = [
        StepResult::Ok,
        StepResult::CanContinue,
        StepResult::Unknown,
        StepResult::Error,
    ];

    /// Every sequence of `len` results over the four variants.
    fn sequences(len: usize) -> Vec<Vec<StepResult>> {
        (0..len).fold(vec![Vec::new()], |acc, _| {
            acc.into_iter()
                .flat_map(|prefix| {
                    ALL.iter().map(move |next| {
                        let mut seq = prefix.clone();
                        seq.push(*next);
                        seq
                    })
                })
                .collect()
        })
    }

    #[test]
    fn fail_policy_latches_after_first_hard_failure() {
        for seq in sequences(4) {
            let mut policy = TaskPolicy::fail();
            let mut failed = false;
            for result in seq.iter().copied() {
                failed |= !result.permits_continuation();
                assert_eq!(policy.can_continue(result), !failed, "sequence {seq:?}");
                assert_eq!(policy.is_halted(), failed);
            }
        }
    }

    #[test]
    fn fail_policy_tolerates_soft_failures() {
        let mut policy = TaskPolicy::fail();
        assert!(policy.can_continue(StepResult::CanContinue));
        assert!(policy.can_continue(StepResult::Ok));
        assert_eq!(policy.state(), StepResult::CanContinue);
    }

    #[test]
    fn continue_policy_never_stops_but_tracks_worst() {
        for seq in sequences(4) {
            let mut policy = TaskPolicy::continue_on_error();
            for result in seq.iter().copied() {
                assert!(policy.can_continue(result), "sequence {seq:?}");
            }
            assert!(!policy.is_halted());
            assert_eq!(policy.state(), StepResult::worst(seq.iter().copied()));
        }
    }
}
