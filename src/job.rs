//! Job lifecycle states and the legal-transition table.
//!
//! Only the coordinator mutates state; any transition outside this table is
//! an internal invariant violation and aborts the job.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of one download job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Created,
    Probing,
    Planning,
    Downloading,
    Assembling,
    Published,
    Failed,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Published | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether `self -> to` is a legal transition.
    pub fn can_transition(self, to: JobState) -> bool {
        use JobState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, to) {
            (Created, Probing) => true,
            (Probing, Planning) => true,
            (Planning, Downloading) => true,
            // Source change mid-download loops back through re-probe.
            (Downloading, Probing) => true,
            (Downloading, Planning) => true,
            (Downloading, Assembling) => true,
            (Assembling, Published) => true,
            (_, Failed) | (_, Cancelled) => true,
            _ => false,
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobState::Created => "created",
            JobState::Probing => "probing",
            JobState::Planning => "planning",
            JobState::Downloading => "downloading",
            JobState::Assembling => "assembling",
            JobState::Published => "published",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_is_legal() {
        use JobState::*;
        let path = [Created, Probing, Planning, Downloading, Assembling, Published];
        for w in path.windows(2) {
            assert!(w[0].can_transition(w[1]), "{} -> {}", w[0], w[1]);
        }
    }

    #[test]
    fn terminal_states_are_final() {
        use JobState::*;
        for s in [Published, Failed, Cancelled] {
            for t in [Created, Probing, Downloading, Failed, Cancelled] {
                assert!(!s.can_transition(t));
            }
        }
    }

    #[test]
    fn any_live_state_can_fail_or_cancel() {
        use JobState::*;
        for s in [Created, Probing, Planning, Downloading, Assembling] {
            assert!(s.can_transition(Failed));
            assert!(s.can_transition(Cancelled));
        }
    }

    #[test]
    fn skipping_phases_is_illegal() {
        use JobState::*;
        assert!(!Created.can_transition(Downloading));
        assert!(!Probing.can_transition(Assembling));
        assert!(!Assembling.can_transition(Downloading));
    }
}
