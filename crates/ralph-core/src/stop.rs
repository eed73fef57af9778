//! The stop machine: a pure function from accumulated scheduler counters and
//! signals to one terminal [`StopReason`], matched against the exit-code
//! table of §4.8 at the CLI boundary.

use std::fmt;

/// Why the scheduler stopped iterating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    Normal,
    MaxIterations,
    ConsecutiveFailures,
    Timeout,
    Interrupted,
    AllSkipped,
}

impl StopReason {
    /// The process exit code for this reason, per §4.8.
    pub fn exit_code(self) -> i32 {
        match self {
            StopReason::Normal => 0,
            StopReason::MaxIterations => 2,
            StopReason::ConsecutiveFailures => 3,
            StopReason::Timeout => 4,
            StopReason::Interrupted => 5,
            StopReason::AllSkipped => 6,
        }
    }
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::Normal => "normal",
            StopReason::MaxIterations => "max_iterations",
            StopReason::ConsecutiveFailures => "consecutive_failures",
            StopReason::Timeout => "timeout",
            StopReason::Interrupted => "interrupted",
            StopReason::AllSkipped => "all_skipped",
        };
        f.write_str(s)
    }
}

/// The live signals/counters the stop machine consults. Each field mirrors
/// one condition in §4.7; `decide` applies the fixed precedence order of §8:
/// `Interrupted > Timeout > ConsecutiveFailures > MaxIterations > AllSkipped
/// > Normal`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StopSignals {
    pub interrupted: bool,
    pub timed_out: bool,
    pub consecutive_failures_breached: bool,
    pub max_iterations_reached: bool,
    pub all_skipped: bool,
    pub selection_exhausted: bool,
}

/// Apply the stop precedence order and return a reason if any condition
/// holds, or `None` if the scheduler should keep iterating.
pub fn decide(signals: StopSignals) -> Option<StopReason> {
    if signals.interrupted {
        return Some(StopReason::Interrupted);
    }
    if signals.timed_out {
        return Some(StopReason::Timeout);
    }
    if signals.consecutive_failures_breached {
        return Some(StopReason::ConsecutiveFailures);
    }
    if signals.max_iterations_reached {
        return Some(StopReason::MaxIterations);
    }
    if signals.all_skipped {
        return Some(StopReason::AllSkipped);
    }
    if signals.selection_exhausted {
        return Some(StopReason::Normal);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_table() {
        assert_eq!(StopReason::Normal.exit_code(), 0);
        assert_eq!(StopReason::MaxIterations.exit_code(), 2);
        assert_eq!(StopReason::ConsecutiveFailures.exit_code(), 3);
        assert_eq!(StopReason::Timeout.exit_code(), 4);
        assert_eq!(StopReason::Interrupted.exit_code(), 5);
        assert_eq!(StopReason::AllSkipped.exit_code(), 6);
    }

    #[test]
    fn no_signals_means_keep_going() {
        assert_eq!(decide(StopSignals::default()), None);
    }

    #[test]
    fn precedence_interrupted_beats_everything() {
        let signals = StopSignals {
            interrupted: true,
            timed_out: true,
            consecutive_failures_breached: true,
            max_iterations_reached: true,
            all_skipped: true,
            selection_exhausted: true,
        };
        assert_eq!(decide(signals), Some(StopReason::Interrupted));
    }

    #[test]
    fn precedence_timeout_beats_consecutive_failures() {
        let signals = StopSignals {
            timed_out: true,
            consecutive_failures_breached: true,
            ..Default::default()
        };
        assert_eq!(decide(signals), Some(StopReason::Timeout));
    }

    #[test]
    fn precedence_consecutive_failures_beats_max_iterations() {
        let signals = StopSignals {
            consecutive_failures_breached: true,
            max_iterations_reached: true,
            ..Default::default()
        };
        assert_eq!(decide(signals), Some(StopReason::ConsecutiveFailures));
    }

    #[test]
    fn precedence_max_iterations_beats_all_skipped() {
        let signals = StopSignals {
            max_iterations_reached: true,
            all_skipped: true,
            ..Default::default()
        };
        assert_eq!(decide(signals), Some(StopReason::MaxIterations));
    }

    #[test]
    fn precedence_all_skipped_beats_normal() {
        let signals = StopSignals {
            all_skipped: true,
            selection_exhausted: true,
            ..Default::default()
        };
        assert_eq!(decide(signals), Some(StopReason::AllSkipped));
    }

    #[test]
    fn selection_exhausted_alone_is_normal() {
        let signals = StopSignals {
            selection_exhausted: true,
            ..Default::default()
        };
        assert_eq!(decide(signals), Some(StopReason::Normal));
    }
}
