//! `LoopConfig`: the immutable-after-creation configuration a scheduler run
//! is built from, plus the validation rules of §3/§6.
//!
//! There is no config-file layer: "no persisted state between runs" extends
//! to configuration, so this module resolves a `LoopConfig` from an
//! already-parsed CLI struct plus environment variables only (the
//! teacher's `GatorConfig::resolve` chain with the config-file rung
//! removed, per SPEC_FULL.md §1).

use std::time::Duration;

use thiserror::Error;

use crate::item::ItemId;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("--epic requires --max-parallel=1 (got {0})")]
    EpicRequiresSequential(usize),
    #[error("--sequential conflicts with --max-parallel={0} (sequential means max-parallel=1)")]
    SequentialConflictsWithMaxParallel(usize),
    #[error("max_parallel must be at least 1")]
    MaxParallelZero,
    #[error("workdir must not be empty")]
    EmptyWorkdir,
}

/// Immutable configuration for one scheduler run.
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub workdir: String,
    pub epic_id: Option<ItemId>,
    pub target_item_id: Option<ItemId>,
    pub max_iterations: u32,
    pub agent_timeout: Duration,
    pub consecutive_failure_limit: u32,
    pub global_timeout: Duration,
    pub max_parallel: usize,
    pub dry_run: bool,
    pub strict_landing: bool,
}

impl LoopConfig {
    pub const DEFAULT_MAX_ITERATIONS: u32 = 20;
    pub const DEFAULT_AGENT_TIMEOUT: Duration = Duration::from_secs(10 * 60);
    pub const DEFAULT_CONSECUTIVE_FAILURE_LIMIT: u32 = 3;
    pub const DEFAULT_GLOBAL_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);
    pub const DEFAULT_MAX_PARALLEL: usize = 1;
    pub const DEFAULT_STRICT_LANDING: bool = true;

    /// A builder that applies the data-model constraints of §3 and the
    /// CLI conflict rules of §6: if `epic_id` is set then `max_parallel`
    /// must be 1; if `target_item_id` is set, `max_iterations` is forced
    /// to 1.
    pub fn new(
        workdir: impl Into<String>,
        epic_id: Option<ItemId>,
        target_item_id: Option<ItemId>,
        max_iterations: u32,
        agent_timeout: Duration,
        consecutive_failure_limit: u32,
        global_timeout: Duration,
        max_parallel: usize,
        dry_run: bool,
        strict_landing: bool,
    ) -> Result<Self, ConfigError> {
        let workdir = workdir.into();
        if workdir.is_empty() {
            return Err(ConfigError::EmptyWorkdir);
        }
        if max_parallel == 0 {
            return Err(ConfigError::MaxParallelZero);
        }
        if epic_id.is_some() && max_parallel != 1 {
            return Err(ConfigError::EpicRequiresSequential(max_parallel));
        }
        let max_iterations = if target_item_id.is_some() { 1 } else { max_iterations };

        Ok(Self {
            workdir,
            epic_id,
            target_item_id,
            max_iterations,
            agent_timeout,
            consecutive_failure_limit,
            global_timeout,
            max_parallel,
            dry_run,
            strict_landing,
        })
    }

    pub fn selection_mode(&self) -> SelectionMode {
        if let Some(id) = &self.target_item_id {
            SelectionMode::Targeted(id.clone())
        } else if let Some(id) = &self.epic_id {
            SelectionMode::Epic(id.clone())
        } else {
            SelectionMode::Repo
        }
    }
}

/// The scheduler's selection strategy, derived from `LoopConfig`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionMode {
    Targeted(ItemId),
    Epic(ItemId),
    Repo,
}

/// Validates the `--sequential` vs `--max-parallel` CLI conflict rule of
/// §6: `--sequential` is sugar for `--max-parallel=1`, so any explicit
/// `--max-parallel` other than 1 alongside it is a user error rather than
/// a silent override.
pub fn check_sequential_conflict(sequential: bool, max_parallel: usize) -> Result<usize, ConfigError> {
    if sequential {
        if max_parallel != 1 && max_parallel != LoopConfig::DEFAULT_MAX_PARALLEL {
            return Err(ConfigError::SequentialConflictsWithMaxParallel(max_parallel));
        }
        return Ok(1);
    }
    Ok(max_parallel)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> (u32, Duration, u32, Duration, usize, bool, bool) {
        (
            LoopConfig::DEFAULT_MAX_ITERATIONS,
            LoopConfig::DEFAULT_AGENT_TIMEOUT,
            LoopConfig::DEFAULT_CONSECUTIVE_FAILURE_LIMIT,
            LoopConfig::DEFAULT_GLOBAL_TIMEOUT,
            LoopConfig::DEFAULT_MAX_PARALLEL,
            false,
            LoopConfig::DEFAULT_STRICT_LANDING,
        )
    }

    #[test]
    fn epic_forces_sequential_error_when_parallel_requested() {
        let (mi, at, cfl, gt, _, dr, sl) = base();
        let err = LoopConfig::new("/repo", Some("e1".into()), None, mi, at, cfl, gt, 3, dr, sl)
            .unwrap_err();
        assert_eq!(err, ConfigError::EpicRequiresSequential(3));
    }

    #[test]
    fn target_item_forces_max_iterations_to_one() {
        let (_, at, cfl, gt, mp, dr, sl) = base();
        let cfg = LoopConfig::new("/repo", None, Some("t1".into()), 20, at, cfl, gt, mp, dr, sl)
            .unwrap();
        assert_eq!(cfg.max_iterations, 1);
    }

    #[test]
    fn empty_workdir_rejected() {
        let (mi, at, cfl, gt, mp, dr, sl) = base();
        let err = LoopConfig::new("", None, None, mi, at, cfl, gt, mp, dr, sl).unwrap_err();
        assert_eq!(err, ConfigError::EmptyWorkdir);
    }

    #[test]
    fn zero_max_parallel_rejected() {
        let (mi, at, cfl, gt, _, dr, sl) = base();
        let err = LoopConfig::new("/repo", None, None, mi, at, cfl, gt, 0, dr, sl).unwrap_err();
        assert_eq!(err, ConfigError::MaxParallelZero);
    }

    #[test]
    fn selection_mode_precedence_target_over_epic() {
        let (mi, at, cfl, gt, mp, dr, sl) = base();
        let cfg = LoopConfig::new(
            "/repo",
            Some("e1".into()),
            Some("t1".into()),
            mi,
            at,
            cfl,
            gt,
            mp,
            dr,
            sl,
        )
        .unwrap();
        assert_eq!(cfg.selection_mode(), SelectionMode::Targeted("t1".into()));
    }

    #[test]
    fn sequential_conflicts_with_explicit_max_parallel() {
        let err = check_sequential_conflict(true, 4).unwrap_err();
        assert_eq!(err, ConfigError::SequentialConflictsWithMaxParallel(4));
    }

    #[test]
    fn sequential_with_default_max_parallel_is_fine() {
        assert_eq!(check_sequential_conflict(true, 1).unwrap(), 1);
    }
}
