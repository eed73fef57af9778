//! Iteration evaluator: classifies a completed agent run as one of five
//! outcomes by probing tracker and worktree state (§4.6).
//!
//! Follows the teacher's `gate/evaluator.rs` "probe then classify" shape
//! (`evaluate_verdict()`: a `GateVerdict` plus the task's `gate_policy`
//! maps to a `GateAction`), generalized from that Passed/Failed/
//! HumanRequired trichotomy to this spec's five-way outcome set. The
//! worktree dirty-check uses the same `git status --porcelain` primitive
//! the teacher's lifecycle code uses to detect uncommitted agent work.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;

use crate::agent::IterationRunResult;
use crate::issue_client::{IssueClient, IssueClientError};
use crate::item::{Item, ItemId, ItemStatus};
use crate::worktree::{WorktreeError, WorktreeHandle, WorktreeManager};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IterationOutcome {
    Success,
    Failure,
    Skipped,
    AgentError,
    LandingIncomplete,
}

impl IterationOutcome {
    /// Whether this outcome resets the scheduler's consecutive-failure
    /// counter (§4.7: "success resets the counter; skipped does not").
    pub fn is_success(self) -> bool {
        matches!(self, IterationOutcome::Success)
    }

    /// Whether this outcome counts toward the scheduler's
    /// `consecutive_failures` limit (§4.7: agent_error and
    /// landing_incomplete both count).
    pub fn counts_as_failure(self) -> bool {
        matches!(
            self,
            IterationOutcome::Failure | IterationOutcome::AgentError | IterationOutcome::LandingIncomplete
        )
    }
}

#[derive(Debug, Error)]
pub enum EvaluatorError {
    #[error(transparent)]
    IssueClient(#[from] IssueClientError),
    #[error(transparent)]
    Worktree(#[from] WorktreeError),
}

/// Evaluates agent runs and tracks the "twice consecutively {skipped,
/// failure}" streak per item id (§4.6 step 5). The streak lives only for
/// the lifetime of one scheduler run; it is never persisted.
pub struct Evaluator {
    strict_landing: bool,
    streaks: Mutex<HashMap<ItemId, u32>>,
}

impl Evaluator {
    pub fn new(strict_landing: bool) -> Self {
        Self { strict_landing, streaks: Mutex::new(HashMap::new()) }
    }

    /// Classify one completed Iteration.
    ///
    /// 1. A non-zero exit or timed-out agent is always `agent_error`.
    /// 2. Otherwise the tracker is re-queried for `item`'s current status.
    /// 3. The worktree is probed for uncommitted changes.
    /// 4. Under `strict_landing`, success requires both closed and clean;
    ///    otherwise only closed-ness decides success vs. failure.
    /// 5. An item that has now produced `{skipped, failure}` twice in a row
    ///    is reclassified as `skipped`.
    pub async fn evaluate(
        &self,
        issue_client: &dyn IssueClient,
        worktree_mgr: &WorktreeManager,
        workdir: &str,
        item: &Item,
        worktree: &WorktreeHandle,
        run_result: &IterationRunResult,
    ) -> Result<IterationOutcome, EvaluatorError> {
        if run_result.timed_out || !run_result.exit_success {
            return Ok(self.record(&item.id, IterationOutcome::AgentError));
        }

        let refreshed = issue_client.get(workdir, &item.id).await?;
        let closed = refreshed.map(|i| i.status == ItemStatus::Closed).unwrap_or(false);
        let dirty = worktree_mgr.has_uncommitted_changes(worktree)?;

        let outcome = if self.strict_landing {
            if closed && !dirty { IterationOutcome::Success } else { IterationOutcome::LandingIncomplete }
        } else if closed {
            IterationOutcome::Success
        } else {
            IterationOutcome::Failure
        };

        Ok(self.record(&item.id, outcome))
    }

    /// Update the per-item streak and override to `Skipped` once the
    /// streak reaches two consecutive `{Skipped, Failure}` outcomes. Any
    /// other outcome breaks the streak.
    fn record(&self, item_id: &str, outcome: IterationOutcome) -> IterationOutcome {
        let mut streaks = self.streaks.lock().unwrap_or_else(|e| e.into_inner());
        match outcome {
            IterationOutcome::Failure | IterationOutcome::Skipped => {
                let streak = streaks.entry(item_id.to_string()).or_insert(0);
                *streak += 1;
                if *streak >= 2 {
                    IterationOutcome::Skipped
                } else {
                    outcome
                }
            }
            other => {
                streaks.insert(item_id.to_string(), 0);
                other
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue_client::FakeIssueClient;
    use crate::item::IssueType;
    use std::process::Command;
    use tempfile::TempDir;

    fn item(id: &str, status: ItemStatus) -> Item {
        Item {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            status,
            priority: 1,
            labels: vec![],
            issue_type: IssueType::Task,
            dependencies: vec![],
            created_at: chrono::Utc::now(),
        }
    }

    fn run_result(exit_success: bool, timed_out: bool) -> IterationRunResult {
        IterationRunResult {
            trace_id: "t".to_string(),
            span_id: "s".to_string(),
            exit_success,
            timed_out,
            duration_ms: 0,
        }
    }

    fn create_temp_repo() -> (TempDir, WorktreeManager, WorktreeHandle) {
        let dir = TempDir::new().unwrap();
        let repo_path = dir.path().to_path_buf();
        Command::new("git").args(["init"]).current_dir(&repo_path).output().unwrap();
        let _ = Command::new("git")
            .args(["config", "user.email", "ralph@example.test"])
            .current_dir(&repo_path)
            .output();
        let _ = Command::new("git")
            .args(["config", "user.name", "Ralph Test"])
            .current_dir(&repo_path)
            .output();
        std::fs::write(repo_path.join("README.md"), "hello\n").unwrap();
        let _ = Command::new("git").args(["add", "."]).current_dir(&repo_path).output();
        Command::new("git").args(["commit", "-m", "init"]).current_dir(&repo_path).output().unwrap();

        let mgr = WorktreeManager::new(&repo_path, None, 1).unwrap();
        let handle = mgr.acquire("item-1").unwrap();
        (dir, mgr, handle)
    }

    #[tokio::test]
    async fn nonzero_exit_is_agent_error() {
        let (_dir, mgr, handle) = create_temp_repo();
        let issue_client = FakeIssueClient::new(vec![item("item-1", ItemStatus::Open)]);
        let evaluator = Evaluator::new(true);
        let it = item("item-1", ItemStatus::Open);

        let outcome = evaluator
            .evaluate(&issue_client, &mgr, "/tmp", &it, &handle, &run_result(false, false))
            .await
            .unwrap();
        assert_eq!(outcome, IterationOutcome::AgentError);
    }

    #[tokio::test]
    async fn timeout_is_agent_error() {
        let (_dir, mgr, handle) = create_temp_repo();
        let issue_client = FakeIssueClient::new(vec![item("item-1", ItemStatus::Open)]);
        let evaluator = Evaluator::new(true);
        let it = item("item-1", ItemStatus::Open);

        let outcome = evaluator
            .evaluate(&issue_client, &mgr, "/tmp", &it, &handle, &run_result(true, true))
            .await
            .unwrap();
        assert_eq!(outcome, IterationOutcome::AgentError);
    }

    #[tokio::test]
    async fn strict_landing_requires_closed_and_clean() {
        let (_dir, mgr, handle) = create_temp_repo();
        let issue_client = FakeIssueClient::new(vec![item("item-1", ItemStatus::Closed)]);
        let evaluator = Evaluator::new(true);
        let it = item("item-1", ItemStatus::Open);

        // closed, clean -> success
        let outcome = evaluator
            .evaluate(&issue_client, &mgr, "/tmp", &it, &handle, &run_result(true, false))
            .await
            .unwrap();
        assert_eq!(outcome, IterationOutcome::Success);
    }

    #[tokio::test]
    async fn strict_landing_fails_when_dirty_even_if_closed() {
        let (_dir, mgr, handle) = create_temp_repo();
        std::fs::write(handle.path().join("leftover.txt"), "uncommitted").unwrap();
        let issue_client = FakeIssueClient::new(vec![item("item-1", ItemStatus::Closed)]);
        let evaluator = Evaluator::new(true);
        let it = item("item-1", ItemStatus::Open);

        let outcome = evaluator
            .evaluate(&issue_client, &mgr, "/tmp", &it, &handle, &run_result(true, false))
            .await
            .unwrap();
        assert_eq!(outcome, IterationOutcome::LandingIncomplete);
    }

    #[tokio::test]
    async fn non_strict_landing_only_requires_closed() {
        let (_dir, mgr, handle) = create_temp_repo();
        std::fs::write(handle.path().join("leftover.txt"), "uncommitted").unwrap();
        let issue_client = FakeIssueClient::new(vec![item("item-1", ItemStatus::Closed)]);
        let evaluator = Evaluator::new(false);
        let it = item("item-1", ItemStatus::Open);

        let outcome = evaluator
            .evaluate(&issue_client, &mgr, "/tmp", &it, &handle, &run_result(true, false))
            .await
            .unwrap();
        assert_eq!(outcome, IterationOutcome::Success);
    }

    #[tokio::test]
    async fn open_item_after_clean_exit_is_failure_under_non_strict() {
        let (_dir, mgr, handle) = create_temp_repo();
        let issue_client = FakeIssueClient::new(vec![item("item-1", ItemStatus::Open)]);
        let evaluator = Evaluator::new(false);
        let it = item("item-1", ItemStatus::Open);

        let outcome = evaluator
            .evaluate(&issue_client, &mgr, "/tmp", &it, &handle, &run_result(true, false))
            .await
            .unwrap();
        assert_eq!(outcome, IterationOutcome::Failure);
    }

    #[tokio::test]
    async fn two_consecutive_failures_become_skipped() {
        let (_dir, mgr, handle) = create_temp_repo();
        let issue_client = FakeIssueClient::new(vec![item("item-1", ItemStatus::Open)]);
        let evaluator = Evaluator::new(false);
        let it = item("item-1", ItemStatus::Open);

        let first = evaluator
            .evaluate(&issue_client, &mgr, "/tmp", &it, &handle, &run_result(true, false))
            .await
            .unwrap();
        assert_eq!(first, IterationOutcome::Failure);

        let second = evaluator
            .evaluate(&issue_client, &mgr, "/tmp", &it, &handle, &run_result(true, false))
            .await
            .unwrap();
        assert_eq!(second, IterationOutcome::Skipped);
    }

    #[tokio::test]
    async fn a_success_in_between_resets_the_streak() {
        let (_dir, mgr, handle) = create_temp_repo();
        let evaluator = Evaluator::new(false);

        let open_item = item("item-1", ItemStatus::Open);
        let closed_item = item("item-1", ItemStatus::Closed);

        let issue_client = FakeIssueClient::new(vec![open_item.clone()]);
        let outcome = evaluator
            .evaluate(&issue_client, &mgr, "/tmp", &open_item, &handle, &run_result(true, false))
            .await
            .unwrap();
        assert_eq!(outcome, IterationOutcome::Failure);

        issue_client.set_items(vec![closed_item.clone()]).await;
        let outcome = evaluator
            .evaluate(&issue_client, &mgr, "/tmp", &open_item, &handle, &run_result(true, false))
            .await
            .unwrap();
        assert_eq!(outcome, IterationOutcome::Success);

        issue_client.set_items(vec![open_item.clone()]).await;
        let outcome = evaluator
            .evaluate(&issue_client, &mgr, "/tmp", &open_item, &handle, &run_result(true, false))
            .await
            .unwrap();
        assert_eq!(outcome, IterationOutcome::Failure, "streak should have reset after the success");
    }
}
