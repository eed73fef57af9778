//! Scheduler: the top-level control loop. Picks the next item, dispatches
//! up to `max_parallel` Iterations in parallel, tracks stop-condition
//! counters, and reports a terminal [`StopReason`] (§4.7).
//!
//! Modeled on `run_orchestrator()` in the teacher's
//! `orchestrator/mod.rs`: a `tokio::sync::Semaphore` bounding concurrent
//! `tokio::spawn`s, an `mpsc` completion channel drained in a
//! `tokio::select! { rx.recv() ..., cancel.cancelled() ... }` loop, and a
//! brief sleep when idle to avoid a busy loop. The teacher's DB-backed
//! retry/escalate sweep has no counterpart here (this spec classifies an
//! outcome once per Iteration via the evaluator rather than persisting
//! retry counts); what's kept is the shape of serialized,
//! completion-channel-driven stop-condition evaluation.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::agent::{AgentCommand, AgentExecutor};
use crate::config::{LoopConfig, SelectionMode};
use crate::evaluator::{Evaluator, IterationOutcome};
use crate::issue_client::IssueClient;
use crate::item::{Item, ItemId, ItemStatus};
use crate::progress::{ProgressBus, ProgressEvent};
use crate::stop::{self, StopReason, StopSignals};
use crate::trace::{TraceAggregator, TraceEvent, TraceEventType};
use crate::worktree::WorktreeManager;

/// Idle poll interval when nothing is ready and nothing is in flight, to
/// avoid a busy loop (mirrors the teacher's 50ms idle sleep).
const IDLE_POLL: Duration = Duration::from_millis(50);

/// How long the scheduler waits for in-flight Iterations to drain after a
/// stop decision before giving up on a clean wait.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct SchedulerSummary {
    pub stop_reason: StopReason,
    pub iterations_done: u32,
    pub outcomes: Vec<(ItemId, IterationOutcome)>,
}

struct IterationDone {
    item_id: ItemId,
    outcome: IterationOutcome,
}

pub struct Scheduler {
    config: LoopConfig,
    issue_client: Arc<dyn IssueClient>,
    worktree_mgr: WorktreeManager,
    executor: Arc<AgentExecutor>,
    evaluator: Arc<Evaluator>,
    trace: Arc<TraceAggregator>,
    progress: ProgressBus,
    agent_command: AgentCommand,
}

impl Scheduler {
    pub fn new(
        config: LoopConfig,
        issue_client: Arc<dyn IssueClient>,
        worktree_mgr: WorktreeManager,
        trace: Arc<TraceAggregator>,
        progress: ProgressBus,
        agent_command: AgentCommand,
    ) -> Self {
        let evaluator = Arc::new(Evaluator::new(config.strict_landing));
        let executor = Arc::new(AgentExecutor::new(progress.clone(), Arc::clone(&trace)));
        Self { config, issue_client, worktree_mgr, executor, evaluator, trace, progress, agent_command }
    }

    pub async fn run(&self, cancel: CancellationToken) -> SchedulerSummary {
        let trace_id = Uuid::new_v4().to_string();
        let loop_span_id = Uuid::new_v4().to_string();

        let mut loop_attrs = std::collections::HashMap::new();
        loop_attrs.insert("workdir".to_string(), self.config.workdir.clone());
        self.trace
            .ingest(TraceEvent {
                trace_id: trace_id.clone(),
                span_id: loop_span_id.clone(),
                parent_id: String::new(),
                kind: TraceEventType::LoopStart,
                name: "loop".to_string(),
                timestamp: Utc::now(),
                attributes: loop_attrs,
            })
            .await;

        let semaphore = Arc::new(Semaphore::new(self.config.max_parallel));
        let (tx, mut rx) = mpsc::channel::<IterationDone>(self.config.max_parallel * 2 + 1);
        let deadline_start = tokio::time::Instant::now();

        let mut in_flight: HashSet<ItemId> = HashSet::new();
        let mut iterations_done: u32 = 0;
        let mut consecutive_failures: u32 = 0;
        let mut any_iteration = false;
        let mut all_skipped = true;
        let mut outcomes: Vec<(ItemId, IterationOutcome)> = Vec::new();
        let mut targeted_dispatched = false;
        let mut epic_empty_passes: u8 = 0;

        let stop_reason = loop {
            while let Ok(done) = rx.try_recv() {
                in_flight.remove(&done.item_id);
                iterations_done += 1;
                any_iteration = true;
                if done.outcome.is_success() {
                    consecutive_failures = 0;
                } else if done.outcome.counts_as_failure() {
                    consecutive_failures += 1;
                }
                if done.outcome != IterationOutcome::Skipped {
                    all_skipped = false;
                }
                self.progress.publish(ProgressEvent::StatusChange {
                    message: format!("{} -> {:?}", done.item_id, done.outcome),
                });
                outcomes.push((done.item_id, done.outcome));
            }

            let candidates = match self.select_candidates(&in_flight, &mut targeted_dispatched).await {
                Ok(items) => items,
                Err(e) => {
                    tracing::warn!(error = %e, "tracker query failed at selection, treating as no work");
                    Vec::new()
                }
            };

            if !candidates.is_empty() {
                epic_empty_passes = 0;
            }

            let selection_exhausted = candidates.is_empty() && in_flight.is_empty();
            if selection_exhausted
                && matches!(self.config.selection_mode(), SelectionMode::Epic(_))
                && epic_empty_passes == 0
            {
                epic_empty_passes = 1;
                continue;
            }

            // In targeted mode `max_iterations` is forced to 1 (config.rs)
            // purely to cap the single-shot run at one attempt, not as a
            // real budget; once that one Iteration completes, selection
            // exhaustion alone must resolve to `Normal` (§8 scenarios 2/3),
            // so the raw counter comparison is suppressed there.
            let is_targeted = matches!(self.config.selection_mode(), SelectionMode::Targeted(_));
            let signals = StopSignals {
                interrupted: cancel.is_cancelled(),
                timed_out: deadline_start.elapsed() > self.config.global_timeout,
                consecutive_failures_breached: consecutive_failures >= self.config.consecutive_failure_limit,
                max_iterations_reached: !is_targeted && iterations_done >= self.config.max_iterations,
                all_skipped: any_iteration && all_skipped && in_flight.is_empty(),
                selection_exhausted,
            };

            if let Some(reason) = stop::decide(signals) {
                break reason;
            }

            let available = self.config.max_parallel.saturating_sub(in_flight.len());
            let remaining_budget =
                self.config.max_iterations.saturating_sub(iterations_done + in_flight.len() as u32);
            let slots = available.min(remaining_budget as usize);

            let mut spawned_any = false;
            for item in candidates.into_iter().take(slots) {
                let permit = match Arc::clone(&semaphore).try_acquire_owned() {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                in_flight.insert(item.id.clone());
                spawned_any = true;
                self.spawn_worker(item, permit, &tx, &trace_id, &loop_span_id, &cancel);
            }

            if !spawned_any {
                if !in_flight.is_empty() {
                    tokio::select! {
                        _ = cancel.cancelled() => continue,
                        maybe_done = rx.recv() => {
                            if let Some(done) = maybe_done {
                                in_flight.remove(&done.item_id);
                                iterations_done += 1;
                                any_iteration = true;
                                if done.outcome.is_success() {
                                    consecutive_failures = 0;
                                } else if done.outcome.counts_as_failure() {
                                    consecutive_failures += 1;
                                }
                                if done.outcome != IterationOutcome::Skipped {
                                    all_skipped = false;
                                }
                                outcomes.push((done.item_id, done.outcome));
                            }
                        }
                    }
                } else {
                    tokio::select! {
                        _ = cancel.cancelled() => continue,
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                    }
                }
            }
        };

        // A stop decision cancels the shared context; in-flight Iterations
        // are terminated by their executors (§5).
        cancel.cancel();

        self.drain_in_flight(&mut rx, &mut in_flight, &mut iterations_done, &mut outcomes).await;

        let mut end_attrs = std::collections::HashMap::new();
        end_attrs.insert("stop_reason".to_string(), stop_reason.to_string());
        self.trace
            .ingest(TraceEvent {
                trace_id: trace_id.clone(),
                span_id: loop_span_id.clone(),
                parent_id: String::new(),
                kind: TraceEventType::LoopEnd,
                name: "loop".to_string(),
                timestamp: Utc::now(),
                attributes: end_attrs,
            })
            .await;

        SchedulerSummary { stop_reason, iterations_done, outcomes }
    }

    async fn drain_in_flight(
        &self,
        rx: &mut mpsc::Receiver<IterationDone>,
        in_flight: &mut HashSet<ItemId>,
        iterations_done: &mut u32,
        outcomes: &mut Vec<(ItemId, IterationOutcome)>,
    ) {
        let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
        while !in_flight.is_empty() {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(done)) => {
                    in_flight.remove(&done.item_id);
                    *iterations_done += 1;
                    outcomes.push((done.item_id, done.outcome));
                }
                _ => {
                    tracing::warn!(remaining = in_flight.len(), "drain timeout, some worktrees may leak");
                    break;
                }
            }
        }
    }

    async fn select_candidates(
        &self,
        in_flight: &HashSet<ItemId>,
        targeted_dispatched: &mut bool,
    ) -> Result<Vec<Item>, crate::issue_client::IssueClientError> {
        match self.config.selection_mode() {
            SelectionMode::Targeted(id) => {
                if *targeted_dispatched || in_flight.contains(&id) {
                    return Ok(Vec::new());
                }
                match self.issue_client.get(&self.config.workdir, &id).await? {
                    Some(item) if item.status != ItemStatus::Closed => {
                        *targeted_dispatched = true;
                        Ok(vec![item])
                    }
                    _ => Ok(Vec::new()),
                }
            }
            SelectionMode::Epic(epic_id) => {
                let items = self.issue_client.ready_children(&self.config.workdir, &epic_id).await?;
                Ok(items.into_iter().filter(|i| !in_flight.contains(&i.id)).collect())
            }
            SelectionMode::Repo => {
                let items = self.issue_client.list_for_repo(&self.config.workdir).await?;
                Ok(items.into_iter().filter(|i| !in_flight.contains(&i.id)).collect())
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_worker(
        &self,
        item: Item,
        permit: tokio::sync::OwnedSemaphorePermit,
        tx: &mpsc::Sender<IterationDone>,
        trace_id: &str,
        loop_span_id: &str,
        cancel: &CancellationToken,
    ) {
        let issue_client = Arc::clone(&self.issue_client);
        let worktree_mgr = self.worktree_mgr.clone();
        let executor = Arc::clone(&self.executor);
        let evaluator = Arc::clone(&self.evaluator);
        let command = self.agent_command.clone();
        let workdir = self.config.workdir.clone();
        let agent_timeout = self.config.agent_timeout;
        let dry_run = self.config.dry_run;
        let trace_id = trace_id.to_string();
        let loop_span_id = loop_span_id.to_string();
        let tx = tx.clone();
        let cancel = cancel.clone();
        let item_id = item.id.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let outcome = run_one_iteration(
                issue_client.as_ref(),
                &worktree_mgr,
                &executor,
                &evaluator,
                &workdir,
                &item,
                &command,
                agent_timeout,
                dry_run,
                &trace_id,
                &loop_span_id,
                &cancel,
            )
            .await;
            let _ = tx.send(IterationDone { item_id, outcome }).await;
        });
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_one_iteration(
    issue_client: &dyn IssueClient,
    worktree_mgr: &WorktreeManager,
    executor: &AgentExecutor,
    evaluator: &Evaluator,
    workdir: &str,
    item: &Item,
    command: &AgentCommand,
    agent_timeout: Duration,
    dry_run: bool,
    trace_id: &str,
    loop_span_id: &str,
    cancel: &CancellationToken,
) -> IterationOutcome {
    let mgr = worktree_mgr.clone();
    let item_id = item.id.clone();
    let acquired = tokio::task::spawn_blocking(move || mgr.acquire(&item_id)).await;

    let handle = match acquired {
        Ok(Ok(handle)) => handle,
        Ok(Err(e)) => {
            tracing::error!(item_id = %item.id, error = %e, "worktree acquisition failed");
            return IterationOutcome::AgentError;
        }
        Err(e) => {
            tracing::error!(item_id = %item.id, error = %e, "worktree acquisition task panicked");
            return IterationOutcome::AgentError;
        }
    };

    let run_result = match executor
        .run(trace_id, loop_span_id, item, &handle, command, agent_timeout, dry_run, cancel)
        .await
    {
        Ok(result) => result,
        Err(e) => {
            tracing::error!(item_id = %item.id, error = %e, "agent executor failed");
            release(worktree_mgr, &handle).await;
            return IterationOutcome::AgentError;
        }
    };

    let outcome = match evaluator.evaluate(issue_client, worktree_mgr, workdir, item, &handle, &run_result).await {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(item_id = %item.id, error = %e, "evaluator failed");
            IterationOutcome::AgentError
        }
    };

    release(worktree_mgr, &handle).await;
    outcome
}

async fn release(worktree_mgr: &WorktreeManager, handle: &crate::worktree::WorktreeHandle) {
    let mgr = worktree_mgr.clone();
    let handle = handle.clone();
    if let Err(e) = tokio::task::spawn_blocking(move || mgr.release(&handle)).await {
        tracing::error!(error = %e, "worktree release task panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::issue_client::FakeIssueClient;
    use crate::item::IssueType;
    use std::process::Command;
    use tempfile::TempDir;

    fn item(id: &str, status: ItemStatus, priority: i64) -> Item {
        Item {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            status,
            priority,
            labels: vec![],
            issue_type: IssueType::Task,
            dependencies: vec![],
            created_at: Utc::now(),
        }
    }

    fn create_temp_repo() -> (TempDir, std::path::PathBuf) {
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
        (dir, repo_path)
    }

    fn scheduler_for(repo_path: &std::path::Path, issue_client: FakeIssueClient, config: LoopConfig) -> Scheduler {
        let worktree_mgr = WorktreeManager::new(repo_path, None, config.max_parallel).unwrap();
        let trace = Arc::new(TraceAggregator::with_noop_exporter(10));
        let progress = ProgressBus::new();
        let command = AgentCommand::new("true", vec![]);
        Scheduler::new(config, Arc::new(issue_client), worktree_mgr, trace, progress, command)
    }

    #[tokio::test]
    async fn empty_tracker_stops_normal_with_zero_iterations() {
        let (_dir, repo_path) = create_temp_repo();
        let issue_client = FakeIssueClient::new(vec![]);
        let config = LoopConfig::new(
            repo_path.display().to_string(),
            None,
            None,
            LoopConfig::DEFAULT_MAX_ITERATIONS,
            Duration::from_secs(5),
            LoopConfig::DEFAULT_CONSECUTIVE_FAILURE_LIMIT,
            Duration::from_secs(30),
            1,
            false,
            true,
        )
        .unwrap();
        let scheduler = scheduler_for(&repo_path, issue_client, config);

        let summary = scheduler.run(CancellationToken::new()).await;
        assert_eq!(summary.stop_reason, StopReason::Normal);
        assert_eq!(summary.iterations_done, 0);
    }

    #[tokio::test]
    async fn targeted_item_closed_by_agent_reports_success() {
        let (_dir, repo_path) = create_temp_repo();
        let issue_client = FakeIssueClient::new(vec![item("item-1", ItemStatus::Open, 1)]);
        let config = LoopConfig::new(
            repo_path.display().to_string(),
            None,
            Some("item-1".to_string()),
            LoopConfig::DEFAULT_MAX_ITERATIONS,
            Duration::from_secs(5),
            LoopConfig::DEFAULT_CONSECUTIVE_FAILURE_LIMIT,
            Duration::from_secs(30),
            1,
            false,
            true,
        )
        .unwrap();

        let worktree_mgr = WorktreeManager::new(&repo_path, None, 1).unwrap();
        let trace = Arc::new(TraceAggregator::with_noop_exporter(10));
        let progress = ProgressBus::new();
        // The fake agent commits a change and exits 0; a concurrent task
        // closes the item out-of-band, standing in for the agent's own
        // `bd close` call against the real tracker.
        let commit_script = format!(
            "sleep 0.1 && cd {} && git commit --allow-empty -m agent-commit -q",
            repo_path.display()
        );
        let command = AgentCommand::new("sh", vec!["-c".to_string(), commit_script]);

        let scheduler =
            Scheduler::new(config, Arc::new(issue_client.clone()), worktree_mgr, trace, progress, command);

        let closer = {
            let issue_client = issue_client.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                issue_client.close("/tmp", "item-1").await.unwrap();
            })
        };

        let summary = scheduler.run(CancellationToken::new()).await;
        closer.await.unwrap();

        assert_eq!(summary.iterations_done, 1);
        assert_eq!(summary.outcomes[0].1, IterationOutcome::Success);
        assert_eq!(summary.stop_reason, StopReason::Normal);
    }

    #[tokio::test]
    async fn global_timeout_stops_the_loop() {
        let (_dir, repo_path) = create_temp_repo();
        let issue_client = FakeIssueClient::new(vec![item("item-1", ItemStatus::Open, 1)]);
        let config = LoopConfig::new(
            repo_path.display().to_string(),
            None,
            None,
            LoopConfig::DEFAULT_MAX_ITERATIONS,
            Duration::from_secs(60),
            LoopConfig::DEFAULT_CONSECUTIVE_FAILURE_LIMIT,
            Duration::from_millis(50),
            1,
            false,
            true,
        )
        .unwrap();

        let worktree_mgr = WorktreeManager::new(&repo_path, None, 1).unwrap();
        let trace = Arc::new(TraceAggregator::with_noop_exporter(10));
        let progress = ProgressBus::new();
        let command = AgentCommand::new("sleep", vec!["30".to_string()]);
        let scheduler = Scheduler::new(config, Arc::new(issue_client), worktree_mgr, trace, progress, command);

        let summary = scheduler.run(CancellationToken::new()).await;
        assert_eq!(summary.stop_reason, StopReason::Timeout);
    }
}
