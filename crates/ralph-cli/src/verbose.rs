//! Headless verbose-mode reporter: a `ProgressBus` subscriber that prints
//! one line per event to stdout, for `--verbose` runs without a TUI.

use ralph_core::progress::{ProgressEvent, ProgressSubscription};

pub fn spawn_reporter(mut sub: ProgressSubscription) {
    tokio::spawn(async move {
        while let Some(event) = sub.recv().await {
            match event {
                ProgressEvent::IterationStarted { item_id, item_title, worktree } => {
                    println!("[{item_id}] starting \"{item_title}\" in {worktree}");
                }
                ProgressEvent::IterationEnded { item_id, outcome, duration_ms } => {
                    println!("[{item_id}] {outcome} ({duration_ms}ms)");
                }
                ProgressEvent::ToolStarted { item_id, trace_event } => {
                    println!("[{item_id}] tool_start {}", trace_event.name);
                }
                ProgressEvent::ToolEnded { item_id, trace_event } => {
                    println!("[{item_id}] tool_end {}", trace_event.name);
                }
                ProgressEvent::LogLine { item_id, line } => {
                    println!("[{item_id}] {line}");
                }
                ProgressEvent::StatusChange { message } => {
                    println!("{message}");
                }
            }
        }
    });
}
