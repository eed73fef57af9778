//! Issue client: the boundary between ralph and the tracker CLI (`bd`),
//! treated as an opaque subprocess returning JSON.
//!
//! The default implementation shells out to `bd`. It is exposed behind the
//! [`IssueClient`] trait so tests can substitute a deterministic in-memory
//! double without touching disk or spawning a process — the
//! constructor-injected-interface option named in the design notes.

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;

use crate::item::{sort_hierarchically, Item, ItemId, ItemStatus};

#[derive(Debug, Error)]
pub enum IssueClientError {
    #[error("failed to invoke tracker command: {0}")]
    Io(#[from] std::io::Error),
    #[error("tracker returned malformed JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("tracker command exited with status {status}: {stderr}")]
    NonZeroExit { status: i32, stderr: String },
}

#[async_trait]
pub trait IssueClient: Send + Sync {
    /// Equivalent of `bd list --json --limit 0`, dropping `pr:`-labeled and
    /// closed items, returned in hierarchical sort order.
    async fn list_for_repo(&self, workdir: &str) -> Result<Vec<Item>, IssueClientError>;

    /// Same as `list_for_repo` but scoped to a single `pr:<n>` label.
    async fn list_for_pr(&self, workdir: &str, pr_number: u64) -> Result<Vec<Item>, IssueClientError>;

    /// Equivalent of `bd ready --parent <epic>`: leaf items under `epic_id`
    /// whose dependencies are satisfied.
    async fn ready_children(&self, workdir: &str, epic_id: &str) -> Result<Vec<Item>, IssueClientError>;

    async fn update_status(
        &self,
        workdir: &str,
        item_id: &str,
        status: ItemStatus,
    ) -> Result<(), IssueClientError>;

    async fn close(&self, workdir: &str, item_id: &str) -> Result<(), IssueClientError>;

    /// Re-fetch a single item by id, used by the evaluator to check whether
    /// the tracker now reports it closed.
    async fn get(&self, workdir: &str, item_id: &str) -> Result<Option<Item>, IssueClientError>;
}

/// Invokes the real `bd` binary found on `PATH`.
pub struct BdIssueClient {
    binary: String,
}

impl Default for BdIssueClient {
    fn default() -> Self {
        Self::new("bd")
    }
}

impl BdIssueClient {
    pub fn new(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    async fn run_json(&self, workdir: &str, args: &[&str]) -> Result<serde_json::Value, IssueClientError> {
        let output = Command::new(&self.binary)
            .args(args)
            .current_dir(workdir)
            .output()
            .await?;

        if !output.status.success() {
            return Err(IssueClientError::NonZeroExit {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }

        Ok(serde_json::from_slice(&output.stdout)?)
    }

    async fn run_write(&self, workdir: &str, args: &[&str]) -> Result<(), IssueClientError> {
        let output = Command::new(&self.binary)
            .args(args)
            .current_dir(workdir)
            .output()
            .await?;

        if !output.status.success() {
            return Err(IssueClientError::NonZeroExit {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(())
    }
}

fn filter_repo_eligible(items: Vec<Item>) -> Vec<Item> {
    items
        .into_iter()
        .filter(|i| !i.has_pr_label() && i.status != ItemStatus::Closed)
        .collect()
}

#[async_trait]
impl IssueClient for BdIssueClient {
    async fn list_for_repo(&self, workdir: &str) -> Result<Vec<Item>, IssueClientError> {
        let value = self.run_json(workdir, &["list", "--json", "--limit", "0"]).await?;
        let items: Vec<Item> = serde_json::from_value(value)?;
        Ok(sort_hierarchically(&filter_repo_eligible(items)))
    }

    async fn list_for_pr(&self, workdir: &str, pr_number: u64) -> Result<Vec<Item>, IssueClientError> {
        let label = format!("pr:{pr_number}");
        let value = self
            .run_json(workdir, &["list", "--label", &label, "--json", "--limit", "0"])
            .await?;
        let items: Vec<Item> = serde_json::from_value(value)?;
        let items: Vec<Item> = items.into_iter().filter(|i| i.status != ItemStatus::Closed).collect();
        Ok(sort_hierarchically(&items))
    }

    async fn ready_children(&self, workdir: &str, epic_id: &str) -> Result<Vec<Item>, IssueClientError> {
        let value = self.run_json(workdir, &["ready", "--parent", epic_id]).await?;
        let items: Vec<Item> = serde_json::from_value(value)?;
        Ok(sort_hierarchically(&items))
    }

    async fn update_status(
        &self,
        workdir: &str,
        item_id: &str,
        status: ItemStatus,
    ) -> Result<(), IssueClientError> {
        let status_str = status.to_string();
        self.run_write(workdir, &["update", item_id, "--status", &status_str]).await
    }

    async fn close(&self, workdir: &str, item_id: &str) -> Result<(), IssueClientError> {
        self.run_write(workdir, &["close", item_id]).await
    }

    async fn get(&self, workdir: &str, item_id: &str) -> Result<Option<Item>, IssueClientError> {
        let value = self.run_json(workdir, &["show", item_id, "--json"]).await;
        match value {
            Ok(value) => Ok(Some(serde_json::from_value(value)?)),
            Err(IssueClientError::NonZeroExit { .. }) => Ok(None),
            Err(other) => Err(other),
        }
    }
}

/// In-memory test double. All operations are infallible and run against a
/// caller-supplied fixture list, so tests never spawn a process or touch
/// disk.
#[derive(Default, Clone)]
pub struct FakeIssueClient {
    items: std::sync::Arc<tokio::sync::Mutex<Vec<Item>>>,
}

impl FakeIssueClient {
    pub fn new(items: Vec<Item>) -> Self {
        Self {
            items: std::sync::Arc::new(tokio::sync::Mutex::new(items)),
        }
    }

    pub async fn set_items(&self, items: Vec<Item>) {
        *self.items.lock().await = items;
    }
}

#[async_trait]
impl IssueClient for FakeIssueClient {
    async fn list_for_repo(&self, _workdir: &str) -> Result<Vec<Item>, IssueClientError> {
        let items = self.items.lock().await.clone();
        Ok(sort_hierarchically(&filter_repo_eligible(items)))
    }

    async fn list_for_pr(&self, _workdir: &str, pr_number: u64) -> Result<Vec<Item>, IssueClientError> {
        let label = format!("pr:{pr_number}");
        let items: Vec<Item> = self
            .items
            .lock()
            .await
            .iter()
            .filter(|i| i.labels.iter().any(|l| l == &label) && i.status != ItemStatus::Closed)
            .cloned()
            .collect();
        Ok(sort_hierarchically(&items))
    }

    async fn ready_children(&self, _workdir: &str, epic_id: &str) -> Result<Vec<Item>, IssueClientError> {
        let items: Vec<Item> = self
            .items
            .lock()
            .await
            .iter()
            .filter(|i| i.parent_id() == epic_id && i.status != ItemStatus::Closed)
            .cloned()
            .collect();
        Ok(sort_hierarchically(&items))
    }

    async fn update_status(
        &self,
        _workdir: &str,
        item_id: &str,
        status: ItemStatus,
    ) -> Result<(), IssueClientError> {
        let mut items = self.items.lock().await;
        if let Some(item) = items.iter_mut().find(|i| i.id == item_id) {
            item.status = status;
        }
        Ok(())
    }

    async fn close(&self, workdir: &str, item_id: &str) -> Result<(), IssueClientError> {
        self.update_status(workdir, item_id, ItemStatus::Closed).await
    }

    async fn get(&self, _workdir: &str, item_id: &str) -> Result<Option<Item>, IssueClientError> {
        Ok(self.items.lock().await.iter().find(|i| i.id == item_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::item::IssueType;
    use chrono::Utc;

    fn item(id: &str, status: ItemStatus, labels: Vec<&str>) -> Item {
        Item {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            status,
            priority: 1,
            labels: labels.into_iter().map(str::to_string).collect(),
            issue_type: IssueType::Task,
            dependencies: Vec::new(),
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn fake_client_drops_closed_and_pr_labeled_items() {
        let client = FakeIssueClient::new(vec![
            item("a", ItemStatus::Open, vec![]),
            item("b", ItemStatus::Closed, vec![]),
            item("c", ItemStatus::Open, vec!["pr:7"]),
        ]);
        let listed = client.list_for_repo("/tmp").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "a");
    }

    #[tokio::test]
    async fn fake_client_empty_list_is_ok() {
        let client = FakeIssueClient::new(vec![]);
        let listed = client.list_for_repo("/tmp").await.unwrap();
        assert!(listed.is_empty());
    }

    #[tokio::test]
    async fn fake_client_close_marks_closed() {
        let client = FakeIssueClient::new(vec![item("a", ItemStatus::Open, vec![])]);
        client.close("/tmp", "a").await.unwrap();
        let fetched = client.get("/tmp", "a").await.unwrap().unwrap();
        assert_eq!(fetched.status, ItemStatus::Closed);
    }
}
