//! Work items as surfaced by the issue tracker, and the hierarchical sort
//! that determines selection order (§3 of the design: epics first, each
//! immediately followed by its children, then standalone items).

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub type ItemId = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Open,
    InProgress,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseItemStatusError(String);

impl fmt::Display for ParseItemStatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid item status: {:?}", self.0)
    }
}

impl std::error::Error for ParseItemStatusError {}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ItemStatus::Open => "open",
            ItemStatus::InProgress => "in_progress",
            ItemStatus::Closed => "closed",
        };
        f.write_str(s)
    }
}

impl FromStr for ItemStatus {
    type Err = ParseItemStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(ItemStatus::Open),
            "in_progress" => Ok(ItemStatus::InProgress),
            "closed" => Ok(ItemStatus::Closed),
            other => Err(ParseItemStatusError(other.to_string())),
        }
    }
}

/// An item's kind. The tracker emits free-form strings; anything other than
/// `epic`, `task`, or `bug` is preserved verbatim rather than rejected, since
/// `issue_type` is open-ended per the data model (`epic, task, bug, …`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueType {
    Epic,
    Task,
    Bug,
    Other(String),
}

// Hand-written rather than derived: serde's externally-tagged derive has no
// way to express "one of these known strings, else fall back to a variant
// that keeps the original text" for a plain JSON string field, since `other`
// only supports a unit fallback variant.
impl Serialize for IssueType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for IssueType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(match s.as_str() {
            "epic" => IssueType::Epic,
            "task" => IssueType::Task,
            "bug" => IssueType::Bug,
            _ => IssueType::Other(s),
        })
    }
}

impl fmt::Display for IssueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IssueType::Epic => "epic",
            IssueType::Task => "task",
            IssueType::Bug => "bug",
            IssueType::Other(s) => s.as_str(),
        };
        f.write_str(s)
    }
}

impl IssueType {
    pub fn is_epic(&self) -> bool {
        matches!(self, IssueType::Epic)
    }
}

/// A single `parent-child` dependency edge as returned by the tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub issue_id: ItemId,
    pub depends_on_id: ItemId,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub title: String,
    #[serde(default)]
    pub description: String,
    pub status: ItemStatus,
    pub priority: i64,
    #[serde(default)]
    pub labels: Vec<String>,
    pub issue_type: IssueType,
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
    pub created_at: DateTime<Utc>,
}

impl Item {
    /// The item's `pr:<n>` label, if any.
    pub fn pr_label(&self) -> Option<&str> {
        self.labels
            .iter()
            .find(|l| l.starts_with("pr:"))
            .map(|s| s.as_str())
    }

    /// Whether this item carries any `pr:` label. Per the data-model
    /// invariant, such items are not eligible for repo-scoped selection.
    pub fn has_pr_label(&self) -> bool {
        self.pr_label().is_some()
    }

    /// The `parent_id` derived from this item's `parent-child` dependency
    /// edge, or `""` for an epic (per the data-model invariant: "An epic has
    /// `parent_id = \"\"`").
    pub fn parent_id(&self) -> String {
        if self.issue_type.is_epic() {
            return String::new();
        }
        self.dependencies
            .iter()
            .find(|d| d.kind == "parent-child" && d.issue_id == self.id)
            .map(|d| d.depends_on_id.clone())
            .unwrap_or_default()
    }
}

/// Sort items into the deterministic hierarchical order described in §3:
/// epics (by `priority` ascending, ties by `id`), each epic immediately
/// followed by its own children (same sort within the epic), then
/// standalone items (same sort).
///
/// An item whose declared `parent_id` is not present in `items` is treated
/// as standalone, per the data-model invariant. This function is total:
/// applying it twice yields the same result as applying it once.
pub fn sort_hierarchically(items: &[Item]) -> Vec<Item> {
    let present_ids: HashSet<&str> = items.iter().map(|i| i.id.as_str()).collect();

    let mut epics: Vec<&Item> = Vec::new();
    let mut children_of: HashMap<String, Vec<&Item>> = HashMap::new();
    let mut standalone: Vec<&Item> = Vec::new();

    for item in items {
        if item.issue_type.is_epic() {
            epics.push(item);
            continue;
        }
        let parent_id = item.parent_id();
        if !parent_id.is_empty() && present_ids.contains(parent_id.as_str()) {
            children_of.entry(parent_id).or_default().push(item);
        } else {
            standalone.push(item);
        }
    }

    fn priority_key(item: &Item) -> (i64, &str) {
        (item.priority, item.id.as_str())
    }

    epics.sort_by_key(|i| priority_key(i));
    standalone.sort_by_key(|i| priority_key(i));
    for children in children_of.values_mut() {
        children.sort_by_key(|i| priority_key(i));
    }

    let mut result = Vec::with_capacity(items.len());
    for epic in epics {
        result.push(epic.clone());
        if let Some(children) = children_of.get(&epic.id) {
            result.extend(children.iter().map(|c| (*c).clone()));
        }
    }
    result.extend(standalone.into_iter().cloned());
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(id: &str, priority: i64, issue_type: IssueType, parent: Option<&str>) -> Item {
        let mut dependencies = Vec::new();
        if let Some(parent) = parent {
            dependencies.push(Dependency {
                issue_id: id.to_string(),
                depends_on_id: parent.to_string(),
                kind: "parent-child".to_string(),
            });
        }
        Item {
            id: id.to_string(),
            title: id.to_string(),
            description: String::new(),
            status: ItemStatus::Open,
            priority,
            labels: Vec::new(),
            issue_type,
            dependencies,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn status_round_trips_through_display_and_from_str() {
        for status in [ItemStatus::Open, ItemStatus::InProgress, ItemStatus::Closed] {
            let s = status.to_string();
            assert_eq!(ItemStatus::from_str(&s).unwrap(), status);
        }
    }

    #[test]
    fn invalid_status_is_an_error() {
        assert!(ItemStatus::from_str("bogus").is_err());
    }

    #[test]
    fn epic_has_empty_parent_id() {
        let epic = item("e1", 1, IssueType::Epic, None);
        assert_eq!(epic.parent_id(), "");
    }

    #[test]
    fn dangling_parent_is_standalone() {
        let items = vec![item("t1", 1, IssueType::Task, Some("missing-epic"))];
        let sorted = sort_hierarchically(&items);
        assert_eq!(sorted.len(), 1);
        assert_eq!(sorted[0].id, "t1");
    }

    #[test]
    fn epics_then_children_then_standalone() {
        let items = vec![
            item("s1", 5, IssueType::Task, None),
            item("c2", 2, IssueType::Task, Some("e1")),
            item("e2", 2, IssueType::Epic, None),
            item("c1", 1, IssueType::Task, Some("e1")),
            item("e1", 1, IssueType::Epic, None),
        ];
        let sorted = sort_hierarchically(&items);
        let ids: Vec<&str> = sorted.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "c1", "c2", "e2", "s1"]);
    }

    #[test]
    fn sort_is_idempotent() {
        let items = vec![
            item("s1", 5, IssueType::Task, None),
            item("e1", 1, IssueType::Epic, None),
            item("c1", 3, IssueType::Task, Some("e1")),
        ];
        let once = sort_hierarchically(&items);
        let twice = sort_hierarchically(&once);
        let once_ids: Vec<&str> = once.iter().map(|i| i.id.as_str()).collect();
        let twice_ids: Vec<&str> = twice.iter().map(|i| i.id.as_str()).collect();
        assert_eq!(once_ids, twice_ids);
    }

    #[test]
    fn pr_label_detected() {
        let mut i = item("t1", 1, IssueType::Task, None);
        i.labels.push("pr:42".to_string());
        assert!(i.has_pr_label());
        assert_eq!(i.pr_label(), Some("pr:42"));
    }
}
