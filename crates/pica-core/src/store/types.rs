//! Row types for the tasks and comics tables.

use serde::{Deserialize, Serialize};

use crate::sources::SourceKind;

/// Task state stored as a string in the database.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Queued,
    Running,
    Paused,
    Succeeded,
    Failed,
    Canceled,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Running => "running",
            TaskStatus::Paused => "paused",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::Failed => "failed",
            TaskStatus::Canceled => "canceled",
        }
    }

    pub fn from_str(s: &str) -> Self {
        match s {
            "queued" => TaskStatus::Queued,
            "running" => TaskStatus::Running,
            "paused" => TaskStatus::Paused,
            "succeeded" => TaskStatus::Succeeded,
            "canceled" => TaskStatus::Canceled,
            _ => TaskStatus::Failed,
        }
    }

    /// Sticky end states; only an explicit retry leaves them.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded | TaskStatus::Failed | TaskStatus::Canceled
        )
    }

    /// States that block a duplicate task for the same (source, target).
    pub fn is_active(self) -> bool {
        matches!(
            self,
            TaskStatus::Queued | TaskStatus::Running | TaskStatus::Paused
        )
    }
}

/// Free-form task parameters, stored as JSON. Unknown keys are preserved
/// verbatim so clients can round-trip their own metadata.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskParams {
    /// Zero-based display indices of episodes to download; empty or absent
    /// means all.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub eps: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(
        rename = "coverUrl",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cover_url: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl TaskParams {
    /// Episode selection as an ordered de-duplicated list.
    pub fn eps_ordered(&self) -> Vec<u32> {
        let mut seen = std::collections::HashSet::new();
        self.eps
            .as_deref()
            .unwrap_or_default()
            .iter()
            .copied()
            .filter(|e| seen.insert(*e))
            .collect()
    }
}

/// One row of the tasks table.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub id: String,
    pub task_type: String,
    pub source: SourceKind,
    pub target: String,
    pub params: TaskParams,
    pub status: TaskStatus,
    pub progress: i64,
    pub total: i64,
    pub message: Option<String>,
    pub comic_id: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// One row of the comics (library) table.
#[derive(Debug, Clone)]
pub struct ComicRecord {
    pub id: String,
    pub title: String,
    pub subtitle: String,
    pub source: i64,
    pub tags: Vec<String>,
    pub directory: String,
    pub time: i64,
    pub size: i64,
    pub meta_json: String,
    pub cover_path: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_string_roundtrip() {
        for s in [
            TaskStatus::Queued,
            TaskStatus::Running,
            TaskStatus::Paused,
            TaskStatus::Succeeded,
            TaskStatus::Failed,
            TaskStatus::Canceled,
        ] {
            assert_eq!(TaskStatus::from_str(s.as_str()), s);
        }
        assert_eq!(TaskStatus::from_str("garbage"), TaskStatus::Failed);
    }

    #[test]
    fn params_preserve_unknown_keys() {
        let raw = r#"{"eps":[2,0,2,1],"quality":"high"}"#;
        let params: TaskParams = serde_json::from_str(raw).unwrap();
        assert_eq!(params.eps_ordered(), vec![2, 0, 1]);
        assert_eq!(params.extra["quality"], "high");
        let out = serde_json::to_value(&params).unwrap();
        assert_eq!(out["quality"], "high");
    }
}
