//! Result-matrix assembly: completed subtasks keyed by coordinate.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::subtask::{Subtask, SubtaskStatus};
use crate::model::task::{Task, Variable};

/// The matrix view of a task: every completed cell's image URL under its
/// canonical indexed key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMatrix {
    pub task_id: Uuid,
    pub task_name: String,
    pub created_at: DateTime<Utc>,
    pub variables: BTreeMap<String, Variable>,
    pub coordinates_by_indices: BTreeMap<String, String>,
}

/// Builds the matrix for a task from its subtasks.
///
/// Only completed subtasks with a result URL contribute. When two share an
/// indexed key (possible with random seeds), the later `updated_at` wins;
/// exact ties fall to the lexicographically greater subtask id.
pub fn assemble(task: &Task, subtasks: &[Subtask]) -> TaskMatrix {
    let mut winners: BTreeMap<String, (DateTime<Utc>, String, String)> = BTreeMap::new();

    for subtask in subtasks {
        if subtask.status != SubtaskStatus::Completed {
            continue;
        }
        let Some(result) = &subtask.result else {
            continue;
        };
        if result.url.is_empty() {
            continue;
        }

        let key = subtask.coordinate.indexed_key();
        let candidate = (
            subtask.updated_at,
            subtask.id.to_string(),
            result.url.clone(),
        );
        match winners.get(&key) {
            Some((at, id, _)) if (*at, id.as_str()) >= (candidate.0, candidate.1.as_str()) => {}
            _ => {
                winners.insert(key, candidate);
            }
        }
    }

    TaskMatrix {
        task_id: task.id,
        task_name: task.name.clone(),
        created_at: task.created_at,
        variables: task.variables.clone(),
        coordinates_by_indices: winners
            .into_iter()
            .map(|(key, (_, _, url))| (key, url))
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::coordinate::Coordinate;
    use crate::model::subtask::{ApiQueue, GenerationResult, PromptItem, SubtaskSpec};
    use crate::model::task::{TaskDefinition, TaskSettings};
    use std::collections::BTreeMap as Map;

    fn task() -> Task {
        Task::from_definition(TaskDefinition {
            name: "matrix-test".to_string(),
            owner: "tester".to_string(),
            tags: Vec::new(),
            variables: Map::new(),
            settings: TaskSettings::default(),
            priority: 1,
        })
    }

    fn subtask(parent: Uuid, slot0: u32, url: &str, status: SubtaskStatus) -> Subtask {
        let mut coordinate = Coordinate::empty();
        coordinate.set(0, slot0);
        let mut subtask = Subtask::from_spec(
            parent,
            ApiQueue::Prod,
            SubtaskSpec {
                coordinate,
                prompts: vec![PromptItem::freetext("x", 1.0)],
                ratio: "1:1".to_string(),
                seed: 1,
                use_polish: false,
                client_args: Default::default(),
                variable_types_map: Map::new(),
                type_to_variable: Map::new(),
            },
        );
        subtask.status = status;
        if status == SubtaskStatus::Completed {
            subtask.result = Some(GenerationResult {
                url: url.to_string(),
                width: 1024,
                height: 1024,
                seed: 1,
                created_at: Utc::now(),
            });
        }
        subtask
    }

    #[test]
    fn test_only_completed_subtasks_contribute() {
        let task = task();
        let subtasks = vec![
            subtask(task.id, 0, "https://img/0.png", SubtaskStatus::Completed),
            subtask(task.id, 1, "", SubtaskStatus::Failed),
            subtask(task.id, 2, "", SubtaskStatus::Processing),
        ];

        let matrix = assemble(&task, &subtasks);
        assert_eq!(matrix.coordinates_by_indices.len(), 1);
        assert_eq!(
            matrix.coordinates_by_indices.get("0,,,,,").map(String::as_str),
            Some("https://img/0.png")
        );
    }

    #[test]
    fn test_later_update_wins_duplicate_key() {
        let task = task();
        let mut older = subtask(task.id, 0, "https://img/old.png", SubtaskStatus::Completed);
        let mut newer = subtask(task.id, 0, "https://img/new.png", SubtaskStatus::Completed);
        older.updated_at = Utc::now() - chrono::Duration::seconds(60);
        newer.updated_at = Utc::now();

        // Insertion order must not matter.
        let matrix = assemble(&task, &[newer.clone(), older.clone()]);
        assert_eq!(
            matrix.coordinates_by_indices.get("0,,,,,").map(String::as_str),
            Some("https://img/new.png")
        );
        let matrix = assemble(&task, &[older, newer]);
        assert_eq!(
            matrix.coordinates_by_indices.get("0,,,,,").map(String::as_str),
            Some("https://img/new.png")
        );
    }

    #[test]
    fn test_tie_breaks_on_id() {
        let task = task();
        let mut first = subtask(task.id, 0, "https://img/a.png", SubtaskStatus::Completed);
        let mut second = subtask(task.id, 0, "https://img/b.png", SubtaskStatus::Completed);
        let at = Utc::now();
        first.updated_at = at;
        second.updated_at = at;

        let expected = if first.id.to_string() > second.id.to_string() {
            "https://img/a.png"
        } else {
            "https://img/b.png"
        };
        let matrix = assemble(&task, &[first, second]);
        assert_eq!(
            matrix.coordinates_by_indices.get("0,,,,,").map(String::as_str),
            Some(expected)
        );
    }

    #[test]
    fn test_matrix_metadata() {
        let task = task();
        let matrix = assemble(&task, &[]);
        assert_eq!(matrix.task_id, task.id);
        assert_eq!(matrix.task_name, "matrix-test");
        assert!(matrix.coordinates_by_indices.is_empty());
    }
}
