//! Task records: the user-submitted generation job and its input schema.
//!
//! A task carries an ordered tag list (the prompt recipe), up to six
//! indexed variables `v0`..`v5`, optional generation settings, and the
//! aggregate progress fields maintained while its subtasks execute.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ExpandError, ValidationError};
use crate::model::subtask::ApiQueue;

/// Allowed range for the `steps` hyperparameter.
pub const STEPS_RANGE: std::ops::RangeInclusive<u32> = 1..=50;

/// Allowed range for the `cfg` hyperparameter.
pub const CFG_RANGE: std::ops::RangeInclusive<f64> = 0.1..=10.0;

/// Allowed range for per-task concurrency requests.
const CONCURRENCY_RANGE: std::ops::RangeInclusive<u32> = 1..=50;

/// Kind of a task tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TagType {
    Prompt,
    Character,
    Element,
    Ratio,
    Seed,
    Polish,
    Batch,
    CkptName,
    Steps,
    Cfg,
}

impl std::fmt::Display for TagType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TagType::Prompt => "prompt",
            TagType::Character => "character",
            TagType::Element => "element",
            TagType::Ratio => "ratio",
            TagType::Seed => "seed",
            TagType::Polish => "polish",
            TagType::Batch => "batch",
            TagType::CkptName => "ckpt_name",
            TagType::Steps => "steps",
            TagType::Cfg => "cfg",
        };
        write!(f, "{}", name)
    }
}

/// One ordered parameter entry of a task.
///
/// Non-variable tags carry their literal in `value`; variable tags carry
/// the linking `name` that resolves to a variable slot at expansion time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    #[serde(rename = "type")]
    pub tag_type: TagType,
    #[serde(default)]
    pub value: String,
    #[serde(default)]
    pub is_variable: bool,
    /// Variable link name; required when `is_variable` is set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
    /// Entity id for non-variable character/element tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    /// Preview image for non-variable character/element tags.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_img: Option<String>,
}

/// One value in a variable's ordered value list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValueRecord {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uuid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_img: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub weight: Option<f64>,
}

impl ValueRecord {
    /// Creates a plain value record, as used by tests and placeholders.
    pub fn plain(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            id: None,
            uuid: None,
            header_img: None,
            weight: None,
        }
    }
}

/// An indexed variable slot: a named, ordered list of candidate values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(default)]
    pub tag_id: String,
    #[serde(default)]
    pub values: Vec<ValueRecord>,
    #[serde(default)]
    pub values_count: usize,
}

impl Variable {
    /// The effective number of values this variable contributes to the
    /// Cartesian product.
    pub fn effective_count(&self) -> usize {
        if self.values_count > 0 {
            self.values_count
        } else {
            self.values.len()
        }
    }
}

/// Parses a variable map key (`"v0"`..`"v5"`) into its slot index.
pub fn variable_slot(key: &str) -> Option<usize> {
    let digits = key.strip_prefix('v')?;
    let slot: usize = digits.parse().ok()?;
    (slot < crate::model::coordinate::SLOT_COUNT).then_some(slot)
}

/// Generation hyperparameters forwarded to the image service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientArgs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ckpt_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub steps: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cfg: Option<f64>,
}

impl ClientArgs {
    /// Returns true when no hyperparameter is set.
    pub fn is_empty(&self) -> bool {
        self.ckpt_name.is_none() && self.steps.is_none() && self.cfg.is_none()
    }
}

/// Optional per-task execution settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_args: Option<ClientArgs>,
    /// Image service queue the task's subtasks are submitted to.
    #[serde(default)]
    pub api_queue: ApiQueue,
}

/// Lifecycle status of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Returns true for states a task never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

fn default_priority() -> i32 {
    1
}

/// The task input schema accepted at orchestrator entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub name: String,
    pub owner: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub variables: BTreeMap<String, Variable>,
    #[serde(default)]
    pub settings: TaskSettings,
    #[serde(default = "default_priority")]
    pub priority: i32,
}

impl TaskDefinition {
    /// Validates the definition against the input schema rules.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.name.trim().is_empty() {
            return Err(ValidationError::EmptyField("name"));
        }
        if self.owner.trim().is_empty() {
            return Err(ValidationError::EmptyField("owner"));
        }

        for tag in &self.tags {
            if tag.is_variable && tag.name.as_deref().map_or(true, str::is_empty) {
                return Err(ValidationError::UnnamedVariableTag {
                    tag_id: tag.id.clone(),
                });
            }
        }

        for (key, variable) in &self.variables {
            if variable_slot(key).is_none() {
                return Err(ValidationError::UnknownVariableSlot(key.clone()));
            }
            // Empty value lists are filled with placeholders at expansion
            // time; a non-empty list must agree with the declared count.
            if !variable.values.is_empty()
                && variable.values_count > 0
                && variable.values.len() != variable.values_count
            {
                return Err(ValidationError::ValuesCountMismatch {
                    variable: key.clone(),
                    declared: variable.values_count,
                    actual: variable.values.len(),
                });
            }
        }

        if let Some(concurrency) = self.settings.concurrency {
            if !CONCURRENCY_RANGE.contains(&concurrency) {
                return Err(ValidationError::ConcurrencyOutOfRange(concurrency));
            }
        }

        if let Some(args) = &self.settings.client_args {
            if let Some(steps) = args.steps {
                if !STEPS_RANGE.contains(&steps) {
                    return Err(ValidationError::StepsOutOfRange(steps));
                }
            }
            if let Some(cfg) = args.cfg {
                if !CFG_RANGE.contains(&cfg) {
                    return Err(ValidationError::CfgOutOfRange(cfg));
                }
            }
        }

        Ok(())
    }
}

/// A persisted task record with its aggregate progress fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub name: String,
    pub owner: String,
    pub tags: Vec<Tag>,
    pub variables: BTreeMap<String, Variable>,
    pub settings: TaskSettings,
    pub status: TaskStatus,
    pub total_images: u64,
    pub processed_images: u64,
    /// Integer percentage in `[0, 100]`.
    pub progress: u8,
    pub all_subtasks_completed: bool,
    pub is_deleted: bool,
    pub priority: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Builds a fresh `pending` task from a validated definition.
    ///
    /// `total_images` is `batch_size × ∏ values_count` over variables that
    /// contribute values; an unparseable batch tag counts as 1 here and is
    /// reported properly when expansion runs.
    pub fn from_definition(definition: TaskDefinition) -> Self {
        let now = Utc::now();
        let id = Uuid::new_v4();

        let task = Self {
            id,
            name: definition.name,
            owner: definition.owner,
            tags: definition.tags,
            variables: definition.variables,
            settings: definition.settings,
            status: TaskStatus::Pending,
            total_images: 0,
            processed_images: 0,
            progress: 0,
            all_subtasks_completed: false,
            is_deleted: false,
            priority: definition.priority,
            error: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        let batch = task.batch_size().unwrap_or(1);
        Self {
            total_images: task.expected_combinations() * u64::from(batch),
            ..task
        }
    }

    /// Number of base combinations the variables produce (1 when no
    /// variable contributes values).
    pub fn expected_combinations(&self) -> u64 {
        self.variables
            .iter()
            .filter(|(key, _)| variable_slot(key).is_some())
            .map(|(_, variable)| variable.effective_count() as u64)
            .filter(|count| *count > 0)
            .product::<u64>()
            .max(1)
    }

    /// Parses the non-variable batch tag; later duplicates win.
    pub fn batch_size(&self) -> Result<u32, ExpandError> {
        let batch_tag = self
            .tags
            .iter()
            .rev()
            .find(|tag| tag.tag_type == TagType::Batch && !tag.is_variable);

        match batch_tag {
            None => Ok(1),
            Some(tag) => {
                let parsed = tag
                    .value
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| ExpandError::InvalidBatch(tag.value.clone()))?;
                if parsed == 0 {
                    return Err(ExpandError::InvalidBatch(tag.value.clone()));
                }
                Ok(parsed)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition_with_variable(values: usize) -> TaskDefinition {
        let mut variables = BTreeMap::new();
        variables.insert(
            "v0".to_string(),
            Variable {
                name: "style".to_string(),
                tag_id: "t1".to_string(),
                values: (0..values)
                    .map(|i| ValueRecord::plain(format!("style-{}", i)))
                    .collect(),
                values_count: values,
            },
        );

        TaskDefinition {
            name: "grid".to_string(),
            owner: "tester".to_string(),
            tags: vec![Tag {
                id: "t1".to_string(),
                tag_type: TagType::Prompt,
                value: String::new(),
                is_variable: true,
                name: Some("style".to_string()),
                weight: None,
                uuid: None,
                header_img: None,
            }],
            variables,
            settings: TaskSettings::default(),
            priority: 1,
        }
    }

    #[test]
    fn test_tag_type_serde_names() {
        let json = serde_json::to_string(&TagType::CkptName).expect("serialize");
        assert_eq!(json, "\"ckpt_name\"");
        let back: TagType = serde_json::from_str("\"polish\"").expect("deserialize");
        assert_eq!(back, TagType::Polish);
    }

    #[test]
    fn test_task_status_display() {
        assert_eq!(TaskStatus::Pending.to_string(), "pending");
        assert_eq!(TaskStatus::Cancelled.to_string(), "cancelled");
        assert!(TaskStatus::Completed.is_terminal());
        assert!(!TaskStatus::Processing.is_terminal());
    }

    #[test]
    fn test_variable_slot_parsing() {
        assert_eq!(variable_slot("v0"), Some(0));
        assert_eq!(variable_slot("v5"), Some(5));
        assert_eq!(variable_slot("v6"), None);
        assert_eq!(variable_slot("steps"), None);
        assert_eq!(variable_slot("x1"), None);
    }

    #[test]
    fn test_total_images_from_definition() {
        let task = Task::from_definition(definition_with_variable(3));
        assert_eq!(task.total_images, 3);
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.progress, 0);
    }

    #[test]
    fn test_total_images_with_batch() {
        let mut definition = definition_with_variable(3);
        definition.tags.push(Tag {
            id: "t2".to_string(),
            tag_type: TagType::Batch,
            value: "4".to_string(),
            is_variable: false,
            name: None,
            weight: None,
            uuid: None,
            header_img: None,
        });
        let task = Task::from_definition(definition);
        assert_eq!(task.total_images, 12);
        assert_eq!(task.batch_size().expect("batch parses"), 4);
    }

    #[test]
    fn test_no_variables_yields_single_image() {
        let mut definition = definition_with_variable(0);
        definition.variables.clear();
        definition.tags.clear();
        let task = Task::from_definition(definition);
        assert_eq!(task.total_images, 1);
    }

    #[test]
    fn test_invalid_batch_is_reported() {
        let mut definition = definition_with_variable(2);
        definition.tags.push(Tag {
            id: "t2".to_string(),
            tag_type: TagType::Batch,
            value: "many".to_string(),
            is_variable: false,
            name: None,
            weight: None,
            uuid: None,
            header_img: None,
        });
        let task = Task::from_definition(definition);
        // Expansion surfaces the error; the aggregate falls back to 1x.
        assert!(task.batch_size().is_err());
        assert_eq!(task.total_images, 2);
    }

    #[test]
    fn test_last_batch_tag_wins() {
        let mut definition = definition_with_variable(1);
        for value in ["2", "3"] {
            definition.tags.push(Tag {
                id: format!("batch-{}", value),
                tag_type: TagType::Batch,
                value: value.to_string(),
                is_variable: false,
                name: None,
                weight: None,
                uuid: None,
                header_img: None,
            });
        }
        let task = Task::from_definition(definition);
        assert_eq!(task.batch_size().expect("batch parses"), 3);
    }

    #[test]
    fn test_validation_rejects_empty_owner() {
        let mut definition = definition_with_variable(1);
        definition.owner = "  ".to_string();
        assert!(matches!(
            definition.validate(),
            Err(ValidationError::EmptyField("owner"))
        ));
    }

    #[test]
    fn test_validation_rejects_unknown_slot() {
        let mut definition = definition_with_variable(1);
        let variable = definition.variables.remove("v0").expect("variable exists");
        definition.variables.insert("v9".to_string(), variable);
        assert!(matches!(
            definition.validate(),
            Err(ValidationError::UnknownVariableSlot(_))
        ));
    }

    #[test]
    fn test_validation_rejects_count_mismatch() {
        let mut definition = definition_with_variable(2);
        definition
            .variables
            .get_mut("v0")
            .expect("variable exists")
            .values_count = 5;
        assert!(matches!(
            definition.validate(),
            Err(ValidationError::ValuesCountMismatch { .. })
        ));
    }

    #[test]
    fn test_validation_allows_empty_values_with_count() {
        let mut definition = definition_with_variable(0);
        definition
            .variables
            .get_mut("v0")
            .expect("variable exists")
            .values_count = 3;
        assert!(definition.validate().is_ok());
    }

    #[test]
    fn test_validation_settings_ranges() {
        let mut definition = definition_with_variable(1);
        definition.settings.concurrency = Some(80);
        assert!(matches!(
            definition.validate(),
            Err(ValidationError::ConcurrencyOutOfRange(80))
        ));

        definition.settings.concurrency = Some(10);
        definition.settings.client_args = Some(ClientArgs {
            ckpt_name: None,
            steps: Some(0),
            cfg: None,
        });
        assert!(matches!(
            definition.validate(),
            Err(ValidationError::StepsOutOfRange(0))
        ));

        definition.settings.client_args = Some(ClientArgs {
            ckpt_name: None,
            steps: Some(20),
            cfg: Some(12.0),
        });
        assert!(matches!(
            definition.validate(),
            Err(ValidationError::CfgOutOfRange(_))
        ));
    }

    #[test]
    fn test_validation_requires_variable_tag_name() {
        let mut definition = definition_with_variable(1);
        definition.tags[0].name = None;
        assert!(matches!(
            definition.validate(),
            Err(ValidationError::UnnamedVariableTag { .. })
        ));
    }
}
