//! Subtask records: one image-generation unit per matrix cell.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::model::coordinate::Coordinate;
use crate::model::task::{ClientArgs, TagType};

/// Image service queue a subtask is submitted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApiQueue {
    #[default]
    Prod,
    Dev,
    Ops,
}

impl std::fmt::Display for ApiQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ApiQueue::Prod => "prod",
            ApiQueue::Dev => "dev",
            ApiQueue::Ops => "ops",
        };
        write!(f, "{}", name)
    }
}

/// Lifecycle status of a subtask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubtaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl SubtaskStatus {
    /// Returns true for states a subtask never leaves.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubtaskStatus::Completed | SubtaskStatus::Failed | SubtaskStatus::Cancelled
        )
    }

    /// Returns true for the terminal states that advance the parent's
    /// processed counter.
    pub fn counts_as_processed(&self) -> bool {
        matches!(self, SubtaskStatus::Completed | SubtaskStatus::Failed)
    }
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SubtaskStatus::Pending => "pending",
            SubtaskStatus::Processing => "processing",
            SubtaskStatus::Completed => "completed",
            SubtaskStatus::Failed => "failed",
            SubtaskStatus::Cancelled => "cancelled",
        };
        write!(f, "{}", name)
    }
}

/// A character or element reference in a prompt list.
///
/// The fixed placeholder fields mirror the image service's wire schema and
/// are always sent as-is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityPrompt {
    pub uuid: String,
    /// Always equal to `uuid` on the wire.
    pub value: String,
    pub name: String,
    pub weight: f64,
    pub img_url: String,
    #[serde(default)]
    pub domain: String,
    #[serde(default)]
    pub parent: String,
    #[serde(default)]
    pub label: Option<String>,
    #[serde(default)]
    pub sort_index: u32,
    #[serde(default = "EntityPrompt::default_status")]
    pub status: String,
    #[serde(default)]
    pub polymorphi_values: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub sub_type: Option<String>,
}

impl EntityPrompt {
    fn default_status() -> String {
        "IN_USE".to_string()
    }

    fn new(uuid: String, name: String, weight: f64, img_url: String) -> Self {
        Self {
            value: uuid.clone(),
            uuid,
            name,
            weight,
            img_url,
            domain: String::new(),
            parent: String::new(),
            label: None,
            sort_index: 0,
            status: Self::default_status(),
            polymorphi_values: serde_json::Map::new(),
            sub_type: None,
        }
    }
}

/// One ordered prompt item sent to the image service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum PromptItem {
    #[serde(rename = "freetext")]
    Freetext { value: String, weight: f64 },
    #[serde(rename = "oc_vtoken_adaptor")]
    Character(EntityPrompt),
    #[serde(rename = "elementum")]
    Element(EntityPrompt),
}

impl PromptItem {
    pub fn freetext(value: impl Into<String>, weight: f64) -> Self {
        PromptItem::Freetext {
            value: value.into(),
            weight,
        }
    }

    pub fn character(
        uuid: impl Into<String>,
        name: impl Into<String>,
        weight: f64,
        img_url: impl Into<String>,
    ) -> Self {
        PromptItem::Character(EntityPrompt::new(
            uuid.into(),
            name.into(),
            weight,
            img_url.into(),
        ))
    }

    pub fn element(
        uuid: impl Into<String>,
        name: impl Into<String>,
        weight: f64,
        img_url: impl Into<String>,
    ) -> Self {
        PromptItem::Element(EntityPrompt::new(
            uuid.into(),
            name.into(),
            weight,
            img_url.into(),
        ))
    }

    /// The entity name, when this item references a character or element.
    pub fn name(&self) -> Option<&str> {
        match self {
            PromptItem::Freetext { .. } => None,
            PromptItem::Character(entity) | PromptItem::Element(entity) => Some(&entity.name),
        }
    }
}

/// Final output of a completed subtask. URLs are immutable once written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationResult {
    pub url: String,
    pub width: u32,
    pub height: u32,
    pub seed: i64,
    pub created_at: DateTime<Utc>,
}

/// A subtask spec as produced by the expander, before persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskSpec {
    pub coordinate: Coordinate,
    pub prompts: Vec<PromptItem>,
    pub ratio: String,
    pub seed: i64,
    pub use_polish: bool,
    pub client_args: ClientArgs,
    pub variable_types_map: BTreeMap<String, TagType>,
    pub type_to_variable: BTreeMap<TagType, String>,
}

/// A persisted subtask record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub id: Uuid,
    pub parent_task_id: Uuid,
    pub coordinate: Coordinate,
    pub variable_types_map: BTreeMap<String, TagType>,
    pub type_to_variable: BTreeMap<TagType, String>,
    pub prompts: Vec<PromptItem>,
    pub ratio: String,
    /// Zero means "server-random per attempt" and disables coordinate dedup.
    pub seed: i64,
    pub use_polish: bool,
    pub client_args: ClientArgs,
    pub api_queue: ApiQueue,
    pub status: SubtaskStatus,
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<GenerationResult>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Subtask {
    /// Materialises a pending subtask from an expander spec.
    pub fn from_spec(parent_task_id: Uuid, api_queue: ApiQueue, spec: SubtaskSpec) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            parent_task_id,
            coordinate: spec.coordinate,
            variable_types_map: spec.variable_types_map,
            type_to_variable: spec.type_to_variable,
            prompts: spec.prompts,
            ratio: spec.ratio,
            seed: spec.seed,
            use_polish: spec.use_polish,
            client_args: spec.client_args,
            api_queue,
            status: SubtaskStatus::Pending,
            retry_count: 0,
            error: None,
            result: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
        }
    }

    /// Returns true when any prompt references a Lumina entity; such
    /// subtasks are routed to the dedicated Lumina pool.
    pub fn is_lumina(&self) -> bool {
        self.prompts.iter().any(|prompt| {
            prompt
                .name()
                .map(|name| name.to_ascii_lowercase().contains("lumina"))
                .unwrap_or(false)
        })
    }
}
