//! Combinatorial expander: a task becomes one subtask spec per grid cell.
//!
//! Expansion is deterministic: tags are interpreted in their original
//! order, every used variable records the index of its chosen value in the
//! subtask's coordinate, and the coordinate doubles as the dedup
//! fingerprint and the matrix cell address.

mod combinations;

use std::collections::BTreeMap;

use rand::Rng;
use tracing::{debug, warn};

use crate::error::ExpandError;
use crate::model::coordinate::Coordinate;
use crate::model::subtask::{PromptItem, SubtaskSpec};
use crate::model::task::{variable_slot, Tag, TagType, Task, ValueRecord, CFG_RANGE, STEPS_RANGE};

pub use combinations::{active_variables, enumerate_combinations, ActiveVariable, Combination};

/// Prompt inserted when a combination would otherwise have none.
const DEFAULT_PROMPT: &str = "1girl";

/// Largest seed handed out when no seed tag is present.
const MAX_RANDOM_SEED: i64 = 2_147_483_647;

/// Expands a task into the ordered list of subtask specs covering its
/// variable grid.
///
/// # Errors
///
/// Returns `ExpandError::InvalidBatch` for an unparseable batch tag and
/// `ExpandError::UnmatchedVariable` when a variable tag's name resolves to
/// no variable. Either aborts the whole expansion.
pub fn expand_task(task: &Task) -> Result<Vec<SubtaskSpec>, ExpandError> {
    let batch_size = task.batch_size()?;
    let active = active_variables(&task.variables);
    let combinations = enumerate_combinations(&active, batch_size);

    debug!(
        task_id = %task.id,
        variables = active.len(),
        batch_size,
        combinations = combinations.len(),
        "expanding task"
    );

    combinations
        .iter()
        .map(|combination| build_spec(task, &active, combination))
        .collect()
}

/// Interprets the task's tags for one combination and assembles the spec.
fn build_spec(
    task: &Task,
    active: &[ActiveVariable],
    combination: &Combination,
) -> Result<SubtaskSpec, ExpandError> {
    let mut bucket = Buckets::new(task);
    let mut variable_types_map = BTreeMap::new();
    let mut type_to_variable = BTreeMap::new();

    for tag in &task.tags {
        if tag.tag_type == TagType::Batch {
            continue;
        }

        if tag.is_variable {
            let tag_name = tag.name.clone().unwrap_or_default();
            let var_key = task
                .variables
                .iter()
                .find(|(_, variable)| variable.name == tag_name)
                .map(|(key, _)| key.clone())
                .ok_or_else(|| ExpandError::UnmatchedVariable {
                    tag_id: tag.id.clone(),
                    tag_name: tag_name.clone(),
                })?;

            variable_types_map.insert(var_key.clone(), tag.tag_type);
            type_to_variable.entry(tag.tag_type).or_insert(var_key.clone());

            // Variables without values are matched but contribute nothing.
            let Some(&choice) = combination.choices.get(&var_key) else {
                continue;
            };
            let record = active
                .iter()
                .find(|variable| variable.key == var_key)
                .and_then(|variable| variable.values.get(choice));
            let Some(record) = record else {
                continue;
            };

            bucket.apply_value(tag, record);
        } else {
            bucket.apply_literal(tag);
        }
    }

    let mut coordinate = Coordinate::empty();
    for (var_key, &choice) in &combination.choices {
        if let Some(slot) = variable_slot(var_key) {
            coordinate.set(slot, choice as u32);
        }
    }
    if let Some(batch_index) = combination.batch_index {
        coordinate.fill_batch_index(batch_index);
    }

    let mut prompts = bucket.prompts;
    if prompts.is_empty() {
        prompts.push(PromptItem::freetext(DEFAULT_PROMPT, 1.0));
    }

    let seed = bucket
        .seed
        .unwrap_or_else(|| rand::thread_rng().gen_range(1..=MAX_RANDOM_SEED));

    Ok(SubtaskSpec {
        coordinate,
        prompts,
        ratio: bucket.ratio,
        seed,
        use_polish: bucket.use_polish,
        client_args: bucket.client_args,
        variable_types_map,
        type_to_variable,
    })
}

/// Accumulates tag contributions for one combination.
struct Buckets {
    prompts: Vec<PromptItem>,
    ratio: String,
    seed: Option<i64>,
    use_polish: bool,
    client_args: crate::model::task::ClientArgs,
}

impl Buckets {
    fn new(task: &Task) -> Self {
        Self {
            prompts: Vec::new(),
            ratio: "1:1".to_string(),
            seed: None,
            use_polish: false,
            // Task-level hyperparameters seed the bucket; variable tags
            // of the same type override per combination.
            client_args: task.settings.client_args.clone().unwrap_or_default(),
        }
    }

    fn apply_value(&mut self, tag: &Tag, record: &ValueRecord) {
        let weight = record.weight.or(tag.weight).unwrap_or(1.0);
        match tag.tag_type {
            TagType::Prompt => {
                self.prompts.push(PromptItem::freetext(&record.value, weight));
            }
            TagType::Character => self.prompts.push(PromptItem::character(
                record.uuid.clone().unwrap_or_default(),
                &record.value,
                weight,
                record.header_img.clone().unwrap_or_default(),
            )),
            TagType::Element => self.prompts.push(PromptItem::element(
                record.uuid.clone().unwrap_or_default(),
                &record.value,
                weight,
                record.header_img.clone().unwrap_or_default(),
            )),
            _ => self.apply_scalar(tag.tag_type, &record.value),
        }
    }

    fn apply_literal(&mut self, tag: &Tag) {
        let weight = tag.weight.unwrap_or(1.0);
        match tag.tag_type {
            TagType::Prompt => {
                if !tag.value.is_empty() {
                    self.prompts.push(PromptItem::freetext(&tag.value, weight));
                }
            }
            TagType::Character => self.prompts.push(PromptItem::character(
                tag.uuid.clone().unwrap_or_default(),
                &tag.value,
                weight,
                tag.header_img.clone().unwrap_or_default(),
            )),
            TagType::Element => self.prompts.push(PromptItem::element(
                tag.uuid.clone().unwrap_or_default(),
                &tag.value,
                weight,
                tag.header_img.clone().unwrap_or_default(),
            )),
            _ => self.apply_scalar(tag.tag_type, &tag.value),
        }
    }

    fn apply_scalar(&mut self, tag_type: TagType, value: &str) {
        match tag_type {
            TagType::Ratio => {
                self.ratio = if value.contains(':') {
                    value.to_string()
                } else {
                    "1:1".to_string()
                };
            }
            TagType::Seed => match value.trim().parse::<i64>() {
                Ok(seed) => self.seed = Some(seed),
                Err(_) => {
                    if !value.is_empty() {
                        warn!(value = %value, "seed tag is not an integer, keeping random seed");
                    }
                }
            },
            TagType::Polish => {
                self.use_polish = value.eq_ignore_ascii_case("true");
            }
            TagType::CkptName => {
                if !value.is_empty() {
                    self.client_args.ckpt_name = Some(value.to_string());
                }
            }
            TagType::Steps => match value.trim().parse::<u32>() {
                Ok(steps) if STEPS_RANGE.contains(&steps) => self.client_args.steps = Some(steps),
                _ => warn!(value = %value, "steps value out of range, ignoring"),
            },
            TagType::Cfg => match value.trim().parse::<f64>() {
                Ok(cfg) if CFG_RANGE.contains(&cfg) => self.client_args.cfg = Some(cfg),
                _ => warn!(value = %value, "cfg value out of range, ignoring"),
            },
            _ => {}
        }
    }
}
