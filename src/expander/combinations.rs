//! Cartesian-product enumeration over a task's active variables.

use std::collections::BTreeMap;

use tracing::warn;

use crate::model::task::{variable_slot, ValueRecord, Variable};

/// A variable that contributes values to the product, with placeholders
/// synthesised when only a count was declared.
#[derive(Debug, Clone)]
pub struct ActiveVariable {
    /// Coordinate slot this variable occupies (0..=5).
    pub slot: usize,
    /// Map key, e.g. `"v0"`.
    pub key: String,
    /// Effective ordered value list.
    pub values: Vec<ValueRecord>,
}

/// One cell of the expansion grid: a value choice per active variable plus
/// an optional batch replica index.
#[derive(Debug, Clone)]
pub struct Combination {
    /// Variable key to index into the active variable's value list.
    pub choices: BTreeMap<String, usize>,
    pub batch_index: Option<u32>,
}

/// Selects the variables participating in expansion, ordered by slot.
///
/// A variable participates when its effective value count is positive. A
/// declared count without values yields placeholder records, mirroring how
/// half-filled drafts are accepted upstream.
pub fn active_variables(variables: &BTreeMap<String, Variable>) -> Vec<ActiveVariable> {
    let mut active = Vec::new();

    for (key, variable) in variables {
        let Some(slot) = variable_slot(key) else {
            continue;
        };
        let count = variable.effective_count();
        if count == 0 {
            continue;
        }

        let values = if variable.values.is_empty() {
            warn!(
                variable = %key,
                values_count = count,
                "variable has no value records, synthesising placeholders"
            );
            (0..count)
                .map(|i| ValueRecord {
                    value: format!("placeholder_{}", i),
                    id: Some(format!("{}_placeholder_{}", key, i)),
                    uuid: None,
                    header_img: None,
                    weight: Some(1.0),
                })
                .collect()
        } else {
            variable.values.clone()
        };

        active.push(ActiveVariable {
            slot,
            key: key.clone(),
            values,
        });
    }

    active.sort_by_key(|variable| variable.slot);
    active
}

/// Enumerates the full grid: the Cartesian product of the active
/// variables' values, replicated `batch_size` times with distinct batch
/// indices when the batch multiplier exceeds one.
pub fn enumerate_combinations(active: &[ActiveVariable], batch_size: u32) -> Vec<Combination> {
    let mut base = vec![BTreeMap::new()];

    for variable in active {
        let mut next = Vec::with_capacity(base.len() * variable.values.len());
        for combination in &base {
            for index in 0..variable.values.len() {
                let mut choices = combination.clone();
                choices.insert(variable.key.clone(), index);
                next.push(choices);
            }
        }
        base = next;
    }

    if batch_size <= 1 {
        return base
            .into_iter()
            .map(|choices| Combination {
                choices,
                batch_index: None,
            })
            .collect();
    }

    let mut replicated = Vec::with_capacity(base.len() * batch_size as usize);
    for choices in base {
        for batch_index in 0..batch_size {
            replicated.push(Combination {
                choices: choices.clone(),
                batch_index: Some(batch_index),
            });
        }
    }
    replicated
}
