//! Six-slot subtask coordinates and their canonical string form.
//!
//! A coordinate pins a subtask to one cell of its task's result matrix.
//! Slot K holds the index of the chosen value within variable `vK`'s value
//! list, or nothing when `vK` is unused. The canonical "indexed key" is the
//! comma-joined rendering with empty segments for unused slots, e.g.
//! `"0,1,,,,"` for `(0, 1, -, -, -, -)`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of variable slots a coordinate carries (`v0`..`v5`).
pub const SLOT_COUNT: usize = 6;

/// Errors produced when parsing an indexed key back into a coordinate.
#[derive(Debug, Error)]
pub enum CoordinateError {
    /// The key did not contain exactly six comma-separated segments.
    #[error("indexed key '{0}' must have exactly {SLOT_COUNT} segments")]
    WrongSegmentCount(String),

    /// A non-empty segment was not a valid unsigned integer.
    #[error("indexed key segment '{segment}' in '{key}' is not an index")]
    InvalidSegment { key: String, segment: String },
}

/// A fixed-length tuple of optional value indices, one per variable slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Coordinate([Option<u32>; SLOT_COUNT]);

impl Coordinate {
    /// Creates a coordinate with every slot unused.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Creates a coordinate from explicit slot values.
    pub fn from_slots(slots: [Option<u32>; SLOT_COUNT]) -> Self {
        Self(slots)
    }

    /// Returns the index stored in `slot`, if any.
    pub fn get(&self, slot: usize) -> Option<u32> {
        self.0.get(slot).copied().flatten()
    }

    /// Stores `index` in `slot`. Out-of-range slots are ignored.
    pub fn set(&mut self, slot: usize, index: u32) {
        if let Some(cell) = self.0.get_mut(slot) {
            *cell = Some(index);
        }
    }

    /// Places a batch index in the last slot, unless that slot is already
    /// occupied by a real variable.
    pub fn fill_batch_index(&mut self, index: u32) {
        if self.0[SLOT_COUNT - 1].is_none() {
            self.0[SLOT_COUNT - 1] = Some(index);
        }
    }

    /// Returns the raw slot array.
    pub fn slots(&self) -> &[Option<u32>; SLOT_COUNT] {
        &self.0
    }

    /// Returns true when no slot carries an index.
    pub fn is_empty(&self) -> bool {
        self.0.iter().all(Option::is_none)
    }

    /// Renders the canonical comma-joined key, with empty segments for
    /// unused slots.
    pub fn indexed_key(&self) -> String {
        self.0
            .iter()
            .map(|slot| slot.map(|i| i.to_string()).unwrap_or_default())
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Parses a canonical indexed key back into a coordinate.
    pub fn parse_indexed_key(key: &str) -> Result<Self, CoordinateError> {
        let segments: Vec<&str> = key.split(',').collect();
        if segments.len() != SLOT_COUNT {
            return Err(CoordinateError::WrongSegmentCount(key.to_string()));
        }

        let mut slots = [None; SLOT_COUNT];
        for (slot, segment) in segments.iter().enumerate() {
            if segment.is_empty() {
                continue;
            }
            let index = segment
                .parse::<u32>()
                .map_err(|_| CoordinateError::InvalidSegment {
                    key: key.to_string(),
                    segment: (*segment).to_string(),
                })?;
            slots[slot] = Some(index);
        }

        Ok(Self(slots))
    }
}

impl std::fmt::Display for Coordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.indexed_key())
    }
}
