//! Queue check ordering
//!
//! A queue set is built from a list of queue names where duplicates encode
//! weight. In strict mode the unique names are checked in configured order
//! every cycle. In fair mode the weighted list is shuffled every cycle and
//! then deduplicated, so a queue listed twice comes first twice as often as
//! a queue listed once and no queue starves.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Weighted set of queue names with a check-order policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueSet {
    weighted: Vec<String>,
    unique: Vec<String>,
    strict: bool,
}

impl QueueSet {
    /// Build a queue set from a weighted name list
    pub fn new(names: Vec<String>, strict: bool) -> Self {
        let unique = dedupe(names.iter().cloned());
        Self {
            weighted: names,
            unique,
            strict,
        }
    }

    /// Fixed priority order: the first queue is always checked first
    pub fn strict(names: Vec<String>) -> Self {
        Self::new(names, true)
    }

    /// Weighted random order, reshuffled on every call
    pub fn fair(names: Vec<String>) -> Self {
        Self::new(names, false)
    }

    /// Whether the configured order is preserved every cycle
    pub fn is_strict(&self) -> bool {
        self.strict
    }

    /// Distinct queue names in configured order
    pub fn unique_names(&self) -> &[String] {
        &self.unique
    }

    /// Names in the order they should be checked this cycle
    pub fn ordered_names(&self) -> Vec<String> {
        self.ordered_names_with(&mut rand::thread_rng())
    }

    /// Same as [`ordered_names`](Self::ordered_names) with a caller-supplied RNG
    pub fn ordered_names_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Vec<String> {
        if self.strict {
            return self.unique.clone();
        }

        let mut shuffled = self.weighted.clone();
        shuffled.shuffle(rng);
        dedupe(shuffled.into_iter())
    }
}

fn dedupe(names: impl Iterator<Item = String>) -> Vec<String> {
    let mut unique: Vec<String> = Vec::new();
    for name in names {
        if !unique.contains(&name) {
            unique.push(name);
        }
    }
    unique
}
