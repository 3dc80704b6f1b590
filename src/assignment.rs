//! Index assignment enumeration
//!
//! An [`IndexAssignment`] maps each abstract index of a statement to a
//! concrete integer in its range. Enumeration walks the Cartesian product of
//! the declared ranges in declaration order with the last-declared index
//! varying fastest, matching row-major flattening conventions. The order is
//! deterministic: repeated runs over identical input enumerate identically.

use crate::config::ModelConfig;
use crate::error::TranslatorError;
use crate::index::AbstractIndex;

/// Concrete values for the abstract indices of one statement.
///
/// Entries keep declaration order so that merged assignments remain
/// deterministic.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IndexAssignment {
    entries: Vec<(char, usize)>,
}

impl IndexAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Value bound to `label`, if any.
    pub fn get(&self, label: char) -> Option<usize> {
        self.entries
            .iter()
            .find(|(l, _)| *l == label)
            .map(|(_, v)| *v)
    }

    /// Bind `label`, overwriting any previous binding.
    pub fn bind(&mut self, label: char, value: usize) {
        match self.entries.iter_mut().find(|(l, _)| *l == label) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((label, value)),
        }
    }

    /// New assignment extending `self` with every binding of `other`.
    /// Bindings in `other` win on collision.
    pub fn merged(&self, other: &IndexAssignment) -> IndexAssignment {
        let mut out = self.clone();
        for (label, value) in &other.entries {
            out.bind(*label, *value);
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (char, usize)> + '_ {
        self.entries.iter().copied()
    }
}

/// Iterator over the Cartesian product of index ranges.
///
/// Yields exactly one empty assignment for an empty index set, so a
/// statement without free indices still produces one output line.
#[derive(Debug)]
pub struct AssignmentIter {
    indices: Vec<AbstractIndex>,
    sizes: Vec<usize>,
    counters: Vec<usize>,
    done: bool,
}

impl AssignmentIter {
    fn new(indices: &[AbstractIndex], model: &ModelConfig) -> Self {
        let sizes: Vec<usize> = indices.iter().map(|i| i.range.size(model)).collect();
        // Any empty range empties the whole product.
        let done = sizes.iter().any(|&s| s == 0);
        Self {
            indices: indices.to_vec(),
            counters: vec![0; sizes.len()],
            sizes,
            done,
        }
    }
}

impl Iterator for AssignmentIter {
    type Item = IndexAssignment;

    fn next(&mut self) -> Option<IndexAssignment> {
        if self.done {
            return None;
        }

        let mut assignment = IndexAssignment::new();
        for (index, value) in self.indices.iter().zip(&self.counters) {
            assignment.bind(index.label, *value);
        }

        // Odometer step, last-declared index fastest.
        self.done = true;
        for pos in (0..self.counters.len()).rev() {
            self.counters[pos] += 1;
            if self.counters[pos] < self.sizes[pos] {
                self.done = false;
                break;
            }
            self.counters[pos] = 0;
        }

        Some(assignment)
    }
}

/// Enumerate every assignment of `indices` for `model`.
pub fn enumerate(indices: &[AbstractIndex], model: &ModelConfig) -> AssignmentIter {
    AssignmentIter::new(indices, model)
}

/// Number of assignments [`enumerate`] will yield: the product of the range
/// sizes.
pub fn assignment_count(indices: &[AbstractIndex], model: &ModelConfig) -> usize {
    indices.iter().map(|i| i.range.size(model)).product()
}

/// Enumerate, requiring every range to be non-empty.
///
/// A forced unroll over an empty range (e.g. a parameter index in a model
/// with no parameters) is unsatisfiable rather than silently empty.
pub fn enumerate_checked(
    indices: &[AbstractIndex],
    model: &ModelConfig,
) -> Result<AssignmentIter, TranslatorError> {
    if let Some(index) = indices.iter().find(|i| i.range.size(model) == 0) {
        return Err(TranslatorError::UnsatisfiableUnroll {
            label: index.label,
            detail: format!("range {:?} is empty for this model", index.range),
        });
    }
    Ok(AssignmentIter::new(indices, model))
}
