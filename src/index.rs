//! Abstract index data model
//!
//! An abstract index is a single-character placeholder standing for a
//! numeral in a declared range. One tensor equation in a template becomes
//! many concrete statements by enumerating its abstract indices, or stays a
//! single statement with the index kept abstract behind a flattening
//! function.
//!
//! Ranges are either declared by the owning macro rule or inferred from the
//! label by convention: lowercase labels range over fields, uppercase over
//! fields plus momenta, digits over parameters. The convention is
//! provisional and isolated in [`IndexRange::infer_from_label`].

use serde::{Deserialize, Serialize};

use crate::config::ModelConfig;
use crate::error::TranslatorError;

/// Range an abstract index runs over.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndexRange {
    /// Fields only: `0..Nf`.
    FieldOnly,
    /// Fields plus momenta: `0..2*Nf`.
    FieldPlusMomentum,
    /// Model parameters: `0..Np`.
    Parameter,
}

impl IndexRange {
    /// Concrete size of this range for a given model.
    pub fn size(&self, model: &ModelConfig) -> usize {
        match self {
            IndexRange::FieldOnly => model.num_fields,
            IndexRange::FieldPlusMomentum => model.phase_size(),
            IndexRange::Parameter => model.num_params,
        }
    }

    /// Label-case default: lowercase = field, uppercase = field+momentum,
    /// digit = parameter.
    pub fn infer_from_label(label: char) -> IndexRange {
        if label.is_ascii_digit() {
            IndexRange::Parameter
        } else if label.is_ascii_uppercase() {
            IndexRange::FieldPlusMomentum
        } else {
            IndexRange::FieldOnly
        }
    }
}

/// Upper or lower tensor index position, as used to key resource caches.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Variance {
    Covariant,
    Contravariant,
}

/// A single abstract index attached to one macro occurrence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct AbstractIndex {
    pub label: char,
    pub range: IndexRange,
}

impl AbstractIndex {
    pub fn new(label: char, range: IndexRange) -> Self {
        Self { label, range }
    }

    /// Index with the range inferred from the label case.
    pub fn inferred(label: char) -> Self {
        Self {
            label,
            range: IndexRange::infer_from_label(label),
        }
    }
}

/// Validate the index list of a single occurrence.
///
/// Labels must be unique within one occurrence; a repeated label is an
/// [`TranslatorError::IndexRangeConflict`].
pub fn check_occurrence(indices: &[AbstractIndex]) -> Result<(), TranslatorError> {
    for (pos, index) in indices.iter().enumerate() {
        if indices[..pos].iter().any(|prior| prior.label == index.label) {
            return Err(TranslatorError::IndexRangeConflict {
                label: index.label,
                detail: "label appears twice in one macro occurrence".to_string(),
            });
        }
    }
    Ok(())
}

/// Merge index declarations across a statement, first appearance order.
///
/// The same label may appear in several occurrences, but every occurrence
/// must agree on its range.
pub fn merge_declarations(
    declarations: &[AbstractIndex],
) -> Result<Vec<AbstractIndex>, TranslatorError> {
    let mut merged: Vec<AbstractIndex> = Vec::new();
    for index in declarations {
        match merged.iter().position(|prior| prior.label == index.label) {
            None => merged.push(*index),
            Some(pos) if merged[pos].range == index.range => {}
            Some(pos) => {
                return Err(TranslatorError::IndexRangeConflict {
                    label: index.label,
                    detail: format!(
                        "declared with range {:?} but previously {:?}",
                        index.range, merged[pos].range
                    ),
                });
            }
        }
    }
    Ok(merged)
}
