//! Engine error types.

use thiserror::Error;

use crate::diagnostics::DiagnosticCode;

/// Errors that can occur while expanding a template line.
///
/// Most variants are recoverable: the offending token is silenced, the error
/// is reported through the sink, and processing continues so a single pass
/// surfaces every problem in the template. [`TranslatorError::Internal`]
/// is the exception: it signals an inconsistent cache or an unprintable
/// node, and aborts the current template.
#[derive(Debug, Clone, Error)]
pub enum TranslatorError {
    /// Malformed or unterminated argument list at a call site.
    #[error("macro '{name}': {detail}")]
    LexicalArity { name: String, detail: String },

    /// Index list missing or of the wrong length.
    #[error("macro '{name}' expects {expected} indices, found {found}")]
    IndexCount {
        name: String,
        expected: usize,
        found: usize,
    },

    /// Duplicate index label in one occurrence, or one label claimed with
    /// two different ranges.
    #[error("index '{label}': {detail}")]
    IndexRangeConflict { label: char, detail: String },

    /// A roll-up was required but no flattening resource is registered, or
    /// an unroll was forced for an index whose range cannot be determined.
    #[error("cannot resolve index '{label}': {detail}")]
    UnsatisfiableUnroll { label: char, detail: String },

    /// Occurrence of a name no registered rule or user macro matches.
    #[error("unknown macro name '{0}'")]
    UnknownMacroName(String),

    /// `SET` directive naming an already-registered user macro.
    #[error("user macro '{0}' is already defined")]
    UserMacroRedefinition(String),

    /// A macro queried a resource cache entry that has not been assigned.
    #[error("resource '{0}' has not been assigned")]
    ResourceNotSet(String),

    /// Directive used outside its valid position (e.g. `ELSE` without `IF`).
    #[error("directive misuse: {0}")]
    DirectiveMisuse(String),

    /// The pre-macro pass failed to reach a fixpoint.
    #[error("pre-macro expansion did not converge after {passes} passes (last substituted '{name}')")]
    PreMacroDivergence { name: String, passes: usize },

    /// Structural failure internal to the engine. Not recoverable for the
    /// current template.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TranslatorError {
    /// Whether per-line processing may continue after reporting this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, TranslatorError::Internal(_))
    }

    /// The diagnostic code under which this error is reported.
    pub fn code(&self) -> DiagnosticCode {
        match self {
            TranslatorError::LexicalArity { .. } => DiagnosticCode::LexicalArity,
            TranslatorError::IndexCount { .. } => DiagnosticCode::IndexCount,
            TranslatorError::IndexRangeConflict { .. } => DiagnosticCode::IndexRangeConflict,
            TranslatorError::UnsatisfiableUnroll { .. } => DiagnosticCode::UnsatisfiableUnroll,
            TranslatorError::UnknownMacroName(_) => DiagnosticCode::UnknownMacroName,
            TranslatorError::UserMacroRedefinition(_) => DiagnosticCode::UserMacroRedefinition,
            TranslatorError::ResourceNotSet(_) => DiagnosticCode::ResourceNotSet,
            TranslatorError::DirectiveMisuse(_) => DiagnosticCode::DirectiveMisuse,
            TranslatorError::PreMacroDivergence { .. } => DiagnosticCode::PreMacroDivergence,
            TranslatorError::Internal(_) => DiagnosticCode::Internal,
        }
    }
}
