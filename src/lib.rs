//! tensor-templates: index-aware macro substitution for tensor codegen
//!
//! The code-generation engine of a physics-model compiler. Template lines
//! carry macro invocations in tensor notation (`$$__NAME[AB]{args}`); the
//! engine expands them into target-language statements, deciding per
//! occurrence whether to unroll an abstract tensor index into concrete
//! statements or keep it abstract behind a flattening function for a
//! run-time loop. It supports user-defined macros (`SET`), state-changing
//! directives, and common-subexpression elimination while printing.
//!
//! This crate contains the pure expansion logic with no I/O:
//! - Token types and the compile-once tokenizer
//! - Call-site argument/index parsing
//! - The index assignment engine (deterministic Cartesian enumeration)
//! - Per-unit resource caches keyed by variance
//! - The CSE worker and shared expression cache
//! - The replacement-rule registry (packages and package groups)
//! - The directive subsystem and user macro table
//! - The macro agent orchestrating one line at a time
//!
//! The surrounding driver owns file I/O, the include/output stack, and the
//! symbolic tensor provider; it reaches the engine through the
//! [`expr::TensorFactory`], [`diagnostics::ErrorSink`], and
//! [`printer::LanguagePrinter`] seams.

pub mod agent;
pub mod assignment;
pub mod config;
pub mod cse;
pub mod diagnostics;
pub mod directives;
pub mod error;
pub mod expr;
pub mod index;
pub mod package;
pub mod parse;
pub mod printer;
pub mod resources;
pub mod rules;
pub mod token;
pub mod tokenizer;

// Re-export commonly used types
pub use agent::{LineExpansion, MacroAgent};
pub use assignment::{assignment_count, enumerate, AssignmentIter, IndexAssignment};
pub use config::{ModelConfig, TranslatorConfig};
pub use cse::{CacheStats, CseWorker, ExpressionCache};
pub use diagnostics::{
    BufferedSink, Diagnostic, DiagnosticCode, ErrorContext, ErrorSink, Severity,
};
pub use error::TranslatorError;
pub use expr::{Expr, TensorFactory, TensorKind};
pub use index::{AbstractIndex, IndexRange, Variance};
pub use package::{PackageGroup, ReplacementRulePackage};
pub use printer::{CLikePrinter, LanguagePrinter};
pub use resources::{ResourceKind, ResourceManager};
pub use rules::{
    Aggregation, EvalContext, ReplacementRule, RuleId, TranslationUnit, UnrollBehavior,
};
pub use token::{Token, TokenList};
pub use tokenizer::tokenize;
