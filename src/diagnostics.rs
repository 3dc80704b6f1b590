//! Unified diagnostics
//!
//! Single diagnostic type used across tokenization, index resolution, and
//! macro evaluation. Every diagnostic carries the include-stack context of
//! the line that produced it, so errors surfaced deep inside a nested macro
//! evaluation still point at the template line being expanded.
//!
//! Reporting goes through the [`ErrorSink`] capability, passed by reference
//! wherever diagnostics may arise. The engine never escalates on its own:
//! per-line processing is best-effort, and the driver decides whether "any
//! error reported" is fatal for the template.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Diagnostic severity level.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Severity {
    Error,
    Warning,
    Info,
}

/// Diagnostic codes for categorizing issues.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiagnosticCode {
    // =========================================================================
    // Call-site errors
    // =========================================================================
    LexicalArity,
    IndexCount,
    UnknownMacroName,

    // =========================================================================
    // Index resolution errors
    // =========================================================================
    IndexRangeConflict,
    UnsatisfiableUnroll,

    // =========================================================================
    // Directive / state errors
    // =========================================================================
    UserMacroRedefinition,
    DirectiveMisuse,
    ResourceNotSet,

    // =========================================================================
    // Engine errors
    // =========================================================================
    PreMacroDivergence,
    Internal,
}

/// One frame of the include stack: a template file and the line within it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncludeFrame {
    pub path: String,
    pub line: u32,
}

/// Where a diagnostic arose: the full include chain, innermost frame last.
///
/// The innermost frame names the line currently being expanded; outer frames
/// record the chain of includes that reached it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub stack: Vec<IncludeFrame>,
}

impl ErrorContext {
    /// Context for a top-level template line.
    pub fn new(path: impl Into<String>, line: u32) -> Self {
        Self {
            stack: vec![IncludeFrame {
                path: path.into(),
                line,
            }],
        }
    }

    /// Push an included file onto the chain.
    pub fn push(&mut self, path: impl Into<String>, line: u32) {
        self.stack.push(IncludeFrame {
            path: path.into(),
            line,
        });
    }

    /// The innermost frame, if any.
    pub fn current(&self) -> Option<&IncludeFrame> {
        self.stack.last()
    }

    /// Replace the line number of the innermost frame.
    pub fn set_line(&mut self, line: u32) {
        if let Some(frame) = self.stack.last_mut() {
            frame.line = line;
        }
    }
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.stack.split_last() {
            None => write!(f, "<no context>"),
            Some((innermost, outer)) => {
                write!(f, "{}:{}", innermost.path, innermost.line)?;
                for frame in outer.iter().rev() {
                    write!(f, " (included from {}:{})", frame.path, frame.line)?;
                }
                Ok(())
            }
        }
    }
}

/// A single reported issue.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub code: DiagnosticCode,
    pub message: String,
    pub context: ErrorContext,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let level = match self.severity {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
        };
        write!(f, "{}: {}: {}", self.context, level, self.message)
    }
}

// =============================================================================
// SINKS
// =============================================================================

/// Capability through which the engine reports diagnostics.
///
/// Passed by reference into every operation that can fail recoverably. The
/// engine holds no sink of its own, so the surrounding driver keeps full
/// control of where diagnostics go.
pub trait ErrorSink {
    fn report(&mut self, diagnostic: Diagnostic);

    fn error(&mut self, context: &ErrorContext, code: DiagnosticCode, message: String) {
        self.report(Diagnostic {
            severity: Severity::Error,
            code,
            message,
            context: context.clone(),
        });
    }

    fn warn(&mut self, context: &ErrorContext, code: DiagnosticCode, message: String) {
        self.report(Diagnostic {
            severity: Severity::Warning,
            code,
            message,
            context: context.clone(),
        });
    }
}

/// Sink that buffers diagnostics in memory.
#[derive(Debug, Default)]
pub struct BufferedSink {
    diagnostics: Vec<Diagnostic>,
}

impl BufferedSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    /// Whether any error-severity diagnostic has been reported.
    pub fn has_errors(&self) -> bool {
        self.diagnostics
            .iter()
            .any(|d| d.severity == Severity::Error)
    }

    pub fn len(&self) -> usize {
        self.diagnostics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.diagnostics.is_empty()
    }

    /// Serialize the buffered diagnostics for external tooling.
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(&self.diagnostics)?)
    }
}

impl ErrorSink for BufferedSink {
    fn report(&mut self, diagnostic: Diagnostic) {
        tracing::debug!(code = ?diagnostic.code, "{}", diagnostic);
        self.diagnostics.push(diagnostic);
    }
}
