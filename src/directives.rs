//! Directive-side state
//!
//! Directives are macros that change translator state instead of emitting
//! text. The state they manipulate lives here: the template-scoped user
//! macro table filled by `SET`, the emission stack driven by
//! `IF`/`ELSE`/`ENDIF`, and the temporary-pool declaration template set by
//! `TEMP_POOL`. Directive evaluation itself is dispatched centrally in
//! `rules`.

use std::collections::BTreeMap;
use std::rc::Rc;

use crate::diagnostics::ErrorContext;
use crate::error::TranslatorError;
use crate::index::AbstractIndex;
use crate::token::TokenList;

// =============================================================================
// USER MACROS
// =============================================================================

/// A macro registered by the `SET` directive.
///
/// The body is tokenized once at declaration and re-evaluated per call
/// site. Positional arguments `$1..$9` in the body are substituted from the
/// call site's argument list; the declared indices are bound to the call
/// site's actual indices through an [`IndexRemapRule`].
#[derive(Clone, Debug)]
pub struct UserMacro {
    pub name: String,
    pub indices: Vec<AbstractIndex>,
    pub body: Rc<TokenList>,
    /// Number of positional arguments the body consumes (highest `$N`).
    pub arity: usize,
    pub declared_at: ErrorContext,
}

/// Name → macro table, scoped to one template file.
#[derive(Debug, Default)]
pub struct UserMacroTable {
    macros: BTreeMap<String, UserMacro>,
}

impl UserMacroTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a macro. Redefinition keeps the original and errors.
    pub fn register(&mut self, user_macro: UserMacro) -> Result<(), TranslatorError> {
        if self.macros.contains_key(&user_macro.name) {
            return Err(TranslatorError::UserMacroRedefinition(user_macro.name));
        }
        tracing::debug!(name = %user_macro.name, "user macro registered");
        self.macros.insert(user_macro.name.clone(), user_macro);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&UserMacro> {
        self.macros.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.macros.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.macros.len()
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty()
    }
}

/// Highest `$N` placeholder used in a macro body.
pub fn body_arity(body: &str) -> usize {
    let mut arity = 0;
    let mut chars = body.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '$' {
            if let Some(digit) = chars.peek().and_then(|c| c.to_digit(10)) {
                if digit > 0 {
                    arity = arity.max(digit as usize);
                }
            }
        }
    }
    arity
}

/// Substitute `$1..$9` placeholders from a call site's argument list.
/// Placeholders beyond the supplied arguments stay literal.
pub fn substitute_positional(text: &str, args: &[String]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(ch) = chars.next() {
        if ch == '$' {
            if let Some(digit) = chars.peek().and_then(|c| c.to_digit(10)) {
                let slot = digit as usize;
                if slot >= 1 && slot <= args.len() {
                    out.push_str(&args[slot - 1]);
                    chars.next();
                    continue;
                }
            }
        }
        out.push(ch);
    }
    out
}

// =============================================================================
// INDEX REMAPPING
// =============================================================================

/// Declared-index → call-site-index dictionary applied when evaluating a
/// user macro body.
#[derive(Clone, Debug, Default)]
pub struct IndexRemapRule {
    map: Vec<(char, AbstractIndex)>,
}

impl IndexRemapRule {
    /// Pair a declaration's indices with a call site's, position-wise.
    /// Arity mismatches are caught earlier, at tokenization.
    pub fn new(declared: &[AbstractIndex], actual: &[AbstractIndex]) -> Self {
        Self {
            map: declared
                .iter()
                .zip(actual)
                .map(|(d, a)| (d.label, *a))
                .collect(),
        }
    }

    /// Call-site index standing for the declared label, if mapped.
    pub fn resolve(&self, label: char) -> Option<AbstractIndex> {
        self.map
            .iter()
            .find(|(declared, _)| *declared == label)
            .map(|(_, actual)| *actual)
    }
}

// =============================================================================
// CONDITIONAL EMISSION
// =============================================================================

#[derive(Debug)]
struct EmitFrame {
    active: bool,
    parent_active: bool,
    seen_else: bool,
}

/// Nesting-aware `IF`/`ELSE`/`ENDIF` state.
#[derive(Debug, Default)]
pub struct EmissionStack {
    frames: Vec<EmitFrame>,
}

impl EmissionStack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether lines are currently emitted.
    pub fn enabled(&self) -> bool {
        self.frames.iter().all(|f| f.active)
    }

    pub fn push_if(&mut self, condition: bool) {
        let parent_active = self.enabled();
        self.frames.push(EmitFrame {
            active: condition,
            parent_active,
            seen_else: false,
        });
    }

    pub fn toggle_else(&mut self) -> Result<(), TranslatorError> {
        match self.frames.last_mut() {
            None => Err(TranslatorError::DirectiveMisuse(
                "ELSE without matching IF".to_string(),
            )),
            Some(frame) if frame.seen_else => Err(TranslatorError::DirectiveMisuse(
                "second ELSE in one IF block".to_string(),
            )),
            Some(frame) => {
                frame.seen_else = true;
                frame.active = frame.parent_active && !frame.active;
                Ok(())
            }
        }
    }

    pub fn pop_endif(&mut self) -> Result<(), TranslatorError> {
        match self.frames.pop() {
            None => Err(TranslatorError::DirectiveMisuse(
                "ENDIF without matching IF".to_string(),
            )),
            Some(_) => Ok(()),
        }
    }

    /// Number of unclosed IF blocks, checked at end of template.
    pub fn open_blocks(&self) -> usize {
        self.frames.len()
    }
}

// =============================================================================
// TEMPORARY POOL
// =============================================================================

/// Declaration template for CSE temporaries.
///
/// `$1` is the temporary name, `$2` the printed body, `$3` the working
/// type. The default template produces a plain typed declaration.
#[derive(Debug)]
pub struct TempPool {
    template: String,
}

impl Default for TempPool {
    fn default() -> Self {
        Self {
            template: "$3 $1 = $2;".to_string(),
        }
    }
}

impl TempPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_template(&mut self, template: impl Into<String>) {
        self.template = template.into();
    }

    /// Render one temporary declaration line.
    pub fn format(&self, name: &str, body: &str, working_type: &str) -> String {
        substitute_positional(
            &self.template,
            &[
                name.to_string(),
                body.to_string(),
                working_type.to_string(),
            ],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn positional_substitution() {
        let args = vec!["5".to_string(), "x".to_string()];
        assert_eq!(substitute_positional("($1)*2 + $2", &args), "(5)*2 + x");
        // Out-of-range placeholders stay literal.
        assert_eq!(substitute_positional("$3", &args), "$3");
        // $0 is not a placeholder.
        assert_eq!(substitute_positional("$0", &args), "$0");
    }

    #[test]
    fn body_arity_finds_highest_placeholder() {
        assert_eq!(body_arity("($1)*2"), 1);
        assert_eq!(body_arity("$2 + $1 + $2"), 2);
        assert_eq!(body_arity("no placeholders"), 0);
    }

    #[test]
    fn emission_stack_nesting() {
        let mut stack = EmissionStack::new();
        assert!(stack.enabled());

        stack.push_if(true);
        assert!(stack.enabled());

        stack.push_if(false);
        assert!(!stack.enabled());

        // ELSE inside an active parent flips the branch.
        stack.toggle_else().unwrap();
        assert!(stack.enabled());

        stack.pop_endif().unwrap();
        stack.pop_endif().unwrap();
        assert!(stack.enabled());
        assert_eq!(stack.open_blocks(), 0);
    }

    #[test]
    fn else_inside_suppressed_parent_stays_suppressed() {
        let mut stack = EmissionStack::new();
        stack.push_if(false);
        stack.push_if(true);
        stack.toggle_else().unwrap();
        assert!(!stack.enabled());
    }

    #[test]
    fn unbalanced_directives_error() {
        let mut stack = EmissionStack::new();
        assert!(stack.toggle_else().is_err());
        assert!(stack.pop_endif().is_err());

        stack.push_if(true);
        stack.toggle_else().unwrap();
        assert!(stack.toggle_else().is_err());
    }

    #[test]
    fn temp_pool_formatting() {
        let mut pool = TempPool::new();
        assert_eq!(pool.format("t3", "x*y", "double"), "double t3 = x*y;");

        pool.set_template("auto $1 = $2; // pooled");
        assert_eq!(pool.format("t4", "a+b", "double"), "auto t4 = a+b; // pooled");
    }
}
