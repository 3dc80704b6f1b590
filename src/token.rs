//! Token stream
//!
//! A macro body or statement side is compiled once into an immutable
//! [`TokenList`] and re-evaluated per index assignment, replacing the old
//! scheme of repeated `find`-based rewriting. Evaluation never mutates the
//! list structure; the only interior state is the per-token silenced flag,
//! set once on the first reported error so repeated evaluation across many
//! assignments reports each problem exactly once.

use std::cell::Cell;
use std::rc::Rc;

use crate::assignment::IndexAssignment;
use crate::directives::{substitute_positional, IndexRemapRule};
use crate::error::TranslatorError;
use crate::index::{AbstractIndex, IndexRange};
use crate::rules::{
    eval_directive, eval_indexed, eval_simple, eval_user, Aggregation, EvalContext, RuleId,
    RuleOp, UnrollBehavior, UnrollStatus,
};

/// One compiled token.
#[derive(Clone, Debug)]
pub enum Token {
    /// Literal text span.
    Text(String),
    /// `<X>` reference to an abstract index.
    IndexLiteral(char),
    /// Occurrence of a simple (text-substitution) macro inside a body.
    Simple {
        rule: RuleId,
        name: String,
        args: Vec<String>,
        source: String,
        silenced: Cell<bool>,
    },
    /// Occurrence of an index macro.
    Index {
        rule: RuleId,
        name: String,
        args: Vec<String>,
        indices: Vec<AbstractIndex>,
        source: String,
        silenced: Cell<bool>,
    },
    /// Occurrence of a directive.
    Directive {
        rule: RuleId,
        name: String,
        args: Vec<String>,
        indices: Vec<AbstractIndex>,
        source: String,
        silenced: Cell<bool>,
    },
    /// Occurrence of a user macro registered by `SET`.
    User {
        name: String,
        args: Vec<String>,
        indices: Vec<AbstractIndex>,
        source: String,
        silenced: Cell<bool>,
    },
}

impl Token {
    /// Raw source span, emitted when the token is silenced.
    pub fn source(&self) -> &str {
        match self {
            Token::Text(text) => text,
            Token::IndexLiteral(_) => "",
            Token::Simple { source, .. }
            | Token::Index { source, .. }
            | Token::Directive { source, .. }
            | Token::User { source, .. } => source,
        }
    }

    fn silence(&self) {
        match self {
            Token::Simple { silenced, .. }
            | Token::Index { silenced, .. }
            | Token::Directive { silenced, .. }
            | Token::User { silenced, .. } => silenced.set(true),
            _ => {}
        }
    }

    fn is_silenced(&self) -> bool {
        match self {
            Token::Simple { silenced, .. }
            | Token::Index { silenced, .. }
            | Token::Directive { silenced, .. }
            | Token::User { silenced, .. } => silenced.get(),
            _ => false,
        }
    }
}

/// Immutable compiled form of one piece of template text.
#[derive(Clone, Debug, Default)]
pub struct TokenList {
    tokens: Vec<Token>,
    status: UnrollStatus,
    source: String,
}

impl TokenList {
    pub(crate) fn new(tokens: Vec<Token>, status: UnrollStatus, source: String) -> Self {
        Self {
            tokens,
            status,
            source,
        }
    }

    /// Most restrictive unroll policy of the constituent tokens.
    pub fn unroll_status(&self) -> UnrollStatus {
        self.status
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn tokens(&self) -> &[Token] {
        &self.tokens
    }

    pub fn is_pure_text(&self) -> bool {
        self.tokens
            .iter()
            .all(|t| matches!(t, Token::Text(_)))
    }

    /// Whether any directive occurrence was compiled in.
    pub fn has_directives(&self) -> bool {
        self.tokens
            .iter()
            .any(|t| matches!(t, Token::Directive { .. }))
    }

    /// Whether any index or user macro occurrence was compiled in.
    pub fn has_index_macros(&self) -> bool {
        self.tokens
            .iter()
            .any(|t| matches!(t, Token::Index { .. } | Token::User { .. }))
    }

    /// Index declarations contributed by this list, in appearance order.
    /// Bare `<X>` literals contribute their label-case default range.
    pub fn declarations(&self) -> Vec<AbstractIndex> {
        let mut out = Vec::new();
        for token in &self.tokens {
            match token {
                Token::IndexLiteral(label) => out.push(AbstractIndex::inferred(*label)),
                Token::Index { indices, .. }
                | Token::Directive { indices, .. }
                | Token::User { indices, .. } => out.extend(indices.iter().copied()),
                _ => {}
            }
        }
        out
    }

    /// Labels referenced anywhere in this list.
    pub fn labels(&self) -> Vec<char> {
        self.declarations().iter().map(|i| i.label).collect()
    }

    /// Unroll policies claimed over `label` by the macros that own it.
    pub fn policies(
        &self,
        label: char,
        ectx: &EvalContext,
    ) -> Vec<(UnrollBehavior, Aggregation)> {
        let mut out = Vec::new();
        for token in &self.tokens {
            match token {
                Token::Index { rule, indices, .. } => {
                    if indices.iter().any(|i| i.label == label) {
                        let rule = ectx.group.rule(*rule);
                        out.push((rule.unroll, rule.aggregation));
                    }
                }
                Token::User { name, indices, .. } => {
                    if indices.iter().any(|i| i.label == label) {
                        let behavior = ectx
                            .unit
                            .user_macros
                            .get(name)
                            .map(|m| m.body.unroll_status().behavior())
                            .unwrap_or(UnrollBehavior::Allow);
                        out.push((behavior, Aggregation::Repeat));
                    }
                }
                _ => {}
            }
        }
        out
    }

    /// Statement bracket, run before the first evaluation of a statement.
    pub fn pre_hook(&self, ectx: &mut EvalContext) {
        ectx.group.cse_mut().begin_statement();
    }

    /// Statement bracket, run after the last evaluation of a statement.
    pub fn post_hook(&self, ectx: &mut EvalContext) {
        ectx.group.cse_mut().end_statement();
    }

    /// Evaluate under `assignment`. Indices bound by the assignment become
    /// concrete numerals; unbound indices stay abstract (rolled). `remap`
    /// and `user_args` are present when this list is a user macro body.
    ///
    /// Recoverable errors are reported once and silence their token; only
    /// structural failures propagate.
    pub fn evaluate(
        &self,
        assignment: &IndexAssignment,
        scope: &[AbstractIndex],
        remap: Option<&IndexRemapRule>,
        user_args: Option<&[String]>,
        ectx: &mut EvalContext,
    ) -> Result<String, TranslatorError> {
        let mut out = String::with_capacity(self.source.len());

        for token in &self.tokens {
            if token.is_silenced() {
                out.push_str(token.source());
                continue;
            }

            match token {
                Token::Text(text) => match user_args {
                    Some(args) => out.push_str(&substitute_positional(text, args)),
                    None => out.push_str(text),
                },
                Token::IndexLiteral(label) => {
                    let index = resolve_label(*label, scope, remap);
                    match assignment.get(index.label) {
                        Some(value) => out.push_str(&value.to_string()),
                        None => match rolled_literal(index, ectx) {
                            Ok(text) => out.push_str(&text),
                            Err(error) if error.is_recoverable() => {
                                ectx.report(&error);
                                out.push(index.label);
                            }
                            Err(fatal) => return Err(fatal),
                        },
                    }
                }
                Token::Simple { rule, args, .. } => {
                    let args = prepare_args(args, user_args, assignment, scope, remap);
                    let rule = ectx.group.rule(*rule);
                    let op = match &rule.op {
                        RuleOp::Simple(op) => op.clone(),
                        _ => {
                            return Err(TranslatorError::Internal(format!(
                                "rule '{}' compiled as simple but registered otherwise",
                                rule.name
                            )))
                        }
                    };
                    match eval_simple(&op, &args, ectx) {
                        Ok(text) => {
                            out.push_str(&text);
                            ectx.replacements += 1;
                        }
                        Err(error) if error.is_recoverable() => {
                            ectx.report(&error);
                            token.silence();
                            out.push_str(token.source());
                        }
                        Err(fatal) => return Err(fatal),
                    }
                }
                Token::Index { rule, indices, .. } => {
                    let indices = remap_indices(indices, remap);
                    let rule = ectx.group.rule(*rule);
                    let op = match &rule.op {
                        RuleOp::Indexed(op) => *op,
                        _ => {
                            return Err(TranslatorError::Internal(format!(
                                "rule '{}' compiled as indexed but registered otherwise",
                                rule.name
                            )))
                        }
                    };
                    match eval_indexed(&op, &indices, assignment, ectx) {
                        Ok(text) => {
                            out.push_str(&text);
                            ectx.replacements += 1;
                        }
                        Err(error) if error.is_recoverable() => {
                            ectx.report(&error);
                            token.silence();
                            out.push_str(token.source());
                        }
                        Err(fatal) => return Err(fatal),
                    }
                }
                Token::Directive { rule, args, indices, .. } => {
                    let args = prepare_args(args, user_args, assignment, scope, remap);
                    let rule = ectx.group.rule(*rule);
                    let op = match &rule.op {
                        RuleOp::Directive(op) => op.clone(),
                        _ => {
                            return Err(TranslatorError::Internal(format!(
                                "rule '{}' compiled as directive but registered otherwise",
                                rule.name
                            )))
                        }
                    };
                    match eval_directive(&op, &args, indices, ectx) {
                        Ok(text) => {
                            out.push_str(&text);
                            ectx.replacements += 1;
                        }
                        Err(error) if error.is_recoverable() => {
                            ectx.report(&error);
                            token.silence();
                            out.push_str(token.source());
                        }
                        Err(fatal) => return Err(fatal),
                    }
                }
                Token::User { name, args, indices, .. } => {
                    let args = prepare_args(args, user_args, assignment, scope, remap);
                    let indices = remap_indices(indices, remap);
                    let user_macro = match ectx.unit.user_macros.get(name) {
                        Some(found) => found.clone(),
                        None => {
                            // Registered at tokenize time but gone now: the
                            // cached list no longer matches the table.
                            return Err(TranslatorError::Internal(format!(
                                "user macro '{}' vanished from the symbol table",
                                name
                            )));
                        }
                    };
                    match eval_user(&user_macro, &args, &indices, assignment, scope, ectx) {
                        Ok(text) => {
                            out.push_str(&text);
                            ectx.replacements += 1;
                        }
                        Err(error) if error.is_recoverable() => {
                            ectx.report(&error);
                            token.silence();
                            out.push_str(token.source());
                        }
                        Err(fatal) => return Err(fatal),
                    }
                }
            }
        }

        Ok(out)
    }
}

/// Resolve a literal's label: remap (user macro bodies) wins, then the
/// statement scope, then the label-case default.
fn resolve_label(
    label: char,
    scope: &[AbstractIndex],
    remap: Option<&IndexRemapRule>,
) -> AbstractIndex {
    if let Some(remapped) = remap.and_then(|r| r.resolve(label)) {
        return remapped;
    }
    scope
        .iter()
        .find(|i| i.label == label)
        .copied()
        .unwrap_or_else(|| AbstractIndex::inferred(label))
}

/// Rolled rendering of a bare index literal: the flattening call for field
/// ranges, the bare label for parameter ranges.
fn rolled_literal(index: AbstractIndex, ectx: &EvalContext) -> Result<String, TranslatorError> {
    match index.range {
        IndexRange::Parameter => Ok(index.label.to_string()),
        range => {
            let flatten = ectx.flattener_for(range, index.label)?;
            match flatten {
                Some(function) => Ok(format!("{}({})", function, index.label)),
                None => Ok(index.label.to_string()),
            }
        }
    }
}

/// Prepare a token's arguments for evaluation: substitute the enclosing
/// user macro's positional parameters, then any `<X>` literals bound by the
/// current assignment (argument text bypasses the tokenizer, so literals in
/// arguments are resolved here).
fn prepare_args(
    args: &[String],
    user_args: Option<&[String]>,
    assignment: &IndexAssignment,
    scope: &[AbstractIndex],
    remap: Option<&IndexRemapRule>,
) -> Vec<String> {
    args.iter()
        .map(|arg| {
            let arg = match user_args {
                Some(outer) => substitute_positional(arg, outer),
                None => arg.clone(),
            };
            substitute_bound_literals(&arg, assignment, scope, remap)
        })
        .collect()
}

/// Replace `<X>` sequences whose label is bound by `assignment` with the
/// concrete numeral. Unbound literals stay as written.
fn substitute_bound_literals(
    text: &str,
    assignment: &IndexAssignment,
    scope: &[AbstractIndex],
    remap: Option<&IndexRemapRule>,
) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut pos = 0;
    while pos < chars.len() {
        if pos + 2 < chars.len()
            && chars[pos] == '<'
            && chars[pos + 1].is_ascii_alphanumeric()
            && chars[pos + 2] == '>'
        {
            let index = resolve_label(chars[pos + 1], scope, remap);
            if let Some(value) = assignment.get(index.label) {
                out.push_str(&value.to_string());
                pos += 3;
                continue;
            }
        }
        out.push(chars[pos]);
        pos += 1;
    }
    out
}

fn remap_indices(indices: &[AbstractIndex], remap: Option<&IndexRemapRule>) -> Vec<AbstractIndex> {
    match remap {
        Some(rule) => indices
            .iter()
            .map(|index| rule.resolve(index.label).unwrap_or(*index))
            .collect(),
        None => indices.to_vec(),
    }
}

/// Shared handle to a compiled body.
pub type SharedTokenList = Rc<TokenList>;
