//! Macro body tokenizer
//!
//! Compiles template text into an immutable [`TokenList`] exactly once.
//! Recognized forms: literal text spans, `<X>` index-literal references,
//! and `$$__NAME` macro/directive occurrences resolved by name against the
//! active registry and the user macro table.
//!
//! Pre-macro names compile to simple tokens so macro bodies (which never
//! pass through the agent's pre-scan) still expand them; the pre-scan
//! itself substitutes well-formed occurrences away before tokenization and
//! leaves malformed ones for this pass to report, so nothing is reported
//! twice. Post-macro names stay literal text: the post table is applied to
//! fully assembled lines only.
//!
//! A call site failing arity validation is reported once and compiled as a
//! silenced token, so re-evaluating the list across many index assignments
//! does not repeat the diagnostic.

use std::cell::Cell;

use crate::diagnostics::{ErrorContext, ErrorSink};
use crate::directives::UserMacroTable;
use crate::error::TranslatorError;
use crate::index::{check_occurrence, AbstractIndex};
use crate::package::PackageGroup;
use crate::parse::{next_occurrence, parse_args, parse_indices, Occurrence};
use crate::rules::{UnrollBehavior, UnrollStatus};
use crate::token::{Token, TokenList};

/// Compile `text` into a token list against `group` and the current user
/// macro table.
pub fn tokenize(
    text: &str,
    group: &PackageGroup,
    user_macros: &UserMacroTable,
    context: &ErrorContext,
    sink: &mut dyn ErrorSink,
) -> TokenList {
    let mut compiler = Compiler {
        text,
        group,
        user_macros,
        context,
        sink,
        tokens: Vec::new(),
        status: UnrollStatus::default(),
        buffer: String::new(),
    };
    compiler.run();
    TokenList::new(compiler.tokens, compiler.status, text.to_string())
}

struct Compiler<'a> {
    text: &'a str,
    group: &'a PackageGroup,
    user_macros: &'a UserMacroTable,
    context: &'a ErrorContext,
    sink: &'a mut dyn ErrorSink,
    tokens: Vec<Token>,
    status: UnrollStatus,
    buffer: String,
}

impl Compiler<'_> {
    fn run(&mut self) {
        let mut pos = 0;
        while pos < self.text.len() {
            let literal = find_index_literal(self.text, pos);
            let occurrence = next_occurrence(self.text, pos);

            match (literal, occurrence) {
                (Some((lit_start, label)), occ)
                    if occ.as_ref().map_or(true, |o| lit_start < o.start) =>
                {
                    self.buffer.push_str(&self.text[pos..lit_start]);
                    self.flush_text();
                    self.tokens.push(Token::IndexLiteral(label));
                    pos = lit_start + 3;
                }
                (_, Some(occ)) => {
                    self.buffer.push_str(&self.text[pos..occ.start]);
                    pos = self.compile_occurrence(&occ);
                }
                (None, None) => {
                    self.buffer.push_str(&self.text[pos..]);
                    break;
                }
                // When `occurrence` is `None`, the guard on the first arm is
                // always `true`, so a literal-without-occurrence is handled
                // above; this pattern is therefore unreachable.
                (Some(_), None) => unreachable!("literal with no occurrence is handled by the first arm"),
            }
        }
        self.flush_text();
    }

    fn flush_text(&mut self) {
        if !self.buffer.is_empty() {
            self.tokens.push(Token::Text(std::mem::take(&mut self.buffer)));
        }
    }

    /// Compile one `$$__NAME` occurrence; returns the next scan position.
    fn compile_occurrence(&mut self, occ: &Occurrence) -> usize {
        let rest = &self.text[occ.after_name..];

        if let Some(id) = self.group.lookup_index(&occ.name) {
            let rule = self.group.rule(id);
            let (expected_indices, expected_args, range) = (rule.indices, rule.args, rule.range);
            let unroll = rule.unroll;
            return self.compile_with_lists(
                occ,
                rest,
                expected_indices,
                expected_args,
                |indices| {
                    crate::parse::apply_declared_range(indices, range);
                    Ok(())
                },
                |args, indices, source| Token::Index {
                    rule: id,
                    name: occ.name.clone(),
                    args,
                    indices,
                    source,
                    silenced: Cell::new(false),
                },
                unroll,
            );
        }

        if let Some(user_macro) = self.user_macros.get(&occ.name) {
            let declared: Vec<AbstractIndex> = user_macro.indices.clone();
            let expected_indices = Some(declared.len());
            let expected_args = Some(user_macro.arity);
            let behavior = user_macro.body.unroll_status().behavior();
            return self.compile_with_lists(
                occ,
                rest,
                expected_indices,
                expected_args,
                |indices| {
                    // Call-site indices adopt the declaration's ranges,
                    // slot by slot.
                    for (index, decl) in indices.iter_mut().zip(&declared) {
                        index.range = decl.range;
                    }
                    Ok(())
                },
                |args, indices, source| Token::User {
                    name: occ.name.clone(),
                    args,
                    indices,
                    source,
                    silenced: Cell::new(false),
                },
                behavior,
            );
        }

        if let Some(id) = self.group.lookup_directive(&occ.name) {
            let rule = self.group.rule(id);
            let (expected_indices, expected_args) = (rule.indices, rule.args);
            return self.compile_with_lists(
                occ,
                rest,
                expected_indices,
                expected_args,
                |_| Ok(()),
                |args, indices, source| Token::Directive {
                    rule: id,
                    name: occ.name.clone(),
                    args,
                    indices,
                    source,
                    silenced: Cell::new(false),
                },
                UnrollBehavior::Prevent,
            );
        }

        if let Some(id) = self.group.lookup_pre(&occ.name) {
            let rule = self.group.rule(id);
            let expected_args = rule.args;
            return self.compile_with_lists(
                occ,
                rest,
                Some(0),
                expected_args,
                |_| Ok(()),
                |args, _indices, source| Token::Simple {
                    rule: id,
                    name: occ.name.clone(),
                    args,
                    source,
                    silenced: Cell::new(false),
                },
                UnrollBehavior::Allow,
            );
        }

        // Post names stay literal: the post table runs over assembled lines.
        if self.group.lookup_post(&occ.name).is_some() {
            self.buffer.push_str(&self.text[occ.start..occ.after_name]);
            return occ.after_name;
        }

        let error = TranslatorError::UnknownMacroName(occ.name.clone());
        self.sink
            .error(self.context, error.code(), error.to_string());
        self.buffer.push_str(&self.text[occ.start..occ.after_name]);
        occ.after_name
    }

    /// Shared call-site compilation: parse `[...]` then `{...}`, validate,
    /// and build the token. On a recoverable parse error the token is
    /// compiled silenced with just the prefix span as its source.
    #[allow(clippy::too_many_arguments)]
    fn compile_with_lists(
        &mut self,
        occ: &Occurrence,
        rest: &str,
        expected_indices: Option<usize>,
        expected_args: Option<usize>,
        fix_ranges: impl FnOnce(&mut Vec<AbstractIndex>) -> Result<(), TranslatorError>,
        build: impl FnOnce(Vec<String>, Vec<AbstractIndex>, String) -> Token,
        behavior: UnrollBehavior,
    ) -> usize {
        let parsed = parse_indices(rest, &occ.name, expected_indices)
            .and_then(|(idx_consumed, mut indices)| {
                fix_ranges(&mut indices)?;
                check_occurrence(&indices)?;
                let (arg_consumed, args) =
                    parse_args(&rest[idx_consumed..], &occ.name, expected_args)?;
                Ok((idx_consumed + arg_consumed, indices, args))
            });

        match parsed {
            Ok((consumed, indices, args)) => {
                let end = occ.after_name + consumed;
                let source = self.text[occ.start..end].to_string();
                self.flush_text();
                self.tokens.push(build(args, indices, source));
                self.status = self.status.merge(behavior);
                end
            }
            Err(error) => {
                self.sink
                    .error(self.context, error.code(), error.to_string());
                let source = self.text[occ.start..occ.after_name].to_string();
                self.flush_text();
                let token = build(Vec::new(), Vec::new(), source);
                token_silence(&token);
                self.tokens.push(token);
                occ.after_name
            }
        }
    }
}

fn token_silence(token: &Token) {
    match token {
        Token::Simple { silenced, .. }
        | Token::Index { silenced, .. }
        | Token::Directive { silenced, .. }
        | Token::User { silenced, .. } => silenced.set(true),
        _ => {}
    }
}

/// Find the next `<X>` literal: `<`, one alphanumeric ASCII char, `>`.
fn find_index_literal(text: &str, from: usize) -> Option<(usize, char)> {
    let bytes = text.as_bytes();
    let mut pos = from;
    while pos + 2 < bytes.len() {
        if bytes[pos] == b'<' && bytes[pos + 1].is_ascii_alphanumeric() && bytes[pos + 2] == b'>' {
            return Some((pos, bytes[pos + 1] as char));
        }
        pos += 1;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_scanner() {
        assert_eq!(find_index_literal("f<A> + g<b>", 0), Some((1, 'A')));
        assert_eq!(find_index_literal("f<A> + g<b>", 2), Some((8, 'b')));
        assert_eq!(find_index_literal("a < b", 0), None);
        assert_eq!(find_index_literal("vector<double>", 0), None);
    }
}
