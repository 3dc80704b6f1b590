//! Call-site parsing
//!
//! Recognizes macro occurrences in template text and parses the two list
//! forms that follow a macro name: the abstract index list `[XY...]`
//! (single-character labels, immediately after the name) and the argument
//! list `{a, b, ...}` (comma-separated, whitespace-insensitive, nesting
//! aware so bodies containing `f(x,y)` survive).
//!
//! ## Syntax
//!
//! ```text
//! $$__NAME[AB]{arg1, arg2}
//! ```
//!
//! Only the first textual `=` on a line is significant as the LHS/RHS split
//! marker.

use nom::{
    bytes::complete::{tag, take_while, take_while1},
    character::complete::char,
    sequence::delimited,
    IResult,
};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::TranslatorError;
use crate::index::{AbstractIndex, IndexRange};

/// Invocation prefix for macros and directives.
pub const MACRO_PREFIX: &str = "$$__";

static OCCURRENCE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\$__([A-Z][A-Z0-9_]*)").expect("occurrence pattern"));

/// One recognized `$$__NAME` occurrence within a line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Occurrence {
    pub name: String,
    /// Byte offset of the `$$__` prefix.
    pub start: usize,
    /// Byte offset just past the name.
    pub after_name: usize,
}

/// Find the first occurrence at or after `from`.
pub fn next_occurrence(text: &str, from: usize) -> Option<Occurrence> {
    OCCURRENCE.captures_at(text, from).map(|caps| {
        let whole = caps.get(0).expect("whole match");
        Occurrence {
            name: caps.get(1).expect("name group").as_str().to_string(),
            start: whole.start(),
            after_name: whole.end(),
        }
    })
}

fn identifier(input: &str) -> IResult<&str, &str> {
    take_while1(|c: char| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')(input)
}

/// Parse `$$__NAME` at the start of `input` (used when re-parsing token
/// source spans).
pub fn parse_invocation(input: &str) -> IResult<&str, &str> {
    let (input, _) = tag(MACRO_PREFIX)(input)?;
    identifier(input)
}

// =============================================================================
// INDEX LISTS
// =============================================================================

/// Parse the `[XY...]` index list at the start of `text`.
///
/// Returns the bytes consumed and the parsed indices, ranges inferred from
/// label case (the owning rule may override them afterwards). `expected` of
/// `None` accepts any count, including an absent list.
pub fn parse_indices(
    text: &str,
    name: &str,
    expected: Option<usize>,
) -> Result<(usize, Vec<AbstractIndex>), TranslatorError> {
    if !text.starts_with('[') {
        return match expected {
            None | Some(0) => Ok((0, Vec::new())),
            Some(count) => Err(TranslatorError::IndexCount {
                name: name.to_string(),
                expected: count,
                found: 0,
            }),
        };
    }

    let mut list = delimited(
        char('['),
        take_while(|c: char| c != ']' && c != '\n'),
        char(']'),
    );
    let (rest, body): (&str, &str) =
        list(text).map_err(|_: nom::Err<nom::error::Error<&str>>| TranslatorError::LexicalArity {
            name: name.to_string(),
            detail: "unterminated index list".to_string(),
        })?;
    let consumed = text.len() - rest.len();

    let mut indices = Vec::new();
    for label in body.chars() {
        if !label.is_ascii_alphanumeric() {
            return Err(TranslatorError::LexicalArity {
                name: name.to_string(),
                detail: format!("invalid index label '{}'", label),
            });
        }
        indices.push(AbstractIndex::inferred(label));
    }

    if let Some(count) = expected {
        if indices.len() != count {
            return Err(TranslatorError::IndexCount {
                name: name.to_string(),
                expected: count,
                found: indices.len(),
            });
        }
    }

    Ok((consumed, indices))
}

/// Apply a rule's declared range to parsed indices, overriding the label
/// default.
pub fn apply_declared_range(indices: &mut [AbstractIndex], declared: Option<IndexRange>) {
    if let Some(range) = declared {
        for index in indices.iter_mut() {
            index.range = range;
        }
    }
}

// =============================================================================
// ARGUMENT LISTS
// =============================================================================

/// Parse the `{a, b, ...}` argument list at the start of `text`.
///
/// Arguments are comma-separated at bracket depth zero, so nested calls and
/// braced bodies pass through intact. Each argument is whitespace-trimmed.
/// `expected` of `None` accepts any count. A macro expecting zero arguments
/// consumes nothing, so literal braces after it stay text.
pub fn parse_args(
    text: &str,
    name: &str,
    expected: Option<usize>,
) -> Result<(usize, Vec<String>), TranslatorError> {
    if expected == Some(0) {
        return Ok((0, Vec::new()));
    }

    if !text.starts_with('{') {
        return match expected {
            None => Ok((0, Vec::new())),
            Some(count) => Err(TranslatorError::LexicalArity {
                name: name.to_string(),
                detail: format!("expected {} arguments, found no argument list", count),
            }),
        };
    }

    let mut args = Vec::new();
    let mut current = String::new();
    let mut depth = 0usize;
    let mut consumed = None;

    for (pos, ch) in text.char_indices() {
        match ch {
            '{' | '[' | '(' => {
                if depth > 0 {
                    current.push(ch);
                }
                depth += 1;
            }
            '}' | ']' | ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 && ch == '}' {
                    consumed = Some(pos + ch.len_utf8());
                    break;
                }
                current.push(ch);
            }
            ',' if depth == 1 => {
                args.push(current.trim().to_string());
                current.clear();
            }
            _ => current.push(ch),
        }
    }

    let consumed = consumed.ok_or_else(|| TranslatorError::LexicalArity {
        name: name.to_string(),
        detail: "unterminated argument list".to_string(),
    })?;

    if !current.trim().is_empty() || !args.is_empty() {
        args.push(current.trim().to_string());
    }

    if let Some(count) = expected {
        if args.len() != count {
            return Err(TranslatorError::LexicalArity {
                name: name.to_string(),
                detail: format!("expected {} arguments, found {}", count, args.len()),
            });
        }
    }

    Ok((consumed, args))
}

// =============================================================================
// STATEMENT SPLITTING
// =============================================================================

/// Split a statement at the first textual `=`.
///
/// Returns `(Some(lhs), rhs)` when a marker exists, `(None, line)` for a
/// pure-RHS statement.
pub fn split_statement(line: &str) -> (Option<&str>, &str) {
    match line.find('=') {
        Some(pos) => (Some(&line[..pos]), &line[pos + 1..]),
        None => (None, line),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn occurrence_scanning() {
        let occ = next_occurrence("x = $$__FOO; y = $$__BAR{1}", 0).unwrap();
        assert_eq!(occ.name, "FOO");
        assert_eq!(occ.start, 4);

        let occ = next_occurrence("x = $$__FOO; y = $$__BAR{1}", occ.after_name).unwrap();
        assert_eq!(occ.name, "BAR");

        assert_eq!(next_occurrence("no macros here", 0), None);
    }

    #[test]
    fn index_list_parsing() {
        let (consumed, indices) = parse_indices("[aB]{x}", "M", Some(2)).unwrap();
        assert_eq!(consumed, 4);
        assert_eq!(indices[0].label, 'a');
        assert_eq!(indices[0].range, IndexRange::FieldOnly);
        assert_eq!(indices[1].label, 'B');
        assert_eq!(indices[1].range, IndexRange::FieldPlusMomentum);
    }

    #[test]
    fn index_count_mismatch() {
        assert!(matches!(
            parse_indices("[a]", "M", Some(2)),
            Err(TranslatorError::IndexCount {
                expected: 2,
                found: 1,
                ..
            })
        ));
        assert!(matches!(
            parse_indices("rest of line", "M", Some(1)),
            Err(TranslatorError::IndexCount { found: 0, .. })
        ));
    }

    #[test]
    fn args_split_on_top_level_commas_only() {
        let (consumed, args) = parse_args("{a, f(x,y), {b,c}}tail", "M", None).unwrap();
        assert_eq!(consumed, 18);
        assert_eq!(args, vec!["a", "f(x,y)", "{b,c}"]);
    }

    #[test]
    fn args_trim_whitespace() {
        let (_, args) = parse_args("{  first ,second  }", "M", Some(2)).unwrap();
        assert_eq!(args, vec!["first", "second"]);
    }

    #[test]
    fn unterminated_args_is_lexical_arity() {
        assert!(matches!(
            parse_args("{1,2", "FOO", Some(2)),
            Err(TranslatorError::LexicalArity { .. })
        ));
    }

    #[test]
    fn zero_arity_consumes_nothing() {
        let (consumed, args) = parse_args("{not,args}", "FOO", Some(0)).unwrap();
        assert_eq!(consumed, 0);
        assert!(args.is_empty());
    }

    #[test]
    fn split_at_first_equals_only() {
        let (lhs, rhs) = split_statement("u2[i] = a == b;");
        assert_eq!(lhs, Some("u2[i] "));
        assert_eq!(rhs, " a == b;");

        let (lhs, rhs) = split_statement("$$__M[A]");
        assert_eq!(lhs, None);
        assert_eq!(rhs, "$$__M[A]");
    }

    #[test]
    fn invocation_parser() {
        let (rest, name) = parse_invocation("$$__DDV[ab]{}").unwrap();
        assert_eq!(name, "DDV");
        assert_eq!(rest, "[ab]{}");
    }
}
