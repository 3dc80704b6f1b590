//! Macro agent
//!
//! The orchestrator that expands one template line at a time:
//!
//! 1. apply pre-macros to a fixpoint (pure text substitution),
//! 2. split at the first `=`, tokenize both sides,
//! 3. enumerate LHS assignments; resolve RHS-only indices through their
//!    owning macros' unroll policies,
//! 4. apply post-macros to the assembled lines,
//! 5. prepend any CSE temporaries deferred while printing.
//!
//! Processing is best-effort: recoverable problems are reported through
//! the sink and the line (or just the offending token) is skipped, so one
//! pass over a template surfaces every diagnostic. Only structural
//! failures abort via `Err`.

use crate::assignment::{enumerate, enumerate_checked, IndexAssignment};
use crate::config::{ModelConfig, TranslatorConfig};
use crate::diagnostics::{ErrorContext, ErrorSink};
use crate::error::TranslatorError;
use crate::expr::TensorFactory;
use crate::index::{merge_declarations, AbstractIndex};
use crate::package::PackageGroup;
use crate::parse::{next_occurrence, parse_args, parse_indices, split_statement};
use crate::rules::{
    eval_directive, eval_simple, Aggregation, DirectiveOp, EvalContext, RuleOp, TranslationUnit,
    UnrollBehavior,
};
use crate::token::{Token, TokenList};
use crate::tokenizer::tokenize;

/// Result of expanding one input line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LineExpansion {
    pub lines: Vec<String>,
    pub replacements: usize,
}

/// Per-template orchestrator. One agent instance processes one template,
/// single-threaded; instances are never shared.
pub struct MacroAgent<'a> {
    model: &'a ModelConfig,
    config: &'a TranslatorConfig,
    group: PackageGroup,
    unit: TranslationUnit,
    factory: &'a dyn TensorFactory,
}

impl<'a> MacroAgent<'a> {
    pub fn new(
        model: &'a ModelConfig,
        config: &'a TranslatorConfig,
        group: PackageGroup,
        factory: &'a dyn TensorFactory,
    ) -> Self {
        Self {
            model,
            config,
            group,
            unit: TranslationUnit::new(),
            factory,
        }
    }

    pub fn group(&self) -> &PackageGroup {
        &self.group
    }

    pub fn unit(&self) -> &TranslationUnit {
        &self.unit
    }

    /// Mutable unit access, for drivers that preload resources or macros.
    pub fn unit_mut(&mut self) -> &mut TranslationUnit {
        &mut self.unit
    }

    /// Expand one line. Returns every output line plus the total macro
    /// replacement count.
    pub fn apply(
        &mut self,
        line: &str,
        context: &ErrorContext,
        sink: &mut dyn ErrorSink,
    ) -> Result<LineExpansion, TranslatorError> {
        tracing::trace!(line, "expanding");

        if !self.unit.emission.enabled() {
            return Ok(self.apply_suppressed(line, context, sink));
        }

        let mut ectx = EvalContext {
            model: self.model,
            config: self.config,
            group: &self.group,
            unit: &mut self.unit,
            factory: self.factory,
            sink,
            context: context.clone(),
            replacements: 0,
        };

        let text = pre_scan(line, self.config.max_pre_passes, &mut ectx);

        let mut lines = if is_directive_line(&text, ectx.group) {
            apply_directives(&text, &mut ectx)?
        } else {
            apply_statement(&text, &mut ectx)?
        };

        let replacements = ectx.replacements;
        let temporaries = self.flush_temporaries();
        if !temporaries.is_empty() {
            let mut with_pool = temporaries;
            with_pool.append(&mut lines);
            lines = with_pool;
        }

        Ok(LineExpansion {
            lines,
            replacements,
        })
    }

    /// Finish the template: verify directive balance, flush the temporary
    /// tail, and emit cache statistics.
    pub fn finalize(&mut self, context: &ErrorContext, sink: &mut dyn ErrorSink) -> Vec<String> {
        crate::rules::check_balanced(&self.unit, context, sink);
        let tail = self.flush_temporaries();
        self.group.cse().log_stats();
        tail
    }

    fn flush_temporaries(&mut self) -> Vec<String> {
        let temporaries = self.group.cse_mut().drain();
        if temporaries.is_empty() {
            return Vec::new();
        }
        let working_type = self
            .unit
            .resources
            .find(crate::resources::ResourceKind::WorkingType, &[], true)
            .unwrap_or(&self.model.working_type)
            .to_string();
        temporaries
            .into_iter()
            .map(|t| self.unit.pool.format(&t.name, &t.body, &working_type))
            .collect()
    }

    /// Inside a suppressed `IF` branch only the conditional directives are
    /// interpreted; everything else on the line is ignored.
    fn apply_suppressed(
        &mut self,
        line: &str,
        context: &ErrorContext,
        sink: &mut dyn ErrorSink,
    ) -> LineExpansion {
        let mut ectx = EvalContext {
            model: self.model,
            config: self.config,
            group: &self.group,
            unit: &mut self.unit,
            factory: self.factory,
            sink,
            context: context.clone(),
            replacements: 0,
        };

        let mut pos = 0;
        while let Some(occ) = next_occurrence(line, pos) {
            pos = occ.after_name;
            let group = ectx.group;
            let Some(id) = group.lookup_directive(&occ.name) else {
                continue;
            };
            let rule = group.rule(id);
            let op = match &rule.op {
                RuleOp::Directive(op @ (DirectiveOp::If | DirectiveOp::Else | DirectiveOp::Endif)) => {
                    op.clone()
                }
                _ => continue,
            };
            let args = match parse_args(&line[occ.after_name..], &occ.name, rule.args) {
                Ok((consumed, args)) => {
                    pos = occ.after_name + consumed;
                    args
                }
                Err(error) => {
                    ectx.report(&error);
                    continue;
                }
            };
            match eval_directive(&op, &args, &[], &mut ectx) {
                Ok(_) => ectx.replacements += 1,
                Err(error) => ectx.report(&error),
            }
        }

        LineExpansion {
            lines: Vec::new(),
            replacements: ectx.replacements,
        }
    }
}

// =============================================================================
// PRE / POST SCANS
// =============================================================================

/// Substitute pre-macros left to right until no recognized occurrence
/// remains. Malformed call sites are skipped silently here; the tokenizer
/// reports them once.
fn pre_scan(line: &str, max_passes: usize, ectx: &mut EvalContext) -> String {
    let mut text = line.to_string();
    let mut passes = 0;
    let mut last_substituted = String::new();

    loop {
        let mut changed = false;
        let mut pos = 0;

        while let Some(occ) = next_occurrence(&text, pos) {
            let group = ectx.group;
            let Some(id) = group.lookup_pre(&occ.name) else {
                pos = occ.after_name;
                continue;
            };
            let rule = group.rule(id);
            let op = match &rule.op {
                RuleOp::Simple(op) => op.clone(),
                _ => {
                    pos = occ.after_name;
                    continue;
                }
            };

            let parsed = parse_indices(&text[occ.after_name..], &occ.name, Some(0)).and_then(
                |(idx_consumed, _)| {
                    parse_args(&text[occ.after_name + idx_consumed..], &occ.name, rule.args)
                        .map(|(arg_consumed, args)| (idx_consumed + arg_consumed, args))
                },
            );
            let (consumed, args) = match parsed {
                Ok(result) => result,
                Err(_) => {
                    pos = occ.after_name;
                    continue;
                }
            };

            match eval_simple(&op, &args, ectx) {
                Ok(replacement) => {
                    text.replace_range(occ.start..occ.after_name + consumed, &replacement);
                    ectx.replacements += 1;
                    changed = true;
                    last_substituted = occ.name.clone();
                    pos = occ.start + replacement.len();
                }
                Err(error) if error.is_recoverable() => {
                    ectx.report(&error);
                    pos = occ.after_name;
                }
                Err(_) => {
                    pos = occ.after_name;
                }
            }
        }

        if !changed {
            break;
        }
        passes += 1;
        if passes >= max_passes {
            let error = TranslatorError::PreMacroDivergence {
                name: last_substituted.clone(),
                passes,
            };
            ectx.report(&error);
            break;
        }
    }

    text
}

/// Substitute post-macros over one assembled output line.
fn post_scan(line: &str, ectx: &mut EvalContext) -> String {
    let mut text = line.to_string();
    let mut pos = 0;

    while let Some(occ) = next_occurrence(&text, pos) {
        let group = ectx.group;
        let Some(id) = group.lookup_post(&occ.name) else {
            pos = occ.after_name;
            continue;
        };
        let rule = group.rule(id);
        let op = match &rule.op {
            RuleOp::Simple(op) => op.clone(),
            _ => {
                pos = occ.after_name;
                continue;
            }
        };

        let parsed = parse_args(&text[occ.after_name..], &occ.name, rule.args);
        let (consumed, args) = match parsed {
            Ok(result) => result,
            Err(error) => {
                ectx.report(&error);
                pos = occ.after_name;
                continue;
            }
        };

        match eval_simple(&op, &args, ectx) {
            Ok(replacement) => {
                text.replace_range(occ.start..occ.after_name + consumed, &replacement);
                ectx.replacements += 1;
                pos = occ.start + replacement.len();
            }
            Err(error) if error.is_recoverable() => {
                ectx.report(&error);
                pos = occ.after_name;
            }
            Err(_) => {
                pos = occ.after_name;
            }
        }
    }

    text
}

// =============================================================================
// DIRECTIVE LINES
// =============================================================================

fn is_directive_line(text: &str, group: &PackageGroup) -> bool {
    let mut pos = 0;
    while let Some(occ) = next_occurrence(text, pos) {
        if group.lookup_directive(&occ.name).is_some() {
            return true;
        }
        pos = occ.after_name;
    }
    false
}

/// A directive line produces no statement text: each directive runs for
/// its side effect and contributes at most an audit comment.
fn apply_directives(
    text: &str,
    ectx: &mut EvalContext,
) -> Result<Vec<String>, TranslatorError> {
    let list = {
        let group = ectx.group;
        let (user_macros, context, sink) =
            (&ectx.unit.user_macros, &ectx.context, &mut *ectx.sink);
        tokenize(text, group, user_macros, context, sink)
    };

    if list.has_index_macros() {
        let error = TranslatorError::DirectiveMisuse(
            "directives cannot be mixed with macros on one line".to_string(),
        );
        ectx.report(&error);
    }

    let empty = IndexAssignment::new();
    let mut lines = Vec::new();
    for token in list.tokens() {
        if let Token::Directive { .. } = token {
            let single = TokenList::new(vec![token.clone()], Default::default(), String::new());
            let output = single.evaluate(&empty, &[], None, None, ectx)?;
            if !output.trim().is_empty() {
                lines.push(output);
            }
        }
    }
    Ok(lines)
}

// =============================================================================
// STATEMENT LINES
// =============================================================================

/// Resolved treatment of one RHS-only index.
#[derive(Debug)]
enum IndexTreatment {
    Unroll(AbstractIndex),
    Roll(AbstractIndex),
}

fn apply_statement(
    text: &str,
    ectx: &mut EvalContext,
) -> Result<Vec<String>, TranslatorError> {
    let (lhs_text, rhs_text) = split_statement(text);

    let lhs_list = lhs_text.map(|side| tokenize_side(side, ectx));
    let rhs_list = tokenize_side(rhs_text, ectx);

    // Statement scope: every declaration on either side, merged.
    let mut declarations = Vec::new();
    if let Some(list) = &lhs_list {
        declarations.extend(list.declarations());
    }
    declarations.extend(rhs_list.declarations());
    let scope = match merge_declarations(&declarations) {
        Ok(scope) => scope,
        Err(error) => {
            ectx.report(&error);
            return Ok(Vec::new());
        }
    };

    // LHS indices are always enumerated, once per output line.
    let lhs_labels: Vec<char> = lhs_list
        .as_ref()
        .map(|list| list.labels())
        .unwrap_or_default();
    let lhs_indices: Vec<AbstractIndex> = scope
        .iter()
        .filter(|index| lhs_labels.contains(&index.label))
        .copied()
        .collect();

    // RHS-only indices follow their owning macros' unroll policies.
    let rhs_only: Vec<AbstractIndex> = scope
        .iter()
        .filter(|index| !lhs_labels.contains(&index.label))
        .copied()
        .collect();

    let mut unrolled = Vec::new();
    let mut rolled = Vec::new();
    let mut sum_join = false;

    for index in &rhs_only {
        match resolve_treatment(*index, &rhs_list, ectx, &mut sum_join) {
            Ok(IndexTreatment::Unroll(index)) => unrolled.push(index),
            Ok(IndexTreatment::Roll(index)) => rolled.push(index),
            Err(error) => {
                ectx.report(&error);
                return Ok(Vec::new());
            }
        }
    }

    let lhs_assignments = match enumerate_checked(&lhs_indices, ectx.model) {
        Ok(iter) => iter,
        Err(error) => {
            ectx.report(&error);
            return Ok(Vec::new());
        }
    };
    if let Err(error) = enumerate_checked(&unrolled, ectx.model) {
        ectx.report(&error);
        return Ok(Vec::new());
    }
    if !rolled.is_empty() {
        tracing::debug!(rolled = rolled.len(), unrolled = unrolled.len(), "roll-up active");
    }

    rhs_list.pre_hook(ectx);

    let mut lines = Vec::new();
    for lhs_assignment in lhs_assignments {
        let prefix = match &lhs_list {
            Some(list) => Some(list.evaluate(&lhs_assignment, &scope, None, None, ectx)?),
            None => None,
        };

        // The rolled macros are re-evaluated per outer assignment, closing
        // over its concrete values.
        let mut fragments = Vec::new();
        for rhs_assignment in enumerate(&unrolled, ectx.model) {
            let full = lhs_assignment.merged(&rhs_assignment);
            fragments.push(rhs_list.evaluate(&full, &scope, None, None, ectx)?);
        }

        if sum_join && fragments.len() > 1 {
            let joined = ectx
                .group
                .printer()
                .print_operands(&fragments, ectx.group.printer().add_op());
            fragments = vec![joined];
        }

        for fragment in fragments {
            let assembled = match &prefix {
                Some(lhs) => format!("{}={}", lhs, fragment),
                None => fragment,
            };
            lines.push(post_scan(&assembled, ectx));
        }
    }

    rhs_list.post_hook(ectx);

    Ok(lines)
}

fn tokenize_side(side: &str, ectx: &mut EvalContext) -> TokenList {
    let group = ectx.group;
    let (user_macros, context, sink) = (&ectx.unit.user_macros, &ectx.context, &mut *ectx.sink);
    tokenize(side, group, user_macros, context, sink)
}

/// Decide roll vs unroll for one RHS-only index from the policies of the
/// macros that own it.
fn resolve_treatment(
    index: AbstractIndex,
    rhs_list: &TokenList,
    ectx: &mut EvalContext,
    sum_join: &mut bool,
) -> Result<IndexTreatment, TranslatorError> {
    let policies = rhs_list.policies(index.label, ectx);

    let has_force = policies.iter().any(|(b, _)| *b == UnrollBehavior::Force);
    let has_prevent = policies.iter().any(|(b, _)| *b == UnrollBehavior::Prevent);

    if has_force && has_prevent {
        return Err(TranslatorError::UnsatisfiableUnroll {
            label: index.label,
            detail: "one macro forces an unroll another prevents".to_string(),
        });
    }

    if has_prevent {
        // Roll-up is mandatory: the flattening resource must exist (a
        // parameter index flattens trivially).
        ectx.flattener_for(index.range, index.label)?;
        return Ok(IndexTreatment::Roll(index));
    }

    let unroll = has_force || !ectx.can_roll(index.range);
    if unroll {
        if policies
            .iter()
            .any(|(b, a)| *b != UnrollBehavior::Prevent && *a == Aggregation::Sum)
        {
            *sum_join = true;
        }
        Ok(IndexTreatment::Unroll(index))
    } else {
        Ok(IndexTreatment::Roll(index))
    }
}
