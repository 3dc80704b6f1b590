//! Replacement rules and evaluation
//!
//! A macro name resolves to exactly one [`ReplacementRule`]: a flat record
//! of its call-site shape (argument and index arity, declared range), its
//! unroll policy, and a data-oriented operation tag. All behavior is
//! dispatched from the central matches in this module: there are no
//! rule-class hierarchies, and a registry lookup decides which arm runs.
//!
//! Evaluation threads an [`EvalContext`] through every call: the immutable
//! configuration and rule registry, the mutable per-unit state, the tensor
//! factory, and the diagnostic sink. Recoverable errors are reported
//! through the sink exactly once per offending token (the token is then
//! silenced); only structural [`TranslatorError::Internal`] failures
//! propagate as `Err`.

use crate::assignment::IndexAssignment;
use crate::config::{ModelConfig, TranslatorConfig};
use crate::diagnostics::{DiagnosticCode, ErrorContext, ErrorSink, Severity};
use crate::directives::{
    body_arity, EmissionStack, IndexRemapRule, TempPool, UserMacro, UserMacroTable,
};
use crate::error::TranslatorError;
use crate::expr::{TensorFactory, TensorKind};
use crate::index::{AbstractIndex, IndexRange};
use crate::package::PackageGroup;
use crate::resources::{ResourceKind, ResourceManager};
use crate::tokenizer;

use std::rc::Rc;

// =============================================================================
// RULE MODEL
// =============================================================================

/// Handle into the package group's rule table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RuleId(pub usize);

/// Per-rule unroll policy for RHS-only indices.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UnrollBehavior {
    /// Roll up when the flattening resource allows it, else unroll.
    Allow,
    /// Must unroll; every assignment produces a term.
    Force,
    /// Must roll up; directives always report this.
    Prevent,
}

/// Unroll status of a whole token list: the most restrictive policy of its
/// constituent tokens, or a conflict when both extremes appear.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum UnrollStatus {
    #[default]
    Allow,
    Force,
    Prevent,
    Conflict,
}

impl UnrollStatus {
    pub fn merge(self, behavior: UnrollBehavior) -> UnrollStatus {
        match (self, behavior) {
            (UnrollStatus::Conflict, _) => UnrollStatus::Conflict,
            (UnrollStatus::Allow, UnrollBehavior::Allow) => UnrollStatus::Allow,
            (_, UnrollBehavior::Allow) => self,
            (UnrollStatus::Allow, UnrollBehavior::Force) => UnrollStatus::Force,
            (UnrollStatus::Allow, UnrollBehavior::Prevent) => UnrollStatus::Prevent,
            (UnrollStatus::Force, UnrollBehavior::Force) => UnrollStatus::Force,
            (UnrollStatus::Prevent, UnrollBehavior::Prevent) => UnrollStatus::Prevent,
            (UnrollStatus::Force, UnrollBehavior::Prevent)
            | (UnrollStatus::Prevent, UnrollBehavior::Force) => UnrollStatus::Conflict,
        }
    }

    /// Policy this status imposes on an undecided index.
    pub fn behavior(self) -> UnrollBehavior {
        match self {
            UnrollStatus::Allow => UnrollBehavior::Allow,
            UnrollStatus::Force => UnrollBehavior::Force,
            UnrollStatus::Prevent | UnrollStatus::Conflict => UnrollBehavior::Prevent,
        }
    }
}

/// How unrolled terms of one statement are combined.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Aggregation {
    /// Each assignment becomes its own output statement.
    Repeat,
    /// Assignments are "+"-joined into a single statement.
    Sum,
}

/// Operations of text-substitution (pre/post) macros.
#[derive(Clone, Debug)]
pub enum SimpleOp {
    /// Model name from configuration.
    ModelName,
    /// Number of fields.
    NumberFields,
    /// Number of parameters.
    NumberParams,
    /// Current working type (resource cache, falling back to config).
    WorkingType,
    /// Fixed template text, `$N` substituted from the argument list.
    Literal { template: String },
    /// First argument rendered through the printer's comment syntax.
    Comment,
}

/// Operations of index-carrying macros.
#[derive(Clone, Copy, Debug)]
pub enum IndexedOp {
    /// A tensor provided by the factory and/or a resource label.
    Tensor(TensorKind),
    /// Direct reference into the parameters array.
    Parameter,
}

/// Operations of directives.
#[derive(Clone, Debug)]
pub enum DirectiveOp {
    Set,
    If,
    Else,
    Endif,
    TempPool,
    ResourceAssign(ResourceKind),
    Release,
    ReleaseFlatteners,
}

/// One arm of the collapsed rule variant.
#[derive(Clone, Debug)]
pub enum RuleOp {
    Simple(SimpleOp),
    Indexed(IndexedOp),
    Directive(DirectiveOp),
}

/// A single registered macro or directive.
#[derive(Clone, Debug)]
pub struct ReplacementRule {
    pub name: String,
    /// Expected argument count; `None` accepts any.
    pub args: Option<usize>,
    /// Expected index count; `None` accepts any (the `SET` directive).
    pub indices: Option<usize>,
    /// Declared range overriding the label-case default for every slot.
    pub range: Option<IndexRange>,
    pub unroll: UnrollBehavior,
    pub aggregation: Aggregation,
    pub op: RuleOp,
}

impl ReplacementRule {
    /// Text-substitution macro for the pre (or post) table.
    pub fn simple(name: &str, args: usize, op: SimpleOp) -> Self {
        Self {
            name: name.to_string(),
            args: Some(args),
            indices: Some(0),
            range: None,
            unroll: UnrollBehavior::Allow,
            aggregation: Aggregation::Repeat,
            op: RuleOp::Simple(op),
        }
    }

    /// Index macro.
    pub fn indexed(
        name: &str,
        args: usize,
        indices: usize,
        range: IndexRange,
        unroll: UnrollBehavior,
        aggregation: Aggregation,
        op: IndexedOp,
    ) -> Self {
        Self {
            name: name.to_string(),
            args: Some(args),
            indices: Some(indices),
            range: Some(range),
            unroll,
            aggregation,
            op: RuleOp::Indexed(op),
        }
    }

    /// Directive. Always `Prevent`, so directives only ever see abstract
    /// indices.
    pub fn directive(name: &str, args: Option<usize>, indices: Option<usize>, op: DirectiveOp) -> Self {
        Self {
            name: name.to_string(),
            args,
            indices,
            range: None,
            unroll: UnrollBehavior::Prevent,
            aggregation: Aggregation::Repeat,
            op: RuleOp::Directive(op),
        }
    }

    pub fn get_unroll(&self) -> UnrollBehavior {
        self.unroll
    }
}

// =============================================================================
// EVALUATION CONTEXT
// =============================================================================

/// Mutable state scoped to one translation unit.
#[derive(Debug, Default)]
pub struct TranslationUnit {
    pub resources: ResourceManager,
    pub user_macros: UserMacroTable,
    pub emission: EmissionStack,
    pub pool: TempPool,
}

impl TranslationUnit {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Everything a rule evaluation can reach.
pub struct EvalContext<'a> {
    pub model: &'a ModelConfig,
    pub config: &'a TranslatorConfig,
    pub group: &'a PackageGroup,
    pub unit: &'a mut TranslationUnit,
    pub factory: &'a dyn TensorFactory,
    pub sink: &'a mut dyn ErrorSink,
    pub context: ErrorContext,
    /// Running macro-expansion count for the current line.
    pub replacements: usize,
}

impl<'a> EvalContext<'a> {
    /// Report a recoverable error at the current context. `ResourceNotSet`
    /// is a warning unless `dev_warn` promotes it.
    pub fn report(&mut self, error: &TranslatorError) {
        let severity = match error {
            TranslatorError::ResourceNotSet(_) if !self.config.dev_warn => Severity::Warning,
            _ => Severity::Error,
        };
        let code = error.code();
        match severity {
            Severity::Error => self.sink.error(&self.context, code, error.to_string()),
            _ => self.sink.warn(&self.context, code, error.to_string()),
        }
    }

    /// Current working type: the resource cache entry if assigned, else the
    /// model default.
    pub fn working_type(&self) -> String {
        self.unit
            .resources
            .find(ResourceKind::WorkingType, &[], true)
            .unwrap_or(&self.model.working_type)
            .to_string()
    }

    /// Label for a simple resource, reporting and falling back to a
    /// conventional default when unset.
    pub fn resource_or_default(&mut self, kind: ResourceKind, default: &str) -> String {
        match self.unit.resources.find(kind, &[], true) {
            Some(label) => label.to_string(),
            None => {
                self.report(&TranslatorError::ResourceNotSet(kind.name().to_string()));
                default.to_string()
            }
        }
    }

    /// Flattening function for a range class, required for a roll-up.
    pub fn flattener_for(
        &self,
        range: IndexRange,
        label: char,
    ) -> Result<Option<String>, TranslatorError> {
        let kind = match range {
            IndexRange::FieldOnly => ResourceKind::FieldFlatten,
            IndexRange::FieldPlusMomentum => ResourceKind::PhaseFlatten,
            // Parameter indices are their own offsets.
            IndexRange::Parameter => return Ok(None),
        };
        match self.unit.resources.find(kind, &[], true) {
            Some(name) => Ok(Some(name.to_string())),
            None => Err(TranslatorError::UnsatisfiableUnroll {
                label,
                detail: format!("roll-up requires the {} resource", kind.name()),
            }),
        }
    }

    /// Whether a roll-up of `range` is currently possible.
    pub fn can_roll(&self, range: IndexRange) -> bool {
        match range {
            IndexRange::FieldOnly => self.unit.resources.is_set(ResourceKind::FieldFlatten),
            IndexRange::FieldPlusMomentum => self.unit.resources.is_set(ResourceKind::PhaseFlatten),
            IndexRange::Parameter => false,
        }
    }
}

// =============================================================================
// SIMPLE MACROS
// =============================================================================

pub fn eval_simple(
    op: &SimpleOp,
    args: &[String],
    ectx: &mut EvalContext,
) -> Result<String, TranslatorError> {
    match op {
        SimpleOp::ModelName => Ok(ectx.model.name.clone()),
        SimpleOp::NumberFields => Ok(ectx.model.num_fields.to_string()),
        SimpleOp::NumberParams => Ok(ectx.model.num_params.to_string()),
        SimpleOp::WorkingType => Ok(ectx.working_type()),
        SimpleOp::Literal { template } => {
            Ok(crate::directives::substitute_positional(template, args))
        }
        SimpleOp::Comment => {
            let text = args.first().map(String::as_str).unwrap_or("");
            Ok(ectx.group.printer().comment(text))
        }
    }
}

// =============================================================================
// INDEX MACROS
// =============================================================================

/// Resource cache and flattener class backing a tensor kind.
fn tensor_resource(kind: TensorKind) -> (ResourceKind, IndexRange) {
    match kind {
        TensorKind::Coordinates => (ResourceKind::Coordinates, IndexRange::FieldPlusMomentum),
        TensorKind::PotentialDv => (ResourceKind::PotentialDv, IndexRange::FieldOnly),
        TensorKind::PotentialDdv => (ResourceKind::PotentialDdv, IndexRange::FieldOnly),
        TensorKind::PotentialDddv => (ResourceKind::PotentialDddv, IndexRange::FieldOnly),
        TensorKind::Metric => (ResourceKind::Metric, IndexRange::FieldOnly),
        TensorKind::MetricInverse => (ResourceKind::MetricInverse, IndexRange::FieldOnly),
        TensorKind::Connexion => (ResourceKind::Connexion, IndexRange::FieldOnly),
        TensorKind::RiemannA2 => (ResourceKind::RiemannA2, IndexRange::FieldOnly),
        TensorKind::RiemannA3 => (ResourceKind::RiemannA3, IndexRange::FieldOnly),
        TensorKind::RiemannB3 => (ResourceKind::RiemannB3, IndexRange::FieldOnly),
    }
}

/// All-covariant variance tuple for a cache arity.
fn default_variances(arity: usize) -> Vec<crate::index::Variance> {
    vec![crate::index::Variance::Covariant; arity]
}

/// Evaluate one index-macro occurrence under `assignment`. Indices bound by
/// the assignment take their concrete value; unbound indices stay abstract
/// and force the rolled form.
pub fn eval_indexed(
    op: &IndexedOp,
    indices: &[AbstractIndex],
    assignment: &IndexAssignment,
    ectx: &mut EvalContext,
) -> Result<String, TranslatorError> {
    let bound: Vec<Option<usize>> = indices.iter().map(|i| assignment.get(i.label)).collect();
    let fully_bound = bound.iter().all(Option::is_some);

    match op {
        IndexedOp::Parameter => {
            let array = ectx.resource_or_default(ResourceKind::Parameters, "params");
            let offset = match bound.first().copied().flatten() {
                Some(value) => value.to_string(),
                None => indices
                    .first()
                    .map(|i| i.label.to_string())
                    .unwrap_or_default(),
            };
            Ok(format!("{}[{}]", array, offset))
        }
        IndexedOp::Tensor(kind) => {
            if fully_bound {
                let mut concrete = IndexAssignment::new();
                for (index, value) in indices.iter().zip(&bound) {
                    if let Some(value) = value {
                        concrete.bind(index.label, *value);
                    }
                }
                let expr = ectx.factory.compute_component(*kind, &concrete)?;
                let mut cse = ectx.group.cse_mut();
                cse.print(&expr, ectx.group.printer())
            } else {
                eval_tensor_rolled(*kind, indices, assignment, &bound, ectx)
            }
        }
    }
}

/// Rolled (or partially rolled) tensor reference.
///
/// Preference order: a registered resource label addressed through the
/// flattening function, else the factory's loop-body lambda when every
/// index is abstract.
fn eval_tensor_rolled(
    kind: TensorKind,
    indices: &[AbstractIndex],
    _assignment: &IndexAssignment,
    bound: &[Option<usize>],
    ectx: &mut EvalContext,
) -> Result<String, TranslatorError> {
    let (resource, flatten_range) = tensor_resource(kind);
    let variances = default_variances(resource.variance_arity());

    let label = ectx
        .unit
        .resources
        .find(resource, &variances, true)
        .or_else(|| {
            // Exact-variance lookup is the contractual path; fall back to
            // the closest tuple when the template assigned another variance.
            ectx.unit.resources.find(resource, &variances, false)
        })
        .map(str::to_string);

    match label {
        Some(array) => {
            let first_unbound = indices
                .iter()
                .zip(bound)
                .find(|(_, b)| b.is_none())
                .map(|(i, _)| i.label)
                .unwrap_or('?');
            let flatten = ectx.flattener_for(flatten_range, first_unbound)?;
            let rendered: Vec<String> = indices
                .iter()
                .zip(bound)
                .map(|(index, b)| match b {
                    Some(value) => value.to_string(),
                    None => index.label.to_string(),
                })
                .collect();
            match flatten {
                Some(function) => Ok(format!("{}[{}({})]", array, function, rendered.join(","))),
                None => Ok(format!("{}[{}]", array, rendered.join(","))),
            }
        }
        None => {
            if bound.iter().any(Option::is_some) {
                let label = indices.first().map(|i| i.label).unwrap_or('?');
                return Err(TranslatorError::UnsatisfiableUnroll {
                    label,
                    detail: format!(
                        "{} mixes concrete and abstract indices but no {} resource is assigned",
                        kind.name(),
                        tensor_resource(kind).0.name()
                    ),
                });
            }
            let expr = match kind {
                // Full abstract form for the algebraic tensors.
                TensorKind::Metric | TensorKind::MetricInverse | TensorKind::Connexion => {
                    ectx.factory.compute(kind, indices)?
                }
                _ => ectx.factory.compute_lambda(kind, indices)?,
            };
            let mut cse = ectx.group.cse_mut();
            cse.print(&expr, ectx.group.printer())
        }
    }
}

// =============================================================================
// DIRECTIVES
// =============================================================================

/// Evaluate one directive occurrence. Directives return an audit comment or
/// the empty string; they never produce statement text.
pub fn eval_directive(
    op: &DirectiveOp,
    args: &[String],
    indices: &[AbstractIndex],
    ectx: &mut EvalContext,
) -> Result<String, TranslatorError> {
    match op {
        DirectiveOp::Set => eval_set(args, indices, ectx),
        DirectiveOp::If => {
            let flag = args.first().map(String::as_str).unwrap_or("");
            let value = ectx.model.feature(flag);
            ectx.unit.emission.push_if(value);
            Ok(String::new())
        }
        DirectiveOp::Else => {
            ectx.unit.emission.toggle_else()?;
            Ok(String::new())
        }
        DirectiveOp::Endif => {
            ectx.unit.emission.pop_endif()?;
            Ok(String::new())
        }
        DirectiveOp::TempPool => {
            let template = args.first().cloned().unwrap_or_default();
            ectx.unit.pool.set_template(template);
            Ok(ectx.group.printer().comment("temporary pool"))
        }
        DirectiveOp::ResourceAssign(kind) => {
            let value = args.first().cloned().unwrap_or_default();
            let variances = default_variances(kind.variance_arity());
            let context = ectx.context.clone();
            ectx.unit.resources.assign(*kind, &variances, value, &context);
            Ok(String::new())
        }
        DirectiveOp::Release => {
            ectx.unit.resources.release();
            Ok(String::new())
        }
        DirectiveOp::ReleaseFlatteners => {
            ectx.unit.resources.release_flatteners();
            Ok(String::new())
        }
    }
}

fn eval_set(
    args: &[String],
    indices: &[AbstractIndex],
    ectx: &mut EvalContext,
) -> Result<String, TranslatorError> {
    let name = args
        .first()
        .cloned()
        .ok_or_else(|| TranslatorError::Internal("SET without name argument".to_string()))?;
    let body = args
        .get(1)
        .cloned()
        .ok_or_else(|| TranslatorError::Internal("SET without body argument".to_string()))?;

    if !is_macro_name(&name) {
        return Err(TranslatorError::DirectiveMisuse(format!(
            "'{}' is not a valid macro name",
            name
        )));
    }
    if ectx.group.is_registered(&name) || ectx.unit.user_macros.contains(&name) {
        return Err(TranslatorError::UserMacroRedefinition(name));
    }

    let token_list = tokenizer::tokenize(
        &body,
        ectx.group,
        &ectx.unit.user_macros,
        &ectx.context,
        ectx.sink,
    );

    let user_macro = UserMacro {
        name,
        indices: indices.to_vec(),
        arity: body_arity(&body),
        body: Rc::new(token_list),
        declared_at: ectx.context.clone(),
    };
    ectx.unit.user_macros.register(user_macro)?;
    Ok(String::new())
}

fn is_macro_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_uppercase())
        && chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
}

/// Evaluate a user macro occurrence: bind the declaration's indices to the
/// call site's through the remap rule and re-evaluate the cached body.
pub fn eval_user(
    user_macro: &UserMacro,
    args: &[String],
    actual_indices: &[AbstractIndex],
    assignment: &IndexAssignment,
    scope: &[AbstractIndex],
    ectx: &mut EvalContext,
) -> Result<String, TranslatorError> {
    let remap = IndexRemapRule::new(&user_macro.indices, actual_indices);
    let body = Rc::clone(&user_macro.body);
    body.evaluate(assignment, scope, Some(&remap), Some(args), ectx)
}

/// Diagnostic severity note: check at end of template for unclosed blocks.
pub fn check_balanced(unit: &TranslationUnit, context: &ErrorContext, sink: &mut dyn ErrorSink) {
    let open = unit.emission.open_blocks();
    if open > 0 {
        sink.error(
            context,
            DiagnosticCode::DirectiveMisuse,
            format!("{} IF block(s) left open at end of template", open),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unroll_status_lattice() {
        let status = UnrollStatus::Allow;
        assert_eq!(status.merge(UnrollBehavior::Force), UnrollStatus::Force);
        assert_eq!(
            UnrollStatus::Force.merge(UnrollBehavior::Prevent),
            UnrollStatus::Conflict
        );
        assert_eq!(
            UnrollStatus::Conflict.merge(UnrollBehavior::Allow),
            UnrollStatus::Conflict
        );
        assert_eq!(
            UnrollStatus::Prevent.merge(UnrollBehavior::Allow),
            UnrollStatus::Prevent
        );
    }

    #[test]
    fn macro_name_validation() {
        assert!(is_macro_name("DOUBLE"));
        assert!(is_macro_name("U2_NAME"));
        assert!(!is_macro_name("lower"));
        assert!(!is_macro_name("2TWO"));
        assert!(!is_macro_name(""));
    }

    #[test]
    fn directives_always_prevent() {
        let rule = ReplacementRule::directive("SET", Some(2), None, DirectiveOp::Set);
        assert_eq!(rule.get_unroll(), UnrollBehavior::Prevent);
    }
}
