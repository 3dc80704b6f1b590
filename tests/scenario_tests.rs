//! Expansion scenario suite
//!
//! End-to-end tests driving the macro agent over template lines:
//! - pre-macro substitution and convergence
//! - index unrolling, roll-up, and mixed statements
//! - directives (resources, SET, conditionals, temporary pool)
//! - error recovery (one diagnostic per problem, processing continues)
//!
//! Run with: cargo test --test scenario_tests

use std::rc::Rc;

use pretty_assertions::assert_eq;

use tensor_templates::directives::{UserMacro, UserMacroTable};
use tensor_templates::package::{fundamental, resources, temp_pool, tensors, user_macros};
use tensor_templates::rules::{IndexedOp, ReplacementRule, SimpleOp};
use tensor_templates::{
    tokenize, AbstractIndex, Aggregation, BufferedSink, CLikePrinter, CseWorker, DiagnosticCode,
    ErrorContext, Expr, IndexAssignment, IndexRange, MacroAgent, ModelConfig, PackageGroup,
    ReplacementRulePackage, TensorFactory, TensorKind, TranslatorConfig, TranslatorError,
    UnrollBehavior,
};

// =============================================================================
// TEST FIXTURES
// =============================================================================

/// Deterministic stand-in for the symbolic tensor provider.
struct TestFactory;

fn tensor_ident(kind: TensorKind) -> String {
    kind.name().replace('-', "_")
}

impl TensorFactory for TestFactory {
    fn compute(
        &self,
        kind: TensorKind,
        indices: &[AbstractIndex],
    ) -> Result<Expr, TranslatorError> {
        let args = indices
            .iter()
            .map(|i| Expr::sym(i.label.to_string()))
            .collect();
        Ok(Expr::call(format!("{}_full", tensor_ident(kind)), args))
    }

    fn compute_component(
        &self,
        kind: TensorKind,
        assignment: &IndexAssignment,
    ) -> Result<Expr, TranslatorError> {
        let suffix: Vec<String> = assignment.iter().map(|(_, v)| v.to_string()).collect();
        match kind {
            // Composite on purpose, so the CSE worker has something to factor.
            TensorKind::PotentialDdv => Ok(Expr::add(vec![
                Expr::mul(vec![
                    Expr::sym(format!("phi_{}", suffix.join("_"))),
                    Expr::sym("mass"),
                ]),
                Expr::int(1),
            ])),
            _ => Ok(Expr::sym(format!(
                "{}_{}",
                tensor_ident(kind),
                suffix.join("_")
            ))),
        }
    }

    fn compute_lambda(
        &self,
        kind: TensorKind,
        indices: &[AbstractIndex],
    ) -> Result<Expr, TranslatorError> {
        let args = indices
            .iter()
            .map(|i| Expr::sym(i.label.to_string()))
            .collect();
        Ok(Expr::call(format!("{}_lambda", tensor_ident(kind)), args))
    }
}

fn model(nf: usize, np: usize) -> ModelConfig {
    ModelConfig {
        name: "quadratic".to_string(),
        num_fields: nf,
        num_params: np,
        working_type: "double".to_string(),
        ..Default::default()
    }
}

/// The stock packages plus a small test package with plain pre-macros and a
/// mandatory-roll-up index macro.
fn test_group(cse: bool) -> PackageGroup {
    let extras = ReplacementRulePackage::new("test")
        .with_pre(ReplacementRule::simple(
            "FOO",
            0,
            SimpleOp::Literal {
                template: "bar".to_string(),
            },
        ))
        .with_pre(ReplacementRule::simple(
            "SCALE",
            2,
            SimpleOp::Literal {
                template: "($1)*($2)".to_string(),
            },
        ))
        .with_pre(ReplacementRule::simple(
            "NEST",
            0,
            SimpleOp::Literal {
                template: "$$__FOO!".to_string(),
            },
        ))
        .with_index(ReplacementRule::indexed(
            "ROLLME",
            0,
            1,
            IndexRange::FieldOnly,
            UnrollBehavior::Prevent,
            Aggregation::Repeat,
            IndexedOp::Tensor(TensorKind::PotentialDv),
        ));

    PackageGroup::builder(Box::new(CLikePrinter::new()), CseWorker::new(cse))
        .package_with(fundamental)
        .package_with(resources)
        .package_with(tensors)
        .package_with(user_macros)
        .package_with(temp_pool)
        .package(extras)
        .build()
}

fn ctx(line: u32) -> ErrorContext {
    ErrorContext::new("template.in", line)
}

struct Harness<'a> {
    agent: MacroAgent<'a>,
    sink: BufferedSink,
    line_no: u32,
}

impl<'a> Harness<'a> {
    fn new(model: &'a ModelConfig, config: &'a TranslatorConfig, factory: &'a TestFactory) -> Self {
        Self {
            agent: MacroAgent::new(model, config, test_group(config.cse), factory),
            sink: BufferedSink::new(),
            line_no: 0,
        }
    }

    fn apply(&mut self, line: &str) -> (Vec<String>, usize) {
        self.line_no += 1;
        let result = self
            .agent
            .apply(line, &ctx(self.line_no), &mut self.sink)
            .expect("no structural failure");
        (result.lines, result.replacements)
    }

    /// Register a user macro directly, the way a driver preloading state
    /// would (covers declarations that `SET` cannot express, such as an
    /// explicit field-only range on an uppercase label).
    fn register_macro(&mut self, name: &str, indices: Vec<AbstractIndex>, arity: usize, body: &str) {
        let compiled = tokenize(
            body,
            self.agent.group(),
            &UserMacroTable::new(),
            &ctx(0),
            &mut self.sink,
        );
        self.agent
            .unit_mut()
            .user_macros
            .register(UserMacro {
                name: name.to_string(),
                indices,
                arity,
                body: Rc::new(compiled),
                declared_at: ctx(0),
            })
            .expect("macro registered");
    }
}

// =============================================================================
// SCENARIO A: pre-macro substitution
// =============================================================================

#[test]
fn pre_macro_substitutes_and_counts() {
    let model = model(2, 1);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    let (lines, count) = harness.apply("x = $$__FOO;");
    assert_eq!(lines, vec!["x = bar;".to_string()]);
    assert_eq!(count, 1);
    assert!(!harness.sink.has_errors());
}

#[test]
fn pre_macro_with_arguments() {
    let model = model(2, 1);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    let (lines, _) = harness.apply("y = $$__SCALE{a, b+c};");
    assert_eq!(lines, vec!["y = (a)*(b+c);".to_string()]);
}

#[test]
fn pre_macro_convergence_across_passes() {
    let model = model(2, 1);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    // NEST expands to text containing FOO; a second pass must clear it.
    let (lines, count) = harness.apply("v = $$__NEST");
    assert_eq!(lines, vec!["v = bar!".to_string()]);
    assert_eq!(count, 2);
    assert!(!lines[0].contains("$$__"));
}

#[test]
fn model_metadata_macros() {
    let model = model(3, 2);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    let (lines, _) = harness.apply("const int nf = $$__NUMBER_FIELDS; // $$__MODEL");
    assert_eq!(lines, vec!["const int nf = 3; // quadratic".to_string()]);
}

// =============================================================================
// SCENARIO B/C: allow-policy index macro, with and without a flattener
// =============================================================================

#[test]
fn allow_policy_unrolls_without_flattener() {
    let model = model(2, 0);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    harness.register_macro(
        "M",
        vec![AbstractIndex::new('A', IndexRange::FieldOnly)],
        0,
        "f<A>",
    );

    let (lines, _) = harness.apply("$$__M[A]");
    assert_eq!(lines, vec!["f0".to_string(), "f1".to_string()]);
    assert!(!harness.sink.has_errors());
}

#[test]
fn allow_policy_rolls_up_with_flattener() {
    let model = model(2, 0);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    harness.register_macro(
        "M",
        vec![AbstractIndex::new('A', IndexRange::FieldOnly)],
        0,
        "f<A>",
    );

    let (produced, _) = harness.apply("$$__FIELD_FLATTEN{FLATTEN}");
    assert!(produced.is_empty());

    let (lines, _) = harness.apply("$$__M[A]");
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0], "fFLATTEN(A)");
    assert_eq!(lines[0].matches("FLATTEN(").count(), 1);
    // No numeric enumeration.
    assert!(!lines[0].contains('0'));
    assert!(!harness.sink.has_errors());
}

// =============================================================================
// SCENARIO D: SET directive and user macro calls
// =============================================================================

#[test]
fn set_directive_registers_user_macro() {
    let model = model(2, 0);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    let (produced, _) = harness.apply("$$__SET{DOUBLE, ($1)*2}");
    assert!(produced.is_empty());
    assert!(harness.agent.unit().user_macros.contains("DOUBLE"));

    let (lines, _) = harness.apply("$$__DOUBLE{5}");
    assert_eq!(lines, vec!["(5)*2".to_string()]);
    assert!(!harness.sink.has_errors());
}

#[test]
fn user_macro_remaps_indices_to_call_site() {
    let model = model(3, 0);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    // Declared with index x; called with index b on the LHS, so the body's
    // <x> must follow b's enumeration.
    let (produced, _) = harness.apply("$$__SET[x]{FIELD_SLOT, slot<x>}");
    assert!(produced.is_empty());

    let (lines, _) = harness.apply("arr_<b> = $$__FIELD_SLOT[b]");
    assert_eq!(
        lines,
        vec![
            "arr_0 = slot0".to_string(),
            "arr_1 = slot1".to_string(),
            "arr_2 = slot2".to_string(),
        ]
    );
}

#[test]
fn user_macro_redefinition_is_reported() {
    let model = model(2, 0);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    harness.apply("$$__SET{TWICE, ($1)*2}");
    harness.apply("$$__SET{TWICE, ($1)+($1)}");

    assert!(harness.sink.has_errors());
    assert!(harness
        .sink
        .diagnostics()
        .iter()
        .any(|d| d.code == DiagnosticCode::UserMacroRedefinition));
}

// =============================================================================
// SCENARIO E: malformed call sites
// =============================================================================

#[test]
fn unterminated_argument_list_recovers() {
    let model = model(2, 0);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    let (_, _) = harness.apply("x = $$__SCALE{1,2");
    let arity_errors = harness
        .sink
        .diagnostics()
        .iter()
        .filter(|d| d.code == DiagnosticCode::LexicalArity)
        .count();
    assert_eq!(arity_errors, 1);

    // Subsequent lines still process normally.
    let (lines, _) = harness.apply("x = $$__FOO;");
    assert_eq!(lines, vec!["x = bar;".to_string()]);
}

#[test]
fn unknown_macro_name_is_reported_once() {
    let model = model(2, 0);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    let (lines, _) = harness.apply("q_<a> = $$__NO_SUCH_MACRO + <a>");
    // The line still unrolls; the unknown name stays literal.
    assert_eq!(lines.len(), 2);
    assert!(lines[0].contains("$$__NO_SUCH_MACRO"));

    let unknown = harness
        .sink
        .diagnostics()
        .iter()
        .filter(|d| d.code == DiagnosticCode::UnknownMacroName)
        .count();
    assert_eq!(unknown, 1);
}

// =============================================================================
// INDEX ENGINE
// =============================================================================

#[test]
fn lhs_indices_enumerate_cartesian_product() {
    let model = model(3, 0);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    let (lines, _) = harness.apply("el_<a><b> = 0;");
    assert_eq!(lines.len(), 9);
    assert_eq!(lines[0], "el_00 = 0;");
    // Last-declared index varies fastest.
    assert_eq!(lines[1], "el_01 = 0;");
    assert_eq!(lines[3], "el_10 = 0;");
    assert_eq!(lines[8], "el_22 = 0;");
}

#[test]
fn forced_sum_joins_terms() {
    let model = model(1, 0);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    let (lines, _) = harness.apply("dotH = $$__SUM_COORDS[A]");
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("coordinates_0"));
    assert!(lines[0].contains("coordinates_1"));
    assert!(lines[0].contains('+'));
}

#[test]
fn mixed_statement_closes_over_outer_assignment() {
    let model = model(2, 0);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    harness.apply("$$__FIELD_FLATTEN{FLATTEN}");
    harness.apply("$$__RESOURCE_DDV{ddv}");

    // a is enumerated on the LHS; b stays rolled inside the resource
    // reference, closing over each concrete a.
    let (lines, _) = harness.apply("out_<a> = $$__DDV[ab]");
    assert_eq!(
        lines,
        vec![
            "out_0 = ddv[FLATTEN(0,b)]".to_string(),
            "out_1 = ddv[FLATTEN(1,b)]".to_string(),
        ]
    );
    assert!(!harness.sink.has_errors());
}

#[test]
fn prevent_without_flattener_is_unsatisfiable() {
    let model = model(2, 0);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    let (lines, _) = harness.apply("x = $$__ROLLME[a]");
    assert!(lines.is_empty());
    assert!(harness
        .sink
        .diagnostics()
        .iter()
        .any(|d| d.code == DiagnosticCode::UnsatisfiableUnroll));
}

#[test]
fn prevent_with_flattener_rolls_up() {
    let model = model(2, 0);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    harness.apply("$$__FIELD_FLATTEN{FLATTEN}");
    harness.apply("$$__RESOURCE_DV{dv}");

    let (lines, _) = harness.apply("x = $$__ROLLME[a]");
    assert_eq!(lines, vec!["x = dv[FLATTEN(a)]".to_string()]);
}

#[test]
fn duplicate_label_in_one_occurrence_conflicts() {
    let model = model(2, 0);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    harness.apply("x = $$__DDV[aa]");
    assert!(harness
        .sink
        .diagnostics()
        .iter()
        .any(|d| d.code == DiagnosticCode::IndexRangeConflict));
}

// =============================================================================
// DIRECTIVES
// =============================================================================

#[test]
fn directive_only_input_emits_no_macro_tokens() {
    let model = model(2, 1);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    let template = [
        "$$__RESOURCE_COORDINATES{coords}",
        "$$__FIELD_FLATTEN{FLATTEN}",
        "$$__SET{HUBBLE, H0}",
        "$$__TEMP_POOL{auto $1 = $2;}",
        "$$__RESOURCE_RELEASE",
    ];

    let mut all_lines = Vec::new();
    for line in template {
        let (lines, _) = harness.apply(line);
        all_lines.extend(lines);
    }

    assert!(all_lines.iter().all(|l| !l.contains("$$__")));
    assert!(!harness.sink.has_errors());
}

#[test]
fn resource_lifecycle_through_directives() {
    use tensor_templates::ResourceKind;

    let model = model(2, 1);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    harness.apply("$$__RESOURCE_PARAMETERS{par}");
    harness.apply("$$__FIELD_FLATTEN{FLATTEN}");

    let resources = &harness.agent.unit().resources;
    assert_eq!(resources.find(ResourceKind::Parameters, &[], true), Some("par"));

    harness.apply("$$__RESOURCE_RELEASE");
    let resources = &harness.agent.unit().resources;
    assert_eq!(resources.find(ResourceKind::Parameters, &[], true), None);
    assert_eq!(
        resources.find(ResourceKind::FieldFlatten, &[], true),
        Some("FLATTEN")
    );

    harness.apply("$$__RESOURCE_RELEASE_FLATTENERS");
    let resources = &harness.agent.unit().resources;
    assert_eq!(resources.find(ResourceKind::FieldFlatten, &[], true), None);
}

#[test]
fn conditional_directives_gate_emission() {
    let mut model = model(2, 0);
    model.features.insert("metric".to_string(), false);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    harness.apply("$$__IF{metric}");
    let (suppressed, _) = harness.apply("curved = 1;");
    harness.apply("$$__ELSE");
    let (emitted, _) = harness.apply("flat = 1;");
    harness.apply("$$__ENDIF");
    let (after, _) = harness.apply("tail = 1;");

    assert!(suppressed.is_empty());
    assert_eq!(emitted, vec!["flat = 1;".to_string()]);
    assert_eq!(after, vec!["tail = 1;".to_string()]);
    assert!(!harness.sink.has_errors());
}

#[test]
fn unbalanced_conditionals_reported_at_finalize() {
    let model = model(2, 0);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    harness.apply("$$__IF{metric}");
    let line_no = harness.line_no + 1;
    let tail = harness.agent.finalize(&ctx(line_no), &mut harness.sink);

    assert!(tail.is_empty());
    assert!(harness
        .sink
        .diagnostics()
        .iter()
        .any(|d| d.code == DiagnosticCode::DirectiveMisuse));
}

// =============================================================================
// CSE AND THE TEMPORARY POOL
// =============================================================================

#[test]
fn repeated_subexpressions_become_pooled_temporaries() {
    let model = model(1, 0);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    // Nf = 1: a and b each take only the value 0, so the DDV component (a
    // composite expression) prints once per occurrence and repeats.
    let (first, _) = harness.apply("u1 = $$__DDV[ab]");
    assert_eq!(first.len(), 2);
    assert!(first[0].starts_with("double t0 = "));
    assert!(first[0].contains("phi_0_0"));
    assert!(first[1].contains("t0"));

    // Second occurrence hits the expression cache: no new temporary.
    let (second, _) = harness.apply("u2 = $$__DDV[ab]");
    assert_eq!(second.len(), 1);
    assert!(second[0].contains("t0"));

    let stats = harness.agent.group().cse().stats();
    assert!(stats.hits >= 1);
    assert!(stats.misses >= 1);
}

#[test]
fn temp_pool_template_controls_declarations() {
    let model = model(1, 0);
    let config = TranslatorConfig::default();
    let factory = TestFactory;
    let mut harness = Harness::new(&model, &config, &factory);

    harness.apply("$$__TEMP_POOL{auto $1 = $2; // pool}");
    let (lines, _) = harness.apply("u1 = $$__DDV[ab]");
    assert!(lines[0].starts_with("auto t0 = "));
    assert!(lines[0].ends_with("// pool"));
}

// =============================================================================
// DETERMINISM
// =============================================================================

#[test]
fn identical_input_expands_identically() {
    let template = [
        "$$__RESOURCE_COORDINATES{coords}",
        "$$__SET{SQ, ($1)*($1)}",
        "u_<a><b> = $$__SQ{<a>} + $$__DDV[ab]",
        "x = $$__FOO;",
    ];

    let run = || {
        let model = model(2, 1);
        let config = TranslatorConfig::default();
        let factory = TestFactory;
        let mut harness = Harness::new(&model, &config, &factory);
        let mut output = Vec::new();
        for line in template {
            let (lines, _) = harness.apply(line);
            output.extend(lines);
        }
        output
    };

    assert_eq!(run(), run());
}
