//! Property tests for the index engine and expansion passes.
//!
//! Run with: cargo test --test property_tests

use proptest::prelude::*;

use tensor_templates::rules::SimpleOp;
use tensor_templates::{
    assignment_count, enumerate, AbstractIndex, BufferedSink, CLikePrinter, CseWorker,
    ErrorContext, Expr, IndexAssignment, IndexRange, MacroAgent, ModelConfig, PackageGroup,
    ReplacementRule, ReplacementRulePackage, TensorFactory, TensorKind, TranslatorConfig,
    TranslatorError,
};

/// Factory returning plain symbols; enough for statements that never touch
/// tensors beyond components.
struct SymFactory;

impl TensorFactory for SymFactory {
    fn compute(
        &self,
        kind: TensorKind,
        _indices: &[AbstractIndex],
    ) -> Result<Expr, TranslatorError> {
        Ok(Expr::sym(kind.name().replace('-', "_")))
    }

    fn compute_component(
        &self,
        kind: TensorKind,
        assignment: &IndexAssignment,
    ) -> Result<Expr, TranslatorError> {
        let suffix: Vec<String> = assignment.iter().map(|(_, v)| v.to_string()).collect();
        Ok(Expr::sym(format!(
            "{}_{}",
            kind.name().replace('-', "_"),
            suffix.join("_")
        )))
    }

    fn compute_lambda(
        &self,
        kind: TensorKind,
        _indices: &[AbstractIndex],
    ) -> Result<Expr, TranslatorError> {
        Ok(Expr::sym(kind.name().replace('-', "_")))
    }
}

fn model(nf: usize, np: usize) -> ModelConfig {
    ModelConfig {
        num_fields: nf,
        num_params: np,
        ..Default::default()
    }
}

fn group() -> PackageGroup {
    let extras = ReplacementRulePackage::new("test").with_pre(ReplacementRule::simple(
        "FOO",
        0,
        SimpleOp::Literal {
            template: "bar".to_string(),
        },
    ));
    PackageGroup::builder(Box::new(CLikePrinter::new()), CseWorker::new(true))
        .package_with(tensor_templates::package::fundamental)
        .package_with(tensor_templates::package::resources)
        .package_with(tensor_templates::package::tensors)
        .package_with(tensor_templates::package::user_macros)
        .package_with(tensor_templates::package::temp_pool)
        .package(extras)
        .build()
}

fn expand(template: &[String], nf: usize, np: usize) -> Vec<String> {
    let model = model(nf, np);
    let config = TranslatorConfig::default();
    let factory = SymFactory;
    let mut agent = MacroAgent::new(&model, &config, group(), &factory);
    let mut sink = BufferedSink::new();

    let mut output = Vec::new();
    for (line_no, line) in template.iter().enumerate() {
        let ctx = ErrorContext::new("prop.in", line_no as u32 + 1);
        let result = agent.apply(line, &ctx, &mut sink).expect("no structural failure");
        output.extend(result.lines);
    }
    output
}

fn range_strategy() -> impl Strategy<Value = IndexRange> {
    prop_oneof![
        Just(IndexRange::FieldOnly),
        Just(IndexRange::FieldPlusMomentum),
        Just(IndexRange::Parameter),
    ]
}

proptest! {
    /// Exactly Π rᵢ assignments, in a stable order.
    #[test]
    fn cartesian_enumeration_is_complete_and_stable(
        nf in 1usize..4,
        np in 1usize..3,
        ranges in prop::collection::vec(range_strategy(), 0..4),
    ) {
        let model = model(nf, np);
        let labels = ['a', 'b', 'c', 'd'];
        let indices: Vec<AbstractIndex> = ranges
            .iter()
            .zip(labels)
            .map(|(range, label)| AbstractIndex::new(label, *range))
            .collect();

        let first: Vec<_> = enumerate(&indices, &model).collect();
        let second: Vec<_> = enumerate(&indices, &model).collect();

        prop_assert_eq!(first.len(), assignment_count(&indices, &model));
        prop_assert_eq!(first, second);
    }

    /// Every assignment yielded is distinct.
    #[test]
    fn assignments_are_distinct(
        nf in 1usize..4,
        ranges in prop::collection::vec(Just(IndexRange::FieldOnly), 1..4),
    ) {
        let model = model(nf, 1);
        let labels = ['a', 'b', 'c'];
        let indices: Vec<AbstractIndex> = ranges
            .iter()
            .zip(labels)
            .map(|(range, label)| AbstractIndex::new(label, *range))
            .collect();

        let mut seen = Vec::new();
        for assignment in enumerate(&indices, &model) {
            let key: Vec<(char, usize)> = assignment.iter().collect();
            prop_assert!(!seen.contains(&key));
            seen.push(key);
        }
    }

    /// Template expansion is a pure function of its input.
    #[test]
    fn expansion_is_deterministic(nf in 1usize..4, np in 0usize..3) {
        let template = vec![
            "$$__SET{SQ, ($1)*($1)}".to_string(),
            "u_<a><b> = $$__SQ{<a>} + $$__DDV[ab]".to_string(),
            "x = $$__FOO;".to_string(),
        ];
        prop_assert_eq!(expand(&template, nf, np), expand(&template, nf, np));
    }

    /// A statement whose LHS carries two field indices expands to Nf².
    #[test]
    fn lhs_unroll_counts_match_product(nf in 1usize..5) {
        let template = vec!["el_<a><b> = 0;".to_string()];
        let lines = expand(&template, nf, 1);
        prop_assert_eq!(lines.len(), nf * nf);
    }

    /// One pre-macro pass leaves no recognized occurrence behind.
    #[test]
    fn pre_macro_expansion_reaches_fixpoint(count in 1usize..6) {
        let line = (0..count)
            .map(|_| "$$__FOO")
            .collect::<Vec<_>>()
            .join(" ");
        let lines = expand(&[line], 2, 1);
        prop_assert_eq!(lines.len(), 1);
        prop_assert!(!lines[0].contains("$$__FOO"));
        prop_assert_eq!(lines[0].matches("bar").count(), count);
    }
}
