//! Rule packages and the package group
//!
//! A [`ReplacementRulePackage`] is the rule catalog for one feature area:
//! model metadata, resource directives, tensor macros, user macros, the
//! temporary pool. A [`PackageGroup`] composes the packages wired together
//! for one (model, target-language) pair, owns the shared CSE worker and
//! language printer, and resolves names to rule handles.
//!
//! Construction order invariant: the printer and CSE worker are injected
//! into the builder before any package constructor runs, because package
//! constructors may query them (the header macro bakes in the printer's
//! comment syntax).

use std::cell::{Ref, RefCell, RefMut};
use std::collections::HashMap;

use crate::cse::CseWorker;
use crate::expr::TensorKind;
use crate::index::IndexRange;
use crate::printer::LanguagePrinter;
use crate::resources::ResourceKind;
use crate::rules::{
    Aggregation, DirectiveOp, IndexedOp, ReplacementRule, RuleId, SimpleOp, UnrollBehavior,
};

/// Named catalog of rules for one feature area.
#[derive(Debug, Default)]
pub struct ReplacementRulePackage {
    name: &'static str,
    pre: Vec<ReplacementRule>,
    post: Vec<ReplacementRule>,
    index: Vec<ReplacementRule>,
    directive: Vec<ReplacementRule>,
}

impl ReplacementRulePackage {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            ..Default::default()
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn with_pre(mut self, rule: ReplacementRule) -> Self {
        self.pre.push(rule);
        self
    }

    pub fn with_post(mut self, rule: ReplacementRule) -> Self {
        self.post.push(rule);
        self
    }

    pub fn with_index(mut self, rule: ReplacementRule) -> Self {
        self.index.push(rule);
        self
    }

    pub fn with_directive(mut self, rule: ReplacementRule) -> Self {
        self.directive.push(rule);
        self
    }

    pub fn pre_rules(&self) -> &[ReplacementRule] {
        &self.pre
    }

    pub fn post_rules(&self) -> &[ReplacementRule] {
        &self.post
    }

    pub fn index_rules(&self) -> &[ReplacementRule] {
        &self.index
    }

    pub fn directive_rules(&self) -> &[ReplacementRule] {
        &self.directive
    }
}

// =============================================================================
// PACKAGE GROUP
// =============================================================================

/// The composed rule set for one translation backend.
pub struct PackageGroup {
    rules: Vec<ReplacementRule>,
    pre: HashMap<String, RuleId>,
    post: HashMap<String, RuleId>,
    index: HashMap<String, RuleId>,
    directive: HashMap<String, RuleId>,
    package_names: Vec<&'static str>,
    cse: RefCell<CseWorker>,
    printer: Box<dyn LanguagePrinter>,
}

impl std::fmt::Debug for PackageGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PackageGroup")
            .field("rules", &self.rules.len())
            .field("packages", &self.package_names)
            .finish()
    }
}

impl PackageGroup {
    /// Start composing a group. Printer and CSE worker come first.
    pub fn builder(printer: Box<dyn LanguagePrinter>, cse: CseWorker) -> PackageGroupBuilder {
        PackageGroupBuilder {
            printer,
            cse,
            rules: Vec::new(),
            pre: HashMap::new(),
            post: HashMap::new(),
            index: HashMap::new(),
            directive: HashMap::new(),
            package_names: Vec::new(),
        }
    }

    /// The stock group: every built-in package, in the standard order.
    pub fn standard(printer: Box<dyn LanguagePrinter>, cse: CseWorker) -> Self {
        Self::builder(printer, cse)
            .package_with(fundamental)
            .package_with(resources)
            .package_with(tensors)
            .package_with(user_macros)
            .package_with(temp_pool)
            .build()
    }

    pub fn rule(&self, id: RuleId) -> &ReplacementRule {
        &self.rules[id.0]
    }

    pub fn lookup_pre(&self, name: &str) -> Option<RuleId> {
        self.pre.get(name).copied()
    }

    pub fn lookup_post(&self, name: &str) -> Option<RuleId> {
        self.post.get(name).copied()
    }

    pub fn lookup_index(&self, name: &str) -> Option<RuleId> {
        self.index.get(name).copied()
    }

    pub fn lookup_directive(&self, name: &str) -> Option<RuleId> {
        self.directive.get(name).copied()
    }

    /// Whether `name` is taken in any namespace (guards `SET`).
    pub fn is_registered(&self, name: &str) -> bool {
        self.pre.contains_key(name)
            || self.post.contains_key(name)
            || self.index.contains_key(name)
            || self.directive.contains_key(name)
    }

    pub fn packages(&self) -> &[&'static str] {
        &self.package_names
    }

    pub fn cse(&self) -> Ref<'_, CseWorker> {
        self.cse.borrow()
    }

    pub fn cse_mut(&self) -> RefMut<'_, CseWorker> {
        self.cse.borrow_mut()
    }

    pub fn printer(&self) -> &dyn LanguagePrinter {
        self.printer.as_ref()
    }
}

/// Incremental group construction.
pub struct PackageGroupBuilder {
    printer: Box<dyn LanguagePrinter>,
    cse: CseWorker,
    rules: Vec<ReplacementRule>,
    pre: HashMap<String, RuleId>,
    post: HashMap<String, RuleId>,
    index: HashMap<String, RuleId>,
    directive: HashMap<String, RuleId>,
    package_names: Vec<&'static str>,
}

impl PackageGroupBuilder {
    /// Add a package built by `constructor`, which may inspect the CSE
    /// worker and printer.
    pub fn package_with(
        mut self,
        constructor: impl FnOnce(&CseWorker, &dyn LanguagePrinter) -> ReplacementRulePackage,
    ) -> Self {
        let package = constructor(&self.cse, self.printer.as_ref());
        self.add(package);
        self
    }

    /// Add an already-built package.
    pub fn package(mut self, package: ReplacementRulePackage) -> Self {
        self.add(package);
        self
    }

    fn add(&mut self, package: ReplacementRulePackage) {
        self.package_names.push(package.name());
        let ReplacementRulePackage {
            name,
            pre,
            post,
            index,
            directive,
        } = package;
        Self::register(&mut self.rules, &mut self.pre, name, pre);
        Self::register(&mut self.rules, &mut self.post, name, post);
        Self::register(&mut self.rules, &mut self.index, name, index);
        Self::register(&mut self.rules, &mut self.directive, name, directive);
    }

    // First registration of a name wins; later packages cannot shadow it.
    fn register(
        rules: &mut Vec<ReplacementRule>,
        table: &mut HashMap<String, RuleId>,
        package: &'static str,
        additions: Vec<ReplacementRule>,
    ) {
        for rule in additions {
            if table.contains_key(&rule.name) {
                tracing::warn!(name = %rule.name, package, "rule name already registered, keeping first");
                continue;
            }
            let id = RuleId(rules.len());
            table.insert(rule.name.clone(), id);
            rules.push(rule);
        }
    }

    pub fn build(self) -> PackageGroup {
        PackageGroup {
            rules: self.rules,
            pre: self.pre,
            post: self.post,
            index: self.index,
            directive: self.directive,
            package_names: self.package_names,
            cse: RefCell::new(self.cse),
            printer: self.printer,
        }
    }
}

// =============================================================================
// BUILT-IN PACKAGES
// =============================================================================

/// Model metadata macros.
pub fn fundamental(_cse: &CseWorker, printer: &dyn LanguagePrinter) -> ReplacementRulePackage {
    ReplacementRulePackage::new("fundamental")
        .with_pre(ReplacementRule::simple("MODEL", 0, SimpleOp::ModelName))
        .with_pre(ReplacementRule::simple(
            "NUMBER_FIELDS",
            0,
            SimpleOp::NumberFields,
        ))
        .with_pre(ReplacementRule::simple(
            "NUMBER_PARAMS",
            0,
            SimpleOp::NumberParams,
        ))
        .with_pre(ReplacementRule::simple(
            "WORKING_TYPE",
            0,
            SimpleOp::WorkingType,
        ))
        .with_pre(ReplacementRule::simple(
            "AUTO_HEADER",
            0,
            SimpleOp::Literal {
                template: printer.comment("generated by tensor-templates; do not edit"),
            },
        ))
        .with_post(ReplacementRule::simple("COMMENT", 1, SimpleOp::Comment))
}

/// Resource cache directives.
pub fn resources(_cse: &CseWorker, _printer: &dyn LanguagePrinter) -> ReplacementRulePackage {
    let assign = |name: &str, kind: ResourceKind| {
        ReplacementRule::directive(name, Some(1), Some(0), DirectiveOp::ResourceAssign(kind))
    };
    ReplacementRulePackage::new("resources")
        .with_directive(assign("RESOURCE_PARAMETERS", ResourceKind::Parameters))
        .with_directive(assign("RESOURCE_COORDINATES", ResourceKind::Coordinates))
        .with_directive(assign("PHASE_FLATTEN", ResourceKind::PhaseFlatten))
        .with_directive(assign("FIELD_FLATTEN", ResourceKind::FieldFlatten))
        .with_directive(assign("RESOURCE_WORKING_TYPE", ResourceKind::WorkingType))
        .with_directive(assign("RESOURCE_DV", ResourceKind::PotentialDv))
        .with_directive(assign("RESOURCE_DDV", ResourceKind::PotentialDdv))
        .with_directive(assign("RESOURCE_DDDV", ResourceKind::PotentialDddv))
        .with_directive(assign("RESOURCE_CONNEXION", ResourceKind::Connexion))
        .with_directive(assign("RESOURCE_METRIC", ResourceKind::Metric))
        .with_directive(assign("RESOURCE_METRIC_INV", ResourceKind::MetricInverse))
        .with_directive(assign("RESOURCE_RIEMANN_A2", ResourceKind::RiemannA2))
        .with_directive(assign("RESOURCE_RIEMANN_A3", ResourceKind::RiemannA3))
        .with_directive(assign("RESOURCE_RIEMANN_B3", ResourceKind::RiemannB3))
        .with_directive(ReplacementRule::directive(
            "RESOURCE_RELEASE",
            Some(0),
            Some(0),
            DirectiveOp::Release,
        ))
        .with_directive(ReplacementRule::directive(
            "RESOURCE_RELEASE_FLATTENERS",
            Some(0),
            Some(0),
            DirectiveOp::ReleaseFlatteners,
        ))
}

/// Tensor index macros.
pub fn tensors(_cse: &CseWorker, _printer: &dyn LanguagePrinter) -> ReplacementRulePackage {
    let tensor = |name: &str, arity: usize, range: IndexRange, kind: TensorKind| {
        ReplacementRule::indexed(
            name,
            0,
            arity,
            range,
            UnrollBehavior::Allow,
            Aggregation::Repeat,
            IndexedOp::Tensor(kind),
        )
    };
    ReplacementRulePackage::new("tensors")
        .with_index(tensor(
            "COORDS",
            1,
            IndexRange::FieldPlusMomentum,
            TensorKind::Coordinates,
        ))
        .with_index(ReplacementRule::indexed(
            "SUM_COORDS",
            0,
            1,
            IndexRange::FieldPlusMomentum,
            UnrollBehavior::Force,
            Aggregation::Sum,
            IndexedOp::Tensor(TensorKind::Coordinates),
        ))
        .with_index(ReplacementRule::indexed(
            "PARAMETER",
            0,
            1,
            IndexRange::Parameter,
            UnrollBehavior::Allow,
            Aggregation::Repeat,
            IndexedOp::Parameter,
        ))
        .with_index(tensor("DV", 1, IndexRange::FieldOnly, TensorKind::PotentialDv))
        .with_index(tensor(
            "DDV",
            2,
            IndexRange::FieldOnly,
            TensorKind::PotentialDdv,
        ))
        .with_index(tensor(
            "DDDV",
            3,
            IndexRange::FieldOnly,
            TensorKind::PotentialDddv,
        ))
        .with_index(tensor("METRIC", 2, IndexRange::FieldOnly, TensorKind::Metric))
        .with_index(tensor(
            "METRIC_INV",
            2,
            IndexRange::FieldOnly,
            TensorKind::MetricInverse,
        ))
        .with_index(tensor(
            "CONNEXION",
            3,
            IndexRange::FieldOnly,
            TensorKind::Connexion,
        ))
        .with_index(tensor(
            "RIEMANN_A2",
            2,
            IndexRange::FieldOnly,
            TensorKind::RiemannA2,
        ))
        .with_index(tensor(
            "RIEMANN_A3",
            3,
            IndexRange::FieldOnly,
            TensorKind::RiemannA3,
        ))
        .with_index(tensor(
            "RIEMANN_B3",
            3,
            IndexRange::FieldOnly,
            TensorKind::RiemannB3,
        ))
}

/// User macro registration and conditional emission.
pub fn user_macros(_cse: &CseWorker, _printer: &dyn LanguagePrinter) -> ReplacementRulePackage {
    ReplacementRulePackage::new("macros")
        .with_directive(ReplacementRule::directive(
            "SET",
            Some(2),
            None,
            DirectiveOp::Set,
        ))
        .with_directive(ReplacementRule::directive(
            "IF",
            Some(1),
            Some(0),
            DirectiveOp::If,
        ))
        .with_directive(ReplacementRule::directive(
            "ELSE",
            Some(0),
            Some(0),
            DirectiveOp::Else,
        ))
        .with_directive(ReplacementRule::directive(
            "ENDIF",
            Some(0),
            Some(0),
            DirectiveOp::Endif,
        ))
}

/// Temporary pool placement.
pub fn temp_pool(_cse: &CseWorker, _printer: &dyn LanguagePrinter) -> ReplacementRulePackage {
    ReplacementRulePackage::new("temp_pool").with_directive(ReplacementRule::directive(
        "TEMP_POOL",
        Some(1),
        Some(0),
        DirectiveOp::TempPool,
    ))
}
