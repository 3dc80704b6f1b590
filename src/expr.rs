//! Symbolic expression tree
//!
//! The tensor math provider is an external collaborator, but the CSE worker
//! has to print *something*, so the engine defines a minimal structural
//! expression tree as the interchange type: [`TensorFactory`] methods return
//! [`Expr`] values and the CSE worker prints them. There is no algebra here
//! beyond structural identity: no simplification, no symbolic summation.

use crate::assignment::IndexAssignment;
use crate::error::TranslatorError;
use crate::index::AbstractIndex;

/// Structural expression node.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Expr {
    Int(i64),
    Sym(String),
    Add(Vec<Expr>),
    Mul(Vec<Expr>),
    Pow(Box<Expr>, i32),
    Call(String, Vec<Expr>),
}

impl Expr {
    pub fn int(value: i64) -> Expr {
        Expr::Int(value)
    }

    pub fn sym(name: impl Into<String>) -> Expr {
        Expr::Sym(name.into())
    }

    pub fn add(terms: Vec<Expr>) -> Expr {
        Expr::Add(terms)
    }

    pub fn mul(factors: Vec<Expr>) -> Expr {
        Expr::Mul(factors)
    }

    pub fn pow(base: Expr, exponent: i32) -> Expr {
        Expr::Pow(Box::new(base), exponent)
    }

    pub fn call(name: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::Call(name.into(), args)
    }

    /// Leaf nodes never become CSE temporaries.
    pub fn is_atom(&self) -> bool {
        matches!(self, Expr::Int(_) | Expr::Sym(_))
    }
}

/// Tensors the engine can ask the factory for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TensorKind {
    Coordinates,
    PotentialDv,
    PotentialDdv,
    PotentialDddv,
    Metric,
    MetricInverse,
    Connexion,
    RiemannA2,
    RiemannA3,
    RiemannB3,
}

impl TensorKind {
    /// Display name used in diagnostics and cache provenance.
    pub fn name(&self) -> &'static str {
        match self {
            TensorKind::Coordinates => "coordinates",
            TensorKind::PotentialDv => "dV",
            TensorKind::PotentialDdv => "ddV",
            TensorKind::PotentialDddv => "dddV",
            TensorKind::Metric => "metric",
            TensorKind::MetricInverse => "metric-inverse",
            TensorKind::Connexion => "connexion",
            TensorKind::RiemannA2 => "Riemann-A2",
            TensorKind::RiemannA3 => "Riemann-A3",
            TensorKind::RiemannB3 => "Riemann-B3",
        }
    }
}

/// Opaque provider of symbolic tensor components.
///
/// Implemented outside this crate by the symbolic math layer. The engine
/// only ever asks for one of three shapes: the full abstract tensor, a
/// single concrete component, or a loop-body lambda parameterized by
/// abstract index symbols.
pub trait TensorFactory {
    /// The tensor as one abstract expression over `indices`.
    fn compute(&self, kind: TensorKind, indices: &[AbstractIndex])
        -> Result<Expr, TranslatorError>;

    /// One concrete component selected by `assignment`.
    fn compute_component(
        &self,
        kind: TensorKind,
        assignment: &IndexAssignment,
    ) -> Result<Expr, TranslatorError>;

    /// Loop-body expression with `indices` left abstract, for rolled-up
    /// output.
    fn compute_lambda(
        &self,
        kind: TensorKind,
        indices: &[AbstractIndex],
    ) -> Result<Expr, TranslatorError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn structural_identity() {
        let a = Expr::mul(vec![Expr::sym("x"), Expr::pow(Expr::sym("y"), 2)]);
        let b = Expr::mul(vec![Expr::sym("x"), Expr::pow(Expr::sym("y"), 2)]);
        let c = Expr::mul(vec![Expr::pow(Expr::sym("y"), 2), Expr::sym("x")]);
        assert_eq!(a, b);
        assert_ne!(a, c); // no algebra: order matters
    }

    #[test]
    fn atoms() {
        assert!(Expr::int(3).is_atom());
        assert!(Expr::sym("phi").is_atom());
        assert!(!Expr::add(vec![Expr::int(1), Expr::int(2)]).is_atom());
    }
}
