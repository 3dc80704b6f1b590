//! Per-translation-unit resource caches
//!
//! Macros that roll an index up, or that refer to model data by name,
//! depend on identifier labels registered earlier in the template: the
//! parameters array, the coordinates array, phase/field flattening function
//! names, the working type, and the tensor resource labels (dV/ddV/dddV,
//! connexion, metric, Riemann blocks) keyed by their variance tuples.
//!
//! Entries are overwritten on assign and cleared on release. Flatteners
//! deliberately survive `release()`, since they describe the template's
//! memory layout rather than any one statement, and only clear on
//! `release_flatteners()`. Exact-match lookup is the contractual path;
//! closest-match by variance is best-effort (largest number of agreeing
//! slots, registration order breaking ties).

use std::collections::BTreeMap;

use crate::diagnostics::ErrorContext;
use crate::index::Variance;

/// A single optional label with provenance.
#[derive(Clone, Debug, Default)]
pub struct SimpleResource {
    value: Option<String>,
    assigned_at: Option<ErrorContext>,
}

impl SimpleResource {
    pub fn assign(&mut self, value: impl Into<String>, context: &ErrorContext) {
        self.value = Some(value.into());
        self.assigned_at = Some(context.clone());
    }

    pub fn find(&self) -> Option<&str> {
        self.value.as_deref()
    }

    pub fn is_set(&self) -> bool {
        self.value.is_some()
    }

    /// Where the current value was assigned.
    pub fn provenance(&self) -> Option<&ErrorContext> {
        self.assigned_at.as_ref()
    }

    pub fn release(&mut self) {
        self.value = None;
        self.assigned_at = None;
    }
}

/// A label cache keyed by an N-tuple of variance tags.
#[derive(Clone, Debug, Default)]
pub struct IndexedResource {
    arity: usize,
    entries: BTreeMap<Vec<Variance>, (String, ErrorContext)>,
    order: Vec<Vec<Variance>>,
}

impl IndexedResource {
    pub fn new(arity: usize) -> Self {
        Self {
            arity,
            entries: BTreeMap::new(),
            order: Vec::new(),
        }
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Assign a label for one variance tuple, overwriting any previous
    /// entry for the same tuple.
    pub fn assign(&mut self, variances: &[Variance], value: impl Into<String>, context: &ErrorContext) {
        debug_assert_eq!(variances.len(), self.arity);
        let key = variances.to_vec();
        if !self.entries.contains_key(&key) {
            self.order.push(key.clone());
        }
        self.entries.insert(key, (value.into(), context.clone()));
    }

    /// Exact-match lookup. Contractually guaranteed.
    pub fn find_exact(&self, variances: &[Variance]) -> Option<&str> {
        self.entries
            .get(variances)
            .map(|(value, _)| value.as_str())
    }

    /// Best-effort lookup: the entry agreeing with `variances` in the most
    /// slots, ties broken by registration order.
    pub fn find_closest(&self, variances: &[Variance]) -> Option<&str> {
        let mut best: Option<(usize, &Vec<Variance>)> = None;
        for key in &self.order {
            let agree = key
                .iter()
                .zip(variances)
                .filter(|(a, b)| a == b)
                .count();
            let better = match best {
                None => true,
                Some((best_agree, _)) => agree > best_agree,
            };
            if better {
                best = Some((agree, key));
            }
        }
        best.and_then(|(_, key)| self.entries.get(key).map(|(v, _)| v.as_str()))
    }

    pub fn is_set(&self) -> bool {
        !self.entries.is_empty()
    }

    pub fn release(&mut self) {
        self.entries.clear();
        self.order.clear();
    }
}

/// Which cache a resource operation addresses.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceKind {
    Parameters,
    Coordinates,
    PhaseFlatten,
    FieldFlatten,
    WorkingType,
    PotentialDv,
    PotentialDdv,
    PotentialDddv,
    Connexion,
    Metric,
    MetricInverse,
    RiemannA2,
    RiemannA3,
    RiemannB3,
}

impl ResourceKind {
    /// Name used in diagnostics.
    pub fn name(&self) -> &'static str {
        match self {
            ResourceKind::Parameters => "parameters",
            ResourceKind::Coordinates => "coordinates",
            ResourceKind::PhaseFlatten => "phase-flattener",
            ResourceKind::FieldFlatten => "field-flattener",
            ResourceKind::WorkingType => "working-type",
            ResourceKind::PotentialDv => "dV",
            ResourceKind::PotentialDdv => "ddV",
            ResourceKind::PotentialDddv => "dddV",
            ResourceKind::Connexion => "connexion",
            ResourceKind::Metric => "metric",
            ResourceKind::MetricInverse => "metric-inverse",
            ResourceKind::RiemannA2 => "Riemann-A2",
            ResourceKind::RiemannA3 => "Riemann-A3",
            ResourceKind::RiemannB3 => "Riemann-B3",
        }
    }

    /// Number of variance slots keying this cache (0 = simple resource).
    pub fn variance_arity(&self) -> usize {
        match self {
            ResourceKind::PotentialDv => 1,
            ResourceKind::PotentialDdv | ResourceKind::RiemannA2 => 2,
            ResourceKind::PotentialDddv | ResourceKind::RiemannA3 | ResourceKind::RiemannB3 => 3,
            _ => 0,
        }
    }

    fn is_flattener(&self) -> bool {
        matches!(
            self,
            ResourceKind::PhaseFlatten | ResourceKind::FieldFlatten
        )
    }
}

/// The full set of per-unit caches.
#[derive(Debug)]
pub struct ResourceManager {
    parameters: SimpleResource,
    coordinates: SimpleResource,
    phase_flatten: SimpleResource,
    field_flatten: SimpleResource,
    working_type: SimpleResource,
    dv: IndexedResource,
    ddv: IndexedResource,
    dddv: IndexedResource,
    connexion: SimpleResource,
    metric: SimpleResource,
    metric_inverse: SimpleResource,
    riemann_a2: IndexedResource,
    riemann_a3: IndexedResource,
    riemann_b3: IndexedResource,
}

impl Default for ResourceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceManager {
    pub fn new() -> Self {
        Self {
            parameters: SimpleResource::default(),
            coordinates: SimpleResource::default(),
            phase_flatten: SimpleResource::default(),
            field_flatten: SimpleResource::default(),
            working_type: SimpleResource::default(),
            dv: IndexedResource::new(1),
            ddv: IndexedResource::new(2),
            dddv: IndexedResource::new(3),
            connexion: SimpleResource::default(),
            metric: SimpleResource::default(),
            metric_inverse: SimpleResource::default(),
            riemann_a2: IndexedResource::new(2),
            riemann_a3: IndexedResource::new(3),
            riemann_b3: IndexedResource::new(3),
        }
    }

    fn simple(&self, kind: ResourceKind) -> Option<&SimpleResource> {
        match kind {
            ResourceKind::Parameters => Some(&self.parameters),
            ResourceKind::Coordinates => Some(&self.coordinates),
            ResourceKind::PhaseFlatten => Some(&self.phase_flatten),
            ResourceKind::FieldFlatten => Some(&self.field_flatten),
            ResourceKind::WorkingType => Some(&self.working_type),
            ResourceKind::Connexion => Some(&self.connexion),
            ResourceKind::Metric => Some(&self.metric),
            ResourceKind::MetricInverse => Some(&self.metric_inverse),
            _ => None,
        }
    }

    fn simple_mut(&mut self, kind: ResourceKind) -> Option<&mut SimpleResource> {
        match kind {
            ResourceKind::Parameters => Some(&mut self.parameters),
            ResourceKind::Coordinates => Some(&mut self.coordinates),
            ResourceKind::PhaseFlatten => Some(&mut self.phase_flatten),
            ResourceKind::FieldFlatten => Some(&mut self.field_flatten),
            ResourceKind::WorkingType => Some(&mut self.working_type),
            ResourceKind::Connexion => Some(&mut self.connexion),
            ResourceKind::Metric => Some(&mut self.metric),
            ResourceKind::MetricInverse => Some(&mut self.metric_inverse),
            _ => None,
        }
    }

    fn indexed(&self, kind: ResourceKind) -> Option<&IndexedResource> {
        match kind {
            ResourceKind::PotentialDv => Some(&self.dv),
            ResourceKind::PotentialDdv => Some(&self.ddv),
            ResourceKind::PotentialDddv => Some(&self.dddv),
            ResourceKind::RiemannA2 => Some(&self.riemann_a2),
            ResourceKind::RiemannA3 => Some(&self.riemann_a3),
            ResourceKind::RiemannB3 => Some(&self.riemann_b3),
            _ => None,
        }
    }

    fn indexed_mut(&mut self, kind: ResourceKind) -> Option<&mut IndexedResource> {
        match kind {
            ResourceKind::PotentialDv => Some(&mut self.dv),
            ResourceKind::PotentialDdv => Some(&mut self.ddv),
            ResourceKind::PotentialDddv => Some(&mut self.dddv),
            ResourceKind::RiemannA2 => Some(&mut self.riemann_a2),
            ResourceKind::RiemannA3 => Some(&mut self.riemann_a3),
            ResourceKind::RiemannB3 => Some(&mut self.riemann_b3),
            _ => None,
        }
    }

    /// Assign a label. `variances` is ignored for simple resources and must
    /// match the cache arity for indexed ones.
    pub fn assign(
        &mut self,
        kind: ResourceKind,
        variances: &[Variance],
        value: impl Into<String>,
        context: &ErrorContext,
    ) {
        if let Some(simple) = self.simple_mut(kind) {
            simple.assign(value, context);
        } else if let Some(indexed) = self.indexed_mut(kind) {
            indexed.assign(variances, value, context);
        }
        tracing::trace!(resource = kind.name(), "resource assigned");
    }

    /// Look up a label. `exact` selects the contractual exact-match path;
    /// otherwise the closest variance tuple is accepted.
    pub fn find(&self, kind: ResourceKind, variances: &[Variance], exact: bool) -> Option<&str> {
        if let Some(simple) = self.simple(kind) {
            simple.find()
        } else if let Some(indexed) = self.indexed(kind) {
            if exact {
                indexed.find_exact(variances)
            } else {
                indexed.find_closest(variances)
            }
        } else {
            None
        }
    }

    pub fn is_set(&self, kind: ResourceKind) -> bool {
        if let Some(simple) = self.simple(kind) {
            simple.is_set()
        } else if let Some(indexed) = self.indexed(kind) {
            indexed.is_set()
        } else {
            false
        }
    }

    /// Clear every cache except the flatteners.
    pub fn release(&mut self) {
        self.parameters.release();
        self.coordinates.release();
        self.working_type.release();
        self.dv.release();
        self.ddv.release();
        self.dddv.release();
        self.connexion.release();
        self.metric.release();
        self.metric_inverse.release();
        self.riemann_a2.release();
        self.riemann_a3.release();
        self.riemann_b3.release();
    }

    /// Clear the flattening-function caches.
    pub fn release_flatteners(&mut self) {
        self.phase_flatten.release();
        self.field_flatten.release();
    }

    /// The kinds that survive [`ResourceManager::release`].
    pub fn flattener_kinds() -> [ResourceKind; 2] {
        [ResourceKind::PhaseFlatten, ResourceKind::FieldFlatten]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Variance::{Contravariant as Up, Covariant as Lo};

    fn ctx() -> ErrorContext {
        ErrorContext::new("test.in", 1)
    }

    #[test]
    fn assign_then_exact_find() {
        let mut mgr = ResourceManager::new();
        mgr.assign(ResourceKind::Parameters, &[], "params", &ctx());
        assert_eq!(mgr.find(ResourceKind::Parameters, &[], true), Some("params"));
    }

    #[test]
    fn release_preserves_flatteners() {
        let mut mgr = ResourceManager::new();
        mgr.assign(ResourceKind::Coordinates, &[], "coords", &ctx());
        mgr.assign(ResourceKind::FieldFlatten, &[], "FLATTEN", &ctx());
        mgr.assign(ResourceKind::PhaseFlatten, &[], "PFLATTEN", &ctx());

        mgr.release();
        assert_eq!(mgr.find(ResourceKind::Coordinates, &[], true), None);
        assert_eq!(mgr.find(ResourceKind::FieldFlatten, &[], true), Some("FLATTEN"));

        mgr.release_flatteners();
        assert_eq!(mgr.find(ResourceKind::FieldFlatten, &[], true), None);
        assert_eq!(mgr.find(ResourceKind::PhaseFlatten, &[], true), None);
    }

    #[test]
    fn indexed_resource_distinguishes_variance() {
        let mut mgr = ResourceManager::new();
        mgr.assign(ResourceKind::PotentialDdv, &[Lo, Lo], "ddV_ll", &ctx());
        mgr.assign(ResourceKind::PotentialDdv, &[Up, Lo], "ddV_ul", &ctx());

        assert_eq!(
            mgr.find(ResourceKind::PotentialDdv, &[Lo, Lo], true),
            Some("ddV_ll")
        );
        assert_eq!(
            mgr.find(ResourceKind::PotentialDdv, &[Up, Lo], true),
            Some("ddV_ul")
        );
        assert_eq!(mgr.find(ResourceKind::PotentialDdv, &[Up, Up], true), None);
    }

    #[test]
    fn closest_match_prefers_most_agreeing_slots() {
        let mut mgr = ResourceManager::new();
        mgr.assign(ResourceKind::PotentialDdv, &[Lo, Lo], "ddV_ll", &ctx());
        mgr.assign(ResourceKind::PotentialDdv, &[Up, Lo], "ddV_ul", &ctx());

        // [Up, Up] agrees with [Up, Lo] in one slot, [Lo, Lo] in zero.
        assert_eq!(
            mgr.find(ResourceKind::PotentialDdv, &[Up, Up], false),
            Some("ddV_ul")
        );
    }

    #[test]
    fn overwrite_on_reassign() {
        let mut mgr = ResourceManager::new();
        mgr.assign(ResourceKind::WorkingType, &[], "double", &ctx());
        mgr.assign(ResourceKind::WorkingType, &[], "float", &ctx());
        assert_eq!(mgr.find(ResourceKind::WorkingType, &[], true), Some("float"));
    }
}
