use std::sync::Arc;

use time::PrimitiveDateTime;

use crate::xmds::Layout;

/// What a predicate may look at besides the layout itself.
#[derive(Debug, Clone)]
pub struct AssessContext {
    pub now: PrimitiveDateTime,
    /// Last known device position as `(lat, lng)`, when there is one.
    pub location: Option<(f64, f64)>,
}

/// Eligibility hook evaluated for every scheduled layout during assessment.
/// Returning `false` excludes the layout from this pass.
pub trait LayoutPredicate: Send + Sync {
    fn matches(&self, layout: &Layout, ctx: &AssessContext) -> bool;
}

impl<F> LayoutPredicate for F
where
    F: Fn(&Layout, &AssessContext) -> bool + Send + Sync,
{
    fn matches(&self, layout: &Layout, ctx: &AssessContext) -> bool {
        self(layout, ctx)
    }
}

/// Layout validity. Nothing is checked yet.
pub struct AlwaysValid;

impl LayoutPredicate for AlwaysValid {
    fn matches(&self, _layout: &Layout, _ctx: &AssessContext) -> bool {
        true
    }
}

/// Criteria are not evaluated; a layout that carries any is excluded.
pub struct RejectCriteria;

impl LayoutPredicate for RejectCriteria {
    fn matches(&self, layout: &Layout, _ctx: &AssessContext) -> bool {
        !layout.has_criteria()
    }
}

/// Geofences are not evaluated; geo-aware layouts are excluded.
pub struct RejectGeoAware;

impl LayoutPredicate for RejectGeoAware {
    fn matches(&self, layout: &Layout, _ctx: &AssessContext) -> bool {
        !layout.is_geo_aware
    }
}

/// The three eligibility hooks, in evaluation order.
#[derive(Clone)]
pub struct Predicates {
    pub validity: Arc<dyn LayoutPredicate>,
    pub criteria: Arc<dyn LayoutPredicate>,
    pub geofence: Arc<dyn LayoutPredicate>,
}

impl Default for Predicates {
    fn default() -> Self {
        Self {
            validity: Arc::new(AlwaysValid),
            criteria: Arc::new(RejectCriteria),
            geofence: Arc::new(RejectGeoAware),
        }
    }
}

impl Predicates {
    pub fn accepts(&self, layout: &Layout, ctx: &AssessContext) -> bool {
        self.validity.matches(layout, ctx)
            && self.criteria.matches(layout, ctx)
            && self.geofence.matches(layout, ctx)
    }
}
