use std::fmt;
use std::sync::Arc;

use crate::structure::{StructView, Structure};

/// Objective closure: `f(var, par)`.
pub type ObjectiveFn = Box<dyn Fn(&StructView<'_>, &StructView<'_>) -> f64>;

/// Constraint closure: `g(var, par)`, bounded by `conlb <= g <= conub`.
pub type ConstraintFn = Box<dyn Fn(&StructView<'_>, &StructView<'_>) -> Vec<f64>>;

/// Objective and constraint functions over a fixed variable/parameter shape.
///
/// Built once per problem shape. Evaluation works on flat slices laid out by
/// the variable and parameter structures, which is how the solver sees the
/// problem.
pub struct Nlp {
    var: Arc<Structure>,
    par: Arc<Structure>,
    objective: ObjectiveFn,
    constraints: Option<ConstraintFn>,
    num_constraints: usize,
}

impl Nlp {
    pub fn new(
        var: Arc<Structure>,
        par: Option<Arc<Structure>>,
        objective: ObjectiveFn,
        constraints: Option<ConstraintFn>,
        num_constraints: usize,
    ) -> Self {
        Self {
            var,
            par: par.unwrap_or_else(Structure::empty),
            objective,
            constraints,
            num_constraints,
        }
    }

    pub fn var_structure(&self) -> &Arc<Structure> {
        &self.var
    }

    pub fn par_structure(&self) -> &Arc<Structure> {
        &self.par
    }

    pub fn num_variables(&self) -> usize {
        self.var.size()
    }

    pub fn num_constraints(&self) -> usize {
        self.num_constraints
    }

    pub fn num_parameters(&self) -> usize {
        self.par.size()
    }

    pub fn objective(&self, x: &[f64], p: &[f64]) -> f64 {
        (self.objective)(
            &StructView::new(&self.var, x),
            &StructView::new(&self.par, p),
        )
    }

    /// Constraint values; the length is whatever the closure returns and is
    /// checked by the caller.
    pub fn constraints(&self, x: &[f64], p: &[f64]) -> Vec<f64> {
        match &self.constraints {
            Some(g) => g(
                &StructView::new(&self.var, x),
                &StructView::new(&self.par, p),
            ),
            None => Vec::new(),
        }
    }
}

impl fmt::Debug for Nlp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Nlp")
            .field("num_variables", &self.num_variables())
            .field("num_constraints", &self.num_constraints)
            .field("num_parameters", &self.num_parameters())
            .finish_non_exhaustive()
    }
}
