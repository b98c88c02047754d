use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, warn};
use nalgebra::DVector;

use crate::error::{Error, Result};
use crate::nlpsol::{Input, NlpSolver};
use crate::options::SolverOptions;
use crate::problem::{ConstraintFn, Nlp, ObjectiveFn};
use crate::status::SolveStatus;
use crate::structure::{StructArray, StructView, Structure};

/// Statistics of the last solve.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SolveStats {
    /// `None` until the first solve.
    pub status: Option<SolveStatus>,
    /// Wall-clock seconds spent in the last solve.
    pub time: f64,
    pub iterations: usize,
}

/// Collects the pieces of a [`ControlSolver`].
///
/// Bounds default to unbounded, the guess to zero, and the problem has no
/// constraints or parameters unless given.
pub struct SessionBuilder {
    var: Arc<Structure>,
    objective: ObjectiveFn,
    constraints: Option<(ConstraintFn, DVector<f64>, DVector<f64>)>,
    lb: Option<StructArray>,
    ub: Option<StructArray>,
    guess: Option<StructArray>,
    par: Option<StructArray>,
    options: SolverOptions,
}

impl SessionBuilder {
    pub fn lb(mut self, lb: StructArray) -> Self {
        self.lb = Some(lb);
        self
    }

    pub fn ub(mut self, ub: StructArray) -> Self {
        self.ub = Some(ub);
        self
    }

    pub fn guess(mut self, guess: StructArray) -> Self {
        self.guess = Some(guess);
        self
    }

    /// Constraints `conlb <= g(var, par) <= conub`.
    pub fn constraints<G>(mut self, g: G, conlb: Vec<f64>, conub: Vec<f64>) -> Self
    where
        G: Fn(&StructView<'_>, &StructView<'_>) -> Vec<f64> + 'static,
    {
        self.constraints = Some((
            Box::new(g),
            DVector::from_vec(conlb),
            DVector::from_vec(conub),
        ));
        self
    }

    /// Parameter values; their structure becomes the parameter structure.
    pub fn parameters(mut self, parval: StructArray) -> Self {
        self.par = Some(parval);
        self
    }

    pub fn options(mut self, options: SolverOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds the session and its solver instance.
    ///
    /// # Errors
    ///
    /// Returns an error when the bounds or guess do not share the variable
    /// structure, when the constraint bounds do not match the number of
    /// constraints, or when the options are invalid.
    pub fn build(self) -> Result<ControlSolver> {
        let var = self.var;
        let lb = shaped(self.lb, &var, f64::NEG_INFINITY, "lb")?;
        let ub = shaped(self.ub, &var, f64::INFINITY, "ub")?;
        let guess = shaped(self.guess, &var, 0.0, "guess")?;
        let par_structure = self.par.as_ref().map(|p| Arc::clone(p.structure()));
        let empty = StructArray::zeros(&Structure::empty());
        let par_view = self.par.as_ref().unwrap_or(&empty).view();

        let (constraints, conlb, conub) = match self.constraints {
            Some((g, conlb, conub)) => {
                // The number of constraints is whatever the function returns at the guess.
                let m = g(&guess.view(), &par_view).len();
                for (what, bound) in [("conlb", &conlb), ("conub", &conub)] {
                    if bound.len() != m {
                        return Err(Error::DimensionMismatch {
                            what: what.into(),
                            expected: m,
                            actual: bound.len(),
                        });
                    }
                }
                (Some(g), conlb, conub)
            }
            None => (None, DVector::zeros(0), DVector::zeros(0)),
        };

        let nlp = Nlp::new(
            Arc::clone(&var),
            par_structure,
            self.objective,
            constraints,
            conlb.len(),
        );
        let solver = NlpSolver::new(nlp, self.options.clone())?;

        let mut session = ControlSolver {
            var: guess.clone(),
            lb,
            ub,
            guess,
            conlb,
            conub,
            par: self.par,
            obj: f64::NAN,
            stats: SolveStats::default(),
            options: self.options,
            solver,
        };
        session.push_inputs();
        Ok(session)
    }
}

fn shaped(
    values: Option<StructArray>,
    var: &Arc<Structure>,
    default: f64,
    what: &'static str,
) -> Result<StructArray> {
    match values {
        Some(values) if values.structure().as_ref() == var.as_ref() => Ok(values),
        Some(_) => Err(Error::StructureMismatch { what }),
        None => Ok(StructArray::filled(var, default)),
    }
}

/// A solver session for one problem shape, solved repeatedly.
///
/// Between solves only bounds, guess and parameters change. The usual
/// receding-horizon loop is: pin the initial state with
/// [`ControlSolver::fixvar`], call [`ControlSolver::solve`], check
/// [`ControlSolver::stats`], read the first move from [`ControlSolver::var`],
/// then shift the trajectory into the guess with [`ControlSolver::saveguess`].
#[derive(Debug)]
pub struct ControlSolver {
    var: StructArray,
    lb: StructArray,
    ub: StructArray,
    guess: StructArray,
    conlb: DVector<f64>,
    conub: DVector<f64>,
    par: Option<StructArray>,
    obj: f64,
    stats: SolveStats,
    options: SolverOptions,
    solver: NlpSolver,
}

impl ControlSolver {
    /// Starts building a session over the variable structure `var`.
    pub fn builder<F>(var: &Arc<Structure>, objective: F) -> SessionBuilder
    where
        F: Fn(&StructView<'_>, &StructView<'_>) -> f64 + 'static,
    {
        SessionBuilder {
            var: Arc::clone(var),
            objective: Box::new(objective),
            constraints: None,
            lb: None,
            ub: None,
            guess: None,
            par: None,
            options: SolverOptions::default(),
        }
    }

    /// Optimal variables of the last solve; the initial guess before any solve.
    pub fn var(&self) -> &StructArray {
        &self.var
    }

    /// Objective value of the last solve; NaN before any solve.
    pub fn obj(&self) -> f64 {
        self.obj
    }

    pub fn stats(&self) -> &SolveStats {
        &self.stats
    }

    pub fn status(&self) -> Option<SolveStatus> {
        self.stats.status
    }

    pub fn lb(&self) -> &StructArray {
        &self.lb
    }

    pub fn lb_mut(&mut self) -> &mut StructArray {
        &mut self.lb
    }

    pub fn ub(&self) -> &StructArray {
        &self.ub
    }

    pub fn ub_mut(&mut self) -> &mut StructArray {
        &mut self.ub
    }

    pub fn guess(&self) -> &StructArray {
        &self.guess
    }

    pub fn guess_mut(&mut self) -> &mut StructArray {
        &mut self.guess
    }

    pub fn conlb(&self) -> &DVector<f64> {
        &self.conlb
    }

    pub fn conlb_mut(&mut self) -> &mut DVector<f64> {
        &mut self.conlb
    }

    pub fn conub(&self) -> &DVector<f64> {
        &self.conub
    }

    pub fn conub_mut(&mut self) -> &mut DVector<f64> {
        &mut self.conub
    }

    pub fn par(&self) -> Option<&StructArray> {
        self.par.as_ref()
    }

    pub fn par_mut(&mut self) -> Option<&mut StructArray> {
        self.par.as_mut()
    }

    pub fn verbosity(&self) -> u8 {
        self.options.verbosity()
    }

    /// Clamped to `0..=12`. Applies to session messages immediately and to
    /// the solver after [`ControlSolver::reinitialize`].
    pub fn set_verbosity(&mut self, verbosity: i32) {
        self.options.set_verbosity(verbosity);
    }

    pub fn time_limit(&self) -> f64 {
        self.options.time_limit
    }

    /// Takes effect after [`ControlSolver::reinitialize`].
    pub fn set_time_limit(&mut self, seconds: f64) {
        self.options.time_limit = seconds;
    }

    pub fn options(&self) -> &SolverOptions {
        &self.options
    }

    /// The underlying solver instance, mainly for inspecting its inputs.
    pub fn solver(&self) -> &NlpSolver {
        &self.solver
    }

    fn push_bounds_and_guess(&mut self) {
        self.solver.load_input(Input::X0, self.guess.as_slice());
        self.solver.load_input(Input::Lbx, self.lb.as_slice());
        self.solver.load_input(Input::Ubx, self.ub.as_slice());
    }

    fn push_inputs(&mut self) {
        self.push_bounds_and_guess();
        self.solver.load_input(Input::Lbg, self.conlb.as_slice());
        self.solver.load_input(Input::Ubg, self.conub.as_slice());
        if let Some(par) = &self.par {
            self.solver.load_input(Input::P, par.as_slice());
        }
    }

    /// Rebuilds the solver instance with the session's current options.
    ///
    /// # Errors
    ///
    /// Returns an error if the current options are invalid.
    pub fn reinitialize(&mut self) -> Result<()> {
        self.solver.configure(self.options.clone())?;
        self.push_inputs();
        Ok(())
    }

    /// Solves with the current guess, bounds and parameters.
    ///
    /// Non-convergence is not an error: the status is returned and stored in
    /// [`ControlSolver::stats`], and [`ControlSolver::var`] and
    /// [`ControlSolver::obj`] hold the solver's final point either way.
    pub fn solve(&mut self) -> SolveStatus {
        let started = Instant::now();
        self.push_inputs();
        let status = self.solver.evaluate();

        let solution = self.solver.solution();
        self.var.copy_from_slice(solution.x.as_slice());
        self.obj = solution.f;
        let elapsed = started.elapsed().as_secs_f64();
        self.stats = SolveStats {
            status: Some(status),
            time: elapsed,
            iterations: solution.iter,
        };

        let verbosity = self.options.verbosity();
        if verbosity > 0 {
            info!("Solver Status: {status}");
            if status == SolveStatus::EvaluationError {
                warn!("NaN or Inf encountered during function evaluation");
            }
        }
        if verbosity > 1 {
            debug!("Took {elapsed:e} s.");
        }
        status
    }

    /// Fixes `name` at time `t` to `value`: lower bound, upper bound and guess
    /// all become `value`, and the solver inputs are refreshed.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown field, a time index out of range or a
    /// value of the wrong dimension. Nothing is modified in that case.
    pub fn fixvar(&mut self, name: &str, t: usize, value: &[f64]) -> Result<()> {
        self.guess.set(name, t, value)?;
        self.lb.set(name, t, value)?;
        self.ub.set(name, t, value)?;
        self.push_bounds_and_guess();
        Ok(())
    }

    /// Like [`ControlSolver::fixvar`] for the components `indices` only;
    /// `value[k]` goes to component `indices[k]`.
    ///
    /// # Errors
    ///
    /// Same as [`ControlSolver::fixvar`], plus component indices out of range.
    pub fn fixvar_indices(
        &mut self,
        name: &str,
        t: usize,
        indices: &[usize],
        value: &[f64],
    ) -> Result<()> {
        self.guess.set_indices(name, t, indices, value)?;
        self.lb.set_indices(name, t, indices, value)?;
        self.ub.set_indices(name, t, indices, value)?;
        self.push_bounds_and_guess();
        Ok(())
    }

    /// Stores the last optimal trajectory, shifted by one time step, as the
    /// guess for the next solve.
    pub fn saveguess(&mut self) {
        self.saveguess_offset(1);
    }

    /// Stores `var[t]` into `guess[t - toffset]` for every field and every `t`
    /// where both indices are valid. Guess entries outside that range keep
    /// their values.
    pub fn saveguess_offset(&mut self, toffset: isize) {
        let structure = Arc::clone(self.var.structure());
        for field in structure.fields() {
            let name = field.name();
            let len_var = field.len() as isize;
            let len_guess = self.guess.len(name).map_or(0, |len| len as isize);

            let tmax = len_var.min(len_guess + toffset);
            let tmin = toffset.max(0);
            for t in tmin..tmax {
                let src = &self.var[(name, t as usize)];
                self.guess[(name, (t - toffset) as usize)].copy_from_slice(src);
            }
        }
        debug!("Saved guess with time offset {toffset}");
    }
}

/// Outcome of [`call_solver`].
#[derive(Debug)]
pub struct SolverCall {
    pub var: StructArray,
    pub obj: f64,
    pub status: SolveStatus,
    pub solver: ControlSolver,
}

/// Builds a session and optionally solves it once.
///
/// Without optimization the status is [`SolveStatus::NotRequested`], the
/// objective is infinite and `var` is the initial guess.
///
/// # Errors
///
/// Returns the construction errors of [`SessionBuilder::build`].
pub fn call_solver(builder: SessionBuilder, run_optimization: bool) -> Result<SolverCall> {
    let mut solver = builder.build()?;
    let (obj, status) = if run_optimization {
        let status = solver.solve();
        (solver.obj(), status)
    } else {
        (f64::INFINITY, SolveStatus::NotRequested)
    };
    Ok(SolverCall {
        var: solver.var().clone(),
        obj,
        status,
        solver,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;

    /// min sum (x_t - t)^2 over x of length 4 with scalar entries.
    fn tracking() -> ControlSolver {
        let var = Structure::new([("x", 4, 1)]).unwrap();
        ControlSolver::builder(&var, |x, _| {
            (0..4).map(|t| (x[("x", t)][0] - t as f64).powi(2)).sum()
        })
        .options(SolverOptions::default().with_verbosity(0))
        .build()
        .unwrap()
    }

    #[test]
    fn unconstrained_solve_reaches_minimum() {
        let mut solver = tracking();
        assert_eq!(solver.status(), None);
        assert!(solver.obj().is_nan());

        let status = solver.solve();
        assert_eq!(status, SolveStatus::SolveSucceeded);
        for t in 0..4 {
            assert_abs_diff_eq!(solver.var()[("x", t)][0], t as f64, epsilon = 1e-5);
        }
        assert_abs_diff_eq!(solver.obj(), 0.0, epsilon = 1e-10);
    }

    #[test]
    fn fixvar_pins_bounds_guess_and_solver_inputs() {
        let mut solver = tracking();
        solver.fixvar("x", 2, &[7.5]).unwrap();
        assert_eq!(solver.lb()[("x", 2)], [7.5]);
        assert_eq!(solver.ub()[("x", 2)], [7.5]);
        assert_eq!(solver.guess()[("x", 2)], [7.5]);
        assert_eq!(solver.solver().input(Input::Lbx)[2], 7.5);
        assert_eq!(solver.solver().input(Input::Ubx)[2], 7.5);
        assert_eq!(solver.solver().input(Input::X0)[2], 7.5);

        solver.solve();
        assert_eq!(solver.var()[("x", 2)], [7.5]);
        assert_abs_diff_eq!(solver.var()[("x", 3)][0], 3.0, epsilon = 1e-5);
    }

    #[test]
    fn fixvar_rejects_bad_addresses_without_side_effects() {
        let mut solver = tracking();
        assert!(solver.fixvar("y", 0, &[1.0]).is_err());
        assert!(solver.fixvar("x", 4, &[1.0]).is_err());
        assert!(solver.fixvar("x", 0, &[1.0, 2.0]).is_err());
        assert!(solver.lb().as_slice().iter().all(|v| *v == f64::NEG_INFINITY));
        assert!(solver.guess().as_slice().iter().all(|v| *v == 0.0));
    }

    #[test]
    fn fixvar_indices_touches_selected_components() {
        let var = Structure::new([("x", 2, 3)]).unwrap();
        let sum_of_squares = |x: &StructView<'_>, _: &StructView<'_>| {
            x.as_slice().iter().map(|v| v * v).sum::<f64>()
        };
        let mut solver = ControlSolver::builder(&var, sum_of_squares)
            .options(SolverOptions::default().with_verbosity(0))
            .build()
            .unwrap();
        solver.fixvar_indices("x", 0, &[1, 2], &[4.0, 5.0]).unwrap();
        assert_eq!(solver.lb()[("x", 0)][0], f64::NEG_INFINITY);
        assert_eq!(solver.lb()[("x", 0)][1..], [4.0, 5.0]);
        assert_eq!(solver.ub()[("x", 0)][1..], [4.0, 5.0]);
        assert_eq!(solver.guess()[("x", 0)], [0.0, 4.0, 5.0]);
    }

    #[test]
    fn saveguess_shifts_by_offset() {
        let mut solver = tracking();
        solver.solve();
        solver.guess_mut().fill_field("x", -1.0).unwrap();

        solver.saveguess_offset(2);
        let guess = solver.guess().trajectory("x").unwrap();
        assert_abs_diff_eq!(guess[(0, 0)], 2.0, epsilon = 1e-5);
        assert_abs_diff_eq!(guess[(0, 1)], 3.0, epsilon = 1e-5);
        assert_eq!(guess[(0, 2)], -1.0);
        assert_eq!(guess[(0, 3)], -1.0);

        solver.guess_mut().fill_field("x", -1.0).unwrap();
        solver.saveguess_offset(-1);
        let guess = solver.guess().trajectory("x").unwrap();
        assert_eq!(guess[(0, 0)], -1.0);
        assert_abs_diff_eq!(guess[(0, 1)], 0.0, epsilon = 1e-5);
        assert_abs_diff_eq!(guess[(0, 3)], 2.0, epsilon = 1e-5);
    }

    #[test]
    fn build_rejects_mismatched_pieces() {
        let var = Structure::new([("x", 3, 1)]).unwrap();
        let other = Structure::new([("x", 2, 1)]).unwrap();

        let err = ControlSolver::builder(&var, |_, _| 0.0)
            .lb(StructArray::zeros(&other))
            .build()
            .unwrap_err();
        assert_eq!(err, Error::StructureMismatch { what: "lb" });

        let err = ControlSolver::builder(&var, |_, _| 0.0)
            .constraints(|x, _| vec![x[("x", 0)][0]], vec![0.0, 0.0], vec![0.0])
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            Error::DimensionMismatch { expected: 1, actual: 2, .. }
        ));

        let err = ControlSolver::builder(&var, |_, _| 0.0)
            .options(SolverOptions::default().with_time_limit(-1.0))
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOptions { .. }));
    }

    #[test]
    fn call_solver_without_optimization() {
        let var = Structure::new([("x", 2, 1)]).unwrap();
        let mut guess = StructArray::zeros(&var);
        guess.tile("x", &[3.0]).unwrap();
        let builder =
            ControlSolver::builder(&var, |x, _| x[("x", 0)][0].powi(2)).guess(guess.clone());

        let call = call_solver(builder, false).unwrap();
        assert_eq!(call.status, SolveStatus::NotRequested);
        assert_eq!(call.obj, f64::INFINITY);
        assert_eq!(call.var, guess);
        assert_eq!(call.solver.status(), None);
    }

    #[test]
    fn parameters_are_pushed_on_every_solve() {
        let var = Structure::new([("x", 1, 1)]).unwrap();
        let par = Structure::new([("sp", 1, 1)]).unwrap();
        let mut parval = StructArray::zeros(&par);
        parval.set("sp", 0, &[2.0]).unwrap();

        let tracking_error = |x: &StructView<'_>, p: &StructView<'_>| {
            (x[("x", 0)][0] - p[("sp", 0)][0]).powi(2)
        };
        let mut solver = ControlSolver::builder(&var, tracking_error)
            .parameters(parval)
            .options(SolverOptions::default().with_verbosity(0))
            .build()
            .unwrap();
        solver.solve();
        assert_abs_diff_eq!(solver.var()[("x", 0)][0], 2.0, epsilon = 1e-5);

        solver.par_mut().unwrap().set("sp", 0, &[-1.0]).unwrap();
        solver.solve();
        assert_abs_diff_eq!(solver.var()[("x", 0)][0], -1.0, epsilon = 1e-5);
    }

    #[test]
    fn reinitialize_applies_new_options() {
        let mut solver = tracking();
        solver.set_verbosity(99);
        assert_eq!(solver.verbosity(), 12);
        solver.set_time_limit(5.0);
        solver.reinitialize().unwrap();
        assert_eq!(solver.solver().settings().time_limit, 5.0);

        solver.set_time_limit(0.0);
        assert!(solver.reinitialize().is_err());
        assert_eq!(solver.solver().settings().time_limit, 5.0);
    }
}
