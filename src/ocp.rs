//! Builders for the standard problem families: nonlinear MPC, moving horizon
//! estimation and steady-state target selection.
//!
//! Each builder lays out the variable and parameter structures, writes the
//! model as equality constraints and hands the result to a [`ControlSolver`].
//! Model parameters `p` are optional; when none are given the model receives
//! an empty slice.

use std::sync::Arc;

use log::debug;
use nalgebra::DVector;

use crate::control::ControlSolver;
use crate::error::Result;
use crate::options::SolverOptions;
use crate::structure::{StructArray, StructView, Structure};

/// Model `f(x, u, p)`, discrete (`x[t+1] = f`) or continuous (`dx/dt = f`).
pub type Model = Box<dyn Fn(&[f64], &[f64], &[f64]) -> DVector<f64>>;

/// Measurement `h(x, p)`.
pub type Measurement = Box<dyn Fn(&[f64], &[f64]) -> DVector<f64>>;

/// Per-field entries tiled over every time point of the field.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FieldValues {
    entries: Vec<(String, Vec<f64>)>,
}

impl FieldValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, entry: impl Into<Vec<f64>>) -> Self {
        self.entries.push((name.into(), entry.into()));
        self
    }

    fn apply_to(&self, array: &mut StructArray) -> Result<()> {
        for (name, entry) in &self.entries {
            array.tile(name, entry)?;
        }
        Ok(())
    }
}

/// Parameter structure without the fields of dimension zero.
fn structure<'a>(
    fields: impl IntoIterator<Item = (&'a str, usize, usize)>,
) -> Result<Arc<Structure>> {
    Structure::new(fields.into_iter().filter(|&(_, _, dim)| dim > 0))
}

/// Entry of an optional field; empty when the field is absent.
fn entry<'a>(view: &StructView<'a>, name: &str, t: usize) -> &'a [f64] {
    view.try_get(name, t).unwrap_or(&[])
}

/// Appends `a - b` to `g`. A `b` of the wrong length yields NaN entries, which
/// the solver reports as an evaluation failure.
fn push_difference(g: &mut Vec<f64>, a: &[f64], b: &DVector<f64>) {
    if a.len() == b.len() {
        g.extend(a.iter().zip(b.iter()).map(|(a, b)| a - b));
    } else {
        g.extend(std::iter::repeat_n(f64::NAN, a.len()));
    }
}

/// Leaves a prediction of the wrong length untouched for [`push_difference`].
fn add_noise(prediction: &mut DVector<f64>, noise: &[f64]) {
    if prediction.len() == noise.len() {
        for (p, n) in prediction.iter_mut().zip(noise) {
            *p += n;
        }
    }
}

/// Bounds filled with `default` and overwritten by `values`.
fn bounds(var: &Arc<Structure>, default: f64, values: &FieldValues) -> Result<StructArray> {
    let mut array = StructArray::filled(var, default);
    values.apply_to(&mut array)?;
    Ok(array)
}

/// Arguments of the NMPC stage cost at time `t`.
#[derive(Debug, Clone, Copy)]
pub struct Stage<'a> {
    pub t: usize,
    pub x: &'a [f64],
    pub u: &'a [f64],
    pub x_sp: &'a [f64],
    pub u_sp: &'a [f64],
    /// Input move `u[t] - u[t-1]`, with `u[-1]` the `u_prev` parameter.
    pub du: &'a [f64],
}

type StageCost = Box<dyn Fn(&Stage<'_>) -> f64>;
type TerminalCost = Box<dyn Fn(&[f64], &[f64]) -> f64>;

/// Nonlinear MPC over a horizon of `N` moves.
///
/// Variables `x (N+1 x nx)` and `u (N x nu)`. Parameters `x_sp (N+1 x nx)`,
/// `u_sp (N x nu)`, `u_prev (1 x nu)` and, when model parameters are given,
/// `p (N x np)`. The discrete model `x[t+1] = f(x[t], u[t], p[t])` is imposed
/// as equality constraints; optional rate limits bound `u[t] - u[t-1]`.
pub struct Nmpc {
    nx: usize,
    nu: usize,
    horizon: usize,
    model: Model,
    stage_cost: StageCost,
    terminal_cost: Option<TerminalCost>,
    p: Option<Vec<f64>>,
    x0: Option<Vec<f64>>,
    u_prev: Option<Vec<f64>>,
    setpoints: Option<(Vec<f64>, Vec<f64>)>,
    rate_limits: Option<(Vec<f64>, Vec<f64>)>,
    lb: FieldValues,
    ub: FieldValues,
    guess: FieldValues,
    options: SolverOptions,
}

impl Nmpc {
    pub fn new<F, L>(nx: usize, nu: usize, horizon: usize, model: F, stage_cost: L) -> Self
    where
        F: Fn(&[f64], &[f64], &[f64]) -> DVector<f64> + 'static,
        L: Fn(&Stage<'_>) -> f64 + 'static,
    {
        Self {
            nx,
            nu,
            horizon,
            model: Box::new(model),
            stage_cost: Box::new(stage_cost),
            terminal_cost: None,
            p: None,
            x0: None,
            u_prev: None,
            setpoints: None,
            rate_limits: None,
            lb: FieldValues::default(),
            ub: FieldValues::default(),
            guess: FieldValues::default(),
            options: SolverOptions::default(),
        }
    }

    /// Cost `Pf(x[N], x_sp[N])` on the final state.
    pub fn terminal_cost<P>(mut self, cost: P) -> Self
    where
        P: Fn(&[f64], &[f64]) -> f64 + 'static,
    {
        self.terminal_cost = Some(Box::new(cost));
        self
    }

    /// Model parameters, the same at every step until changed via
    /// [`ControlSolver::par_mut`].
    pub fn model_parameters(mut self, p: Vec<f64>) -> Self {
        self.p = Some(p);
        self
    }

    /// Fixes the initial state.
    pub fn x0(mut self, x0: Vec<f64>) -> Self {
        self.x0 = Some(x0);
        self
    }

    pub fn u_prev(mut self, u_prev: Vec<f64>) -> Self {
        self.u_prev = Some(u_prev);
        self
    }

    /// Constant state and input setpoints.
    pub fn setpoints(mut self, x_sp: Vec<f64>, u_sp: Vec<f64>) -> Self {
        self.setpoints = Some((x_sp, u_sp));
        self
    }

    /// Bounds `dulb <= u[t] - u[t-1] <= duub`.
    pub fn rate_limits(mut self, dulb: Vec<f64>, duub: Vec<f64>) -> Self {
        self.rate_limits = Some((dulb, duub));
        self
    }

    pub fn lb(mut self, lb: FieldValues) -> Self {
        self.lb = lb;
        self
    }

    pub fn ub(mut self, ub: FieldValues) -> Self {
        self.ub = ub;
        self
    }

    pub fn guess(mut self, guess: FieldValues) -> Self {
        self.guess = guess;
        self
    }

    pub fn options(mut self, options: SolverOptions) -> Self {
        self.options = options;
        self
    }

    /// # Errors
    ///
    /// Returns an error for zero dimensions or horizon, for bound, guess or
    /// parameter entries of the wrong dimension, or for invalid options.
    pub fn build(self) -> Result<ControlSolver> {
        let Nmpc {
            nx,
            nu,
            horizon: n,
            model,
            stage_cost,
            terminal_cost,
            p,
            x0,
            u_prev,
            setpoints,
            rate_limits,
            lb,
            ub,
            guess,
            options,
        } = self;
        let np = p.as_ref().map_or(0, Vec::len);

        let var = Structure::new([("x", n + 1, nx), ("u", n, nu)])?;
        let par_structure = structure([
            ("p", n, np),
            ("x_sp", n + 1, nx),
            ("u_sp", n, nu),
            ("u_prev", 1, nu),
        ])?;

        let mut par = StructArray::zeros(&par_structure);
        if let Some(p) = &p {
            par.tile("p", p)?;
        }
        if let Some((x_sp, u_sp)) = &setpoints {
            par.tile("x_sp", x_sp)?;
            par.tile("u_sp", u_sp)?;
        }
        if let Some(u_prev) = &u_prev {
            par.set("u_prev", 0, u_prev)?;
        }

        let mut initial = StructArray::zeros(&var);
        if let Some(x0) = &x0 {
            initial.tile("x", x0)?;
        }
        guess.apply_to(&mut initial)?;

        let rate_limited = rate_limits.is_some();
        let mut conlb = vec![0.0; n * nx];
        let mut conub = vec![0.0; n * nx];
        if let Some((dulb, duub)) = &rate_limits {
            for _ in 0..n {
                conlb.extend_from_slice(dulb);
                conub.extend_from_slice(duub);
            }
        }

        let objective = move |var: &StructView<'_>, par: &StructView<'_>| {
            let mut cost = 0.0;
            let mut u_last = par.get("u_prev", 0);
            for t in 0..n {
                let u = var.get("u", t);
                let du: Vec<f64> = u.iter().zip(u_last).map(|(a, b)| a - b).collect();
                cost += stage_cost(&Stage {
                    t,
                    x: var.get("x", t),
                    u,
                    x_sp: par.get("x_sp", t),
                    u_sp: par.get("u_sp", t),
                    du: &du,
                });
                u_last = u;
            }
            if let Some(pf) = &terminal_cost {
                cost += pf(var.get("x", n), par.get("x_sp", n));
            }
            cost
        };

        let constraints = move |var: &StructView<'_>, par: &StructView<'_>| {
            let mut g = Vec::with_capacity(n * (nx + nu));
            for t in 0..n {
                let next = model(var.get("x", t), var.get("u", t), entry(par, "p", t));
                push_difference(&mut g, var.get("x", t + 1), &next);
            }
            if rate_limited {
                let mut u_last = par.get("u_prev", 0);
                for t in 0..n {
                    let u = var.get("u", t);
                    g.extend(u.iter().zip(u_last).map(|(a, b)| a - b));
                    u_last = u;
                }
            }
            g
        };

        let mut session = ControlSolver::builder(&var, objective)
            .lb(bounds(&var, f64::NEG_INFINITY, &lb)?)
            .ub(bounds(&var, f64::INFINITY, &ub)?)
            .guess(initial)
            .constraints(constraints, conlb, conub)
            .parameters(par)
            .options(options)
            .build()?;
        if let Some(x0) = &x0 {
            session.fixvar("x", 0, x0)?;
        }
        debug!("Built NMPC with horizon {n}, nx = {nx}, nu = {nu}, np = {np}");
        Ok(session)
    }
}

type EstimatorCost = Box<dyn Fn(&[f64], &[f64]) -> f64>;
type PriorCost = Box<dyn Fn(&[f64]) -> f64>;

/// Nonlinear moving horizon estimation over `N` past moves.
///
/// Variables `x (N+1 x nx)`, process noise `w (N x nx)` and measurement noise
/// `v (N+1 x ny)`. Parameters `u (N x nu)`, `y (N+1 x ny)`, optionally
/// `p (N+1 x np)` and, with a prior, `x0bar (1 x nx)`. Constraints
/// `x[t+1] = f(x[t], u[t], p[t]) + w[t]` and `y[t] = h(x[t], p[t]) + v[t]`.
/// The cost is `sum l(w[t], v[t])`, with `w[N] = 0` in the final term, plus
/// `lx(x[0] - x0bar)` when a prior is set.
pub struct Nmhe {
    nx: usize,
    nu: usize,
    ny: usize,
    horizon: usize,
    model: Model,
    measurement: Measurement,
    stage_cost: EstimatorCost,
    prior: Option<(PriorCost, Vec<f64>)>,
    p: Option<Vec<f64>>,
    lb: FieldValues,
    ub: FieldValues,
    guess: FieldValues,
    options: SolverOptions,
}

impl Nmhe {
    pub fn new<F, H, L>(
        nx: usize,
        nu: usize,
        ny: usize,
        horizon: usize,
        model: F,
        measurement: H,
        stage_cost: L,
    ) -> Self
    where
        F: Fn(&[f64], &[f64], &[f64]) -> DVector<f64> + 'static,
        H: Fn(&[f64], &[f64]) -> DVector<f64> + 'static,
        L: Fn(&[f64], &[f64]) -> f64 + 'static,
    {
        Self {
            nx,
            nu,
            ny,
            horizon,
            model: Box::new(model),
            measurement: Box::new(measurement),
            stage_cost: Box::new(stage_cost),
            prior: None,
            p: None,
            lb: FieldValues::default(),
            ub: FieldValues::default(),
            guess: FieldValues::default(),
            options: SolverOptions::default(),
        }
    }

    /// Arrival cost `lx(x[0] - x0bar)`.
    pub fn prior<P>(mut self, cost: P, x0bar: Vec<f64>) -> Self
    where
        P: Fn(&[f64]) -> f64 + 'static,
    {
        self.prior = Some((Box::new(cost), x0bar));
        self
    }

    pub fn model_parameters(mut self, p: Vec<f64>) -> Self {
        self.p = Some(p);
        self
    }

    pub fn lb(mut self, lb: FieldValues) -> Self {
        self.lb = lb;
        self
    }

    pub fn ub(mut self, ub: FieldValues) -> Self {
        self.ub = ub;
        self
    }

    pub fn guess(mut self, guess: FieldValues) -> Self {
        self.guess = guess;
        self
    }

    pub fn options(mut self, options: SolverOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds the estimator. Input and measurement data start at zero and are
    /// updated through [`ControlSolver::par_mut`] before each solve.
    ///
    /// # Errors
    ///
    /// Same as [`Nmpc::build`].
    pub fn build(self) -> Result<ControlSolver> {
        let Nmhe {
            nx,
            nu,
            ny,
            horizon: n,
            model,
            measurement,
            stage_cost,
            prior,
            p,
            lb,
            ub,
            guess,
            options,
        } = self;
        let np = p.as_ref().map_or(0, Vec::len);
        let prior_dim = if prior.is_some() { nx } else { 0 };

        let var = Structure::new([("x", n + 1, nx), ("w", n, nx), ("v", n + 1, ny)])?;
        let par_structure = structure([
            ("u", n, nu),
            ("y", n + 1, ny),
            ("p", n + 1, np),
            ("x0bar", 1, prior_dim),
        ])?;

        let mut par = StructArray::zeros(&par_structure);
        if let Some(p) = &p {
            par.tile("p", p)?;
        }
        let prior = match prior {
            Some((cost, x0bar)) => {
                par.set("x0bar", 0, &x0bar)?;
                Some(cost)
            }
            None => None,
        };

        let mut initial = StructArray::zeros(&var);
        guess.apply_to(&mut initial)?;

        let m = n * nx + (n + 1) * ny;
        let zero_w = vec![0.0; nx];

        let objective = move |var: &StructView<'_>, par: &StructView<'_>| {
            let mut cost: f64 = (0..n).map(|t| stage_cost(var.get("w", t), var.get("v", t))).sum();
            cost += stage_cost(&zero_w, var.get("v", n));
            if let Some(lx) = &prior {
                let dx: Vec<f64> = var
                    .get("x", 0)
                    .iter()
                    .zip(par.get("x0bar", 0))
                    .map(|(x, xbar)| x - xbar)
                    .collect();
                cost += lx(&dx);
            }
            cost
        };

        let constraints = move |var: &StructView<'_>, par: &StructView<'_>| {
            let mut g = Vec::with_capacity(m);
            for t in 0..n {
                let mut next = model(var.get("x", t), entry(par, "u", t), entry(par, "p", t));
                add_noise(&mut next, var.get("w", t));
                push_difference(&mut g, var.get("x", t + 1), &next);
            }
            for t in 0..=n {
                let mut y = measurement(var.get("x", t), entry(par, "p", t));
                add_noise(&mut y, var.get("v", t));
                push_difference(&mut g, par.get("y", t), &y);
            }
            g
        };

        let session = ControlSolver::builder(&var, objective)
            .lb(bounds(&var, f64::NEG_INFINITY, &lb)?)
            .ub(bounds(&var, f64::INFINITY, &ub)?)
            .guess(initial)
            .constraints(constraints, vec![0.0; m], vec![0.0; m])
            .parameters(par)
            .options(options)
            .build()?;
        debug!("Built NMHE with horizon {n}, nx = {nx}, nu = {nu}, ny = {ny}, np = {np}");
        Ok(session)
    }
}

/// Arguments of the target-selection cost.
#[derive(Debug, Clone, Copy)]
pub struct Target<'a> {
    pub x: &'a [f64],
    pub y: &'a [f64],
    pub y_sp: &'a [f64],
    pub u: &'a [f64],
    pub u_sp: &'a [f64],
}

type TargetCost = Box<dyn Fn(&Target<'_>) -> f64>;

/// Steady-state target selection.
///
/// Variables `x (1 x nx)`, `u (1 x nu)` and `y (1 x ny)`. Parameters
/// `y_sp (1 x ny)`, `u_sp (1 x nu)` and optionally `p (1 x np)`. Steady state
/// is `x = f(x, u, p)` for a discrete model or `0 = f(x, u, p)` for a
/// continuous one, together with `y = h(x, p)`. The number of steady-state
/// equations follows the length of `f`; a continuous `f` shorter than `nx`
/// leaves the remaining states free, e.g. disturbance states.
pub struct SsTarg {
    nx: usize,
    nu: usize,
    ny: usize,
    model: Model,
    measurement: Measurement,
    cost: TargetCost,
    discrete: bool,
    p: Option<Vec<f64>>,
    setpoints: Option<(Vec<f64>, Vec<f64>)>,
    lb: FieldValues,
    ub: FieldValues,
    guess: FieldValues,
    options: SolverOptions,
}

impl SsTarg {
    pub fn new<F, H, C>(nx: usize, nu: usize, ny: usize, model: F, measurement: H, cost: C) -> Self
    where
        F: Fn(&[f64], &[f64], &[f64]) -> DVector<f64> + 'static,
        H: Fn(&[f64], &[f64]) -> DVector<f64> + 'static,
        C: Fn(&Target<'_>) -> f64 + 'static,
    {
        Self {
            nx,
            nu,
            ny,
            model: Box::new(model),
            measurement: Box::new(measurement),
            cost: Box::new(cost),
            discrete: true,
            p: None,
            setpoints: None,
            lb: FieldValues::default(),
            ub: FieldValues::default(),
            guess: FieldValues::default(),
            options: SolverOptions::default(),
        }
    }

    /// Treats the model as `dx/dt = f(x, u, p)`.
    pub fn continuous(mut self) -> Self {
        self.discrete = false;
        self
    }

    pub fn model_parameters(mut self, p: Vec<f64>) -> Self {
        self.p = Some(p);
        self
    }

    pub fn setpoints(mut self, y_sp: Vec<f64>, u_sp: Vec<f64>) -> Self {
        self.setpoints = Some((y_sp, u_sp));
        self
    }

    pub fn lb(mut self, lb: FieldValues) -> Self {
        self.lb = lb;
        self
    }

    pub fn ub(mut self, ub: FieldValues) -> Self {
        self.ub = ub;
        self
    }

    pub fn guess(mut self, guess: FieldValues) -> Self {
        self.guess = guess;
        self
    }

    pub fn options(mut self, options: SolverOptions) -> Self {
        self.options = options;
        self
    }

    /// # Errors
    ///
    /// Same as [`Nmpc::build`]; a discrete model must return `nx` values.
    pub fn build(self) -> Result<ControlSolver> {
        let SsTarg {
            nx,
            nu,
            ny,
            model,
            measurement,
            cost,
            discrete,
            p,
            setpoints,
            lb,
            ub,
            guess,
            options,
        } = self;
        let np = p.as_ref().map_or(0, Vec::len);

        let var = Structure::new([("x", 1, nx), ("u", 1, nu), ("y", 1, ny)])?;
        let par_structure = structure([("p", 1, np), ("y_sp", 1, ny), ("u_sp", 1, nu)])?;

        let mut par = StructArray::zeros(&par_structure);
        if let Some(p) = &p {
            par.set("p", 0, p)?;
        }
        if let Some((y_sp, u_sp)) = &setpoints {
            par.set("y_sp", 0, y_sp)?;
            par.set("u_sp", 0, u_sp)?;
        }

        let mut initial = StructArray::zeros(&var);
        guess.apply_to(&mut initial)?;

        // Number of steady-state equations, from the model at the guess.
        let nf = if discrete {
            nx
        } else {
            model(initial.get("x", 0), initial.get("u", 0), entry(&par.view(), "p", 0)).len()
        };
        let m = nf + ny;

        let objective = move |var: &StructView<'_>, par: &StructView<'_>| {
            cost(&Target {
                x: var.get("x", 0),
                y: var.get("y", 0),
                y_sp: par.get("y_sp", 0),
                u: var.get("u", 0),
                u_sp: par.get("u_sp", 0),
            })
        };

        let constraints = move |var: &StructView<'_>, par: &StructView<'_>| {
            let x = var.get("x", 0);
            let p = entry(par, "p", 0);
            let f = model(x, var.get("u", 0), p);
            let mut g = Vec::with_capacity(m);
            if discrete {
                push_difference(&mut g, x, &f);
            } else {
                g.extend(f.iter());
            }
            push_difference(&mut g, var.get("y", 0), &measurement(x, p));
            g
        };

        let session = ControlSolver::builder(&var, objective)
            .lb(bounds(&var, f64::NEG_INFINITY, &lb)?)
            .ub(bounds(&var, f64::INFINITY, &ub)?)
            .guess(initial)
            .constraints(constraints, vec![0.0; m], vec![0.0; m])
            .parameters(par)
            .options(options)
            .build()?;
        debug!(
            "Built steady-state target finder with nx = {nx}, nu = {nu}, ny = {ny}, \
             {nf} model equations"
        );
        Ok(session)
    }
}
