use std::fmt;
use std::time::Instant;

use log::debug;
use nalgebra::{DMatrix, DVector};

use crate::error::{Error, Result};
use crate::options::SolverOptions;
use crate::problem::Nlp;
use crate::status::SolveStatus;

/// Named numeric input buffers of the solver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Input {
    /// Initial guess
    X0,
    /// Variable lower bounds
    Lbx,
    /// Variable upper bounds
    Ubx,
    /// Constraint lower bounds
    Lbg,
    /// Constraint upper bounds
    Ubg,
    /// Parameter values
    P,
}

impl Input {
    pub fn name(&self) -> &'static str {
        match self {
            Input::X0 => "x0",
            Input::Lbx => "lbx",
            Input::Ubx => "ubx",
            Input::Lbg => "lbg",
            Input::Ubg => "ubg",
            Input::P => "p",
        }
    }
}

impl fmt::Display for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of the last call to [`NlpSolver::evaluate`].
#[derive(Debug, Clone)]
pub struct NlpSolution {
    pub x: DVector<f64>,
    pub f: f64,
    pub g: DVector<f64>,
    /// Constraint multipliers
    pub lam_g: DVector<f64>,
    pub status: Option<SolveStatus>,
    pub iter: usize,
    /// Wall-clock seconds spent in the last solve
    pub t_wall: f64,
    /// Largest constraint violation at `x`
    pub constr_viol: f64,
    /// Fixed-point residual of the last inner problem
    pub dual_inf: f64,
}

/// Quadratic model of a QP, built at the start of a solve and dropped before
/// the next one.
#[derive(Debug, Clone)]
pub struct NlpCache {
    /// Expansion point
    pub x: DVector<f64>,
    pub grad_f: DVector<f64>,
    pub hess_f: DMatrix<f64>,
    pub jac_g: DMatrix<f64>,
}

/// Input buffers.
#[derive(Debug, Clone)]
pub struct NlpWorkspace {
    pub(crate) n: usize,
    pub(crate) m: usize,
    pub(crate) x0: DVector<f64>,
    pub(crate) lbx: DVector<f64>,
    pub(crate) ubx: DVector<f64>,
    pub(crate) lbg: DVector<f64>,
    pub(crate) ubg: DVector<f64>,
    pub(crate) p: DVector<f64>,
}

/// One NLP solver instance for a fixed problem shape.
///
/// Inputs are pushed with [`NlpSolver::set_input`], the problem is solved by
/// [`NlpSolver::evaluate`] and outputs are read from [`NlpSolver::solution`].
#[derive(Debug)]
pub struct NlpSolver {
    pub(crate) nlp: Nlp,
    pub(crate) settings: SolverOptions,
    pub(crate) cache: Option<NlpCache>,
    pub(crate) work: NlpWorkspace,
    pub(crate) solution: NlpSolution,
}

impl NlpSolver {
    /// Builds the solver instance. Bounds default to unbounded, the guess and
    /// parameters to zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid.
    pub fn new(nlp: Nlp, settings: SolverOptions) -> Result<Self> {
        settings.validate()?;

        let n = nlp.num_variables();
        let m = nlp.num_constraints();
        let np = nlp.num_parameters();

        let work = NlpWorkspace {
            n,
            m,
            x0: DVector::zeros(n),
            lbx: DVector::from_element(n, f64::NEG_INFINITY),
            ubx: DVector::from_element(n, f64::INFINITY),
            lbg: DVector::from_element(m, f64::NEG_INFINITY),
            ubg: DVector::from_element(m, f64::INFINITY),
            p: DVector::zeros(np),
        };
        let solution = NlpSolution {
            x: DVector::zeros(n),
            f: f64::NAN,
            g: DVector::zeros(m),
            lam_g: DVector::zeros(m),
            status: None,
            iter: 0,
            t_wall: 0.0,
            constr_viol: f64::NAN,
            dual_inf: f64::NAN,
        };

        debug!("Built NLP solver with {n} variables, {m} constraints and {np} parameters");

        Ok(Self {
            nlp,
            settings,
            cache: None,
            work,
            solution,
        })
    }

    fn buffer_mut(&mut self, input: Input) -> &mut DVector<f64> {
        match input {
            Input::X0 => &mut self.work.x0,
            Input::Lbx => &mut self.work.lbx,
            Input::Ubx => &mut self.work.ubx,
            Input::Lbg => &mut self.work.lbg,
            Input::Ubg => &mut self.work.ubg,
            Input::P => &mut self.work.p,
        }
    }

    /// Copies `values` into the named input buffer.
    ///
    /// # Errors
    ///
    /// Returns an error if `values` does not have the buffer's length.
    pub fn set_input(&mut self, input: Input, values: &[f64]) -> Result<()> {
        let buffer = self.buffer_mut(input);
        if buffer.len() != values.len() {
            return Err(Error::DimensionMismatch {
                what: format!("input `{input}`"),
                expected: buffer.len(),
                actual: values.len(),
            });
        }
        buffer.copy_from_slice(values);
        Ok(())
    }

    /// Same as [`NlpSolver::set_input`] for callers whose structures already
    /// guarantee the length.
    pub(crate) fn load_input(&mut self, input: Input, values: &[f64]) {
        self.buffer_mut(input).copy_from_slice(values);
    }

    pub fn input(&self, input: Input) -> &DVector<f64> {
        match input {
            Input::X0 => &self.work.x0,
            Input::Lbx => &self.work.lbx,
            Input::Ubx => &self.work.ubx,
            Input::Lbg => &self.work.lbg,
            Input::Ubg => &self.work.ubg,
            Input::P => &self.work.p,
        }
    }

    pub fn nlp(&self) -> &Nlp {
        &self.nlp
    }

    pub fn settings(&self) -> &SolverOptions {
        &self.settings
    }

    /// Replaces the settings.
    ///
    /// # Errors
    ///
    /// Returns an error if the options are invalid; the solver keeps its
    /// previous settings in that case.
    pub fn configure(&mut self, settings: SolverOptions) -> Result<()> {
        settings.validate()?;
        self.settings = settings;
        Ok(())
    }

    /// Solves the problem with the current inputs. Blocks until the solver
    /// terminates; the outcome is reported in the solution status.
    pub fn evaluate(&mut self) -> SolveStatus {
        let started = Instant::now();
        let status = self.alm_solve(started);
        self.solution.status = Some(status);
        self.solution.t_wall = started.elapsed().as_secs_f64();
        debug!(
            "NLP solve finished with {status} after {} iterations in {:.3e} s",
            self.solution.iter, self.solution.t_wall
        );
        status
    }

    pub fn solution(&self) -> &NlpSolution {
        &self.solution
    }

    pub fn status(&self) -> Option<SolveStatus> {
        self.solution.status
    }
}
