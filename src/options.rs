use crate::error::{Error, Result};

// Default settings
const DEFAULT_VERBOSITY: u8 = 5;
const MAX_VERBOSITY: u8 = 12;
const DEFAULT_TIME_LIMIT: f64 = 60.0;
const DEFAULT_MAX_ITER: usize = 3000;
const DEFAULT_MAX_OUTER_ITER: usize = 50;
const DEFAULT_TOL: f64 = 1e-6;
const DEFAULT_CONSTR_VIOL_TOL: f64 = 1e-6;
const DEFAULT_ACCEPTABLE_TOL: f64 = 1e-4;
const DEFAULT_MU_INIT: f64 = 10.0;
const DEFAULT_PENALTY_GROWTH: f64 = 5.0;

/// How derivatives of the objective and constraints are evaluated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvalMode {
    /// Element-wise central differences. Second-order accurate.
    #[default]
    Scalar,
    /// Forward differences. Half the function evaluations, first-order accurate.
    Matrix,
}

/// Solver settings, fixed when the solver instance is built.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverOptions {
    verbosity: u8,
    /// Time budget for one solve, in seconds.
    pub time_limit: f64,
    /// Treat the problem as a QP: the Hessian and constraint Jacobian are
    /// evaluated once at the start of each solve.
    pub is_qp: bool,
    pub eval_mode: EvalMode,
    /// Report NaN or Inf from a model as `NonIpopt_Exception_Thrown` instead
    /// of `Invalid_Number_Detected`.
    pub eval_errors_fatal: bool,
    /// Inner (PANOC) iterations per outer iteration.
    pub max_iter: usize,
    /// Outer (augmented Lagrangian) iterations.
    pub max_outer_iter: usize,
    pub tol: f64,
    pub constr_viol_tol: f64,
    pub acceptable_tol: f64,
    /// Initial penalty parameter.
    pub mu_init: f64,
    /// Factor applied to the penalty when the constraint violation stalls.
    pub penalty_growth: f64,
}

impl Default for SolverOptions {
    fn default() -> Self {
        Self {
            verbosity: DEFAULT_VERBOSITY,
            time_limit: DEFAULT_TIME_LIMIT,
            is_qp: false,
            eval_mode: EvalMode::default(),
            eval_errors_fatal: true,
            max_iter: DEFAULT_MAX_ITER,
            max_outer_iter: DEFAULT_MAX_OUTER_ITER,
            tol: DEFAULT_TOL,
            constr_viol_tol: DEFAULT_CONSTR_VIOL_TOL,
            acceptable_tol: DEFAULT_ACCEPTABLE_TOL,
            mu_init: DEFAULT_MU_INIT,
            penalty_growth: DEFAULT_PENALTY_GROWTH,
        }
    }
}

impl SolverOptions {
    pub fn verbosity(&self) -> u8 {
        self.verbosity
    }

    /// Sets the verbosity, clamped to `0..=12`.
    pub fn set_verbosity(&mut self, verbosity: i32) {
        self.verbosity = verbosity.clamp(0, i32::from(MAX_VERBOSITY)) as u8;
    }

    pub fn with_verbosity(mut self, verbosity: i32) -> Self {
        self.set_verbosity(verbosity);
        self
    }

    pub fn with_time_limit(mut self, seconds: f64) -> Self {
        self.time_limit = seconds;
        self
    }

    pub fn with_qp(mut self, is_qp: bool) -> Self {
        self.is_qp = is_qp;
        self
    }

    pub fn with_eval_mode(mut self, eval_mode: EvalMode) -> Self {
        self.eval_mode = eval_mode;
        self
    }

    pub fn with_eval_errors_fatal(mut self, fatal: bool) -> Self {
        self.eval_errors_fatal = fatal;
        self
    }

    pub fn with_max_iter(mut self, max_iter: usize) -> Self {
        self.max_iter = max_iter;
        self
    }

    /// Checks that tolerances and budgets are usable.
    ///
    /// # Errors
    ///
    /// Returns an error if a tolerance or the time limit is not finite and
    /// positive, or if the penalty schedule is inconsistent.
    pub fn validate(&self) -> Result<()> {
        let positive = |v: f64| v.is_finite() && v > 0.0;
        if self.time_limit.is_nan() || self.time_limit <= 0.0 {
            return Err(Error::InvalidOptions {
                reason: "time_limit must be positive",
            });
        }
        if !positive(self.tol) || !positive(self.constr_viol_tol) {
            return Err(Error::InvalidOptions {
                reason: "tolerances must be finite and positive",
            });
        }
        if !positive(self.acceptable_tol) || self.acceptable_tol < self.tol {
            return Err(Error::InvalidOptions {
                reason: "acceptable_tol must be finite and at least tol",
            });
        }
        if !positive(self.mu_init) || !positive(self.penalty_growth - 1.0) {
            return Err(Error::InvalidOptions {
                reason: "penalty must satisfy mu_init > 0 and penalty_growth > 1",
            });
        }
        if self.max_iter == 0 || self.max_outer_iter == 0 {
            return Err(Error::InvalidOptions {
                reason: "iteration budgets must be non-zero",
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_is_clamped() {
        let mut options = SolverOptions::default();
        assert_eq!(options.verbosity(), 5);
        options.set_verbosity(40);
        assert_eq!(options.verbosity(), 12);
        options.set_verbosity(-3);
        assert_eq!(options.verbosity(), 0);
    }

    #[test]
    fn defaults_are_valid() {
        assert!(SolverOptions::default().validate().is_ok());
        // An infinite budget means no time limit.
        assert!(
            SolverOptions::default()
                .with_time_limit(f64::INFINITY)
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn rejects_bad_settings() {
        let bad = SolverOptions::default().with_time_limit(0.0);
        assert!(bad.validate().is_err());
        let bad = SolverOptions::default().with_time_limit(f64::NAN);
        assert!(bad.validate().is_err());

        let bad = SolverOptions {
            tol: -1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = SolverOptions {
            penalty_growth: 1.0,
            ..Default::default()
        };
        assert!(bad.validate().is_err());

        let bad = SolverOptions::default().with_max_iter(0);
        assert!(bad.validate().is_err());
    }
}
