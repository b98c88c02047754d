//! Solve step on top of `optimization_engine`.
//!
//! Variable bounds are the set `U` the inner PANOC iterations project onto.
//! Constraints enter the augmented Lagrangian as the mapping `F1 = g` with the
//! box `C = [lbg, ubg]`. Problems without constraints go straight to PANOC.

use std::time::{Duration, Instant};

use log::{debug, warn};
use nalgebra::DVector;
use optimization_engine::alm::{
    AlmCache, AlmFactory, AlmOptimizer, AlmProblem, NO_JACOBIAN_MAPPING, NO_MAPPING,
};
use optimization_engine::constraints::{BallInf, Rectangle};
use optimization_engine::core::ExitStatus;
use optimization_engine::panoc::{PANOCCache, PANOCOptimizer};
use optimization_engine::{Optimizer, Problem, SolverError};

use crate::derivatives;
use crate::nlpsol::{NlpCache, NlpSolution, NlpSolver, NlpWorkspace};
use crate::options::{EvalMode, SolverOptions};
use crate::problem::Nlp;
use crate::status::SolveStatus;

const LBFGS_MEMORY: usize = 10;
const INITIAL_INNER_TOL: f64 = 1e-1;
/// Half-width of the box the Lagrange multipliers are kept in.
const MULTIPLIER_BOUND: f64 = 1e12;

/// Problem functions at fixed parameter values, in the callback form the
/// optimizer expects.
struct Oracle<'a> {
    nlp: &'a Nlp,
    p: &'a [f64],
    m: usize,
    mode: EvalMode,
    fixed: Vec<bool>,
    qp: Option<&'a NlpCache>,
}

/// What the optimizer reported, independent of the method used.
struct Outcome {
    exit: ExitStatus,
    iterations: usize,
    fpr: f64,
    multipliers: Option<Vec<f64>>,
}

fn write_finite(values: &DVector<f64>, out: &mut [f64]) -> Result<(), SolverError> {
    if all_finite(values.iter()) {
        out.copy_from_slice(values.as_slice());
        Ok(())
    } else {
        Err(SolverError::NotFiniteComputation)
    }
}

impl Oracle<'_> {
    fn f(&self, x: &[f64]) -> f64 {
        self.nlp.objective(x, self.p)
    }

    /// A constraint vector of the wrong length is reported as non-finite.
    fn g(&self, x: &[f64]) -> DVector<f64> {
        let g = self.nlp.constraints(x, self.p);
        if g.len() == self.m {
            DVector::from_vec(g)
        } else {
            warn!(
                "Constraint function returned {} values, expected {}",
                g.len(),
                self.m
            );
            DVector::from_element(self.m, f64::NAN)
        }
    }

    fn numeric_gradient(&self, x: &[f64]) -> DVector<f64> {
        derivatives::gradient(|y| self.f(y), x, self.f(x), &self.fixed, self.mode)
    }

    fn cost(&self, u: &[f64], cost: &mut f64) -> Result<(), SolverError> {
        let f = self.f(u);
        if !f.is_finite() {
            return Err(SolverError::NotFiniteComputation);
        }
        *cost = f;
        Ok(())
    }

    fn gradient(&self, u: &[f64], grad: &mut [f64]) -> Result<(), SolverError> {
        let df = match self.qp {
            Some(qp) => &qp.grad_f + &qp.hess_f * (DVector::from_column_slice(u) - &qp.x),
            None => self.numeric_gradient(u),
        };
        write_finite(&df, grad)
    }

    fn constraints(&self, u: &[f64], g: &mut [f64]) -> Result<(), SolverError> {
        write_finite(&self.g(u), g)
    }

    /// `Jg(u)^T d`, as the gradient of `u -> d' g(u)` unless the Jacobian is
    /// cached.
    fn constraints_jacobian_t(
        &self,
        u: &[f64],
        d: &[f64],
        out: &mut [f64],
    ) -> Result<(), SolverError> {
        let d = DVector::from_column_slice(d);
        let jtd = match self.qp {
            Some(qp) => qp.jac_g.tr_mul(&d),
            None => {
                let weighted = |x: &[f64]| self.g(x).dot(&d);
                derivatives::gradient(weighted, u, weighted(u), &self.fixed, self.mode)
            }
        };
        write_finite(&jtd, out)
    }

    /// Quadratic model of the problem around `x`.
    fn qp_model(&self, x: &[f64], g: &DVector<f64>) -> NlpCache {
        let grad = |y: &[f64]| self.numeric_gradient(y);
        let grad_f = grad(x);
        NlpCache {
            x: DVector::from_column_slice(x),
            hess_f: derivatives::hessian(grad, x, &grad_f, &self.fixed, self.mode),
            jac_g: derivatives::jacobian(|y| self.g(y), x, g, &self.fixed, self.mode),
            grad_f,
        }
    }

    fn run_panoc(
        &self,
        settings: &SolverOptions,
        budget: Option<Duration>,
        work: &NlpWorkspace,
        u: &mut [f64],
    ) -> Result<Outcome, SolverError> {
        let bounds = Rectangle::new(Some(work.lbx.as_slice()), Some(work.ubx.as_slice()));
        let df = |u: &[f64], grad: &mut [f64]| self.gradient(u, grad);
        let f = |u: &[f64], cost: &mut f64| self.cost(u, cost);
        let problem = Problem::new(&bounds, df, f);

        let mut cache = PANOCCache::new(work.n, settings.tol, LBFGS_MEMORY);
        let mut panoc = PANOCOptimizer::new(problem, &mut cache).with_max_iter(settings.max_iter);
        if let Some(budget) = budget {
            panoc = panoc.with_max_duration(budget);
        }
        let status = panoc.solve(u)?;

        Ok(Outcome {
            exit: status.exit_status(),
            iterations: status.iterations(),
            fpr: status.norm_fpr(),
            multipliers: None,
        })
    }

    fn run_alm(
        &self,
        settings: &SolverOptions,
        budget: Option<Duration>,
        work: &NlpWorkspace,
        u: &mut [f64],
    ) -> Result<Outcome, SolverError> {
        let (lbg, ubg) = (work.lbg.as_slice(), work.ubg.as_slice());
        let f = |u: &[f64], cost: &mut f64| self.cost(u, cost);
        let df = |u: &[f64], grad: &mut [f64]| self.gradient(u, grad);
        let f1 = |u: &[f64], g: &mut [f64]| self.constraints(u, g);
        let jf1t = |u: &[f64], d: &[f64], out: &mut [f64]| {
            self.constraints_jacobian_t(u, d, out)
        };

        let factory = AlmFactory::new(
            f,
            df,
            Some(f1),
            Some(jf1t),
            NO_MAPPING,
            NO_JACOBIAN_MAPPING,
            Some(Rectangle::new(Some(lbg), Some(ubg))),
            0,
        );
        let problem = AlmProblem::new(
            Rectangle::new(Some(work.lbx.as_slice()), Some(work.ubx.as_slice())),
            Some(Rectangle::new(Some(lbg), Some(ubg))),
            Some(BallInf::new(None, MULTIPLIER_BOUND)),
            |u: &[f64], xi: &[f64], cost: &mut f64| factory.psi(u, xi, cost),
            |u: &[f64], xi: &[f64], grad: &mut [f64]| factory.d_psi(u, xi, grad),
            Some(f1),
            NO_MAPPING,
            self.m,
            0,
        );

        let panoc_cache = PANOCCache::new(work.n, settings.tol, LBFGS_MEMORY);
        let mut cache = AlmCache::new(panoc_cache, self.m, 0);
        let mut alm = AlmOptimizer::new(&mut cache, problem)
            .with_delta_tolerance(settings.constr_viol_tol)
            .with_epsilon_tolerance(settings.tol)
            .with_initial_inner_tolerance(settings.tol.max(INITIAL_INNER_TOL))
            .with_initial_penalty(settings.mu_init)
            .with_penalty_update_factor(settings.penalty_growth)
            .with_max_outer_iterations(settings.max_outer_iter)
            .with_max_inner_iterations(settings.max_iter);
        if let Some(budget) = budget {
            alm = alm.with_max_duration(budget);
        }
        let status = alm.solve(u)?;
        debug!("ALM: {} outer iterations", status.num_outer_iterations());

        Ok(Outcome {
            exit: status.exit_status(),
            iterations: status.num_inner_iterations(),
            fpr: status.last_problem_norm_fpr(),
            multipliers: status.lagrange_multipliers().clone(),
        })
    }
}

fn all_finite<'a>(values: impl IntoIterator<Item = &'a f64>) -> bool {
    values.into_iter().all(|v| v.is_finite())
}

/// Some lower bound lies above its upper bound.
fn inconsistent(lb: &DVector<f64>, ub: &DVector<f64>) -> bool {
    lb.iter().zip(ub.iter()).any(|(lo, hi)| lo > hi)
}

fn project(x: &mut DVector<f64>, lbx: &DVector<f64>, ubx: &DVector<f64>) {
    for i in 0..x.len() {
        x[i] = x[i].max(lbx[i]).min(ubx[i]);
    }
}

fn violation(g: &DVector<f64>, lbg: &DVector<f64>, ubg: &DVector<f64>) -> f64 {
    (0..g.len())
        .map(|i| (lbg[i] - g[i]).max(g[i] - ubg[i]).max(0.0))
        .fold(0.0, f64::max)
}

/// Remaining time budget; `None` means unlimited.
fn time_budget(settings: &SolverOptions, started: Instant) -> Option<Duration> {
    settings.time_limit.is_finite().then(|| {
        let left = settings.time_limit - started.elapsed().as_secs_f64();
        Duration::from_secs_f64(left.max(0.0))
    })
}

fn classify(outcome: &Outcome, viol: f64, settings: &SolverOptions) -> SolveStatus {
    let acceptable = viol <= settings.acceptable_tol && outcome.fpr <= settings.acceptable_tol;
    match outcome.exit {
        ExitStatus::Converged if viol <= settings.constr_viol_tol => SolveStatus::SolveSucceeded,
        ExitStatus::Converged | ExitStatus::NotConvergedIterations if acceptable => {
            SolveStatus::SolvedToAcceptableLevel
        }
        ExitStatus::Converged => SolveStatus::InfeasibleProblemDetected,
        ExitStatus::NotConvergedIterations => SolveStatus::MaximumIterationsExceeded,
        ExitStatus::NotConvergedOutOfTime => SolveStatus::MaximumCpuTimeExceeded,
    }
}

fn record(
    solution: &mut NlpSolution,
    work: &NlpWorkspace,
    x: DVector<f64>,
    f: f64,
    g: DVector<f64>,
    outcome: Option<&Outcome>,
) {
    solution.constr_viol = violation(&g, &work.lbg, &work.ubg);
    solution.x = x;
    solution.f = f;
    solution.g = g;
    solution.lam_g = match outcome.and_then(|o| o.multipliers.as_deref()) {
        Some(y) if y.len() == work.m => DVector::from_column_slice(y),
        _ => DVector::zeros(work.m),
    };
    solution.iter = outcome.map_or(0, |o| o.iterations);
    solution.dual_inf = outcome.map_or(f64::NAN, |o| o.fpr);
}

impl NlpSolver {
    /// Runs the optimizer from the current inputs and records the final
    /// iterate in the solution.
    pub(crate) fn alm_solve(&mut self, started: Instant) -> SolveStatus {
        let NlpSolver {
            nlp,
            settings,
            cache,
            work,
            solution,
        } = self;
        // Parameters may have changed since the last solve.
        *cache = None;

        let failure = if settings.eval_errors_fatal {
            SolveStatus::EvaluationError
        } else {
            SolveStatus::InvalidNumberDetected
        };
        let bad_bounds = inconsistent(&work.lbx, &work.ubx) || inconsistent(&work.lbg, &work.ubg);

        let mut oracle = Oracle {
            nlp: &*nlp,
            p: work.p.as_slice(),
            m: work.m,
            mode: settings.eval_mode,
            fixed: work.lbx.iter().zip(work.ubx.iter()).map(|(lo, hi)| lo == hi).collect(),
            qp: None,
        };

        let mut x = work.x0.clone();
        if !bad_bounds {
            project(&mut x, &work.lbx, &work.ubx);
        }
        let f0 = oracle.f(x.as_slice());
        let g0 = oracle.g(x.as_slice());

        if bad_bounds {
            debug!("Variable or constraint bounds are inconsistent");
            record(solution, work, x, f0, g0, None);
            return SolveStatus::InfeasibleProblemDetected;
        }
        if !f0.is_finite() || !all_finite(g0.iter()) {
            warn!("Model evaluation at the initial point is not finite");
            record(solution, work, x, f0, g0, None);
            return failure;
        }

        if settings.is_qp {
            let model = oracle.qp_model(x.as_slice(), &g0);
            let finite = all_finite(model.grad_f.iter())
                && all_finite(model.hess_f.iter())
                && all_finite(model.jac_g.iter());
            if !finite {
                warn!("QP derivatives at the initial point are not finite");
                record(solution, work, x, f0, g0, None);
                return failure;
            }
            *cache = Some(model);
        }
        oracle.qp = cache.as_ref();

        let budget = time_budget(settings, started);
        let outcome = if work.m == 0 {
            oracle.run_panoc(settings, budget, work, x.as_mut_slice())
        } else {
            oracle.run_alm(settings, budget, work, x.as_mut_slice())
        };

        // Fixed components come back exactly at their bound.
        project(&mut x, &work.lbx, &work.ubx);
        let f = oracle.f(x.as_slice());
        let g = oracle.g(x.as_slice());

        match outcome {
            Ok(outcome) => {
                let viol = violation(&g, &work.lbg, &work.ubg);
                let status = classify(&outcome, viol, settings);
                debug!(
                    "Optimizer: {} iterations, fpr {:.3e}, violation {viol:.3e}",
                    outcome.iterations, outcome.fpr
                );
                record(solution, work, x, f, g, Some(&outcome));
                status
            }
            Err(err) => {
                warn!("Optimizer stopped on {err:?}");
                record(solution, work, x, f, g, None);
                failure
            }
        }
    }
}
