//! Discretization and simulation of continuous-time models.

use nalgebra::DVector;

/// Continuous-time model `dx/dt = f(x, u, p)`.
pub trait Ode: Fn(&[f64], &[f64], &[f64]) -> DVector<f64> {}

impl<F> Ode for F where F: Fn(&[f64], &[f64], &[f64]) -> DVector<f64> {}

/// Integrates `f` over one interval of length `delta` with `substeps` steps of
/// the classical fourth-order Runge-Kutta method. Inputs and parameters are
/// held constant over the interval.
pub fn rk4<F>(f: &F, x: &[f64], u: &[f64], p: &[f64], delta: f64, substeps: usize) -> DVector<f64>
where
    F: Ode + ?Sized,
{
    let substeps = substeps.max(1);
    let h = delta / substeps as f64;
    let mut x = DVector::from_column_slice(x);
    for _ in 0..substeps {
        let k1 = f(x.as_slice(), u, p);
        let k2 = f((&x + &k1 * (h / 2.0)).as_slice(), u, p);
        let k3 = f((&x + &k2 * (h / 2.0)).as_slice(), u, p);
        let k4 = f((&x + &k3 * h).as_slice(), u, p);
        x += (k1 + k2 * 2.0 + k3 * 2.0 + k4) * (h / 6.0);
    }
    x
}

/// Turns a continuous-time model into its sampled counterpart
/// `x[t+1] = F(x[t], u[t], p[t])` using [`rk4`].
pub fn discretize<F>(
    f: F,
    delta: f64,
    substeps: usize,
) -> impl Fn(&[f64], &[f64], &[f64]) -> DVector<f64>
where
    F: Ode,
{
    move |x, u, p| rk4(&f, x, u, p, delta, substeps)
}

/// Default number of integrator steps per sample used by [`Simulator`].
const DEFAULT_SUBSTEPS: usize = 10;

/// One-step plant simulator for a continuous-time model.
pub struct Simulator<F> {
    ode: F,
    delta: f64,
    substeps: usize,
}

impl<F: Ode> Simulator<F> {
    pub fn new(ode: F, delta: f64) -> Self {
        Self {
            ode,
            delta,
            substeps: DEFAULT_SUBSTEPS,
        }
    }

    pub fn with_substeps(mut self, substeps: usize) -> Self {
        self.substeps = substeps.max(1);
        self
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    /// State after one sample period starting from `x` under `u` and `p`.
    pub fn sim(&self, x: &[f64], u: &[f64], p: &[f64]) -> DVector<f64> {
        rk4(&self.ode, x, u, p, self.delta, self.substeps)
    }
}
