//! Local linear models and infinite-horizon LQR gains.
//!
//! Used to pick terminal weights and to inspect a plant around a steady
//! state. Pass a sampled model (see [`crate::discretize`]) to get the
//! discrete-time `A` and `B` matrices that [`dlqr`] expects.

use log::{debug, warn};
use nalgebra::{DMatrix, DVector};

use crate::derivatives;
use crate::error::{Error, Result};
use crate::options::EvalMode;

const RICCATI_MAX_ITER: usize = 10_000;
const RICCATI_TOL: f64 = 1e-10;

/// Jacobians of a model `f(x, u, p)` at one operating point.
#[derive(Debug, Clone, PartialEq)]
pub struct Linearization {
    /// `df/dx`, `nx x nx`
    pub a: DMatrix<f64>,
    /// `df/du`, `nx x nu`
    pub b: DMatrix<f64>,
}

/// Linearizes `f` around `(x, u)` with parameters held at `p`.
pub fn linearize<F>(f: F, x: &[f64], u: &[f64], p: &[f64]) -> Linearization
where
    F: Fn(&[f64], &[f64], &[f64]) -> DVector<f64>,
{
    let fx = f(x, u, p);
    let a = derivatives::jacobian(
        |x: &[f64]| f(x, u, p),
        x,
        &fx,
        &vec![false; x.len()],
        EvalMode::Scalar,
    );
    let b = derivatives::jacobian(
        |u: &[f64]| f(x, u, p),
        u,
        &fx,
        &vec![false; u.len()],
        EvalMode::Scalar,
    );
    Linearization { a, b }
}

/// Infinite-horizon discrete LQR solution.
#[derive(Debug, Clone, PartialEq)]
pub struct Lqr {
    /// Feedback gain for `u = -K x`
    pub k: DMatrix<f64>,
    /// Cost-to-go `x' P x`
    pub p: DMatrix<f64>,
}

/// Solves the discrete algebraic Riccati equation for `x+ = A x + B u` with
/// stage cost `x' Q x + u' R u` by backward recursion.
///
/// # Errors
///
/// Returns an error if the matrix dimensions disagree or `R + B' P B` becomes
/// singular.
pub fn dlqr(
    a: &DMatrix<f64>,
    b: &DMatrix<f64>,
    q: &DMatrix<f64>,
    r: &DMatrix<f64>,
) -> Result<Lqr> {
    let (nx, nu) = (a.nrows(), b.ncols());
    for (what, actual, expected) in [
        ("A columns", a.ncols(), nx),
        ("B rows", b.nrows(), nx),
        ("Q size", q.len(), nx * nx),
        ("R size", r.len(), nu * nu),
    ] {
        if actual != expected {
            return Err(Error::DimensionMismatch {
                what: what.into(),
                expected,
                actual,
            });
        }
    }

    let at = a.transpose();
    let bt = b.transpose();
    let mut p = q.clone();
    let mut k = DMatrix::zeros(nu, nx);
    for i in 0..RICCATI_MAX_ITER {
        let quu = r + &bt * &p * b;
        let quu_inv = quu
            .try_inverse()
            .ok_or(Error::Singular { what: "R + B' P B" })?;
        let k_next = quu_inv * &bt * &p * a;
        p = q + &at * &p * (a - b * &k_next);
        let change = (&k_next - &k).abs().max();
        k = k_next;
        if change < RICCATI_TOL {
            debug!("Riccati recursion converged after {} iterations", i + 1);
            return Ok(Lqr { k, p });
        }
    }
    warn!("Riccati recursion did not converge in {RICCATI_MAX_ITER} iterations");
    Ok(Lqr { k, p })
}
