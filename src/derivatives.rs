//! Finite-difference derivatives.
//!
//! Components marked as fixed are never perturbed and get zero derivative
//! entries. Callers check the results for non-finite values.

use nalgebra::{DMatrix, DVector};

use crate::options::EvalMode;

fn step(x: f64, base: f64) -> f64 {
    base * x.abs().max(1.0)
}

fn first_order_base(mode: EvalMode) -> f64 {
    match mode {
        EvalMode::Scalar => f64::EPSILON.cbrt(),
        EvalMode::Matrix => f64::EPSILON.sqrt(),
    }
}

/// Gradient of a scalar function; `fx` is `f(x)`.
pub fn gradient<F>(
    f: F,
    x: &[f64],
    fx: f64,
    fixed: &[bool],
    mode: EvalMode,
) -> DVector<f64>
where
    F: Fn(&[f64]) -> f64,
{
    let base = first_order_base(mode);
    let mut xw = x.to_vec();
    let mut grad = DVector::zeros(x.len());
    for j in (0..x.len()).filter(|&j| !fixed[j]) {
        let h = step(x[j], base);
        xw[j] = x[j] + h;
        let fp = f(&xw);
        grad[j] = match mode {
            EvalMode::Scalar => {
                xw[j] = x[j] - h;
                (fp - f(&xw)) / (2.0 * h)
            }
            EvalMode::Matrix => (fp - fx) / h,
        };
        xw[j] = x[j];
    }
    grad
}

/// Jacobian (`m x n`) of a vector function; `gx` is `g(x)`.
pub fn jacobian<G>(
    g: G,
    x: &[f64],
    gx: &DVector<f64>,
    fixed: &[bool],
    mode: EvalMode,
) -> DMatrix<f64>
where
    G: Fn(&[f64]) -> DVector<f64>,
{
    let base = first_order_base(mode);
    let mut xw = x.to_vec();
    let mut jac = DMatrix::zeros(gx.len(), x.len());
    for j in (0..x.len()).filter(|&j| !fixed[j]) {
        let h = step(x[j], base);
        xw[j] = x[j] + h;
        let gp = g(&xw);
        let column = match mode {
            EvalMode::Scalar => {
                xw[j] = x[j] - h;
                (gp - g(&xw)) / (2.0 * h)
            }
            EvalMode::Matrix => (gp - gx) / h,
        };
        jac.set_column(j, &column);
        xw[j] = x[j];
    }
    jac
}

/// Symmetric Hessian from a gradient function; `gx` is `grad(x)`.
///
/// The gradient is itself usually a finite difference, so the outer step is
/// larger than the one used for first derivatives.
pub fn hessian<G>(
    grad: G,
    x: &[f64],
    gx: &DVector<f64>,
    fixed: &[bool],
    mode: EvalMode,
) -> DMatrix<f64>
where
    G: Fn(&[f64]) -> DVector<f64>,
{
    let base = match mode {
        EvalMode::Scalar => f64::EPSILON.powf(0.25),
        EvalMode::Matrix => f64::EPSILON.cbrt(),
    };
    let mut xw = x.to_vec();
    let mut hess = DMatrix::zeros(x.len(), x.len());
    for j in (0..x.len()).filter(|&j| !fixed[j]) {
        let h = step(x[j], base);
        xw[j] = x[j] + h;
        let gp = grad(&xw);
        let column = match mode {
            EvalMode::Scalar => {
                xw[j] = x[j] - h;
                (gp - grad(&xw)) / (2.0 * h)
            }
            EvalMode::Matrix => (gp - gx) / h,
        };
        hess.set_column(j, &column);
        xw[j] = x[j];
    }
    // Rows of fixed components are zeroed so the result stays symmetric.
    for (i, _) in fixed.iter().enumerate().filter(|(_, f)| **f) {
        hess.row_mut(i).fill(0.0);
    }
    (&hess + hess.transpose()) * 0.5
}

#[cfg(test)]
mod tests {
    use super::*;

    use approx::assert_abs_diff_eq;
    use nalgebra::dvector;

    fn rosenbrock(x: &[f64]) -> f64 {
        (1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0] * x[0]).powi(2)
    }

    #[test]
    fn gradient_matches_analytic() {
        let x = [0.5, -0.3];
        let exact = [
            -2.0 * (1.0 - x[0]) - 400.0 * x[0] * (x[1] - x[0] * x[0]),
            200.0 * (x[1] - x[0] * x[0]),
        ];
        let fx = rosenbrock(&x);
        for (mode, eps) in [(EvalMode::Scalar, 1e-7), (EvalMode::Matrix, 1e-4)] {
            let g = gradient(rosenbrock, &x, fx, &[false, false], mode);
            assert_abs_diff_eq!(g[0], exact[0], epsilon = eps);
            assert_abs_diff_eq!(g[1], exact[1], epsilon = eps);
        }
    }

    #[test]
    fn fixed_components_are_skipped() {
        let x = [1.0, 2.0];
        let g = gradient(|x| x[0] * x[1], &x, 2.0, &[true, false], EvalMode::Scalar);
        assert_eq!(g[0], 0.0);
        assert_abs_diff_eq!(g[1], 1.0, epsilon = 1e-9);
    }

    #[test]
    fn jacobian_of_linear_map() {
        let g = |x: &[f64]| dvector![x[0] + 2.0 * x[1], -x[1], 3.0 * x[0]];
        let x = [0.3, 0.7];
        let jac = jacobian(g, &x, &g(&x), &[false, false], EvalMode::Scalar);
        let exact = DMatrix::from_row_slice(3, 2, &[1.0, 2.0, 0.0, -1.0, 3.0, 0.0]);
        assert_abs_diff_eq!(jac, exact, epsilon = 1e-9);
    }

    #[test]
    fn hessian_of_quadratic() {
        // f = x0^2 + 3 x0 x1 + 2 x1^2
        let grad = |x: &[f64]| dvector![2.0 * x[0] + 3.0 * x[1], 3.0 * x[0] + 4.0 * x[1]];
        let x = [1.0, -1.0];
        let hess = hessian(grad, &x, &grad(&x), &[false, false], EvalMode::Scalar);
        let exact = DMatrix::from_row_slice(2, 2, &[2.0, 3.0, 3.0, 4.0]);
        assert_abs_diff_eq!(hess, exact, epsilon = 1e-8);

        let hess = hessian(grad, &x, &grad(&x), &[false, true], EvalMode::Scalar);
        assert_abs_diff_eq!(hess[(0, 0)], 2.0, epsilon = 1e-8);
        assert_eq!(hess[(1, 1)], 0.0);
        assert_eq!(hess[(0, 1)], hess[(1, 0)]);
    }
}
