use std::f64::consts::PI;

use log::{debug, info, warn};
use mpctools::{
    FieldValues, Nmhe, Nmpc, Simulator, SolverOptions, SsTarg, StructArray, discretize, dlqr,
    linearize,
};
use nalgebra::{DMatrix, DVector, dvector};

const NX: usize = 3;
const NU: usize = 2;
const NY: usize = NX;
const NF: usize = 10;
const NMHE: usize = 5;
const NSIM: usize = 40;
const DELTA: f64 = 1.0;

// Model parameters
const T0: f64 = 350.0;
const C0: f64 = 1.0;
const R: f64 = 0.219;
const K0: f64 = 7.2e10;
const E: f64 = 8750.0;
const U: f64 = 54.94;
const RHO: f64 = 1000.0;
const CP: f64 = 0.239;
const DH: f64 = -5e4;

/// States `[c, T, h]`, inputs `[Tc, F]`, disturbance `[F0]`.
fn ode(x: &[f64], u: &[f64], d: &[f64]) -> DVector<f64> {
    let (c, t, h) = (x[0], x[1], x[2]);
    let (tc, f) = (u[0], u[1]);
    let f0 = d[0];
    let rate = K0 * c * (-E / t).exp();
    let area = PI * R * R;
    dvector![
        f0 * (C0 - c) / (area * h) - rate,
        f0 * (T0 - t) / (area * h) - DH / (RHO * CP) * rate + 2.0 * U / (R * RHO * CP) * (tc - t),
        (f0 - f) / area
    ]
}

fn measurement(x: &[f64], _: &[f64]) -> DVector<f64> {
    DVector::from_column_slice(x)
}

#[rustfmt::skip]
const Q: [f64; NX] = [ 1e3, 0.0, 1e3];

#[rustfmt::skip]
const RU: [f64; NU] = [1e-3, 1.0];

#[rustfmt::skip]
const U_MIN: [f64; NU] = [299.2, 0.095];

#[rustfmt::skip]
const U_MAX: [f64; NU] = [300.8, 0.120];

#[rustfmt::skip]
const DU_MAX: [f64; NU] = [0.5, 0.005];

// Inverse noise variances for the estimator
#[rustfmt::skip]
const W_INV: [f64; NX] = [1e4, 1.0, 1e4];

#[rustfmt::skip]
const V_INV: [f64; NY] = [1e4, 1.0, 1e4];

#[rustfmt::skip]
const NOISE: [f64; NY] = [5e-4, 0.05, 5e-4];

/// Deterministic sensor noise so runs are reproducible.
fn measure(x: &DVector<f64>, k: usize) -> Vec<f64> {
    (0..NY)
        .map(|i| x[i] + NOISE[i] * ((k * (i + 2)) as f64 * 1.7).sin())
        .collect()
}

/// Drops the oldest entry of a data window and appends `newest`.
fn shift_in(par: &mut StructArray, name: &str, newest: &[f64]) -> mpctools::Result<()> {
    let len = par.len(name)?;
    for t in 1..len {
        let next = par[(name, t)].to_vec();
        par.set(name, t - 1, &next)?;
    }
    par.set(name, len - 1, newest)
}

fn main() -> mpctools::Result<()> {
    env_logger::init();

    let cstr = Simulator::new(ode, DELTA);
    let us = vec![300.0, 0.1];
    let ds = vec![0.1];

    // Settle the nominal steady state.
    let mut xs = dvector![0.878, 324.5, 0.659];
    for _ in 0..10 {
        xs = cstr.sim(xs.as_slice(), &us, &ds);
    }
    info!("Steady state: c = {:.6}, T = {:.3}, h = {:.4}", xs[0], xs[1], xs[2]);

    let mut target = SsTarg::new(NX, NU, NY, ode, measurement, |t| {
        let dy0 = t.y[0] - t.y_sp[0];
        let dy2 = t.y[2] - t.y_sp[2];
        dy0 * dy0 * Q[0] + dy2 * dy2 * Q[2]
            + (0..NU).map(|i| 1e-6 * (t.u[i] - t.u_sp[i]).powi(2)).sum::<f64>()
    })
    .continuous()
    .model_parameters(ds.clone())
    .setpoints(xs.as_slice().to_vec(), us.clone())
    .lb(FieldValues::new().with("u", U_MIN))
    .ub(FieldValues::new().with("u", U_MAX))
    .guess(
        FieldValues::new()
            .with("x", xs.as_slice())
            .with("y", xs.as_slice())
            .with("u", us.as_slice()),
    )
    .options(SolverOptions::default().with_verbosity(0))
    .build()?;

    // Terminal weight from the LQR cost-to-go around the nominal steady state.
    let lin = linearize(discretize(ode, DELTA, 2), xs.as_slice(), &us, &ds);
    let q = DMatrix::from_diagonal(&DVector::from_vec(Q.to_vec()));
    let r = DMatrix::from_diagonal(&DVector::from_vec(RU.to_vec())) * 0.1;
    let lqr = dlqr(&lin.a, &lin.b, &q, &r)?;
    debug!("Terminal weight P = {}", lqr.p);
    let pf = lqr.p;

    let mut controller = Nmpc::new(NX, NU, NF, discretize(ode, DELTA, 2), |s| {
        let dx: f64 = (0..NX).map(|i| Q[i] * (s.x[i] - s.x_sp[i]).powi(2)).sum();
        let du: f64 = (0..NU).map(|i| RU[i] * (s.u[i] - s.u_sp[i]).powi(2)).sum();
        dx + 0.1 * du
    })
    .terminal_cost(move |x, x_sp| {
        let dx = DVector::from_iterator(NX, x.iter().zip(x_sp).map(|(a, b)| a - b));
        dx.dot(&(&pf * &dx))
    })
    .model_parameters(ds.clone())
    .setpoints(xs.as_slice().to_vec(), us.clone())
    .x0(xs.as_slice().to_vec())
    .u_prev(us.clone())
    .rate_limits(DU_MAX.iter().map(|v| -v).collect(), DU_MAX.to_vec())
    .lb(FieldValues::new().with("u", U_MIN))
    .ub(FieldValues::new().with("u", U_MAX))
    .guess(FieldValues::new().with("x", xs.as_slice()).with("u", us.as_slice()))
    .options(SolverOptions::default().with_verbosity(0).with_time_limit(30.0))
    .build()?;

    let mut estimator = Nmhe::new(
        NX,
        NU,
        NY,
        NMHE,
        discretize(ode, DELTA, 2),
        measurement,
        |w, v| {
            let process: f64 = (0..NX).map(|i| W_INV[i] * w[i] * w[i]).sum();
            let sensor: f64 = (0..NY).map(|i| V_INV[i] * v[i] * v[i]).sum();
            process + sensor
        },
    )
    .prior(
        |dx| (0..NX).map(|i| 0.1 * W_INV[i] * dx[i] * dx[i]).sum(),
        xs.as_slice().to_vec(),
    )
    .model_parameters(ds.clone())
    .guess(FieldValues::new().with("x", xs.as_slice()))
    .options(SolverOptions::default().with_verbosity(0))
    .build()?;
    // The data windows start at the nominal steady state.
    if let Some(par) = estimator.par_mut() {
        par.tile("y", xs.as_slice())?;
        par.tile("u", &us)?;
    }

    let mut x = xs.clone();
    let mut xhat = xs.as_slice().to_vec();
    let mut u = us.clone();
    let mut ysp = xs.as_slice().to_vec();
    for k in 0..NSIM {
        // Raise the level setpoint after a while.
        if k == 10 {
            ysp[2] = 0.70;
            info!("Level setpoint changed to {:.3}", ysp[2]);
        }

        // 1、 Estimate the state from the latest measurement window
        let y = measure(&x, k);
        if let Some(par) = estimator.par_mut() {
            shift_in(par, "y", &y)?;
            if k > 0 {
                shift_in(par, "u", &u)?;
            }
        }
        let status = estimator.solve();
        if status.is_success() {
            xhat = estimator.var()[("x", NMHE)].to_vec();
            let next_prior = estimator.var()[("x", 1)].to_vec();
            if let Some(par) = estimator.par_mut() {
                par.set("x0bar", 0, &next_prior)?;
            }
        } else {
            warn!("Estimator returned {status}, keeping the last estimate");
        }
        estimator.saveguess();
        debug!("Estimator: {status}, xhat = {xhat:?}");

        // 2、 Find the steady-state target for the current setpoint
        if let Some(par) = target.par_mut() {
            par.set("y_sp", 0, &ysp)?;
            par.set("u_sp", 0, &u)?;
        }
        target.guess_mut().set("u", 0, &u)?;
        let status = target.solve();
        if !status.is_success() {
            warn!("Target finder returned {status}");
        }
        let xss = target.var()[("x", 0)].to_vec();
        let uss = target.var()[("u", 0)].to_vec();
        debug!("Target: {status} (obj {:.5}), xss = {xss:?}, uss = {uss:?}", target.obj());

        // 3、 Pin the estimated state and solve the controller
        if let Some(par) = controller.par_mut() {
            par.tile("x_sp", &xss)?;
            par.tile("u_sp", &uss)?;
            par.set("u_prev", 0, &u)?;
        }
        controller.fixvar("x", 0, &xhat)?;
        let status = controller.solve();
        if !status.is_success() {
            warn!("Controller returned {status}, keeping the last input");
        } else {
            u = controller.var()[("u", 0)].to_vec();
        }
        debug!("Controller: {status} (obj {:.5})", controller.obj());

        // 4、 Warm start the next period and advance the plant
        controller.saveguess();
        x = cstr.sim(x.as_slice(), &u, &ds);
        info!(
            "k = {k:3}: c = {:.5}, T = {:.3}, h = {:.4}, Tc = {:.3}, F = {:.4}, h_hat = {:.4}",
            x[0], x[1], x[2], u[0], u[1], xhat[2]
        );
    }

    println!("Final level {:.4} (setpoint {:.3})", x[2], ysp[2]);
    Ok(())
}
