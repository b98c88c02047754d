use log::{debug, info, warn};
use mpctools::{FieldValues, Nmpc, Simulator, SolverOptions, discretize};
use nalgebra::{DVector, dvector};

const NX: usize = 2;
const NU: usize = 1;
const NT: usize = 20;
const NSIM: usize = 20;
const DELTA: f64 = 0.5;

fn ode(x: &[f64], u: &[f64], _: &[f64]) -> DVector<f64> {
    dvector![(1.0 - x[1] * x[1]) * x[0] - x[1] + u[0], x[0]]
}

fn main() -> mpctools::Result<()> {
    env_logger::init();

    let vdp = Simulator::new(ode, DELTA);
    let x0 = vec![0.0, 1.0];

    let mut solver = Nmpc::new(NX, NU, NT, discretize(ode, DELTA, 1), |s| {
        s.x.iter().map(|v| v * v).sum::<f64>() + s.u[0] * s.u[0]
    })
    .terminal_cost(|x, _| 10.0 * x.iter().map(|v| v * v).sum::<f64>())
    .x0(x0.clone())
    .lb(FieldValues::new().with("u", [-0.75]))
    .ub(FieldValues::new().with("u", [1.0]))
    .options(SolverOptions::default().with_verbosity(0))
    .build()?;

    let mut x = DVector::from_vec(x0);
    for t in 0..NSIM {
        // 1、 Pin the current state
        solver.fixvar("x", 0, x.as_slice())?;

        // 2、 Solve the NLP
        let status = solver.solve();
        if !status.is_success() {
            warn!("Step {t}: solver returned {status}");
        }

        // 3、 Apply the first move and warm start the next solve
        let u = solver.var()[("u", 0)].to_vec();
        solver.saveguess();
        debug!("Step {t:2}: status {status}, obj {:.5}", solver.obj());

        x = vdp.sim(x.as_slice(), &u, &[]);
        let time = DELTA * (t + 1) as f64;
        info!("t = {time:5.2}, x = [{:8.4}, {:8.4}], u = {:7.4}", x[0], x[1], u[0]);
    }

    println!("Final state: [{:.4}, {:.4}]", x[0], x[1]);
    Ok(())
}
