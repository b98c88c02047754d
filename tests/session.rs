use approx::assert_abs_diff_eq;
use mpctools::{
    ControlSolver, EvalMode, FieldValues, Nmpc, SolveStatus, SolverOptions, StructArray,
    StructView, Structure,
};
use nalgebra::dvector;

const N: usize = 5;

fn quiet() -> SolverOptions {
    SolverOptions::default().with_verbosity(0)
}

/// x[t+1] = x[t] + u[t], cost sum x^2 + u^2, u in [-1, 1].
fn integrator() -> ControlSolver {
    integrator_with(quiet())
}

fn integrator_with(options: SolverOptions) -> ControlSolver {
    Nmpc::new(
        1,
        1,
        N,
        |x, u, _| dvector![x[0] + u[0]],
        |s| s.x[0] * s.x[0] + s.u[0] * s.u[0],
    )
    .lb(FieldValues::new().with("u", [-1.0]))
    .ub(FieldValues::new().with("u", [1.0]))
    .options(options)
    .build()
    .unwrap()
}

/// Rosenbrock's function from the usual starting point, no constraints.
fn rosenbrock(options: SolverOptions) -> ControlSolver {
    let var = Structure::new([("x", 1, 2)]).unwrap();
    let mut guess = StructArray::zeros(&var);
    guess.set("x", 0, &[-1.2, 1.0]).unwrap();
    ControlSolver::builder(&var, |x, _| {
        let x = &x[("x", 0)];
        (1.0 - x[0]).powi(2) + 100.0 * (x[1] - x[0] * x[0]).powi(2)
    })
    .guess(guess)
    .options(options)
    .build()
    .unwrap()
}

/// min x0^2 + x1^2 subject to a x0 + x1 = 1, with `a` a parameter.
fn parametric_qp(options: SolverOptions) -> ControlSolver {
    let var = Structure::new([("x", 1, 2)]).unwrap();
    let par = Structure::new([("a", 1, 1)]).unwrap();
    let mut parval = StructArray::zeros(&par);
    parval.set("a", 0, &[1.0]).unwrap();

    let line = |x: &StructView<'_>, p: &StructView<'_>| {
        let x = &x[("x", 0)];
        vec![p[("a", 0)][0] * x[0] + x[1]]
    };
    ControlSolver::builder(&var, |x, _| x[("x", 0)].iter().map(|v| v * v).sum::<f64>())
        .constraints(line, vec![1.0], vec![1.0])
        .parameters(parval)
        .options(options)
        .build()
        .unwrap()
}

fn log_barrier(options: SolverOptions) -> ControlSolver {
    let var = Structure::new([("x", 1, 1)]).unwrap();
    let mut guess = StructArray::zeros(&var);
    guess.set("x", 0, &[4.0]).unwrap();

    let objective = |x: &StructView<'_>, _: &StructView<'_>| {
        let x = x[("x", 0)][0];
        x.ln() + 1.0 / x
    };
    ControlSolver::builder(&var, objective)
        .guess(guess)
        .options(options)
        .build()
        .unwrap()
}

fn same_shape(solver: &ControlSolver) -> bool {
    let var = solver.var();
    var.same_shape(solver.guess()) && var.same_shape(solver.lb()) && var.same_shape(solver.ub())
}

#[test]
fn shapes_survive_fixvar_and_saveguess() {
    let mut solver = integrator();
    assert!(same_shape(&solver));

    solver.fixvar("x", 0, &[2.0]).unwrap();
    assert!(same_shape(&solver));
    solver.solve();
    solver.saveguess();
    assert!(same_shape(&solver));
    solver.saveguess_offset(-2);
    solver.saveguess_offset(10);
    assert!(same_shape(&solver));
    assert_eq!(solver.guess().as_slice().len(), 2 * N + 1);
}

#[test]
fn fixed_initial_state_is_exact() {
    let mut solver = integrator();
    for x0 in [2.0, -0.7, 0.123_456_789] {
        solver.fixvar("x", 0, &[x0]).unwrap();
        let status = solver.solve();
        assert!(status.is_success(), "{status}");
        assert_eq!(solver.var()[("x", 0)][0], x0);
    }
}

#[test]
fn saveguess_shifts_trajectory_forward() {
    let mut solver = integrator();
    solver.fixvar("x", 0, &[2.0]).unwrap();
    solver.solve();

    let x = solver.var().trajectory("x").unwrap();
    let u = solver.var().trajectory("u").unwrap();
    let before = solver.guess().clone();
    solver.saveguess();

    let guess = solver.guess();
    for t in 0..N {
        assert_eq!(guess[("x", t)][0], x[(0, t + 1)]);
    }
    assert_eq!(guess[("x", N)], before[("x", N)]);
    for t in 0..N - 1 {
        assert_eq!(guess[("u", t)][0], u[(0, t + 1)]);
    }
    assert_eq!(guess[("u", N - 1)], before[("u", N - 1)]);
}

#[test]
fn every_solve_reports_status_and_time() {
    let mut solver = integrator();
    assert_eq!(solver.stats().status, None);
    for x0 in [2.0, 1.0] {
        solver.fixvar("x", 0, &[x0]).unwrap();
        let status = solver.solve();
        assert_eq!(solver.stats().status, Some(status));
        assert!(solver.stats().time >= 0.0);
        assert!(solver.stats().iterations > 0);
    }
}

#[test]
fn resolving_unchanged_inputs_is_idempotent() {
    let mut solver = integrator();
    solver.fixvar("x", 0, &[2.0]).unwrap();
    let first = solver.solve();
    let obj = solver.obj();
    let var = solver.var().clone();

    let second = solver.solve();
    assert_eq!(first, second);
    assert_abs_diff_eq!(solver.obj(), obj, epsilon = 1e-8);
    for (a, b) in solver.var().as_slice().iter().zip(var.as_slice()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-5);
    }
}

#[test]
fn scalar_integrator_drives_state_to_origin() {
    let mut solver = integrator();
    solver.fixvar("x", 0, &[2.0]).unwrap();
    let status = solver.solve();
    assert!(
        matches!(
            status,
            SolveStatus::SolveSucceeded | SolveStatus::SolvedToAcceptableLevel
        ),
        "{status}"
    );

    let x = solver.var().trajectory("x").unwrap();
    for t in 0..N {
        assert!(x[(0, t + 1)].abs() <= x[(0, t)].abs() + 1e-5, "{x}");
    }
    for t in 0..N {
        let u = solver.var()[("u", t)][0];
        assert!((-1.0 - 1e-9..=1.0 + 1e-9).contains(&u));
        assert_abs_diff_eq!(x[(0, t + 1)], x[(0, t)] + u, epsilon = 1e-5);
    }
}

#[test]
fn closed_loop_receding_horizon() {
    let mut solver = integrator();
    let mut x = 2.0;
    for _ in 0..8 {
        solver.fixvar("x", 0, &[x]).unwrap();
        assert!(solver.solve().is_success());
        let u = solver.var()[("u", 0)][0];
        solver.saveguess();
        x += u;
    }
    assert!(x.abs() < 0.05, "x = {x}");
}

#[test]
fn inconsistent_bounds_are_reported_not_raised() {
    let mut solver = integrator();
    solver.lb_mut().set("u", 2, &[0.5]).unwrap();
    solver.ub_mut().set("u", 2, &[-0.5]).unwrap();
    assert_eq!(solver.solve(), SolveStatus::InfeasibleProblemDetected);
    assert_eq!(solver.stats().status, Some(SolveStatus::InfeasibleProblemDetected));
}

#[test]
fn evaluation_errors_become_a_status() {
    let mut solver = log_barrier(quiet());
    solver.fixvar("x", 0, &[-1.0]).unwrap();
    assert_eq!(solver.solve(), SolveStatus::EvaluationError);
    assert_eq!(solver.status().map(|s| s.as_str()), Some("NonIpopt_Exception_Thrown"));
}

#[test]
fn non_fatal_evaluation_errors_report_invalid_number() {
    let mut solver = log_barrier(quiet().with_eval_errors_fatal(false));
    solver.fixvar("x", 0, &[-1.0]).unwrap();
    assert_eq!(solver.solve(), SolveStatus::InvalidNumberDetected);
    assert_eq!(solver.status().map(|s| s.as_str()), Some("Invalid_Number_Detected"));

    // The same session recovers once the bounds keep the model evaluable.
    solver.lb_mut().set("x", 0, &[0.5]).unwrap();
    solver.ub_mut().set("x", 0, &[f64::INFINITY]).unwrap();
    solver.guess_mut().set("x", 0, &[2.0]).unwrap();
    assert!(solver.solve().is_success());
    assert_abs_diff_eq!(solver.var()[("x", 0)][0], 1.0, epsilon = 1e-4);
}

#[test]
fn inconsistent_constraint_bounds_are_infeasible() {
    let mut solver = integrator();
    solver.fixvar("x", 0, &[1.0]).unwrap();
    solver.conlb_mut()[0] = 1.0;
    solver.conub_mut()[0] = -1.0;
    assert_eq!(solver.solve(), SolveStatus::InfeasibleProblemDetected);
    assert_eq!(solver.stats().iterations, 0);
}

#[test]
fn qp_derivatives_follow_parameter_changes() {
    for options in [quiet(), quiet().with_qp(true)] {
        let mut solver = parametric_qp(options);
        assert!(solver.solve().is_success());
        assert_abs_diff_eq!(solver.var()[("x", 0)][0], 0.5, epsilon = 1e-4);
        assert_abs_diff_eq!(solver.var()[("x", 0)][1], 0.5, epsilon = 1e-4);

        solver.par_mut().unwrap().set("a", 0, &[2.0]).unwrap();
        assert!(solver.solve().is_success());
        assert_abs_diff_eq!(solver.var()[("x", 0)][0], 0.4, epsilon = 1e-4);
        assert_abs_diff_eq!(solver.var()[("x", 0)][1], 0.2, epsilon = 1e-4);
    }
}

#[test]
fn forward_differences_reach_the_same_optimum() {
    let mut scalar = integrator();
    let mut matrix = integrator_with(quiet().with_eval_mode(EvalMode::Matrix));
    for solver in [&mut scalar, &mut matrix] {
        solver.fixvar("x", 0, &[2.0]).unwrap();
        assert!(solver.solve().is_success());
    }
    assert_eq!(matrix.solver().settings().eval_mode, EvalMode::Matrix);
    for (a, b) in scalar.var().as_slice().iter().zip(matrix.var().as_slice()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-4);
    }
}

#[test]
fn iteration_budget_is_reported() {
    let mut solver = rosenbrock(quiet().with_max_iter(2));
    assert_eq!(solver.solve(), SolveStatus::MaximumIterationsExceeded);
    assert_eq!(solver.stats().status, Some(SolveStatus::MaximumIterationsExceeded));

    let mut solver = rosenbrock(quiet());
    assert!(solver.solve().is_success());
    assert_abs_diff_eq!(solver.var()[("x", 0)][0], 1.0, epsilon = 1e-3);
    assert_abs_diff_eq!(solver.var()[("x", 0)][1], 1.0, epsilon = 1e-3);
}

#[test]
fn time_budget_is_reported() {
    let mut solver = rosenbrock(quiet().with_time_limit(1e-9));
    assert_eq!(solver.solve(), SolveStatus::MaximumCpuTimeExceeded);
    assert_eq!(solver.status().map(|s| s.as_str()), Some("Maximum_CpuTime_Exceeded"));
}

#[test]
fn sessions_are_independent() {
    let mut first = integrator();
    let mut second = integrator();
    first.fixvar("x", 0, &[2.0]).unwrap();
    second.fixvar("x", 0, &[-1.0]).unwrap();

    assert!(first.solve().is_success());
    let alone = first.var().clone();
    assert!(second.solve().is_success());
    second.saveguess();
    assert!(first.solve().is_success());

    assert_eq!(first.var()[("x", 0)], [2.0]);
    assert_eq!(second.var()[("x", 0)], [-1.0]);
    for (a, b) in first.var().as_slice().iter().zip(alone.as_slice()) {
        assert_abs_diff_eq!(a, b, epsilon = 1e-5);
    }
    // Mirror-image problems up to the asymmetric input bound.
    assert!(second.var()[("u", 0)][0] > 0.0);
    assert!(first.var()[("u", 0)][0] < 0.0);
}
