//! Solver sessions for nonlinear MPC, moving horizon estimation and
//! steady-state target selection.
//!
//! A [`ControlSolver`] is built once per problem shape and solved repeatedly;
//! between solves only bounds, guess and parameters change. The
//! [`ocp`] builders produce sessions for the common problem families.

mod alm;
pub mod control;
pub mod derivatives;
pub mod error;
pub mod linear;
pub mod model;
pub mod nlpsol;
pub mod ocp;
pub mod options;
pub mod problem;
pub mod status;
pub mod structure;

pub use control::{ControlSolver, SessionBuilder, SolveStats, SolverCall, call_solver};
pub use error::{Error, Result};
pub use linear::{Linearization, Lqr, dlqr, linearize};
pub use model::{Simulator, discretize, rk4};
pub use nlpsol::{Input, NlpSolution, NlpSolver};
pub use ocp::{FieldValues, Nmhe, Nmpc, SsTarg, Stage, Target};
pub use options::{EvalMode, SolverOptions};
pub use problem::Nlp;
pub use status::SolveStatus;
pub use structure::{Field, StructArray, StructView, Structure};
