use std::fmt;

/// Outcome of a solve, reported rather than raised.
///
/// The string forms match the return codes of Ipopt so that driver loops
/// written against that solver can branch on the same names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SolveStatus {
    SolveSucceeded,
    SolvedToAcceptableLevel,
    /// The bounds are inconsistent or the constraint violation could not be
    /// driven below tolerance.
    InfeasibleProblemDetected,
    SearchDirectionBecomesTooSmall,
    MaximumIterationsExceeded,
    MaximumCpuTimeExceeded,
    /// The starting point already evaluates to NaN or Inf.
    InvalidNumberDetected,
    /// A model evaluation produced NaN or Inf and `eval_errors_fatal` is set.
    EvaluationError,
    /// The session was built without running the optimization.
    NotRequested,
}

impl SolveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SolveStatus::SolveSucceeded => "Solve_Succeeded",
            SolveStatus::SolvedToAcceptableLevel => "Solved_To_Acceptable_Level",
            SolveStatus::InfeasibleProblemDetected => "Infeasible_Problem_Detected",
            SolveStatus::SearchDirectionBecomesTooSmall => "Search_Direction_Becomes_Too_Small",
            SolveStatus::MaximumIterationsExceeded => "Maximum_Iterations_Exceeded",
            SolveStatus::MaximumCpuTimeExceeded => "Maximum_CpuTime_Exceeded",
            SolveStatus::InvalidNumberDetected => "Invalid_Number_Detected",
            SolveStatus::EvaluationError => "NonIpopt_Exception_Thrown",
            SolveStatus::NotRequested => "NO_OPTIMIZATION_REQUESTED",
        }
    }

    /// True when the returned point satisfies the (possibly relaxed) tolerances.
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            SolveStatus::SolveSucceeded | SolveStatus::SolvedToAcceptableLevel
        )
    }
}

impl fmt::Display for SolveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
