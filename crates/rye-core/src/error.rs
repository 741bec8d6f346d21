use crate::value::Value;

#[derive(Debug, Clone, thiserror::Error)]
pub enum RyeError {
    #[error("object '{0}' not found")]
    Unbound(String),

    #[error("could not find function \"{0}\"")]
    UnboundFunction(String),

    #[error("argument \"{0}\" is missing, with no default")]
    MissingArg(String),

    #[error("attempt to apply non-function")]
    NonFunction,

    /// A condition (`if`/`while` test) that cannot be reduced to TRUE/FALSE.
    /// The message matches the host runtime exactly.
    #[error("{0}")]
    Condition(&'static str),

    #[error("invalid left-hand side to assignment")]
    InvalidAssignTarget,

    #[error("subscript out of bounds")]
    OutOfBounds,

    #[error("{0}")]
    Eval(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl RyeError {
    pub fn eval(msg: impl Into<String>) -> Self {
        RyeError::Eval(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        RyeError::Internal(msg.into())
    }
}

pub const COND_LENGTH_ZERO: &str = "argument is of length zero";
pub const COND_NA_LOGICAL: &str = "missing value where TRUE/FALSE needed";
pub const COND_NOT_LOGICAL: &str = "argument is not interpretable as logical";

/// A non-local transfer bubbling up the frame list.
///
/// `Return` is caught at the nearest function boundary, `Break`/`Next` at the
/// nearest loop frame, `Restart` re-enters the current function body from the
/// top. `Error` unwinds to the caller of the outermost entry point. Every
/// catch site restores the value stack to the snapshot recorded when its
/// frame was installed.
#[derive(Debug, Clone)]
pub enum Unwind {
    Error(RyeError),
    Return(Value),
    Break,
    Next,
    Restart,
}

impl From<RyeError> for Unwind {
    fn from(e: RyeError) -> Self {
        Unwind::Error(e)
    }
}

/// Result alias used throughout evaluation.
pub type Eval<T> = Result<T, Unwind>;
