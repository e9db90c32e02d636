use thiserror::Error;

#[derive(Error, Debug)]
pub enum QuerySetError {
    #[error("Config error: {0}")]
    Config(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Variable {0} not included with the call")]
    MissingVariable(String),
    #[error("Set {0} is disabled")]
    SetDisabled(String),
    #[error("Parse error: {message}")]
    Parse { message: String, line: Option<usize>, col: Option<usize> },
    #[error("Invalid {kind} literal \"{argument}\": {reason}")]
    Literal { kind: &'static str, argument: String, reason: String },
    #[error("No result")]
    EmptyResult { query: String },
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("Execution error: {0}")]
    Execution(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Lock poisoned: {0}")]
    Lock(String),
}

pub type Result<T> = std::result::Result<T, QuerySetError>;

impl QuerySetError {
    /// Failures that happen while a set is running. These are reported inside
    /// the result envelope instead of being returned to the caller.
    pub fn is_execution_failure(&self) -> bool {
        matches!(
            self,
            Self::Parse { .. }
                | Self::Literal { .. }
                | Self::EmptyResult { .. }
                | Self::Execution(_)
                | Self::Persistence(_)
        )
    }

    /// Bad input from the caller: a malformed document, a disabled set or a
    /// variable nobody supplied.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::Validation(_) | Self::MissingVariable(_) | Self::SetDisabled(_)
        )
    }

    pub(crate) fn parse(err: serde_json::Error) -> Self {
        Self::Parse {
            message: err.to_string(),
            line: Some(err.line()),
            col: Some(err.column()),
        }
    }
}

// Helper conversions
impl From<rusqlite::Error> for QuerySetError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Persistence(e.to_string())
    }
}

impl<T> From<std::sync::PoisonError<T>> for QuerySetError {
    fn from(e: std::sync::PoisonError<T>) -> Self {
        Self::Lock(e.to_string())
    }
}
