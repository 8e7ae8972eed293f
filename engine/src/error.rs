use std::{error::Error, fmt};

/// Failures at the simulation engine boundary.
#[derive(Debug)]
pub enum EngineError {
    /// The model description could not be parsed.
    InvalidModel(String),
    /// Initialization over the requested time window failed.
    InitFailed(String),
    /// The run stopped before reaching the stop time (abort or solver error).
    RunFailed(String),
    /// The named parameter does not exist on the loaded model.
    UnknownParameter(String),
    /// The parameter exists but the value could not be applied.
    InvalidValue { name: String, value: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::InvalidModel(detail) => write!(f, "invalid model: {detail}"),
            EngineError::InitFailed(detail) => write!(f, "initialization failed: {detail}"),
            EngineError::RunFailed(detail) => write!(f, "run failed: {detail}"),
            EngineError::UnknownParameter(name) => write!(f, "unknown parameter: {name}"),
            EngineError::InvalidValue { name, value } => {
                write!(f, "invalid value for parameter {name}: {value}")
            }
        }
    }
}

impl Error for EngineError {}
