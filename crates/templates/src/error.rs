use loom_core::conditions::Reason;
use loom_schema::PathError;

/// Failure to turn a template body into a concrete document.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StampError {
    /// A tag referenced a value the context does not (yet) hold.
    #[error("unable to find value at path [{path}]: jsonpath returned empty list: {expr}")]
    MissingValue { path: String, expr: String },
    #[error("failed to interpolate template at path [{path}]: {reason}")]
    Interpolate { path: String, reason: String },
    #[error("unable to apply ytt template: {0}")]
    Preprocess(String),
    #[error("cannot set namespace in resource template")]
    Namespace,
    #[error("stamped resource is not an object")]
    NotAnObject,
    #[error("resource template must set metadata.name for a mutable lifecycle")]
    Unnamed,
}

impl StampError {
    pub fn reason(&self) -> Reason {
        match self {
            StampError::MissingValue { .. } => Reason::MissingValueAtPath,
            _ => Reason::TemplateStampFailure,
        }
    }

    pub fn is_missing_value(&self) -> bool {
        matches!(self, StampError::MissingValue { .. })
    }
}

/// Failure to read a typed output off a live object.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OutputError {
    #[error("waiting to read value [{path}] from resource [{resource}]")]
    Missing { path: String, resource: String },
    #[error("failed to evaluate {field} [{path}]: {source}")]
    Evaluate {
        field: String,
        path: String,
        #[source]
        source: PathError,
    },
    #[error("deployment not found in upstream template")]
    NoDeployment,
    #[error("failed to render output [{name}]: {reason}")]
    Render { name: String, reason: String },
}

impl OutputError {
    pub fn reason(&self) -> Reason {
        match self {
            OutputError::Missing { .. } | OutputError::NoDeployment => Reason::MissingValueAtPath,
            OutputError::Evaluate { .. } | OutputError::Render { .. } => Reason::UnknownError,
        }
    }
}

/// Deployment observation not (yet) satisfied.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ObservationError {
    #[error("status.observedGeneration does not equal metadata.generation: {observed} != {generation}")]
    NotSynced { observed: String, generation: i64 },
    #[error("deployment failure condition [{key}] was: {value}")]
    Failed { key: String, value: String },
    #[error("deployment success condition [{key}] was: {actual}, expected: {expected}")]
    NotMet { key: String, actual: String, expected: String },
    #[error("could not find value on {side} [{path}]")]
    Missing { side: &'static str, path: String },
    #[error("input [{input}] and output [{output}] do not match: {left} != {right}")]
    Mismatch { input: String, output: String, left: String, right: String },
    #[error("failed to evaluate {path}: {source}")]
    Evaluate {
        path: String,
        #[source]
        source: PathError,
    },
}

impl ObservationError {
    pub fn reason(&self) -> Reason {
        match self {
            ObservationError::Failed { .. } => Reason::FailedConditionMet,
            _ => Reason::ConditionNotMet,
        }
    }

    /// Terminal until the object changes.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ObservationError::Failed { .. })
    }
}
