use loom_apply::ApplyError;
use loom_core::conditions::{Condition, ConditionStatus, ConditionType, Reason};
use loom_core::LoomError;
use loom_selector::OptionError;
use loom_store::StoreError;
use loom_templates::{ObservationError, OutputError, StampError};

/// Why one resource (or the whole owner) could not be realized.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RealizeError {
    #[error("unable to get template [{name}] of kind [{kind}] for resource [{resource}]")]
    TemplateNotFound { resource: String, kind: String, name: String },
    #[error("template [{name}] for resource [{resource}] is invalid: {source}")]
    TemplateInvalid {
        resource: String,
        name: String,
        #[source]
        source: LoomError,
    },
    #[error("unable to read [{what}]: {source}")]
    Read {
        what: String,
        #[source]
        source: StoreError,
    },
    #[error("unable to choose a template for resource [{resource}]: {source}")]
    Options {
        resource: String,
        #[source]
        source: OptionError,
    },
    #[error("unable to retrieve outputs from resource [{producer}] for resource [{resource}]")]
    MissingInput { resource: String, producer: String },
    #[error("unable to stamp object for resource [{resource}]: {source}")]
    Stamp {
        resource: String,
        #[source]
        source: StampError,
    },
    #[error("unable to apply object for resource [{resource}]: {source}")]
    Apply {
        resource: String,
        #[source]
        source: ApplyError,
    },
    #[error("{source}")]
    Observation {
        resource: String,
        #[source]
        source: ObservationError,
    },
    #[error("unable to retrieve outputs for resource [{resource}]: {source}")]
    Output {
        resource: String,
        #[source]
        source: OutputError,
    },
    #[error("no object stamped for resource [{resource}] is healthy yet")]
    NoHealthyObject { resource: String },
    #[error("unable to use service account [{namespace}/{name}]: {source}")]
    ServiceAccount {
        namespace: String,
        name: String,
        #[source]
        source: StoreError,
    },
}

impl RealizeError {
    pub fn reason(&self) -> Reason {
        match self {
            RealizeError::TemplateNotFound { .. } | RealizeError::TemplateInvalid { .. } | RealizeError::Read { .. } => {
                Reason::TemplateObjectRetrievalFailure
            }
            RealizeError::Options { source: OptionError::Match(_), .. } => Reason::TemplateOptionsMatchError,
            RealizeError::Options { source: OptionError::Evaluate { .. }, .. } => Reason::ResolveTemplateOptionsError,
            RealizeError::MissingInput { .. } | RealizeError::NoHealthyObject { .. } => Reason::MissingValueAtPath,
            RealizeError::Stamp { source, .. } => source.reason(),
            RealizeError::Apply { source, .. } => source.reason(),
            RealizeError::Observation { source, .. } => source.reason(),
            RealizeError::Output { source, .. } => source.reason(),
            RealizeError::ServiceAccount { .. } => Reason::ServiceAccountSecretError,
        }
    }

    /// Waiting on something that is expected to resolve by itself is Unknown; everything else False.
    pub fn status(&self) -> ConditionStatus {
        match self.reason() {
            Reason::MissingValueAtPath | Reason::ConditionNotMet => ConditionStatus::Unknown,
            _ => ConditionStatus::False,
        }
    }

    pub fn resource(&self) -> Option<&str> {
        match self {
            RealizeError::TemplateNotFound { resource, .. }
            | RealizeError::TemplateInvalid { resource, .. }
            | RealizeError::Options { resource, .. }
            | RealizeError::MissingInput { resource, .. }
            | RealizeError::Stamp { resource, .. }
            | RealizeError::Apply { resource, .. }
            | RealizeError::Observation { resource, .. }
            | RealizeError::Output { resource, .. }
            | RealizeError::NoHealthyObject { resource } => Some(resource),
            RealizeError::Read { .. } | RealizeError::ServiceAccount { .. } => None,
        }
    }

    /// Transport failures and conflicts are retried with backoff.
    pub fn is_retryable(&self) -> bool {
        match self {
            RealizeError::Read { source, .. } => source.is_retryable(),
            RealizeError::Apply { source, .. } => source.is_retryable(),
            RealizeError::ServiceAccount { source, .. } => source.is_retryable(),
            _ => false,
        }
    }

    pub fn condition(&self, type_: ConditionType) -> Condition {
        Condition::new(type_, self.status(), self.reason(), self.to_string())
    }
}
