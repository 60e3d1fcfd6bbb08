use std::fmt;

use loom_apply::ApplyError;
use loom_core::conditions::{Condition, ConditionStatus, ConditionType, Reason};
use loom_core::LoomError;
use loom_store::StoreError;
use loom_templates::{OutputError, StampError};

/// Why the selector could not pick the object exposed as `selected`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectorMiss {
    NoMatch,
    Multiple(usize),
    Store(StoreError),
}

impl fmt::Display for SelectorMiss {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectorMiss::NoMatch => f.write_str("selector did not match any objects"),
            SelectorMiss::Multiple(_) => f.write_str("selector matched multiple objects"),
            SelectorMiss::Store(e) => write!(f, "failed to list objects matching selector: {}", e),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum RunnableError {
    #[error("unable to get run template [{name}]: not found")]
    RunTemplateNotFound { name: String },
    #[error("unable to get run template [{name}]: {source}")]
    RunTemplateRead {
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("run template [{name}] is invalid: {source}")]
    RunTemplateInvalid {
        name: String,
        #[source]
        source: LoomError,
    },
    #[error("unable to resolve selector [{labels}], apiVersion [{api_version}], kind [{kind}]: {miss}")]
    Selector { labels: String, api_version: String, kind: String, miss: SelectorMiss },
    #[error("unable to stamp object for runnable [{runnable}]: {source}")]
    Stamp {
        runnable: String,
        #[source]
        source: StampError,
    },
    #[error("{source}")]
    Apply {
        #[source]
        source: ApplyError,
    },
    #[error("unable to retrieve outputs from stamped object [{object}] for runnable [{runnable}]: {source}")]
    Output {
        object: String,
        runnable: String,
        #[source]
        source: OutputError,
    },
    #[error("unable to use service account [{namespace}/{name}]: {source}")]
    ServiceAccount {
        namespace: String,
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("unable to build client for service account [{namespace}/{name}]: {source}")]
    ClientBuilder {
        namespace: String,
        name: String,
        #[source]
        source: StoreError,
    },
}

impl RunnableError {
    /// Classify a failure to obtain a service-account scoped store.
    pub fn service_account(namespace: &str, name: &str, source: StoreError) -> Self {
        let (namespace, name) = (namespace.to_string(), name.to_string());
        match source {
            StoreError::NotFound(_) | StoreError::Forbidden(_) => RunnableError::ServiceAccount { namespace, name, source },
            source => RunnableError::ClientBuilder { namespace, name, source },
        }
    }

    pub fn reason(&self) -> Reason {
        match self {
            RunnableError::RunTemplateNotFound { .. } | RunnableError::RunTemplateRead { .. } => Reason::RunTemplateNotFound,
            RunnableError::RunTemplateInvalid { .. } | RunnableError::Selector { .. } | RunnableError::Stamp { .. } => {
                Reason::TemplateStampFailure
            }
            RunnableError::Apply { source: ApplyError::Read { .. } } => Reason::FailedToListCreatedObjects,
            RunnableError::Apply { .. } => Reason::StampedObjectRejectedByAPIServer,
            RunnableError::Output { .. } => Reason::OutputPathNotSatisfied,
            RunnableError::ServiceAccount { .. } => Reason::ServiceAccountSecretError,
            RunnableError::ClientBuilder { .. } => Reason::ClientBuilderError,
        }
    }

    /// Transport failures and conflicts; forbidden writes and missing templates wait for a change.
    pub fn is_retryable(&self) -> bool {
        match self {
            RunnableError::RunTemplateRead { source, .. }
            | RunnableError::ClientBuilder { source, .. }
            | RunnableError::ServiceAccount { source, .. } => source.is_retryable(),
            RunnableError::Selector { miss: SelectorMiss::Store(e), .. } => e.is_retryable(),
            RunnableError::Apply { source } => source.is_retryable(),
            _ => false,
        }
    }

    /// `RunTemplateReady` for this failure.
    pub fn condition(&self) -> Condition {
        Condition::new(ConditionType::RunTemplateReady, ConditionStatus::False, self.reason(), self.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::ObjectKey;

    #[test]
    fn reasons_follow_the_failing_step() {
        let rejected = RunnableError::Apply {
            source: ApplyError::Rejected { object: "TaskRun/dev/x".into(), source: StoreError::Invalid("bad".into()) },
        };
        assert_eq!(rejected.reason(), Reason::StampedObjectRejectedByAPIServer);
        let listing = RunnableError::Apply {
            source: ApplyError::Read { what: "TaskRun".into(), source: StoreError::Transport("eof".into()) },
        };
        assert_eq!(listing.reason(), Reason::FailedToListCreatedObjects);
        assert!(listing.is_retryable());

        let miss = RunnableError::Selector {
            labels: "app=web".into(),
            api_version: "v1".into(),
            kind: "ConfigMap".into(),
            miss: SelectorMiss::Multiple(2),
        };
        assert_eq!(miss.reason(), Reason::TemplateStampFailure);
        assert_eq!(
            miss.to_string(),
            "unable to resolve selector [app=web], apiVersion [v1], kind [ConfigMap]: selector matched multiple objects"
        );
        let c = miss.condition();
        assert_eq!(c.type_, "RunTemplateReady");
        assert!(c.is_false());
    }

    #[test]
    fn service_account_failures_split_by_cause() {
        let key = ObjectKey::new("v1", "ServiceAccount", Some("dev"), "builder");
        let missing = RunnableError::service_account("dev", "builder", StoreError::NotFound(key));
        assert_eq!(missing.reason(), Reason::ServiceAccountSecretError);
        let down = RunnableError::service_account("dev", "builder", StoreError::Transport("refused".into()));
        assert_eq!(down.reason(), Reason::ClientBuilderError);
        assert!(down.is_retryable());
    }
}
