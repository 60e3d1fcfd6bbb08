//! Deployment gating: a deployment template only passes its input on once the stamped
//! object reports it has been deployed.

use loom_core::model::{KeyValue, ObservedCompletion, ObservedMatch};
use loom_core::obj;
use loom_schema::lookup;
use serde_json::Value;

use crate::model::Observation;
use crate::ObservationError;

fn render(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn read(path: &str, stamped: &Value) -> Result<Option<String>, ObservationError> {
    lookup(path, stamped)
        .map(|v| v.filter(|v| !v.is_null()).map(render))
        .map_err(|source| ObservationError::Evaluate { path: path.to_string(), source })
}

/// `Ok(())` once `observation` holds on `stamped`.
pub fn observe(observation: &Observation, stamped: &Value) -> Result<(), ObservationError> {
    match observation {
        Observation::Completion(c) => completion(c, stamped),
        Observation::Matches(m) => matches(m, stamped),
    }
}

fn synced(stamped: &Value) -> Result<(), ObservationError> {
    let generation = obj::generation(stamped);
    match obj::observed_generation(stamped) {
        Some(observed) if observed == generation => Ok(()),
        observed => Err(ObservationError::NotSynced {
            observed: observed.map(|o| o.to_string()).unwrap_or_else(|| "<none>".into()),
            generation,
        }),
    }
}

fn completion(c: &ObservedCompletion, stamped: &Value) -> Result<(), ObservationError> {
    synced(stamped)?;
    if let Some(KeyValue { key, value }) = &c.failed {
        if read(key, stamped)?.as_deref() == Some(value.as_str()) {
            return Err(ObservationError::Failed { key: key.clone(), value: value.clone() });
        }
    }
    let KeyValue { key, value } = &c.succeeded;
    match read(key, stamped)? {
        Some(actual) if actual == *value => Ok(()),
        actual => Err(ObservationError::NotMet {
            key: key.clone(),
            actual: actual.unwrap_or_else(|| "<none>".into()),
            expected: value.clone(),
        }),
    }
}

fn matches(rules: &[ObservedMatch], stamped: &Value) -> Result<(), ObservationError> {
    synced(stamped)?;
    for m in rules {
        let left = read(&m.input, stamped)?.ok_or_else(|| ObservationError::Missing { side: "input", path: m.input.clone() })?;
        let right =
            read(&m.output, stamped)?.ok_or_else(|| ObservationError::Missing { side: "output", path: m.output.clone() })?;
        if left != right {
            return Err(ObservationError::Mismatch { input: m.input.clone(), output: m.output.clone(), left, right });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use loom_core::conditions::Reason;
    use serde_json::json;

    fn completion_rule() -> Observation {
        Observation::Completion(ObservedCompletion {
            succeeded: KeyValue { key: ".status.deployed".into(), value: "true".into() },
            failed: Some(KeyValue { key: "status.failed".into(), value: "true".into() }),
        })
    }

    #[test]
    fn completion_waits_for_synced_generation() {
        let doc = json!({"metadata": {"generation": 2}, "status": {"observedGeneration": 1, "deployed": "true"}});
        let e = observe(&completion_rule(), &doc).unwrap_err();
        assert!(matches!(e, ObservationError::NotSynced { generation: 2, .. }));
        assert_eq!(e.reason(), Reason::ConditionNotMet);
    }

    #[test]
    fn completion_succeeds_and_fails() {
        let pending = json!({"metadata": {"generation": 1}, "status": {"observedGeneration": 1}});
        let e = observe(&completion_rule(), &pending).unwrap_err();
        assert_eq!(e.to_string(), "deployment success condition [.status.deployed] was: <none>, expected: true");

        let done = json!({"metadata": {"generation": 1}, "status": {"observedGeneration": 1, "deployed": true}});
        assert!(observe(&completion_rule(), &done).is_ok());

        let failed = json!({"metadata": {"generation": 1}, "status": {"observedGeneration": 1, "deployed": "true", "failed": "true"}});
        let e = observe(&completion_rule(), &failed).unwrap_err();
        assert!(e.is_terminal());
        assert_eq!(e.reason(), Reason::FailedConditionMet);
    }

    #[test]
    fn matches_compare_input_and_output() {
        let rule = Observation::Matches(vec![ObservedMatch { input: "spec.image".into(), output: "status.image".into() }]);
        let synced = json!({"metadata": {"generation": 1}, "spec": {"image": "a"}, "status": {"observedGeneration": 1, "image": "a"}});
        assert!(observe(&rule, &synced).is_ok());
        let lagging = json!({"metadata": {"generation": 1}, "spec": {"image": "b"}, "status": {"observedGeneration": 1, "image": "a"}});
        assert_eq!(observe(&rule, &lagging).unwrap_err().to_string(), "input [spec.image] and output [status.image] do not match: b != a");
        let missing = json!({"metadata": {"generation": 1}, "spec": {"image": "b"}, "status": {"observedGeneration": 1}});
        assert!(matches!(observe(&rule, &missing), Err(ObservationError::Missing { side: "output", .. })));
    }

    #[test]
    fn matches_wait_for_synced_generation() {
        let rule = Observation::Matches(vec![ObservedMatch { input: "spec.image".into(), output: "status.image".into() }]);
        let stale = json!({"metadata": {"generation": 2}, "spec": {"image": "a"}, "status": {"observedGeneration": 1, "image": "a"}});
        let e = observe(&rule, &stale).unwrap_err();
        assert!(matches!(e, ObservationError::NotSynced { generation: 2, .. }));
        assert_eq!(e.reason(), Reason::ConditionNotMet);
        let unreported = json!({"metadata": {"generation": 1}, "spec": {"image": "a"}, "status": {"image": "a"}});
        assert!(matches!(observe(&rule, &unreported), Err(ObservationError::NotSynced { .. })));
    }
}
