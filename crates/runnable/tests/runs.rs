use loom_core::conditions::{ConditionStatus, Reason};
use loom_core::model::{from_doc, Runnable};
use loom_core::{obj, ObjectKey, TypeKey, API_VERSION};
use loom_runnable::{RunOutcome, RunState, RunnableEngine};
use loom_store::{MemStore, ObjectStore};
use serde_json::{json, Value};

fn run_template(outputs: Value) -> Value {
    json!({
        "apiVersion": API_VERSION,
        "kind": "ClusterRunTemplate",
        "metadata": {"name": "tekton-run"},
        "spec": {
            "outputs": outputs,
            "template": {
                "apiVersion": "tekton.dev/v1",
                "kind": "TaskRun",
                "metadata": {"generateName": "$(runnable.metadata.name)$-"},
                "spec": {"revision": "$(runnable.spec.inputs.revision)$"}
            }
        }
    })
}

fn runnable(revision: &str) -> Value {
    json!({
        "apiVersion": API_VERSION,
        "kind": "Runnable",
        "metadata": {"name": "tests", "namespace": "dev"},
        "spec": {
            "runTemplateRef": {"name": "tekton-run"},
            "inputs": {"revision": revision},
            "retentionPolicy": {"maxFailedRuns": 1, "maxSuccessfulRuns": 1}
        }
    })
}

async fn pass(store: &MemStore, doc: &Value) -> RunOutcome {
    let r: Runnable = from_doc(doc).unwrap();
    RunnableEngine { templates: store, store }.run(&r, doc).await
}

async fn finish(store: &MemStore, out: &RunOutcome, status: &str, revision: &str) {
    let key = ObjectKey::of(out.stamped.as_ref().unwrap()).unwrap();
    let mut run = store.get(&key).await.unwrap().unwrap();
    run["status"] = json!({
        "conditions": [{"type": "Succeeded", "status": status}],
        "outputs": {"revision": revision}
    });
    store.update_status(run).await.unwrap();
}

async fn runs(store: &MemStore) -> Vec<Value> {
    store.list(&TypeKey::new("tekton.dev/v1", "TaskRun"), Some("dev"), &Default::default()).await.unwrap()
}

#[tokio::test]
async fn identical_inputs_reuse_the_run() {
    let store = MemStore::new();
    store.create(run_template(json!({}))).await.unwrap();
    let doc = store.create(runnable("a")).await.unwrap();

    let first = pass(&store, &doc).await;
    assert!(first.error.is_none(), "{:?}", first.error);
    assert_eq!(first.state(), RunState::Running);
    let again = pass(&store, &doc).await;
    assert_eq!(obj::name(again.stamped.as_ref().unwrap()), obj::name(first.stamped.as_ref().unwrap()));
    let all = runs(&store).await;
    assert_eq!(all.len(), 1);
    let run = &all[0];
    assert!(obj::name(run).unwrap().starts_with("tests-"));
    assert_eq!(obj::label(run, "carto.run/runnable-name"), Some("tests"));
    assert_eq!(obj::label(run, "carto.run/run-template-name"), Some("tekton-run"));
    assert_eq!(run["metadata"]["ownerReferences"][0]["uid"], doc["metadata"]["uid"]);
    assert!(obj::annotation(run, "carto.run/run-fingerprint").is_some());
    assert_eq!(first.tracked, vec![ObjectKey::loom("ClusterRunTemplate", None, "tekton-run")]);
    assert_eq!(first.watched, vec![TypeKey::new("tekton.dev/v1", "TaskRun")]);
}

#[tokio::test]
async fn history_is_bounded_and_outputs_come_from_newest_success() {
    let store = MemStore::new();
    store.create(run_template(json!({"revision": "status.outputs.revision"}))).await.unwrap();
    let mut doc = store.create(runnable("r0")).await.unwrap();

    let mut last: Option<String> = None;
    for (i, status) in ["True", "False", "True", "False"].into_iter().enumerate() {
        let rev = format!("r{}", i);
        doc["spec"]["inputs"]["revision"] = json!(rev);
        let out = pass(&store, &doc).await;
        assert!(out.error.is_none(), "{:?}", out.error);
        finish(&store, &out, status, &rev).await;
        if let Some(prev) = &last {
            assert_ne!(obj::name(out.stamped.as_ref().unwrap()), Some(prev.as_str()));
        }
        last = obj::name(out.stamped.as_ref().unwrap()).map(str::to_string);
    }

    let out = pass(&store, &doc).await;
    assert!(out.error.is_none(), "{:?}", out.error);
    assert_eq!(out.state(), RunState::Failed);
    assert_eq!(out.outputs["revision"], "r2");
    let mut left: Vec<String> = runs(&store).await.iter().map(|r| r["spec"]["revision"].as_str().unwrap().to_string()).collect();
    left.sort();
    assert_eq!(left, vec!["r2", "r3"]);

    let now = loom_core::conditions::now();
    let (conds, _) = out.conditions(&[], now);
    assert_eq!(conds[0].status, ConditionStatus::False);
    let mirrored = conds.iter().find(|c| c.type_ == "StampedObjectCondition").unwrap();
    assert_eq!(mirrored.reason, "SucceededCondition");
}

#[tokio::test]
async fn outputs_survive_until_a_run_succeeds() {
    let store = MemStore::new();
    store.create(run_template(json!({"revision": "status.outputs.revision"}))).await.unwrap();
    let mut doc = store.create(runnable("fresh")).await.unwrap();
    doc["status"] = json!({"outputs": {"revision": "old"}});

    let out = pass(&store, &doc).await;
    assert_eq!(out.outputs["revision"], "old");
    finish(&store, &out, "False", "fresh").await;
    assert_eq!(pass(&store, &doc).await.outputs["revision"], "old");
    finish(&store, &out, "True", "fresh").await;
    assert_eq!(pass(&store, &doc).await.outputs["revision"], "fresh");
}

#[tokio::test]
async fn succeeded_run_without_output_path_is_reported() {
    let store = MemStore::new();
    store.create(run_template(json!({"digest": "status.outputs.digest"}))).await.unwrap();
    let doc = store.create(runnable("a")).await.unwrap();
    let out = pass(&store, &doc).await;
    finish(&store, &out, "True", "a").await;
    let out = pass(&store, &doc).await;
    let e = out.error.as_ref().unwrap();
    assert_eq!(e.reason(), Reason::OutputPathNotSatisfied);
    assert!(out.stamped.is_some());
}

#[tokio::test]
async fn selector_must_match_exactly_one_object() {
    let store = MemStore::new();
    let mut tpl = run_template(json!({}));
    tpl["spec"]["template"]["spec"]["pipeline"] = json!("$(selected.metadata.name)$");
    store.create(tpl).await.unwrap();
    let mut doc = runnable("a");
    doc["spec"]["selector"] = json!({
        "resource": {"apiVersion": "tekton.dev/v1", "kind": "Pipeline"},
        "matchingLabels": {"apps.tanzu.vmware.com/pipeline": "test"}
    });
    let doc = store.create(doc).await.unwrap();

    let out = pass(&store, &doc).await;
    let e = out.error.unwrap();
    assert_eq!(e.reason(), Reason::TemplateStampFailure);
    assert!(e.to_string().ends_with("selector did not match any objects"), "{}", e);
    assert!(runs(&store).await.is_empty());

    let pipeline = |name: &str| {
        json!({
            "apiVersion": "tekton.dev/v1",
            "kind": "Pipeline",
            "metadata": {"name": name, "namespace": "dev", "labels": {"apps.tanzu.vmware.com/pipeline": "test"}}
        })
    };
    store.create(pipeline("unit")).await.unwrap();
    let out = pass(&store, &doc).await;
    assert!(out.error.is_none(), "{:?}", out.error);
    assert_eq!(out.stamped.as_ref().unwrap()["spec"]["pipeline"], "unit");
    assert!(out.tracked.contains(&ObjectKey::new("tekton.dev/v1", "Pipeline", Some("dev"), "unit")));
    assert!(out.watched.contains(&TypeKey::new("tekton.dev/v1", "Pipeline")));

    store.create(pipeline("lint")).await.unwrap();
    let e = pass(&store, &doc).await.error.unwrap();
    assert!(e.to_string().ends_with("selector matched multiple objects"), "{}", e);
}

#[tokio::test]
async fn missing_run_template() {
    let store = MemStore::new();
    let doc = store.create(runnable("a")).await.unwrap();
    let out = pass(&store, &doc).await;
    let e = out.error.as_ref().unwrap();
    assert_eq!(e.reason(), Reason::RunTemplateNotFound);
    assert!(!e.is_retryable());
    let (conds, _) = out.conditions(&[], loom_core::conditions::now());
    let rt = conds.iter().find(|c| c.type_ == "RunTemplateReady").unwrap();
    assert_eq!(rt.reason, "RunTemplateNotFound");
    assert_eq!(out.state(), RunState::Pending);
}
