//! Loom reconciler orchestrator: a de-duplicating work queue, a worker pool with deadlines
//! and cancellation, the mapping from store changes to work, and the owner, blueprint and
//! runnable reconcilers.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::{Arc, Mutex};

use loom_core::model::{BlueprintKind, OwnerKind, RUNNABLE_KIND};
use loom_core::{NamespacedName, ObjectKey, TypeKey};
use loom_store::{EventRecorder, ObjectStore, StoreProvider};
use loom_templates::Preprocessor;
use rustc_hash::FxHashSet;
use tracing::{debug, warn};

mod blueprint;
mod config;
mod error;
mod manager;
mod owner;
mod queue;
mod routing;
mod runnable;
mod tracker;

pub use config::ControllerConfig;
pub use error::ReconcileError;
pub use manager::{CancelHandle, Manager};
pub use queue::{Backoff, WorkQueue};
pub use tracker::DependencyTracker;

/// Template kinds; changes to any of them fan out to the blueprints and owners using them.
pub const TEMPLATE_KINDS: [&str; 6] = [
    "ClusterSourceTemplate",
    "ClusterImageTemplate",
    "ClusterConfigTemplate",
    "ClusterDeploymentTemplate",
    "ClusterTemplate",
    "ClusterRunTemplate",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Reconciler {
    Workload,
    Deliverable,
    SupplyChain,
    Delivery,
    Runnable,
}

impl Reconciler {
    pub const ALL: [Reconciler; 5] = [
        Reconciler::SupplyChain,
        Reconciler::Delivery,
        Reconciler::Workload,
        Reconciler::Deliverable,
        Reconciler::Runnable,
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            Reconciler::Workload => OwnerKind::Workload.as_str(),
            Reconciler::Deliverable => OwnerKind::Deliverable.as_str(),
            Reconciler::SupplyChain => BlueprintKind::SupplyChain.as_str(),
            Reconciler::Delivery => BlueprintKind::Delivery.as_str(),
            Reconciler::Runnable => RUNNABLE_KIND,
        }
    }

    pub fn from_kind(kind: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|r| r.kind() == kind)
    }

    pub fn for_owner(kind: OwnerKind) -> Self {
        match kind {
            OwnerKind::Workload => Reconciler::Workload,
            OwnerKind::Deliverable => Reconciler::Deliverable,
        }
    }

    pub fn for_blueprint(kind: BlueprintKind) -> Self {
        match kind {
            BlueprintKind::SupplyChain => Reconciler::SupplyChain,
            BlueprintKind::Delivery => Reconciler::Delivery,
        }
    }

    pub fn type_key(&self) -> TypeKey {
        TypeKey::loom(self.kind())
    }

    pub fn object_key(&self, key: &NamespacedName) -> ObjectKey {
        ObjectKey::loom(self.kind(), key.namespace.as_deref(), &key.name)
    }
}

/// One unit of work: which reconciler, for which object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkKey {
    pub reconciler: Reconciler,
    pub key: NamespacedName,
}

impl WorkKey {
    pub fn new(reconciler: Reconciler, key: NamespacedName) -> Self {
        Self { reconciler, key }
    }

    /// The work key reconciling `object`, when it is one of the reconciled kinds.
    pub fn of(object: &ObjectKey) -> Option<Self> {
        if object.api_version != loom_core::API_VERSION {
            return None;
        }
        Reconciler::from_kind(&object.kind).map(|r| Self::new(r, object.named()))
    }

    pub fn object_key(&self) -> ObjectKey {
        self.reconciler.object_key(&self.key)
    }
}

impl fmt::Display for WorkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.reconciler.kind(), self.key)
    }
}

struct Shared {
    store: Arc<dyn ObjectStore>,
    accounts: Arc<dyn StoreProvider>,
    events: Arc<dyn EventRecorder>,
    ytt: Arc<dyn Preprocessor>,
    tracker: Mutex<DependencyTracker>,
    watched: Mutex<FxHashSet<TypeKey>>,
}

/// Reconciles every loom kind against one store. Cheap to clone.
#[derive(Clone)]
pub struct Controller {
    shared: Arc<Shared>,
}

impl Controller {
    /// `store` reads loom kinds and templates and writes status; `accounts` hands out the
    /// service-account scoped handles stamped objects are written through; `events` records
    /// what happened to each owner's resources.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        accounts: Arc<dyn StoreProvider>,
        events: Arc<dyn EventRecorder>,
        ytt: Arc<dyn Preprocessor>,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                accounts,
                events,
                ytt,
                tracker: Mutex::new(DependencyTracker::default()),
                watched: Mutex::new(FxHashSet::default()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.shared.store
    }

    pub async fn reconcile(&self, work: &WorkKey) -> Result<(), ReconcileError> {
        debug!(work = %work, "reconciling");
        match work.reconciler {
            Reconciler::Workload => owner::reconcile(self, OwnerKind::Workload, work).await,
            Reconciler::Deliverable => owner::reconcile(self, OwnerKind::Deliverable, work).await,
            Reconciler::SupplyChain => blueprint::reconcile(self, BlueprintKind::SupplyChain, work).await,
            Reconciler::Delivery => blueprint::reconcile(self, BlueprintKind::Delivery, work).await,
            Reconciler::Runnable => runnable::reconcile(self, work).await,
        }
    }

    /// Every reconciled object currently in the store.
    pub async fn all_keys(&self) -> anyhow::Result<Vec<WorkKey>> {
        use anyhow::Context;
        let mut out = Vec::new();
        for r in Reconciler::ALL {
            let docs = self
                .shared
                .store
                .list(&r.type_key(), None, &Default::default())
                .await
                .with_context(|| format!("listing {}", r.kind()))?;
            out.extend(docs.iter().filter_map(ObjectKey::of).map(|k| WorkKey::new(r, k.named())));
        }
        Ok(out)
    }

    /// Types whose changes must reach the router from the start.
    pub fn static_types() -> Vec<TypeKey> {
        let mut v: Vec<TypeKey> = Reconciler::ALL.iter().map(Reconciler::type_key).collect();
        v.extend(TEMPLATE_KINDS.iter().map(|k| TypeKey::loom(k)));
        v
    }

    /// Start watching any of `types` not yet watched.
    pub async fn ensure_watched(&self, types: impl IntoIterator<Item = TypeKey>) {
        for ty in types {
            let fresh = self.shared.watched.lock().unwrap_or_else(|e| e.into_inner()).insert(ty.clone());
            if !fresh {
                continue;
            }
            if let Err(e) = self.shared.store.watch(&ty).await {
                warn!(gvk = %ty, error = %e, "unable to watch type");
                self.shared.watched.lock().unwrap_or_else(|e| e.into_inner()).remove(&ty);
            }
        }
    }

    fn track(&self, who: &WorkKey, objects: impl IntoIterator<Item = ObjectKey>) {
        self.shared.tracker.lock().unwrap_or_else(|e| e.into_inner()).track(who, objects);
    }

    fn forget(&self, who: &WorkKey) {
        self.shared.tracker.lock().unwrap_or_else(|e| e.into_inner()).forget(who);
    }

    fn dependents(&self, object: &ObjectKey) -> Vec<WorkKey> {
        self.shared.tracker.lock().unwrap_or_else(|e| e.into_inner()).dependents(object)
    }

    /// Objects the last reconcile of `who` read.
    pub fn tracked_by(&self, who: &WorkKey) -> Vec<ObjectKey> {
        self.shared.tracker.lock().unwrap_or_else(|e| e.into_inner()).tracked_by(who).to_vec()
    }
}
