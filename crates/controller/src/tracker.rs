use loom_core::ObjectKey;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::WorkKey;

/// Remembers which objects each reconcile read, so a change to any of them requeues the
/// reconcilers that depend on it.
#[derive(Debug, Default)]
pub struct DependencyTracker {
    by_object: FxHashMap<ObjectKey, FxHashSet<WorkKey>>,
    by_dependent: FxHashMap<WorkKey, Vec<ObjectKey>>,
}

impl DependencyTracker {
    /// Replace everything `who` depends on.
    pub fn track(&mut self, who: &WorkKey, objects: impl IntoIterator<Item = ObjectKey>) {
        self.forget(who);
        let mut keys: Vec<ObjectKey> = objects.into_iter().collect();
        keys.sort();
        keys.dedup();
        for k in &keys {
            self.by_object.entry(k.clone()).or_default().insert(who.clone());
        }
        if !keys.is_empty() {
            self.by_dependent.insert(who.clone(), keys);
        }
    }

    pub fn forget(&mut self, who: &WorkKey) {
        let Some(old) = self.by_dependent.remove(who) else { return };
        for k in old {
            if let Some(set) = self.by_object.get_mut(&k) {
                set.remove(who);
                if set.is_empty() {
                    self.by_object.remove(&k);
                }
            }
        }
    }

    pub fn dependents(&self, object: &ObjectKey) -> Vec<WorkKey> {
        let mut out: Vec<WorkKey> = self.by_object.get(object).map(|s| s.iter().cloned().collect()).unwrap_or_default();
        out.sort();
        out
    }

    pub fn tracked_by(&self, who: &WorkKey) -> &[ObjectKey] {
        self.by_dependent.get(who).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.by_object.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_object.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Reconciler;
    use loom_core::NamespacedName;

    fn owner(name: &str) -> WorkKey {
        WorkKey::new(Reconciler::Workload, NamespacedName::new(Some("dev"), name))
    }

    fn template(name: &str) -> ObjectKey {
        ObjectKey::loom("ClusterTemplate", None, name)
    }

    #[test]
    fn retracking_replaces_previous_reads() {
        let mut t = DependencyTracker::default();
        t.track(&owner("a"), [template("x"), template("y")]);
        t.track(&owner("b"), [template("y")]);
        assert_eq!(t.dependents(&template("y")), vec![owner("a"), owner("b")]);

        t.track(&owner("a"), [template("z")]);
        assert!(t.dependents(&template("x")).is_empty());
        assert_eq!(t.dependents(&template("y")), vec![owner("b")]);
        assert_eq!(t.tracked_by(&owner("a")), &[template("z")]);

        t.forget(&owner("b"));
        assert_eq!(t.len(), 1);
    }
}
