/// Field keys a selector may address on an owner document.
#[derive(Debug, Clone, Copy)]
pub struct OwnerPaths {
    pub exact: &'static [&'static str],
    pub prefixes: &'static [&'static str],
}

macro_rules! source_paths {
    ($($extra:literal),* $(,)?) => {
        &[
            "spec.source",
            "spec.source.git",
            "spec.source.git.url",
            "spec.source.git.ref",
            "spec.source.git.ref.branch",
            "spec.source.git.ref.tag",
            "spec.source.git.ref.commit",
            "spec.source.image",
            "spec.source.subPath",
            $($extra),*
        ]
    };
}

pub static WORKLOAD_PATHS: OwnerPaths = OwnerPaths {
    exact: source_paths!("spec.build", "spec.image", "spec.serviceAccountName"),
    prefixes: &["metadata", "spec.params", "spec.build.env", "spec.env", "spec.resources", "spec.serviceClaims"],
};

pub static DELIVERABLE_PATHS: OwnerPaths = OwnerPaths {
    exact: source_paths!("spec.serviceAccountName"),
    prefixes: &["metadata", "spec.params"],
};

/// Path table for an owner kind (`Workload` or `Deliverable`).
pub fn owner_paths(owner_kind: &str) -> Option<&'static OwnerPaths> {
    match owner_kind {
        "Workload" => Some(&WORKLOAD_PATHS),
        "Deliverable" => Some(&DELIVERABLE_PATHS),
        _ => None,
    }
}

/// Strip a `{}` wrapper, a leading dot and a `workload.`/`deliverable.` prefix.
pub fn normalize_owner_key(key: &str) -> &str {
    let mut k = key.trim();
    if let Some(rest) = k.strip_prefix('{') {
        k = rest.strip_suffix('}').unwrap_or(rest);
    }
    k = k.strip_prefix('.').unwrap_or(k);
    for prefix in ["workload.", "deliverable."] {
        if let Some(rest) = k.strip_prefix(prefix) {
            return rest;
        }
    }
    k
}

// `key` is `prefix` itself or a field or index below it.
fn under(key: &str, prefix: &str) -> bool {
    match key.strip_prefix(prefix) {
        Some(rest) => rest.is_empty() || rest.starts_with('.') || rest.starts_with('['),
        None => false,
    }
}

impl OwnerPaths {
    pub fn allows(&self, key: &str) -> bool {
        let k = normalize_owner_key(key);
        self.exact.iter().any(|p| *p == k) || self.prefixes.iter().any(|p| under(k, p))
    }
}
