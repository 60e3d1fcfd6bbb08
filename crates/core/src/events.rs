//! Events recorded against an owner while its blueprint is realized.

use std::fmt;

use crate::ObjectKey;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventReason {
    StampedObjectApplied,
    StampedObjectRemoved,
    ResourceOutputChanged,
    ResourceHealthyStatusChanged,
}

impl EventReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventReason::StampedObjectApplied => "StampedObjectApplied",
            EventReason::StampedObjectRemoved => "StampedObjectRemoved",
            EventReason::ResourceOutputChanged => "ResourceOutputChanged",
            EventReason::ResourceHealthyStatusChanged => "ResourceHealthyStatusChanged",
        }
    }
}

impl fmt::Display for EventReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `kind.group/name`, lower-cased kind; the core group has no suffix.
pub fn qualified_name(key: &ObjectKey) -> String {
    let kind = key.kind.to_lowercase();
    match key.api_version.split_once('/') {
        Some((group, _)) => format!("{}.{}/{}", kind, group, key.name),
        None => format!("{}/{}", kind, key.name),
    }
}

/// A normal-type event about one of the owner's resources.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnerEvent {
    pub reason: EventReason,
    pub note: String,
}

impl OwnerEvent {
    pub fn applied(object: &ObjectKey, created: bool) -> Self {
        let verb = if created { "Created" } else { "Patched" };
        Self { reason: EventReason::StampedObjectApplied, note: format!("{} object [{}]", verb, qualified_name(object)) }
    }

    pub fn removed(object: &ObjectKey) -> Self {
        Self { reason: EventReason::StampedObjectRemoved, note: format!("Deleted object [{}]", qualified_name(object)) }
    }

    /// `object` is `None` for pass-through resources.
    pub fn output_changed(resource: &str, object: Option<&ObjectKey>) -> Self {
        let note = match object {
            Some(o) => format!("[{}] found a new output in [{}]", resource, qualified_name(o)),
            None => format!("[{}] passed through a new output", resource),
        };
        Self { reason: EventReason::ResourceOutputChanged, note }
    }

    pub fn health_changed(resource: &str, object: Option<&ObjectKey>, status: &str) -> Self {
        let note = match object {
            Some(o) => format!("[{}] found healthy status in [{}] changed to [{}]", resource, qualified_name(o), status),
            None => format!("[{}] healthy status changed to [{}]", resource, status),
        };
        Self { reason: EventReason::ResourceHealthyStatusChanged, note }
    }
}
