//! Condition catalog and the pure status aggregator.
//!
//! Every condition type and reason written by loom comes from the enums below; the
//! only free-form reasons are those mirrored from a stamped object's own conditions.

use std::fmt;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    #[serde(other)]
    Unknown,
}

impl ConditionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConditionStatus::True => "True",
            ConditionStatus::False => "False",
            ConditionStatus::Unknown => "Unknown",
        }
    }

    // False dominates Unknown dominates True.
    fn severity(&self) -> u8 {
        match self {
            ConditionStatus::True => 0,
            ConditionStatus::Unknown => 1,
            ConditionStatus::False => 2,
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

macro_rules! catalog {
    ($(#[$m:meta])* $name:ident { $($variant:ident),* $(,)? }) => {
        $(#[$m])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum $name { $($variant),* }

        impl $name {
            pub const fn as_str(&self) -> &'static str {
                match self { $(Self::$variant => stringify!($variant)),* }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl From<$name> for String {
            fn from(v: $name) -> String { v.as_str().to_string() }
        }
    };
}

catalog!(
    /// Condition types written on owners, blueprints, runnables and resource statuses.
    ConditionType {
        Ready,
        SupplyChainReady,
        DeliveryReady,
        ResourcesSubmitted,
        ResourcesHealthy,
        TemplatesReady,
        RunTemplateReady,
        StampedObjectCondition,
        ResourceSubmitted,
        Healthy,
        Succeeded,
    }
);

catalog!(
    Reason {
        Ready,
        Unknown,
        // blueprint selection
        LabelsMissing,
        NotFound,
        MultipleMatches,
        MissingReady,
        BlueprintInvalid,
        TemplatesNotFound,
        // realization
        TemplateObjectRetrievalFailure,
        TemplateStampFailure,
        TemplateRejectedByAPIServer,
        ServiceAccountSecretError,
        ResourceRealizerBuilderError,
        ResolveTemplateOptionsError,
        TemplateOptionsMatchError,
        ConditionNotMet,
        FailedConditionMet,
        MissingValueAtPath,
        UnknownError,
        // health
        AlwaysHealthy,
        OutputAvailable,
        NoResource,
        NoStampedObject,
        OutputNotAvailable,
        MatchedCondition,
        MatchedField,
        NoMatchesFulfilled,
        HealthyConditionRule,
        // runnables
        RunTemplateNotFound,
        StampedObjectRejectedByAPIServer,
        FailedToListCreatedObjects,
        OutputPathNotSatisfied,
        ClientBuilderError,
        SucceededCondition,
    }
);

/// Reason for a single-condition health rule, e.g. `ReadyCondition`.
pub fn condition_type_reason(type_: &str) -> String {
    format!("{}Condition", type_)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            last_transition_time: None,
            observed_generation: None,
        }
    }

    pub fn ok(type_: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::new(type_, ConditionStatus::True, reason, "")
    }

    pub fn failed(type_: impl Into<String>, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(type_, ConditionStatus::False, reason, message)
    }

    pub fn unknown(type_: impl Into<String>, reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(type_, ConditionStatus::Unknown, reason, message)
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }

    pub fn is_false(&self) -> bool {
        self.status == ConditionStatus::False
    }

    /// Equal `(status, reason, message)`.
    pub fn same_content(&self, other: &Condition) -> bool {
        self.status == other.status && self.reason == other.reason && self.message == other.message
    }
}

/// Current time truncated to whole seconds, the resolution conditions are stored with.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(0)
}

pub fn find<'a>(conds: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conds.iter().find(|c| c.type_ == type_)
}

/// Top-level reduction: the first sub-condition with the highest severity provides status,
/// reason and message. All True gives reason `Ready`; nothing to reduce gives Unknown.
pub fn reduce(top: impl Into<String>, subs: &[Condition]) -> Condition {
    let top = top.into();
    let worst = subs.iter().fold(None::<&Condition>, |acc, c| match acc {
        Some(w) if w.status.severity() >= c.status.severity() => Some(w),
        _ => Some(c),
    });
    match worst {
        None => Condition::unknown(top, Reason::Unknown, ""),
        Some(c) if c.status == ConditionStatus::True => Condition::ok(top, Reason::Ready),
        Some(c) => Condition::new(top, c.status, c.reason.clone(), c.message.clone()),
    }
}

/// Merge a freshly computed condition list with the previously stored one.
///
/// Conditions whose `(status, reason, message)` did not change keep their previous
/// `lastTransitionTime`; everything else is stamped with `now`. `changed` is set when any
/// content changed or a condition type appeared or disappeared.
pub fn merge(prev: &[Condition], incremental: Vec<Condition>, now: DateTime<Utc>) -> (Vec<Condition>, bool) {
    let mut changed = false;
    let mut merged = Vec::with_capacity(incremental.len());
    for mut c in incremental {
        match find(prev, &c.type_) {
            Some(p) if p.same_content(&c) && p.last_transition_time.is_some() => {
                c.last_transition_time = p.last_transition_time;
                if p.observed_generation != c.observed_generation {
                    changed = true;
                }
            }
            _ => {
                c.last_transition_time = Some(now);
                changed = true;
            }
        }
        merged.push(c);
    }
    if prev.iter().any(|p| find(&merged, &p.type_).is_none()) {
        changed = true;
    }
    (merged, changed)
}

/// Accumulates sub-conditions for one status and finalizes them with a top-level condition.
#[derive(Debug, Clone)]
pub struct ConditionSet {
    top: String,
    subs: Vec<Condition>,
}

impl ConditionSet {
    pub fn new(top: impl Into<String>) -> Self {
        Self { top: top.into(), subs: Vec::new() }
    }

    /// Add or replace a sub-condition by type.
    pub fn add(&mut self, c: Condition) {
        match self.subs.iter_mut().find(|s| s.type_ == c.type_) {
            Some(slot) => *slot = c,
            None => self.subs.push(c),
        }
    }

    pub fn get(&self, type_: &str) -> Option<&Condition> {
        find(&self.subs, type_)
    }

    pub fn top(&self) -> Condition {
        reduce(self.top.clone(), &self.subs)
    }

    /// `(conditions, changed)` with the top-level condition first.
    pub fn finalize(self, prev: &[Condition], now: DateTime<Utc>) -> (Vec<Condition>, bool) {
        let top = self.top();
        let mut all = Vec::with_capacity(self.subs.len() + 1);
        all.push(top);
        all.extend(self.subs);
        merge(prev, all, now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).single().unwrap()
    }

    #[test]
    fn reduce_prefers_false_over_unknown() {
        let subs = vec![
            Condition::ok(ConditionType::SupplyChainReady, Reason::Ready),
            Condition::unknown(ConditionType::ResourcesSubmitted, Reason::MissingValueAtPath, "waiting"),
            Condition::failed(ConditionType::ResourcesHealthy, Reason::HealthyConditionRule, "bad"),
        ];
        let top = reduce(ConditionType::Ready, &subs);
        assert_eq!(top.status, ConditionStatus::False);
        assert_eq!(top.reason, "HealthyConditionRule");
        assert_eq!(top.message, "bad");

        let top = reduce(ConditionType::Ready, &subs[..2]);
        assert_eq!(top.status, ConditionStatus::Unknown);
        assert_eq!(top.reason, "MissingValueAtPath");

        let top = reduce(ConditionType::Ready, &subs[..1]);
        assert!(top.is_true());
        assert_eq!(top.reason, "Ready");

        let top = reduce(ConditionType::Ready, &[]);
        assert_eq!(top.status, ConditionStatus::Unknown);
        assert_eq!(top.reason, "Unknown");
    }

    #[test]
    fn reduce_mirrors_first_of_equal_severity() {
        let subs = vec![
            Condition::failed("A", "First", "one"),
            Condition::failed("B", "Second", "two"),
        ];
        assert_eq!(reduce("Ready", &subs).reason, "First");
    }

    #[test]
    fn merge_keeps_transition_time_for_unchanged_content() {
        let mut set = ConditionSet::new(ConditionType::Ready);
        set.add(Condition::ok(ConditionType::ResourcesSubmitted, Reason::Ready));
        let (first, changed) = set.clone().finalize(&[], t(0));
        assert!(changed);
        assert!(first.iter().all(|c| c.last_transition_time == Some(t(0))));

        let (second, changed) = set.finalize(&first, t(60));
        assert!(!changed);
        assert_eq!(second, first);
    }

    #[test]
    fn merge_stamps_changed_conditions_only() {
        let prev = vec![
            Condition { last_transition_time: Some(t(0)), ..Condition::ok("A", "Ready") },
            Condition { last_transition_time: Some(t(0)), ..Condition::ok("B", "Ready") },
        ];
        let next = vec![Condition::ok("A", "Ready"), Condition::failed("B", "Broken", "x")];
        let (merged, changed) = merge(&prev, next, t(5));
        assert!(changed);
        assert_eq!(merged[0].last_transition_time, Some(t(0)));
        assert_eq!(merged[1].last_transition_time, Some(t(5)));
    }

    #[test]
    fn merge_detects_removed_conditions() {
        let prev = vec![
            Condition { last_transition_time: Some(t(0)), ..Condition::ok("A", "Ready") },
            Condition { last_transition_time: Some(t(0)), ..Condition::ok("B", "Ready") },
        ];
        let (merged, changed) = merge(&prev, vec![Condition::ok("A", "Ready")], t(5));
        assert!(changed);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].last_transition_time, Some(t(0)));
    }

    #[test]
    fn add_replaces_by_type() {
        let mut set = ConditionSet::new("Ready");
        set.add(Condition::unknown("A", "Waiting", ""));
        set.add(Condition::ok("A", "Ready"));
        assert!(set.get("A").unwrap().is_true());
        assert!(set.top().is_true());
    }

    #[test]
    fn condition_serde_shape() {
        let c = Condition { last_transition_time: Some(t(0)), ..Condition::failed("Ready", "X", "m") };
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["type"], "Ready");
        assert_eq!(v["status"], "False");
        assert_eq!(v["lastTransitionTime"], "2023-11-14T22:13:20Z");
        let back: Condition = serde_json::from_value(serde_json::json!({"type": "Succeeded", "status": "Weird"})).unwrap();
        assert_eq!(back.status, ConditionStatus::Unknown);
        assert_eq!(condition_type_reason("Ready"), "ReadyCondition");
    }
}
