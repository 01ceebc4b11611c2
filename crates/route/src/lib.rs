//! kexp routing: decide which receivers get an event.
//!
//! A [`Route`] holds ordered `drop` and `match` rules. Any matching drop rule
//! discards the event for that route. Otherwise every matching match rule
//! contributes its receiver and then whatever its nested route resolves to,
//! in declaration order. Resolution is pure: no state survives between calls.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use kexp_core::EnhancedEvent;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::SmallVec;

/// Regular expression searched anywhere in the value; the empty pattern matches everything.
#[derive(Clone)]
pub struct Pattern(Regex);

impl Pattern {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> { Regex::new(pattern).map(Self) }
    pub fn as_str(&self) -> &str { self.0.as_str() }
    pub fn is_match(&self, value: &str) -> bool { self.0.is_match(value) }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "Pattern({:?})", self.as_str()) }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool { self.as_str() == other.as_str() }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> { s.serialize_str(self.as_str()) }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(d)?;
        Pattern::new(&raw).map_err(|e| serde::de::Error::custom(format!("invalid pattern {:?}: {}", raw, e)))
    }
}

/// Predicate over event fields plus what to do when it matches.
///
/// Absent predicates match anything, so an empty rule matches every event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Rule {
    /// Label key must exist on the involved object and its value match.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, Pattern>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, Pattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<Pattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<Pattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<Pattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<Pattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<Pattern>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub type_: Option<Pattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<Pattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<Pattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_count: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<Box<Route>>,
}

impl Rule {
    /// Rule that sends everything to `name`.
    pub fn to_receiver(name: impl Into<String>) -> Self {
        Self { receiver: Some(name.into()), ..Default::default() }
    }

    pub fn matches(&self, ev: &EnhancedEvent) -> bool {
        let obj = &ev.involved_object;
        let fields = [
            (&self.message, ev.message()),
            (&self.api_version, obj.api_version()),
            (&self.kind, obj.kind()),
            (&self.namespace, ev.namespace()),
            (&self.reason, ev.reason()),
            (&self.type_, ev.type_()),
            (&self.component, ev.component()),
            (&self.host, ev.host()),
        ];
        if !fields.iter().all(|(p, v)| p.as_ref().map_or(true, |p| p.is_match(v))) {
            return false;
        }
        if !matches_map(&self.labels, &obj.labels) || !matches_map(&self.annotations, &obj.annotations) {
            return false;
        }
        match self.min_count {
            Some(min) => ev.count.unwrap_or(0) >= min,
            None => true,
        }
    }
}

fn matches_map(want: &BTreeMap<String, Pattern>, have: &BTreeMap<String, String>) -> bool {
    want.iter().all(|(k, p)| have.get(k).map_or(false, |v| p.is_match(v)))
}

/// Root (or nested) rule tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Route {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drop: Vec<Rule>,
    #[serde(rename = "match", default, skip_serializing_if = "Vec::is_empty")]
    pub match_: Vec<Rule>,
}

/// Receivers selected for one event, in resolution order.
pub type Destinations<'a> = SmallVec<[&'a str; 4]>;

impl Route {
    pub fn resolve<'a>(&'a self, ev: &EnhancedEvent) -> Destinations<'a> {
        let mut out = Destinations::new();
        self.resolve_into(ev, &mut out);
        out
    }

    fn resolve_into<'a>(&'a self, ev: &EnhancedEvent, out: &mut Destinations<'a>) {
        if self.drop.iter().any(|r| r.matches(ev)) {
            return;
        }
        for rule in self.match_.iter().filter(|r| r.matches(ev)) {
            if let Some(name) = rule.receiver.as_deref() {
                out.push(name);
            }
            if let Some(sub) = rule.route.as_deref() {
                sub.resolve_into(ev, out);
            }
        }
    }

    /// Every receiver named anywhere in the tree (match and drop rules).
    pub fn receivers(&self) -> Vec<&str> {
        let mut out = Vec::new();
        for rule in self.drop.iter().chain(self.match_.iter()) {
            if let Some(name) = rule.receiver.as_deref() { out.push(name); }
            if let Some(sub) = rule.route.as_deref() { out.extend(sub.receivers()); }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kexp_core::EnhancedObjectReference;

    fn pat(s: &str) -> Pattern { Pattern::new(s).unwrap() }

    fn pod_event() -> EnhancedEvent {
        let mut obj = EnhancedObjectReference::default();
        obj.reference.api_version = Some("v1".into());
        obj.reference.kind = Some("Pod".into());
        obj.reference.name = Some("web-1".into());
        obj.labels.insert("app".into(), "web".into());
        obj.annotations.insert("team".into(), "payments".into());
        EnhancedEvent {
            reason: Some("BackOff".into()),
            message: Some("Back-off restarting failed container".into()),
            type_: Some("Warning".into()),
            count: Some(4),
            involved_object: obj,
            metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
                namespace: Some("prod".into()),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn empty_rule_matches_everything() {
        assert!(Rule::default().matches(&pod_event()));
        assert!(Rule::default().matches(&EnhancedEvent::default()));
    }

    #[test]
    fn field_patterns_are_searched_not_anchored() {
        let ev = pod_event();
        let r = Rule { message: Some(pat("restarting")), kind: Some(pat("^Pod$")), ..Default::default() };
        assert!(r.matches(&ev));
        let r = Rule { reason: Some(pat("^Off")), ..Default::default() };
        assert!(!r.matches(&ev));
        let r = Rule { namespace: Some(pat("")), ..Default::default() };
        assert!(r.matches(&ev));
    }

    #[test]
    fn labels_require_key_and_matching_value() {
        let ev = pod_event();
        let mut r = Rule::default();
        r.labels.insert("app".into(), pat("we"));
        assert!(r.matches(&ev));
        r.labels.insert("tier".into(), pat(""));
        assert!(!r.matches(&ev), "missing label key must not match");
        let mut r = Rule::default();
        r.annotations.insert("team".into(), pat("^billing$"));
        assert!(!r.matches(&ev));
    }

    #[test]
    fn min_count_is_inclusive() {
        let ev = pod_event();
        assert!(Rule { min_count: Some(4), ..Default::default() }.matches(&ev));
        assert!(!Rule { min_count: Some(5), ..Default::default() }.matches(&ev));
    }

    #[test]
    fn invalid_pattern_is_rejected_on_deserialize() {
        let err = serde_yaml::from_str::<Rule>("reason: \"(unclosed\"").unwrap_err().to_string();
        assert!(err.contains("invalid pattern"), "{}", err);
    }

    #[test]
    fn receivers_lists_nested_names() {
        let route = Route {
            drop: vec![],
            match_: vec![
                Rule::to_receiver("a"),
                Rule { route: Some(Box::new(Route { drop: vec![], match_: vec![Rule::to_receiver("b")] })), ..Default::default() },
            ],
        };
        assert_eq!(route.receivers(), vec!["a", "b"]);
    }
}
