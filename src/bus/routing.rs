//! Event patterns and the cross-pod route table.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{BusError, Event};

/// Which events a subscription or route listens to.
///
/// Textual forms:
/// - `*`: every event
/// - `aurora.*`: every event from pod `aurora`
/// - `aurora.booking_failed`: one qualified event type
/// - `booking_failed`: that event type from any pod
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EventPattern {
    /// Matches everything.
    Any,
    /// Matches every event from one pod.
    Pod(String),
    /// Matches one event type from any pod.
    Type(String),
    /// Matches one qualified event type.
    Exact {
        /// Source pod.
        pod: String,
        /// Event type.
        event_type: String,
    },
}

impl EventPattern {
    /// `true` if `event` is selected by this pattern.
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            EventPattern::Any => true,
            EventPattern::Pod(pod) => event.pod == *pod,
            EventPattern::Type(event_type) => event.event_type == *event_type,
            EventPattern::Exact { pod, event_type } => {
                event.pod == *pod && event.event_type == *event_type
            }
        }
    }
}

impl FromStr for EventPattern {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: &str| BusError::InvalidPattern {
            pattern: s.to_string(),
            reason: reason.to_string(),
        };

        let s = s.trim();
        if s.is_empty() {
            return Err(invalid("pattern is empty"));
        }
        if s == "*" {
            return Ok(EventPattern::Any);
        }
        if let Some(pod) = s.strip_suffix(".*") {
            if pod.is_empty() || pod.contains('*') || pod.contains('.') {
                return Err(invalid("pod glob must look like 'pod.*'"));
            }
            return Ok(EventPattern::Pod(pod.to_string()));
        }
        if s.contains('*') {
            return Err(invalid("only '*' and 'pod.*' globs are supported"));
        }
        match s.split_once('.') {
            Some((pod, event_type)) if !pod.is_empty() && !event_type.is_empty() => {
                Ok(EventPattern::Exact {
                    pod: pod.to_string(),
                    event_type: event_type.to_string(),
                })
            }
            Some(_) => Err(invalid("qualified type needs both pod and event type")),
            None => Ok(EventPattern::Type(s.to_string())),
        }
    }
}

impl TryFrom<String> for EventPattern {
    type Error = BusError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<EventPattern> for String {
    fn from(p: EventPattern) -> Self {
        p.to_string()
    }
}

impl fmt::Display for EventPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventPattern::Any => f.write_str("*"),
            EventPattern::Pod(pod) => write!(f, "{pod}.*"),
            EventPattern::Type(t) => f.write_str(t),
            EventPattern::Exact { pod, event_type } => write!(f, "{pod}.{event_type}"),
        }
    }
}

/// Optional payload condition on a route.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PayloadPredicate {
    /// `payload[key] == value`.
    Equals {
        /// Top-level payload key.
        key: String,
        /// Expected value.
        value: Value,
    },
    /// `key` is present.
    Exists {
        /// Top-level payload key.
        key: String,
    },
    /// `key` is absent.
    Absent {
        /// Top-level payload key.
        key: String,
    },
}

impl PayloadPredicate {
    /// Evaluate against an event payload.
    pub fn matches(&self, payload: &Map<String, Value>) -> bool {
        match self {
            PayloadPredicate::Equals { key, value } => payload.get(key) == Some(value),
            PayloadPredicate::Exists { key } => payload.contains_key(key),
            PayloadPredicate::Absent { key } => !payload.contains_key(key),
        }
    }
}

/// Static rule mapping one pod's event to a signal for another pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrossPodRoute {
    /// Which source events trigger the route.
    pub source: EventPattern,
    /// Extra condition on the source payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicate: Option<PayloadPredicate>,
    /// Pod the synthesized event is addressed to.
    pub target_pod: String,
    /// Event type of the synthesized event.
    pub target_action: String,
}

impl CrossPodRoute {
    /// Route with no payload predicate.
    pub fn new(source: EventPattern, target_pod: &str, target_action: &str) -> Self {
        Self {
            source,
            predicate: None,
            target_pod: target_pod.to_string(),
            target_action: target_action.to_string(),
        }
    }

    /// Add a payload predicate.
    pub fn when(mut self, predicate: PayloadPredicate) -> Self {
        self.predicate = Some(predicate);
        self
    }

    /// `true` if `event` should fire this route.
    pub fn matches(&self, event: &Event) -> bool {
        self.source.matches(event)
            && self
                .predicate
                .as_ref()
                .map_or(true, |p| p.matches(&event.payload))
    }

    /// Build the event delivered to the target pod.
    pub fn synthesize(&self, source: &Event) -> Event {
        let mut payload = Map::new();
        payload.insert("source_pod".into(), Value::String(source.pod.clone()));
        payload.insert(
            "source_event".into(),
            Value::String(source.event_type.clone()),
        );
        payload.insert("original".into(), Value::Object(source.payload.clone()));

        let mut event = Event::new(&self.target_pod, &self.target_action).with_payload(payload);
        event.hop = source.hop.saturating_add(1);
        event
    }
}

/// The cross-pod signal map of the source system.
pub fn default_routes() -> Vec<CrossPodRoute> {
    let exact = |pod: &str, event_type: &str| EventPattern::Exact {
        pod: pod.to_string(),
        event_type: event_type.to_string(),
    };
    vec![
        CrossPodRoute::new(exact("aurora", "booking_failed"), "syntropy", "generate_resource"),
        CrossPodRoute::new(exact("aurora", "booking_failed"), "janus", "analyze_objection"),
        CrossPodRoute::new(exact("janus", "regime_change"), "aurora", "trigger_upsell"),
        CrossPodRoute::new(
            exact("dan", "incident_detected"),
            "sentinel_prime",
            "analyze_incident",
        ),
        CrossPodRoute::new(exact("syntropy", "quiz_completed"), "ralph", "update_prd"),
    ]
}
