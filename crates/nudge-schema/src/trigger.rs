use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::Topic;

static TRIGGER_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[TRIGGER:([^\]\s]+)\]").expect("valid trigger tag regex"));
static LENIENT_TAG: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\]\s]+)\]").expect("valid lenient tag regex"));

/// Extracts the canonical event type from a trigger context.
///
/// `[TRIGGER:<token>]` wins; otherwise the first bare `[<token>]` is used.
pub fn parse_event_type(context: &str) -> Option<Topic> {
    TRIGGER_TAG
        .captures(context)
        .or_else(|| LENIENT_TAG.captures(context))
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
}

pub fn trigger_tag(topic: &str) -> String {
    format!("[TRIGGER:{topic}]")
}

/// A validated decision to engage the user about one topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TriggerDecision {
    pub triggered: bool,
    pub reason: String,
    pub event_type: Topic,
    /// Free-form text for the reply generator; always carries `[TRIGGER:<event_type>]`.
    pub context: String,
    pub trigger_id: String,
}

/// Decision as returned by the completion capability, before any field is trusted.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawDecision {
    #[serde(default)]
    pub trigger: Option<Value>,
    #[serde(default)]
    pub reason: Option<String>,
    #[serde(default)]
    pub event_type: Option<String>,
    #[serde(default)]
    pub trigger_context: Option<String>,
    #[serde(default)]
    pub trigger_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecisionError {
    #[error("decision did not trigger")]
    NotTriggered,
    #[error("decision has an empty trigger context")]
    MissingContext,
    #[error("decision carries no event type")]
    MissingEventType,
    #[error("event type `{0}` was not among the offered topics")]
    TopicNotOffered(Topic),
}

impl RawDecision {
    fn triggered(&self) -> bool {
        match &self.trigger {
            Some(Value::Bool(flag)) => *flag,
            Some(Value::String(text)) => {
                matches!(text.trim().to_ascii_lowercase().as_str(), "true" | "yes" | "1")
            }
            Some(Value::Number(n)) => n.as_i64() == Some(1),
            _ => false,
        }
    }

    /// Checks presence and shape of every field against the topics that were offered.
    pub fn validate(self, options: &BTreeSet<Topic>) -> Result<TriggerDecision, DecisionError> {
        if !self.triggered() {
            return Err(DecisionError::NotTriggered);
        }

        let context = self
            .trigger_context
            .as_deref()
            .map(str::trim)
            .filter(|ctx| !ctx.is_empty())
            .ok_or(DecisionError::MissingContext)?;

        let structured = self
            .event_type
            .as_deref()
            .map(str::trim)
            .filter(|ty| !ty.is_empty() && !ty.contains(char::is_whitespace))
            .map(str::to_string);
        let event_type = parse_event_type(context)
            .or(structured)
            .ok_or(DecisionError::MissingEventType)?;

        if !options.contains(&event_type) {
            return Err(DecisionError::TopicNotOffered(event_type));
        }

        let tag = trigger_tag(&event_type);
        let context = if context.contains(&tag) {
            context.to_string()
        } else {
            format!("{tag}\n{context}")
        };

        let trigger_id = self
            .trigger_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        Ok(TriggerDecision {
            triggered: true,
            reason: self
                .reason
                .map(|r| r.trim().to_string())
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| "model_pick".to_string()),
            event_type,
            context,
            trigger_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(items: &[&str]) -> BTreeSet<Topic> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn canonical_tag_beats_earlier_bare_tag() {
        let ctx = "[note] something\n[TRIGGER:meal_reminder]";
        assert_eq!(parse_event_type(ctx).as_deref(), Some("meal_reminder"));
    }

    #[test]
    fn bare_tag_is_lenient_fallback() {
        assert_eq!(parse_event_type("[hydration]\nHint: water").as_deref(), Some("hydration"));
        assert_eq!(parse_event_type("[two words] hi"), None);
        assert_eq!(parse_event_type("no tags at all"), None);
    }

    #[test]
    fn valid_decision_is_accepted() {
        let raw = RawDecision {
            trigger: Some(Value::Bool(true)),
            reason: Some("lunch time".into()),
            event_type: Some("meal_reminder".into()),
            trigger_context: Some("[TRIGGER:meal_reminder]\nHint: lunch".into()),
            trigger_id: Some("abc".into()),
        };
        let decision = raw.validate(&options(&["meal_reminder"])).unwrap();
        assert_eq!(decision.event_type, "meal_reminder");
        assert_eq!(decision.trigger_id, "abc");
        assert!(decision.context.starts_with("[TRIGGER:meal_reminder]"));
    }

    #[test]
    fn structured_event_type_gets_canonical_tag_prepended() {
        let raw = RawDecision {
            trigger: Some(Value::String("true".into())),
            event_type: Some("hydration".into()),
            trigger_context: Some("Time for some water".into()),
            ..RawDecision::default()
        };
        let decision = raw.validate(&options(&["hydration"])).unwrap();
        assert_eq!(decision.context, "[TRIGGER:hydration]\nTime for some water");
        assert!(!decision.trigger_id.is_empty());
        assert_eq!(decision.reason, "model_pick");
    }

    #[test]
    fn rejects_missing_pieces() {
        let not_triggered = RawDecision {
            trigger: Some(Value::Bool(false)),
            trigger_context: Some("[TRIGGER:a]".into()),
            ..RawDecision::default()
        };
        assert_eq!(
            not_triggered.validate(&options(&["a"])),
            Err(DecisionError::NotTriggered)
        );

        let empty_context = RawDecision {
            trigger: Some(Value::Bool(true)),
            trigger_context: Some("   ".into()),
            ..RawDecision::default()
        };
        assert_eq!(
            empty_context.validate(&options(&["a"])),
            Err(DecisionError::MissingContext)
        );

        let untagged = RawDecision {
            trigger: Some(Value::Bool(true)),
            trigger_context: Some("hello there".into()),
            ..RawDecision::default()
        };
        assert_eq!(
            untagged.validate(&options(&["a"])),
            Err(DecisionError::MissingEventType)
        );
    }

    #[test]
    fn rejects_topic_outside_options() {
        let raw = RawDecision {
            trigger: Some(Value::Bool(true)),
            trigger_context: Some("[TRIGGER:sleep]".into()),
            ..RawDecision::default()
        };
        assert_eq!(
            raw.validate(&options(&["hydration"])),
            Err(DecisionError::TopicNotOffered("sleep".into()))
        );
    }
}
