use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use nudge_memory::{display_name, DocumentStore, PROFILE_DOC};
use nudge_schema::Topic;
use serde_json::Value;
use tracing::warn;

/// Topics every user can be engaged about.
pub const BASE_TOPICS: [&str; 29] = [
    "reminder-hydration",
    "reminder-stretch",
    "reminder-glucose-check",
    "reminder-walk",
    "medication-reminder",
    "plan-day",
    "plan-glucose",
    "plan-medication",
    "meal-breakfast-ideas",
    "meal-lunch-ideas",
    "meal-dinner-ideas",
    "meal-snack-plan",
    "ingredient-tips",
    "food-suggestion",
    "chat-family-health",
    "chat-work-break",
    "chat-money-stress",
    "chat-exercise",
    "chat-diet-tricks",
    "chat-glucose-trivia",
    "chat-health-joke",
    "interaction-topic",
    "game-quiz",
    "game-mini-challenge",
    "care-stress",
    "care-low-mood",
    "greeting-morning",
    "greeting-night",
    "greeting-weekend",
];

/// Used when a pool somehow ends up empty.
pub const FALLBACK_TOPIC: &str = "chat-work-break";

/// Per-user documents mined for dynamic topics.
pub const USER_DATA_DOCS: [&str; 6] = [
    "profile_static",
    "health_record",
    "diet_2w",
    "recent_events",
    "habits",
    "smalltalk",
];

const BRIEF_LIMIT: usize = 300;
const HINT_SUMMARY_LIMIT: usize = 100;
const TOPIC_NAME_LIMIT: usize = 12;

/// User documents keyed by name; missing or unreadable ones are absent.
#[derive(Debug, Clone, Default)]
pub struct UserData {
    docs: HashMap<String, Value>,
}

impl UserData {
    pub fn insert(&mut self, name: impl Into<String>, doc: Value) {
        self.docs.insert(name.into(), doc);
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.docs.get(name)
    }

    fn str_field(&self, doc: &str, field: &str) -> Option<&str> {
        self.get(doc)?
            .get(field)?
            .as_str()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    fn list_field(&self, doc: &str, field: &str) -> &[Value] {
        self.get(doc)
            .and_then(|d| d.get(field))
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}

/// Everything the selector needs about one user, read in a single pass.
#[derive(Debug, Clone, Default)]
pub struct PoolSnapshot {
    pub candidates: BTreeSet<Topic>,
    pub hints: HashMap<Topic, String>,
    pub brief: String,
    pub display_name: Option<String>,
}

impl PoolSnapshot {
    pub fn hint(&self, topic: &str) -> Option<&str> {
        self.hints.get(topic).map(String::as_str)
    }
}

pub struct TopicPool {
    docs: Arc<dyn DocumentStore>,
    base: Vec<Topic>,
}

impl TopicPool {
    pub fn new(docs: Arc<dyn DocumentStore>) -> Self {
        Self::with_base_topics(docs, BASE_TOPICS.iter().map(|t| t.to_string()).collect())
    }

    pub fn with_base_topics(docs: Arc<dyn DocumentStore>, base: Vec<Topic>) -> Self {
        Self { docs, base }
    }

    pub fn documents(&self) -> &Arc<dyn DocumentStore> {
        &self.docs
    }

    pub async fn load_user_data(&self, user_id: &str) -> UserData {
        let mut data = UserData::default();
        for name in USER_DATA_DOCS.iter().chain(std::iter::once(&PROFILE_DOC)) {
            match self.docs.get(user_id, name).await {
                Ok(Some(doc)) => data.insert(*name, doc),
                Ok(None) => {}
                Err(error) => warn!(user_id, doc = *name, %error, "skipping unreadable user document"),
            }
        }
        data
    }

    pub async fn snapshot(&self, user_id: &str) -> PoolSnapshot {
        let data = self.load_user_data(user_id).await;
        let (derived, hints) = derive_topics(&data);

        let mut candidates: BTreeSet<Topic> = self.base.iter().cloned().collect();
        candidates.extend(derived);
        if candidates.is_empty() {
            candidates.insert(FALLBACK_TOPIC.to_string());
        }

        let display_name = data
            .get(PROFILE_DOC)
            .and_then(display_name)
            .or_else(|| data.str_field("profile_static", "name").map(str::to_string));

        PoolSnapshot {
            candidates,
            hints,
            brief: build_brief(&data),
            display_name,
        }
    }

    pub async fn candidates(&self, user_id: &str) -> BTreeSet<Topic> {
        self.snapshot(user_id).await.candidates
    }
}

/// Topic-safe form of a free-text name: no whitespace or brackets, bounded length.
pub fn topic_slug(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| {
            if c.is_whitespace() || c == '[' || c == ']' {
                '_'
            } else {
                c
            }
        })
        .take(TOPIC_NAME_LIMIT)
        .collect()
}

fn truncate(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}

fn name_of(item: &Value) -> Option<String> {
    match item {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map.get("name").and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
    .filter(|s| !s.trim().is_empty())
}

fn text_of(item: &Value, field: &str) -> String {
    item.get(field)
        .map(|v| match v {
            Value::String(s) => s.clone(),
            Value::Null => String::new(),
            other => other.to_string(),
        })
        .unwrap_or_default()
}

/// Topics and hints derived from health, diet, event, habit and small-talk documents.
pub fn derive_topics(data: &UserData) -> (Vec<Topic>, HashMap<Topic, String>) {
    let mut topics = Vec::new();
    let mut hints = HashMap::new();
    let mut add = |topic: String, hint: String| {
        if !topics.contains(&topic) {
            topics.push(topic.clone());
        }
        hints.insert(topic, hint);
    };

    for condition in data.list_field("health_record", "conditions").iter().take(3) {
        let name = name_of(condition).unwrap_or_else(|| "health".to_string());
        add(
            format!("care-{}", topic_slug(&name)),
            format!("condition: {name}; status: {}", text_of(condition, "status")),
        );
    }

    for medication in data.list_field("health_record", "medications").iter().take(2) {
        let name = name_of(medication).unwrap_or_else(|| "meds".to_string());
        add(
            format!("medication-{}", topic_slug(&name)),
            format!("medication: {name}; dose: {}", text_of(medication, "dose")),
        );
    }

    if let Some(summary) = data.str_field("diet_2w", "summary") {
        add(
            "diet-recent-meals".to_string(),
            truncate(summary, HINT_SUMMARY_LIMIT),
        );
    }

    for keyword in data
        .list_field("recent_events", "summary_keywords")
        .iter()
        .take(4)
    {
        let keyword = match keyword {
            Value::String(s) => s.trim().to_string(),
            other => other.to_string(),
        };
        if keyword.is_empty() {
            continue;
        }
        add(
            format!("chat-{}", topic_slug(&keyword)),
            format!("recent keyword: {keyword}"),
        );
    }

    for routine in data.list_field("habits", "routines").iter().take(3) {
        let name = name_of(routine).unwrap_or_else(|| "habit".to_string());
        add(
            format!("habit-{}", topic_slug(&name)),
            format!("habit: {name}"),
        );
    }

    if let Some(summary) = data.str_field("smalltalk", "summary") {
        add(
            "chat-recent-gossip".to_string(),
            truncate(summary, HINT_SUMMARY_LIMIT),
        );
    }

    (topics, hints)
}

/// Compact digest of the user's records for the completion prompt.
pub fn build_brief(data: &UserData) -> String {
    let mut pieces = Vec::new();
    if let Some(summary) = data.str_field("health_record", "summary") {
        pieces.push(format!("health: {summary}"));
    }
    if let Some(summary) = data.str_field("diet_2w", "summary") {
        pieces.push(format!("diet: {summary}"));
    }
    let keywords: Vec<String> = data
        .list_field("recent_events", "summary_keywords")
        .iter()
        .take(4)
        .map(|k| k.as_str().map(str::to_string).unwrap_or_else(|| k.to_string()))
        .collect();
    if !keywords.is_empty() {
        pieces.push(format!("recent events: {}", keywords.join(", ")));
    }
    if let Some(summary) = data.str_field("habits", "summary") {
        pieces.push(format!("habits: {summary}"));
    }
    if let Some(summary) = data.str_field("smalltalk", "summary") {
        pieces.push(format!("small talk: {summary}"));
    }
    truncate(&pieces.join("; "), BRIEF_LIMIT)
}
