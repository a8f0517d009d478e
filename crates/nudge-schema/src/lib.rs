pub mod trigger;

pub use trigger::*;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque engagement topic tag, e.g. `meal_reminder` or `care-diabetes`.
pub type Topic = String;

pub const SOURCE_USER: &str = "user";
pub const SOURCE_TRIGGER_SELECTOR: &str = "trigger_selector";
pub const SOURCE_REPLY_GENERATOR: &str = "reply_generator";
pub const SOURCE_DEDUP_POLICY: &str = "dedup_policy";

/// Longest delay any configured interval may stand for: one hundred years.
pub const MAX_DELAY_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Configured seconds as a `Duration`, capped at [`MAX_DELAY_SECS`].
pub fn delay_from_secs(secs: u64) -> Duration {
    Duration::seconds(secs.min(MAX_DELAY_SECS) as i64)
}

/// `at + delay`, saturating at the last representable instant.
pub fn saturating_add(at: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    at.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    User,
    Assistant,
    SystemInject,
}

impl ChatRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChatRole::User => "user",
            ChatRole::Assistant => "assistant",
            ChatRole::SystemInject => "system_inject",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    Proactive,
    Passive,
}

/// Metadata attached to a chat record and echoed in `chat_message` events.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RecordMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<ChatMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<Topic>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub inject_skipped: bool,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub substituted_reply: bool,
    /// Keys written by older tooling that this crate does not model.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl RecordMeta {
    pub fn passive() -> Self {
        Self {
            mode: Some(ChatMode::Passive),
            ..Self::default()
        }
    }

    pub fn proactive(decision: &TriggerDecision) -> Self {
        Self {
            mode: Some(ChatMode::Proactive),
            trigger_reason: Some(decision.reason.clone()),
            trigger_id: Some(decision.trigger_id.clone()),
            event_type: Some(decision.event_type.clone()),
            ..Self::default()
        }
    }

    pub fn is_proactive(&self) -> bool {
        self.mode == Some(ChatMode::Proactive)
    }
}

/// One entry of a user's append-only chat history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRecord {
    pub ts: DateTime<Utc>,
    pub role: ChatRole,
    pub content: String,
    #[serde(default = "default_true")]
    pub visible: bool,
    #[serde(default)]
    pub source: String,
    #[serde(default)]
    pub meta: RecordMeta,
}

fn default_true() -> bool {
    true
}

impl ChatRecord {
    pub fn new(role: ChatRole, content: impl Into<String>, ts: DateTime<Utc>) -> Self {
        Self {
            ts,
            role,
            content: content.into(),
            visible: role != ChatRole::SystemInject,
            source: SOURCE_USER.to_string(),
            meta: RecordMeta::default(),
        }
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn with_meta(mut self, meta: RecordMeta) -> Self {
        self.meta = meta;
        self
    }

    /// Event type of a delivered proactive record.
    ///
    /// Prefers the structured `meta.event_type`; records written before that field existed
    /// only carry the tag inside their content.
    pub fn event_type(&self) -> Option<Topic> {
        self.meta
            .event_type
            .clone()
            .or_else(|| parse_event_type(&self.content))
    }
}

/// Per-user proactive run state, persisted between process restarts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunState {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default, alias = "last_proactive_at")]
    pub last_run_at: Option<DateTime<Utc>>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            enabled: true,
            cooldown_until: None,
            last_run_at: None,
        }
    }
}

impl RunState {
    pub fn is_cooling_down(&self, now: DateTime<Utc>) -> bool {
        self.cooldown_until.is_some_and(|until| now < until)
    }

    /// Records a run at `now` and pushes the cooldown out, never pulling it earlier.
    pub fn extend_cooldown(&mut self, now: DateTime<Utc>, cooldown: Duration) {
        let candidate = saturating_add(now, cooldown);
        self.cooldown_until = Some(match self.cooldown_until {
            Some(existing) if existing > candidate => existing,
            _ => candidate,
        });
        self.last_run_at = Some(now);
    }

    pub fn clear_cooldown(&mut self) {
        self.cooldown_until = None;
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessage {
    pub user_id: String,
    pub role: ChatRole,
    pub text: String,
    #[serde(default)]
    pub meta: RecordMeta,
}

/// Events fanned out by the broadcast hub.
#[derive(Debug, Clone, PartialEq)]
pub enum StateEvent {
    ProfileUpdate {
        user_id: String,
        profile: Value,
    },
    ScheduleUpdate {
        user_id: String,
        schedule: Option<Value>,
    },
    ChatMessage(ChatMessage),
    StateError {
        message: String,
    },
}

impl StateEvent {
    pub const PROFILE_UPDATE: &'static str = "profile_update";
    pub const SCHEDULE_UPDATE: &'static str = "schedule_update";
    pub const CHAT_MESSAGE: &'static str = "chat_message";
    pub const STATE_ERROR: &'static str = "state_error";

    pub fn name(&self) -> &'static str {
        match self {
            StateEvent::ProfileUpdate { .. } => Self::PROFILE_UPDATE,
            StateEvent::ScheduleUpdate { .. } => Self::SCHEDULE_UPDATE,
            StateEvent::ChatMessage(_) => Self::CHAT_MESSAGE,
            StateEvent::StateError { .. } => Self::STATE_ERROR,
        }
    }

    pub fn data(&self) -> Value {
        match self {
            StateEvent::ProfileUpdate { user_id, profile } => {
                serde_json::json!({ "user_id": user_id, "profile": profile })
            }
            StateEvent::ScheduleUpdate { user_id, schedule } => {
                serde_json::json!({ "user_id": user_id, "schedule": schedule })
            }
            StateEvent::ChatMessage(message) => {
                serde_json::to_value(message).unwrap_or(Value::Null)
            }
            StateEvent::StateError { message } => serde_json::json!({ "message": message }),
        }
    }

    /// User the event is about, if any.
    pub fn user_id(&self) -> Option<&str> {
        match self {
            StateEvent::ProfileUpdate { user_id, .. }
            | StateEvent::ScheduleUpdate { user_id, .. } => Some(user_id),
            StateEvent::ChatMessage(message) => Some(&message.user_id),
            StateEvent::StateError { .. } => None,
        }
    }
}
