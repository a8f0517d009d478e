use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use nudge_memory::{ChatHistoryStore, DocumentStore, DEFAULT_HISTORY_LIMIT, SCHEDULE_DOC};
use nudge_provider::{complete, LlmProvider};
use nudge_schema::{trigger_tag, ChatRecord, RawDecision, Topic, TriggerDecision};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::{IteratorRandom, SliceRandom};
use rand::SeedableRng;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::dedup::DeliveryHistory;
use crate::topic_pool::{PoolSnapshot, TopicPool, FALLBACK_TOPIC};

pub const DEFAULT_TIMEZONE: Tz = chrono_tz::Asia::Shanghai;
const DEFAULT_NAME: &str = "friend";
const USER_PROMPT: &str = "Answer with strict JSON only, no explanation.";

#[derive(Debug, Clone)]
pub struct SelectorConfig {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
    pub recent_window: usize,
    pub default_timezone: Tz,
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            model: nudge_provider::DEFAULT_MODEL.to_string(),
            max_tokens: 300,
            temperature: 0.5,
            recent_window: 3,
            default_timezone: DEFAULT_TIMEZONE,
        }
    }
}

/// Per-user inputs for one selection round, loaded once per tick.
#[derive(Debug, Clone)]
pub struct SelectionContext {
    pub user_id: String,
    pub snapshot: PoolSnapshot,
    pub timezone: Tz,
    pub history: Vec<ChatRecord>,
    pub deliveries: DeliveryHistory,
}

/// Picks the next engagement topic, asking the completion model first.
///
/// Never fails: any model, parse or validation problem ends in [`TriggerSelector::local_pick`].
pub struct TriggerSelector {
    pool: Arc<TopicPool>,
    chats: Arc<ChatHistoryStore>,
    provider: Option<Arc<dyn LlmProvider>>,
    config: SelectorConfig,
    rng: Mutex<StdRng>,
}

impl TriggerSelector {
    pub fn new(
        pool: Arc<TopicPool>,
        chats: Arc<ChatHistoryStore>,
        provider: Option<Arc<dyn LlmProvider>>,
        config: SelectorConfig,
    ) -> Self {
        Self {
            pool,
            chats,
            provider,
            config,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn pool(&self) -> &Arc<TopicPool> {
        &self.pool
    }

    pub async fn prepare(&self, user_id: &str) -> SelectionContext {
        let snapshot = self.pool.snapshot(user_id).await;
        let timezone = self.user_timezone(user_id).await;
        let history = match self.chats.load(user_id, DEFAULT_HISTORY_LIMIT).await {
            Ok(history) => history,
            Err(error) => {
                warn!(user_id, %error, "chat history unavailable, selecting without it");
                Vec::new()
            }
        };
        let deliveries = DeliveryHistory::from_records(&history);
        SelectionContext {
            user_id: user_id.to_string(),
            snapshot,
            timezone,
            history,
            deliveries,
        }
    }

    async fn user_timezone(&self, user_id: &str) -> Tz {
        schedule_timezone(self.pool.documents().as_ref(), user_id, self.config.default_timezone)
            .await
    }

    pub async fn select(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        excluded: &BTreeSet<Topic>,
    ) -> TriggerDecision {
        let ctx = self.prepare(user_id).await;
        self.decide(&ctx, now, excluded).await
    }

    pub async fn decide(
        &self,
        ctx: &SelectionContext,
        now: DateTime<Utc>,
        excluded: &BTreeSet<Topic>,
    ) -> TriggerDecision {
        let recent = ctx.deliveries.recent_types(self.config.recent_window);
        let mut avoid = excluded.clone();
        avoid.extend(recent.iter().cloned());

        let mut options: Vec<Topic> = ctx
            .snapshot
            .candidates
            .iter()
            .filter(|topic| !avoid.contains(*topic))
            .cloned()
            .collect();
        if options.is_empty() {
            options = ctx.snapshot.candidates.iter().cloned().collect();
        }
        options.shuffle(&mut *self.rng.lock());

        match self.ask_model(ctx, &options, &recent, now).await {
            Some(decision) => decision,
            None => self.local_pick(&ctx.snapshot, &avoid, now, ctx.timezone),
        }
    }

    async fn ask_model(
        &self,
        ctx: &SelectionContext,
        options: &[Topic],
        recent: &[Topic],
        now: DateTime<Utc>,
    ) -> Option<TriggerDecision> {
        let provider = self.provider.as_ref()?;
        let local = now.with_timezone(&ctx.timezone);
        let system = render_prompt(
            &local.format("%Y-%m-%d %H:%M").to_string(),
            options,
            recent,
            &ctx.snapshot.brief,
        );

        let text = match complete(
            provider.as_ref(),
            &self.config.model,
            &system,
            USER_PROMPT,
            self.config.max_tokens,
            self.config.temperature,
        )
        .await
        {
            Ok(text) => text,
            Err(error) => {
                warn!(user_id = %ctx.user_id, %error, "trigger completion failed, using local pick");
                return None;
            }
        };

        let Some(raw) = parse_raw_decision(&text) else {
            warn!(user_id = %ctx.user_id, "trigger completion was not a JSON object, using local pick");
            return None;
        };
        let offered: BTreeSet<Topic> = options.iter().cloned().collect();
        match raw.validate(&offered) {
            Ok(decision) => {
                debug!(user_id = %ctx.user_id, event_type = %decision.event_type, "model picked topic");
                Some(with_hint(decision, &ctx.snapshot))
            }
            Err(error) => {
                warn!(user_id = %ctx.user_id, %error, "trigger decision rejected, using local pick");
                None
            }
        }
    }

    /// Uniform pick among candidates outside `excluded`; the whole pool when nothing is left.
    pub fn local_pick(
        &self,
        snapshot: &PoolSnapshot,
        excluded: &BTreeSet<Topic>,
        now: DateTime<Utc>,
        timezone: Tz,
    ) -> TriggerDecision {
        let mut rng = self.rng.lock();
        let topic = snapshot
            .candidates
            .iter()
            .filter(|topic| !excluded.contains(*topic))
            .choose(&mut *rng)
            .or_else(|| snapshot.candidates.iter().choose(&mut *rng))
            .cloned()
            .unwrap_or_else(|| FALLBACK_TOPIC.to_string());
        drop(rng);

        let local = now.with_timezone(&timezone);
        let name = snapshot.display_name.as_deref().unwrap_or(DEFAULT_NAME);
        TriggerDecision {
            triggered: true,
            reason: "forced_pick".to_string(),
            context: forced_context(
                &topic,
                &local.format("%Y-%m-%d %H:%M").to_string(),
                snapshot.hint(&topic),
                name,
            ),
            event_type: topic,
            trigger_id: format!("forced-{}", Uuid::new_v4()),
        }
    }
}

fn forced_context(topic: &str, local_time: &str, hint: Option<&str>, name: &str) -> String {
    let mut lines = vec![trigger_tag(topic), format!("Time: {local_time}")];
    if let Some(hint) = hint {
        lines.push(format!("Hint: {hint}"));
    }
    lines.push(format!("Hi {name}, shall we chat about this?"));
    lines.join("\n")
}

fn with_hint(mut decision: TriggerDecision, snapshot: &PoolSnapshot) -> TriggerDecision {
    if let Some(hint) = snapshot.hint(&decision.event_type) {
        if !decision.context.contains(hint) {
            decision.context = format!("{}\nHint: {hint}", decision.context);
        }
    }
    decision
}

fn render_prompt(current_time: &str, options: &[Topic], recent: &[Topic], brief: &str) -> String {
    let options = serde_json::to_string(options).unwrap_or_else(|_| "[]".to_string());
    let recent = serde_json::to_string(recent).unwrap_or_else(|_| "[]".to_string());
    format!(
        "You are the proactive trigger scheduler of a health companion assistant.\n\
         Inputs: the current time, a shuffled list of topic options, the 3 most recent triggers \
         and a brief of the user's records (health, medication, diet, recent events, habits).\n\
         Task: pick exactly 1 topic from options (only from the list) and output JSON:\n\
         {{\"trigger\": true, \"reason\": \"short reason\", \"event_type\": \"<topic>\", \
         \"trigger_context\": \"<event block>\", \"trigger_id\": \"optional\"}}\n\
         trigger_context must follow the event format:\n\
         [TRIGGER:<topic>]\nTime: YYYY-MM-DD HH:MM\nWeather: <optional>\nLocation: <optional>\n\
         User state: <optional>\nOther context: <optional>\n\
         Rules:\n\
         1) do not repeat recent_triggers;\n\
         2) use clues from data_brief (conditions, medication, diet, recent events, habits);\n\
         3) keep a friendly tone, never encourage staying up late or late-night snacks;\n\
         4) with too little data pick any health or small-talk topic, still from options.\n\n\
         current_time: {current_time}\n\
         options: {options}\n\
         recent_triggers: {recent}\n\
         data_brief: {brief}"
    )
}

/// The timezone named in the user's schedule document, or `default`.
pub async fn schedule_timezone(docs: &dyn DocumentStore, user_id: &str, default: Tz) -> Tz {
    let schedule = match docs.get(user_id, SCHEDULE_DOC).await {
        Ok(schedule) => schedule,
        Err(error) => {
            warn!(user_id, %error, "schedule unreadable, using default timezone");
            None
        }
    };
    schedule
        .as_ref()
        .and_then(|s| s.get("timezone"))
        .and_then(|tz| tz.as_str())
        .and_then(|name| match name.parse::<Tz>() {
            Ok(tz) => Some(tz),
            Err(_) => {
                warn!(user_id, timezone = name, "unknown timezone in schedule");
                None
            }
        })
        .unwrap_or(default)
}

/// Reads a decision object out of loosely formatted model output.
///
/// Accepts code fences, prose around the object, and Python-style literals
/// (single quotes, `True`/`False`/`None`).
pub fn parse_raw_decision(text: &str) -> Option<RawDecision> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    let body = &text[start..=end];
    serde_json::from_str(body)
        .ok()
        .or_else(|| serde_json::from_str(&normalize_pseudo_json(body)).ok())
}

fn normalize_pseudo_json(body: &str) -> String {
    let mut out = String::with_capacity(body.len());
    let mut quote: Option<char> = None;
    let mut escaped = false;
    let mut word = String::new();

    let flush = |word: &mut String, out: &mut String| {
        match word.as_str() {
            "True" => out.push_str("true"),
            "False" => out.push_str("false"),
            "None" => out.push_str("null"),
            other => out.push_str(other),
        }
        word.clear();
    };

    for c in body.chars() {
        match quote {
            Some(q) => {
                if escaped {
                    escaped = false;
                    if c == '\'' {
                        out.pop();
                    }
                    out.push(c);
                } else if c == '\\' {
                    escaped = true;
                    out.push(c);
                } else if c == q {
                    quote = None;
                    out.push('"');
                } else if c == '"' {
                    out.push_str("\\\"");
                } else {
                    out.push(c);
                }
            }
            None => {
                if c.is_ascii_alphabetic() {
                    word.push(c);
                    continue;
                }
                flush(&mut word, &mut out);
                if c == '\'' || c == '"' {
                    quote = Some(c);
                    out.push('"');
                } else {
                    out.push(c);
                }
            }
        }
    }
    flush(&mut word, &mut out);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use chrono::TimeZone;
    use nudge_memory::{DocumentStore, MemoryDocumentStore};
    use nudge_provider::{LlmRequest, LlmResponse};
    use nudge_schema::parse_event_type;
    use serde_json::json;

    struct Scripted(String);

    #[async_trait]
    impl LlmProvider for Scripted {
        async fn chat(&self, _request: LlmRequest) -> Result<LlmResponse> {
            Ok(LlmResponse {
                text: self.0.clone(),
                input_tokens: None,
                output_tokens: None,
                stop_reason: Some("end_turn".into()),
            })
        }
    }

    struct Failing;

    #[async_trait]
    impl LlmProvider for Failing {
        async fn chat(&self, _request: LlmRequest) -> Result<LlmResponse> {
            bail!("connection refused")
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, 4, 0, 0).unwrap()
    }

    fn selector(
        dir: &tempfile::TempDir,
        docs: Arc<MemoryDocumentStore>,
        provider: Option<Arc<dyn LlmProvider>>,
    ) -> TriggerSelector {
        let pool = Arc::new(TopicPool::with_base_topics(
            docs,
            vec!["game-quiz".into(), "plan-day".into(), "reminder-walk".into()],
        ));
        TriggerSelector::new(
            pool,
            Arc::new(ChatHistoryStore::new(dir.path())),
            provider,
            SelectorConfig::default(),
        )
        .with_seed(11)
    }

    #[tokio::test]
    async fn valid_model_answer_is_used() {
        let dir = tempfile::TempDir::new().unwrap();
        let answer = r#"```json
{"trigger": true, "reason": "morning walk", "event_type": "reminder-walk",
 "trigger_context": "[TRIGGER:reminder-walk]\nTime: 2024-01-15 12:00", "trigger_id": "t-1"}
```"#;
        let selector = selector(
            &dir,
            Arc::new(MemoryDocumentStore::new()),
            Some(Arc::new(Scripted(answer.into()))),
        );

        let decision = selector.select("u1", now(), &BTreeSet::new()).await;
        assert_eq!(decision.event_type, "reminder-walk");
        assert_eq!(decision.reason, "morning walk");
        assert_eq!(decision.trigger_id, "t-1");
    }

    #[tokio::test]
    async fn failing_model_falls_back_to_tagged_local_pick() {
        let dir = tempfile::TempDir::new().unwrap();
        let selector = selector(&dir, Arc::new(MemoryDocumentStore::new()), Some(Arc::new(Failing)));

        let decision = selector.select("u1", now(), &BTreeSet::new()).await;
        assert!(decision.triggered);
        assert_eq!(decision.reason, "forced_pick");
        assert!(decision.trigger_id.starts_with("forced-"));
        let tag = parse_event_type(&decision.context).unwrap();
        assert_eq!(tag, decision.event_type);
        assert!(["game-quiz", "plan-day", "reminder-walk"].contains(&tag.as_str()));
        assert!(decision.context.contains("Time: 2024-01-15 12:00"));
        assert!(decision.context.contains("Hi friend"));
    }

    #[tokio::test]
    async fn topic_outside_options_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let answer = r#"{"trigger": true, "trigger_context": "[TRIGGER:stock-tips] buy now"}"#;
        let selector = selector(
            &dir,
            Arc::new(MemoryDocumentStore::new()),
            Some(Arc::new(Scripted(answer.into()))),
        );
        let decision = selector.select("u1", now(), &BTreeSet::new()).await;
        assert_eq!(decision.reason, "forced_pick");
        assert_ne!(decision.event_type, "stock-tips");
    }

    #[tokio::test]
    async fn excluded_topics_are_not_offered_to_local_pick() {
        let dir = tempfile::TempDir::new().unwrap();
        let selector = selector(&dir, Arc::new(MemoryDocumentStore::new()), None);
        let excluded: BTreeSet<Topic> = ["game-quiz".to_string(), "plan-day".to_string()].into();
        for _ in 0..10 {
            let decision = selector.select("u1", now(), &excluded).await;
            assert_eq!(decision.event_type, "reminder-walk");
        }
    }

    #[tokio::test]
    async fn fully_excluded_pool_still_yields_a_decision() {
        let dir = tempfile::TempDir::new().unwrap();
        let selector = selector(&dir, Arc::new(MemoryDocumentStore::new()), None);
        let excluded: BTreeSet<Topic> = ["game-quiz", "plan-day", "reminder-walk"]
            .iter()
            .map(|t| t.to_string())
            .collect();
        let decision = selector.select("u1", now(), &excluded).await;
        assert!(excluded.contains(&decision.event_type));
    }

    #[tokio::test]
    async fn schedule_timezone_and_display_name_shape_local_pick() {
        let dir = tempfile::TempDir::new().unwrap();
        let docs = Arc::new(MemoryDocumentStore::new());
        docs.put("u1", SCHEDULE_DOC, &json!({"timezone": "Europe/London"}))
            .await
            .unwrap();
        docs.put("u1", "profile_static", &json!({"name": "Ana"}))
            .await
            .unwrap();
        let selector = selector(&dir, docs, None);

        let decision = selector.select("u1", now(), &BTreeSet::new()).await;
        assert!(decision.context.contains("Time: 2024-01-15 04:00"));
        assert!(decision.context.contains("Hi Ana"));
    }

    #[test]
    fn hint_is_appended_when_model_ignores_it() {
        let mut snapshot = PoolSnapshot::default();
        snapshot
            .hints
            .insert("habit-walk".into(), "habit: walk".into());
        let decision = TriggerDecision {
            triggered: true,
            reason: "r".into(),
            event_type: "habit-walk".into(),
            context: "[TRIGGER:habit-walk]".into(),
            trigger_id: "t".into(),
        };
        let decision = with_hint(decision, &snapshot);
        assert_eq!(decision.context, "[TRIGGER:habit-walk]\nHint: habit: walk");
        assert_eq!(with_hint(decision.clone(), &snapshot).context, decision.context);
    }

    #[test]
    fn python_style_answer_is_normalized() {
        let raw = parse_raw_decision(
            "Sure! {'trigger': True, 'event_type': 'plan-day', 'trigger_context': \"[plan-day] it's time\", 'trigger_id': None}",
        )
        .unwrap();
        assert_eq!(raw.trigger, Some(serde_json::Value::Bool(true)));
        assert_eq!(raw.event_type.as_deref(), Some("plan-day"));
        assert_eq!(raw.trigger_context.as_deref(), Some("[plan-day] it's time"));
        assert!(raw.trigger_id.is_none());
    }

    #[test]
    fn non_object_answer_is_none() {
        assert!(parse_raw_decision("I cannot decide").is_none());
        assert!(parse_raw_decision("} nope {").is_none());
    }
}
