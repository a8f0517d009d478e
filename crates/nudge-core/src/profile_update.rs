use std::collections::BTreeMap;
use std::sync::{Arc, LazyLock};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{Datelike, Duration, NaiveDate, Utc};
use chrono_tz::Tz;
use nudge_bus::BroadcastHub;
use nudge_memory::{ChatHistoryStore, DocumentStore, ProfileStore};
use nudge_provider::{complete, LlmProvider};
use nudge_schema::{ChatRecord, ChatRole};
use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::{debug, info, warn};

use crate::refresh::ProfileRefresher;
use crate::selector::{schedule_timezone, DEFAULT_TIMEZONE};

pub const DIET_DOC: &str = "diet_2w";
pub const HEALTH_DOC: &str = "health_record";

/// Documents the model may rewrite.
pub const UPDATABLE_DOCS: [&str; 6] = [
    "profile_static",
    "smalltalk",
    HEALTH_DOC,
    DIET_DOC,
    "recent_events",
    "habits",
];

pub const GLUCOSE_LAB: &str = "blood glucose";
const GLUCOSE_UNIT: &str = "mmol/L";
const GLUCOSE_NOTE: &str = "fallback_from_chat";
const LABS_LIMIT: usize = 20;

const SMALLTALK_TOPICS_LIMIT: usize = 8;
const RECENT_ITEMS_LIMIT: usize = 20;
const DIET_WEEKS_LIMIT: usize = 2;
const DIET_DAYS_LIMIT: usize = 7;

const UPDATE_PROMPT: &str = "You keep a health companion's picture of its user up to date. \
Input: chat_history (recent user/assistant turns) and the current profile.\n\
Return one JSON object with any of these keys, omitting what you cannot tell:\n\
- profile_static: {summary, basic, medical, glucose_preferences, diet, lifestyle, personality, interests, assistant_prefs}\n\
- smalltalk: {summary, topics: [{key, text}]} with at most 8 topics\n\
- health_record: {summary, conditions: [...], medications: [...], labs: [...]}\n\
- diet_2w: {summary, weeks: [{week_start, days: [{date, breakfast, lunch, dinner, notes}]}]} with at most 2 weeks of 7 days\n\
- recent_events: {summary_keywords: [3-6 keywords], items: [{title, detail}]} with at most 20 items\n\
- habits: {summary, routines: [...], rules: [...]}\n\
Rules: every module starts with a one-line summary; keep lists small; only use what the \
conversation supports; answer with strict JSON and no explanation.";

static GLUCOSE_WITH_UNIT: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)([0-9]+(?:\.[0-9]+)?)\s*mmol/?l").expect("valid glucose unit regex")
});
static GLUCOSE_MENTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:血糖|glucose|blood sugar)[^0-9]*([0-9]+(?:\.[0-9]+)?)")
        .expect("valid glucose mention regex")
});
static CLAUSE_SPLIT: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[，,。；;！!？?]+|\.\s").expect("valid clause regex"));

const BREAKFAST_WORDS: [&str; 6] = ["早餐", "早上", "早饭", "早午", "breakfast", "morning"];
const LUNCH_WORDS: [&str; 5] = ["中午", "午餐", "午饭", "lunch", "noon"];
const DINNER_WORDS: [&str; 7] = ["晚餐", "晚饭", "晚上", "夜宵", "dinner", "supper", "evening"];

#[derive(Debug, Clone)]
pub struct ProfileUpdaterConfig {
    pub model: String,
    pub history_limit: usize,
    pub max_tokens: u32,
    pub temperature: f32,
    pub default_timezone: Tz,
}

impl Default for ProfileUpdaterConfig {
    fn default() -> Self {
        Self {
            model: nudge_provider::DEFAULT_MODEL.to_string(),
            history_limit: 40,
            max_tokens: 800,
            temperature: 0.2,
            default_timezone: DEFAULT_TIMEZONE,
        }
    }
}

/// Rewrites the user's data documents from recent chat, then publishes the profile.
///
/// When the model is unavailable or answers with something unusable, meals and glucose
/// readings in the latest user message are still recorded.
pub struct LlmProfileUpdater {
    provider: Arc<dyn LlmProvider>,
    profiles: ProfileStore,
    chats: Arc<ChatHistoryStore>,
    hub: BroadcastHub,
    config: ProfileUpdaterConfig,
}

impl LlmProfileUpdater {
    pub fn new(
        provider: Arc<dyn LlmProvider>,
        profiles: ProfileStore,
        chats: Arc<ChatHistoryStore>,
        hub: BroadcastHub,
        config: ProfileUpdaterConfig,
    ) -> Self {
        Self {
            provider,
            profiles,
            chats,
            hub,
            config,
        }
    }

    fn docs(&self) -> &dyn DocumentStore {
        self.profiles.documents().as_ref()
    }

    async fn ask_model(&self, history: &[ChatRecord], profile: &Value) -> Result<Value> {
        let turns: Vec<Value> = history
            .iter()
            .filter(|r| r.role != ChatRole::SystemInject)
            .map(|r| json!({"role": r.role, "content": r.content}))
            .collect();
        let payload = json!({"chat_history": turns, "profile": profile});
        let text = complete(
            self.provider.as_ref(),
            &self.config.model,
            UPDATE_PROMPT,
            &serde_json::to_string(&payload)?,
            self.config.max_tokens,
            self.config.temperature,
        )
        .await?;
        parse_update(&text).ok_or_else(|| anyhow::anyhow!("profile update is not a JSON object"))
    }

    async fn write_updates(&self, user_id: &str, updated: &Map<String, Value>) -> Result<()> {
        for doc in UPDATABLE_DOCS {
            if let Some(value @ Value::Object(_)) = updated.get(doc) {
                self.docs().put(user_id, doc, value).await?;
            }
        }
        Ok(())
    }

    async fn load_doc(&self, user_id: &str, doc: &str) -> Option<Value> {
        match self.docs().get(user_id, doc).await {
            Ok(value) => value.filter(Value::is_object),
            Err(error) => {
                warn!(user_id, doc, %error, "document unreadable, starting fresh");
                None
            }
        }
    }

    /// Records meals mentioned in `text` under `today`. Returns whether anything was written.
    async fn fallback_diet(&self, user_id: &str, text: &str, today: NaiveDate) -> Result<bool> {
        let meals = extract_meals(text);
        if meals.is_empty() {
            return Ok(false);
        }
        let mut diet = self
            .load_doc(user_id, DIET_DOC)
            .await
            .unwrap_or_else(|| empty_doc(user_id));
        record_meals(&mut diet, today, &meals);
        self.docs().put(user_id, DIET_DOC, &diet).await?;
        Ok(true)
    }

    /// Records a glucose reading mentioned in `text` under `today`, once per value and day.
    async fn fallback_glucose(&self, user_id: &str, text: &str, today: NaiveDate) -> Result<bool> {
        let Some(reading) = extract_glucose(text) else {
            return Ok(false);
        };
        let mut record = self
            .load_doc(user_id, HEALTH_DOC)
            .await
            .unwrap_or_else(|| empty_doc(user_id));
        if !record_glucose(&mut record, today, reading) {
            return Ok(false);
        }
        self.docs().put(user_id, HEALTH_DOC, &record).await?;
        Ok(true)
    }

    async fn apply_fallbacks(
        &self,
        user_id: &str,
        text: &str,
        today: NaiveDate,
        updated: Option<&Map<String, Value>>,
    ) -> Result<()> {
        let diet_has_today = updated
            .and_then(|u| u.get(DIET_DOC))
            .is_some_and(|diet| has_meal_on(diet, today));
        if !diet_has_today && self.fallback_diet(user_id, text, today).await? {
            debug!(user_id, "meals recorded from latest message");
        }
        let labs_have_today = updated
            .and_then(|u| u.get(HEALTH_DOC))
            .is_some_and(|record| has_glucose_on(record, today));
        if !labs_have_today && self.fallback_glucose(user_id, text, today).await? {
            debug!(user_id, "glucose reading recorded from latest message");
        }
        Ok(())
    }
}

#[async_trait]
impl ProfileRefresher for LlmProfileUpdater {
    async fn refresh(&self, user_id: &str) -> Result<()> {
        let history = self.chats.load(user_id, self.config.history_limit).await?;
        let profile = self.profiles.load(user_id).await?;
        let latest_user_text = history
            .iter()
            .rev()
            .find(|r| r.role == ChatRole::User)
            .map(|r| r.content.clone())
            .unwrap_or_default();
        let timezone = schedule_timezone(self.docs(), user_id, self.config.default_timezone).await;
        let today = Utc::now().with_timezone(&timezone).date_naive();

        let updated = match self.ask_model(&history, &profile).await {
            Ok(Value::Object(mut updated)) => {
                trim_lists(&mut updated);
                self.write_updates(user_id, &updated).await?;
                info!(
                    user_id,
                    keys = ?updated.keys().collect::<Vec<_>>(),
                    "profile documents updated"
                );
                Some(updated)
            }
            Ok(_) => None,
            Err(error) => {
                warn!(user_id, %error, "profile update failed, using heuristics");
                None
            }
        };
        if !latest_user_text.is_empty() {
            self.apply_fallbacks(user_id, &latest_user_text, today, updated.as_ref())
                .await?;
        }

        let profile = self.hub.broadcast_profile(user_id).await;
        let schedule = self.hub.broadcast_schedule(user_id).await;
        debug!(user_id, profile, schedule, "profile refresh published");
        Ok(())
    }
}

fn parse_update(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    serde_json::from_str::<Value>(&text[start..=end])
        .ok()
        .filter(Value::is_object)
}

fn clip(doc: Option<&mut Value>, key: &str, limit: usize) {
    if let Some(Value::Array(items)) = doc.and_then(|d| d.get_mut(key)) {
        items.truncate(limit);
    }
}

/// Caps list sizes: smalltalk topics, recent event items, diet weeks and days.
pub fn trim_lists(updated: &mut Map<String, Value>) {
    clip(updated.get_mut("smalltalk"), "topics", SMALLTALK_TOPICS_LIMIT);
    clip(updated.get_mut("recent_events"), "items", RECENT_ITEMS_LIMIT);
    if let Some(Value::Array(weeks)) = updated.get_mut(DIET_DOC).and_then(|d| d.get_mut("weeks")) {
        weeks.truncate(DIET_WEEKS_LIMIT);
        for week in weeks.iter_mut() {
            clip(Some(week), "days", DIET_DAYS_LIMIT);
        }
    }
}

fn empty_doc(user_id: &str) -> Value {
    json!({"schema_version": "1.0", "user_id": user_id, "summary": ""})
}

/// Meal clauses found in `text`, keyed by `breakfast`/`lunch`/`dinner`. Later clauses win.
pub fn extract_meals(text: &str) -> BTreeMap<&'static str, String> {
    let mut meals = BTreeMap::new();
    for clause in CLAUSE_SPLIT.split(text).map(str::trim).filter(|c| !c.is_empty()) {
        let lower = clause.to_lowercase();
        let mentions = |words: &[&str]| words.iter().any(|w| lower.contains(w));
        let meal = if mentions(&BREAKFAST_WORDS[..]) {
            "breakfast"
        } else if mentions(&LUNCH_WORDS[..]) {
            "lunch"
        } else if mentions(&DINNER_WORDS[..]) {
            "dinner"
        } else {
            continue;
        };
        meals.insert(meal, clause.to_string());
    }
    meals
}

/// A glucose value in mmol/L, preferring an explicit unit over a bare mention.
pub fn extract_glucose(text: &str) -> Option<f64> {
    GLUCOSE_WITH_UNIT
        .captures(text)
        .or_else(|| GLUCOSE_MENTION.captures(text))
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// The object in `items` whose `key` equals `id`, appended when missing.
fn object_entry<'a>(
    items: &'a mut Vec<Value>,
    key: &str,
    id: &str,
) -> Option<&'a mut Map<String, Value>> {
    let fresh = || {
        let mut entry = Map::new();
        entry.insert(key.to_string(), Value::String(id.to_string()));
        Value::Object(entry)
    };
    let index = match items
        .iter()
        .position(|item| item.get(key).and_then(Value::as_str) == Some(id))
    {
        Some(index) => index,
        None => {
            items.push(fresh());
            items.len() - 1
        }
    };
    if !items[index].is_object() {
        items[index] = fresh();
    }
    items[index].as_object_mut()
}

fn array_field<'a>(doc: &'a mut Value, key: &str) -> Option<&'a mut Vec<Value>> {
    let map = doc.as_object_mut()?;
    let field = map.entry(key.to_string()).or_insert_with(|| json!([]));
    if !field.is_array() {
        *field = json!([]);
    }
    field.as_array_mut()
}

/// Writes `meals` into the day `today` of its Monday-started week in a `diet_2w` document.
pub fn record_meals(diet: &mut Value, today: NaiveDate, meals: &BTreeMap<&'static str, String>) {
    let week_start = today - Duration::days(i64::from(today.weekday().num_days_from_monday()));
    let Some(weeks) = array_field(diet, "weeks") else {
        return;
    };
    let Some(week) = object_entry(weeks, "week_start", &week_start.to_string()) else {
        return;
    };
    let days = week.entry("days".to_string()).or_insert_with(|| json!([]));
    if !days.is_array() {
        *days = json!([]);
    }
    let Value::Array(days) = days else {
        return;
    };
    let Some(day) = object_entry(days, "date", &today.to_string()) else {
        return;
    };
    for (meal, clause) in meals {
        day.insert(meal.to_string(), Value::String(clause.clone()));
    }
}

fn is_glucose_lab(lab: &Value) -> bool {
    lab.get("name")
        .and_then(Value::as_str)
        .is_some_and(|name| name.starts_with(GLUCOSE_LAB) || name.starts_with("血糖"))
}

/// Prepends a glucose lab entry unless the same value is already recorded for `today`.
pub fn record_glucose(record: &mut Value, today: NaiveDate, value: f64) -> bool {
    let date = today.to_string();
    let Some(labs) = array_field(record, "labs") else {
        return false;
    };
    let duplicate = labs.iter().any(|lab| {
        is_glucose_lab(lab)
            && lab.get("date").and_then(Value::as_str) == Some(date.as_str())
            && lab.get("value").and_then(Value::as_f64) == Some(value)
    });
    if duplicate {
        return false;
    }
    labs.insert(
        0,
        json!({
            "name": GLUCOSE_LAB,
            "value": value,
            "unit": GLUCOSE_UNIT,
            "date": date,
            "note": GLUCOSE_NOTE,
        }),
    );
    labs.truncate(LABS_LIMIT);
    if let Some(map) = record.as_object_mut() {
        let summary = map.entry("summary".to_string()).or_insert_with(|| json!(""));
        if summary.as_str().is_some_and(str::is_empty) {
            *summary = json!(format!("Latest glucose: {value} {GLUCOSE_UNIT} ({date})"));
        }
    }
    true
}

fn has_meal_on(diet: &Value, day: NaiveDate) -> bool {
    let date = day.to_string();
    diet.get("weeks")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|week| week.get("days").and_then(Value::as_array))
        .flatten()
        .any(|d| d.get("date").and_then(Value::as_str) == Some(date.as_str()))
}

fn has_glucose_on(record: &Value, day: NaiveDate) -> bool {
    let date = day.to_string();
    record
        .get("labs")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .any(|lab| {
            is_glucose_lab(lab) && lab.get("date").and_then(Value::as_str) == Some(date.as_str())
        })
}
