use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Duration, Utc};
use nudge_schema::{
    delay_from_secs, saturating_add, ChatRecord, ChatRole, Topic, TriggerDecision,
};
use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Upper bound on forced re-selections for one decision.
pub const MAX_RESELECTIONS: usize = 4;

/// Replies used instead of an assistant message that would repeat a recent one.
pub const CANNED_REPLIES: [&str; 4] = [
    "Got the earlier check-in noted. Want to chat about something lighter, like what you've been watching lately?",
    "Noted. To unwind a bit: have you been out for a walk or done some stretching recently?",
    "Reminder logged~ Shall we switch topics and talk about your meals or exercise plans?",
    "Sure, I'm keeping an eye on it. If you'd like a change of mood, tell me something fun from today.",
];

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct DedupConfig {
    pub recent_window: usize,
    pub frequency_window: usize,
    pub frequency_limit: usize,
    pub injection_lookback: usize,
    pub reply_lookback: usize,
    pub default_min_interval_secs: u64,
    pub test_mode_min_interval_secs: u64,
    pub test_mode: bool,
    pub min_interval_override_secs: Option<u64>,
    pub per_type_min_interval_secs: HashMap<Topic, u64>,
    /// Skips the per-type minimum interval check.
    pub ignore_history: bool,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            recent_window: 3,
            frequency_window: 8,
            frequency_limit: 2,
            injection_lookback: 5,
            reply_lookback: 6,
            default_min_interval_secs: 10,
            test_mode_min_interval_secs: 5,
            test_mode: false,
            min_interval_override_secs: None,
            per_type_min_interval_secs: HashMap::new(),
            ignore_history: false,
        }
    }
}

impl DedupConfig {
    /// Per-type setting, then the global override, then the mode default.
    pub fn min_interval(&self, event_type: &str) -> Duration {
        let secs = self
            .per_type_min_interval_secs
            .get(event_type)
            .copied()
            .or(self.min_interval_override_secs)
            .unwrap_or(if self.test_mode {
                self.test_mode_min_interval_secs
            } else {
                self.default_min_interval_secs
            });
        delay_from_secs(secs)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub event_type: Topic,
    pub at: DateTime<Utc>,
}

/// What has already reached a user, oldest first.
#[derive(Debug, Clone, Default)]
pub struct DeliveryHistory {
    deliveries: Vec<Delivery>,
    injections: Vec<String>,
    replies: Vec<String>,
}

impl DeliveryHistory {
    pub fn from_records(records: &[ChatRecord]) -> Self {
        let mut history = Self::default();
        for record in records {
            match record.role {
                ChatRole::Assistant => {
                    if record.meta.is_proactive() {
                        if let Some(event_type) = record.event_type() {
                            history.record_delivery(event_type, record.ts);
                        }
                    }
                    history.record_reply(record.content.clone());
                }
                ChatRole::SystemInject => history.record_injection(record.content.clone()),
                ChatRole::User => {}
            }
        }
        history
    }

    pub fn record_delivery(&mut self, event_type: impl Into<Topic>, at: DateTime<Utc>) {
        self.deliveries.push(Delivery {
            event_type: event_type.into(),
            at,
        });
    }

    pub fn record_injection(&mut self, context: impl Into<String>) {
        self.injections.push(context.into());
    }

    pub fn record_reply(&mut self, reply: impl Into<String>) {
        self.replies.push(reply.into());
    }

    pub fn deliveries(&self) -> &[Delivery] {
        &self.deliveries
    }

    /// Event types of the last `window` deliveries, most recent first.
    pub fn recent_types(&self, window: usize) -> Vec<Topic> {
        self.deliveries
            .iter()
            .rev()
            .take(window)
            .map(|d| d.event_type.clone())
            .collect()
    }

    pub fn count_recent(&self, event_type: &str, window: usize) -> usize {
        self.deliveries
            .iter()
            .rev()
            .take(window)
            .filter(|d| d.event_type == event_type)
            .count()
    }

    pub fn last_fired(&self, event_type: &str) -> Option<DateTime<Utc>> {
        self.deliveries
            .iter()
            .rev()
            .find(|d| d.event_type == event_type)
            .map(|d| d.at)
    }

    pub fn injected_recently(&self, context: &str, lookback: usize) -> bool {
        self.injections.iter().rev().take(lookback).any(|c| c == context)
    }

    pub fn replied_recently(&self, reply: &str, lookback: usize) -> bool {
        self.replies.iter().rev().take(lookback).any(|r| r == reply)
    }
}

/// A rule that forced a re-selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "rule", rename_all = "snake_case")]
pub enum Adjustment {
    Recency { event_type: Topic },
    Frequency { event_type: Topic, count: usize },
    MinInterval { event_type: Topic, remaining_secs: i64 },
    RepeatedInjection { event_type: Topic },
}

impl Adjustment {
    pub fn event_type(&self) -> &str {
        match self {
            Adjustment::Recency { event_type }
            | Adjustment::Frequency { event_type, .. }
            | Adjustment::MinInterval { event_type, .. }
            | Adjustment::RepeatedInjection { event_type } => event_type,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Enforced {
    pub decision: TriggerDecision,
    pub adjustments: Vec<Adjustment>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyCheck {
    Original(String),
    Substituted(String),
}

impl ReplyCheck {
    pub fn text(&self) -> &str {
        match self {
            ReplyCheck::Original(text) | ReplyCheck::Substituted(text) => text,
        }
    }

    pub fn is_substituted(&self) -> bool {
        matches!(self, ReplyCheck::Substituted(_))
    }
}

#[derive(Debug, Clone, Default)]
pub struct DedupPolicy {
    config: DedupConfig,
}

impl DedupPolicy {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    /// Event types that sit over the frequency limit inside the frequency window.
    fn saturated_types(&self, history: &DeliveryHistory) -> BTreeSet<Topic> {
        let mut counts: HashMap<&str, usize> = HashMap::new();
        for delivery in history.deliveries.iter().rev().take(self.config.frequency_window) {
            *counts.entry(delivery.event_type.as_str()).or_default() += 1;
        }
        counts
            .into_iter()
            .filter(|(_, count)| *count >= self.config.frequency_limit)
            .map(|(ty, _)| ty.to_string())
            .collect()
    }

    /// Event types still inside their minimum interval at `now`, plus `event_type`.
    fn waiting_types(
        &self,
        history: &DeliveryHistory,
        now: DateTime<Utc>,
        event_type: &str,
    ) -> BTreeSet<Topic> {
        let mut waiting: BTreeSet<Topic> = history
            .deliveries
            .iter()
            .filter(|d| now < saturating_add(d.at, self.config.min_interval(&d.event_type)))
            .map(|d| d.event_type.clone())
            .collect();
        waiting.insert(event_type.to_string());
        waiting
    }

    /// First rule `decision` violates, with the topics the re-selection must avoid.
    pub fn check(
        &self,
        decision: &TriggerDecision,
        history: &DeliveryHistory,
        now: DateTime<Utc>,
    ) -> Option<(Adjustment, BTreeSet<Topic>)> {
        let event_type = &decision.event_type;
        let recent: BTreeSet<Topic> = history
            .recent_types(self.config.recent_window)
            .into_iter()
            .collect();

        if recent.contains(event_type) {
            return Some((
                Adjustment::Recency {
                    event_type: event_type.clone(),
                },
                recent,
            ));
        }

        let count = history.count_recent(event_type, self.config.frequency_window);
        if count >= self.config.frequency_limit {
            let mut avoid = recent;
            avoid.extend(self.saturated_types(history));
            avoid.insert(event_type.clone());
            return Some((
                Adjustment::Frequency {
                    event_type: event_type.clone(),
                    count,
                },
                avoid,
            ));
        }

        if !self.config.ignore_history {
            if let Some(last) = history.last_fired(event_type) {
                let ready_at = saturating_add(last, self.config.min_interval(event_type));
                if now < ready_at {
                    return Some((
                        Adjustment::MinInterval {
                            event_type: event_type.clone(),
                            remaining_secs: (ready_at - now).num_seconds(),
                        },
                        self.waiting_types(history, now, event_type),
                    ));
                }
            }
        }

        if history.injected_recently(&decision.context, self.config.injection_lookback) {
            return Some((
                Adjustment::RepeatedInjection {
                    event_type: event_type.clone(),
                },
                BTreeSet::from([event_type.clone()]),
            ));
        }

        None
    }

    /// Applies every rule, re-selecting through `reselect` until the decision passes.
    ///
    /// Exclusions accumulate across rounds. After [`MAX_RESELECTIONS`] rounds the last
    /// decision is accepted as is, which only breaks a rule once the pool is exhausted.
    pub fn enforce<F>(
        &self,
        decision: TriggerDecision,
        history: &DeliveryHistory,
        now: DateTime<Utc>,
        mut reselect: F,
    ) -> Enforced
    where
        F: FnMut(&BTreeSet<Topic>) -> TriggerDecision,
    {
        let mut decision = decision;
        let mut excluded = BTreeSet::new();
        let mut adjustments = Vec::new();

        while adjustments.len() < MAX_RESELECTIONS {
            let Some((adjustment, avoid)) = self.check(&decision, history, now) else {
                break;
            };
            tracing::debug!(
                event_type = adjustment.event_type(),
                ?adjustment,
                "dedup forced re-selection"
            );
            excluded.extend(avoid);
            adjustments.push(adjustment);
            decision = reselect(&excluded);
        }

        if adjustments.len() == MAX_RESELECTIONS {
            if let Some((adjustment, _)) = self.check(&decision, history, now) {
                tracing::warn!(
                    event_type = %decision.event_type,
                    ?adjustment,
                    excluded = excluded.len(),
                    "re-selection limit reached, accepting decision that still breaks a rule"
                );
            }
        }

        Enforced {
            decision,
            adjustments,
        }
    }

    /// Swaps a reply that repeats one of the last few assistant messages for a canned one.
    pub fn dedupe_reply<R: Rng + ?Sized>(
        &self,
        reply: &str,
        history: &DeliveryHistory,
        rng: &mut R,
    ) -> ReplyCheck {
        let lookback = self.config.reply_lookback;
        if !history.replied_recently(reply, lookback) {
            return ReplyCheck::Original(reply.to_string());
        }
        let fresh: Vec<&str> = CANNED_REPLIES
            .iter()
            .copied()
            .filter(|canned| !history.replied_recently(canned, lookback))
            .collect();
        let pool = if fresh.is_empty() {
            CANNED_REPLIES.to_vec()
        } else {
            fresh
        };
        let canned = pool.choose(rng).copied().unwrap_or(CANNED_REPLIES[0]);
        ReplyCheck::Substituted(canned.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use nudge_schema::{trigger_tag, RecordMeta};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn decision(topic: &str) -> TriggerDecision {
        TriggerDecision {
            triggered: true,
            reason: "test".into(),
            event_type: topic.into(),
            context: format!("{}\nctx", trigger_tag(topic)),
            trigger_id: format!("id-{topic}"),
        }
    }

    fn history(types: &[&str], step_secs: i64) -> DeliveryHistory {
        let mut history = DeliveryHistory::default();
        for (i, ty) in types.iter().enumerate() {
            history.record_delivery(*ty, at(i as i64 * step_secs));
        }
        history
    }

    fn pick_first_allowed(
        pool: &'static [&'static str],
    ) -> impl FnMut(&BTreeSet<Topic>) -> TriggerDecision {
        move |excluded| {
            let topic = pool
                .iter()
                .find(|t| !excluded.contains(**t))
                .unwrap_or(&pool[0]);
            decision(topic)
        }
    }

    #[test]
    fn clean_decision_passes_untouched() {
        let policy = DedupPolicy::default();
        let enforced = policy.enforce(
            decision("game-quiz"),
            &history(&["a", "b", "c"], 600),
            at(10_000),
            |_| panic!("no re-selection expected"),
        );
        assert_eq!(enforced.decision.event_type, "game-quiz");
        assert!(enforced.adjustments.is_empty());
    }

    #[test]
    fn recent_type_is_replaced_avoiding_all_recents() {
        let policy = DedupPolicy::default();
        let enforced = policy.enforce(
            decision("b"),
            &history(&["x", "a", "b", "c"], 600),
            at(10_000),
            pick_first_allowed(&["a", "b", "c", "d"]),
        );
        assert_eq!(enforced.decision.event_type, "d");
        assert_eq!(
            enforced.adjustments,
            vec![Adjustment::Recency {
                event_type: "b".into()
            }]
        );
    }

    #[test]
    fn frequent_type_is_replaced() {
        let policy = DedupPolicy::default();
        let enforced = policy.enforce(
            decision("a"),
            &history(&["a", "x", "a", "y", "z", "w"], 600),
            at(10_000),
            pick_first_allowed(&["a", "y", "b"]),
        );
        assert_eq!(enforced.decision.event_type, "b");
        assert!(matches!(
            enforced.adjustments[0],
            Adjustment::Frequency { count: 2, .. }
        ));
    }

    #[test]
    fn min_interval_blocks_quick_refire() {
        let mut config = DedupConfig {
            recent_window: 0,
            frequency_limit: 10,
            ..DedupConfig::default()
        };
        config.per_type_min_interval_secs.insert("a".into(), 60);
        let policy = DedupPolicy::new(config);
        let past = history(&["a"], 0);

        let blocked = policy.enforce(decision("a"), &past, at(30), pick_first_allowed(&["a", "b"]));
        assert_eq!(blocked.decision.event_type, "b");
        assert!(matches!(
            blocked.adjustments[0],
            Adjustment::MinInterval { remaining_secs: 30, .. }
        ));

        let allowed = policy.enforce(decision("a"), &past, at(60), |_| panic!("allowed"));
        assert_eq!(allowed.decision.event_type, "a");
    }

    #[test]
    fn ignore_history_skips_min_interval() {
        let policy = DedupPolicy::new(DedupConfig {
            recent_window: 0,
            frequency_limit: 10,
            ignore_history: true,
            ..DedupConfig::default()
        });
        let enforced = policy.enforce(decision("a"), &history(&["a"], 0), at(1), |_| {
            panic!("no re-selection expected")
        });
        assert!(enforced.adjustments.is_empty());
    }

    #[test]
    fn repeated_injection_forces_reselection() {
        let policy = DedupPolicy::default();
        let mut past = DeliveryHistory::default();
        past.record_injection(decision("a").context);
        let enforced = policy.enforce(decision("a"), &past, at(0), pick_first_allowed(&["a", "b"]));
        assert_eq!(enforced.decision.event_type, "b");
        assert_eq!(
            enforced.adjustments,
            vec![Adjustment::RepeatedInjection {
                event_type: "a".into()
            }]
        );
    }

    #[test]
    #[tracing_test::traced_test]
    fn exhausted_pool_is_accepted_after_bounded_rounds() {
        let policy = DedupPolicy::default();
        let mut calls = 0;
        let enforced = policy.enforce(
            decision("a"),
            &history(&["a"], 0),
            at(10_000),
            |_| {
                calls += 1;
                decision("a")
            },
        );
        assert_eq!(calls, MAX_RESELECTIONS);
        assert_eq!(enforced.adjustments.len(), MAX_RESELECTIONS);
        assert_eq!(enforced.decision.event_type, "a");
        assert!(logs_contain("re-selection limit reached"));
    }

    #[test]
    fn min_interval_resolution_order() {
        let mut config = DedupConfig::default();
        assert_eq!(config.min_interval("x"), Duration::seconds(10));
        config.test_mode = true;
        assert_eq!(config.min_interval("x"), Duration::seconds(5));
        config.min_interval_override_secs = Some(42);
        assert_eq!(config.min_interval("x"), Duration::seconds(42));
        config.per_type_min_interval_secs.insert("x".into(), 7);
        assert_eq!(config.min_interval("x"), Duration::seconds(7));
    }

    #[test]
    fn huge_min_interval_saturates_instead_of_panicking() {
        let config = DedupConfig {
            recent_window: 0,
            frequency_limit: 10,
            min_interval_override_secs: Some(10_000_000_000_000_000),
            ..DedupConfig::default()
        };
        assert_eq!(
            config.min_interval("x"),
            delay_from_secs(nudge_schema::MAX_DELAY_SECS)
        );

        let policy = DedupPolicy::new(config);
        let mut history = DeliveryHistory::default();
        history.record_delivery("a", DateTime::<Utc>::MAX_UTC - Duration::days(1));
        let now = DateTime::<Utc>::MAX_UTC - Duration::days(2);
        let (adjustment, avoid) = policy.check(&decision("a"), &history, now).unwrap();
        assert_eq!(
            adjustment,
            Adjustment::MinInterval {
                event_type: "a".into(),
                remaining_secs: Duration::days(2).num_seconds(),
            }
        );
        assert!(avoid.contains("a"));
    }

    #[test]
    fn history_reads_structured_and_legacy_event_types() {
        let structured = ChatRecord::new(ChatRole::Assistant, "drink water", at(0)).with_meta(
            RecordMeta::proactive(&decision("reminder-hydration")),
        );
        let legacy_meta = RecordMeta {
            mode: Some(nudge_schema::ChatMode::Proactive),
            ..RecordMeta::default()
        };
        let legacy = ChatRecord::new(ChatRole::Assistant, "[TRIGGER:plan-day] hello", at(1))
            .with_meta(legacy_meta);
        let passive = ChatRecord::new(ChatRole::Assistant, "[game-quiz] not proactive", at(2))
            .with_meta(RecordMeta::passive());
        let inject = ChatRecord::new(ChatRole::SystemInject, "[TRIGGER:plan-day]", at(3));

        let history = DeliveryHistory::from_records(&[structured, legacy, passive, inject]);
        assert_eq!(
            history.recent_types(3),
            vec!["plan-day".to_string(), "reminder-hydration".to_string()]
        );
        assert!(history.injected_recently("[TRIGGER:plan-day]", 5));
        assert!(history.replied_recently("[game-quiz] not proactive", 6));
    }

    #[test]
    fn repeated_reply_is_substituted_with_fresh_canned_text() {
        let policy = DedupPolicy::default();
        let mut past = DeliveryHistory::default();
        past.record_reply("Time for water!");
        past.record_reply(CANNED_REPLIES[0]);
        let mut rng = StdRng::seed_from_u64(7);

        assert_eq!(
            policy.dedupe_reply("Something new", &past, &mut rng),
            ReplyCheck::Original("Something new".into())
        );

        let check = policy.dedupe_reply("Time for water!", &past, &mut rng);
        assert!(check.is_substituted());
        assert!(CANNED_REPLIES.contains(&check.text()));
        assert_ne!(check.text(), CANNED_REPLIES[0]);
    }
}
