use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use nudge_bus::BroadcastHub;
use nudge_core::{
    collect_reply, submit_refresh, Adjustment, DedupPolicy, Enforced, JobPool, ProfileRefresher,
    ReplyCheck, ReplyGenerator, ReplyRequest, TriggerSelector,
};
use nudge_memory::ChatHistoryStore;
use nudge_schema::{
    ChatRecord, ChatRole, RecordMeta, RunState, TriggerDecision, SOURCE_DEDUP_POLICY,
    SOURCE_REPLY_GENERATOR, SOURCE_TRIGGER_SELECTOR,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{ProactiveConfig, RunStateStore};

/// Shown instead of a reply when generation produced nothing.
pub const DIAGNOSTIC_PLACEHOLDER: &str =
    "[debug] proactive trigger fired but the model returned no content; check upstream logs.";

/// Collaborators shared by every user's scheduler.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub selector: Arc<TriggerSelector>,
    pub chats: Arc<ChatHistoryStore>,
    pub states: RunStateStore,
    pub generator: Arc<dyn ReplyGenerator>,
    pub hub: BroadcastHub,
    pub jobs: Arc<JobPool>,
    pub refresher: Arc<dyn ProfileRefresher>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum SkipReason {
    Disabled,
    CoolingDown { until: DateTime<Utc> },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplySource {
    Generated,
    Substituted,
    Placeholder,
}

#[derive(Debug, Clone, Serialize)]
pub struct TickReport {
    pub decision: TriggerDecision,
    pub adjustments: Vec<Adjustment>,
    pub injected: bool,
    /// Whether reply generation saw the trigger context.
    pub context_used: bool,
    pub reply_source: ReplySource,
    pub record: ChatRecord,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum TickOutcome {
    Skipped(SkipReason),
    Delivered(TickReport),
}

/// Periodic proactive engagement for one user.
pub struct ProactiveScheduler {
    user_id: String,
    config: ProactiveConfig,
    policy: DedupPolicy,
    deps: SchedulerDeps,
    rng: Mutex<StdRng>,
}

impl ProactiveScheduler {
    pub fn new(user_id: impl Into<String>, config: ProactiveConfig, deps: SchedulerDeps) -> Self {
        let policy = DedupPolicy::new(config.dedup.clone());
        Self {
            user_id: user_id.into(),
            config,
            policy,
            deps,
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    fn next_sleep(&self) -> Duration {
        let jitter = if self.config.jitter_secs > 0 {
            self.rng.lock().gen_range(0..=self.config.jitter_secs)
        } else {
            0
        };
        Duration::from_secs(self.config.interval_secs.max(1).saturating_add(jitter))
    }

    /// One wake-up: skip when disabled or cooling down, otherwise deliver and start a cooldown.
    ///
    /// The cooldown is persisted even when delivery failed part way.
    pub async fn tick(&self, now: DateTime<Utc>) -> Result<TickOutcome> {
        let state = match self.deps.states.load(&self.user_id).await {
            Ok(state) => state,
            Err(error) => {
                warn!(user_id = %self.user_id, %error, "run state unreadable, using defaults");
                RunState::default()
            }
        };
        if !state.enabled {
            return Ok(TickOutcome::Skipped(SkipReason::Disabled));
        }
        if let Some(until) = state.cooldown_until.filter(|_| state.is_cooling_down(now)) {
            return Ok(TickOutcome::Skipped(SkipReason::CoolingDown { until }));
        }

        let delivered = self.deliver(now).await;

        let cooldown = self.config.cooldown();
        self.deps
            .states
            .update(&self.user_id, |state| state.extend_cooldown(now, cooldown))
            .await
            .context("failed to start proactive cooldown")?;

        delivered.map(TickOutcome::Delivered)
    }

    async fn deliver(&self, now: DateTime<Utc>) -> Result<TickReport> {
        let deps = &self.deps;
        let ctx = deps.selector.prepare(&self.user_id).await;
        let proposed = deps.selector.decide(&ctx, now, &BTreeSet::new()).await;
        let Enforced {
            decision,
            adjustments,
        } = self
            .policy
            .enforce(proposed, &ctx.deliveries, now, |excluded| {
                deps.selector
                    .local_pick(&ctx.snapshot, excluded, now, ctx.timezone)
            });
        info!(
            user_id = %self.user_id,
            event_type = %decision.event_type,
            trigger_id = %decision.trigger_id,
            reason = %decision.reason,
            adjustments = adjustments.len(),
            "proactive trigger firing"
        );

        let (injected, context_used) = {
            let mut rng = self.rng.lock();
            let injected = rng.gen_bool(self.config.inject_rate());
            let ignored = rng.gen_bool(self.config.random_ignore_rate());
            (injected, injected && !ignored)
        };

        let mut meta = RecordMeta::proactive(&decision);
        meta.inject_skipped = !injected;
        if injected {
            let inject = ChatRecord::new(ChatRole::SystemInject, decision.context.as_str(), now)
                .with_source(SOURCE_TRIGGER_SELECTOR)
                .with_meta(meta.clone());
            deps.chats
                .append(&self.user_id, &inject)
                .await
                .context("failed to record trigger context")?;
        }

        let reply = self.generate_reply(&decision, context_used).await;
        let (content, source, reply_source) = if reply.is_empty() {
            (
                DIAGNOSTIC_PLACEHOLDER.to_string(),
                SOURCE_REPLY_GENERATOR,
                ReplySource::Placeholder,
            )
        } else {
            let check = self
                .policy
                .dedupe_reply(&reply, &ctx.deliveries, &mut *self.rng.lock());
            match check {
                ReplyCheck::Original(text) => (text, SOURCE_REPLY_GENERATOR, ReplySource::Generated),
                ReplyCheck::Substituted(text) => {
                    meta.substituted_reply = true;
                    (text, SOURCE_DEDUP_POLICY, ReplySource::Substituted)
                }
            }
        };

        let record = ChatRecord::new(ChatRole::Assistant, content, now)
            .with_source(source)
            .with_meta(meta.clone());
        deps.chats
            .append(&self.user_id, &record)
            .await
            .context("failed to record proactive reply")?;
        let receivers = deps
            .hub
            .broadcast_chat(&self.user_id, ChatRole::Assistant, &record.content, meta);
        debug!(user_id = %self.user_id, receivers, ?reply_source, "proactive reply published");
        submit_refresh(&deps.jobs, &deps.refresher, &self.user_id);

        Ok(TickReport {
            decision,
            adjustments,
            injected,
            context_used,
            reply_source,
            record,
        })
    }

    async fn generate_reply(&self, decision: &TriggerDecision, context_used: bool) -> String {
        let request = ReplyRequest {
            user_id: self.user_id.clone(),
            extra_context: context_used.then(|| decision.context.clone()),
            proactive: true,
        };
        let reply = match self.deps.generator.generate(request).await {
            Ok(stream) => collect_reply(stream).await,
            Err(error) => Err(error),
        };
        reply.unwrap_or_else(|error| {
            warn!(
                user_id = %self.user_id,
                trigger_id = %decision.trigger_id,
                %error,
                "proactive reply generation failed"
            );
            String::new()
        })
    }

    /// Runs the sleep/tick loop on a new task until the handle is stopped.
    pub fn spawn(self) -> SchedulerHandle {
        let token = CancellationToken::new();
        let user_id = self.user_id.clone();
        let join = tokio::spawn(self.run(token.clone()));
        SchedulerHandle {
            user_id,
            token,
            join,
        }
    }

    async fn run(self, token: CancellationToken) {
        info!(
            user_id = %self.user_id,
            interval_secs = self.config.interval_secs,
            cooldown_secs = self.config.cooldown_secs,
            "proactive scheduler started"
        );
        loop {
            let sleep = self.next_sleep();
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(sleep) => {}
            }

            match self.tick(Utc::now()).await {
                Ok(TickOutcome::Skipped(reason)) => {
                    debug!(user_id = %self.user_id, ?reason, "proactive tick skipped")
                }
                Ok(TickOutcome::Delivered(report)) => info!(
                    user_id = %self.user_id,
                    event_type = %report.decision.event_type,
                    reply_source = ?report.reply_source,
                    injected = report.injected,
                    "proactive tick delivered"
                ),
                Err(err) => error!(user_id = %self.user_id, error = %format!("{err:#}"), "proactive tick failed"),
            }
        }
        info!(user_id = %self.user_id, "proactive scheduler stopped");
    }
}

pub struct SchedulerHandle {
    user_id: String,
    token: CancellationToken,
    join: JoinHandle<()>,
}

impl SchedulerHandle {
    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Cancels the pending sleep and waits for any in-flight tick to finish.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(error) = self.join.await {
            warn!(user_id = %self.user_id, %error, "proactive scheduler task ended abnormally");
        }
    }
}
