use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono_tz::Tz;
use nudge_bus::HubConfig;
use nudge_core::JobPoolConfig;
use nudge_memory::validate_user_id;
use nudge_scheduler::ProactiveConfig;
use nudge_schema::MAX_DELAY_SECS;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub addr: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProviderConfig {
    pub api_base: String,
    pub api_key: String,
    /// Model used for topic selection.
    pub model: String,
    /// Model used for replies; falls back to `model`.
    pub reply_model: Option<String>,
    pub timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            api_base: nudge_provider::DEFAULT_API_BASE.to_string(),
            api_key: String::new(),
            model: nudge_provider::DEFAULT_MODEL.to_string(),
            reply_model: None,
            timeout_secs: 60,
        }
    }
}

impl ProviderConfig {
    pub fn reply_model(&self) -> &str {
        self.reply_model.as_deref().unwrap_or(&self.model)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct NudgeConfig {
    pub server: ServerConfig,
    /// Relative paths are resolved against the config root.
    pub data_dir: PathBuf,
    pub default_user_id: String,
    pub default_timezone: String,
    pub provider: ProviderConfig,
    pub hub: HubConfig,
    pub jobs: JobPoolConfig,
    pub proactive: ProactiveConfig,
}

impl Default for NudgeConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            data_dir: PathBuf::from("data"),
            default_user_id: "demo".to_string(),
            default_timezone: nudge_core::DEFAULT_TIMEZONE.name().to_string(),
            provider: ProviderConfig::default(),
            hub: HubConfig::default(),
            jobs: JobPoolConfig::default(),
            proactive: ProactiveConfig::default(),
        }
    }
}

impl NudgeConfig {
    pub fn data_dir(&self, root: &Path) -> PathBuf {
        if self.data_dir.is_absolute() {
            self.data_dir.clone()
        } else {
            root.join(&self.data_dir)
        }
    }

    pub fn timezone(&self) -> Result<Tz> {
        self.default_timezone
            .parse()
            .map_err(|_| anyhow!("unknown default_timezone: {}", self.default_timezone))
    }

    /// Users that get a scheduler at startup; the default user when none are listed.
    pub fn scheduled_users(&self) -> Vec<String> {
        if self.proactive.users.is_empty() {
            vec![self.default_user_id.clone()]
        } else {
            self.proactive.users.clone()
        }
    }
}

/// Replaces every `${NAME}` with the environment variable's value (empty when unset).
pub fn resolve_env_var(raw: &str) -> String {
    let mut output = String::new();
    let mut rest = raw;

    while let Some(start) = rest.find("${") {
        output.push_str(&rest[..start]);

        let candidate = &rest[start + 2..];
        let Some(end) = candidate.find('}') else {
            output.push_str(&rest[start..]);
            return output;
        };

        let key = &candidate[..end];
        output.push_str(&std::env::var(key).unwrap_or_default());
        rest = &candidate[end + 1..];
    }

    output.push_str(rest);
    output
}

/// Loads `main.yaml` from `config_dir`, then applies process environment overrides.
///
/// A missing file yields the defaults.
pub fn load_config(config_dir: &Path) -> Result<NudgeConfig> {
    let path = config_dir.join("main.yaml");
    let mut config = if path.exists() {
        read_yaml_file(&path)?
    } else {
        tracing::debug!(path = %path.display(), "no config file, using defaults");
        NudgeConfig::default()
    };
    resolve_config_env(&mut config);
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate_config(&config)?;
    Ok(config)
}

fn read_yaml_file<T>(path: &Path) -> Result<T>
where
    T: for<'de> Deserialize<'de>,
{
    let content = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file: {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse yaml file: {}", path.display()))
}

fn resolve_config_env(config: &mut NudgeConfig) {
    config.server.addr = resolve_env_var(&config.server.addr);
    config.default_user_id = resolve_env_var(&config.default_user_id);
    config.default_timezone = resolve_env_var(&config.default_timezone);
    config.data_dir = PathBuf::from(resolve_env_var(&config.data_dir.to_string_lossy()));

    config.provider.api_base = resolve_env_var(&config.provider.api_base);
    config.provider.api_key = resolve_env_var(&config.provider.api_key);
    config.provider.model = resolve_env_var(&config.provider.model);
    if let Some(model) = &mut config.provider.reply_model {
        *model = resolve_env_var(model);
    }

    for user in &mut config.proactive.users {
        *user = resolve_env_var(user);
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn override_with<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    parse: impl Fn(&str) -> Option<T>,
    apply: impl FnOnce(T),
) {
    let Some(raw) = lookup(key) else {
        return;
    };
    match parse(&raw) {
        Some(value) => apply(value),
        None => tracing::warn!(key, value = %raw, "ignoring unparsable environment override"),
    }
}

/// Deployment environment variables win over the file.
pub fn apply_env_overrides(config: &mut NudgeConfig, lookup: impl Fn(&str) -> Option<String>) {
    let proactive = &mut config.proactive;
    override_with(&lookup, "PROACTIVE_ENABLED", parse_flag, |v| {
        proactive.enabled = v
    });
    override_with(&lookup, "PROACTIVE_TICK_SECONDS", |s| s.trim().parse().ok(), |v| {
        proactive.interval_secs = v
    });
    override_with(
        &lookup,
        "PROACTIVE_COOLDOWN_SECONDS",
        |s| s.trim().parse().ok(),
        |v| proactive.cooldown_secs = v,
    );
    override_with(
        &lookup,
        "PROACTIVE_JITTER_SECONDS",
        |s| s.trim().parse().ok(),
        |v| proactive.jitter_secs = v,
    );
    override_with(&lookup, "PROACTIVE_INJECT_RATE", |s| s.trim().parse().ok(), |v| {
        proactive.p_inject = v
    });
    override_with(
        &lookup,
        "PROACTIVE_ASSISTANT_RANDOM_RATE",
        |s| s.trim().parse().ok(),
        |v| proactive.p_random_ignore = v,
    );
    override_with(&lookup, "PROACTIVE_TEST_MODE", parse_flag, |v| {
        proactive.dedup.test_mode = v
    });
    override_with(
        &lookup,
        "PROACTIVE_EVENT_MIN_SECONDS",
        |s| s.trim().parse().ok(),
        |v| proactive.dedup.min_interval_override_secs = Some(v),
    );
    override_with(&lookup, "PROACTIVE_IGNORE_HISTORY", parse_flag, |v| {
        proactive.dedup.ignore_history = v
    });

    if let Some(user_id) = lookup("PROACTIVE_USER_ID").filter(|u| !u.trim().is_empty()) {
        let user_id = user_id.trim().to_string();
        config.proactive.users = vec![user_id.clone()];
        config.default_user_id = user_id;
    }

    let provider = &mut config.provider;
    if let Some(key) = lookup("OPENAI_API_KEY") {
        provider.api_key = key.trim().to_string();
    }
    if let Some(model) = lookup("OPENAI_MODEL").filter(|m| !m.trim().is_empty()) {
        provider.model = model.trim().to_string();
    }
    if let Some(base) = lookup("OPENAI_BASE_URL").filter(|b| !b.trim().is_empty()) {
        provider.api_base = base.trim().to_string();
    }
}

pub fn validate_config(config: &NudgeConfig) -> Result<()> {
    validate_user_id(&config.default_user_id).context("default_user_id")?;
    for user in &config.proactive.users {
        validate_user_id(user).context("proactive.users")?;
    }
    config.timezone()?;

    let proactive = &config.proactive;
    if proactive.interval_secs == 0 {
        return Err(anyhow!("proactive.interval_secs must be at least 1"));
    }
    for (name, p) in [
        ("p_inject", proactive.p_inject),
        ("p_random_ignore", proactive.p_random_ignore),
    ] {
        if !(0.0..=1.0).contains(&p) {
            return Err(anyhow!("proactive.{name} must be within [0, 1], got {p}"));
        }
    }
    let dedup = &proactive.dedup;
    let delays = [
        ("interval_secs", Some(proactive.interval_secs)),
        ("cooldown_secs", Some(proactive.cooldown_secs)),
        ("jitter_secs", Some(proactive.jitter_secs)),
        ("dedup.default_min_interval_secs", Some(dedup.default_min_interval_secs)),
        ("dedup.test_mode_min_interval_secs", Some(dedup.test_mode_min_interval_secs)),
        ("dedup.min_interval_override_secs", dedup.min_interval_override_secs),
    ];
    let per_type = dedup
        .per_type_min_interval_secs
        .values()
        .map(|secs| ("dedup.per_type_min_interval_secs", Some(*secs)));
    for (name, secs) in delays.into_iter().chain(per_type) {
        if let Some(secs) = secs.filter(|secs| *secs > MAX_DELAY_SECS) {
            return Err(anyhow!("proactive.{name} must be at most {MAX_DELAY_SECS}, got {secs}"));
        }
    }
    if config.jobs.workers == 0 {
        return Err(anyhow!("jobs.workers must be at least 1"));
    }
    Ok(())
}
