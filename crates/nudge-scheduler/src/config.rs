use nudge_core::DedupConfig;
use nudge_schema::delay_from_secs;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ProactiveConfig {
    pub enabled: bool,
    /// Users that get a scheduler at startup.
    pub users: Vec<String>,
    pub interval_secs: u64,
    pub cooldown_secs: u64,
    pub jitter_secs: u64,
    /// Chance that the trigger context is written to history as a `system_inject` record.
    pub p_inject: f64,
    /// Chance that reply generation ignores an injected context anyway.
    pub p_random_ignore: f64,
    pub dedup: DedupConfig,
}

impl Default for ProactiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            users: Vec::new(),
            interval_secs: 30,
            cooldown_secs: 1800,
            jitter_secs: 0,
            p_inject: 0.7,
            p_random_ignore: 0.5,
            dedup: DedupConfig::default(),
        }
    }
}

fn clamp_probability(p: f64) -> f64 {
    if p.is_nan() {
        0.0
    } else {
        p.clamp(0.0, 1.0)
    }
}

impl ProactiveConfig {
    pub fn inject_rate(&self) -> f64 {
        clamp_probability(self.p_inject)
    }

    pub fn random_ignore_rate(&self) -> f64 {
        clamp_probability(self.p_random_ignore)
    }

    pub fn cooldown(&self) -> chrono::Duration {
        delay_from_secs(self.cooldown_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_deployment() {
        let config: ProactiveConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.interval_secs, 30);
        assert_eq!(config.cooldown_secs, 1800);
        assert_eq!(config.jitter_secs, 0);
        assert_eq!(config.p_inject, 0.7);
        assert_eq!(config.p_random_ignore, 0.5);
        assert_eq!(config.dedup.recent_window, 3);
    }

    #[test]
    fn probabilities_are_clamped() {
        let config = ProactiveConfig {
            p_inject: 1.7,
            p_random_ignore: -0.2,
            ..ProactiveConfig::default()
        };
        assert_eq!(config.inject_rate(), 1.0);
        assert_eq!(config.random_ignore_rate(), 0.0);

        let config = ProactiveConfig {
            p_inject: f64::NAN,
            ..ProactiveConfig::default()
        };
        assert_eq!(config.inject_rate(), 0.0);
    }

    #[test]
    fn partial_dedup_section_keeps_other_defaults() {
        let config: ProactiveConfig =
            serde_json::from_str(r#"{"cooldown_secs": 60, "dedup": {"test_mode": true}}"#).unwrap();
        assert_eq!(config.cooldown_secs, 60);
        assert!(config.dedup.test_mode);
        assert_eq!(config.dedup.frequency_window, 8);
        assert_eq!(config.cooldown(), chrono::Duration::seconds(60));
    }

    #[test]
    fn oversized_cooldown_is_capped() {
        let config = ProactiveConfig {
            cooldown_secs: u64::MAX,
            ..ProactiveConfig::default()
        };
        assert_eq!(config.cooldown(), delay_from_secs(nudge_schema::MAX_DELAY_SECS));
    }
}
