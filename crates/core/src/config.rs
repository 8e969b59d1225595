use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use std::collections::HashMap;
use std::str::FromStr;

use crate::error::ConfigError;

/// Prefix for environment overrides: `GHOST_<FIELD>` in upper case.
const ENV_PREFIX: &str = "GHOST_";

/// Whether affect is tracked per conversation or shared by all of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AffectScope {
    #[default]
    PerContext,
    Global,
}

impl FromStr for AffectScope {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "per_context" => Ok(Self::PerContext),
            "global" => Ok(Self::Global),
            other => Err(format!("unknown affect scope `{other}`")),
        }
    }
}

impl std::fmt::Display for AffectScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::PerContext => "per_context",
            Self::Global => "global",
        })
    }
}

/// All ghost runtime parameters. Loaded from the `ghost_config` table and
/// `GHOST_*` environment overrides at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GhostCfg {
    // persona
    pub persona_name: String,
    pub persona_prompt: String,
    pub temperature: f32,
    pub max_output_tokens: u32,
    pub fallback_message: String,
    pub thinking_message: String,

    // affect
    pub affect_scope: AffectScope,
    pub default_pleasure: f32,
    pub default_arousal: f32,
    pub default_dominance: f32,
    pub circadian_amplitude: f32,
    pub active_hour: u32,
    pub quiet_hour: u32,
    pub decay_half_life_secs: u64,
    pub decay_tick_secs: u64,
    pub max_interaction_delta: f32,
    pub grudge_release_secs: u64,

    // cryostasis
    pub gpu_threshold_percent: f32,
    pub cpu_threshold_percent: f32,
    pub vram_threshold_mb: f32,
    pub high_debounce: u32,
    pub low_debounce: u32,
    pub exempt_processes: Vec<String>,
    pub blacklist_processes: Vec<String>,
    pub sample_interval_ms: u64,
    pub wake_cooldown_secs: u64,

    // memory
    pub episodic_buffer_size: usize,
    pub retrieval_k: usize,
    pub context_budget_chars: usize,
    pub search_window: i64,

    // inference
    pub inference_max_attempts: u32,
    pub retry_backoff_ms: u64,
    pub reload_grace_ms: u64,
    pub reload_timeout_ms: u64,
    pub turn_timeout_ms: u64,
    pub worker_idle_secs: u64,

    // shutdown
    pub shutdown_timeout_secs: u64,
}

impl Default for GhostCfg {
    fn default() -> Self {
        Self {
            persona_name: "Korone".into(),
            persona_prompt: "You are Korone, a laid-back companion who lives on this computer. \
                             You chat casually, keep replies short, and remember what matters to the user."
                .into(),
            temperature: 0.72,
            max_output_tokens: 150,
            fallback_message: "sorry, i'm having trouble thinking right now...".into(),
            thinking_message: "hold on, waking up...".into(),
            affect_scope: AffectScope::PerContext,
            default_pleasure: 0.6,
            default_arousal: 0.7,
            default_dominance: 0.5,
            circadian_amplitude: 0.2,
            active_hour: 14,
            quiet_hour: 3,
            decay_half_life_secs: 600,
            decay_tick_secs: 30,
            max_interaction_delta: 0.25,
            grudge_release_secs: 1800,
            gpu_threshold_percent: 75.0,
            cpu_threshold_percent: 60.0,
            vram_threshold_mb: 14_000.0,
            high_debounce: 3,
            low_debounce: 3,
            exempt_processes: vec!["ollama".into(), "ollama_llama_server".into()],
            blacklist_processes: vec!["notepad.exe".into()],
            sample_interval_ms: 5000,
            wake_cooldown_secs: 30,
            episodic_buffer_size: 20,
            retrieval_k: 3,
            context_budget_chars: 4000,
            search_window: 500,
            inference_max_attempts: 2,
            retry_backoff_ms: 250,
            reload_grace_ms: 1500,
            reload_timeout_ms: 30_000,
            turn_timeout_ms: 60_000,
            worker_idle_secs: 1800,
            shutdown_timeout_secs: 15,
        }
    }
}

impl GhostCfg {
    /// Load config from `ghost_config` table. If table is empty, seed with defaults.
    pub async fn load(pool: &PgPool) -> Result<Self, sqlx::Error> {
        let rows: Vec<(String, String)> = sqlx::query_as("SELECT key, value FROM ghost_config")
            .fetch_all(pool)
            .await?;

        if rows.is_empty() {
            let cfg = Self::default();
            cfg.seed(pool).await?;
            return Ok(cfg);
        }

        let map: HashMap<String, String> = rows.into_iter().collect();
        Ok(Self::from_map(&map))
    }

    /// Write all default values into `ghost_config` table.
    async fn seed(&self, pool: &PgPool) -> Result<(), sqlx::Error> {
        for (key, value, desc) in &self.to_entries() {
            sqlx::query(
                "INSERT INTO ghost_config (key, value, description) VALUES ($1, $2, $3) \
                 ON CONFLICT (key) DO NOTHING",
            )
            .bind(key)
            .bind(value)
            .bind(desc)
            .execute(pool)
            .await?;
        }
        Ok(())
    }

    pub fn from_map(m: &HashMap<String, String>) -> Self {
        Self::default().merged(m)
    }

    /// Apply `GHOST_<FIELD>` environment variables on top of `self`.
    pub fn with_env_overrides(&self) -> Self {
        self.merged(&env_overrides(std::env::vars()))
    }

    /// Overlay string values onto `self`. Unparseable values keep the current one.
    pub fn merged(&self, m: &HashMap<String, String>) -> Self {
        let d = self;
        Self {
            persona_name: get_or(m, "persona_name", d.persona_name.clone()),
            persona_prompt: get_or(m, "persona_prompt", d.persona_prompt.clone()),
            temperature: get_or(m, "temperature", d.temperature),
            max_output_tokens: get_or(m, "max_output_tokens", d.max_output_tokens),
            fallback_message: get_or(m, "fallback_message", d.fallback_message.clone()),
            thinking_message: get_or(m, "thinking_message", d.thinking_message.clone()),
            affect_scope: get_or(m, "affect_scope", d.affect_scope),
            default_pleasure: get_or(m, "default_pleasure", d.default_pleasure),
            default_arousal: get_or(m, "default_arousal", d.default_arousal),
            default_dominance: get_or(m, "default_dominance", d.default_dominance),
            circadian_amplitude: get_or(m, "circadian_amplitude", d.circadian_amplitude),
            active_hour: get_or(m, "active_hour", d.active_hour),
            quiet_hour: get_or(m, "quiet_hour", d.quiet_hour),
            decay_half_life_secs: get_or(m, "decay_half_life_secs", d.decay_half_life_secs),
            decay_tick_secs: get_or(m, "decay_tick_secs", d.decay_tick_secs),
            max_interaction_delta: get_or(m, "max_interaction_delta", d.max_interaction_delta),
            grudge_release_secs: get_or(m, "grudge_release_secs", d.grudge_release_secs),
            gpu_threshold_percent: get_or(m, "gpu_threshold_percent", d.gpu_threshold_percent),
            cpu_threshold_percent: get_or(m, "cpu_threshold_percent", d.cpu_threshold_percent),
            vram_threshold_mb: get_or(m, "vram_threshold_mb", d.vram_threshold_mb),
            high_debounce: get_or(m, "high_debounce", d.high_debounce),
            low_debounce: get_or(m, "low_debounce", d.low_debounce),
            exempt_processes: get_list_or(m, "exempt_processes", &d.exempt_processes),
            blacklist_processes: get_list_or(m, "blacklist_processes", &d.blacklist_processes),
            sample_interval_ms: get_or(m, "sample_interval_ms", d.sample_interval_ms),
            wake_cooldown_secs: get_or(m, "wake_cooldown_secs", d.wake_cooldown_secs),
            episodic_buffer_size: get_or(m, "episodic_buffer_size", d.episodic_buffer_size),
            retrieval_k: get_or(m, "retrieval_k", d.retrieval_k),
            context_budget_chars: get_or(m, "context_budget_chars", d.context_budget_chars),
            search_window: get_or(m, "search_window", d.search_window),
            inference_max_attempts: get_or(m, "inference_max_attempts", d.inference_max_attempts),
            retry_backoff_ms: get_or(m, "retry_backoff_ms", d.retry_backoff_ms),
            reload_grace_ms: get_or(m, "reload_grace_ms", d.reload_grace_ms),
            reload_timeout_ms: get_or(m, "reload_timeout_ms", d.reload_timeout_ms),
            turn_timeout_ms: get_or(m, "turn_timeout_ms", d.turn_timeout_ms),
            worker_idle_secs: get_or(m, "worker_idle_secs", d.worker_idle_secs),
            shutdown_timeout_secs: get_or(m, "shutdown_timeout_secs", d.shutdown_timeout_secs),
        }
    }

    /// Reject values the runtime cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.persona_name.trim().is_empty() {
            return Err(ConfigError::invalid("persona_name", "must not be empty"));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::invalid("temperature", "must be within [0, 2]"));
        }
        for (key, v) in [
            ("default_pleasure", self.default_pleasure),
            ("default_arousal", self.default_arousal),
            ("default_dominance", self.default_dominance),
        ] {
            if !(-1.0..=1.0).contains(&v) {
                return Err(ConfigError::invalid(key, "must be within [-1, 1]"));
            }
        }
        if !(0.0..=1.0).contains(&self.circadian_amplitude) {
            return Err(ConfigError::invalid("circadian_amplitude", "must be within [0, 1]"));
        }
        if !(0.0..=1.0).contains(&self.max_interaction_delta) || self.max_interaction_delta == 0.0 {
            return Err(ConfigError::invalid("max_interaction_delta", "must be within (0, 1]"));
        }
        for (key, h) in [("active_hour", self.active_hour), ("quiet_hour", self.quiet_hour)] {
            if h >= 24 {
                return Err(ConfigError::invalid(key, "must be an hour of day (0-23)"));
            }
        }
        if self.active_hour == self.quiet_hour {
            return Err(ConfigError::invalid("quiet_hour", "must differ from active_hour"));
        }
        for (key, v) in [
            ("gpu_threshold_percent", self.gpu_threshold_percent),
            ("cpu_threshold_percent", self.cpu_threshold_percent),
        ] {
            if !(v > 0.0 && v <= 100.0) {
                return Err(ConfigError::invalid(key, "must be within (0, 100]"));
            }
        }
        for (key, v) in [
            ("high_debounce", u64::from(self.high_debounce)),
            ("low_debounce", u64::from(self.low_debounce)),
            ("inference_max_attempts", u64::from(self.inference_max_attempts)),
            ("max_output_tokens", u64::from(self.max_output_tokens)),
            ("episodic_buffer_size", self.episodic_buffer_size as u64),
            ("context_budget_chars", self.context_budget_chars as u64),
            ("decay_half_life_secs", self.decay_half_life_secs),
            ("decay_tick_secs", self.decay_tick_secs),
            ("sample_interval_ms", self.sample_interval_ms),
            ("turn_timeout_ms", self.turn_timeout_ms),
            ("reload_timeout_ms", self.reload_timeout_ms),
            ("worker_idle_secs", self.worker_idle_secs),
        ] {
            if v == 0 {
                return Err(ConfigError::invalid(key, "must be greater than zero"));
            }
        }
        if !(self.vram_threshold_mb > 0.0) {
            return Err(ConfigError::invalid("vram_threshold_mb", "must be greater than zero"));
        }
        if self.reload_grace_ms > self.reload_timeout_ms {
            return Err(ConfigError::invalid("reload_grace_ms", "must not exceed reload_timeout_ms"));
        }
        if self.search_window < 1 {
            return Err(ConfigError::invalid("search_window", "must be at least 1"));
        }
        Ok(())
    }

    fn to_entries(&self) -> Vec<(&'static str, String, &'static str)> {
        vec![
            ("persona_name", self.persona_name.clone(), "Name the persona speaks as"),
            ("persona_prompt", self.persona_prompt.clone(), "Base system prompt"),
            ("temperature", self.temperature.to_string(), "Sampling temperature"),
            ("max_output_tokens", self.max_output_tokens.to_string(), "Reply token cap"),
            ("fallback_message", self.fallback_message.clone(), "Reply sent when inference fails"),
            ("thinking_message", self.thinking_message.clone(), "Signal sent while the model reloads"),
            ("affect_scope", self.affect_scope.to_string(), "per_context or global affect"),
            ("default_pleasure", self.default_pleasure.to_string(), "Pleasure baseline"),
            ("default_arousal", self.default_arousal.to_string(), "Arousal baseline"),
            ("default_dominance", self.default_dominance.to_string(), "Dominance baseline"),
            ("circadian_amplitude", self.circadian_amplitude.to_string(), "Baseline swing over the day"),
            ("active_hour", self.active_hour.to_string(), "Hour of circadian peak"),
            ("quiet_hour", self.quiet_hour.to_string(), "Hour of circadian trough"),
            ("decay_half_life_secs", self.decay_half_life_secs.to_string(), "Affect decay half-life"),
            ("decay_tick_secs", self.decay_tick_secs.to_string(), "Affect decay tick interval"),
            ("max_interaction_delta", self.max_interaction_delta.to_string(), "Per-turn affect delta bound"),
            ("grudge_release_secs", self.grudge_release_secs.to_string(), "Seconds before a grudge lapses"),
            ("gpu_threshold_percent", self.gpu_threshold_percent.to_string(), "GPU pressure threshold"),
            ("cpu_threshold_percent", self.cpu_threshold_percent.to_string(), "CPU pressure threshold"),
            ("vram_threshold_mb", self.vram_threshold_mb.to_string(), "VRAM pressure threshold in MiB"),
            ("high_debounce", self.high_debounce.to_string(), "High samples before acting"),
            ("low_debounce", self.low_debounce.to_string(), "Low samples before acting"),
            ("exempt_processes", self.exempt_processes.join(","), "Processes that never count as pressure"),
            ("blacklist_processes", self.blacklist_processes.join(","), "Processes that always count as pressure"),
            ("sample_interval_ms", self.sample_interval_ms.to_string(), "Resource sampling interval"),
            ("wake_cooldown_secs", self.wake_cooldown_secs.to_string(), "Minimum residency after a reload"),
            ("episodic_buffer_size", self.episodic_buffer_size.to_string(), "Recent records kept per context"),
            ("retrieval_k", self.retrieval_k.to_string(), "Long-term records recalled per turn"),
            ("context_budget_chars", self.context_budget_chars.to_string(), "Assembled context size cap"),
            ("search_window", self.search_window.to_string(), "Candidates ranked per long-term search"),
            ("inference_max_attempts", self.inference_max_attempts.to_string(), "Attempts before fallback"),
            ("retry_backoff_ms", self.retry_backoff_ms.to_string(), "First retry delay"),
            ("reload_grace_ms", self.reload_grace_ms.to_string(), "Silent wait for a reload"),
            ("reload_timeout_ms", self.reload_timeout_ms.to_string(), "Total wait for a reload"),
            ("turn_timeout_ms", self.turn_timeout_ms.to_string(), "Whole-turn deadline"),
            ("worker_idle_secs", self.worker_idle_secs.to_string(), "Idle time before a context worker is reaped"),
            ("shutdown_timeout_secs", self.shutdown_timeout_secs.to_string(), "Graceful shutdown timeout"),
        ]
    }
}

/// Collect `GHOST_<FIELD>` variables as lower-case field keys.
fn env_overrides(vars: impl Iterator<Item = (String, String)>) -> HashMap<String, String> {
    vars.filter_map(|(k, v)| {
        k.strip_prefix(ENV_PREFIX).map(|field| (field.to_lowercase(), v))
    })
    .collect()
}

fn get_or<T: FromStr>(m: &HashMap<String, String>, key: &str, default: T) -> T {
    match m.get(key) {
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, "unparseable config value, keeping previous");
                default
            }
        },
        None => default,
    }
}

fn get_list_or(m: &HashMap<String, String>, key: &str, default: &[String]) -> Vec<String> {
    match m.get(key) {
        Some(raw) => raw
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
            .collect(),
        None => default.to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn defaults_are_valid() {
        GhostCfg::default().validate().unwrap();
    }

    #[test]
    fn from_map_parses_known_keys() {
        let cfg = GhostCfg::from_map(&map(&[
            ("gpu_threshold_percent", "80"),
            ("affect_scope", "global"),
            ("blacklist_processes", "Game.exe, obs64.exe ,"),
        ]));
        assert_eq!(cfg.gpu_threshold_percent, 80.0);
        assert_eq!(cfg.affect_scope, AffectScope::Global);
        assert_eq!(cfg.blacklist_processes, vec!["game.exe", "obs64.exe"]);
        assert_eq!(cfg.high_debounce, 3);
    }

    #[test]
    fn unparseable_value_keeps_default() {
        let cfg = GhostCfg::from_map(&map(&[("high_debounce", "lots")]));
        assert_eq!(cfg.high_debounce, 3);
    }

    #[test]
    fn env_overrides_strip_prefix() {
        let vars = vec![
            ("GHOST_LOW_DEBOUNCE".to_string(), "5".to_string()),
            ("PATH".to_string(), "/bin".to_string()),
        ];
        let overrides = env_overrides(vars.into_iter());
        assert_eq!(overrides.len(), 1);
        let cfg = GhostCfg::default().merged(&overrides);
        assert_eq!(cfg.low_debounce, 5);
    }

    #[test]
    fn entries_round_trip_through_map() {
        let cfg = GhostCfg { retrieval_k: 7, ..GhostCfg::default() };
        let m: HashMap<String, String> = cfg
            .to_entries()
            .into_iter()
            .map(|(k, v, _)| (k.to_string(), v))
            .collect();
        let back = GhostCfg::from_map(&m);
        assert_eq!(back.retrieval_k, 7);
        assert_eq!(back.exempt_processes, cfg.exempt_processes);
    }

    #[test]
    fn validate_rejects_bad_values() {
        let bad = [
            GhostCfg { gpu_threshold_percent: 0.0, ..GhostCfg::default() },
            GhostCfg { cpu_threshold_percent: 120.0, ..GhostCfg::default() },
            GhostCfg { high_debounce: 0, ..GhostCfg::default() },
            GhostCfg { temperature: 2.5, ..GhostCfg::default() },
            GhostCfg { default_arousal: 1.5, ..GhostCfg::default() },
            GhostCfg { quiet_hour: 14, ..GhostCfg::default() },
            GhostCfg { persona_name: " ".into(), ..GhostCfg::default() },
            GhostCfg { inference_max_attempts: 0, ..GhostCfg::default() },
            GhostCfg { reload_grace_ms: 60_000, ..GhostCfg::default() },
            GhostCfg { vram_threshold_mb: 0.0, ..GhostCfg::default() },
            GhostCfg { worker_idle_secs: 0, ..GhostCfg::default() },
        ];
        for cfg in bad {
            assert!(cfg.validate().is_err(), "accepted {cfg:?}");
        }
    }

    #[test]
    fn validate_names_offending_key() {
        let err = GhostCfg { low_debounce: 0, ..GhostCfg::default() }.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "low_debounce", .. }));
    }
}
