use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::decoder::DecoderKind;

const DEFAULT_GRACE_SECONDS: u64 = 300;
const DEFAULT_IDLE_SECONDS: u64 = 600;
const DEFAULT_MAX_WORKERS: u64 = 4;
const DEFAULT_SWEEP_SECONDS: u64 = 15;
const DEFAULT_REFRESH_SECONDS: u64 = 60;
const DEFAULT_HEARTBEAT_SECONDS: u64 = 30;
const DEFAULT_WORKER_TIMEOUT_SECONDS: u64 = 120;
const CONFIG_SCHEMA_VERSION: u32 = 2;
const MAX_DURATION_SECONDS: u64 = 86_400 * 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PulseConfig {
    pub schema_version: u32,
    pub projects_dir: Option<String>,
    pub decoder: DecoderKind,
    pub pricing: PricingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PricingConfig {
    pub aliases: BTreeMap<String, String>,
    pub overrides: BTreeMap<String, RateOverride>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RateOverride {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_read_per_million: Option<f64>,
    pub cache_creation_per_million: Option<f64>,
}

impl Default for RateOverride {
    fn default() -> Self {
        Self {
            input_per_million: 0.0,
            output_per_million: 0.0,
            cache_read_per_million: Some(0.0),
            cache_creation_per_million: Some(0.0),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub grace_period: Duration,
    pub idle_timeout: Duration,
    pub max_workers: usize,
    pub shutdown_disabled: bool,
    pub sweep_interval: Duration,
    pub refresh_interval: Duration,
    pub heartbeat_interval: Duration,
    pub worker_timeout: Duration,
}

impl Default for RuntimeSettings {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(DEFAULT_GRACE_SECONDS),
            idle_timeout: Duration::from_secs(DEFAULT_IDLE_SECONDS),
            max_workers: DEFAULT_MAX_WORKERS as usize,
            shutdown_disabled: false,
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_SECONDS),
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_SECONDS),
            heartbeat_interval: Duration::from_secs(DEFAULT_HEARTBEAT_SECONDS),
            worker_timeout: Duration::from_secs(DEFAULT_WORKER_TIMEOUT_SECONDS),
        }
    }
}

impl Default for PulseConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            projects_dir: None,
            decoder: DecoderKind::Auto,
            pricing: PricingConfig::default(),
        }
    }
}

impl PulseConfig {
    pub fn load_or_init() -> Result<Self> {
        let cfg_path = config_path();
        if let Some(parent) = cfg_path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        if cfg_path.exists() {
            let raw = fs::read_to_string(&cfg_path)
                .with_context(|| format!("failed to read {}", cfg_path.display()))?;
            let mut parsed: PulseConfig = serde_json::from_str(&raw)
                .with_context(|| format!("invalid JSON in {}", cfg_path.display()))?;
            if parsed.normalize_and_migrate() {
                parsed.save()?;
            }
            Ok(parsed)
        } else {
            let cfg = PulseConfig::default();
            cfg.save()?;
            Ok(cfg)
        }
    }

    pub fn save(&self) -> Result<()> {
        let path = config_path();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| {
                format!("failed to create config directory {}", parent.display())
            })?;
        }

        let data = serde_json::to_string_pretty(self)?;
        fs::write(&path, data).with_context(|| format!("failed to write {}", path.display()))?;
        Ok(())
    }

    pub fn projects_root(&self) -> PathBuf {
        self.projects_dir
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(projects_path)
    }

    fn normalize_and_migrate(&mut self) -> bool {
        let mut changed = false;

        if self.schema_version < CONFIG_SCHEMA_VERSION {
            self.schema_version = CONFIG_SCHEMA_VERSION;
            changed = true;
        }
        if self
            .projects_dir
            .as_deref()
            .is_some_and(|dir| dir.trim().is_empty())
        {
            self.projects_dir = None;
            changed = true;
        }
        if normalize_pricing_config(&mut self.pricing) {
            changed = true;
        }

        changed
    }
}

pub fn runtime_settings() -> RuntimeSettings {
    RuntimeSettings {
        grace_period: env_seconds("USAGE_PULSE_GRACE_SECONDS", DEFAULT_GRACE_SECONDS),
        idle_timeout: env_seconds("USAGE_PULSE_IDLE_SECONDS", DEFAULT_IDLE_SECONDS),
        max_workers: env_u64("USAGE_PULSE_MAX_WORKERS", DEFAULT_MAX_WORKERS) as usize,
        shutdown_disabled: env_flag("USAGE_PULSE_DISABLE_SHUTDOWN"),
        sweep_interval: env_seconds("USAGE_PULSE_SWEEP_SECONDS", DEFAULT_SWEEP_SECONDS),
        refresh_interval: env_seconds("USAGE_PULSE_REFRESH_SECONDS", DEFAULT_REFRESH_SECONDS),
        heartbeat_interval: env_seconds("USAGE_PULSE_HEARTBEAT_SECONDS", DEFAULT_HEARTBEAT_SECONDS),
        worker_timeout: env_seconds("USAGE_PULSE_WORKER_TIMEOUT_SECONDS", DEFAULT_WORKER_TIMEOUT_SECONDS),
    }
}

pub fn claude_home() -> PathBuf {
    if let Ok(custom) = env::var("CLAUDE_CONFIG_DIR") {
        let trimmed = custom.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
}

pub fn projects_path() -> PathBuf {
    claude_home().join("projects")
}

pub fn config_path() -> PathBuf {
    claude_home().join("usage-pulse-config.json")
}

pub fn lock_path() -> PathBuf {
    claude_home().join("usage-pulse.lock")
}

pub fn instance_meta_path() -> PathBuf {
    claude_home().join("usage-pulse.instance.json")
}

fn env_u64(name: &str, default: u64) -> u64 {
    env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<u64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
}

fn env_seconds(name: &str, default: u64) -> Duration {
    Duration::from_secs(env_u64(name, default).min(MAX_DURATION_SECONDS))
}

fn env_flag(name: &str) -> bool {
    env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false)
}

fn normalize_pricing_config(pricing: &mut PricingConfig) -> bool {
    let mut changed = false;

    let mut normalized_aliases: BTreeMap<String, String> = BTreeMap::new();
    for (raw_key, raw_target) in pricing.aliases.clone() {
        let key = raw_key.trim().to_ascii_lowercase();
        let target = raw_target.trim().to_ascii_lowercase();
        if key.is_empty() || target.is_empty() || key == target {
            changed = true;
            continue;
        }
        if key != raw_key || target != raw_target {
            changed = true;
        }
        normalized_aliases.insert(key, target);
    }
    if pricing.aliases != normalized_aliases {
        pricing.aliases = normalized_aliases;
        changed = true;
    }

    let mut normalized_overrides: BTreeMap<String, RateOverride> = BTreeMap::new();
    for (raw_key, mut rates) in pricing.overrides.clone() {
        let key = raw_key.trim().to_ascii_lowercase();
        if key.is_empty() {
            changed = true;
            continue;
        }

        for rate in [&mut rates.input_per_million, &mut rates.output_per_million] {
            if !rate.is_finite() || *rate < 0.0 {
                *rate = 0.0;
                changed = true;
            }
        }
        for rate in [
            &mut rates.cache_read_per_million,
            &mut rates.cache_creation_per_million,
        ] {
            if let Some(value) = *rate
                && (!value.is_finite() || value < 0.0)
            {
                *rate = None;
                changed = true;
            }
        }

        if key != raw_key {
            changed = true;
        }
        normalized_overrides.insert(key, rates);
    }
    if pricing.overrides != normalized_overrides {
        pricing.overrides = normalized_overrides;
        changed = true;
    }

    changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::env_lock;

    #[test]
    fn defaults_use_auto_decoder_and_empty_pricing() {
        let cfg = PulseConfig::default();
        assert_eq!(cfg.schema_version, CONFIG_SCHEMA_VERSION);
        assert_eq!(cfg.decoder, DecoderKind::Auto);
        assert!(cfg.pricing.aliases.is_empty());
        assert!(cfg.pricing.overrides.is_empty());
    }

    #[test]
    fn migration_bumps_schema_and_clears_blank_projects_dir() {
        let mut cfg = PulseConfig {
            schema_version: 1,
            projects_dir: Some("   ".to_string()),
            ..PulseConfig::default()
        };

        assert!(cfg.normalize_and_migrate());
        assert_eq!(cfg.schema_version, CONFIG_SCHEMA_VERSION);
        assert_eq!(cfg.projects_dir, None);
        assert!(!cfg.normalize_and_migrate());
    }

    #[test]
    fn pricing_normalization_lowercases_keys_and_drops_bad_rates() {
        let mut cfg = PulseConfig::default();
        cfg.pricing
            .aliases
            .insert(" Claude-Next ".to_string(), " OPUS ".to_string());
        cfg.pricing.overrides.insert(
            " Haiku ".to_string(),
            RateOverride {
                input_per_million: -1.0,
                output_per_million: 5.0,
                cache_read_per_million: Some(f64::INFINITY),
                cache_creation_per_million: Some(1.25),
            },
        );

        assert!(cfg.normalize_and_migrate());
        assert_eq!(
            cfg.pricing.aliases.get("claude-next").map(String::as_str),
            Some("opus")
        );
        let haiku = cfg.pricing.overrides.get("haiku").expect("haiku override");
        assert_eq!(haiku.input_per_million, 0.0);
        assert_eq!(haiku.cache_read_per_million, None);
        assert_eq!(haiku.cache_creation_per_million, Some(1.25));
    }

    #[test]
    fn explicit_projects_dir_wins() {
        let cfg = PulseConfig {
            projects_dir: Some("/data/projects".to_string()),
            ..PulseConfig::default()
        };
        assert_eq!(cfg.projects_root(), PathBuf::from("/data/projects"));
    }

    const RUNTIME_VARS: [&str; 5] = [
        "USAGE_PULSE_GRACE_SECONDS",
        "USAGE_PULSE_IDLE_SECONDS",
        "USAGE_PULSE_MAX_WORKERS",
        "USAGE_PULSE_DISABLE_SHUTDOWN",
        "USAGE_PULSE_SWEEP_SECONDS",
    ];

    fn clear_runtime_vars() {
        for name in RUNTIME_VARS {
            unsafe {
                env::remove_var(name);
            }
        }
    }

    #[test]
    fn runtime_settings_read_env_and_reject_bad_values() {
        let _mutex = env_lock().lock().expect("env lock");
        clear_runtime_vars();
        unsafe {
            env::set_var("USAGE_PULSE_GRACE_SECONDS", " 45 ");
            env::set_var("USAGE_PULSE_IDLE_SECONDS", "0");
            env::set_var("USAGE_PULSE_MAX_WORKERS", "-3");
            env::set_var("USAGE_PULSE_DISABLE_SHUTDOWN", "Yes");
            env::set_var("USAGE_PULSE_SWEEP_SECONDS", "soon");
        }

        let settings = runtime_settings();
        clear_runtime_vars();

        assert_eq!(settings.grace_period, Duration::from_secs(45));
        assert_eq!(settings.idle_timeout, Duration::from_secs(DEFAULT_IDLE_SECONDS));
        assert_eq!(settings.max_workers, DEFAULT_MAX_WORKERS as usize);
        assert!(settings.shutdown_disabled);
        assert_eq!(settings.sweep_interval, Duration::from_secs(DEFAULT_SWEEP_SECONDS));
    }

    #[test]
    fn runtime_durations_are_capped() {
        let _mutex = env_lock().lock().expect("env lock");
        clear_runtime_vars();
        unsafe {
            env::set_var("USAGE_PULSE_GRACE_SECONDS", u64::MAX.to_string());
        }

        let settings = runtime_settings();
        clear_runtime_vars();

        assert_eq!(settings.grace_period, Duration::from_secs(MAX_DURATION_SECONDS));
    }

    #[test]
    fn runtime_defaults_are_positive() {
        let settings = RuntimeSettings::default();
        assert!(settings.max_workers > 0);
        assert!(settings.grace_period > Duration::ZERO);
        assert!(!settings.shutdown_disabled);
    }
}
