//! Configuration loading and defaults for systemd-lock-handler.

use std::collections::HashSet;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::domain::{Direction, Scope, SignalFilter};
use crate::strategy::StrategyKind;

const LOGIND_SERVICE: &str = "org.freedesktop.login1";
const LOGIND_PATH: &str = "/org/freedesktop/login1";
const MANAGER_INTERFACE: &str = "org.freedesktop.login1.Manager";
const SESSION_INTERFACE: &str = "org.freedesktop.login1.Session";

/// A unit driven by bus signals.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Target {
    /// Unit name (e.g. "sleep.target").
    pub unit: String,

    /// Which built-in strategy verifies signals for this target.
    pub strategy: StrategyKind,

    /// Also wait for the reverse signal and run the reverse job.
    #[serde(default)]
    pub toggle: bool,

    /// Direction of the first job in each cycle.
    #[serde(default)]
    pub initial: Direction,

    /// Manager that owns the unit.
    #[serde(default)]
    pub scope: Scope,

    /// Bus match rule for the signals.
    pub filter: SignalFilter,
}

/// Arguments passed to logind's `Inhibit` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InhibitConfig {
    pub who: String,
    pub why: String,

    /// "delay" or "block".
    pub mode: String,
}

impl Default for InhibitConfig {
    fn default() -> Self {
        Self {
            who: "systemd-lock-handler".to_string(),
            why: "Start pre-sleep target".to_string(),
            mode: "delay".to_string(),
        }
    }
}

/// Main configuration for systemd-lock-handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bounded signal buffer per target (default: 10).
    pub queue_capacity: usize,

    /// Sleep inhibitor settings.
    pub inhibit: InhibitConfig,

    /// Targets, in startup order.
    pub targets: Vec<Target>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            queue_capacity: 10,
            inhibit: InhibitConfig::default(),
            targets: default_targets(),
        }
    }
}

/// The sleep, lock and unlock targets.
fn default_targets() -> Vec<Target> {
    let session_filter = |member: &str| SignalFilter {
        sender: Some(LOGIND_SERVICE.to_string()),
        path: None,
        interface: Some(SESSION_INTERFACE.to_string()),
        member: Some(member.to_string()),
    };

    vec![
        Target {
            unit: "sleep.target".to_string(),
            strategy: StrategyKind::Sleep,
            toggle: true,
            initial: Direction::Start,
            scope: Scope::User,
            filter: SignalFilter {
                sender: None,
                path: Some(LOGIND_PATH.to_string()),
                interface: Some(MANAGER_INTERFACE.to_string()),
                member: Some("PrepareForSleep".to_string()),
            },
        },
        Target {
            unit: "lock.target".to_string(),
            strategy: StrategyKind::Session,
            toggle: false,
            initial: Direction::Start,
            scope: Scope::User,
            filter: session_filter("Lock"),
        },
        Target {
            unit: "unlock.target".to_string(),
            strategy: StrategyKind::Session,
            toggle: false,
            initial: Direction::Start,
            scope: Scope::User,
            filter: session_filter("Unlock"),
        },
    ]
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        config
            .validate()
            .with_context(|| format!("Invalid config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from the default path, or return defaults if not found.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            return Self::load(p);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let default_path = config_dir.join("systemd-lock-handler").join("config.toml");
            if default_path.exists() {
                return Self::load(&default_path);
            }
        }

        Ok(Self::default())
    }

    /// Check the invariants serde cannot express.
    pub fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }

        if !matches!(self.inhibit.mode.as_str(), "delay" | "block") {
            anyhow::bail!(
                "inhibit.mode must be \"delay\" or \"block\", got {:?}",
                self.inhibit.mode
            );
        }

        if self.targets.is_empty() {
            anyhow::bail!("no targets configured");
        }

        let mut seen = HashSet::new();
        for target in &self.targets {
            if target.unit.trim().is_empty() {
                anyhow::bail!("target with empty unit name");
            }
            if !seen.insert(target.unit.as_str()) {
                anyhow::bail!("duplicate target: {}", target.unit);
            }
            if target.filter.is_empty() {
                anyhow::bail!("target {} has an empty filter", target.unit);
            }
        }

        Ok(())
    }

    /// Render the effective configuration as TOML.
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string(self).context("Failed to serialize configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.queue_capacity, 10);
        assert_eq!(config.inhibit.mode, "delay");
        assert_eq!(config.targets.len(), 3);
        config.validate().unwrap();

        let sleep = &config.targets[0];
        assert_eq!(sleep.unit, "sleep.target");
        assert_eq!(sleep.strategy, StrategyKind::Sleep);
        assert!(sleep.toggle);
        assert_eq!(sleep.filter.member.as_deref(), Some("PrepareForSleep"));

        let lock = &config.targets[1];
        assert_eq!(lock.unit, "lock.target");
        assert_eq!(lock.strategy, StrategyKind::Session);
        assert!(!lock.toggle);
        assert_eq!(lock.filter.sender.as_deref(), Some(LOGIND_SERVICE));
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            queue_capacity = 4

            [inhibit]
            mode = "block"

            [[targets]]
            unit = "suspend-hook.service"
            strategy = "sleep"
            toggle = true
            initial = "stop"
            scope = "system"

            [targets.filter]
            path = "/org/freedesktop/login1"
            member = "PrepareForSleep"
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.queue_capacity, 4);
        assert_eq!(config.inhibit.mode, "block");
        assert_eq!(config.inhibit.who, "systemd-lock-handler");
        assert_eq!(config.targets.len(), 1);

        let target = &config.targets[0];
        assert_eq!(target.initial, Direction::Stop);
        assert_eq!(target.scope, Scope::System);
        assert!(target.filter.interface.is_none());
        config.validate().unwrap();
    }

    #[test]
    fn test_target_defaults() {
        let toml_str = r#"
            [[targets]]
            unit = "lock.target"
            strategy = "session"
            filter = { member = "Lock" }
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        let target = &config.targets[0];
        assert!(!target.toggle);
        assert_eq!(target.initial, Direction::Start);
        assert_eq!(target.scope, Scope::User);
    }

    #[test]
    fn test_unknown_strategy_rejected() {
        let toml_str = r#"
            [[targets]]
            unit = "x.target"
            strategy = "plugin.so"
            filter = { member = "Lock" }
        "#;

        assert!(toml::from_str::<Config>(toml_str).is_err());
    }

    #[test]
    fn test_validate() {
        let mut config = Config::default();
        config.queue_capacity = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.inhibit.mode = "sometimes".to_string();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.targets[1].unit = "sleep.target".to_string();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate target"));

        let mut config = Config::default();
        config.targets[2].filter = SignalFilter::default();
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.targets.clear();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
            [[targets]]
            unit = "unlock.target"
            strategy = "session"
            filter = {{ interface = "org.freedesktop.login1.Session", member = "Unlock" }}
            "#
        )
        .unwrap();

        let config = Config::load_or_default(Some(file.path())).unwrap();
        assert_eq!(config.targets.len(), 1);
        assert_eq!(config.targets[0].unit, "unlock.target");
    }

    #[test]
    fn test_toml_dump_parses_back() {
        let config = Config::default();
        let dumped = config.to_toml().unwrap();
        let parsed: Config = toml::from_str(&dumped).unwrap();
        assert_eq!(parsed.targets, config.targets);
    }
}
