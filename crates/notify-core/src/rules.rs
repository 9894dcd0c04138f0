use crate::duration::{duration_ms, serde_duration};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitRule {
    #[serde(rename = "notificationType")]
    pub event_type: String,
    #[serde(rename = "maxLimit")]
    pub max_count: u32,
    #[serde(rename = "timeInterval", with = "serde_duration")]
    pub window: Duration,
}

impl RateLimitRule {
    pub fn new(event_type: impl Into<String>, max_count: u32, window: Duration) -> Self {
        Self {
            event_type: event_type.into(),
            max_count,
            window,
        }
    }
}

#[derive(Debug, Error)]
pub enum RuleError {
    #[error("read rules file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parse rules file {}: {message}", path.display())]
    Parse { path: PathBuf, message: String },
    #[error("rule with empty event type")]
    EmptyEventType,
    #[error("rule {0:?} has maxLimit 0")]
    ZeroLimit(String),
    #[error("rule {0:?} has a time interval under one millisecond")]
    ZeroWindow(String),
    #[error("duplicate rule for event type {0:?}")]
    Duplicate(String),
    #[error("rule source unavailable: {0}")]
    Unavailable(String),
}

pub fn normalize_event_type(event_type: &str) -> String {
    event_type.trim().to_lowercase()
}

/// Where the controller gets its rules from. Lookups against a remote source
/// may fail; the static catalog never does.
#[async_trait]
pub trait RuleProvider: Send + Sync {
    async fn find_rule(&self, event_type: &str) -> Result<Option<RateLimitRule>, RuleError>;
    fn all_rules(&self) -> Vec<RateLimitRule>;
}

#[derive(Debug, Deserialize)]
struct TomlRuleFile {
    #[serde(default, rename = "rule")]
    rules: Vec<RateLimitRule>,
}

/// Immutable set of rules keyed by normalized event type.
#[derive(Debug, Clone, Default)]
pub struct RuleCatalog {
    rules: BTreeMap<String, RateLimitRule>,
}

impl RuleCatalog {
    pub fn from_rules(rules: Vec<RateLimitRule>) -> Result<Self, RuleError> {
        let mut map = BTreeMap::new();
        for mut rule in rules {
            let key = normalize_event_type(&rule.event_type);
            if key.is_empty() {
                return Err(RuleError::EmptyEventType);
            }
            if rule.max_count == 0 {
                return Err(RuleError::ZeroLimit(key));
            }
            if duration_ms(rule.window) == 0 {
                return Err(RuleError::ZeroWindow(key));
            }
            if map.contains_key(&key) {
                return Err(RuleError::Duplicate(key));
            }
            rule.event_type = key.clone();
            map.insert(key, rule);
        }
        Ok(Self { rules: map })
    }

    pub fn load(path: &Path) -> Result<Self, RuleError> {
        let raw = std::fs::read_to_string(path).map_err(|source| RuleError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let parse_err = |message: String| RuleError::Parse {
            path: path.to_path_buf(),
            message,
        };
        let rules = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => {
                toml::from_str::<TomlRuleFile>(&raw)
                    .map_err(|err| parse_err(err.to_string()))?
                    .rules
            }
            _ => serde_json::from_str::<Vec<RateLimitRule>>(&raw)
                .map_err(|err| parse_err(err.to_string()))?,
        };
        let catalog = Self::from_rules(rules)?;
        info!(path = %path.display(), rules = catalog.len(), "rules loaded");
        Ok(catalog)
    }

    pub fn lookup(&self, event_type: &str) -> Option<&RateLimitRule> {
        self.rules.get(&normalize_event_type(event_type))
    }

    pub fn rule_for(&self, event_type: &str) -> Option<RateLimitRule> {
        self.lookup(event_type).cloned()
    }

    pub fn rules(&self) -> impl Iterator<Item = &RateLimitRule> {
        self.rules.values()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn max_window(&self) -> Option<Duration> {
        self.rules.values().map(|rule| rule.window).max()
    }
}

#[async_trait]
impl RuleProvider for RuleCatalog {
    async fn find_rule(&self, event_type: &str) -> Result<Option<RateLimitRule>, RuleError> {
        Ok(self.rule_for(event_type))
    }

    fn all_rules(&self) -> Vec<RateLimitRule> {
        self.rules.values().cloned().collect()
    }
}
