use crate::clock::{window_start, Clock, SystemClock, Timestamp};
use crate::rules::{normalize_event_type, RateLimitRule, RuleError, RuleProvider};
use crate::store::{EventKey, EventStore, StoreError};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    /// Rate limit exceeded under `rule`.
    Denied { rule: RateLimitRule },
}

impl Decision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allowed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum InputError {
    #[error("identity is empty")]
    EmptyIdentity,
    #[error("event type is empty")]
    EmptyEventType,
}

#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("invalid input: {0}")]
    InvalidInput(InputError),
    #[error("rule lookup failed: {0}")]
    RuleLookup(#[source] RuleError),
    #[error("event store failed: {0}")]
    Backend(#[source] StoreError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleUsage {
    #[serde(flatten)]
    pub rule: RateLimitRule,
    pub used: u64,
    pub remaining: u64,
}

pub struct AdmissionController {
    rules: Arc<dyn RuleProvider>,
    store: Arc<dyn EventStore>,
    clock: Arc<dyn Clock>,
}

impl AdmissionController {
    pub fn new(rules: Arc<dyn RuleProvider>, store: Arc<dyn EventStore>) -> Self {
        Self::with_clock(rules, store, Arc::new(SystemClock))
    }

    pub fn with_clock(
        rules: Arc<dyn RuleProvider>,
        store: Arc<dyn EventStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { rules, store, clock }
    }

    pub fn store_name(&self) -> &'static str {
        self.store.name()
    }

    pub fn rules(&self) -> Vec<RateLimitRule> {
        self.rules.all_rules()
    }

    pub async fn rule_for(&self, event_type: &str) -> Result<Option<RateLimitRule>, AdmissionError> {
        let event_type = normalize_event_type(event_type);
        if event_type.is_empty() {
            return Err(AdmissionError::InvalidInput(InputError::EmptyEventType));
        }
        self.find_rule(&event_type).await
    }

    /// Admits or denies one event for `identity`. Unlimited event types are
    /// admitted without recording anything.
    pub async fn decide(&self, identity: &str, event_type: &str) -> Result<Decision, AdmissionError> {
        let key = validated_key(identity, event_type)?;
        let Some(rule) = self.find_rule(&key.event_type).await? else {
            debug!(identity, event_type = %key.event_type, "no rule, admitted");
            return Ok(Decision::Allowed);
        };
        let now = self.clock.now();
        let admitted = self
            .store
            .record_if_under_limit(&key, rule.window, rule.max_count, now)
            .await
            .map_err(|err| self.backend_error(&key, err))?;
        if admitted {
            debug!(identity, event_type = %key.event_type, "admitted");
            Ok(Decision::Allowed)
        } else {
            debug!(identity, event_type = %key.event_type, max = rule.max_count, "rate limit exceeded");
            Ok(Decision::Denied { rule })
        }
    }

    pub async fn record(&self, identity: &str, event_type: &str) -> Result<(), AdmissionError> {
        let key = validated_key(identity, event_type)?;
        let now = self.clock.now();
        self.store
            .record(&key, now)
            .await
            .map_err(|err| self.backend_error(&key, err))
    }

    /// Events counted against each configured rule for `identity` right now.
    pub async fn usage(&self, identity: &str) -> Result<Vec<RuleUsage>, AdmissionError> {
        if identity.trim().is_empty() {
            return Err(AdmissionError::InvalidInput(InputError::EmptyIdentity));
        }
        let now = self.clock.now();
        let mut out = Vec::new();
        for rule in self.rules.all_rules() {
            let key = EventKey::new(identity, &rule.event_type);
            let used = self
                .store
                .count_since(&key, active_window_start(now, &rule))
                .await
                .map_err(|err| self.backend_error(&key, err))?;
            let remaining = u64::from(rule.max_count).saturating_sub(used);
            out.push(RuleUsage { rule, used, remaining });
        }
        Ok(out)
    }

    pub async fn compact(&self) -> Result<usize, AdmissionError> {
        let now = self.clock.now();
        self.store.compact(now).await.map_err(|err| {
            error!(store = self.store.name(), %err, "compaction failed");
            AdmissionError::Backend(err)
        })
    }

    async fn find_rule(&self, event_type: &str) -> Result<Option<RateLimitRule>, AdmissionError> {
        self.rules.find_rule(event_type).await.map_err(|err| {
            error!(event_type, %err, "rule lookup failed");
            AdmissionError::RuleLookup(err)
        })
    }

    fn backend_error(&self, key: &EventKey, err: StoreError) -> AdmissionError {
        error!(
            store = self.store.name(),
            identity = %key.identity,
            event_type = %key.event_type,
            %err,
            "event store failed"
        );
        AdmissionError::Backend(err)
    }
}

// Events strictly older than `window` no longer count, matching the store's
// `now - at >= window` expiry.
fn active_window_start(now: Timestamp, rule: &RateLimitRule) -> Timestamp {
    window_start(now, rule.window).saturating_add(1)
}

fn validated_key(identity: &str, event_type: &str) -> Result<EventKey, AdmissionError> {
    if identity.trim().is_empty() {
        return Err(AdmissionError::InvalidInput(InputError::EmptyIdentity));
    }
    let key = EventKey::new(identity, event_type);
    if key.event_type.is_empty() {
        return Err(AdmissionError::InvalidInput(InputError::EmptyEventType));
    }
    Ok(key)
}
