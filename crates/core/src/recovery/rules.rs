use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tracing::warn;

use crate::domain::recovery::{ErrorClassification, RecoveryRule, ReportedError};
use crate::recovery::RecoveryError;

/// Registered rules in insertion order, with their running stats.
#[derive(Debug, Default)]
pub(crate) struct RuleBook {
    rules: Vec<RecoveryRule>,
}

impl RuleBook {
    pub(crate) fn add(&mut self, rule: RecoveryRule) -> Result<(), RecoveryError> {
        if rule.id.trim().is_empty() {
            return Err(RecoveryError::InvalidRule("rule id must not be empty".to_owned()));
        }
        if rule.actions.is_empty() {
            return Err(RecoveryError::InvalidRule(format!("rule `{}` has no actions", rule.id)));
        }
        for condition in &rule.matcher.conditions {
            condition.validate().map_err(|error| {
                RecoveryError::InvalidRule(format!("rule `{}`: {error}", rule.id))
            })?;
        }
        if self.rules.iter().any(|existing| existing.id == rule.id) {
            return Err(RecoveryError::DuplicateRule(rule.id));
        }
        self.rules.push(rule);
        Ok(())
    }

    pub(crate) fn remove(&mut self, id: &str) -> Option<RecoveryRule> {
        let index = self.rules.iter().position(|rule| rule.id == id)?;
        Some(self.rules.remove(index))
    }

    pub(crate) fn list(&self) -> Vec<RecoveryRule> {
        self.rules.clone()
    }

    /// Applicable rules, highest priority first; equal priorities keep
    /// registration order.
    pub(crate) fn applicable(
        &self,
        error: &ReportedError,
        classification: &ErrorClassification,
        view: &Value,
        now: DateTime<Utc>,
    ) -> Vec<RecoveryRule> {
        let mut matched: Vec<RecoveryRule> = self
            .rules
            .iter()
            .filter(|rule| is_ready(rule, now) && rule_matches(rule, error, classification, view))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.config.priority.cmp(&a.config.priority));
        matched
    }

    /// Marks a rule as fired so its cooldown and execution cap apply from
    /// `now`, before its actions finish.
    pub(crate) fn mark_fired(&mut self, id: &str, now: DateTime<Utc>) {
        if let Some(rule) = self.rules.iter_mut().find(|rule| rule.id == id) {
            rule.stats.executions += 1;
            rule.stats.last_fired_at = Some(now);
        }
    }

    pub(crate) fn record_outcome(&mut self, id: &str, success: bool, duration_ms: u64) {
        if let Some(rule) = self.rules.iter_mut().find(|rule| rule.id == id) {
            if success {
                rule.stats.successes += 1;
            } else {
                rule.stats.failures += 1;
            }
            rule.stats.total_duration_ms = rule.stats.total_duration_ms.saturating_add(duration_ms);
        }
    }
}

fn is_ready(rule: &RecoveryRule, now: DateTime<Utc>) -> bool {
    if !rule.config.enabled {
        return false;
    }
    if rule.config.max_executions.is_some_and(|cap| rule.stats.executions >= cap) {
        return false;
    }
    match rule.stats.last_fired_at {
        Some(fired) => now >= fired + Duration::milliseconds(rule.config.cooldown_ms as i64),
        None => true,
    }
}

fn rule_matches(
    rule: &RecoveryRule,
    error: &ReportedError,
    classification: &ErrorClassification,
    view: &Value,
) -> bool {
    let matcher = &rule.matcher;

    if !matcher.error_types.is_empty()
        && !matcher.error_types.iter().any(|kind| {
            kind.eq_ignore_ascii_case(classification.category.as_str())
                || kind.eq_ignore_ascii_case(&error.name)
        })
    {
        return false;
    }

    if !matcher.message_patterns.is_empty() {
        let message = error.message.to_lowercase();
        if !matcher.message_patterns.iter().any(|pattern| message.contains(&pattern.to_lowercase()))
        {
            return false;
        }
    }

    if !matcher.error_codes.is_empty() {
        let Some(code) = error.code.as_deref() else {
            return false;
        };
        if !matcher.error_codes.iter().any(|candidate| candidate.eq_ignore_ascii_case(code)) {
            return false;
        }
    }

    if !matcher.agent_types.is_empty() {
        let Some(agent_type) = error.agent_type.as_deref() else {
            return false;
        };
        if !matcher.agent_types.iter().any(|candidate| candidate == agent_type) {
            return false;
        }
    }

    matcher.conditions.iter().all(|condition| match condition.evaluate(view) {
        Ok(matched) => matched,
        Err(error) => {
            warn!(
                event_name = "recovery.rule.condition_failed",
                rule_id = %rule.id,
                error = %error,
                "rule condition could not be evaluated; treating as no match"
            );
            false
        }
    })
}
