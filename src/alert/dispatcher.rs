//! Rule evaluation with per-(rule, entity) cooldowns.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::alert::history::AlertHistory;
use crate::alert::sink::{build_sink, AlertSink, ChannelConfig};
use crate::alert::{AlertError, AlertEvent, AlertRule, AlertSubject, RulePredicate};
use crate::detect::Severity;

/// A rule with its entity pattern compiled, or the reason it cannot run.
struct CompiledRule {
    rule: AlertRule,
    entity: Result<Option<Regex>, String>,
}

impl CompiledRule {
    fn new(rule: AlertRule) -> Self {
        let entity = match &rule.entity_pattern {
            None => Ok(None),
            Some(p) => Regex::new(p)
                .map(Some)
                .map_err(|e| format!("invalid entity pattern '{p}': {e}")),
        };
        Self { rule, entity }
    }

    /// `Ok(Some(..))` on a match, `Err` when the rule cannot be evaluated.
    fn matches(&self, subject: &AlertSubject<'_>) -> Result<Option<(Option<f64>, Option<f64>)>, AlertError> {
        let malformed = |reason: String| AlertError::Rule {
            rule: self.rule.id.clone(),
            reason,
        };

        let entity_re = self.entity.as_ref().map_err(|r| malformed(r.clone()))?;
        if let Some(re) = entity_re {
            if !re.is_match(subject.entity()) {
                return Ok(None);
            }
        }

        let anomaly = match subject {
            AlertSubject::Anomaly(r) => Some(*r),
            AlertSubject::Aggregate(_) => None,
        };

        match &self.rule.predicate {
            RulePredicate::Anomalous => Ok(anomaly
                .filter(|r| r.is_anomalous())
                .map(|r| (r.score, Some(r.observed)))),
            RulePredicate::ScoreAbove { threshold } => {
                if threshold.is_nan() {
                    return Err(malformed("threshold is NaN".into()));
                }
                Ok(anomaly
                    .and_then(|r| r.score.map(|s| (s, r)))
                    .filter(|(s, _)| s > threshold)
                    .map(|(s, r)| (Some(s), Some(r.observed))))
            }
            RulePredicate::MetricAbove { metric, threshold }
            | RulePredicate::MetricBelow { metric, threshold } => {
                if threshold.is_nan() {
                    return Err(malformed("threshold is NaN".into()));
                }
                let value = subject
                    .metric(metric)
                    .ok_or_else(|| malformed(format!("metric '{metric}' missing on subject")))?;
                let hit = match self.rule.predicate {
                    RulePredicate::MetricAbove { .. } => value > *threshold,
                    _ => value < *threshold,
                };
                Ok(hit.then(|| (anomaly.and_then(|r| r.score), Some(value))))
            }
        }
    }
}

/// Matches subjects against rules and fans fired alerts out to sinks.
pub struct AlertDispatcher {
    rules: Vec<CompiledRule>,
    last_fired: Mutex<HashMap<(String, String), DateTime<Utc>>>,
    sinks: HashMap<String, Arc<dyn AlertSink>>,
    history: Option<AlertHistory>,
}

impl AlertDispatcher {
    pub fn new(rules: Vec<AlertRule>) -> Self {
        Self {
            rules: rules.into_iter().map(CompiledRule::new).collect(),
            last_fired: Mutex::new(HashMap::new()),
            sinks: HashMap::new(),
            history: None,
        }
    }

    /// Rules plus a sink per configured channel.
    pub fn from_config(
        rules: Vec<AlertRule>,
        channels: &[ChannelConfig],
    ) -> Result<Self, AlertError> {
        let mut dispatcher = Self::new(rules);
        for channel in channels {
            dispatcher = dispatcher.with_sink(channel.name.clone(), build_sink(channel)?);
        }
        Ok(dispatcher)
    }

    pub fn with_sink(mut self, channel: impl Into<String>, sink: Arc<dyn AlertSink>) -> Self {
        self.sinks.insert(channel.into(), sink);
        self
    }

    pub fn with_history(mut self, history: AlertHistory) -> Self {
        self.history = Some(history);
        self
    }

    pub fn rules(&self) -> impl Iterator<Item = &AlertRule> {
        self.rules.iter().map(|c| &c.rule)
    }

    pub fn history(&self) -> Option<&AlertHistory> {
        self.history.as_ref()
    }

    /// Forget (rule, entity) pairs whose cooldown has expired by `now`.
    ///
    /// Entries for rules no longer configured are dropped too.
    pub fn prune_cooldowns(&self, now: DateTime<Utc>) -> usize {
        let cooldowns: HashMap<&str, chrono::Duration> = self
            .rules
            .iter()
            .map(|c| {
                let cooldown = chrono::Duration::from_std(c.rule.cooldown)
                    .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
                (c.rule.id.as_str(), cooldown)
            })
            .collect();
        let mut last = self.last_fired.lock().unwrap_or_else(|p| p.into_inner());
        let before = last.len();
        last.retain(|(rule, _), fired| {
            cooldowns
                .get(rule.as_str())
                .is_some_and(|cooldown| now.signed_duration_since(*fired) < *cooldown)
        });
        let pruned = before - last.len();
        if pruned > 0 {
            debug!(pruned, "expired alert cooldowns dropped");
        }
        pruned
    }

    /// Zero or one alert per matching rule; cooldowns are consumed here.
    pub fn evaluate(&self, subject: &AlertSubject<'_>, now: DateTime<Utc>) -> Vec<AlertEvent> {
        let entity = subject.entity();
        let mut fired = Vec::new();

        for compiled in &self.rules {
            let rule = &compiled.rule;
            let (score, observed) = match compiled.matches(subject) {
                Ok(Some(hit)) => hit,
                Ok(None) => continue,
                Err(e) => {
                    warn!(rule = %rule.id, entity, error = %e, "skipping malformed alert rule");
                    continue;
                }
            };

            {
                let mut last = self.last_fired.lock().unwrap_or_else(|p| p.into_inner());
                let key = (rule.id.clone(), entity.to_string());
                if let Some(prev) = last.get(&key) {
                    let elapsed = now.signed_duration_since(*prev);
                    let cooldown = chrono::Duration::from_std(rule.cooldown)
                        .unwrap_or_else(|_| chrono::Duration::days(365 * 100));
                    if elapsed < cooldown {
                        debug!(rule = %rule.id, entity, "alert suppressed by cooldown");
                        continue;
                    }
                }
                last.insert(key, now);
            }

            let severity = rule.severity.unwrap_or(match subject {
                AlertSubject::Anomaly(r) if r.severity > Severity::Info => r.severity,
                _ => Severity::Warning,
            });
            fired.push(AlertEvent {
                id: Uuid::new_v4(),
                rule_id: rule.id.clone(),
                entity: entity.to_string(),
                timestamp: now,
                window_start: subject.window_start(),
                message: describe(rule, subject, score, observed),
                severity,
                channel: rule.channel.clone(),
                score,
                observed,
            });
        }
        fired
    }

    /// Deliver each event to its channel's sink and record it.
    ///
    /// Failures are logged; returns how many deliveries succeeded.
    pub async fn dispatch(&self, events: &[AlertEvent]) -> usize {
        let mut delivered = 0;
        for event in events {
            if let Some(history) = &self.history {
                if let Err(e) = history.record(event) {
                    warn!(alert = %event.id, error = %e, "failed to record alert history");
                }
            }

            let result = match self.sinks.get(&event.channel) {
                Some(sink) => sink.deliver(event).await,
                None => Err(AlertError::UnknownChannel(event.channel.clone())),
            };
            match result {
                Ok(()) => {
                    delivered += 1;
                    info!(
                        rule = %event.rule_id,
                        entity = %event.entity,
                        channel = %event.channel,
                        severity = %event.severity,
                        "alert dispatched"
                    );
                }
                Err(e) => warn!(alert = %event.id, error = %e, "alert delivery failed"),
            }
        }
        delivered
    }
}

fn describe(
    rule: &AlertRule,
    subject: &AlertSubject<'_>,
    score: Option<f64>,
    observed: Option<f64>,
) -> String {
    let entity = subject.entity();
    match subject {
        AlertSubject::Anomaly(r) => format!(
            "{}: {} {} = {} (baseline mean {:.2}, score {:.2})",
            rule.name,
            entity,
            r.series.metric,
            r.observed,
            r.baseline_mean.unwrap_or(0.0),
            score.unwrap_or(0.0),
        ),
        AlertSubject::Aggregate(b) => format!(
            "{}: {} = {} in window starting {}",
            rule.name,
            entity,
            observed.map_or_else(|| b.count.to_string(), |v| v.to_string()),
            b.window_start.to_rfc3339(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::sink::ChannelSink;
    use crate::detect::{AnomalyRecord, Decision, SeriesKey};
    use crate::window::Bucket;
    use chrono::TimeZone;
    use serde_json::{json, Map};
    use std::time::Duration;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()
    }

    fn anomaly(entity: &str, score: f64) -> AnomalyRecord {
        AnomalyRecord {
            series: SeriesKey::new("job", entity, "count"),
            window_start: t0(),
            window_end: t0() + chrono::Duration::minutes(5),
            observed: 6.0,
            baseline_mean: Some(1.33),
            baseline_stddev: Some(0.47),
            baseline_samples: 3,
            score: Some(score),
            decision: if score > 2.0 {
                Decision::Anomalous
            } else {
                Decision::Normal
            },
            severity: Severity::Critical,
        }
    }

    fn anomalous_rule(cooldown_secs: u64) -> AlertRule {
        AlertRule::new(
            "spike",
            RulePredicate::Anomalous,
            "ops",
            Duration::from_secs(cooldown_secs),
        )
    }

    #[test]
    fn test_cooldown_suppresses_within_window() {
        let d = AlertDispatcher::new(vec![anomalous_rule(600)]);
        let rec = anomaly("F2", 9.9);
        let subject = AlertSubject::Anomaly(&rec);

        assert_eq!(d.evaluate(&subject, t0()).len(), 1);
        assert!(d.evaluate(&subject, t0() + chrono::Duration::seconds(599)).is_empty());
        // Boundary: exactly one cooldown later fires again.
        assert_eq!(d.evaluate(&subject, t0() + chrono::Duration::seconds(600)).len(), 1);
    }

    #[test]
    fn test_cooldown_is_per_entity() {
        let d = AlertDispatcher::new(vec![anomalous_rule(600)]);
        let a = anomaly("F1", 5.0);
        let b = anomaly("F2", 5.0);
        assert_eq!(d.evaluate(&AlertSubject::Anomaly(&a), t0()).len(), 1);
        assert_eq!(d.evaluate(&AlertSubject::Anomaly(&b), t0()).len(), 1);
        assert!(d.evaluate(&AlertSubject::Anomaly(&a), t0()).is_empty());
    }

    #[test]
    fn test_expired_cooldowns_are_pruned() {
        let d = AlertDispatcher::new(vec![anomalous_rule(600)]);
        for (i, entity) in ["F1", "F2", "F3"].iter().enumerate() {
            let rec = anomaly(entity, 5.0);
            let at = t0() + chrono::Duration::seconds(300 * i as i64);
            assert_eq!(d.evaluate(&AlertSubject::Anomaly(&rec), at).len(), 1);
        }

        // F1 fired at 0s and F2 at 300s; both are past their cooldown at 900s.
        assert_eq!(d.prune_cooldowns(t0() + chrono::Duration::seconds(900)), 2);
        let f3 = anomaly("F3", 5.0);
        assert!(d
            .evaluate(&AlertSubject::Anomaly(&f3), t0() + chrono::Duration::seconds(900))
            .is_empty());
        let f1 = anomaly("F1", 5.0);
        assert_eq!(
            d.evaluate(&AlertSubject::Anomaly(&f1), t0() + chrono::Duration::seconds(900))
                .len(),
            1
        );
    }

    #[test]
    fn test_malformed_rules_are_skipped() {
        let bad_regex = anomalous_rule(0).with_entity_pattern("(F");
        let nan = AlertRule::new(
            "nan",
            RulePredicate::ScoreAbove {
                threshold: f64::NAN,
            },
            "ops",
            Duration::ZERO,
        );
        let missing = AlertRule::new(
            "latency",
            RulePredicate::MetricAbove {
                metric: "p95".into(),
                threshold: 1.0,
            },
            "ops",
            Duration::ZERO,
        );
        let good = AlertRule::new(
            "good",
            RulePredicate::ScoreAbove { threshold: 3.0 },
            "ops",
            Duration::ZERO,
        );
        let d = AlertDispatcher::new(vec![bad_regex, nan, missing, good]);
        let rec = anomaly("F2", 9.9);
        let fired = d.evaluate(&AlertSubject::Anomaly(&rec), t0());
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].rule_id, "good");
        assert_eq!(fired[0].severity, Severity::Critical);
    }

    #[test]
    fn test_aggregate_metric_rules() {
        let mut stats = Map::new();
        stats.insert("errors".into(), json!(12));
        let bucket = Bucket {
            window_start: t0(),
            window_end: t0() + chrono::Duration::minutes(5),
            group: Map::new(),
            group_key: "checkout".into(),
            count: 40,
            stats,
        };
        let above = AlertRule::new(
            "errors-high",
            RulePredicate::MetricAbove {
                metric: "errors".into(),
                threshold: 10.0,
            },
            "ops",
            Duration::from_secs(60),
        )
        .with_entity_pattern("^check")
        .with_severity(Severity::Error);
        let below = AlertRule::new(
            "traffic-low",
            RulePredicate::MetricBelow {
                metric: "count".into(),
                threshold: 10.0,
            },
            "ops",
            Duration::from_secs(60),
        );
        let d = AlertDispatcher::new(vec![above, below, anomalous_rule(0)]);
        let fired = d.evaluate(&AlertSubject::Aggregate(&bucket), t0());
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].severity, Severity::Error);
        assert_eq!(fired[0].observed, Some(12.0));
        assert_eq!(fired[0].entity, "checkout");
    }

    #[tokio::test]
    async fn test_dispatch_routes_to_channel() {
        let (sink, mut rx) = ChannelSink::new(8);
        let d = AlertDispatcher::new(vec![anomalous_rule(60)]).with_sink("ops", Arc::new(sink));
        let rec = anomaly("F2", 9.9);
        let events = d.evaluate(&AlertSubject::Anomaly(&rec), t0());
        assert_eq!(d.dispatch(&events).await, 1);
        let got = rx.recv().await.unwrap();
        assert_eq!(got.entity, "F2");

        // Unknown channel is logged, not raised.
        let mut orphan = events[0].clone();
        orphan.channel = "pager".into();
        assert_eq!(d.dispatch(&[orphan]).await, 0);
    }
}
