//! Per-stage runtime health and circuit breakers.
//!
//! `circuit_open=true` is the abnormal state. A breaker opens when the
//! consecutive-failure counter reaches the stage's threshold and closes
//! lazily: the first read after `circuit_open_until` flips it closed and
//! resets the counter atomically (under the registry lock).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;

/// Counters for one stage.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StageHealth {
    pub executions: u64,
    pub failures: u64,
    /// Consecutive failures; resets on success or breaker close.
    pub failure_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<DateTime<Utc>>,
    pub circuit_open: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit_open_until: Option<DateTime<Utc>>,
    pub avg_duration_seconds: f64,
}

impl StageHealth {
    /// `failures / executions`, clamped to 1.0. Anything that would exceed
    /// 1.0 is a counter bug, reported as such rather than as a percentage.
    pub fn failure_rate(&self) -> f64 {
        if self.executions == 0 {
            0.0
        } else {
            (self.failures as f64 / self.executions as f64).min(1.0)
        }
    }

    pub fn has_counter_bug(&self) -> bool {
        self.failures > self.executions
    }
}

/// Aggregate supervisor health.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Failing,
    Critical,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Failing => "failing",
            HealthStatus::Critical => "critical",
        }
    }
}

/// Registry keyed by stage name. Keys are plain strings so nothing here holds
/// stage object references.
#[derive(Default)]
pub struct HealthRegistry {
    stages: Mutex<BTreeMap<String, StageHealth>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the stage may execute. Closes an expired breaker as a side
    /// effect of the read.
    pub fn is_circuit_open(&self, stage: &str) -> bool {
        let mut stages = self.stages.lock().expect("health registry lock poisoned");
        let Some(health) = stages.get_mut(stage) else {
            return false;
        };
        if health.circuit_open
            && let Some(until) = health.circuit_open_until
            && Utc::now() >= until
        {
            health.circuit_open = false;
            health.circuit_open_until = None;
            health.failure_count = 0;
            tracing::info!(stage, "circuit closed after cooldown");
        }
        health.circuit_open
    }

    pub fn record_success(&self, stage: &str, duration_seconds: f64) {
        let mut stages = self.stages.lock().expect("health registry lock poisoned");
        let health = stages.entry(stage.to_string()).or_default();
        health.executions += 1;
        health.failure_count = 0;
        update_avg(health, duration_seconds);
    }

    /// Record a failure; opens the circuit when the consecutive counter
    /// reaches `threshold`. Failures exempt from the breaker (budget refusals)
    /// pass `trips_breaker=false`.
    pub fn record_failure(
        &self,
        stage: &str,
        duration_seconds: f64,
        trips_breaker: bool,
        threshold: u32,
        breaker_timeout_seconds: u64,
    ) {
        let mut stages = self.stages.lock().expect("health registry lock poisoned");
        let health = stages.entry(stage.to_string()).or_default();
        health.executions += 1;
        health.failures += 1;
        health.last_failure = Some(Utc::now());
        update_avg(health, duration_seconds);

        if !trips_breaker {
            return;
        }
        health.failure_count += 1;
        if health.failure_count >= threshold && !health.circuit_open {
            health.circuit_open = true;
            health.circuit_open_until =
                Some(Utc::now() + Duration::seconds(breaker_timeout_seconds as i64));
            tracing::warn!(
                stage,
                failures = health.failure_count,
                "circuit opened for {breaker_timeout_seconds}s"
            );
        }
    }

    pub fn get(&self, stage: &str) -> Option<StageHealth> {
        self.stages
            .lock()
            .expect("health registry lock poisoned")
            .get(stage)
            .cloned()
    }

    pub fn snapshot(&self) -> BTreeMap<String, StageHealth> {
        self.stages
            .lock()
            .expect("health registry lock poisoned")
            .clone()
    }

    /// Aggregate status ladder: any open circuit on more than half the
    /// tracked stages is critical; any open circuit is failing; any recent
    /// failure is degraded; otherwise healthy.
    pub fn overall_status(&self) -> HealthStatus {
        let stages = self.stages.lock().expect("health registry lock poisoned");
        if stages.is_empty() {
            return HealthStatus::Healthy;
        }
        let open = stages.values().filter(|h| h.circuit_open).count();
        if open * 2 > stages.len() {
            return HealthStatus::Critical;
        }
        if open > 0 {
            return HealthStatus::Failing;
        }
        if stages.values().any(|h| h.failure_count > 0) {
            return HealthStatus::Degraded;
        }
        HealthStatus::Healthy
    }

    #[cfg(test)]
    pub fn force_circuit_deadline(&self, stage: &str, until: DateTime<Utc>) {
        let mut stages = self.stages.lock().unwrap();
        if let Some(health) = stages.get_mut(stage) {
            health.circuit_open_until = Some(until);
        }
    }
}

fn update_avg(health: &mut StageHealth, duration_seconds: f64) {
    let n = health.executions as f64;
    health.avg_duration_seconds = (health.avg_duration_seconds * (n - 1.0) + duration_seconds) / n;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_breaker_opens_at_threshold() {
        let registry = HealthRegistry::new();
        for _ in 0..3 {
            registry.record_failure("review", 1.0, true, 4, 60);
            assert!(!registry.is_circuit_open("review"));
        }
        registry.record_failure("review", 1.0, true, 4, 60);
        assert!(registry.is_circuit_open("review"));
        let health = registry.get("review").unwrap();
        assert!(health.circuit_open_until.unwrap() > Utc::now());
    }

    #[test]
    fn test_success_resets_consecutive_counter() {
        let registry = HealthRegistry::new();
        for _ in 0..3 {
            registry.record_failure("review", 1.0, true, 4, 60);
        }
        // One short of the threshold; a success resets to zero.
        registry.record_success("review", 1.0);
        assert_eq!(registry.get("review").unwrap().failure_count, 0);

        for _ in 0..3 {
            registry.record_failure("review", 1.0, true, 4, 60);
        }
        assert!(!registry.is_circuit_open("review"));
    }

    #[test]
    fn test_expired_breaker_closes_on_read_and_resets() {
        let registry = HealthRegistry::new();
        for _ in 0..4 {
            registry.record_failure("review", 1.0, true, 4, 60);
        }
        assert!(registry.is_circuit_open("review"));

        registry.force_circuit_deadline("review", Utc::now() - Duration::seconds(1));
        assert!(!registry.is_circuit_open("review"));
        let health = registry.get("review").unwrap();
        assert_eq!(health.failure_count, 0);
        assert!(health.circuit_open_until.is_none());
    }

    #[test]
    fn test_budget_failures_do_not_trip_breaker() {
        let registry = HealthRegistry::new();
        for _ in 0..10 {
            registry.record_failure("development", 1.0, false, 2, 60);
        }
        assert!(!registry.is_circuit_open("development"));
        // They still count as failures in the totals.
        assert_eq!(registry.get("development").unwrap().failures, 10);
    }

    #[test]
    fn test_failure_rate_is_clamped() {
        let health = StageHealth {
            executions: 2,
            failures: 4,
            ..Default::default()
        };
        assert!((health.failure_rate() - 1.0).abs() < 1e-9);
        assert!(health.has_counter_bug());

        let sane = StageHealth {
            executions: 4,
            failures: 1,
            ..Default::default()
        };
        assert!((sane.failure_rate() - 0.25).abs() < 1e-9);
        assert!(!sane.has_counter_bug());
    }

    #[test]
    fn test_overall_status_ladder() {
        let registry = HealthRegistry::new();
        assert_eq!(registry.overall_status(), HealthStatus::Healthy);

        registry.record_success("analysis", 1.0);
        assert_eq!(registry.overall_status(), HealthStatus::Healthy);

        registry.record_failure("review", 1.0, true, 10, 60);
        assert_eq!(registry.overall_status(), HealthStatus::Degraded);

        for _ in 0..10 {
            registry.record_failure("review", 1.0, true, 10, 60);
        }
        assert_eq!(registry.overall_status(), HealthStatus::Failing);

        for _ in 0..10 {
            registry.record_failure("analysis", 1.0, true, 10, 60);
        }
        assert_eq!(registry.overall_status(), HealthStatus::Critical);
    }

    #[test]
    fn test_avg_duration_tracks_mean() {
        let registry = HealthRegistry::new();
        registry.record_success("testing", 10.0);
        registry.record_success("testing", 20.0);
        let health = registry.get("testing").unwrap();
        assert!((health.avg_duration_seconds - 15.0).abs() < 1e-9);
    }
}
