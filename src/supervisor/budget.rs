//! Cost tracker: daily/monthly budget windows with per-model rates.
//!
//! The invariant is enforced at mutation time: a charge that would push a
//! window past its limit fails *before* being applied, which is what lets the
//! gateway refuse a provider call before any tokens are consumed.

use chrono::{DateTime, Datelike, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;

/// Dollars per 1k tokens for one model.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ModelRate {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

impl Default for ModelRate {
    fn default() -> Self {
        // Conservative default applied to unknown models.
        Self {
            input_per_1k: 0.003,
            output_per_1k: 0.015,
        }
    }
}

/// Budget configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetConfig {
    pub daily_limit: f64,
    pub monthly_limit: f64,
    #[serde(default)]
    pub per_model_rate: BTreeMap<String, ModelRate>,
}

impl Default for BudgetConfig {
    fn default() -> Self {
        Self {
            daily_limit: 10.0,
            monthly_limit: 100.0,
            per_model_rate: BTreeMap::new(),
        }
    }
}

/// A charge was refused because it would exceed a window limit.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("{window} budget would be exceeded: projected ${projected:.4} against ${limit:.2} limit")]
pub struct BudgetExceeded {
    pub window: String,
    pub projected: f64,
    pub limit: f64,
}

#[derive(Debug, Clone)]
struct CostState {
    total_cost: f64,
    daily_cost: f64,
    monthly_cost: f64,
    daily_reset_at: DateTime<Utc>,
    monthly_reset_at: DateTime<Utc>,
    calls: u64,
}

/// Point-in-time budget view for reports.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetSnapshot {
    pub total_cost: f64,
    pub daily_cost: f64,
    pub monthly_cost: f64,
    pub daily_limit: f64,
    pub monthly_limit: f64,
    pub daily_reset_at: DateTime<Utc>,
    pub monthly_reset_at: DateTime<Utc>,
    pub calls: u64,
}

/// The tracker. Updated under a short critical section on every event.
pub struct CostTracker {
    config: BudgetConfig,
    state: Mutex<CostState>,
}

impl CostTracker {
    pub fn new(config: BudgetConfig) -> Self {
        let now = Utc::now();
        Self {
            config,
            state: Mutex::new(CostState {
                total_cost: 0.0,
                daily_cost: 0.0,
                monthly_cost: 0.0,
                daily_reset_at: next_midnight(now),
                monthly_reset_at: next_month_start(now),
                calls: 0,
            }),
        }
    }

    /// Pure rate lookup: dollars for a token pair on a model.
    pub fn cost_of(&self, tokens_input: u64, tokens_output: u64, model: &str) -> f64 {
        let rate = self
            .config
            .per_model_rate
            .get(model)
            .copied()
            .unwrap_or_default();
        (tokens_input as f64 / 1000.0) * rate.input_per_1k
            + (tokens_output as f64 / 1000.0) * rate.output_per_1k
    }

    /// Check that a projected charge fits both windows. Does not mutate.
    pub fn try_reserve(&self, projected: f64) -> Result<(), BudgetExceeded> {
        let mut state = self.state.lock().expect("cost tracker lock poisoned");
        roll_windows(&mut state);
        check(&state, &self.config, projected)
    }

    /// Apply a real charge. Fails before mutating if a window would overflow.
    pub fn record(&self, cost: f64) -> Result<(), BudgetExceeded> {
        let mut state = self.state.lock().expect("cost tracker lock poisoned");
        roll_windows(&mut state);
        check(&state, &self.config, cost)?;
        state.total_cost += cost;
        state.daily_cost += cost;
        state.monthly_cost += cost;
        state.calls += 1;
        Ok(())
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let mut state = self.state.lock().expect("cost tracker lock poisoned");
        roll_windows(&mut state);
        BudgetSnapshot {
            total_cost: state.total_cost,
            daily_cost: state.daily_cost,
            monthly_cost: state.monthly_cost,
            daily_limit: self.config.daily_limit,
            monthly_limit: self.config.monthly_limit,
            daily_reset_at: state.daily_reset_at,
            monthly_reset_at: state.monthly_reset_at,
            calls: state.calls,
        }
    }

    #[cfg(test)]
    fn force_windows(&self, daily_reset_at: DateTime<Utc>, monthly_reset_at: DateTime<Utc>) {
        let mut state = self.state.lock().unwrap();
        state.daily_reset_at = daily_reset_at;
        state.monthly_reset_at = monthly_reset_at;
    }
}

fn check(state: &CostState, config: &BudgetConfig, charge: f64) -> Result<(), BudgetExceeded> {
    if state.daily_cost + charge > config.daily_limit {
        return Err(BudgetExceeded {
            window: "daily".to_string(),
            projected: state.daily_cost + charge,
            limit: config.daily_limit,
        });
    }
    if state.monthly_cost + charge > config.monthly_limit {
        return Err(BudgetExceeded {
            window: "monthly".to_string(),
            projected: state.monthly_cost + charge,
            limit: config.monthly_limit,
        });
    }
    Ok(())
}

fn roll_windows(state: &mut CostState) {
    let now = Utc::now();
    if now >= state.daily_reset_at {
        state.daily_cost = 0.0;
        state.daily_reset_at = next_midnight(now);
    }
    if now >= state.monthly_reset_at {
        state.monthly_cost = 0.0;
        state.monthly_reset_at = next_month_start(now);
    }
}

fn next_midnight(now: DateTime<Utc>) -> DateTime<Utc> {
    let tomorrow = now.date_naive() + Duration::days(1);
    Utc.from_utc_datetime(&tomorrow.and_hms_opt(0, 0, 0).expect("valid midnight"))
}

fn next_month_start(now: DateTime<Utc>) -> DateTime<Utc> {
    let (year, month) = if now.month() == 12 {
        (now.year() + 1, 1)
    } else {
        (now.year(), now.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .expect("valid month start")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(daily: f64, monthly: f64) -> CostTracker {
        CostTracker::new(BudgetConfig {
            daily_limit: daily,
            monthly_limit: monthly,
            per_model_rate: BTreeMap::new(),
        })
    }

    #[test]
    fn test_cost_of_uses_model_rate() {
        let mut rates = BTreeMap::new();
        rates.insert(
            "fast-model".to_string(),
            ModelRate {
                input_per_1k: 0.001,
                output_per_1k: 0.002,
            },
        );
        let tracker = CostTracker::new(BudgetConfig {
            daily_limit: 1.0,
            monthly_limit: 10.0,
            per_model_rate: rates,
        });

        let cost = tracker.cost_of(1000, 500, "fast-model");
        assert!((cost - 0.002).abs() < 1e-9);
    }

    #[test]
    fn test_cost_of_unknown_model_uses_default_rate() {
        let tracker = tracker(1.0, 10.0);
        let cost = tracker.cost_of(1000, 1000, "mystery-model");
        let expected = ModelRate::default().input_per_1k + ModelRate::default().output_per_1k;
        assert!((cost - expected).abs() < 1e-9);
    }

    #[test]
    fn test_reserve_fails_before_any_mutation() {
        let tracker = tracker(0.05, 10.0);
        tracker.record(0.049).unwrap();

        let err = tracker.try_reserve(0.02).unwrap_err();
        assert_eq!(err.window, "daily");
        assert!((err.limit - 0.05).abs() < 1e-9);

        // Nothing was charged by the failed reservation.
        let snap = tracker.snapshot();
        assert!((snap.daily_cost - 0.049).abs() < 1e-9);
        assert_eq!(snap.calls, 1);
    }

    #[test]
    fn test_record_rejects_overflowing_charge() {
        let tracker = tracker(0.10, 10.0);
        tracker.record(0.08).unwrap();
        assert!(tracker.record(0.05).is_err());

        // State unchanged by the rejected mutation.
        let snap = tracker.snapshot();
        assert!((snap.daily_cost - 0.08).abs() < 1e-9);
        assert!((snap.total_cost - 0.08).abs() < 1e-9);
    }

    #[test]
    fn test_monthly_window_checked_independently() {
        let tracker = tracker(100.0, 0.10);
        tracker.record(0.08).unwrap();
        let err = tracker.record(0.05).unwrap_err();
        assert_eq!(err.window, "monthly");
    }

    #[test]
    fn test_window_rolls_reset_daily_cost() {
        let tracker = tracker(0.10, 100.0);
        tracker.record(0.09).unwrap();

        // Force the daily window into the past; the next operation rolls it.
        tracker.force_windows(Utc::now() - Duration::seconds(1), next_month_start(Utc::now()));
        tracker.record(0.09).unwrap();

        let snap = tracker.snapshot();
        assert!((snap.daily_cost - 0.09).abs() < 1e-9);
        // Total is cumulative across windows.
        assert!((snap.total_cost - 0.18).abs() < 1e-9);
    }

    #[test]
    fn test_limits_hold_after_every_successful_mutation() {
        let tracker = tracker(0.10, 1.0);
        for _ in 0..50 {
            let _ = tracker.record(0.03);
            let snap = tracker.snapshot();
            assert!(snap.daily_cost <= snap.daily_limit + 1e-9);
            assert!(snap.monthly_cost <= snap.monthly_limit + 1e-9);
        }
    }
}
