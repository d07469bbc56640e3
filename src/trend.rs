//! ==============================================================================
//! trend.rs - barometric pressure trend analyzer
//! ==============================================================================
//!
//! purpose:
//!     keeps a bounded, time-ordered history of pressure samples and classifies
//!     the recent trend (rising / falling / steady) with a least-squares fit.
//!
//! relationships:
//!     - used by: hub.rs (feeds every reading that carries a pressure field)
//!     - used by: snapshot.rs (TrendResult is embedded in every snapshot)
//!
//! units:
//!     x is elapsed hours since the window cutoff, y is whatever unit the
//!     upstream reports (inHg for `baromrelin`), so the slope is unit/hour.
//!
//! ==============================================================================

use std::collections::VecDeque;

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

/// Longest trend window accepted from configuration (ten years).
pub const MAX_WINDOW_HOURS: f64 = 87_600.0;

/// Analyzer policy knobs. Defaults match the dashboard's historical behaviour.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct TrendConfig {
    /// trailing window considered for the fit
    pub window_hours: f64,
    /// fewer samples than this inside the window => INSUFFICIENT_DATA
    pub min_samples: usize,
    /// hard cap on retained samples, oldest evicted first
    pub capacity: usize,
    /// |slope| strictly below this is STEADY
    pub steady_threshold: f64,
}

impl Default for TrendConfig {
    fn default() -> Self {
        Self {
            window_hours: 3.0,
            min_samples: 6,
            capacity: 500,
            steady_threshold: 0.02,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TrendClassification {
    InsufficientData,
    Steady,
    Rising,
    Falling,
}

/// Result of one trend evaluation. Never cached, always recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendResult {
    #[serde(rename = "trend")]
    pub classification: TrendClassification,
    #[serde(rename = "changeRate")]
    pub change_rate: f64,
}

impl TrendResult {
    pub const INSUFFICIENT: Self = Self {
        classification: TrendClassification::InsufficientData,
        change_rate: 0.0,
    };

    pub const FLAT: Self = Self {
        classification: TrendClassification::Steady,
        change_rate: 0.0,
    };
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub pressure: f64,
}

pub struct PressureTrendAnalyzer {
    config: TrendConfig,
    history: VecDeque<Reading>,
}

impl PressureTrendAnalyzer {
    pub fn new(config: TrendConfig) -> Self {
        Self {
            history: VecDeque::with_capacity(config.capacity.min(1024)),
            config,
        }
    }

    /// Record a sample stamped with the current wall clock.
    pub fn add_reading(&mut self, pressure: f64) {
        self.add_reading_at(pressure, Utc::now());
    }

    /// Record a sample at an explicit instant. Evicts at most one entry per call.
    pub fn add_reading_at(&mut self, pressure: f64, timestamp: DateTime<Utc>) {
        self.history.push_back(Reading { timestamp, pressure });
        if self.history.len() > self.config.capacity {
            self.history.pop_front();
        }
    }

    pub fn get_trend(&mut self) -> TrendResult {
        self.trend_at(Utc::now())
    }

    /// Prune everything older than `now - window` then fit pressure against
    /// elapsed hours since that cutoff. A window reaching past the calendar's
    /// range prunes nothing.
    pub fn trend_at(&mut self, now: DateTime<Utc>) -> TrendResult {
        let cutoff = window_delta(self.config.window_hours).and_then(|w| now.checked_sub_signed(w));
        if let Some(cutoff) = cutoff {
            self.history.retain(|r| r.timestamp >= cutoff);
        }

        if self.history.len() < self.config.min_samples {
            return TrendResult::INSUFFICIENT;
        }

        // the slope does not depend on where x starts
        let origin = cutoff.unwrap_or(now);
        let points = self.history.iter().map(|r| (hours_between(origin, r.timestamp), r.pressure));
        match least_squares_slope(points) {
            Some(slope) => TrendResult {
                classification: classify(slope, self.config.steady_threshold),
                change_rate: slope,
            },
            None => TrendResult::FLAT,
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    /// Retained samples, oldest first.
    pub fn readings(&self) -> impl Iterator<Item = &Reading> {
        self.history.iter()
    }
}

impl Default for PressureTrendAnalyzer {
    fn default() -> Self {
        Self::new(TrendConfig::default())
    }
}

/// Strict `<` against the threshold: a slope of exactly the threshold is not steady.
pub fn classify(slope: f64, steady_threshold: f64) -> TrendClassification {
    if slope.abs() < steady_threshold {
        TrendClassification::Steady
    } else if slope > 0.0 {
        TrendClassification::Rising
    } else {
        TrendClassification::Falling
    }
}

/// slope = (n·Σxy − Σx·Σy) / (n·Σx² − (Σx)²)
///
/// Returns `None` when the fit is undefined (no points, or every x identical).
pub fn least_squares_slope(points: impl IntoIterator<Item = (f64, f64)>) -> Option<f64> {
    let points: Vec<(f64, f64)> = points.into_iter().collect();
    let (first_x, _) = *points.first()?;
    // rounding in the sums can leave a tiny non-zero denominator here
    if points.iter().all(|&(x, _)| x == first_x) {
        return None;
    }

    let (mut n, mut sum_x, mut sum_y, mut sum_xy, mut sum_xx) = (0.0, 0.0, 0.0, 0.0, 0.0);
    for (x, y) in points {
        n += 1.0;
        sum_x += x;
        sum_y += y;
        sum_xy += x * y;
        sum_xx += x * x;
    }

    let denominator = n * sum_xx - sum_x * sum_x;
    if denominator == 0.0 || !denominator.is_finite() {
        return None;
    }

    let slope = (n * sum_xy - sum_x * sum_y) / denominator;
    slope.is_finite().then_some(slope)
}

fn window_delta(hours: f64) -> Option<TimeDelta> {
    let millis = (hours * 3_600_000.0).round();
    if !millis.is_finite() || millis.abs() >= i64::MAX as f64 {
        return None;
    }
    TimeDelta::try_milliseconds(millis as i64)
}

fn hours_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    (to - from).num_microseconds().unwrap_or(i64::MAX) as f64 / 3_600_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t0() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn minutes(m: i64) -> TimeDelta {
        TimeDelta::minutes(m)
    }

    #[test]
    fn linear_series_yields_exact_slope() {
        let mut analyzer = PressureTrendAnalyzer::default();
        // 0.05 inHg per hour, one sample every 15 minutes for 2 hours
        for i in 0..9 {
            let at = t0() + minutes(15 * i);
            analyzer.add_reading_at(29.90 + 0.05 * (i as f64 / 4.0), at);
        }

        let trend = analyzer.trend_at(t0() + minutes(120));
        assert_eq!(trend.classification, TrendClassification::Rising);
        assert!((trend.change_rate - 0.05).abs() < 1e-9, "got {}", trend.change_rate);
    }

    #[test]
    fn falling_series_is_falling() {
        let mut analyzer = PressureTrendAnalyzer::default();
        for i in 0..6 {
            analyzer.add_reading_at(30.10 - 0.1 * i as f64, t0() + minutes(60 * i / 3));
        }

        let trend = analyzer.trend_at(t0() + minutes(100));
        assert_eq!(trend.classification, TrendClassification::Falling);
        assert!((trend.change_rate + 0.3).abs() < 1e-9);
    }

    #[test]
    fn threshold_is_strict() {
        assert_eq!(classify(0.02, 0.02), TrendClassification::Rising);
        assert_eq!(classify(-0.02, 0.02), TrendClassification::Falling);
        assert_eq!(classify(0.019999, 0.02), TrendClassification::Steady);
        assert_eq!(classify(-0.019999, 0.02), TrendClassification::Steady);
        assert_eq!(classify(0.0, 0.02), TrendClassification::Steady);
    }

    #[test]
    fn too_few_samples_is_insufficient_regardless_of_shape() {
        let mut analyzer = PressureTrendAnalyzer::default();
        for (i, p) in [29.0, 31.0, 28.0, 33.0, 27.5].into_iter().enumerate() {
            analyzer.add_reading_at(p, t0() + minutes(i as i64));
        }

        assert_eq!(analyzer.trend_at(t0() + minutes(10)), TrendResult::INSUFFICIENT);
    }

    #[test]
    fn stale_samples_are_purged_on_query() {
        let mut analyzer = PressureTrendAnalyzer::default();
        for i in 0..10 {
            analyzer.add_reading_at(30.0, t0() + minutes(10 * i));
        }
        assert_eq!(analyzer.len(), 10);

        // window is 3h: at t0+4h only samples at >= t0+1h survive (t0+60..t0+90)
        let trend = analyzer.trend_at(t0() + minutes(240));
        assert_eq!(analyzer.len(), 4);
        assert_eq!(trend, TrendResult::INSUFFICIENT);
        assert!(analyzer.readings().all(|r| r.timestamp >= t0() + minutes(60)));
    }

    #[test]
    fn wall_clock_trend_prunes_old_readings() {
        let mut analyzer = PressureTrendAnalyzer::default();
        let long_ago = Utc::now() - TimeDelta::hours(4);
        for i in 0..6 {
            analyzer.add_reading_at(29.8 + 0.1 * i as f64, long_ago + minutes(i));
        }
        analyzer.add_reading(30.0);

        assert_eq!(analyzer.get_trend(), TrendResult::INSUFFICIENT);
        assert_eq!(analyzer.len(), 1);
    }

    #[test]
    fn huge_window_keeps_everything_without_overflow() {
        let mut analyzer = PressureTrendAnalyzer::new(TrendConfig {
            window_hours: 1.0e10,
            min_samples: 2,
            ..TrendConfig::default()
        });
        analyzer.add_reading_at(30.0, t0());
        analyzer.add_reading_at(30.5, t0() + minutes(60));

        let trend = analyzer.trend_at(t0() + minutes(90));
        assert_eq!(analyzer.len(), 2);
        assert_eq!(trend.classification, TrendClassification::Rising);
        assert!((trend.change_rate - 0.5).abs() < 1e-9);

        analyzer.add_reading(30.5);
        assert_eq!(analyzer.get_trend().classification, TrendClassification::Steady);
    }

    #[test]
    fn capacity_evicts_oldest_first() {
        let mut analyzer = PressureTrendAnalyzer::default();
        for i in 0..501 {
            analyzer.add_reading_at(i as f64, t0() + TimeDelta::seconds(i));
        }

        assert_eq!(analyzer.len(), 500);
        let kept: Vec<f64> = analyzer.readings().map(|r| r.pressure).collect();
        let expected: Vec<f64> = (1..501).map(|i| i as f64).collect();
        assert_eq!(kept, expected);
    }

    #[test]
    fn capacity_holds_for_small_caps() {
        let mut analyzer = PressureTrendAnalyzer::new(TrendConfig {
            capacity: 3,
            ..TrendConfig::default()
        });
        for i in 0..50 {
            analyzer.add_reading_at(i as f64, t0() + TimeDelta::seconds(i));
            assert!(analyzer.len() <= 3);
        }
        let kept: Vec<f64> = analyzer.readings().map(|r| r.pressure).collect();
        assert_eq!(kept, vec![47.0, 48.0, 49.0]);
    }

    #[test]
    fn identical_timestamps_fall_back_to_steady() {
        let mut analyzer = PressureTrendAnalyzer::default();
        for p in [29.0, 29.5, 30.0, 30.5, 31.0, 31.5] {
            analyzer.add_reading_at(p, t0());
        }

        assert_eq!(analyzer.trend_at(t0() + minutes(5)), TrendResult::FLAT);
    }

    #[test]
    fn overridden_policy_is_honoured() {
        let mut analyzer = PressureTrendAnalyzer::new(TrendConfig {
            window_hours: 1.0,
            min_samples: 2,
            capacity: 10,
            steady_threshold: 0.5,
        });
        analyzer.add_reading_at(30.0, t0());
        analyzer.add_reading_at(30.2, t0() + minutes(30));

        let trend = analyzer.trend_at(t0() + minutes(45));
        assert_eq!(trend.classification, TrendClassification::Steady);
        assert!((trend.change_rate - 0.4).abs() < 1e-9);
    }

    #[test]
    fn serializes_with_dashboard_field_names() {
        let json = serde_json::to_value(TrendResult::INSUFFICIENT).unwrap();
        assert_eq!(json, serde_json::json!({"trend": "INSUFFICIENT_DATA", "changeRate": 0.0}));
    }
}
