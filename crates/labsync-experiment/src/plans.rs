//! Sweep plans.
//!
//! A [`SweepPlan`] is the immutable, ordered list of frequencies a sweep
//! visits. Points are spaced logarithmically:
//!
//! ```text
//! f_i = f_start · (f_stop / f_start)^(i / (N - 1)),  i = 0 .. N-1
//! ```
//!
//! The first and last points are exactly `f_start` and `f_stop`.

use labsync_core::error::LabError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reasons a plan cannot be built.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlanError {
    /// Fewer than two points
    #[error("a sweep needs at least 2 points, got {0}")]
    TooFewPoints(usize),

    /// Bounds not strictly positive and increasing
    #[error("sweep bounds must satisfy 0 < start < stop, got start={start} stop={stop}")]
    InvalidRange {
        /// Requested start frequency
        start: f64,
        /// Requested stop frequency
        stop: f64,
    },
}

impl From<PlanError> for LabError {
    fn from(err: PlanError) -> Self {
        LabError::Config(err.to_string())
    }
}

/// Parameters of a logarithmic sweep.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SweepRequest {
    /// First frequency in Hz
    pub start_hz: f64,
    /// Last frequency in Hz
    pub stop_hz: f64,
    /// Number of points, endpoints included
    pub points: usize,
}

/// Ordered, log-spaced frequencies of one sweep.
#[derive(Debug, Clone, PartialEq)]
pub struct SweepPlan {
    frequencies: Vec<f64>,
}

impl SweepPlan {
    /// Build a logarithmic plan from `start_hz` to `stop_hz` with `points`
    /// points.
    pub fn logarithmic(start_hz: f64, stop_hz: f64, points: usize) -> Result<Self, PlanError> {
        if points < 2 {
            return Err(PlanError::TooFewPoints(points));
        }
        let valid = start_hz.is_finite() && stop_hz.is_finite() && start_hz > 0.0 && start_hz < stop_hz;
        if !valid {
            return Err(PlanError::InvalidRange {
                start: start_hz,
                stop: stop_hz,
            });
        }

        let ratio = stop_hz / start_hz;
        let last = points - 1;
        let frequencies = (0..points)
            .map(|i| match i {
                0 => start_hz,
                i if i == last => stop_hz,
                i => start_hz * ratio.powf(i as f64 / last as f64),
            })
            .collect();
        Ok(Self { frequencies })
    }

    /// Build the plan described by `request`.
    pub fn from_request(request: &SweepRequest) -> Result<Self, PlanError> {
        Self::logarithmic(request.start_hz, request.stop_hz, request.points)
    }

    /// Frequencies in visiting order.
    pub fn frequencies(&self) -> &[f64] {
        &self.frequencies
    }

    /// Number of points.
    pub fn len(&self) -> usize {
        self.frequencies.len()
    }

    /// Always false for a built plan.
    pub fn is_empty(&self) -> bool {
        self.frequencies.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        ((a - b) / b).abs() < 1e-12
    }

    #[test]
    fn decades_are_evenly_spaced() {
        let plan = SweepPlan::logarithmic(1.0e3, 1.0e6, 4).unwrap();
        let expected = [1.0e3, 1.0e4, 1.0e5, 1.0e6];

        assert_eq!(plan.len(), 4);
        for (got, want) in plan.frequencies().iter().zip(expected) {
            assert!(close(*got, want), "{} != {}", got, want);
        }
    }

    #[test]
    fn endpoints_are_exact_and_points_increase() {
        for points in [2, 3, 7, 101, 1000] {
            let plan = SweepPlan::logarithmic(13.7, 2.9e7, points).unwrap();
            let f = plan.frequencies();
            assert_eq!(f[0], 13.7);
            assert_eq!(f[points - 1], 2.9e7);
            assert!(f.windows(2).all(|w| w[0] < w[1]), "not increasing for N={}", points);
        }
    }

    #[test]
    fn degenerate_requests_are_rejected() {
        assert_eq!(SweepPlan::logarithmic(1.0, 10.0, 1), Err(PlanError::TooFewPoints(1)));
        assert!(SweepPlan::logarithmic(0.0, 10.0, 5).is_err());
        assert!(SweepPlan::logarithmic(10.0, 10.0, 5).is_err());
        assert!(SweepPlan::logarithmic(100.0, 10.0, 5).is_err());
        assert!(SweepPlan::logarithmic(1.0, f64::INFINITY, 5).is_err());
    }
}
