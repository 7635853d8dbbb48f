use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Profiles never ask the supervisor to wake up more often than this.
const MIN_WAIT_SECS: f64 = 1.0;

#[derive(Clone, Copy, Debug, PartialEq)]
struct Point {
    time: f64,
    value: f64,
}

/// A piecewise-linear function from elapsed seconds to a value.
///
/// Profiles drive the concurrency and the request rate of a
/// [`MultiLoop`](super::MultiLoop):
///
/// ```text
/// [[0, 0], [10, 100], [20, 0]]   ramp from 0 to 100 over 10s and back to 0
/// ```
///
/// Before the first point the profile holds the first value, after the last point it
/// holds the last value. Between two points the value is linearly interpolated and
/// floored. A value may be `f64::INFINITY` (written as `null` on the wire) to mean
/// "unlimited"; interpolation towards or away from an unlimited value keeps the
/// left-hand value until the next breakpoint is reached.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<(f64, Option<f64>)>", into = "Vec<(f64, Option<f64>)>")]
pub struct Profile {
    points: Vec<Point>,
}

impl Profile {
    /// Build a profile from `(time offset in seconds, value)` pairs.
    ///
    /// Points are sorted by time. Empty profiles, negative or NaN offsets, negative or
    /// NaN values and repeated offsets are rejected.
    pub fn new(points: impl IntoIterator<Item = (f64, f64)>) -> Result<Self> {
        let mut points: Vec<Point> = points
            .into_iter()
            .map(|(time, value)| Point { time, value })
            .collect();

        if points.is_empty() {
            return Err(Error::InvalidProfile("profile has no points".into()));
        }
        for p in &points {
            if p.time.is_nan() || p.time < 0.0 || !p.time.is_finite() {
                return Err(Error::InvalidProfile(format!(
                    "invalid time offset {}",
                    p.time
                )));
            }
            if p.value.is_nan() || p.value < 0.0 {
                return Err(Error::InvalidProfile(format!("invalid value {}", p.value)));
            }
        }

        points.sort_by(|a, b| a.time.total_cmp(&b.time));
        if let Some(pair) = points.windows(2).find(|w| w[0].time == w[1].time) {
            return Err(Error::InvalidProfile(format!(
                "more than one value at time {}",
                pair[0].time
            )));
        }

        Ok(Self { points })
    }

    /// A profile that holds `value` forever.
    pub fn flat(value: f64) -> Self {
        Self {
            points: vec![Point { time: 0.0, value }],
        }
    }

    /// Number of breakpoints.
    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Whether no breakpoint holds an unlimited value.
    pub fn is_finite(&self) -> bool {
        self.points.iter().all(|p| p.value.is_finite())
    }

    /// The profile's value `secs` seconds after the start.
    pub fn value_at(&self, secs: f64) -> f64 {
        let first = self.points[0];
        if secs <= first.time {
            return first.value;
        }

        for pair in self.points.windows(2) {
            let (left, right) = (pair[0], pair[1]);
            if secs == right.time {
                return right.value;
            }
            if secs < right.time {
                if !left.value.is_finite() || !right.value.is_finite() {
                    return left.value;
                }
                let slope = (right.value - left.value) / (right.time - left.time);
                return (left.value + (secs - left.time) * slope).floor();
            }
        }

        self.points[self.points.len() - 1].value
    }

    /// How long after `secs` the profile value is next due to change, rounded up to
    /// whole seconds and never less than one second. `None` once the last breakpoint
    /// has passed and the value can no longer change.
    pub fn time_to_next_change(&self, secs: f64) -> Option<Duration> {
        let mut previous = self.points[0];
        for &point in &self.points {
            if point.time > secs {
                let dt = point.time - secs;
                let delta = (point.value - previous.value).abs();
                let per_unit = if delta == 0.0 {
                    f64::INFINITY
                } else if delta.is_finite() {
                    dt / delta
                } else {
                    0.0
                };
                let wait = dt.min(per_unit).max(MIN_WAIT_SECS).ceil();
                return Some(Duration::from_secs_f64(wait));
            }
            previous = point;
        }
        None
    }
}

impl TryFrom<Vec<(f64, Option<f64>)>> for Profile {
    type Error = Error;

    fn try_from(value: Vec<(f64, Option<f64>)>) -> Result<Self> {
        Profile::new(
            value
                .into_iter()
                .map(|(t, v)| (t, v.unwrap_or(f64::INFINITY))),
        )
    }
}

impl From<Profile> for Vec<(f64, Option<f64>)> {
    fn from(profile: Profile) -> Self {
        profile
            .points
            .into_iter()
            .map(|p| (p.time, p.value.is_finite().then_some(p.value)))
            .collect()
    }
}
